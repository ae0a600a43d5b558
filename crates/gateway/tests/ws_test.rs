//! End-to-end tests over a real WebSocket connection.
#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde_json::json,
    tokio::sync::Notify,
    tokio_util::sync::CancellationToken,
};

use {
    clawgate_agents::{AgentRunResult, AgentRunner, OnEvent, RunRequest, RunnerEvent},
    clawgate_channels::{ChannelOutbound, ChannelPlugin, ChannelRegistry},
    clawgate_config::{
        GatewayConfig,
        schema::{ChannelConfig, SendAction, SendPolicyConfig},
    },
    clawgate_gateway::GatewayServices,
    clawgate_sessions::{
        LoadOptions, SessionEntry, UpdateOptions, now_ms, sessions_dir, transcript,
        transcript_path,
    },
};

use common::{WsClient, start, start_with};

/// Runs until cancelled.
struct BlockingRunner;

#[async_trait]
impl AgentRunner for BlockingRunner {
    async fn run(
        &self,
        _request: RunRequest,
        cancel: CancellationToken,
        on_event: OnEvent,
    ) -> anyhow::Result<AgentRunResult> {
        on_event(RunnerEvent::Thinking);
        cancel.cancelled().await;
        anyhow::bail!("cancelled")
    }
}

/// Waits for `go`, streams one delta, then finishes with a model.
struct GatedRunner {
    go: Arc<Notify>,
}

#[async_trait]
impl AgentRunner for GatedRunner {
    async fn run(
        &self,
        _request: RunRequest,
        _cancel: CancellationToken,
        on_event: OnEvent,
    ) -> anyhow::Result<AgentRunResult> {
        self.go.notified().await;
        on_event(RunnerEvent::TextDelta("done".into()));
        Ok(AgentRunResult {
            text: "done".into(),
            model: Some("test/m1".into()),
            ..Default::default()
        })
    }
}

// ── Handshake & auth ─────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_returns_hello_ok() {
    let gw = start().await;
    let mut client = WsClient::connect(&gw.ws_url()).await;
    let res = client.handshake(json!({})).await;

    assert_eq!(res["ok"], true);
    let hello = &res["payload"];
    assert_eq!(hello["type"], "hello-ok");
    assert_eq!(hello["protocol"], clawgate_protocol::PROTOCOL_VERSION);
    assert!(!hello["server"]["connId"].as_str().unwrap().is_empty());
    let methods: Vec<&str> = hello["methods"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m.as_str())
        .collect();
    assert!(methods.contains(&"chat.send"));
    assert!(methods.contains(&"voicewake.set"));
    assert_eq!(gw.state.client_count().await, 1);
}

#[tokio::test]
async fn request_before_connect_is_unauthorized() {
    let gw = start().await;
    let mut client = WsClient::connect(&gw.ws_url()).await;
    assert_eq!(client.call_err("health", json!({})).await, "UNAUTHORIZED");

    // The socket stays usable.
    let res = client.handshake(json!({})).await;
    assert_eq!(res["ok"], true);
    assert_eq!(client.call("health", json!({})).await["status"], "ok");
}

#[tokio::test]
async fn protocol_mismatch_is_rejected() {
    let gw = start().await;
    let mut client = WsClient::connect(&gw.ws_url()).await;
    let res = client
        .handshake(json!({"minProtocol": 99, "maxProtocol": 100}))
        .await;
    assert_eq!(res["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn token_auth_failure_keeps_socket_open() {
    let mut config = GatewayConfig::default();
    config.gateway.auth.token = Some("s3cret".into());
    let gw = start_with(config, GatewayServices::noop()).await;

    let mut client = WsClient::connect(&gw.ws_url()).await;
    let res = client.handshake(json!({"auth": {"token": "wrong"}})).await;
    assert_eq!(res["error"]["code"], "UNAUTHORIZED");
    let res = client.handshake(json!({})).await;
    assert_eq!(res["error"]["code"], "UNAUTHORIZED");

    let res = client.handshake(json!({"auth": {"token": "s3cret"}})).await;
    assert_eq!(res["ok"], true);

    let again = client.handshake(json!({"auth": {"token": "s3cret"}})).await;
    assert_eq!(again["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn read_scope_cannot_write() {
    let gw = start().await;
    let mut client = WsClient::connect(&gw.ws_url()).await;
    client.handshake(json!({"scopes": ["operator.read"]})).await;

    assert_eq!(client.call("health", json!({})).await["status"], "ok");
    assert_eq!(
        client
            .call_err("chat.send", json!({"sessionKey": "main", "message": "hi"}))
            .await,
        "FORBIDDEN"
    );
}

#[tokio::test]
async fn unknown_params_and_methods_are_invalid() {
    let gw = start().await;
    let mut client = gw.operator().await;
    assert_eq!(
        client.call_err("sessions.list", json!({"bogus": 1})).await,
        "INVALID_REQUEST"
    );
    assert_eq!(
        client.call_err("models.list", json!({"x": true})).await,
        "INVALID_REQUEST"
    );
    assert_eq!(
        client.call_err("no.such.method", json!({})).await,
        "INVALID_REQUEST"
    );

    client.send_raw("{not json").await;
    let res = client.wait_for(|f| f["type"] == "res").await;
    assert_eq!(res["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn unknown_params_on_write_methods_leave_storage_untouched() {
    let gw = start().await;
    let mut client = gw.operator().await;
    client
        .call("agent", json!({"sessionKey": "main", "message": "hi"}))
        .await;

    let store_path = gw.state.store_path("main").await;
    let entry = gw
        .state
        .sessions
        .load(&store_path, LoadOptions { skip_cache: true })
        .await
        .unwrap()
        .get("main")
        .cloned()
        .unwrap();
    let config = gw.state.config().await;
    let transcript_file = transcript_path(&sessions_dir(&config.state_dir(), "main"), &entry);
    let store_before = std::fs::read(&store_path).unwrap();
    let transcript_before = std::fs::read(&transcript_file).unwrap();

    let calls = [
        ("chat.send", json!({"sessionKey": "main", "message": "x", "bogus": 1})),
        ("agent", json!({"sessionKey": "main", "message": "x", "bogus": 1})),
        ("chat.inject", json!({"sessionKey": "main", "message": "x", "bogus": 1})),
        ("sessions.patch", json!({"key": "main", "label": "renamed", "bogus": 1})),
        ("sessions.delete", json!({"key": "main", "bogus": 1})),
        ("send", json!({"channel": "slack", "to": "u1", "message": "x", "bogus": 1})),
    ];
    for (method, params) in calls {
        assert_eq!(
            client.call_err(method, params).await,
            "INVALID_REQUEST",
            "{method}"
        );
    }

    assert!(gw.state.active_runs.read().await.is_empty());
    assert_eq!(std::fs::read(&store_path).unwrap(), store_before);
    assert_eq!(std::fs::read(&transcript_file).unwrap(), transcript_before);
}

// ── Chat ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_send_streams_and_persists() {
    let gw = start().await;
    let mut client = gw.operator().await;

    let started = client
        .call("chat.send", json!({"sessionKey": "main", "message": "hello"}))
        .await;
    assert_eq!(started["status"], "started");
    let run_id = started["runId"].as_str().unwrap().to_string();

    let delta = client
        .event("chat", |p| p["state"] == "delta" && p["runId"] == run_id.as_str())
        .await;
    assert_eq!(delta["payload"]["text"], "hello");
    let done = client
        .event("chat", |p| p["state"] == "final" && p["runId"] == run_id.as_str())
        .await;
    assert_eq!(done["payload"]["aborted"], false);
    assert_eq!(done["payload"]["text"], "hello");
    assert!(done["seq"].as_u64().unwrap() > delta["seq"].as_u64().unwrap());

    let history = client
        .call("chat.history", json!({"sessionKey": "main"}))
        .await;
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert!(history["sessionId"].is_string());

    let listed = client.call("sessions.list", json!({})).await;
    assert_eq!(listed["count"], 1);
}

#[tokio::test]
async fn agent_waits_for_result() {
    let gw = start().await;
    let mut client = gw.operator().await;
    let res = client
        .call(
            "agent",
            json!({"sessionKey": "agent:main:slack:dm:u1", "message": "ping", "channel": "slack"}),
        )
        .await;
    assert_eq!(res["status"], "ok");
    assert_eq!(res["text"], "ping");
    assert_eq!(res["aborted"], false);
}

#[tokio::test]
async fn duplicate_idempotency_key_returns_original_run() {
    let services = GatewayServices::noop().with_runner(Arc::new(BlockingRunner));
    let gw = start_with(GatewayConfig::default(), services).await;
    let mut client = gw.operator().await;
    let params = json!({"sessionKey": "main", "message": "hi", "idempotencyKey": "k1"});

    let first = client.call("chat.send", params.clone()).await;
    let run_id = first["runId"].as_str().unwrap().to_string();
    let second = client.call("chat.send", params.clone()).await;
    assert_eq!(second["status"], "in_flight");
    assert_eq!(second["runId"], run_id.as_str());

    client.call("chat.abort", json!({"runId": run_id})).await;
    client
        .event("chat", |p| p["state"] == "final" && p["runId"] == run_id.as_str())
        .await;

    // Once finished, a repeat reports how the run ended.
    let third = client.call("chat.send", params).await;
    assert_eq!(third["status"], "aborted");
    assert_eq!(third["runId"], run_id.as_str());
}

#[tokio::test]
async fn repeated_agent_call_returns_finished_result() {
    let gw = start().await;
    let mut client = gw.operator().await;
    let params = json!({"sessionKey": "main", "message": "once", "idempotencyKey": "k2"});

    let first = client.call("agent", params.clone()).await;
    assert_eq!(first["status"], "ok");
    let again = client.call("agent", params).await;
    assert_eq!(again["status"], "ok");
    assert_eq!(again["runId"], first["runId"]);
    assert_eq!(again["text"], "once");

    let history = client
        .call("chat.history", json!({"sessionKey": "main"}))
        .await;
    assert_eq!(history["messages"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn chat_abort_cancels_run() {
    let services = GatewayServices::noop().with_runner(Arc::new(BlockingRunner));
    let gw = start_with(GatewayConfig::default(), services).await;
    let mut client = gw.operator().await;

    let started = client
        .call("chat.send", json!({"sessionKey": "main", "message": "long"}))
        .await;
    let run_id = started["runId"].as_str().unwrap().to_string();
    client
        .event("chat", |p| p["state"] == "thinking" && p["runId"] == run_id.as_str())
        .await;

    let wrong = client
        .call("chat.abort", json!({"runId": run_id, "sessionKey": "other"}))
        .await;
    assert_eq!(wrong["aborted"], false);

    let res = client.call("chat.abort", json!({"runId": run_id})).await;
    assert_eq!(res["aborted"], true);

    let done = client
        .event("chat", |p| p["state"] == "final" && p["runId"] == run_id.as_str())
        .await;
    assert_eq!(done["payload"]["aborted"], true);
    assert!(gw.state.active_runs.read().await.is_empty());
}

#[tokio::test]
async fn abort_during_metadata_save_reports_aborted_and_saves() {
    let go = Arc::new(Notify::new());
    let services = GatewayServices::noop().with_runner(Arc::new(GatedRunner { go: go.clone() }));
    let gw = start_with(GatewayConfig::default(), services).await;
    let mut client = gw.operator().await;

    let started = client
        .call("chat.send", json!({"sessionKey": "main", "message": "go"}))
        .await;
    let run_id = started["runId"].as_str().unwrap().to_string();

    // Hold the store lock so the post-run save has to wait for it.
    let store_path = gw.state.store_path("main").await;
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let holder = {
        let state = Arc::clone(&gw.state);
        let path = store_path.clone();
        tokio::spawn(async move {
            state
                .sessions
                .update(&path, UpdateOptions::default(), move |_| {
                    let _ = entered_tx.send(());
                    let _ = release_rx.recv();
                })
                .await
                .unwrap();
        })
    };
    entered_rx.await.unwrap();

    go.notify_one();
    client
        .event("chat", |p| p["state"] == "delta" && p["runId"] == run_id.as_str())
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(gw.state.active_runs.read().await.contains_key(&run_id));

    let res = client.call("chat.abort", json!({"runId": run_id})).await;
    assert_eq!(res["aborted"], true);

    release_tx.send(()).unwrap();
    holder.await.unwrap();
    let done = client
        .event("chat", |p| p["state"] == "final" && p["runId"] == run_id.as_str())
        .await;
    assert_eq!(done["payload"]["aborted"], true);
    assert_eq!(done["payload"]["text"], "done");
    assert!(gw.state.active_runs.read().await.is_empty());

    let store = gw
        .state
        .sessions
        .load(&store_path, LoadOptions { skip_cache: true })
        .await
        .unwrap();
    assert_eq!(store["main"].model.as_deref(), Some("test/m1"));
}

#[tokio::test]
async fn agent_timeout_reports_timeout() {
    let services = GatewayServices::noop().with_runner(Arc::new(BlockingRunner));
    let gw = start_with(GatewayConfig::default(), services).await;
    let mut client = gw.operator().await;
    let code = client
        .call_err(
            "agent",
            json!({"sessionKey": "main", "message": "slow", "timeoutMs": 50}),
        )
        .await;
    assert_eq!(code, "TIMEOUT");
}

#[tokio::test]
async fn send_policy_blocks_before_side_effects() {
    let mut config = GatewayConfig::default();
    config.session.send_policy = Some(SendPolicyConfig {
        default: SendAction::Deny,
        rules: Vec::new(),
    });
    let gw = start_with(config, GatewayServices::noop()).await;
    let mut client = gw.operator().await;

    let code = client
        .call_err("chat.send", json!({"sessionKey": "main", "message": "hi"}))
        .await;
    assert_eq!(code, "SEND_BLOCKED");
    let listed = client.call("sessions.list", json!({})).await;
    assert_eq!(listed["count"], 0);
}

#[tokio::test]
async fn chat_history_caps_and_limits() {
    let gw = start().await;
    let config = gw.state.config().await;
    let store_path = gw.state.store_path("main").await;
    let entry = gw
        .state
        .sessions
        .update(&store_path, UpdateOptions::default(), |store| {
            store
                .entry("main".to_string())
                .or_insert_with(|| SessionEntry::new(now_ms()))
                .clone()
        })
        .await
        .unwrap()
        .value;
    let file = transcript_path(&sessions_dir(&config.state_dir(), "main"), &entry);
    for i in 0..300 {
        transcript::append_message(
            &file,
            &entry.session_id,
            &json!({"role": "user", "content": format!("m{i}")}),
        )
        .await
        .unwrap();
    }

    let mut client = gw.operator().await;
    let all = client
        .call("chat.history", json!({"sessionKey": "main"}))
        .await;
    let messages = all["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 200);
    assert_eq!(messages[0]["content"], "m100");
    assert_eq!(messages[199]["content"], "m299");

    let few = client
        .call("chat.history", json!({"sessionKey": "main", "limit": 5}))
        .await;
    let messages = few["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[4]["content"], "m299");

    let empty = client
        .call("chat.history", json!({"sessionKey": "nobody"}))
        .await;
    assert!(empty["messages"].as_array().unwrap().is_empty());

    let padded = client
        .call("chat.history", json!({"sessionKey": "  main  ", "limit": 3}))
        .await;
    assert_eq!(padded["sessionKey"], "main");
    assert_eq!(padded["messages"].as_array().unwrap().len(), 3);

    assert_eq!(
        client
            .call_err("chat.history", json!({"sessionKey": "main", "limit": 0}))
            .await,
        "INVALID_REQUEST"
    );
    assert_eq!(
        client
            .call_err("chat.history", json!({"sessionKey": "   "}))
            .await,
        "INVALID_REQUEST"
    );
}

#[tokio::test]
async fn chat_inject_appends_without_running() {
    let gw = start().await;
    let mut client = gw.operator().await;
    assert_eq!(
        client
            .call_err("chat.inject", json!({"sessionKey": "main", "message": "note"}))
            .await,
        "NOT_FOUND"
    );

    client
        .call("agent", json!({"sessionKey": "main", "message": "hi"}))
        .await;
    let res = client
        .call(
            "chat.inject",
            json!({"sessionKey": "main", "message": "note", "label": "system"}),
        )
        .await;
    assert_eq!(res["ok"], true);
    client.event("chat", |p| p["state"] == "injected").await;

    let history = client
        .call("chat.history", json!({"sessionKey": "main"}))
        .await;
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[2]["stopReason"], "injected");
    assert_eq!(messages[2]["id"], res["messageId"]);

    let padded = client
        .call("chat.inject", json!({"sessionKey": " main ", "message": "again"}))
        .await;
    assert_eq!(padded["ok"], true);
    let injected = client
        .event("chat", |p| p["state"] == "injected" && p["message"]["id"] == padded["messageId"])
        .await;
    assert_eq!(injected["payload"]["sessionKey"], "main");
}

// ── Outbound send ────────────────────────────────────────────────────────────

struct RefusingOutbound;

#[async_trait]
impl ChannelOutbound for RefusingOutbound {
    async fn send_text(
        &self,
        _account_id: Option<&str>,
        _to: &str,
        _text: &str,
    ) -> anyhow::Result<Option<String>> {
        anyhow::bail!("connection refused")
    }
}

struct UnreachableSlack;

#[async_trait]
impl ChannelPlugin for UnreachableSlack {
    fn id(&self) -> &str {
        "slack"
    }

    fn name(&self) -> &str {
        "Slack"
    }

    async fn start(&self, _config: &ChannelConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn outbound(&self) -> Option<Arc<dyn ChannelOutbound>> {
        Some(Arc::new(RefusingOutbound))
    }
}

#[tokio::test]
async fn send_separates_unknown_channel_from_delivery_failure() {
    let channels = Arc::new(ChannelRegistry::new());
    channels.register(Arc::new(UnreachableSlack)).await;
    let services = GatewayServices::noop().with_channels(channels);
    let gw = start_with(GatewayConfig::default(), services).await;
    let mut client = gw.operator().await;

    assert_eq!(
        client
            .call_err("send", json!({"channel": "nope", "to": "u1", "message": "hi"}))
            .await,
        "NOT_FOUND"
    );
    assert_eq!(
        client
            .call_err("send", json!({"channel": "slack", "to": "u1", "message": "hi"}))
            .await,
        "INTERNAL"
    );
}

// ── Voice wake ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn voicewake_set_reaches_nodes_and_operators() {
    let gw = start().await;
    let mut operator = gw.operator().await;
    let mut node = gw.node("mac-1").await;

    // Pushed right after the node connects.
    let initial = node.event("voicewake.changed", |_| true).await;
    assert_eq!(
        initial["payload"]["triggers"],
        json!(["clawgate", "claude", "computer"])
    );

    let res = operator
        .call("voicewake.set", json!({"triggers": [" hey ", "hey", "", "computer"]}))
        .await;
    assert_eq!(res["triggers"], json!(["hey", "computer"]));

    let pushed = node.event("voicewake.changed", |_| true).await;
    assert_eq!(pushed["payload"]["triggers"], json!(["hey", "computer"]));
    operator.event("voicewake.changed", |_| true).await;

    let got = operator.call("voicewake.get", json!({})).await;
    assert_eq!(got["triggers"], json!(["hey", "computer"]));
}

// ── Nodes ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn node_invoke_round_trip() {
    let gw = start().await;
    let mut operator = gw.operator().await;
    let mut node = gw.node("mac-1").await;

    let listed = operator.call("node.list", json!({})).await;
    assert_eq!(listed["nodes"][0]["nodeId"], "mac-1");

    let invoke = tokio::spawn(async move {
        let res = operator
            .call(
                "node.invoke",
                json!({"nodeId": "mac-1", "command": "camera.snap", "args": {"q": 1}}),
            )
            .await;
        (operator, res)
    });

    let req = node
        .wait_for(|f| f["type"] == "req" && f["method"] == "camera.snap")
        .await;
    assert_eq!(req["params"]["q"], 1);
    node.send(json!({"type": "res", "id": req["id"], "ok": true, "payload": {"image": "b64"}}))
        .await;

    let (_operator, res) = invoke.await.unwrap();
    assert_eq!(res["nodeId"], "mac-1");
    assert_eq!(res["payload"]["image"], "b64");
    assert_eq!(gw.state.nodes.read().await.pending_count(), 0);
}

#[tokio::test]
async fn node_disconnect_rejects_pending() {
    let gw = start().await;
    let mut operator = gw.operator().await;
    let mut node = gw.node("mac-1").await;

    let invoke = tokio::spawn(async move {
        operator
            .call_err("node.invoke", json!({"nodeId": "mac-1", "command": "slow"}))
            .await
    });
    node.wait_for(|f| f["type"] == "req").await;
    node.close().await;

    assert_eq!(invoke.await.unwrap(), "NOT_FOUND");
}

#[tokio::test]
async fn node_role_is_limited_to_node_methods() {
    let gw = start().await;
    let mut operator = gw.operator().await;
    let mut node = gw.node("mac-1").await;

    assert_eq!(node.call_err("health", json!({})).await, "FORBIDDEN");
    node.call("node.event", json!({"event": "battery", "payload": {"level": 80}}))
        .await;
    let ev = operator.event("node.event", |_| true).await;
    assert_eq!(ev["payload"]["nodeId"], "mac-1");

    assert_eq!(
        operator
            .call_err("node.invoke", json!({"nodeId": "missing", "command": "x"}))
            .await,
        "NOT_FOUND"
    );
}
