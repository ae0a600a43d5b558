//! Agent runs and chat history: `chat.send`, `agent`, `chat.abort`,
//! `chat.history`, `chat.inject` and `models.list`.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    serde::Deserialize,
    serde_json::{Value, json},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    clawgate_agents::{AgentRunResult, OnEvent, RunRequest, RunnerEvent, model::normalize_catalog},
    clawgate_config::schema::SendAction,
    clawgate_protocol::ErrorShape,
    clawgate_routing::{evaluate_for_session, parse_session_key, resolve_agent_id},
    clawgate_sessions::{
        LoadOptions, SessionEntry, UpdateOptions, now_ms, sessions_dir, transcript,
        transcript_path,
    },
    clawgate_tools::{PolicyContext, resolve_policy},
};

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    methods::{EmptyParams, MethodRegistry, internal, parse_params},
    state::{ActiveRun, DedupeHit, GatewayState},
};

pub const DEFAULT_HISTORY_LIMIT: usize = 200;
pub const MAX_HISTORY_LIMIT: usize = 1000;

// ── Params ───────────────────────────────────────────────────────────────────

/// Shared by `chat.send` and `agent`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ChatSendParams {
    session_key: String,
    message: String,
    #[serde(default)]
    images: Vec<Value>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    idempotency_key: Option<String>,
    /// Route the turn arrived on; recorded as the session's last route.
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ChatAbortParams {
    run_id: String,
    #[serde(default)]
    session_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ChatHistoryParams {
    session_key: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ChatInjectParams {
    session_key: String,
    message: String,
    #[serde(default)]
    label: Option<String>,
}

// ── Run lifecycle ────────────────────────────────────────────────────────────

/// Everything resolved before the runner is invoked.
struct PreparedRun {
    run_id: String,
    session_key: String,
    session_id: String,
    store_path: PathBuf,
    transcript: PathBuf,
    update_opts: UpdateOptions,
    request: RunRequest,
    cancel: CancellationToken,
    timeout: Duration,
    idempotency_key: Option<String>,
}

enum Start {
    New(Box<PreparedRun>),
    /// Duplicate idempotency key.
    Duplicate(DedupeHit),
}

#[derive(Debug)]
enum RunEnd {
    Done(AgentRunResult),
    Aborted,
    TimedOut,
    Failed(String),
}

/// What a run reports to callers: the `agent` response body, or the error
/// it fails with.
struct RunOutcome {
    summary: Value,
    error: Option<ErrorShape>,
}

/// Response for a repeated idempotency key.
fn duplicate_response(hit: DedupeHit) -> Value {
    hit.result
        .unwrap_or_else(|| json!({ "runId": hit.run_id, "status": "in_flight" }))
}

async fn prepare(state: &Arc<GatewayState>, params: ChatSendParams) -> Result<Start, ErrorShape> {
    if params.session_key.trim().is_empty() {
        return Err(ErrorShape::invalid_request("sessionKey must not be empty"));
    }
    if params.message.trim().is_empty() && params.images.is_empty() {
        return Err(ErrorShape::invalid_request("message must not be empty"));
    }
    if params.timeout_ms == Some(0) {
        return Err(ErrorShape::invalid_request("timeoutMs must be positive"));
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let idempotency_key = params.idempotency_key.clone();
    if let Some(key) = idempotency_key.as_deref()
        && let Some(hit) = state.dedupe.write().await.check_and_insert(key, &run_id)
    {
        info!(run_id = %hit.run_id, finished = hit.result.is_some(), "duplicate idempotency key");
        return Ok(Start::Duplicate(hit));
    }

    match resolve_run(state, params, run_id).await {
        Ok(run) => Ok(Start::New(Box::new(run))),
        Err(e) => {
            if let Some(key) = idempotency_key.as_deref() {
                state.dedupe.write().await.remove(key);
            }
            Err(e)
        },
    }
}

/// Send policy, tool policy and session upsert for a new run.
async fn resolve_run(
    state: &Arc<GatewayState>,
    params: ChatSendParams,
    run_id: String,
) -> Result<PreparedRun, ErrorShape> {
    let config = state.config().await;
    let session_key = params.session_key.trim().to_string();
    let agent_id = resolve_agent_id(&session_key, config.default_agent_id()).to_string();
    let store_path = state.store_path(&agent_id).await;

    let store = state
        .sessions
        .load(&store_path, LoadOptions::default())
        .await
        .map_err(internal)?;
    let existing = store.get(&session_key);

    // Evaluate against the entry as it will look after this turn's route.
    let mut candidate = existing.cloned().unwrap_or_default();
    if let Some(channel) = &params.channel {
        candidate.last_channel = Some(channel.clone());
    }
    let action = evaluate_for_session(
        config.session.send_policy.as_ref(),
        Some(&candidate),
        &session_key,
    );
    if action == SendAction::Deny {
        return Err(ErrorShape::send_blocked(format!(
            "send blocked by policy for {session_key}"
        )));
    }

    let parsed = parse_session_key(&session_key);
    let model = params
        .model
        .clone()
        .or_else(|| existing.and_then(|e| e.model.clone()))
        .or_else(|| config.agent_model(&agent_id).map(str::to_string));
    let group_id = params.group_id.clone().or_else(|| {
        matches!(parsed.chat_type.as_deref(), Some("group" | "channel"))
            .then(|| parsed.peer_id.map(str::to_string))
            .flatten()
    });
    let policy = resolve_policy(&config, &PolicyContext {
        agent_id: agent_id.clone(),
        provider: model
            .as_deref()
            .and_then(|m| m.split_once('/'))
            .map(|(p, _)| p.to_string()),
        channel: candidate
            .effective_channel()
            .map(str::to_string)
            .or(parsed.channel.clone()),
        account_id: params
            .account_id
            .clone()
            .or_else(|| existing.and_then(|e| e.last_account_id.clone())),
        group_id,
    });
    let allowed_tools = policy.allowed_tools(state.services.tools.names());
    debug!(run_id = %run_id, tools = allowed_tools.len(), "resolved tool allow-set");

    let update_opts = UpdateOptions {
        maintenance: config.session.maintenance.clone(),
        active_key: Some(session_key.clone()),
    };
    let key = session_key.clone();
    let chat_type = parsed.chat_type.clone();
    let (channel, to, account_id, thinking) = (
        params.channel.clone(),
        params.to.clone(),
        params.account_id.clone(),
        params.thinking.clone(),
    );
    let entry = state
        .sessions
        .update(&store_path, update_opts.clone(), move |store| {
            let now = now_ms();
            let entry = store.entry(key).or_insert_with(|| SessionEntry::new(now));
            entry.updated_at = now;
            if channel.is_some() {
                entry.last_channel = channel;
            }
            if to.is_some() {
                entry.last_to = to;
            }
            if account_id.is_some() {
                entry.last_account_id = account_id;
            }
            if entry.chat_type.is_none() {
                entry.chat_type = chat_type;
            }
            if thinking.is_some() {
                entry.thinking_level = thinking;
            }
            entry.clone()
        })
        .await
        .map_err(internal)?
        .value;

    let timeout = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.agent_timeout(&agent_id));
    let transcript = transcript_path(&sessions_dir(&config.state_dir(), &agent_id), &entry);

    let cancel = CancellationToken::new();
    state.active_runs.write().await.insert(run_id.clone(), ActiveRun {
        run_id: run_id.clone(),
        session_key: session_key.clone(),
        cancel: cancel.clone(),
    });

    info!(run_id = %run_id, agent_id = %agent_id, session_key = %session_key, "agent run prepared");
    Ok(PreparedRun {
        request: RunRequest {
            run_id: run_id.clone(),
            agent_id,
            session_id: entry.session_id.clone(),
            session_key: session_key.clone(),
            message: params.message,
            images: params.images,
            allowed_tools,
            thinking_level: entry.thinking_level.clone(),
            model,
            timeout,
        },
        run_id,
        session_key,
        session_id: entry.session_id,
        store_path,
        transcript,
        update_opts,
        cancel,
        timeout,
        idempotency_key: params.idempotency_key,
    })
}

fn text_message(role: &str, text: &str) -> Value {
    json!({
        "role": role,
        "content": [{"type": "text", "text": text}],
        "timestamp": now_ms(),
    })
}

fn event_payload(run_id: &str, session_key: &str, event: &RunnerEvent) -> Value {
    let mut payload = match event {
        RunnerEvent::Thinking => json!({ "state": "thinking" }),
        RunnerEvent::ThinkingDone => json!({ "state": "thinking_done" }),
        RunnerEvent::ToolCallStart { id, name } => json!({
            "state": "tool_call_start",
            "toolCallId": id,
            "toolName": name,
        }),
        RunnerEvent::ToolCallEnd { id, name, success } => json!({
            "state": "tool_call_end",
            "toolCallId": id,
            "toolName": name,
            "success": success,
        }),
        RunnerEvent::TextDelta(text) => json!({ "state": "delta", "text": text }),
    };
    payload["runId"] = json!(run_id);
    payload["sessionKey"] = json!(session_key);
    payload
}

/// Drive one prepared run to completion and emit its terminal `chat` event.
///
/// Cancellation (abort or timeout) stops the runner, but the metadata save
/// that follows is always awaited to completion. A run aborted while that
/// save is in flight still reports `aborted: true`.
async fn execute(state: Arc<GatewayState>, run: PreparedRun) -> RunOutcome {
    let PreparedRun {
        run_id,
        session_key,
        session_id,
        store_path,
        transcript,
        update_opts,
        request,
        cancel,
        timeout,
        idempotency_key,
    } = run;

    if let Err(e) = transcript::append_message(
        &transcript,
        &session_id,
        &text_message("user", &request.message),
    )
    .await
    {
        warn!(run_id = %run_id, error = %e, "failed to record user turn");
    }

    // Runner events are forwarded in order by a single task.
    let (tx, mut rx) = mpsc::unbounded_channel::<RunnerEvent>();
    let forwarder = {
        let state = Arc::clone(&state);
        let run_id = run_id.clone();
        let session_key = session_key.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let payload = event_payload(&run_id, &session_key, &event);
                broadcast(&state, "chat", payload, BroadcastOpts::default()).await;
            }
        })
    };
    let on_event: OnEvent = Box::new(move |event| {
        let _ = tx.send(event);
    });

    let started = Instant::now();
    let runner = Arc::clone(&state.services.runner);
    let end = tokio::select! {
        res = tokio::time::timeout(timeout, runner.run(request, cancel.clone(), on_event)) => match res {
            Ok(Ok(result)) => RunEnd::Done(result),
            Ok(Err(_)) if cancel.is_cancelled() => RunEnd::Aborted,
            Ok(Err(e)) => RunEnd::Failed(e.to_string()),
            Err(_) => {
                cancel.cancel();
                RunEnd::TimedOut
            },
        },
        () = cancel.cancelled() => RunEnd::Aborted,
    };
    let _ = forwarder.await;

    let (model, thinking) = match &end {
        RunEnd::Done(result) => (result.model.clone(), result.thinking_level.clone()),
        _ => (None, None),
    };
    let key = session_key.clone();
    let saved = state
        .sessions
        .update(&store_path, update_opts, move |store| {
            if let Some(entry) = store.get_mut(&key) {
                entry.updated_at = now_ms();
                if model.is_some() {
                    entry.model = model;
                }
                if thinking.is_some() {
                    entry.thinking_level = thinking;
                }
            }
        })
        .await;
    if let Err(e) = saved {
        warn!(run_id = %run_id, error = %e, "failed to persist session metadata");
    }

    if let RunEnd::Done(result) = &end
        && !result.text.is_empty()
    {
        let mut reply = text_message("assistant", &result.text);
        if let Some(model) = &result.model {
            reply["model"] = json!(model);
        }
        if let Err(e) = transcript::append_message(&transcript, &session_id, &reply).await {
            warn!(run_id = %run_id, error = %e, "failed to record assistant turn");
        }
    }

    state.active_runs.write().await.remove(&run_id);
    let aborted = cancel.is_cancelled() || matches!(end, RunEnd::Aborted | RunEnd::TimedOut);

    let payload = match &end {
        RunEnd::Failed(message) => {
            warn!(run_id = %run_id, error = %message, "agent run failed");
            json!({
                "runId": run_id,
                "sessionKey": session_key,
                "state": "error",
                "message": message,
            })
        },
        _ => {
            let text = match &end {
                RunEnd::Done(result) => Some(result.text.as_str()),
                _ => None,
            };
            info!(
                run_id = %run_id,
                aborted,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "agent run complete"
            );
            json!({
                "runId": run_id,
                "sessionKey": session_key,
                "state": "final",
                "text": text,
                "aborted": aborted,
                "timedOut": matches!(end, RunEnd::TimedOut),
            })
        },
    };

    let outcome = match end {
        RunEnd::Done(result) => RunOutcome {
            summary: json!({
                "runId": run_id,
                "status": if aborted { "aborted" } else { "ok" },
                "text": result.text,
                "model": result.model,
                "aborted": aborted,
            }),
            error: None,
        },
        RunEnd::Aborted => RunOutcome {
            summary: json!({
                "runId": run_id,
                "status": "aborted",
                "text": Value::Null,
                "aborted": true,
            }),
            error: None,
        },
        RunEnd::TimedOut => {
            let error = ErrorShape::timeout(format!(
                "agent run {run_id} timed out after {}ms",
                timeout.as_millis()
            ));
            RunOutcome {
                summary: json!({ "runId": run_id, "status": "timeout", "error": error }),
                error: Some(error),
            }
        },
        RunEnd::Failed(message) => {
            let error = ErrorShape::internal(message);
            RunOutcome {
                summary: json!({ "runId": run_id, "status": "error", "error": error }),
                error: Some(error),
            }
        },
    };
    if let Some(key) = idempotency_key.as_deref() {
        state
            .dedupe
            .write()
            .await
            .complete(key, &run_id, outcome.summary.clone());
    }

    broadcast(&state, "chat", payload, BroadcastOpts::default()).await;
    outcome
}

// ── Registration ─────────────────────────────────────────────────────────────

pub(crate) fn register_chat_methods(reg: &mut MethodRegistry) {
    // chat.send: start a run and return immediately
    reg.register(
        "chat.send",
        Box::new(|ctx| {
            Box::pin(async move {
                let params: ChatSendParams = parse_params(ctx.params)?;
                match prepare(&ctx.state, params).await? {
                    Start::Duplicate(hit) => Ok(duplicate_response(hit)),
                    Start::New(run) => {
                        let run_id = run.run_id.clone();
                        let state = Arc::clone(&ctx.state);
                        tokio::spawn(async move {
                            execute(state, *run).await;
                        });
                        Ok(json!({ "runId": run_id, "status": "started" }))
                    },
                }
            })
        }),
    );

    // agent: run and wait for the result
    reg.register(
        "agent",
        Box::new(|ctx| {
            Box::pin(async move {
                let params: ChatSendParams = parse_params(ctx.params)?;
                let run = match prepare(&ctx.state, params).await? {
                    Start::Duplicate(hit) => return Ok(duplicate_response(hit)),
                    Start::New(run) => run,
                };
                let outcome = execute(Arc::clone(&ctx.state), *run).await;
                match outcome.error {
                    Some(error) => Err(error),
                    None => Ok(outcome.summary),
                }
            })
        }),
    );

    // chat.abort
    reg.register(
        "chat.abort",
        Box::new(|ctx| {
            Box::pin(async move {
                let params: ChatAbortParams = parse_params(ctx.params)?;
                let runs = ctx.state.active_runs.read().await;
                let aborted = match runs.get(&params.run_id) {
                    Some(run)
                        if params
                            .session_key
                            .as_deref()
                            .is_none_or(|k| k == run.session_key) =>
                    {
                        run.cancel.cancel();
                        true
                    },
                    _ => false,
                };
                drop(runs);
                info!(run_id = %params.run_id, aborted, "chat.abort");
                Ok(json!({ "ok": true, "aborted": aborted }))
            })
        }),
    );

    // chat.history
    reg.register(
        "chat.history",
        Box::new(|ctx| {
            Box::pin(async move {
                let params: ChatHistoryParams = parse_params(ctx.params)?;
                let session_key = params.session_key.trim();
                if session_key.is_empty() {
                    return Err(ErrorShape::invalid_request("sessionKey must not be empty"));
                }
                if params.limit == Some(0) {
                    return Err(ErrorShape::invalid_request("limit must be positive"));
                }
                let limit = params
                    .limit
                    .unwrap_or(DEFAULT_HISTORY_LIMIT)
                    .min(MAX_HISTORY_LIMIT);
                let config = ctx.state.config().await;
                let agent_id = resolve_agent_id(session_key, config.default_agent_id());
                let path = ctx.state.store_path(agent_id).await;
                let store = ctx
                    .state
                    .sessions
                    .load(&path, LoadOptions::default())
                    .await
                    .map_err(internal)?;

                let entry = store.get(session_key);
                let messages = match entry {
                    Some(entry) => {
                        let file =
                            transcript_path(&sessions_dir(&config.state_dir(), agent_id), entry);
                        transcript::read_recent_messages(&file, limit)
                            .await
                            .map_err(internal)?
                    },
                    None => Vec::new(),
                };
                Ok(json!({
                    "sessionKey": session_key,
                    "sessionId": entry.map(|e| e.session_id.as_str()),
                    "messages": messages,
                    "thinkingLevel": entry.and_then(|e| e.thinking_level.as_deref()),
                }))
            })
        }),
    );

    // chat.inject: append an assistant message without running the agent
    reg.register(
        "chat.inject",
        Box::new(|ctx| {
            Box::pin(async move {
                let params: ChatInjectParams = parse_params(ctx.params)?;
                let session_key = params.session_key.trim();
                if session_key.is_empty() {
                    return Err(ErrorShape::invalid_request("sessionKey must not be empty"));
                }
                if params.message.trim().is_empty() {
                    return Err(ErrorShape::invalid_request("message must not be empty"));
                }
                let config = ctx.state.config().await;
                let agent_id = resolve_agent_id(session_key, config.default_agent_id());
                let path = ctx.state.store_path(agent_id).await;
                let store = ctx
                    .state
                    .sessions
                    .load(&path, LoadOptions::default())
                    .await
                    .map_err(internal)?;
                let entry = store
                    .get(session_key)
                    .ok_or_else(|| ErrorShape::not_found("session not found"))?;

                let text = match params.label.as_deref().map(str::trim) {
                    Some(label) if !label.is_empty() => format!("[{label}]\n\n{}", params.message),
                    _ => params.message.clone(),
                };
                let message_id = uuid::Uuid::new_v4().to_string();
                let mut message = text_message("assistant", &text);
                message["id"] = json!(message_id);
                message["stopReason"] = json!("injected");

                let file = transcript_path(&sessions_dir(&config.state_dir(), agent_id), entry);
                transcript::append_message(&file, &entry.session_id, &message)
                    .await
                    .map_err(internal)?;

                broadcast(
                    &ctx.state,
                    "chat",
                    json!({
                        "sessionKey": session_key,
                        "state": "injected",
                        "message": message,
                    }),
                    BroadcastOpts::default(),
                )
                .await;
                Ok(json!({ "ok": true, "messageId": message_id }))
            })
        }),
    );

    // models.list
    reg.register(
        "models.list",
        Box::new(|ctx| {
            Box::pin(async move {
                let _: EmptyParams = parse_params(ctx.params)?;
                let models = ctx
                    .state
                    .services
                    .models
                    .list_models()
                    .await
                    .map_err(internal)?;
                Ok(json!({ "models": normalize_catalog(models) }))
            })
        }),
    );
}
