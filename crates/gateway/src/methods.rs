use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use {
    serde::{Deserialize, de::DeserializeOwned},
    serde_json::Value,
    tracing::{debug, info, warn},
};

use {
    clawgate_channels::SendError,
    clawgate_config::schema::SendAction,
    clawgate_protocol::{ErrorShape, NODE_REQUEST_TIMEOUT_MS, ResponseFrame, roles},
    clawgate_routing::{evaluate_for_session, resolve_agent_id},
    clawgate_sessions::{LoadOptions, SessionEntry, UpdateOptions, now_ms},
};

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    nodes,
    state::GatewayState,
};

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: Value,
    pub client_conn_id: String,
    pub client_role: String,
    pub client_scopes: Vec<String>,
    pub state: Arc<GatewayState>,
}

/// The result a method handler produces.
pub type MethodResult = Result<Value, ErrorShape>;

/// A boxed async method handler.
pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

/// Decode request params into a typed struct. Missing params decode as `{}`;
/// unknown or mistyped fields are `INVALID_REQUEST`.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, ErrorShape> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|e| ErrorShape::invalid_request(format!("invalid params: {e}")))
}

pub(crate) fn internal(err: impl std::fmt::Display) -> ErrorShape {
    ErrorShape::internal(err.to_string())
}

// ── Scope authorization ──────────────────────────────────────────────────────

/// Methods only bridge nodes may call.
const NODE_METHODS: &[&str] = &["node.event"];

const READ_METHODS: &[&str] = &[
    "health",
    "status",
    "models.list",
    "voicewake.get",
    "sessions.list",
    "node.list",
    "node.describe",
    "chat.history",
];

const WRITE_METHODS: &[&str] = &[
    "send",
    "agent",
    "chat.send",
    "chat.abort",
    "chat.inject",
    "voicewake.set",
    "node.invoke",
    "sessions.patch",
    "sessions.delete",
];

fn is_in(method: &str, list: &[&str]) -> bool {
    list.contains(&method)
}

/// Check role + scopes for a method. Returns None if authorized, Some(error) if not.
pub fn authorize_method(method: &str, role: &str, scopes: &[String]) -> Option<ErrorShape> {
    use clawgate_protocol::scopes as s;

    if is_in(method, NODE_METHODS) {
        if role == roles::NODE {
            return None;
        }
        return Some(ErrorShape::forbidden(format!("unauthorized role: {role}")));
    }
    if role != roles::OPERATOR {
        return Some(ErrorShape::forbidden(format!("unauthorized role: {role}")));
    }

    let has = |scope: &str| scopes.iter().any(|s| s == scope);
    if has(s::ADMIN) {
        return None;
    }

    if is_in(method, READ_METHODS) {
        if has(s::READ) || has(s::WRITE) {
            return None;
        }
        return Some(ErrorShape::forbidden("missing scope: operator.read"));
    }
    if is_in(method, WRITE_METHODS) {
        if has(s::WRITE) {
            return None;
        }
        return Some(ErrorShape::forbidden("missing scope: operator.write"));
    }

    Some(ErrorShape::forbidden("missing scope: operator.admin"))
}

// ── Method registry ──────────────────────────────────────────────────────────

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register_defaults();
        reg
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    pub async fn dispatch(&self, ctx: MethodContext) -> ResponseFrame {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();
        let conn_id = ctx.client_conn_id.clone();

        let Some(handler) = self.handlers.get(&method) else {
            warn!(method, conn_id = %conn_id, "unknown method");
            return ResponseFrame::err(
                &request_id,
                ErrorShape::invalid_request(format!("unknown method: {method}")),
            );
        };

        if let Some(err) = authorize_method(&method, &ctx.client_role, &ctx.client_scopes) {
            warn!(method, conn_id = %conn_id, code = %err.code, "method auth denied");
            return ResponseFrame::err(&request_id, err);
        }

        debug!(method, request_id = %request_id, conn_id = %conn_id, "dispatching method");
        match handler(ctx).await {
            Ok(payload) => {
                debug!(method, request_id = %request_id, "method ok");
                ResponseFrame::ok(&request_id, payload)
            },
            Err(err) => {
                warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                ResponseFrame::err(&request_id, err)
            },
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn register_defaults(&mut self) {
        self.register_gateway_methods();
        self.register_node_methods();
        self.register_session_methods();
        self.register_send_method();
        crate::chat::register_chat_methods(self);
        crate::voicewake::register_voicewake_methods(self);
    }

    // ── Gateway-internal methods ─────────────────────────────────────────

    fn register_gateway_methods(&mut self) {
        // health
        self.register(
            "health",
            Box::new(|ctx| {
                Box::pin(async move {
                    let _: EmptyParams = parse_params(ctx.params)?;
                    let count = ctx.state.client_count().await;
                    Ok(serde_json::json!({
                        "status": "ok",
                        "version": ctx.state.version,
                        "connections": count,
                    }))
                })
            }),
        );

        // status
        self.register(
            "status",
            Box::new(|ctx| {
                Box::pin(async move {
                    let _: EmptyParams = parse_params(ctx.params)?;
                    let connections = ctx.state.client_count().await;
                    let nodes = ctx.state.nodes.read().await.count();
                    let active_runs = ctx.state.active_runs.read().await.len();
                    let config = ctx.state.config().await;
                    Ok(serde_json::json!({
                        "version": ctx.state.version,
                        "hostname": ctx.state.hostname,
                        "protocol": clawgate_protocol::PROTOCOL_VERSION,
                        "connections": connections,
                        "nodes": nodes,
                        "activeRuns": active_runs,
                        "defaultAgent": config.default_agent_id(),
                        "reloadMode": config.gateway.reload.mode,
                    }))
                })
            }),
        );
    }

    // ── Node methods ─────────────────────────────────────────────────────

    fn register_node_methods(&mut self) {
        // node.list
        self.register(
            "node.list",
            Box::new(|ctx| {
                Box::pin(async move {
                    let _: EmptyParams = parse_params(ctx.params)?;
                    let nodes = ctx.state.nodes.read().await;
                    let list: Vec<_> = nodes
                        .list()
                        .iter()
                        .map(|n| {
                            serde_json::json!({
                                "nodeId": n.node_id,
                                "displayName": n.display_name,
                                "platform": n.platform,
                                "version": n.version,
                                "remoteIp": n.remote_ip,
                            })
                        })
                        .collect();
                    Ok(serde_json::json!({ "nodes": list }))
                })
            }),
        );

        // node.describe
        self.register(
            "node.describe",
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: NodeIdParams = parse_params(ctx.params)?;
                    let nodes = ctx.state.nodes.read().await;
                    let node = nodes
                        .get(&params.node_id)
                        .ok_or_else(|| ErrorShape::not_found("node not found"))?;
                    Ok(serde_json::json!({
                        "nodeId": node.node_id,
                        "connId": node.conn_id,
                        "displayName": node.display_name,
                        "platform": node.platform,
                        "version": node.version,
                        "scopes": node.scopes,
                        "remoteIp": node.remote_ip,
                        "connectedSecs": node.connected_at.elapsed().as_secs(),
                    }))
                })
            }),
        );

        // node.invoke: forward an RPC request to a connected node
        self.register(
            "node.invoke",
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: NodeInvokeParams = parse_params(ctx.params)?;
                    if params.command.trim().is_empty() {
                        return Err(ErrorShape::invalid_request("command must not be empty"));
                    }
                    let timeout =
                        Duration::from_millis(params.timeout_ms.unwrap_or(NODE_REQUEST_TIMEOUT_MS));
                    let args = params.args.unwrap_or_else(|| serde_json::json!({}));
                    let result =
                        nodes::request(&ctx.state, &params.node_id, &params.command, args, timeout)
                            .await?;
                    Ok(serde_json::json!({
                        "ok": true,
                        "nodeId": params.node_id,
                        "command": params.command,
                        "payload": result,
                    }))
                })
            }),
        );

        // node.event: node → operators
        self.register(
            "node.event",
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: NodeEventParams = parse_params(ctx.params)?;
                    let node_id = ctx
                        .state
                        .nodes
                        .read()
                        .await
                        .node_id_for_conn(&ctx.client_conn_id)
                        .map(str::to_string)
                        .ok_or_else(|| ErrorShape::unauthorized("node not registered"))?;
                    let delivered = broadcast(
                        &ctx.state,
                        "node.event",
                        serde_json::json!({
                            "nodeId": node_id,
                            "event": params.event,
                            "payload": params.payload,
                        }),
                        BroadcastOpts::default(),
                    )
                    .await;
                    Ok(serde_json::json!({ "ok": true, "delivered": delivered }))
                })
            }),
        );
    }

    // ── Session methods ──────────────────────────────────────────────────

    fn register_session_methods(&mut self) {
        // sessions.list
        self.register(
            "sessions.list",
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: SessionsListParams = parse_params(ctx.params)?;
                    let config = ctx.state.config().await;
                    let agent_id = params
                        .agent_id
                        .unwrap_or_else(|| config.default_agent_id().to_string());
                    let path = ctx.state.store_path(&agent_id).await;
                    let store = ctx
                        .state
                        .sessions
                        .load(&path, LoadOptions::default())
                        .await
                        .map_err(internal)?;

                    let mut entries: Vec<(String, SessionEntry)> = store.into_iter().collect();
                    entries.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
                    let total = entries.len();
                    let sessions: Vec<Value> = entries
                        .into_iter()
                        .take(params.limit.unwrap_or(usize::MAX))
                        .map(|(key, entry)| {
                            let mut value = serde_json::to_value(entry).unwrap_or_default();
                            if let Some(obj) = value.as_object_mut() {
                                obj.insert("key".into(), Value::String(key));
                            }
                            value
                        })
                        .collect();
                    Ok(serde_json::json!({
                        "agentId": agent_id,
                        "path": path,
                        "count": total,
                        "sessions": sessions,
                    }))
                })
            }),
        );

        // sessions.patch
        self.register(
            "sessions.patch",
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: SessionsPatchParams = parse_params(ctx.params)?;
                    let config = ctx.state.config().await;
                    let agent_id =
                        resolve_agent_id(&params.key, config.default_agent_id()).to_string();
                    let path = ctx.state.store_path(&agent_id).await;
                    let key = params.key.clone();

                    let outcome = ctx
                        .state
                        .sessions
                        .update(
                            &path,
                            UpdateOptions {
                                maintenance: config.session.maintenance.clone(),
                                active_key: Some(key.clone()),
                            },
                            move |store| {
                                let entry = store.get_mut(&key)?;
                                params.apply(entry);
                                Some(entry.clone())
                            },
                        )
                        .await
                        .map_err(internal)?;

                    let entry = outcome
                        .value
                        .ok_or_else(|| ErrorShape::not_found("session not found"))?;
                    info!(agent_id = %agent_id, "session patched");
                    Ok(serde_json::json!({ "ok": true, "entry": entry }))
                })
            }),
        );

        // sessions.delete
        self.register(
            "sessions.delete",
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: SessionKeyParams = parse_params(ctx.params)?;
                    let config = ctx.state.config().await;
                    let agent_id = resolve_agent_id(&params.key, config.default_agent_id());
                    let path = ctx.state.store_path(agent_id).await;
                    let key = params.key.clone();

                    let outcome = ctx
                        .state
                        .sessions
                        .update(
                            &path,
                            UpdateOptions {
                                maintenance: config.session.maintenance.clone(),
                                active_key: None,
                            },
                            move |store| store.remove(&key).is_some(),
                        )
                        .await
                        .map_err(internal)?;
                    Ok(serde_json::json!({ "ok": true, "deleted": outcome.value }))
                })
            }),
        );
    }

    // ── External delivery ────────────────────────────────────────────────

    fn register_send_method(&mut self) {
        self.register(
            "send",
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: SendParams = parse_params(ctx.params)?;
                    if params.message.trim().is_empty() {
                        return Err(ErrorShape::invalid_request("message must not be empty"));
                    }
                    let config = ctx.state.config().await;

                    // Without a session key the target itself is the key.
                    let session_key = params
                        .session_key
                        .clone()
                        .unwrap_or_else(|| format!("{}:direct:{}", params.channel, params.to));
                    let agent_id = resolve_agent_id(&session_key, config.default_agent_id());
                    let path = ctx.state.store_path(agent_id).await;
                    let store = ctx
                        .state
                        .sessions
                        .load(&path, LoadOptions::default())
                        .await
                        .map_err(internal)?;
                    let entry = store.get(&session_key);

                    let action = evaluate_for_session(
                        config.session.send_policy.as_ref(),
                        entry,
                        &session_key,
                    );
                    if action == SendAction::Deny {
                        return Err(ErrorShape::send_blocked(format!(
                            "send blocked by policy for {session_key}"
                        )));
                    }

                    let message_id = ctx
                        .state
                        .services
                        .channels
                        .send_text(
                            &params.channel,
                            params.account_id.as_deref(),
                            &params.to,
                            &params.message,
                        )
                        .await
                        .map_err(|e| match e {
                            SendError::NoOutbound(_) => ErrorShape::not_found(e.to_string()),
                            SendError::Delivery { .. } => {
                                warn!(channel = %params.channel, error = %e, "send failed");
                                ErrorShape::internal(e.to_string())
                            },
                        })?;

                    if entry.is_some() {
                        let channel = params.channel.clone();
                        let to = params.to.clone();
                        let account_id = params.account_id.clone();
                        let key = session_key.clone();
                        ctx.state
                            .sessions
                            .update(
                                &path,
                                UpdateOptions {
                                    maintenance: config.session.maintenance.clone(),
                                    active_key: Some(session_key.clone()),
                                },
                                move |store| {
                                    if let Some(entry) = store.get_mut(&key) {
                                        entry.updated_at = now_ms();
                                        entry.last_channel = Some(channel);
                                        entry.last_to = Some(to);
                                        if account_id.is_some() {
                                            entry.last_account_id = account_id;
                                        }
                                    }
                                },
                            )
                            .await
                            .map_err(internal)?;
                    }

                    info!(channel = %params.channel, session_key = %session_key, "message delivered");
                    Ok(serde_json::json!({
                        "ok": true,
                        "channel": params.channel,
                        "messageId": message_id,
                    }))
                })
            }),
        );
    }
}

// ── Params ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EmptyParams {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct NodeIdParams {
    node_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct NodeInvokeParams {
    node_id: String,
    command: String,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeEventParams {
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct SessionsListParams {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SessionKeyParams {
    key: String,
}

/// `sendPolicy: "inherit"` clears a per-session override.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SendPolicyPatch {
    Allow,
    Deny,
    Inherit,
}

/// Empty strings clear `label` / `thinkingLevel`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct SessionsPatchParams {
    key: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    thinking_level: Option<String>,
    #[serde(default)]
    send_policy: Option<SendPolicyPatch>,
}

impl SessionsPatchParams {
    fn apply(&self, entry: &mut SessionEntry) {
        if let Some(label) = &self.label {
            entry.label = non_empty(label);
        }
        if let Some(level) = &self.thinking_level {
            entry.thinking_level = non_empty(level);
        }
        if let Some(policy) = self.send_policy {
            entry.send_policy = match policy {
                SendPolicyPatch::Allow => Some(SendAction::Allow),
                SendPolicyPatch::Deny => Some(SendAction::Deny),
                SendPolicyPatch::Inherit => None,
            };
        }
        entry.updated_at = now_ms();
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct SendParams {
    channel: String,
    to: String,
    message: String,
    #[serde(default)]
    session_key: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
}
