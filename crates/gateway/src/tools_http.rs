//! `POST /tools/invoke`: run exactly one tool call over HTTP.

use std::sync::Arc;

use {
    axum::{
        body::Bytes,
        extract::State,
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Json, Response},
    },
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::{debug, info, warn},
};

use {
    clawgate_protocol::ErrorShape,
    clawgate_routing::{parse_session_key, resolve_agent_id},
    clawgate_sessions::LoadOptions,
    clawgate_tools::{PolicyContext, resolve_policy},
};

use crate::{
    auth::{authorize_connect, bearer_token},
    server::AppState,
    state::GatewayState,
};

pub const CHANNEL_HEADER: &str = "x-clawgate-message-channel";
pub const ACCOUNT_HEADER: &str = "x-clawgate-account-id";
pub const GROUP_HEADER: &str = "x-clawgate-group-id";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct InvokeBody {
    tool: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    session_key: Option<String>,
}

/// Routing hints carried in request headers. Used only for requests whose
/// session has no route of its own.
#[derive(Debug, Default)]
struct PolicyHints {
    channel: Option<String>,
    account_id: Option<String>,
    group_id: Option<String>,
}

impl PolicyHints {
    fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            channel: get(CHANNEL_HEADER),
            account_id: get(ACCOUNT_HEADER),
            group_id: get(GROUP_HEADER),
        }
    }
}

fn error_response(status: StatusCode, error: ErrorShape) -> Response {
    (status, Json(json!({ "ok": false, "error": error }))).into_response()
}

pub(crate) async fn tools_invoke_handler(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let state = app.gateway;

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let auth = authorize_connect(&state.auth, provided);
    if !auth.ok {
        let reason = auth.reason.unwrap_or_default();
        warn!(reason = %reason, "tools.invoke auth failed");
        return error_response(StatusCode::UNAUTHORIZED, ErrorShape::unauthorized(reason));
    }

    let body: InvokeBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorShape::invalid_request(format!("invalid body: {e}")),
            );
        },
    };
    if body.tool.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorShape::invalid_request("tool must not be empty"),
        );
    }

    match invoke(&state, body, PolicyHints::from_headers(&headers)).await {
        Ok(result) => (StatusCode::OK, Json(json!({ "ok": true, "result": result }))).into_response(),
        Err(err) => {
            let status = match err.code.as_str() {
                clawgate_protocol::error_codes::NOT_FOUND => StatusCode::NOT_FOUND,
                clawgate_protocol::error_codes::TOOL_ERROR
                | clawgate_protocol::error_codes::INVALID_REQUEST => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, err)
        },
    }
}

async fn invoke(
    state: &Arc<GatewayState>,
    body: InvokeBody,
    hints: PolicyHints,
) -> Result<Value, ErrorShape> {
    let config = state.config().await;
    let session_key = body
        .session_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty());
    let agent_id = match session_key {
        Some(key) => resolve_agent_id(key, config.default_agent_id()).to_string(),
        None => config.default_agent_id().to_string(),
    };

    // The stored entry supplies the model provider and route when hints are absent.
    let entry = match session_key {
        Some(key) => {
            let path = state.store_path(&agent_id).await;
            let store = state
                .sessions
                .load(&path, LoadOptions::default())
                .await
                .map_err(|e| ErrorShape::internal(e.to_string()))?;
            store.get(key).cloned()
        },
        None => None,
    };
    let parsed = session_key.map(parse_session_key);
    let model = entry
        .as_ref()
        .and_then(|e| e.model.clone())
        .or_else(|| config.agent_model(&agent_id).map(str::to_string));
    // A session that already has a route keeps it; hints only fill the gaps.
    let session_channel = entry
        .as_ref()
        .and_then(|e| e.effective_channel())
        .map(str::to_string)
        .or_else(|| parsed.as_ref().and_then(|p| p.channel.clone()));
    let session_group = parsed
        .as_ref()
        .filter(|p| matches!(p.chat_type.as_deref(), Some("group" | "channel")))
        .and_then(|p| p.peer_id.map(str::to_string));
    let session_account = entry.as_ref().and_then(|e| e.last_account_id.clone());
    if session_channel.is_some() && (hints.channel.is_some() || hints.group_id.is_some()) {
        debug!(session_key = ?session_key, "ignoring route hints for routed session");
    }
    let (channel, group_id, account_id) = match session_channel {
        Some(channel) => (Some(channel), session_group, session_account),
        None => (
            hints.channel,
            hints.group_id,
            session_account.or(hints.account_id),
        ),
    };

    let policy = resolve_policy(&config, &PolicyContext {
        agent_id: agent_id.clone(),
        provider: model
            .as_deref()
            .and_then(|m| m.split_once('/'))
            .map(|(p, _)| p.to_string()),
        channel,
        account_id: account_id.clone(),
        group_id,
    });

    let tool_name = body.tool.trim();
    let tool = state
        .services
        .tools
        .get(tool_name)
        .filter(|_| policy.is_allowed(tool_name))
        .ok_or_else(|| ErrorShape::not_found(format!("tool not available: {tool_name}")))?;

    debug!(
        tool = tool_name,
        agent_id = %agent_id,
        account_id = ?account_id,
        "tools.invoke"
    );
    let args = body.args.unwrap_or_else(|| json!({}));
    match tool.execute(body.action.as_deref(), args).await {
        Ok(result) => {
            info!(tool = tool_name, agent_id = %agent_id, "tool call ok");
            Ok(result)
        },
        Err(e) => {
            warn!(tool = tool_name, error = %e, "tool call failed");
            Err(ErrorShape::tool_error(e.to_string()))
        },
    }
}
