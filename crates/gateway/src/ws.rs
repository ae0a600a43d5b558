use std::{net::SocketAddr, sync::Arc, time::Instant};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, StreamExt},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use clawgate_protocol::{
    ConnectParams, ErrorShape, Frame, HelloOk, PROTOCOL_VERSION, RequestFrame, ResponseFrame,
    ServerInfo, roles,
};

use crate::{
    auth::authorize_connect,
    methods::{MethodContext, MethodRegistry},
    nodes::NodeSession,
    state::{ConnectedClient, GatewayState, effective_scopes},
    voicewake,
};

/// Identity of a connection once its handshake succeeded.
struct Session {
    role: String,
    scopes: Vec<String>,
    node_id: Option<String>,
}

/// Handle one WebSocket connection from upgrade to close.
///
/// The first accepted frame must be `connect`. Requests sent before that are
/// answered with `UNAUTHORIZED`; a failed handshake is reported the same way
/// and the client may retry on the same socket.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    remote_addr: SocketAddr,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    debug!(conn_id = %conn_id, remote = %remote_addr, "ws: new connection");

    // Writer task: everything sent to this client goes through `tx`.
    let write_conn = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                debug!(conn_id = %write_conn, "ws: write failed, closing writer");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut session: Option<Session> = None;
    loop {
        let msg = tokio::select! {
            () = state.shutdown.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(conn_id = %conn_id, error = %e, "ws: read error");
                break;
            },
        };

        let frame = match Frame::parse(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "ws: malformed frame");
                send_response(
                    &tx,
                    ResponseFrame::err(
                        &request_id_hint(&text),
                        ErrorShape::invalid_request(e.to_string()),
                    ),
                );
                continue;
            },
        };

        match frame {
            Frame::Connect(params) => {
                let id = params.id.clone().unwrap_or_else(|| "connect".into());
                if session.is_some() {
                    send_response(
                        &tx,
                        ResponseFrame::err(&id, ErrorShape::invalid_request("already connected")),
                    );
                    continue;
                }
                match handshake(&state, &methods, &conn_id, remote_addr, &tx, params).await {
                    Ok((established, hello)) => {
                        send_response(&tx, ResponseFrame::ok(&id, hello));
                        if let Some(node_id) = &established.node_id {
                            voicewake::push_to_node(&state, node_id).await;
                        }
                        session = Some(established);
                    },
                    Err(err) => send_response(&tx, ResponseFrame::err(&id, err)),
                }
            },
            Frame::Req(req) => {
                let Some(established) = &session else {
                    send_response(
                        &tx,
                        ResponseFrame::err(&req.id, ErrorShape::unauthorized("connect first")),
                    );
                    continue;
                };
                spawn_dispatch(&state, &methods, &conn_id, established, &tx, req);
            },
            Frame::Res(res) => {
                if session.as_ref().is_some_and(|s| s.role == roles::NODE) {
                    state.nodes.write().await.resolve_response(&conn_id, res);
                } else {
                    debug!(conn_id = %conn_id, id = %res.id, "ws: response from non-node dropped");
                }
            },
            Frame::Event(ev) => {
                debug!(conn_id = %conn_id, event = %ev.event, "ws: client event ignored");
            },
        }
    }

    if state.close_client(&conn_id).await.is_some() {
        info!(conn_id = %conn_id, "ws: client disconnected");
    }
    drop(tx);
    let _ = writer.await;
}

/// Validate the connect params, register the client and build `hello-ok`.
async fn handshake(
    state: &Arc<GatewayState>,
    methods: &MethodRegistry,
    conn_id: &str,
    remote_addr: SocketAddr,
    tx: &mpsc::UnboundedSender<String>,
    params: ConnectParams,
) -> Result<(Session, serde_json::Value), ErrorShape> {
    if !params.supports_protocol(PROTOCOL_VERSION) {
        return Err(ErrorShape::invalid_request(format!(
            "protocol mismatch: server speaks v{PROTOCOL_VERSION}"
        )));
    }
    let role = params.role().to_string();
    if role != roles::OPERATOR && role != roles::NODE {
        return Err(ErrorShape::invalid_request(format!("unknown role: {role}")));
    }

    let token = params.auth.as_ref().and_then(|a| a.token.as_deref());
    let auth = authorize_connect(&state.auth, token);
    if !auth.ok {
        let reason = auth.reason.unwrap_or_default();
        warn!(conn_id, reason = %reason, "ws: auth failed");
        return Err(ErrorShape::unauthorized(format!("authentication failed: {reason}")));
    }

    let scopes = effective_scopes(&params);
    let node_id = (role == roles::NODE).then(|| params.client.id.clone());
    if let Some(node_id) = &node_id {
        state.nodes.write().await.register(NodeSession {
            node_id: node_id.clone(),
            conn_id: conn_id.to_string(),
            display_name: params.client.display_name.clone(),
            platform: params.client.platform.clone(),
            version: params.client.version.clone(),
            scopes: scopes.clone(),
            remote_ip: Some(remote_addr.ip().to_string()),
            sender: tx.clone(),
            connected_at: Instant::now(),
        });
    }
    info!(
        conn_id,
        client_id = %params.client.id,
        role = %role,
        remote = %remote_addr,
        "ws: handshake complete"
    );
    state
        .register_client(ConnectedClient {
            conn_id: conn_id.to_string(),
            connect_params: params,
            sender: tx.clone(),
        })
        .await;

    let hello = HelloOk {
        kind: "hello-ok".into(),
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: state.version.clone(),
            host: state.hostname.clone(),
            conn_id: conn_id.to_string(),
        },
        methods: methods.method_names(),
    };
    let hello = serde_json::to_value(&hello).map_err(|e| ErrorShape::internal(e.to_string()))?;
    Ok((
        Session {
            role,
            scopes,
            node_id,
        },
        hello,
    ))
}

/// Run one request on its own task so a slow method does not block reads.
fn spawn_dispatch(
    state: &Arc<GatewayState>,
    methods: &Arc<MethodRegistry>,
    conn_id: &str,
    session: &Session,
    tx: &mpsc::UnboundedSender<String>,
    req: RequestFrame,
) {
    let ctx = MethodContext {
        request_id: req.id,
        method: req.method,
        params: req.params,
        client_conn_id: conn_id.to_string(),
        client_role: session.role.clone(),
        client_scopes: session.scopes.clone(),
        state: Arc::clone(state),
    };
    let methods = Arc::clone(methods);
    let tx = tx.clone();
    tokio::spawn(async move {
        let response = methods.dispatch(ctx).await;
        send_response(&tx, response);
    });
}

fn send_response(tx: &mpsc::UnboundedSender<String>, response: ResponseFrame) {
    match Frame::Res(response).to_text() {
        Ok(text) => {
            let _ = tx.send(text);
        },
        Err(e) => warn!(error = %e, "ws: failed to encode response"),
    }
}

/// Best-effort `id` from a frame that failed to parse.
fn request_id_hint(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
        .unwrap_or_default()
}
