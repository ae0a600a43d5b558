//! Bridge node registry and gateway → node request correlation.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    serde_json::Value,
    tokio::sync::{mpsc, oneshot},
    tracing::{debug, info, warn},
};

use clawgate_protocol::{ErrorShape, EventFrame, Frame, RequestFrame, ResponseFrame};

use crate::state::GatewayState;

/// A connected bridge node (mobile or desktop companion).
#[derive(Debug, Clone)]
pub struct NodeSession {
    pub node_id: String,
    pub conn_id: String,
    pub display_name: Option<String>,
    pub platform: String,
    pub version: String,
    pub scopes: Vec<String>,
    pub remote_ip: Option<String>,
    /// Write half of the node's socket.
    pub sender: mpsc::UnboundedSender<String>,
    pub connected_at: Instant,
}

impl NodeSession {
    fn send(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }
}

type PendingReply = oneshot::Sender<Result<Value, ErrorShape>>;

/// An outbound request waiting for the node's `res` frame.
struct PendingRequest {
    node_id: String,
    method: String,
    sender: PendingReply,
    created_at: Instant,
}

/// Registry of connected nodes and their in-flight requests.
#[derive(Default)]
pub struct NodeRegistry {
    /// node_id → NodeSession
    nodes: HashMap<String, NodeSession>,
    /// conn_id → node_id (reverse lookup for cleanup on disconnect)
    by_conn: HashMap<String, String>,
    /// request id → waiter
    pending: HashMap<String, PendingRequest>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. A node reconnecting under the same id replaces the
    /// older connection.
    pub fn register(&mut self, session: NodeSession) {
        if let Some(old) = self.nodes.get(&session.node_id)
            && old.conn_id != session.conn_id
        {
            warn!(node_id = %session.node_id, old_conn = %old.conn_id, "node reconnected, replacing stale connection");
            self.by_conn.remove(&old.conn_id);
        }
        self.by_conn
            .insert(session.conn_id.clone(), session.node_id.clone());
        self.nodes.insert(session.node_id.clone(), session);
    }

    /// Drop the node bound to `conn_id` and fail its pending requests.
    pub fn unregister_by_conn(&mut self, conn_id: &str) -> Option<NodeSession> {
        let node_id = self.by_conn.remove(conn_id)?;
        let session = self.nodes.remove(&node_id)?;

        let orphaned: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.node_id == node_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in orphaned {
            if let Some(p) = self.pending.remove(&id) {
                debug!(node_id = %node_id, request_id = %id, method = %p.method, "rejecting pending node request");
                let _ = p
                    .sender
                    .send(Err(ErrorShape::not_found("node disconnected")));
            }
        }
        Some(session)
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeSession> {
        self.nodes.get(node_id)
    }

    pub fn node_id_for_conn(&self, conn_id: &str) -> Option<&str> {
        self.by_conn.get(conn_id).map(String::as_str)
    }

    /// Connected nodes, sorted by id.
    pub fn list(&self) -> Vec<&NodeSession> {
        let mut nodes: Vec<&NodeSession> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queue an event for one node. Returns whether the frame was queued.
    pub fn send_event(&self, node_id: &str, event: &EventFrame) -> bool {
        let Some(node) = self.nodes.get(node_id) else {
            debug!(node_id, event = %event.event, "event for unknown node dropped");
            return false;
        };
        let Some(text) = encode(Frame::Event(event.clone())) else {
            return false;
        };
        let sent = node.send(&text);
        if !sent {
            warn!(node_id, event = %event.event, "node event send failed");
        }
        sent
    }

    /// Queue an event for every node. Per-node failures are logged and
    /// skipped. Returns how many nodes the frame was queued for.
    pub fn broadcast_event(&self, event: &EventFrame) -> usize {
        let Some(text) = encode(Frame::Event(event.clone())) else {
            return 0;
        };
        self.nodes
            .values()
            .filter(|node| {
                let sent = node.send(&text);
                if !sent {
                    warn!(node_id = %node.node_id, event = %event.event, "node broadcast failed");
                }
                sent
            })
            .count()
    }

    /// Send a `req` frame to a node and track the waiter under `id`.
    fn begin_request(
        &mut self,
        node_id: &str,
        id: &str,
        method: &str,
        params: Value,
        sender: PendingReply,
    ) -> Result<(), ErrorShape> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| ErrorShape::not_found(format!("node not connected: {node_id}")))?;
        let text = encode(Frame::Req(RequestFrame {
            id: id.to_string(),
            method: method.to_string(),
            params,
        }))
        .ok_or_else(|| ErrorShape::internal("failed to encode node request"))?;
        if !node.send(&text) {
            return Err(ErrorShape::not_found("node connection lost"));
        }
        self.pending.insert(id.to_string(), PendingRequest {
            node_id: node_id.to_string(),
            method: method.to_string(),
            sender,
            created_at: Instant::now(),
        });
        Ok(())
    }

    /// Route a node's `res` frame to its waiter. Unknown, duplicate or
    /// foreign ids are dropped. Returns whether a waiter was resolved.
    pub fn resolve_response(&mut self, conn_id: &str, response: ResponseFrame) -> bool {
        let Some(node_id) = self.by_conn.get(conn_id) else {
            warn!(conn_id, id = %response.id, "response from non-node connection dropped");
            return false;
        };
        match self.pending.get(&response.id) {
            Some(p) if &p.node_id == node_id => {},
            Some(_) => {
                warn!(conn_id, id = %response.id, "response for another node's request dropped");
                return false;
            },
            None => {
                warn!(conn_id, id = %response.id, "unmatched node response dropped");
                return false;
            },
        }
        let Some(pending) = self.pending.remove(&response.id) else {
            return false;
        };
        debug!(
            node_id = %pending.node_id,
            method = %pending.method,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
            "node response received"
        );
        let _ = pending.sender.send(response.into_result());
        true
    }

    fn cancel_pending(&mut self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }
}

fn encode(frame: Frame) -> Option<String> {
    match frame.to_text() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "failed to encode frame");
            None
        },
    }
}

/// Send `method` to a node and await its response.
///
/// Times out with `TIMEOUT`; a node that disconnects first yields
/// `NOT_FOUND` ("node disconnected").
pub async fn request(
    state: &Arc<GatewayState>,
    node_id: &str,
    method: &str,
    params: Value,
    timeout: Duration,
) -> Result<Value, ErrorShape> {
    let id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    state
        .nodes
        .write()
        .await
        .begin_request(node_id, &id, method, params, tx)?;
    debug!(node_id, method, request_id = %id, "node request sent");

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ErrorShape::not_found("node disconnected")),
        Err(_) => {
            state.nodes.write().await.cancel_pending(&id);
            info!(node_id, method, request_id = %id, "node request timed out");
            Err(ErrorShape::timeout(format!(
                "node {node_id} did not answer {method} within {}ms",
                timeout.as_millis()
            )))
        },
    }
}
