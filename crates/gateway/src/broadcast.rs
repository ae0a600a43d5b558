//! Server-push events to operator clients and bridge nodes.
//!
//! Delivery is best effort: a closed connection is logged and skipped, and
//! nothing is retried.

use {serde_json::Value, tracing::debug};

use clawgate_protocol::{EventFrame, Frame};

use crate::state::GatewayState;

#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOpts {
    /// Also deliver to connected bridge nodes.
    pub include_nodes: bool,
}

/// Send `event` to every operator client (and nodes when requested).
/// Returns how many connections the frame was queued for.
pub async fn broadcast(
    state: &GatewayState,
    event: &str,
    payload: Value,
    opts: BroadcastOpts,
) -> usize {
    let frame = EventFrame::new(event, payload, state.next_seq());
    let text = match Frame::Event(frame.clone()).to_text() {
        Ok(text) => text,
        Err(e) => {
            debug!(event, error = %e, "failed to encode event");
            return 0;
        },
    };

    let mut delivered = 0;
    {
        let clients = state.clients.read().await;
        for client in clients.values().filter(|c| !c.is_node()) {
            if client.send(&text) {
                delivered += 1;
            } else {
                debug!(conn_id = %client.conn_id, event, "broadcast to closed client skipped");
            }
        }
    }
    if opts.include_nodes {
        delivered += state.nodes.read().await.broadcast_event(&frame);
    }
    delivered
}

/// Send `event` to a single bridge node.
pub async fn send_node_event(
    state: &GatewayState,
    node_id: &str,
    event: &str,
    payload: Value,
) -> bool {
    let frame = EventFrame::new(event, payload, state.next_seq());
    state.nodes.read().await.send_event(node_id, &frame)
}
