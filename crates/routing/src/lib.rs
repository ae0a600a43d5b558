//! Session routing: which agent owns a session key, and whether outbound
//! delivery to a session is allowed.

pub mod key;
pub mod send_policy;

pub use {
    key::{ParsedKey, parse_session_key, resolve_agent_id, session_store_path},
    send_policy::{SendContext, evaluate, evaluate_for_session},
};
