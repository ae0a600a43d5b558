use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    clawgate_config::schema::SendAction,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// Session key → entry, serialized as one JSON object.
pub type SessionStore = BTreeMap<String, SessionEntry>;

/// Metadata for one session key.
///
/// Unknown fields written by other tools are preserved on rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_id: String,
    /// Epoch milliseconds.
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Explicit transcript path, relative to the sessions directory or absolute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Per-session override of the configured send policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_policy: Option<SendAction>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl SessionEntry {
    /// Fresh entry with a random session id.
    pub fn new(now: u64) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            updated_at: now,
            ..Default::default()
        }
    }

    /// Channel the session was last routed through.
    pub fn effective_channel(&self) -> Option<&str> {
        self.channel.as_deref().or(self.last_channel.as_deref())
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
