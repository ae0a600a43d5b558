//! Voice wake trigger words shared with bridge nodes.

use std::path::{Path, PathBuf};

use {
    serde::{Deserialize, Serialize},
    serde_json::json,
    tracing::{debug, info, warn},
};

use clawgate_sessions::now_ms;

use crate::{
    broadcast::{BroadcastOpts, broadcast, send_node_event},
    methods::{EmptyParams, MethodRegistry, internal, parse_params},
    state::GatewayState,
};

pub const DEFAULT_TRIGGERS: &[&str] = &["clawgate", "claude", "computer"];
pub const MAX_TRIGGERS: usize = 32;
pub const MAX_TRIGGER_CHARS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceWakeSettings {
    pub triggers: Vec<String>,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl Default for VoiceWakeSettings {
    fn default() -> Self {
        Self {
            triggers: default_triggers(),
            updated_at_ms: 0,
        }
    }
}

fn default_triggers() -> Vec<String> {
    DEFAULT_TRIGGERS.iter().map(|t| t.to_string()).collect()
}

pub fn settings_path(state_dir: &Path) -> PathBuf {
    state_dir.join("settings").join("voicewake.json")
}

/// Trim, drop blanks and duplicates, cap length and count. An empty result
/// falls back to the defaults.
pub fn normalize_triggers<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for trigger in raw {
        let trimmed = trigger.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        let trigger: String = trimmed.chars().take(MAX_TRIGGER_CHARS).collect();
        if out.contains(&trigger) {
            continue;
        }
        out.push(trigger);
        if out.len() == MAX_TRIGGERS {
            break;
        }
    }
    if out.is_empty() {
        default_triggers()
    } else {
        out
    }
}

/// Missing or unreadable settings yield the defaults.
pub async fn load(state_dir: &Path) -> VoiceWakeSettings {
    let path = settings_path(state_dir);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to read voicewake settings");
            }
            return VoiceWakeSettings::default();
        },
    };
    match serde_json::from_str::<VoiceWakeSettings>(&raw) {
        Ok(settings) => VoiceWakeSettings {
            triggers: normalize_triggers(&settings.triggers),
            updated_at_ms: settings.updated_at_ms,
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt voicewake settings, using defaults");
            VoiceWakeSettings::default()
        },
    }
}

/// Normalize and persist `triggers` (temp file + rename).
pub async fn save(state_dir: &Path, triggers: &[String]) -> std::io::Result<VoiceWakeSettings> {
    let settings = VoiceWakeSettings {
        triggers: normalize_triggers(triggers),
        updated_at_ms: now_ms(),
    };
    let path = settings_path(state_dir);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(&settings).map_err(std::io::Error::other)?;
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    debug!(path = %path.display(), count = settings.triggers.len(), "voicewake settings saved");
    Ok(settings)
}

/// Push the current triggers to one node, right after it connects.
pub async fn push_to_node(state: &GatewayState, node_id: &str) {
    let settings = load(&state.config().await.state_dir()).await;
    if !send_node_event(
        state,
        node_id,
        "voicewake.changed",
        json!({ "triggers": settings.triggers }),
    )
    .await
    {
        debug!(node_id, "voicewake push skipped, node not reachable");
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SetParams {
    triggers: Vec<String>,
}

pub(crate) fn register_voicewake_methods(reg: &mut MethodRegistry) {
    reg.register(
        "voicewake.get",
        Box::new(|ctx| {
            Box::pin(async move {
                let _: EmptyParams = parse_params(ctx.params)?;
                let settings = load(&ctx.state.config().await.state_dir()).await;
                Ok(json!({ "triggers": settings.triggers }))
            })
        }),
    );

    reg.register(
        "voicewake.set",
        Box::new(|ctx| {
            Box::pin(async move {
                let params: SetParams = parse_params(ctx.params)?;
                let state_dir = ctx.state.config().await.state_dir();
                let settings = save(&state_dir, &params.triggers)
                    .await
                    .map_err(internal)?;
                let delivered = broadcast(
                    &ctx.state,
                    "voicewake.changed",
                    json!({ "triggers": settings.triggers }),
                    BroadcastOpts {
                        include_nodes: true,
                    },
                )
                .await;
                info!(
                    count = settings.triggers.len(),
                    delivered, "voicewake triggers updated"
                );
                Ok(json!({ "triggers": settings.triggers }))
            })
        }),
    );
}
