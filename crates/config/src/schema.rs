//! Config schema types.
//!
//! Sections the gateway interprets are typed; sections owned by external
//! collaborators (cron, browser, plugins, hook mappings, ...) are kept as
//! `serde_json::Value` leaves so they still participate in reload diffing.
//! Unknown top-level keys are rejected at load. Unknown keys inside a typed
//! section land in its flattened `extra` map, which the reload planner sees;
//! fixed-shape values (auth, reload settings, policies) reject them.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::error::ConfigError;

pub const DEFAULT_AGENT_ID: &str = "main";
pub const DEFAULT_PORT: u16 = 18789;
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_RELOAD_DEBOUNCE_MS: u64 = 300;
const MAX_RELOAD_DEBOUNCE_MS: u64 = 60_000;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(skip_serializing_if = "Value::is_null")]
    pub meta: Value,
    pub gateway: GatewaySection,
    pub hooks: HooksConfig,
    pub agents: AgentsConfig,
    pub session: SessionConfig,
    pub tools: ToolsConfig,
    pub channels: BTreeMap<String, ChannelConfig>,
    pub logging: LoggingConfig,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub cron: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub browser: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub models: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub plugins: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub discovery: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub canvas_host: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub ui: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub identity: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub wizard: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub bindings: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub audio: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub routing: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub messages: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub talk: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub skills: Value,
    /// WhatsApp Web session settings.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub web: Value,
}

// ── gateway ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewaySection {
    pub bind: String,
    pub port: u16,
    pub auth: GatewayAuthConfig,
    pub reload: ReloadSettings,
    /// Root for session stores and settings. Defaults to `~/.clawgate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub remote: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub control_ui: Value,
    /// Keys this version does not model; kept so reload diffing sees them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            auth: GatewayAuthConfig::default(),
            reload: ReloadSettings::default(),
            state_dir: None,
            remote: Value::Null,
            control_ui: Value::Null,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthModeConfig {
    None,
    Token,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayAuthConfig {
    /// Explicit mode; inferred from `token` when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<AuthModeConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl GatewayAuthConfig {
    pub fn resolved_mode(&self) -> AuthModeConfig {
        match self.mode {
            Some(mode) => mode,
            None if self.token.is_some() => AuthModeConfig::Token,
            None => AuthModeConfig::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    Off,
    Restart,
    Hot,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ReloadSettings {
    pub mode: ReloadMode,
    pub debounce_ms: u64,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            mode: ReloadMode::Hybrid,
            debounce_ms: DEFAULT_RELOAD_DEBOUNCE_MS,
        }
    }
}

impl ReloadSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

// ── hooks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HooksConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<Value>,
    /// Gmail watcher settings (account, label, topic, ...).
    #[serde(skip_serializing_if = "Value::is_null")]
    pub gmail: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ── agents ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    pub defaults: AgentDefaults,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<AgentConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub heartbeat: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolPolicyConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ── session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub maintenance: MaintenanceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_policy: Option<SendPolicyConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceMode {
    Off,
    #[default]
    Warn,
    Enforce,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct MaintenanceConfig {
    pub mode: MaintenanceMode,
    pub prune_after_ms: u64,
    pub max_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_budget_bytes: Option<u64>,
    /// Eviction target once the budget is exceeded; defaults to 80% of it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_water_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotate_bytes: Option<u64>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            mode: MaintenanceMode::Warn,
            prune_after_ms: 30 * 24 * 60 * 60 * 1000,
            max_entries: 500,
            disk_budget_bytes: None,
            high_water_bytes: None,
            rotate_bytes: Some(10 * 1024 * 1024),
        }
    }
}

impl MaintenanceConfig {
    pub fn high_water(&self) -> Option<u64> {
        let budget = self.disk_budget_bytes?;
        Some(
            self.high_water_bytes
                .map_or(budget / 10 * 8, |hw| hw.min(budget)),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendAction {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SendPolicyConfig {
    pub default: SendAction,
    pub rules: Vec<SendPolicyRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendPolicyRule {
    pub action: SendAction,
    #[serde(default, rename = "match")]
    pub matcher: SendPolicyMatch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct SendPolicyMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
}

// ── tools ────────────────────────────────────────────────────────────────────

/// Glob-based allow/deny lists (`*` and `prefix*` patterns).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPolicyConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub policy: ToolPolicyConfig,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ProviderToolsConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderToolsConfig {
    pub policy: ToolPolicyConfig,
}

// ── channels ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, ChannelGroupConfig>,
    /// Per-account overrides; an account's group entry shadows the channel's.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub accounts: BTreeMap<String, ChannelAccountConfig>,
    /// Adapter-specific settings (tokens, allowlists, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            groups: BTreeMap::new(),
            accounts: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl ChannelConfig {
    /// Group settings for `group_id`, preferring the account-scoped entry.
    pub fn group(&self, account_id: Option<&str>, group_id: &str) -> Option<&ChannelGroupConfig> {
        account_id
            .and_then(|a| self.accounts.get(a))
            .and_then(|a| a.groups.get(group_id))
            .or_else(|| self.groups.get(group_id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelAccountConfig {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, ChannelGroupConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelGroupConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolPolicyConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ── logging ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    pub json: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ── helpers ──────────────────────────────────────────────────────────────────

impl GatewayConfig {
    /// Canonical JSON form used for diffing.
    pub fn to_value(&self) -> Result<Value, ConfigError> {
        serde_json::to_value(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        if self.gateway.port == 0 {
            issues.push("gateway.port must be non-zero".to_string());
        }
        if self.gateway.auth.resolved_mode() == AuthModeConfig::Token
            && self
                .gateway
                .auth
                .token
                .as_deref()
                .is_none_or(|t| t.trim().is_empty())
        {
            issues.push("gateway.auth.token is required when auth mode is \"token\"".to_string());
        }
        if self.gateway.reload.debounce_ms > MAX_RELOAD_DEBOUNCE_MS {
            issues.push(format!(
                "gateway.reload.debounceMs must be at most {MAX_RELOAD_DEBOUNCE_MS}"
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for agent in &self.agents.list {
            if agent.id.trim().is_empty() {
                issues.push("agents.list entries require an id".to_string());
            } else if !seen.insert(agent.id.as_str()) {
                issues.push(format!("duplicate agent id \"{}\"", agent.id));
            }
        }
        if let Some(default) = self.agents.default.as_deref()
            && !self.agents.list.is_empty()
            && !seen.contains(default)
        {
            issues.push(format!("agents.default \"{default}\" is not in agents.list"));
        }

        if self.session.maintenance.max_entries == 0 {
            issues.push("session.maintenance.maxEntries must be at least 1".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }

    pub fn default_agent_id(&self) -> &str {
        self.agents
            .default
            .as_deref()
            .or_else(|| self.agents.list.first().map(|a| a.id.as_str()))
            .unwrap_or(DEFAULT_AGENT_ID)
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.list.iter().find(|a| a.id == agent_id)
    }

    /// Run timeout for an agent: per-agent, then defaults, then 600s.
    pub fn agent_timeout(&self, agent_id: &str) -> Duration {
        let secs = self
            .agent(agent_id)
            .and_then(|a| a.timeout_seconds)
            .or(self.agents.defaults.timeout_seconds)
            .unwrap_or(DEFAULT_AGENT_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }

    pub fn agent_model(&self, agent_id: &str) -> Option<&str> {
        self.agent(agent_id)
            .and_then(|a| a.model.as_deref())
            .or(self.agents.defaults.model.as_deref())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.gateway
            .state_dir
            .clone()
            .unwrap_or_else(crate::loader::data_dir)
    }
}
