use std::collections::BTreeSet;

use {
    clawgate_config::{GatewayConfig, schema::ToolPolicyConfig},
    serde::Serialize,
    tracing::debug,
};

/// Which config layer a policy came from, least specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Global,
    Provider,
    Agent,
    Group,
}

/// Context for resolving which policy layers apply.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub agent_id: String,
    pub provider: Option<String>,
    pub channel: Option<String>,
    pub account_id: Option<String>,
    pub group_id: Option<String>,
}

/// Check if a tool name matches a glob pattern (supports `*` wildcard).
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    pattern == name
}

fn any_matches(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| pattern_matches(p, name))
}

/// Policy layers ordered least to most specific.
///
/// Resolution for a tool name:
/// 1. The most specific layer that allows the tool by exact name wins over
///    denies in less specific layers, unless that layer or a more specific one
///    denies it or a more specific allow list excludes it.
/// 2. Otherwise a deny at any layer blocks.
/// 3. Otherwise every layer with a non-empty allow list must match.
/// 4. Otherwise the tool is allowed.
#[derive(Debug, Clone, Default)]
pub struct LayeredPolicy {
    layers: Vec<(LayerKind, ToolPolicyConfig)>,
}

impl LayeredPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer. Layers must be pushed least specific first.
    pub fn push(&mut self, kind: LayerKind, policy: ToolPolicyConfig) -> &mut Self {
        self.layers.push((kind, policy));
        self
    }

    pub fn layers(&self) -> impl Iterator<Item = LayerKind> + '_ {
        self.layers.iter().map(|(kind, _)| *kind)
    }

    pub fn is_allowed(&self, tool: &str) -> bool {
        let explicit = self
            .layers
            .iter()
            .rposition(|(_, p)| p.allow.iter().any(|a| a == tool));
        if let Some(idx) = explicit {
            let overridden = self.layers[idx..].iter().any(|(_, p)| {
                any_matches(&p.deny, tool) || (!p.allow.is_empty() && !any_matches(&p.allow, tool))
            });
            if !overridden {
                return true;
            }
        }

        if let Some((kind, _)) = self
            .layers
            .iter()
            .find(|(_, p)| any_matches(&p.deny, tool))
        {
            debug!(tool, layer = ?kind, "tool denied by policy");
            return false;
        }

        self.layers
            .iter()
            .filter(|(_, p)| !p.allow.is_empty())
            .all(|(_, p)| any_matches(&p.allow, tool))
    }

    /// The subset of `names` this policy allows, sorted.
    pub fn allowed_tools<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        names
            .into_iter()
            .filter(|name| self.is_allowed(name))
            .map(str::to_string)
            .collect()
    }
}

/// Collect the policy layers that apply to `ctx` from config.
pub fn resolve_policy(config: &GatewayConfig, ctx: &PolicyContext) -> LayeredPolicy {
    let mut policy = LayeredPolicy::new();
    policy.push(LayerKind::Global, config.tools.policy.clone());

    if let Some(provider) = ctx.provider.as_deref()
        && let Some(p) = config.tools.providers.get(provider)
    {
        policy.push(LayerKind::Provider, p.policy.clone());
        debug!(provider, "policy: applied provider layer");
    }

    if let Some(tools) = config.agent(&ctx.agent_id).and_then(|a| a.tools.as_ref()) {
        policy.push(LayerKind::Agent, tools.clone());
        debug!(agent_id = %ctx.agent_id, "policy: applied agent layer");
    }

    if let (Some(channel), Some(group_id)) = (ctx.channel.as_deref(), ctx.group_id.as_deref())
        && let Some(tools) = config
            .channels
            .get(channel)
            .and_then(|c| c.group(ctx.account_id.as_deref(), group_id))
            .and_then(|g| g.tools.as_ref())
    {
        policy.push(LayerKind::Group, tools.clone());
        debug!(channel, account_id = ?ctx.account_id, group_id, "policy: applied group layer");
    }

    policy
}
