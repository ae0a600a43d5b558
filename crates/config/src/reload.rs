//! Classify changed config paths into hot-apply actions or a restart.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::schema::ReloadMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadKind {
    Restart,
    Hot,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotAction {
    ReloadHooks,
    RestartGmailWatcher,
    RestartBrowserControl,
    RestartCron,
    RestartHeartbeat,
    RestartChannel(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct ReloadRule {
    pub prefix: &'static str,
    pub kind: ReloadKind,
    pub actions: &'static [HotAction],
}

const fn rule(prefix: &'static str, kind: ReloadKind, actions: &'static [HotAction]) -> ReloadRule {
    ReloadRule {
        prefix,
        kind,
        actions,
    }
}

const fn none(prefix: &'static str) -> ReloadRule {
    rule(prefix, ReloadKind::None, &[])
}

const fn restart(prefix: &'static str) -> ReloadRule {
    rule(prefix, ReloadKind::Restart, &[])
}

const fn hot(prefix: &'static str, actions: &'static [HotAction]) -> ReloadRule {
    rule(prefix, ReloadKind::Hot, actions)
}

/// Ordered rule table; the first matching prefix wins.
pub static RELOAD_RULES: &[ReloadRule] = &[
    none("gateway.remote"),
    none("gateway.reload"),
    hot("hooks.gmail", &[HotAction::ReloadHooks, HotAction::RestartGmailWatcher]),
    hot("hooks", &[HotAction::ReloadHooks]),
    hot("agents.defaults.heartbeat", &[HotAction::RestartHeartbeat]),
    hot("cron", &[HotAction::RestartCron]),
    hot("browser", &[HotAction::RestartBrowserControl]),
    hot("channels.telegram", &[HotAction::RestartChannel("telegram")]),
    hot("channels.discord", &[HotAction::RestartChannel("discord")]),
    hot("channels.slack", &[HotAction::RestartChannel("slack")]),
    hot("channels.signal", &[HotAction::RestartChannel("signal")]),
    hot("channels.imessage", &[HotAction::RestartChannel("imessage")]),
    hot("channels.msteams", &[HotAction::RestartChannel("msteams")]),
    hot("channels.whatsapp", &[HotAction::RestartChannel("whatsapp")]),
    hot("web", &[HotAction::RestartChannel("whatsapp")]),
    none("meta"),
    none("identity"),
    none("wizard"),
    none("logging"),
    none("models"),
    none("agents"),
    none("tools"),
    none("bindings"),
    none("audio"),
    none("routing"),
    none("messages"),
    none("session"),
    none("talk"),
    none("skills"),
    none("ui"),
    restart("plugins"),
    restart("gateway"),
    restart("discovery"),
    restart("canvasHost"),
];

fn prefix_matches(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// First rule whose prefix covers `path`.
pub fn match_rule(path: &str) -> Option<&'static ReloadRule> {
    RELOAD_RULES.iter().find(|r| prefix_matches(path, r.prefix))
}

/// What a set of changed paths requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadPlan {
    pub changed_paths: Vec<String>,
    pub restart_gateway: bool,
    pub restart_reasons: Vec<String>,
    pub hot_reasons: Vec<String>,
    pub reload_hooks: bool,
    pub restart_gmail_watcher: bool,
    pub restart_browser_control: bool,
    pub restart_cron: bool,
    pub restart_heartbeat: bool,
    pub restart_channels: BTreeSet<String>,
    pub noop_paths: Vec<String>,
}

impl ReloadPlan {
    pub fn is_empty(&self) -> bool {
        self.changed_paths.is_empty()
    }

    pub fn has_hot_actions(&self) -> bool {
        self.reload_hooks
            || self.restart_gmail_watcher
            || self.restart_browser_control
            || self.restart_cron
            || self.restart_heartbeat
            || !self.restart_channels.is_empty()
    }

    fn apply(&mut self, action: HotAction) {
        match action {
            HotAction::ReloadHooks => self.reload_hooks = true,
            HotAction::RestartGmailWatcher => self.restart_gmail_watcher = true,
            HotAction::RestartBrowserControl => self.restart_browser_control = true,
            HotAction::RestartCron => self.restart_cron = true,
            HotAction::RestartHeartbeat => self.restart_heartbeat = true,
            HotAction::RestartChannel(id) => {
                self.restart_channels.insert(id.to_string());
            },
        }
    }
}

/// Build a plan from diffed paths. Unmatched paths require a restart.
pub fn build_gateway_reload_plan(changed_paths: &[String]) -> ReloadPlan {
    let mut plan = ReloadPlan {
        changed_paths: changed_paths.to_vec(),
        ..Default::default()
    };

    for path in changed_paths {
        let Some(rule) = match_rule(path) else {
            plan.restart_gateway = true;
            plan.restart_reasons.push(path.clone());
            continue;
        };
        match rule.kind {
            ReloadKind::Restart => {
                plan.restart_gateway = true;
                plan.restart_reasons.push(path.clone());
            },
            ReloadKind::Hot => {
                plan.hot_reasons.push(path.clone());
                for action in rule.actions {
                    plan.apply(*action);
                }
            },
            ReloadKind::None => plan.noop_paths.push(path.clone()),
        }
    }

    plan
}

/// Outcome of one reload cycle under the active reload mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadDecision {
    /// Nothing changed.
    NoChanges,
    /// Reloading is off; adopt the new baseline only.
    Disabled,
    HotApply,
    Restart,
    /// Hot mode with restart-classified paths that need a manual restart.
    HotApplyRestartSkipped,
}

pub fn decide(mode: ReloadMode, plan: &ReloadPlan) -> ReloadDecision {
    if plan.is_empty() {
        return ReloadDecision::NoChanges;
    }
    match mode {
        ReloadMode::Off => ReloadDecision::Disabled,
        ReloadMode::Restart => ReloadDecision::Restart,
        ReloadMode::Hot if plan.restart_gateway => ReloadDecision::HotApplyRestartSkipped,
        ReloadMode::Hot => ReloadDecision::HotApply,
        ReloadMode::Hybrid if plan.restart_gateway => ReloadDecision::Restart,
        ReloadMode::Hybrid => ReloadDecision::HotApply,
    }
}
