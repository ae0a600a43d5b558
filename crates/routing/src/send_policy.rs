//! Outbound send policy: ordered allow/deny rules, first match wins.

use {
    clawgate_config::schema::{SendAction, SendPolicyConfig, SendPolicyMatch},
    clawgate_sessions::SessionEntry,
    tracing::debug,
};

use crate::key::{normalize_chat_type, parse_session_key};

/// What a send is being evaluated against.
#[derive(Debug, Clone, Default)]
pub struct SendContext<'a> {
    pub channel: Option<&'a str>,
    pub chat_type: Option<&'a str>,
    pub session_key: &'a str,
}

fn normalize_channel(channel: &str) -> String {
    channel.trim().to_ascii_lowercase()
}

fn rule_matches(matcher: &SendPolicyMatch, ctx: &SendContext<'_>) -> bool {
    if let Some(want) = matcher.channel.as_deref() {
        let have = ctx.channel.map(normalize_channel);
        if have.as_deref() != Some(normalize_channel(want).as_str()) {
            return false;
        }
    }
    if let Some(want) = matcher.chat_type.as_deref() {
        let want = normalize_chat_type(want).unwrap_or_else(|| want.trim().to_ascii_lowercase());
        let have = ctx.chat_type.and_then(normalize_chat_type);
        if have.as_deref() != Some(want.as_str()) {
            return false;
        }
    }
    if let Some(prefix) = matcher.key_prefix.as_deref()
        && !ctx.session_key.starts_with(prefix)
    {
        return false;
    }
    true
}

/// First matching rule's action, else the policy default.
pub fn evaluate(policy: &SendPolicyConfig, ctx: &SendContext<'_>) -> SendAction {
    for (index, rule) in policy.rules.iter().enumerate() {
        if rule_matches(&rule.matcher, ctx) {
            debug!(
                rule = index,
                action = ?rule.action,
                session_key = ctx.session_key,
                "send policy rule matched"
            );
            return rule.action;
        }
    }
    policy.default
}

/// Evaluate for a stored session.
///
/// A `sendPolicy` override on the entry wins. Otherwise channel and chat type
/// come from the entry, falling back to what the key encodes.
pub fn evaluate_for_session(
    policy: Option<&SendPolicyConfig>,
    entry: Option<&SessionEntry>,
    session_key: &str,
) -> SendAction {
    if let Some(action) = entry.and_then(|e| e.send_policy) {
        return action;
    }
    let Some(policy) = policy else {
        return SendAction::Allow;
    };

    let parsed = parse_session_key(session_key);
    let channel = entry
        .and_then(SessionEntry::effective_channel)
        .map(str::to_string)
        .or(parsed.channel);
    let chat_type = entry.and_then(|e| e.chat_type.clone()).or(parsed.chat_type);

    evaluate(policy, &SendContext {
        channel: channel.as_deref(),
        chat_type: chat_type.as_deref(),
        session_key,
    })
}
