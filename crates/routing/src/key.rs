use std::path::{Path, PathBuf};

/// Components recovered from a session key.
///
/// Keys look like `main`, `discord:group:123` or
/// `agent:ops:telegram:direct:42`. Anything that does not fit the
/// `<channel>:<chatType>:<id>` shape keeps `channel` and `chat_type` unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey<'a> {
    pub agent_id: Option<&'a str>,
    /// Key with any `agent:<id>:` prefix removed.
    pub rest: &'a str,
    pub channel: Option<String>,
    pub chat_type: Option<String>,
    pub peer_id: Option<&'a str>,
}

pub fn parse_session_key(key: &str) -> ParsedKey<'_> {
    let (agent_id, rest) = match key.strip_prefix("agent:").and_then(|r| r.split_once(':')) {
        Some((id, rest)) if !id.is_empty() => (Some(id), rest),
        _ => (None, key),
    };

    let mut parts = rest.splitn(3, ':');
    let (channel, chat_type, peer_id) = match (parts.next(), parts.next(), parts.next()) {
        (Some(channel), Some(kind), Some(peer))
            if !channel.is_empty() && normalize_chat_type(kind).is_some() =>
        {
            (
                Some(channel.to_ascii_lowercase()),
                normalize_chat_type(kind),
                Some(peer),
            )
        },
        _ => (None, None, None),
    };

    ParsedKey {
        agent_id,
        rest,
        channel,
        chat_type,
        peer_id,
    }
}

/// Lowercased chat type with `dm` folded into `direct`. Unknown kinds are
/// `None`.
pub fn normalize_chat_type(kind: &str) -> Option<String> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "dm" | "direct" => Some("direct".into()),
        "group" => Some("group".into()),
        "channel" => Some("channel".into()),
        _ => None,
    }
}

/// Agent that owns `key`: the `<id>` of an `agent:<id>:...` key, else
/// `default_agent`.
pub fn resolve_agent_id<'a>(key: &'a str, default_agent: &'a str) -> &'a str {
    parse_session_key(key).agent_id.unwrap_or(default_agent)
}

/// Store file for `agent_id` under `state_dir`.
pub fn session_store_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    clawgate_sessions::store_path(state_dir, agent_id)
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("main", "main")]
    #[case("discord:group:123", "main")]
    #[case("agent:ops:telegram:direct:42", "ops")]
    #[case("agent:ops:main", "ops")]
    #[case("agent::main", "main")]
    #[case("agent:solo", "main")]
    fn agent_resolution(#[case] key: &str, #[case] expected: &str) {
        assert_eq!(resolve_agent_id(key, "main"), expected);
    }

    #[test]
    fn parses_channel_shape() {
        let parsed = parse_session_key("agent:ops:Telegram:DM:42");
        assert_eq!(parsed.agent_id, Some("ops"));
        assert_eq!(parsed.rest, "Telegram:DM:42");
        assert_eq!(parsed.channel.as_deref(), Some("telegram"));
        assert_eq!(parsed.chat_type.as_deref(), Some("direct"));
        assert_eq!(parsed.peer_id, Some("42"));
    }

    #[test]
    fn peer_id_may_contain_colons() {
        let parsed = parse_session_key("slack:channel:T1:C2");
        assert_eq!(parsed.channel.as_deref(), Some("slack"));
        assert_eq!(parsed.peer_id, Some("T1:C2"));
    }

    #[test]
    fn opaque_keys_have_no_route() {
        let parsed = parse_session_key("main");
        assert!(parsed.channel.is_none());
        assert!(parsed.chat_type.is_none());

        let parsed = parse_session_key("discord:thread:1");
        assert!(parsed.channel.is_none());
    }

    #[test]
    fn store_path_layout() {
        assert_eq!(
            session_store_path(Path::new("/st"), "ops"),
            PathBuf::from("/st/agents/ops/sessions/sessions.json")
        );
    }
}
