use std::path::{Path, PathBuf};

use crate::entry::SessionEntry;

pub const STORE_FILENAME: &str = "sessions.json";
pub const TRANSCRIPT_EXT: &str = "jsonl";

/// `<stateDir>/agents/<agentId>/sessions`
pub fn sessions_dir(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir.join("agents").join(agent_id).join("sessions")
}

/// `<stateDir>/agents/<agentId>/sessions/sessions.json`
pub fn store_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    sessions_dir(state_dir, agent_id).join(STORE_FILENAME)
}

/// Transcript file for an entry: its `sessionFile` when set, otherwise
/// `<sessionsDir>/<sessionId>.jsonl`.
pub fn transcript_path(sessions_dir: &Path, entry: &SessionEntry) -> PathBuf {
    match entry.session_file.as_deref().filter(|f| !f.trim().is_empty()) {
        Some(file) => sessions_dir.join(file),
        None => sessions_dir.join(format!("{}.{TRANSCRIPT_EXT}", entry.session_id)),
    }
}

/// `path` with `suffix` appended to its file name.
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let root = Path::new("/state");
        assert_eq!(
            store_path(root, "ops"),
            PathBuf::from("/state/agents/ops/sessions/sessions.json")
        );
        assert_eq!(
            sibling(&store_path(root, "ops"), ".lock"),
            PathBuf::from("/state/agents/ops/sessions/sessions.json.lock")
        );
    }

    #[test]
    fn transcript_honours_session_file() {
        let dir = Path::new("/s");
        let mut entry = SessionEntry {
            session_id: "abc".into(),
            ..Default::default()
        };
        assert_eq!(transcript_path(dir, &entry), PathBuf::from("/s/abc.jsonl"));

        entry.session_file = Some("abc-fork-1.jsonl".into());
        assert_eq!(
            transcript_path(dir, &entry),
            PathBuf::from("/s/abc-fork-1.jsonl")
        );

        entry.session_file = Some("/elsewhere/t.jsonl".into());
        assert_eq!(
            transcript_path(dir, &entry),
            PathBuf::from("/elsewhere/t.jsonl")
        );
    }
}
