//! Append-only JSONL transcripts.
//!
//! Line 1 is a `{"type":"session",...}` header; each message is stored as
//! `{"type":"message","timestamp":<ms>,"message":{...}}`. Lines that fail to
//! parse are skipped.

use std::{collections::VecDeque, path::Path};

use {
    serde_json::{Value, json},
    tokio::{
        fs::{self, File, OpenOptions},
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    },
    tracing::debug,
};

use crate::{
    entry::now_ms,
    error::{Result, SessionsError},
};

pub const TRANSCRIPT_VERSION: u32 = 1;

/// The last `limit` messages, oldest first. A missing file has no messages.
pub async fn read_recent_messages(path: &Path, limit: usize) -> Result<Vec<Value>> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SessionsError::io(path, e)),
    };
    if limit == 0 {
        return Ok(Vec::new());
    }

    let mut lines = BufReader::new(file).lines();
    let mut recent = VecDeque::with_capacity(limit.min(1024));
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await.map_err(|e| SessionsError::io(path, e))? {
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut record: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                debug!(path = %path.display(), line = line_no, error = %e, "skipping malformed transcript line");
                continue;
            },
        };
        if record.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let Some(message) = record.get_mut("message").map(Value::take) else {
            continue;
        };
        if recent.len() == limit {
            recent.pop_front();
        }
        recent.push_back(message);
    }

    Ok(recent.into())
}

/// Append one message, writing the session header first when the file is new.
pub async fn append_message(path: &Path, session_id: &str, message: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| SessionsError::io(parent, e))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| SessionsError::io(path, e))?;
    let is_new = file
        .metadata()
        .await
        .map_err(|e| SessionsError::io(path, e))?
        .len()
        == 0;

    let now = now_ms();
    let mut buf = String::new();
    if is_new {
        let header = json!({
            "type": "session",
            "version": TRANSCRIPT_VERSION,
            "id": session_id,
            "timestamp": now,
        });
        buf.push_str(&serde_json::to_string(&header)?);
        buf.push('\n');
    }
    let record = json!({
        "type": "message",
        "timestamp": now,
        "message": message,
    });
    buf.push_str(&serde_json::to_string(&record)?);
    buf.push('\n');

    file.write_all(buf.as_bytes())
        .await
        .map_err(|e| SessionsError::io(path, e))?;
    file.flush().await.map_err(|e| SessionsError::io(path, e))?;
    Ok(())
}
