use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SessionsError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt session store {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize session data: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("session task failed: {0}")]
    Join(String),
}

impl SessionsError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for SessionsError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionsError>;
