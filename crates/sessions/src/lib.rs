//! Session storage and maintenance.
//!
//! Each agent owns one JSON store file mapping session key → [`SessionEntry`]
//! at `<stateDir>/agents/<agentId>/sessions/sessions.json`. Conversation
//! transcripts live next to it as append-only JSONL files, one per session id.
//! All mutation goes through [`SessionRegistry::update`], which serializes
//! writers per path and runs maintenance on every save.

pub mod entry;
pub mod error;
pub mod maintenance;
pub mod paths;
pub mod store;
pub mod transcript;

pub use {
    entry::{SessionEntry, SessionStore, now_ms},
    error::{Result, SessionsError},
    maintenance::{MaintenancePlan, MaintenanceReport},
    paths::{sessions_dir, store_path, transcript_path},
    store::{LoadOptions, SessionRegistry, UpdateOptions, UpdateOutcome},
};
