use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    serde_json::Value,
    tokio::sync::{RwLock, mpsc},
    tokio_util::sync::CancellationToken,
};

use {
    clawgate_config::GatewayConfig,
    clawgate_protocol::{ConnectParams, roles, scopes},
    clawgate_sessions::SessionRegistry,
};

use crate::{auth::ResolvedAuth, nodes::NodeRegistry, services::GatewayServices};

// ── Connected client ─────────────────────────────────────────────────────────

/// A WebSocket connection that completed the connect handshake.
#[derive(Debug)]
pub struct ConnectedClient {
    pub conn_id: String,
    pub connect_params: ConnectParams,
    /// Channel for sending serialized frames to this client's write loop.
    pub sender: mpsc::UnboundedSender<String>,
}

impl ConnectedClient {
    pub fn role(&self) -> &str {
        self.connect_params.role()
    }

    pub fn is_node(&self) -> bool {
        self.role() == roles::NODE
    }

    /// Send a serialized JSON frame to this client.
    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }
}

/// Scopes granted to a connection. Operators that request none get admin;
/// nodes get exactly what they ask for.
pub fn effective_scopes(params: &ConnectParams) -> Vec<String> {
    match params.scopes.as_deref() {
        Some(requested) if !requested.is_empty() => requested.to_vec(),
        _ if params.role() == roles::OPERATOR => vec![scopes::ADMIN.to_string()],
        _ => Vec::new(),
    }
}

// ── Dedupe cache ─────────────────────────────────────────────────────────────

struct DedupeEntry {
    run_id: String,
    /// Terminal summary once the run has finished.
    result: Option<Value>,
    inserted_at: Instant,
}

/// A repeated idempotency key: the original run and, if it has finished,
/// its terminal summary.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupeHit {
    pub run_id: String,
    pub result: Option<Value>,
}

/// TTL-bounded idempotency cache mapping idempotency key → run id.
pub struct DedupeCache {
    entries: HashMap<String, DedupeEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupeCache {
    pub fn new() -> Self {
        Self::with_limits(
            Duration::from_millis(clawgate_protocol::DEDUPE_TTL_MS),
            clawgate_protocol::DEDUPE_MAX_ENTRIES,
        )
    }

    pub fn with_limits(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Record `key` → `run_id` unless the key was seen within the TTL, in
    /// which case the original run is returned and nothing changes.
    pub fn check_and_insert(&mut self, key: &str, run_id: &str) -> Option<DedupeHit> {
        self.evict_expired();
        if let Some(existing) = self.entries.get(key) {
            return Some(DedupeHit {
                run_id: existing.run_id.clone(),
                result: existing.result.clone(),
            });
        }
        if self.entries.len() >= self.max_entries
            && let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|(_, v)| v.inserted_at)
                .map(|(k, _)| k.clone())
        {
            self.entries.remove(&oldest_key);
        }
        self.entries.insert(key.to_string(), DedupeEntry {
            run_id: run_id.to_string(),
            result: None,
            inserted_at: Instant::now(),
        });
        None
    }

    /// Attach the terminal summary of `run_id`. A key that has since been
    /// evicted or reused by another run is left alone.
    pub fn complete(&mut self, key: &str, run_id: &str, result: Value) {
        if let Some(entry) = self.entries.get_mut(key)
            && entry.run_id == run_id
        {
            entry.result = Some(result);
        }
    }

    /// Forget a key whose run never started.
    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn evict_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, v| v.inserted_at.elapsed() < ttl);
    }
}

// ── Active runs ──────────────────────────────────────────────────────────────

/// An agent run that has not finished yet.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub run_id: String,
    pub session_key: String,
    pub cancel: CancellationToken,
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// Connected WebSocket clients (operators and nodes), keyed by conn_id.
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    /// Monotonically increasing sequence counter for broadcast events.
    pub seq: AtomicU64,
    /// Idempotency cache for `chat.send` / `agent`.
    pub dedupe: RwLock<DedupeCache>,
    /// Server version string.
    pub version: String,
    /// Hostname for HelloOk.
    pub hostname: String,
    /// Auth configuration, fixed for the lifetime of this instance.
    pub auth: ResolvedAuth,
    /// Current config baseline. Replaced only by the reload routine.
    config: RwLock<Arc<GatewayConfig>>,
    /// Connected bridge nodes and their pending requests.
    pub nodes: RwLock<NodeRegistry>,
    /// In-flight agent runs, keyed by run id.
    pub active_runs: RwLock<HashMap<String, ActiveRun>>,
    /// Session store cache and write serialization.
    pub sessions: SessionRegistry,
    /// Domain services.
    pub services: GatewayServices,
    /// Fires when this instance is shutting down; connection loops exit.
    pub shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, services: GatewayServices) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());

        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            dedupe: RwLock::new(DedupeCache::new()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            auth: ResolvedAuth::from_config(&config.gateway.auth),
            config: RwLock::new(Arc::new(config)),
            nodes: RwLock::new(NodeRegistry::new()),
            active_runs: RwLock::new(HashMap::new()),
            sessions: SessionRegistry::new(),
            services,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Snapshot of the current config baseline.
    pub async fn config(&self) -> Arc<GatewayConfig> {
        Arc::clone(&*self.config.read().await)
    }

    pub async fn set_config(&self, config: Arc<GatewayConfig>) {
        *self.config.write().await = config;
    }

    /// Store file for `agent_id` under the configured state directory.
    pub async fn store_path(&self, agent_id: &str) -> PathBuf {
        let state_dir = self.config().await.state_dir();
        clawgate_routing::session_store_path(&state_dir, agent_id)
    }

    /// Register a new client connection.
    pub async fn register_client(&self, client: ConnectedClient) {
        let conn_id = client.conn_id.clone();
        self.clients.write().await.insert(conn_id, client);
    }

    /// Remove a client by conn_id. Returns the removed client if found.
    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.clients.write().await.remove(conn_id)
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Close a client: unregister it as a node (failing its pending
    /// requests) and drop it from the client map.
    pub async fn close_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.nodes.write().await.unregister_by_conn(conn_id);
        self.remove_client(conn_id).await
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<Self> {
        Self::new(GatewayConfig::default(), GatewayServices::noop())
    }
}
