//! Session store registry: cached reads and serialized atomic updates.

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use {
    clawgate_config::schema::{MaintenanceConfig, MaintenanceMode},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    entry::{SessionStore, now_ms},
    error::{Result, SessionsError},
    maintenance::{self, DiskUsage, MaintenanceReport, PlanContext},
    paths::sibling,
};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(45);
const MAX_BACKUPS: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Bypass the read cache and hit disk.
    pub skip_cache: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub maintenance: MaintenanceConfig,
    /// Session key that maintenance must never evict.
    pub active_key: Option<String>,
}

#[derive(Debug)]
pub struct UpdateOutcome<R> {
    pub value: R,
    pub maintenance: MaintenanceReport,
}

struct CacheEntry {
    store: Arc<SessionStore>,
    mtime: Option<SystemTime>,
    loaded_at: Instant,
}

/// Owns the read cache and per-path write locks for session store files.
///
/// One registry per gateway instance. Updates on the same path run one at a
/// time in the order they were called; an OS lock on `<file>.lock` also
/// serializes writers across processes.
pub struct SessionRegistry {
    ttl: Duration,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Read a store. Missing files are empty; corrupt files are logged and
    /// treated as empty.
    pub async fn load(&self, path: &Path, opts: LoadOptions) -> Result<SessionStore> {
        if !opts.skip_cache
            && let Some(store) = self.cached(path).await
        {
            return Ok(store);
        }

        let owned = path.to_path_buf();
        let (store, mtime) = tokio::task::spawn_blocking(move || read_lenient(&owned)).await??;
        let store = Arc::new(store);
        self.cache_put(path, Arc::clone(&store), mtime).await;
        Ok(Arc::unwrap_or_clone(store))
    }

    /// Strict read that surfaces parse errors. Missing files are empty.
    pub async fn inspect(&self, path: &Path) -> Result<SessionStore> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_strict(&owned).map(|(store, _)| store)).await?
    }

    /// Move a corrupt store aside to `<file>.corrupt.<ms>` and start empty.
    /// Returns the backup path, or `None` when the store was healthy.
    pub async fn repair(&self, path: &Path) -> Result<Option<PathBuf>> {
        let lock = self.path_lock(path).await;
        let _guard = lock.lock().await;

        let owned = path.to_path_buf();
        let moved = tokio::task::spawn_blocking(move || {
            with_os_lock(&owned, || match read_strict(&owned) {
                Ok(_) => Ok(None),
                Err(SessionsError::Corrupt { .. }) => {
                    let backup = sibling(&owned, &format!(".corrupt.{}", now_ms()));
                    fs::rename(&owned, &backup).map_err(|e| SessionsError::io(&owned, e))?;
                    write_atomic(&owned, &SessionStore::new())?;
                    warn!(path = %owned.display(), backup = %backup.display(), "moved corrupt session store aside");
                    Ok(Some(backup))
                },
                Err(e) => Err(e),
            })
        })
        .await??;

        self.cache.lock().await.remove(path);
        Ok(moved)
    }

    /// Atomically read-modify-write a store.
    ///
    /// Loads fresh from disk, applies `mutator`, runs maintenance, then writes
    /// through a temp file and rename. The write runs on the blocking pool and
    /// completes even if the calling future is dropped.
    pub async fn update<R, F>(
        &self,
        path: &Path,
        opts: UpdateOptions,
        mutator: F,
    ) -> Result<UpdateOutcome<R>>
    where
        F: FnOnce(&mut SessionStore) -> R + Send + 'static,
        R: Send + 'static,
    {
        let lock = self.path_lock(path).await;
        let _guard = lock.lock().await;

        let owned = path.to_path_buf();
        let (value, report, store, mtime) =
            tokio::task::spawn_blocking(move || locked_update(&owned, &opts, mutator)).await??;

        self.cache_put(path, Arc::new(store), mtime).await;
        Ok(UpdateOutcome {
            value,
            maintenance: report,
        })
    }

    /// Compute the maintenance plan against a copy of the store without
    /// writing anything.
    pub async fn dry_run(&self, path: &Path, opts: UpdateOptions) -> Result<MaintenanceReport> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<MaintenanceReport> {
            let (store, _) = read_lenient(&owned)?;
            let mut copy = store.clone();
            let (plan, _) = run_maintenance(&owned, &mut copy, &opts, false);
            Ok(MaintenanceReport {
                mode: opts.maintenance.mode,
                plan,
                applied: false,
            })
        })
        .await?
    }

    async fn cached(&self, path: &Path) -> Option<SessionStore> {
        let (store, cached_mtime) = {
            let cache = self.cache.lock().await;
            let hit = cache.get(path)?;
            if hit.loaded_at.elapsed() > self.ttl {
                return None;
            }
            (Arc::clone(&hit.store), hit.mtime)
        };
        let mtime = tokio::fs::metadata(path).await.ok().and_then(|m| m.modified().ok());
        (mtime == cached_mtime).then(|| (*store).clone())
    }

    async fn cache_put(&self, path: &Path, store: Arc<SessionStore>, mtime: Option<SystemTime>) {
        self.cache.lock().await.insert(path.to_path_buf(), CacheEntry {
            store,
            mtime,
            loaded_at: Instant::now(),
        });
    }

    async fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }
}

/// Run `f` while holding an advisory cross-process lock on `<file>.lock`.
fn with_os_lock<T>(store_path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    if let Some(parent) = store_path.parent() {
        fs::create_dir_all(parent).map_err(|e| SessionsError::io(parent, e))?;
    }
    let lock_path = sibling(store_path, ".lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| SessionsError::io(&lock_path, e))?;
    let mut lock = fd_lock::RwLock::new(file);
    let _guard = lock.write().map_err(|e| SessionsError::io(&lock_path, e))?;
    f()
}

type Updated<R> = (R, MaintenanceReport, SessionStore, Option<SystemTime>);

fn locked_update<R, F>(path: &Path, opts: &UpdateOptions, mutator: F) -> Result<Updated<R>>
where
    F: FnOnce(&mut SessionStore) -> R,
{
    with_os_lock(path, || {
        let (mut store, _) = read_lenient(path)?;
        let value = mutator(&mut store);

        let enforce = opts.maintenance.mode == MaintenanceMode::Enforce;
        let (plan, ran) = run_maintenance(path, &mut store, opts, enforce);

        if let Some(limit) = opts.maintenance.rotate_bytes {
            rotate_if_needed(path, limit);
        }
        write_atomic(path, &store)?;

        if enforce {
            maintenance::remove_files(&plan);
        }

        let report = if ran {
            MaintenanceReport {
                mode: opts.maintenance.mode,
                plan,
                applied: enforce,
            }
        } else {
            MaintenanceReport::skipped()
        };

        let mtime = fs::metadata(path).ok().and_then(|m| m.modified().ok());
        Ok((value, report, store, mtime))
    })
}

/// Plan maintenance and, when `apply` is set, drop planned keys from `store`.
/// Returns the plan and whether maintenance ran at all.
fn run_maintenance(
    path: &Path,
    store: &mut SessionStore,
    opts: &UpdateOptions,
    apply: bool,
) -> (maintenance::MaintenancePlan, bool) {
    let config = &opts.maintenance;
    if config.mode == MaintenanceMode::Off {
        return (maintenance::MaintenancePlan::default(), false);
    }

    let sessions_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let disk = config
        .disk_budget_bytes
        .map(|_| DiskUsage::scan(sessions_dir, path));
    let ctx = PlanContext {
        now_ms: now_ms(),
        sessions_dir,
        active_key: opts.active_key.as_deref(),
    };
    let plan = maintenance::plan(store, config, &ctx, disk.as_ref());

    if !plan.is_empty() {
        if apply {
            info!(
                path = %path.display(),
                pruned = plan.pruned.len(),
                capped = plan.capped.len(),
                evicted = plan.evicted.len(),
                files = plan.removed_files.len(),
                "session maintenance applied"
            );
        } else if config.mode == MaintenanceMode::Warn {
            warn!(
                path = %path.display(),
                pruned = plan.pruned.len(),
                capped = plan.capped.len(),
                evicted = plan.evicted.len(),
                files = plan.removed_files.len(),
                "session maintenance would remove entries (mode=warn)"
            );
        }
    }

    if apply {
        maintenance::apply(store, &plan);
    }
    (plan, true)
}

fn read_strict(path: &Path) -> Result<(SessionStore, Option<SystemTime>)> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((SessionStore::new(), None));
        },
        Err(e) => return Err(SessionsError::io(path, e)),
    };
    let mtime = fs::metadata(path).ok().and_then(|m| m.modified().ok());
    if raw.trim().is_empty() {
        return Ok((SessionStore::new(), mtime));
    }
    let store = serde_json::from_str(&raw).map_err(|source| SessionsError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((store, mtime))
}

fn read_lenient(path: &Path) -> Result<(SessionStore, Option<SystemTime>)> {
    match read_strict(path) {
        Err(SessionsError::Corrupt { path, source }) => {
            warn!(path = %path.display(), error = %source, "session store is corrupt, treating as empty");
            let mtime = fs::metadata(&path).ok().and_then(|m| m.modified().ok());
            Ok((SessionStore::new(), mtime))
        },
        other => other,
    }
}

/// Write through `<file>.<uuid>.tmp`, fsync, then rename over the target.
fn write_atomic(path: &Path, store: &SessionStore) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SessionsError::io(parent, e))?;
    }
    let data = serde_json::to_vec_pretty(store)?;
    let tmp = sibling(path, &format!(".{}.tmp", uuid::Uuid::new_v4()));

    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        SessionsError::io(path, e)
    })
}

/// Rotate the store to `<file>.bak.<ms>` when it exceeds `limit` bytes,
/// keeping the newest backups.
fn rotate_if_needed(path: &Path, limit: u64) {
    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    if meta.len() <= limit {
        return;
    }
    let backup = sibling(path, &format!(".bak.{}", now_ms()));
    if let Err(e) = fs::copy(path, &backup) {
        warn!(path = %path.display(), error = %e, "failed to rotate session store");
        return;
    }
    debug!(path = %path.display(), backup = %backup.display(), "rotated session store");
    prune_backups(path);
}

fn prune_backups(path: &Path) {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str())) else {
        return;
    };
    let prefix = format!("{name}.bak.");
    let Ok(read_dir) = fs::read_dir(dir) else {
        return;
    };
    let mut backups: Vec<(u64, PathBuf)> = read_dir
        .flatten()
        .filter_map(|d| {
            let file_name = d.file_name();
            let ms = file_name.to_str()?.strip_prefix(&prefix)?.parse().ok()?;
            Some((ms, d.path()))
        })
        .collect();
    backups.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, old) in backups.into_iter().skip(MAX_BACKUPS) {
        if let Err(e) = fs::remove_file(&old) {
            warn!(path = %old.display(), error = %e, "failed to remove old backup");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::entry::SessionEntry};

    fn enforce(max_entries: usize) -> UpdateOptions {
        UpdateOptions {
            maintenance: MaintenanceConfig {
                mode: MaintenanceMode::Enforce,
                max_entries,
                ..Default::default()
            },
            active_key: None,
        }
    }

    #[tokio::test]
    async fn missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::new();
        let store = reg
            .load(&dir.path().join("sessions.json"), LoadOptions::default())
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn update_persists_and_refreshes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents/main/sessions/sessions.json");
        let reg = SessionRegistry::new();

        let out = reg
            .update(&path, UpdateOptions::default(), |store| {
                store.insert("main".into(), SessionEntry::new(now_ms()));
                store.len()
            })
            .await
            .unwrap();
        assert_eq!(out.value, 1);

        let cached = reg.load(&path, LoadOptions::default()).await.unwrap();
        assert!(cached.contains_key("main"));

        let raw = fs::read_to_string(&path).unwrap();
        let on_disk: SessionStore = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk, cached);

        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|d| d.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn concurrent_updates_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let reg = Arc::new(SessionRegistry::new());

        let mut handles = Vec::new();
        for i in 0..24 {
            let reg = Arc::clone(&reg);
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                reg.update(&path, UpdateOptions::default(), move |store| {
                    store.insert(format!("marker-{i}"), SessionEntry::new(now_ms()));
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let store = reg
            .load(&path, LoadOptions { skip_cache: true })
            .await
            .unwrap();
        assert_eq!(store.len(), 24);
    }

    #[tokio::test]
    async fn corrupt_store_loads_empty_but_inspect_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "{not json").unwrap();
        let reg = SessionRegistry::new();

        assert!(
            reg.load(&path, LoadOptions::default())
                .await
                .unwrap()
                .is_empty()
        );
        assert!(matches!(
            reg.inspect(&path).await,
            Err(SessionsError::Corrupt { .. })
        ));

        let backup = reg.repair(&path).await.unwrap().expect("backup path");
        assert!(backup.exists());
        assert!(reg.inspect(&path).await.unwrap().is_empty());
        assert!(reg.repair(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enforce_caps_but_keeps_active_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let reg = SessionRegistry::new();

        reg.update(&path, UpdateOptions::default(), |store| {
            for (i, key) in ["active", "b", "c"].iter().enumerate() {
                store.insert(key.to_string(), SessionEntry::new(1_000 + i as u64));
            }
        })
        .await
        .unwrap();

        let mut opts = enforce(1);
        opts.active_key = Some("active".into());
        let out = reg.update(&path, opts, |_| ()).await.unwrap();
        assert!(out.maintenance.applied);

        let store = reg
            .load(&path, LoadOptions { skip_cache: true })
            .await
            .unwrap();
        assert_eq!(store.keys().collect::<Vec<_>>(), vec!["active"]);
    }

    #[tokio::test]
    async fn warn_mode_reports_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let reg = SessionRegistry::new();

        let mut opts = enforce(1);
        opts.maintenance.mode = MaintenanceMode::Warn;
        let out = reg
            .update(&path, opts, |store| {
                store.insert("a".into(), SessionEntry::new(now_ms() - 10));
                store.insert("b".into(), SessionEntry::new(now_ms()));
            })
            .await
            .unwrap();
        assert!(!out.maintenance.applied);
        assert_eq!(out.maintenance.plan.capped, vec!["a"]);

        let store = reg
            .load(&path, LoadOptions { skip_cache: true })
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn dry_run_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let reg = SessionRegistry::new();
        reg.update(&path, UpdateOptions::default(), |store| {
            store.insert("a".into(), SessionEntry::new(1));
            store.insert("b".into(), SessionEntry::new(now_ms()));
        })
        .await
        .unwrap();
        let before = fs::read(&path).unwrap();

        let report = reg.dry_run(&path, enforce(500)).await.unwrap();
        assert_eq!(report.plan.pruned, vec!["a"]);
        assert!(!report.applied);
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn enforce_deletes_evicted_transcripts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let reg = SessionRegistry::new();

        let old = SessionEntry::new(now_ms() - 5_000);
        let old_transcript = dir.path().join(format!("{}.jsonl", old.session_id));
        fs::write(&old_transcript, vec![b'x'; 8_000]).unwrap();
        fs::write(dir.path().join("orphan.jsonl"), vec![b'y'; 100]).unwrap();

        let mut opts = enforce(500);
        opts.maintenance.disk_budget_bytes = Some(4_000);
        reg.update(&path, opts, move |store| {
            store.insert("old".into(), old);
            store.insert("new".into(), SessionEntry::new(now_ms()));
        })
        .await
        .unwrap();

        assert!(!old_transcript.exists());
        assert!(!dir.path().join("orphan.jsonl").exists());
        let store = reg
            .load(&path, LoadOptions { skip_cache: true })
            .await
            .unwrap();
        assert_eq!(store.keys().collect::<Vec<_>>(), vec!["new"]);
    }

    #[test]
    fn backups_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "{}").unwrap();
        for ms in 1..=5 {
            fs::write(sibling(&path, &format!(".bak.{ms}")), "{}").unwrap();
        }
        prune_backups(&path);
        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|d| d.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".bak."))
            .collect();
        left.sort();
        assert_eq!(left, vec![
            "sessions.json.bak.3",
            "sessions.json.bak.4",
            "sessions.json.bak.5"
        ]);
    }
}
