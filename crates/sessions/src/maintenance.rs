//! Store maintenance: age pruning, entry cap, and disk budget.
//!
//! Planning is pure: [`plan`] looks at a store snapshot (plus a disk usage
//! scan when a budget is configured) and decides what to drop. The registry
//! applies the plan only in `enforce` mode.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use {
    clawgate_config::schema::{MaintenanceConfig, MaintenanceMode},
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::{
    entry::{SessionEntry, SessionStore},
    paths::{TRANSCRIPT_EXT, transcript_path},
};

/// Sizes of the files under a sessions directory.
#[derive(Debug, Clone, Default)]
pub struct DiskUsage {
    pub store_bytes: u64,
    /// Transcript path → (size, mtime ms).
    pub transcripts: BTreeMap<PathBuf, (u64, u64)>,
}

impl DiskUsage {
    /// Scan `sessions_dir` for `*.jsonl` transcripts and measure the store file.
    pub fn scan(sessions_dir: &Path, store_path: &Path) -> Self {
        let store_bytes = std::fs::metadata(store_path).map(|m| m.len()).unwrap_or(0);
        let mut transcripts = BTreeMap::new();

        let Ok(read_dir) = std::fs::read_dir(sessions_dir) else {
            return Self {
                store_bytes,
                transcripts,
            };
        };
        for dirent in read_dir.flatten() {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TRANSCRIPT_EXT) {
                continue;
            }
            let Ok(meta) = dirent.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            transcripts.insert(path, (meta.len(), mtime));
        }

        Self {
            store_bytes,
            transcripts,
        }
    }

    pub fn total(&self) -> u64 {
        self.store_bytes + self.transcripts.values().map(|(size, _)| size).sum::<u64>()
    }
}

/// Inputs for one planning pass.
#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    pub now_ms: u64,
    pub sessions_dir: &'a Path,
    /// Never evicted by any pass.
    pub active_key: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenancePlan {
    /// Entries older than `pruneAfterMs`.
    pub pruned: Vec<String>,
    /// Oldest entries over `maxEntries`.
    pub capped: Vec<String>,
    /// Entries evicted to get under the disk budget.
    pub evicted: Vec<String>,
    /// Transcript files to delete.
    pub removed_files: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_before: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_after: Option<u64>,
}

impl MaintenancePlan {
    pub fn is_empty(&self) -> bool {
        self.pruned.is_empty()
            && self.capped.is_empty()
            && self.evicted.is_empty()
            && self.removed_files.is_empty()
    }

    pub fn removed_keys(&self) -> impl Iterator<Item = &String> {
        self.pruned
            .iter()
            .chain(self.capped.iter())
            .chain(self.evicted.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub mode: MaintenanceMode,
    pub plan: MaintenancePlan,
    /// Whether the plan was actually applied.
    pub applied: bool,
}

impl MaintenanceReport {
    pub fn skipped() -> Self {
        Self {
            mode: MaintenanceMode::Off,
            plan: MaintenancePlan::default(),
            applied: false,
        }
    }
}

/// Serialized footprint of one entry inside the store file.
fn entry_bytes(key: &str, entry: &SessionEntry) -> u64 {
    let body = serde_json::to_string_pretty(entry).map(|s| s.len()).unwrap_or(0);
    (body + key.len() + 8) as u64
}

/// Decide what to prune, cap and evict. Does not touch the store or disk.
pub fn plan(
    store: &SessionStore,
    config: &MaintenanceConfig,
    ctx: &PlanContext<'_>,
    disk: Option<&DiskUsage>,
) -> MaintenancePlan {
    let mut out = MaintenancePlan::default();
    let is_active = |key: &str| ctx.active_key == Some(key);

    // Remaining entries, oldest first.
    let mut remaining: Vec<(&String, &SessionEntry)> = store.iter().collect();
    remaining.sort_by(|a, b| a.1.updated_at.cmp(&b.1.updated_at).then(a.0.cmp(b.0)));

    let cutoff = ctx.now_ms.saturating_sub(config.prune_after_ms);
    remaining.retain(|(key, entry)| {
        if entry.updated_at < cutoff && !is_active(key) {
            out.pruned.push((*key).clone());
            false
        } else {
            true
        }
    });

    let mut excess = remaining.len().saturating_sub(config.max_entries);
    if excess > 0 {
        remaining.retain(|(key, _)| {
            if excess > 0 && !is_active(key) {
                excess -= 1;
                out.capped.push((*key).clone());
                false
            } else {
                true
            }
        });
    }

    if let (Some(budget), Some(target), Some(disk)) =
        (config.disk_budget_bytes, config.high_water(), disk)
    {
        plan_disk_budget(&mut out, &mut remaining, budget, target, disk, ctx);
    }

    out
}

fn plan_disk_budget(
    out: &mut MaintenancePlan,
    remaining: &mut Vec<(&String, &SessionEntry)>,
    budget: u64,
    target: u64,
    disk: &DiskUsage,
    ctx: &PlanContext<'_>,
) {
    let transcript_size = |path: &Path| disk.transcripts.get(path).map_or(0, |(size, _)| *size);

    let mut store_bytes: u64 = 2 + remaining
        .iter()
        .map(|(key, entry)| entry_bytes(key, entry))
        .sum::<u64>();
    let mut total = store_bytes + disk.transcripts.values().map(|(size, _)| size).sum::<u64>();
    out.bytes_before = Some(disk.total());

    if total <= budget {
        out.bytes_after = Some(total);
        return;
    }

    let referenced: BTreeSet<PathBuf> = remaining
        .iter()
        .map(|(_, entry)| transcript_path(ctx.sessions_dir, entry))
        .collect();

    let mut orphans: Vec<(&PathBuf, u64, u64)> = disk
        .transcripts
        .iter()
        .filter(|(path, _)| !referenced.contains(*path))
        .map(|(path, (size, mtime))| (path, *size, *mtime))
        .collect();
    orphans.sort_by_key(|(_, _, mtime)| *mtime);

    for (path, size, _) in orphans {
        if total <= target {
            break;
        }
        total = total.saturating_sub(size);
        out.removed_files.push(path.clone());
    }

    while total > target {
        let Some(pos) = remaining.iter().position(|(key, _)| ctx.active_key != Some(key.as_str()))
        else {
            break;
        };
        let (key, entry) = remaining.remove(pos);
        let bytes = entry_bytes(key, entry);
        store_bytes = store_bytes.saturating_sub(bytes);
        total = total.saturating_sub(bytes);

        let transcript = transcript_path(ctx.sessions_dir, entry);
        if disk.transcripts.contains_key(&transcript) && !out.removed_files.contains(&transcript) {
            total = total.saturating_sub(transcript_size(&transcript));
            out.removed_files.push(transcript);
        }
        out.evicted.push(key.clone());
    }

    debug!(store_bytes, total, target, "disk budget pass");
    out.bytes_after = Some(total);
}

/// Remove planned keys from the store.
pub fn apply(store: &mut SessionStore, plan: &MaintenancePlan) {
    for key in plan.removed_keys() {
        store.remove(key);
    }
}

/// Delete planned transcript files. Failures are logged.
pub fn remove_files(plan: &MaintenancePlan) {
    for path in &plan.removed_files {
        if let Err(e) = std::fs::remove_file(path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "failed to remove transcript");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const DAY: u64 = 24 * 60 * 60 * 1000;

    fn entry(id: &str, updated_at: u64) -> SessionEntry {
        SessionEntry {
            session_id: id.into(),
            updated_at,
            ..Default::default()
        }
    }

    fn store(entries: &[(&str, u64)]) -> SessionStore {
        entries
            .iter()
            .map(|(k, t)| (k.to_string(), entry(&format!("sid-{k}"), *t)))
            .collect()
    }

    fn ctx<'a>(now: u64, dir: &'a Path, active: Option<&'a str>) -> PlanContext<'a> {
        PlanContext {
            now_ms: now,
            sessions_dir: dir,
            active_key: active,
        }
    }

    #[test]
    fn prunes_stale_entries() {
        let now = 100 * DAY;
        let s = store(&[("old", now - 40 * DAY), ("fresh", now - DAY)]);
        let p = plan(&s, &MaintenanceConfig::default(), &ctx(now, Path::new("/s"), None), None);
        assert_eq!(p.pruned, vec!["old"]);
        assert!(p.capped.is_empty());
    }

    #[test]
    fn caps_oldest_first() {
        let now = 10 * DAY;
        let s = store(&[("a", now - 3), ("b", now - 1), ("c", now - 2)]);
        let cfg = MaintenanceConfig {
            max_entries: 1,
            ..Default::default()
        };
        let p = plan(&s, &cfg, &ctx(now, Path::new("/s"), None), None);
        assert_eq!(p.capped, vec!["a", "c"]);
    }

    #[test]
    fn active_key_survives_every_pass() {
        let now = 100 * DAY;
        let s = store(&[("active", 1), ("b", now - 2), ("c", now - 1)]);
        let cfg = MaintenanceConfig {
            max_entries: 1,
            disk_budget_bytes: Some(1),
            high_water_bytes: Some(0),
            ..Default::default()
        };
        let dir = Path::new("/s");
        let disk = DiskUsage {
            store_bytes: 500,
            transcripts: [(dir.join("sid-active.jsonl"), (10_000, 1))].into(),
        };
        let p = plan(&s, &cfg, &ctx(now, dir, Some("active")), Some(&disk));
        assert!(!p.removed_keys().any(|k| k == "active"));
        assert!(!p.removed_files.contains(&dir.join("sid-active.jsonl")));
        assert_eq!(p.capped, vec!["b", "c"]);
    }

    #[test]
    fn disk_budget_removes_orphans_before_entries() {
        let now = 10 * DAY;
        let dir = Path::new("/s");
        let s = store(&[("a", now - 2), ("b", now - 1)]);
        let disk = DiskUsage {
            store_bytes: 400,
            transcripts: [
                (dir.join("sid-a.jsonl"), (1_000, 5)),
                (dir.join("sid-b.jsonl"), (1_000, 6)),
                (dir.join("orphan.jsonl"), (5_000, 1)),
            ]
            .into(),
        };
        let cfg = MaintenanceConfig {
            disk_budget_bytes: Some(4_000),
            ..Default::default()
        };
        let p = plan(&s, &cfg, &ctx(now, dir, None), Some(&disk));
        assert_eq!(p.removed_files, vec![dir.join("orphan.jsonl")]);
        assert!(p.evicted.is_empty());
        assert!(p.bytes_after.unwrap() <= 3_200);
    }

    #[test]
    fn disk_budget_evicts_oldest_with_transcript() {
        let now = 10 * DAY;
        let dir = Path::new("/s");
        let s = store(&[("a", now - 2), ("b", now - 1)]);
        let disk = DiskUsage {
            store_bytes: 400,
            transcripts: [
                (dir.join("sid-a.jsonl"), (3_000, 5)),
                (dir.join("sid-b.jsonl"), (1_000, 6)),
            ]
            .into(),
        };
        let cfg = MaintenanceConfig {
            disk_budget_bytes: Some(3_000),
            ..Default::default()
        };
        let p = plan(&s, &cfg, &ctx(now, dir, None), Some(&disk));
        assert_eq!(p.evicted, vec!["a"]);
        assert_eq!(p.removed_files, vec![dir.join("sid-a.jsonl")]);
    }

    #[test]
    fn under_budget_is_noop() {
        let now = 10 * DAY;
        let dir = Path::new("/s");
        let s = store(&[("a", now)]);
        let disk = DiskUsage {
            store_bytes: 100,
            transcripts: [(dir.join("sid-a.jsonl"), (100, 1))].into(),
        };
        let cfg = MaintenanceConfig {
            disk_budget_bytes: Some(10_000),
            ..Default::default()
        };
        let p = plan(&s, &cfg, &ctx(now, dir, None), Some(&disk));
        assert!(p.is_empty());
        assert!(p.bytes_after.is_some());
    }

    #[test]
    fn apply_removes_planned_keys() {
        let mut s = store(&[("a", 1), ("b", 2), ("c", 3)]);
        let p = MaintenancePlan {
            pruned: vec!["a".into()],
            evicted: vec!["c".into()],
            ..Default::default()
        };
        apply(&mut s, &p);
        assert_eq!(s.keys().collect::<Vec<_>>(), vec!["b"]);
    }
}
