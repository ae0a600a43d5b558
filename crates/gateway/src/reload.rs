//! Config file watching and hot reload.
//!
//! [`ReloadMachine`] is a pure state machine stepped with explicit instants.
//! [`spawn_config_watcher`] drives it from a `notify-debouncer-full` watcher
//! and runs [`reload_once`] whenever a debounce window closes.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    notify_debouncer_full::{DebounceEventResult, new_debouncer, notify::RecursiveMode},
    tokio::{sync::mpsc, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use clawgate_config::{
    GatewayConfig, ReloadDecision, ReloadPlan, build_gateway_reload_plan, decide, diff_configs,
    load_config,
};

use crate::state::GatewayState;

/// Coalesces bursts of raw filesystem events before they reach the machine.
const FS_EVENT_COALESCE: Duration = Duration::from_millis(50);

// ── State machine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPhase {
    Idle,
    Debouncing { deadline: Instant },
    Reloading { rerun: bool },
    /// A restart was requested; further changes are ignored.
    Restarting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The new snapshot became the baseline (hot applied, disabled or unchanged).
    Applied,
    /// The snapshot could not be read or validated; the baseline is unchanged.
    Invalid,
    Restart,
}

#[derive(Debug, Clone)]
pub struct ReloadMachine {
    phase: ReloadPhase,
    debounce: Duration,
}

impl ReloadMachine {
    pub fn new(debounce: Duration) -> Self {
        Self {
            phase: ReloadPhase::Idle,
            debounce,
        }
    }

    pub fn phase(&self) -> ReloadPhase {
        self.phase
    }

    pub fn set_debounce(&mut self, debounce: Duration) {
        self.debounce = debounce;
    }

    /// A change to the watched file was observed at `now`.
    pub fn on_change(&mut self, now: Instant) {
        self.phase = match self.phase {
            ReloadPhase::Idle | ReloadPhase::Debouncing { .. } => ReloadPhase::Debouncing {
                deadline: now + self.debounce,
            },
            ReloadPhase::Reloading { .. } => ReloadPhase::Reloading { rerun: true },
            ReloadPhase::Restarting => ReloadPhase::Restarting,
        };
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            ReloadPhase::Debouncing { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Returns true when a reload should start now.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.phase {
            ReloadPhase::Debouncing { deadline } if now >= deadline => {
                self.phase = ReloadPhase::Reloading { rerun: false };
                true
            },
            _ => false,
        }
    }

    /// The reload started by [`poll`](Self::poll) finished.
    pub fn finish(&mut self, outcome: ReloadOutcome, now: Instant) {
        let ReloadPhase::Reloading { rerun } = self.phase else {
            return;
        };
        self.phase = match outcome {
            ReloadOutcome::Restart => ReloadPhase::Restarting,
            _ if rerun => ReloadPhase::Debouncing { deadline: now },
            _ => ReloadPhase::Idle,
        };
    }
}

// ── Applying a snapshot ──────────────────────────────────────────────────────

/// Side effects of a reload cycle.
#[async_trait]
pub trait ReloadHandler: Send + Sync {
    async fn apply_hot(&self, plan: &ReloadPlan, next: &GatewayConfig);
    async fn request_restart(&self, plan: &ReloadPlan);
}

/// Read, validate and diff the config at `path` against the current baseline,
/// then act on the plan under the new snapshot's reload mode.
pub async fn reload_once(
    state: &GatewayState,
    path: &Path,
    handler: &dyn ReloadHandler,
) -> ReloadOutcome {
    let owned = path.to_path_buf();
    let next = match tokio::task::spawn_blocking(move || load_config(&owned)).await {
        Ok(Ok(config)) => config,
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "config reload skipped, keeping current config");
            return ReloadOutcome::Invalid;
        },
        Err(e) => {
            warn!(error = %e, "config load task failed");
            return ReloadOutcome::Invalid;
        },
    };

    let prev = state.config().await;
    let changed = match diff_configs(&prev, &next) {
        Ok(changed) => changed,
        Err(e) => {
            warn!(error = %e, "config diff failed, keeping current config");
            return ReloadOutcome::Invalid;
        },
    };
    let plan = build_gateway_reload_plan(&changed);
    let mode = next.gateway.reload.mode;
    let decision = decide(mode, &plan);
    debug!(?mode, ?decision, paths = ?plan.changed_paths, "config reload planned");

    match decision {
        ReloadDecision::NoChanges => {
            debug!("config unchanged");
            ReloadOutcome::Applied
        },
        ReloadDecision::Disabled => {
            info!(paths = ?plan.changed_paths, "config changed, reload disabled; baseline updated");
            state.set_config(Arc::new(next)).await;
            ReloadOutcome::Applied
        },
        ReloadDecision::HotApply | ReloadDecision::HotApplyRestartSkipped => {
            if decision == ReloadDecision::HotApplyRestartSkipped {
                warn!(
                    reasons = ?plan.restart_reasons,
                    "config changes require a manual restart"
                );
            }
            let next = Arc::new(next);
            state.set_config(Arc::clone(&next)).await;
            if plan.has_hot_actions() {
                handler.apply_hot(&plan, &next).await;
            }
            info!(
                hot = ?plan.hot_reasons,
                noop = ?plan.noop_paths,
                "config hot reload applied"
            );
            ReloadOutcome::Applied
        },
        ReloadDecision::Restart => {
            info!(reasons = ?plan.restart_reasons, "config change requires gateway restart");
            handler.request_restart(&plan).await;
            ReloadOutcome::Restart
        },
    }
}

/// Restarts channel providers in place and fires the restart token when the
/// gateway itself has to come back up.
pub struct GatewayReloadHandler {
    state: Arc<GatewayState>,
    restart: CancellationToken,
}

impl GatewayReloadHandler {
    pub fn new(state: Arc<GatewayState>, restart: CancellationToken) -> Self {
        Self { state, restart }
    }
}

#[async_trait]
impl ReloadHandler for GatewayReloadHandler {
    async fn apply_hot(&self, plan: &ReloadPlan, next: &GatewayConfig) {
        for channel in &plan.restart_channels {
            match self
                .state
                .services
                .channels
                .restart(channel, next.channels.get(channel))
                .await
            {
                Ok(()) => info!(channel = %channel, "channel restarted"),
                Err(e) => warn!(channel = %channel, error = %e, "channel restart failed"),
            }
        }
        // These subsystems run out of process; record what they should pick up.
        let flags = [
            (plan.reload_hooks, "hooks"),
            (plan.restart_gmail_watcher, "gmail watcher"),
            (plan.restart_browser_control, "browser control"),
            (plan.restart_cron, "cron"),
            (plan.restart_heartbeat, "heartbeat"),
        ];
        for (_, name) in flags.iter().filter(|(set, _)| *set) {
            info!(subsystem = *name, "reload requested");
        }
    }

    async fn request_restart(&self, plan: &ReloadPlan) {
        info!(reasons = ?plan.restart_reasons, "restarting gateway");
        self.restart.cancel();
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Watch `path` and reload on change until the gateway shuts down or a
/// restart is requested.
pub fn spawn_config_watcher(
    state: Arc<GatewayState>,
    path: PathBuf,
    handler: Arc<dyn ReloadHandler>,
) -> Result<JoinHandle<()>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let file_name = path.file_name().map(|n| n.to_os_string());
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut debouncer = new_debouncer(FS_EVENT_COALESCE, None, move |result: DebounceEventResult| {
        match result {
            Ok(events) => {
                let touched = events.iter().any(|event| {
                    event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name)
                });
                if touched {
                    let _ = tx.send(());
                }
            },
            Err(errors) => {
                for e in errors {
                    warn!(error = %e, "config watcher error");
                }
            },
        }
    })?;
    debouncer.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "watching config file");

    Ok(tokio::spawn(async move {
        // Dropping the debouncer stops the OS watcher.
        let _debouncer = debouncer;
        let debounce = state.config().await.gateway.reload.debounce();
        let mut machine = ReloadMachine::new(debounce);

        loop {
            let deadline = machine.deadline();
            tokio::select! {
                () = state.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(()) => machine.on_change(Instant::now()),
                    None => break,
                },
                () = sleep_until(deadline), if deadline.is_some() => {
                    if !machine.poll(Instant::now()) {
                        continue;
                    }
                    let run = reload_once(&state, &path, handler.as_ref());
                    tokio::pin!(run);
                    let outcome = loop {
                        tokio::select! {
                            outcome = &mut run => break outcome,
                            Some(()) = rx.recv() => machine.on_change(Instant::now()),
                        }
                    };
                    machine.finish(outcome, Instant::now());
                    if machine.phase() == ReloadPhase::Restarting {
                        break;
                    }
                    machine.set_debounce(state.config().await.gateway.reload.debounce());
                },
            }
        }
        debug!("config watcher stopped");
    }))
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}
