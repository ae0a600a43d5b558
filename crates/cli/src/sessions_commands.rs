use std::path::PathBuf;

use {anyhow::Result, clap::Subcommand};

use {
    clawgate_config::{
        GatewayConfig,
        schema::{MaintenanceConfig, MaintenanceMode},
    },
    clawgate_sessions::{MaintenanceReport, SessionRegistry, SessionsError, UpdateOptions},
};

#[derive(Subcommand)]
pub enum SessionsAction {
    /// Run store maintenance now, enforcing it regardless of the configured mode.
    Cleanup {
        /// Agent whose store to clean (defaults to the default agent).
        #[arg(long)]
        agent: Option<String>,
        /// Print what would be removed without writing anything.
        #[arg(long)]
        dry_run: bool,
        /// Session key that must survive the cleanup.
        #[arg(long)]
        active_key: Option<String>,
    },
    /// Strictly parse a store and report its entries.
    Inspect {
        #[arg(long)]
        agent: Option<String>,
        /// Move a corrupt store aside and start from an empty one.
        #[arg(long)]
        repair: bool,
    },
}

pub async fn handle_sessions(config: &GatewayConfig, action: &SessionsAction) -> Result<()> {
    let registry = SessionRegistry::new();
    match action {
        SessionsAction::Cleanup {
            agent,
            dry_run,
            active_key,
        } => {
            let path = store_path(config, agent.as_deref());
            let opts = UpdateOptions {
                maintenance: MaintenanceConfig {
                    mode: MaintenanceMode::Enforce,
                    ..config.session.maintenance.clone()
                },
                active_key: active_key.clone(),
            };
            let report = if *dry_run {
                registry.dry_run(&path, opts).await?
            } else {
                registry.update(&path, opts, |_| ()).await?.maintenance
            };
            print_report(&path, &report)
        },
        SessionsAction::Inspect { agent, repair } => {
            let path = store_path(config, agent.as_deref());
            match registry.inspect(&path).await {
                Ok(store) => {
                    println!("{}: {} entries", path.display(), store.len());
                    for (key, entry) in &store {
                        println!("  {key}  (updated {})", entry.updated_at);
                    }
                    Ok(())
                },
                Err(e @ SessionsError::Corrupt { .. }) => {
                    eprintln!("{e}");
                    if !*repair {
                        anyhow::bail!("store is corrupt; rerun with --repair to move it aside");
                    }
                    if let Some(backup) = registry.repair(&path).await? {
                        println!("moved corrupt store to {}", backup.display());
                    }
                    Ok(())
                },
                Err(e) => Err(e.into()),
            }
        },
    }
}

fn store_path(config: &GatewayConfig, agent: Option<&str>) -> PathBuf {
    let agent = agent.unwrap_or_else(|| config.default_agent_id());
    clawgate_routing::session_store_path(&config.state_dir(), agent)
}

fn print_report(path: &std::path::Path, report: &MaintenanceReport) -> Result<()> {
    println!("{}", path.display());
    println!("{}", serde_json::to_string_pretty(report)?);
    if report.plan.is_empty() {
        println!("nothing to clean up");
    }
    Ok(())
}
