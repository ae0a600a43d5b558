mod sessions_commands;

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    clawgate_agents::StaticModelCatalog,
    clawgate_config::{GatewayConfig, load_or_default},
    clawgate_gateway::{GatewayServices, ServerExit, start_gateway},
};

#[derive(Parser)]
#[command(name = "clawgate", about = "clawgate: local control-plane gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML, YAML or JSON). Discovered when omitted.
    #[arg(long, global = true, env = "CLAWGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info", env = "CLAWGATE_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Override `gateway.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Override `gateway.port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Session store maintenance.
    Sessions {
        #[command(subcommand)]
        action: sessions_commands::SessionsAction,
    },
}

fn init_telemetry(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load(cli: &Cli) -> anyhow::Result<(GatewayConfig, Option<PathBuf>)> {
    load_or_default(cli.config.as_deref()).context("failed to load config")
}

/// Serve until shutdown, bringing a fresh instance up (with a freshly loaded
/// config) each time the reload watcher asks for a restart.
async fn run_gateway(cli: &Cli, bind: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, mut path) = load(cli)?;
    loop {
        if let Some(bind) = &bind {
            config.gateway.bind = bind.clone();
        }
        if let Some(port) = port {
            config.gateway.port = port;
        }
        let services = GatewayServices::noop()
            .with_models(Arc::new(StaticModelCatalog::from_config(&config.models)));

        match start_gateway(config, path.clone(), services).await? {
            ServerExit::Shutdown => return Ok(()),
            ServerExit::Restart => {
                info!("restarting gateway with updated config");
                match load(cli) {
                    Ok(next) => (config, path) = next,
                    Err(e) => {
                        // The watcher validated this file moments ago.
                        warn!(error = %e, "config became invalid before restart");
                        return Err(e);
                    },
                }
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // The config's logging section applies unless the level was given
    // explicitly or through RUST_LOG.
    let (config, _) = load(&cli)?;
    let level = match config.logging.level.as_deref() {
        Some(level) if cli.log_level == "info" => level,
        _ => cli.log_level.as_str(),
    };
    init_telemetry(level, cli.json_logs || config.logging.json);

    info!(version = env!("CARGO_PKG_VERSION"), "clawgate starting");

    match &cli.command {
        Commands::Gateway { bind, port } => run_gateway(&cli, bind.clone(), *port).await,
        Commands::Sessions { action } => sessions_commands::handle_sessions(&config, action).await,
    }
}
