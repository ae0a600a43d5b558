use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::{get, post},
    },
    tokio_util::sync::CancellationToken,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use clawgate_config::GatewayConfig;

use crate::{
    methods::MethodRegistry,
    reload::{GatewayReloadHandler, spawn_config_watcher},
    services::GatewayServices,
    state::GatewayState,
    tools_http::tools_invoke_handler,
    ws::handle_connection,
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) gateway: Arc<GatewayState>,
    pub(crate) methods: Arc<MethodRegistry>,
}

/// Why a gateway instance stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// A config change requires a fresh instance.
    Restart,
    Shutdown,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    let app_state = AppState {
        gateway: state,
        methods,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/tools/invoke", post(tools_invoke_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Run one gateway instance until ctrl-c or a config change that needs a
/// restart. The caller decides whether to start a new instance.
pub async fn start_gateway(
    config: GatewayConfig,
    config_path: Option<PathBuf>,
    services: GatewayServices,
) -> anyhow::Result<ServerExit> {
    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let reload_mode = config.gateway.reload.mode;
    let state = GatewayState::new(config, services);
    let methods = Arc::new(MethodRegistry::new());
    let app = build_gateway_app(Arc::clone(&state), Arc::clone(&methods));

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("clawgate gateway v{}", state.version),
        format!(
            "protocol v{}, listening on {}",
            clawgate_protocol::PROTOCOL_VERSION,
            addr
        ),
        format!("{} methods registered", methods.method_names().len()),
        format!("auth: {:?}", state.auth.mode),
        match &config_path {
            Some(path) => format!("config: {} (reload: {reload_mode:?})", path.display()),
            None => "config: defaults".to_string(),
        },
    ];
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let restart = CancellationToken::new();
    let watcher = match config_path {
        Some(path) => {
            let handler = Arc::new(GatewayReloadHandler::new(
                Arc::clone(&state),
                restart.clone(),
            ));
            match spawn_config_watcher(Arc::clone(&state), path, handler) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "config watcher unavailable, reload disabled");
                    None
                },
            }
        },
        None => None,
    };

    let stop = restart.clone();
    let shutdown = state.shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            () = stop.cancelled() => {},
            () = shutdown.cancelled() => {},
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "ctrl-c handler failed");
                }
            },
        }
        // Ask open connections to wind down so serve can return.
        shutdown.cancel();
    })
    .await?;

    state.shutdown.cancel();
    for run in state.active_runs.read().await.values() {
        run.cancel.cancel();
    }
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }

    if restart.is_cancelled() {
        info!("gateway stopped for restart");
        Ok(ServerExit::Restart)
    } else {
        info!("gateway stopped");
        Ok(ServerExit::Shutdown)
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let count = state.gateway.client_count().await;
    let nodes = state.gateway.nodes.read().await.count();
    Json(serde_json::json!({
        "status": "ok",
        "version": state.gateway.version,
        "protocol": clawgate_protocol::PROTOCOL_VERSION,
        "connections": count,
        "nodes": nodes,
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(clawgate_protocol::MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_connection(socket, state.gateway, state.methods, addr))
}
