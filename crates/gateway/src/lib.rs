//! Gateway: WebSocket/HTTP control plane, method dispatch, node bridge and
//! config reload.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Resolve auth, bind address
//! 3. Start HTTP server (`/health`, `/ws`, `/tools/invoke`)
//! 4. Watch the config file and hot-apply or restart on change
//!
//! Domain logic (agent runs, channel delivery, tools) lives in other crates
//! and is reached through [`services::GatewayServices`] from the method
//! handlers registered in `methods.rs`.

pub mod auth;
pub mod broadcast;
pub mod chat;
pub mod methods;
pub mod nodes;
pub mod reload;
pub mod server;
pub mod services;
pub mod state;
pub mod tools_http;
pub mod voicewake;
pub mod ws;

pub use {
    server::{ServerExit, build_gateway_app, start_gateway},
    services::GatewayServices,
    state::GatewayState,
};
