//! Gateway configuration: typed schema, file discovery/loading, structural
//! diffing, and hot-reload planning.
//!
//! Config files may be TOML, YAML or JSON (`clawgate.{toml,yaml,yml,json}`)
//! with `${ENV_VAR}` placeholders substituted before parsing.

pub mod diff;
pub mod env_subst;
pub mod error;
pub mod loader;
pub mod reload;
pub mod schema;

pub use {
    diff::{diff_config_paths, diff_configs},
    error::ConfigError,
    loader::{data_dir, discover_config_file, load_config, load_or_default},
    reload::{ReloadDecision, ReloadPlan, build_gateway_reload_plan, decide},
    schema::GatewayConfig,
};
