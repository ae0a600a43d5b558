use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, error::ConfigError, schema::GatewayConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "clawgate.toml",
    "clawgate.yaml",
    "clawgate.yml",
    "clawgate.json",
];

/// Environment variable naming an explicit config path.
pub const CONFIG_PATH_ENV: &str = "CLAWGATE_CONFIG";

/// Load, env-substitute, parse and validate the config at `path`.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    let config = parse_config(&raw, path)?;
    config.validate()?;
    Ok(config)
}

/// Load `path` if given (or discovered), falling back to defaults when no
/// config file exists. A file that exists but fails to load is an error.
pub fn load_or_default(path: Option<&Path>) -> Result<(GatewayConfig, Option<PathBuf>), ConfigError> {
    match discover_config_file(path) {
        Some(found) => {
            debug!(path = %found.display(), "loading config");
            let config = load_config(&found)?;
            Ok((config, Some(found)))
        },
        None => {
            if let Some(explicit) = path {
                warn!(path = %explicit.display(), "config file not found, using defaults");
            } else {
                debug!("no config file found, using defaults");
            }
            Ok((GatewayConfig::default(), None))
        },
    }
}

/// Find the config file.
///
/// Search order:
/// 1. `explicit` (must exist)
/// 2. `$CLAWGATE_CONFIG`
/// 3. `./clawgate.{toml,yaml,yml,json}` (project-local)
/// 4. `~/.config/clawgate/clawgate.{toml,yaml,yml,json}` (user-global)
pub fn discover_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV)
        && !env_path.trim().is_empty()
    {
        let p = PathBuf::from(env_path);
        return p.exists().then_some(p);
    }

    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns `~/.config/clawgate/` on all platforms.
pub fn config_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".config").join("clawgate"))
}

/// Returns the data directory: `~/.clawgate/` on all platforms.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".clawgate"))
        .unwrap_or_else(|| PathBuf::from(".clawgate"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> Result<GatewayConfig, ConfigError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => toml::from_str(raw).map_err(|e| ConfigError::parse(path, e)),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| ConfigError::parse(path, e)),
        "json" => serde_json::from_str(raw).map_err(|e| ConfigError::parse(path, e)),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clawgate.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
port = 19000

[gateway.reload]
mode = "hot"
debounceMs = 50

[hooks.gmail]
account = "me@example.com"
"#,
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.gateway.port, 19000);
        assert_eq!(cfg.gateway.reload.debounce_ms, 50);
        assert_eq!(cfg.hooks.gmail["account"], "me@example.com");
    }

    #[test]
    fn loads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("clawgate.yaml");
        std::fs::write(&yaml, "gateway:\n  bind: 0.0.0.0\n").unwrap();
        assert_eq!(load_config(&yaml).unwrap().gateway.bind, "0.0.0.0");

        let json = dir.path().join("clawgate.json");
        std::fs::write(&json, r#"{"logging": {"json": true}}"#).unwrap();
        assert!(load_config(&json).unwrap().logging.json);
    }

    #[test]
    fn unknown_top_level_key_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clawgate.json");
        std::fs::write(&path, r#"{"gatway": {}}"#).unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn validation_runs_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clawgate.json");
        std::fs::write(&path, r#"{"gateway": {"auth": {"mode": "token"}}}"#).unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clawgate.ini");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "ini"
        ));
    }

    #[test]
    fn missing_explicit_path_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, found) = load_or_default(Some(&dir.path().join("nope.toml"))).unwrap();
        assert!(found.is_none());
        assert_eq!(cfg, GatewayConfig::default());
    }
}
