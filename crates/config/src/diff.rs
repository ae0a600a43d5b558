//! Structural diff of two config snapshots.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::{error::ConfigError, schema::GatewayConfig};

/// Dotted paths at which `prev` and `next` diverge.
///
/// Objects recurse key by key over the union of both key sets. Arrays and
/// scalars are compared whole: a differing array is reported once at its own
/// path. Every path is reported at the shallowest point of divergence, so the
/// result is symmetric in its arguments. Sorted and deduplicated.
pub fn diff_config_paths(prev: &Value, next: &Value) -> Vec<String> {
    let mut paths = BTreeSet::new();
    collect(prev, next, "", &mut paths);
    paths.into_iter().collect()
}

/// Diff two typed configs through their canonical JSON form.
pub fn diff_configs(prev: &GatewayConfig, next: &GatewayConfig) -> Result<Vec<String>, ConfigError> {
    if std::ptr::eq(prev, next) {
        return Ok(Vec::new());
    }
    Ok(diff_config_paths(&prev.to_value()?, &next.to_value()?))
}

fn collect(prev: &Value, next: &Value, prefix: &str, out: &mut BTreeSet<String>) {
    if std::ptr::eq(prev, next) || prev == next {
        return;
    }

    match (prev, next) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let path = join(prefix, key);
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => collect(x, y, &path, out),
                    _ => {
                        out.insert(path);
                    },
                }
            }
        },
        _ => {
            out.insert(if prefix.is_empty() {
                "<root>".to_string()
            } else {
                prefix.to_string()
            });
        },
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}
