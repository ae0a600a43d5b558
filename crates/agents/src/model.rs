use std::collections::BTreeSet;

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// One selectable model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Model identifier (e.g. "claude-sonnet-4-20250514", "gpt-4o").
    pub id: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
}

/// Source of the model list shown to clients.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}

/// Drop duplicate provider+id pairs (first wins) and sort by provider, then id.
pub fn normalize_catalog(models: Vec<ModelInfo>) -> Vec<ModelInfo> {
    let mut seen = BTreeSet::new();
    let mut out: Vec<ModelInfo> = models
        .into_iter()
        .filter(|m| !m.id.trim().is_empty())
        .filter(|m| seen.insert((m.provider.clone(), m.id.clone())))
        .collect();
    out.sort_by(|a, b| a.provider.cmp(&b.provider).then_with(|| a.id.cmp(&b.id)));
    out
}

/// Catalog backed by a fixed list, typically read from the `models` config
/// section.
#[derive(Debug, Clone, Default)]
pub struct StaticModelCatalog {
    models: Vec<ModelInfo>,
}

impl StaticModelCatalog {
    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self { models }
    }

    /// Read `models.providers.<provider>.models[]`. Entries may be bare id
    /// strings or `{id, name?, contextWindow?}` objects; anything else is
    /// skipped.
    pub fn from_config(models: &Value) -> Self {
        let mut out = Vec::new();
        let Some(providers) = models.get("providers").and_then(Value::as_object) else {
            return Self::default();
        };
        for (provider, section) in providers {
            let Some(list) = section.get("models").and_then(Value::as_array) else {
                continue;
            };
            for item in list {
                match item {
                    Value::String(id) => out.push(ModelInfo {
                        id: id.clone(),
                        provider: provider.clone(),
                        name: None,
                        context_window: None,
                    }),
                    Value::Object(obj) => {
                        let Some(id) = obj.get("id").and_then(Value::as_str) else {
                            continue;
                        };
                        out.push(ModelInfo {
                            id: id.to_string(),
                            provider: provider.clone(),
                            name: obj.get("name").and_then(Value::as_str).map(str::to_string),
                            context_window: obj.get("contextWindow").and_then(Value::as_u64),
                        });
                    },
                    _ => {},
                }
            }
        }
        Self { models: out }
    }
}

#[async_trait]
impl ModelCatalog for StaticModelCatalog {
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.models.clone())
    }
}
