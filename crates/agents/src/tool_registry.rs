use std::{collections::HashMap, sync::Arc};

use {anyhow::Result, async_trait::async_trait, serde_json::Value};

/// Agent-callable tool.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    /// Run one call. `action` selects a sub-operation for multi-action tools.
    async fn execute(&self, action: Option<&str>, params: Value) -> Result<Value>;
}

/// Registry of available tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn list_schemas(&self) -> Vec<Value> {
        self.names()
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.parameters_schema(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl AgentTool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Uppercase text"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        async fn execute(&self, _action: Option<&str>, params: Value) -> Result<Value> {
            let text = params["text"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("missing text"))?;
            Ok(Value::String(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn register_and_execute() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Upper));
        assert_eq!(reg.names(), vec!["upper"]);
        assert_eq!(reg.list_schemas()[0]["name"], "upper");

        let tool = reg.get("upper").unwrap();
        let out = tool
            .execute(None, serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, "HI");
        assert!(tool.execute(None, serde_json::json!({})).await.is_err());
        assert!(reg.get("nope").is_none());
    }
}
