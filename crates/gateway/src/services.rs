use std::sync::Arc;

use {
    clawgate_agents::{AgentRunner, EchoRunner, ModelCatalog, StaticModelCatalog, ToolRegistry},
    clawgate_channels::ChannelRegistry,
};

/// Collaborators the gateway delegates to.
///
/// [`GatewayServices::noop`] boots a gateway with an echo runner, an empty
/// model catalog, no tools and no channels; callers swap in real
/// implementations with the `with_*` builders.
#[derive(Clone)]
pub struct GatewayServices {
    pub runner: Arc<dyn AgentRunner>,
    pub models: Arc<dyn ModelCatalog>,
    pub tools: Arc<ToolRegistry>,
    pub channels: Arc<ChannelRegistry>,
}

impl GatewayServices {
    pub fn noop() -> Self {
        Self {
            runner: Arc::new(EchoRunner),
            models: Arc::new(StaticModelCatalog::default()),
            tools: Arc::new(ToolRegistry::new()),
            channels: Arc::new(ChannelRegistry::new()),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn AgentRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_models(mut self, models: Arc<dyn ModelCatalog>) -> Self {
        self.models = models;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn with_channels(mut self, channels: Arc<ChannelRegistry>) -> Self {
        self.channels = channels;
        self
    }
}
