use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait, clawgate_config::schema::ChannelConfig};

/// Core channel plugin trait. Each messaging platform implements this.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Channel identifier (e.g. "telegram", "discord").
    fn id(&self) -> &str;

    /// Human-readable channel name.
    fn name(&self) -> &str;

    /// Connect using the channel's config section.
    async fn start(&self, config: &ChannelConfig) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Get outbound adapter for sending messages.
    fn outbound(&self) -> Option<Arc<dyn ChannelOutbound>>;
}

/// Send messages to a channel.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    /// Deliver `text` to one platform target. Returns the platform message id
    /// when the platform reports one.
    async fn send_text(&self, account_id: Option<&str>, to: &str, text: &str) -> Result<Option<String>>;
}
