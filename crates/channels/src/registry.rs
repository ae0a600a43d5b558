use std::{collections::HashMap, sync::Arc};

use {
    anyhow::Result,
    clawgate_config::schema::ChannelConfig,
    tokio::sync::RwLock,
    tracing::{info, warn},
};

use crate::plugin::{ChannelOutbound, ChannelPlugin};

/// Why an outbound send did not go through.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("channel \"{0}\" has no outbound adapter")]
    NoOutbound(String),
    #[error("delivery via \"{channel}\" failed: {source}")]
    Delivery {
        channel: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Registered channel plugins, keyed by channel id.
#[derive(Default)]
pub struct ChannelRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn ChannelPlugin>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, plugin: Arc<dyn ChannelPlugin>) {
        let id = plugin.id().to_string();
        info!(channel = %id, name = plugin.name(), "channel registered");
        self.plugins.write().await.insert(id, plugin);
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn outbound(&self, channel: &str) -> Option<Arc<dyn ChannelOutbound>> {
        self.plugins.read().await.get(channel)?.outbound()
    }

    /// Deliver text through `channel`'s outbound adapter.
    pub async fn send_text(
        &self,
        channel: &str,
        account_id: Option<&str>,
        to: &str,
        text: &str,
    ) -> Result<Option<String>, SendError> {
        let outbound = self
            .outbound(channel)
            .await
            .ok_or_else(|| SendError::NoOutbound(channel.to_string()))?;
        outbound
            .send_text(account_id, to, text)
            .await
            .map_err(|source| SendError::Delivery {
                channel: channel.to_string(),
                source,
            })
    }

    /// Stop a channel and start it again with `config`. A disabled or missing
    /// config section leaves the channel stopped. Unregistered ids are ignored.
    pub async fn restart(&self, channel: &str, config: Option<&ChannelConfig>) -> Result<()> {
        let Some(plugin) = self.plugins.read().await.get(channel).cloned() else {
            warn!(channel, "restart requested for unregistered channel");
            return Ok(());
        };

        if let Err(e) = plugin.stop().await {
            warn!(channel, error = %e, "channel stop failed");
        }
        match config.filter(|c| c.enabled) {
            Some(cfg) => {
                plugin.start(cfg).await?;
                info!(channel, "channel restarted");
            },
            None => info!(channel, "channel stopped (disabled or unconfigured)"),
        }
        Ok(())
    }
}
