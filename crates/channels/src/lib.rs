//! Channel plugin system.
//!
//! Each channel (Telegram, Discord, Slack, WhatsApp, etc.) implements the
//! [`ChannelPlugin`] trait; the gateway uses it to deliver outbound text and
//! to restart a channel when its config section changes.

pub mod plugin;
pub mod registry;

pub use {
    plugin::{ChannelOutbound, ChannelPlugin},
    registry::{ChannelRegistry, SendError},
};
