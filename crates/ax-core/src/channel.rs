//! The channel contract.
//!
//! A channel adapter feeds inbound messages to the supervisor and takes
//! responses back. The core specifies only this seam; network details of
//! specific channels live outside it.

use async_trait::async_trait;

use ax_router::SessionAddress;

/// One message arriving from a channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub address: SessionAddress,
    pub sender: String,
    pub content: String,
}

/// A connected channel adapter.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Registry name, matching the queue's `channel` column.
    fn name(&self) -> &str;

    /// The next inbound message; `None` when the channel is closed.
    async fn next_message(&self) -> Option<ChannelMessage>;

    /// Deliver a response for a session back to the channel.
    async fn deliver(&self, session_id: &str, content: &str);
}
