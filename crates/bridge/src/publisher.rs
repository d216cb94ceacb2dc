//! Outbound message-bus seam.

use async_trait::async_trait;

/// MQTT quality of service requested for pin-code commands.
pub const COMMAND_QOS: u8 = 1;

/// Publishes JSON payloads on the message bus.
///
/// Delivery guarantees belong to the implementation; the slot manager only
/// learns whether the hand-off succeeded.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        qos: u8,
    ) -> Result<(), PublishError>;
}

/// A failed publish hand-off.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    /// The bus client is not connected or not configured.
    #[error("Publisher unavailable: {0}")]
    Unavailable(String),

    /// The bus rejected or failed the publish.
    #[error("Publish failed: {0}")]
    Failed(String),
}
