//! Tokio mpsc channel publisher.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Publisher, StateUpdate};
use crate::PublishError;

/// A publisher that sends updates to a tokio mpsc channel.
///
/// This is the way to hand state to a transport running in another task,
/// and the way tests observe what the mixer publishes.
///
/// # Example
///
/// ```
/// use media_bridge::{ChannelPublisher, StateUpdate};
/// use tokio::sync::mpsc;
///
/// let (tx, mut rx) = mpsc::channel::<StateUpdate>(64);
/// let publisher = ChannelPublisher::new(tx);
///
/// // Hand the publisher to the bridge builder...
/// // Then receive updates:
/// // while let Some(update) = rx.recv().await { ... }
/// ```
pub struct ChannelPublisher {
    name: String,
    sender: mpsc::Sender<StateUpdate>,
}

impl ChannelPublisher {
    /// Creates a new channel publisher with the given sender.
    ///
    /// A full channel applies backpressure to the mixer, so size it for
    /// bursts: a full-state publish sends a few dozen updates at once.
    pub fn new(sender: mpsc::Sender<StateUpdate>) -> Self {
        Self {
            name: "channel".to_string(),
            sender,
        }
    }

    /// Creates a new channel publisher with a custom name.
    pub fn with_name(name: impl Into<String>, sender: mpsc::Sender<StateUpdate>) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, update: &StateUpdate) -> Result<(), PublishError> {
        self.sender
            .send(update.clone())
            .await
            .map_err(|_| PublishError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::Scope;

    #[tokio::test]
    async fn test_channel_publisher_sends_updates() {
        let (tx, mut rx) = mpsc::channel::<StateUpdate>(10);
        let publisher = ChannelPublisher::new(tx);

        let update = StateUpdate::new(Scope::Master, "slew_rate", 25);
        publisher.publish(&update).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, update);
    }

    #[tokio::test]
    async fn test_channel_publisher_closed() {
        let (tx, rx) = mpsc::channel::<StateUpdate>(10);
        let publisher = ChannelPublisher::new(tx);
        drop(rx);

        let update = StateUpdate::new(Scope::Master, "volume", 1);
        let result = publisher.publish(&update).await;
        assert!(matches!(result, Err(PublishError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_channel_publisher_custom_name() {
        let (tx, _rx) = mpsc::channel::<StateUpdate>(10);
        let publisher = ChannelPublisher::with_name("mqtt", tx);
        assert_eq!(publisher.name(), "mqtt");
    }
}
