//! Publisher that writes updates to the log.

use async_trait::async_trait;
use tracing::info;

use super::{Publisher, StateUpdate};
use crate::PublishError;

/// A publisher that emits one `info` record per update.
///
/// Used by the binary when no message bus is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl LogPublisher {
    /// Creates a log publisher.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Publisher for LogPublisher {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, update: &StateUpdate) -> Result<(), PublishError> {
        info!(topic = %update.topic(), value = %update.payload(), "state");
        Ok(())
    }
}
