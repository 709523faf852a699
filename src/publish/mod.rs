//! Outward state publication.
//!
//! A [`Publisher`] receives every [`StateUpdate`] the mixer decides to make
//! visible. The crate provides two built-in publishers:
//!
//! - [`ChannelPublisher`]: Sends updates to a tokio mpsc channel
//! - [`LogPublisher`]: Writes each update as a tracing record
//!
//! Implement the trait to bridge updates onto a message bus.

mod channel;
mod log;

pub use channel::ChannelPublisher;
pub use log::LogPublisher;

use async_trait::async_trait;
use serde_json::Value;

use crate::source::SourceKind;
use crate::PublishError;

/// What a published value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// A single source, published as `source/{name}/{attribute}`.
    Source(SourceKind),
    /// Mixer-wide settings, published as `master/{attribute}`.
    Master,
    /// Aggregate over sources, published as `sources/{attribute}`.
    Sources,
    /// A setting applied to every source at once, published as `source/all/{attribute}`.
    All,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(kind) => write!(f, "source/{kind}"),
            Self::Master => f.write_str("master"),
            Self::Sources => f.write_str("sources"),
            Self::All => f.write_str("source/all"),
        }
    }
}

/// One published `(scope, attribute, value)` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    /// Owner of the value.
    pub scope: Scope,
    /// Attribute name, e.g. `volume`.
    pub attribute: String,
    /// The value.
    pub value: Value,
}

impl StateUpdate {
    /// Creates an update.
    pub fn new(scope: Scope, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            scope,
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Returns the topic suffix, e.g. `source/tv/volume`.
    pub fn topic(&self) -> String {
        format!("{}/{}", self.scope, self.attribute)
    }

    /// Returns the payload as text: strings unquoted, everything else as JSON.
    pub fn payload(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A destination for state updates.
///
/// # Implementation Notes
///
/// - Methods take `&self`; use interior mutability if needed
/// - `publish` is called from the mixer's event pump and from ramp tasks, so
///   it may run concurrently with itself
/// - Errors are logged by the caller and never retried
///
/// # Example
///
/// ```
/// use media_bridge::{Publisher, PublishError, StateUpdate};
/// use async_trait::async_trait;
///
/// struct PrintPublisher;
///
/// #[async_trait]
/// impl Publisher for PrintPublisher {
///     fn name(&self) -> &str {
///         "print"
///     }
///
///     async fn publish(&self, update: &StateUpdate) -> Result<(), PublishError> {
///         println!("{} = {}", update.topic(), update.payload());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Publishes one update.
    async fn publish(&self, update: &StateUpdate) -> Result<(), PublishError>;
}
