//! The shared physical output path.
//!
//! Every source plays into the same sound server. [`OutputControl`] is the
//! narrow view the core needs of it: find a source's playback stream ("sink
//! input"), change its volume or mute, set the master volume, and resolve the
//! output device identifier.
//!
//! - [`Pactl`]: drives PulseAudio or pipewire-pulse through the `pactl` CLI
//! - [`MockOutput`]: in-memory implementation for tests

mod mock;
mod pactl;

pub use mock::MockOutput;
pub use pactl::{parse_short_sinks, parse_sink_inputs, Pactl};

use async_trait::async_trait;

use crate::OutputError;

/// One playback stream on the sound server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SinkInput {
    /// Server-side stream index.
    pub id: String,
    /// Binary name of the owning process.
    pub binary: String,
    /// First channel's volume in percent, if reported.
    pub volume: Option<u8>,
    /// Whether the stream is muted.
    pub muted: bool,
    /// Whether the stream is corked (paused).
    pub corked: bool,
}

impl SinkInput {
    /// Returns `true` if this stream's binary contains `pattern` (case-insensitive).
    pub fn matches(&self, pattern: &str) -> bool {
        self.binary
            .to_ascii_lowercase()
            .contains(&pattern.to_ascii_lowercase())
    }
}

/// Control over the shared output path.
///
/// Implementations must be cheap to call from several monitoring loops at
/// once; each call is an independent request.
#[async_trait]
pub trait OutputControl: Send + Sync {
    /// Returns `true` once the sound server answers requests.
    async fn is_ready(&self) -> bool;

    /// Returns the first output device whose name contains every pattern.
    async fn find_sink(&self, patterns: &[String]) -> Result<Option<String>, OutputError>;

    /// Returns the first playback stream whose binary matches any pattern.
    async fn sink_input(&self, patterns: &[&str]) -> Result<Option<SinkInput>, OutputError>;

    /// Sets a playback stream's volume in percent.
    async fn set_sink_input_volume(&self, id: &str, volume: u8) -> Result<(), OutputError>;

    /// Mutes or unmutes a playback stream.
    async fn set_sink_input_mute(&self, id: &str, muted: bool) -> Result<(), OutputError>;

    /// Sets the default output device's volume in percent.
    async fn set_master_volume(&self, volume: u8) -> Result<(), OutputError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sink_input_matches_case_insensitive() {
        let input = SinkInput {
            id: "7".into(),
            binary: "Shairport-Sync".into(),
            ..Default::default()
        };
        assert!(input.matches("shairport"));
        assert!(!input.matches("spotifyd"));
    }

    #[test]
    fn test_output_control_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<Arc<dyn OutputControl>>();
    }
}
