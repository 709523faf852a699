//! The source contract and the streaming and cast sources.
//!
//! Every audio producer implements [`AudioSource`]. A source owns its
//! [`SourceState`](crate::SourceState), runs its own monitoring loops, and
//! reports changes through the [`SourceCallback`](crate::SourceCallback) it was
//! built with. The television source lives in [`crate::tv`] and additionally
//! implements [`TelevisionControl`].

mod cast;
mod kind;
mod metadata;
mod mock;
pub mod remote;
mod stream;
pub(crate) mod worker;

pub use cast::CastSource;
pub use kind::SourceKind;
pub use metadata::{MetadataItem, MetadataParser};
pub use mock::MockSource;
pub use stream::StreamSource;

use async_trait::async_trait;

use crate::state::{PlaybackState, SourceState};
use crate::SourceError;

/// Operations every source exposes.
///
/// Control calls return `Ok(())` when the change was applied and a
/// [`SourceError`] otherwise. Transport controls default to
/// [`SourceError::Unsupported`].
///
/// # Implementation Notes
///
/// - Accessors read the source's state through its own lock and never block
/// - `set_volume` and `set_muted` talk to the output path and may be slow
/// - A volume change made by `set_volume` must never be reported as an
///   external change
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Which source this is.
    fn kind(&self) -> SourceKind;

    /// Returns a copy of the current state.
    fn state(&self) -> SourceState;

    /// Starts the monitoring loops.
    async fn start(&self) -> Result<(), SourceError>;

    /// Stops the monitoring loops and releases owned processes.
    async fn stop(&self);

    /// Returns `true` while playing.
    fn is_active(&self) -> bool {
        self.state().playback == PlaybackState::Playing
    }

    /// Current volume (0-100).
    fn volume(&self) -> u8 {
        self.state().volume
    }

    /// Sets the volume (0-100).
    async fn set_volume(&self, volume: u8) -> Result<(), SourceError>;

    /// Current effective mute.
    fn muted(&self) -> bool {
        self.state().muted
    }

    /// Mutes or unmutes.
    async fn set_muted(&self, muted: bool) -> Result<(), SourceError>;

    /// Negates the current mute.
    async fn toggle_mute(&self) -> Result<(), SourceError> {
        self.set_muted(!self.muted()).await
    }

    /// Current linear level (0-100).
    fn level(&self) -> u8 {
        self.state().level
    }

    /// Resumes playback.
    async fn play(&self) -> Result<(), SourceError> {
        Err(SourceError::unsupported("play"))
    }

    /// Pauses playback.
    async fn pause(&self) -> Result<(), SourceError> {
        Err(SourceError::unsupported("pause"))
    }

    /// Stops playback.
    async fn stop_playback(&self) -> Result<(), SourceError> {
        Err(SourceError::unsupported("stop"))
    }

    /// Returns the television capabilities, if this source has them.
    fn television(&self) -> Option<&dyn TelevisionControl> {
        None
    }
}

/// Capabilities only the television source provides.
///
/// Reached through [`AudioSource::television`].
#[async_trait]
pub trait TelevisionControl: Send + Sync {
    /// Level at or below which input counts as silent (dB).
    fn silence_threshold(&self) -> i32;

    /// Sets the silence threshold, clamped to -80..-20 dB. Returns the stored value.
    fn set_silence_threshold(&self, db: i32) -> i32;

    /// How long silence must last before the source goes idle (seconds).
    fn silence_duration(&self) -> f32;

    /// Sets the silence duration, clamped to 0.5..30 s. Returns the stored value.
    fn set_silence_duration(&self, seconds: f32) -> f32;

    /// Whether sustained silence mutes the output.
    fn auto_mute(&self) -> bool;

    /// Enables or disables auto-mute.
    ///
    /// Disabling while silence-muted restores the user's mute immediately.
    async fn set_auto_mute(&self, enabled: bool) -> Result<(), SourceError>;

    /// Last measured level (dB).
    fn level_db(&self) -> f32;

    /// Last reported TV power.
    fn tv_power(&self) -> bool;

    /// Reports TV power. Enables the pipeline on, stops it on off.
    async fn set_tv_power(&self, on: bool);
}

/// Coarse level for sources that do not meter samples.
pub(crate) fn approximate_level(playback: PlaybackState, muted: bool) -> u8 {
    if playback == PlaybackState::Playing && !muted {
        50
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_audio_source_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<Arc<dyn AudioSource>>();
    }

    #[test]
    fn test_approximate_level() {
        assert_eq!(approximate_level(PlaybackState::Playing, false), 50);
        assert_eq!(approximate_level(PlaybackState::Playing, true), 0);
        assert_eq!(approximate_level(PlaybackState::Paused, false), 0);
    }

    #[tokio::test]
    async fn test_default_transport_is_unsupported() {
        let source = MockSource::new(SourceKind::Cast);
        let err = source.play().await.unwrap_err();
        assert!(matches!(err, SourceError::Unsupported { operation: "play" }));
        assert!(source.television().is_none());
    }
}
