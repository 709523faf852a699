//! Source notifications delivered to the mixer.
//!
//! Sources never talk to the publisher directly. Each one reports through a
//! [`SourceCallback`], invoked from the source's own monitoring task, and the
//! mixer decides what to forward and what policy to apply.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::source::SourceKind;
use crate::state::PlaybackState;

/// One observed attribute that differs from its last reported value.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    /// Playback state changed.
    Playback(PlaybackState),
    /// Volume changed (0-100).
    Volume(u8),
    /// Effective mute changed.
    Muted(bool),
    /// Linear level changed (0-100).
    Level(u8),
    /// Level in dB changed (-100..0).
    LevelDb(f32),
    /// Track title changed.
    Title(String),
    /// Track artist changed.
    Artist(String),
    /// Silence threshold setting changed (dB).
    SilenceThreshold(i32),
    /// Silence duration setting changed (seconds).
    SilenceDuration(f32),
    /// Auto-mute setting changed.
    AutoMute(bool),
}

impl StateChange {
    /// Attribute name used when publishing this change.
    pub fn attribute(&self) -> &'static str {
        match self {
            Self::Playback(_) => "state",
            Self::Volume(_) => "volume",
            Self::Muted(_) => "muted",
            Self::Level(_) => "level",
            Self::LevelDb(_) => "level_db",
            Self::Title(_) => "title",
            Self::Artist(_) => "artist",
            Self::SilenceThreshold(_) => "silence_threshold",
            Self::SilenceDuration(_) => "silence_duration",
            Self::AutoMute(_) => "auto_mute",
        }
    }

    /// Published value of this change.
    pub fn value(&self) -> Value {
        match self {
            Self::Playback(state) => json!(state.as_str()),
            Self::Volume(v) | Self::Level(v) => json!(v),
            Self::Muted(b) | Self::AutoMute(b) => json!(b),
            Self::LevelDb(db) | Self::SilenceDuration(db) => json!(db),
            Self::Title(s) | Self::Artist(s) => json!(s),
            Self::SilenceThreshold(db) => json!(db),
        }
    }
}

/// A notification from a source to the mixer.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// An attribute changed.
    ///
    /// Only emitted when the new value differs from the previous one.
    Changed {
        /// Source whose state changed.
        source: SourceKind,
        /// What changed.
        change: StateChange,
    },

    /// The volume was changed by something other than this process.
    ///
    /// For example a phone adjusting the cast volume. The source has already
    /// applied the value; the mixer must not write it back.
    ExternalVolume {
        /// Source whose volume changed.
        source: SourceKind,
        /// The new volume (0-100).
        volume: u8,
    },
}

impl SourceEvent {
    /// Source that emitted this event.
    pub fn source(&self) -> SourceKind {
        match self {
            Self::Changed { source, .. } | Self::ExternalVolume { source, .. } => *source,
        }
    }
}

/// Callback type for receiving source notifications.
///
/// Invoked from the source's monitoring task, never while the source holds
/// its state lock.
pub type SourceCallback = Arc<dyn Fn(SourceEvent) + Send + Sync>;

/// Creates a [`SourceCallback`] from a closure.
///
/// # Example
///
/// ```
/// use media_bridge::{source_callback, SourceEvent};
///
/// let callback = source_callback(|event: SourceEvent| {
///     println!("{:?}", event);
/// });
/// ```
pub fn source_callback<F>(f: F) -> SourceCallback
where
    F: Fn(SourceEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A callback that drops every event.
pub fn discard_events() -> SourceCallback {
    Arc::new(|_| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_state_change_attributes() {
        assert_eq!(StateChange::Playback(PlaybackState::Idle).attribute(), "state");
        assert_eq!(StateChange::LevelDb(-40.0).attribute(), "level_db");
        assert_eq!(StateChange::AutoMute(true).attribute(), "auto_mute");
    }

    #[test]
    fn test_state_change_values() {
        assert_eq!(
            StateChange::Playback(PlaybackState::Playing).value(),
            json!("playing")
        );
        assert_eq!(StateChange::Volume(15).value(), json!(15));
        assert_eq!(StateChange::Muted(true).value(), json!(true));
        assert_eq!(StateChange::Title("Song".into()).value(), json!("Song"));
    }

    #[test]
    fn test_source_event_source() {
        let event = SourceEvent::ExternalVolume {
            source: SourceKind::Cast,
            volume: 40,
        };
        assert_eq!(event.source(), SourceKind::Cast);
    }

    #[test]
    fn test_source_callback_helper() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = source_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(SourceEvent::ExternalVolume {
            source: SourceKind::Stream,
            volume: 0,
        });
        assert!(called.load(Ordering::SeqCst));
    }
}
