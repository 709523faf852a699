//! Per-source state snapshot and its owning cell.

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::event::{SourceCallback, SourceEvent, StateChange};
use crate::source::SourceKind;

/// Floor reported for `level_db` when nothing has been measured.
pub const LEVEL_DB_FLOOR: f32 = -100.0;

/// Playback state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum PlaybackState {
    /// Nothing is playing.
    #[default]
    Idle,
    /// Audio is flowing.
    Playing,
    /// Playback is paused (stream present but corked).
    Paused,
}

impl PlaybackState {
    /// Returns the published name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Playing => "playing",
            Self::Paused => "paused",
        }
    }

    /// Returns `true` for [`PlaybackState::Playing`].
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Playing)
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical state snapshot of one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceState {
    /// Which source this is.
    pub kind: SourceKind,
    /// Current playback state.
    pub playback: PlaybackState,
    /// Volume, 0-100.
    pub volume: u8,
    /// Effective mute.
    pub muted: bool,
    /// Linear loudness, 0-100.
    pub level: u8,
    /// Loudness in dB, -100..0.
    pub level_db: f32,
    /// Track title, empty when unknown.
    pub title: String,
    /// Track artist, empty when unknown.
    pub artist: String,
    /// When any field last changed.
    pub last_update: Instant,
}

impl SourceState {
    /// Creates the initial state for a source.
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            playback: PlaybackState::Idle,
            volume: 100,
            muted: false,
            level: 0,
            level_db: LEVEL_DB_FLOOR,
            title: String::new(),
            artist: String::new(),
            last_update: Instant::now(),
        }
    }

    /// Returns `true` if the source is playing.
    pub fn is_active(&self) -> bool {
        self.playback.is_active()
    }
}

/// A set of observed values to merge into a [`SourceState`].
///
/// Fields left as `None` are not touched.
///
/// # Example
///
/// ```
/// use media_bridge::{PlaybackState, StatePatch};
///
/// let patch = StatePatch::new()
///     .playback(PlaybackState::Playing)
///     .volume(40)
///     .muted(false);
/// assert!(!patch.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    playback: Option<PlaybackState>,
    volume: Option<u8>,
    muted: Option<bool>,
    level: Option<u8>,
    level_db: Option<f32>,
    title: Option<String>,
    artist: Option<String>,
}

impl StatePatch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the playback state.
    #[must_use]
    pub fn playback(mut self, playback: PlaybackState) -> Self {
        self.playback = Some(playback);
        self
    }

    /// Sets the volume, clamped to 0-100.
    #[must_use]
    pub fn volume(mut self, volume: u8) -> Self {
        self.volume = Some(volume.min(100));
        self
    }

    /// Sets the mute flag.
    #[must_use]
    pub fn muted(mut self, muted: bool) -> Self {
        self.muted = Some(muted);
        self
    }

    /// Sets the linear level, clamped to 0-100.
    #[must_use]
    pub fn level(mut self, level: u8) -> Self {
        self.level = Some(level.min(100));
        self
    }

    /// Sets the level in dB, clamped to -100..0.
    #[must_use]
    pub fn level_db(mut self, level_db: f32) -> Self {
        self.level_db = Some(level_db.clamp(LEVEL_DB_FLOOR, 0.0));
        self
    }

    /// Sets the title.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Sets the artist.
    #[must_use]
    pub fn artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    /// Returns `true` if no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merges into `state`, returning the changes in field order.
    fn merge_into(self, state: &mut SourceState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if let Some(v) = self.playback.filter(|v| *v != state.playback) {
            state.playback = v;
            changes.push(StateChange::Playback(v));
        }
        if let Some(v) = self.volume.filter(|v| *v != state.volume) {
            state.volume = v;
            changes.push(StateChange::Volume(v));
        }
        if let Some(v) = self.muted.filter(|v| *v != state.muted) {
            state.muted = v;
            changes.push(StateChange::Muted(v));
        }
        if let Some(v) = self.level.filter(|v| *v != state.level) {
            state.level = v;
            changes.push(StateChange::Level(v));
        }
        if let Some(v) = self.level_db.filter(|v| *v != state.level_db) {
            state.level_db = v;
            changes.push(StateChange::LevelDb(v));
        }
        if let Some(v) = self.title.filter(|v| *v != state.title) {
            state.title.clone_from(&v);
            changes.push(StateChange::Title(v));
        }
        if let Some(v) = self.artist.filter(|v| *v != state.artist) {
            state.artist.clone_from(&v);
            changes.push(StateChange::Artist(v));
        }

        if !changes.is_empty() {
            state.last_update = Instant::now();
        }
        changes
    }
}

/// Owner of one source's [`SourceState`].
///
/// The snapshot lives behind a single mutex. Every read takes and releases it;
/// every write goes through [`apply`](Self::apply), which notifies only the
/// attributes whose value actually changed, after the lock is released.
pub(crate) struct StateCell {
    kind: SourceKind,
    state: Mutex<SourceState>,
    callback: SourceCallback,
}

impl StateCell {
    pub fn new(kind: SourceKind, callback: SourceCallback) -> Self {
        Self {
            kind,
            state: Mutex::new(SourceState::new(kind)),
            callback,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn snapshot(&self) -> SourceState {
        self.state.lock().clone()
    }

    pub fn playback(&self) -> PlaybackState {
        self.state.lock().playback
    }

    pub fn volume(&self) -> u8 {
        self.state.lock().volume
    }

    pub fn muted(&self) -> bool {
        self.state.lock().muted
    }

    pub fn level(&self) -> u8 {
        self.state.lock().level
    }

    pub fn level_db(&self) -> f32 {
        self.state.lock().level_db
    }

    /// Merges `patch` and notifies each changed attribute.
    ///
    /// Returns the number of notifications sent.
    pub fn apply(&self, patch: StatePatch) -> usize {
        let changes = {
            let mut state = self.state.lock();
            patch.merge_into(&mut state)
        };

        let count = changes.len();
        for change in changes {
            (self.callback)(SourceEvent::Changed {
                source: self.kind,
                change,
            });
        }
        count
    }

    /// Sends an event that is not a plain attribute change.
    pub fn notify(&self, event: SourceEvent) {
        (self.callback)(event);
    }

    /// Sends a setting notification that bypasses de-duplication.
    pub fn notify_change(&self, change: StateChange) {
        (self.callback)(SourceEvent::Changed {
            source: self.kind,
            change,
        });
    }
}
