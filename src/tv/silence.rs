//! Silence detection with hysteresis and auto-mute bookkeeping.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::{
    SILENCE_DURATION_MAX, SILENCE_DURATION_MIN, SILENCE_THRESHOLD_MAX, SILENCE_THRESHOLD_MIN,
};
use crate::state::{PlaybackState, LEVEL_DB_FLOOR};

/// A mute write the controller must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteAction {
    /// Sustained silence began: mute the output.
    Engage,
    /// Sound resumed after an auto-mute: set the output mute to `muted`,
    /// the value the user last asked for.
    Restore {
        /// Mute state to restore.
        muted: bool,
    },
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceVerdict {
    /// Playback state to report.
    pub playback: PlaybackState,
    /// Mute write to perform, at most one per transition.
    pub action: Option<MuteAction>,
    /// Whether the output is currently muted because of silence.
    pub silence_muted: bool,
}

/// Tracks measured levels and decides when silence is sustained.
///
/// Input is silent when the level is at or below the threshold. Silence is
/// sustained once no window above the threshold has been seen for the
/// configured duration. Brief silence keeps reporting `Playing`.
///
/// Auto-mute engages once on the transition into sustained silence (unless
/// the user already muted) and is released once when sound resumes.
#[derive(Debug, Clone)]
pub struct SilenceMonitor {
    threshold_db: i32,
    duration: Duration,
    auto_mute: bool,
    current_db: f32,
    last_sound: Option<Instant>,
    silence_muted: bool,
}

impl SilenceMonitor {
    /// Creates a monitor that has not heard anything yet.
    pub fn new(threshold_db: i32, duration: Duration, auto_mute: bool) -> Self {
        Self {
            threshold_db: threshold_db.clamp(SILENCE_THRESHOLD_MIN, SILENCE_THRESHOLD_MAX),
            duration: clamp_duration(duration),
            auto_mute,
            current_db: LEVEL_DB_FLOOR,
            last_sound: None,
            silence_muted: false,
        }
    }

    /// Records one metering window's level.
    pub fn record_level(&mut self, level_db: f32, now: Instant) {
        self.current_db = level_db;
        if level_db > self.threshold_db as f32 {
            self.last_sound = Some(now);
        }
    }

    /// Decides the playback state and any mute write.
    ///
    /// `metered` is `false` while a bitstream pipeline runs; the presence of
    /// a compressed stream counts as sound.
    pub fn evaluate(&mut self, now: Instant, user_muted: bool, metered: bool) -> SilenceVerdict {
        let silent = metered && self.current_db <= self.threshold_db as f32;
        let sustained = match self.last_sound {
            Some(at) => now.saturating_duration_since(at) >= self.duration,
            None => true,
        };

        let (playback, action) = if !silent {
            let action = if self.silence_muted {
                self.silence_muted = false;
                Some(MuteAction::Restore { muted: user_muted })
            } else {
                None
            };
            (PlaybackState::Playing, action)
        } else if !sustained {
            (PlaybackState::Playing, None)
        } else {
            let action = if self.auto_mute && !self.silence_muted && !user_muted {
                self.silence_muted = true;
                Some(MuteAction::Engage)
            } else {
                None
            };
            (PlaybackState::Idle, action)
        };

        SilenceVerdict {
            playback,
            action,
            silence_muted: self.silence_muted,
        }
    }

    /// Drops the measured level to the floor, e.g. when the pipeline stops.
    ///
    /// The time sound was last heard is kept.
    pub fn reset_level(&mut self) {
        self.current_db = LEVEL_DB_FLOOR;
    }

    /// Last measured level.
    pub fn current_db(&self) -> f32 {
        self.current_db
    }

    /// Threshold in dB.
    pub fn threshold_db(&self) -> i32 {
        self.threshold_db
    }

    /// Sets the threshold, clamped to -80..-20 dB. Returns the stored value.
    pub fn set_threshold_db(&mut self, threshold_db: i32) -> i32 {
        self.threshold_db = threshold_db.clamp(SILENCE_THRESHOLD_MIN, SILENCE_THRESHOLD_MAX);
        self.threshold_db
    }

    /// Sustained-silence duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Sets the duration, clamped to 0.5..30 s. Returns the stored value.
    pub fn set_duration(&mut self, duration: Duration) -> Duration {
        self.duration = clamp_duration(duration);
        self.duration
    }

    /// Whether auto-mute is enabled.
    pub fn auto_mute(&self) -> bool {
        self.auto_mute
    }

    /// Enables or disables auto-mute.
    ///
    /// Disabling while silence-muted returns the restore the caller must
    /// perform.
    pub fn set_auto_mute(&mut self, enabled: bool, user_muted: bool) -> Option<MuteAction> {
        self.auto_mute = enabled;
        if !enabled && self.silence_muted {
            self.silence_muted = false;
            return Some(MuteAction::Restore { muted: user_muted });
        }
        None
    }

    /// Whether the output is muted because of silence.
    pub fn silence_muted(&self) -> bool {
        self.silence_muted
    }
}

fn clamp_duration(duration: Duration) -> Duration {
    Duration::from_secs_f32(
        duration
            .as_secs_f32()
            .clamp(SILENCE_DURATION_MIN, SILENCE_DURATION_MAX),
    )
}
