//! Inbound commands.
//!
//! A command name encodes `{scope}_{verb}`, e.g. `source_tv_set_volume` or
//! `set_master_volume`, and carries a text payload. [`Command::parse`] turns
//! the pair into a typed command; [`CommandRouter`] rate-limits and applies it
//! to the mixer.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::mixer::AudioMixer;
use crate::CommandError;

/// Source verbs, most specific suffix first.
const SOURCE_VERBS: [&str; 7] = [
    "set_default_volume",
    "set_volume",
    "set_mute",
    "mute",
    "play",
    "pause",
    "stop",
];

/// A parsed inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Set a source's volume, ramping if enabled.
    SetVolume {
        /// Source name.
        source: String,
        /// Requested volume; clamped by the mixer.
        volume: i64,
    },
    /// Mute or unmute a source.
    SetMute {
        /// Source name.
        source: String,
        /// Requested mute.
        muted: bool,
    },
    /// Toggle a source's mute.
    ToggleMute {
        /// Source name.
        source: String,
    },
    /// Resume playback.
    Play {
        /// Source name.
        source: String,
    },
    /// Pause playback.
    Pause {
        /// Source name.
        source: String,
    },
    /// Stop playback.
    Stop {
        /// Source name.
        source: String,
    },
    /// Set the default volume of a source, or of every source with `all`.
    SetDefaultVolume {
        /// Source name or `all`.
        scope: String,
        /// Requested volume; clamped by the mixer.
        volume: i64,
    },
    /// Set the master volume.
    SetMasterVolume(i64),
    /// Enable or disable reset-on-stop.
    SetResetOnStop(bool),
    /// Set the ramp speed in percent per second.
    SetSlewRate(i64),
    /// Set the television silence threshold (dB).
    SetSilenceThreshold(i64),
    /// Set the television silence duration (seconds).
    SetSilenceDuration(f32),
    /// Enable or disable television auto-mute.
    SetAutoMute(bool),
}

impl Command {
    /// Parses a command name and payload.
    ///
    /// # Example
    ///
    /// ```
    /// use media_bridge::Command;
    ///
    /// let command = Command::parse("source_tv_set_volume", "40").unwrap();
    /// assert_eq!(command, Command::SetVolume { source: "tv".into(), volume: 40 });
    /// ```
    pub fn parse(command: &str, payload: &str) -> Result<Self, CommandError> {
        let name = command.trim().to_ascii_lowercase();
        let invalid = || CommandError::InvalidPayload {
            command: command.to_string(),
            payload: payload.to_string(),
        };

        match name.as_str() {
            "set_master_volume" => return parse_int(payload).map(Self::SetMasterVolume).ok_or_else(invalid),
            "set_reset_on_stop" => return parse_bool(payload).map(Self::SetResetOnStop).ok_or_else(invalid),
            "set_slew_rate" => return parse_int(payload).map(Self::SetSlewRate).ok_or_else(invalid),
            "tv_set_silence_threshold" => {
                return parse_int(payload)
                    .map(Self::SetSilenceThreshold)
                    .ok_or_else(invalid)
            }
            "tv_set_silence_duration" => {
                return parse_float(payload)
                    .map(Self::SetSilenceDuration)
                    .ok_or_else(invalid)
            }
            "tv_set_auto_mute" => return parse_bool(payload).map(Self::SetAutoMute).ok_or_else(invalid),
            _ => {}
        }

        let unknown = || CommandError::Unknown {
            command: command.to_string(),
        };
        let rest = name.strip_prefix("source_").ok_or_else(unknown)?;
        let (source, verb) = SOURCE_VERBS
            .iter()
            .find_map(|verb| {
                rest.strip_suffix(verb)
                    .and_then(|s| s.strip_suffix('_'))
                    .filter(|s| !s.is_empty())
                    .map(|s| (s.to_string(), *verb))
            })
            .ok_or_else(unknown)?;

        Ok(match verb {
            "set_default_volume" => Self::SetDefaultVolume {
                scope: source,
                volume: parse_int(payload).ok_or_else(invalid)?,
            },
            "set_volume" => Self::SetVolume {
                source,
                volume: parse_int(payload).ok_or_else(invalid)?,
            },
            "set_mute" => Self::SetMute {
                source,
                muted: parse_bool(payload).ok_or_else(invalid)?,
            },
            "mute" => Self::ToggleMute { source },
            "play" => Self::Play { source },
            "pause" => Self::Pause { source },
            _ => Self::Stop { source },
        })
    }

    /// What the command targets: a source name, `master`, or `tv`.
    pub fn scope(&self) -> &str {
        match self {
            Self::SetVolume { source, .. }
            | Self::SetMute { source, .. }
            | Self::ToggleMute { source }
            | Self::Play { source }
            | Self::Pause { source }
            | Self::Stop { source } => source,
            Self::SetDefaultVolume { scope, .. } => scope,
            Self::SetMasterVolume(_) | Self::SetResetOnStop(_) | Self::SetSlewRate(_) => "master",
            Self::SetSilenceThreshold(_) | Self::SetSilenceDuration(_) | Self::SetAutoMute(_) => "tv",
        }
    }

    /// What the command does, independent of its target.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::SetVolume { .. } => "set_volume",
            Self::SetMute { .. } => "set_mute",
            Self::ToggleMute { .. } => "mute",
            Self::Play { .. } => "play",
            Self::Pause { .. } => "pause",
            Self::Stop { .. } => "stop",
            Self::SetDefaultVolume { .. } => "set_default_volume",
            Self::SetMasterVolume(_) => "set_master_volume",
            Self::SetResetOnStop(_) => "set_reset_on_stop",
            Self::SetSlewRate(_) => "set_slew_rate",
            Self::SetSilenceThreshold(_) => "set_silence_threshold",
            Self::SetSilenceDuration(_) => "set_silence_duration",
            Self::SetAutoMute(_) => "set_auto_mute",
        }
    }
}

fn parse_int(payload: &str) -> Option<i64> {
    let payload = payload.trim();
    payload.parse::<i64>().ok().or_else(|| {
        payload
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| v.round() as i64)
    })
}

fn parse_float(payload: &str) -> Option<f32> {
    payload.trim().parse::<f32>().ok().filter(|v| v.is_finite())
}

fn parse_bool(payload: &str) -> Option<bool> {
    match payload.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Outcome of a handled command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The command was applied.
    Applied,
    /// The command arrived inside the cooldown of an earlier one and was dropped.
    Dropped,
}

/// Applies inbound commands to the mixer, one cooldown per `(scope, verb)`.
///
/// A command arriving within the cooldown of the last accepted command for
/// the same pair is dropped, not queued.
pub struct CommandRouter {
    mixer: AudioMixer,
    cooldown: Duration,
    last: Mutex<HashMap<(String, &'static str), Instant>>,
}

impl CommandRouter {
    /// Creates a router over `mixer`.
    pub fn new(mixer: AudioMixer, cooldown: Duration) -> Self {
        Self {
            mixer,
            cooldown,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Parses and applies one command.
    ///
    /// Errors are logged here as well as returned; callers may ignore them.
    pub async fn handle(&self, command: &str, payload: &str) -> Result<Dispatch, CommandError> {
        let parsed = match Command::parse(command, payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(command, payload, error = %e, "rejected command");
                return Err(e);
            }
        };

        if !self.admit(&parsed) {
            debug!(command, payload, "command inside cooldown, dropped");
            return Ok(Dispatch::Dropped);
        }

        info!(command, payload, "applying command");
        match self.apply(parsed).await {
            Ok(()) => Ok(Dispatch::Applied),
            Err(e) => {
                warn!(command, payload, error = %e, "command failed");
                Err(e)
            }
        }
    }

    /// Records the command unless its pair is cooling down.
    fn admit(&self, command: &Command) -> bool {
        let key = (command.scope().to_string(), command.verb());
        let now = Instant::now();
        let mut last = self.last.lock();
        if let Some(at) = last.get(&key) {
            if now.duration_since(*at) < self.cooldown {
                return false;
            }
        }
        last.insert(key, now);
        true
    }

    async fn apply(&self, command: Command) -> Result<(), CommandError> {
        let mixer = &self.mixer;
        match command {
            Command::SetVolume { source, volume } => {
                mixer.set_source_volume(&source, volume, true).await?
            }
            Command::SetMute { source, muted } => mixer.set_source_mute(&source, muted).await?,
            Command::ToggleMute { source } => mixer.toggle_source_mute(&source).await?,
            Command::Play { source } => mixer.source_play(&source).await?,
            Command::Pause { source } => mixer.source_pause(&source).await?,
            Command::Stop { source } => mixer.source_stop(&source).await?,
            Command::SetDefaultVolume { scope, volume } => {
                mixer.set_default_volume(&scope, volume).await?;
            }
            Command::SetMasterVolume(volume) => mixer.set_master_volume(volume).await?,
            Command::SetResetOnStop(enabled) => mixer.set_reset_on_stop(enabled).await,
            Command::SetSlewRate(rate) => {
                mixer.set_slew_rate(rate).await;
            }
            Command::SetSilenceThreshold(db) => {
                mixer.set_tv_silence_threshold(db)?;
            }
            Command::SetSilenceDuration(seconds) => {
                mixer.set_tv_silence_duration(seconds)?;
            }
            Command::SetAutoMute(enabled) => mixer.set_tv_auto_mute(enabled).await?,
        }
        Ok(())
    }
}
