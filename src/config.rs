//! Configuration types for the bridge.
//!
//! Every section has a `Default` matching the shipped behaviour, and every
//! field may be omitted from the JSON file. Durations are written in
//! milliseconds (`*_ms`) except the silence duration, which is in seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::source::SourceKind;
use crate::ConfigError;

/// Files searched, in order, when no path is given.
const SEARCH_PATHS: [&str; 2] = ["/etc/media-bridge/config.json", "config.json"];

/// Top-level configuration.
///
/// # Example
///
/// ```
/// use media_bridge::BridgeConfig;
///
/// let config: BridgeConfig = serde_json::from_str(
///     r#"{ "mixer": { "slew_rate": 0 }, "tv": { "capture_device": "hw:1,0" } }"#,
/// ).unwrap();
/// assert_eq!(config.mixer.slew_rate, 0);
/// assert_eq!(config.mixer.master_volume, 50);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Mixer policy.
    pub mixer: MixerConfig,
    /// Shared output path.
    pub output: OutputConfig,
    /// Streaming client source.
    pub stream: StreamConfig,
    /// Cast receiver source.
    pub cast: CastConfig,
    /// Television source.
    pub tv: TvConfig,
    /// Inbound command handling.
    pub commands: CommandConfig,
    /// Logging.
    pub log: LogConfig,
}

impl BridgeConfig {
    /// Loads configuration from `path`, or from the search paths.
    ///
    /// A missing file falls back to defaults; a malformed one is an error.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            None => match Self::search_paths().into_iter().find(|p| p.exists()) {
                Some(found) => Self::from_file(&found)?,
                None => {
                    debug!("no config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(SEARCH_PATHS[0])];
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".config/media-bridge/config.json"));
        }
        paths.push(PathBuf::from(SEARCH_PATHS[1]));
        paths
    }

    /// Applies `MEDIA_BRIDGE_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("MEDIA_BRIDGE_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(device) = lookup("MEDIA_BRIDGE_TV_DEVICE") {
            self.tv.capture_device = device;
        }
        if let Some(sink) = lookup("MEDIA_BRIDGE_OUTPUT_SINK") {
            self.output.sink = Some(sink);
        }
        if let Some(rate) = lookup("MEDIA_BRIDGE_SLEW_RATE") {
            match rate.parse() {
                Ok(rate) => self.mixer.slew_rate = rate,
                Err(_) => warn!(value = %rate, "ignoring invalid MEDIA_BRIDGE_SLEW_RATE"),
            }
        }
    }

    /// Rejects values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mixer.master_volume > 100 {
            return Err(ConfigError::invalid("mixer.master_volume", "must be 0-100"));
        }
        for kind in SourceKind::ALL {
            if self.mixer.default_volumes.get(kind) > 100 {
                return Err(ConfigError::invalid(
                    "mixer.default_volumes",
                    format!("{kind} must be 0-100"),
                ));
            }
        }
        if self.mixer.slew_tick.is_zero() {
            return Err(ConfigError::invalid("mixer.slew_tick_ms", "must be non-zero"));
        }
        if self.stream.poll_interval.is_zero()
            || self.cast.poll_interval.is_zero()
            || self.tv.poll_interval.is_zero()
        {
            return Err(ConfigError::invalid("poll_interval_ms", "must be non-zero"));
        }
        if !(SILENCE_THRESHOLD_MIN..=SILENCE_THRESHOLD_MAX).contains(&self.tv.silence_threshold_db) {
            return Err(ConfigError::invalid(
                "tv.silence_threshold_db",
                format!("must be {SILENCE_THRESHOLD_MIN}..{SILENCE_THRESHOLD_MAX}"),
            ));
        }
        let secs = self.tv.silence_duration.as_secs_f32();
        if !(SILENCE_DURATION_MIN..=SILENCE_DURATION_MAX).contains(&secs) {
            return Err(ConfigError::invalid(
                "tv.silence_duration_secs",
                format!("must be {SILENCE_DURATION_MIN}..{SILENCE_DURATION_MAX}"),
            ));
        }
        if self.tv.meter_window.is_zero() || self.tv.channels == 0 || self.tv.sample_rate == 0 {
            return Err(ConfigError::invalid("tv.meter_window_ms", "meter format must be non-empty"));
        }
        Ok(())
    }
}

/// Lowest accepted silence threshold (dB).
pub const SILENCE_THRESHOLD_MIN: i32 = -80;
/// Highest accepted silence threshold (dB).
pub const SILENCE_THRESHOLD_MAX: i32 = -20;
/// Shortest accepted silence duration (seconds).
pub const SILENCE_DURATION_MIN: f32 = 0.5;
/// Longest accepted silence duration (seconds).
pub const SILENCE_DURATION_MAX: f32 = 30.0;

/// Mixer policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Volume applied to the output device at startup.
    ///
    /// Default: 50
    pub master_volume: u8,

    /// Volume each source is set to when it starts playing.
    ///
    /// Default: 15 for every source
    pub default_volumes: DefaultVolumes,

    /// Reset a source to its default volume when it stops playing.
    ///
    /// Default: true
    pub reset_on_stop: bool,

    /// Ramp speed in percent per second; 0 applies volume changes instantly.
    ///
    /// Default: 25
    pub slew_rate: u32,

    /// Interval between ramp steps.
    ///
    /// Default: 50ms
    #[serde(rename = "slew_tick_ms", with = "duration_ms")]
    pub slew_tick: Duration,

    /// Wait after a source starts playing before applying its default
    /// volume, so its output stream exists.
    ///
    /// Default: 300ms
    #[serde(rename = "settle_delay_ms", with = "duration_ms")]
    pub settle_delay: Duration,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            master_volume: 50,
            default_volumes: DefaultVolumes::default(),
            reset_on_stop: true,
            slew_rate: 25,
            slew_tick: Duration::from_millis(50),
            settle_delay: Duration::from_millis(300),
        }
    }
}

/// Default volume per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultVolumes {
    /// Streaming client. Default: 15
    pub stream: u8,
    /// Cast receiver. Default: 15
    pub cast: u8,
    /// Television. Default: 15
    pub tv: u8,
}

impl DefaultVolumes {
    /// Returns the default for `kind`.
    pub fn get(&self, kind: SourceKind) -> u8 {
        match kind {
            SourceKind::Stream => self.stream,
            SourceKind::Cast => self.cast,
            SourceKind::Tv => self.tv,
        }
    }

    /// Sets the default for `kind`, clamped to 0-100.
    pub fn set(&mut self, kind: SourceKind, volume: u8) {
        let volume = volume.min(100);
        match kind {
            SourceKind::Stream => self.stream = volume,
            SourceKind::Cast => self.cast = volume,
            SourceKind::Tv => self.tv = volume,
        }
    }
}

impl Default for DefaultVolumes {
    fn default() -> Self {
        Self {
            stream: 15,
            cast: 15,
            tv: 15,
        }
    }
}

/// Shared output path configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output device for the television pipeline. Discovered when unset.
    ///
    /// Default: None
    pub sink: Option<String>,

    /// Substrings that must all appear in a discovered output device name.
    ///
    /// Default: `["Scarlett", "analog-stereo"]`
    pub sink_match: Vec<String>,

    /// Deadline for each sound-server call.
    ///
    /// Default: 5s
    #[serde(rename = "command_timeout_ms", with = "duration_ms")]
    pub command_timeout: Duration,

    /// How long the television source waits for the sound server at startup.
    ///
    /// Default: 30s
    #[serde(rename = "ready_timeout_ms", with = "duration_ms")]
    pub ready_timeout: Duration,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sink: None,
            sink_match: vec!["Scarlett".to_string(), "analog-stereo".to_string()],
            command_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(30),
        }
    }
}

/// Streaming client source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// MPRIS player name.
    ///
    /// Default: `spotifyd`
    pub player: String,

    /// Binary names identifying the client's output stream.
    ///
    /// Default: `["spotifyd"]`
    pub sink_patterns: Vec<String>,

    /// Default: 1s
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            player: "spotifyd".to_string(),
            sink_patterns: vec!["spotifyd".to_string()],
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Cast receiver source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CastConfig {
    /// Receiver metadata FIFO.
    ///
    /// Default: `/tmp/shairport-sync-metadata`
    pub metadata_pipe: PathBuf,

    /// Binary names identifying the receiver's output stream.
    ///
    /// Default: `["shairport-sync", "shairport"]`
    pub sink_patterns: Vec<String>,

    /// Default: 1s
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,

    /// Longest single wait on the metadata pipe.
    ///
    /// Default: 1s
    #[serde(rename = "metadata_wait_ms", with = "duration_ms")]
    pub metadata_wait: Duration,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            metadata_pipe: PathBuf::from("/tmp/shairport-sync-metadata"),
            sink_patterns: vec!["shairport-sync".to_string(), "shairport".to_string()],
            poll_interval: Duration::from_secs(1),
            metadata_wait: Duration::from_secs(1),
        }
    }
}

/// Television source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TvConfig {
    /// Capture device carrying the TV's digital audio.
    ///
    /// Default: `hw:CARD=ClearClick,DEV=0`
    pub capture_device: String,

    /// Binary names identifying the pipeline's output stream.
    ///
    /// Default: `["gst-launch"]`
    pub sink_patterns: Vec<String>,

    /// Control loop interval.
    ///
    /// Default: 100ms
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,

    /// Level at or below which input is silent.
    ///
    /// Default: -50 dB
    pub silence_threshold_db: i32,

    /// How long silence must last before the source goes idle.
    ///
    /// Default: 3s
    #[serde(rename = "silence_duration_secs", with = "duration_secs")]
    pub silence_duration: Duration,

    /// Mute the output during sustained silence.
    ///
    /// Default: true
    pub auto_mute: bool,

    /// Minimum time between pipeline starts.
    ///
    /// Default: 2s
    #[serde(rename = "restart_cooldown_ms", with = "duration_ms")]
    pub restart_cooldown: Duration,

    /// How long a volume or mute write fences off polled values.
    ///
    /// Default: 500ms
    #[serde(rename = "write_debounce_ms", with = "duration_ms")]
    pub write_debounce: Duration,

    /// Audio captured for codec detection.
    ///
    /// Default: 1s
    #[serde(rename = "probe_window_ms", with = "duration_ms")]
    pub probe_window: Duration,

    /// Deadline for codec detection, after which PCM is assumed.
    ///
    /// Default: 2s
    #[serde(rename = "probe_timeout_ms", with = "duration_ms")]
    pub probe_timeout: Duration,

    /// Length of one metering window.
    ///
    /// Default: 50ms
    #[serde(rename = "meter_window_ms", with = "duration_ms")]
    pub meter_window: Duration,

    /// Capture sample rate.
    ///
    /// Default: 48000
    pub sample_rate: u32,

    /// Capture channel count.
    ///
    /// Default: 2
    pub channels: u16,

    /// Output latency compensation.
    ///
    /// Default: 120ms
    #[serde(rename = "output_delay_ms", with = "duration_ms")]
    pub output_delay: Duration,

    /// Time between SIGTERM and SIGKILL when stopping the pipeline.
    ///
    /// Default: 2s
    #[serde(rename = "termination_grace_ms", with = "duration_ms")]
    pub termination_grace: Duration,
}

impl TvConfig {
    /// Bytes in one metering window of S16LE samples.
    pub fn meter_window_bytes(&self) -> usize {
        self.meter_window_samples() * 2
    }

    /// Samples (across all channels) in one metering window.
    pub fn meter_window_samples(&self) -> usize {
        let frames = (f64::from(self.sample_rate) * self.meter_window.as_secs_f64()) as usize;
        frames.max(1) * usize::from(self.channels)
    }
}

impl Default for TvConfig {
    fn default() -> Self {
        Self {
            capture_device: "hw:CARD=ClearClick,DEV=0".to_string(),
            sink_patterns: vec!["gst-launch".to_string()],
            poll_interval: Duration::from_millis(100),
            silence_threshold_db: -50,
            silence_duration: Duration::from_secs(3),
            auto_mute: true,
            restart_cooldown: Duration::from_secs(2),
            write_debounce: Duration::from_millis(500),
            probe_window: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            meter_window: Duration::from_millis(50),
            sample_rate: 48_000,
            channels: 2,
            output_delay: Duration::from_millis(120),
            termination_grace: Duration::from_secs(2),
        }
    }
}

/// Inbound command configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Window after an accepted command during which the same
    /// `(scope, verb)` pair is dropped.
    ///
    /// Default: 200ms
    #[serde(rename = "cooldown_ms", with = "duration_ms")]
    pub cooldown: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(200),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    ///
    /// Default: `info`
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod duration_secs {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}
