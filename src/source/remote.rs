//! Remote playback control for the streaming client.
//!
//! The streaming client exposes an MPRIS player. [`Playerctl`] talks to it
//! through the `playerctl` CLI; tests substitute their own [`PlaybackRemote`].

use std::time::Duration;

use async_trait::async_trait;

use crate::exec;
use crate::state::PlaybackState;
use crate::ExecError;

const PLAYERCTL: &str = "playerctl";

/// What the remote player reports.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteStatus {
    /// Playback state.
    pub playback: PlaybackState,
    /// Player volume (0-100), if the player exposes one.
    pub volume: Option<u8>,
    /// Track title.
    pub title: String,
    /// Track artists, joined with `", "`.
    pub artist: String,
}

/// Transport actions a remote player accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Resume.
    Play,
    /// Pause.
    Pause,
    /// Stop.
    Stop,
}

impl Transport {
    fn as_arg(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
        }
    }
}

/// A remotely controllable player.
#[async_trait]
pub trait PlaybackRemote: Send + Sync {
    /// Returns `true` if the control tool is installed.
    fn is_available(&self) -> bool;

    /// Returns the player's status, or `None` when no player is running.
    async fn status(&self) -> Result<Option<RemoteStatus>, ExecError>;

    /// Sets the player's volume (0-100).
    async fn set_volume(&self, volume: u8) -> Result<(), ExecError>;

    /// Sends a transport action.
    async fn send(&self, action: Transport) -> Result<(), ExecError>;
}

/// [`PlaybackRemote`] over the `playerctl` CLI.
#[derive(Debug, Clone)]
pub struct Playerctl {
    player: String,
    timeout: Duration,
}

impl Playerctl {
    /// Controls the MPRIS player named `player`.
    pub fn new(player: impl Into<String>, timeout: Duration) -> Self {
        Self {
            player: player.into(),
            timeout,
        }
    }

    async fn playerctl(&self, args: &[&str]) -> Result<String, ExecError> {
        let player = format!("--player={}", self.player);
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(player.as_str());
        full.extend_from_slice(args);
        exec::run(PLAYERCTL, &full, self.timeout).await
    }
}

#[async_trait]
impl PlaybackRemote for Playerctl {
    fn is_available(&self) -> bool {
        exec::tool_available(PLAYERCTL)
    }

    async fn status(&self) -> Result<Option<RemoteStatus>, ExecError> {
        let status = match self.playerctl(&["status"]).await {
            Ok(status) => status,
            // playerctl exits non-zero with "No players found" when the player is gone
            Err(ExecError::Failed { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let volume = self
            .playerctl(&["volume"])
            .await
            .ok()
            .and_then(|v| parse_volume(&v));
        let metadata = self
            .playerctl(&["metadata", "--format", "{{title}}\t{{artist}}"])
            .await
            .unwrap_or_default();
        let (title, artist) = metadata.split_once('\t').unwrap_or((metadata.as_str(), ""));

        Ok(Some(RemoteStatus {
            playback: parse_status(&status),
            volume,
            title: title.trim().to_string(),
            artist: artist.trim().to_string(),
        }))
    }

    async fn set_volume(&self, volume: u8) -> Result<(), ExecError> {
        let level = format!("{:.2}", f32::from(volume.min(100)) / 100.0);
        self.playerctl(&["volume", &level]).await.map(|_| ())
    }

    async fn send(&self, action: Transport) -> Result<(), ExecError> {
        self.playerctl(&[action.as_arg()]).await.map(|_| ())
    }
}

/// Maps an MPRIS `PlaybackStatus` string.
pub fn parse_status(status: &str) -> PlaybackState {
    match status.trim() {
        "Playing" => PlaybackState::Playing,
        "Paused" => PlaybackState::Paused,
        _ => PlaybackState::Idle,
    }
}

/// Maps an MPRIS volume (0.0-1.0) to percent.
pub fn parse_volume(volume: &str) -> Option<u8> {
    let value: f32 = volume.trim().parse().ok()?;
    Some((value * 100.0).round().clamp(0.0, 100.0) as u8)
}
