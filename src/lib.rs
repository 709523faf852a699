//! # media-bridge
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Multi-source audio mixing for a living-room media bridge.
//!
//! `media-bridge` brings a streaming client, a wireless-cast receiver and a
//! television's digital audio input under one mixing model: per-source
//! volume and mute, default volumes applied when a source starts, volume
//! ramps, silence auto-mute for the television, and a unified state stream
//! for a home-automation bus.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use media_bridge::{BridgeConfig, ChannelPublisher, MediaBridge, StateUpdate};
//! use tokio::sync::mpsc;
//!
//! let (tx, mut rx) = mpsc::channel::<StateUpdate>(64);
//!
//! let session = MediaBridge::builder()
//!     .config(BridgeConfig::load(None)?)
//!     .publisher(ChannelPublisher::new(tx))
//!     .start()
//!     .await?;
//!
//! // Commands arrive as `{scope}_{verb}` plus a payload
//! session.handle_command("source_cast_set_volume", "30").await?;
//! session.set_tv_power(true).await?;
//!
//! while let Some(update) = rx.recv().await {
//!     println!("{} = {}", update.topic(), update.payload());
//! }
//!
//! session.stop().await;
//! ```
//!
//! ## Architecture
//!
//! - **Sources**: each runs its own monitoring loops and reports changes
//!   through a [`SourceCallback`]
//! - **Mixer**: drains source events in order, applies default-volume and
//!   ramp policy, and fans updates out to every [`Publisher`]
//! - **Commands**: [`CommandRouter`] parses inbound commands, drops repeats
//!   inside a cooldown, and calls the mixer
//!
//! Sound-server access goes through [`OutputControl`](output::OutputControl)
//! and the television's decode pipelines through
//! [`PipelineLauncher`](tv::PipelineLauncher), so both can be replaced in tests.

// unsafe_code lint is configured in Cargo.toml as "deny" so the pipeline
// module can signal process groups
#![warn(missing_docs)]
// Volume and level math converts between integer percentages and floats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod bridge;
mod command;
mod config;
mod error;
mod event;
mod exec;
mod mixer;
pub mod output;
mod publish;
pub mod source;
mod state;
pub mod tv;

pub use bridge::{MediaBridge, MediaBridgeBuilder, Session};
pub use command::{Command, CommandRouter, Dispatch};
pub use config::{
    BridgeConfig, CastConfig, CommandConfig, DefaultVolumes, LogConfig, MixerConfig,
    OutputConfig, StreamConfig, TvConfig, SILENCE_DURATION_MAX, SILENCE_DURATION_MIN,
    SILENCE_THRESHOLD_MAX, SILENCE_THRESHOLD_MIN,
};
pub use error::{
    BridgeError, CommandError, ConfigError, ExecError, MixerError, OutputError, PipelineError,
    PublishError, SourceError,
};
pub use event::{discard_events, source_callback, SourceCallback, SourceEvent, StateChange};
pub use mixer::{event_channel, AudioMixer, EventReceiver, MixerPolicy};
pub use publish::{ChannelPublisher, LogPublisher, Publisher, Scope, StateUpdate};
pub use source::{AudioSource, MockSource, SourceKind, TelevisionControl};
pub use state::{PlaybackState, SourceState, StatePatch, LEVEL_DB_FLOOR};
