//! Streaming client source.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::remote::{PlaybackRemote, Transport};
use super::worker::{StopSignal, Worker};
use super::{approximate_level, AudioSource, SourceKind};
use crate::config::StreamConfig;
use crate::event::{SourceCallback, SourceEvent};
use crate::output::{OutputControl, SinkInput};
use crate::state::{PlaybackState, SourceState, StateCell, StatePatch};
use crate::SourceError;

const JOIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// A Connect-style streaming client, observed through its output stream and
/// controlled through its remote player interface.
///
/// The player's own volume can be changed from a phone. When the polled
/// player volume differs from the last one seen and was not written by
/// [`set_volume`](AudioSource::set_volume), it is mirrored to the output
/// stream and reported as an external change.
pub struct StreamSource {
    shared: Arc<Shared>,
    worker: Worker,
}

struct Shared {
    cell: StateCell,
    config: StreamConfig,
    output: Arc<dyn OutputControl>,
    remote: Arc<dyn PlaybackRemote>,
    last_remote_volume: Mutex<Option<u8>>,
    disabled: AtomicBool,
}

impl StreamSource {
    /// Creates the source. Nothing runs until [`start`](AudioSource::start).
    pub fn new(
        config: StreamConfig,
        output: Arc<dyn OutputControl>,
        remote: Arc<dyn PlaybackRemote>,
        callback: SourceCallback,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cell: StateCell::new(SourceKind::Stream, callback),
                config,
                output,
                remote,
                last_remote_volume: Mutex::new(None),
                disabled: AtomicBool::new(false),
            }),
            worker: Worker::new("stream", JOIN_TIMEOUT),
        }
    }

    /// Runs one monitoring cycle.
    pub async fn poll(&self) {
        self.shared.poll().await;
    }

    fn check_enabled(&self) -> Result<(), SourceError> {
        if self.shared.disabled.load(Ordering::SeqCst) {
            return Err(SourceError::disabled("remote control tool missing"));
        }
        Ok(())
    }
}

impl Shared {
    fn patterns(&self) -> Vec<&str> {
        self.config.sink_patterns.iter().map(String::as_str).collect()
    }

    async fn sink_input(&self) -> Option<SinkInput> {
        match self.output.sink_input(&self.patterns()).await {
            Ok(input) => input,
            Err(e) => {
                debug!(source = "stream", error = %e, "sink input lookup failed");
                None
            }
        }
    }

    async fn run(self: Arc<Self>, mut stop: StopSignal) {
        debug!(source = "stream", "monitor started");
        loop {
            self.poll().await;
            if stop.sleep(self.config.poll_interval).await {
                break;
            }
        }
        debug!(source = "stream", "monitor stopped");
    }

    async fn poll(&self) {
        let input = self.sink_input().await;
        let current = self.cell.snapshot();

        let mut volume = current.volume;
        let mut muted = current.muted;
        let mut stream_flowing = false;
        if let Some(input) = &input {
            volume = input.volume.unwrap_or(volume);
            muted = input.muted;
            stream_flowing = !input.corked;
        }

        let status = match self.remote.status().await {
            Ok(status) => status,
            Err(e) => {
                debug!(source = "stream", error = %e, "remote status failed");
                None
            }
        };

        let mut patch = StatePatch::new();
        let mut playback = PlaybackState::Idle;
        let mut external = None;

        if let Some(status) = status {
            playback = status.playback;
            patch = patch.title(status.title).artist(status.artist);

            if let Some(remote_volume) = status.volume {
                let previous = self.last_remote_volume.lock().replace(remote_volume);
                if previous.is_some_and(|prev| prev != remote_volume) {
                    info!(source = "stream", volume = remote_volume, "external volume change");
                    if let Some(input) = &input {
                        if let Err(e) = self
                            .output
                            .set_sink_input_volume(&input.id, remote_volume)
                            .await
                        {
                            warn!(source = "stream", error = %e, "failed to mirror external volume");
                        }
                    }
                    volume = remote_volume;
                    external = Some(remote_volume);
                }
            }
        }

        if playback == PlaybackState::Idle && stream_flowing {
            playback = PlaybackState::Playing;
        }

        self.cell.apply(
            patch
                .playback(playback)
                .volume(volume)
                .muted(muted)
                .level(approximate_level(playback, muted)),
        );

        if let Some(volume) = external {
            self.cell.notify(SourceEvent::ExternalVolume {
                source: SourceKind::Stream,
                volume,
            });
        }
    }
}

#[async_trait]
impl AudioSource for StreamSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Stream
    }

    fn state(&self) -> SourceState {
        self.shared.cell.snapshot()
    }

    async fn start(&self) -> Result<(), SourceError> {
        if !self.shared.remote.is_available() {
            self.shared.disabled.store(true, Ordering::SeqCst);
            warn!(source = "stream", "remote control tool not installed, source disabled");
            return Err(SourceError::disabled("remote control tool missing"));
        }
        if self.worker.is_running() {
            return Ok(());
        }

        let stop = self.worker.arm();
        self.worker.spawn(self.shared.clone().run(stop));
        info!(source = "stream", player = %self.shared.config.player, "started");
        Ok(())
    }

    async fn stop(&self) {
        self.worker.shutdown().await;
        info!(source = "stream", "stopped");
    }

    fn is_active(&self) -> bool {
        !self.shared.disabled.load(Ordering::SeqCst)
            && self.shared.cell.playback() == PlaybackState::Playing
    }

    async fn set_volume(&self, volume: u8) -> Result<(), SourceError> {
        self.check_enabled()?;
        let volume = volume.min(100);

        let input = self
            .shared
            .sink_input()
            .await
            .ok_or_else(|| SourceError::not_ready("no output stream"))?;
        self.shared
            .output
            .set_sink_input_volume(&input.id, volume)
            .await?;

        // Record before the remote write so the next poll does not see it as external.
        *self.shared.last_remote_volume.lock() = Some(volume);
        if let Err(e) = self.shared.remote.set_volume(volume).await {
            debug!(source = "stream", error = %e, "remote volume write failed");
        }

        self.shared.cell.apply(StatePatch::new().volume(volume));
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<(), SourceError> {
        self.check_enabled()?;
        let input = self
            .shared
            .sink_input()
            .await
            .ok_or_else(|| SourceError::not_ready("no output stream"))?;
        self.shared.output.set_sink_input_mute(&input.id, muted).await?;

        let playback = self.shared.cell.playback();
        self.shared.cell.apply(
            StatePatch::new()
                .muted(muted)
                .level(approximate_level(playback, muted)),
        );
        Ok(())
    }

    async fn play(&self) -> Result<(), SourceError> {
        self.check_enabled()?;
        self.shared
            .remote
            .send(Transport::Play)
            .await
            .map_err(SourceError::Remote)
    }

    async fn pause(&self) -> Result<(), SourceError> {
        self.check_enabled()?;
        self.shared
            .remote
            .send(Transport::Pause)
            .await
            .map_err(SourceError::Remote)
    }

    async fn stop_playback(&self) -> Result<(), SourceError> {
        self.check_enabled()?;
        self.shared
            .remote
            .send(Transport::Stop)
            .await
            .map_err(SourceError::Remote)
    }
}
