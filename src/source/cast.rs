//! Wireless-cast receiver source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::{debug, info, warn};

use super::metadata::{cast_volume, MetadataItem, MetadataParser};
use super::worker::{StopSignal, Worker};
use super::{approximate_level, AudioSource, SourceKind};
use crate::config::CastConfig;
use crate::event::{SourceCallback, SourceEvent};
use crate::output::{OutputControl, SinkInput};
use crate::state::{PlaybackState, SourceState, StateCell, StatePatch};
use crate::SourceError;

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BUFFER: usize = 4096;

/// A cast receiver, observed through its output stream and metadata pipe.
///
/// Volume changes made on the sending device arrive as metadata records;
/// they are mirrored to the output stream and reported as external changes.
/// The receiver cannot be remote-controlled, so transport calls are
/// unsupported.
pub struct CastSource {
    shared: Arc<Shared>,
    worker: Worker,
}

struct Shared {
    cell: StateCell,
    config: CastConfig,
    output: Arc<dyn OutputControl>,
    sink_input_id: Mutex<Option<String>>,
}

impl CastSource {
    /// Creates the source. Nothing runs until [`start`](AudioSource::start).
    pub fn new(config: CastConfig, output: Arc<dyn OutputControl>, callback: SourceCallback) -> Self {
        Self {
            shared: Arc::new(Shared {
                cell: StateCell::new(SourceKind::Cast, callback),
                config,
                output,
                sink_input_id: Mutex::new(None),
            }),
            worker: Worker::new("cast", JOIN_TIMEOUT),
        }
    }

    /// Runs one output-stream poll.
    pub async fn poll(&self) {
        self.shared.poll().await;
    }

    /// Applies one decoded metadata record.
    pub async fn handle_metadata(&self, item: &MetadataItem) {
        self.shared.handle_item(item).await;
    }
}

impl Shared {
    async fn sink_input(&self) -> Option<SinkInput> {
        let patterns: Vec<&str> = self.config.sink_patterns.iter().map(String::as_str).collect();
        let input = match self.output.sink_input(&patterns).await {
            Ok(input) => input,
            Err(e) => {
                debug!(source = "cast", error = %e, "sink input lookup failed");
                None
            }
        };
        *self.sink_input_id.lock() = input.as_ref().map(|i| i.id.clone());
        input
    }

    async fn poll(&self) {
        let Some(input) = self.sink_input().await else {
            self.cell
                .apply(StatePatch::new().playback(PlaybackState::Idle).level(0));
            return;
        };

        let playback = if input.corked {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        };
        let volume = input.volume.unwrap_or_else(|| self.cell.volume());

        self.cell.apply(
            StatePatch::new()
                .playback(playback)
                .volume(volume)
                .muted(input.muted)
                .level(approximate_level(playback, input.muted)),
        );
    }

    async fn poll_loop(self: Arc<Self>, mut stop: StopSignal) {
        loop {
            self.poll().await;
            if stop.sleep(self.config.poll_interval).await {
                break;
            }
        }
        debug!(source = "cast", "poll loop stopped");
    }

    async fn metadata_loop(self: Arc<Self>, mut stop: StopSignal) {
        let mut parser = MetadataParser::new();
        let mut buf = vec![0u8; READ_BUFFER];

        while !stop.is_stopped() {
            let mut options = pipe::OpenOptions::new();
            // Holding a write end open keeps reads from hitting EOF between senders.
            #[cfg(target_os = "linux")]
            options.read_write(true);

            let mut receiver = match options.open_receiver(&self.config.metadata_pipe) {
                Ok(receiver) => receiver,
                Err(e) => {
                    debug!(
                        source = "cast",
                        path = %self.config.metadata_pipe.display(),
                        error = %e,
                        "metadata pipe unavailable"
                    );
                    if stop.sleep(self.config.metadata_wait).await {
                        break;
                    }
                    continue;
                }
            };
            debug!(source = "cast", "metadata pipe opened");

            loop {
                let read = tokio::select! {
                    read = tokio::time::timeout(self.config.metadata_wait, receiver.read(&mut buf)) => read,
                    () = stop.stopped() => break,
                };
                match read {
                    // Bounded wait elapsed; check the stop signal and wait again.
                    Err(_) => continue,
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        for item in parser.push(&buf[..n]) {
                            self.handle_item(&item).await;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(source = "cast", error = %e, "metadata pipe read failed");
                        break;
                    }
                }
            }

            if stop.sleep(self.config.metadata_wait).await {
                break;
            }
        }
        debug!(source = "cast", "metadata loop stopped");
    }

    async fn handle_item(&self, item: &MetadataItem) {
        match (item.item_type.as_str(), item.code.as_str()) {
            ("ssnc", "pvol") => self.on_remote_volume(&item.text()).await,
            ("ssnc", "pbeg") => info!(source = "cast", "playback begin"),
            ("ssnc", "pend") => info!(source = "cast", "playback end"),
            ("core", "minm") => {
                self.cell.apply(StatePatch::new().title(item.text()));
            }
            ("core", "asar") => {
                self.cell.apply(StatePatch::new().artist(item.text()));
            }
            _ => {}
        }
    }

    /// Handles `volume,lowest,highest,...` where the first field is in dB.
    async fn on_remote_volume(&self, payload: &str) {
        let Some(db) = payload
            .split(',')
            .next()
            .and_then(|v| v.trim().parse::<f32>().ok())
        else {
            debug!(source = "cast", payload, "unparseable volume record");
            return;
        };

        let (volume, muted) = cast_volume(db);
        info!(source = "cast", db, volume, muted, "external volume change");

        let id = self.sink_input_id.lock().clone();
        if let Some(id) = id {
            if let Err(e) = self.output.set_sink_input_volume(&id, volume).await {
                warn!(source = "cast", error = %e, "failed to mirror external volume");
            }
        }

        self.cell.apply(StatePatch::new().volume(volume).muted(muted));
        self.cell.notify(SourceEvent::ExternalVolume {
            source: SourceKind::Cast,
            volume,
        });
    }
}

#[async_trait]
impl AudioSource for CastSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Cast
    }

    fn state(&self) -> SourceState {
        self.shared.cell.snapshot()
    }

    async fn start(&self) -> Result<(), SourceError> {
        if self.worker.is_running() {
            return Ok(());
        }
        let stop = self.worker.arm();
        self.worker.spawn(self.shared.clone().poll_loop(stop.clone()));
        self.worker.spawn(self.shared.clone().metadata_loop(stop));
        info!(source = "cast", pipe = %self.shared.config.metadata_pipe.display(), "started");
        Ok(())
    }

    async fn stop(&self) {
        self.worker.shutdown().await;
        info!(source = "cast", "stopped");
    }

    async fn set_volume(&self, volume: u8) -> Result<(), SourceError> {
        let volume = volume.min(100);
        match self.shared.sink_input().await {
            Some(input) => {
                if let Err(e) = self.shared.output.set_sink_input_volume(&input.id, volume).await {
                    warn!(source = "cast", error = %e, "volume write failed");
                }
            }
            None => debug!(source = "cast", volume, "no output stream, volume kept for later"),
        }
        // The receiver re-applies its own volume when it reconnects, so the
        // state is updated even when no stream exists.
        self.shared.cell.apply(StatePatch::new().volume(volume));
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<(), SourceError> {
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
}
