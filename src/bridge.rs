//! Bridge assembly and the running session handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::command::{CommandRouter, Dispatch};
use crate::config::BridgeConfig;
use crate::mixer::{event_channel, AudioMixer};
use crate::output::{OutputControl, Pactl};
use crate::publish::Publisher;
use crate::source::remote::{PlaybackRemote, Playerctl};
use crate::source::{AudioSource, CastSource, StreamSource};
use crate::tv::{GstLauncher, PipelineLauncher, TvSource};
use crate::{BridgeError, CommandError, MixerError};

/// Entry point for assembling a bridge.
///
/// # Example
///
/// ```ignore
/// use media_bridge::{BridgeConfig, LogPublisher, MediaBridge};
///
/// let session = MediaBridge::builder()
///     .config(BridgeConfig::load(None)?)
///     .publisher(LogPublisher::new())
///     .start()
///     .await?;
///
/// session.handle_command("source_tv_set_volume", "30").await?;
/// session.stop().await;
/// ```
pub struct MediaBridge;

impl MediaBridge {
    /// Creates a builder with default configuration.
    pub fn builder() -> MediaBridgeBuilder {
        MediaBridgeBuilder::new()
    }
}

/// Configures and starts a bridge.
///
/// Collaborators default to the real tools (`pactl`, `playerctl`, GStreamer
/// pipelines); the override methods replace them, which is how tests run the
/// full assembly without hardware.
#[must_use]
pub struct MediaBridgeBuilder {
    config: BridgeConfig,
    publishers: Vec<Arc<dyn Publisher>>,
    output: Option<Arc<dyn OutputControl>>,
    remote: Option<Arc<dyn PlaybackRemote>>,
    launcher: Option<Arc<dyn PipelineLauncher>>,
}

impl Default for MediaBridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBridgeBuilder {
    /// Creates a builder with default configuration and no publishers.
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
            publishers: Vec::new(),
            output: None,
            remote: None,
            launcher: None,
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a publisher. Every publisher receives every update.
    pub fn publisher<P: Publisher + 'static>(mut self, publisher: P) -> Self {
        self.publishers.push(Arc::new(publisher));
        self
    }

    /// Replaces the output path control.
    pub fn output(mut self, output: Arc<dyn OutputControl>) -> Self {
        self.output = Some(output);
        self
    }

    /// Replaces the streaming client's remote control.
    pub fn remote(mut self, remote: Arc<dyn PlaybackRemote>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Replaces the television pipeline launcher.
    pub fn launcher(mut self, launcher: Arc<dyn PipelineLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Builds the sources and mixer, applies startup volumes and starts
    /// every source.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no publisher was
    /// added. Sources that cannot run disable themselves instead of failing
    /// startup.
    pub async fn start(self) -> Result<Session, BridgeError> {
        self.config.validate()?;
        if self.publishers.is_empty() {
            return Err(BridgeError::NoPublisher);
        }

        let config = self.config;
        let timeout = config.output.command_timeout;
        let output = self
            .output
            .unwrap_or_else(|| Arc::new(Pactl::new(timeout)));
        let remote = self
            .remote
            .unwrap_or_else(|| Arc::new(Playerctl::new(config.stream.player.clone(), timeout)));
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(GstLauncher::new(&config.tv)));

        let (callback, events) = event_channel();
        let sources: Vec<Arc<dyn AudioSource>> = vec![
            Arc::new(StreamSource::new(
                config.stream.clone(),
                output.clone(),
                remote,
                callback.clone(),
            )),
            Arc::new(CastSource::new(
                config.cast.clone(),
                output.clone(),
                callback.clone(),
            )),
            Arc::new(TvSource::new(
                config.tv.clone(),
                config.output.clone(),
                output.clone(),
                launcher,
                callback,
            )),
        ];

        let mixer = AudioMixer::new(&config.mixer, sources, output, self.publishers);
        mixer.spawn_event_pump(events);
        mixer.start().await;
        info!(sources = ?mixer.kinds(), "bridge started");

        let commands = CommandRouter::new(mixer.clone(), config.commands.cooldown);
        Ok(Session {
            mixer,
            commands,
            running: AtomicBool::new(true),
        })
    }
}

/// Handle to a running bridge.
///
/// Sources keep running in background tasks until [`stop()`](Session::stop)
/// is called or the session is dropped.
pub struct Session {
    mixer: AudioMixer,
    commands: CommandRouter,
    running: AtomicBool,
}

impl Session {
    /// The mixer, for direct control and queries.
    pub fn mixer(&self) -> &AudioMixer {
        &self.mixer
    }

    /// Returns `true` until the session is stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Applies an inbound `{scope}_{verb}` command.
    pub async fn handle_command(
        &self,
        command: &str,
        payload: &str,
    ) -> Result<Dispatch, CommandError> {
        self.commands.handle(command, payload).await
    }

    /// Reports TV power, enabling or stopping the television pipeline.
    pub async fn set_tv_power(&self, on: bool) -> Result<(), MixerError> {
        self.mixer.set_tv_power(on).await
    }

    /// Publishes the complete current state, e.g. after a transport reconnects.
    pub async fn publish_full_state(&self) {
        self.mixer.publish_full_state().await;
    }

    /// Stops every source and the mixer.
    pub async fn stop(self) {
        self.stop_internal().await;
    }

    async fn stop_internal(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.mixer.stop().await;
        info!("bridge stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            // Dropped without stop(): finish shutdown in the background.
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let mixer = self.mixer.clone();
                    handle.spawn(async move { mixer.stop().await });
                }
                Err(_) => debug!("session dropped outside a runtime, sources not stopped"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::output::MockOutput;
    use crate::publish::{ChannelPublisher, StateUpdate};
    use crate::source::remote::{RemoteStatus, Transport};
    use crate::tv::{Codec, PipelineKind, PipelineProcess, PipelineTarget};
    use crate::{ExecError, PipelineError};

    struct NoRemote;

    #[async_trait]
    impl PlaybackRemote for NoRemote {
        fn is_available(&self) -> bool {
            false
        }

        async fn status(&self) -> Result<Option<RemoteStatus>, ExecError> {
            Ok(None)
        }

        async fn set_volume(&self, _volume: u8) -> Result<(), ExecError> {
            Ok(())
        }

        async fn send(&self, _action: Transport) -> Result<(), ExecError> {
            Ok(())
        }
    }

    struct NoLauncher;

    #[async_trait]
    impl PipelineLauncher for NoLauncher {
        async fn probe(&self, _target: &PipelineTarget) -> Option<Codec> {
            None
        }

        fn launch(
            &self,
            _kind: PipelineKind,
            _target: &PipelineTarget,
        ) -> Result<Box<dyn PipelineProcess>, PipelineError> {
            Err(PipelineError::ToolMissing {
                tool: "gst-launch-1.0".to_string(),
            })
        }
    }

    fn test_config(dir: &std::path::Path) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.mixer.slew_rate = 0;
        config.cast.metadata_pipe = dir.join("missing-pipe");
        config.stream.poll_interval = Duration::from_millis(20);
        config.cast.poll_interval = Duration::from_millis(20);
        config.tv.poll_interval = Duration::from_millis(20);
        config.output.ready_timeout = Duration::from_millis(100);
        config
    }

    #[tokio::test]
    async fn test_start_requires_publisher() {
        let result = MediaBridge::builder()
            .output(Arc::new(MockOutput::new()))
            .start()
            .await;
        assert!(matches!(result, Err(BridgeError::NoPublisher)));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = BridgeConfig::default();
        config.mixer.master_volume = 150;
        let result = MediaBridge::builder()
            .config(config)
            .publisher(crate::LogPublisher::new())
            .start()
            .await;
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let output = Arc::new(MockOutput::new());
        let (tx, mut rx) = mpsc::channel::<StateUpdate>(256);

        let session = MediaBridge::builder()
            .config(test_config(dir.path()))
            .publisher(ChannelPublisher::new(tx))
            .output(output.clone())
            .remote(Arc::new(NoRemote))
            .launcher(Arc::new(NoLauncher))
            .start()
            .await
            .unwrap();

        assert!(session.is_running());
        assert_eq!(output.master_volume(), Some(50));
        assert_eq!(session.mixer().kinds().len(), 3);

        let dispatch = session.handle_command("set_master_volume", "42").await.unwrap();
        assert_eq!(dispatch, Dispatch::Applied);
        assert_eq!(output.master_volume(), Some(42));

        session.publish_full_state().await;
        let mut topics = Vec::new();
        while let Ok(update) = rx.try_recv() {
            topics.push(update.topic());
        }
        assert!(topics.iter().any(|t| t == "source/tv/silence_threshold"));
        assert!(topics.iter().any(|t| t == "master/volume"));

        session.stop().await;
    }
}
