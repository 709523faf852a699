//! Television source: decode pipeline control, metering and silence auto-mute.
//!
//! One control loop owns the pipeline lifecycle. While TV power is on it
//! keeps a pipeline running (probing the input first and restarting crashed
//! pipelines no sooner than the restart cooldown allows) and polls the
//! pipeline's output stream for volume, mute and silence. PCM pipelines also
//! run a metering loop that feeds the shared [`SilenceMonitor`].
//!
//! # Write debounce
//!
//! The output path reports volume and mute with some lag. For a short window
//! after this source writes either value, polled readings of that value are
//! ignored and the written value is kept.

mod meter;
mod pipeline;
mod silence;

pub use meter::{calculate_rms_db, level_from_db};
pub use pipeline::{
    Codec, GstLauncher, MeterTap, PipelineKind, PipelineLauncher, PipelinePhase, PipelineProcess,
    PipelineTarget,
};
pub use silence::{MuteAction, SilenceMonitor, SilenceVerdict};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{OutputConfig, TvConfig, SILENCE_DURATION_MAX, SILENCE_DURATION_MIN};
use crate::event::{SourceCallback, StateChange};
use crate::output::{OutputControl, SinkInput};
use crate::source::worker::{StopSignal, Worker};
use crate::source::{AudioSource, SourceKind, TelevisionControl};
use crate::state::{PlaybackState, SourceState, StateCell, StatePatch, LEVEL_DB_FLOOR};
use crate::SourceError;
use meter::{run_meter, SampleWindow};

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const READY_RETRY: Duration = Duration::from_millis(500);

/// The television input.
///
/// Playback is derived from the measured level: sustained silence reports
/// [`PlaybackState::Idle`], anything else while the pipeline's output stream
/// exists reports [`PlaybackState::Playing`]. Transport controls are
/// unsupported.
pub struct TvSource {
    shared: Arc<Shared>,
    worker: Worker,
}

struct Shared {
    cell: StateCell,
    config: TvConfig,
    output_config: OutputConfig,
    output: Arc<dyn OutputControl>,
    launcher: Arc<dyn PipelineLauncher>,
    silence: Arc<Mutex<SilenceMonitor>>,
    control: Mutex<Control>,
    /// Held for the whole start or stop of a pipeline.
    pipeline: tokio::sync::Mutex<Option<Box<dyn PipelineProcess>>>,
    meter: Worker,
}

#[derive(Debug, Default)]
struct Control {
    power: bool,
    enabled: bool,
    phase: PipelinePhase,
    output_sink: Option<String>,
    disabled: Option<String>,
    last_start: Option<Instant>,
    sink_input_id: Option<String>,
    user_muted: bool,
    volume_written_at: Option<Instant>,
    mute_written_at: Option<Instant>,
}

impl TvSource {
    /// Creates the source. Nothing runs until [`start`](AudioSource::start)
    /// and the pipeline stays off until TV power is reported on.
    pub fn new(
        config: TvConfig,
        output_config: OutputConfig,
        output: Arc<dyn OutputControl>,
        launcher: Arc<dyn PipelineLauncher>,
        callback: SourceCallback,
    ) -> Self {
        let silence = SilenceMonitor::new(
            config.silence_threshold_db,
            config.silence_duration,
            config.auto_mute,
        );
        Self {
            shared: Arc::new(Shared {
                cell: StateCell::new(SourceKind::Tv, callback),
                config,
                output_config,
                output,
                launcher,
                silence: Arc::new(Mutex::new(silence)),
                control: Mutex::new(Control::default()),
                pipeline: tokio::sync::Mutex::new(None),
                meter: Worker::new("tv-meter", JOIN_TIMEOUT),
            }),
            worker: Worker::new("tv", JOIN_TIMEOUT),
        }
    }

    /// Current pipeline phase.
    pub fn phase(&self) -> PipelinePhase {
        self.shared.control.lock().phase
    }

    /// The output sink pipelines play to, once resolved.
    pub fn output_sink(&self) -> Option<String> {
        self.shared.control.lock().output_sink.clone()
    }

    /// Why the source is disabled, if it is.
    pub fn disabled_reason(&self) -> Option<String> {
        self.shared.control.lock().disabled.clone()
    }
}

impl Shared {
    fn check_enabled(&self) -> Result<(), SourceError> {
        match &self.control.lock().disabled {
            Some(reason) => Err(SourceError::disabled(reason.clone())),
            None => Ok(()),
        }
    }

    async fn control_loop(self: Arc<Self>, mut stop: StopSignal) {
        if !self.wait_for_output(&mut stop).await {
            if stop.is_stopped() {
                return;
            }
            warn!(source = "tv", "output service not ready, continuing anyway");
        }

        let Some(sink) = self.resolve_sink().await else {
            error!(source = "tv", "no output sink found, television audio disabled");
            self.control.lock().disabled = Some("no output sink".to_string());
            return;
        };
        info!(source = "tv", sink = %sink, "output sink resolved");
        self.control.lock().output_sink = Some(sink);

        loop {
            self.tick().await;
            if stop.sleep(self.config.poll_interval).await {
                break;
            }
        }
        self.stop_pipeline().await;
        debug!(source = "tv", "control loop stopped");
    }

    /// Waits up to the readiness timeout. Returns `false` on timeout or stop.
    async fn wait_for_output(&self, stop: &mut StopSignal) -> bool {
        let deadline = Instant::now() + self.output_config.ready_timeout;
        loop {
            if self.output.is_ready().await {
                return true;
            }
            if Instant::now() >= deadline || stop.sleep(READY_RETRY).await {
                return false;
            }
        }
    }

    async fn resolve_sink(&self) -> Option<String> {
        if let Some(sink) = &self.output_config.sink {
            return Some(sink.clone());
        }
        match self.output.find_sink(&self.output_config.sink_match).await {
            Ok(sink) => sink,
            Err(e) => {
                warn!(source = "tv", error = %e, "sink discovery failed");
                None
            }
        }
    }

    async fn tick(&self) {
        let enabled = self.control.lock().enabled;
        if !enabled {
            if self.pipeline.lock().await.is_some() {
                self.stop_pipeline().await;
            }
            if self.cell.playback() != PlaybackState::Idle {
                self.cell.apply(powered_off());
            }
            return;
        }

        let needs_start = match self.pipeline.lock().await.as_mut() {
            Some(process) => process.has_exited(),
            None => true,
        };
        if needs_start && self.cooldown_elapsed() {
            self.start_pipeline().await;
        }
        self.poll_state().await;
    }

    fn cooldown_elapsed(&self) -> bool {
        self.control
            .lock()
            .last_start
            .map_or(true, |at| at.elapsed() >= self.config.restart_cooldown)
    }

    async fn start_pipeline(&self) {
        let mut slot = self.pipeline.lock().await;
        if let Some(mut old) = slot.take() {
            debug!(source = "tv", "replacing exited pipeline");
            self.meter.shutdown().await;
            old.terminate(self.config.termination_grace).await;
        }

        let sink = {
            let mut control = self.control.lock();
            if !control.enabled {
                return;
            }
            let Some(sink) = control.output_sink.clone() else {
                return;
            };
            control.last_start = Some(Instant::now());
            control.phase = PipelinePhase::Probing;
            sink
        };

        let target = PipelineTarget::new(&self.config, sink);
        let kind = match self.launcher.probe(&target).await {
            Some(codec) => PipelineKind::Bitstream(codec),
            None => PipelineKind::Pcm,
        };

        match self.launcher.launch(kind, &target) {
            Ok(mut process) => {
                if let Some(tap) = process.take_meter_tap() {
                    let stop = self.meter.arm();
                    let window = SampleWindow::new(self.config.meter_window_samples());
                    self.meter
                        .spawn(run_meter(tap, self.silence.clone(), window, stop));
                }
                self.control.lock().phase = kind.into();
                *slot = Some(process);
            }
            Err(e) => {
                error!(source = "tv", ?kind, error = %e, "failed to start pipeline");
                self.control.lock().phase = PipelinePhase::Stopped;
            }
        }
    }

    async fn stop_pipeline(&self) {
        let mut slot = self.pipeline.lock().await;
        self.meter.shutdown().await;
        if let Some(mut process) = slot.take() {
            process.terminate(self.config.termination_grace).await;
        }
        self.control.lock().phase = PipelinePhase::Stopped;
    }

    async fn find_sink_input(&self) -> Option<SinkInput> {
        let patterns: Vec<&str> = self.config.sink_patterns.iter().map(String::as_str).collect();
        let input = match self.output.sink_input(&patterns).await {
            Ok(input) => input,
            Err(e) => {
                debug!(source = "tv", error = %e, "sink input lookup failed");
                None
            }
        };
        self.control.lock().sink_input_id = input.as_ref().map(|i| i.id.clone());
        input
    }

    /// Cached output stream id, looked up when unknown.
    async fn sink_input_id(&self) -> Option<String> {
        let cached = self.control.lock().sink_input_id.clone();
        match cached {
            Some(id) => Some(id),
            None => self.find_sink_input().await.map(|i| i.id),
        }
    }

    async fn poll_state(&self) {
        let Some(input) = self.find_sink_input().await else {
            self.cell
                .apply(StatePatch::new().playback(PlaybackState::Idle).level(0));
            return;
        };

        let now = Instant::now();
        let debounce = self.config.write_debounce;
        let recent = |at: Option<Instant>| at.is_some_and(|at| now.saturating_duration_since(at) <= debounce);
        let (user_muted, volume_fenced, mute_fenced, metered) = {
            let control = self.control.lock();
            (
                control.user_muted,
                recent(control.volume_written_at),
                recent(control.mute_written_at),
                !matches!(control.phase, PipelinePhase::RunningBitstream(_)),
            )
        };

        let volume = if volume_fenced {
            self.cell.volume()
        } else {
            input.volume.unwrap_or(100)
        };

        let (verdict, level_db) = {
            let mut silence = self.silence.lock();
            (silence.evaluate(now, user_muted, metered), silence.current_db())
        };

        let observed_mute = match verdict.action {
            Some(action) => self.apply_mute_action(&input.id, action).await,
            None => input.muted,
        };

        let muted = if mute_fenced {
            self.cell.muted()
        } else {
            observed_mute || user_muted || verdict.silence_muted
        };

        self.cell.apply(
            StatePatch::new()
                .playback(verdict.playback)
                .volume(volume)
                .muted(muted)
                .level(level_from_db(level_db, muted))
                .level_db((level_db * 10.0).round() / 10.0),
        );
    }

    /// Performs a silence mute write. Returns the mute now on the output.
    async fn apply_mute_action(&self, id: &str, action: MuteAction) -> bool {
        let muted = match action {
            MuteAction::Engage => {
                let silence = self.silence.lock();
                info!(
                    source = "tv",
                    level_db = silence.current_db(),
                    threshold_db = silence.threshold_db(),
                    duration_s = silence.duration().as_secs_f32(),
                    "silence detected, muting"
                );
                true
            }
            MuteAction::Restore { muted } => {
                info!(source = "tv", muted, "audio detected, restoring mute");
                muted
            }
        };
        if let Err(e) = self.output.set_sink_input_mute(id, muted).await {
            warn!(source = "tv", error = %e, "silence mute write failed");
        }
        muted
    }
}

fn powered_off() -> StatePatch {
    StatePatch::new()
        .playback(PlaybackState::Idle)
        .level(0)
        .level_db(LEVEL_DB_FLOOR)
}

#[async_trait]
impl AudioSource for TvSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Tv
    }

    fn state(&self) -> SourceState {
        self.shared.cell.snapshot()
    }

    async fn start(&self) -> Result<(), SourceError> {
        if self.worker.is_running() {
            return Ok(());
        }
        let stop = self.worker.arm();
        self.worker.spawn(self.shared.clone().control_loop(stop));
        info!(source = "tv", device = %self.shared.config.capture_device, "started");
        Ok(())
    }

    async fn stop(&self) {
        self.worker.shutdown().await;
        self.shared.stop_pipeline().await;
        info!(source = "tv", "stopped");
    }

    async fn set_volume(&self, volume: u8) -> Result<(), SourceError> {
        self.shared.check_enabled()?;
        let volume = volume.min(100);
        let id = self
            .shared
            .sink_input_id()
            .await
            .ok_or_else(|| SourceError::not_ready("tv output stream"))?;
        self.shared.output.set_sink_input_volume(&id, volume).await?;

        self.shared.control.lock().volume_written_at = Some(Instant::now());
        self.shared.cell.apply(StatePatch::new().volume(volume));
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<(), SourceError> {
        self.shared.check_enabled()?;
        let id = self
            .shared
            .sink_input_id()
            .await
            .ok_or_else(|| SourceError::not_ready("tv output stream"))?;

        self.shared.control.lock().user_muted = muted;
        self.shared.output.set_sink_input_mute(&id, muted).await?;

        self.shared.control.lock().mute_written_at = Some(Instant::now());
        self.shared.cell.apply(StatePatch::new().muted(muted));
        Ok(())
    }

    fn television(&self) -> Option<&dyn TelevisionControl> {
        Some(self)
    }
}

#[async_trait]
impl TelevisionControl for TvSource {
    fn silence_threshold(&self) -> i32 {
        self.shared.silence.lock().threshold_db()
    }

    fn set_silence_threshold(&self, db: i32) -> i32 {
        let db = self.shared.silence.lock().set_threshold_db(db);
        info!(source = "tv", threshold_db = db, "silence threshold set");
        self.shared.cell.notify_change(StateChange::SilenceThreshold(db));
        db
    }

    fn silence_duration(&self) -> f32 {
        self.shared.silence.lock().duration().as_secs_f32()
    }

    fn set_silence_duration(&self, seconds: f32) -> f32 {
        let seconds = if seconds.is_nan() {
            SILENCE_DURATION_MIN
        } else {
            seconds.clamp(SILENCE_DURATION_MIN, SILENCE_DURATION_MAX)
        };
        let stored = self
            .shared
            .silence
            .lock()
            .set_duration(Duration::from_secs_f32(seconds))
            .as_secs_f32();
        info!(source = "tv", duration_s = stored, "silence duration set");
        self.shared.cell.notify_change(StateChange::SilenceDuration(stored));
        stored
    }

    fn auto_mute(&self) -> bool {
        self.shared.silence.lock().auto_mute()
    }

    async fn set_auto_mute(&self, enabled: bool) -> Result<(), SourceError> {
        let user_muted = self.shared.control.lock().user_muted;
        let restore = self.shared.silence.lock().set_auto_mute(enabled, user_muted);
        info!(source = "tv", enabled, "auto-mute set");
        self.shared.cell.notify_change(StateChange::AutoMute(enabled));

        if let Some(MuteAction::Restore { muted }) = restore {
            let id = self.shared.control.lock().sink_input_id.clone();
            if let Some(id) = id {
                self.shared.output.set_sink_input_mute(&id, muted).await?;
            }
        }
        Ok(())
    }

    fn level_db(&self) -> f32 {
        self.shared.silence.lock().current_db()
    }

    fn tv_power(&self) -> bool {
        self.shared.control.lock().power
    }

    async fn set_tv_power(&self, on: bool) {
        {
            let mut control = self.shared.control.lock();
            if control.power == on {
                return;
            }
            control.power = on;
            control.enabled = on;
        }

        if on {
            info!(source = "tv", "TV power on, enabling pipeline");
        } else {
            info!(source = "tv", "TV power off, stopping pipeline");
            self.shared.stop_pipeline().await;
            self.shared.silence.lock().reset_level();
            self.shared.cell.apply(powered_off());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{source_callback, SourceEvent};
    use crate::output::MockOutput;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const SINK: &str = "alsa_output.usb-Focusrite_Scarlett_2i2_USB-00.analog-stereo";

    #[derive(Default)]
    struct Launches {
        kinds: Mutex<Vec<PipelineKind>>,
        terminated: AtomicUsize,
        exited: Arc<AtomicBool>,
    }

    struct ScriptedLauncher {
        codec: Option<Codec>,
        launches: Arc<Launches>,
    }

    #[async_trait]
    impl PipelineLauncher for ScriptedLauncher {
        async fn probe(&self, _target: &PipelineTarget) -> Option<Codec> {
            self.codec
        }

        fn launch(
            &self,
            kind: PipelineKind,
            _target: &PipelineTarget,
        ) -> Result<Box<dyn PipelineProcess>, crate::PipelineError> {
            self.launches.kinds.lock().push(kind);
            self.launches.exited.store(false, Ordering::SeqCst);
            Ok(Box::new(FakeProcess {
                launches: self.launches.clone(),
            }))
        }
    }

    struct FakeProcess {
        launches: Arc<Launches>,
    }

    #[async_trait]
    impl PipelineProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            None
        }

        fn has_exited(&mut self) -> bool {
            self.launches.exited.load(Ordering::SeqCst)
        }

        fn take_meter_tap(&mut self) -> Option<MeterTap> {
            None
        }

        async fn terminate(&mut self, _grace: Duration) {
            self.launches.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        source: TvSource,
        output: Arc<MockOutput>,
        launches: Arc<Launches>,
        events: Arc<Mutex<Vec<SourceEvent>>>,
    }

    fn fixture(codec: Option<Codec>) -> Fixture {
        let output = Arc::new(MockOutput::new());
        output.add_sink(SINK);
        let launches = Arc::new(Launches::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let config = TvConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let source = TvSource::new(
            config,
            OutputConfig::default(),
            output.clone(),
            Arc::new(ScriptedLauncher {
                codec,
                launches: launches.clone(),
            }),
            source_callback(move |e| sink.lock().push(e)),
        );
        Fixture {
            source,
            output,
            launches,
            events,
        }
    }

    fn set_phase(source: &TvSource, phase: PipelinePhase) {
        source.shared.control.lock().phase = phase;
    }

    fn record(source: &TvSource, level_db: f32) {
        source
            .shared
            .silence
            .lock()
            .record_level(level_db, Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_gates_pipeline() {
        let f = fixture(None);
        f.source.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.launches.kinds.lock().is_empty());
        assert_eq!(f.source.output_sink().as_deref(), Some(SINK));

        f.source.set_tv_power(true).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*f.launches.kinds.lock(), vec![PipelineKind::Pcm]);
        assert_eq!(f.source.phase(), PipelinePhase::RunningPcm);

        f.source.set_tv_power(false).await;
        assert_eq!(f.launches.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(f.source.phase(), PipelinePhase::Stopped);
        let state = f.source.state();
        assert_eq!(state.playback, PlaybackState::Idle);
        assert_eq!(state.level, 0);
        assert_eq!(state.level_db, LEVEL_DB_FLOOR);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.launches.kinds.lock().len(), 1);
        f.source.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_is_edge_triggered() {
        let f = fixture(None);
        f.source.set_tv_power(false).await;
        assert!(!f.source.tv_power());
        assert!(f.events.lock().is_empty());

        f.source.set_tv_power(true).await;
        f.source.set_tv_power(true).await;
        assert!(f.source.tv_power());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bitstream_probe_selects_decoder() {
        let f = fixture(Some(Codec::Eac3));
        f.source.start().await.unwrap();
        f.source.set_tv_power(true).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            *f.launches.kinds.lock(),
            vec![PipelineKind::Bitstream(Codec::Eac3)]
        );
        assert_eq!(f.source.phase(), PipelinePhase::RunningBitstream(Codec::Eac3));
        f.source.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_restart_waits_for_cooldown() {
        let f = fixture(None);
        f.source.start().await.unwrap();
        f.source.set_tv_power(true).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.launches.kinds.lock().len(), 1);

        f.launches.exited.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(f.launches.kinds.lock().len(), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(f.launches.kinds.lock().len(), 2);
        f.source.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_sink_disables_source() {
        let output = Arc::new(MockOutput::new());
        let launches = Arc::new(Launches::default());
        let source = TvSource::new(
            TvConfig::default(),
            OutputConfig::default(),
            output,
            Arc::new(ScriptedLauncher {
                codec: None,
                launches: launches.clone(),
            }),
            crate::event::discard_events(),
        );

        source.start().await.unwrap();
        source.set_tv_power(true).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(launches.kinds.lock().is_empty());
        assert!(source.disabled_reason().is_some());
        assert!(matches!(
            source.set_volume(20).await,
            Err(SourceError::Disabled { .. })
        ));
        source.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_silence_auto_mutes_once() {
        let f = fixture(None);
        f.output.add_input("42", "gst-launch-1.0", 80);
        set_phase(&f.source, PipelinePhase::RunningPcm);

        record(&f.source, -20.0);
        f.source.shared.poll_state().await;
        let state = f.source.state();
        assert_eq!(state.playback, PlaybackState::Playing);
        assert_eq!(state.level, 60);
        assert_eq!(state.level_db, -20.0);

        tokio::time::advance(Duration::from_secs(1)).await;
        record(&f.source, -70.0);
        f.source.shared.poll_state().await;
        assert_eq!(f.source.state().playback, PlaybackState::Playing);
        assert!(f.output.writes().is_empty());

        tokio::time::advance(Duration::from_secs(3)).await;
        record(&f.source, -70.0);
        f.source.shared.poll_state().await;
        f.source.shared.poll_state().await;
        let state = f.source.state();
        assert_eq!(state.playback, PlaybackState::Idle);
        assert!(state.muted);
        assert_eq!(state.level, 0);
        assert_eq!(f.output.writes(), vec!["mute 42 true".to_string()]);

        record(&f.source, -30.0);
        f.source.shared.poll_state().await;
        f.source.shared.poll_state().await;
        let state = f.source.state();
        assert_eq!(state.playback, PlaybackState::Playing);
        assert!(!state.muted);
        assert_eq!(
            f.output.writes(),
            vec!["mute 42 true".to_string(), "mute 42 false".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bitstream_is_not_silence_muted() {
        let f = fixture(None);
        f.output.add_input("42", "gst-launch-1.0", 80);
        set_phase(&f.source, PipelinePhase::RunningBitstream(Codec::Ac3));

        tokio::time::advance(Duration::from_secs(10)).await;
        f.source.shared.poll_state().await;

        assert_eq!(f.source.state().playback, PlaybackState::Playing);
        assert!(f.output.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_output_stream_is_idle() {
        let f = fixture(None);
        f.source.shared.poll_state().await;
        let state = f.source.state();
        assert_eq!(state.playback, PlaybackState::Idle);
        assert_eq!(state.level, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_write_fences_stale_reads() {
        let f = fixture(None);
        f.output.add_input("42", "gst-launch-1.0", 40);
        set_phase(&f.source, PipelinePhase::RunningPcm);
        record(&f.source, -20.0);

        f.source.set_volume(70).await.unwrap();
        assert_eq!(f.output.input("42").unwrap().volume, Some(70));

        // The output path still reports the old value.
        f.output.update_input("42", |i| i.volume = Some(40));
        tokio::time::advance(Duration::from_millis(200)).await;
        f.source.shared.poll_state().await;
        assert_eq!(f.source.volume(), 70);

        tokio::time::advance(Duration::from_millis(400)).await;
        f.source.shared.poll_state().await;
        assert_eq!(f.source.volume(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_mute_survives_external_unmute() {
        let f = fixture(None);
        f.output.add_input("42", "gst-launch-1.0", 40);
        set_phase(&f.source, PipelinePhase::RunningPcm);
        record(&f.source, -20.0);

        f.source.set_muted(true).await.unwrap();
        assert!(f.output.input("42").unwrap().muted);

        f.output.update_input("42", |i| i.muted = false);
        tokio::time::advance(Duration::from_secs(1)).await;
        record(&f.source, -20.0);
        f.source.shared.poll_state().await;

        let state = f.source.state();
        assert!(state.muted);
        assert_eq!(state.level, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_mute_is_restored_after_silence() {
        let f = fixture(None);
        f.output.add_input("42", "gst-launch-1.0", 40);
        set_phase(&f.source, PipelinePhase::RunningPcm);
        f.source.shared.poll_state().await;
        assert_eq!(f.output.writes(), vec!["mute 42 true".to_string()]);

        f.source.set_muted(true).await.unwrap();
        record(&f.source, -20.0);
        f.source.shared.poll_state().await;

        assert_eq!(f.output.writes().last().map(String::as_str), Some("mute 42 true"));
        assert!(f.source.muted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_auto_mute_restores_user_mute() {
        let f = fixture(None);
        f.output.add_input("42", "gst-launch-1.0", 40);
        set_phase(&f.source, PipelinePhase::RunningPcm);
        f.source.shared.poll_state().await;
        assert!(f.output.input("42").unwrap().muted);

        f.source.set_auto_mute(false).await.unwrap();
        assert!(!f.source.auto_mute());
        assert!(!f.output.input("42").unwrap().muted);
        assert!(f.events.lock().contains(&SourceEvent::Changed {
            source: SourceKind::Tv,
            change: StateChange::AutoMute(false),
        }));
    }

    #[tokio::test]
    async fn test_control_requires_output_stream() {
        let f = fixture(None);
        assert!(matches!(
            f.source.set_volume(30).await,
            Err(SourceError::NotReady { .. })
        ));
        assert!(matches!(
            f.source.set_muted(true).await,
            Err(SourceError::NotReady { .. })
        ));
        assert!(matches!(
            f.source.play().await,
            Err(SourceError::Unsupported { operation: "play" })
        ));
    }

    #[test]
    fn test_silence_settings_clamp_and_notify() {
        let f = fixture(None);
        assert_eq!(f.source.set_silence_threshold(-100), -80);
        assert_eq!(f.source.silence_threshold(), -80);
        assert_eq!(f.source.set_silence_duration(60.0), 30.0);
        assert_eq!(f.source.set_silence_duration(f32::NAN), 0.5);

        let events = f.events.lock();
        assert!(events.contains(&SourceEvent::Changed {
            source: SourceKind::Tv,
            change: StateChange::SilenceThreshold(-80),
        }));
        assert!(events.contains(&SourceEvent::Changed {
            source: SourceKind::Tv,
            change: StateChange::SilenceDuration(30.0),
        }));
    }

    #[test]
    fn test_television_capability_is_exposed() {
        let f = fixture(None);
        let source: &dyn AudioSource = &f.source;
        assert!(source.television().is_some());
    }
}
