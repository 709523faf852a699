//! The mixer: one owner for every source, the policy that spans them, and the
//! outward view of their state.
//!
//! Sources report through a [`SourceCallback`]; [`event_channel`] creates a
//! callback that queues events for the mixer's event pump, which applies
//! default-volume policy and forwards each change to the publishers.
//!
//! # Volume ramps
//!
//! With a non-zero slew rate, [`AudioMixer::set_source_volume`] moves the
//! volume toward the target in steps of `rate * tick` percent, applying and
//! publishing every step. A second request while a ramp is in flight only
//! moves its target. An external volume change cancels the ramp, and a step
//! still being written when that happens is undone.

mod policy;
mod slew;

pub use policy::MixerPolicy;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{MixerConfig, SILENCE_THRESHOLD_MAX, SILENCE_THRESHOLD_MIN};
use crate::event::{source_callback, SourceCallback, SourceEvent, StateChange};
use crate::output::OutputControl;
use crate::publish::{Publisher, Scope, StateUpdate};
use crate::source::{AudioSource, SourceKind, TelevisionControl};
use crate::state::{PlaybackState, SourceState};
use crate::MixerError;
use policy::{Edge, PolicyState};
use slew::SlewTable;

/// Receiving side of [`event_channel`].
pub type EventReceiver = mpsc::UnboundedReceiver<SourceEvent>;

/// Creates a callback for sources plus the receiver the mixer drains.
///
/// The channel is unbounded so a source is never blocked by the mixer.
pub fn event_channel() -> (SourceCallback, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = source_callback(move |event| {
        // Closed only after the mixer has stopped.
        let _ = tx.send(event);
    });
    (callback, rx)
}

/// Owns the sources and applies mixer policy. Cheap to clone.
#[derive(Clone)]
pub struct AudioMixer {
    inner: Arc<Inner>,
}

struct Inner {
    sources: BTreeMap<SourceKind, Arc<dyn AudioSource>>,
    publishers: Vec<Arc<dyn Publisher>>,
    output: Arc<dyn OutputControl>,
    policy: Mutex<PolicyState>,
    slews: Mutex<SlewTable>,
    settles: Mutex<HashMap<SourceKind, JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    slew_tick: Duration,
    settle_delay: Duration,
}

impl AudioMixer {
    /// Creates a mixer over `sources`. A later source of the same kind
    /// replaces an earlier one.
    pub fn new(
        config: &MixerConfig,
        sources: Vec<Arc<dyn AudioSource>>,
        output: Arc<dyn OutputControl>,
        publishers: Vec<Arc<dyn Publisher>>,
    ) -> Self {
        let sources = sources.into_iter().map(|s| (s.kind(), s)).collect();
        Self {
            inner: Arc::new(Inner {
                sources,
                publishers,
                output,
                policy: Mutex::new(PolicyState::new(MixerPolicy::from(config))),
                slews: Mutex::new(SlewTable::default()),
                settles: Mutex::new(HashMap::new()),
                pump: Mutex::new(None),
                slew_tick: config.slew_tick,
                settle_delay: config.settle_delay,
            }),
        }
    }

    /// Spawns the task that applies queued source events in order.
    pub fn spawn_event_pump(&self, mut events: EventReceiver) {
        let mixer = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                mixer.handle_event(event).await;
            }
            debug!("event pump finished");
        });
        if let Some(old) = self.inner.pump.lock().replace(handle) {
            old.abort();
        }
    }

    /// Applies policy for one source event and publishes it.
    pub async fn handle_event(&self, event: SourceEvent) {
        match event {
            SourceEvent::ExternalVolume { source, volume } => {
                if self.inner.slews.lock().override_with(source, volume) {
                    info!(source = %source, volume, "external volume change, ramp cancelled");
                } else {
                    debug!(source = %source, volume, "external volume change");
                }
                self.inner
                    .publish(StateUpdate::new(Scope::Source(source), "volume", volume))
                    .await;
            }
            SourceEvent::Changed { source, change } => {
                let playback = match &change {
                    StateChange::Playback(playback) => Some(*playback),
                    _ => None,
                };
                if let Some(playback) = playback {
                    self.inner.on_playback(source, playback).await;
                }
                self.inner
                    .publish(StateUpdate::new(
                        Scope::Source(source),
                        change.attribute(),
                        change.value(),
                    ))
                    .await;
                if playback.is_some() {
                    self.inner.publish_active().await;
                }
            }
        }
    }

    /// Applies default volumes and the master volume, then starts every source.
    ///
    /// A source that fails to start is logged and left out; the rest run.
    pub async fn start(&self) {
        self.apply_default_volumes().await;

        let master = self.inner.policy.lock().settings.master_volume;
        if let Err(e) = self.set_master_volume(master.into()).await {
            warn!(error = %e, "failed to apply master volume");
        }

        for (kind, source) in &self.inner.sources {
            match source.start().await {
                Ok(()) => info!(source = %kind, "source started"),
                Err(e) => error!(source = %kind, error = %e, "failed to start source"),
            }
        }
    }

    /// Cancels every ramp and pending default, then stops all sources.
    pub async fn stop(&self) {
        self.inner.slews.lock().clear();
        for (_, handle) in self.inner.settles.lock().drain() {
            handle.abort();
        }

        join_all(self.inner.sources.iter().map(|(kind, source)| async move {
            source.stop().await;
            info!(source = %kind, "source stopped");
        }))
        .await;

        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
    }

    /// Sets every source to its default volume. Used once at startup.
    pub async fn apply_default_volumes(&self) {
        for (kind, source) in &self.inner.sources {
            let volume = self.inner.policy.lock().settings.default_volumes.get(*kind);
            match source.set_volume(volume).await {
                Ok(()) => info!(source = %kind, volume, "applied default volume"),
                Err(e) => debug!(source = %kind, error = %e, "default volume not applied"),
            }
        }
    }

    /// Looks up a source by name.
    pub fn source(&self, name: &str) -> Result<Arc<dyn AudioSource>, MixerError> {
        let kind: SourceKind = name.parse()?;
        self.inner
            .sources
            .get(&kind)
            .cloned()
            .ok_or_else(|| MixerError::unknown_source(name))
    }

    /// Kinds of all registered sources.
    pub fn kinds(&self) -> Vec<SourceKind> {
        self.inner.sources.keys().copied().collect()
    }

    /// Snapshot of every source's state.
    pub fn states(&self) -> BTreeMap<SourceKind, SourceState> {
        self.inner
            .sources
            .iter()
            .map(|(kind, source)| (*kind, source.state()))
            .collect()
    }

    /// Sources currently playing.
    pub fn active_sources(&self) -> Vec<SourceKind> {
        self.inner.active_sources()
    }

    /// Snapshot of the mixer settings.
    pub fn policy(&self) -> MixerPolicy {
        self.inner.policy.lock().settings.clone()
    }

    /// Sets a source's volume, clamped to 0-100.
    ///
    /// Ramps when `use_slew` is set and the slew rate is non-zero; otherwise
    /// the source is set immediately.
    pub async fn set_source_volume(
        &self,
        name: &str,
        volume: i64,
        use_slew: bool,
    ) -> Result<(), MixerError> {
        let source = self.source(name)?;
        let kind = source.kind();
        let target = clamp_percent(volume);
        let rate = self.inner.policy.lock().settings.slew_rate;

        if !use_slew || rate == 0 {
            return source
                .set_volume(target)
                .await
                .map_err(|e| MixerError::source(kind, e));
        }

        let current = source.volume();
        let job = self.inner.slews.lock().begin(kind, current, target);
        match job {
            Some(id) => {
                info!(source = %kind, from = current, to = target, rate, "starting volume ramp");
                tokio::spawn(self.inner.clone().run_slew(kind, source, id));
            }
            None => debug!(source = %kind, target, "ramp retargeted or already at target"),
        }
        Ok(())
    }

    /// Target of the ramp in flight for `kind`, if any.
    pub fn slew_target(&self, kind: SourceKind) -> Option<u8> {
        self.inner.slews.lock().target(kind)
    }

    /// Cancels the ramp in flight for `kind`, if any.
    pub fn stop_slew(&self, kind: SourceKind) {
        self.inner.slews.lock().cancel(kind);
    }

    /// Mutes or unmutes a source.
    pub async fn set_source_mute(&self, name: &str, muted: bool) -> Result<(), MixerError> {
        let source = self.source(name)?;
        source
            .set_muted(muted)
            .await
            .map_err(|e| MixerError::source(source.kind(), e))
    }

    /// Toggles a source's mute.
    pub async fn toggle_source_mute(&self, name: &str) -> Result<(), MixerError> {
        let source = self.source(name)?;
        source
            .toggle_mute()
            .await
            .map_err(|e| MixerError::source(source.kind(), e))
    }

    /// Resumes playback on a source.
    pub async fn source_play(&self, name: &str) -> Result<(), MixerError> {
        let source = self.source(name)?;
        source
            .play()
            .await
            .map_err(|e| MixerError::source(source.kind(), e))
    }

    /// Pauses playback on a source.
    pub async fn source_pause(&self, name: &str) -> Result<(), MixerError> {
        let source = self.source(name)?;
        source
            .pause()
            .await
            .map_err(|e| MixerError::source(source.kind(), e))
    }

    /// Stops playback on a source.
    pub async fn source_stop(&self, name: &str) -> Result<(), MixerError> {
        let source = self.source(name)?;
        source
            .stop_playback()
            .await
            .map_err(|e| MixerError::source(source.kind(), e))
    }

    /// Current master volume.
    pub fn master_volume(&self) -> u8 {
        self.inner.policy.lock().settings.master_volume
    }

    /// Sets the master volume, clamped to 0-100, and writes it to the
    /// output device. The value is stored even if the write fails.
    pub async fn set_master_volume(&self, volume: i64) -> Result<(), MixerError> {
        let volume = clamp_percent(volume);
        self.inner.policy.lock().settings.master_volume = volume;

        self.inner.output.set_master_volume(volume).await?;
        info!(volume, "master volume set");
        self.inner
            .publish(StateUpdate::new(Scope::Master, "volume", volume))
            .await;
        Ok(())
    }

    /// Default volume for a source.
    pub fn default_volume(&self, name: &str) -> Result<u8, MixerError> {
        let kind = self.source(name)?.kind();
        Ok(self.inner.policy.lock().settings.default_volumes.get(kind))
    }

    /// Sets the default volume for a source, or for every source with `all`.
    /// Returns the stored value.
    pub async fn set_default_volume(&self, name: &str, volume: i64) -> Result<u8, MixerError> {
        let volume = clamp_percent(volume);
        let scope = if name.eq_ignore_ascii_case("all") {
            let mut policy = self.inner.policy.lock();
            for kind in self.inner.sources.keys() {
                policy.settings.default_volumes.set(*kind, volume);
            }
            Scope::All
        } else {
            let kind = self.source(name)?.kind();
            self.inner
                .policy
                .lock()
                .settings
                .default_volumes
                .set(kind, volume);
            Scope::Source(kind)
        };

        info!(scope = %scope, volume, "default volume set");
        self.inner
            .publish(StateUpdate::new(scope, "default_volume", volume))
            .await;
        Ok(volume)
    }

    /// Whether sources reset to their default volume when they stop.
    pub fn reset_on_stop(&self) -> bool {
        self.inner.policy.lock().settings.reset_on_stop
    }

    /// Enables or disables reset-on-stop.
    pub async fn set_reset_on_stop(&self, enabled: bool) {
        self.inner.policy.lock().settings.reset_on_stop = enabled;
        info!(enabled, "reset-on-stop set");
        self.inner
            .publish(StateUpdate::new(Scope::Master, "reset_on_stop", enabled))
            .await;
    }

    /// Ramp speed in percent per second.
    pub fn slew_rate(&self) -> u32 {
        self.inner.policy.lock().settings.slew_rate
    }

    /// Sets the ramp speed; negative values become 0 (instant). Returns the
    /// stored value.
    pub async fn set_slew_rate(&self, rate: i64) -> u32 {
        let rate = u32::try_from(rate.max(0)).unwrap_or(u32::MAX);
        self.inner.policy.lock().settings.slew_rate = rate;
        info!(rate, "slew rate set");
        self.inner
            .publish(StateUpdate::new(Scope::Master, "slew_rate", rate))
            .await;
        rate
    }

    /// The television source, whatever it implements.
    fn tv(&self) -> Result<Arc<dyn AudioSource>, MixerError> {
        self.inner
            .sources
            .get(&SourceKind::Tv)
            .cloned()
            .ok_or_else(|| MixerError::unknown_source(SourceKind::Tv.as_str()))
    }

    /// The television source, which must implement [`TelevisionControl`].
    fn tv_source(&self) -> Result<Arc<dyn AudioSource>, MixerError> {
        let source = self.tv()?;
        if source.television().is_none() {
            return Err(MixerError::MissingCapability {
                capability: "television",
            });
        }
        Ok(source)
    }

    fn with_tv<T>(&self, f: impl FnOnce(&dyn TelevisionControl) -> T) -> Result<T, MixerError> {
        let source = self.tv_source()?;
        source
            .television()
            .map(f)
            .ok_or(MixerError::MissingCapability {
                capability: "television",
            })
    }

    /// Television silence threshold (dB).
    pub fn tv_silence_threshold(&self) -> Result<i32, MixerError> {
        self.with_tv(|tv| tv.silence_threshold())
    }

    /// Sets the television silence threshold. Returns the stored value.
    pub fn set_tv_silence_threshold(&self, db: i64) -> Result<i32, MixerError> {
        let db = db.clamp(SILENCE_THRESHOLD_MIN.into(), SILENCE_THRESHOLD_MAX.into()) as i32;
        self.with_tv(|tv| tv.set_silence_threshold(db))
    }

    /// Television silence duration (seconds).
    pub fn tv_silence_duration(&self) -> Result<f32, MixerError> {
        self.with_tv(|tv| tv.silence_duration())
    }

    /// Sets the television silence duration. Returns the stored value.
    pub fn set_tv_silence_duration(&self, seconds: f32) -> Result<f32, MixerError> {
        self.with_tv(|tv| tv.set_silence_duration(seconds))
    }

    /// Whether the television auto-mutes on silence.
    pub fn tv_auto_mute(&self) -> Result<bool, MixerError> {
        self.with_tv(|tv| tv.auto_mute())
    }

    /// Enables or disables television auto-mute.
    pub async fn set_tv_auto_mute(&self, enabled: bool) -> Result<(), MixerError> {
        let source = self.tv_source()?;
        let tv = source.television().ok_or(MixerError::MissingCapability {
            capability: "television",
        })?;
        tv.set_auto_mute(enabled)
            .await
            .map_err(|e| MixerError::source(SourceKind::Tv, e))
    }

    /// Last measured television level (dB).
    pub fn tv_level_db(&self) -> Result<f32, MixerError> {
        self.with_tv(|tv| tv.level_db())
    }

    /// Reports TV power to the television source.
    pub async fn set_tv_power(&self, on: bool) -> Result<(), MixerError> {
        let source = self.tv_source()?;
        let tv = source.television().ok_or(MixerError::MissingCapability {
            capability: "television",
        })?;
        tv.set_tv_power(on).await;
        Ok(())
    }

    /// Raises the television volume by `step`, without ramping.
    pub async fn tv_volume_up(&self, step: u8) -> Result<(), MixerError> {
        self.step_tv_volume(i16::from(step)).await
    }

    /// Lowers the television volume by `step`, without ramping.
    pub async fn tv_volume_down(&self, step: u8) -> Result<(), MixerError> {
        self.step_tv_volume(-i16::from(step)).await
    }

    async fn step_tv_volume(&self, delta: i16) -> Result<(), MixerError> {
        let source = self.tv()?;
        let current = source.volume();
        let volume = (i16::from(current) + delta).clamp(0, 100) as u8;
        debug!(from = current, to = volume, "tv volume step");
        source
            .set_volume(volume)
            .await
            .map_err(|e| MixerError::source(SourceKind::Tv, e))
    }

    /// Toggles the television mute.
    pub async fn tv_mute_toggle(&self) -> Result<(), MixerError> {
        let source = self.tv()?;
        source
            .toggle_mute()
            .await
            .map_err(|e| MixerError::source(SourceKind::Tv, e))
    }

    /// Publishes every source snapshot and every mixer setting.
    pub async fn publish_full_state(&self) {
        let mut updates = Vec::new();
        for (kind, source) in &self.inner.sources {
            let scope = Scope::Source(*kind);
            let state = source.state();
            updates.push(StateUpdate::new(scope, "state", state.playback.as_str()));
            updates.push(StateUpdate::new(scope, "volume", state.volume));
            updates.push(StateUpdate::new(scope, "muted", state.muted));
            updates.push(StateUpdate::new(scope, "level", state.level));
            updates.push(StateUpdate::new(scope, "title", state.title));
            updates.push(StateUpdate::new(scope, "artist", state.artist));

            if let Some(tv) = source.television() {
                updates.push(StateUpdate::new(scope, "level_db", json!(tv.level_db())));
                updates.push(StateUpdate::new(
                    scope,
                    "silence_threshold",
                    tv.silence_threshold(),
                ));
                updates.push(StateUpdate::new(
                    scope,
                    "silence_duration",
                    json!(tv.silence_duration()),
                ));
                updates.push(StateUpdate::new(scope, "auto_mute", tv.auto_mute()));
            }
        }

        let policy = self.policy();
        updates.push(StateUpdate::new(Scope::Master, "volume", policy.master_volume));
        updates.push(StateUpdate::new(
            Scope::Master,
            "reset_on_stop",
            policy.reset_on_stop,
        ));
        updates.push(StateUpdate::new(Scope::Master, "slew_rate", policy.slew_rate));
        for kind in self.inner.sources.keys() {
            updates.push(StateUpdate::new(
                Scope::Source(*kind),
                "default_volume",
                policy.default_volumes.get(*kind),
            ));
        }

        for update in updates {
            self.inner.publish(update).await;
        }
        self.inner.publish_active().await;
    }
}

impl Inner {
    /// Sends an update to every publisher concurrently.
    async fn publish(&self, update: StateUpdate) {
        let update = &update;
        join_all(self.publishers.iter().map(|publisher| async move {
            if let Err(e) = publisher.publish(update).await {
                warn!(
                    publisher = publisher.name(),
                    topic = %update.topic(),
                    error = %e,
                    "publish failed"
                );
            }
        }))
        .await;
    }

    fn active_sources(&self) -> Vec<SourceKind> {
        self.sources
            .iter()
            .filter(|(_, source)| source.is_active())
            .map(|(kind, _)| *kind)
            .collect()
    }

    async fn publish_active(&self) {
        let active: Vec<&str> = self
            .active_sources()
            .into_iter()
            .map(|kind| kind.as_str())
            .collect();
        self.publish(StateUpdate::new(Scope::Sources, "active", json!(active)))
            .await;
    }

    async fn on_playback(self: &Arc<Self>, kind: SourceKind, playback: PlaybackState) {
        let (edge, default, reset_on_stop) = {
            let mut policy = self.policy.lock();
            let edge = policy.observe(kind, playback.is_active());
            (
                edge,
                policy.settings.default_volumes.get(kind),
                policy.settings.reset_on_stop,
            )
        };
        let Some(source) = self.sources.get(&kind).cloned() else {
            return;
        };

        match edge {
            Some(Edge::BecameActive) => {
                info!(source = %kind, "source started playing");
                let inner = self.clone();
                let handle = tokio::spawn(async move {
                    // Give the source's output stream time to appear.
                    tokio::time::sleep(inner.settle_delay).await;
                    let volume = inner.policy.lock().settings.default_volumes.get(kind);
                    inner.apply_default(kind, &source, volume).await;
                });
                if let Some(old) = self.settles.lock().insert(kind, handle) {
                    old.abort();
                }
            }
            Some(Edge::BecameInactive) => {
                info!(source = %kind, "source stopped playing");
                if let Some(pending) = self.settles.lock().remove(&kind) {
                    pending.abort();
                }
                if reset_on_stop {
                    self.slews.lock().override_with(kind, default);
                    self.apply_default(kind, &source, default).await;
                } else {
                    self.slews.lock().cancel(kind);
                }
            }
            None => {}
        }
    }

    async fn apply_default(&self, kind: SourceKind, source: &Arc<dyn AudioSource>, volume: u8) {
        match source.set_volume(volume).await {
            Ok(()) => {
                info!(source = %kind, volume, "applied default volume");
                self.publish(StateUpdate::new(Scope::Source(kind), "volume", volume))
                    .await;
            }
            Err(e) => warn!(source = %kind, volume, error = %e, "default volume not applied"),
        }
    }

    async fn run_slew(self: Arc<Self>, kind: SourceKind, source: Arc<dyn AudioSource>, id: u64) {
        loop {
            let step = self.policy.lock().settings.slew_rate as f32 * self.slew_tick.as_secs_f32();
            let Some(next) = self.slews.lock().advance(kind, id, step) else {
                debug!(source = %kind, "ramp cancelled");
                return;
            };

            let written = source.set_volume(next.volume).await;

            // The job was overtaken while the step was being written.
            let overridden = self.slews.lock().take_override(id);
            if let Some(volume) = overridden {
                debug!(source = %kind, stale = next.volume, volume, "ramp overtaken, restoring volume");
                if let Err(e) = source.set_volume(volume).await {
                    warn!(source = %kind, volume, error = %e, "failed to restore volume after ramp");
                }
                return;
            }

            if let Err(e) = written {
                warn!(source = %kind, volume = next.volume, error = %e, "ramp step failed, abandoning ramp");
                self.slews.lock().finish(kind, id);
                return;
            }
            self.publish(StateUpdate::new(Scope::Source(kind), "volume", next.volume))
                .await;

            if next.done {
                self.slews.lock().finish(kind, id);
                debug!(source = %kind, volume = next.volume, "ramp complete");
                return;
            }
            tokio::time::sleep(self.slew_tick).await;
        }
    }
}

fn clamp_percent(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::output::MockOutput;
    use crate::publish::ChannelPublisher;
    use crate::source::MockSource;
    use crate::state::StatePatch;
    use crate::SourceError;

    struct Fixture {
        mixer: AudioMixer,
        sources: BTreeMap<SourceKind, Arc<MockSource>>,
        output: Arc<MockOutput>,
        updates: mpsc::Receiver<StateUpdate>,
    }

    fn fixture(config: MixerConfig) -> Fixture {
        let (callback, events) = event_channel();
        let sources: BTreeMap<_, _> = SourceKind::ALL
            .iter()
            .map(|kind| {
                let source = MockSource::with_callback(*kind, callback.clone());
                let source = if *kind == SourceKind::Stream {
                    source.with_transport()
                } else {
                    source
                };
                (*kind, Arc::new(source))
            })
            .collect();
        let output = Arc::new(MockOutput::new());
        let (tx, updates) = mpsc::channel(1024);
        let mixer = AudioMixer::new(
            &config,
            sources
                .values()
                .map(|s| s.clone() as Arc<dyn AudioSource>)
                .collect(),
            output.clone(),
            vec![Arc::new(ChannelPublisher::new(tx))],
        );
        mixer.spawn_event_pump(events);
        Fixture {
            mixer,
            sources,
            output,
            updates,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<StateUpdate>) -> Vec<StateUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update);
        }
        out
    }

    fn volumes(updates: &[StateUpdate], kind: SourceKind) -> Vec<u8> {
        updates
            .iter()
            .filter(|u| u.scope == Scope::Source(kind) && u.attribute == "volume")
            .filter_map(|u| u.value.as_u64().map(|v| v as u8))
            .collect()
    }

    fn instant() -> MixerConfig {
        MixerConfig {
            slew_rate: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_instant_volume_is_clamped() {
        let f = fixture(instant());
        f.mixer.set_source_volume("cast", 150, true).await.unwrap();
        assert_eq!(f.sources[&SourceKind::Cast].volume(), 100);

        f.mixer.set_source_volume("cast", -5, true).await.unwrap();
        assert_eq!(f.sources[&SourceKind::Cast].volume(), 0);
    }

    #[tokio::test]
    async fn test_unknown_source_is_rejected() {
        let f = fixture(instant());
        assert!(matches!(
            f.mixer.set_source_volume("radio", 10, false).await,
            Err(MixerError::UnknownSource { .. })
        ));
        assert!(matches!(
            f.mixer.source_play("radio").await,
            Err(MixerError::UnknownSource { .. })
        ));
    }

    #[tokio::test]
    async fn test_source_failure_is_reported() {
        let f = fixture(instant());
        assert!(matches!(
            f.mixer.source_pause("cast").await,
            Err(MixerError::Source {
                source_kind: SourceKind::Cast,
                error: SourceError::Unsupported { .. },
            })
        ));
        f.mixer.source_pause("stream").await.unwrap();
        assert_eq!(f.sources[&SourceKind::Stream].transport_calls(), vec!["pause"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_volume_on_start_edge() {
        let mut f = fixture(instant());
        let stream = &f.sources[&SourceKind::Stream];
        stream.set_volume(70).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drain(&mut f.updates);

        stream.emit_playback(PlaybackState::Playing);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(stream.volume(), 15);
        let updates = drain(&mut f.updates);
        assert!(volumes(&updates, SourceKind::Stream).contains(&15));
        assert!(updates.iter().any(|u| u.topic() == "sources/active" && u.value == json!(["stream"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_playing_applies_default_once() {
        let f = fixture(instant());
        let stream = &f.sources[&SourceKind::Stream];

        for playback in [PlaybackState::Playing, PlaybackState::Playing] {
            f.mixer
                .handle_event(SourceEvent::Changed {
                    source: SourceKind::Stream,
                    change: StateChange::Playback(playback),
                })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(stream.volume_writes(), vec![15]);

        f.mixer
            .handle_event(SourceEvent::Changed {
                source: SourceKind::Stream,
                change: StateChange::Playback(PlaybackState::Idle),
            })
            .await;
        assert_eq!(stream.volume_writes(), vec![15, 15]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_settle_cancels_default() {
        let f = fixture(MixerConfig {
            reset_on_stop: false,
            ..instant()
        });
        let cast = &f.sources[&SourceKind::Cast];

        cast.emit_playback(PlaybackState::Playing);
        tokio::time::sleep(Duration::from_millis(100)).await;
        cast.emit_playback(PlaybackState::Idle);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(cast.volume_writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_on_stop_disabled() {
        let f = fixture(MixerConfig {
            reset_on_stop: false,
            ..instant()
        });
        let tv = &f.sources[&SourceKind::Tv];
        tv.emit_playback(PlaybackState::Playing);
        tokio::time::sleep(Duration::from_millis(500)).await;
        tv.emit_playback(PlaybackState::Idle);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(tv.volume_writes(), vec![15]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_retarget_keeps_single_job() {
        let f = fixture(MixerConfig::default());
        let cast = &f.sources[&SourceKind::Cast];
        cast.set_volume(10).await.unwrap();

        f.mixer.set_source_volume("cast", 50, true).await.unwrap();
        assert_eq!(f.mixer.slew_target(SourceKind::Cast), Some(50));
        f.mixer.set_source_volume("cast", 30, true).await.unwrap();
        assert_eq!(f.mixer.slew_target(SourceKind::Cast), Some(30));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.mixer.slew_target(SourceKind::Cast), None);
        assert_eq!(cast.volume(), 30);

        let writes = cast.volume_writes();
        assert!(writes.windows(2).all(|w| w[0] < w[1]), "{writes:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_volume_cancels_ramp() {
        let mut f = fixture(MixerConfig::default());
        let cast = &f.sources[&SourceKind::Cast];
        cast.set_volume(10).await.unwrap();

        f.mixer.set_source_volume("cast", 90, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        cast.emit_external_volume(40);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.mixer.slew_target(SourceKind::Cast), None);

        let writes_before = cast.volume_writes().len();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cast.volume_writes().len(), writes_before);
        assert_eq!(cast.volume(), 40);
        assert_eq!(volumes(&drain(&mut f.updates), SourceKind::Cast).last(), Some(&40));
    }

    /// Delegates to a mock, taking a while to apply each volume.
    struct SlowSource {
        inner: Arc<MockSource>,
        delay: Duration,
    }

    #[async_trait]
    impl AudioSource for SlowSource {
        fn kind(&self) -> SourceKind {
            self.inner.kind()
        }

        fn state(&self) -> SourceState {
            self.inner.state()
        }

        async fn start(&self) -> Result<(), SourceError> {
            self.inner.start().await
        }

        async fn stop(&self) {
            self.inner.stop().await;
        }

        async fn set_volume(&self, volume: u8) -> Result<(), SourceError> {
            tokio::time::sleep(self.delay).await;
            self.inner.set_volume(volume).await
        }

        async fn set_muted(&self, muted: bool) -> Result<(), SourceError> {
            self.inner.set_muted(muted).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_volume_during_slow_step_wins() {
        let (callback, events) = event_channel();
        let cast = Arc::new(MockSource::with_callback(SourceKind::Cast, callback));
        let slow = Arc::new(SlowSource {
            inner: cast.clone(),
            delay: Duration::from_millis(30),
        });
        let (tx, mut updates) = mpsc::channel(1024);
        let mixer = AudioMixer::new(
            &MixerConfig::default(),
            vec![slow as Arc<dyn AudioSource>],
            Arc::new(MockOutput::new()),
            vec![Arc::new(ChannelPublisher::new(tx))],
        );
        mixer.spawn_event_pump(events);
        cast.set_volume(10).await.unwrap();

        mixer.set_source_volume("cast", 90, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // The first step is still being written.
        cast.emit_external_volume(40);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(mixer.slew_target(SourceKind::Cast), None);
        assert_eq!(cast.volume(), 40);
        assert_eq!(cast.volume_writes().last(), Some(&40));
        assert_eq!(volumes(&drain(&mut updates), SourceKind::Cast).last(), Some(&40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_edge_during_slow_step_keeps_default() {
        let (callback, events) = event_channel();
        let cast = Arc::new(MockSource::with_callback(SourceKind::Cast, callback));
        let slow = Arc::new(SlowSource {
            inner: cast.clone(),
            delay: Duration::from_millis(30),
        });
        let mixer = AudioMixer::new(
            &MixerConfig::default(),
            vec![slow as Arc<dyn AudioSource>],
            Arc::new(MockOutput::new()),
            Vec::new(),
        );
        mixer.spawn_event_pump(events);
        cast.emit_playback(PlaybackState::Playing);
        tokio::time::sleep(Duration::from_secs(1)).await;

        mixer.set_source_volume("cast", 90, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cast.emit_playback(PlaybackState::Idle);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(mixer.slew_target(SourceKind::Cast), None);
        assert_eq!(cast.volume(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ramp_step_abandons_ramp() {
        let f = fixture(MixerConfig::default());
        let tv = &f.sources[&SourceKind::Tv];
        tv.set_failing(true);

        f.mixer.set_source_volume("tv", 80, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.mixer.slew_target(SourceKind::Tv), None);
    }

    #[tokio::test]
    async fn test_master_volume_round_trip() {
        let mut f = fixture(instant());
        for (requested, stored) in [(42, 42), (0, 0), (100, 100), (250, 100), (-3, 0)] {
            f.mixer.set_master_volume(requested).await.unwrap();
            assert_eq!(f.mixer.master_volume(), stored);
            assert_eq!(f.output.master_volume(), Some(stored));
        }
        let updates = drain(&mut f.updates);
        assert_eq!(updates.last(), Some(&StateUpdate::new(Scope::Master, "volume", 0)));
    }

    #[tokio::test]
    async fn test_master_volume_stored_when_write_fails() {
        let f = fixture(instant());
        f.output.set_failing(true);
        assert!(f.mixer.set_master_volume(33).await.is_err());
        assert_eq!(f.mixer.master_volume(), 33);
    }

    #[tokio::test]
    async fn test_default_volume_settings() {
        let mut f = fixture(instant());
        assert_eq!(f.mixer.set_default_volume("tv", 140).await.unwrap(), 100);
        assert_eq!(f.mixer.default_volume("tv").unwrap(), 100);

        f.mixer.set_default_volume("all", 25).await.unwrap();
        for kind in SourceKind::ALL {
            assert_eq!(f.mixer.default_volume(kind.as_str()).unwrap(), 25);
        }
        assert!(f.mixer.set_default_volume("radio", 10).await.is_err());

        let updates = drain(&mut f.updates);
        assert!(updates.contains(&StateUpdate::new(Scope::All, "default_volume", 25)));
    }

    #[tokio::test]
    async fn test_settings_are_published() {
        let mut f = fixture(instant());
        f.mixer.set_reset_on_stop(false).await;
        assert_eq!(f.mixer.set_slew_rate(-10).await, 0);
        assert!(!f.mixer.reset_on_stop());

        let topics: Vec<_> = drain(&mut f.updates).iter().map(StateUpdate::topic).collect();
        assert_eq!(topics, vec!["master/reset_on_stop", "master/slew_rate"]);
    }

    #[tokio::test]
    async fn test_tv_passthrough_requires_capability() {
        let f = fixture(instant());
        assert!(matches!(
            f.mixer.tv_silence_threshold(),
            Err(MixerError::MissingCapability { .. })
        ));
        assert!(matches!(
            f.mixer.set_tv_power(true).await,
            Err(MixerError::MissingCapability { .. })
        ));
    }

    #[tokio::test]
    async fn test_tv_volume_steps() {
        let f = fixture(instant());
        let tv = &f.sources[&SourceKind::Tv];
        tv.set_volume(97).await.unwrap();

        f.mixer.tv_volume_up(5).await.unwrap();
        assert_eq!(tv.volume(), 100);
        f.mixer.tv_volume_down(30).await.unwrap();
        assert_eq!(tv.volume(), 70);
        f.mixer.tv_mute_toggle().await.unwrap();
        assert!(tv.muted());
    }

    #[tokio::test]
    async fn test_start_applies_defaults_and_master() {
        let f = fixture(instant());
        f.mixer.start().await;

        for source in f.sources.values() {
            assert_eq!(source.volume(), 15);
            assert!(source.is_started());
        }
        assert_eq!(f.output.master_volume(), Some(50));

        f.mixer.stop().await;
        assert!(f.sources.values().all(|s| !s.is_started()));
    }

    #[tokio::test]
    async fn test_full_state_publication() {
        let mut f = fixture(instant());
        f.sources[&SourceKind::Cast].emit(StatePatch::new().title("Song"));
        f.sources[&SourceKind::Cast].emit_playback(PlaybackState::Playing);
        f.mixer.publish_full_state().await;

        let updates = drain(&mut f.updates);
        assert!(updates.contains(&StateUpdate::new(Scope::Sources, "active", json!(["cast"]))));
        let topics: Vec<_> = updates.iter().map(StateUpdate::topic).collect();
        for topic in [
            "source/stream/state",
            "source/cast/title",
            "source/tv/volume",
            "master/volume",
            "master/slew_rate",
            "source/tv/default_volume",
            "sources/active",
        ] {
            assert!(topics.iter().any(|t| t == topic), "missing {topic}");
        }
    }
}
