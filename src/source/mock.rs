//! Mock audio source for testing without hardware.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AudioSource, SourceKind};
use crate::event::{discard_events, SourceCallback, SourceEvent};
use crate::state::{PlaybackState, SourceState, StateCell, StatePatch};
use crate::SourceError;

/// A source whose observations are scripted by the test.
///
/// Control calls are recorded and applied to the state like a real source
/// would, including change notifications. The `emit_*` methods stand in for
/// the monitoring loop.
///
/// # Example
///
/// ```
/// use media_bridge::{MockSource, PlaybackState, SourceKind, AudioSource};
///
/// let mock = MockSource::new(SourceKind::Stream);
/// mock.emit_playback(PlaybackState::Playing);
/// assert!(mock.is_active());
/// ```
pub struct MockSource {
    cell: StateCell,
    volume_writes: Mutex<Vec<u8>>,
    transport_calls: Mutex<Vec<&'static str>>,
    supports_transport: AtomicBool,
    failing: AtomicBool,
    started: AtomicBool,
}

impl MockSource {
    /// Creates a mock whose notifications are discarded.
    pub fn new(kind: SourceKind) -> Self {
        Self::with_callback(kind, discard_events())
    }

    /// Creates a mock reporting through `callback`.
    pub fn with_callback(kind: SourceKind, callback: SourceCallback) -> Self {
        Self {
            cell: StateCell::new(kind, callback),
            volume_writes: Mutex::new(Vec::new()),
            transport_calls: Mutex::new(Vec::new()),
            supports_transport: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    /// Makes play, pause, and stop succeed instead of reporting unsupported.
    #[must_use]
    pub fn with_transport(self) -> Self {
        self.supports_transport.store(true, Ordering::SeqCst);
        self
    }

    /// Simulates the monitoring loop observing a playback state.
    pub fn emit_playback(&self, playback: PlaybackState) {
        self.cell.apply(StatePatch::new().playback(playback));
    }

    /// Simulates the monitoring loop observing arbitrary values.
    pub fn emit(&self, patch: StatePatch) {
        self.cell.apply(patch);
    }

    /// Simulates a volume change made outside this process.
    pub fn emit_external_volume(&self, volume: u8) {
        let volume = volume.min(100);
        self.cell.apply(StatePatch::new().volume(volume));
        self.cell.notify(SourceEvent::ExternalVolume {
            source: self.cell.kind(),
            volume,
        });
    }

    /// Returns every volume passed to `set_volume`, in order.
    pub fn volume_writes(&self) -> Vec<u8> {
        self.volume_writes.lock().clone()
    }

    /// Returns every transport call made, in order.
    pub fn transport_calls(&self) -> Vec<&'static str> {
        self.transport_calls.lock().clone()
    }

    /// Makes every control call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns `true` between `start` and `stop`.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn check_failing(&self) -> Result<(), SourceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::not_ready("mock failure"));
        }
        Ok(())
    }

    fn transport(&self, operation: &'static str) -> Result<(), SourceError> {
        if !self.supports_transport.load(Ordering::SeqCst) {
            return Err(SourceError::unsupported(operation));
        }
        self.check_failing()?;
        self.transport_calls.lock().push(operation);
        Ok(())
    }
}

#[async_trait]
impl AudioSource for MockSource {
    fn kind(&self) -> SourceKind {
        self.cell.kind()
    }

    fn state(&self) -> SourceState {
        self.cell.snapshot()
    }

    async fn start(&self) -> Result<(), SourceError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    async fn set_volume(&self, volume: u8) -> Result<(), SourceError> {
        self.check_failing()?;
        let volume = volume.min(100);
        self.volume_writes.lock().push(volume);
        self.cell.apply(StatePatch::new().volume(volume));
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<(), SourceError> {
        self.check_failing()?;
        self.cell.apply(StatePatch::new().muted(muted));
        Ok(())
    }

    async fn play(&self) -> Result<(), SourceError> {
        self.transport("play")
    }

    async fn pause(&self) -> Result<(), SourceError> {
        self.transport("pause")
    }

    async fn stop_playback(&self) -> Result<(), SourceError> {
        self.transport("stop")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{source_callback, StateChange};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_mock_source_records_volume() {
        let mock = MockSource::new(SourceKind::Tv);
        mock.set_volume(30).await.unwrap();
        mock.set_volume(140).await.unwrap();

        assert_eq!(mock.volume_writes(), vec![30, 100]);
        assert_eq!(mock.volume(), 100);
    }

    #[tokio::test]
    async fn test_mock_source_toggle_mute() {
        let mock = MockSource::new(SourceKind::Cast);
        mock.toggle_mute().await.unwrap();
        assert!(mock.muted());
        mock.toggle_mute().await.unwrap();
        assert!(!mock.muted());
    }

    #[tokio::test]
    async fn test_mock_source_failing() {
        let mock = MockSource::new(SourceKind::Stream);
        mock.set_failing(true);
        assert!(mock.set_volume(10).await.is_err());
        assert!(mock.volume_writes().is_empty());
    }

    #[tokio::test]
    async fn test_mock_source_transport() {
        let mock = MockSource::new(SourceKind::Stream).with_transport();
        mock.play().await.unwrap();
        mock.stop_playback().await.unwrap();
        assert_eq!(mock.transport_calls(), vec!["play", "stop"]);
    }

    #[test]
    fn test_mock_source_external_volume_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let mock = MockSource::with_callback(
            SourceKind::Cast,
            source_callback(move |e| sink.lock().push(e)),
        );

        mock.emit_external_volume(40);

        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                SourceEvent::Changed {
                    source: SourceKind::Cast,
                    change: StateChange::Volume(40),
                },
                SourceEvent::ExternalVolume {
                    source: SourceKind::Cast,
                    volume: 40,
                },
            ]
        );
    }
}
