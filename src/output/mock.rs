//! In-memory output path for testing without a sound server.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{OutputControl, SinkInput};
use crate::{ExecError, OutputError};

/// A fake sound server holding playback streams in memory.
///
/// Streams are added with [`add_input`](Self::add_input) and mutated by the
/// [`OutputControl`] calls exactly as a real server would, so a test can drive
/// a source and then inspect what it wrote.
///
/// # Example
///
/// ```
/// use media_bridge::output::{MockOutput, OutputControl};
///
/// # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// # rt.block_on(async {
/// let output = MockOutput::new();
/// output.add_input("12", "spotifyd", 80);
///
/// output.set_sink_input_volume("12", 30).await.unwrap();
/// assert_eq!(output.input("12").unwrap().volume, Some(30));
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MockOutput {
    inputs: Mutex<Vec<SinkInput>>,
    sinks: Mutex<Vec<String>>,
    master_volume: Mutex<Option<u8>>,
    writes: Mutex<Vec<String>>,
    unavailable: AtomicBool,
    failing: AtomicBool,
}

impl MockOutput {
    /// Creates an empty, ready output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a playback stream.
    pub fn add_input(&self, id: &str, binary: &str, volume: u8) {
        self.inputs.lock().push(SinkInput {
            id: id.to_string(),
            binary: binary.to_string(),
            volume: Some(volume),
            muted: false,
            corked: false,
        });
    }

    /// Removes a playback stream.
    pub fn remove_input(&self, id: &str) {
        self.inputs.lock().retain(|input| input.id != id);
    }

    /// Updates a playback stream in place, as an outside client would.
    pub fn update_input(&self, id: &str, f: impl FnOnce(&mut SinkInput)) {
        if let Some(input) = self.inputs.lock().iter_mut().find(|i| i.id == id) {
            f(input);
        }
    }

    /// Returns a copy of the playback stream with `id`.
    pub fn input(&self, id: &str) -> Option<SinkInput> {
        self.inputs.lock().iter().find(|i| i.id == id).cloned()
    }

    /// Adds an output device name.
    pub fn add_sink(&self, name: &str) {
        self.sinks.lock().push(name.to_string());
    }

    /// Returns the last master volume written.
    pub fn master_volume(&self) -> Option<u8> {
        *self.master_volume.lock()
    }

    /// Returns a log of every write, e.g. `"volume 12 30"` or `"mute 12 true"`.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    /// Makes [`is_ready`](OutputControl::is_ready) report `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes every write fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_failing(&self) -> Result<(), OutputError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ExecError::Failed {
                program: "mock".to_string(),
                code: Some(1),
                stderr: "write rejected".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn with_input<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut SinkInput) -> T,
    ) -> Result<T, OutputError> {
        let mut inputs = self.inputs.lock();
        let input = inputs.iter_mut().find(|i| i.id == id).ok_or_else(|| {
            OutputError::from(ExecError::Failed {
                program: "mock".to_string(),
                code: Some(1),
                stderr: format!("no sink input #{id}"),
            })
        })?;
        Ok(f(input))
    }
}

#[async_trait]
impl OutputControl for MockOutput {
    async fn is_ready(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn find_sink(&self, patterns: &[String]) -> Result<Option<String>, OutputError> {
        Ok(self
            .sinks
            .lock()
            .iter()
            .find(|name| patterns.iter().all(|p| name.contains(p.as_str())))
            .cloned())
    }

    async fn sink_input(&self, patterns: &[&str]) -> Result<Option<SinkInput>, OutputError> {
        Ok(self
            .inputs
            .lock()
            .iter()
            .find(|input| patterns.iter().any(|p| input.matches(p)))
            .cloned())
    }

    async fn set_sink_input_volume(&self, id: &str, volume: u8) -> Result<(), OutputError> {
        self.check_failing()?;
        self.with_input(id, |input| input.volume = Some(volume.min(100)))?;
        self.writes.lock().push(format!("volume {id} {volume}"));
        Ok(())
    }

    async fn set_sink_input_mute(&self, id: &str, muted: bool) -> Result<(), OutputError> {
        self.check_failing()?;
        self.with_input(id, |input| input.muted = muted)?;
        self.writes.lock().push(format!("mute {id} {muted}"));
        Ok(())
    }

    async fn set_master_volume(&self, volume: u8) -> Result<(), OutputError> {
        self.check_failing()?;
        *self.master_volume.lock() = Some(volume.min(100));
        self.writes.lock().push(format!("master {volume}"));
        Ok(())
    }
}
