//! Level metering of the decoded PCM tap.
//!
//! The PCM pipeline copies its output as interleaved signed 16-bit
//! little-endian samples to a pipe. Bytes are collected into fixed windows
//! (50 ms by default) and each window's RMS level is recorded on the shared
//! [`SilenceMonitor`].

use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::silence::SilenceMonitor;
use crate::source::worker::StopSignal;
use crate::state::LEVEL_DB_FLOOR;

const READ_BUFFER: usize = 4096;

/// Windows held before the oldest samples are overwritten.
const WINDOW_CAPACITY: usize = 4;

/// Calculates the RMS level of `samples` in dBFS.
///
/// Digital silence and empty input report [`LEVEL_DB_FLOOR`].
pub fn calculate_rms_db(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return LEVEL_DB_FLOOR;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64).powi(2)).sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();
    if rms > 0.0 {
        let db = 20.0 * (rms / 32768.0).log10();
        (db as f32).max(LEVEL_DB_FLOOR)
    } else {
        LEVEL_DB_FLOOR
    }
}

/// Maps a dBFS level to the 0-100 meter scale (-50 dB reads 0, 0 dB reads
/// 100). A muted output always reads 0.
pub fn level_from_db(level_db: f32, muted: bool) -> u8 {
    if muted {
        return 0;
    }
    ((level_db + 50.0) * 2.0).clamp(0.0, 100.0) as u8
}

/// Collects raw tap bytes into fixed-size sample windows.
pub(crate) struct SampleWindow {
    samples: HeapRb<i16>,
    window: usize,
    carry: Option<u8>,
}

impl SampleWindow {
    /// Creates a collector for windows of `window` interleaved samples.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: HeapRb::new(window * WINDOW_CAPACITY),
            window,
            carry: None,
        }
    }

    /// Appends little-endian bytes. A trailing odd byte is held until the
    /// next call.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let mut rest = bytes;
        if let Some(low) = self.carry.take() {
            let Some((&high, tail)) = rest.split_first() else {
                self.carry = Some(low);
                return;
            };
            self.samples.push_overwrite(i16::from_le_bytes([low, high]));
            rest = tail;
        }

        let mut pairs = rest.chunks_exact(2);
        for pair in &mut pairs {
            self.samples.push_overwrite(i16::from_le_bytes([pair[0], pair[1]]));
        }
        if let [odd] = pairs.remainder() {
            self.carry = Some(*odd);
        }
    }

    /// Takes the next complete window, if one is buffered.
    pub fn next_window(&mut self) -> Option<Vec<i16>> {
        if self.samples.occupied_len() < self.window {
            return None;
        }
        let mut window = vec![0i16; self.window];
        let read = self.samples.pop_slice(&mut window);
        window.truncate(read);
        Some(window)
    }
}

/// Reads the tap until it closes or `stop` is raised, recording one level
/// per window.
pub(crate) async fn run_meter<R>(
    mut tap: R,
    silence: Arc<Mutex<SilenceMonitor>>,
    mut window: SampleWindow,
    mut stop: StopSignal,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let read = tokio::select! {
            read = tap.read(&mut buf) => read,
            () = stop.stopped() => break,
        };
        match read {
            Ok(0) => {
                debug!(source = "tv", "meter tap closed");
                break;
            }
            Ok(n) => {
                window.push_bytes(&buf[..n]);
                while let Some(samples) = window.next_window() {
                    let level_db = calculate_rms_db(&samples);
                    silence.lock().record_level(level_db, Instant::now());
                }
            }
            Err(e) => {
                warn!(source = "tv", error = %e, "meter tap read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::worker::Worker;
    use std::time::Duration;

    fn tone(amplitude: i16, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    fn to_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_rms_full_scale() {
        let db = calculate_rms_db(&tone(i16::MAX, 100));
        assert!(db.abs() < 0.01, "got {db}");
    }

    #[test]
    fn test_rms_half_scale() {
        let db = calculate_rms_db(&tone(16384, 100));
        assert!((db + 6.02).abs() < 0.01, "got {db}");
    }

    #[test]
    fn test_rms_silence_and_empty() {
        assert_eq!(calculate_rms_db(&[0; 64]), LEVEL_DB_FLOOR);
        assert_eq!(calculate_rms_db(&[]), LEVEL_DB_FLOOR);
    }

    #[test]
    fn test_rms_floor_clamps_tiny_signal() {
        let mut samples = vec![0i16; 1_000_000];
        samples[0] = 1;
        assert_eq!(calculate_rms_db(&samples), LEVEL_DB_FLOOR);
    }

    #[test]
    fn test_level_from_db() {
        assert_eq!(level_from_db(0.0, false), 100);
        assert_eq!(level_from_db(-25.0, false), 50);
        assert_eq!(level_from_db(-50.0, false), 0);
        assert_eq!(level_from_db(-90.0, false), 0);
        assert_eq!(level_from_db(-10.0, true), 0);
    }

    #[test]
    fn test_window_collects_split_samples() {
        let mut window = SampleWindow::new(4);
        let bytes = to_bytes(&[1, 2, 3, 4, 5]);

        // Split in the middle of a sample.
        window.push_bytes(&bytes[..3]);
        assert!(window.next_window().is_none());
        window.push_bytes(&bytes[3..]);

        assert_eq!(window.next_window(), Some(vec![1, 2, 3, 4]));
        assert!(window.next_window().is_none());
    }

    #[test]
    fn test_window_overwrites_oldest() {
        let mut window = SampleWindow::new(2);
        let samples: Vec<i16> = (0..10).collect();
        window.push_bytes(&to_bytes(&samples));

        // Capacity is 4 windows of 2; the first two samples were dropped.
        assert_eq!(window.next_window(), Some(vec![2, 3]));
    }

    #[tokio::test]
    async fn test_meter_records_levels() {
        let silence = Arc::new(Mutex::new(SilenceMonitor::new(
            -50,
            Duration::from_secs(3),
            true,
        )));
        let worker = Worker::new("meter-test", Duration::from_secs(1));
        let stop = worker.arm();

        let bytes = to_bytes(&tone(16384, 8));
        run_meter(&bytes[..], silence.clone(), SampleWindow::new(8), stop).await;

        let db = silence.lock().current_db();
        assert!((db + 6.02).abs() < 0.01, "got {db}");
    }
}
