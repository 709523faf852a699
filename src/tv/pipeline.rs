//! Decode pipeline probing and process lifecycle.
//!
//! The television input is either linear PCM or an S/PDIF-wrapped compressed
//! bitstream. A short capture is probed first; a detected codec selects a
//! decode chain, anything else falls back to PCM passthrough with a metering
//! tap on standard output.

use std::fmt;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::TvConfig;
use crate::exec;
use crate::PipelineError;

const GST_LAUNCH: &str = "gst-launch-1.0";

/// Compressed formats the decode chain understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// Dolby Digital.
    Ac3,
    /// Dolby Digital Plus.
    Eac3,
    /// DTS.
    Dts,
}

impl Codec {
    /// Maps a probe result (`ac3`, `eac3`, `dts`) to a codec.
    pub fn from_probe(name: &str) -> Option<Self> {
        match name.trim() {
            "ac3" => Some(Self::Ac3),
            "eac3" => Some(Self::Eac3),
            "dts" => Some(Self::Dts),
            _ => None,
        }
    }

    /// Probe name of the codec.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ac3 => "ac3",
            Self::Eac3 => "eac3",
            Self::Dts => "dts",
        }
    }

    fn caps(self) -> &'static str {
        match self {
            Self::Ac3 => "audio/x-ac3",
            Self::Eac3 => "audio/x-eac3",
            Self::Dts => "audio/x-dts",
        }
    }

    fn decode_chain(self) -> &'static str {
        match self {
            Self::Ac3 => "ac3parse ! avdec_ac3",
            Self::Eac3 => "ac3parse ! avdec_eac3",
            Self::Dts => "dcaparse ! avdec_dca",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pipeline to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    /// Extract and decode a compressed bitstream. No metering tap.
    Bitstream(Codec),
    /// Pass linear audio through and tee a copy for metering.
    Pcm,
}

/// Where the pipeline controller currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelinePhase {
    /// No pipeline process.
    #[default]
    Stopped,
    /// Sampling the input to choose a pipeline.
    Probing,
    /// Decoding a compressed bitstream.
    RunningBitstream(Codec),
    /// Passing PCM through with metering.
    RunningPcm,
}

impl From<PipelineKind> for PipelinePhase {
    fn from(kind: PipelineKind) -> Self {
        match kind {
            PipelineKind::Bitstream(codec) => Self::RunningBitstream(codec),
            PipelineKind::Pcm => Self::RunningPcm,
        }
    }
}

/// Devices and format a pipeline is launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTarget {
    /// Capture device identifier.
    pub capture_device: String,
    /// Output sink identifier.
    pub output_sink: String,
    /// Delay added before output, for lip sync.
    pub delay: Duration,
    /// Capture sample rate.
    pub sample_rate: u32,
    /// Capture channel count.
    pub channels: u16,
}

impl PipelineTarget {
    /// Builds a target from the TV configuration and a resolved sink.
    pub fn new(config: &TvConfig, output_sink: impl Into<String>) -> Self {
        Self {
            capture_device: config.capture_device.clone(),
            output_sink: output_sink.into(),
            delay: config.output_delay,
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }

    fn raw_caps(&self) -> String {
        format!(
            "audio/x-raw,format=S16LE,rate={},channels={}",
            self.sample_rate, self.channels
        )
    }
}

/// Raw PCM copy of the pipeline output, S16LE interleaved.
pub type MeterTap = Box<dyn AsyncRead + Send + Unpin>;

/// Starts decode pipelines.
#[async_trait]
pub trait PipelineLauncher: Send + Sync {
    /// Samples the input and returns the bitstream codec, or `None` for PCM.
    ///
    /// Failures and timeouts return `None`.
    async fn probe(&self, target: &PipelineTarget) -> Option<Codec>;

    /// Launches a pipeline of `kind`.
    fn launch(
        &self,
        kind: PipelineKind,
        target: &PipelineTarget,
    ) -> Result<Box<dyn PipelineProcess>, PipelineError>;
}

/// A running pipeline.
#[async_trait]
pub trait PipelineProcess: Send {
    /// OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// Returns `true` once the pipeline has exited.
    fn has_exited(&mut self) -> bool;

    /// Takes the metering tap. Only PCM pipelines have one.
    fn take_meter_tap(&mut self) -> Option<MeterTap>;

    /// Stops the pipeline, forcing it after `grace`.
    async fn terminate(&mut self, grace: Duration);
}

/// Launches GStreamer/FFmpeg pipelines as process groups.
#[derive(Debug, Clone)]
pub struct GstLauncher {
    probe_window: Duration,
    probe_timeout: Duration,
}

impl GstLauncher {
    /// Creates a launcher using the probe settings from `config`.
    pub fn new(config: &TvConfig) -> Self {
        Self {
            probe_window: config.probe_window,
            probe_timeout: config.probe_timeout,
        }
    }

    fn probe_script(&self, target: &PipelineTarget) -> String {
        let seconds = self.probe_window.as_secs_f64().ceil().max(1.0) as u64;
        let bytes = (target.sample_rate as f64
            * target.channels as f64
            * 2.0
            * self.probe_window.as_secs_f64()) as u64;
        format!(
            "arecord -D {device} -f S16_LE -r {rate} -c {channels} -t raw -d {seconds} 2>/dev/null \
             | head -c {bytes} \
             | ffprobe -hide_banner -loglevel error -f spdif -i pipe:0 \
               -show_entries stream=codec_name -of csv=p=0 -select_streams a",
            device = shell_quote(&target.capture_device),
            rate = target.sample_rate,
            channels = target.channels,
        )
    }
}

#[async_trait]
impl PipelineLauncher for GstLauncher {
    async fn probe(&self, target: &PipelineTarget) -> Option<Codec> {
        if !exec::tool_available("arecord") || !exec::tool_available("ffprobe") {
            warn!(source = "tv", "arecord or ffprobe not found, assuming PCM");
            return None;
        }

        let script = self.probe_script(target);
        match exec::run("sh", &["-c", &script], self.probe_timeout).await {
            Ok(out) => {
                let codec = out.lines().next().and_then(Codec::from_probe);
                if let Some(codec) = codec {
                    info!(source = "tv", %codec, "detected bitstream");
                }
                codec
            }
            Err(e) => {
                debug!(source = "tv", error = %e, "bitstream probe failed");
                None
            }
        }
    }

    fn launch(
        &self,
        kind: PipelineKind,
        target: &PipelineTarget,
    ) -> Result<Box<dyn PipelineProcess>, PipelineError> {
        let mut command = match kind {
            PipelineKind::Bitstream(codec) => {
                require(GST_LAUNCH)?;
                require("ffmpeg")?;
                let mut command = Command::new("sh");
                command
                    .arg("-c")
                    .arg(bitstream_script(codec, target))
                    .stdout(Stdio::null());
                command
            }
            PipelineKind::Pcm => {
                require(GST_LAUNCH)?;
                let mut command = Command::new(GST_LAUNCH);
                command.args(pcm_args(target)).stdout(Stdio::piped());
                command
            }
        };
        command
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|source| PipelineError::Spawn { source })?;
        let meter = child.stdout.take();
        let pgid = child.id();
        info!(source = "tv", ?kind, pid = ?pgid, "pipeline started");

        Ok(Box::new(GstProcess { child, pgid, meter }))
    }
}

fn require(tool: &str) -> Result<(), PipelineError> {
    if exec::tool_available(tool) {
        Ok(())
    } else {
        Err(PipelineError::ToolMissing {
            tool: tool.to_string(),
        })
    }
}

fn bitstream_script(codec: Codec, target: &PipelineTarget) -> String {
    let raw = target.raw_caps();
    format!(
        "{gst} -q alsasrc device={device} provide-clock=false ! {raw} ! fdsink fd=1 2>/dev/null \
         | ffmpeg -hide_banner -loglevel warning -f spdif -i pipe:0 -c:a copy -f {format} - 2>/dev/null \
         | {gst} -q fdsrc ! {caps},rate={rate} ! {decode} ! audioconvert ! audioresample \
           ! identity ts-offset={offset} ! {raw} ! pulsesink device={sink} sync=true",
        gst = GST_LAUNCH,
        device = shell_quote(&target.capture_device),
        format = codec.as_str(),
        caps = codec.caps(),
        rate = target.sample_rate,
        decode = codec.decode_chain(),
        offset = target.delay.as_nanos(),
        sink = shell_quote(&target.output_sink),
    )
}

fn pcm_args(target: &PipelineTarget) -> Vec<String> {
    let raw = target.raw_caps();
    let device = format!("device={}", target.capture_device);
    let offset = format!("ts-offset={}", target.delay.as_nanos());
    let sink = format!("device={}", target.output_sink);
    [
        "-q",
        "alsasrc",
        device.as_str(),
        "provide-clock=false",
        "!",
        raw.as_str(),
        "!",
        "tee",
        "name=t",
        "t.",
        "!",
        "queue",
        "!",
        "audioconvert",
        "!",
        "audioresample",
        "!",
        "identity",
        offset.as_str(),
        "!",
        "pulsesink",
        sink.as_str(),
        "sync=true",
        "t.",
        "!",
        "queue",
        "max-size-buffers=2",
        "!",
        "fdsink",
        "fd=1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

struct GstProcess {
    child: Child,
    pgid: Option<u32>,
    meter: Option<ChildStdout>,
}

#[async_trait]
impl PipelineProcess for GstProcess {
    fn id(&self) -> Option<u32> {
        self.pgid
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn take_meter_tap(&mut self) -> Option<MeterTap> {
        self.meter
            .take()
            .map(|stdout| Box::new(stdout) as MeterTap)
    }

    async fn terminate(&mut self, grace: Duration) {
        let Some(pgid) = self.pgid else {
            let _ = self.child.kill().await;
            return;
        };

        if let Err(e) = signal_group(pgid, libc::SIGTERM) {
            debug!(source = "tv", pgid, error = %e, "SIGTERM failed");
        }
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            warn!(source = "tv", pgid, "pipeline ignored SIGTERM, killing");
            if let Err(e) = signal_group(pgid, libc::SIGKILL) {
                debug!(source = "tv", pgid, error = %e, "SIGKILL failed");
            }
            let _ = self.child.wait().await;
        }
        info!(source = "tv", pgid, "pipeline stopped");
    }
}

/// Sends `signal` to every process in group `pgid`.
#[allow(unsafe_code)]
fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: killpg takes plain integers and touches no memory we own.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> PipelineTarget {
        PipelineTarget {
            capture_device: "hw:CARD=ClearClick,DEV=0".to_string(),
            output_sink: "alsa_output.usb-Focusrite_Scarlett.analog-stereo".to_string(),
            delay: Duration::from_millis(120),
            sample_rate: 48_000,
            channels: 2,
        }
    }

    #[test]
    fn test_codec_from_probe() {
        assert_eq!(Codec::from_probe("ac3"), Some(Codec::Ac3));
        assert_eq!(Codec::from_probe("eac3\n"), Some(Codec::Eac3));
        assert_eq!(Codec::from_probe("dts"), Some(Codec::Dts));
        assert_eq!(Codec::from_probe("pcm_s16le"), None);
        assert_eq!(Codec::from_probe(""), None);
    }

    #[test]
    fn test_phase_from_kind() {
        assert_eq!(PipelinePhase::from(PipelineKind::Pcm), PipelinePhase::RunningPcm);
        assert_eq!(
            PipelinePhase::from(PipelineKind::Bitstream(Codec::Dts)),
            PipelinePhase::RunningBitstream(Codec::Dts)
        );
    }

    #[test]
    fn test_bitstream_script_uses_codec_chain() {
        let script = bitstream_script(Codec::Dts, &target());
        assert!(script.contains("-f dts -"));
        assert!(script.contains("audio/x-dts,rate=48000"));
        assert!(script.contains("dcaparse ! avdec_dca"));
        assert!(script.contains("ts-offset=120000000"));
        assert!(script.contains("device='hw:CARD=ClearClick,DEV=0'"));
    }

    #[test]
    fn test_pcm_args_tee_to_stdout() {
        let args = pcm_args(&target());
        assert_eq!(args.first().map(String::as_str), Some("-q"));
        assert!(args.contains(&"device=hw:CARD=ClearClick,DEV=0".to_string()));
        assert!(args.contains(&"device=alsa_output.usb-Focusrite_Scarlett.analog-stereo".to_string()));
        assert!(args.ends_with(&["fdsink".to_string(), "fd=1".to_string()]));
    }

    #[test]
    fn test_probe_script_byte_count() {
        let launcher = GstLauncher {
            probe_window: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
        };
        let script = launcher.probe_script(&target());
        assert!(script.contains("head -c 192000"));
        assert!(script.contains("-d 1 "));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("hw:0"), "'hw:0'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_terminate_kills_process_group() {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg("sleep 30 & wait")
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .process_group(0);
        let child = command.spawn().unwrap();
        let pgid = child.id();
        let mut process = GstProcess {
            child,
            pgid,
            meter: None,
        };

        assert!(!process.has_exited());
        process.terminate(Duration::from_secs(2)).await;
        assert!(process.has_exited());
    }
}
