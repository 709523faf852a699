//! `pactl`-backed output control.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{OutputControl, SinkInput};
use crate::exec;
use crate::OutputError;

const PACTL: &str = "pactl";

/// Output control through the `pactl` command-line client.
///
/// Works against PulseAudio and against PipeWire via pipewire-pulse.
#[derive(Debug, Clone)]
pub struct Pactl {
    timeout: Duration,
}

impl Pactl {
    /// Creates a client whose calls give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Returns `true` if the `pactl` binary is installed.
    pub fn is_installed() -> bool {
        exec::tool_available(PACTL)
    }

    async fn pactl(&self, args: &[&str]) -> Result<String, OutputError> {
        Ok(exec::run(PACTL, args, self.timeout).await?)
    }
}

impl Default for Pactl {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl OutputControl for Pactl {
    async fn is_ready(&self) -> bool {
        match self.pactl(&["info"]).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "sound server not ready");
                false
            }
        }
    }

    async fn find_sink(&self, patterns: &[String]) -> Result<Option<String>, OutputError> {
        let out = self.pactl(&["list", "short", "sinks"]).await?;
        Ok(parse_short_sinks(&out)
            .into_iter()
            .find(|name| patterns.iter().all(|p| name.contains(p.as_str()))))
    }

    async fn sink_input(&self, patterns: &[&str]) -> Result<Option<SinkInput>, OutputError> {
        let out = self.pactl(&["list", "sink-inputs"]).await?;
        Ok(parse_sink_inputs(&out)
            .into_iter()
            .find(|input| patterns.iter().any(|p| input.matches(p))))
    }

    async fn set_sink_input_volume(&self, id: &str, volume: u8) -> Result<(), OutputError> {
        let volume = format!("{}%", volume.min(100));
        self.pactl(&["set-sink-input-volume", id, &volume]).await?;
        Ok(())
    }

    async fn set_sink_input_mute(&self, id: &str, muted: bool) -> Result<(), OutputError> {
        let flag = if muted { "1" } else { "0" };
        self.pactl(&["set-sink-input-mute", id, flag]).await?;
        Ok(())
    }

    async fn set_master_volume(&self, volume: u8) -> Result<(), OutputError> {
        let volume = format!("{}%", volume.min(100));
        self.pactl(&["set-sink-volume", "@DEFAULT_SINK@", &volume]).await?;
        Ok(())
    }
}

/// Parses `pactl list sink-inputs` output.
///
/// Blocks start at `Sink Input #N`. Only the fields the bridge uses are kept;
/// the volume is the first percentage on the `Volume:` line.
pub fn parse_sink_inputs(output: &str) -> Vec<SinkInput> {
    let mut inputs = Vec::new();
    let mut current: Option<SinkInput> = None;

    for line in output.lines() {
        let line = line.trim();

        if let Some(id) = line.strip_prefix("Sink Input #") {
            inputs.extend(current.take());
            current = Some(SinkInput {
                id: id.trim().to_string(),
                ..Default::default()
            });
            continue;
        }

        let Some(input) = current.as_mut() else {
            continue;
        };

        if let Some(value) = line.strip_prefix("Corked:") {
            input.corked = value.trim() == "yes";
        } else if let Some(value) = line.strip_prefix("Mute:") {
            input.muted = value.trim() == "yes";
        } else if let Some(value) = line.strip_prefix("Volume:") {
            input.volume = first_percent(value);
        } else if let Some(value) = line.strip_prefix("application.process.binary") {
            input.binary = quoted_value(value).to_string();
        }
    }

    inputs.extend(current);
    inputs
}

/// Parses `pactl list short sinks` output into sink names.
pub fn parse_short_sinks(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

fn first_percent(text: &str) -> Option<u8> {
    let end = text.find('%')?;
    let digits: String = text[..end]
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse::<u32>().ok().map(|v| v.min(100) as u8)
}

fn quoted_value(text: &str) -> &str {
    let text = text.trim_start().trim_start_matches('=').trim();
    text.trim_matches('"')
}
