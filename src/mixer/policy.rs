//! Default-volume policy and activity edge detection.

use std::collections::HashMap;

use crate::config::{DefaultVolumes, MixerConfig};
use crate::source::SourceKind;

/// Mixer-wide settings that can change at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixerPolicy {
    /// Volume of the shared output device (0-100).
    pub master_volume: u8,
    /// Volume applied when a source starts, and on stop if `reset_on_stop`.
    pub default_volumes: DefaultVolumes,
    /// Reset a source to its default when it stops playing.
    pub reset_on_stop: bool,
    /// Ramp speed in percent per second; 0 disables ramping.
    pub slew_rate: u32,
}

impl From<&MixerConfig> for MixerPolicy {
    fn from(config: &MixerConfig) -> Self {
        Self {
            master_volume: config.master_volume.min(100),
            default_volumes: config.default_volumes,
            reset_on_stop: config.reset_on_stop,
            slew_rate: config.slew_rate,
        }
    }
}

/// An activity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edge {
    BecameActive,
    BecameInactive,
}

/// Policy plus the last activity seen per source.
#[derive(Debug)]
pub(crate) struct PolicyState {
    pub settings: MixerPolicy,
    was_active: HashMap<SourceKind, bool>,
}

impl PolicyState {
    pub fn new(settings: MixerPolicy) -> Self {
        Self {
            settings,
            was_active: HashMap::new(),
        }
    }

    /// Records `active` for `kind` and returns the transition, if any.
    ///
    /// A source never seen before counts as inactive.
    pub fn observe(&mut self, kind: SourceKind, active: bool) -> Option<Edge> {
        let was_active = self.was_active.insert(kind, active).unwrap_or(false);
        match (was_active, active) {
            (false, true) => Some(Edge::BecameActive),
            (true, false) => Some(Edge::BecameInactive),
            _ => None,
        }
    }
}
