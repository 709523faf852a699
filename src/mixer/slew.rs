//! Volume ramp bookkeeping.

use std::collections::HashMap;

use crate::source::SourceKind;

/// Distance from the target at which a ramp snaps to it.
const SNAP: f32 = 0.5;

/// One in-flight ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SlewJob {
    /// Identifies the task driving this job.
    pub id: u64,
    pub current: f32,
    pub target: u8,
    /// The final step has been handed out; its write may still be in flight.
    pub done: bool,
}

/// The next value of a ramp, and whether it has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlewStep {
    pub volume: u8,
    pub done: bool,
}

/// In-flight ramps, at most one per source.
#[derive(Debug, Default)]
pub(crate) struct SlewTable {
    jobs: HashMap<SourceKind, SlewJob>,
    /// Volumes that overtook a job, keyed by job id, for its driver to restore.
    overrides: HashMap<u64, u8>,
    next_id: u64,
}

impl SlewTable {
    /// Retargets the job for `kind`, or creates one starting at `current`.
    ///
    /// Returns the id of a newly created job; `None` means an existing job
    /// was retargeted or there is nothing to do.
    pub fn begin(&mut self, kind: SourceKind, current: u8, target: u8) -> Option<u64> {
        if let Some(job) = self.jobs.get_mut(&kind).filter(|job| !job.done) {
            job.target = target;
            return None;
        }
        if current == target {
            return None;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.jobs.insert(
            kind,
            SlewJob {
                id,
                current: current as f32,
                target,
                done: false,
            },
        );
        Some(id)
    }

    /// Advances job `id` by `step` percent.
    ///
    /// Returns `None` if the job was cancelled, replaced or already done. The
    /// last step lands exactly on the target; the driver then calls
    /// [`finish`](Self::finish) once it has applied it.
    pub fn advance(&mut self, kind: SourceKind, id: u64, step: f32) -> Option<SlewStep> {
        let Some(job) = self
            .jobs
            .get_mut(&kind)
            .filter(|job| job.id == id && !job.done)
        else {
            self.overrides.remove(&id);
            return None;
        };
        let target = job.target as f32;

        job.current = if step <= 0.0 {
            target
        } else if job.current < target {
            (job.current + step).min(target)
        } else {
            (job.current - step).max(target)
        };

        let done = (job.current - target).abs() < SNAP;
        let volume = if done {
            job.target
        } else {
            job.current.round().clamp(0.0, 100.0) as u8
        };
        job.done = done;
        Some(SlewStep { volume, done })
    }

    /// Removes the job for `kind` if it is still job `id`.
    pub fn finish(&mut self, kind: SourceKind, id: u64) {
        if self.jobs.get(&kind).is_some_and(|job| job.id == id) {
            self.jobs.remove(&kind);
        }
        self.overrides.remove(&id);
    }

    /// Cancels the job for `kind`. Returns `true` if one was in flight.
    pub fn cancel(&mut self, kind: SourceKind) -> bool {
        self.jobs.remove(&kind).is_some()
    }

    /// Cancels the job for `kind` because the source now holds `volume`.
    ///
    /// A step written after this point is stale; the driver picks the volume
    /// up with [`take_override`](Self::take_override) and writes it back.
    pub fn override_with(&mut self, kind: SourceKind, volume: u8) -> bool {
        match self.jobs.remove(&kind) {
            Some(job) => {
                self.overrides.insert(job.id, volume);
                true
            }
            None => false,
        }
    }

    /// The volume that overtook job `id`, if any.
    pub fn take_override(&mut self, id: u64) -> Option<u8> {
        self.overrides.remove(&id)
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
        self.overrides.clear();
    }

    pub fn target(&self, kind: SourceKind) -> Option<u8> {
        self.jobs
            .get(&kind)
            .filter(|job| !job.done)
            .map(|job| job.target)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIND: SourceKind = SourceKind::Stream;

    fn drive(table: &mut SlewTable, id: u64, step: f32) -> Vec<u8> {
        let mut volumes = Vec::new();
        while let Some(s) = table.advance(KIND, id, step) {
            volumes.push(s.volume);
            if s.done {
                table.finish(KIND, id);
                break;
            }
        }
        volumes
    }

    #[test]
    fn test_ramp_up_is_monotonic_and_exact() {
        let mut table = SlewTable::default();
        let id = table.begin(KIND, 10, 50).unwrap();

        let volumes = drive(&mut table, id, 1.25);

        assert!(volumes.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(volumes.last(), Some(&50));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_ramp_down_never_overshoots() {
        let mut table = SlewTable::default();
        let id = table.begin(KIND, 80, 20).unwrap();

        let volumes = drive(&mut table, id, 7.0);

        assert!(volumes.windows(2).all(|w| w[0] > w[1]));
        assert!(volumes.iter().all(|&v| v >= 20));
        assert_eq!(volumes.last(), Some(&20));
    }

    #[test]
    fn test_retarget_keeps_single_job() {
        let mut table = SlewTable::default();
        let id = table.begin(KIND, 10, 50).unwrap();
        assert_eq!(table.begin(KIND, 10, 70), None);

        assert_eq!(table.len(), 1);
        assert_eq!(table.target(KIND), Some(70));
        assert_eq!(drive(&mut table, id, 5.0).last(), Some(&70));
    }

    #[test]
    fn test_no_job_when_already_at_target() {
        let mut table = SlewTable::default();
        assert_eq!(table.begin(KIND, 40, 40), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_cancelled_job_stops_advancing() {
        let mut table = SlewTable::default();
        let id = table.begin(KIND, 10, 50).unwrap();
        assert!(table.cancel(KIND));
        assert!(table.advance(KIND, id, 1.0).is_none());

        // A new job gets a new id; the old driver must not touch it.
        let new_id = table.begin(KIND, 10, 50).unwrap();
        assert_ne!(id, new_id);
        assert!(table.advance(KIND, id, 1.0).is_none());
        table.finish(KIND, id);
        assert_eq!(table.target(KIND), Some(50));
    }

    #[test]
    fn test_override_is_handed_to_driver() {
        let mut table = SlewTable::default();
        let id = table.begin(KIND, 10, 90).unwrap();
        table.advance(KIND, id, 1.0).unwrap();

        assert!(table.override_with(KIND, 40));
        assert_eq!(table.target(KIND), None);
        assert_eq!(table.take_override(id), Some(40));
        assert_eq!(table.take_override(id), None);
        assert!(table.advance(KIND, id, 1.0).is_none());
        assert!(!table.override_with(KIND, 40));
    }

    #[test]
    fn test_done_job_held_until_finished() {
        let mut table = SlewTable::default();
        let id = table.begin(KIND, 10, 50).unwrap();
        assert!(table.advance(KIND, id, 0.0).unwrap().done);

        // The last write is still in flight: no target, but an external
        // change must still reach the driver.
        assert_eq!(table.target(KIND), None);
        assert!(table.advance(KIND, id, 0.0).is_none());
        let id = table.begin(KIND, 50, 60).unwrap();
        assert!(table.advance(KIND, id, 0.0).unwrap().done);
        assert!(table.override_with(KIND, 5));
        assert_eq!(table.take_override(id), Some(5));

        table.finish(KIND, id);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_zero_step_jumps_to_target() {
        let mut table = SlewTable::default();
        let id = table.begin(KIND, 10, 50).unwrap();
        assert_eq!(
            table.advance(KIND, id, 0.0),
            Some(SlewStep {
                volume: 50,
                done: true
            })
        );
    }
}
