// Scan controller - one scanner, many requesters
//
// Every subsystem that wants scan time registers a job; the controller runs
// the scanner at the highest duty cycle among the active jobs and turns it
// off when the last job retires. The scanner is enabled iff at least one
// job is active.

use super::job::{ScanJob, ScanJobTimeMode};
use crate::ble::{BlePlatform, ScanParams};
use crate::util::ErrorLog;
use thiserror::Error;
use tracing::{debug, trace};

pub const MAX_SCAN_JOBS: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScanError {
    #[error("all scan job slots in use")]
    BufferFull,

    #[error("unknown scan job")]
    UnknownJob,
}

/// Stable reference to a scan job, valid until removal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanJobHandle {
    index: usize,
    generation: u32,
}

struct JobSlot {
    job: ScanJob,
    generation: u32,
}

pub struct ScanController {
    jobs: [Option<JobSlot>; MAX_SCAN_JOBS],
    next_generation: u32,
    applied: Option<ScanParams>,
}

impl ScanController {
    pub fn new() -> Self {
        Self {
            jobs: [None, None, None, None],
            next_generation: 1,
            applied: None,
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.iter().flatten().count()
    }

    pub fn scanning_active(&self) -> bool {
        self.applied.is_some()
    }

    /// The duty cycle currently applied to the scanner
    pub fn current_params(&self) -> Option<ScanParams> {
        self.applied
    }

    pub fn add_job(&mut self, job: ScanJob) -> Result<ScanJobHandle, ScanError> {
        let index = self
            .jobs
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(ScanError::BufferFull)?;
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        self.jobs[index] = Some(JobSlot { job, generation });
        debug!(index, "scan job added");
        Ok(ScanJobHandle { index, generation })
    }

    pub fn remove_job(&mut self, handle: ScanJobHandle) {
        if let Some(slot) = self.jobs[handle.index].as_ref() {
            if slot.generation == handle.generation {
                self.jobs[handle.index] = None;
                debug!(index = handle.index, "scan job removed");
            }
        }
    }

    pub fn get_job(&self, index: usize) -> Option<&ScanJob> {
        self.jobs.get(index).and_then(|s| s.as_ref()).map(|s| &s.job)
    }

    pub fn job_mut(&mut self, handle: ScanJobHandle) -> Option<&mut ScanJob> {
        self.jobs[handle.index]
            .as_mut()
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| &mut slot.job)
    }

    pub fn timer(&mut self, passed_ds: u16, radio: &mut dyn BlePlatform, _errors: &mut ErrorLog) {
        // Age timed jobs and retire the expired ones
        for slot in self.jobs.iter_mut() {
            let retire = match slot {
                Some(s) if s.job.time_mode == ScanJobTimeMode::Timed => {
                    s.job.time_left_ds = s.job.time_left_ds.saturating_sub(passed_ds as u32);
                    s.job.time_left_ds == 0
                }
                _ => false,
            };
            if retire {
                *slot = None;
            }
        }

        let winner = self
            .jobs
            .iter()
            .flatten()
            .filter(|s| s.job.is_active())
            .fold(None::<&JobSlot>, |best, s| match best {
                Some(b) if !s.job.higher_duty_than(&b.job) => Some(b),
                _ => Some(s),
            });

        match winner {
            Some(slot) => {
                let params = ScanParams {
                    interval_units: slot.job.interval_units,
                    window_units: slot.job.window_units,
                };
                if self.applied != Some(params) {
                    match radio.start_scanning(params) {
                        Ok(()) => {
                            trace!(
                                interval = params.interval_units,
                                window = params.window_units,
                                "scanner reconfigured"
                            );
                            self.applied = Some(params);
                        }
                        Err(err) => trace!(?err, "scanner start failed, retrying"),
                    }
                }
            }
            None => {
                if self.applied.is_some() {
                    match radio.stop_scanning() {
                        Ok(()) => {
                            trace!("scanner disabled");
                            self.applied = None;
                        }
                        Err(err) => trace!(?err, "scanner stop failed, retrying"),
                    }
                }
            }
        }
    }
}

impl Default for ScanController {
    fn default() -> Self {
        Self::new()
    }
}
