// Advertising controller - time-multiplexes payloads over the one advertiser
//
// Keeps a small pool of jobs and rotates through the scheduled ones, giving
// each its slot budget per round. Immediate jobs cut the line until their
// slots are spent. The radio is only reconfigured when the active payload
// actually changes, so a single job advertises without interruption.

use super::job::{AdvJob, AdvJobType};
use crate::ble::{AdvParams, BlePlatform};
use crate::util::{ErrorCode, ErrorLog};
use thiserror::Error;
use tracing::{debug, trace};

pub const MAX_ADV_JOBS: usize = 3;

/// Consecutive radio failures tolerated before the condition is logged
const FAIL_STREAK_LIMIT: u8 = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AdvError {
    #[error("all advertising job slots in use")]
    BufferFull,

    #[error("unknown advertising job")]
    UnknownJob,
}

/// Stable reference to a job, valid until the job is removed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdvJobHandle {
    index: usize,
    generation: u32,
}

struct JobSlot {
    job: AdvJob,
    generation: u32,
    data_version: u32,
    slots_left: u8,
    delay_left: u8,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct AppliedJob {
    index: usize,
    generation: u32,
    data_version: u32,
}

pub struct AdvertisingController {
    jobs: [Option<JobSlot>; MAX_ADV_JOBS],
    next_generation: u32,
    rotation: usize,
    applied: Option<AppliedJob>,
    advertising_active: bool,
    fail_streak: u8,
}

impl AdvertisingController {
    pub fn new() -> Self {
        Self {
            jobs: [None, None, None],
            next_generation: 1,
            rotation: 0,
            applied: None,
            advertising_active: false,
            fail_streak: 0,
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.iter().flatten().count()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising_active
    }

    pub fn add_job(&mut self, job: AdvJob) -> Result<AdvJobHandle, AdvError> {
        let index = self
            .jobs
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(AdvError::BufferFull)?;
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let slots = job.slots;
        let delay = job.delay;
        self.jobs[index] = Some(JobSlot {
            job,
            generation,
            data_version: 0,
            slots_left: slots,
            delay_left: delay,
        });
        debug!(index, "advertising job added");
        Ok(AdvJobHandle { index, generation })
    }

    pub fn remove_job(&mut self, handle: AdvJobHandle) {
        if let Some(slot) = self.jobs[handle.index].as_ref() {
            if slot.generation == handle.generation {
                self.jobs[handle.index] = None;
                debug!(index = handle.index, "advertising job removed");
            }
        }
    }

    /// Mutable access to a job's payload and parameters. Call
    /// [`refresh_job`](Self::refresh_job) afterwards so the change reaches
    /// the radio.
    pub fn job_mut(&mut self, handle: AdvJobHandle) -> Option<&mut AdvJob> {
        self.jobs[handle.index]
            .as_mut()
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| &mut slot.job)
    }

    /// Re-read the job's data and reset its rotation state
    pub fn refresh_job(&mut self, handle: AdvJobHandle) -> Result<(), AdvError> {
        let slot = self.jobs[handle.index]
            .as_mut()
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(AdvError::UnknownJob)?;
        slot.data_version = slot.data_version.wrapping_add(1);
        slot.slots_left = slot.job.slots;
        Ok(())
    }

    /// The job that should currently own the advertiser
    fn determine_current_job(&self) -> Option<usize> {
        // Immediate jobs preempt the rotation
        if let Some(index) = self.jobs.iter().position(|slot| {
            slot.as_ref()
                .map(|s| s.job.job_type == AdvJobType::Immediate && s.delay_left == 0)
                .unwrap_or(false)
        }) {
            return Some(index);
        }
        let eligible = |slot: &Option<JobSlot>| {
            slot.as_ref()
                .map(|s| s.delay_left == 0 && s.slots_left > 0)
                .unwrap_or(false)
        };
        // Current rotation position first, then any other eligible job
        if eligible(&self.jobs[self.rotation % MAX_ADV_JOBS]) {
            return Some(self.rotation % MAX_ADV_JOBS);
        }
        (0..MAX_ADV_JOBS).find(|&i| eligible(&self.jobs[i]))
    }

    fn advance_rotation(&mut self, from: usize) {
        for offset in 1..=MAX_ADV_JOBS {
            let index = (from + offset) % MAX_ADV_JOBS;
            if let Some(slot) = self.jobs[index].as_mut() {
                if slot.delay_left == 0 && slot.job.job_type == AdvJobType::Scheduled {
                    slot.slots_left = slot.job.slots;
                    self.rotation = index;
                    return;
                }
            }
        }
        // Only the current job remains; restart its budget
        if let Some(slot) = self.jobs[from].as_mut() {
            slot.slots_left = slot.job.slots;
            self.rotation = from;
        }
    }

    pub fn timer(&mut self, _passed_ds: u16, radio: &mut dyn BlePlatform, errors: &mut ErrorLog) {
        for slot in self.jobs.iter_mut().flatten() {
            if slot.delay_left > 0 {
                slot.delay_left -= 1;
            }
        }

        let Some(current) = self.determine_current_job() else {
            if self.advertising_active {
                match radio.stop_advertising() {
                    Ok(()) => {
                        self.advertising_active = false;
                        self.applied = None;
                        self.fail_streak = 0;
                    }
                    Err(err) => {
                        trace!(?err, "stopping advertiser failed, retrying");
                        self.note_radio_failure(errors);
                    }
                }
            }
            return;
        };

        // Spend one slot of the current job and rotate when exhausted
        let (finished, is_immediate) = {
            let slot = self.jobs[current].as_mut().unwrap();
            slot.slots_left = slot.slots_left.saturating_sub(1);
            (slot.slots_left == 0, slot.job.job_type == AdvJobType::Immediate)
        };

        self.apply_job(current, radio, errors);

        if finished {
            if is_immediate {
                self.jobs[current] = None;
                self.applied = None;
            } else {
                self.advance_rotation(current);
            }
        }
    }

    fn apply_job(&mut self, index: usize, radio: &mut dyn BlePlatform, errors: &mut ErrorLog) {
        let slot = self.jobs[index].as_ref().unwrap();
        let wanted = AppliedJob {
            index,
            generation: slot.generation,
            data_version: slot.data_version,
        };
        if self.applied == Some(wanted) && self.advertising_active {
            return;
        }
        let params = AdvParams {
            interval_units: slot.job.interval_units,
            adv_type: slot.job.adv_type,
        };
        match radio.start_advertising(params, slot.job.adv_data.as_slice(), slot.job.scan_data.as_slice())
        {
            Ok(()) => {
                trace!(index, "advertiser reconfigured");
                self.applied = Some(wanted);
                self.advertising_active = true;
                self.fail_streak = 0;
            }
            Err(err) => {
                trace!(?err, "advertiser reconfigure failed, retrying");
                self.note_radio_failure(errors);
            }
        }
    }

    fn note_radio_failure(&mut self, errors: &mut ErrorLog) {
        self.fail_streak = self.fail_streak.saturating_add(1);
        if self.fail_streak == FAIL_STREAK_LIMIT {
            errors.push_error(
                ErrorCode::WarnAdvertisingControllerDeactivateFailed,
                self.fail_streak as u32,
                0,
            );
        }
    }
}

impl Default for AdvertisingController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{AdvType, BleError, BleGapAddr, ConnHandle, HciReason, ScanParams};

    /// Radio stub recording the advertising payloads it was given
    struct RecordingRadio {
        applied: Vec<Vec<u8>>,
        stopped: u32,
        fail_next: bool,
    }

    impl RecordingRadio {
        fn new() -> Self {
            Self {
                applied: Vec::new(),
                stopped: 0,
                fail_next: false,
            }
        }
    }

    impl BlePlatform for RecordingRadio {
        fn start_advertising(
            &mut self,
            _params: AdvParams,
            adv_data: &[u8],
            _scan_data: &[u8],
        ) -> Result<(), BleError> {
            if self.fail_next {
                self.fail_next = false;
                return Err(BleError::Busy);
            }
            self.applied.push(adv_data.to_vec());
            Ok(())
        }

        fn stop_advertising(&mut self) -> Result<(), BleError> {
            self.stopped += 1;
            Ok(())
        }

        fn start_scanning(&mut self, _params: ScanParams) -> Result<(), BleError> {
            Ok(())
        }

        fn stop_scanning(&mut self) -> Result<(), BleError> {
            Ok(())
        }

        fn connect(&mut self, _addr: BleGapAddr, _timeout_ds: u16) -> Result<(), BleError> {
            Ok(())
        }

        fn disconnect(&mut self, _conn: ConnHandle, _reason: HciReason) -> Result<(), BleError> {
            Ok(())
        }

        fn gatt_write(
            &mut self,
            _conn: ConnHandle,
            _characteristic: u16,
            _data: &[u8],
            _reliable: bool,
        ) -> Result<(), BleError> {
            Ok(())
        }

        fn set_tx_power(&mut self, _dbm: i8) -> Result<(), BleError> {
            Ok(())
        }
    }

    fn job_with_data(data: &[u8]) -> AdvJob {
        AdvJob::scheduled(2, 160, AdvType::ConnectableUndirected).with_adv_data(data)
    }

    #[test]
    fn test_add_job_limit() {
        let mut controller = AdvertisingController::new();
        for _ in 0..MAX_ADV_JOBS {
            controller.add_job(job_with_data(&[1])).unwrap();
        }
        assert_eq!(
            controller.add_job(job_with_data(&[2])),
            Err(AdvError::BufferFull)
        );
    }

    #[test]
    fn test_single_job_configures_radio_once() {
        let mut controller = AdvertisingController::new();
        let mut radio = RecordingRadio::new();
        let mut errors = ErrorLog::new();

        controller.add_job(job_with_data(&[7, 7])).unwrap();
        for _ in 0..6 {
            controller.timer(1, &mut radio, &mut errors);
        }
        // One job never needs reconfiguring, regardless of rotation rounds
        assert_eq!(radio.applied.len(), 1);
        assert!(controller.is_advertising());
    }

    #[test]
    fn test_two_jobs_alternate() {
        let mut controller = AdvertisingController::new();
        let mut radio = RecordingRadio::new();
        let mut errors = ErrorLog::new();

        controller.add_job(job_with_data(&[1])).unwrap();
        controller.add_job(job_with_data(&[2])).unwrap();
        for _ in 0..8 {
            controller.timer(1, &mut radio, &mut errors);
        }
        // Both payloads were on air and the radio switched between them
        assert!(radio.applied.iter().any(|d| d == &vec![1]));
        assert!(radio.applied.iter().any(|d| d == &vec![2]));
        assert!(radio.applied.len() >= 4);
    }

    #[test]
    fn test_refresh_reapplies_data() {
        let mut controller = AdvertisingController::new();
        let mut radio = RecordingRadio::new();
        let mut errors = ErrorLog::new();

        let handle = controller.add_job(job_with_data(&[1])).unwrap();
        controller.timer(1, &mut radio, &mut errors);
        assert_eq!(radio.applied.len(), 1);

        controller.job_mut(handle).unwrap().adv_data.set(&[9]);
        controller.refresh_job(handle).unwrap();
        controller.timer(1, &mut radio, &mut errors);

        assert_eq!(radio.applied.len(), 2);
        assert_eq!(radio.applied[1], vec![9]);
    }

    #[test]
    fn test_remove_last_job_stops_radio() {
        let mut controller = AdvertisingController::new();
        let mut radio = RecordingRadio::new();
        let mut errors = ErrorLog::new();

        let handle = controller.add_job(job_with_data(&[1])).unwrap();
        controller.timer(1, &mut radio, &mut errors);
        controller.remove_job(handle);
        controller.timer(1, &mut radio, &mut errors);

        assert_eq!(radio.stopped, 1);
        assert!(!controller.is_advertising());
    }

    #[test]
    fn test_immediate_job_preempts_and_expires() {
        let mut controller = AdvertisingController::new();
        let mut radio = RecordingRadio::new();
        let mut errors = ErrorLog::new();

        controller.add_job(job_with_data(&[1])).unwrap();
        controller
            .add_job(
                AdvJob::immediate(2, 160, AdvType::NonconnectableUndirected).with_adv_data(&[0xEE]),
            )
            .unwrap();

        controller.timer(1, &mut radio, &mut errors);
        assert_eq!(radio.applied.last().unwrap(), &vec![0xEE]);
        controller.timer(1, &mut radio, &mut errors);

        // Immediate budget spent: job removed, rotation resumes
        assert_eq!(controller.job_count(), 1);
        controller.timer(1, &mut radio, &mut errors);
        assert_eq!(radio.applied.last().unwrap(), &vec![1]);
    }

    #[test]
    fn test_transient_radio_failure_retries() {
        let mut controller = AdvertisingController::new();
        let mut radio = RecordingRadio::new();
        let mut errors = ErrorLog::new();

        controller.add_job(job_with_data(&[5])).unwrap();
        radio.fail_next = true;
        controller.timer(1, &mut radio, &mut errors);
        assert!(radio.applied.is_empty());

        controller.timer(1, &mut radio, &mut errors);
        assert_eq!(radio.applied.len(), 1);
        assert_eq!(errors.len(), 0);
    }
}
