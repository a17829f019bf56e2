// Advertising jobs - one payload each, time-multiplexed by the controller

use crate::ble::AdvType;

/// Maximum advertising payload length
pub const ADV_DATA_MAX: usize = 31;

/// Fixed buffer holding one advertising or scan-response payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdvPayload {
    bytes: [u8; ADV_DATA_MAX],
    len: u8,
}

impl AdvPayload {
    pub fn empty() -> Self {
        Self {
            bytes: [0; ADV_DATA_MAX],
            len: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.len() > ADV_DATA_MAX {
            return None;
        }
        let mut bytes = [0u8; ADV_DATA_MAX];
        bytes[..data.len()].copy_from_slice(data);
        Some(Self {
            bytes,
            len: data.len() as u8,
        })
    }

    pub fn set(&mut self, data: &[u8]) -> bool {
        match Self::from_slice(data) {
            Some(payload) => {
                *self = payload;
                true
            }
            None => false,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvJobType {
    /// Rotated with the other scheduled jobs
    Scheduled,
    /// Runs before anything else until its slots are used up, then removed
    Immediate,
}

/// One advertising payload plus its share of air time
#[derive(Clone, Copy, Debug)]
pub struct AdvJob {
    pub job_type: AdvJobType,
    /// Timer slots this job occupies per rotation round, 1..=10
    pub slots: u8,
    /// Timer slots to wait before the job becomes eligible
    pub delay: u8,
    pub interval_units: u16,
    pub adv_type: AdvType,
    pub adv_data: AdvPayload,
    pub scan_data: AdvPayload,
}

impl AdvJob {
    pub fn scheduled(slots: u8, interval_units: u16, adv_type: AdvType) -> Self {
        Self {
            job_type: AdvJobType::Scheduled,
            slots: slots.clamp(1, 10),
            delay: 0,
            interval_units,
            adv_type,
            adv_data: AdvPayload::empty(),
            scan_data: AdvPayload::empty(),
        }
    }

    pub fn immediate(slots: u8, interval_units: u16, adv_type: AdvType) -> Self {
        Self {
            job_type: AdvJobType::Immediate,
            ..Self::scheduled(slots, interval_units, adv_type)
        }
    }

    pub fn with_adv_data(mut self, data: &[u8]) -> Self {
        self.adv_data.set(data);
        self
    }

    pub fn with_scan_data(mut self, data: &[u8]) -> Self {
        self.scan_data.set(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_from_slice_limits() {
        assert!(AdvPayload::from_slice(&[0u8; 31]).is_some());
        assert!(AdvPayload::from_slice(&[0u8; 32]).is_none());
    }

    #[test]
    fn test_payload_set_and_read() {
        let mut payload = AdvPayload::empty();
        assert!(payload.is_empty());
        assert!(payload.set(&[1, 2, 3]));
        assert_eq!(payload.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_slots_clamped() {
        let job = AdvJob::scheduled(0, 160, AdvType::ConnectableUndirected);
        assert_eq!(job.slots, 1);
        let job = AdvJob::scheduled(200, 160, AdvType::ConnectableUndirected);
        assert_eq!(job.slots, 10);
    }
}
