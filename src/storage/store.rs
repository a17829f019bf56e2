// Record store boundary
//
// Flash is an external collaborator: the core only needs keyed records that
// survive a reboot. The in-memory implementation backs tests and the demo
// binary and doubles as a reference for embedders.

use std::collections::HashMap;
use thiserror::Error;

/// Identifies one persistent record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordId(pub u16);

impl RecordId {
    /// The 41-byte node identity record
    pub const NODE_IDENTITY: RecordId = RecordId(1);
    /// Restart counter and last reboot reason
    pub const BOOT_STATE: RecordId = RecordId(2);
    /// First id usable for module configurations
    pub const MODULE_CONFIG_BASE: RecordId = RecordId(0x100);

    pub fn for_module_config(module_id: u16) -> RecordId {
        RecordId(Self::MODULE_CONFIG_BASE.0.wrapping_add(module_id))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("no space left for record")]
    NoSpace,

    #[error("record {0} too large")]
    TooLarge(u16),

    #[error("storage unavailable")]
    Unavailable,
}

/// Keyed persistence the platform provides
pub trait RecordStore {
    fn save(&mut self, id: RecordId, data: &[u8]) -> Result<(), StoreError>;

    fn load(&self, id: RecordId) -> Option<Vec<u8>>;

    fn erase(&mut self, id: RecordId) -> Result<(), StoreError>;
}

/// Volatile store for tests and the demo binary
pub struct MemoryRecordStore {
    records: HashMap<RecordId, Vec<u8>>,
    max_record_size: usize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            max_record_size: 256,
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryRecordStore {
    fn save(&mut self, id: RecordId, data: &[u8]) -> Result<(), StoreError> {
        if data.len() > self.max_record_size {
            return Err(StoreError::TooLarge(id.0));
        }
        self.records.insert(id, data.to_vec());
        Ok(())
    }

    fn load(&self, id: RecordId) -> Option<Vec<u8>> {
        self.records.get(&id).cloned()
    }

    fn erase(&mut self, id: RecordId) -> Result<(), StoreError> {
        self.records.remove(&id);
        Ok(())
    }
}
