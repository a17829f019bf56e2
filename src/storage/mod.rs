// Storage module - PERSISTENCE BOUNDARY
// Record-store contract, node identity record and boot state

mod records;
mod store;

pub use records::{BootState, NodeIdentity, RecordError, NODE_IDENTITY_RECORD_SIZE};
pub use store::{MemoryRecordStore, RecordId, RecordStore, StoreError};
