// Persistent records owned by the core
//
// The node identity travels as a fixed 41-byte little-endian record so that
// enrollment tools can write it directly. Boot state (restart counter,
// last reboot reason) is ours alone and uses postcard.

use super::store::{RecordId, RecordStore, StoreError};
use crate::proto::{DeviceType, NetworkId, NodeId};
use crate::util::RebootReason;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NODE_IDENTITY_RECORD_SIZE: usize = 41;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("record has wrong size {0}")]
    WrongSize(usize),

    #[error("record field invalid")]
    InvalidField,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Who this node is. Written once at enrollment, read at every boot.
///
/// On-record layout: `nodeId(2) networkId(2) networkKey(16) nodeKey(16)
/// dBmTx(1) deviceType(1) enrollmentState(1)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub network_id: NetworkId,
    pub network_key: [u8; 16],
    pub node_key: [u8; 16],
    pub dbm_tx: i8,
    pub device_type: DeviceType,
    pub enrollment_state: u8,
}

impl NodeIdentity {
    /// A minimal identity for tests and first-boot defaults
    pub fn new(node_id: NodeId, network_id: NetworkId) -> Self {
        Self {
            node_id,
            network_id,
            network_key: [0; 16],
            node_key: [0; 16],
            dbm_tx: 0,
            device_type: DeviceType::Static,
            enrollment_state: 0,
        }
    }

    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn encode(&self) -> [u8; NODE_IDENTITY_RECORD_SIZE] {
        let mut out = [0u8; NODE_IDENTITY_RECORD_SIZE];
        out[0..2].copy_from_slice(&self.node_id.raw().to_le_bytes());
        out[2..4].copy_from_slice(&self.network_id.raw().to_le_bytes());
        out[4..20].copy_from_slice(&self.network_key);
        out[20..36].copy_from_slice(&self.node_key);
        out[36] = self.dbm_tx as u8;
        out[37] = self.device_type as u8;
        out[38] = self.enrollment_state;
        // out[39..41] stays zero, reserved
        out
    }

    pub fn decode(data: &[u8]) -> Result<NodeIdentity, RecordError> {
        if data.len() != NODE_IDENTITY_RECORD_SIZE {
            return Err(RecordError::WrongSize(data.len()));
        }
        let mut network_key = [0u8; 16];
        network_key.copy_from_slice(&data[4..20]);
        let mut node_key = [0u8; 16];
        node_key.copy_from_slice(&data[20..36]);
        Ok(NodeIdentity {
            node_id: NodeId(u16::from_le_bytes([data[0], data[1]])),
            network_id: NetworkId(u16::from_le_bytes([data[2], data[3]])),
            network_key,
            node_key,
            dbm_tx: data[36] as i8,
            device_type: DeviceType::from_u8(data[37]).ok_or(RecordError::InvalidField)?,
            enrollment_state: data[38],
        })
    }

    pub fn save(&self, store: &mut dyn RecordStore) -> Result<(), RecordError> {
        store.save(RecordId::NODE_IDENTITY, &self.encode())?;
        Ok(())
    }

    pub fn load(store: &dyn RecordStore) -> Option<Result<NodeIdentity, RecordError>> {
        store
            .load(RecordId::NODE_IDENTITY)
            .map(|bytes| NodeIdentity::decode(&bytes))
    }
}

/// Restart counter and the reason the previous boot ended
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootState {
    pub restart_counter: u16,
    pub reboot_reason: Option<RebootReason>,
}

impl BootState {
    pub fn load(store: &dyn RecordStore) -> BootState {
        store
            .load(RecordId::BOOT_STATE)
            .and_then(|bytes| postcard::from_bytes(&bytes).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, store: &mut dyn RecordStore) -> Result<(), RecordError> {
        let bytes =
            postcard::to_allocvec(self).map_err(|_| RecordError::Store(StoreError::NoSpace))?;
        store.save(RecordId::BOOT_STATE, &bytes)?;
        Ok(())
    }

    /// Advance the restart counter at boot, consuming the stored reboot
    /// reason. Returns the state valid for this boot.
    pub fn next_boot(store: &mut dyn RecordStore) -> Result<(BootState, Option<RebootReason>), RecordError> {
        let previous = BootState::load(store);
        let current = BootState {
            restart_counter: previous.restart_counter.wrapping_add(1),
            reboot_reason: None,
        };
        current.save(store)?;
        Ok((current, previous.reboot_reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRecordStore;

    #[test]
    fn test_identity_record_is_41_bytes() {
        let identity = NodeIdentity::new(NodeId(7), NetworkId(11));
        assert_eq!(identity.encode().len(), NODE_IDENTITY_RECORD_SIZE);
    }

    #[test]
    fn test_identity_roundtrip() {
        let mut identity = NodeIdentity::new(NodeId(42), NetworkId(77));
        identity.network_key = [0xAB; 16];
        identity.node_key = [0xCD; 16];
        identity.dbm_tx = -8;
        identity.device_type = DeviceType::Sink;
        identity.enrollment_state = 1;

        let decoded = NodeIdentity::decode(&identity.encode()).unwrap();
        assert_eq!(decoded, identity);
    }

    #[test]
    fn test_identity_decode_rejects_wrong_size() {
        assert_eq!(
            NodeIdentity::decode(&[0u8; 40]),
            Err(RecordError::WrongSize(40))
        );
    }

    #[test]
    fn test_identity_save_load_via_store() {
        let mut store = MemoryRecordStore::new();
        let identity = NodeIdentity::new(NodeId(3), NetworkId(9));
        identity.save(&mut store).unwrap();

        let loaded = NodeIdentity::load(&store).unwrap().unwrap();
        assert_eq!(loaded, identity);
    }

    #[test]
    fn test_restart_counter_increments_per_boot() {
        let mut store = MemoryRecordStore::new();
        let (first, reason) = BootState::next_boot(&mut store).unwrap();
        assert_eq!(first.restart_counter, 1);
        assert_eq!(reason, None);

        let (second, _) = BootState::next_boot(&mut store).unwrap();
        assert_eq!(second.restart_counter, 2);
    }

    #[test]
    fn test_reboot_reason_reported_once() {
        let mut store = MemoryRecordStore::new();
        let (mut state, _) = BootState::next_boot(&mut store).unwrap();
        state.reboot_reason = Some(RebootReason::Fatal);
        state.save(&mut store).unwrap();

        let (_, reason) = BootState::next_boot(&mut store).unwrap();
        assert_eq!(reason, Some(RebootReason::Fatal));

        let (_, reason) = BootState::next_boot(&mut store).unwrap();
        assert_eq!(reason, None);
    }
}
