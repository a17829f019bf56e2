// Advertising packet formats
//
// The mesh discovery beacon travels in a standard 31-byte BLE advertising
// packet built from two AD structures:
//
// ```text
// [flags AD: len=2, type=0x01, value=0x06]
// [manufacturer AD: len=26, type=0xFF, companyId(2B),
//    meshIdentifier(1B=0xF0), networkId(2B), messageType(1B), payload(20B)]
// ```
//
// All multi-byte integers are little-endian, the layout is byte-exact with
// no padding.

use super::types::{ClusterId, ClusterSize, DeviceType, HopCount, NetworkId, NodeId};
use thiserror::Error;

/// Maximum size of a legacy BLE advertising payload
pub const ADV_PACKET_MAX_SIZE: usize = 31;

/// Company identifier placed in the manufacturer-specific AD structure
pub const COMPANY_ID: u16 = 0x024D;

/// Distinguishes mesh advertising from other manufacturer data
pub const MESH_IDENTIFIER: u8 = 0xF0;

/// Byte count of the two AD headers before the message payload
pub const ADV_HEADER_SIZE: usize = 11;

/// Size of the JOIN_ME v0 payload
pub const JOIN_ME_PAYLOAD_SIZE: usize = 20;

const FLAGS_AD: [u8; 3] = [0x02, 0x01, 0x06];
const MANUFACTURER_AD_LEN: u8 = 26;
const MANUFACTURER_AD_TYPE: u8 = 0xFF;

/// Message discriminator inside the mesh manufacturer data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AdvMessageType {
    Invalid = 0,
    JoinMeV0 = 0x01,
    MeshAccess = 0x03,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AdvPacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("not a mesh advertising packet")]
    NotMeshPacket,

    #[error("unknown advertising message type {0}")]
    UnknownMessageType(u8),

    #[error("invalid field value")]
    InvalidField,
}

/// JOIN_ME v0 — the discovery beacon carrying a candidate's cluster context.
///
/// 20 bytes on air:
/// sender(2) clusterId(4) clusterSize(2) freeIn:3/freeOut:5(1)
/// batteryRuntime(1) txPower(1) deviceType(1) hopsToSink(2)
/// meshWriteHandle(2) ackField(4)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinMePayload {
    pub sender: NodeId,
    pub cluster_id: ClusterId,
    pub cluster_size: ClusterSize,
    /// Free inbound mesh slots, 3 bits on air (0..=7)
    pub free_mesh_in: u8,
    /// Free outbound mesh slots, 5 bits on air (0..=31)
    pub free_mesh_out: u8,
    pub battery_runtime: u8,
    pub tx_power: i8,
    pub device_type: DeviceType,
    pub hops_to_sink: HopCount,
    pub mesh_write_handle: u16,
    /// Acknowledgement of another node's cluster id during the slave
    /// connection procedure
    pub ack_field: ClusterId,
}

impl JoinMePayload {
    pub fn encode(&self) -> [u8; JOIN_ME_PAYLOAD_SIZE] {
        let mut out = [0u8; JOIN_ME_PAYLOAD_SIZE];
        out[0..2].copy_from_slice(&self.sender.raw().to_le_bytes());
        out[2..6].copy_from_slice(&self.cluster_id.raw().to_le_bytes());
        out[6..8].copy_from_slice(&self.cluster_size.to_le_bytes());
        out[8] = (self.free_mesh_in & 0x07) | ((self.free_mesh_out & 0x1F) << 3);
        out[9] = self.battery_runtime;
        out[10] = self.tx_power as u8;
        out[11] = self.device_type as u8;
        out[12..14].copy_from_slice(&self.hops_to_sink.to_le_bytes());
        out[14..16].copy_from_slice(&self.mesh_write_handle.to_le_bytes());
        out[16..20].copy_from_slice(&self.ack_field.raw().to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<JoinMePayload, AdvPacketError> {
        if data.len() < JOIN_ME_PAYLOAD_SIZE {
            return Err(AdvPacketError::TooShort(data.len()));
        }
        let device_type =
            DeviceType::from_u8(data[11]).ok_or(AdvPacketError::InvalidField)?;
        Ok(JoinMePayload {
            sender: NodeId(u16::from_le_bytes([data[0], data[1]])),
            cluster_id: ClusterId(u32::from_le_bytes([data[2], data[3], data[4], data[5]])),
            cluster_size: i16::from_le_bytes([data[6], data[7]]),
            free_mesh_in: data[8] & 0x07,
            free_mesh_out: (data[8] >> 3) & 0x1F,
            battery_runtime: data[9],
            tx_power: data[10] as i8,
            device_type,
            hops_to_sink: i16::from_le_bytes([data[12], data[13]]),
            mesh_write_handle: u16::from_le_bytes([data[14], data[15]]),
            ack_field: ClusterId(u32::from_le_bytes([data[16], data[17], data[18], data[19]])),
        })
    }
}

/// A parsed mesh advertising packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshAdvPacket {
    JoinMe {
        network_id: NetworkId,
        payload: JoinMePayload,
    },
    /// Recognized but handled outside the clustering core
    MeshAccess { network_id: NetworkId },
}

impl MeshAdvPacket {
    pub fn network_id(&self) -> NetworkId {
        match self {
            MeshAdvPacket::JoinMe { network_id, .. } => *network_id,
            MeshAdvPacket::MeshAccess { network_id } => *network_id,
        }
    }
}

/// Build the full 31-byte advertising packet for a JOIN_ME beacon
pub fn encode_join_me(network_id: NetworkId, payload: &JoinMePayload) -> [u8; ADV_PACKET_MAX_SIZE] {
    let mut out = [0u8; ADV_PACKET_MAX_SIZE];
    out[0..3].copy_from_slice(&FLAGS_AD);
    out[3] = MANUFACTURER_AD_LEN;
    out[4] = MANUFACTURER_AD_TYPE;
    out[5..7].copy_from_slice(&COMPANY_ID.to_le_bytes());
    out[7] = MESH_IDENTIFIER;
    out[8..10].copy_from_slice(&network_id.raw().to_le_bytes());
    out[10] = AdvMessageType::JoinMeV0 as u8;
    out[11..31].copy_from_slice(&payload.encode());
    out
}

/// Parse raw advertising data into a mesh packet.
///
/// Returns `NotMeshPacket` for foreign advertisements so callers can ignore
/// them cheaply without logging.
pub fn parse(data: &[u8]) -> Result<MeshAdvPacket, AdvPacketError> {
    if data.len() < ADV_HEADER_SIZE {
        return Err(AdvPacketError::TooShort(data.len()));
    }
    if data[0..3] != FLAGS_AD {
        return Err(AdvPacketError::NotMeshPacket);
    }
    if data[4] != MANUFACTURER_AD_TYPE
        || u16::from_le_bytes([data[5], data[6]]) != COMPANY_ID
        || data[7] != MESH_IDENTIFIER
    {
        return Err(AdvPacketError::NotMeshPacket);
    }
    let network_id = NetworkId(u16::from_le_bytes([data[8], data[9]]));
    match data[10] {
        x if x == AdvMessageType::JoinMeV0 as u8 => {
            let payload = JoinMePayload::decode(&data[ADV_HEADER_SIZE..])?;
            Ok(MeshAdvPacket::JoinMe {
                network_id,
                payload,
            })
        }
        x if x == AdvMessageType::MeshAccess as u8 => {
            Ok(MeshAdvPacket::MeshAccess { network_id })
        }
        other => Err(AdvPacketError::UnknownMessageType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> JoinMePayload {
        JoinMePayload {
            sender: NodeId(7),
            cluster_id: ClusterId::from_parts(NodeId(7), 3),
            cluster_size: 4,
            free_mesh_in: 1,
            free_mesh_out: 3,
            battery_runtime: 255,
            tx_power: -4,
            device_type: DeviceType::Static,
            hops_to_sink: 2,
            mesh_write_handle: 0x0012,
            ack_field: ClusterId::INVALID,
        }
    }

    #[test]
    fn test_join_me_roundtrip() {
        let payload = sample_payload();
        let frame = encode_join_me(NetworkId(10), &payload);
        assert_eq!(frame.len(), 31);

        let parsed = parse(&frame).unwrap();
        match parsed {
            MeshAdvPacket::JoinMe {
                network_id,
                payload: decoded,
            } => {
                assert_eq!(network_id, NetworkId(10));
                assert_eq!(decoded, payload);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_join_me_bitfield_packing() {
        let mut payload = sample_payload();
        payload.free_mesh_in = 7;
        payload.free_mesh_out = 31;
        let bytes = payload.encode();
        assert_eq!(bytes[8], 0xFF);

        payload.free_mesh_in = 1;
        payload.free_mesh_out = 2;
        let bytes = payload.encode();
        assert_eq!(bytes[8], 0b0001_0001);
    }

    #[test]
    fn test_header_layout() {
        let frame = encode_join_me(NetworkId(0x1234), &sample_payload());
        assert_eq!(&frame[0..3], &[0x02, 0x01, 0x06]);
        assert_eq!(frame[3], 26);
        assert_eq!(frame[4], 0xFF);
        assert_eq!(u16::from_le_bytes([frame[5], frame[6]]), COMPANY_ID);
        assert_eq!(frame[7], 0xF0);
        assert_eq!(u16::from_le_bytes([frame[8], frame[9]]), 0x1234);
        assert_eq!(frame[10], 0x01);
    }

    #[test]
    fn test_parse_rejects_foreign_packets() {
        assert_eq!(parse(&[0u8; 5]), Err(AdvPacketError::TooShort(5)));

        // iBeacon-style frame: right length, wrong company
        let mut frame = encode_join_me(NetworkId(1), &sample_payload());
        frame[5] = 0x4C;
        frame[6] = 0x00;
        assert_eq!(parse(&frame), Err(AdvPacketError::NotMeshPacket));
    }

    #[test]
    fn test_parse_mesh_access_recognized() {
        let mut frame = encode_join_me(NetworkId(1), &sample_payload());
        frame[10] = AdvMessageType::MeshAccess as u8;
        assert_eq!(
            parse(&frame),
            Ok(MeshAdvPacket::MeshAccess {
                network_id: NetworkId(1)
            })
        );
    }
}
