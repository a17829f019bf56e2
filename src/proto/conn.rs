// Connection message formats
//
// Everything that travels over an established mesh link: the three-message
// cluster handshake, cluster-state deltas, opaque app data and the module
// envelope. Little-endian, byte-exact, 5-byte common header:
//
// ```text
// [messageType:u8][sender:u16][receiver:u16][payload...]
// ```

use super::types::{ClusterId, ClusterSize, HopCount, NodeId};
use thiserror::Error;

pub const CONN_PACKET_HEADER_SIZE: usize = 5;
pub const CLUSTER_WELCOME_PAYLOAD_SIZE: usize = 10;
pub const CLUSTER_ACK_1_PAYLOAD_SIZE: usize = 3;
pub const CLUSTER_ACK_2_PAYLOAD_SIZE: usize = 6;
pub const CLUSTER_INFO_UPDATE_PAYLOAD_SIZE: usize = 12;
pub const ADV_INFO_PAYLOAD_SIZE: usize = 9;
pub const MODULE_ACTION_FIXED_SIZE: usize = 4;

/// Prefix of the 3-byte split header. Every defined message type is below
/// 0x80, so the high bit of the first byte of a write marks a fragment.
pub const SPLIT_HEADER_MAGIC: u8 = 0x80;
pub const SPLIT_TERMINATOR_BIT: u8 = 0x01;
pub const SPLIT_HEADER_SIZE: usize = 3;

/// Message discriminators for connection packets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    ClusterWelcome = 50,
    ClusterAck1 = 51,
    ClusterAck2 = 52,
    ClusterInfoUpdate = 53,
    Data1 = 80,
    AdvInfo = 84,
    ModuleAction = 85,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        match value {
            50 => Some(MessageType::ClusterWelcome),
            51 => Some(MessageType::ClusterAck1),
            52 => Some(MessageType::ClusterAck2),
            53 => Some(MessageType::ClusterInfoUpdate),
            80 => Some(MessageType::Data1),
            84 => Some(MessageType::AdvInfo),
            85 => Some(MessageType::ModuleAction),
            _ => None,
        }
    }

    /// Handshake messages are the only traffic allowed before a link is
    /// fully clustered
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            MessageType::ClusterWelcome | MessageType::ClusterAck1 | MessageType::ClusterAck2
        )
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConnPacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("payload length {got} does not match message type (expected {expected})")]
    BadPayloadLength { got: usize, expected: usize },

    #[error("invalid field value")]
    InvalidField,
}

/// Common 5-byte header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnPacketHeader {
    pub message_type: MessageType,
    pub sender: NodeId,
    pub receiver: NodeId,
}

impl ConnPacketHeader {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.message_type as u8);
        out.extend_from_slice(&self.sender.raw().to_le_bytes());
        out.extend_from_slice(&self.receiver.raw().to_le_bytes());
    }

    pub fn decode(data: &[u8]) -> Result<ConnPacketHeader, ConnPacketError> {
        if data.len() < CONN_PACKET_HEADER_SIZE {
            return Err(ConnPacketError::TooShort(data.len()));
        }
        let message_type = MessageType::from_u8(data[0])
            .ok_or(ConnPacketError::UnknownMessageType(data[0]))?;
        Ok(ConnPacketHeader {
            message_type,
            sender: NodeId(u16::from_le_bytes([data[1], data[2]])),
            receiver: NodeId(u16::from_le_bytes([data[3], data[4]])),
        })
    }
}

/// CLUSTER_WELCOME — opens the handshake, sent by the central
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterWelcome {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub cluster_id: ClusterId,
    pub cluster_size: ClusterSize,
    pub mesh_write_handle: u16,
    pub hops_to_sink: HopCount,
}

/// CLUSTER_ACK_1 — peripheral response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterAck1 {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub hops_to_sink: HopCount,
}

/// CLUSTER_ACK_2 — central confirmation carrying the merged identity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterAck2 {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub cluster_id: ClusterId,
    pub cluster_size: ClusterSize,
}

/// CLUSTER_INFO_UPDATE — cluster-state delta flooded through the tree.
///
/// `cluster_size_change` is a signed delta, never an absolute, so two
/// updates crossing on a link commute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterInfoUpdate {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub current_cluster_id: ClusterId,
    pub new_cluster_id: ClusterId,
    pub cluster_size_change: ClusterSize,
    pub hops_to_sink: HopCount,
}

/// DATA_1 — opaque application data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Data1 {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub data: Vec<u8>,
}

/// ADVINFO — a scan result relayed through the mesh
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdvInfo {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub peer_address: [u8; 6],
    pub inverse_rssi_sum: u16,
    pub packet_count: u8,
}

/// Sub-kind of a module envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleActionKind {
    SetConfig = 0,
    GetConfig = 1,
    SetActive = 2,
    TriggerAction = 3,
    ConfigResponse = 4,
    ActionResponse = 5,
}

impl ModuleActionKind {
    pub fn from_u8(value: u8) -> Option<ModuleActionKind> {
        match value {
            0 => Some(ModuleActionKind::SetConfig),
            1 => Some(ModuleActionKind::GetConfig),
            2 => Some(ModuleActionKind::SetActive),
            3 => Some(ModuleActionKind::TriggerAction),
            4 => Some(ModuleActionKind::ConfigResponse),
            5 => Some(ModuleActionKind::ActionResponse),
            _ => None,
        }
    }
}

/// Module envelope: `{moduleId:u16, actionKind:u8, requestHandle:u8, data[]}`
/// after the common header. For trigger actions and responses the
/// module-specific action code is the first payload byte by convention.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleAction {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub module_id: u16,
    pub action_kind: ModuleActionKind,
    pub request_handle: u8,
    pub data: Vec<u8>,
}

/// Any decoded connection packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnPacket {
    ClusterWelcome(ClusterWelcome),
    ClusterAck1(ClusterAck1),
    ClusterAck2(ClusterAck2),
    ClusterInfoUpdate(ClusterInfoUpdate),
    Data1(Data1),
    AdvInfo(AdvInfo),
    ModuleAction(ModuleAction),
}

impl ConnPacket {
    pub fn message_type(&self) -> MessageType {
        match self {
            ConnPacket::ClusterWelcome(_) => MessageType::ClusterWelcome,
            ConnPacket::ClusterAck1(_) => MessageType::ClusterAck1,
            ConnPacket::ClusterAck2(_) => MessageType::ClusterAck2,
            ConnPacket::ClusterInfoUpdate(_) => MessageType::ClusterInfoUpdate,
            ConnPacket::Data1(_) => MessageType::Data1,
            ConnPacket::AdvInfo(_) => MessageType::AdvInfo,
            ConnPacket::ModuleAction(_) => MessageType::ModuleAction,
        }
    }

    pub fn sender(&self) -> NodeId {
        match self {
            ConnPacket::ClusterWelcome(p) => p.sender,
            ConnPacket::ClusterAck1(p) => p.sender,
            ConnPacket::ClusterAck2(p) => p.sender,
            ConnPacket::ClusterInfoUpdate(p) => p.sender,
            ConnPacket::Data1(p) => p.sender,
            ConnPacket::AdvInfo(p) => p.sender,
            ConnPacket::ModuleAction(p) => p.sender,
        }
    }

    pub fn receiver(&self) -> NodeId {
        match self {
            ConnPacket::ClusterWelcome(p) => p.receiver,
            ConnPacket::ClusterAck1(p) => p.receiver,
            ConnPacket::ClusterAck2(p) => p.receiver,
            ConnPacket::ClusterInfoUpdate(p) => p.receiver,
            ConnPacket::Data1(p) => p.receiver,
            ConnPacket::AdvInfo(p) => p.receiver,
            ConnPacket::ModuleAction(p) => p.receiver,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONN_PACKET_HEADER_SIZE + 16);
        let header = ConnPacketHeader {
            message_type: self.message_type(),
            sender: self.sender(),
            receiver: self.receiver(),
        };
        header.encode_into(&mut out);
        match self {
            ConnPacket::ClusterWelcome(p) => {
                out.extend_from_slice(&p.cluster_id.raw().to_le_bytes());
                out.extend_from_slice(&p.cluster_size.to_le_bytes());
                out.extend_from_slice(&p.mesh_write_handle.to_le_bytes());
                out.extend_from_slice(&p.hops_to_sink.to_le_bytes());
            }
            ConnPacket::ClusterAck1(p) => {
                out.extend_from_slice(&p.hops_to_sink.to_le_bytes());
                out.push(0); // reserved
            }
            ConnPacket::ClusterAck2(p) => {
                out.extend_from_slice(&p.cluster_id.raw().to_le_bytes());
                out.extend_from_slice(&p.cluster_size.to_le_bytes());
            }
            ConnPacket::ClusterInfoUpdate(p) => {
                out.extend_from_slice(&p.current_cluster_id.raw().to_le_bytes());
                out.extend_from_slice(&p.new_cluster_id.raw().to_le_bytes());
                out.extend_from_slice(&p.cluster_size_change.to_le_bytes());
                out.extend_from_slice(&p.hops_to_sink.to_le_bytes());
            }
            ConnPacket::Data1(p) => {
                out.extend_from_slice(&p.data);
            }
            ConnPacket::AdvInfo(p) => {
                out.extend_from_slice(&p.peer_address);
                out.extend_from_slice(&p.inverse_rssi_sum.to_le_bytes());
                out.push(p.packet_count);
            }
            ConnPacket::ModuleAction(p) => {
                out.extend_from_slice(&p.module_id.to_le_bytes());
                out.push(p.action_kind as u8);
                out.push(p.request_handle);
                out.extend_from_slice(&p.data);
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<ConnPacket, ConnPacketError> {
        let header = ConnPacketHeader::decode(data)?;
        let payload = &data[CONN_PACKET_HEADER_SIZE..];
        let expect = |size: usize| -> Result<(), ConnPacketError> {
            if payload.len() != size {
                Err(ConnPacketError::BadPayloadLength {
                    got: payload.len(),
                    expected: size,
                })
            } else {
                Ok(())
            }
        };
        match header.message_type {
            MessageType::ClusterWelcome => {
                expect(CLUSTER_WELCOME_PAYLOAD_SIZE)?;
                Ok(ConnPacket::ClusterWelcome(ClusterWelcome {
                    sender: header.sender,
                    receiver: header.receiver,
                    cluster_id: ClusterId(u32::from_le_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ])),
                    cluster_size: i16::from_le_bytes([payload[4], payload[5]]),
                    mesh_write_handle: u16::from_le_bytes([payload[6], payload[7]]),
                    hops_to_sink: i16::from_le_bytes([payload[8], payload[9]]),
                }))
            }
            MessageType::ClusterAck1 => {
                expect(CLUSTER_ACK_1_PAYLOAD_SIZE)?;
                Ok(ConnPacket::ClusterAck1(ClusterAck1 {
                    sender: header.sender,
                    receiver: header.receiver,
                    hops_to_sink: i16::from_le_bytes([payload[0], payload[1]]),
                }))
            }
            MessageType::ClusterAck2 => {
                expect(CLUSTER_ACK_2_PAYLOAD_SIZE)?;
                Ok(ConnPacket::ClusterAck2(ClusterAck2 {
                    sender: header.sender,
                    receiver: header.receiver,
                    cluster_id: ClusterId(u32::from_le_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ])),
                    cluster_size: i16::from_le_bytes([payload[4], payload[5]]),
                }))
            }
            MessageType::ClusterInfoUpdate => {
                expect(CLUSTER_INFO_UPDATE_PAYLOAD_SIZE)?;
                Ok(ConnPacket::ClusterInfoUpdate(ClusterInfoUpdate {
                    sender: header.sender,
                    receiver: header.receiver,
                    current_cluster_id: ClusterId(u32::from_le_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ])),
                    new_cluster_id: ClusterId(u32::from_le_bytes([
                        payload[4], payload[5], payload[6], payload[7],
                    ])),
                    cluster_size_change: i16::from_le_bytes([payload[8], payload[9]]),
                    hops_to_sink: i16::from_le_bytes([payload[10], payload[11]]),
                }))
            }
            MessageType::Data1 => Ok(ConnPacket::Data1(Data1 {
                sender: header.sender,
                receiver: header.receiver,
                data: payload.to_vec(),
            })),
            MessageType::AdvInfo => {
                expect(ADV_INFO_PAYLOAD_SIZE)?;
                let mut peer_address = [0u8; 6];
                peer_address.copy_from_slice(&payload[0..6]);
                Ok(ConnPacket::AdvInfo(AdvInfo {
                    sender: header.sender,
                    receiver: header.receiver,
                    peer_address,
                    inverse_rssi_sum: u16::from_le_bytes([payload[6], payload[7]]),
                    packet_count: payload[8],
                }))
            }
            MessageType::ModuleAction => {
                if payload.len() < MODULE_ACTION_FIXED_SIZE {
                    return Err(ConnPacketError::TooShort(data.len()));
                }
                let action_kind = ModuleActionKind::from_u8(payload[2])
                    .ok_or(ConnPacketError::InvalidField)?;
                Ok(ConnPacket::ModuleAction(ModuleAction {
                    sender: header.sender,
                    receiver: header.receiver,
                    module_id: u16::from_le_bytes([payload[0], payload[1]]),
                    action_kind,
                    request_handle: payload[3],
                    data: payload[MODULE_ACTION_FIXED_SIZE..].to_vec(),
                }))
            }
        }
    }
}

/// 3-byte prefix put in front of every fragment of a message that does not
/// fit into one write: `{0x80|terminator, splitCount, payloadLen}`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitHeader {
    pub terminator: bool,
    pub split_count: u8,
    pub payload_len: u8,
}

impl SplitHeader {
    pub fn encode(&self) -> [u8; SPLIT_HEADER_SIZE] {
        let magic = if self.terminator {
            SPLIT_HEADER_MAGIC | SPLIT_TERMINATOR_BIT
        } else {
            SPLIT_HEADER_MAGIC
        };
        [magic, self.split_count, self.payload_len]
    }

    pub fn decode(data: &[u8]) -> Result<SplitHeader, ConnPacketError> {
        if data.len() < SPLIT_HEADER_SIZE {
            return Err(ConnPacketError::TooShort(data.len()));
        }
        if data[0] & SPLIT_HEADER_MAGIC == 0 {
            return Err(ConnPacketError::InvalidField);
        }
        Ok(SplitHeader {
            terminator: data[0] & SPLIT_TERMINATOR_BIT != 0,
            split_count: data[1],
            payload_len: data[2],
        })
    }
}

/// Check whether the first byte of a write marks a split fragment
pub fn is_split_prefix(first_byte: u8) -> bool {
    first_byte & SPLIT_HEADER_MAGIC != 0
}
