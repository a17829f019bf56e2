// Conn module - LINK OWNERSHIP AND TRAFFIC
// Connection slot pool, handshake machine, send queues and routing

mod connection;
mod handshake;
mod manager;
mod queue;

pub use connection::{
    Connection, ConnectionDirection, ConnectionKind, ConnectionState, MeshLinkState,
    PendingClusterUpdate, ReassemblyResult, TransmitResult,
};
pub use handshake::{
    HandshakeAbort, HandshakeFsm, HandshakeInput, HandshakeOutput, HandshakeResult, HandshakeRole,
    LocalClusterInfo, PartnerSnapshot,
};
pub use manager::{CmError, ConnectionEvent, ConnectionManager};
pub use queue::{
    DeliveryOption, DeliveryPriority, PacketMeta, PacketQueue, PrioritySendQueue, QueueError,
    QueuedPacket,
};
