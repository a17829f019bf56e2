// Core identifier types shared by advertising and connection packets

use serde::{Deserialize, Serialize};
use std::fmt;

/// 16-bit node identifier.
///
/// The id space is partitioned: `0` is invalid, `1..=1999` are individual
/// mesh nodes, `2000` addresses every node in the network and
/// `31000..=31999` are anycast groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl NodeId {
    pub const INVALID: NodeId = NodeId(0);
    /// Addresses the whole network (flooded along the tree).
    pub const BROADCAST: NodeId = NodeId(2000);
    /// First id of the anycast group range.
    pub const GROUP_BASE: NodeId = NodeId(31000);
    /// Anycast group that resolves to the link toward the closest sink.
    pub const SHORTEST_SINK: NodeId = NodeId(31000);

    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Check if this id names a single mesh node
    pub fn is_mesh_node(&self) -> bool {
        self.0 >= 1 && self.0 <= 1999
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Check if this id names an anycast group
    pub fn is_group(&self) -> bool {
        self.0 >= 31000 && self.0 <= 31999
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 16-bit network identifier. Two nodes only mesh when their NetworkIds match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(pub u16);

impl NetworkId {
    pub fn raw(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-bit cluster identifier.
///
/// Generated by the founding node as `(node_id << 16) | restart_counter`,
/// so ids stay unique across reboots. When two clusters merge, the larger
/// id survives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub u32);

impl ClusterId {
    pub const INVALID: ClusterId = ClusterId(0);

    pub fn from_parts(founder: NodeId, restart_counter: u16) -> Self {
        ClusterId(((founder.raw() as u32) << 16) | restart_counter as u32)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    /// The node that founded this cluster
    pub fn founder(&self) -> NodeId {
        NodeId((self.0 >> 16) as u16)
    }

    pub fn restart_counter(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.founder(), self.restart_counter())
    }
}

/// Signed count of nodes in a cluster. Always >= 1 for a live node; the
/// sign matters for size deltas carried in cluster updates.
pub type ClusterSize = i16;

/// Role a device plays in the mesh
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceType {
    Static = 0,
    Roaming = 1,
    Sink = 2,
    Asset = 3,
    Leaf = 4,
}

impl DeviceType {
    pub fn from_u8(value: u8) -> Option<DeviceType> {
        match value {
            0 => Some(DeviceType::Static),
            1 => Some(DeviceType::Roaming),
            2 => Some(DeviceType::Sink),
            3 => Some(DeviceType::Asset),
            4 => Some(DeviceType::Leaf),
            _ => None,
        }
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, DeviceType::Sink)
    }
}

/// Hop count toward the closest sink. `HOPS_UNKNOWN` when no sink is
/// reachable through any link.
pub type HopCount = i16;

/// Sentinel for "no sink known". Chosen large enough that `+1` per hop
/// never reaches it in a real tree but small enough to survive i16 math.
pub const HOPS_UNKNOWN: HopCount = 1000;
