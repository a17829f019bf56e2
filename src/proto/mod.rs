// Proto module - WHAT GOES OVER THE AIR
// Byte-exact wire formats for advertising beacons and connection messages

pub mod adv;
pub mod conn;
mod types;

pub use types::{
    ClusterId, ClusterSize, DeviceType, HopCount, NetworkId, NodeId, HOPS_UNKNOWN,
};
