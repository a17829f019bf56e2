// Ble module - THE RADIO BOUNDARY
// Platform contract consumed by the core plus an in-memory loopback fabric

mod api;
pub mod loopback;

pub use api::{
    AdvParams, AdvType, BleError, BleEvent, BleGapAddr, BlePlatform, ConnHandle, ConnRole,
    HciReason, ScanParams,
};
