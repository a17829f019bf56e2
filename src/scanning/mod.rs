// Scanning module - DUTY-CYCLE COMPOSITION
// Scan job pool and highest-duty-cycle selection

mod controller;
mod job;

pub use controller::{ScanController, ScanError, ScanJobHandle, MAX_SCAN_JOBS};
pub use job::{ScanJob, ScanJobState, ScanJobTimeMode, ScanUse};
