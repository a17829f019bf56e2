// Advertising module - SCHEDULED MULTI-JOB ADVERTISING
// Job pool and rotation over the single BLE advertiser

mod controller;
mod job;

pub use controller::{AdvError, AdvJobHandle, AdvertisingController, MAX_ADV_JOBS};
pub use job::{AdvJob, AdvJobType, AdvPayload, ADV_DATA_MAX};
