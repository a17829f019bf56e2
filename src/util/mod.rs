// Util module - SUPPORT PLUMBING
// Error log ring, packet statistics, global time and small codings

pub mod battery;
mod error_log;
mod packet_stats;
mod time;

pub use error_log::{
    ErrorCode, ErrorLog, ErrorLogEntry, ErrorSeverity, RebootReason, ERROR_LOG_CAPACITY,
};
pub use packet_stats::{PacketStatKey, PacketStats};
pub use time::{DsTime, GlobalTime};
