// Error log - fixed-size ring of observability entries
//
// Errors that are not worth a result type end up here: warnings tear a
// connection down but keep the node alive, counts aggregate, infos mark
// lifecycle events. Fatal codes additionally latch a reboot reason that the
// embedder persists across the reset.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// Capacity of the ring; pushes beyond it are dropped, not rotated, so the
/// oldest evidence of a failure spree survives.
pub const ERROR_LOG_CAPACITY: usize = 100;

/// Error and event codes, grouped by convention:
/// `Fatal*` must never occur and force a reset, `Warn*` may happen from time
/// to time, `Count*` aggregate, `Info*` mark lifecycle events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    FatalQueueNumMismatch = 1,
    FatalHandlePacketSentError = 2,
    FatalPacketTooBig = 3,
    WarnHandshakeTimeout = 10,
    WarnGattWriteError = 11,
    WarnSplitPacketMissing = 12,
    WarnSplitPacketNotInMtu = 13,
    WarnClusterUpdateFlowMismatch = 14,
    WarnVitalPrioQueueFull = 15,
    WarnAdvertisingControllerDeactivateFailed = 16,
    WarnConnectAsMasterNotPossible = 17,
    WarnCmFailNoSpot = 18,
    WarnRecordStorageSaveFailed = 19,
    CountConnectionSuccess = 40,
    CountHandshakeDone = 41,
    CountHandshakeAck1Duplicate = 42,
    CountHandshakeAck2Duplicate = 43,
    CountJoinMeReceived = 44,
    CountDroppedPackets = 45,
    CountSentPacketsReliable = 46,
    CountSentPacketsUnreliable = 47,
    CountGeneratedSplitPackets = 48,
    CountAccessToRemovedConnection = 49,
    CountEmergencyDisconnectCantDisconnectAnybody = 50,
    CountReceivedInvalidPacket = 51,
    InfoEmergencyDisconnectSuccessful = 70,
    InfoErrorsRequested = 71,
    InfoTryingReestablish = 72,
    InfoReestablishSuccess = 73,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorSeverity {
    Fatal,
    Warn,
    Count,
    Info,
}

impl ErrorCode {
    pub fn severity(&self) -> ErrorSeverity {
        let value = *self as u8;
        match value {
            0..=9 => ErrorSeverity::Fatal,
            10..=39 => ErrorSeverity::Warn,
            40..=69 => ErrorSeverity::Count,
            _ => ErrorSeverity::Info,
        }
    }
}

/// Why the previous boot ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RebootReason {
    Unknown = 0,
    Fatal = 1,
    Watchdog = 2,
    Requested = 3,
}

impl RebootReason {
    pub fn from_u8(value: u8) -> RebootReason {
        match value {
            1 => RebootReason::Fatal,
            2 => RebootReason::Watchdog,
            3 => RebootReason::Requested,
            _ => RebootReason::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorLogEntry {
    pub code: ErrorCode,
    pub extra: u32,
    pub timestamp_sec: u32,
}

/// Fixed-capacity ring of error entries
pub struct ErrorLog {
    entries: VecDeque<ErrorLogEntry>,
    dropped: u32,
    pending_reboot: Option<RebootReason>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(ERROR_LOG_CAPACITY),
            dropped: 0,
            pending_reboot: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that did not fit since the last reset
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Set when a fatal code was pushed; the embedder must persist it and
    /// reset the device.
    pub fn pending_reboot(&self) -> Option<RebootReason> {
        self.pending_reboot
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.dropped = 0;
    }

    /// Record one error occurrence. Fatal codes also latch the reboot
    /// reason.
    pub fn push_error(&mut self, code: ErrorCode, extra: u32, timestamp_sec: u32) {
        if code.severity() == ErrorSeverity::Fatal {
            warn!(?code, extra, "fatal error recorded");
            self.pending_reboot = Some(RebootReason::Fatal);
        }
        if self.entries.len() >= ERROR_LOG_CAPACITY {
            self.dropped = self.dropped.saturating_add(1);
            return;
        }
        self.entries.push_back(ErrorLogEntry {
            code,
            extra,
            timestamp_sec,
        });
    }

    /// Increment a running counter. An existing entry with the same code is
    /// bumped in place; otherwise a new entry with count 1 is pushed.
    pub fn push_count(&mut self, code: ErrorCode, timestamp_sec: u32) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.code == code) {
            entry.extra = entry.extra.saturating_add(1);
            return;
        }
        if self.entries.len() >= ERROR_LOG_CAPACITY {
            self.dropped = self.dropped.saturating_add(1);
            return;
        }
        self.entries.push_back(ErrorLogEntry {
            code,
            extra: 1,
            timestamp_sec,
        });
    }

    pub fn pop_entry(&mut self) -> Option<ErrorLogEntry> {
        self.entries.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorLogEntry> {
        self.entries.iter()
    }

    /// Current value of a counter code, 0 if never counted
    pub fn counter(&self, code: ErrorCode) -> u32 {
        self.entries
            .iter()
            .find(|e| e.code == code)
            .map(|e| e.extra)
            .unwrap_or(0)
    }

    /// Number of entries with the given code
    pub fn occurrences(&self, code: ErrorCode) -> usize {
        self.entries.iter().filter(|e| e.code == code).count()
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_grouping() {
        assert_eq!(
            ErrorCode::FatalQueueNumMismatch.severity(),
            ErrorSeverity::Fatal
        );
        assert_eq!(ErrorCode::WarnGattWriteError.severity(), ErrorSeverity::Warn);
        assert_eq!(ErrorCode::CountDroppedPackets.severity(), ErrorSeverity::Count);
        assert_eq!(
            ErrorCode::InfoErrorsRequested.severity(),
            ErrorSeverity::Info
        );
    }

    #[test]
    fn test_push_count_dedups() {
        let mut log = ErrorLog::new();
        log.push_count(ErrorCode::CountJoinMeReceived, 0);
        log.push_count(ErrorCode::CountJoinMeReceived, 1);
        log.push_count(ErrorCode::CountJoinMeReceived, 2);

        assert_eq!(log.len(), 1);
        assert_eq!(log.counter(ErrorCode::CountJoinMeReceived), 3);
    }

    #[test]
    fn test_full_ring_drops_new_entries() {
        let mut log = ErrorLog::new();
        for i in 0..ERROR_LOG_CAPACITY {
            log.push_error(ErrorCode::WarnGattWriteError, i as u32, 0);
        }
        log.push_error(ErrorCode::WarnHandshakeTimeout, 0, 0);

        assert_eq!(log.len(), ERROR_LOG_CAPACITY);
        assert_eq!(log.dropped(), 1);
        assert_eq!(log.occurrences(ErrorCode::WarnHandshakeTimeout), 0);
    }

    #[test]
    fn test_fatal_latches_reboot_reason() {
        let mut log = ErrorLog::new();
        assert_eq!(log.pending_reboot(), None);
        log.push_error(ErrorCode::FatalQueueNumMismatch, 0, 0);
        assert_eq!(log.pending_reboot(), Some(RebootReason::Fatal));
    }

    #[test]
    fn test_pop_is_fifo() {
        let mut log = ErrorLog::new();
        log.push_error(ErrorCode::WarnGattWriteError, 1, 0);
        log.push_error(ErrorCode::WarnHandshakeTimeout, 2, 0);

        assert_eq!(log.pop_entry().unwrap().code, ErrorCode::WarnGattWriteError);
        assert_eq!(log.pop_entry().unwrap().code, ErrorCode::WarnHandshakeTimeout);
        assert!(log.pop_entry().is_none());
    }
}
