// Platform boundary - WHAT THE RADIO STACK PROVIDES
//
// The clustering core never talks to a radio directly. It consumes the
// narrow GAP/GATT contract below and receives upcalls as `BleEvent` values
// fed into the runtime by the embedder.

use std::fmt;
use thiserror::Error;

/// 48-bit BLE address plus address type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BleGapAddr {
    pub addr_type: u8,
    pub addr: [u8; 6],
}

impl BleGapAddr {
    pub fn new(addr: [u8; 6]) -> Self {
        Self { addr_type: 0, addr }
    }
}

impl fmt::Display for BleGapAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.addr))
    }
}

/// Handle identifying a live connection at the radio stack
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u16);

/// HCI status code attached to a disconnection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HciReason(pub u8);

impl HciReason {
    pub const CONNECTION_TIMEOUT: HciReason = HciReason(0x08);
    pub const REMOTE_USER_TERMINATED: HciReason = HciReason(0x13);
    pub const LOCAL_HOST_TERMINATED: HciReason = HciReason(0x16);

    /// Link-loss style reasons are eligible for reestablishment; deliberate
    /// teardown is not.
    pub fn is_link_loss(&self) -> bool {
        !matches!(
            *self,
            HciReason::REMOTE_USER_TERMINATED | HciReason::LOCAL_HOST_TERMINATED
        )
    }
}

/// Our role on a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnRole {
    Central,
    Peripheral,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvType {
    ConnectableUndirected,
    NonconnectableUndirected,
}

/// Advertising parameters, interval in 0.625 ms units
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdvParams {
    pub interval_units: u16,
    pub adv_type: AdvType,
}

/// Scan parameters, interval and window in 0.625 ms units
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanParams {
    pub interval_units: u16,
    pub window_units: u16,
}

/// Upcalls from the radio stack, drained by the main loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BleEvent {
    AdvReport {
        addr: BleGapAddr,
        rssi: i8,
        data: Vec<u8>,
    },
    Connected {
        conn: ConnHandle,
        addr: BleGapAddr,
        role: ConnRole,
    },
    ConnectingTimeout {
        addr: BleGapAddr,
    },
    Disconnected {
        conn: ConnHandle,
        reason: HciReason,
    },
    /// Write received on our mesh characteristic (we are peripheral)
    WriteRx {
        conn: ConnHandle,
        characteristic: u16,
        data: Vec<u8>,
    },
    /// Notification received from the partner (we are central)
    NotificationRx {
        conn: ConnHandle,
        characteristic: u16,
        data: Vec<u8>,
    },
    /// `count` transmit buffers were released back to us
    TxComplete {
        conn: ConnHandle,
        count: u8,
    },
    /// ATT MTU negotiation finished for this link
    MtuChanged {
        conn: ConnHandle,
        mtu: u16,
    },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleError {
    #[error("radio busy")]
    Busy,

    #[error("invalid state for this operation")]
    InvalidState,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("out of radio resources")]
    OutOfResources,

    #[error("gatt write failed")]
    GattWriteFailed,

    #[error("unknown connection")]
    UnknownConnection,
}

/// The GAP/GATT operations consumed from the platform.
///
/// All calls are non-blocking; completions arrive as [`BleEvent`]s.
pub trait BlePlatform {
    fn start_advertising(
        &mut self,
        params: AdvParams,
        adv_data: &[u8],
        scan_data: &[u8],
    ) -> Result<(), BleError>;

    fn stop_advertising(&mut self) -> Result<(), BleError>;

    fn start_scanning(&mut self, params: ScanParams) -> Result<(), BleError>;

    fn stop_scanning(&mut self) -> Result<(), BleError>;

    /// Initiate a central-role connection to a peer seen while scanning
    fn connect(&mut self, addr: BleGapAddr, timeout_ds: u16) -> Result<(), BleError>;

    fn disconnect(&mut self, conn: ConnHandle, reason: HciReason) -> Result<(), BleError>;

    /// Queue one GATT write (with response when `reliable`) toward the peer
    fn gatt_write(
        &mut self,
        conn: ConnHandle,
        characteristic: u16,
        data: &[u8],
        reliable: bool,
    ) -> Result<(), BleError>;

    fn set_tx_power(&mut self, dbm: i8) -> Result<(), BleError>;
}
