// Scan duty-cycle composition driven through the controller

use blemesh::ble::{
    AdvParams, BleError, BleGapAddr, BlePlatform, ConnHandle, HciReason, ScanParams,
};
use blemesh::scanning::{ScanController, ScanJob, ScanUse};
use blemesh::util::ErrorLog;

/// Radio stub that remembers the scan parameters it was given
struct ScanRadio {
    current: Option<ScanParams>,
}

impl BlePlatform for ScanRadio {
    fn start_advertising(
        &mut self,
        _params: AdvParams,
        _adv_data: &[u8],
        _scan_data: &[u8],
    ) -> Result<(), BleError> {
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), BleError> {
        Ok(())
    }

    fn start_scanning(&mut self, params: ScanParams) -> Result<(), BleError> {
        self.current = Some(params);
        Ok(())
    }

    fn stop_scanning(&mut self) -> Result<(), BleError> {
        self.current = None;
        Ok(())
    }

    fn connect(&mut self, _addr: BleGapAddr, _timeout_ds: u16) -> Result<(), BleError> {
        Ok(())
    }

    fn disconnect(&mut self, _conn: ConnHandle, _reason: HciReason) -> Result<(), BleError> {
        Ok(())
    }

    fn gatt_write(
        &mut self,
        _conn: ConnHandle,
        _characteristic: u16,
        _data: &[u8],
        _reliable: bool,
    ) -> Result<(), BleError> {
        Ok(())
    }

    fn set_tx_power(&mut self, _dbm: i8) -> Result<(), BleError> {
        Ok(())
    }
}

// 0.625 ms units: 100 ms = 160, 50 ms = 80, 40 ms = 64, 60 ms = 96

#[test]
fn test_highest_window_wins_and_returns_after_timeout() {
    let mut controller = ScanController::new();
    let mut radio = ScanRadio { current: None };
    let mut errors = ErrorLog::new();

    controller
        .add_job(ScanJob::endless(160, 80, ScanUse::Mesh))
        .unwrap();
    controller
        .add_job(ScanJob::endless(160, 64, ScanUse::Custom))
        .unwrap();
    controller.timer(1, &mut radio, &mut errors);
    assert_eq!(radio.current.unwrap().window_units, 80);

    // A higher-duty request takes over
    controller
        .add_job(ScanJob::timed(50, 160, 96, ScanUse::Custom))
        .unwrap();
    controller.timer(1, &mut radio, &mut errors);
    assert_eq!(radio.current.unwrap().window_units, 96);

    // ...and retires after its fifty deciseconds
    for _ in 0..50 {
        controller.timer(1, &mut radio, &mut errors);
    }
    assert_eq!(radio.current.unwrap().window_units, 80);
    assert_eq!(controller.job_count(), 2);
}

#[test]
fn test_add_remove_restores_idle_scanner() {
    let mut controller = ScanController::new();
    let mut radio = ScanRadio { current: None };
    let mut errors = ErrorLog::new();

    controller.timer(1, &mut radio, &mut errors);
    assert!(!controller.scanning_active());

    let handle = controller
        .add_job(ScanJob::endless(160, 80, ScanUse::Custom))
        .unwrap();
    controller.timer(1, &mut radio, &mut errors);
    assert!(controller.scanning_active());

    controller.remove_job(handle);
    controller.timer(1, &mut radio, &mut errors);
    assert!(!controller.scanning_active());
    assert!(radio.current.is_none());
}
