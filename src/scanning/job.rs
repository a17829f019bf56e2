// Scan jobs - duty-cycle requests composed by the controller

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanJobTimeMode {
    Endless,
    /// Retires when `time_left_ds` reaches zero
    Timed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanJobState {
    Active,
    Inactive,
}

/// What a job scans for; the controller only cares about the duty cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanUse {
    Mesh,
    Custom,
}

/// One scanning request. Interval and window in 0.625 ms units.
#[derive(Clone, Copy, Debug)]
pub struct ScanJob {
    pub time_mode: ScanJobTimeMode,
    pub time_left_ds: u32,
    pub interval_units: u16,
    pub window_units: u16,
    pub state: ScanJobState,
    pub scan_use: ScanUse,
}

impl ScanJob {
    pub fn endless(interval_units: u16, window_units: u16, scan_use: ScanUse) -> Self {
        Self {
            time_mode: ScanJobTimeMode::Endless,
            time_left_ds: 0,
            interval_units,
            window_units,
            state: ScanJobState::Active,
            scan_use,
        }
    }

    pub fn timed(time_left_ds: u32, interval_units: u16, window_units: u16, scan_use: ScanUse) -> Self {
        Self {
            time_mode: ScanJobTimeMode::Timed,
            time_left_ds,
            interval_units,
            window_units,
            state: ScanJobState::Active,
            scan_use,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ScanJobState::Active
    }

    /// Duty cycle comparison without floating point:
    /// `a.window/a.interval > b.window/b.interval`
    pub fn higher_duty_than(&self, other: &ScanJob) -> bool {
        (self.window_units as u32) * (other.interval_units as u32)
            > (other.window_units as u32) * (self.interval_units as u32)
    }
}
