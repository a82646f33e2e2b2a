//! Battery state boundary and power mode selection.

use std::sync::Mutex;

/// Source of the device battery level.
pub trait BatteryMonitor: Send + Sync {
    /// Charge fraction in `0.0..=1.0`, or `None` when the platform can't say.
    fn level(&self) -> Option<f32>;
}

/// Platform without battery information. Degraded mode never triggers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBattery;

impl BatteryMonitor for NoBattery {
    fn level(&self) -> Option<f32> {
        None
    }
}

/// Battery level pushed in by the platform layer.
#[derive(Debug, Default)]
pub struct ReportedBattery {
    level: Mutex<Option<f32>>,
}

impl ReportedBattery {
    pub fn new(level: Option<f32>) -> Self {
        let battery = Self::default();
        battery.set_level(level);
        battery
    }

    pub fn set_level(&self, level: Option<f32>) {
        if let Ok(mut current) = self.level.lock() {
            *current = level.filter(|l| l.is_finite()).map(|l| l.clamp(0.0, 1.0));
        }
    }
}

impl BatteryMonitor for ReportedBattery {
    fn level(&self) -> Option<f32> {
        self.level.lock().ok().and_then(|l| *l)
    }
}

/// Power mode the tracking session runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    /// Normal filter thresholds
    Normal,
    /// Battery low - relaxed accuracy, coarser movement floor
    Saving,
}

impl PowerMode {
    /// Pick the mode for a battery reading. Unknown level means `Normal`.
    pub fn for_level(level: Option<f32>, low_threshold: f32) -> Self {
        match level {
            Some(l) if l < low_threshold => PowerMode::Saving,
            _ => PowerMode::Normal,
        }
    }
}
