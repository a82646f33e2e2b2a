//! # Position Filter
//!
//! Pure accept/reject decision over a raw sample and the last accepted point.
//!
//! GPS jitter at rest looks like a few meters of movement per fix. The
//! distance floor keeps a parked truck from accruing phantom distance, and the
//! time override lets a truck crawling through a yard still register.

use std::fmt;

use crate::config::FilterConfig;
use crate::geo_utils::distance_km;
use crate::{GeoSample, RoutePoint};

/// Why a sample was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Reported accuracy worse than the configured threshold
    LowAccuracy,
    /// Implied or reported speed above the plausibility ceiling
    ImplausibleSpeed,
    /// Too little movement too soon after the last accepted point
    InsufficientMovement,
    /// NaN or out-of-range coordinates
    InvalidCoordinates,
    /// Timestamp not after the last accepted point
    OutOfOrder,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::LowAccuracy => "low accuracy",
            RejectReason::ImplausibleSpeed => "implausible speed",
            RejectReason::InsufficientMovement => "insufficient movement",
            RejectReason::InvalidCoordinates => "invalid coordinates",
            RejectReason::OutOfOrder => "out of order",
        };
        f.write_str(s)
    }
}

/// Filter verdict for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(RejectReason),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept)
    }
}

/// Decide whether `sample` should be recorded given the last accepted point.
pub fn accept(sample: &GeoSample, previous: Option<&RoutePoint>, config: &FilterConfig) -> Decision {
    if !sample.point().is_valid() {
        return Decision::Reject(RejectReason::InvalidCoordinates);
    }

    if let Some(accuracy) = sample.accuracy {
        if !(accuracy <= config.max_accuracy_m) {
            return Decision::Reject(RejectReason::LowAccuracy);
        }
    }

    let Some(previous) = previous else {
        return Decision::Accept;
    };

    let elapsed = sample.timestamp - previous.timestamp;
    let Ok(elapsed) = elapsed.to_std() else {
        return Decision::Reject(RejectReason::OutOfOrder);
    };
    if elapsed.is_zero() {
        return Decision::Reject(RejectReason::OutOfOrder);
    }

    if effective_speed_kmh(sample, previous) > config.max_speed_kmh {
        return Decision::Reject(RejectReason::ImplausibleSpeed);
    }

    let moved_m = distance_km(&previous.point(), &sample.point()) * 1000.0;
    if moved_m < config.min_movement_m && elapsed <= config.min_interval {
        return Decision::Reject(RejectReason::InsufficientMovement);
    }

    Decision::Accept
}

/// Speed implied by moving from `previous` to `sample`, in km/h.
///
/// Returns infinity when the timestamps do not advance.
pub fn derived_speed_kmh(sample: &GeoSample, previous: &RoutePoint) -> f64 {
    let hours = (sample.timestamp - previous.timestamp).num_milliseconds() as f64 / 3_600_000.0;
    if hours <= 0.0 {
        return f64::INFINITY;
    }
    distance_km(&previous.point(), &sample.point()) / hours
}

/// Device-reported speed when present, otherwise the derived one (km/h).
pub fn effective_speed_kmh(sample: &GeoSample, previous: &RoutePoint) -> f64 {
    match sample.speed {
        Some(mps) if mps.is_finite() && mps >= 0.0 => mps * 3.6,
        _ => derived_speed_kmh(sample, previous),
    }
}

/// Weight applied to a segment's distance at the given speed.
///
/// 1.0 up to the smoothing onset, then linear down to `min_speed_weight` at
/// the plausibility ceiling. A single noisy fast sample that slips through the
/// filter contributes less than its raw distance.
pub fn speed_weight(speed_kmh: f64, config: &FilterConfig) -> f64 {
    if !(speed_kmh > config.smoothing_onset_kmh) {
        return 1.0;
    }
    if speed_kmh >= config.max_speed_kmh {
        return config.min_speed_weight;
    }
    let span = config.max_speed_kmh - config.smoothing_onset_kmh;
    let t = (speed_kmh - config.smoothing_onset_kmh) / span;
    1.0 - t * (1.0 - config.min_speed_weight)
}
