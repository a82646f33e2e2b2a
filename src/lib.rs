//! # Triptrace
//!
//! Client-side GPS tracking and route caching for cargo-truck trips.
//!
//! This library provides:
//! - Haversine distance estimation and GPS noise filtering
//! - A durable SQLite route cache that survives app restarts
//! - A tracking session that accumulates trip distance from a live position stream
//! - Best-effort batched sync of cached points to a remote REST store
//!
//! ## Features
//!
//! - **`http`** - REST implementations of the remote store and reverse geocoder
//! - **`ffi`** - FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use triptrace::{GeoPoint, geo_utils::distance_km};
//!
//! let depot = GeoPoint::new(10.0000, 20.0000);
//! let gate = GeoPoint::new(10.0010, 20.0000);
//! let km = distance_km(&depot, &gate);
//! assert!((km - 0.111).abs() < 0.001);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{Result, TrackingError};

// Geographic utilities (haversine distance, polyline length)
pub mod geo_utils;

// Tracker configuration (thresholds, intervals, remote endpoint)
pub mod config;
pub use config::{FilterConfig, RemoteConfig, TrackerConfig};

// Position filter (accept/reject raw GPS samples)
pub mod filter;
pub use filter::{Decision, RejectReason};

// Durable local route cache
pub mod cache;
mod migrations;
pub use cache::{RouteCache, TripSummary};

// Device collaborators
pub mod battery;
pub mod location;
pub mod permission;
pub use battery::{BatteryMonitor, NoBattery, PowerMode, ReportedBattery};
pub use location::{ChannelLocationProvider, LocationProvider, Subscription};
pub use permission::{
    AvailabilityGuard, GuardStatus, PermissionProvider, PermissionState, ReportedPermission,
};

// Remote store and batched sync
pub mod remote;
pub mod sync;
pub use remote::RemoteStore;
pub use sync::{SyncAgent, SyncReport};

// Best-effort reverse geocoding
pub mod geocode;
pub use geocode::Geocoder;

// Per-trip accumulation state and the tracking session that drives it
pub mod session;
pub mod tracker;
pub use session::{SessionCollaborators, SessionSnapshot, SessionStatus, TrackingSession};
pub use tracker::TripTrackingState;

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("triptrace"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
pub(crate) fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use triptrace::GeoPoint;
/// let point = GeoPoint::new(-23.5505, -46.6333); // São Paulo
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// One raw reading from the device location API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoSample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    /// Estimated horizontal error in meters, when the platform reports one
    pub accuracy: Option<f64>,
    /// Device-reported speed in m/s
    pub speed: Option<f64>,
    /// Degrees clockwise from north
    pub heading: Option<f64>,
    /// Meters above sea level
    pub altitude: Option<f64>,
}

impl GeoSample {
    /// Create a sample with only position and time.
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
            accuracy: None,
            speed: None,
            heading: None,
            altitude: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed = Some(speed_mps);
        self
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// An accepted sample persisted for a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePoint {
    pub trip_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    /// Confirmed written to the remote store
    pub synced: bool,
}

impl RoutePoint {
    /// Build an unsynced route point from an accepted sample.
    pub fn from_sample(trip_id: &str, sample: &GeoSample) -> Self {
        Self {
            trip_id: trip_id.to_string(),
            latitude: sample.latitude,
            longitude: sample.longitude,
            timestamp: sample.timestamp,
            accuracy: sample.accuracy,
            speed: sample.speed,
            heading: sample.heading,
            altitude: sample.altitude,
            synced: false,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// The sample this point was recorded from.
    pub fn sample(&self) -> GeoSample {
        GeoSample {
            latitude: self.latitude,
            longitude: self.longitude,
            timestamp: self.timestamp,
            accuracy: self.accuracy,
            speed: self.speed,
            heading: self.heading,
            altitude: self.altitude,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_point_validity() {
        assert!(GeoPoint::new(45.0, 90.0).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.5).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_route_point_from_sample() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let sample = GeoSample::new(10.0, 20.0, ts).with_accuracy(5.0);
        let point = RoutePoint::from_sample("trip-1", &sample);

        assert_eq!(point.trip_id, "trip-1");
        assert_eq!(point.timestamp, ts);
        assert_eq!(point.accuracy, Some(5.0));
        assert!(!point.synced);
    }
}
