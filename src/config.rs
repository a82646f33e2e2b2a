//! Tracker configuration.
//!
//! All thresholds are tunable. The defaults are one consistent set: the field
//! data this library was tuned against used several competing combinations,
//! and mixing them produces either phantom distance at rest or missed slow
//! motion.
//!
//! Durations are (de)serialized as seconds so a config can be shipped as JSON
//! from the app layer:
//!
//! ```
//! use triptrace::TrackerConfig;
//! let config = TrackerConfig::from_json(r#"{ "syncBatchSize": 25, "syncInterval": 120 }"#).unwrap();
//! assert_eq!(config.sync_batch_size, 25);
//! assert_eq!(config.sync_interval.as_secs(), 120);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackingError};

/// Longest accepted timer period or timeout (one day)
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Thresholds for the position filter and distance smoothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    /// Reject samples with horizontal accuracy worse than this (meters)
    pub max_accuracy_m: f64,
    /// Reject samples implying a speed above this (km/h)
    pub max_speed_kmh: f64,
    /// Movement below this is treated as jitter (meters)
    pub min_movement_m: f64,
    /// Accept a sub-threshold movement once this much time has passed
    #[serde(with = "secs")]
    pub min_interval: Duration,
    /// Speed at which distance de-weighting starts (km/h)
    pub smoothing_onset_kmh: f64,
    /// Weight applied to a segment driven at `max_speed_kmh`
    pub min_speed_weight: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_accuracy_m: 30.0,
            max_speed_kmh: 150.0,
            min_movement_m: 10.0,
            min_interval: Duration::from_secs(15),
            smoothing_onset_kmh: 90.0,
            min_speed_weight: 0.5,
        }
    }
}

impl FilterConfig {
    /// Relaxed accuracy, coarser movement floor. Used while the battery is low.
    pub fn degraded() -> Self {
        Self {
            max_accuracy_m: 50.0,
            min_movement_m: 25.0,
            min_interval: Duration::from_secs(30),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.max_accuracy_m > 0.0) {
            return Err(TrackingError::config("maxAccuracyM must be positive"));
        }
        if !(self.max_speed_kmh > 0.0) {
            return Err(TrackingError::config("maxSpeedKmh must be positive"));
        }
        if !(self.min_movement_m >= 0.0) {
            return Err(TrackingError::config("minMovementM must not be negative"));
        }
        if !(self.smoothing_onset_kmh >= 0.0 && self.smoothing_onset_kmh < self.max_speed_kmh) {
            return Err(TrackingError::config(format!(
                "smoothingOnsetKmh must be in [0, {})",
                self.max_speed_kmh
            )));
        }
        if !(self.min_speed_weight > 0.0 && self.min_speed_weight <= 1.0) {
            return Err(TrackingError::config("minSpeedWeight must be in (0, 1]"));
        }
        Ok(())
    }
}

/// REST endpoint for the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub base_url: String,
    pub api_key: String,
    /// Signed-in driver's access token, sent as the bearer instead of the API key
    pub auth_token: Option<String>,
    pub points_table: String,
    pub trips_table: String,
    #[serde(with = "secs")]
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            auth_token: None,
            points_table: "route_points".to_string(),
            trips_table: "trips".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Full tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerConfig {
    pub filter: FilterConfig,
    /// Filter used while in degraded (battery saving) mode
    pub degraded_filter: FilterConfig,

    /// Notify observers after this much new distance (km)
    pub notify_distance_km: f64,
    /// ...or after this much time since the last notification
    #[serde(with = "secs")]
    pub notify_interval: Duration,

    /// Periodic flush of cached points to the remote store
    #[serde(with = "secs")]
    pub sync_interval: Duration,
    /// Extra flush after this much new distance (km)
    pub flush_distance_km: f64,
    pub sync_batch_size: usize,

    pub enable_battery_adaptive: bool,
    /// Battery fraction (0..1) below which degraded mode is entered
    pub low_battery_threshold: f32,
    #[serde(with = "secs")]
    pub battery_check_interval: Duration,

    pub enable_geocoding: bool,
    #[serde(with = "secs")]
    pub geocode_interval: Duration,

    /// Timeout for one-shot fixes (availability probe)
    #[serde(with = "secs")]
    pub fix_timeout: Duration,
    /// Accept a cached fix this old for the availability probe
    #[serde(with = "secs")]
    pub fix_maximum_age: Duration,
    pub high_accuracy: bool,

    /// How long `stop()` waits for in-flight work before aborting it
    #[serde(with = "secs")]
    pub stop_grace: Duration,
    /// Upper bound on the best-effort flush `stop()` makes after the worker ends
    #[serde(with = "secs")]
    pub final_flush_timeout: Duration,
    /// Cache entries untouched for longer than this are evicted on start
    #[serde(with = "secs")]
    pub cache_retention: Duration,

    pub remote: Option<RemoteConfig>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            filter: FilterConfig::default(),
            degraded_filter: FilterConfig::degraded(),
            notify_distance_km: 0.05,
            notify_interval: Duration::from_secs(10),
            sync_interval: Duration::from_secs(5 * 60),
            flush_distance_km: 1.0,
            sync_batch_size: 50,
            enable_battery_adaptive: true,
            low_battery_threshold: 0.20,
            battery_check_interval: Duration::from_secs(60),
            enable_geocoding: true,
            geocode_interval: Duration::from_secs(60),
            fix_timeout: Duration::from_secs(10),
            fix_maximum_age: Duration::from_secs(30),
            high_accuracy: true,
            stop_grace: Duration::from_secs(5),
            final_flush_timeout: Duration::from_secs(10),
            cache_retention: Duration::from_secs(7 * 24 * 60 * 60),
            remote: None,
        }
    }
}

impl TrackerConfig {
    /// Parse and validate a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TrackerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        self.degraded_filter.validate()?;

        if self.sync_batch_size == 0 {
            return Err(TrackingError::config("syncBatchSize must be at least 1"));
        }
        if !(self.notify_distance_km > 0.0) || !(self.flush_distance_km > 0.0) {
            return Err(TrackingError::config(
                "notifyDistanceKm and flushDistanceKm must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.low_battery_threshold) {
            return Err(TrackingError::config("lowBatteryThreshold must be in [0, 1]"));
        }
        for (name, value) in [
            ("notifyInterval", self.notify_interval),
            ("syncInterval", self.sync_interval),
            ("batteryCheckInterval", self.battery_check_interval),
            ("geocodeInterval", self.geocode_interval),
            ("fixTimeout", self.fix_timeout),
            ("finalFlushTimeout", self.final_flush_timeout),
        ] {
            if value.is_zero() {
                return Err(TrackingError::config(format!("{} must be positive", name)));
            }
            if value > MAX_INTERVAL {
                return Err(TrackingError::config(format!(
                    "{} must not exceed {} s",
                    name,
                    MAX_INTERVAL.as_secs()
                )));
            }
        }
        if self.stop_grace > MAX_INTERVAL {
            return Err(TrackingError::config(format!(
                "stopGrace must not exceed {} s",
                MAX_INTERVAL.as_secs()
            )));
        }
        if let Some(remote) = &self.remote {
            if remote.base_url.is_empty() {
                return Err(TrackingError::config("remote.baseUrl is required"));
            }
        }
        Ok(())
    }
}

/// Serialize `Duration` as (fractional) seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
