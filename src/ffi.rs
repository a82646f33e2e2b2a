//! FFI bindings for mobile platforms (iOS/Android).
//!
//! One global tracker per process. The platform layer forwards OS location
//! callbacks, permission changes and battery readings in through the
//! `tracker_push_*` / `tracker_set_*` functions, and polls status instead of
//! receiving cross-thread callbacks.
//!
//! Feeds and the snapshot receiver live outside the session lock, so pushing
//! a location never waits behind a `tracker_start` that is itself waiting for
//! a first fix.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{info, warn};
use once_cell::sync::Lazy;
use tokio::runtime::Runtime;
use tokio::sync::watch;

use crate::battery::ReportedBattery;
use crate::cache::RouteCache;
use crate::config::TrackerConfig;
use crate::error::{Result, TrackingError};
use crate::geocode::NominatimGeocoder;
use crate::location::ChannelLocationProvider;
use crate::permission::{PermissionState, ReportedPermission};
use crate::remote::RestRouteStore;
use crate::session::{SessionCollaborators, SessionSnapshot, SessionStatus, TrackingSession};
use crate::{GeoSample, RoutePoint, init_logging};

// ============================================================================
// FFI Types
// ============================================================================

/// Cached route point as seen by the mobile layer.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiRoutePoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Unix epoch milliseconds
    pub timestamp_ms: i64,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    pub synced: bool,
}

impl From<RoutePoint> for FfiRoutePoint {
    fn from(p: RoutePoint) -> Self {
        Self {
            latitude: p.latitude,
            longitude: p.longitude,
            timestamp_ms: p.timestamp.timestamp_millis(),
            accuracy: p.accuracy,
            speed: p.speed,
            heading: p.heading,
            altitude: p.altitude,
            synced: p.synced,
        }
    }
}

/// Result of polling the tracker.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiTrackerStatus {
    /// idle, starting, active, degraded, stopping or error
    pub state: String,
    pub error: Option<String>,
    pub trip_id: Option<String>,
    pub total_distance_km: f64,
    pub samples_seen: u64,
    pub accepted_points: u64,
    pub last_sync_ms: Option<i64>,
}

impl From<SessionSnapshot> for FfiTrackerStatus {
    fn from(s: SessionSnapshot) -> Self {
        let (state, error) = match s.status {
            SessionStatus::Idle => ("idle", None),
            SessionStatus::Starting => ("starting", None),
            SessionStatus::Active => ("active", None),
            SessionStatus::Degraded => ("degraded", None),
            SessionStatus::Stopping => ("stopping", None),
            SessionStatus::Error(reason) => ("error", Some(reason)),
        };
        Self {
            state: state.to_string(),
            error,
            trip_id: s.trip_id,
            total_distance_km: s.total_distance_km,
            samples_seen: s.samples_seen,
            accepted_points: s.accepted_points,
            last_sync_ms: s.last_sync_at.map(|t| t.timestamp_millis()),
        }
    }
}

// ============================================================================
// Global State
// ============================================================================

/// Platform feeds. Cheap to clone out of the lock.
#[derive(Clone)]
struct Feeds {
    location: ChannelLocationProvider,
    permission: Arc<ReportedPermission>,
    battery: Arc<ReportedBattery>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

struct Tracker {
    // Field order matters: the session (and its worker) drop before the runtime
    session: TrackingSession,
    runtime: Runtime,
}

static FEEDS: Lazy<Mutex<Option<Feeds>>> = Lazy::new(|| Mutex::new(None));

static TRACKER: Lazy<Mutex<Option<Tracker>>> = Lazy::new(|| Mutex::new(None));

fn feeds() -> Option<Feeds> {
    FEEDS.lock().ok().and_then(|guard| guard.clone())
}

fn with_tracker<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Tracker) -> R,
{
    let mut guard = TRACKER.lock().ok()?;
    guard.as_mut().map(f)
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn build(db_path: &str, config_json: &str) -> Result<(Tracker, Feeds)> {
    let config = if config_json.trim().is_empty() {
        TrackerConfig::default()
    } else {
        TrackerConfig::from_json(config_json)?
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|e| TrackingError::config(format!("Failed to create runtime: {}", e)))?;

    let cache = RouteCache::open(db_path)?;
    let location = ChannelLocationProvider::new();
    let permission = Arc::new(ReportedPermission::new(PermissionState::Prompt));
    let battery = Arc::new(ReportedBattery::default());

    let mut collaborators =
        SessionCollaborators::new(Arc::new(location.clone()), permission.clone(), cache)
            .with_battery(battery.clone());
    if let Some(remote) = &config.remote {
        collaborators = collaborators.with_remote(Arc::new(RestRouteStore::new(remote)?));
    }
    if config.enable_geocoding {
        let user_agent = format!("triptrace/{}", env!("CARGO_PKG_VERSION"));
        collaborators = collaborators.with_geocoder(Arc::new(NominatimGeocoder::new(&user_agent)?));
    }

    let session = TrackingSession::new(collaborators, config)?;
    let feeds = Feeds {
        location,
        permission,
        battery,
        snapshot: session.subscribe(),
    };

    Ok((Tracker { session, runtime }, feeds))
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Create the global tracker. Call once at app startup.
///
/// `config_json` is a camelCase `TrackerConfig`; empty means defaults.
/// Replaces (and stops) any previous tracker.
#[uniffi::export]
pub fn tracker_init(db_path: String, config_json: String) -> bool {
    init_logging();
    let start = Instant::now();
    info!("[TrackerFfi] Initializing with db: {}", db_path);

    let (tracker, new_feeds) = match build(&db_path, &config_json) {
        Ok(built) => built,
        Err(e) => {
            warn!("[TrackerFfi] Failed to initialize: {}", e);
            return false;
        }
    };

    let previous = match TRACKER.lock() {
        Ok(mut guard) => guard.replace(tracker),
        Err(_) => return false,
    };
    if let Some(mut previous) = previous {
        previous.runtime.block_on(previous.session.stop());
    }
    if let Ok(mut guard) = FEEDS.lock() {
        *guard = Some(new_feeds);
    }

    info!("[TrackerFfi] Initialized ({} ms)", elapsed_ms(start));
    true
}

/// Start tracking a trip. On `false`, `tracker_status().error` says why.
#[uniffi::export]
pub fn tracker_start(trip_id: String) -> bool {
    with_tracker(|t| match t.runtime.block_on(t.session.start(&trip_id)) {
        Ok(()) => true,
        Err(e) => {
            warn!("[TrackerFfi] Start of {} failed: {}", trip_id, e);
            false
        }
    })
    .unwrap_or(false)
}

/// Stop tracking and make a final best-effort sync.
///
/// Returns within `stopGrace` plus `finalFlushTimeout` even when offline.
#[uniffi::export]
pub fn tracker_stop() {
    with_tracker(|t| t.runtime.block_on(t.session.stop()));
}

// ============================================================================
// Platform Feeds
// ============================================================================

/// Forward one OS location callback. Returns how many watches received it.
#[uniffi::export]
pub fn tracker_push_location(
    latitude: f64,
    longitude: f64,
    timestamp_ms: i64,
    accuracy: Option<f64>,
    speed: Option<f64>,
    heading: Option<f64>,
    altitude: Option<f64>,
) -> u32 {
    let Some(feeds) = feeds() else {
        return 0;
    };
    let Some(timestamp) = DateTime::<Utc>::from_timestamp_millis(timestamp_ms) else {
        warn!("[TrackerFfi] Dropping sample with bad timestamp {}", timestamp_ms);
        return 0;
    };

    let sample = GeoSample {
        latitude,
        longitude,
        timestamp,
        accuracy,
        speed,
        heading,
        altitude,
    };
    feeds.location.push_sample(sample) as u32
}

/// Forward an OS location failure (e.g. location services switched off).
#[uniffi::export]
pub fn tracker_push_location_error(message: String) {
    if let Some(feeds) = feeds() {
        feeds.location.push_error(&message);
    }
}

/// Report the OS permission state. Anything but `Granted` while tracking
/// fails the session with `PermissionDenied` at the next sample or health check.
#[uniffi::export]
pub fn tracker_set_permission(state: PermissionState) {
    if let Some(feeds) = feeds() {
        feeds.permission.set_state(state);
    }
}

/// Battery charge in `0.0..=1.0`; `None` when unknown.
#[uniffi::export]
pub fn tracker_set_battery_level(level: Option<f32>) {
    if let Some(feeds) = feeds() {
        feeds.battery.set_level(level);
    }
}

// ============================================================================
// Queries
// ============================================================================

#[uniffi::export]
pub fn tracker_status() -> FfiTrackerStatus {
    let snapshot = feeds()
        .map(|f| f.snapshot.borrow().clone())
        .unwrap_or_default();
    snapshot.into()
}

#[uniffi::export]
pub fn tracker_total_distance_km() -> f64 {
    feeds()
        .map(|f| f.snapshot.borrow().total_distance_km)
        .unwrap_or(0.0)
}

#[uniffi::export]
pub fn tracker_get_cached_points(trip_id: String) -> Vec<FfiRoutePoint> {
    with_tracker(|t| match t.session.get_cached_points(&trip_id) {
        Ok(points) => points.into_iter().map(FfiRoutePoint::from).collect(),
        Err(e) => {
            warn!("[TrackerFfi] Reading points of {} failed: {}", trip_id, e);
            Vec::new()
        }
    })
    .unwrap_or_default()
}

/// Points of a trip not yet confirmed by the remote store.
#[uniffi::export]
pub fn tracker_pending_count(trip_id: String) -> u32 {
    with_tracker(|t| t.session.cache().unsynced_count(&trip_id).unwrap_or(0)).unwrap_or(0)
}

/// Push a trip's cached points now. `None` if the sync could not run at all.
#[uniffi::export]
pub fn tracker_sync_now(trip_id: String) -> Option<u32> {
    with_tracker(|t| match t.runtime.block_on(t.session.sync_now(&trip_id)) {
        Ok(confirmed) => Some(confirmed as u32),
        Err(e) => {
            warn!("[TrackerFfi] Sync of {} failed: {}", trip_id, e);
            None
        }
    })
    .flatten()
}

/// Drop cached trips not updated in the last `days` days. 0 keeps everything.
#[uniffi::export]
pub fn tracker_evict_older_than_days(days: u32) -> u32 {
    if days == 0 {
        return 0;
    }
    let max_age = Duration::from_secs(u64::from(days) * 24 * 60 * 60);
    with_tracker(|t| match t.session.cache().evict_older_than(max_age) {
        Ok(n) => n as u32,
        Err(e) => {
            warn!("[TrackerFfi] Eviction failed: {}", e);
            0
        }
    })
    .unwrap_or(0)
}

#[uniffi::export]
pub fn tracker_current_place() -> Option<String> {
    with_tracker(|t| t.session.current_place()).flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_mapping() {
        let status: FfiTrackerStatus = SessionSnapshot {
            status: SessionStatus::Error("GPS switched off".to_string()),
            trip_id: Some("trip-1".to_string()),
            total_distance_km: 1.5,
            ..SessionSnapshot::default()
        }
        .into();
        assert_eq!(status.state, "error");
        assert_eq!(status.error.as_deref(), Some("GPS switched off"));
        assert_eq!(status.total_distance_km, 1.5);

        let idle: FfiTrackerStatus = SessionSnapshot::default().into();
        assert_eq!(idle.state, "idle");
        assert_eq!(idle.error, None);
    }

    #[test]
    fn test_route_point_conversion() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let point = RoutePoint::from_sample("trip-1", &GeoSample::new(10.0, 20.0, ts));
        let ffi = FfiRoutePoint::from(point);
        assert_eq!(ffi.timestamp_ms, 1_700_000_000_000);
        assert!(!ffi.synced);
    }
}
