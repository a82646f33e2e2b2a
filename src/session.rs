//! # Tracking Session
//!
//! Drives one trip at a time from a live position watch.
//!
//! `start` checks permission and sensor availability, opens the watch and
//! spawns a worker task that owns the trip's [`TripTrackingState`]. The worker
//! handles samples strictly in delivery order: filter, accumulate, cache,
//! notify. Periodic sync and battery checks run on the same task, so there is
//! never more than one writer of the accumulators.
//!
//! `stop` signals the worker, waits for it (bounded), closes the watch, makes
//! a last best-effort flush (also bounded) and resets to `Idle`. Anything the
//! worker was still doing is discarded along with its state. Starting a
//! different trip while one is running finishes the old trip the same way.
//!
//! Callers observe progress through [`TrackingSession::subscribe`] (a watch
//! channel of [`SessionSnapshot`]) or the distance/error callbacks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::battery::{BatteryMonitor, NoBattery, PowerMode};
use crate::cache::RouteCache;
use crate::config::{FilterConfig, TrackerConfig};
use crate::error::{Result, TrackingError};
use crate::geocode::Geocoder;
use crate::location::{FixOptions, LocationEvent, LocationProvider, SubscriptionId, WatchOptions};
use crate::permission::{AvailabilityGuard, PermissionProvider, PermissionState};
use crate::remote::RemoteStore;
use crate::sync::SyncAgent;
use crate::tracker::{Ingest, TripTrackingState};
use crate::{GeoSample, RoutePoint};

/// Lifecycle state of a tracking session.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SessionStatus {
    #[default]
    Idle,
    Starting,
    Active,
    /// Tracking with relaxed thresholds to save battery
    Degraded,
    Stopping,
    Error(String),
}

impl SessionStatus {
    fn for_mode(mode: PowerMode) -> Self {
        match mode {
            PowerMode::Normal => SessionStatus::Active,
            PowerMode::Saving => SessionStatus::Degraded,
        }
    }

    /// A worker is consuming the position watch.
    pub fn is_tracking(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Degraded)
    }
}

/// Point-in-time view of the session, published on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub trip_id: Option<String>,
    pub total_distance_km: f64,
    /// Raw samples delivered to the worker, accepted or not
    pub samples_seen: u64,
    pub accepted_points: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

pub type DistanceCallback = Arc<dyn Fn(f64) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&TrackingError) + Send + Sync>;

/// External systems a session talks to.
pub struct SessionCollaborators {
    pub location: Arc<dyn LocationProvider>,
    pub permission: Arc<dyn PermissionProvider>,
    pub battery: Arc<dyn BatteryMonitor>,
    pub cache: RouteCache,
    pub remote: Option<Arc<dyn RemoteStore>>,
    pub geocoder: Option<Arc<dyn Geocoder>>,
}

impl SessionCollaborators {
    /// Location, permission and cache are required; the rest default to absent.
    pub fn new(
        location: Arc<dyn LocationProvider>,
        permission: Arc<dyn PermissionProvider>,
        cache: RouteCache,
    ) -> Self {
        Self {
            location,
            permission,
            battery: Arc::new(NoBattery),
            cache,
            remote: None,
            geocoder: None,
        }
    }

    pub fn with_battery(mut self, battery: Arc<dyn BatteryMonitor>) -> Self {
        self.battery = battery;
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }
}

#[derive(Default)]
struct Observers {
    distance: Mutex<Vec<DistanceCallback>>,
    error: Mutex<Vec<ErrorCallback>>,
}

impl Observers {
    fn distance_changed(&self, total_km: f64) {
        // Snapshot the list so a callback may register another one
        let callbacks = self.distance.lock().map(|c| c.clone()).unwrap_or_default();
        for callback in callbacks {
            callback(total_km);
        }
    }

    fn error(&self, error: &TrackingError) {
        let callbacks = self.error.lock().map(|c| c.clone()).unwrap_or_default();
        for callback in callbacks {
            callback(error);
        }
    }
}

/// Latest reverse-geocoded label, tagged with the run that produced it.
#[derive(Default)]
struct PlaceSlot {
    generation: u64,
    label: Option<String>,
}

/// Handle to a spawned worker.
struct RunningWorker {
    trip_id: String,
    subscription_id: SubscriptionId,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<TripTrackingState>,
}

impl RunningWorker {
    /// Stop the worker and close its watch. `None` if it had to be aborted.
    async fn halt(self, grace: Duration, location: &dyn LocationProvider) -> Option<TripTrackingState> {
        let RunningWorker {
            trip_id,
            subscription_id,
            shutdown,
            mut handle,
        } = self;

        // Already gone if the worker ended on a stream error
        let _ = shutdown.send(());

        let state = match time::timeout(grace, &mut handle).await {
            Ok(Ok(state)) => Some(state),
            Ok(Err(e)) => {
                warn!("[TrackingSession] Worker for trip {} ended abnormally: {}", trip_id, e);
                None
            }
            Err(_) => {
                warn!(
                    "[TrackingSession] Worker for trip {} did not stop within {:?}, aborting",
                    trip_id, grace
                );
                handle.abort();
                let _ = handle.await;
                None
            }
        };

        location.unsubscribe(subscription_id);
        state
    }
}

/// Tracks one trip at a time. See the module docs for the lifecycle.
pub struct TrackingSession {
    config: TrackerConfig,
    location: Arc<dyn LocationProvider>,
    permission: Arc<dyn PermissionProvider>,
    battery: Arc<dyn BatteryMonitor>,
    cache: RouteCache,
    sync: Option<SyncAgent>,
    geocoder: Option<Arc<dyn Geocoder>>,
    observers: Arc<Observers>,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
    place: Arc<Mutex<PlaceSlot>>,
    running: Option<RunningWorker>,
}

impl TrackingSession {
    pub fn new(collaborators: SessionCollaborators, config: TrackerConfig) -> Result<Self> {
        config.validate()?;

        let sync = collaborators
            .remote
            .map(|remote| SyncAgent::new(collaborators.cache.clone(), remote, config.sync_batch_size));
        if sync.is_none() {
            info!("[TrackingSession] No remote store configured, points stay local");
        }

        let (snapshot, _) = watch::channel(SessionSnapshot::default());

        Ok(Self {
            config,
            location: collaborators.location,
            permission: collaborators.permission,
            battery: collaborators.battery,
            cache: collaborators.cache,
            sync,
            geocoder: collaborators.geocoder,
            observers: Arc::new(Observers::default()),
            snapshot: Arc::new(snapshot),
            place: Arc::new(Mutex::new(PlaceSlot::default())),
            running: None,
        })
    }

    /// Begin tracking `trip_id`.
    ///
    /// A session that is already running is stopped first, so at most one
    /// watch is ever open. A different running trip gets its final flush; the
    /// same trip is only restarted. If the trip already has cached points,
    /// accumulation resumes from them.
    pub async fn start(&mut self, trip_id: &str) -> Result<()> {
        if trip_id.is_empty() {
            return Err(TrackingError::InvalidState {
                message: "trip id must not be empty".to_string(),
            });
        }

        if let Some(previous) = self.running.take() {
            if previous.trip_id == trip_id {
                info!(
                    "[TrackingSession] Restarting: closing watch {} of trip {}",
                    previous.subscription_id, previous.trip_id
                );
                previous.halt(self.config.stop_grace, self.location.as_ref()).await;
            } else {
                info!(
                    "[TrackingSession] Switching from trip {} to {}",
                    previous.trip_id, trip_id
                );
                self.finish(previous).await;
            }
        }

        let generation = self.reset_place();
        self.snapshot.send_replace(SessionSnapshot {
            status: SessionStatus::Starting,
            trip_id: Some(trip_id.to_string()),
            ..SessionSnapshot::default()
        });

        match self.cache.evict_older_than(self.config.cache_retention) {
            Ok(0) => {}
            Ok(n) => info!("[TrackingSession] Evicted {} stale cached trips", n),
            Err(e) => warn!("[TrackingSession] Cache eviction failed: {}", e),
        }

        let guard = AvailabilityGuard::new(
            self.permission.clone(),
            self.location.clone(),
            self.fix_options(),
        );
        if let Err(e) = guard.check().await.into_result() {
            return Err(self.fail_start(e));
        }

        let subscription = match self.location.subscribe(&self.watch_options()) {
            Ok(subscription) => subscription,
            Err(e) => return Err(self.fail_start(e)),
        };

        let mode = self.power_mode();
        let state = match self.cache.read(trip_id) {
            Ok(points) if !points.is_empty() => {
                info!(
                    "[TrackingSession] Resuming trip {} from {} cached points",
                    trip_id,
                    points.len()
                );
                TripTrackingState::resume(trip_id, &points, filter_for(&self.config, mode))
            }
            Ok(_) => TripTrackingState::new(trip_id),
            Err(e) => {
                warn!("[TrackingSession] Could not read cached points for {}: {}", trip_id, e);
                self.observers.error(&e);
                TripTrackingState::new(trip_id)
            }
        };

        self.snapshot.send_replace(SessionSnapshot {
            status: SessionStatus::for_mode(mode),
            trip_id: Some(trip_id.to_string()),
            total_distance_km: state.total_distance_km,
            samples_seen: state.samples_seen,
            accepted_points: state.accepted_points,
            last_sync_at: None,
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = Worker {
            config: self.config.clone(),
            cache: self.cache.clone(),
            sync: self.sync.clone(),
            geocoder: self.geocoder.clone(),
            battery: self.battery.clone(),
            permission: self.permission.clone(),
            location: self.location.clone(),
            subscription_id: subscription.id,
            observers: self.observers.clone(),
            snapshot: self.snapshot.clone(),
            place: self.place.clone(),
            generation,
            mode,
            last_geocode_at: None,
        };
        let handle = tokio::spawn(worker.run(state, subscription.receiver, shutdown_rx));

        info!(
            "[TrackingSession] Tracking trip {} on watch {} ({:?})",
            trip_id, subscription.id, mode
        );

        self.running = Some(RunningWorker {
            trip_id: trip_id.to_string(),
            subscription_id: subscription.id,
            shutdown: shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop tracking, flush what the cache holds and reset to `Idle`.
    ///
    /// Safe to call in any state. Takes at most `stop_grace` plus
    /// `final_flush_timeout`. Remote failures or a flush that runs out of time
    /// are logged only; the points stay cached for a later `sync_now`.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            self.reset_place();
            self.snapshot.send_replace(SessionSnapshot::default());
            return;
        };

        self.snapshot.send_modify(|s| s.status = SessionStatus::Stopping);
        self.finish(running).await;

        self.reset_place();
        self.snapshot.send_replace(SessionSnapshot::default());
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.borrow().status.clone()
    }

    pub fn total_distance_km(&self) -> f64 {
        self.snapshot.borrow().total_distance_km
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that sees every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Called with the running total, throttled by the notify thresholds.
    pub fn on_distance_update(&self, callback: impl Fn(f64) + Send + Sync + 'static) {
        if let Ok(mut callbacks) = self.observers.distance.lock() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// Called for stream failures, cache write failures and failed sync batches.
    pub fn on_error(&self, callback: impl Fn(&TrackingError) + Send + Sync + 'static) {
        if let Ok(mut callbacks) = self.observers.error.lock() {
            callbacks.push(Arc::new(callback));
        }
    }

    pub fn get_cached_points(&self, trip_id: &str) -> Result<Vec<RoutePoint>> {
        self.cache.read(trip_id)
    }

    /// Push a trip's cached points now. Returns how many the remote confirmed.
    pub async fn sync_now(&self, trip_id: &str) -> Result<usize> {
        let sync = self
            .sync
            .as_ref()
            .ok_or_else(|| TrackingError::config("no remote store configured"))?;
        let report = sync.sync_trip(trip_id).await?;
        Ok(report.confirmed)
    }

    /// Most recent place label for the running trip, if a lookup succeeded.
    pub fn current_place(&self) -> Option<String> {
        self.place.lock().ok().and_then(|slot| slot.label.clone())
    }

    pub fn cache(&self) -> &RouteCache {
        &self.cache
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn fix_options(&self) -> FixOptions {
        FixOptions {
            high_accuracy: self.config.high_accuracy,
            timeout: self.config.fix_timeout,
            maximum_age: self.config.fix_maximum_age,
        }
    }

    fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            high_accuracy: self.config.high_accuracy,
            ..WatchOptions::default()
        }
    }

    fn power_mode(&self) -> PowerMode {
        if self.config.enable_battery_adaptive {
            PowerMode::for_level(self.battery.level(), self.config.low_battery_threshold)
        } else {
            PowerMode::Normal
        }
    }

    /// Halt a trip's worker and make its final, time-limited flush.
    async fn finish(&self, running: RunningWorker) {
        let trip_id = running.trip_id.clone();
        let final_state = running
            .halt(self.config.stop_grace, self.location.as_ref())
            .await;
        let total_km = match &final_state {
            Some(state) => state.total_distance_km,
            None => self.snapshot.borrow().total_distance_km,
        };

        if let Some(sync) = &self.sync {
            let flush = async {
                match sync.sync_trip(&trip_id).await {
                    Ok(report) if !report.is_complete() => warn!(
                        "[TrackingSession] Final flush of {} incomplete: {}/{} points",
                        trip_id, report.confirmed, report.attempted
                    ),
                    Ok(_) => {}
                    Err(e) => warn!("[TrackingSession] Final flush of {} failed: {}", trip_id, e),
                }
                if let Err(e) = sync.push_distance(&trip_id, total_km).await {
                    warn!("[TrackingSession] Final distance push for {} failed: {}", trip_id, e);
                }
            };
            if time::timeout(self.config.final_flush_timeout, flush).await.is_err() {
                warn!(
                    "[TrackingSession] Final flush of {} gave up after {:?}, points stay cached",
                    trip_id, self.config.final_flush_timeout
                );
            }
        }

        info!("[TrackingSession] Stopped trip {} at {:.3} km", trip_id, total_km);
    }

    /// Clear the place label and invalidate lookups still in flight.
    fn reset_place(&self) -> u64 {
        match self.place.lock() {
            Ok(mut slot) => {
                slot.generation += 1;
                slot.label = None;
                slot.generation
            }
            Err(_) => 0,
        }
    }

    fn fail_start(&self, error: TrackingError) -> TrackingError {
        warn!("[TrackingSession] Cannot start: {}", error);
        self.snapshot
            .send_modify(|s| s.status = SessionStatus::Error(error.to_string()));
        self.observers.error(&error);
        error
    }
}

fn filter_for(config: &TrackerConfig, mode: PowerMode) -> &FilterConfig {
    match mode {
        PowerMode::Normal => &config.filter,
        PowerMode::Saving => &config.degraded_filter,
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.handle.abort();
            self.location.unsubscribe(running.subscription_id);
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    config: TrackerConfig,
    cache: RouteCache,
    sync: Option<SyncAgent>,
    geocoder: Option<Arc<dyn Geocoder>>,
    battery: Arc<dyn BatteryMonitor>,
    permission: Arc<dyn PermissionProvider>,
    location: Arc<dyn LocationProvider>,
    subscription_id: SubscriptionId,
    observers: Arc<Observers>,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
    place: Arc<Mutex<PlaceSlot>>,
    generation: u64,
    mode: PowerMode,
    last_geocode_at: Option<DateTime<Utc>>,
}

impl Worker {
    async fn run(
        mut self,
        mut state: TripTrackingState,
        mut events: mpsc::UnboundedReceiver<LocationEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> TripTrackingState {
        let sync_every = self.config.sync_interval;
        let mut sync_tick = time::interval_at(Instant::now() + sync_every, sync_every);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Battery level and permission are re-read on the same tick
        let mut health_tick = time::interval(self.config.battery_check_interval);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                event = events.recv() => match event {
                    Some(Ok(sample)) => {
                        if self.permission_revoked().await {
                            break;
                        }
                        self.handle_sample(&mut state, sample).await;
                    }
                    Some(Err(e)) => {
                        self.fail(e);
                        break;
                    }
                    None => {
                        self.fail(TrackingError::Stream {
                            message: "location watch closed".to_string(),
                        });
                        break;
                    }
                },

                _ = sync_tick.tick() => self.flush(&mut state).await,

                _ = health_tick.tick() => {
                    if self.permission_revoked().await {
                        break;
                    }
                    self.check_battery();
                }
            }
        }

        debug!(
            "[TrackingSession] Worker for trip {} exiting after {} samples",
            state.trip_id, state.samples_seen
        );
        state
    }

    async fn handle_sample(&mut self, state: &mut TripTrackingState, sample: GeoSample) {
        let filter = filter_for(&self.config, self.mode);
        match state.ingest(&sample, filter, &self.config) {
            Ingest::Rejected(reason) => {
                debug!(
                    "[TrackingSession] Rejected sample at {}: {}",
                    sample.timestamp, reason
                );
                self.publish(state);
            }
            Ingest::Accepted {
                point,
                increment_km,
                notify,
                flush_due,
            } => {
                // The distance counts even if the point could not be cached
                if let Err(e) = self.cache.append(&state.trip_id, std::slice::from_ref(&point)) {
                    warn!("[TrackingSession] Failed to cache point: {}", e);
                    self.observers.error(&e);
                }
                debug!(
                    "[TrackingSession] +{:.4} km, total {:.3} km",
                    increment_km, state.total_distance_km
                );

                self.publish(state);
                if notify {
                    self.observers.distance_changed(state.total_distance_km);
                }
                self.maybe_geocode(&point);
                if flush_due {
                    self.flush(state).await;
                }
            }
        }
    }

    async fn flush(&self, state: &mut TripTrackingState) {
        let Some(sync) = &self.sync else {
            return;
        };

        match sync.sync_trip(&state.trip_id).await {
            Ok(report) => {
                for error in &report.failed_batches {
                    self.observers.error(error);
                }
            }
            Err(e) => {
                warn!("[TrackingSession] Sync of {} failed: {}", state.trip_id, e);
                self.observers.error(&e);
            }
        }
        if let Err(e) = sync.push_distance(&state.trip_id, state.total_distance_km).await {
            warn!("[TrackingSession] Distance push for {} failed: {}", state.trip_id, e);
        }

        state.mark_flushed(Utc::now());
        self.publish(state);
    }

    fn check_battery(&mut self) {
        if !self.config.enable_battery_adaptive {
            return;
        }
        let level = self.battery.level();
        let mode = PowerMode::for_level(level, self.config.low_battery_threshold);
        if mode == self.mode {
            return;
        }

        info!(
            "[TrackingSession] Battery at {:?}, switching to {:?} mode",
            level, mode
        );
        self.mode = mode;
        self.snapshot
            .send_modify(|s| s.status = SessionStatus::for_mode(mode));
    }

    /// Fire a detached lookup at most once per geocode interval (sample time).
    fn maybe_geocode(&mut self, point: &RoutePoint) {
        if !self.config.enable_geocoding {
            return;
        }
        let Some(geocoder) = self.geocoder.clone() else {
            return;
        };

        let due = match self.last_geocode_at {
            None => true,
            Some(last) => (point.timestamp - last)
                .to_std()
                .map(|elapsed| elapsed >= self.config.geocode_interval)
                .unwrap_or(false),
        };
        if !due {
            return;
        }
        self.last_geocode_at = Some(point.timestamp);

        let slot = self.place.clone();
        let generation = self.generation;
        let target = point.point();
        tokio::spawn(async move {
            match geocoder.reverse(target).await {
                Ok(label) => {
                    if let Ok(mut current) = slot.lock() {
                        // Stale if the session was stopped or restarted meanwhile
                        if current.generation == generation {
                            current.label = Some(label);
                        }
                    }
                }
                Err(e) => debug!("[TrackingSession] Reverse geocode failed: {}", e),
            }
        });
    }

    /// Fails the session if location access was withdrawn mid-trip.
    async fn permission_revoked(&self) -> bool {
        let state = self.permission.query().await;
        if state == PermissionState::Granted {
            return false;
        }
        self.fail(TrackingError::PermissionDenied {
            reason: format!("location permission changed to {:?} while tracking", state),
        });
        true
    }

    fn fail(&self, error: TrackingError) {
        warn!("[TrackingSession] Tracking failed: {}", error);
        self.location.unsubscribe(self.subscription_id);
        self.observers.error(&error);
        self.snapshot
            .send_modify(|s| s.status = SessionStatus::Error(error.to_string()));
    }

    fn publish(&self, state: &TripTrackingState) {
        self.snapshot.send_modify(|s| {
            s.total_distance_km = state.total_distance_km;
            s.samples_seen = state.samples_seen;
            s.accepted_points = state.accepted_points;
            s.last_sync_at = state.last_sync_at;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::ReportedBattery;
    use crate::location::ChannelLocationProvider;
    use crate::permission::{PermissionState, ReportedPermission};
    use crate::GeoPoint;
    use async_trait::async_trait;
    use chrono::TimeZone;

    #[derive(Default)]
    struct RecordingStore {
        inserted: Mutex<Vec<RoutePoint>>,
        distances: Mutex<Vec<(String, f64)>>,
    }

    #[async_trait]
    impl RemoteStore for RecordingStore {
        async fn insert_route_points(&self, _trip_id: &str, points: &[RoutePoint]) -> Result<()> {
            self.inserted.lock().unwrap().extend_from_slice(points);
            Ok(())
        }

        async fn update_trip_distance(&self, trip_id: &str, total_km: f64) -> Result<()> {
            self.distances.lock().unwrap().push((trip_id.to_string(), total_km));
            Ok(())
        }
    }

    /// Remote that never answers within a test's patience.
    struct StalledStore;

    #[async_trait]
    impl RemoteStore for StalledStore {
        async fn insert_route_points(&self, _trip_id: &str, _points: &[RoutePoint]) -> Result<()> {
            time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn update_trip_distance(&self, _trip_id: &str, _total_km: f64) -> Result<()> {
            time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    struct FixedGeocoder;

    #[async_trait]
    impl Geocoder for FixedGeocoder {
        async fn reverse(&self, _point: GeoPoint) -> Result<String> {
            Ok("Depot Road, Campinas".to_string())
        }
    }

    struct Harness {
        location: ChannelLocationProvider,
        permission: Arc<ReportedPermission>,
        battery: Arc<ReportedBattery>,
        store: Arc<RecordingStore>,
        cache: RouteCache,
    }

    impl Harness {
        fn new() -> Self {
            let location = ChannelLocationProvider::new();
            // Fresh fix for the availability probe; no watch is open yet
            location.push_sample(GeoSample::new(-22.9, -47.06, Utc::now()));
            Self {
                location,
                permission: Arc::new(ReportedPermission::new(PermissionState::Granted)),
                battery: Arc::new(ReportedBattery::new(Some(0.9))),
                store: Arc::new(RecordingStore::default()),
                cache: RouteCache::in_memory().unwrap(),
            }
        }

        fn collaborators(&self) -> SessionCollaborators {
            SessionCollaborators::new(
                Arc::new(self.location.clone()),
                self.permission.clone(),
                self.cache.clone(),
            )
            .with_battery(self.battery.clone())
            .with_remote(self.store.clone())
        }

        fn session(&self, config: TrackerConfig) -> TrackingSession {
            TrackingSession::new(self.collaborators(), config).unwrap()
        }
    }

    fn quick_config() -> TrackerConfig {
        TrackerConfig {
            fix_timeout: Duration::from_millis(200),
            stop_grace: Duration::from_secs(1),
            ..TrackerConfig::default()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample(lat: f64, lng: f64, secs: i64) -> GeoSample {
        GeoSample::new(lat, lng, at(secs)).with_accuracy(5.0)
    }

    /// Sample `secs` after `base`; the latest one is fresh enough for the availability check on restart.
    fn recent(lat: f64, base: DateTime<Utc>, secs: i64) -> GeoSample {
        GeoSample::new(lat, 20.0, base + chrono::Duration::seconds(secs)).with_accuracy(5.0)
    }

    fn collect_errors(session: &TrackingSession) -> Arc<Mutex<Vec<TrackingError>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        session.on_error(move |e| sink.lock().unwrap().push(e.clone()));
        errors
    }

    async fn wait_for(
        session: &TrackingSession,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut rx = session.subscribe();
        let snapshot = time::timeout(Duration::from_secs(2), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for session")
            .expect("session dropped");
        SessionSnapshot::clone(&snapshot)
    }

    #[tokio::test]
    async fn test_reference_trip() {
        let h = Harness::new();
        let mut session = h.session(quick_config());
        let notified = Arc::new(Mutex::new(Vec::new()));
        {
            let notified = notified.clone();
            session.on_distance_update(move |km| notified.lock().unwrap().push(km));
        }

        session.start("trip-1").await.unwrap();
        assert_eq!(session.status(), SessionStatus::Active);

        h.location.push_sample(sample(10.0, 20.0, 0));
        h.location.push_sample(sample(10.001, 20.0, 30));
        h.location.push_sample(sample(10.001, 20.0, 45));

        let snapshot = wait_for(&session, |s| s.samples_seen == 3).await;
        assert!((snapshot.total_distance_km - 0.111).abs() < 0.001);
        assert_eq!(snapshot.accepted_points, 2);
        assert_eq!(session.get_cached_points("trip-1").unwrap().len(), 2);

        let notified = notified.lock().unwrap().clone();
        assert_eq!(notified.len(), 2);
        assert_eq!(notified[0], 0.0);
        assert!((notified[1] - 0.111).abs() < 0.001);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_keeps_one_watch() {
        let h = Harness::new();
        let mut session = h.session(quick_config());

        session.start("trip-1").await.unwrap();
        session.start("trip-1").await.unwrap();
        assert_eq!(h.location.active_subscriptions(), 1);

        assert_eq!(h.location.push_sample(sample(10.0, 20.0, 0)), 1);
        h.location.push_sample(sample(10.001, 20.0, 30));

        let snapshot = wait_for(&session, |s| s.samples_seen == 2).await;
        assert!((snapshot.total_distance_km - 0.111).abs() < 0.001);
        assert_eq!(session.get_cached_points("trip-1").unwrap().len(), 2);

        session.stop().await;
        assert_eq!(h.location.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_stream_error_moves_to_error() {
        let h = Harness::new();
        let mut session = h.session(quick_config());
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = errors.clone();
            session.on_error(move |e| errors.lock().unwrap().push(e.clone()));
        }

        session.start("trip-1").await.unwrap();
        h.location.push_error("GPS switched off");

        let snapshot = wait_for(&session, |s| matches!(s.status, SessionStatus::Error(_))).await;
        assert!(!snapshot.status.is_tracking());
        assert_eq!(h.location.active_subscriptions(), 0);
        assert!(matches!(
            errors.lock().unwrap().as_slice(),
            [TrackingError::Stream { .. }]
        ));

        // No automatic restart
        assert_eq!(h.location.push_sample(sample(10.0, 20.0, 0)), 0);

        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_permission_denied_opens_no_watch() {
        let h = Harness::new();
        h.permission.set_state(PermissionState::Denied);
        let mut session = h.session(quick_config());

        let err = session.start("trip-1").await.unwrap_err();
        assert!(matches!(err, TrackingError::PermissionDenied { .. }));
        assert!(matches!(session.status(), SessionStatus::Error(_)));
        assert_eq!(h.location.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_no_fix_is_location_unavailable() {
        let h = Harness {
            location: ChannelLocationProvider::new(),
            ..Harness::new()
        };
        let mut session = h.session(quick_config());

        let err = session.start("trip-1").await.unwrap_err();
        assert!(matches!(err, TrackingError::LocationUnavailable { .. }));
        assert_eq!(h.location.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_degraded_mode_follows_battery() {
        let h = Harness::new();
        h.battery.set_level(Some(0.1));
        let mut session = h.session(TrackerConfig {
            battery_check_interval: Duration::from_millis(50),
            ..quick_config()
        });

        session.start("trip-1").await.unwrap();
        assert_eq!(session.status(), SessionStatus::Degraded);

        // 40 m accuracy passes the relaxed filter only
        h.location
            .push_sample(GeoSample::new(10.0, 20.0, at(0)).with_accuracy(40.0));
        let snapshot = wait_for(&session, |s| s.samples_seen == 1).await;
        assert_eq!(snapshot.accepted_points, 1);

        h.battery.set_level(Some(0.8));
        wait_for(&session, |s| s.status == SessionStatus::Active).await;

        h.location
            .push_sample(GeoSample::new(10.001, 20.0, at(30)).with_accuracy(40.0));
        let snapshot = wait_for(&session, |s| s.samples_seen == 2).await;
        assert_eq!(snapshot.accepted_points, 1);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_flushes_and_resets() {
        let h = Harness::new();
        let mut session = h.session(quick_config());

        session.start("trip-1").await.unwrap();
        h.location.push_sample(sample(10.0, 20.0, 0));
        h.location.push_sample(sample(10.001, 20.0, 30));
        wait_for(&session, |s| s.samples_seen == 2).await;

        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.total_distance_km(), 0.0);
        assert_eq!(h.location.active_subscriptions(), 0);

        assert_eq!(h.store.inserted.lock().unwrap().len(), 2);
        let distances = h.store.distances.lock().unwrap().clone();
        let (trip, km) = distances.last().unwrap();
        assert_eq!(trip, "trip-1");
        assert!((km - 0.111).abs() < 0.001);
        assert_eq!(h.cache.unsynced_count("trip-1").unwrap(), 0);

        // Idempotent
        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_periodic_sync() {
        let h = Harness::new();
        let mut session = h.session(TrackerConfig {
            sync_interval: Duration::from_millis(100),
            ..quick_config()
        });

        session.start("trip-1").await.unwrap();
        h.location.push_sample(sample(10.0, 20.0, 0));
        h.location.push_sample(sample(10.001, 20.0, 30));
        wait_for(&session, |s| s.accepted_points == 2).await;

        let snapshot = wait_for(&session, |s| s.last_sync_at.is_some()).await;
        assert!(snapshot.status.is_tracking());

        let deadline = Instant::now() + Duration::from_secs(2);
        while h.store.inserted.lock().unwrap().len() < 2 {
            assert!(Instant::now() < deadline, "periodic sync never delivered");
            time::sleep(Duration::from_millis(20)).await;
        }

        session.stop().await;
    }

    #[tokio::test]
    async fn test_sync_now_without_remote() {
        let h = Harness::new();
        let collaborators = SessionCollaborators::new(
            Arc::new(h.location.clone()),
            h.permission.clone(),
            h.cache.clone(),
        );
        let session = TrackingSession::new(collaborators, quick_config()).unwrap();

        assert!(matches!(
            session.sync_now("trip-1").await,
            Err(TrackingError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_current_place() {
        let h = Harness::new();
        let collaborators = h.collaborators().with_geocoder(Arc::new(FixedGeocoder));
        let mut session = TrackingSession::new(collaborators, quick_config()).unwrap();
        assert_eq!(session.current_place(), None);

        session.start("trip-1").await.unwrap();
        h.location.push_sample(sample(10.0, 20.0, 0));

        let deadline = Instant::now() + Duration::from_secs(2);
        while session.current_place().is_none() {
            assert!(Instant::now() < deadline, "geocode never landed");
            time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(session.current_place().as_deref(), Some("Depot Road, Campinas"));

        session.stop().await;
        assert_eq!(session.current_place(), None);
    }

    #[tokio::test]
    async fn test_empty_trip_id_rejected() {
        let h = Harness::new();
        let mut session = h.session(quick_config());
        assert!(matches!(
            session.start("").await,
            Err(TrackingError::InvalidState { .. })
        ));
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_stop_is_bounded_by_stalled_remote() {
        let h = Harness::new();
        let collaborators = SessionCollaborators::new(
            Arc::new(h.location.clone()),
            h.permission.clone(),
            h.cache.clone(),
        )
        .with_remote(Arc::new(StalledStore));
        let mut session = TrackingSession::new(
            collaborators,
            TrackerConfig {
                final_flush_timeout: Duration::from_millis(300),
                sync_batch_size: 1,
                ..quick_config()
            },
        )
        .unwrap();

        session.start("trip-1").await.unwrap();
        h.location.push_sample(sample(10.0, 20.0, 0));
        h.location.push_sample(sample(10.001, 20.0, 30));
        h.location.push_sample(sample(10.002, 20.0, 60));
        wait_for(&session, |s| s.accepted_points == 3).await;

        let started = Instant::now();
        session.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1), "stop took {:?}", started.elapsed());

        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(h.location.active_subscriptions(), 0);
        assert_eq!(h.cache.unsynced_count("trip-1").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_restart_keeps_weighted_total() {
        let h = Harness::new();
        let mut session = h.session(quick_config());
        let base = Utc::now() - chrono::Duration::seconds(63);

        session.start("trip-1").await.unwrap();
        h.location.push_sample(recent(10.0, base, 0));
        h.location.push_sample(recent(10.001, base, 30));
        // ~121 km/h: counted at less than its raw length
        h.location.push_sample(recent(10.011, base, 63));
        let before = wait_for(&session, |s| s.accepted_points == 3).await;

        session.start("trip-1").await.unwrap();
        let after = session.snapshot();
        assert_eq!(after.accepted_points, 3);
        assert!((after.total_distance_km - before.total_distance_km).abs() < 1e-9);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_switching_trips_finishes_previous() {
        let h = Harness::new();
        let mut session = h.session(quick_config());
        let base = Utc::now() - chrono::Duration::seconds(30);

        session.start("trip-a").await.unwrap();
        h.location.push_sample(recent(10.0, base, 0));
        h.location.push_sample(recent(10.001, base, 30));
        wait_for(&session, |s| s.accepted_points == 2).await;

        session.start("trip-b").await.unwrap();
        assert_eq!(session.snapshot().trip_id.as_deref(), Some("trip-b"));
        assert_eq!(h.location.active_subscriptions(), 1);
        assert_eq!(h.cache.unsynced_count("trip-a").unwrap(), 0);
        {
            let distances = h.store.distances.lock().unwrap();
            let (trip, km) = distances.last().unwrap();
            assert_eq!(trip, "trip-a");
            assert!((km - 0.111).abs() < 0.001);
        }

        session.stop().await;
        let distances = h.store.distances.lock().unwrap().clone();
        assert_eq!(distances.last().unwrap(), &("trip-b".to_string(), 0.0));
    }

    #[tokio::test]
    async fn test_permission_revoked_mid_trip() {
        let h = Harness::new();
        let mut session = h.session(quick_config());
        let errors = collect_errors(&session);

        session.start("trip-1").await.unwrap();
        h.location.push_sample(sample(10.0, 20.0, 0));
        wait_for(&session, |s| s.accepted_points == 1).await;

        h.permission.set_state(PermissionState::Denied);
        h.location.push_sample(sample(10.001, 20.0, 30));

        let snapshot = wait_for(&session, |s| matches!(s.status, SessionStatus::Error(_))).await;
        assert_eq!(snapshot.accepted_points, 1);
        assert_eq!(h.location.active_subscriptions(), 0);
        assert!(matches!(
            errors.lock().unwrap().as_slice(),
            [TrackingError::PermissionDenied { .. }]
        ));

        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_permission_revoked_while_idle_on_watch() {
        let h = Harness::new();
        let mut session = h.session(TrackerConfig {
            battery_check_interval: Duration::from_millis(50),
            ..quick_config()
        });

        session.start("trip-1").await.unwrap();
        h.permission.set_state(PermissionState::Prompt);

        wait_for(&session, |s| matches!(s.status, SessionStatus::Error(_))).await;
        assert_eq!(h.location.active_subscriptions(), 0);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_cache_failure_keeps_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.db");
        let h = Harness {
            cache: RouteCache::open(&path).unwrap(),
            ..Harness::new()
        };
        let mut session = h.session(quick_config());
        let errors = collect_errors(&session);

        session.start("trip-1").await.unwrap();
        h.location.push_sample(sample(10.0, 20.0, 0));
        wait_for(&session, |s| s.accepted_points == 1).await;

        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE route_points;")
            .unwrap();

        h.location.push_sample(sample(10.001, 20.0, 30));
        let snapshot = wait_for(&session, |s| s.accepted_points == 2).await;
        assert_eq!(snapshot.status, SessionStatus::Active);
        assert!((snapshot.total_distance_km - 0.111).abs() < 0.001);
        assert!(matches!(
            errors.lock().unwrap().first(),
            Some(TrackingError::Cache { .. })
        ));

        // The watch is still open and later samples are processed
        assert_eq!(h.location.active_subscriptions(), 1);
        h.location.push_sample(sample(10.002, 20.0, 60));
        let snapshot = wait_for(&session, |s| s.accepted_points == 3).await;
        assert_eq!(snapshot.status, SessionStatus::Active);
        assert!((snapshot.total_distance_km - 0.222).abs() < 0.001);

        session.stop().await;
    }
}
