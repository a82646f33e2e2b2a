//! Per-trip accumulation state.
//!
//! [`TripTrackingState`] is owned by exactly one session worker. It is moved
//! into the worker task when tracking starts and handed back when the worker
//! ends, so two sessions never share accumulators.

use chrono::{DateTime, Utc};

use crate::config::{FilterConfig, TrackerConfig};
use crate::filter::{self, Decision, RejectReason};
use crate::geo_utils::distance_km;
use crate::{GeoSample, RoutePoint};

/// Result of feeding one raw sample to the state.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    Accepted {
        point: RoutePoint,
        /// Weighted distance added to the total
        increment_km: f64,
        /// Observers should hear about the new total
        notify: bool,
        /// Enough new distance since the last flush to push early
        flush_due: bool,
    },
    Rejected(RejectReason),
}

/// Accumulators for one actively tracked trip.
#[derive(Debug, Clone, PartialEq)]
pub struct TripTrackingState {
    pub trip_id: String,
    pub last_accepted: Option<RoutePoint>,
    pub total_distance_km: f64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub samples_seen: u64,
    pub accepted_points: u64,
    last_notified_km: f64,
    last_notified_at: Option<DateTime<Utc>>,
    distance_since_flush_km: f64,
}

impl TripTrackingState {
    pub fn new(trip_id: &str) -> Self {
        Self {
            trip_id: trip_id.to_string(),
            last_accepted: None,
            total_distance_km: 0.0,
            last_sync_at: None,
            samples_seen: 0,
            accepted_points: 0,
            last_notified_km: 0.0,
            last_notified_at: None,
            distance_since_flush_km: 0.0,
        }
    }

    /// Continue a trip whose points are already cached (e.g. after an app restart).
    ///
    /// The total is rebuilt segment by segment with the same speed weighting
    /// live samples get, so a restart does not change it.
    pub fn resume(trip_id: &str, cached: &[RoutePoint], filter_config: &FilterConfig) -> Self {
        let total: f64 = cached
            .windows(2)
            .map(|pair| weighted_increment_km(&pair[0], &pair[1].sample(), filter_config))
            .sum();

        Self {
            last_accepted: cached.last().cloned(),
            total_distance_km: total,
            accepted_points: cached.len() as u64,
            last_notified_km: total,
            ..Self::new(trip_id)
        }
    }

    /// Filter one sample and, if accepted, fold it into the accumulators.
    pub fn ingest(
        &mut self,
        sample: &GeoSample,
        filter_config: &FilterConfig,
        config: &TrackerConfig,
    ) -> Ingest {
        self.samples_seen += 1;

        let previous = self.last_accepted.as_ref();
        if let Decision::Reject(reason) = filter::accept(sample, previous, filter_config) {
            return Ingest::Rejected(reason);
        }

        let increment_km = previous
            .map(|prev| weighted_increment_km(prev, sample, filter_config))
            .unwrap_or(0.0);

        let point = RoutePoint::from_sample(&self.trip_id, sample);
        self.total_distance_km += increment_km;
        self.distance_since_flush_km += increment_km;
        self.accepted_points += 1;
        self.last_accepted = Some(point.clone());

        let notify = self.notify_due(sample.timestamp, config);
        if notify {
            self.last_notified_km = self.total_distance_km;
            self.last_notified_at = Some(sample.timestamp);
        }

        Ingest::Accepted {
            point,
            increment_km,
            notify,
            flush_due: self.distance_since_flush_km >= config.flush_distance_km,
        }
    }

    fn notify_due(&self, at: DateTime<Utc>, config: &TrackerConfig) -> bool {
        let Some(last_at) = self.last_notified_at else {
            return true;
        };
        if self.total_distance_km - self.last_notified_km >= config.notify_distance_km {
            return true;
        }
        (at - last_at)
            .to_std()
            .map(|elapsed| elapsed >= config.notify_interval)
            .unwrap_or(false)
    }

    /// Record a completed flush attempt.
    pub fn mark_flushed(&mut self, at: DateTime<Utc>) {
        self.last_sync_at = Some(at);
        self.distance_since_flush_km = 0.0;
    }
}

/// Distance from `previous` to `sample`, de-weighted by segment speed.
fn weighted_increment_km(previous: &RoutePoint, sample: &GeoSample, config: &FilterConfig) -> f64 {
    let raw = distance_km(&previous.point(), &sample.point());
    raw * filter::speed_weight(filter::effective_speed_kmh(sample, previous), config)
}
