//! # Remote Sync Agent
//!
//! Pushes a trip's cached points to the remote store in bounded batches.
//!
//! Delivery is at-least-once: every call re-sends the whole cached trace and
//! relies on the remote insert ignoring duplicates. A failed batch does not
//! stop the remaining batches, and nothing is retried inside a call; the next
//! periodic sync is the retry.

use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};

use crate::cache::RouteCache;
use crate::error::{Result, TrackingError};
use crate::remote::RemoteStore;

/// Outcome of one `sync_trip` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub trip_id: String,
    /// Points read from the cache and offered to the remote store
    pub attempted: usize,
    /// Points in batches the remote store confirmed
    pub confirmed: usize,
    pub failed_batches: Vec<TrackingError>,
}

impl SyncReport {
    /// Every attempted point was confirmed.
    pub fn is_complete(&self) -> bool {
        self.failed_batches.is_empty() && self.confirmed == self.attempted
    }
}

/// Batched, best-effort flusher from the route cache to the remote store.
#[derive(Clone)]
pub struct SyncAgent {
    cache: RouteCache,
    remote: Arc<dyn RemoteStore>,
    batch_size: usize,
}

impl SyncAgent {
    pub fn new(cache: RouteCache, remote: Arc<dyn RemoteStore>, batch_size: usize) -> Self {
        Self {
            cache,
            remote,
            batch_size: batch_size.max(1),
        }
    }

    /// Push every cached point of a trip. Only a cache read failure is an `Err`;
    /// batch failures are collected in the report.
    pub async fn sync_trip(&self, trip_id: &str) -> Result<SyncReport> {
        let start = Instant::now();
        let points = self.cache.read(trip_id)?;

        let mut report = SyncReport {
            trip_id: trip_id.to_string(),
            attempted: points.len(),
            ..SyncReport::default()
        };

        for (batch_index, batch) in points.chunks(self.batch_size).enumerate() {
            match self.remote.insert_route_points(trip_id, batch).await {
                Ok(()) => {
                    report.confirmed += batch.len();
                    let timestamps: Vec<_> = batch.iter().map(|p| p.timestamp).collect();
                    // Remote already has them; a failed flag update only costs a re-send
                    if let Err(e) = self.cache.mark_synced(trip_id, &timestamps) {
                        warn!(
                            "[SyncAgent] Trip {} batch {} confirmed but not marked synced: {}",
                            trip_id, batch_index, e
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        "[SyncAgent] Trip {} batch {} ({} points) failed: {}",
                        trip_id,
                        batch_index,
                        batch.len(),
                        e
                    );
                    report.failed_batches.push(TrackingError::SyncBatch {
                        trip_id: trip_id.to_string(),
                        batch_index,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            "[SyncAgent] Trip {}: {}/{} points confirmed, {} failed batches ({} ms)",
            trip_id,
            report.confirmed,
            report.attempted,
            report.failed_batches.len(),
            start.elapsed().as_millis()
        );

        Ok(report)
    }

    /// Record the trip's running total remotely.
    pub async fn push_distance(&self, trip_id: &str, total_km: f64) -> Result<()> {
        self.remote.update_trip_distance(trip_id, total_km).await
    }

    pub fn cache(&self) -> &RouteCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GeoSample, RoutePoint};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    /// Remote store that fails the n-th insert call (0-based) and records the rest.
    #[derive(Default)]
    struct FlakyStore {
        fail_calls: Vec<usize>,
        calls: Mutex<usize>,
        inserted: Mutex<Vec<RoutePoint>>,
        distances: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl RemoteStore for FlakyStore {
        async fn insert_route_points(&self, _trip_id: &str, points: &[RoutePoint]) -> Result<()> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls - 1
            };
            if self.fail_calls.contains(&call) {
                return Err(TrackingError::remote("service unavailable", Some(503)));
            }
            self.inserted.lock().unwrap().extend_from_slice(points);
            Ok(())
        }

        async fn update_trip_distance(&self, _trip_id: &str, total_km: f64) -> Result<()> {
            self.distances.lock().unwrap().push(total_km);
            Ok(())
        }
    }

    fn cached_points(cache: &RouteCache, trip: &str, n: usize) {
        let points: Vec<RoutePoint> = (0..n)
            .map(|i| {
                let ts = Utc.timestamp_opt(1_700_000_000 + i as i64 * 20, 0).unwrap();
                RoutePoint::from_sample(trip, &GeoSample::new(10.0 + i as f64 * 0.001, 20.0, ts))
            })
            .collect();
        cache.append(trip, &points).unwrap();
    }

    #[tokio::test]
    async fn test_full_sync() {
        let cache = RouteCache::in_memory().unwrap();
        cached_points(&cache, "t1", 25);
        let store = Arc::new(FlakyStore::default());
        let agent = SyncAgent::new(cache.clone(), store.clone(), 10);

        let report = agent.sync_trip("t1").await.unwrap();
        assert_eq!(report.attempted, 25);
        assert_eq!(report.confirmed, 25);
        assert!(report.is_complete());
        assert_eq!(*store.calls.lock().unwrap(), 3);
        assert_eq!(cache.unsynced_count("t1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_abort_rest() {
        let cache = RouteCache::in_memory().unwrap();
        cached_points(&cache, "t1", 40);
        // Second batch (index 1) fails
        let store = Arc::new(FlakyStore {
            fail_calls: vec![1],
            ..FlakyStore::default()
        });
        let agent = SyncAgent::new(cache.clone(), store.clone(), 10);

        let report = agent.sync_trip("t1").await.unwrap();
        assert_eq!(*store.calls.lock().unwrap(), 4);
        assert_eq!(report.confirmed, 30);
        assert_eq!(report.failed_batches.len(), 1);
        assert!(matches!(
            report.failed_batches[0],
            TrackingError::SyncBatch { batch_index: 1, .. }
        ));
        assert!(!report.is_complete());
        assert_eq!(cache.unsynced_count("t1").unwrap(), 10);

        let stored = cache.read("t1").unwrap();
        assert!(stored[10..20].iter().all(|p| !p.synced));
        assert!(stored[..10].iter().chain(&stored[20..]).all(|p| p.synced));
    }

    #[tokio::test]
    async fn test_resync_redelivers_everything() {
        let cache = RouteCache::in_memory().unwrap();
        cached_points(&cache, "t1", 5);
        let store = Arc::new(FlakyStore::default());
        let agent = SyncAgent::new(cache, store.clone(), 50);

        agent.sync_trip("t1").await.unwrap();
        let report = agent.sync_trip("t1").await.unwrap();
        assert_eq!(report.confirmed, 5);
        // At-least-once: the remote side sees duplicates
        assert_eq!(store.inserted.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_empty_trip_and_distance_push() {
        let store = Arc::new(FlakyStore::default());
        let agent = SyncAgent::new(RouteCache::in_memory().unwrap(), store.clone(), 0);

        let report = agent.sync_trip("missing").await.unwrap();
        assert_eq!(report.attempted, 0);
        assert!(report.is_complete());
        assert_eq!(*store.calls.lock().unwrap(), 0);

        agent.push_distance("missing", 12.5).await.unwrap();
        assert_eq!(*store.distances.lock().unwrap(), vec![12.5]);
    }
}
