//! # Local Route Cache
//!
//! Durable, append-only per-trip store of accepted route points, backed by
//! SQLite so a trace survives the app being killed mid-trip.
//!
//! ## Guarantees
//!
//! - **Idempotent append**: a point whose timestamp already exists for the
//!   trip is ignored (`UNIQUE (trip_id, timestamp)`).
//! - **Append order on read**: points come back in insertion order. The
//!   tracking session only appends timestamp-ascending, so reads are also
//!   timestamp-ascending.
//! - **Entry-granular eviction**: a trip entry and all its points go together.
//! - **Atomic operations**: each call runs under the connection lock, and
//!   multi-row writes run in one transaction. No retries happen here; a failed
//!   append means the points are not durable.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackingError};
use crate::geo_utils::polyline_length_km;
use crate::migrations;
use crate::{GeoPoint, RoutePoint};

/// Aggregate view of one cached trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripSummary {
    pub trip_id: String,
    pub point_count: u32,
    /// Points not yet confirmed by the remote store
    pub pending_count: u32,
    /// Haversine length of the cached trace
    pub distance_km: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_point_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Cloneable handle to the SQLite route cache.
///
/// Clones share one connection, so a tracking session writer and a sync
/// agent reader see the same store.
#[derive(Clone)]
pub struct RouteCache {
    db: Arc<Mutex<Connection>>,
    path: String,
}

impl RouteCache {
    /// Open (or create) the cache at the given database path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let mut conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        migrations::migrate(&mut conn)?;

        info!("[RouteCache] Opened cache at {}", path);

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Create an in-memory cache (for testing).
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::migrate(&mut conn)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path: ":memory:".to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| TrackingError::cache("cache connection lock poisoned"))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Append points to a trip, skipping timestamps already cached.
    ///
    /// Timestamps are stored at millisecond precision: two points of a trip
    /// less than 1 ms apart count as the same point, and sub-millisecond
    /// parts are dropped on read.
    ///
    /// Returns how many points were newly stored.
    pub fn append(&self, trip_id: &str, points: &[RoutePoint]) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO trips (trip_id, last_updated) VALUES (?1, ?2)
             ON CONFLICT(trip_id) DO UPDATE SET last_updated = excluded.last_updated",
            params![trip_id, Utc::now().timestamp_millis()],
        )?;

        let mut added = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO route_points
                    (trip_id, timestamp, latitude, longitude, accuracy, speed, heading, altitude, synced)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for point in points {
                added += stmt.execute(params![
                    trip_id,
                    point.timestamp.timestamp_millis(),
                    point.latitude,
                    point.longitude,
                    point.accuracy,
                    point.speed,
                    point.heading,
                    point.altitude,
                    point.synced,
                ])?;
            }
        }

        tx.commit()?;

        debug!(
            "[RouteCache] Appended {}/{} points to trip {}",
            added,
            points.len(),
            trip_id
        );

        Ok(added)
    }

    /// Flag the points with the given timestamps as confirmed remotely.
    pub fn mark_synced(&self, trip_id: &str, timestamps: &[DateTime<Utc>]) -> Result<usize> {
        if timestamps.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE route_points SET synced = 1 WHERE trip_id = ?1 AND timestamp = ?2",
            )?;
            for ts in timestamps {
                updated += stmt.execute(params![trip_id, ts.timestamp_millis()])?;
            }
        }
        tx.commit()?;

        Ok(updated)
    }

    /// Remove a whole trip entry.
    pub fn remove_trip(&self, trip_id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM route_points WHERE trip_id = ?1", params![trip_id])?;
        let removed = tx.execute("DELETE FROM trips WHERE trip_id = ?1", params![trip_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Remove trip entries whose last append is older than `max_age`.
    pub fn evict_older_than(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| TrackingError::cache(format!("invalid max age: {}", e)))?;
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.evict_before(cutoff)
    }

    /// Remove trip entries last updated before `cutoff`.
    pub fn evict_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff_ms = cutoff.timestamp_millis();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM route_points WHERE trip_id IN
                (SELECT trip_id FROM trips WHERE last_updated < ?1)",
            params![cutoff_ms],
        )?;
        let evicted = tx.execute("DELETE FROM trips WHERE last_updated < ?1", params![cutoff_ms])?;
        tx.commit()?;

        if evicted > 0 {
            info!(
                "[RouteCache] Evicted {} trip entries last updated before {}",
                evicted, cutoff
            );
        }

        Ok(evicted)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// All cached points for a trip, in append order.
    pub fn read(&self, trip_id: &str) -> Result<Vec<RoutePoint>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT trip_id, timestamp, latitude, longitude, accuracy, speed, heading, altitude, synced
             FROM route_points WHERE trip_id = ?1 ORDER BY id",
        )?;

        let points = stmt
            .query_map(params![trip_id], row_to_point)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }

    /// Number of points not yet confirmed by the remote store.
    pub fn unsynced_count(&self, trip_id: &str) -> Result<u32> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM route_points WHERE trip_id = ?1 AND synced = 0",
            params![trip_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Trip ids with a cache entry, most recently updated first.
    pub fn trip_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT trip_id FROM trips ORDER BY last_updated DESC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// When the trip entry was last appended to, if it exists.
    pub fn last_updated(&self, trip_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let ms: Option<i64> = conn
            .query_row(
                "SELECT last_updated FROM trips WHERE trip_id = ?1",
                params![trip_id],
                |row| row.get(0),
            )
            .optional()?;
        ms.map(millis_to_datetime).transpose()
    }

    /// Point counts and trace length for one trip.
    pub fn summary(&self, trip_id: &str) -> Result<TripSummary> {
        let points = self.read(trip_id)?;
        let last_updated = self.last_updated(trip_id)?;

        let trace: Vec<GeoPoint> = points.iter().map(RoutePoint::point).collect();
        let pending = points.iter().filter(|p| !p.synced).count();

        Ok(TripSummary {
            trip_id: trip_id.to_string(),
            point_count: points.len() as u32,
            pending_count: pending as u32,
            distance_km: polyline_length_km(&trace),
            started_at: points.first().map(|p| p.timestamp),
            last_point_at: points.last().map(|p| p.timestamp),
            last_updated,
        })
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| TrackingError::cache(format!("timestamp out of range: {}", ms)))
}

fn row_to_point(row: &Row<'_>) -> rusqlite::Result<RoutePoint> {
    let ts: i64 = row.get(1)?;
    let timestamp = DateTime::from_timestamp_millis(ts)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, ts))?;

    Ok(RoutePoint {
        trip_id: row.get(0)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        timestamp,
        accuracy: row.get(4)?,
        speed: row.get(5)?,
        heading: row.get(6)?,
        altitude: row.get(7)?,
        synced: row.get(8)?,
    })
}
