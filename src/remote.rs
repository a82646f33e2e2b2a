//! Remote store boundary and its REST implementation.
//!
//! The remote store is an ordinary network service: requests can time out or
//! come back 4xx/5xx, and there is no multi-row transactional guarantee. Route
//! point inserts are treated as idempotent enough that re-delivering a batch
//! is harmless.

use async_trait::async_trait;

use crate::RoutePoint;
use crate::error::Result;

/// Remote persistence for route points and trip totals.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert one batch of points for a trip. All-or-nothing per call.
    async fn insert_route_points(&self, trip_id: &str, points: &[RoutePoint]) -> Result<()>;

    /// Record the trip's accumulated distance.
    async fn update_trip_distance(&self, trip_id: &str, total_km: f64) -> Result<()>;
}

#[cfg(feature = "http")]
pub use rest::RestRouteStore;

#[cfg(feature = "http")]
mod rest {
    use std::time::Instant;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use log::{debug, warn};
    use reqwest::{Client, RequestBuilder, Response};
    use serde::Serialize;

    use super::RemoteStore;
    use crate::RoutePoint;
    use crate::config::RemoteConfig;
    use crate::error::{Result, TrackingError};

    /// Longest error body kept in an error message
    const MAX_ERROR_BODY: usize = 200;

    /// Row shape of the remote `route_points` table
    #[derive(Debug, Serialize)]
    struct PointRow<'a> {
        trip_id: &'a str,
        latitude: f64,
        longitude: f64,
        timestamp: DateTime<Utc>,
        accuracy: Option<f64>,
        speed: Option<f64>,
        heading: Option<f64>,
        altitude: Option<f64>,
    }

    impl<'a> PointRow<'a> {
        fn new(trip_id: &'a str, point: &RoutePoint) -> Self {
            Self {
                trip_id,
                latitude: point.latitude,
                longitude: point.longitude,
                timestamp: point.timestamp,
                accuracy: point.accuracy,
                speed: point.speed,
                heading: point.heading,
                altitude: point.altitude,
            }
        }
    }

    #[derive(Debug, Serialize)]
    struct TripDistancePatch {
        distance_km: f64,
    }

    /// PostgREST-style remote store (`/rest/v1/<table>`).
    pub struct RestRouteStore {
        client: Client,
        base_url: String,
        api_key: String,
        auth_token: Option<String>,
        points_table: String,
        trips_table: String,
    }

    impl RestRouteStore {
        pub fn new(config: &RemoteConfig) -> Result<Self> {
            if config.base_url.is_empty() {
                return Err(TrackingError::config("remote base URL is empty"));
            }

            let client = Client::builder()
                .timeout(config.timeout)
                .build()
                .map_err(|e| TrackingError::config(format!("Failed to create HTTP client: {}", e)))?;

            Ok(Self {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                api_key: config.api_key.clone(),
                auth_token: config.auth_token.clone(),
                points_table: config.points_table.clone(),
                trips_table: config.trips_table.clone(),
            })
        }

        fn table_url(&self, table: &str) -> String {
            format!("{}/rest/v1/{}", self.base_url, table)
        }

        fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
            let bearer = self.auth_token.as_deref().unwrap_or(&self.api_key);
            builder
                .header("apikey", &self.api_key)
                .header("Authorization", format!("Bearer {}", bearer))
        }

        async fn check(response: Response) -> Result<()> {
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            Err(TrackingError::remote(
                format!("HTTP {}: {}", status, body),
                Some(status.as_u16()),
            ))
        }
    }

    #[async_trait]
    impl RemoteStore for RestRouteStore {
        async fn insert_route_points(&self, trip_id: &str, points: &[RoutePoint]) -> Result<()> {
            if points.is_empty() {
                return Ok(());
            }

            let start = Instant::now();
            let rows: Vec<PointRow<'_>> = points.iter().map(|p| PointRow::new(trip_id, p)).collect();

            let request = self
                .client
                .post(self.table_url(&self.points_table))
                .query(&[("on_conflict", "trip_id,timestamp")])
                .header("Prefer", "resolution=ignore-duplicates,return=minimal")
                .json(&rows);

            let response = self.authorized(request).send().await?;
            let result = Self::check(response).await;

            match &result {
                Ok(()) => debug!(
                    "[RestRouteStore] Inserted {} points for trip {} ({} ms)",
                    points.len(),
                    trip_id,
                    start.elapsed().as_millis()
                ),
                Err(e) => warn!("[RestRouteStore] Insert for trip {} failed: {}", trip_id, e),
            }
            result
        }

        async fn update_trip_distance(&self, trip_id: &str, total_km: f64) -> Result<()> {
            let request = self
                .client
                .patch(self.table_url(&self.trips_table))
                .query(&[("id", format!("eq.{}", trip_id))])
                .header("Prefer", "return=minimal")
                .json(&TripDistancePatch {
                    distance_km: total_km,
                });

            let response = self.authorized(request).send().await?;
            Self::check(response).await
        }
    }

}
