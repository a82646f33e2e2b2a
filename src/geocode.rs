//! Best-effort reverse geocoding.
//!
//! Lookups never sit on the sample path: the session fires them as detached
//! tasks and only reads the latest label when asked. Failures are dropped.

use async_trait::async_trait;

use crate::GeoPoint;
use crate::error::Result;

/// Resolves a coordinate to a human-readable place label.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse(&self, point: GeoPoint) -> Result<String>;
}

#[cfg(feature = "http")]
pub use nominatim::NominatimGeocoder;

#[cfg(feature = "http")]
mod nominatim {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::Client;
    use serde::Deserialize;

    use super::Geocoder;
    use crate::GeoPoint;
    use crate::error::{Result, TrackingError};

    const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org/reverse";

    #[derive(Debug, Deserialize)]
    struct ReverseResponse {
        display_name: Option<String>,
        address: Option<Address>,
    }

    #[derive(Debug, Deserialize)]
    struct Address {
        road: Option<String>,
        suburb: Option<String>,
        city: Option<String>,
        town: Option<String>,
        village: Option<String>,
    }

    impl ReverseResponse {
        /// "Road, Locality" when available, else the full display name.
        fn label(self) -> Option<String> {
            if let Some(address) = self.address {
                let locality = address
                    .city
                    .or(address.town)
                    .or(address.village)
                    .or(address.suburb);
                let parts: Vec<String> = address.road.into_iter().chain(locality).collect();
                if !parts.is_empty() {
                    return Some(parts.join(", "));
                }
            }
            self.display_name
        }
    }

    /// Nominatim (OpenStreetMap) reverse geocoder.
    pub struct NominatimGeocoder {
        client: Client,
        endpoint: String,
    }

    impl NominatimGeocoder {
        /// Nominatim's usage policy requires an identifying user agent.
        pub fn new(user_agent: &str) -> Result<Self> {
            Self::with_endpoint(user_agent, DEFAULT_ENDPOINT)
        }

        pub fn with_endpoint(user_agent: &str, endpoint: &str) -> Result<Self> {
            let client = Client::builder()
                .user_agent(user_agent)
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| TrackingError::Geocode {
                    message: format!("Failed to create HTTP client: {}", e),
                })?;

            Ok(Self {
                client,
                endpoint: endpoint.to_string(),
            })
        }
    }

    #[async_trait]
    impl Geocoder for NominatimGeocoder {
        async fn reverse(&self, point: GeoPoint) -> Result<String> {
            let response = self
                .client
                .get(&self.endpoint)
                .query(&[
                    ("format", "jsonv2".to_string()),
                    ("lat", point.latitude.to_string()),
                    ("lon", point.longitude.to_string()),
                ])
                .send()
                .await
                .map_err(|e| TrackingError::Geocode {
                    message: e.to_string(),
                })?;

            if !response.status().is_success() {
                return Err(TrackingError::Geocode {
                    message: format!("HTTP {}", response.status()),
                });
            }

            let body: ReverseResponse = response.json().await.map_err(|e| TrackingError::Geocode {
                message: format!("Parse error: {}", e),
            })?;

            body.label().ok_or_else(|| TrackingError::Geocode {
                message: "no address for location".to_string(),
            })
        }
    }

}
