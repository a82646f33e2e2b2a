//! Unified error handling for the triptrace library.
//!
//! Filter rejections are not errors: they are returned as
//! [`Decision::Reject`](crate::filter::Decision) values and logged. Everything
//! that can actually fail in the tracking pipeline surfaces as a
//! [`TrackingError`].

use thiserror::Error;

/// Unified error type for tracking operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackingError {
    /// User or OS refused location access
    #[error("Location permission denied: {reason}")]
    PermissionDenied { reason: String },
    /// Permission granted but no usable fix (sensor off, timeout)
    #[error("Location unavailable: {reason}")]
    LocationUnavailable { reason: String },
    /// Local route cache failed to read or write
    #[error("Route cache error: {message}")]
    Cache { message: String },
    /// One sync batch failed to reach the remote store
    #[error("Sync batch {batch_index} for trip '{trip_id}' failed: {message}")]
    SyncBatch {
        trip_id: String,
        batch_index: usize,
        message: String,
    },
    /// The live position subscription failed
    #[error("Location stream failed: {message}")]
    Stream { message: String },
    /// Remote store/HTTP error
    #[error("Remote store error{}: {message}", status_suffix(.status_code))]
    Remote {
        message: String,
        status_code: Option<u16>,
    },
    /// Reverse geocoding failed
    #[error("Geocoding failed: {message}")]
    Geocode { message: String },
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },
    /// Operation not allowed in the current session state
    #[error("Invalid session state: {message}")]
    InvalidState { message: String },
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code.map(|c| format!(" ({})", c)).unwrap_or_default()
}

impl TrackingError {
    pub fn cache(message: impl Into<String>) -> Self {
        TrackingError::Cache {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        TrackingError::Config {
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>, status_code: Option<u16>) -> Self {
        TrackingError::Remote {
            message: message.into(),
            status_code,
        }
    }

    /// Errors the driver can act on (enable location, grant access, restart).
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            TrackingError::PermissionDenied { .. }
                | TrackingError::LocationUnavailable { .. }
                | TrackingError::Stream { .. }
        )
    }

    /// Message suitable for showing to the driver, if this error should be shown at all.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            TrackingError::PermissionDenied { .. } => {
                Some("Location access is off. Tap to allow location for trip tracking.")
            }
            TrackingError::LocationUnavailable { .. } => {
                Some("Location disabled or no GPS signal. Tap to enable location.")
            }
            TrackingError::Stream { .. } => {
                Some("Location tracking stopped unexpectedly. Tap to restart tracking.")
            }
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for TrackingError {
    fn from(e: rusqlite::Error) -> Self {
        TrackingError::cache(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for TrackingError {
    fn from(e: rusqlite_migration::Error) -> Self {
        TrackingError::cache(format!("schema migration failed: {}", e))
    }
}

impl From<serde_json::Error> for TrackingError {
    fn from(e: serde_json::Error) -> Self {
        TrackingError::config(e.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for TrackingError {
    fn from(e: reqwest::Error) -> Self {
        TrackingError::remote(e.to_string(), e.status().map(|s| s.as_u16()))
    }
}

/// Result type alias for tracking operations.
pub type Result<T> = std::result::Result<T, TrackingError>;
