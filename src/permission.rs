//! # Permission/Availability Guard
//!
//! Decides whether a tracking session may start: the OS must have granted
//! location access (`granted`) and the sensor must currently produce a fix
//! (`enabled`). These are different failures with different remedies, so
//! they are reported separately.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{info, warn};

use crate::error::{Result, TrackingError};
use crate::location::{FixOptions, LocationProvider};

/// OS-level location permission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum PermissionState {
    Granted,
    Denied,
    /// Not decided yet; asking will show the OS dialog
    Prompt,
}

/// Platform permission API.
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    async fn query(&self) -> PermissionState;

    /// Ask the OS for access. May show platform UI.
    async fn request(&self) -> PermissionState;
}

/// Permission state reported by the platform layer.
///
/// `request` resolves a pending prompt to `grant_on_prompt`; the real dialog
/// is run by the platform, which then calls [`set_state`](Self::set_state).
#[derive(Debug)]
pub struct ReportedPermission {
    state: Mutex<PermissionState>,
    grant_on_prompt: bool,
}

impl ReportedPermission {
    pub fn new(state: PermissionState) -> Self {
        Self {
            state: Mutex::new(state),
            grant_on_prompt: false,
        }
    }

    pub fn granting_on_prompt(mut self) -> Self {
        self.grant_on_prompt = true;
        self
    }

    pub fn set_state(&self, state: PermissionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn get(&self) -> PermissionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(PermissionState::Denied)
    }
}

#[async_trait]
impl PermissionProvider for ReportedPermission {
    async fn query(&self) -> PermissionState {
        self.get()
    }

    async fn request(&self) -> PermissionState {
        if self.get() == PermissionState::Prompt {
            let resolved = if self.grant_on_prompt {
                PermissionState::Granted
            } else {
                PermissionState::Denied
            };
            self.set_state(resolved);
        }
        self.get()
    }
}

/// Result of a guard check.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardStatus {
    pub granted: bool,
    pub enabled: bool,
    pub reason: Option<String>,
}

impl GuardStatus {
    pub fn is_ready(&self) -> bool {
        self.granted && self.enabled
    }

    /// `Ok` when tracking may start, otherwise the matching error.
    pub fn into_result(self) -> Result<()> {
        let reason = self.reason.unwrap_or_default();
        if !self.granted {
            Err(TrackingError::PermissionDenied { reason })
        } else if !self.enabled {
            Err(TrackingError::LocationUnavailable { reason })
        } else {
            Ok(())
        }
    }
}

/// Checks permission and sensor availability before tracking starts.
pub struct AvailabilityGuard {
    permission: Arc<dyn PermissionProvider>,
    location: Arc<dyn LocationProvider>,
    fix_options: FixOptions,
}

impl AvailabilityGuard {
    pub fn new(
        permission: Arc<dyn PermissionProvider>,
        location: Arc<dyn LocationProvider>,
        fix_options: FixOptions,
    ) -> Self {
        Self {
            permission,
            location,
            fix_options,
        }
    }

    /// Query (and if undecided, request) permission, then probe for a fix.
    ///
    /// Never hangs past the fix timeout: a timeout reports `enabled: false`.
    pub async fn check(&self) -> GuardStatus {
        let mut state = self.permission.query().await;
        if state == PermissionState::Prompt {
            info!("[AvailabilityGuard] Permission undecided, requesting");
            state = self.permission.request().await;
        }

        if state != PermissionState::Granted {
            let reason = match state {
                PermissionState::Denied => "location permission denied",
                _ => "location permission not granted",
            };
            warn!("[AvailabilityGuard] {}", reason);
            return GuardStatus {
                granted: false,
                enabled: false,
                reason: Some(reason.to_string()),
            };
        }

        let probe = self.location.current_fix(&self.fix_options);
        match tokio::time::timeout(self.fix_options.timeout, probe).await {
            Ok(Ok(_)) => GuardStatus {
                granted: true,
                enabled: true,
                reason: None,
            },
            Ok(Err(e)) => {
                warn!("[AvailabilityGuard] Location unavailable: {}", e);
                GuardStatus {
                    granted: true,
                    enabled: false,
                    reason: Some(e.to_string()),
                }
            }
            Err(_) => {
                warn!(
                    "[AvailabilityGuard] No fix within {:?}",
                    self.fix_options.timeout
                );
                GuardStatus {
                    granted: true,
                    enabled: false,
                    reason: Some(format!(
                        "timed out waiting for a position fix after {:?}",
                        self.fix_options.timeout
                    )),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GeoSample;
    use crate::location::{ChannelLocationProvider, Subscription, SubscriptionId, WatchOptions};
    use chrono::Utc;
    use std::time::Duration;

    /// Provider whose one-shot fix never resolves.
    struct HangingProvider;

    #[async_trait]
    impl LocationProvider for HangingProvider {
        async fn current_fix(&self, _options: &FixOptions) -> Result<GeoSample> {
            std::future::pending().await
        }

        fn subscribe(&self, _options: &WatchOptions) -> Result<Subscription> {
            Err(TrackingError::Stream {
                message: "unsupported".to_string(),
            })
        }

        fn unsubscribe(&self, _id: SubscriptionId) {}
    }

    fn quick_fix() -> FixOptions {
        FixOptions {
            timeout: Duration::from_millis(50),
            ..FixOptions::default()
        }
    }

    #[tokio::test]
    async fn test_granted_and_enabled() {
        let location = ChannelLocationProvider::new();
        location.push_sample(GeoSample::new(10.0, 20.0, Utc::now()));
        let guard = AvailabilityGuard::new(
            Arc::new(ReportedPermission::new(PermissionState::Granted)),
            Arc::new(location),
            quick_fix(),
        );

        let status = guard.check().await;
        assert!(status.is_ready());
        assert!(status.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_denied() {
        let guard = AvailabilityGuard::new(
            Arc::new(ReportedPermission::new(PermissionState::Denied)),
            Arc::new(ChannelLocationProvider::new()),
            quick_fix(),
        );

        let status = guard.check().await;
        assert!(!status.granted);
        assert!(matches!(
            status.into_result(),
            Err(TrackingError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_prompt_triggers_request() {
        let permission = Arc::new(ReportedPermission::new(PermissionState::Prompt).granting_on_prompt());
        let location = ChannelLocationProvider::new();
        location.push_sample(GeoSample::new(10.0, 20.0, Utc::now()));
        let guard = AvailabilityGuard::new(permission.clone(), Arc::new(location), quick_fix());

        assert!(guard.check().await.is_ready());
        assert_eq!(permission.query().await, PermissionState::Granted);
    }

    #[tokio::test]
    async fn test_timeout_is_not_fatal() {
        let guard = AvailabilityGuard::new(
            Arc::new(ReportedPermission::new(PermissionState::Granted)),
            Arc::new(HangingProvider),
            quick_fix(),
        );

        let status = guard.check().await;
        assert!(status.granted);
        assert!(!status.enabled);
        assert!(status.reason.as_deref().unwrap().contains("timed out"));
        assert!(matches!(
            status.into_result(),
            Err(TrackingError::LocationUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_fix_reports_unavailable() {
        // Granted, but the sensor produces nothing
        let guard = AvailabilityGuard::new(
            Arc::new(ReportedPermission::new(PermissionState::Granted)),
            Arc::new(ChannelLocationProvider::new()),
            quick_fix(),
        );

        let status = guard.check().await;
        assert!(status.granted);
        assert!(!status.enabled);
    }
}
