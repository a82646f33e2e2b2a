//! Device location boundary.
//!
//! The platform location API is modelled as a subscription: `subscribe`
//! returns a handle plus a receiver of samples, `unsubscribe` closes it. The
//! tracking session is the only consumer of its own subscription.
//!
//! [`ChannelLocationProvider`] is the push-fed implementation: the mobile layer
//! forwards every OS callback into it (see the `ffi` module), and tests drive
//! it directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use tokio::sync::{mpsc, watch};

use crate::GeoSample;
use crate::error::{Result, TrackingError};

/// Options for a one-shot position fix.
#[derive(Debug, Clone, PartialEq)]
pub struct FixOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// A cached fix at most this old is acceptable
    pub maximum_age: Duration,
}

impl Default for FixOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(10),
            maximum_age: Duration::from_secs(30),
        }
    }
}

/// Options for a live position watch.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// Hint to the OS: minimum movement between callbacks (meters)
    pub distance_filter_m: f64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            distance_filter_m: 0.0,
        }
    }
}

pub type SubscriptionId = u64;

/// One event from a live watch: a sample, or an OS-level failure.
pub type LocationEvent = Result<GeoSample>;

/// Handle to a live position watch.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::UnboundedReceiver<LocationEvent>,
}

/// Device location API.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// One-shot fix. Fails with `LocationUnavailable` when none arrives in time.
    async fn current_fix(&self, options: &FixOptions) -> Result<GeoSample>;

    /// Open a live watch.
    fn subscribe(&self, options: &WatchOptions) -> Result<Subscription>;

    /// Close a live watch. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

// ============================================================================
// Push-fed provider
// ============================================================================

struct ChannelInner {
    next_id: SubscriptionId,
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<LocationEvent>>,
    last_options: Option<WatchOptions>,
}

/// Location provider fed by the platform layer pushing samples in.
#[derive(Clone)]
pub struct ChannelLocationProvider {
    inner: Arc<Mutex<ChannelInner>>,
    latest: Arc<watch::Sender<Option<GeoSample>>>,
}

impl Default for ChannelLocationProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelLocationProvider {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            inner: Arc::new(Mutex::new(ChannelInner {
                next_id: 1,
                subscribers: HashMap::new(),
                last_options: None,
            })),
            latest: Arc::new(latest),
        }
    }

    /// Deliver a sample to every live watch and to pending one-shot fixes.
    ///
    /// Returns how many watches received it.
    pub fn push_sample(&self, sample: GeoSample) -> usize {
        self.latest.send_replace(Some(sample.clone()));
        self.broadcast(|| Ok(sample.clone()))
    }

    /// Deliver an OS-level location failure to every live watch.
    pub fn push_error(&self, message: &str) -> usize {
        warn!("[LocationProvider] Platform reported stream error: {}", message);
        self.broadcast(|| {
            Err(TrackingError::Stream {
                message: message.to_string(),
            })
        })
    }

    /// Number of open watches.
    pub fn active_subscriptions(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.subscribers.len())
            .unwrap_or(0)
    }

    /// Options of the most recent `subscribe` call, for the platform to apply.
    pub fn watch_options(&self) -> Option<WatchOptions> {
        self.inner.lock().ok().and_then(|inner| inner.last_options.clone())
    }

    fn broadcast(&self, event: impl Fn() -> LocationEvent) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        // Receivers dropped without unsubscribe are pruned here
        inner.subscribers.retain(|_, tx| tx.send(event()).is_ok());
        inner.subscribers.len()
    }
}

#[async_trait]
impl LocationProvider for ChannelLocationProvider {
    async fn current_fix(&self, options: &FixOptions) -> Result<GeoSample> {
        let mut rx = self.latest.subscribe();

        let cached = rx.borrow_and_update().clone();
        if let Some(sample) = cached {
            let age = (Utc::now() - sample.timestamp).to_std().unwrap_or_default();
            if age <= options.maximum_age {
                return Ok(sample);
            }
        }

        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                if let Some(sample) = rx.borrow_and_update().clone() {
                    return Some(sample);
                }
            }
        };

        match tokio::time::timeout(options.timeout, wait).await {
            Ok(Some(sample)) => Ok(sample),
            Ok(None) => Err(TrackingError::LocationUnavailable {
                reason: "location source closed".to_string(),
            }),
            Err(_) => Err(TrackingError::LocationUnavailable {
                reason: format!("no position fix within {:?}", options.timeout),
            }),
        }
    }

    fn subscribe(&self, options: &WatchOptions) -> Result<Subscription> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| TrackingError::Stream {
                message: "location provider lock poisoned".to_string(),
            })?;

        let id = inner.next_id;
        inner.next_id += 1;

        let (tx, receiver) = mpsc::unbounded_channel();
        inner.subscribers.insert(id, tx);
        inner.last_options = Some(options.clone());

        debug!(
            "[LocationProvider] Opened watch {} ({} active)",
            id,
            inner.subscribers.len()
        );

        Ok(Subscription { id, receiver })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.subscribers.remove(&id).is_some() {
                debug!(
                    "[LocationProvider] Closed watch {} ({} active)",
                    id,
                    inner.subscribers.len()
                );
            }
        }
    }
}
