//! Process-wide inference metrics and observer fan-out.
//!
//! One `MetricsHub` is shared (behind an `Arc`) by every request handler and
//! every stream engine. Updates and broadcasts serialize on a single lock, so
//! every observer sees events in the order they were published.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::severity::{SeverityLevel, SeverityResult};

/// Events queued per observer before it counts as stalled and is dropped.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// Outcome of one inference, as pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceSummary {
    pub severity_score: f64,
    pub severity_level: SeverityLevel,
    pub crack_count: usize,
    pub inference_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    /// Set when the inference came from a stream rather than a still upload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

impl InferenceSummary {
    pub fn new(severity: &SeverityResult, inference_time: Duration) -> Self {
        Self {
            severity_score: severity.score,
            severity_level: severity.level,
            crack_count: severity.crack_count,
            inference_time_ms: inference_time.as_secs_f64() * 1000.0,
            timestamp: Utc::now(),
            stream_id: None,
        }
    }

    pub fn for_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }
}

/// Point-in-time view of the hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub total_requests: u64,
    pub average_inference_time: f64,
    pub uptime_seconds: f64,
    pub model_loaded: bool,
    pub active_websockets: usize,
    pub latest_inference: Option<InferenceSummary>,
}

/// Message delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    Metrics(SystemMetrics),
    InferenceComplete { data: InferenceSummary },
    Heartbeat,
}

pub type SubscriberId = u64;

/// Observer handle returned by `subscribe`. Dropping the receiver, or letting
/// `SUBSCRIBER_QUEUE` events pile up unread, makes the next broadcast to it
/// fail, which unregisters it.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<HubEvent>,
}

#[derive(Debug, Default)]
struct HubInner {
    request_count: u64,
    mean_inference_ms: f64,
    latest: Option<InferenceSummary>,
    model_loaded: bool,
    subscribers: HashMap<SubscriberId, mpsc::Sender<HubEvent>>,
    next_id: SubscriberId,
    closed: bool,
}

#[derive(Debug)]
pub struct MetricsHub {
    inner: Mutex<HubInner>,
    started: Instant,
}

impl Default for MetricsHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsHub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        // A panic while holding the lock cannot leave the counters
        // half-written, so the poisoned state is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_model_loaded(&self, loaded: bool) {
        self.lock().model_loaded = loaded;
    }

    /// Fold one inference duration into the running mean.
    pub fn record_inference(&self, duration: Duration) {
        let mut inner = self.lock();
        inner.request_count += 1;
        let d = duration.as_secs_f64() * 1000.0;
        inner.mean_inference_ms += (d - inner.mean_inference_ms) / inner.request_count as f64;
    }

    /// Store `summary` as the latest result and push it to every observer.
    pub fn publish(&self, summary: InferenceSummary) -> usize {
        let mut inner = self.lock();
        inner.latest = Some(summary.clone());
        Self::deliver(&mut inner, HubEvent::InferenceComplete { data: summary })
    }

    pub fn snapshot(&self) -> SystemMetrics {
        let inner = self.lock();
        self.metrics_of(&inner)
    }

    fn metrics_of(&self, inner: &HubInner) -> SystemMetrics {
        SystemMetrics {
            total_requests: inner.request_count,
            average_inference_time: inner.mean_inference_ms,
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            model_loaded: inner.model_loaded,
            active_websockets: inner.subscribers.len(),
            latest_inference: inner.latest.clone(),
        }
    }

    /// Register an observer. The first event it receives is the current
    /// metrics snapshot, queued before any later broadcast.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.closed {
            // Sender dropped immediately; the receiver sees end-of-stream.
            return Subscription { id, receiver: rx };
        }
        // Registered first so the snapshot counts this observer.
        inner.subscribers.insert(id, tx.clone());
        let _ = tx.try_send(HubEvent::Metrics(self.metrics_of(&inner)));
        debug!(subscriber = id, total = inner.subscribers.len(), "observer subscribed");
        Subscription { id, receiver: rx }
    }

    /// Idempotent.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut inner = self.lock();
        if inner.subscribers.remove(&id).is_some() {
            debug!(subscriber = id, total = inner.subscribers.len(), "observer unsubscribed");
        }
    }

    /// Deliver `event` to every observer registered at the time of the call.
    /// Returns how many received it.
    pub fn broadcast(&self, event: HubEvent) -> usize {
        let mut inner = self.lock();
        Self::deliver(&mut inner, event)
    }

    fn deliver(inner: &mut HubInner, event: HubEvent) -> usize {
        let mut failed = Vec::new();
        for (id, tx) in &inner.subscribers {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => failed.push((*id, true)),
                Err(TrySendError::Closed(_)) => failed.push((*id, false)),
            }
        }
        let kind = ErrorKind::SubscriberDeliveryFailure;
        for (id, stalled) in failed {
            inner.subscribers.remove(&id);
            if stalled {
                warn!(subscriber = id, %kind, queued = SUBSCRIBER_QUEUE, "dropping stalled observer");
            } else {
                debug!(subscriber = id, %kind, "dropping observer after failed delivery");
            }
        }
        inner.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Drop every observer and refuse new ones. Open receivers drain what is
    /// already queued and then end.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        let n = inner.subscribers.len();
        inner.subscribers.clear();
        info!(observers = n, "metrics hub shut down");
    }
}
