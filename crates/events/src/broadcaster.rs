//! Per-job fan-out of [`LogEvent`]s to live viewers.
//!
//! Each [`Subscription`] owns its own bounded `mpsc` buffer. Publishing
//! never waits: a subscriber whose buffer is full simply misses the event,
//! and a subscriber whose receiver is gone is pruned on the next publish.
//! The registry is shared with every subscription so that dropping one
//! unsubscribes it, including from synchronous `Drop`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use esprelay_core::event::LogEvent;
use esprelay_core::types::JobId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default per-subscriber buffer length.
pub const DEFAULT_BUFFER: usize = 256;

type Registry = HashMap<JobId, Vec<Subscriber>>;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<LogEvent>,
}

// ---------------------------------------------------------------------------
// EventBroadcaster
// ---------------------------------------------------------------------------

/// Registry of live subscribers keyed by job id.
///
/// Shared as `Arc<EventBroadcaster>` between the runner (publisher) and
/// whatever serves viewers (subscribers).
pub struct EventBroadcaster {
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl EventBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Register a new viewer for `job_id`. It receives every event published
    /// from now on, in publish order.
    pub fn subscribe(&self, job_id: &JobId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.registry
            .lock()
            .entry(job_id.clone())
            .or_default()
            .push(Subscriber { id, tx });
        tracing::debug!(job_id = %job_id, subscriber = id, "Viewer subscribed");

        Subscription {
            job_id: job_id.clone(),
            id,
            rx,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Deliver `event` to every current subscriber of `job_id` without
    /// blocking.
    pub fn publish(&self, job_id: &JobId, event: &LogEvent) {
        let mut registry = self.registry.lock();
        let Some(subscribers) = registry.get_mut(job_id) else {
            return;
        };

        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(job_id = %job_id, subscriber = sub.id, "Subscriber buffer full, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if subscribers.is_empty() {
            registry.remove(job_id);
        }
    }

    /// Publish the terminating `Close` and release the job's registry entry.
    ///
    /// Dropping the senders ends every receiver once it has drained.
    pub fn close(&self, job_id: &JobId) {
        self.publish(job_id, &LogEvent::Close);
        if let Some(subscribers) = self.registry.lock().remove(job_id) {
            tracing::debug!(job_id = %job_id, count = subscribers.len(), "Subscribers released");
        }
    }

    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.registry.lock().get(job_id).map_or(0, Vec::len)
    }

    /// Whether the registry still holds an entry for `job_id`.
    pub fn has_entry(&self, job_id: &JobId) -> bool {
        self.registry.lock().contains_key(job_id)
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receive side of one viewer. Unsubscribes on drop.
pub struct Subscription {
    job_id: JobId,
    id: u64,
    rx: mpsc::Receiver<LogEvent>,
    registry: Arc<Mutex<Registry>>,
}

impl Subscription {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Next event, or `None` once the job's entry has been released and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        if let Some(subscribers) = registry.get_mut(&self.job_id) {
            subscribers.retain(|sub| sub.id != self.id);
            if subscribers.is_empty() {
                registry.remove(&self.job_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
