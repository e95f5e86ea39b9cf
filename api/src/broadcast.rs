//! Fan-out of sequenced envelopes to push-stream subscribers.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: a subscriber
//! whose queue is full is disconnected and has to reconnect, which gets it a
//! fresh `snapshot` envelope. Each envelope is encoded once and shared.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use opsdeck_core::envelope::{EventType, StreamEnvelope};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Envelopes buffered per subscriber before it counts as lagging.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// An envelope already rendered for the wire.
#[derive(Debug)]
pub struct PreparedEvent {
    /// Push-stream `id:` field, the envelope sequence.
    pub id: String,
    pub event_type: EventType,
    /// The envelope as JSON, sent as the `data:` field.
    pub data: String,
}

impl PreparedEvent {
    pub fn from_envelope(envelope: &StreamEnvelope) -> Result<Arc<Self>, serde_json::Error> {
        Ok(Arc::new(Self {
            id: envelope.sequence.to_string(),
            event_type: envelope.event_type,
            data: serde_json::to_string(envelope)?,
        }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub published: u64,
    pub dropped_subscribers: u64,
    pub subscribers: usize,
}

type Registry = HashMap<Uuid, mpsc::Sender<Arc<PreparedEvent>>>;

pub struct EventBroadcaster {
    subscribers: Mutex<Registry>,
    buffer: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBroadcaster {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber whose queue starts with `initial`, so nothing
    /// published afterwards can overtake it.
    pub fn subscribe(self: &Arc<Self>, initial: Arc<PreparedEvent>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        // Fresh channel with capacity >= 1: cannot be full or closed.
        let _ = sender.try_send(initial);
        let id = Uuid::now_v7();
        self.registry().insert(id, sender);
        tracing::debug!(subscriber_id = %id, "subscriber registered");
        Subscription {
            id,
            receiver,
            broadcaster: Arc::downgrade(self),
        }
    }

    /// Deliver to every subscriber without waiting. Returns how many queues
    /// accepted the event.
    pub fn publish(&self, event: Arc<PreparedEvent>) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.registry();
        let mut delivered = 0;
        registry.retain(|id, sender| match sender.try_send(Arc::clone(&event)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    subscriber_id = %id,
                    sequence = %event.id,
                    "subscriber lagging; disconnecting"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber_id = %id, "subscriber gone");
                false
            }
        });
        delivered
    }

    /// Disconnect every subscriber; their streams end after draining.
    pub fn close_all(&self) -> usize {
        let mut registry = self.registry();
        let closed = registry.len();
        registry.clear();
        closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            published: self.published.load(Ordering::Relaxed),
            dropped_subscribers: self.dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }

    fn remove(&self, id: &Uuid) {
        if self.registry().remove(id).is_some() {
            tracing::debug!(subscriber_id = %id, "subscriber unregistered");
        }
    }
}

/// Receiving half of one subscriber. Ends when the broadcaster drops it for
/// lagging; unregisters itself when dropped.
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::Receiver<Arc<PreparedEvent>>,
    broadcaster: Weak<EventBroadcaster>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Stream for Subscription {
    type Item = Arc<PreparedEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.remove(&self.id);
        }
    }
}
