//! Subscriber registry with callback and broadcast delivery.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::SerialMessage;

/// Capacity of the broadcast channel behind [`SubscriberRegistry::stream`].
const STREAM_CAPACITY: usize = 1024;

/// Subscriber callback.
pub type MessageCallback = Arc<dyn Fn(&SerialMessage) + Send + Sync>;

struct Inner {
    next_id: AtomicU64,
    callbacks: RwLock<HashMap<u64, MessageCallback>>,
}

impl Inner {
    fn remove(&self, id: u64) -> bool {
        self.callbacks
            .write()
            .map(|mut callbacks| callbacks.remove(&id).is_some())
            .unwrap_or(false)
    }

    fn contains(&self, id: u64) -> bool {
        self.callbacks
            .read()
            .map(|callbacks| callbacks.contains_key(&id))
            .unwrap_or(false)
    }
}

/// Registry of message subscribers.
///
/// Callbacks run synchronously on the task that completes a frame. Async
/// consumers can use [`stream`](Self::stream) instead.
pub struct SubscriberRegistry {
    inner: Arc<Inner>,
    sender: broadcast::Sender<SerialMessage>,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                callbacks: RwLock::new(HashMap::new()),
            }),
            sender,
        }
    }

    /// Register a callback.
    ///
    /// The returned token removes exactly this registration.
    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&SerialMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut callbacks) = self.inner.callbacks.write() {
            callbacks.insert(id, Arc::new(callback));
        }
        tracing::debug!(subscriber = id, "Subscriber registered");

        Unsubscribe {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.callbacks.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Whether no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a message to every registered callback and stream listener.
    ///
    /// Iterates over a snapshot, so callbacks may subscribe or unsubscribe
    /// while being notified. A callback removed mid-delivery is skipped.
    /// A panicking callback is logged and does not stop delivery.
    pub fn notify(&self, message: &SerialMessage) {
        let snapshot: Vec<(u64, MessageCallback)> = match self.inner.callbacks.read() {
            Ok(callbacks) => callbacks
                .iter()
                .map(|(id, cb)| (*id, Arc::clone(cb)))
                .collect(),
            Err(e) => {
                tracing::error!("Subscriber registry poisoned: {e}");
                return;
            }
        };

        for (id, callback) in snapshot {
            if !self.inner.contains(id) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                tracing::error!(subscriber = id, "Subscriber panicked while handling message");
            }
        }

        let _ = self.sender.send(message.clone()); // live stream listeners
    }

    /// Get a receiver for live messages.
    #[must_use]
    pub fn receiver(&self) -> broadcast::Receiver<SerialMessage> {
        self.sender.subscribe()
    }

    /// Stream of live messages.
    ///
    /// Messages missed by a lagging consumer are skipped.
    #[must_use]
    pub fn stream(&self) -> futures::stream::BoxStream<'static, SerialMessage> {
        BroadcastStream::new(self.receiver())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }
}

/// Token returned by [`SubscriberRegistry::subscribe`].
///
/// Dropping the token leaves the subscription in place.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    id: u64,
    registry: Weak<Inner>,
}

impl Unsubscribe {
    /// Subscriber id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Remove the registration. Calling this again is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.registry.upgrade() {
            if inner.remove(self.id) {
                tracing::debug!(subscriber = self.id, "Subscriber removed");
            }
        }
    }
}
