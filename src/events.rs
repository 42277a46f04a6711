//! Event bridge to the caller
//!
//! The engine pushes progress over two logical channels: `Progress` for
//! single-item downloads and `PlaylistProgress` for playlist downloads.
//! Delivery is push, at-least-once, in-order per channel. The IPC transport
//! that carries these to a UI is a collaborator, not part of this crate; a
//! host subscribes here and forwards however it likes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::{PlaylistProgressSnapshot, ProgressSnapshot};

/// Engine -> subscriber events. The serialized shape is stable; the UI
/// should switch on `event` to update state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum EngineEvent {
    Progress(ProgressSnapshot),
    PlaylistProgress(PlaylistProgressSnapshot),
}

/// Fan-out registry for engine events.
///
/// Cloning shares the registry; every subscriber receives every event
/// emitted after its subscription.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<EngineEvent>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Dropping the returned [`Subscription`]
    /// unregisters it; the receiver then sees the end of the stream.
    pub fn subscribe(&self) -> (Subscription, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .expect("event bus lock poisoned")
            .insert(id, tx);

        (
            Subscription {
                id,
                inner: Arc::clone(&self.inner),
            },
            rx,
        )
    }

    /// Push an event to all live subscribers, pruning closed ones.
    pub fn emit(&self, event: EngineEvent) {
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .expect("event bus lock poisoned");
        subs.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}

/// Handle to one registered listener. Disposal unregisters the listener
/// exactly once; dropping after an explicit `unsubscribe` is a no-op.
pub struct Subscription {
    id: u64,
    inner: Arc<BusInner>,
}

impl Subscription {
    /// Explicitly unregister. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.remove(&self.id);
        }
    }
}
