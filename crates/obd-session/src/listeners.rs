//! Typed observer registry
//!
//! Listeners are plain closures held behind ids. Notification clones the
//! current listener set first, so a listener may subscribe or unsubscribe
//! reentrantly. A panicking listener is caught and logged; the rest still
//! run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::warn;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ListenerMap<T> = Arc<RwLock<HashMap<u64, Listener<T>>>>;

/// Registry of listeners for values of type `T`
pub(crate) struct ListenerRegistry<T> {
    listeners: ListenerMap<T>,
    next_id: AtomicU64,
}

impl<T: 'static> ListenerRegistry<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener; the returned handle removes it on drop
    pub fn add(&self, listener: Box<dyn Fn(&T) + Send + Sync>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().insert(id, Arc::from(listener));

        let weak: Weak<RwLock<HashMap<u64, Listener<T>>>> = Arc::downgrade(&self.listeners);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(map) = weak.upgrade() {
                    map.write().remove(&id);
                }
            })),
        }
    }

    /// Invoke every listener with `value`
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<(u64, Listener<T>)> = self
            .listeners
            .read()
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect();
        for (id, listener) in snapshot {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(value)));
            if result.is_err() {
                warn!(listener = id, "Listener panicked during notification");
            }
        }
    }

    /// Drop all listeners
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }
}

/// Handle for a registered listener. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Subscription backed by an arbitrary cancel action. Lets alternative
    /// [`crate::connection::SnapshotSource`] implementations hand out handles.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the listener now
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
