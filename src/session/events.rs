//! Connection and error listeners

use crate::error::SessionError;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Handle returned by listener registration, used to remove the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Delivered to connection listeners
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    /// Unsolicited loss or explicit close; `reason` comes from the transport
    Disconnected { reason: String },
}

impl ConnectionEvent {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionEvent::Connected)
    }
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registration-ordered set of callbacks
pub struct ListenerSet<E> {
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for ListenerSet<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E> ListenerSet<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the id was not registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Call every listener; a panicking listener is logged and skipped
    pub fn notify(&self, event: &E) {
        // Snapshot so listeners may (un)register while being called
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("Listener panicked");
            }
        }
    }
}

/// Both listener sets of a session
#[derive(Default)]
pub struct Listeners {
    pub connection: ListenerSet<ConnectionEvent>,
    pub error: ListenerSet<SessionError>,
}

impl Listeners {
    pub fn clear(&self) {
        self.connection.clear();
        self.error.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_notify_in_registration_order() {
        let set = ListenerSet::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            set.add(move |value: &u32| seen.lock().push((tag, *value)));
        }

        set.notify(&7);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_remove_listener() {
        let set = ListenerSet::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = set.add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        set.notify(&1);
        assert!(set.remove(id));
        assert!(!set.remove(id));
        set.notify(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let set = ListenerSet::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        set.add(|_| panic!("listener failure"));
        let counter = count.clone();
        set.add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        set.notify(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_unregister_itself() {
        let set = Arc::new(ListenerSet::<u32>::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let set_ref = set.clone();
        let slot_ref = slot.clone();
        let id = set.add(move |_| {
            if let Some(id) = *slot_ref.lock() {
                set_ref.remove(id);
            }
        });
        *slot.lock() = Some(id);

        set.notify(&1);
        assert!(set.is_empty());
    }
}
