//! Backend events and listener fan-out.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::error;
use parking_lot::RwLock;

use pvrlink_protocol::{ClientError, Frame};

/// One event delivered to listeners: either an unsolicited backend message
/// or an error synthesized by the reader task when the connection died.
#[derive(Debug, Clone)]
pub enum Event {
    /// A `BACKEND_MESSAGE` frame: the message text plus any extra fields.
    Backend {
        message: String,
        extra: Vec<String>,
        received: DateTime<Utc>,
    },
    /// The reader task hit a socket fault. Subscribers observe connection
    /// death through the same channel as any other event.
    ClientError {
        message: String,
        /// Causal chain, outermost error first.
        chain: Vec<String>,
        received: DateTime<Utc>,
    },
}

impl Event {
    pub(crate) fn from_backend_frame(frame: &Frame) -> Event {
        let fields = frame.fields();
        Event::Backend {
            message: fields.get(1).cloned().unwrap_or_default(),
            extra: fields.get(2..).map(<[String]>::to_vec).unwrap_or_default(),
            received: Utc::now(),
        }
    }

    pub(crate) fn from_client_error(err: &ClientError) -> Event {
        Event::ClientError {
            message: err.to_string(),
            chain: err.chain(),
            received: Utc::now(),
        }
    }
}

/// A subscriber for backend events. Implementations must tolerate being
/// called from the dispatcher task; a panic inside `on_event` is caught and
/// logged without disturbing other listeners.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Registry of event listeners.
///
/// Registration and removal may race with an in-flight dispatch: dispatch
/// iterates over a snapshot, so removal never invalidates the iteration.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn EventListener>)>>,
    next_id: AtomicU64,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventListener>> {
        self.listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    /// Deliver one event to every currently registered listener. A
    /// panicking listener is isolated; delivery continues.
    pub(crate) fn dispatch(&self, event: &Event) {
        for listener in self.snapshot() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                let what = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!("event listener panicked: {what}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    impl EventListener for Counter {
        fn on_event(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicker;

    impl EventListener for Panicker {
        fn on_event(&self, _event: &Event) {
            panic!("listener bug");
        }
    }

    fn sample_event() -> Event {
        Event::Backend {
            message: "RECORDING_LIST_CHANGE".to_string(),
            extra: Vec::new(),
            received: Utc::now(),
        }
    }

    #[test]
    fn test_add_remove() {
        let set = ListenerSet::default();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let id = set.add(counter.clone());

        set.dispatch(&sample_event());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        assert!(set.remove(id));
        assert!(!set.remove(id));
        set.dispatch(&sample_event());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let set = ListenerSet::default();
        let before = Arc::new(Counter(AtomicUsize::new(0)));
        let after = Arc::new(Counter(AtomicUsize::new(0)));

        set.add(before.clone());
        set.add(Arc::new(Panicker));
        set.add(after.clone());

        set.dispatch(&sample_event());
        set.dispatch(&sample_event());

        assert_eq!(before.0.load(Ordering::SeqCst), 2);
        assert_eq!(after.0.load(Ordering::SeqCst), 2);
    }
}
