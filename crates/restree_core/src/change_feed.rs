//! Change notification for resource structure and values.
//!
//! Every structural change (create, delete, activation, references) and
//! every value write produces a [`ResourceEvent`]. Events reach two kinds of
//! consumers:
//!
//! - channel subscribers from [`ChangeFeed::subscribe`], which receive every
//!   event in order;
//! - [`ResourceListener`] callbacks, optionally restricted to a path prefix.
//!
//! Events are dispatched after the operation that caused them released the
//! resource lock, or at the end of the outermost transaction. A listener that
//! fails or panics is logged and skipped; it never affects the writer or the
//! other listeners.
//!
//! ```rust,ignore
//! let rx = db.subscribe();
//! db.add_listener(Some("meter"), |event: &ResourceEvent| {
//!     println!("{} {:?}", event.path, event.kind);
//!     Ok(())
//! });
//! ```

use crate::types::ResourceId;
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// What happened to a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// The resource became real.
    Created,
    /// The resource was deleted and is virtual again.
    Deleted,
    /// The active flag was set.
    Activated,
    /// The active flag was cleared.
    Deactivated,
    /// The resource became a reference to `target`.
    ReferenceAdded {
        /// Location of the target.
        target: String,
    },
    /// A reference was removed, directly or because its target went away.
    ReferenceRemoved,
    /// The value changed.
    ValueChanged {
        /// Value before the write.
        old: Value,
        /// Value after the write.
        new: Value,
        /// Timestamp stored with the new value.
        timestamp: i64,
    },
}

impl EventKind {
    /// Returns `true` for value events.
    #[must_use]
    pub fn is_value(&self) -> bool {
        matches!(self, EventKind::ValueChanged { .. })
    }
}

/// A change of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEvent {
    /// Dispatch order; assigned by the feed.
    pub sequence: u64,
    /// Path of the resource.
    pub path: String,
    /// Id of the resource at the time of the change.
    pub id: Option<ResourceId>,
    /// Schema type name.
    pub type_name: String,
    /// What happened.
    pub kind: EventKind,
}

impl ResourceEvent {
    /// Creates an event; the sequence is assigned when it is dispatched.
    #[must_use]
    pub fn new(
        path: impl Into<String>,
        id: Option<ResourceId>,
        type_name: impl Into<String>,
        kind: EventKind,
    ) -> Self {
        Self {
            sequence: 0,
            path: path.into(),
            id,
            type_name: type_name.into(),
            kind,
        }
    }

    /// Returns `true` if the event concerns `prefix` or a resource below it.
    /// The empty prefix matches everything.
    #[must_use]
    pub fn is_below(&self, prefix: &str) -> bool {
        prefix.is_empty()
            || self.path == prefix
            || self
                .path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Error a listener may report.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback for resource events.
pub trait ResourceListener: Send + Sync {
    /// Handles one event.
    ///
    /// # Errors
    ///
    /// Errors are logged by the dispatcher and otherwise ignored.
    fn on_event(&self, event: &ResourceEvent) -> Result<(), ListenerError>;
}

impl<F> ResourceListener for F
where
    F: Fn(&ResourceEvent) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_event(&self, event: &ResourceEvent) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Handle of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    prefix: String,
    listener: Arc<dyn ResourceListener>,
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatched {
    /// Events dispatched.
    pub events: u64,
    /// Listener calls that failed or panicked.
    pub failures: u64,
}

/// Distributes resource events to subscribers and listeners.
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ResourceEvent>>>,
    listeners: RwLock<Vec<Registration>>,
    held: Mutex<Vec<ResourceEvent>>,
    next_sequence: AtomicU64,
    next_listener: AtomicU64,
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscriber_count())
            .field("listeners", &self.listener_count())
            .field("held", &self.held.lock().len())
            .finish()
    }
}

impl ChangeFeed {
    /// Creates a feed without consumers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            next_sequence: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Subscribes to every future event.
    ///
    /// The receiver should be drained regularly; the channel is unbounded.
    pub fn subscribe(&self) -> Receiver<ResourceEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Registers a listener for events at or below `prefix` (all events
    /// for `None`).
    pub fn add_listener(
        &self,
        prefix: Option<&str>,
        listener: Arc<dyn ResourceListener>,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registration {
            id,
            prefix: prefix.unwrap_or_default().trim_matches('/').to_string(),
            listener,
        });
        id
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Keeps events back until [`Self::release`].
    pub(crate) fn hold(&self, events: Vec<ResourceEvent>) {
        self.held.lock().extend(events);
    }

    /// Dispatches everything held back.
    pub(crate) fn release(&self) -> Dispatched {
        let events = std::mem::take(&mut *self.held.lock());
        self.emit_batch(events)
    }

    /// Dispatches a batch of events in order.
    pub fn emit_batch(&self, events: Vec<ResourceEvent>) -> Dispatched {
        let mut dispatched = Dispatched::default();
        if events.is_empty() {
            return dispatched;
        }
        let listeners: Vec<(String, Arc<dyn ResourceListener>)> = self
            .listeners
            .read()
            .iter()
            .map(|r| (r.prefix.clone(), Arc::clone(&r.listener)))
            .collect();

        for mut event in events {
            event.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            for (prefix, listener) in &listeners {
                if !event.is_below(prefix) {
                    continue;
                }
                match panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(path = %event.path, error = %e, "resource listener failed");
                        dispatched.failures += 1;
                    }
                    Err(_) => {
                        tracing::error!(path = %event.path, "resource listener panicked");
                        dispatched.failures += 1;
                    }
                }
            }
            self.subscribers
                .write()
                .retain(|tx| tx.send(event.clone()).is_ok());
            dispatched.events += 1;
        }
        dispatched
    }

    /// Dispatches one event.
    pub fn emit(&self, event: ResourceEvent) -> Dispatched {
        self.emit_batch(vec![event])
    }

    /// Number of live channel subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn created(path: &str) -> ResourceEvent {
        ResourceEvent::new(path, Some(ResourceId::new(1)), "Meter", EventKind::Created)
    }

    #[test]
    fn subscribers_receive_in_order() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        feed.emit_batch(vec![created("a"), created("b")]);

        let first = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        let second = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(first.path, "a");
        assert_eq!(second.path, "b");
        assert!(first.sequence < second.sequence);
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);
        drop(rx);
        feed.emit(created("a"));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn prefix_matches_whole_segments() {
        let event = created("meter/power");
        assert!(event.is_below(""));
        assert!(event.is_below("meter"));
        assert!(event.is_below("meter/power"));
        assert!(!event.is_below("met"));
        assert!(!event.is_below("meter/pow"));
    }

    #[test]
    fn listeners_filter_by_prefix() {
        let feed = ChangeFeed::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        feed.add_listener(
            Some("/meter/"),
            Arc::new(move |e: &ResourceEvent| -> Result<(), ListenerError> {
                sink.lock().push(e.path.clone());
                Ok(())
            }),
        );
        feed.emit_batch(vec![created("meter"), created("other"), created("meter/power")]);
        assert_eq!(*seen.lock(), vec!["meter", "meter/power"]);
    }

    #[test]
    fn failing_listeners_do_not_stop_dispatch() {
        let feed = ChangeFeed::new();
        let count = Arc::new(AtomicU64::new(0));
        feed.add_listener(None, Arc::new(|_: &ResourceEvent| -> Result<(), ListenerError> {
            panic!("listener bug")
        }));
        feed.add_listener(None, Arc::new(|_: &ResourceEvent| -> Result<(), ListenerError> {
            Err("refused".into())
        }));
        let counter = Arc::clone(&count);
        feed.add_listener(
            None,
            Arc::new(move |_: &ResourceEvent| -> Result<(), ListenerError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let dispatched = feed.emit_batch(vec![created("a"), created("b")]);
        assert_eq!(dispatched.events, 2);
        assert_eq!(dispatched.failures, 4);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn held_events_wait_for_release() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        feed.hold(vec![created("a")]);
        assert!(rx.try_recv().is_err());
        assert_eq!(feed.release().events, 1);
        assert_eq!(rx.try_recv().unwrap().path, "a");
        assert_eq!(feed.release().events, 0);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let feed = ChangeFeed::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let id = feed.add_listener(
            None,
            Arc::new(move |_: &ResourceEvent| -> Result<(), ListenerError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        assert!(feed.remove_listener(id));
        assert!(!feed.remove_listener(id));
        feed.emit(created("a"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
