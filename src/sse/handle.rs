//! The process-wide view of "the current connection".

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::frame::EventFrame;

/// Broadcast channel capacity for frames of a single connection.
const BROADCAST_CAPACITY: usize = 1024;

/// Identifier of one physical connection. Strictly increasing over the manager's lifetime.
pub type Epoch = u64;

/// A live physical connection as seen by consumers.
///
/// Cloning is cheap. A clone does not keep the physical connection alive; once the
/// [`super::ConnectionManager`] closes it, [`Connection::is_closed`] turns `true` and no
/// further frames are broadcast on it.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    epoch: Epoch,
    opened_at: DateTime<Utc>,
    frames: broadcast::Sender<EventFrame>,
    closed: CancellationToken,
}

impl Connection {
    pub(crate) fn open(epoch: Epoch) -> Self {
        let (frames, _) = broadcast::channel(BROADCAST_CAPACITY);

        Self {
            inner: Arc::new(ConnectionInner {
                epoch,
                opened_at: Utc::now(),
                frames,
                closed: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.inner.epoch
    }

    #[must_use]
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.inner.opened_at
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Receive every frame broadcast on this connection from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventFrame> {
        self.inner.frames.subscribe()
    }

    /// Token cancelled when this connection is closed.
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    pub(crate) fn deliver(&self, frame: EventFrame) {
        if self.is_closed() {
            return;
        }
        // No receivers just means nobody is listening for this epoch
        _ = self.inner.frames.send(frame);
    }

    pub(crate) fn close(&self) {
        self.inner.closed.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("epoch", &self.inner.epoch)
            .field("opened_at", &self.inner.opened_at)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Identifies a callback registered with [`SharedConnectionHandle::subscribe_to_changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

type Observer = Arc<dyn Fn(Option<&Connection>) + Send + Sync>;

/// Stable, observable reference to the current connection, or to its absence.
///
/// Created once by the [`super::ConnectionManager`] and shared with every consumer. Only
/// the manager publishes into it; consumers read it and observe changes. Readers see either
/// a fully open connection or `None`: the manager publishes a connection only after it is
/// confirmed open, and withdraws it before closing it.
#[derive(Clone)]
pub struct SharedConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    current: watch::Sender<Option<Connection>>,
    observers: DashMap<ObserverId, Observer>,
}

impl SharedConnectionHandle {
    pub(crate) fn new() -> Self {
        let (current, _) = watch::channel(None);

        Self {
            inner: Arc::new(HandleInner {
                current,
                observers: DashMap::new(),
            }),
        }
    }

    /// The current open connection, if any.
    #[must_use]
    pub fn current(&self) -> Option<Connection> {
        self.inner
            .current
            .borrow()
            .as_ref()
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    /// Epoch of the current open connection, if any.
    #[must_use]
    pub fn epoch(&self) -> Option<Epoch> {
        self.current().as_ref().map(Connection::epoch)
    }

    /// Watch receiver notified every time the current connection changes.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<Option<Connection>> {
        self.inner.current.subscribe()
    }

    /// Register a callback invoked with every newly published connection (or `None`).
    ///
    /// The callback is invoked once immediately with the current value, so late
    /// subscribers see the live connection. Callbacks run synchronously on the publishing
    /// task, before any frame of a new connection is broadcast, and never under a lock.
    /// They may observe the same connection twice when registration races a publication.
    pub fn subscribe_to_changes<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(Option<&Connection>) + Send + Sync + 'static,
    {
        let id = ObserverId(Uuid::new_v4());
        let callback: Observer = Arc::new(callback);

        self.inner.observers.insert(id, Arc::clone(&callback));
        callback(self.current().as_ref());

        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.inner.observers.remove(&id).is_some()
    }

    pub(crate) fn publish(&self, connection: Option<Connection>) {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            epoch = connection.as_ref().map(Connection::epoch),
            "Publishing current connection"
        );

        self.inner.current.send_replace(connection.clone());

        let observers: Vec<Observer> = self
            .inner
            .observers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for observer in observers {
            observer(connection.as_ref());
        }
    }
}

impl fmt::Debug for SharedConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedConnectionHandle")
            .field("current", &self.current())
            .field("observers", &self.inner.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn starts_without_connection() {
        let handle = SharedConnectionHandle::new();

        assert!(handle.current().is_none());
        assert_eq!(handle.epoch(), None);
    }

    #[test]
    fn clones_share_the_published_connection() {
        let handle = SharedConnectionHandle::new();
        let reader = handle.clone();

        handle.publish(Some(Connection::open(1)));

        assert_eq!(reader.epoch(), Some(1));
    }

    #[test]
    fn closed_connection_is_never_observed() {
        let handle = SharedConnectionHandle::new();
        let connection = Connection::open(3);

        handle.publish(Some(connection.clone()));
        connection.close();

        assert!(handle.current().is_none());
    }

    #[test]
    fn observers_see_current_value_then_every_change() {
        let handle = SharedConnectionHandle::new();
        handle.publish(Some(Connection::open(1)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = handle.subscribe_to_changes(move |connection| {
            sink.lock().unwrap().push(connection.map(Connection::epoch));
        });

        handle.publish(None);
        handle.publish(Some(Connection::open(2)));
        assert!(handle.unsubscribe(id));
        handle.publish(Some(Connection::open(3)));

        assert_eq!(*seen.lock().unwrap(), vec![Some(1), None, Some(2)]);
        assert!(!handle.unsubscribe(id));
    }

    #[test]
    fn watch_receivers_are_notified() {
        let handle = SharedConnectionHandle::new();
        let mut changes = handle.changes();

        handle.publish(Some(Connection::open(9)));

        assert!(changes.has_changed().unwrap());
        assert_eq!(
            changes.borrow_and_update().as_ref().map(Connection::epoch),
            Some(9)
        );
    }

    #[test]
    fn frames_stop_after_close() {
        let connection = Connection::open(1);
        let mut frames = connection.subscribe();

        connection.deliver(EventFrame::new("a", "1", Utc::now()));
        connection.close();
        connection.deliver(EventFrame::new("a", "2", Utc::now()));

        assert_eq!(frames.try_recv().unwrap().payload, "1");
        assert!(frames.try_recv().is_err());
    }
}
