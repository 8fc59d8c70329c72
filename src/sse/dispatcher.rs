//! Listener registry that follows the shared connection across reconnects.
//!
//! Every registered listener owns a delivery task. Whenever a connection with a new
//! [`Epoch`] is published, each listener subscribes to it exactly once and the delivery task
//! drains epochs strictly in order, so frames reach the listener in receipt order and never
//! from a superseded connection once its successor is being delivered.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_stream::stream;
use dashmap::DashMap;
use futures::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::SseError;
use super::frame::EventFrame;
use super::handle::{Connection, Epoch, ObserverId, SharedConnectionHandle};
use crate::Result;
use crate::error::Error;

/// Event type that matches every frame.
pub const ANY_EVENT_TYPE: &str = "*";

/// Frames buffered for a [`EventDispatcher::stream`] consumer before new ones are dropped.
const STREAM_CAPACITY: usize = 1024;

/// Identifies a listener registered with [`EventDispatcher::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

type Listener = Arc<dyn Fn(&EventFrame) + Send + Sync>;

/// The frames of one epoch handed to a delivery task.
struct Attachment {
    epoch: Epoch,
    frames: broadcast::Receiver<EventFrame>,
    closed: CancellationToken,
}

struct Registration {
    event_type: String,
    /// Highest epoch this listener has been attached to; `0` before the first attachment.
    /// Held while sending, so attachments reach the worker in epoch order.
    attached_epoch: Mutex<Epoch>,
    attachments: mpsc::UnboundedSender<Attachment>,
    worker: JoinHandle<()>,
}

impl Registration {
    /// Attach to `connection` unless this listener already saw its epoch (or a later one).
    fn attach(&self, connection: &Connection) {
        let epoch = connection.epoch();
        let mut attached_epoch = self
            .attached_epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *attached_epoch >= epoch {
            return;
        }
        *attached_epoch = epoch;

        #[cfg(feature = "tracing")]
        tracing::debug!(epoch, event_type = %self.event_type, "Attaching listener");

        _ = self.attachments.send(Attachment {
            epoch,
            frames: connection.subscribe(),
            closed: connection.closed_token(),
        });
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Attaches typed listeners to the live connection, once per connection epoch.
///
/// Listeners are registered once and keep receiving frames across any number of reconnects
/// without re-registering.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    handle: SharedConnectionHandle,
    observer: ObserverId,
    listeners: DashMap<ListenerId, Registration>,
}

impl DispatcherInner {
    fn attach_all(&self, connection: &Connection) {
        for entry in &self.listeners {
            entry.value().attach(connection);
        }
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        self.handle.unsubscribe(self.observer);
    }
}

impl EventDispatcher {
    #[must_use]
    pub fn new(handle: SharedConnectionHandle) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<DispatcherInner>| {
            let weak = weak.clone();
            let observer = handle.subscribe_to_changes(move |connection| {
                if let (Some(inner), Some(connection)) = (weak.upgrade(), connection) {
                    inner.attach_all(connection);
                }
            });

            DispatcherInner {
                handle,
                observer,
                listeners: DashMap::new(),
            }
        });

        Self { inner }
    }

    /// Register `callback` for frames of `event_type` (or [`ANY_EVENT_TYPE`]).
    ///
    /// The listener is attached to the current connection right away, if there is one, and
    /// to every later connection automatically. Must be called within a Tokio runtime.
    pub fn add_listener<F>(&self, event_type: &str, callback: F) -> Result<ListenerId>
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        if event_type.is_empty() {
            return Err(Error::validation("event type cannot be empty"));
        }

        let id = ListenerId(Uuid::new_v4());
        let (attachments, attachment_rx) = mpsc::unbounded_channel();
        let listener: Listener = Arc::new(callback);
        let worker = tokio::spawn(deliver(event_type.to_owned(), attachment_rx, listener));

        self.inner.listeners.insert(
            id,
            Registration {
                event_type: event_type.to_owned(),
                attached_epoch: Mutex::new(0),
                attachments,
                worker,
            },
        );

        if let Some(connection) = self.inner.handle.current()
            && let Some(registration) = self.inner.listeners.get(&id)
        {
            registration.attach(&connection);
        }

        Ok(id)
    }

    /// Register a listener receiving `event_type` payloads decoded as JSON.
    ///
    /// Frames whose payload does not decode as `T` are logged and dropped; they do not
    /// affect the connection or other listeners.
    pub fn add_json_listener<T, F>(&self, event_type: &str, callback: F) -> Result<ListenerId>
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.add_listener(event_type, move |frame| match frame.json::<T>() {
            Ok(value) => callback(value),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, payload = %frame.payload, "Dropping malformed frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        })
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(&id).is_some()
    }

    /// Stream of frames of `event_type`. The listener is removed when the stream is dropped.
    ///
    /// Up to 1024 frames are buffered for a slow consumer; frames arriving while the buffer
    /// is full are dropped and logged.
    pub fn stream(&self, event_type: &str) -> Result<impl Stream<Item = EventFrame> + use<>> {
        let (tx, mut rx) = mpsc::channel(STREAM_CAPACITY);
        let id = self.add_listener(event_type, move |frame| {
            if let Err(TrySendError::Full(frame)) = tx.try_send(frame.clone()) {
                let error = SseError::Lagged { count: 1 };
                #[cfg(feature = "tracing")]
                tracing::warn!(%error, event_type = %frame.event_type, "Stream consumer fell behind");
                #[cfg(not(feature = "tracing"))]
                let _ = (&error, &frame);
            }
        })?;
        let guard = ListenerGuard {
            dispatcher: self.clone(),
            id,
        };

        Ok(stream! {
            let _guard = guard;
            while let Some(frame) = rx.recv().await {
                yield frame;
            }
        })
    }

    /// Get the number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event_types: Vec<String> = self
            .inner
            .listeners
            .iter()
            .map(|entry| entry.value().event_type.clone())
            .collect();

        f.debug_struct("EventDispatcher")
            .field("listeners", &event_types)
            .finish_non_exhaustive()
    }
}

struct ListenerGuard {
    dispatcher: EventDispatcher,
    id: ListenerId,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.dispatcher.remove_listener(self.id);
    }
}

fn wants(event_type: &str, frame: &EventFrame) -> bool {
    event_type == ANY_EVENT_TYPE || frame.event_type == event_type
}

/// Delivery task of one listener: drains each attached epoch to completion, in order.
async fn deliver(
    event_type: String,
    mut attachments: mpsc::UnboundedReceiver<Attachment>,
    listener: Listener,
) {
    while let Some(Attachment {
        epoch,
        mut frames,
        closed,
    }) = attachments.recv().await
    {
        loop {
            tokio::select! {
                biased;

                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        if wants(&event_type, &frame) {
                            listener(&frame);
                        }
                    }
                    Err(RecvError::Lagged(count)) => {
                        let error = SseError::Lagged { count };
                        #[cfg(feature = "tracing")]
                        tracing::warn!(epoch, %error, "Listener fell behind");
                        #[cfg(not(feature = "tracing"))]
                        let _ = (epoch, &error);
                    }
                    Err(RecvError::Closed) => break,
                },

                () = closed.cancelled() => {
                    // Frames received before the close are still delivered
                    loop {
                        match frames.try_recv() {
                            Ok(frame) => {
                                if wants(&event_type, &frame) {
                                    listener(&frame);
                                }
                            }
                            Err(TryRecvError::Lagged(_)) => {}
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(epoch, event_type = %event_type, "Listener detached");
    }
}
