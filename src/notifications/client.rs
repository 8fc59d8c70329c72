use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::{Stream, StreamExt as _};

use super::types::{NOTIFICATION_EVENT_TYPE, Notification};
use crate::Result;
use crate::sse::config::Config;
use crate::sse::connection::{ConnectionManager, ConnectionState};
use crate::sse::dispatcher::{EventDispatcher, ListenerId};
use crate::sse::frame::EventFrame;
use crate::sse::handle::SharedConnectionHandle;
use crate::sse::http::HttpTransport;
use crate::sse::shutdown::ShutdownNotifier;
use crate::sse::traits::Transport;

tokio::task_local! {
    static CURRENT: Client;
}

/// User-relevant connection status.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    /// A physical connection is open
    Connected,
    /// Opening a connection or waiting to retry after a failure
    Reconnecting,
    /// Not started, stopped or shut down
    Disconnected,
}

impl From<ConnectionState> for Status {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Open { .. } => Self::Connected,
            ConnectionState::Idle | ConnectionState::Closing => Self::Disconnected,
            _ => Self::Reconnecting,
        }
    }
}

/// Notifications client.
///
/// Owns exactly one physical event stream connection, shared by every clone of the client
/// and by every listener and stream created from it. Listeners survive reconnects without
/// being registered again.
///
/// The connection is closed when [`Self::shutdown`] or [`Self::stop`] is called, or at the
/// latest when the last clone is dropped.
///
/// # Examples
///
/// ```rust, no_run
/// use futures::StreamExt as _;
/// use notifications_client_sdk::notifications::Client;
/// use notifications_client_sdk::sse::config::Config;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::new("https://notifications.example.com", Config::default())?;
///     let mut notifications = Box::pin(client.subscribe_notifications()?);
///     client.start();
///
///     while let Some(notification) = notifications.next().await {
///         println!("{}: {:?}", notification.time, notification.extra);
///     }
///
///     client.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connection: ConnectionManager,
    dispatcher: EventDispatcher,
    shutdown: ShutdownNotifier,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.connection.cancel();
    }
}

impl Client {
    /// Create a client for the notifications service at `host`. Nothing connects until
    /// [`Self::start`].
    pub fn new(host: &str, config: Config) -> Result<Self> {
        let transport = HttpTransport::new(host, &config)?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    /// Create a client over a custom [`Transport`].
    #[must_use]
    pub fn with_transport(transport: Arc<dyn Transport>, config: Config) -> Self {
        let connection = ConnectionManager::new(transport, config);
        let dispatcher = EventDispatcher::new(connection.handle().clone());
        let shutdown = ShutdownNotifier::new(connection.clone());

        Self {
            inner: Arc::new(ClientInner {
                connection,
                dispatcher,
                shutdown,
            }),
        }
    }

    /// Open the event stream and keep it open. No-op if already started.
    pub fn start(&self) {
        self.inner.connection.start();
    }

    /// Close the event stream without telling the server. It can be started again.
    pub async fn stop(&self) {
        self.inner.connection.stop().await;
    }

    /// Tell the server this client is leaving, then close the event stream.
    ///
    /// The disconnect notice is sent at most once per client. Teardown waits for its
    /// acknowledgment no longer than [`Config::disconnect_timeout`]. Returns `true` if this
    /// call sent it.
    pub async fn shutdown(&self) -> bool {
        self.inner.shutdown.notify_and_close().await
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.inner.connection.state().into()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    #[must_use]
    pub fn handle(&self) -> &SharedConnectionHandle {
        self.inner.connection.handle()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    /// Stream every notification received from now on, across reconnects.
    ///
    /// Notifications whose payload cannot be decoded are logged and skipped.
    pub fn subscribe_notifications(
        &self,
    ) -> Result<impl Stream<Item = Notification> + use<>> {
        let frames = self.inner.dispatcher.stream(NOTIFICATION_EVENT_TYPE)?;

        Ok(frames.filter_map(|frame| async move {
            match frame.json::<Notification>() {
                Ok(notification) => Some(notification),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Skipping malformed notification");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                    None
                }
            }
        }))
    }

    /// Stream raw frames of `event_type`, or of every type for `"*"`.
    pub fn subscribe_raw(&self, event_type: &str) -> Result<impl Stream<Item = EventFrame> + use<>> {
        self.inner.dispatcher.stream(event_type)
    }

    /// Invoke `callback` for every notification received from now on, across reconnects.
    pub fn on_notification<F>(&self, callback: F) -> Result<ListenerId>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.inner
            .dispatcher
            .add_json_listener(NOTIFICATION_EVENT_TYPE, callback)
    }

    /// Run `future` with this client installed as the current one, see [`current`].
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        CURRENT.scope(self.clone(), future).await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.inner.connection)
            .field("dispatcher", &self.inner.dispatcher)
            .finish_non_exhaustive()
    }
}

/// The client installed by the enclosing [`Client::scope`], if any.
#[must_use]
pub fn try_current() -> Option<Client> {
    CURRENT.try_with(Client::clone).ok()
}

/// The client installed by the enclosing [`Client::scope`].
///
/// # Panics
///
/// Panics when called outside of [`Client::scope`]. Every consumer must share the scoped
/// client rather than open a connection of its own.
#[must_use]
pub fn current() -> Client {
    try_current().unwrap_or_else(|| {
        panic!("notifications client accessed outside of `Client::scope`")
    })
}
