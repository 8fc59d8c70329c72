#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt as _;
use rand::SeedableRng as _;
use rand::rngs::StdRng;
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;

use super::config::Config;
use super::error::SseError;
use super::frame::{Decoded, ERROR_EVENT_TYPE, FrameDecoder};
use super::handle::{Connection, Epoch, SharedConnectionHandle};
use super::heartbeat::HeartbeatMonitor;
use super::policy::ConnectionPolicy;
use super::traits::{ByteStream, Transport};
use crate::error::Error;

/// Broadcast channel capacity for state transitions.
const TRANSITIONS_CAPACITY: usize = 1024;

/// Connection state tracking.
///
/// `Idle -> Connecting -> Open -> Closing -> Idle`, with the failure path
/// `Connecting | Open -> ReconnectPending -> Connecting`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or stopped
    Idle,
    /// Opening a physical connection
    Connecting {
        /// Consecutive failures since the last successful open
        attempt: u32,
    },
    /// Connection confirmed by its first frame or heartbeat
    Open {
        /// Epoch of the open connection
        epoch: Epoch,
        /// When the connection was confirmed
        since: Instant,
    },
    /// Deliberately closing after [`ConnectionManager::stop`]
    Closing,
    /// Waiting out the backoff delay after a failure
    ReconnectPending {
        /// Consecutive failures since the last successful open
        attempt: u32,
        /// Backoff delay before the next open
        retry_in: Duration,
    },
}

impl ConnectionState {
    /// Check if the connection is currently open.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Consecutive failed attempts; `0` when open or idle.
    #[must_use]
    pub const fn attempt(self) -> u32 {
        match self {
            Self::Connecting { attempt } | Self::ReconnectPending { attempt, .. } => attempt,
            Self::Idle | Self::Open { .. } | Self::Closing => 0,
        }
    }
}

/// How a physical connection ended.
enum Outcome {
    /// [`ConnectionManager::stop`] was called
    Stopped,
    /// Transport error, server close or staleness
    Failed {
        error: Error,
        last_open_at: Option<Instant>,
    },
}

/// Owns the single physical event stream connection: open, close, failure handling and
/// reconnect scheduling.
///
/// All transitions run on one control-loop task, so they are serialized without locks.
/// The loop suspends only while waiting for a backoff delay or for the next body chunk, and
/// both waits are cancelled by [`ConnectionManager::stop`].
///
/// # Example
///
/// ```ignore
/// let manager = ConnectionManager::new(Arc::new(transport), config);
/// manager.start();
///
/// let mut states = manager.state_receiver();
/// while states.changed().await.is_ok() {
///     println!("state: {:?}", *states.borrow());
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    config: Config,
    policy: ConnectionPolicy,
    handle: SharedConnectionHandle,
    /// Watch channel sender for state changes
    state_tx: watch::Sender<ConnectionState>,
    /// Every transition, for observers that must not miss intermediate states
    transitions_tx: broadcast::Sender<ConnectionState>,
    /// Last epoch handed out; epochs keep increasing across stop/start
    epoch: AtomicU64,
    /// Control loop, present from `start` until the `stop` that ends it returns
    running: Mutex<Option<Running>>,
    /// Serializes concurrent `stop` calls
    stopping: AsyncMutex<()>,
}

/// One control loop. A loop started while its predecessor is still stopping waits for
/// `done` of that predecessor before making its first transition.
#[derive(Clone)]
struct Running {
    /// Cancelled by `stop` or `cancel`
    token: CancellationToken,
    /// Cancelled once the loop has made its final transition
    done: CancellationToken,
}

impl Running {
    fn is_live(&self) -> bool {
        !self.token.is_cancelled() && !self.done.is_cancelled()
    }
}

impl ConnectionManager {
    /// Create an idle connection manager. Nothing is opened until [`Self::start`].
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (transitions_tx, _) = broadcast::channel(TRANSITIONS_CAPACITY);

        Self {
            inner: Arc::new(ManagerInner {
                transport,
                policy: ConnectionPolicy::from(&config.reconnect),
                config,
                handle: SharedConnectionHandle::new(),
                state_tx,
                transitions_tx,
                epoch: AtomicU64::new(0),
                running: Mutex::new(None),
                stopping: AsyncMutex::new(()),
            }),
        }
    }

    /// Start the control loop. No-op while it is already running (connecting, open or
    /// waiting to reconnect). Must be called within a Tokio runtime.
    ///
    /// Calling this while a [`Self::stop`] is in progress starts a new loop that only begins
    /// once the stopping one has closed its connection and gone `Idle`.
    pub fn start(&self) {
        // We can recover from a poisoned lock because the slot is replaced atomically.
        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if running.as_ref().is_some_and(Running::is_live) {
            return;
        }

        let predecessor = running.as_ref().map(|r| r.done.clone());
        let next = Running {
            token: CancellationToken::new(),
            done: CancellationToken::new(),
        };

        let inner = Arc::clone(&self.inner);
        let token = next.token.clone();
        let done = next.done.clone().drop_guard();
        tokio::spawn(async move {
            let _done = done;
            if let Some(predecessor) = predecessor {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = predecessor.cancelled() => {}
                }
            }
            inner.connection_loop(token).await;
        });

        *running = Some(next);
    }

    /// Stop the control loop and close the physical connection.
    ///
    /// Cancels a pending reconnect timer or an in-flight read. Unless [`Self::start`] was
    /// called meanwhile, when this returns no physical connection exists, the handle is
    /// empty and the state is [`ConnectionState::Idle`]. Idempotent.
    pub async fn stop(&self) {
        let _serialized = self.inner.stopping.lock().await;

        let Some(stopping) = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };

        stopping.token.cancel();
        stopping.done.cancelled().await;

        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // A `start` during the wait installed a successor that now owns the handle and state
        if running.as_ref().is_some_and(|r| r.done.is_cancelled()) {
            *running = None;

            if self.inner.handle.current().is_some() {
                self.inner.handle.publish(None);
            }
            if *self.inner.state_tx.borrow() != ConnectionState::Idle {
                self.inner.set_state(ConnectionState::Idle);
            }
        }
    }

    /// Cancel the control loop without waiting for it to finish.
    pub(crate) fn cancel(&self) {
        if let Some(running) = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            running.token.cancel();
        }
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    ///
    /// Intermediate states may be coalesced; use [`Self::transitions`] to see every one.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Receive every state transition from now on.
    #[must_use]
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.transitions_tx.subscribe()
    }

    /// The shared handle this manager publishes connections into.
    #[must_use]
    pub fn handle(&self) -> &SharedConnectionHandle {
        &self.inner.handle
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ManagerInner {
    fn set_state(&self, state: ConnectionState) {
        #[cfg(feature = "tracing")]
        tracing::debug!(?state, "Connection state changed");

        self.state_tx.send_replace(state);
        // No receivers just means nobody is observing transitions
        _ = self.transitions_tx.send(state);
    }

    /// Main connection loop with automatic reconnection.
    async fn connection_loop(self: Arc<Self>, token: CancellationToken) {
        let mut attempt = 0_u32;
        let mut rng = StdRng::from_os_rng();

        loop {
            self.set_state(ConnectionState::Connecting { attempt });

            let outcome = tokio::select! {
                () = token.cancelled() => break,
                result = timeout(self.config.heartbeat_timeout, self.transport.connect()) => {
                    match result {
                        Ok(Ok(stream)) => self.drive(stream, &token, &mut attempt).await,
                        Ok(Err(error)) => Outcome::Failed { error, last_open_at: None },
                        Err(_elapsed) => Outcome::Failed {
                            error: SseError::Stale { window: self.config.heartbeat_timeout }.into(),
                            last_open_at: None,
                        },
                    }
                }
            };

            let last_open_at = match outcome {
                Outcome::Stopped => break,
                Outcome::Failed {
                    error,
                    last_open_at,
                } => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%error, attempt, "Event stream connection failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &error;
                    last_open_at
                }
            };

            let retry = self
                .policy
                .next_retry(attempt, last_open_at, Instant::now(), &mut rng);
            attempt = retry.attempt;

            #[cfg(feature = "tracing")]
            tracing::debug!(
                attempt,
                delay = ?retry.delay,
                uptime = ?retry.uptime,
                "Scheduling reconnect"
            );

            self.set_state(ConnectionState::ReconnectPending {
                attempt,
                retry_in: retry.delay,
            });

            tokio::select! {
                () = token.cancelled() => break,
                () = sleep(retry.delay) => {}
            }
        }

        self.set_state(ConnectionState::Idle);
    }

    /// Read one physical connection until it fails or the loop is cancelled.
    async fn drive(
        &self,
        mut stream: ByteStream,
        token: &CancellationToken,
        attempt: &mut u32,
    ) -> Outcome {
        let window = self.config.heartbeat_timeout;
        let mut decoder = FrameDecoder::new();
        let mut heartbeat = HeartbeatMonitor::new(window, Instant::now());
        let mut connection: Option<Connection> = None;
        let mut last_open_at = None;

        let error: Error = loop {
            tokio::select! {
                biased;

                () = token.cancelled() => {
                    self.set_state(ConnectionState::Closing);
                    self.withdraw(connection.take());
                    return Outcome::Stopped;
                }

                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let now = Instant::now();
                        let mut server_error = None;

                        for item in decoder.decode(&bytes) {
                            heartbeat.record_frame(now);

                            if connection.is_none() {
                                *attempt = self.policy.attempts_after_open();
                                last_open_at = Some(now);
                            }
                            let live = connection.get_or_insert_with(|| self.confirm_open(now));

                            match item {
                                Decoded::Heartbeat => {
                                    #[cfg(feature = "tracing")]
                                    tracing::trace!(epoch = live.epoch(), "Heartbeat received");
                                }
                                Decoded::Frame(frame) if frame.event_type == ERROR_EVENT_TYPE => {
                                    server_error = Some(frame.payload.clone());
                                    live.deliver(frame);
                                    break;
                                }
                                Decoded::Frame(frame) => {
                                    #[cfg(feature = "tracing")]
                                    tracing::trace!(
                                        epoch = live.epoch(),
                                        event_type = %frame.event_type,
                                        "Frame received"
                                    );
                                    live.deliver(frame);
                                }
                            }
                        }

                        if let Some(message) = server_error {
                            break SseError::Server(message).into();
                        }
                    }
                    Some(Err(e)) => break e,
                    None => break SseError::ConnectionClosed.into(),
                },

                () = sleep_until(heartbeat.deadline()) => {
                    if heartbeat.is_stale(Instant::now()) {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(?window, "Heartbeat timeout, connection considered dead");
                        break SseError::Stale { window }.into();
                    }
                }
            }
        };

        self.withdraw(connection.take());
        drop(stream);

        Outcome::Failed {
            error,
            last_open_at,
        }
    }

    /// Transition into `Open` with a fresh epoch and publish the connection.
    fn confirm_open(&self, now: Instant) -> Connection {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Connection::open(epoch);

        // Listeners attach during publication, before the first frame is delivered
        self.handle.publish(Some(connection.clone()));
        self.set_state(ConnectionState::Open { epoch, since: now });

        connection
    }

    /// Clear the handle, then close the connection, so nobody observes it mid-close.
    fn withdraw(&self, connection: Option<Connection>) {
        if let Some(connection) = connection {
            self.handle.publish(None);
            connection.close();
        }
    }
}
