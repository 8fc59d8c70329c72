use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::timeout;

use super::connection::{ConnectionManager, ConnectionState};

/// Tells the server this client is leaving, then closes the connection.
///
/// The notice goes out at most once per notifier and always before the physical connection
/// is closed, so the server attributes the close to a deliberate leave rather than a network
/// failure. Delivery is best-effort: the request is dispatched on its own task, teardown
/// waits for it at most [`super::config::Config::disconnect_timeout`], and neither a slow
/// acknowledgment nor a failure prevents the close.
#[derive(Debug)]
pub struct ShutdownNotifier {
    manager: ConnectionManager,
    sent: AtomicBool,
}

impl ShutdownNotifier {
    #[must_use]
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            sent: AtomicBool::new(false),
        }
    }

    /// Send the disconnect notice (first call only), then stop the connection manager.
    ///
    /// Returns `true` if this call sent the notice. Nothing is sent when the manager never
    /// started or is already idle.
    pub async fn notify_and_close(&self) -> bool {
        if self.manager.state() == ConnectionState::Idle {
            self.manager.stop().await;
            return false;
        }

        if self.sent.swap(true, Ordering::SeqCst) {
            self.manager.stop().await;
            return false;
        }

        let window = self.manager.config().disconnect_timeout;
        let transport = Arc::clone(self.manager.transport());
        let notice = tokio::spawn(async move { transport.disconnect().await });

        match timeout(window, notice).await {
            Ok(Ok(Ok(()))) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Disconnect notice sent");
            }
            Ok(Ok(Err(e))) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Failed to send disconnect notice");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
            Ok(Err(e)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Disconnect notice task failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
            Err(_elapsed) => {
                // The request stays in flight; only its acknowledgment is not awaited
                #[cfg(feature = "tracing")]
                tracing::debug!(?window, "Closing without disconnect acknowledgment");
            }
        }

        self.manager.stop().await;
        true
    }

    /// `true` once the disconnect notice was attempted.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }
}
