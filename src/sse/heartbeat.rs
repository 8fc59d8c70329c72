use std::time::Duration;

use tokio::time::Instant;

/// Tracks the time since the last received frame or heartbeat comment.
///
/// The monitor only reports staleness. Closing the connection and scheduling a retry is
/// left to the [`super::ConnectionManager`].
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitor {
    last_frame_at: Instant,
    timeout_window: Duration,
}

impl HeartbeatMonitor {
    /// Start monitoring, treating `now` as the last time something was received.
    #[must_use]
    pub const fn new(timeout_window: Duration, now: Instant) -> Self {
        Self {
            last_frame_at: now,
            timeout_window,
        }
    }

    /// Record a data frame or a protocol keep-alive.
    pub fn record_frame(&mut self, now: Instant) {
        if now > self.last_frame_at {
            self.last_frame_at = now;
        }
    }

    /// `true` once more than the timeout window has elapsed without anything received.
    #[must_use]
    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_frame_at) > self.timeout_window
    }

    /// Earliest instant at which [`Self::is_stale`] is `true`.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.last_frame_at + self.timeout_window + Duration::from_nanos(1)
    }

    #[must_use]
    pub const fn last_frame_at(&self) -> Instant {
        self.last_frame_at
    }

    #[must_use]
    pub const fn timeout_window(&self) -> Duration {
        self.timeout_window
    }
}
