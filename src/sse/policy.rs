//! Reconnection decisions as pure functions of the attempt counter.
//!
//! Nothing here performs I/O or reads a clock: callers pass `now` and a random
//! number generator in, which keeps every decision reproducible in tests.

#![expect(
    clippy::float_arithmetic,
    reason = "Exponential growth and jitter are computed on f64 seconds"
)]

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use super::config::ReconnectConfig;

/// Highest relative jitter accepted, keeping delays within `[0.5x, 1.5x]`.
const MAX_JITTER: f64 = 0.5;

/// Capped, jittered exponential backoff.
///
/// [`BackoffSchedule::delay`] is the deterministic schedule: `delay(0)` is the base delay,
/// the sequence never decreases and never exceeds the cap. [`BackoffSchedule::jittered`]
/// spreads a nominal delay over `[(1 - jitter)x, (1 + jitter)x]` and clamps the result back
/// into `[base, max]`, so jitter never breaks the floor or the cap.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSchedule {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl BackoffSchedule {
    #[must_use]
    pub fn new(base: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        let multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, MAX_JITTER)
        } else {
            0.0
        };

        Self {
            base,
            max: max.max(base),
            multiplier,
            jitter,
        }
    }

    /// Deterministic delay for the given attempt index.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let seconds = self.base.as_secs_f64() * self.multiplier.powi(exponent);

        if !seconds.is_finite() || seconds >= self.max.as_secs_f64() {
            return self.max;
        }

        Duration::from_secs_f64(seconds).clamp(self.base, self.max)
    }

    /// [`Self::delay`] with random jitter applied.
    pub fn jittered<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }

        let factor = rng.random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::try_from_secs_f64(nominal.as_secs_f64() * factor)
            .map_or(self.max, |delay| delay.clamp(self.base, self.max))
    }
}

impl From<&ReconnectConfig> for BackoffSchedule {
    fn from(config: &ReconnectConfig) -> Self {
        Self::new(
            config.initial_backoff,
            config.max_backoff,
            config.backoff_multiplier,
            config.jitter,
        )
    }
}

/// What to do after a failed or dropped connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Consecutive failures including the one just observed
    pub attempt: u32,
    /// How long to wait before opening again
    pub delay: Duration,
    /// How long the failed connection had been open, if it ever was
    pub uptime: Option<Duration>,
}

/// Decision object consulted by the connection manager on every failure.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionPolicy {
    schedule: BackoffSchedule,
}

impl ConnectionPolicy {
    #[must_use]
    pub const fn new(schedule: BackoffSchedule) -> Self {
        Self { schedule }
    }

    #[must_use]
    pub const fn schedule(&self) -> &BackoffSchedule {
        &self.schedule
    }

    /// Attempt counter value after a confirmed open.
    #[must_use]
    pub const fn attempts_after_open(&self) -> u32 {
        0
    }

    /// Plan the next retry given the attempt counter before this failure.
    ///
    /// The first retry after a failure waits `delay(0)`, i.e. the base delay.
    pub fn next_retry<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        last_open_at: Option<Instant>,
        now: Instant,
        rng: &mut R,
    ) -> Retry {
        let attempt = attempt.saturating_add(1);

        Retry {
            attempt,
            delay: self.schedule.jittered(attempt - 1, rng),
            uptime: last_open_at.map(|opened| now.saturating_duration_since(opened)),
        }
    }
}

impl From<&ReconnectConfig> for ConnectionPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self::new(config.into())
    }
}
