#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use bon::Builder;
use secrecy::SecretString;

const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(45);
const DEFAULT_DISCONNECT_TIMEOUT_DURATION: Duration = Duration::from_millis(250);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_JITTER: f64 = 0.5;

/// Configuration for event stream client behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Maximum silence (no frame and no heartbeat comment) before the connection is
    /// considered dead. Servers are expected to send a keep-alive every 15-30 seconds.
    #[builder(default = DEFAULT_HEARTBEAT_TIMEOUT_DURATION)]
    pub heartbeat_timeout: Duration,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// How long teardown waits for the disconnect notice to be acknowledged before closing
    /// anyway. The notice request itself is always dispatched before the close and keeps
    /// running in the background if its acknowledgment is slower than this.
    #[builder(default = DEFAULT_DISCONNECT_TIMEOUT_DURATION)]
    pub disconnect_timeout: Duration,
    /// Bearer token sent with the stream request and the disconnect notice
    #[builder(into)]
    pub auth_token: Option<SecretString>,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for automatic reconnection behavior.
///
/// Reconnection never gives up: failures only grow the delay up to `max_backoff`.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry, and the floor for every later one
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Relative jitter applied to each delay; `0.5` spreads delays over `[0.5x, 1.5x]`
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}
