#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;

/// Event stream error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum SseError {
    /// Error connecting to or reading from the event stream server
    Transport(reqwest::Error),
    /// Server answered the stream request with a non-2xx status
    Status(StatusCode),
    /// Server answered with something other than `text/event-stream`
    UnexpectedContentType(String),
    /// Server closed the event stream
    ConnectionClosed,
    /// Server reported a failure with an `error` event
    Server(String),
    /// Nothing, not even a heartbeat comment, arrived within the timeout window
    Stale {
        /// The configured heartbeat timeout window
        window: Duration,
    },
    /// A frame payload could not be decoded
    MalformedFrame {
        /// Event type of the offending frame
        event_type: String,
        /// Underlying decoding error
        source: serde_json::Error,
    },
    /// A listener fell behind and missed frames
    Lagged {
        /// Number of frames that were missed
        count: u64,
    },
}

impl fmt::Display for SseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "event stream transport error: {e}"),
            Self::Status(status) => write!(f, "event stream request failed with status {status}"),
            Self::UnexpectedContentType(content_type) => {
                write!(f, "expected text/event-stream, got {content_type}")
            }
            Self::ConnectionClosed => write!(f, "event stream closed by server"),
            Self::Server(message) => write!(f, "server reported an error: {message}"),
            Self::Stale { window } => {
                write!(f, "no frame or heartbeat received within {window:?}")
            }
            Self::MalformedFrame { event_type, source } => {
                write!(f, "malformed `{event_type}` frame: {source}")
            }
            Self::Lagged { count } => write!(f, "listener lagged, missed {count} frames"),
        }
    }
}

impl StdError for SseError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::MalformedFrame { source, .. } => Some(source),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<SseError> for crate::error::Error {
    fn from(e: SseError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Stream, e)
    }
}
