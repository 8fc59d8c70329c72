//! `text/event-stream` framing.
//!
//! The decoder is fed raw body chunks as they arrive and yields complete items. Lines may be
//! split across chunks at any byte, including inside a multi-byte UTF-8 sequence or between
//! the `\r` and `\n` of a line ending.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use super::error::SseError;

/// Event type of a frame that carries no `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";
/// Event type the server uses to report a failure on the stream.
pub const ERROR_EVENT_TYPE: &str = "error";

/// One received event. Immutable once decoded.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    /// Value of the `event:` field, or [`DEFAULT_EVENT_TYPE`]
    pub event_type: String,
    /// `data:` lines joined with `\n`
    pub payload: String,
    /// When the frame was fully decoded
    pub received_at: DateTime<Utc>,
}

impl EventFrame {
    #[must_use]
    pub fn new<T: Into<String>, P: Into<String>>(
        event_type: T,
        payload: P,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload: payload.into(),
            received_at,
        }
    }

    #[must_use]
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SseError> {
        serde_json::from_str(&self.payload).map_err(|source| SseError::MalformedFrame {
            event_type: self.event_type.clone(),
            source,
        })
    }
}

/// Item produced by the [`FrameDecoder`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A `:` comment line, used by servers as keep-alive
    Heartbeat,
    /// A complete event
    Frame(EventFrame),
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    line: Vec<u8>,
    /// Previous chunk ended in `\r`; a leading `\n` in the next chunk belongs to it.
    pending_cr: bool,
    event_type: Option<String>,
    data: Option<String>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a body chunk, returning every item completed by it.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        let mut decoded = Vec::new();

        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }

            match byte {
                b'\n' => self.end_line(&mut decoded),
                b'\r' => {
                    self.pending_cr = true;
                    self.end_line(&mut decoded);
                }
                _ => self.line.push(byte),
            }
        }

        decoded
    }

    fn end_line(&mut self, decoded: &mut Vec<Decoded>) {
        let raw = std::mem::take(&mut self.line);
        let line = String::from_utf8_lossy(&raw);

        if line.is_empty() {
            self.dispatch(decoded);
            return;
        }

        if line.starts_with(':') {
            decoded.push(Decoded::Heartbeat);
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (&*line, ""),
        };

        match field {
            "event" => self.event_type = Some(value.to_owned()),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_owned()),
            },
            // `id`, `retry` and unknown fields carry nothing this client acts on
            _ => {}
        }
    }

    fn dispatch(&mut self, decoded: &mut Vec<Decoded>) {
        let event_type = self.event_type.take();
        let Some(payload) = self.data.take() else {
            return;
        };

        let event_type = event_type
            .filter(|event_type| !event_type.is_empty())
            .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_owned());

        decoded.push(Decoded::Frame(EventFrame {
            event_type,
            payload,
            received_at: Utc::now(),
        }));
    }
}
