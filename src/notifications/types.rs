use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type carrying user notifications.
pub const NOTIFICATION_EVENT_TYPE: &str = "notification";

/// A notification pushed by the server.
///
/// Only the timestamp is guaranteed; every other field is kept as-is in [`Self::extra`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// When the server emitted the notification
    pub time: DateTime<Utc>,
    /// Remaining payload fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Notification {
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time,
            extra: Map::new(),
        }
    }

    /// Look up a payload field other than `time`.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.extra.get(field)
    }
}
