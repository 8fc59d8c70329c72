//! Consumer-facing notifications client.
//!
//! [`Client`] ties together the [`crate::sse`] building blocks: one connection manager, one
//! dispatcher and one shutdown notifier per client, shared by every clone of it.

pub mod client;
pub mod types;

pub use client::{Client, Status, current, try_current};
pub use types::{NOTIFICATION_EVENT_TYPE, Notification};
