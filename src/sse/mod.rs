//! Core server-sent events infrastructure.
//!
//! This module keeps a single logical event stream alive over a series of physical
//! connections, and routes every decoded frame to the listeners registered for its type.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: Owns the physical connection, its heartbeat and reconnection
//! - [`SharedConnectionHandle`]: Observable view of the current connection, if any
//! - [`EventDispatcher`]: Routes frames to listeners and re-attaches them on every reconnect
//! - [`ShutdownNotifier`]: Sends the disconnect notice before the connection is closed
//! - [`Transport`]: How the manager reaches the server
//!
//! # Example
//!
//! ```ignore
//! let transport = HttpTransport::new(host, &config)?;
//! let manager = ConnectionManager::new(Arc::new(transport), config);
//! let dispatcher = EventDispatcher::new(manager.handle().clone());
//!
//! dispatcher.add_listener("notification", |frame| println!("{}", frame.payload))?;
//! manager.start();
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod handle;
pub mod heartbeat;
pub mod http;
pub mod policy;
pub mod shutdown;
#[cfg(test)]
pub(crate) mod test_support;
pub mod traits;

pub use connection::{ConnectionManager, ConnectionState};
pub use dispatcher::EventDispatcher;
#[expect(
    clippy::module_name_repetitions,
    reason = "SseError includes module name for clarity when used outside this module"
)]
pub use error::SseError;
pub use frame::EventFrame;
pub use handle::{Connection, SharedConnectionHandle};
pub use shutdown::ShutdownNotifier;
pub use traits::*;
