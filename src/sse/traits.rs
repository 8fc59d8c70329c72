//! Core traits for the event stream infrastructure.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

/// Raw body chunks of one physical connection, in arrival order.
///
/// An `Err` item or the end of the stream both mean the connection is gone.
pub type ByteStream = Pin<Box<dyn Stream<Item = crate::Result<Vec<u8>>> + Send>>;

/// How the [`super::ConnectionManager`] reaches the server.
///
/// [`super::http::HttpTransport`] speaks HTTP; tests substitute scripted implementations to
/// drive the connection state machine without a network.
///
/// # Example
///
/// ```ignore
/// pub struct Replay(Vec<u8>);
///
/// #[async_trait]
/// impl Transport for Replay {
///     async fn connect(&self) -> crate::Result<ByteStream> {
///         let body = self.0.clone();
///         Ok(Box::pin(futures::stream::once(async move { Ok(body) })))
///     }
///
///     async fn disconnect(&self) -> crate::Result<()> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open one physical connection.
    ///
    /// Returning `Ok` only means the server accepted the request; the connection counts as
    /// open once the first frame or heartbeat is decoded from the stream.
    async fn connect(&self) -> crate::Result<ByteStream>;

    /// Tell the server this client is leaving. Best-effort and idempotent.
    async fn disconnect(&self) -> crate::Result<()>;
}
