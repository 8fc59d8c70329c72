//! In-process transport driven step by step from tests.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;

use super::error::SseError;
use super::traits::{ByteStream, Transport};
use crate::Result;

enum Chunk {
    Bytes(Vec<u8>),
    Fail,
}

enum Step {
    Fail,
    Open {
        chunks: mpsc::UnboundedReceiver<Chunk>,
        closed: Arc<AtomicBool>,
    },
}

/// Transport replaying a script of connection attempts. Once the script runs out every
/// `connect` fails.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    connects: AtomicUsize,
    disconnect_delay: Mutex<Option<Duration>>,
    events: Arc<Mutex<Vec<&'static str>>>,
}

/// Server side of one scripted connection.
pub(crate) struct ScriptedServer {
    chunks: Mutex<Option<mpsc::UnboundedSender<Chunk>>>,
    closed: Arc<AtomicBool>,
}

struct ScriptedStream {
    chunks: mpsc::UnboundedReceiver<Chunk>,
    closed: Arc<AtomicBool>,
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_times(&self, times: usize) {
        let mut steps = self.steps.lock().unwrap();
        steps.extend((0..times).map(|_| Step::Fail));
    }

    pub(crate) fn accept(&self) -> ScriptedServer {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        self.steps.lock().unwrap().push_back(Step::Open {
            chunks: rx,
            closed: Arc::clone(&closed),
        });

        ScriptedServer {
            chunks: Mutex::new(Some(tx)),
            closed,
        }
    }

    pub(crate) fn delay_disconnect(&self, delay: Duration) {
        *self.disconnect_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// `"connect"`, `"disconnect"` and `"closed"` in the order they happened.
    pub(crate) fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> Result<ByteStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.record("connect");

        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Open { chunks, closed }) => Ok(Box::pin(ScriptedStream {
                chunks,
                closed,
                events: Arc::clone(&self.events),
            })),
            Some(Step::Fail) | None => Err(SseError::ConnectionClosed.into()),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let delay = *self.disconnect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record("disconnect");
        Ok(())
    }
}

impl ScriptedServer {
    pub(crate) fn send(&self, chunk: &str) {
        if let Some(tx) = self.chunks.lock().unwrap().as_ref() {
            _ = tx.send(Chunk::Bytes(chunk.as_bytes().to_vec()));
        }
    }

    /// End the body after everything sent so far.
    pub(crate) fn close(&self) {
        self.chunks.lock().unwrap().take();
    }

    /// Fail the body with a transport error after everything sent so far.
    pub(crate) fn fail(&self) {
        if let Some(tx) = self.chunks.lock().unwrap().take() {
            _ = tx.send(Chunk::Fail);
        }
    }

    /// `true` once the client released the connection.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Stream for ScriptedStream {
    type Item = Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.chunks.poll_recv(cx) {
            Poll::Ready(Some(Chunk::Bytes(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(Chunk::Fail)) => {
                Poll::Ready(Some(Err(SseError::ConnectionClosed.into())))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.events.lock().unwrap().push("closed");
    }
}
