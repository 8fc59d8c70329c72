#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, sleep, timeout};

/// How the mock server answers the next `GET /v1/sse`.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Stream everything sent through [`MockSseServer::send`]
    Stream,
    /// Answer with this status and an empty body
    Status(u16),
}

/// Something the mock server observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    /// A client opened the event stream
    Connected,
    /// A client posted the disconnect notice
    Disconnect,
    /// A client closed its event stream socket
    Closed,
}

/// Mock `text/event-stream` server speaking just enough HTTP/1.1 for the client.
pub struct MockSseServer {
    addr: SocketAddr,
    /// Broadcast chunks to every open stream
    chunk_tx: broadcast::Sender<String>,
    /// Bumped to drop every open stream
    drop_tx: watch::Sender<u64>,
    replies: Arc<Mutex<VecDeque<Reply>>>,
    seen: Arc<Mutex<Vec<(Seen, Instant)>>>,
}

impl MockSseServer {
    /// Start a mock server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (chunk_tx, _) = broadcast::channel::<String>(100);
        let (drop_tx, _) = watch::channel(0_u64);
        let replies = Arc::new(Mutex::new(VecDeque::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let server = Self {
            addr,
            chunk_tx: chunk_tx.clone(),
            drop_tx: drop_tx.clone(),
            replies: Arc::clone(&replies),
            seen: Arc::clone(&seen),
        };

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };

                tokio::spawn(serve(
                    socket,
                    chunk_tx.subscribe(),
                    drop_tx.subscribe(),
                    Arc::clone(&replies),
                    Arc::clone(&seen),
                ));
            }
        });

        server
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Answer the next stream requests with these replies, then stream again.
    pub fn reply_with(&self, replies: impl IntoIterator<Item = Reply>) {
        self.replies.lock().unwrap().extend(replies);
    }

    /// Send a raw chunk to every open stream.
    pub fn send(&self, chunk: &str) {
        drop(self.chunk_tx.send(chunk.to_owned()));
    }

    /// Send one `notification` frame to every open stream.
    pub fn send_notification(&self, n: u64) {
        self.send(&format!(
            "event: notification\ndata: {{\"time\":\"2024-01-01T00:00:0{n}Z\",\"n\":{n}}}\n\n"
        ));
    }

    /// Drop every open stream without a goodbye.
    pub fn drop_all(&self) {
        self.drop_tx.send_modify(|generation| *generation += 1);
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(seen, _)| seen.clone())
            .collect()
    }

    pub fn seen_at(&self) -> Vec<(Seen, Instant)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.seen()
            .iter()
            .filter(|seen| **seen == Seen::Connected)
            .count()
    }

    /// Wait until `count` streams were opened.
    pub async fn wait_for_connections(&self, count: usize) {
        timeout(Duration::from_secs(10), async {
            while self.connections() < count {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Wait until the server observed `seen`.
    pub async fn wait_for(&self, seen: Seen) {
        timeout(Duration::from_secs(10), async {
            while !self.seen().contains(&seen) {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}

async fn serve(
    mut socket: TcpStream,
    mut chunks: broadcast::Receiver<String>,
    mut drops: watch::Receiver<u64>,
    replies: Arc<Mutex<VecDeque<Reply>>>,
    seen: Arc<Mutex<Vec<(Seen, Instant)>>>,
) {
    let Some(request_line) = read_request_head(&mut socket).await else {
        return;
    };
    let record = |event: Seen| seen.lock().unwrap().push((event, Instant::now()));

    if request_line.starts_with("POST /v1/sse/disconnect") {
        record(Seen::Disconnect);
        drop(
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await,
        );
        return;
    }

    if !request_line.starts_with("GET /v1/sse") {
        drop(
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await,
        );
        return;
    }

    let reply = replies.lock().unwrap().pop_front().unwrap_or(Reply::Stream);
    if let Reply::Status(status) = reply {
        let head = format!(
            "HTTP/1.1 {status} Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        drop(socket.write_all(head.as_bytes()).await);
        return;
    }

    // Greet with a comment so the client knows the stream is live before any event
    let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n:ok\n\n";
    if socket.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    record(Seen::Connected);

    let mut scratch = [0_u8; 64];
    loop {
        tokio::select! {
            chunk = chunks.recv() => {
                let Ok(chunk) = chunk else { break };
                if socket.write_all(chunk.as_bytes()).await.is_err() {
                    record(Seen::Closed);
                    break;
                }
            }
            read = socket.read(&mut scratch) => {
                // The client never sends a body, so any read completion means it hung up
                if matches!(read, Ok(0) | Err(_)) {
                    record(Seen::Closed);
                    break;
                }
            }
            _ = drops.changed() => break,
        }
    }
}

/// Read the request head and return its request line.
async fn read_request_head(socket: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        match socket.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }

    let head = String::from_utf8(head).ok()?;
    head.lines().next().map(str::to_owned)
}
