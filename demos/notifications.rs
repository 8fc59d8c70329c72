//! Follow the notifications stream and print every notification and status change.
//!
//! ```sh
//! NOTIFICATIONS_HOST=https://notifications.example.com NOTIFICATIONS_TOKEN=... \
//!     RUST_LOG=info,notifications_client_sdk=debug cargo run --example notifications --features tracing
//! ```
//!
//! Press Ctrl-C to leave; the disconnect notice is sent before the connection closes.

use std::fs::File;

use futures::StreamExt as _;
use notifications_client_sdk::notifications::{Client, Status};
use notifications_client_sdk::sse::config::Config;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let host = std::env::var("NOTIFICATIONS_HOST")
        .unwrap_or_else(|_| "http://localhost:4000".to_owned());
    let config = match std::env::var("NOTIFICATIONS_TOKEN") {
        Ok(token) => Config::builder().auth_token(token).build(),
        Err(_) => Config::default(),
    };

    let client = Client::new(&host, config)?;
    let mut notifications = Box::pin(client.subscribe_notifications()?);
    let mut states = client.connection().state_receiver();
    client.start();

    let mut status = Status::Disconnected;
    loop {
        tokio::select! {
            Some(notification) = notifications.next() => {
                info!(time = %notification.time, fields = ?notification.extra, "notification");
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = Status::from(*states.borrow_and_update());
                if current != status {
                    info!(from = %status, to = %current, "status changed");
                    status = current;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("leaving");
                break;
            }
        }
    }

    if !client.shutdown().await {
        warn!("disconnect notice was not sent");
    }

    Ok(())
}
