use async_trait::async_trait;
use futures::StreamExt as _;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT,
};
use reqwest::{Client as ReqwestClient, Method};
use secrecy::ExposeSecret as _;
use url::Url;

use super::config::Config;
use super::error::SseError;
use super::traits::{ByteStream, Transport};
use crate::Result;
use crate::error::Error;

/// Path of the event stream, relative to the notifications host.
pub const STREAM_PATH: &str = "/v1/sse";
/// Path of the disconnect notice, relative to the notifications host.
pub const DISCONNECT_PATH: &str = "/v1/sse/disconnect";

const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// [`Transport`] over HTTP: one long-lived `GET` per physical connection and a
/// fire-and-forget `POST` for the disconnect notice.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: ReqwestClient,
    stream_url: Url,
    disconnect_url: Url,
}

impl HttpTransport {
    /// Create a transport for the notifications service at `host`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use notifications_client_sdk::sse::config::Config;
    /// use notifications_client_sdk::sse::http::HttpTransport;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let transport = HttpTransport::new("https://notifications.example.com", &Config::default())?;
    /// assert_eq!(transport.stream_url().path(), "/v1/sse");
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(host: &str, config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();

        headers.insert(USER_AGENT, HeaderValue::from_static("notifications_client_sdk"));
        if let Some(token) = &config.auth_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = ReqwestClient::builder()
            .default_headers(headers)
            .connect_timeout(config.heartbeat_timeout)
            .build()?;

        let host = Url::parse(host)?;

        Ok(Self {
            client,
            stream_url: host.join(STREAM_PATH)?,
            disconnect_url: host.join(DISCONNECT_PATH)?,
        })
    }

    /// Override the event stream path.
    pub fn with_stream_path(mut self, path: &str) -> Result<Self> {
        self.stream_url = self.stream_url.join(path)?;
        Ok(self)
    }

    /// Override the disconnect notice path.
    pub fn with_disconnect_path(mut self, path: &str) -> Result<Self> {
        self.disconnect_url = self.disconnect_url.join(path)?;
        Ok(self)
    }

    #[must_use]
    pub fn stream_url(&self) -> &Url {
        &self.stream_url
    }

    #[must_use]
    pub fn disconnect_url(&self) -> &Url {
        &self.disconnect_url
    }
}

fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(EVENT_STREAM_CONTENT_TYPE))
}

#[async_trait]
impl Transport for HttpTransport {
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip(self), fields(url = %self.stream_url))
    )]
    async fn connect(&self) -> Result<ByteStream> {
        let response = self
            .client
            .get(self.stream_url.clone())
            .header(ACCEPT, EVENT_STREAM_CONTENT_TYPE)
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(SseError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SseError::Status(status).into());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !is_event_stream(content_type) {
            return Err(SseError::UnexpectedContentType(content_type.to_owned()).into());
        }

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| Error::from(SseError::Transport(e)))
        });

        Ok(Box::pin(stream))
    }

    async fn disconnect(&self) -> Result<()> {
        let response = self.client.post(self.disconnect_url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::status(
                status,
                Method::POST,
                self.disconnect_url.path().to_owned(),
                message,
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_derived_from_host() {
        let transport =
            HttpTransport::new("https://notifications.example.com", &Config::default()).unwrap();

        assert_eq!(
            transport.stream_url().as_str(),
            "https://notifications.example.com/v1/sse"
        );
        assert_eq!(
            transport.disconnect_url().as_str(),
            "https://notifications.example.com/v1/sse/disconnect"
        );
    }

    #[test]
    fn paths_can_be_overridden() {
        let transport = HttpTransport::new("http://localhost:4000", &Config::default())
            .and_then(|transport| transport.with_stream_path("/events"))
            .and_then(|transport| transport.with_disconnect_path("/events/leave"))
            .unwrap();

        assert_eq!(transport.stream_url().path(), "/events");
        assert_eq!(transport.disconnect_url().path(), "/events/leave");
    }

    #[test]
    fn invalid_host_is_rejected() {
        HttpTransport::new("not a host", &Config::default()).unwrap_err();
    }

    #[test]
    fn content_type_essence_is_matched() {
        assert!(is_event_stream("text/event-stream"));
        assert!(is_event_stream("Text/Event-Stream; charset=utf-8"));
        assert!(!is_event_stream("application/json"));
        assert!(!is_event_stream(""));
    }
}
