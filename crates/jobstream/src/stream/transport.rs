//! Stream transport.
//!
//! The connection task talks to the server only through [`Transport`], so
//! tests can script connections without a network.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, COOKIE};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::debug;
use url::Url;

use crate::error::{StreamError, TransportError};
use crate::stream::sse::{RawEvent, SseCodec};

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Stream of raw events from one open connection.
///
/// Ends with `None` when the server closes the stream.
pub type EventStream = BoxStream<'static, Result<RawEvent, TransportError>>;

const LAST_EVENT_ID: &str = "Last-Event-ID";
const EVENT_STREAM: &str = "text/event-stream";

/// Credentials attached to each connection request.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    /// No authentication.
    #[default]
    None,
    /// A raw `Cookie` header value, e.g. `session=abc`.
    Cookie(String),
    /// A bearer token for the `Authorization` header.
    Bearer(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Cookie(_) => f.write_str("Cookie(<redacted>)"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

impl Credentials {
    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::None => request,
            Self::Cookie(cookie) => request.header(COOKIE, cookie),
            Self::Bearer(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
        }
    }
}

/// Source of credentials, consulted before every connection attempt so
/// refreshed sessions are picked up on reconnect.
pub trait CredentialProvider: Send + Sync {
    /// Current credentials.
    fn credentials(&self) -> Credentials;
}

impl CredentialProvider for Credentials {
    fn credentials(&self) -> Credentials {
        self.clone()
    }
}

/// Adapts a closure into a [`CredentialProvider`].
pub struct ProviderFn<F>(pub F);

impl<F> CredentialProvider for ProviderFn<F>
where
    F: Fn() -> Credentials + Send + Sync,
{
    fn credentials(&self) -> Credentials {
        (self.0)()
    }
}

impl<P: CredentialProvider + ?Sized> CredentialProvider for Arc<P> {
    fn credentials(&self) -> Credentials {
        (**self).credentials()
    }
}

/// Everything needed to open one connection.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Stream endpoint.
    pub url: Url,
    /// Credentials for this attempt.
    pub credentials: Credentials,
    /// ID of the last event seen, sent so the server can resume.
    pub last_event_id: Option<String>,
}

/// Opens event streams.
pub trait Transport: Send + Sync {
    /// Open a connection and return its event stream.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the connection cannot be established.
    fn open<'a>(&'a self, request: &'a OpenRequest)
    -> BoxFuture<'a, Result<EventStream, TransportError>>;
}

/// Server-sent events over HTTP.
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    max_event_bytes: usize,
}

impl SseTransport {
    /// Create a transport with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StreamError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client))
    }

    /// Create a transport around an existing client.
    ///
    /// The client must not set an overall request timeout, since the
    /// response body stays open for the life of the connection.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            max_event_bytes: super::sse::DEFAULT_MAX_EVENT_BYTES,
        }
    }

    /// Override the per-event size cap.
    #[must_use]
    pub const fn with_max_event_bytes(mut self, max_event_bytes: usize) -> Self {
        self.max_event_bytes = max_event_bytes;
        self
    }
}

impl Transport for SseTransport {
    fn open<'a>(
        &'a self,
        request: &'a OpenRequest,
    ) -> BoxFuture<'a, Result<EventStream, TransportError>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .get(request.url.clone())
                .header(ACCEPT, EVENT_STREAM)
                .header(CACHE_CONTROL, "no-cache");
            builder = request.credentials.apply(builder);
            if let Some(id) = &request.last_event_id {
                builder = builder.header(LAST_EVENT_ID, id);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Status(status.as_u16()));
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if !content_type.starts_with(EVENT_STREAM) {
                return Err(TransportError::ContentType(content_type));
            }

            debug!(url = %request.url, status = status.as_u16(), "event stream opened");

            let body = response.bytes_stream().map_err(io::Error::other);
            let codec = SseCodec::with_max_event_bytes(self.max_event_bytes);
            let events = FramedRead::new(StreamReader::new(body), codec).map_err(|e| {
                if e.kind() == io::ErrorKind::InvalidData {
                    TransportError::Framing(e.to_string())
                } else {
                    TransportError::Body(e.to_string())
                }
            });
            Ok(events.boxed())
        })
    }
}
