use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use http::Method;
use http::header::{HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::client::{AttemptSuccess, Client, RequestParts};
use crate::response::{Response, ResponseStream};
use crate::retry::RetryPolicy;
use crate::transport::{TransportBody, erase_body_stream};
use crate::util::{parse_header_name, parse_header_value};

/// One logical request against the client's base address.
///
/// The body is an opaque payload: bytes, a chunk stream, or an async
/// reader. Streaming bodies are not replayable, so neither the retry policy
/// nor middleware-requested retries can re-attempt them.
pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: Method,
    path: String,
    headers: http::HeaderMap,
    endpoint_headers_only: bool,
    query_pairs: Vec<(String, String)>,
    body: TransportBody,
    timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
    bypass_middleware: bool,
    verbose: bool,
    cancel: Option<CancellationToken>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, path: String) -> Self {
        Self {
            client,
            method,
            path,
            headers: http::HeaderMap::new(),
            endpoint_headers_only: false,
            query_pairs: Vec::new(),
            body: TransportBody::Empty,
            timeout: None,
            retry_policy: None,
            bypass_middleware: false,
            verbose: false,
            cancel: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    /// Skips the client's default headers entirely; only headers declared on
    /// this request are sent.
    pub fn endpoint_headers_only(mut self) -> Self {
        self.endpoint_headers_only = true;
        self
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query_pairs.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = TransportBody::Buffered(body.into());
        self
    }

    pub fn body_stream<S, E>(mut self, stream: S) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.body = TransportBody::Streaming(erase_body_stream(stream));
        self
    }

    pub fn body_reader<R>(self, reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        self.body_stream(ReaderStream::new(reader))
    }

    /// Per-attempt timeout override.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    /// Overrides the client-wide retry policy for this request only.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Sends this request without running any middleware; meant for calls
    /// that must not be intercepted, such as a middleware's own traffic.
    pub fn bypass_middleware(mut self) -> Self {
        self.bypass_middleware = true;
        self
    }

    /// Logs request headers and attempt detail at debug level.
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    /// Attaches a cancellation token; cancelling it settles the request as
    /// a cancelled failure, aborting any in-flight attempt or pending retry
    /// delay.
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn into_parts(self) -> (RequestParts, &'a Client) {
        let parts = RequestParts {
            method: self.method,
            path: self.path,
            headers: self.headers,
            endpoint_headers_only: self.endpoint_headers_only,
            query_pairs: self.query_pairs,
            body: self.body,
            timeout: self.timeout,
            retry_policy: self.retry_policy,
            bypass_middleware: self.bypass_middleware,
            verbose: self.verbose,
            cancel: self.cancel.unwrap_or_default(),
        };
        (parts, self.client)
    }

    pub async fn send(self) -> Result<Response> {
        let (parts, client) = self.into_parts();
        match client.execute(parts, false).await? {
            AttemptSuccess::Buffered(response) => Ok(response),
            AttemptSuccess::Streaming(_) => unreachable!("buffered send returned a stream"),
        }
    }

    pub async fn send_stream(self) -> Result<ResponseStream> {
        let (parts, client) = self.into_parts();
        match client.execute(parts, true).await? {
            AttemptSuccess::Streaming(response) => Ok(response),
            AttemptSuccess::Buffered(_) => unreachable!("streaming send returned a buffer"),
        }
    }

    pub async fn send_json<T>(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self.send().await?;
        response.json()
    }
}
