//! Transport seam between the request executor and the wire.
//!
//! The executor only ever talks to the [`Transport`] trait; the production
//! implementation rides hyper's pooled legacy client. Tests substitute their
//! own implementations to script outcomes without a network.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyDataStream, BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::client::legacy::Client as PooledClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::error::{BoxError, TransportErrorKind};

/// Boxed stream of body chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, BoxError>> + Send>>;

type WireBody = UnsyncBoxBody<Bytes, BoxError>;
type HttpsConnector = hyper_rustls::HttpsConnector<HttpConnector>;

/// Opaque payload descriptor. Buffered bodies are replayable across retry
/// attempts; streaming bodies are consumed by the first attempt.
pub enum TransportBody {
    Empty,
    Buffered(Bytes),
    Streaming(BodyStream),
}

/// The wire request handed to a transport.
pub struct TransportRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: TransportBody,
}

/// The wire response before any body handling.
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn empty(status: StatusCode, headers: HeaderMap) -> Self {
        Self::chunked(status, headers, Vec::new())
    }

    pub fn buffered(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let chunks = if body.is_empty() { Vec::new() } else { vec![body] };
        Self::chunked(status, headers, chunks)
    }

    pub fn chunked(status: StatusCode, headers: HeaderMap, chunks: Vec<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: Box::pin(ChunkStream {
                chunks: chunks.into(),
            }),
        }
    }
}

/// A transport-level failure, classified for retry gating.
#[derive(Debug)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub source: BoxError,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// Pulls the next chunk off a body stream.
pub async fn next_chunk(body: &mut BodyStream) -> Option<std::result::Result<Bytes, BoxError>> {
    std::future::poll_fn(|cx| body.as_mut().poll_next(cx)).await
}

/// Drains a body stream into one buffer.
pub async fn collect_body(body: &mut BodyStream) -> std::result::Result<Bytes, BoxError> {
    let mut collected = BytesMut::new();
    while let Some(chunk) = next_chunk(body).await {
        collected.extend_from_slice(&chunk?);
    }
    Ok(collected.freeze())
}

/// Boxes an arbitrary chunk stream, erasing its error type.
pub(crate) fn erase_body_stream<S, E>(stream: S) -> BodyStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    Box::pin(ErasedStream {
        inner: Box::pin(stream),
    })
}

struct ChunkStream {
    chunks: VecDeque<Bytes>,
}

impl Stream for ChunkStream {
    type Item = std::result::Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().chunks.pop_front().map(Ok))
    }
}

struct ErasedStream<S> {
    inner: Pin<Box<S>>,
}

impl<S, E> Stream for ErasedStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = std::result::Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(source))) => Poll::Ready(Some(Err(Box::new(source)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct FrameStream {
    inner: BodyStream,
}

impl Stream for FrameStream {
    type Item = std::result::Result<Frame<Bytes>, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(source))) => Poll::Ready(Some(Err(source))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct IncomingStream {
    inner: Pin<Box<BodyDataStream<Incoming>>>,
}

impl Stream for IncomingStream {
    type Item = std::result::Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(source))) => Poll::Ready(Some(Err(Box::new(source)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn wire_body(body: TransportBody) -> WireBody {
    match body {
        TransportBody::Empty => Full::new(Bytes::new())
            .map_err(|never| match never {})
            .boxed_unsync(),
        TransportBody::Buffered(bytes) => Full::new(bytes)
            .map_err(|never| match never {})
            .boxed_unsync(),
        TransportBody::Streaming(stream) => {
            StreamBody::new(FrameStream { inner: stream }).boxed_unsync()
        }
    }
}

/// Production transport over hyper's pooled client with the crate's rustls
/// configuration (HTTP/1.1 and HTTP/2, plain or TLS).
pub struct HyperTransport {
    client: PooledClient<HttpsConnector, WireBody>,
}

impl HyperTransport {
    pub(crate) fn new(
        tls_config: rustls::ClientConfig,
        pool_idle_timeout: Duration,
        pool_max_idle_per_host: usize,
    ) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = PooledClient::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build(connector);
        Self { client }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(
        &self,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let mut wire = Request::builder()
            .method(request.method)
            .uri(request.uri)
            .body(wire_body(request.body))
            .map_err(|source| TransportError {
                kind: TransportErrorKind::Other,
                source: Box::new(source),
            })?;
        *wire.headers_mut() = request.headers;

        let response = self
            .client
            .request(wire)
            .await
            .map_err(|source| TransportError {
                kind: classify_transport_error(&source),
                source: Box::new(source),
            })?;
        let (parts, body) = response.into_parts();
        Ok(TransportResponse {
            status: parts.status,
            headers: parts.headers,
            body: Box::pin(IncomingStream {
                inner: Box::pin(body.into_data_stream()),
            }),
        })
    }
}

fn classify_transport_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    if error.is_connect() {
        let text = error.to_string().to_ascii_lowercase();
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    let text = error.to_string().to_ascii_lowercase();
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Reset;
    }

    TransportErrorKind::Other
}
