//! Client construction and the request-execution loop.
//!
//! One logical request walks Preparing → Sent → AwaitingResult and loops
//! back through Retrying (policy-driven) or MiddlewareRetrying (post-hook
//! driven) until a terminal success or failure. The transport call and the
//! retry sleep are the only suspension points, and both race the request's
//! cancellation token.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn};

use crate::Result;
use crate::error::{Error, TransportErrorKind};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::middleware::{MiddlewareRegistry, MiddlewareSnapshot, PostHookOutcome, RequestContext};
use crate::request::RequestBuilder;
use crate::response::{Response, ResponseStream};
use crate::retry::RetryPolicy;
use crate::tls::build_tls_config;
use crate::transport::{
    HyperTransport, Transport, TransportBody, TransportRequest, collect_body,
};
use crate::util::{
    Locked, append_query_pairs, merge_headers, parse_header_name, parse_header_value,
    parse_retry_after, resolve_uri, truncate_body, validate_base_url,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
const DEFAULT_MIDDLEWARE_RETRY_LIMIT: usize = 3;
const DEFAULT_CLIENT_NAME: &str = "courier";

/// Client-wide defaults that remain adjustable after construction. Mutation
/// is safe concurrently with in-flight requests; each request snapshots the
/// defaults once when it starts.
#[derive(Clone, Debug)]
struct Defaults {
    headers: HeaderMap,
    query_pairs: Vec<(String, String)>,
    timeout: Duration,
    retry_policy: RetryPolicy,
}

pub struct ClientBuilder {
    base_url: String,
    default_headers: HeaderMap,
    default_query_pairs: Vec<(String, String)>,
    trusted_domains: BTreeSet<String>,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
    middleware_retry_limit: usize,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    client_name: String,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers: HeaderMap::new(),
            default_query_pairs: Vec::new(),
            trusted_domains: BTreeSet::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            middleware_retry_limit: DEFAULT_MIDDLEWARE_RETRY_LIMIT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            transport: None,
        }
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn default_query_pair(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.default_query_pairs.push((name.into(), value.into()));
        self
    }

    /// Adds a host to the TLS trust allowlist: certificate evaluation is
    /// skipped for exactly these hosts, everything else stays on webpki.
    pub fn trusted_domain(mut self, domain: impl Into<String>) -> Self {
        self.trusted_domains.insert(domain.into());
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Hard cap on post-hook-triggered whole-request retries, independent of
    /// the retry policy's budget.
    pub fn middleware_retry_limit(mut self, limit: usize) -> Self {
        self.middleware_retry_limit = limit;
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host.max(1);
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    /// Substitutes the wire transport; used by tests and embedders.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<Client> {
        validate_base_url(&self.base_url)?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(
                build_tls_config(&self.trusted_domains)?,
                self.pool_idle_timeout,
                self.pool_max_idle_per_host,
            )),
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url: self.base_url,
                defaults: Locked::new(Defaults {
                    headers: self.default_headers,
                    query_pairs: self.default_query_pairs,
                    timeout: self.request_timeout,
                    retry_policy: self.retry_policy,
                }),
                trusted_domains: self.trusted_domains,
                middleware: MiddlewareRegistry::new(),
                middleware_retry_limit: self.middleware_retry_limit,
                client_name: self.client_name,
                transport,
                metrics: Metrics::default(),
            }),
        })
    }
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url)
            .field("client_name", &self.inner.client_name)
            .finish_non_exhaustive()
    }
}

struct ClientInner {
    base_url: String,
    defaults: Locked<Defaults>,
    trusted_domains: BTreeSet<String>,
    middleware: MiddlewareRegistry,
    middleware_retry_limit: usize,
    client_name: String,
    transport: Arc<dyn Transport>,
    metrics: Metrics,
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub fn middleware(&self) -> &MiddlewareRegistry {
        &self.inner.middleware
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn trusted_domains(&self) -> &BTreeSet<String> {
        &self.inner.trusted_domains
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn set_default_header(&self, name: HeaderName, value: HeaderValue) {
        self.inner.defaults.write(|defaults| {
            defaults.headers.insert(name, value);
        });
    }

    pub fn try_set_default_header(&self, name: &str, value: &str) -> Result<()> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        self.set_default_header(name, value);
        Ok(())
    }

    pub fn set_request_timeout(&self, request_timeout: Duration) {
        self.inner.defaults.write(|defaults| {
            defaults.timeout = request_timeout.max(Duration::from_millis(1));
        });
    }

    pub fn set_retry_policy(&self, retry_policy: RetryPolicy) {
        self.inner.defaults.write(|defaults| {
            defaults.retry_policy = retry_policy;
        });
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Drives one logical request to a terminal state.
    pub(crate) async fn execute(
        &self,
        parts: RequestParts,
        stream_response: bool,
    ) -> Result<AttemptSuccess> {
        let inner = &self.inner;
        let defaults = inner.defaults.read(Clone::clone);

        let mut combined_query = defaults.query_pairs.clone();
        combined_query.extend(parts.query_pairs);
        let full_path = append_query_pairs(&parts.path, &combined_query);
        let (uri_text, uri) = resolve_uri(&inner.base_url, &full_path)?;
        let match_path = uri.path().to_owned();

        let merged_headers = if parts.endpoint_headers_only {
            parts.headers
        } else {
            merge_headers(&defaults.headers, &parts.headers)
        };
        let retry_policy = parts.retry_policy.unwrap_or(defaults.retry_policy);
        let attempt_timeout = parts
            .timeout
            .unwrap_or(defaults.timeout)
            .max(Duration::from_millis(1));
        let (buffered_body, mut streaming_body) = match parts.body {
            TransportBody::Empty => (None, None),
            TransportBody::Buffered(bytes) => (Some(bytes), None),
            TransportBody::Streaming(stream) => (None, Some(stream)),
        };
        let body_replayable = streaming_body.is_none();
        let method = parts.method;
        let cancel = parts.cancel;

        inner.metrics.record_request_started();
        let mut attempt: usize = 0;
        let mut middleware_retries: usize = 0;
        let result = loop {
            if cancel.is_cancelled() {
                break Err(cancelled_error(&method, &uri_text));
            }

            let span = info_span!(
                "courier.request",
                client = %inner.client_name,
                method = %method,
                uri = %uri_text,
                attempt,
                middleware_retries
            );
            let snapshot = if parts.bypass_middleware {
                MiddlewareSnapshot::default()
            } else {
                inner.middleware.snapshot(&match_path)
            };
            let context = RequestContext::new(
                method.clone(),
                uri_text.clone(),
                match_path.clone(),
                attempt,
                middleware_retries,
            );

            let mut attempt_headers = merged_headers.clone();
            if let Err(source) = snapshot.run_pre_hooks(&context, &mut attempt_headers) {
                break Err(Error::Middleware {
                    method: method.clone(),
                    uri: uri_text.clone(),
                    source,
                });
            }

            span.in_scope(|| {
                if parts.verbose {
                    debug!(headers = ?attempt_headers, "sending request");
                } else {
                    debug!("sending request");
                }
            });

            let attempt_body = match (&buffered_body, streaming_body.take()) {
                (Some(bytes), _) => TransportBody::Buffered(bytes.clone()),
                (None, Some(stream)) => TransportBody::Streaming(stream),
                (None, None) => TransportBody::Empty,
            };
            let outcome = self
                .attempt_once(
                    &method,
                    &uri,
                    &uri_text,
                    &attempt_headers,
                    attempt_body,
                    attempt_timeout,
                    &cancel,
                    stream_response,
                )
                .await;

            let verdict = match &outcome {
                Ok(AttemptSuccess::Buffered(response)) => {
                    snapshot.run_post_hooks(&context, Ok(response))
                }
                Ok(AttemptSuccess::Streaming(response)) => {
                    let view =
                        Response::new(response.status(), response.headers().clone(), Bytes::new());
                    snapshot.run_post_hooks(&context, Ok(&view))
                }
                Err(error) => snapshot.run_post_hooks(&context, Err(error)),
            };

            if verdict == PostHookOutcome::RetryRequest && body_replayable {
                middleware_retries += 1;
                inner.metrics.record_middleware_retry();
                if middleware_retries > inner.middleware_retry_limit {
                    break Err(Error::MiddlewareRetryLimit {
                        limit: inner.middleware_retry_limit,
                        method: method.clone(),
                        uri: uri_text.clone(),
                    });
                }
                span.in_scope(|| {
                    warn!(middleware_retries, "middleware requested whole-request retry");
                });
                continue;
            }

            match outcome {
                Ok(success) => {
                    span.in_scope(|| debug!("request completed"));
                    break Ok(success);
                }
                Err(error) => {
                    if matches!(error, Error::Cancelled { .. }) {
                        break Err(error);
                    }
                    if body_replayable && retry_policy.should_retry(&error, attempt) {
                        let delay = retry_policy.delay_for(attempt, &error);
                        attempt += 1;
                        inner.metrics.record_retry();
                        span.in_scope(|| {
                            warn!(
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "retrying request"
                            );
                        });
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    break Err(cancelled_error(&method, &uri_text));
                                }
                                _ = sleep(delay) => {}
                            }
                        }
                        continue;
                    }
                    break Err(error);
                }
            }
        };

        inner.metrics.record_request_finished(result.is_ok());
        result
    }

    /// One wire attempt: send, classify the outcome, buffer the body where
    /// the mode requires it.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_once(
        &self,
        method: &Method,
        uri: &Uri,
        uri_text: &str,
        headers: &HeaderMap,
        body: TransportBody,
        attempt_timeout: Duration,
        cancel: &CancellationToken,
        stream_response: bool,
    ) -> Result<AttemptSuccess> {
        let request = TransportRequest {
            method: method.clone(),
            uri: uri.clone(),
            headers: headers.clone(),
            body,
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled_error(method, uri_text)),
            outcome = timeout(attempt_timeout, self.inner.transport.send(request)) => {
                match outcome {
                    Ok(Ok(response)) => response,
                    Ok(Err(failure)) => {
                        return Err(Error::Transport {
                            kind: failure.kind,
                            method: method.clone(),
                            uri: uri_text.to_owned(),
                            source: failure.source,
                        });
                    }
                    Err(_) => {
                        return Err(Error::Timeout {
                            timeout_ms: attempt_timeout.as_millis(),
                            method: method.clone(),
                            uri: uri_text.to_owned(),
                        });
                    }
                }
            }
        };

        let status = sent.status;
        let response_headers = sent.headers;
        let mut body_stream = sent.body;

        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = self
                .read_attempt_body(&mut body_stream, attempt_timeout, method, uri_text)
                .await?;
            return Err(Error::RateLimited {
                method: method.clone(),
                uri: uri_text.to_owned(),
                retry_after: parse_retry_after(&response_headers, SystemTime::now()),
                body: truncate_body(&body),
            });
        }
        if !status.is_success() {
            let body = self
                .read_attempt_body(&mut body_stream, attempt_timeout, method, uri_text)
                .await?;
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                method: method.clone(),
                uri: uri_text.to_owned(),
                body: truncate_body(&body),
            });
        }

        if stream_response {
            return Ok(AttemptSuccess::Streaming(ResponseStream::new(
                status,
                response_headers,
                body_stream,
            )));
        }
        let body = self
            .read_attempt_body(&mut body_stream, attempt_timeout, method, uri_text)
            .await?;
        Ok(AttemptSuccess::Buffered(Response::new(
            status,
            response_headers,
            body,
        )))
    }

    async fn read_attempt_body(
        &self,
        body: &mut crate::transport::BodyStream,
        attempt_timeout: Duration,
        method: &Method,
        uri_text: &str,
    ) -> Result<Bytes> {
        match timeout(attempt_timeout, collect_body(body)).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(source)) => Err(Error::Transport {
                kind: TransportErrorKind::Reset,
                method: method.clone(),
                uri: uri_text.to_owned(),
                source,
            }),
            Err(_) => Err(Error::Timeout {
                timeout_ms: attempt_timeout.as_millis(),
                method: method.clone(),
                uri: uri_text.to_owned(),
            }),
        }
    }
}

pub(crate) struct RequestParts {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) headers: HeaderMap,
    pub(crate) endpoint_headers_only: bool,
    pub(crate) query_pairs: Vec<(String, String)>,
    pub(crate) body: TransportBody,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) bypass_middleware: bool,
    pub(crate) verbose: bool,
    pub(crate) cancel: CancellationToken,
}

pub(crate) enum AttemptSuccess {
    Buffered(Response),
    Streaming(ResponseStream),
}

fn cancelled_error(method: &Method, uri: &str) -> Error {
    Error::Cancelled {
        method: method.clone(),
        uri: uri.to_owned(),
    }
}
