//! Executor behavior driven through a scripted in-memory transport:
//! retry gating, middleware ordering and loop guards, cancellation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier::{
    CancellationToken, Client, Error, ErrorCode, Middleware, PathPattern, PostHookOutcome,
    RequestContext, Response, RetryConditions, RetryPolicy, Transport, TransportError,
    TransportErrorKind, TransportRequest, TransportResponse,
};
use http::{HeaderMap, StatusCode};

enum Scripted {
    Status(u16),
    StatusWithHeaders(u16, Vec<(&'static str, &'static str)>),
    Body(u16, &'static [u8]),
    Failure(TransportErrorKind),
    Hang,
}

struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
    seen_headers: Mutex<Vec<HeaderMap>>,
}

impl MockTransport {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            seen_headers: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn header_values(&self, name: &str) -> Vec<Option<String>> {
        self.seen_headers
            .lock()
            .expect("seen_headers lock")
            .iter()
            .map(|headers| {
                headers
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .map(ToOwned::to_owned)
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_headers
            .lock()
            .expect("seen_headers lock")
            .push(request.headers.clone());
        let next = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Scripted::Status(200));
        match next {
            Scripted::Status(code) => Ok(TransportResponse::empty(
                StatusCode::from_u16(code).expect("valid status"),
                HeaderMap::new(),
            )),
            Scripted::StatusWithHeaders(code, pairs) => {
                let mut headers = HeaderMap::new();
                for (name, value) in pairs {
                    headers.insert(name, value.parse().expect("valid header value"));
                }
                Ok(TransportResponse::empty(
                    StatusCode::from_u16(code).expect("valid status"),
                    headers,
                ))
            }
            Scripted::Body(code, body) => Ok(TransportResponse::buffered(
                StatusCode::from_u16(code).expect("valid status"),
                HeaderMap::new(),
                bytes::Bytes::from_static(body),
            )),
            Scripted::Failure(kind) => Err(TransportError {
                kind,
                source: "scripted transport failure".into(),
            }),
            Scripted::Hang => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                unreachable!("hung attempt should be cut off by timeout or cancel")
            }
        }
    }
}

fn client_with(transport: Arc<MockTransport>, retry_policy: RetryPolicy) -> Client {
    Client::builder("http://mock.test")
        .transport(transport)
        .retry_policy(retry_policy)
        .build()
        .expect("client should build")
}

struct AlwaysRetry;

impl Middleware for AlwaysRetry {
    fn after_attempt(
        &self,
        _context: &RequestContext,
        _outcome: Result<&Response, &Error>,
    ) -> PostHookOutcome {
        PostHookOutcome::RetryRequest
    }
}

struct RetryOnSuccess;

impl Middleware for RetryOnSuccess {
    fn after_attempt(
        &self,
        _context: &RequestContext,
        outcome: Result<&Response, &Error>,
    ) -> PostHookOutcome {
        if outcome.is_ok() {
            PostHookOutcome::RetryRequest
        } else {
            PostHookOutcome::Continue
        }
    }
}

struct OrderTagger {
    value: &'static str,
}

impl Middleware for OrderTagger {
    fn before_request(
        &self,
        _context: &RequestContext,
        headers: &mut HeaderMap,
    ) -> Result<(), courier::BoxError> {
        let merged = match headers.get("x-order") {
            Some(existing) => format!("{},{}", existing.to_str()?, self.value),
            None => self.value.to_owned(),
        };
        headers.insert("x-order", merged.parse()?);
        Ok(())
    }
}

struct FailingPreHook;

impl Middleware for FailingPreHook {
    fn before_request(
        &self,
        _context: &RequestContext,
        _headers: &mut HeaderMap,
    ) -> Result<(), courier::BoxError> {
        Err("credentials unavailable".into())
    }
}

#[tokio::test]
async fn successful_request_decodes_json() {
    let transport = MockTransport::new(vec![Scripted::Body(200, br#"{"id":"abc"}"#)]);
    let client = client_with(transport.clone(), RetryPolicy::none());

    #[derive(serde::Deserialize)]
    struct Item {
        id: String,
    }
    let item: Item = client
        .get("/v1/items/abc")
        .send_json()
        .await
        .expect("request should succeed");
    assert_eq!(item.id, "abc");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let transport = MockTransport::new(vec![
        Scripted::Status(500),
        Scripted::Status(502),
        Scripted::Body(200, b"done"),
    ]);
    let client = client_with(transport.clone(), RetryPolicy::immediate(3));

    let response = client
        .get("/v1/flaky")
        .send()
        .await
        .expect("request should eventually succeed");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"done");
    assert_eq!(transport.calls(), 3);
    assert_eq!(client.metrics_snapshot().retries, 2);
}

#[tokio::test]
async fn transport_failures_are_retried_per_condition() {
    let transport = MockTransport::new(vec![
        Scripted::Failure(TransportErrorKind::Reset),
        Scripted::Body(200, b"ok"),
    ]);
    let client = client_with(transport.clone(), RetryPolicy::immediate(2));

    client
        .get("/v1/reset")
        .send()
        .await
        .expect("reset should be retried");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn conditions_outside_policy_are_terminal() {
    let transport = MockTransport::new(vec![Scripted::Status(500)]);
    let client = client_with(
        transport.clone(),
        RetryPolicy::immediate(3).conditions(RetryConditions::TIMEOUT),
    );

    let error = client
        .get("/v1/unlucky")
        .send()
        .await
        .expect_err("500 should be terminal for a timeout-only policy");
    assert_eq!(error.code(), ErrorCode::HttpStatus);
    assert_eq!(error.status(), Some(500));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn per_request_policy_overrides_client_default() {
    let transport = MockTransport::new(vec![Scripted::Status(500), Scripted::Status(200)]);
    let client = client_with(transport.clone(), RetryPolicy::none());

    client
        .get("/v1/override")
        .retry_policy(RetryPolicy::immediate(1))
        .send()
        .await
        .expect("per-request policy should retry once");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn zero_max_retries_never_retries() {
    let transport = MockTransport::new(vec![Scripted::Status(500)]);
    let client = client_with(transport.clone(), RetryPolicy::immediate(0));

    client
        .get("/v1/once")
        .send()
        .await
        .expect_err("request should fail without retry");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn middleware_retry_loop_guard_terminates_at_cap() {
    let transport = MockTransport::new(Vec::new());
    let client = Client::builder("http://mock.test")
        .transport(transport.clone())
        .retry_policy(RetryPolicy::none())
        .middleware_retry_limit(2)
        .build()
        .expect("client should build");
    client
        .middleware()
        .register(PathPattern::contains("/"), Arc::new(AlwaysRetry));

    let error = client
        .get("/v1/loop")
        .send()
        .await
        .expect_err("endless middleware retries must terminate");
    match error {
        Error::MiddlewareRetryLimit { limit, .. } => assert_eq!(limit, 2),
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn middleware_and_policy_counters_are_independent() {
    let transport = MockTransport::new(vec![
        Scripted::Status(500),
        Scripted::Status(500),
        Scripted::Status(200),
        Scripted::Status(200),
    ]);
    let client = Client::builder("http://mock.test")
        .transport(transport.clone())
        .retry_policy(RetryPolicy::immediate(2))
        .middleware_retry_limit(1)
        .build()
        .expect("client should build");
    client
        .middleware()
        .register(PathPattern::contains("/"), Arc::new(RetryOnSuccess));

    let error = client
        .get("/v1/both")
        .send()
        .await
        .expect_err("middleware cap should terminate the request");
    assert_eq!(error.code(), ErrorCode::MiddlewareRetryLimit);
    // two policy retries for the 500s, then the middleware cap on the 200s
    assert_eq!(transport.calls(), 4);
    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.middleware_retries, 2);
}

#[tokio::test]
async fn cancellation_during_backoff_prevents_further_attempts() {
    let transport = MockTransport::new(vec![Scripted::Status(500)]);
    let client = client_with(
        transport.clone(),
        RetryPolicy::linear(3).base_delay(Duration::from_secs(5)),
    );

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let error = client
        .get("/v1/backoff")
        .cancellation(token)
        .send()
        .await
        .expect_err("cancelled request should fail");
    assert_eq!(error.code(), ErrorCode::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn cancellation_aborts_inflight_attempt() {
    let transport = MockTransport::new(vec![Scripted::Hang]);
    let client = client_with(transport.clone(), RetryPolicy::none());

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let error = client
        .get("/v1/hang")
        .timeout(Duration::from_secs(60))
        .cancellation(token)
        .send()
        .await
        .expect_err("cancelled request should fail");
    assert_eq!(error.code(), ErrorCode::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn attempt_timeout_maps_to_timeout_error() {
    let transport = MockTransport::new(vec![Scripted::Hang]);
    let client = client_with(transport.clone(), RetryPolicy::none());

    let error = client
        .get("/v1/slow")
        .timeout(Duration::from_millis(50))
        .send()
        .await
        .expect_err("hung attempt should time out");
    assert_eq!(error.code(), ErrorCode::Timeout);
}

#[tokio::test]
async fn global_pre_hook_runs_before_scoped_regardless_of_registration_order() {
    let transport = MockTransport::new(vec![Scripted::Status(200)]);
    let client = client_with(transport.clone(), RetryPolicy::none());
    client.middleware().register(
        PathPattern::single_wildcard("/users/*"),
        Arc::new(OrderTagger { value: "scoped" }),
    );
    client.middleware().register(
        PathPattern::contains("/"),
        Arc::new(OrderTagger { value: "global" }),
    );

    client
        .get("/users/7")
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(
        transport.header_values("x-order"),
        vec![Some("global,scoped".to_owned())]
    );
}

#[tokio::test]
async fn pre_hook_failure_aborts_before_sending_and_is_not_retried() {
    let transport = MockTransport::new(Vec::new());
    let client = client_with(transport.clone(), RetryPolicy::immediate(3));
    client
        .middleware()
        .register(PathPattern::contains("/"), Arc::new(FailingPreHook));

    let error = client
        .get("/v1/blocked")
        .send()
        .await
        .expect_err("failing pre-hook should abort the request");
    assert_eq!(error.code(), ErrorCode::Middleware);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn bypass_flag_skips_middleware_entirely() {
    let transport = MockTransport::new(vec![Scripted::Status(200)]);
    let client = client_with(transport.clone(), RetryPolicy::none());
    client
        .middleware()
        .register(PathPattern::contains("/"), Arc::new(FailingPreHook));

    client
        .get("/v1/internal")
        .bypass_middleware()
        .send()
        .await
        .expect("bypassed request should succeed");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn endpoint_headers_only_skips_client_defaults() {
    let transport = MockTransport::new(vec![Scripted::Status(200), Scripted::Status(200)]);
    let client = Client::builder("http://mock.test")
        .transport(transport.clone())
        .retry_policy(RetryPolicy::none())
        .try_default_header("x-default", "present")
        .expect("valid default header")
        .build()
        .expect("client should build");

    client
        .get("/v1/first")
        .send()
        .await
        .expect("request should succeed");
    client
        .get("/v1/second")
        .endpoint_headers_only()
        .try_header("x-mine", "yes")
        .expect("valid header")
        .send()
        .await
        .expect("request should succeed");

    assert_eq!(
        transport.header_values("x-default"),
        vec![Some("present".to_owned()), None]
    );
    assert_eq!(
        transport.header_values("x-mine"),
        vec![None, Some("yes".to_owned())]
    );
}

#[tokio::test]
async fn deserialize_failure_is_never_retried() {
    let transport = MockTransport::new(vec![Scripted::Body(200, b"not-json")]);
    let client = client_with(transport.clone(), RetryPolicy::immediate(3));

    let error = client
        .get("/v1/contract")
        .send_json::<serde_json::Value>()
        .await
        .expect_err("malformed payload should fail decoding");
    assert_eq!(error.code(), ErrorCode::Deserialize);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn rate_limited_error_carries_retry_after() {
    let transport = MockTransport::new(vec![Scripted::StatusWithHeaders(
        429,
        vec![("retry-after", "7")],
    )]);
    let client = client_with(transport.clone(), RetryPolicy::none());

    let error = client
        .get("/v1/throttled")
        .send()
        .await
        .expect_err("429 should surface as rate-limited");
    assert_eq!(error.code(), ErrorCode::RateLimited);
    assert_eq!(error.status(), Some(429));
    assert_eq!(error.retry_after(), Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn streaming_request_bodies_execute_single_attempt() {
    let transport = MockTransport::new(vec![Scripted::Status(500)]);
    let client = client_with(transport.clone(), RetryPolicy::immediate(3));

    let error = client
        .post("/v1/stream")
        .body_reader(std::io::Cursor::new(b"payload".to_vec()))
        .send()
        .await
        .expect_err("500 should be terminal for a non-replayable body");
    assert_eq!(error.code(), ErrorCode::HttpStatus);
    assert_eq!(transport.calls(), 1);
}
