//! `courier` is an async HTTP client engine: requests are routed through
//! path-scoped middleware, failed attempts are retried under a configurable
//! policy, and long-running transfers are cancellable background tasks.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use courier::prelude::{Client, Middleware, PathPattern, RetryPolicy};
//!
//! struct AuthHeader;
//!
//! impl Middleware for AuthHeader {
//!     fn before_request(
//!         &self,
//!         _context: &courier::RequestContext,
//!         headers: &mut http::HeaderMap,
//!     ) -> Result<(), courier::BoxError> {
//!         headers.insert("authorization", "Bearer token".parse()?);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("https://api.example.com")
//!         .request_timeout(Duration::from_secs(5))
//!         .retry_policy(
//!             RetryPolicy::exponential(3)
//!                 .base_delay(Duration::from_millis(100))
//!                 .max_delay(Duration::from_secs(2)),
//!         )
//!         .build()?;
//!
//!     client
//!         .middleware()
//!         .register(PathPattern::multi_wildcard("/v1/**"), Arc::new(AuthHeader));
//!
//!     let response = client.get("/v1/items").query_pair("page", "1").send().await?;
//!     println!("status={}", response.status());
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - `RetryPolicy::exponential(3)` with jitter for service traffic.
//! - Keep middleware pre-hooks cheap; they run on every attempt.
//! - Give transfers a completion callback rather than polling state.

mod client;
mod error;
mod metrics;
mod middleware;
mod pattern;
mod request;
mod response;
mod retry;
mod tls;
mod transfer;
mod transport;
mod util;

pub use tokio_util::sync::CancellationToken;

pub use crate::client::{Client, ClientBuilder};
pub use crate::error::{BoxError, Error, ErrorCode, TransportErrorKind};
pub use crate::metrics::MetricsSnapshot;
pub use crate::middleware::{
    Middleware, MiddlewareId, MiddlewareRegistry, PostHookOutcome, RequestContext,
};
pub use crate::pattern::PathPattern;
pub use crate::request::RequestBuilder;
pub use crate::response::{Response, ResponseStream};
pub use crate::retry::{Backoff, RetryConditions, RetryPolicy};
pub use crate::transfer::{
    CompletionCallback, ProgressCallback, TransferHandle, TransferId, TransferManager,
    TransferOptions, TransferProgress, TransferState, TransferSummary,
};
pub use crate::transport::{
    BodyStream, HyperTransport, Transport, TransportBody, TransportError, TransportRequest,
    TransportResponse, collect_body, next_chunk,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Backoff, BoxError, CancellationToken, Client, Error, ErrorCode, Middleware, PathPattern,
        PostHookOutcome, RequestContext, Response, Result, RetryConditions, RetryPolicy,
        TransferManager, TransferOptions, TransferState, TransportErrorKind,
    };
}

#[cfg(test)]
mod tests;
