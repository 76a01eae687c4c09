use std::time::Duration;

use http::Method;
use thiserror::Error as ThisError;

use crate::retry::RetryConditions;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classified cause of a transport-level failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Reset,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Reset => "reset",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Stable machine-readable error code, one per [`Error`] variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    InvalidPattern,
    TlsInit,
    Transport,
    Timeout,
    HttpStatus,
    RateLimited,
    EmptyBody,
    Deserialize,
    Io,
    Cancelled,
    Middleware,
    MiddlewareRetryLimit,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::InvalidPattern => "invalid_pattern",
            Self::TlsInit => "tls_init",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::HttpStatus => "http_status",
            Self::RateLimited => "rate_limited",
            Self::EmptyBody => "empty_body",
            Self::Deserialize => "deserialize",
            Self::Io => "io",
            Self::Cancelled => "cancelled",
            Self::Middleware => "middleware",
            Self::MiddlewareRetryLimit => "middleware_retry_limit",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::InvalidUri,
            Self::InvalidHeaderName,
            Self::InvalidHeaderValue,
            Self::InvalidPattern,
            Self::TlsInit,
            Self::Transport,
            Self::Timeout,
            Self::HttpStatus,
            Self::RateLimited,
            Self::EmptyBody,
            Self::Deserialize,
            Self::Io,
            Self::Cancelled,
            Self::Middleware,
            Self::MiddlewareRetryLimit,
        ]
    }
}

#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("invalid path pattern {pattern}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to initialize tls: {message}")]
    TlsInit { message: String },
    #[error("transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("rate limited (429) for {method} {uri}")]
    RateLimited {
        method: Method,
        uri: String,
        retry_after: Option<Duration>,
        body: String,
    },
    #[error("response body was empty where content was required")]
    EmptyBody,
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("transfer io error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },
    #[error("request cancelled for {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("middleware pre-hook failed for {method} {uri}: {source}")]
    Middleware {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("middleware retry limit exceeded ({limit}) for {method} {uri}")]
    MiddlewareRetryLimit {
        limit: usize,
        method: Method,
        uri: String,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::InvalidPattern { .. } => ErrorCode::InvalidPattern,
            Self::TlsInit { .. } => ErrorCode::TlsInit,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::EmptyBody => ErrorCode::EmptyBody,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::Io { .. } => ErrorCode::Io,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::Middleware { .. } => ErrorCode::Middleware,
            Self::MiddlewareRetryLimit { .. } => ErrorCode::MiddlewareRetryLimit,
        }
    }

    /// The retryable category this error belongs to, if any.
    ///
    /// Server errors qualify only in the 500-599 window; 4xx responses other
    /// than 429 are a contract problem, not a transient condition. Decoding,
    /// construction, cancellation, and middleware failures never qualify.
    pub fn retry_condition(&self) -> Option<RetryConditions> {
        match self {
            Self::Timeout { .. } => Some(RetryConditions::TIMEOUT),
            Self::Transport { kind, .. } => match kind {
                TransportErrorKind::Dns => Some(RetryConditions::DNS),
                TransportErrorKind::Reset => Some(RetryConditions::CONNECTION_LOST),
                TransportErrorKind::Connect | TransportErrorKind::Other => {
                    Some(RetryConditions::NETWORK)
                }
                TransportErrorKind::Tls => None,
            },
            Self::HttpStatus { status, .. } if (500..=599).contains(status) => {
                Some(RetryConditions::SERVER_ERROR)
            }
            Self::RateLimited { .. } => Some(RetryConditions::RATE_LIMITED),
            _ => None,
        }
    }

    /// Server-provided Retry-After duration, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}
