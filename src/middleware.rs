//! Path-scoped request/response interception.
//!
//! Middleware is registered against a [`PathPattern`] and lives until it is
//! deregistered. Each attempt snapshots the matching middleware once, so a
//! registration made mid-flight never retroactively applies to attempts
//! already in progress.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use http::{HeaderMap, Method};

use crate::error::{BoxError, Error};
use crate::pattern::PathPattern;
use crate::response::Response;
use crate::util::Locked;

/// Per-attempt view handed to middleware hooks.
#[derive(Clone, Debug)]
pub struct RequestContext {
    method: Method,
    uri: String,
    path: String,
    attempt: usize,
    middleware_retries: usize,
}

impl RequestContext {
    pub(crate) fn new(
        method: Method,
        uri: String,
        path: String,
        attempt: usize,
        middleware_retries: usize,
    ) -> Self {
        Self {
            method,
            uri,
            path,
            attempt,
            middleware_retries,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// 0-based policy attempt index.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Whole-request retries already triggered by post-hooks.
    pub fn middleware_retries(&self) -> usize {
        self.middleware_retries
    }
}

/// What a post-hook wants done with the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostHookOutcome {
    Continue,
    /// Re-run the whole request from the pre-hook stage. Counted against an
    /// independent hard cap, separate from the retry policy's budget. Ignored
    /// when the request body is a non-replayable stream.
    RetryRequest,
}

/// A pre-request/post-response hook pair.
///
/// `before_request` may mutate the outgoing headers; an error here aborts
/// the request before anything is sent and is never retried.
/// `after_attempt` observes every response or error; the first hook in the
/// chain that returns [`PostHookOutcome::RetryRequest`] short-circuits the
/// rest of that round. For streaming sends the response body has not been
/// read yet, so post-hooks see status and headers with an empty body.
pub trait Middleware: Send + Sync {
    fn before_request(
        &self,
        _context: &RequestContext,
        _headers: &mut HeaderMap,
    ) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    fn after_attempt(
        &self,
        _context: &RequestContext,
        _outcome: std::result::Result<&Response, &Error>,
    ) -> PostHookOutcome {
        PostHookOutcome::Continue
    }
}

/// Handle for deregistration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MiddlewareId(u64);

struct Registered {
    id: u64,
    pattern: PathPattern,
    hooks: Arc<dyn Middleware>,
}

/// Ordered middleware registry, safe to mutate concurrently with in-flight
/// requests.
#[derive(Default)]
pub struct MiddlewareRegistry {
    entries: Locked<Vec<Registered>>,
    next_id: AtomicU64,
}

impl MiddlewareRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pattern: PathPattern, hooks: Arc<dyn Middleware>) -> MiddlewareId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write(|entries| entries.push(Registered { id, pattern, hooks }));
        MiddlewareId(id)
    }

    /// Removes a registration; returns whether it was still present.
    pub fn deregister(&self, id: MiddlewareId) -> bool {
        self.entries.write(|entries| {
            let before = entries.len();
            entries.retain(|entry| entry.id != id.0);
            entries.len() != before
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read(Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Partitions the registered middleware for one request path: globals
    /// (patterns that match every path) first, then path-scoped matches,
    /// each preserving registration order.
    pub(crate) fn snapshot(&self, path: &str) -> MiddlewareSnapshot {
        self.entries.read(|entries| {
            let mut global = Vec::new();
            let mut scoped = Vec::new();
            for entry in entries {
                if entry.pattern.matches_all_paths() {
                    global.push(entry.hooks.clone());
                } else if entry.pattern.matches(path) {
                    scoped.push(entry.hooks.clone());
                }
            }
            MiddlewareSnapshot { global, scoped }
        })
    }
}

#[derive(Default)]
pub(crate) struct MiddlewareSnapshot {
    global: Vec<Arc<dyn Middleware>>,
    scoped: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareSnapshot {
    pub(crate) fn run_pre_hooks(
        &self,
        context: &RequestContext,
        headers: &mut HeaderMap,
    ) -> std::result::Result<(), BoxError> {
        for hooks in self.global.iter().chain(&self.scoped) {
            hooks.before_request(context, headers)?;
        }
        Ok(())
    }

    pub(crate) fn run_post_hooks(
        &self,
        context: &RequestContext,
        outcome: std::result::Result<&Response, &Error>,
    ) -> PostHookOutcome {
        for hooks in self.global.iter().chain(&self.scoped) {
            if hooks.after_attempt(context, outcome) == PostHookOutcome::RetryRequest {
                return PostHookOutcome::RetryRequest;
            }
        }
        PostHookOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::HeaderMap;
    use http::header::{HeaderName, HeaderValue};

    use super::{Middleware, MiddlewareRegistry, RequestContext};
    use crate::pattern::PathPattern;

    struct Tagger {
        value: &'static str,
    }

    impl Middleware for Tagger {
        fn before_request(
            &self,
            _context: &RequestContext,
            headers: &mut HeaderMap,
        ) -> std::result::Result<(), crate::error::BoxError> {
            let name = HeaderName::from_static("x-order");
            let merged = match headers.get(&name) {
                Some(existing) => format!(
                    "{},{}",
                    existing.to_str().unwrap_or_default(),
                    self.value
                ),
                None => self.value.to_owned(),
            };
            headers.insert(name, HeaderValue::from_str(&merged)?);
            Ok(())
        }
    }

    fn context(path: &str) -> RequestContext {
        RequestContext::new(
            http::Method::GET,
            format!("https://api.example.com{path}"),
            path.to_owned(),
            0,
            0,
        )
    }

    #[test]
    fn snapshot_partitions_global_before_scoped_in_registration_order() {
        let registry = MiddlewareRegistry::new();
        registry.register(
            PathPattern::single_wildcard("/users/*"),
            Arc::new(Tagger { value: "scoped" }),
        );
        registry.register(PathPattern::contains("/"), Arc::new(Tagger { value: "global" }));

        let snapshot = registry.snapshot("/users/42");
        let mut headers = HeaderMap::new();
        snapshot
            .run_pre_hooks(&context("/users/42"), &mut headers)
            .expect("pre-hooks should succeed");
        assert_eq!(
            headers.get("x-order").and_then(|value| value.to_str().ok()),
            Some("global,scoped")
        );
    }

    #[test]
    fn snapshot_excludes_non_matching_patterns() {
        let registry = MiddlewareRegistry::new();
        registry.register(
            PathPattern::exact("/orders"),
            Arc::new(Tagger { value: "orders" }),
        );

        let snapshot = registry.snapshot("/users/42");
        let mut headers = HeaderMap::new();
        snapshot
            .run_pre_hooks(&context("/users/42"), &mut headers)
            .expect("pre-hooks should succeed");
        assert!(headers.get("x-order").is_none());
    }

    #[test]
    fn deregistered_middleware_no_longer_applies() {
        let registry = MiddlewareRegistry::new();
        let id = registry.register(
            PathPattern::contains("/"),
            Arc::new(Tagger { value: "global" }),
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.deregister(id));
        assert!(!registry.deregister(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn scoped_match_everything_pattern_applies_to_all_paths() {
        let counted = Arc::new(AtomicUsize::new(0));
        struct Counter(Arc<AtomicUsize>);
        impl Middleware for Counter {
            fn before_request(
                &self,
                _context: &RequestContext,
                _headers: &mut HeaderMap,
            ) -> std::result::Result<(), crate::error::BoxError> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }

        let registry = MiddlewareRegistry::new();
        registry.register(
            PathPattern::multi_wildcard("**"),
            Arc::new(Counter(counted.clone())),
        );
        for path in ["/a", "/b/c", "/"] {
            let mut headers = HeaderMap::new();
            registry
                .snapshot(path)
                .run_pre_hooks(&context(path), &mut headers)
                .expect("pre-hooks should succeed");
        }
        assert_eq!(counted.load(Ordering::Relaxed), 3);
    }
}
