use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the client's counters.
#[derive(Clone, Debug)]
pub struct MetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub middleware_retries: u64,
    pub transfers_started: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    retries: AtomicU64,
    middleware_retries: AtomicU64,
    transfers_started: AtomicU64,
    transfers_completed: AtomicU64,
    transfers_failed: AtomicU64,
}

impl Metrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_middleware_retry(&self) {
        self.inner
            .middleware_retries
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_finished(&self, success: bool) {
        let counter = if success {
            &self.inner.requests_succeeded
        } else {
            &self.inner.requests_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transfer_started(&self) {
        self.inner.transfers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transfer_finished(&self, success: bool) {
        let counter = if success {
            &self.inner.transfers_completed
        } else {
            &self.inner.transfers_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_started: self.inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: self.inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            middleware_retries: self.inner.middleware_retries.load(Ordering::Relaxed),
            transfers_started: self.inner.transfers_started.load(Ordering::Relaxed),
            transfers_completed: self.inner.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.inner.transfers_failed.load(Ordering::Relaxed),
        }
    }
}
