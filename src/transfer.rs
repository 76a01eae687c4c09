//! Long-running upload/download tasks with pause/resume/cancel control.
//!
//! The [`TransferManager`] owns every task's lifecycle; callers hold only a
//! [`TransferHandle`]. Progress and completion callbacks are delivered from
//! one dedicated dispatcher task fed by an in-order queue, so callback order
//! always matches transport event order and a terminal callback fires at
//! most once.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use http::Method;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Client;
use crate::error::{Error, TransportErrorKind};
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use crate::transport::next_chunk;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferId(u64);

impl TransferId {
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "transfer-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    Created,
    Running,
    Paused,
    Cancelled,
    Completed { success: bool },
}

impl TransferState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed { .. })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TransferProgress {
    pub id: TransferId,
    pub transferred_bytes: u64,
    pub total_bytes: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct TransferSummary {
    pub id: TransferId,
    pub transferred_bytes: u64,
}

pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;
pub type CompletionCallback =
    Box<dyn FnOnce(TransferId, std::result::Result<TransferSummary, Error>) + Send>;

/// Per-transfer configuration: callbacks plus executor overrides.
#[derive(Default)]
pub struct TransferOptions {
    progress: Option<ProgressCallback>,
    completion: Option<CompletionCallback>,
    retry_policy: Option<RetryPolicy>,
    bypass_middleware: bool,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, callback: impl Fn(TransferProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn on_completion(
        mut self,
        callback: impl FnOnce(TransferId, std::result::Result<TransferSummary, Error>) + Send + 'static,
    ) -> Self {
        self.completion = Some(Box::new(callback));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn bypass_middleware(mut self) -> Self {
        self.bypass_middleware = true;
        self
    }
}

enum TransferEvent {
    Progress(TransferProgress),
    Terminal {
        id: TransferId,
        result: std::result::Result<TransferSummary, Error>,
    },
}

struct TransferShared {
    id: TransferId,
    method: Method,
    uri: String,
    state: crate::util::Locked<TransferState>,
    cancel: CancellationToken,
    resume: Notify,
    done: Notify,
    events: mpsc::UnboundedSender<TransferEvent>,
    metrics: Metrics,
}

impl TransferShared {
    fn state(&self) -> TransferState {
        self.state.read(|state| *state)
    }

    fn is_paused(&self) -> bool {
        self.state() == TransferState::Paused
    }

    fn set_running(&self) {
        self.state.write(|state| {
            if *state == TransferState::Created {
                *state = TransferState::Running;
            }
        });
    }

    /// Running → Paused; a no-op in any other state.
    fn pause(&self) {
        self.state.write(|state| {
            if *state == TransferState::Running {
                *state = TransferState::Paused;
            }
        });
    }

    /// Paused → Running; a no-op in any other state.
    fn resume(&self) {
        let resumed = self.state.write(|state| {
            if *state == TransferState::Paused {
                *state = TransferState::Running;
                true
            } else {
                false
            }
        });
        if resumed {
            self.resume.notify_waiters();
        }
    }

    /// Any non-terminal state → Cancelled. The terminal event is queued here
    /// so the completion callback fires even if the worker never observes
    /// the token (e.g. a task cancelled before its first chunk).
    fn cancel(&self) {
        let cancelled = self.state.write(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = TransferState::Cancelled;
                true
            }
        });
        if cancelled {
            self.cancel.cancel();
            self.metrics.record_transfer_finished(false);
            let _ = self.events.send(TransferEvent::Terminal {
                id: self.id,
                result: Err(self.cancelled_error()),
            });
            self.done.notify_waiters();
        }
    }

    /// Claims the terminal transition; exactly one caller wins.
    fn complete(&self, success: bool) -> bool {
        let completed = self.state.write(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = TransferState::Completed { success };
                true
            }
        });
        if completed {
            self.metrics.record_transfer_finished(success);
            self.done.notify_waiters();
        }
        completed
    }

    fn cancelled_error(&self) -> Error {
        Error::Cancelled {
            method: self.method.clone(),
            uri: self.uri.clone(),
        }
    }

    fn emit_progress(&self, transferred_bytes: u64, total_bytes: Option<u64>) {
        let _ = self.events.send(TransferEvent::Progress(TransferProgress {
            id: self.id,
            transferred_bytes,
            total_bytes,
        }));
    }

    /// Blocks while paused; errors out if cancelled in the meantime.
    async fn until_resumed(&self) -> std::result::Result<(), Error> {
        loop {
            let notified = self.resume.notified();
            if !self.is_paused() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.cancelled_error()),
                _ = notified => {}
            }
        }
    }
}

/// Caller-held control surface for one transfer.
#[derive(Clone)]
pub struct TransferHandle {
    shared: Arc<TransferShared>,
}

impl TransferHandle {
    pub fn id(&self) -> TransferId {
        self.shared.id
    }

    pub fn state(&self) -> TransferState {
        self.shared.state()
    }

    pub fn pause(&self) {
        self.shared.pause();
    }

    pub fn resume(&self) {
        self.shared.resume();
    }

    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Waits for the transfer to reach a terminal state and returns it.
    pub async fn wait(&self) -> TransferState {
        loop {
            let notified = self.shared.done.notified();
            let state = self.shared.state();
            if state.is_terminal() {
                return state;
            }
            notified.await;
        }
    }
}

struct TransferEntry {
    shared: Arc<TransferShared>,
    progress: Option<ProgressCallback>,
    completion: Option<CompletionCallback>,
}

/// Registry and lifecycle owner for upload/download tasks.
///
/// Must be created inside a Tokio runtime: construction spawns the callback
/// dispatcher task.
pub struct TransferManager {
    client: Client,
    tasks: Arc<crate::util::Locked<BTreeMap<u64, TransferEntry>>>,
    events: mpsc::UnboundedSender<TransferEvent>,
    next_id: AtomicU64,
}

impl TransferManager {
    pub fn new(client: Client) -> Self {
        let (events, mut receiver) = mpsc::unbounded_channel();
        let tasks: Arc<crate::util::Locked<BTreeMap<u64, TransferEntry>>> =
            Arc::new(crate::util::Locked::new(BTreeMap::new()));

        let dispatcher_tasks = tasks.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match event {
                    TransferEvent::Progress(progress) => {
                        let callback = dispatcher_tasks.read(|tasks| {
                            tasks
                                .get(&progress.id.value())
                                .and_then(|entry| entry.progress.clone())
                        });
                        if let Some(callback) = callback {
                            callback(progress);
                        }
                    }
                    TransferEvent::Terminal { id, result } => {
                        let completion = dispatcher_tasks.write(|tasks| {
                            tasks
                                .remove(&id.value())
                                .and_then(|entry| entry.completion)
                        });
                        if let Some(callback) = completion {
                            callback(id, result);
                        }
                    }
                }
            }
        });

        Self {
            client,
            tasks,
            events,
            next_id: AtomicU64::new(1),
        }
    }

    /// Streams a GET response into `sink`, reporting progress per chunk.
    pub fn download<W>(
        &self,
        path: impl Into<String>,
        sink: W,
        options: TransferOptions,
    ) -> TransferHandle
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let path = path.into();
        let (shared, retry_policy, bypass_middleware) =
            self.register(Method::GET, &path, options);
        let client = self.client.clone();
        let worker_shared = shared.clone();
        tokio::spawn(async move {
            run_download(
                client,
                path,
                sink,
                worker_shared,
                retry_policy,
                bypass_middleware,
            )
            .await;
        });
        TransferHandle { shared }
    }

    /// Downloads into a file created at `target`.
    pub fn download_to_path(
        &self,
        path: impl Into<String>,
        target: impl Into<PathBuf>,
        options: TransferOptions,
    ) -> TransferHandle {
        let path = path.into();
        let target = target.into();
        let (shared, retry_policy, bypass_middleware) =
            self.register(Method::GET, &path, options);
        let client = self.client.clone();
        let worker_shared = shared.clone();
        tokio::spawn(async move {
            match tokio::fs::File::create(&target).await {
                Ok(file) => {
                    run_download(
                        client,
                        path,
                        file,
                        worker_shared,
                        retry_policy,
                        bypass_middleware,
                    )
                    .await;
                }
                Err(source) => {
                    finish(&worker_shared, Err(Error::Io { source }));
                }
            }
        });
        TransferHandle { shared }
    }

    /// Streams `reader` as a PUT request body, reporting progress per chunk
    /// read. Streaming bodies are not replayable, so the attempt is never
    /// retried.
    pub fn upload<R>(
        &self,
        path: impl Into<String>,
        reader: R,
        options: TransferOptions,
    ) -> TransferHandle
    where
        R: AsyncRead + Send + 'static,
    {
        let path = path.into();
        let (shared, retry_policy, bypass_middleware) =
            self.register(Method::PUT, &path, options);
        let client = self.client.clone();
        let worker_shared = shared.clone();
        tokio::spawn(async move {
            run_upload(
                client,
                path,
                reader,
                worker_shared,
                retry_policy,
                bypass_middleware,
            )
            .await;
        });
        TransferHandle { shared }
    }

    /// Looks up a live transfer by id; terminal transfers are dropped from
    /// the registry once their completion callback has fired.
    pub fn handle(&self, id: TransferId) -> Option<TransferHandle> {
        self.tasks.read(|tasks| {
            tasks.get(&id.value()).map(|entry| TransferHandle {
                shared: entry.shared.clone(),
            })
        })
    }

    pub fn active_count(&self) -> usize {
        self.tasks.read(BTreeMap::len)
    }

    fn register(
        &self,
        method: Method,
        path: &str,
        options: TransferOptions,
    ) -> (Arc<TransferShared>, Option<RetryPolicy>, bool) {
        let id = TransferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(TransferShared {
            id,
            method,
            uri: path.to_owned(),
            state: crate::util::Locked::new(TransferState::Created),
            cancel: CancellationToken::new(),
            resume: Notify::new(),
            done: Notify::new(),
            events: self.events.clone(),
            metrics: self.client.metrics().clone(),
        });
        self.tasks.write(|tasks| {
            tasks.insert(
                id.value(),
                TransferEntry {
                    shared: shared.clone(),
                    progress: options.progress,
                    completion: options.completion,
                },
            );
        });
        self.client.metrics().record_transfer_started();
        (shared, options.retry_policy, options.bypass_middleware)
    }
}

/// Claims the terminal transition and queues the completion event. A
/// concurrent `cancel` may have claimed it already, in which case this is a
/// no-op and the cancel's event stands.
fn finish(
    shared: &Arc<TransferShared>,
    result: std::result::Result<TransferSummary, Error>,
) {
    if shared.complete(result.is_ok()) {
        let _ = shared.events.send(TransferEvent::Terminal {
            id: shared.id,
            result,
        });
    }
}

async fn run_download<W>(
    client: Client,
    path: String,
    mut sink: W,
    shared: Arc<TransferShared>,
    retry_policy: Option<RetryPolicy>,
    bypass_middleware: bool,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    shared.set_running();
    let mut request = client.get(&path).cancellation(shared.cancel.clone());
    if let Some(policy) = retry_policy {
        request = request.retry_policy(policy);
    }
    if bypass_middleware {
        request = request.bypass_middleware();
    }

    let response = match request.send_stream().await {
        Ok(response) => response,
        Err(error) => {
            finish(&shared, Err(error));
            return;
        }
    };
    let total_bytes = response.content_length();
    let mut body = response.into_body();
    let mut transferred: u64 = 0;
    debug!(id = %shared.id, ?total_bytes, "download started");

    loop {
        let chunk = tokio::select! {
            _ = shared.cancel.cancelled() => {
                finish(&shared, Err(shared.cancelled_error()));
                return;
            }
            chunk = next_chunk(&mut body) => chunk,
        };
        match chunk {
            None => break,
            Some(Ok(bytes)) => {
                // The pause gate sits between receiving a chunk and
                // delivering it: nothing is written or reported while the
                // task is paused.
                if let Err(error) = shared.until_resumed().await {
                    finish(&shared, Err(error));
                    return;
                }
                if let Err(source) = sink.write_all(&bytes).await {
                    finish(&shared, Err(Error::Io { source }));
                    return;
                }
                transferred += bytes.len() as u64;
                shared.emit_progress(transferred, total_bytes);
            }
            Some(Err(source)) => {
                finish(
                    &shared,
                    Err(Error::Transport {
                        kind: TransportErrorKind::Reset,
                        method: shared.method.clone(),
                        uri: shared.uri.clone(),
                        source,
                    }),
                );
                return;
            }
        }
    }

    if let Err(source) = sink.shutdown().await {
        finish(&shared, Err(Error::Io { source }));
        return;
    }
    debug!(id = %shared.id, transferred, "download completed");
    finish(
        &shared,
        Ok(TransferSummary {
            id: shared.id,
            transferred_bytes: transferred,
        }),
    );
}

async fn run_upload<R>(
    client: Client,
    path: String,
    reader: R,
    shared: Arc<TransferShared>,
    retry_policy: Option<RetryPolicy>,
    bypass_middleware: bool,
) where
    R: AsyncRead + Send + 'static,
{
    shared.set_running();
    let transferred = Arc::new(AtomicU64::new(0));
    let body = ProgressStream {
        inner: Box::pin(ReaderStream::new(reader)),
        shared: shared.clone(),
        transferred: transferred.clone(),
        resume_waiter: None,
    };

    let mut request = client
        .put(&path)
        .cancellation(shared.cancel.clone())
        .body_stream(body);
    if let Some(policy) = retry_policy {
        request = request.retry_policy(policy);
    }
    if bypass_middleware {
        request = request.bypass_middleware();
    }

    match request.send().await {
        Ok(_) => {
            let transferred_bytes = transferred.load(Ordering::Relaxed);
            debug!(id = %shared.id, transferred_bytes, "upload completed");
            finish(
                &shared,
                Ok(TransferSummary {
                    id: shared.id,
                    transferred_bytes,
                }),
            );
        }
        Err(error) => finish(&shared, Err(error)),
    }
}

/// Wraps the upload source: accounts bytes as the transport pulls them,
/// parks while the transfer is paused, and fails fast once cancelled.
struct ProgressStream<S> {
    inner: Pin<Box<S>>,
    shared: Arc<TransferShared>,
    transferred: Arc<AtomicU64>,
    resume_waiter: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Send,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.shared.cancel.is_cancelled() {
                return Poll::Ready(Some(Err(std::io::Error::other("transfer cancelled"))));
            }
            if !this.shared.is_paused() {
                this.resume_waiter = None;
                break;
            }
            let waiter = this.resume_waiter.get_or_insert_with(|| {
                let shared = this.shared.clone();
                Box::pin(async move { shared.resume.notified().await })
            });
            match waiter.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.resume_waiter = None;
                }
                Poll::Pending => {
                    // The resume may have landed between the pause check and
                    // waiter registration; re-check before parking.
                    if this.shared.is_paused() {
                        return Poll::Pending;
                    }
                    this.resume_waiter = None;
                }
            }
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let transferred = this
                    .transferred
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed)
                    + chunk.len() as u64;
                this.shared.emit_progress(transferred, None);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}
