//! Rate-limited upstream HTTP fetching for the card sync pipeline.
//!
//! One [`RateLimitedFetcher`] is built per upstream per process and shared by
//! every caller hitting that upstream. It owns the concurrency cap, the
//! minimum inter-request interval, the per-task tracker and the response
//! inspector, so all of that state lives and dies with the fetcher instance.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, TryStreamExt};
use rand::Rng;
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "cardsync-storage";

const SNIPPET_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: u16) -> RetryDisposition {
    if status == 429 || (500..600).contains(&status) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry, timeout and throttling knobs for one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_ms: u64,
    pub max_concurrency: usize,
    pub requests_per_second: f64,
    pub jitter_ms: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            timeout_ms: 30_000,
            max_concurrency: 4,
            requests_per_second: 5.0,
            jitter_ms: 100,
        }
    }
}

impl FetchPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn min_interval(&self) -> Duration {
        if self.requests_per_second.is_finite() && self.requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / self.requests_per_second)
        } else {
            Duration::ZERO
        }
    }

    /// Jitter never exceeds a quarter of the base delay, which keeps the
    /// sequence of retry delays non-decreasing.
    fn jitter_cap_ms(&self) -> u64 {
        self.jitter_ms.min(self.base_delay_ms / 4)
    }

    /// Delay before retry number `retry` (1-based), for a given jitter sample.
    pub fn delay_for_retry(&self, retry: u32, jitter_ms: u64) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let base = self.base_delay_ms.saturating_mul(1u64 << exponent);
        let jittered = base.saturating_add(jitter_ms.min(self.jitter_cap_ms()));
        Duration::from_millis(jittered.min(self.max_delay_ms.max(self.base_delay_ms)))
    }

    fn backoff_delay(&self, retry: u32) -> Duration {
        let cap = self.jitter_cap_ms();
        let jitter = if cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=cap)
        };
        self.delay_for_retry(retry, jitter)
    }
}

/// Enforces a minimum spacing between dispatched requests without spinning.
#[derive(Debug)]
pub struct IntervalLimiter {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl IntervalLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserves the next dispatch slot and sleeps until it arrives.
    /// Returns how long the caller waited.
    pub async fn acquire(&self) -> Duration {
        if self.min_interval.is_zero() {
            return Duration::ZERO;
        }
        let wait = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        wait
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Throttled,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: u64,
    pub url: String,
    pub attempts: u32,
    pub transitions: Vec<TaskState>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ActiveTask {
    url: String,
    attempts: u32,
    transitions: Vec<TaskState>,
}

impl ActiveTask {
    fn state(&self) -> TaskState {
        self.transitions.last().copied().unwrap_or(TaskState::Pending)
    }
}

#[derive(Debug, Default)]
struct TrackerInner {
    active: HashMap<u64, ActiveTask>,
    recent: VecDeque<TaskSummary>,
    completed: u64,
    failed: u64,
    requests: u64,
    retries: u64,
}

/// Per-task status bookkeeping behind [`RateLimitedFetcher::stats`].
#[derive(Debug)]
pub struct TaskTracker {
    next_id: AtomicU64,
    history: usize,
    inner: StdMutex<TrackerInner>,
}

impl TaskTracker {
    pub fn new(history: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            history: history.max(1),
            inner: StdMutex::new(TrackerInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, url: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().active.insert(
            id,
            ActiveTask {
                url: url.to_string(),
                attempts: 0,
                transitions: vec![TaskState::Pending],
            },
        );
        id
    }

    pub fn transition(&self, task_id: u64, state: TaskState) {
        let mut inner = self.lock();
        match state {
            TaskState::Running => {
                inner.requests += 1;
                if let Some(task) = inner.active.get_mut(&task_id) {
                    task.attempts += 1;
                }
            }
            TaskState::Throttled => inner.retries += 1,
            _ => {}
        }

        let finished = matches!(state, TaskState::Completed | TaskState::Failed);
        if finished {
            match state {
                TaskState::Completed => inner.completed += 1,
                _ => inner.failed += 1,
            }
            if let Some(mut task) = inner.active.remove(&task_id) {
                task.transitions.push(state);
                inner.recent.push_front(TaskSummary {
                    task_id,
                    url: task.url,
                    attempts: task.attempts,
                    transitions: task.transitions,
                    finished_at: Utc::now(),
                });
                inner.recent.truncate(self.history);
            }
        } else if let Some(task) = inner.active.get_mut(&task_id) {
            task.transitions.push(state);
        }
    }

    pub fn snapshot(&self, upstream: &str) -> FetcherStats {
        let inner = self.lock();
        let count = |wanted: TaskState| {
            inner
                .active
                .values()
                .filter(|task| task.state() == wanted)
                .count()
        };
        FetcherStats {
            upstream: upstream.to_string(),
            pending: count(TaskState::Pending),
            running: count(TaskState::Running),
            throttled: count(TaskState::Throttled),
            completed: inner.completed,
            failed: inner.failed,
            total_requests: inner.requests,
            retries: inner.retries,
            recent: inner.recent.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetcherStats {
    pub upstream: String,
    pub pending: usize,
    pub running: usize,
    pub throttled: usize,
    pub completed: u64,
    pub failed: u64,
    pub total_requests: u64,
    pub retries: u64,
    pub recent: Vec<TaskSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectedResponse {
    pub upstream: String,
    pub url: String,
    pub status: u16,
    pub attempt: u32,
    pub elapsed_ms: u64,
    pub body_sha256: Option<String>,
    pub snippet: String,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded ring of the most recent upstream responses, newest first.
#[derive(Debug)]
pub struct ResponseInspector {
    capacity: usize,
    entries: StdMutex<VecDeque<InspectedResponse>>,
}

impl ResponseInspector {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: StdMutex::new(VecDeque::new()),
        }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn record(&self, entry: InspectedResponse) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.push_front(entry);
        entries.truncate(self.capacity);
    }

    pub fn recent(&self, limit: usize) -> Vec<InspectedResponse> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.iter().take(limit).cloned().collect()
    }

    pub fn latest(&self) -> Option<InspectedResponse> {
        self.recent(1).into_iter().next()
    }
}

pub fn body_snippet(bytes: &[u8]) -> String {
    let end = bytes.len().min(SNIPPET_BYTES);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Transport-agnostic description of one outbound call.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    /// URL with the query string appended, used for logging and inspection.
    pub fn display_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let qs = self
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", self.url, qs)
    }
}

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

pub struct TransportResponse {
    pub status: u16,
    pub url: String,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn from_bytes(status: u16, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            url: url.into(),
            body: Box::pin(futures::stream::once(async move { Ok::<Bytes, TransportError>(body) })),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("reading body failed: {0}")]
    Body(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl TransportError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            TransportError::Invalid(_) => RetryDisposition::NonRetryable,
            _ => RetryDisposition::Retryable,
        }
    }
}

/// Seam between the fetcher's retry/throttle policy and the wire.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError>;
}

/// Answers from canned responses keyed by [`OutboundRequest::display_url`].
/// Queued responses are served in order and the last one repeats. URLs with
/// nothing registered get a 404.
#[derive(Debug, Default)]
pub struct FixtureTransport {
    routes: StdMutex<HashMap<String, VecDeque<(u16, Vec<Bytes>)>>>,
    seen: StdMutex<Vec<OutboundRequest>>,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: impl Into<String>, status: u16, body: impl Into<Bytes>) -> &Self {
        self.respond_chunked(url, status, vec![body.into()])
    }

    /// Body delivered as separate stream chunks.
    pub fn respond_chunked(&self, url: impl Into<String>, status: u16, chunks: Vec<Bytes>) -> &Self {
        let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        routes.entry(url.into()).or_default().push_back((status, chunks));
        self
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn request_count(&self) -> usize {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl HttpTransport for FixtureTransport {
    async fn execute(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());
        let key = request.display_url();
        let next = {
            let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
            routes.get_mut(&key).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            })
        };
        let Some((status, chunks)) = next else {
            return Ok(TransportResponse::from_bytes(404, key, "no fixture registered"));
        };
        let body = futures::stream::iter(chunks.into_iter().map(Ok::<Bytes, TransportError>)).boxed();
        Ok(TransportResponse { status, url: key, body })
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("building reqwest client: {e}"))?;
        Ok(Self { client })
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() {
        TransportError::Invalid(err.to_string())
    } else {
        TransportError::Connect(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.query);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let resp = builder.send().await.map_err(|e| classify_reqwest_error(&e))?;
        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        let body = resp
            .bytes_stream()
            .map_err(|e| TransportError::Body(e.to_string()))
            .boxed();
        Ok(TransportResponse { status, url, body })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{upstream}: giving up on {url} after {attempts} attempt(s), last status {status}")]
    RetriesExhausted {
        upstream: String,
        url: String,
        status: u16,
        snippet: String,
        attempts: u32,
    },
    #[error("{upstream}: {url} rejected with status {status}")]
    Rejected {
        upstream: String,
        url: String,
        status: u16,
        snippet: String,
    },
    #[error("{upstream}: invalid request for {url}: {reason}")]
    InvalidRequest {
        upstream: String,
        url: String,
        reason: String,
    },
    #[error("{upstream}: unreadable response from {url}: {reason}")]
    Decode {
        upstream: String,
        url: String,
        reason: String,
    },
}

impl FetchError {
    /// Last HTTP status seen, or 0 when the failure was below HTTP.
    pub fn status(&self) -> u16 {
        match self {
            FetchError::RetriesExhausted { status, .. } | FetchError::Rejected { status, .. } => *status,
            FetchError::InvalidRequest { .. } | FetchError::Decode { .. } => 0,
        }
    }

    pub fn snippet(&self) -> &str {
        match self {
            FetchError::RetriesExhausted { snippet, .. } | FetchError::Rejected { snippet, .. } => snippet,
            FetchError::InvalidRequest { reason, .. } | FetchError::Decode { reason, .. } => reason,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::RetriesExhausted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub url: String,
    pub body: Bytes,
    pub attempts: u32,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A successful response whose body has not been read yet. Holds its
/// concurrency slot until dropped.
pub struct StreamingResponse {
    pub status: u16,
    pub url: String,
    pub body: BodyStream,
    pub attempts: u32,
    _permit: OwnedSemaphorePermit,
}

async fn collect_body(mut body: BodyStream) -> Result<Bytes, TransportError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

pub struct RateLimitedFetcher {
    upstream: String,
    transport: Arc<dyn HttpTransport>,
    policy: FetchPolicy,
    concurrency: Arc<Semaphore>,
    limiter: IntervalLimiter,
    tracker: TaskTracker,
    inspector: ResponseInspector,
}

impl std::fmt::Debug for RateLimitedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedFetcher")
            .field("upstream", &self.upstream)
            .field("policy", &self.policy)
            .finish()
    }
}

enum AttemptFailure {
    Status {
        status: u16,
        snippet: String,
        body_sha256: String,
    },
    Transport(TransportError),
}

impl RateLimitedFetcher {
    pub fn new(upstream: impl Into<String>, transport: Arc<dyn HttpTransport>, policy: FetchPolicy) -> Self {
        Self {
            upstream: upstream.into(),
            transport,
            concurrency: Arc::new(Semaphore::new(policy.max_concurrency.max(1))),
            limiter: IntervalLimiter::new(policy.min_interval()),
            tracker: TaskTracker::new(100),
            inspector: ResponseInspector::new(50),
            policy,
        }
    }

    pub fn with_reqwest(upstream: impl Into<String>, policy: FetchPolicy, user_agent: Option<&str>) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(user_agent)?;
        Ok(Self::new(upstream, Arc::new(transport), policy))
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    pub fn stats(&self) -> FetcherStats {
        self.tracker.snapshot(&self.upstream)
    }

    pub fn inspector(&self) -> &ResponseInspector {
        &self.inspector
    }

    /// Fetches and fully buffers a response body.
    pub async fn fetch(&self, request: OutboundRequest) -> Result<FetchedResponse, FetchError> {
        let (resp, attempts, _permit) = self
            .run(&request, |resp| async move {
                let body = collect_body(resp.body).await?;
                Ok(((resp.status, resp.url, body.clone()), Some(body)))
            })
            .await?;
        let (status, url, body) = resp;
        Ok(FetchedResponse {
            status,
            url,
            body,
            attempts,
        })
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, request: OutboundRequest) -> Result<T, FetchError> {
        let display_url = request.display_url();
        let resp = self.fetch(request).await?;
        resp.json().map_err(|e| FetchError::Decode {
            upstream: self.upstream.clone(),
            url: display_url,
            reason: e.to_string(),
        })
    }

    /// Retries apply until response headers arrive; body read errors after
    /// that surface to the consumer of the stream.
    pub async fn fetch_stream(&self, request: OutboundRequest) -> Result<StreamingResponse, FetchError> {
        // the body is not read here, so nothing is hashed for the inspector
        let (resp, attempts, permit) = self.run(&request, |resp| async move { Ok((resp, None)) }).await?;
        Ok(StreamingResponse {
            status: resp.status,
            url: resp.url,
            body: resp.body,
            attempts,
            _permit: permit,
        })
    }

    async fn run<F, Fut, R>(
        &self,
        request: &OutboundRequest,
        finish: F,
    ) -> Result<(R, u32, OwnedSemaphorePermit), FetchError>
    where
        F: Fn(TransportResponse) -> Fut,
        Fut: Future<Output = Result<(R, Option<Bytes>), TransportError>>,
    {
        let display_url = request.display_url();
        let task_id = self.tracker.register(&display_url);
        let span = info_span!("upstream_fetch", upstream = %self.upstream, url = %display_url, task_id);

        async {
            let permit = match self.concurrency.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.tracker.transition(task_id, TaskState::Failed);
                    return Err(FetchError::InvalidRequest {
                        upstream: self.upstream.clone(),
                        url: display_url.clone(),
                        reason: "concurrency limiter closed".to_string(),
                    });
                }
            };

            let max_attempts = self.policy.max_retries + 1;
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let waited = self.limiter.acquire().await;
                if !waited.is_zero() {
                    debug!(waited_ms = waited.as_millis() as u64, "interval limiter delayed dispatch");
                }
                self.tracker.transition(task_id, TaskState::Running);

                let started = Instant::now();
                let outcome = tokio::time::timeout(self.policy.timeout(), async {
                    let resp = match self.transport.execute(request).await {
                        Ok(resp) => resp,
                        Err(err) => return Err(AttemptFailure::Transport(err)),
                    };
                    if (200..300).contains(&resp.status) {
                        let status = resp.status;
                        let url = resp.url.clone();
                        return finish(resp)
                            .await
                            .map(|r| (status, url, r))
                            .map_err(AttemptFailure::Transport);
                    }
                    let status = resp.status;
                    let body = collect_body(resp.body).await.unwrap_or_default();
                    Err(AttemptFailure::Status {
                        status,
                        snippet: body_snippet(&body),
                        body_sha256: ResponseInspector::sha256_hex(&body),
                    })
                })
                .await
                .unwrap_or(Err(AttemptFailure::Transport(TransportError::Timeout)));
                let elapsed_ms = started.elapsed().as_millis() as u64;

                let (status, snippet, disposition) = match outcome {
                    Ok((status, url, (value, body))) => {
                        self.inspector.record(InspectedResponse {
                            upstream: self.upstream.clone(),
                            url,
                            status,
                            attempt,
                            elapsed_ms,
                            body_sha256: body.as_deref().map(ResponseInspector::sha256_hex),
                            snippet: body.as_deref().map(body_snippet).unwrap_or_default(),
                            recorded_at: Utc::now(),
                        });
                        self.tracker.transition(task_id, TaskState::Completed);
                        return Ok((value, attempt, permit));
                    }
                    Err(AttemptFailure::Status {
                        status,
                        snippet,
                        body_sha256,
                    }) => {
                        self.inspector.record(InspectedResponse {
                            upstream: self.upstream.clone(),
                            url: display_url.clone(),
                            status,
                            attempt,
                            elapsed_ms,
                            body_sha256: Some(body_sha256),
                            snippet: snippet.clone(),
                            recorded_at: Utc::now(),
                        });
                        (status, snippet, classify_status(status))
                    }
                    Err(AttemptFailure::Transport(err)) => {
                        if let TransportError::Invalid(reason) = &err {
                            self.tracker.transition(task_id, TaskState::Failed);
                            return Err(FetchError::InvalidRequest {
                                upstream: self.upstream.clone(),
                                url: display_url.clone(),
                                reason: reason.clone(),
                            });
                        }
                        (0, err.to_string(), err.disposition())
                    }
                };

                if disposition == RetryDisposition::NonRetryable {
                    self.tracker.transition(task_id, TaskState::Failed);
                    return Err(FetchError::Rejected {
                        upstream: self.upstream.clone(),
                        url: display_url.clone(),
                        status,
                        snippet,
                    });
                }

                if attempt >= max_attempts {
                    warn!(status, attempts = attempt, "retry budget exhausted");
                    self.tracker.transition(task_id, TaskState::Failed);
                    return Err(FetchError::RetriesExhausted {
                        upstream: self.upstream.clone(),
                        url: display_url.clone(),
                        status,
                        snippet,
                        attempts: attempt,
                    });
                }

                let delay = self.policy.backoff_delay(attempt);
                warn!(status, attempt, delay_ms = delay.as_millis() as u64, "transient upstream failure, backing off");
                self.tracker.transition(task_id, TaskState::Throttled);
                tokio::time::sleep(delay).await;
            }
        }
        .instrument(span)
        .await
    }
}
