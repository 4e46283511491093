//! # Scheduler Module
//!
//! Sequences outbound provider requests.
//!
//! ## Features
//!
//! - **Priorities**: `high` > `normal` > `low`, plus a coalescing `batch` queue
//! - **Rate windows**: sliding per-provider window capped at `⌊max · buffer⌋`
//! - **Adaptive pacing**: per-provider delay that grows on errors and pressure
//! - **Retries**: exponential backoff with jitter, re-queued at the head
//! - **Auth gate**: optional pre-dispatch hook per provider
//! - **Circuit breakers**: per provider, failing fast while open
//!
//! A single dispatcher task owns the selection loop; request futures run on
//! their own tasks and report back when they settle.

pub mod auth;
pub mod config;
pub mod metrics;
pub mod provider;
mod queue;
pub mod request;

pub use auth::{AuthCheck, AuthGate, TokenAuthGate};
pub use config::{ProviderLimits, SchedulerConfig};
pub use metrics::{SchedulerHealth, SchedulerMetrics, SchedulerStatus};
pub use request::{Priority, RequestHandle, RequestOptions};

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{ApiError, ErrorKind};
use crate::resilience::CircuitBreaker;
use metrics::SchedulerCounters;
use provider::ProviderState;
use queue::{PriorityQueues, Selection};
use request::{erase, Job, JobResult};

/// Provider key for requests submitted without one.
pub const DEFAULT_PROVIDER: &str = "default";

#[derive(Debug, Default)]
struct SchedulerState {
    queues: PriorityQueues,
    providers: HashMap<String, ProviderState>,
    inflight: usize,
    paused: bool,
    closed: bool,
    avg_latency_ms: f64,
    latency_samples: u64,
}

enum Step {
    Stop,
    /// Something was rejected or flushed; look again.
    Again,
    /// Nothing can move until a request settles or is added.
    Idle,
    SleepUntil(Instant),
    Dispatch(Job, Arc<CircuitBreaker>),
    CheckAuth(String, Arc<dyn AuthGate>),
}

struct SchedulerInner {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    counters: SchedulerCounters,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    auth_gates: DashMap<String, Arc<dyn AuthGate>>,
    next_id: AtomicU64,
    wake: Notify,
    dispatcher_started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Handle to the request scheduler; clones share the same queues.
#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RequestScheduler")
            .field("queued", &state.queues.total())
            .field("inflight", &state.inflight)
            .field("paused", &state.paused)
            .finish()
    }
}

impl RequestScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        info!(
            "📡 Scheduler iniciado: {} concurrentes, {} proveedores configurados",
            config.max_concurrent,
            config.providers.len()
        );
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                state: Mutex::new(SchedulerState::default()),
                counters: SchedulerCounters::default(),
                breakers: DashMap::new(),
                auth_gates: DashMap::new(),
                next_id: AtomicU64::new(1),
                wake: Notify::new(),
                dispatcher_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Installs the pre-dispatch hook for `provider`.
    pub fn register_auth_gate(&self, provider: impl Into<String>, gate: Arc<dyn AuthGate>) {
        let provider = provider.into();
        debug!(provider = %provider, "🔐 Auth gate registered");
        self.inner.auth_gates.insert(provider, gate);
    }

    /// Forgets the cached positive auth result for `provider`.
    pub fn invalidate_auth(&self, provider: &str) {
        if let Some(state) = self.inner.state.lock().providers.get_mut(provider) {
            state.auth_valid_until = None;
        }
    }

    /// The breaker guarding `provider`, created on first use.
    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.inner.breaker(provider)
    }

    /// Enqueues `f` and returns a handle resolving with its eventual result.
    /// `f` is called once per attempt.
    pub fn submit<T, F, Fut>(&self, f: F, options: RequestOptions) -> RequestHandle<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel::<JobResult>();
        let handle = RequestHandle::new(id, rx);
        let provider = options.provider.clone().unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
        SchedulerCounters::bump(&inner.counters.total);

        if inner.shutdown.is_cancelled() {
            SchedulerCounters::bump(&inner.counters.cancelled);
            let _ = reply.send(Err(ApiError::cancelled("scheduler is shut down")));
            return handle;
        }
        if inner.breaker(&provider).is_rejecting() {
            SchedulerCounters::bump(&inner.counters.breaker_rejections);
            debug!(provider = %provider, "⛔ Rejected at submit, circuit open");
            let _ = reply.send(Err(ApiError::service_unavailable(&provider)));
            return handle;
        }
        if let Err(e) = self.ensure_dispatcher() {
            let _ = reply.send(Err(e));
            return handle;
        }

        let priority = if options.batchable {
            Priority::Batch
        } else {
            options.priority
        };
        let job = Job {
            id,
            priority,
            provider,
            timeout: options.timeout.unwrap_or_else(|| inner.config.request_timeout()),
            max_attempts: options.max_attempts.unwrap_or(inner.config.max_retries).max(1),
            attempt: 0,
            queued_at: Instant::now(),
            batch_type: options.batch_type,
            metadata: options.metadata,
            rate_counted: false,
            factory: erase(f),
            reply,
        };
        debug!(
            id,
            priority = %job.priority,
            provider = %job.provider,
            metadata = %job.metadata,
            "📥 Request queued"
        );

        {
            let mut state = inner.state.lock();
            if state.closed {
                drop(state);
                SchedulerCounters::bump(&inner.counters.cancelled);
                job.reject(ApiError::cancelled("scheduler is shut down"));
                return handle;
            }
            state.queues.push_back(job);
        }
        inner.wake.notify_one();
        handle
    }

    /// `submit(..).await`.
    pub async fn add<T, F, Fut>(&self, f: F, options: RequestOptions) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        self.submit(f, options).await
    }

    fn ensure_dispatcher(&self) -> Result<(), ApiError> {
        if self.inner.dispatcher_started.load(Ordering::Acquire) {
            return Ok(());
        }
        let handle = Handle::try_current()
            .map_err(|_| ApiError::invalid_config("request scheduler needs a tokio runtime"))?;
        if !self.inner.dispatcher_started.swap(true, Ordering::AcqRel) {
            let inner = Arc::clone(&self.inner);
            self.inner.tasks.spawn_on(inner.run(), &handle);
        }
        Ok(())
    }

    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
        info!("⏸️ Scheduler paused");
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        info!("▶️ Scheduler resumed");
        self.inner.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Rejects queued requests (of one priority, or all) with `CANCELLED`.
    pub fn clear(&self, priority: Option<Priority>) -> usize {
        let drained = self.inner.state.lock().queues.drain_where(priority, |_| true);
        self.inner.cancel_jobs(drained, "queue cleared")
    }

    pub fn clear_by_provider(&self, provider: &str) -> usize {
        let drained = self
            .inner
            .state
            .lock()
            .queues
            .drain_where(None, |job| job.provider == provider);
        self.inner.cancel_jobs(drained, "provider queue cleared")
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queues.total()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let state = self.inner.state.lock();
        let queue_depth = Priority::ALL
            .into_iter()
            .map(|p| (p.as_str().to_string(), state.queues.len(p)))
            .collect();
        let mut providers = state
            .providers
            .iter()
            .map(|(name, ps)| (name.clone(), ps.snapshot(self.inner.breaker(name).state())))
            .collect::<BTreeMap<_, _>>();
        // providers known only through their breaker (rejected before any dispatch)
        for entry in self.inner.breakers.iter() {
            providers.entry(entry.key().clone()).or_insert_with(|| {
                ProviderState::new(self.inner.config.limits_for(entry.key())).snapshot(entry.value().state())
            });
        }
        SchedulerMetrics::collect(
            &self.inner.counters,
            state.avg_latency_ms,
            state.inflight,
            queue_depth,
            providers,
            state.paused,
        )
    }

    pub fn health(&self) -> SchedulerHealth {
        SchedulerHealth::assess(&self.metrics())
    }

    /// Rejects queued work, cancels retry waits, then waits for in-flight
    /// requests to settle.
    pub async fn destroy(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queues.drain_where(None, |_| true)
        };
        let rejected = self.inner.cancel_jobs(drained, "scheduler is shutting down");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("🛑 Scheduler detenido ({} peticiones en cola rechazadas)", rejected);
    }
}

impl SchedulerInner {
    fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(provider) {
            return Arc::clone(existing.value());
        }
        let config = self.config.limits_for(provider).breaker();
        Arc::clone(
            self.breakers
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(provider, config)))
                .value(),
        )
    }

    fn cancel_jobs(&self, jobs: Vec<Job>, reason: &str) -> usize {
        let count = jobs.len();
        for job in jobs {
            job.reject(ApiError::cancelled(reason));
        }
        if count > 0 {
            SchedulerCounters::add(&self.counters.cancelled, count as u64);
            debug!("🗑️ {} queued requests cancelled: {}", count, reason);
        }
        count
    }

    async fn run(self: Arc<Self>) {
        debug!("Dispatcher started");
        loop {
            match self.next_step() {
                Step::Stop => break,
                Step::Again => tokio::task::yield_now().await,
                Step::Idle => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                    }
                }
                Step::SleepUntil(at) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Step::Dispatch(job, breaker) => self.launch(job, breaker),
                Step::CheckAuth(provider, gate) => {
                    let check = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        check = gate.ensure_valid(&provider) => check,
                    };
                    self.apply_auth(&provider, check);
                }
            }
        }
        debug!("Dispatcher stopped");
    }

    /// One pass of the selection loop, entirely under the state lock.
    fn next_step(&self) -> Step {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Step::Stop;
        }
        if state.paused || state.queues.is_empty() {
            return Step::Idle;
        }

        let counters = &self.counters;
        let selection = state.queues.select(now, self.config.batch_size, self.config.batch_delay(), |n| {
            SchedulerCounters::bump(&counters.batches_flushed);
            debug!("📦 Batch flushed: {} requests", n);
        });
        let priority = match selection {
            Selection::Empty => return Step::Idle,
            Selection::WaitUntil(at) => return Step::SleepUntil(at),
            Selection::Ready(priority) => priority,
        };
        if state.inflight >= self.config.max_concurrent {
            return Step::Idle;
        }
        let Some(provider) = state.queues.peek(priority).map(|job| job.provider.clone()) else {
            return Step::Again;
        };

        let breaker = self.breaker(&provider);
        if breaker.is_rejecting() {
            if let Some(job) = state.queues.pop(priority) {
                SchedulerCounters::bump(&self.counters.breaker_rejections);
                debug!(provider = %provider, id = job.id, "⛔ Circuit open, rejecting queued request");
                job.reject(ApiError::service_unavailable(&provider));
            }
            return Step::Again;
        }

        let ps = state
            .providers
            .entry(provider.clone())
            .or_insert_with(|| ProviderState::new(self.config.limits_for(&provider)));
        ps.prune_window(now);

        if ps.inflight >= ps.limits.max_concurrent {
            return Step::Idle;
        }

        if ps.is_saturated() {
            let mut hits = 0u64;
            for job in state.queues.iter_mut().filter(|j| j.provider == provider && !j.rate_counted) {
                job.rate_counted = true;
                hits += 1;
            }
            ps.rate_limit_hits += hits;
            ps.paced = true;
            SchedulerCounters::add(&self.counters.rate_limit_hits, hits);
            let release = ps.window_release(now);
            if hits > 0 {
                warn!(
                    provider = %provider,
                    "🚦 Rate window saturated, {} requests deferred for {:?}",
                    hits,
                    release.saturating_duration_since(now)
                );
            }
            return Step::SleepUntil(release);
        }

        if let Some(at) = ps.paced_until().filter(|at| *at > now) {
            return Step::SleepUntil(at);
        }

        if let Some(gate) = self.auth_gates.get(&provider).map(|g| Arc::clone(g.value())) {
            if let Some(at) = ps.auth_blocked_until.filter(|at| *at > now) {
                return Step::SleepUntil(at);
            }
            if !ps.auth_is_fresh(now) {
                return Step::CheckAuth(provider, gate);
            }
        }

        if !breaker.try_acquire() {
            if let Some(job) = state.queues.pop(priority) {
                SchedulerCounters::bump(&self.counters.breaker_rejections);
                job.reject(ApiError::service_unavailable(&provider));
            }
            return Step::Again;
        }

        let Some(mut job) = state.queues.pop(priority) else {
            breaker.release();
            return Step::Again;
        };
        job.attempt += 1;
        ps.record_dispatch(now);
        state.inflight += 1;
        if !state.queues.has_provider(&provider) {
            if let Some(ps) = state.providers.get_mut(&provider) {
                ps.paced = false;
            }
        }
        debug!(
            id = job.id,
            provider = %provider,
            attempt = job.attempt,
            priority = %job.priority,
            "🚀 Dispatching request"
        );
        Step::Dispatch(job, breaker)
    }

    fn apply_auth(&self, provider: &str, check: AuthCheck) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(ps) = state.providers.get_mut(provider) else {
            return;
        };

        if check.valid {
            ps.auth_failures = 0;
            ps.auth_blocked_until = None;
            ps.auth_valid_until = Some(now + ps.limits.auth_cache_ttl());
            debug!(provider = %provider, "🔐 Auth valid");
            return;
        }

        SchedulerCounters::bump(&self.counters.auth_failures);
        ps.auth_failures += 1;
        ps.auth_valid_until = None;
        let reason = check.error.unwrap_or_else(|| "authentication required".to_string());

        if ps.auth_failures >= ps.limits.max_auth_failures.max(1) {
            ps.auth_failures = 0;
            ps.auth_blocked_until = None;
            let rejected = Priority::ALL
                .into_iter()
                .find(|p| state.queues.peek(*p).is_some_and(|job| job.provider == provider))
                .and_then(|p| state.queues.pop(p));
            if let Some(job) = rejected {
                SchedulerCounters::bump(&self.counters.failed);
                error!(provider = %provider, id = job.id, "❌ Auth failed repeatedly: {}", reason);
                job.reject(ApiError::auth(reason).with_provider(provider));
            }
        } else {
            let delay = ps.limits.auth_retry_delay();
            ps.auth_blocked_until = Some(now + delay);
            warn!(
                provider = %provider,
                "🔐 Auth check failed ({}/{}), retrying in {:?}: {}",
                ps.auth_failures,
                ps.limits.max_auth_failures,
                delay,
                reason
            );
        }
    }

    fn launch(self: &Arc<Self>, mut job: Job, breaker: Arc<CircuitBreaker>) {
        let inner = Arc::clone(self);
        let fut = (job.factory)();
        self.tasks.spawn(async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(job.timeout, fut).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ApiError::timeout(job.timeout).with_provider(job.provider.clone())),
            };
            inner.settle(job, breaker, outcome, started.elapsed());
        });
    }

    fn settle(self: &Arc<Self>, job: Job, breaker: Arc<CircuitBreaker>, outcome: JobResult, latency: Duration) {
        let retry = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.inflight = state.inflight.saturating_sub(1);
            let closed = state.closed;
            let ps = state.providers.get_mut(&job.provider);

            match outcome {
                Ok(value) => {
                    breaker.record_success();
                    if let Some(ps) = ps {
                        ps.record_success();
                    }
                    let ms = latency.as_secs_f64() * 1000.0;
                    state.latency_samples += 1;
                    state.avg_latency_ms = if state.latency_samples == 1 {
                        ms
                    } else {
                        state.avg_latency_ms * 0.8 + ms * 0.2
                    };
                    SchedulerCounters::bump(&self.counters.completed);
                    debug!(id = job.id, provider = %job.provider, ?latency, "✅ Request completed");
                    let _ = job.reply.send(Ok(value));
                    None
                }
                Err(e) => {
                    if e.kind == ErrorKind::Timeout {
                        SchedulerCounters::bump(&self.counters.timeouts);
                    }
                    breaker.record_failure(e.kind.trips_breaker());
                    let delay = ps.map(|ps| {
                        ps.record_failure();
                        ps.limits.retry_delay(job.attempt, e.retry_after)
                    });

                    match delay {
                        Some(delay) if !closed && e.is_retryable() && job.attempt < job.max_attempts => {
                            SchedulerCounters::bump(&self.counters.retries);
                            warn!(
                                id = job.id,
                                provider = %job.provider,
                                "🔁 Attempt {}/{} failed ({}), retrying in {:?}",
                                job.attempt,
                                job.max_attempts,
                                e.code(),
                                delay
                            );
                            Some((job, delay))
                        }
                        _ => {
                            SchedulerCounters::bump(&self.counters.failed);
                            debug!(
                                id = job.id,
                                provider = %job.provider,
                                "❌ Request failed after {} attempts: {}",
                                job.attempt,
                                e
                            );
                            job.reject(e);
                            None
                        }
                    }
                }
            }
        };

        if let Some((job, delay)) = retry {
            self.schedule_retry(job, delay);
        }
        self.wake.notify_one();
    }

    fn schedule_retry(self: &Arc<Self>, job: Job, delay: Duration) {
        let inner = Arc::clone(self);
        let token = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    SchedulerCounters::bump(&inner.counters.cancelled);
                    job.reject(ApiError::cancelled("scheduler shut down during retry backoff"));
                }
                _ = tokio::time::sleep(delay) => inner.requeue_front(job),
            }
        });
    }

    fn requeue_front(&self, job: Job) {
        {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                SchedulerCounters::bump(&self.counters.cancelled);
                job.reject(ApiError::cancelled("scheduler is shut down"));
                return;
            }
            state.queues.push_front(job);
        }
        self.wake.notify_one();
    }
}
