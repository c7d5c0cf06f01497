//! Pacing Execution Queue
//!
//! Serialises every call to the image generation service through a single worker
//! so that request starts are spaced by an adaptive minimum interval. Throttling
//! responses put the queue into a cooldown and widen the interval; successes let
//! it decay back toward the configured floor.

use crate::error::{PipelineError, ServiceError};
use crate::progress::ProgressRuntime;
use crate::types::RunId;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BinaryHeap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Priority level for queued units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 1, // Dependent panels
    High = 2,   // Gate regenerations
    Urgent = 3, // Anchor panel
}

/// Request ID for tracking completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        RequestId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Clone)]
pub struct QueueEventContext {
    pub session_id: String,
    pub progress: Arc<ProgressRuntime>,
}

/// Who a unit belongs to and how urgent it is.
#[derive(Debug, Clone)]
pub struct SubmitContext {
    pub run_id: Option<RunId>,
    pub label: String,
    pub priority: Priority,
}

impl SubmitContext {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            run_id: None,
            label: label.into(),
            priority: Priority::Normal,
        }
    }

    pub fn for_run(mut self, run_id: &RunId) -> Self {
        self.run_id = Some(run_id.clone());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

type WorkFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, ServiceError>> + Send + Sync>;

struct QueuedUnit<T> {
    request_id: RequestId,
    context: SubmitContext,
    throttle_count: usize,
    created_at: Instant,
    work: WorkFn<T>,
    completion_tx: oneshot::Sender<Result<T, PipelineError>>,
}

impl<T> PartialEq for QueuedUnit<T> {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl<T> Eq for QueuedUnit<T> {}

impl<T> Ord for QueuedUnit<T> {
    /// Higher priority first, then older units first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.context.priority.cmp(&other.context.priority) {
            std::cmp::Ordering::Equal => self
                .created_at
                .cmp(&other.created_at)
                .reverse()
                .then_with(|| self.request_id.0.cmp(&other.request_id.0).reverse()),
            ordering => ordering,
        }
    }
}

impl<T> PartialOrd for QueuedUnit<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Pacing configuration for the generation service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Floor for the spacing between request starts (milliseconds)
    pub min_interval_ms: u64,
    /// Ceiling for the adaptive spacing (milliseconds)
    pub max_interval_ms: u64,
    /// Multiplier applied to the spacing after each throttle
    pub interval_backoff_factor: f64,
    /// First cooldown when the service throttles without a Retry-After hint
    pub base_cooldown_ms: u64,
    /// Longest cooldown the queue will impose
    pub max_cooldown_ms: u64,
    /// Times a single unit is re-queued after being throttled
    pub max_throttle_retries: usize,
    /// Maximum queued units (prevents unbounded memory growth)
    pub max_queue_size: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 6_000,
            max_interval_ms: 60_000,
            interval_backoff_factor: 1.5,
            base_cooldown_ms: 15_000,
            max_cooldown_ms: 120_000,
            max_throttle_retries: 4,
            max_queue_size: 256,
        }
    }
}

impl PacingConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.min_interval_ms))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.interval_backoff_factor < 1.0 || !self.interval_backoff_factor.is_finite() {
            return Err(format!(
                "pacing.interval_backoff_factor must be >= 1.0, got {}",
                self.interval_backoff_factor
            ));
        }
        if self.max_interval_ms < self.min_interval_ms {
            return Err(format!(
                "pacing.max_interval_ms ({}) is below pacing.min_interval_ms ({})",
                self.max_interval_ms, self.min_interval_ms
            ));
        }
        if self.max_queue_size == 0 {
            return Err("pacing.max_queue_size must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Number of queued units
    pub pending: usize,
    /// Number of units currently executing
    pub processing: usize,
    /// Units that returned a value
    pub completed: usize,
    /// Units that returned an error
    pub failed: usize,
    /// Throttling responses observed
    pub throttled: usize,
    /// Units dropped by run cancellation or shutdown
    pub cancelled: usize,
}

/// Adaptive pacing state shared by the worker and observers.
#[derive(Debug, Clone)]
struct RateLimitState {
    current_interval: Duration,
    cooldown_until: Option<Instant>,
    consecutive_throttles: u32,
    last_start: Option<Instant>,
}

impl RateLimitState {
    fn new(config: &PacingConfig) -> Self {
        Self {
            current_interval: config.min_interval(),
            cooldown_until: None,
            consecutive_throttles: 0,
            last_start: None,
        }
    }

    /// Time the worker must wait before the next unit may start.
    fn wait_before_start(&self, now: Instant) -> Option<Duration> {
        let spaced = self.last_start.map(|last| last + self.current_interval);
        let earliest = match (spaced, self.cooldown_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }?;
        (earliest > now).then(|| earliest - now)
    }

    fn record_start(&mut self, now: Instant) {
        self.last_start = Some(now);
    }

    /// Returns the cooldown imposed by this throttle.
    fn record_throttle(
        &mut self,
        now: Instant,
        retry_after: Option<Duration>,
        config: &PacingConfig,
    ) -> Duration {
        self.consecutive_throttles = self.consecutive_throttles.saturating_add(1);
        let cooldown = retry_after
            .unwrap_or_else(|| {
                let exponent = (self.consecutive_throttles - 1).min(16);
                Duration::from_millis(config.base_cooldown_ms.saturating_mul(1u64 << exponent))
            })
            .min(Duration::from_millis(config.max_cooldown_ms));
        self.cooldown_until = Some(now + cooldown);
        self.current_interval = self
            .current_interval
            .mul_f64(config.interval_backoff_factor)
            .min(config.max_interval());
        cooldown
    }

    fn record_success(&mut self, config: &PacingConfig) {
        self.consecutive_throttles = 0;
        self.current_interval = self
            .current_interval
            .div_f64(config.interval_backoff_factor.max(1.0))
            .max(config.min_interval());
    }

    fn snapshot(&self, now: Instant) -> RateLimitSnapshot {
        RateLimitSnapshot {
            current_interval: self.current_interval,
            cooldown_remaining: self
                .cooldown_until
                .and_then(|until| until.checked_duration_since(now))
                .filter(|remaining| !remaining.is_zero()),
            consecutive_throttles: self.consecutive_throttles,
        }
    }
}

/// Point-in-time view of the adaptive pacing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub current_interval: Duration,
    pub cooldown_remaining: Option<Duration>,
    pub consecutive_throttles: u32,
}

/// Single-worker pacing queue. Units of work are re-runnable closures so the
/// worker can re-queue them after a throttling response.
pub struct PacingQueue<T: Send + 'static> {
    /// Pending units (priority queue using BinaryHeap)
    queue: Arc<Mutex<BinaryHeap<QueuedUnit<T>>>>,
    /// Notifier to wake the worker when new units are enqueued
    notify: Arc<Notify>,
    worker: RwLock<Option<tokio::task::JoinHandle<()>>>,
    config: PacingConfig,
    rate_state: Arc<parking_lot::Mutex<RateLimitState>>,
    running: Arc<RwLock<bool>>,
    stats: Arc<RwLock<QueueStats>>,
    /// Runs whose queued and in-flight units must be discarded
    cancelled_runs: Arc<RwLock<HashSet<RunId>>>,
    event_context: Option<QueueEventContext>,
}

impl<T: Send + 'static> PacingQueue<T> {
    pub fn new(config: PacingConfig) -> Self {
        Self::with_event_context(config, None)
    }

    pub fn with_event_context(config: PacingConfig, event_context: Option<QueueEventContext>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            notify: Arc::new(Notify::new()),
            worker: RwLock::new(None),
            rate_state: Arc::new(parking_lot::Mutex::new(RateLimitState::new(&config))),
            config,
            running: Arc::new(RwLock::new(false)),
            stats: Arc::new(RwLock::new(QueueStats::default())),
            cancelled_runs: Arc::new(RwLock::new(HashSet::new())),
            event_context,
        }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Start the background worker. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut running = self.running.write();
        if *running {
            return Ok(()); // Already running
        }
        *running = true;
        drop(running);

        let queue = Arc::clone(&self.queue);
        let notify = Arc::clone(&self.notify);
        let config = self.config.clone();
        let rate_state = Arc::clone(&self.rate_state);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let cancelled_runs = Arc::clone(&self.cancelled_runs);
        let event_context = self.event_context.clone();

        let handle = tokio::spawn(async move {
            Self::worker_loop(
                queue,
                notify,
                config,
                rate_state,
                running,
                stats,
                cancelled_runs,
                event_context,
            )
            .await;
        });
        *self.worker.write() = Some(handle);

        info!(
            min_interval_ms = self.config.min_interval_ms,
            "Started pacing queue worker"
        );
        Ok(())
    }

    /// Stop the worker; units still queued fail with `QueueStopped`.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let mut running = self.running.write();
        if !*running {
            return Ok(()); // Already stopped
        }
        *running = false;
        drop(running);
        self.notify.notify_one();

        let handle = self.worker.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let drained: Vec<_> = self.queue.lock().await.drain().collect();
        if !drained.is_empty() {
            let mut stats = self.stats.write();
            stats.pending = stats.pending.saturating_sub(drained.len());
            stats.cancelled += drained.len();
        }
        for unit in drained {
            let _ = unit.completion_tx.send(Err(PipelineError::QueueStopped));
        }

        info!("Stopped pacing queue worker");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.read().clone()
    }

    pub fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        self.rate_state.lock().snapshot(Instant::now())
    }

    /// Enqueue `work` and wait for its result.
    ///
    /// Rate-limited results are retried by the queue itself up to
    /// `max_throttle_retries`; other errors are returned unchanged.
    pub async fn submit<F, Fut>(&self, context: SubmitContext, work: F) -> Result<T, PipelineError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
    {
        if !self.is_running() {
            return Err(PipelineError::QueueStopped);
        }
        if let Some(run_id) = &context.run_id {
            if self.cancelled_runs.read().contains(run_id) {
                return Err(PipelineError::Cancelled(run_id.to_string()));
            }
        }

        let (tx, rx) = oneshot::channel();
        let work: WorkFn<T> = Arc::new(move || -> BoxFuture<'static, Result<T, ServiceError>> {
            Box::pin(work())
        });
        let unit = QueuedUnit {
            request_id: RequestId::next(),
            context,
            throttle_count: 0,
            created_at: Instant::now(),
            work,
            completion_tx: tx,
        };
        let label = unit.context.label.clone();
        let request_id = unit.request_id;

        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.config.max_queue_size {
                return Err(PipelineError::QueueFull);
            }
            queue.push(unit);
        }
        self.stats.write().pending += 1;
        self.notify.notify_one();
        debug!(request_id = request_id.as_u64(), label = %label, "Unit enqueued");

        rx.await.map_err(|_| PipelineError::QueueStopped)?
    }

    /// Drop every queued unit of `run_id` and discard its in-flight result.
    /// Returns the number of queued units removed.
    pub async fn cancel_run(&self, run_id: &RunId) -> usize {
        self.cancelled_runs.write().insert(run_id.clone());

        let removed = {
            let mut queue = self.queue.lock().await;
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *queue)
                .into_vec()
                .into_iter()
                .partition(|unit| unit.context.run_id.as_ref() == Some(run_id));
            *queue = kept.into_iter().collect();
            removed
        };

        let count = removed.len();
        if count > 0 {
            let mut stats = self.stats.write();
            stats.pending = stats.pending.saturating_sub(count);
            stats.cancelled += count;
        }
        for unit in removed {
            let _ = unit
                .completion_tx
                .send(Err(PipelineError::Cancelled(run_id.to_string())));
        }
        info!(run_id = %run_id, removed = count, "Cancelled queued units for run");
        count
    }

    /// Forget a finished run's cancellation marker.
    pub fn release_run(&self, run_id: &RunId) {
        self.cancelled_runs.write().remove(run_id);
    }

    fn is_cancelled(cancelled_runs: &RwLock<HashSet<RunId>>, context: &SubmitContext) -> bool {
        context
            .run_id
            .as_ref()
            .map(|run_id| cancelled_runs.read().contains(run_id))
            .unwrap_or(false)
    }

    #[allow(clippy::too_many_arguments)]
    async fn worker_loop(
        queue: Arc<Mutex<BinaryHeap<QueuedUnit<T>>>>,
        notify: Arc<Notify>,
        config: PacingConfig,
        rate_state: Arc<parking_lot::Mutex<RateLimitState>>,
        running: Arc<RwLock<bool>>,
        stats: Arc<RwLock<QueueStats>>,
        cancelled_runs: Arc<RwLock<HashSet<RunId>>>,
        event_context: Option<QueueEventContext>,
    ) {
        debug!("Pacing worker started");

        while *running.read() {
            // Next unit (highest priority first)
            let unit = {
                let mut queue_guard = queue.lock().await;
                queue_guard.pop()
            };

            let Some(mut unit) = unit else {
                // Periodic wake-up so a stop request is observed
                tokio::select! {
                    _ = notify.notified() => continue,
                    _ = sleep(Duration::from_millis(100)) => continue,
                }
            };

            // Respect spacing and any active cooldown before starting
            let wait = rate_state.lock().wait_before_start(Instant::now());
            if let Some(wait) = wait {
                debug!(
                    request_id = unit.request_id.as_u64(),
                    wait_ms = wait.as_millis() as u64,
                    "Pacing wait before start"
                );
                sleep(wait).await;
            }

            if Self::is_cancelled(&cancelled_runs, &unit.context) {
                {
                    let mut stats = stats.write();
                    stats.pending = stats.pending.saturating_sub(1);
                    stats.cancelled += 1;
                }
                let run = unit
                    .context
                    .run_id
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                let _ = unit.completion_tx.send(Err(PipelineError::Cancelled(run)));
                continue;
            }

            rate_state.lock().record_start(Instant::now());
            {
                let mut stats = stats.write();
                stats.pending = stats.pending.saturating_sub(1);
                stats.processing += 1;
            }
            let started = Instant::now();
            let work = Arc::clone(&unit.work);
            // A panicking unit fails alone; the worker keeps draining
            let result = AssertUnwindSafe(async move { work().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(
                        request_id = unit.request_id.as_u64(),
                        label = %unit.context.label,
                        panic = %message,
                        "Queued unit panicked"
                    );
                    Err(ServiceError::terminal(format!("work unit panicked: {}", message)))
                });
            let duration_ms = started.elapsed().as_millis() as u64;
            stats.write().processing -= 1;

            match result {
                Err(err @ ServiceError::RateLimited { .. }) => {
                    let cooldown = rate_state.lock().record_throttle(
                        Instant::now(),
                        err.retry_after(),
                        &config,
                    );
                    stats.write().throttled += 1;
                    let snapshot = rate_state.lock().snapshot(Instant::now());
                    warn!(
                        request_id = unit.request_id.as_u64(),
                        label = %unit.context.label,
                        cooldown_ms = cooldown.as_millis() as u64,
                        interval_ms = snapshot.current_interval.as_millis() as u64,
                        throttle_count = unit.throttle_count + 1,
                        "Generation service throttled; entering cooldown"
                    );
                    Self::emit_event(
                        &event_context,
                        "queue_throttled",
                        json!({
                            "label": unit.context.label,
                            "run_id": unit.context.run_id,
                            "cooldown_ms": cooldown.as_millis() as u64,
                            "interval_ms": snapshot.current_interval.as_millis() as u64,
                            "throttle_count": unit.throttle_count + 1,
                        }),
                    );

                    if unit.throttle_count < config.max_throttle_retries
                        && !Self::is_cancelled(&cancelled_runs, &unit.context)
                    {
                        unit.throttle_count += 1;
                        queue.lock().await.push(unit);
                        stats.write().pending += 1;
                        continue;
                    }
                    stats.write().failed += 1;
                    Self::complete(unit, Err(PipelineError::Service(err)), &cancelled_runs, &stats);
                }
                Ok(value) => {
                    rate_state.lock().record_success(&config);
                    stats.write().completed += 1;
                    debug!(
                        request_id = unit.request_id.as_u64(),
                        label = %unit.context.label,
                        duration_ms,
                        "Unit completed"
                    );
                    Self::complete(unit, Ok(value), &cancelled_runs, &stats);
                }
                Err(err) => {
                    stats.write().failed += 1;
                    debug!(
                        request_id = unit.request_id.as_u64(),
                        label = %unit.context.label,
                        error = %err,
                        "Unit failed"
                    );
                    Self::complete(unit, Err(PipelineError::Service(err)), &cancelled_runs, &stats);
                }
            }
        }

        debug!("Pacing worker stopped");
    }

    fn complete(
        unit: QueuedUnit<T>,
        result: Result<T, PipelineError>,
        cancelled_runs: &RwLock<HashSet<RunId>>,
        stats: &RwLock<QueueStats>,
    ) {
        let result = if Self::is_cancelled(cancelled_runs, &unit.context) {
            stats.write().cancelled += 1;
            let run = unit
                .context
                .run_id
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_default();
            Err(PipelineError::Cancelled(run))
        } else {
            result
        };
        let _ = unit.completion_tx.send(result);
    }

    fn emit_event(event_context: &Option<QueueEventContext>, event_type: &str, data: serde_json::Value) {
        if let Some(ctx) = event_context {
            ctx.progress
                .emit_event_best_effort(&ctx.session_id, event_type, data);
        }
    }
}

impl<T: Send + 'static> Drop for PacingQueue<T> {
    fn drop(&mut self) {
        *self.running.write() = false;
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> PacingConfig {
        PacingConfig {
            min_interval_ms: 1_000,
            max_interval_ms: 8_000,
            interval_backoff_factor: 2.0,
            base_cooldown_ms: 5_000,
            max_cooldown_ms: 20_000,
            max_throttle_retries: 3,
            max_queue_size: 16,
        }
    }

    #[test]
    fn cooldown_grows_and_is_capped() {
        let config = fast_config();
        let mut state = RateLimitState::new(&config);
        let now = Instant::now();
        assert_eq!(
            state.record_throttle(now, None, &config),
            Duration::from_secs(5)
        );
        assert_eq!(
            state.record_throttle(now, None, &config),
            Duration::from_secs(10)
        );
        assert_eq!(
            state.record_throttle(now, None, &config),
            Duration::from_secs(20)
        );
        assert_eq!(
            state.record_throttle(now, None, &config),
            Duration::from_secs(20)
        );
        assert_eq!(state.current_interval, Duration::from_secs(8));
    }

    #[test]
    fn retry_after_hint_sets_cooldown() {
        let config = fast_config();
        let mut state = RateLimitState::new(&config);
        let now = Instant::now();
        let cooldown = state.record_throttle(now, Some(Duration::from_secs(3)), &config);
        assert_eq!(cooldown, Duration::from_secs(3));
        assert_eq!(
            state.snapshot(now).cooldown_remaining,
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn success_decays_interval_toward_floor() {
        let config = fast_config();
        let mut state = RateLimitState::new(&config);
        let now = Instant::now();
        state.record_throttle(now, None, &config);
        state.record_throttle(now, None, &config);
        assert_eq!(state.current_interval, Duration::from_secs(4));
        state.record_success(&config);
        assert_eq!(state.current_interval, Duration::from_secs(2));
        state.record_success(&config);
        state.record_success(&config);
        assert_eq!(state.current_interval, Duration::from_secs(1));
        assert_eq!(state.consecutive_throttles, 0);
    }

    #[test]
    fn higher_priority_units_pop_first() {
        let mut heap = BinaryHeap::new();
        for (label, priority) in [
            ("dependent", Priority::Normal),
            ("anchor", Priority::Urgent),
            ("retry", Priority::High),
        ] {
            let (tx, _rx) = oneshot::channel::<Result<u32, PipelineError>>();
            heap.push(QueuedUnit {
                request_id: RequestId::next(),
                context: SubmitContext::new(label).with_priority(priority),
                throttle_count: 0,
                created_at: Instant::now(),
                work: Arc::new(|| -> BoxFuture<'static, Result<u32, ServiceError>> {
                    Box::pin(async { Ok(0) })
                }),
                completion_tx: tx,
            });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|unit| unit.context.label)
            .collect();
        assert_eq!(order, vec!["anchor", "retry", "dependent"]);
    }

    #[tokio::test(start_paused = true)]
    async fn starts_are_spaced_by_min_interval() {
        let queue = Arc::new(PacingQueue::<Instant>::new(fast_config()));
        queue.start().unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue
                    .submit(SubmitContext::new(format!("unit-{}", i)), || async {
                        Ok(Instant::now())
                    })
                    .await
            }));
        }
        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap().unwrap());
        }
        starts.sort();
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
        assert_eq!(queue.stats().completed, 3);
        queue.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_unit_is_retried_after_cooldown() {
        let queue = PacingQueue::<u32>::new(fast_config());
        queue.start().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let begun = Instant::now();
        let value = queue
            .submit(SubmitContext::new("flaky"), move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ServiceError::rate_limited("429", Some(Duration::from_secs(7))))
                    } else {
                        Ok(11)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 11);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(begun.elapsed() >= Duration::from_secs(7));
        let stats = queue.stats();
        assert_eq!(stats.throttled, 1);
        assert_eq!(stats.completed, 1);
        queue.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_retries_are_bounded() {
        let mut config = fast_config();
        config.max_throttle_retries = 1;
        let queue = PacingQueue::<u32>::new(config);
        queue.start().unwrap();

        let result = queue
            .submit(SubmitContext::new("always-429"), || async {
                Err(ServiceError::rate_limited("429", None))
            })
            .await;

        match result {
            Err(PipelineError::Service(ServiceError::RateLimited { .. })) => {}
            other => panic!("expected rate limit error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(queue.stats().throttled, 2);
        assert!(queue.rate_limit_snapshot().consecutive_throttles >= 2);
        queue.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn non_throttle_errors_pass_through() {
        let queue = PacingQueue::<u32>::new(fast_config());
        queue.start().unwrap();
        let result = queue
            .submit(SubmitContext::new("bad"), || async {
                Err(ServiceError::terminal("invalid prompt"))
            })
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::Service(ServiceError::Terminal { .. }))
        ));
        assert_eq!(queue.stats().failed, 1);
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn submit_before_start_is_rejected() {
        let queue = PacingQueue::<u32>::new(fast_config());
        let result = queue.submit(SubmitContext::new("x"), || async { Ok(1) }).await;
        assert!(matches!(result, Err(PipelineError::QueueStopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_unit_fails_alone() {
        let queue = PacingQueue::<u32>::new(fast_config());
        queue.start().unwrap();

        let result = queue
            .submit(SubmitContext::new("panics"), || async {
                if true {
                    panic!("renderer crashed");
                }
                Ok(0)
            })
            .await;
        match result {
            Err(PipelineError::Service(ServiceError::Terminal { message })) => {
                assert!(message.contains("renderer crashed"));
            }
            other => panic!("expected terminal error, got {:?}", other.map(|_| ())),
        }
        assert!(queue.is_running());

        let next = tokio::time::timeout(
            Duration::from_secs(60),
            queue.submit(SubmitContext::new("after"), || async { Ok(5) }),
        )
        .await
        .expect("worker still drains the queue");
        assert_eq!(next.unwrap(), 5);
        assert_eq!(queue.stats().failed, 1);
        queue.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_run_drops_queued_and_discards_in_flight() {
        let queue = Arc::new(PacingQueue::<u32>::new(fast_config()));
        queue.start().unwrap();
        let run = RunId("run-aborted".to_string());
        let calls = Arc::new(AtomicUsize::new(0));

        let submit = |label: &'static str| {
            let queue = Arc::clone(&queue);
            let run = run.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                queue
                    .submit(SubmitContext::new(label).for_run(&run), move || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            sleep(Duration::from_secs(10)).await;
                            Ok(1)
                        }
                    })
                    .await
            })
        };

        let in_flight = submit("in-flight");
        sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.stats().processing, 1);
        let queued = vec![submit("queued-1"), submit("queued-2")];
        sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.stats().pending, 2);

        assert_eq!(queue.cancel_run(&run).await, 2);
        for handle in queued {
            assert!(matches!(handle.await.unwrap(), Err(PipelineError::Cancelled(_))));
        }
        assert!(matches!(in_flight.await.unwrap(), Err(PipelineError::Cancelled(_))));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = queue.stats();
        assert_eq!(stats.cancelled, 3);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.processing, 0);
        queue.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_rejects_new_units() {
        let queue = PacingQueue::<u32>::new(fast_config());
        queue.start().unwrap();
        let run = RunId("run-cancelled".to_string());
        queue.cancel_run(&run).await;

        let result = queue
            .submit(SubmitContext::new("late").for_run(&run), || async { Ok(1) })
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled(_))));

        queue.release_run(&run);
        let result = queue
            .submit(SubmitContext::new("again").for_run(&run), || async { Ok(2) })
            .await;
        assert_eq!(result.unwrap(), 2);
        queue.stop().await.unwrap();
    }
}
