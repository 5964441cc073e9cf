//! Background task engine.
//!
//! # Responsibilities
//! - Accept work without running it on the caller's task
//! - Run at most `workers` tasks at once, retrying per policy
//! - Drive scheduled tasks through their runs until done or cancelled
//! - Track every task until the retention sweep drops it after finishing
//!
//! # Design Decisions
//! - The pending queue is a bounded channel; `enqueue` uses `try_send`, so a
//!   full queue is reported immediately instead of blocking the request
//! - The dispatcher takes a worker permit before pulling from the queue:
//!   tasks waiting for a worker stay in the queue and count toward the bound
//! - Queue depth is read from the channel's free capacity, never tracked
//!   separately
//! - Scheduled tasks hold a worker permit only while a run is executing
//! - Cancellation is a watch flag the work observes; running work is never
//!   aborted from outside

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::SharedClock;
use crate::config::{RetentionPolicy, TaskConfig};
use crate::id::{Identifier, SnowflakeGenerator};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::tasks::types::{
    CancelOutcome, RetryPolicy, Schedule, TaskContext, TaskError, TaskFailure, TaskSpec, TaskState,
    TaskStatus, Trigger,
};

struct TaskRecord {
    status: TaskStatus,
    finished_at: Option<Instant>,
    cancel_tx: watch::Sender<bool>,
    state_tx: watch::Sender<TaskState>,
}

struct Queued {
    id: Identifier,
    policy: RetryPolicy,
    spec: TaskSpec,
}

/// How one run of a task ended.
struct RunEnd {
    state: TaskState,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl RunEnd {
    fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            state: TaskState::Cancelled,
            result: None,
            error: Some(reason.into()),
        }
    }

    fn failed(state: TaskState, failure: &TaskFailure) -> Self {
        Self {
            state,
            result: None,
            error: Some(failure.message().to_string()),
        }
    }
}

struct EngineInner {
    ids: Arc<SnowflakeGenerator>,
    clock: SharedClock,
    default_policy: RetryPolicy,
    queue_bound: usize,
    retention: Duration,
    keep_count: usize,
    retention_policy: RetentionPolicy,
    cleanup_interval: Duration,
    attempt_timeout: Option<Duration>,
    records: DashMap<Identifier, TaskRecord>,
    queue_tx: mpsc::Sender<Queued>,
    queue_rx: Mutex<Option<mpsc::Receiver<Queued>>>,
    workers: Arc<Semaphore>,
}

/// Handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("tracked", &self.inner.records.len())
            .field("queued", &self.queue_depth())
            .finish()
    }
}

impl TaskEngine {
    pub fn new(config: &TaskConfig, ids: Arc<SnowflakeGenerator>, clock: SharedClock) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_bound.max(1));
        Self {
            inner: Arc::new(EngineInner {
                ids,
                clock,
                default_policy: RetryPolicy::from_config(config),
                queue_bound: config.queue_bound,
                retention: config.retention(),
                keep_count: config.keep_count,
                retention_policy: config.retention_policy,
                cleanup_interval: config.cleanup_interval(),
                attempt_timeout: config.attempt_timeout_ms.map(Duration::from_millis),
                records: DashMap::new(),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
            }),
        }
    }

    /// Spawn the dispatcher and the retention cleanup loop. Only the first
    /// call has any effect.
    pub fn start(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let rx = self
            .inner
            .queue_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        let Some(rx) = rx else {
            tracing::warn!("Task engine already started");
            return Vec::new();
        };

        let dispatcher = tokio::spawn(dispatch(self.inner.clone(), rx, shutdown.subscribe()));
        let cleanup = tokio::spawn(cleanup_loop(self.inner.clone(), shutdown.subscribe()));
        vec![dispatcher, cleanup]
    }

    /// Queue `spec` and return its id without running it.
    pub fn enqueue(&self, spec: TaskSpec) -> Result<Identifier, TaskError> {
        if let Some(schedule) = &spec.schedule {
            schedule.validate()?;
        }

        let inner = &self.inner;
        let id = inner.ids.next();
        let policy = spec.policy.unwrap_or(inner.default_policy);
        let (cancel_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(TaskState::Pending);

        inner.records.insert(
            id,
            TaskRecord {
                status: TaskStatus {
                    id,
                    name: spec.name.clone(),
                    correlation_id: spec.correlation_id,
                    state: TaskState::Pending,
                    runs: 0,
                    attempts: 0,
                    max_attempts: policy.max_attempts,
                    enqueued_at_ms: inner.clock.unix_millis(),
                    last_attempt_at_ms: None,
                    finished_at_ms: None,
                    next_run_at_ms: None,
                    result: None,
                    error: None,
                },
                finished_at: None,
                cancel_tx,
                state_tx,
            },
        );

        let name = spec.name.clone();
        match inner.queue_tx.try_send(Queued { id, policy, spec }) {
            Ok(()) => {
                let depth = self.queue_depth();
                metrics::set_task_queue_depth(depth);
                metrics::record_task_state(TaskState::Pending.as_str());
                tracing::debug!(task_id = %id, task = %name, depth, "Task enqueued");
                Ok(id)
            }
            Err(TrySendError::Full(_)) => {
                inner.records.remove(&id);
                tracing::warn!(
                    task = %name,
                    bound = inner.queue_bound,
                    "Task queue full, rejecting"
                );
                Err(TaskError::RejectedOverload {
                    bound: inner.queue_bound,
                })
            }
            Err(TrySendError::Closed(_)) => {
                inner.records.remove(&id);
                Err(TaskError::ShuttingDown)
            }
        }
    }

    pub fn status(&self, id: Identifier) -> Result<TaskStatus, TaskError> {
        self.inner
            .records
            .get(&id)
            .map(|r| r.status.clone())
            .ok_or(TaskError::NotFound(id))
    }

    pub fn state(&self, id: Identifier) -> Option<TaskState> {
        self.inner.records.get(&id).map(|r| r.status.state)
    }

    /// Watch a task's state changes.
    pub fn subscribe(&self, id: Identifier) -> Result<watch::Receiver<TaskState>, TaskError> {
        self.inner
            .records
            .get(&id)
            .map(|r| r.state_tx.subscribe())
            .ok_or(TaskError::NotFound(id))
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait(&self, id: Identifier) -> Result<TaskStatus, TaskError> {
        let mut rx = self.subscribe(id)?;
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| TaskError::NotFound(id))?;
        self.status(id)
    }

    /// Cancel a pending task outright, or signal a running one. A scheduled
    /// task between runs counts as pending, so no further run starts.
    pub fn cancel(&self, id: Identifier) -> Result<CancelOutcome, TaskError> {
        let outcome = {
            let mut record = self.inner.records.get_mut(&id).ok_or(TaskError::NotFound(id))?;
            match record.status.state {
                TaskState::Pending => {
                    record.cancel_tx.send_replace(true);
                    let reason = Some("cancelled".to_string());
                    self.inner.mark_terminal(&mut record, TaskState::Cancelled, None, reason);
                    CancelOutcome::Cancelled
                }
                TaskState::Running => {
                    record.cancel_tx.send_replace(true);
                    CancelOutcome::Signalled
                }
                finished => CancelOutcome::AlreadyFinished(finished),
            }
        };
        if outcome == CancelOutcome::Cancelled {
            metrics::record_task_state(TaskState::Cancelled.as_str());
        }
        tracing::info!(task_id = %id, outcome = ?outcome, "Task cancellation requested");
        Ok(outcome)
    }

    /// Apply the retention policy: drop terminal records older than the
    /// retention window and/or the oldest beyond `keep_count`.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Tasks waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.inner.queue_depth()
    }

    pub fn tracked(&self) -> usize {
        self.inner.records.len()
    }
}

impl EngineInner {
    fn queue_depth(&self) -> usize {
        self.queue_tx.max_capacity().saturating_sub(self.queue_tx.capacity())
    }

    fn cancel_receiver(&self, id: Identifier) -> Option<watch::Receiver<bool>> {
        self.records.get(&id).map(|r| r.cancel_tx.subscribe())
    }

    /// Move a task to Running for `attempt` of `run`. Returns false if it
    /// already reached a terminal state (cancelled while queued).
    fn begin_attempt(&self, id: Identifier, run: u32, attempt: u32) -> bool {
        let Some(mut record) = self.records.get_mut(&id) else {
            return false;
        };
        if record.status.state.is_terminal() || *record.cancel_tx.borrow() {
            return false;
        }
        record.status.state = TaskState::Running;
        record.status.runs = run;
        record.status.attempts = attempt;
        record.status.last_attempt_at_ms = Some(self.clock.unix_millis());
        record.status.next_run_at_ms = None;
        record.state_tx.send_replace(TaskState::Running);
        metrics::record_task_state(TaskState::Running.as_str());
        true
    }

    fn await_retry(&self, id: Identifier, error: &TaskFailure) {
        if let Some(mut record) = self.records.get_mut(&id) {
            if record.status.state.is_terminal() {
                return;
            }
            record.status.state = TaskState::Pending;
            record.status.error = Some(error.message().to_string());
            record.state_tx.send_replace(TaskState::Pending);
        }
    }

    /// A scheduled run ended but more runs follow: back to Pending, keeping
    /// the run's result for pollers.
    fn await_next_run(&self, id: Identifier, end: &RunEnd, next_in: Duration) {
        let Some(mut record) = self.records.get_mut(&id) else {
            return;
        };
        if record.status.state.is_terminal() {
            return;
        }
        record.status.state = TaskState::Pending;
        record.status.result = end.result.clone();
        record.status.error = end.error.clone();
        record.status.next_run_at_ms = Some(self.next_run_at(next_in));
        record.state_tx.send_replace(TaskState::Pending);
        metrics::record_task_state(end.state.as_str());
    }

    fn set_next_run(&self, id: Identifier, next_in: Duration) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.status.next_run_at_ms = Some(self.next_run_at(next_in));
        }
    }

    fn next_run_at(&self, next_in: Duration) -> u64 {
        let next_in = u64::try_from(next_in.as_millis()).unwrap_or(u64::MAX);
        self.clock.unix_millis().saturating_add(next_in)
    }

    /// Record a terminal state. The first terminal state wins.
    fn finish(&self, id: Identifier, end: RunEnd) {
        let Some(mut record) = self.records.get_mut(&id) else {
            return;
        };
        let state = end.state;
        if !self.mark_terminal(&mut record, state, end.result, end.error) {
            return;
        }
        let attempts = record.status.attempts;
        let runs = record.status.runs;
        drop(record);

        metrics::record_task_state(state.as_str());
        match state {
            TaskState::Exhausted | TaskState::Failed => {
                tracing::error!(task_id = %id, state = %state, runs, attempts, "Task failed")
            }
            _ => tracing::debug!(task_id = %id, state = %state, runs, attempts, "Task finished"),
        }
    }

    fn mark_terminal(
        &self,
        record: &mut TaskRecord,
        state: TaskState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> bool {
        if record.status.state.is_terminal() {
            return false;
        }
        record.status.state = state;
        record.status.result = result;
        if error.is_some() {
            record.status.error = error;
        }
        record.status.finished_at_ms = Some(self.clock.unix_millis());
        record.status.next_run_at_ms = None;
        record.finished_at = Some(self.clock.now());
        record.state_tx.send_replace(state);
        true
    }

    fn purge_expired(&self) -> usize {
        let before = self.records.len();

        if self.retention_policy.by_age() {
            let now = self.clock.now();
            self.records.retain(|_, record| match record.finished_at {
                Some(at) => now.saturating_duration_since(at) < self.retention,
                None => true,
            });
        }

        if self.retention_policy.by_count() {
            let mut finished: Vec<(Instant, Identifier)> = self
                .records
                .iter()
                .filter_map(|r| r.finished_at.map(|at| (at, *r.key())))
                .collect();
            if finished.len() > self.keep_count {
                finished.sort_unstable();
                let excess = finished.len() - self.keep_count;
                for (_, id) in finished.into_iter().take(excess) {
                    self.records.remove(&id);
                }
            }
        }

        let purged = before.saturating_sub(self.records.len());
        if purged > 0 {
            tracing::debug!(purged, remaining = self.records.len(), "Purged finished tasks");
        }
        purged
    }

    fn cancel_all(&self) {
        let mut cancelled = 0;
        for mut record in self.records.iter_mut() {
            match record.status.state {
                TaskState::Pending => {
                    record.cancel_tx.send_replace(true);
                    let reason = Some("engine shut down".to_string());
                    if self.mark_terminal(&mut record, TaskState::Cancelled, None, reason) {
                        cancelled += 1;
                    }
                }
                TaskState::Running => {
                    record.cancel_tx.send_replace(true);
                }
                _ => {}
            }
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled pending tasks on shutdown");
        }
    }
}

async fn dispatch(
    inner: Arc<EngineInner>,
    mut rx: mpsc::Receiver<Queued>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let permit = tokio::select! {
            permit = inner.workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.recv() => break,
        };
        let queued = tokio::select! {
            queued = rx.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
            _ = shutdown.recv() => break,
        };

        metrics::set_task_queue_depth(inner.queue_depth());

        let inner = inner.clone();
        let schedule = queued.spec.schedule;
        match schedule {
            Some(schedule) => {
                drop(permit);
                tokio::spawn(run_schedule(inner, queued, schedule));
            }
            None => {
                tokio::spawn(async move {
                    run_task(&inner, queued).await;
                    drop(permit);
                });
            }
        }
    }

    rx.close();
    inner.cancel_all();
    tracing::debug!("Task dispatcher stopped");
}

async fn run_task(inner: &EngineInner, queued: Queued) {
    let Queued { id, policy, spec } = queued;
    let Some(mut cancel_rx) = inner.cancel_receiver(id) else {
        return;
    };
    let end = run_attempts(inner, id, 1, policy, &spec, &mut cancel_rx).await;
    inner.finish(id, end);
}

/// Drive a scheduled task: one full attempt loop per tick, until the run
/// limit is reached or the task is cancelled.
async fn run_schedule(inner: Arc<EngineInner>, queued: Queued, schedule: Schedule) {
    let Queued { id, policy, spec } = queued;
    let Some(mut cancel_rx) = inner.cancel_receiver(id) else {
        return;
    };

    let first_tick = match schedule.trigger {
        Trigger::OnStart => tokio::time::Instant::now(),
        Trigger::AfterInterval => tokio::time::Instant::now() + schedule.interval,
    };
    let mut ticker = tokio::time::interval_at(first_tick, schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if schedule.trigger == Trigger::AfterInterval {
        inner.set_next_run(id, schedule.interval);
    }

    let mut run = 0u32;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
                inner.finish(id, RunEnd::cancelled("cancelled"));
                return;
            }
        }

        let permit = tokio::select! {
            permit = inner.workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    inner.finish(id, RunEnd::cancelled("engine shut down"));
                    return;
                }
            },
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
                inner.finish(id, RunEnd::cancelled("cancelled"));
                return;
            }
        };

        run += 1;
        let end = run_attempts(&inner, id, run, policy, &spec, &mut cancel_rx).await;
        drop(permit);

        let done = schedule.run_limit().is_some_and(|limit| run >= limit);
        if done || end.state == TaskState::Cancelled {
            inner.finish(id, end);
            return;
        }

        tracing::debug!(
            task_id = %id,
            task = %spec.name,
            run,
            state = %end.state,
            "Scheduled run finished"
        );
        inner.await_next_run(id, &end, schedule.interval);
    }
}

/// Attempts of one run, with backoff between them. Never records a terminal
/// state itself.
async fn run_attempts(
    inner: &EngineInner,
    id: Identifier,
    run: u32,
    policy: RetryPolicy,
    spec: &TaskSpec,
    cancel_rx: &mut watch::Receiver<bool>,
) -> RunEnd {
    let mut attempt = 0;
    loop {
        attempt += 1;
        if *cancel_rx.borrow() || !inner.begin_attempt(id, run, attempt) {
            return RunEnd::cancelled("cancelled");
        }

        let ctx = TaskContext {
            id,
            run,
            attempt,
            correlation_id: spec.correlation_id,
            cancel: cancel_rx.clone(),
        };
        let work = AssertUnwindSafe(async move { (spec.work)(ctx).await }).catch_unwind();
        let outcome = match inner.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Ok(Err(TaskFailure::retryable(format!(
                    "attempt timed out after {}ms",
                    limit.as_millis()
                )))),
            },
            None => work.await,
        };

        let failure = match outcome {
            Ok(Ok(value)) => {
                return RunEnd {
                    state: TaskState::Succeeded,
                    result: Some(value),
                    error: None,
                };
            }
            Ok(Err(failure)) => failure,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    task_id = %id,
                    task = %spec.name,
                    attempt,
                    panic = %message,
                    "Task panicked"
                );
                TaskFailure::permanent(format!("task panicked: {message}"))
            }
        };

        if *cancel_rx.borrow() {
            return RunEnd::cancelled(failure.message());
        }
        if !failure.is_retryable() {
            return RunEnd::failed(TaskState::Failed, &failure);
        }
        if attempt >= policy.max_attempts {
            return RunEnd::failed(TaskState::Exhausted, &failure);
        }

        let delay = policy.delay_after(attempt);
        tracing::warn!(
            task_id = %id,
            task = %spec.name,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Task attempt failed, retrying"
        );
        inner.await_retry(id, &failure);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
                return RunEnd::cancelled("cancelled");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn cleanup_loop(inner: Arc<EngineInner>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(inner.cleanup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.purge_expired();
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use crate::clock::{self, ManualClock};

    fn config() -> TaskConfig {
        TaskConfig {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            queue_bound: 8,
            workers: 2,
            ..TaskConfig::default()
        }
    }

    fn engine_with(config: &TaskConfig, clock: SharedClock) -> TaskEngine {
        let ids = Arc::new(SnowflakeGenerator::new(1, 0, clock::system()).unwrap());
        TaskEngine::new(config, ids, clock)
    }

    fn engine(config: &TaskConfig) -> TaskEngine {
        engine_with(config, clock::system())
    }

    #[tokio::test]
    async fn runs_work_to_success() {
        let shutdown = Shutdown::new();
        let engine = engine(&config());
        engine.start(&shutdown);

        let id = engine
            .enqueue(TaskSpec::new("answer", |_ctx| async { Ok(json!(42)) }))
            .unwrap();
        let status = engine.wait(id).await.unwrap();

        assert_eq!(status.state, TaskState::Succeeded);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.result, Some(json!(42)));
    }

    #[tokio::test]
    async fn exhausts_after_exactly_max_attempts() {
        let shutdown = Shutdown::new();
        let engine = engine(&config());
        engine.start(&shutdown);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let id = engine
            .enqueue(TaskSpec::new("flaky", move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TaskFailure::retryable("downstream unavailable"))
                }
            }))
            .unwrap();

        let status = engine.wait(id).await.unwrap();
        assert_eq!(status.state, TaskState::Exhausted);
        assert_eq!(status.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(status.error.as_deref(), Some("downstream unavailable"));
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let shutdown = Shutdown::new();
        let engine = engine(&config());
        engine.start(&shutdown);

        let id = engine
            .enqueue(TaskSpec::new("bad-input", |_ctx| async {
                Err(TaskFailure::permanent("invalid payload"))
            }))
            .unwrap();
        let status = engine.wait(id).await.unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.attempts, 1);
    }

    #[tokio::test]
    async fn policy_override_applies() {
        let shutdown = Shutdown::new();
        let engine = engine(&config());
        engine.start(&shutdown);

        let id = engine
            .enqueue(
                TaskSpec::new("once", |_ctx| async { Err(TaskFailure::retryable("nope")) })
                    .with_policy(RetryPolicy::once()),
            )
            .unwrap();
        let status = engine.wait(id).await.unwrap();
        assert_eq!(status.state, TaskState::Exhausted);
        assert_eq!(status.attempts, 1);
    }

    #[test]
    fn rejects_beyond_queue_bound_without_blocking() {
        let mut cfg = config();
        cfg.queue_bound = 2;
        // Not started: nothing drains the queue.
        let engine = engine(&cfg);
        let spec = || TaskSpec::new("noop", |_ctx| async { Ok(json!(null)) });

        assert!(engine.enqueue(spec()).is_ok());
        assert!(engine.enqueue(spec()).is_ok());
        assert!(matches!(
            engine.enqueue(spec()),
            Err(TaskError::RejectedOverload { bound: 2 })
        ));
        assert_eq!(engine.tracked(), 2);
        assert_eq!(engine.queue_depth(), 2);
    }

    #[tokio::test]
    async fn cancelled_pending_task_never_runs() {
        let shutdown = Shutdown::new();
        let engine = engine(&config());
        let ran = Arc::new(AtomicU32::new(0));
        let flag = ran.clone();

        let id = engine
            .enqueue(TaskSpec::new("doomed", move |_ctx| {
                let flag = flag.clone();
                async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }))
            .unwrap();
        assert_eq!(engine.cancel(id).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(engine.state(id), Some(TaskState::Cancelled));

        engine.start(&shutdown);
        let follow_up = engine
            .enqueue(TaskSpec::new("after", |_ctx| async { Ok(json!(null)) }))
            .unwrap();
        engine.wait(follow_up).await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(engine.state(id), Some(TaskState::Cancelled));
        assert_eq!(
            engine.cancel(id).unwrap(),
            CancelOutcome::AlreadyFinished(TaskState::Cancelled)
        );
    }

    #[tokio::test]
    async fn running_task_observes_cancellation() {
        let shutdown = Shutdown::new();
        let engine = engine(&config());
        engine.start(&shutdown);

        let id = engine
            .enqueue(TaskSpec::new("long", |ctx: TaskContext| async move {
                ctx.cancelled().await;
                Err(TaskFailure::retryable("stopped"))
            }))
            .unwrap();

        let mut states = engine.subscribe(id).unwrap();
        states.wait_for(|s| *s == TaskState::Running).await.unwrap();

        assert_eq!(engine.cancel(id).unwrap(), CancelOutcome::Signalled);
        let status = engine.wait(id).await.unwrap();
        assert_eq!(status.state, TaskState::Cancelled);
        assert_eq!(status.attempts, 1);
    }

    #[tokio::test]
    async fn attempt_timeout_counts_as_failure() {
        let shutdown = Shutdown::new();
        let mut cfg = config();
        cfg.max_attempts = 2;
        cfg.attempt_timeout_ms = Some(20);
        let engine = engine(&cfg);
        engine.start(&shutdown);

        let id = engine
            .enqueue(TaskSpec::new("slow", |_ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            }))
            .unwrap();
        let status = engine.wait(id).await.unwrap();
        assert_eq!(status.state, TaskState::Exhausted);
        assert_eq!(status.attempts, 2);
        assert!(status.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn correlation_id_reaches_work() {
        let shutdown = Shutdown::new();
        let clock = clock::system();
        let ids = SnowflakeGenerator::new(2, 0, clock.clone()).unwrap();
        let request_id = ids.next();
        let engine = engine(&config());
        engine.start(&shutdown);

        let id = engine
            .enqueue(
                TaskSpec::new("echo-correlation", |ctx: TaskContext| async move {
                    Ok(json!(ctx.correlation_id().map(|c| c.as_u64())))
                })
                .correlated_with(request_id),
            )
            .unwrap();
        let status = engine.wait(id).await.unwrap();
        assert_eq!(status.correlation_id, Some(request_id));
        assert_eq!(status.result, Some(json!(request_id.as_u64())));
    }

    #[tokio::test]
    async fn finished_tasks_are_purged_after_retention() {
        let shutdown = Shutdown::new();
        let manual = Arc::new(ManualClock::default());
        let mut cfg = config();
        cfg.retention_ms = 1_000;
        cfg.cleanup_interval_ms = 3_600_000;
        let engine = engine_with(&cfg, manual.clone());
        engine.start(&shutdown);

        let id = engine
            .enqueue(TaskSpec::new("quick", |_ctx| async { Ok(json!("done")) }))
            .unwrap();
        engine.wait(id).await.unwrap();

        assert_eq!(engine.purge_expired(), 0);
        manual.advance(Duration::from_millis(1_000));
        assert_eq!(engine.purge_expired(), 1);
        assert!(matches!(engine.status(id), Err(TaskError::NotFound(_))));
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_work() {
        let shutdown = Shutdown::new();
        let mut cfg = config();
        cfg.workers = 1;
        let engine = engine(&cfg);
        let handles = engine.start(&shutdown);

        let blocker = engine
            .enqueue(TaskSpec::new("blocker", |ctx: TaskContext| async move {
                ctx.cancelled().await;
                Err(TaskFailure::retryable("interrupted"))
            }))
            .unwrap();
        let mut states = engine.subscribe(blocker).unwrap();
        states.wait_for(|s| *s == TaskState::Running).await.unwrap();

        let queued = engine
            .enqueue(TaskSpec::new("queued", |_ctx| async { Ok(json!(null)) }))
            .unwrap();

        shutdown.trigger();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(engine.state(queued), Some(TaskState::Cancelled));
        assert_eq!(engine.wait(blocker).await.unwrap().state, TaskState::Cancelled);
        assert!(matches!(
            engine.enqueue(TaskSpec::new("late", |_ctx| async { Ok(json!(null)) })),
            Err(TaskError::ShuttingDown)
        ));
    }

    fn explode() -> crate::tasks::TaskResult {
        panic!("worker exploded")
    }

    #[tokio::test]
    async fn panicking_work_fails_and_frees_its_worker() {
        let shutdown = Shutdown::new();
        let mut cfg = config();
        cfg.workers = 1;
        let engine = engine(&cfg);
        engine.start(&shutdown);

        let id = engine
            .enqueue(TaskSpec::new("boom", |_ctx| async { explode() }))
            .unwrap();
        let status = tokio::time::timeout(Duration::from_secs(2), engine.wait(id))
            .await
            .expect("panicking task never finished")
            .unwrap();

        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.attempts, 1);
        assert!(status.finished_at_ms.is_some());
        assert!(status.error.unwrap().contains("worker exploded"));

        // The only worker permit came back.
        let next = engine
            .enqueue(TaskSpec::new("after-boom", |_ctx| async { Ok(json!("ok")) }))
            .unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), engine.wait(next))
            .await
            .expect("worker permit leaked")
            .unwrap();
        assert_eq!(next.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn retry_gaps_never_shrink() {
        let shutdown = Shutdown::new();
        let mut cfg = config();
        cfg.max_attempts = 4;
        cfg.backoff_base_ms = 20;
        cfg.backoff_cap_ms = 1_000;
        let engine = engine(&cfg);
        engine.start(&shutdown);

        let stamps: Arc<Mutex<Vec<(u32, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        let log = stamps.clone();
        let id = engine
            .enqueue(TaskSpec::new("stamped", move |ctx: TaskContext| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push((ctx.attempt(), Instant::now()));
                    Err(TaskFailure::retryable("again"))
                }
            }))
            .unwrap();
        assert_eq!(engine.wait(id).await.unwrap().state, TaskState::Exhausted);

        let stamps = stamps.lock().unwrap().clone();
        let attempts: Vec<u32> = stamps.iter().map(|(attempt, _)| *attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4]);

        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1].1 - w[0].1).collect();
        for (i, gap) in gaps.iter().enumerate() {
            let floor = Duration::from_millis(20 << i);
            assert!(*gap >= floor, "gap {i} was {gap:?}, below {floor:?}");
        }
        assert!(
            gaps.windows(2).all(|w| w[1] >= w[0]),
            "backoff gaps decreased: {gaps:?}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queue_depth_stays_within_bound_under_contention() {
        let shutdown = Shutdown::new();
        let mut cfg = config();
        cfg.workers = 1;
        cfg.queue_bound = 4;
        let engine = engine(&cfg);
        engine.start(&shutdown);

        let producers: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let mut accepted = Vec::new();
                    for _ in 0..50 {
                        let spec = TaskSpec::new("tick", |_ctx| async { Ok(json!(null)) });
                        if let Ok(id) = engine.enqueue(spec) {
                            accepted.push(id);
                        }
                        assert!(engine.queue_depth() <= 4);
                        tokio::task::yield_now().await;
                    }
                    accepted
                })
            })
            .collect();

        let mut accepted = Vec::new();
        for producer in producers {
            accepted.extend(producer.await.unwrap());
        }
        assert!(!accepted.is_empty());
        for id in accepted {
            engine.wait(id).await.unwrap();
        }
        assert_eq!(engine.queue_depth(), 0);
    }

    #[tokio::test]
    async fn repeats_a_fixed_number_of_times() {
        let shutdown = Shutdown::new();
        let engine = engine(&config());
        engine.start(&shutdown);

        let id = engine
            .enqueue(
                TaskSpec::new("heartbeat", |ctx: TaskContext| async move { Ok(json!(ctx.run())) })
                    .on_schedule(
                        Schedule::every(Duration::from_millis(10))
                            .times(3)
                            .starting_now(),
                    ),
            )
            .unwrap();
        let status = engine.wait(id).await.unwrap();

        assert_eq!(status.state, TaskState::Succeeded);
        assert_eq!(status.runs, 3);
        assert_eq!(status.result, Some(json!(3)));
        assert_eq!(status.next_run_at_ms, None);
    }

    #[tokio::test]
    async fn failed_run_does_not_end_a_schedule() {
        let shutdown = Shutdown::new();
        let engine = engine(&config());
        engine.start(&shutdown);

        let id = engine
            .enqueue(
                TaskSpec::new("sometimes", |ctx: TaskContext| async move {
                    if ctx.run() == 1 {
                        Err(TaskFailure::permanent("first run rejected"))
                    } else {
                        Ok(json!(ctx.run()))
                    }
                })
                .on_schedule(Schedule::every(Duration::from_millis(5)).times(2).starting_now()),
            )
            .unwrap();
        let status = engine.wait(id).await.unwrap();

        assert_eq!(status.state, TaskState::Succeeded);
        assert_eq!(status.runs, 2);
        assert_eq!(status.result, Some(json!(2)));
    }

    #[tokio::test]
    async fn first_run_waits_one_interval() {
        let shutdown = Shutdown::new();
        let engine = engine(&config());
        engine.start(&shutdown);

        let id = engine
            .enqueue(
                TaskSpec::new("later", |_ctx| async { Ok(json!("ran")) })
                    .on_schedule(Schedule::every(Duration::from_millis(300)).once()),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiting = engine.status(id).unwrap();
        assert_eq!(waiting.state, TaskState::Pending);
        assert_eq!(waiting.runs, 0);
        assert!(waiting.next_run_at_ms.is_some());

        let status = engine.wait(id).await.unwrap();
        assert_eq!(status.state, TaskState::Succeeded);
        assert_eq!(status.runs, 1);
    }

    #[tokio::test]
    async fn cancel_stops_a_repeating_schedule() {
        let shutdown = Shutdown::new();
        let engine = engine(&config());
        engine.start(&shutdown);

        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let id = engine
            .enqueue(
                TaskSpec::new("forever", move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(null))
                    }
                })
                .on_schedule(Schedule::every(Duration::from_millis(10)).starting_now()),
            )
            .unwrap();

        for _ in 0..200 {
            if runs.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(runs.load(Ordering::SeqCst) >= 2);

        let outcome = engine.cancel(id).unwrap();
        assert!(matches!(outcome, CancelOutcome::Cancelled | CancelOutcome::Signalled));
        let status = engine.wait(id).await.unwrap();
        assert_eq!(status.state, TaskState::Cancelled);

        let settled = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn degenerate_schedule_is_rejected() {
        let engine = engine(&config());
        let spec = TaskSpec::new("never", |_ctx| async { Ok(json!(null)) })
            .on_schedule(Schedule::every(Duration::ZERO));

        assert!(matches!(engine.enqueue(spec), Err(TaskError::InvalidSchedule(_))));
        assert_eq!(engine.tracked(), 0);
    }

    #[tokio::test]
    async fn count_retention_drops_oldest_finished_first() {
        let shutdown = Shutdown::new();
        let manual = Arc::new(ManualClock::default());
        let mut cfg = config();
        cfg.keep_count = 2;
        cfg.retention_policy = RetentionPolicy::Count;
        cfg.cleanup_interval_ms = 3_600_000;
        let engine = engine_with(&cfg, manual.clone());
        engine.start(&shutdown);

        let mut ids = Vec::new();
        for n in 0..4 {
            let id = engine
                .enqueue(TaskSpec::new("numbered", move |_ctx| async move { Ok(json!(n)) }))
                .unwrap();
            engine.wait(id).await.unwrap();
            manual.advance(Duration::from_millis(10));
            ids.push(id);
        }

        let blocker = engine
            .enqueue(TaskSpec::new("still-running", |ctx: TaskContext| async move {
                ctx.cancelled().await;
                Err(TaskFailure::retryable("stopped"))
            }))
            .unwrap();
        let mut states = engine.subscribe(blocker).unwrap();
        states.wait_for(|s| *s == TaskState::Running).await.unwrap();

        assert_eq!(engine.purge_expired(), 2);
        assert!(matches!(engine.status(ids[0]), Err(TaskError::NotFound(_))));
        assert!(matches!(engine.status(ids[1]), Err(TaskError::NotFound(_))));
        assert_eq!(engine.status(ids[3]).unwrap().result, Some(json!(3)));
        assert_eq!(engine.state(blocker), Some(TaskState::Running));

        // Age alone is not applied under the count policy.
        manual.advance(Duration::from_secs(3_600));
        assert_eq!(engine.purge_expired(), 0);
        assert_eq!(engine.tracked(), 3);
    }
}
