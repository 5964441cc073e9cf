//! Task engine types.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::TaskConfig;
use crate::id::Identifier;
use crate::resilience::backoff::calculate_backoff;

/// Lifecycle of a background task.
///
/// ```text
/// Pending ──▶ Running ──▶ Succeeded
///    ▲           │ ├────▶ Failed      (non-retryable error or panic)
///    └─ retry ◀──┘ ├────▶ Exhausted   (attempts used up)
///                  └────▶ Cancelled
/// ```
///
/// A scheduled task returns to `Pending` between runs and reports the state
/// its last run ended in once the schedule is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Exhausted,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Exhausted => "exhausted",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded attempts with capped exponential backoff between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }

    /// Single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff_base: Duration::ZERO,
            backoff_cap: Duration::ZERO,
        }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.backoff_base, self.backoff_cap)
    }
}

/// How many runs a scheduled task makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// A single run.
    Never,
    /// Until cancelled or the engine shuts down.
    Always,
    Times(u32),
}

/// When the first run of a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// As soon as a worker is free.
    OnStart,
    /// One interval after the task is picked up.
    AfterInterval,
}

/// Runs spaced `interval` apart, measured from the start of one run to the
/// start of the next. Runs never overlap; a run that overruns its slot delays
/// the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub repeat: Repeat,
    pub trigger: Trigger,
}

impl Schedule {
    /// Repeat forever, first run after one interval.
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            repeat: Repeat::Always,
            trigger: Trigger::AfterInterval,
        }
    }

    pub fn times(mut self, runs: u32) -> Self {
        self.repeat = Repeat::Times(runs);
        self
    }

    pub fn once(mut self) -> Self {
        self.repeat = Repeat::Never;
        self
    }

    pub fn starting_now(mut self) -> Self {
        self.trigger = Trigger::OnStart;
        self
    }

    /// Total runs, or `None` for an unbounded schedule.
    pub fn run_limit(&self) -> Option<u32> {
        match self.repeat {
            Repeat::Never => Some(1),
            Repeat::Always => None,
            Repeat::Times(n) => Some(n),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), TaskError> {
        if self.interval.is_zero() {
            return Err(TaskError::InvalidSchedule(
                "interval must be positive".to_string(),
            ));
        }
        if self.repeat == Repeat::Times(0) {
            return Err(TaskError::InvalidSchedule(
                "repeat count must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why an attempt failed, and whether another attempt may help.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskFailure {
    message: String,
    retryable: bool,
}

impl TaskFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Ends the task as `Failed` without further attempts.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type TaskResult = Result<serde_json::Value, TaskFailure>;

pub(crate) type BoxedWork =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// Handed to each attempt of a task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub(crate) id: Identifier,
    pub(crate) run: u32,
    pub(crate) attempt: u32,
    pub(crate) correlation_id: Option<Identifier>,
    pub(crate) cancel: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn id(&self) -> Identifier {
        self.id
    }

    /// 1-based run number. Always 1 for unscheduled tasks.
    pub fn run(&self) -> u32 {
        self.run
    }

    /// 1-based attempt number within the current run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn correlation_id(&self) -> Option<Identifier> {
        self.correlation_id
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A unit of deferred work plus how to run it.
pub struct TaskSpec {
    pub(crate) name: String,
    pub(crate) correlation_id: Option<Identifier>,
    pub(crate) policy: Option<RetryPolicy>,
    pub(crate) schedule: Option<Schedule>,
    pub(crate) work: BoxedWork,
}

impl TaskSpec {
    /// `work` is invoked once per attempt.
    pub fn new<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            correlation_id: None,
            policy: None,
            schedule: None,
            work: Arc::new(move |ctx| work(ctx).boxed()),
        }
    }

    /// Override the engine's default retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Run repeatedly instead of once. Each run gets the full retry policy.
    pub fn on_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Tag with the request that enqueued it.
    pub fn correlated_with(mut self, id: Identifier) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("correlation_id", &self.correlation_id)
            .field("policy", &self.policy)
            .field("schedule", &self.schedule)
            .finish()
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub id: Identifier,
    pub name: String,
    pub correlation_id: Option<Identifier>,
    pub state: TaskState,
    /// Runs started so far.
    pub runs: u32,
    /// Attempts made in the current (or last) run.
    pub attempts: u32,
    pub max_attempts: u32,
    pub enqueued_at_ms: u64,
    pub last_attempt_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task had not started (or was waiting to retry) and is now `Cancelled`.
    Cancelled,
    /// The task is running; its work has been signalled.
    Signalled,
    /// Nothing to do.
    AlreadyFinished(TaskState),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task queue is full ({bound} pending)")]
    RejectedOverload { bound: usize },

    #[error("task {0} not found")]
    NotFound(Identifier),

    #[error("task engine is shut down")]
    ShuttingDown,

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_run_limits() {
        let every = Schedule::every(Duration::from_millis(10));
        assert_eq!(every.run_limit(), None);
        assert_eq!(every.once().run_limit(), Some(1));
        assert_eq!(every.times(4).run_limit(), Some(4));
        assert_eq!(every.trigger, Trigger::AfterInterval);
        assert_eq!(every.starting_now().trigger, Trigger::OnStart);
    }

    #[test]
    fn degenerate_schedules_are_invalid() {
        assert!(Schedule::every(Duration::ZERO).validate().is_err());
        assert!(Schedule::every(Duration::from_millis(1)).times(0).validate().is_err());
        assert!(Schedule::every(Duration::from_millis(1)).times(1).validate().is_ok());
    }
}
