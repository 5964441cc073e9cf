//! Circuit breaker for downstream protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: a bounded number of trial calls probe for recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_threshold consecutive failures within window
//! Open → Half-Open: first guard() after open_duration
//! Half-Open → Closed: success_threshold trial successes
//! Half-Open → Open: any trial failure (cool-down restarts)
//! ```
//!
//! # Design Decisions
//! - Per-dependency breaker (not global), stored in a sharded map
//! - Every state change bumps an epoch; outcomes reported against an older
//!   epoch are ignored so late reports cannot corrupt the new state
//! - A `Permit` dropped without a report counts as a failure, which covers
//!   callers cancelled by a request timeout

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::clock::SharedClock;
use crate::config::{BreakerPolicyConfig, CircuitBreakerConfig};
use crate::observability::metrics;
use crate::resilience::timeouts::with_timeout;

/// Breaker state for one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a guarded call, as classified by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

/// The breaker refused to let a call through.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit for {dependency} is {state}")]
pub struct Rejected {
    pub dependency: String,
    pub state: BreakerState,
    /// Time left in the cool-down, when the breaker is fully open.
    pub retry_after: Option<Duration>,
}

/// Failure of a call made through [`CircuitBreakers::call`].
#[derive(Debug, Error)]
pub enum DownstreamError<E> {
    #[error(transparent)]
    Rejected(Rejected),

    #[error("downstream call timed out after {0:?}")]
    TimedOut(Duration),

    #[error("downstream call failed: {0}")]
    Failed(E),
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    failures: VecDeque<Instant>,
    successes: u32,
    trials_in_flight: u32,
    transitioned_at: Instant,
    epoch: u64,
}

impl Breaker {
    fn new(now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            successes: 0,
            trials_in_flight: 0,
            transitioned_at: now,
            epoch: 0,
        }
    }

    fn transition(&mut self, key: &str, to: BreakerState, now: Instant) {
        let from = self.state;
        self.state = to;
        self.transitioned_at = now;
        self.failures.clear();
        self.successes = 0;
        self.trials_in_flight = 0;
        self.epoch += 1;

        match to {
            BreakerState::Open => {
                tracing::warn!(dependency = %key, from = %from, "Circuit opened")
            }
            _ => tracing::info!(dependency = %key, from = %from, to = %to, "Circuit state changed"),
        }
        metrics::record_breaker_transition(key, to.as_str());
    }
}

struct Inner {
    breakers: DashMap<String, Breaker>,
    config: ArcSwap<CircuitBreakerConfig>,
    clock: SharedClock,
}

impl Inner {
    fn record(&self, key: &str, epoch: u64, trial: bool, outcome: CallOutcome) {
        let policy = self.config.load().policy_for(key).clone();
        let now = self.clock.now();

        // Entry removed by reset(): nothing to update.
        let Some(mut breaker) = self.breakers.get_mut(key) else {
            return;
        };
        if breaker.epoch != epoch {
            tracing::trace!(dependency = %key, "Ignoring outcome from a previous breaker epoch");
            return;
        }

        match (breaker.state, outcome) {
            (BreakerState::Closed, CallOutcome::Success) => breaker.failures.clear(),
            (BreakerState::Closed, CallOutcome::Failure) => {
                breaker.failures.push_back(now);
                let window = policy.window();
                while let Some(first) = breaker.failures.front() {
                    if now.saturating_duration_since(*first) > window {
                        breaker.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if breaker.failures.len() as u32 >= policy.failure_threshold {
                    breaker.transition(key, BreakerState::Open, now);
                }
            }
            (BreakerState::HalfOpen, outcome) => {
                if trial {
                    breaker.trials_in_flight = breaker.trials_in_flight.saturating_sub(1);
                }
                match outcome {
                    CallOutcome::Success => {
                        breaker.successes += 1;
                        if breaker.successes >= policy.success_threshold {
                            breaker.transition(key, BreakerState::Closed, now);
                        }
                    }
                    CallOutcome::Failure => breaker.transition(key, BreakerState::Open, now),
                }
            }
            // Open grants no permits, so a matching epoch cannot report here.
            (BreakerState::Open, _) => {}
        }
    }
}

/// Registry of per-dependency breakers.
#[derive(Clone)]
pub struct CircuitBreakers {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CircuitBreakers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakers")
            .field("tracked", &self.inner.breakers.len())
            .finish()
    }
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                breakers: DashMap::new(),
                config: ArcSwap::from_pointee(config),
                clock,
            }),
        }
    }

    /// Ask to call `key`. A granted permit must be reported exactly once.
    pub fn guard(&self, key: &str) -> Result<Permit, Rejected> {
        let config = self.inner.config.load();
        if !config.enabled {
            return Ok(Permit::untracked(self.inner.clone(), key));
        }
        let policy = config.policy_for(key);
        let now = self.inner.clock.now();

        let mut breaker = self
            .inner
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| Breaker::new(now));

        if breaker.state == BreakerState::Open {
            let elapsed = now.saturating_duration_since(breaker.transitioned_at);
            let cool_down = policy.open_duration();
            if elapsed < cool_down {
                metrics::record_breaker_rejection(key);
                tracing::debug!(dependency = %key, "Circuit open, failing fast");
                return Err(Rejected {
                    dependency: key.to_string(),
                    state: BreakerState::Open,
                    retry_after: Some(cool_down - elapsed),
                });
            }
            breaker.transition(key, BreakerState::HalfOpen, now);
        }

        match breaker.state {
            BreakerState::HalfOpen => {
                if breaker.trials_in_flight >= policy.half_open_trial_limit {
                    metrics::record_breaker_rejection(key);
                    tracing::debug!(
                        dependency = %key,
                        in_flight = breaker.trials_in_flight,
                        "Trial limit reached"
                    );
                    return Err(Rejected {
                        dependency: key.to_string(),
                        state: BreakerState::HalfOpen,
                        retry_after: None,
                    });
                }
                breaker.trials_in_flight += 1;
                Ok(Permit::new(self.inner.clone(), key, breaker.epoch, true))
            }
            _ => Ok(Permit::new(self.inner.clone(), key, breaker.epoch, false)),
        }
    }

    /// Report the outcome for a granted permit.
    pub fn report(&self, permit: Permit, outcome: CallOutcome) {
        permit.report(outcome);
    }

    /// Guard, run `call` under `limit`, and report the outcome.
    ///
    /// Errors returned by `call` and timeouts both count as failures.
    pub async fn call<F, T, E>(
        &self,
        key: &str,
        limit: Duration,
        call: F,
    ) -> Result<T, DownstreamError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let permit = self.guard(key).map_err(DownstreamError::Rejected)?;
        match with_timeout(limit, call).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.failure();
                Err(DownstreamError::Failed(e))
            }
            Err(elapsed) => {
                permit.failure();
                tracing::warn!(
                    dependency = %key,
                    timeout = ?elapsed.0,
                    "Downstream call timed out"
                );
                Err(DownstreamError::TimedOut(elapsed.0))
            }
        }
    }

    /// Current state; unknown dependencies are Closed.
    pub fn state(&self, key: &str) -> BreakerState {
        self.inner
            .breakers
            .get(key)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Forget everything about `key`. Outstanding permits become no-ops.
    pub fn reset(&self, key: &str) {
        if self.inner.breakers.remove(key).is_some() {
            tracing::info!(dependency = %key, "Circuit reset");
        }
    }

    /// Swap in new policies. Existing breaker state is kept.
    pub fn update_config(&self, config: CircuitBreakerConfig) {
        self.inner.config.store(Arc::new(config));
    }

    pub fn policy_for(&self, key: &str) -> BreakerPolicyConfig {
        self.inner.config.load().policy_for(key).clone()
    }
}

/// Permission to make one call to a dependency.
#[must_use = "a permit must be reported; dropping it records a failure"]
pub struct Permit {
    inner: Arc<Inner>,
    key: String,
    epoch: u64,
    trial: bool,
    tracked: bool,
    reported: bool,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("key", &self.key)
            .field("epoch", &self.epoch)
            .field("trial", &self.trial)
            .finish()
    }
}

impl Permit {
    fn new(inner: Arc<Inner>, key: &str, epoch: u64, trial: bool) -> Self {
        Self {
            inner,
            key: key.to_string(),
            epoch,
            trial,
            tracked: true,
            reported: false,
        }
    }

    fn untracked(inner: Arc<Inner>, key: &str) -> Self {
        Self {
            inner,
            key: key.to_string(),
            epoch: 0,
            trial: false,
            tracked: false,
            reported: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// True when this permit is one of the Half-Open probes.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn report(mut self, outcome: CallOutcome) {
        self.reported = true;
        if self.tracked {
            self.inner.record(&self.key, self.epoch, self.trial, outcome);
        }
    }

    pub fn success(self) {
        self.report(CallOutcome::Success);
    }

    pub fn failure(self) {
        self.report(CallOutcome::Failure);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.reported && self.tracked {
            tracing::debug!(
                dependency = %self.key,
                "Permit dropped without report, counting as failure"
            );
            self.inner
                .record(&self.key, self.epoch, self.trial, CallOutcome::Failure);
        }
    }
}
