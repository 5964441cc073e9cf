//! Per-key token bucket rate limiting.
//!
//! # Responsibilities
//! - Classify a request into a key class and bucket key
//! - Lazily refill and debit the bucket for that key
//! - Evict buckets that have been idle long enough to be full again
//!
//! # Design Decisions
//! - Buckets live in a sharded map; a check holds only its shard's lock, so
//!   unrelated keys never serialize on each other
//! - Refill and debit happen under the same shard lock: two concurrent
//!   checks on one key cannot both spend the same tokens
//! - Eviction runs through `retain`, which takes the same shard locks, so a
//!   bucket is never evicted in the middle of a check
//! - Policies are swapped atomically on config reload

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::clock::SharedClock;
use crate::config::{BucketPolicyConfig, Fallback, KeyStrategy, RateLimitConfig};
use crate::observability::metrics;

/// Name of the class used for requests that match no configured class.
pub const DEFAULT_CLASS: &str = "default";

/// Admission decision for one unit of work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Tokens were debited; proceed.
    Allow,
    /// The cost can never be satisfied by this bucket: it exceeds the
    /// capacity, is not a positive finite number, or the wait would not fit
    /// in a `Duration`.
    Deny,
    /// Not enough tokens now; enough will have accrued after this long.
    RetryAfter(Duration),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Identifies one bucket: the key class plus the subject within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    class: String,
    subject: String,
}

impl RateLimitKey {
    pub fn new(class: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            subject: subject.into(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.class, self.subject)
    }
}

/// A token bucket with lazy continuous refill.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn level_at(&self, now: Instant, capacity: f64, refill_rate: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * refill_rate).min(capacity)
    }

    fn try_acquire(
        &mut self,
        now: Instant,
        cost: f64,
        capacity: f64,
        refill_rate: f64,
    ) -> Decision {
        self.tokens = self.level_at(now, capacity, refill_rate);
        self.last_refill = now;

        if self.tokens >= cost {
            self.tokens -= cost;
            return Decision::Allow;
        }
        match Duration::try_from_secs_f64((cost - self.tokens) / refill_rate) {
            Ok(wait) => Decision::RetryAfter(wait),
            Err(_) => Decision::Deny,
        }
    }
}

#[derive(Debug)]
struct ClassEntry {
    name: String,
    path_prefix: Option<String>,
    method: Option<String>,
    policy: BucketPolicyConfig,
}

/// Immutable snapshot of the rate-limit configuration.
#[derive(Debug)]
struct PolicyTable {
    enabled: bool,
    strategy: KeyStrategy,
    fallback: Fallback,
    default: BucketPolicyConfig,
    classes: Vec<ClassEntry>,
    idle_ttl: Duration,
    sweep_interval: Duration,
}

impl PolicyTable {
    fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            strategy: config.strategy,
            fallback: config.fallback,
            default: config.default,
            classes: config
                .classes
                .iter()
                .map(|c| ClassEntry {
                    name: c.name.clone(),
                    path_prefix: c.path_prefix.clone(),
                    method: c.method.as_ref().map(|m| m.to_ascii_uppercase()),
                    policy: c.policy(),
                })
                .collect(),
            idle_ttl: config.idle_ttl(),
            sweep_interval: config.sweep_interval(),
        }
    }

    fn policy(&self, class: &str) -> Option<BucketPolicyConfig> {
        if let Some(entry) = self.classes.iter().find(|c| c.name == class) {
            return Some(entry.policy);
        }
        match self.fallback {
            Fallback::Default => Some(self.default),
            Fallback::Unlimited => None,
        }
    }

    /// Longest matching path prefix wins; a class without a prefix matches
    /// every path with length zero.
    fn classify(&self, method: &str, path: &str) -> Option<&str> {
        let mut best: Option<(&ClassEntry, usize)> = None;
        for entry in &self.classes {
            if let Some(m) = &entry.method {
                if !m.eq_ignore_ascii_case(method) {
                    continue;
                }
            }
            let len = match &entry.path_prefix {
                Some(prefix) if path.starts_with(prefix.as_str()) => prefix.len(),
                Some(_) => continue,
                None => 0,
            };
            if best.map_or(true, |(_, l)| len > l) {
                best = Some((entry, len));
            }
        }

        match best {
            Some((entry, _)) => Some(entry.name.as_str()),
            None => match self.fallback {
                Fallback::Default => Some(DEFAULT_CLASS),
                Fallback::Unlimited => None,
            },
        }
    }
}

/// Keyed admission control.
pub struct RateLimiter {
    buckets: DashMap<RateLimitKey, TokenBucket>,
    table: ArcSwap<PolicyTable>,
    clock: SharedClock,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            buckets: DashMap::new(),
            table: ArcSwap::from_pointee(PolicyTable::from_config(config)),
            clock,
        }
    }

    /// Derive the bucket key for a request, or `None` when the request is not
    /// subject to limiting.
    pub fn key_for(&self, method: &str, path: &str, client: &str) -> Option<RateLimitKey> {
        let table = self.table.load();
        if !table.enabled {
            return None;
        }
        let class = table.classify(method, path)?;
        let subject = match table.strategy {
            KeyStrategy::Client => client.to_string(),
            KeyStrategy::Route => path.to_string(),
            KeyStrategy::ClientRoute => format!("{client}|{path}"),
            KeyStrategy::Global => "*".to_string(),
        };
        Some(RateLimitKey::new(class, subject))
    }

    /// Check and debit `cost` tokens for `key`.
    pub fn admit(&self, key: &RateLimitKey, cost: f64) -> Decision {
        let table = self.table.load();
        if !table.enabled {
            return Decision::Allow;
        }
        let Some(policy) = table.policy(key.class()) else {
            return Decision::Allow;
        };

        if !cost.is_finite() || cost <= 0.0 {
            tracing::debug!(key = %key, cost, "Rejecting non-positive or non-finite cost");
            return Decision::Deny;
        }
        let capacity = policy.burst as f64;
        if cost > capacity {
            tracing::debug!(key = %key, cost, capacity, "Cost exceeds bucket capacity");
            metrics::record_rate_limited(key.class());
            return Decision::Deny;
        }

        let now = self.clock.now();
        let decision = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| TokenBucket::new(capacity, now))
            .try_acquire(now, cost, capacity, policy.rate);

        if !decision.is_allowed() {
            tracing::debug!(key = %key, decision = ?decision, "Rate limit exceeded");
            metrics::record_rate_limited(key.class());
        }
        decision
    }

    /// `admit` with unit cost.
    pub fn check(&self, key: &RateLimitKey) -> Decision {
        self.admit(key, 1.0)
    }

    /// Drop buckets idle for at least the TTL whose refilled level is back at
    /// capacity. Returns the number removed.
    pub fn evict_idle(&self) -> usize {
        let table = self.table.load();
        let now = self.clock.now();
        let mut evicted = 0;

        self.buckets.retain(|key, bucket| {
            if now.saturating_duration_since(bucket.last_refill) < table.idle_ttl {
                return true;
            }
            let keep = match table.policy(key.class()) {
                Some(p) => bucket.level_at(now, p.burst as f64, p.rate) < p.burst as f64,
                None => false,
            };
            if !keep {
                evicted += 1;
            }
            keep
        });

        if evicted > 0 {
            tracing::debug!(
                evicted,
                remaining = self.buckets.len(),
                "Evicted idle rate-limit buckets"
            );
        }
        evicted
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Swap in a new policy table. Existing buckets keep their token levels,
    /// clamped to the new capacity on their next refill.
    pub fn update_config(&self, config: &RateLimitConfig) {
        self.table.store(Arc::new(PolicyTable::from_config(config)));
        tracing::info!(classes = config.classes.len(), "Rate limit policies updated");
    }

    /// Periodically evict idle buckets until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.table.load().sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evict_idle();
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Rate limit sweeper stopping");
                    break;
                }
            }
        }
    }
}
