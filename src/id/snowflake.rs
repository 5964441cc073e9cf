//! Snowflake-style 64-bit identifiers.
//!
//! # Layout
//! ```text
//!  63   62 ............ 22   21 ...... 12   11 ...... 0
//! ┌───┬────────────────────┬─────────────┬────────────┐
//! │ 0 │ ms since epoch (41)│ worker (10) │ seq (12)   │
//! └───┴────────────────────┴─────────────┴────────────┘
//! ```
//!
//! # Design Decisions
//! - A single mutex guards `(last_ms, sequence)`; callers never observe a torn update
//! - A wall clock that steps backwards is treated as still being `last_ms`
//! - Sequence overflow spins until the clock reaches the next millisecond

use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::SharedClock;

pub const TIMESTAMP_BITS: u32 = 41;
pub const WORKER_ID_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 12;

pub const MAX_WORKER_ID: u16 = (1 << WORKER_ID_BITS) - 1;
pub const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;
const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;

const WORKER_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_ID_BITS;

/// 2020-01-01T00:00:00Z.
pub const DEFAULT_EPOCH_MS: u64 = 1_577_836_800_000;

/// A time-ordered unique identifier for requests and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(u64);

impl Identifier {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Milliseconds since the generator's epoch.
    pub const fn timestamp(&self) -> u64 {
        self.0 >> TIMESTAMP_SHIFT
    }

    pub const fn worker_id(&self) -> u16 {
        ((self.0 >> WORKER_SHIFT) & MAX_WORKER_ID as u64) as u16
    }

    pub const fn sequence(&self) -> u16 {
        (self.0 & MAX_SEQUENCE as u64) as u16
    }

    fn compose(timestamp: u64, worker_id: u16, sequence: u16) -> Self {
        Self(
            ((timestamp & MAX_TIMESTAMP) << TIMESTAMP_SHIFT)
                | ((worker_id as u64) << WORKER_SHIFT)
                | sequence as u64,
        )
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Identifier {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

/// Errors raised while constructing a generator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("worker id {worker_id} exceeds maximum {max}")]
    WorkerIdOutOfRange { worker_id: u32, max: u16 },

    #[error("epoch {epoch_ms} is ahead of the current time {now_ms}")]
    EpochInFuture { epoch_ms: u64, now_ms: u64 },
}

#[derive(Debug)]
struct GeneratorState {
    last_ms: u64,
    sequence: u16,
}

/// Produces strictly increasing identifiers for one worker id.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    worker_id: u16,
    epoch_ms: u64,
    clock: SharedClock,
    state: Mutex<GeneratorState>,
}

impl SnowflakeGenerator {
    /// Create a generator, rejecting worker ids outside the 10-bit budget.
    pub fn new(worker_id: u32, epoch_ms: u64, clock: SharedClock) -> Result<Self, IdError> {
        if worker_id > MAX_WORKER_ID as u32 {
            return Err(IdError::WorkerIdOutOfRange {
                worker_id,
                max: MAX_WORKER_ID,
            });
        }

        let now_ms = clock.unix_millis();
        if epoch_ms > now_ms {
            return Err(IdError::EpochInFuture { epoch_ms, now_ms });
        }

        Ok(Self {
            worker_id: worker_id as u16,
            epoch_ms,
            clock,
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    pub fn epoch_ms(&self) -> u64 {
        self.epoch_ms
    }

    /// Next identifier. Blocks only when 4096 ids were handed out within the
    /// current millisecond.
    pub fn next(&self) -> Identifier {
        // The guarded state is two integers that are always written together,
        // so a poisoned lock still holds a consistent value.
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut now = self.elapsed_millis().max(state.last_ms);

        if now == state.last_ms {
            if state.sequence == MAX_SEQUENCE {
                tracing::trace!(
                    worker_id = self.worker_id,
                    "Sequence exhausted, waiting for next millisecond"
                );
                now = self.wait_past(state.last_ms);
                state.sequence = 0;
            } else {
                state.sequence += 1;
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now;
        Identifier::compose(now, self.worker_id, state.sequence)
    }

    fn elapsed_millis(&self) -> u64 {
        self.clock.unix_millis().saturating_sub(self.epoch_ms)
    }

    fn wait_past(&self, last_ms: u64) -> u64 {
        loop {
            let now = self.elapsed_millis();
            if now > last_ms {
                return now;
            }
            std::thread::yield_now();
        }
    }
}
