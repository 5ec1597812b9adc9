//! Hybrid Logical Clock (HLC) for ordering replicated position writes.
//!
//! Every write to the shared position map is stamped with a [`Timestamp`]
//! combining:
//! - Physical wall-clock time (milliseconds)
//! - A per-replica counter for writes within the same millisecond
//! - The replica ID, so concurrent writes have one agreed winner
//!
//! # References
//!
//! Kulkarni, Demirbas, et al. "Logical Physical Clocks and Consistent Snapshots
//! in Globally Distributed Databases" (2014)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// How far ahead of the local wall clock a remote stamp may be.
pub const MAX_DRIFT_MS: u64 = 60_000;

/// A totally ordered write stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Physical wall-clock time in milliseconds since UNIX epoch
    pub physical_ms: u64,
    /// Counter for writes at the same physical time
    pub counter: u32,
    /// Replica that produced the write
    pub replica_id: Uuid,
}

impl Timestamp {
    /// The smallest timestamp a given replica can hold.
    #[must_use]
    pub fn zero(replica_id: Uuid) -> Self {
        Self {
            physical_ms: 0,
            counter: 0,
            replica_id,
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical_ms
            .cmp(&other.physical_ms)
            .then(self.counter.cmp(&other.counter))
            .then(self.replica_id.cmp(&other.replica_id))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Errors from observing a remote timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    /// The remote stamp is too far in the future to be trusted
    #[error("timestamp {received_ms} ms is more than {max_drift_ms} ms ahead of local clock {local_ms} ms")]
    Drift {
        /// Physical time of the remote stamp
        received_ms: u64,
        /// Local wall-clock time
        local_ms: u64,
        /// Accepted drift
        max_drift_ms: u64,
    },
}

/// Hybrid Logical Clock owned by a single replica.
#[derive(Debug, Clone)]
pub struct Hlc {
    last: Timestamp,
}

impl Hlc {
    /// Create a clock for the given replica.
    #[must_use]
    pub fn new(replica_id: Uuid) -> Self {
        Self {
            last: Timestamp::zero(replica_id),
        }
    }

    /// The replica this clock stamps writes for.
    #[must_use]
    pub fn replica_id(&self) -> Uuid {
        self.last.replica_id
    }

    /// Stamp a local write.
    ///
    /// The result is strictly greater than anything this clock has produced
    /// or observed.
    pub fn tick(&mut self) -> Timestamp {
        let now_ms = current_time_ms();

        if now_ms > self.last.physical_ms {
            self.last.physical_ms = now_ms;
            self.last.counter = 0;
        } else {
            self.advance_from(self.last.counter);
        }

        self.last
    }

    /// Advance past a timestamp received from another replica.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Drift`] and leaves the clock untouched if the
    /// stamp is more than [`MAX_DRIFT_MS`] ahead of the local wall clock.
    pub fn observe(&mut self, received: Timestamp) -> Result<(), ClockError> {
        let now_ms = current_time_ms();
        if received.physical_ms > now_ms.saturating_add(MAX_DRIFT_MS) {
            return Err(ClockError::Drift {
                received_ms: received.physical_ms,
                local_ms: now_ms,
                max_drift_ms: MAX_DRIFT_MS,
            });
        }

        if now_ms > self.last.physical_ms && now_ms > received.physical_ms {
            self.last.physical_ms = now_ms;
            self.last.counter = 0;
        } else if self.last.physical_ms == received.physical_ms {
            self.advance_from(self.last.counter.max(received.counter));
        } else if received.physical_ms > self.last.physical_ms {
            self.last.physical_ms = received.physical_ms;
            self.advance_from(received.counter);
        } else {
            self.advance_from(self.last.counter);
        }
        Ok(())
    }

    /// Move one step past `counter` at the current physical time, rolling
    /// into the next millisecond when the counter is exhausted.
    fn advance_from(&mut self, counter: u32) {
        if let Some(next) = counter.checked_add(1) {
            self.last.counter = next;
        } else {
            self.last.physical_ms = self.last.physical_ms.saturating_add(1);
            self.last.counter = 0;
        }
    }

    /// The last issued or observed timestamp, without advancing.
    #[must_use]
    pub fn current(&self) -> Timestamp {
        self.last
    }
}

fn current_time_ms() -> u64 {
    // A clock set before the epoch degrades to counter-only ordering.
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    u64::try_from(millis).unwrap_or(u64::MAX)
}
