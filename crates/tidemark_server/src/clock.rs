//! The server's logical write clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tidemark_protocol::Timestamp;

/// A logical clock producing unique, strictly increasing timestamps.
///
/// Values track wall-clock milliseconds when they can, but uniqueness and
/// monotonicity win over accuracy: if the wall clock stalls or steps
/// backwards, `next` keeps counting up from the last issued value. Every
/// `last_modified` and `server_created_at` in the store comes from here;
/// client-supplied timestamps are never trusted.
#[derive(Debug)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    /// Creates a clock with no issued timestamps.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a clock that will only issue values above `last`.
    ///
    /// Used to seed from a store's highest persisted `last_modified`, so a
    /// restart can never reissue a timestamp.
    pub fn starting_at(last: Timestamp) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Issues the next timestamp.
    pub fn next(&self) -> Timestamp {
        let wall = wall_clock_ms();
        loop {
            let last = self.last.load(Ordering::SeqCst);
            let next = wall.max(last + 1);
            if self
                .last
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    /// Returns the most recently issued timestamp, `0` if none.
    pub fn last(&self) -> Timestamp {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
