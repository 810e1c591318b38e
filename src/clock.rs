// =============================================================================
// Clock & ID generation
// =============================================================================
//
// All engine timestamps come from a process-wide monotonic clock anchored at
// startup; wall-clock time is used only for day-file partitioning and
// external protocols (FIX SendingTime). Entity ids are 64-bit monotonic
// counters — never reused, never reset.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;

/// Monotonic millisecond clock. The anchor pins the wall-clock epoch at
/// construction time; subsequent reads advance by `Instant` elapsed time and
/// therefore never go backwards even if the system clock is stepped.
#[derive(Debug)]
pub struct Clock {
    epoch_ms: i64,
    anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch_ms: Utc::now().timestamp_millis(),
            anchor: Instant::now(),
        }
    }

    /// Milliseconds since the UNIX epoch, monotonic within this process.
    pub fn now_ms(&self) -> i64 {
        self.epoch_ms + self.anchor.elapsed().as_millis() as i64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic 64-bit id allocators for every entity class the engine owns.
///
/// A single atomic increment per allocation; ids start at 1 so that 0 can
/// mean "unset" in wire payloads.
#[derive(Debug)]
pub struct IdGen {
    account: AtomicU64,
    position: AtomicU64,
    order: AtomicU64,
    ledger_entry: AtomicU64,
    subscriber: AtomicU64,
}

impl IdGen {
    pub fn new() -> Self {
        Self {
            account: AtomicU64::new(1),
            position: AtomicU64::new(1),
            order: AtomicU64::new(1),
            ledger_entry: AtomicU64::new(1),
            subscriber: AtomicU64::new(1),
        }
    }

    pub fn next_account(&self) -> u64 {
        self.account.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_position(&self) -> u64 {
        self.position.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_order(&self) -> u64 {
        self.order.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_ledger_entry(&self) -> u64 {
        self.ledger_entry.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_subscriber(&self) -> u64 {
        self.subscriber.fetch_add(1, Ordering::Relaxed)
    }

    /// Fast-forward the ledger-entry counter past `id`. Used when replaying
    /// a persisted journal so fresh ids stay monotonic across restarts.
    pub fn bump_ledger_entry(&self, id: u64) {
        let mut current = self.ledger_entry.load(Ordering::Relaxed);
        while current <= id {
            match self.ledger_entry.compare_exchange(
                current,
                id + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }

    #[test]
    fn ids_are_monotonic_and_start_at_one() {
        let ids = IdGen::new();
        assert_eq!(ids.next_order(), 1);
        assert_eq!(ids.next_order(), 2);
        assert_eq!(ids.next_position(), 1);
    }

    #[test]
    fn bump_ledger_entry_fast_forwards() {
        let ids = IdGen::new();
        ids.bump_ledger_entry(41);
        assert_eq!(ids.next_ledger_entry(), 42);
        // Bumping backwards is a no-op.
        ids.bump_ledger_entry(5);
        assert_eq!(ids.next_ledger_entry(), 43);
    }
}
