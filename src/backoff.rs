use crossbeam_utils::Backoff;
use std::thread;
use std::time::Duration;

const MIN_SLEEP_MS: u64 = 2;
const MAX_SLEEP_MS: u64 = 20_000;
const JITTER_MS: u64 = 10;

/// Exponential contention backoff between failed CAS attempts.
///
/// Starts with a cheap spin/yield phase and escalates to sleeping
/// `min(MAX_SLEEP_MS, MIN_SLEEP_MS^attempt + jitter)` milliseconds. Purely a
/// throughput heuristic under contention; correctness never depends on how
/// long a waiter sleeps.
pub(crate) struct ExpBackoff {
    spin: Backoff,
    attempt: u32,
}

impl ExpBackoff {
    pub(crate) fn new() -> Self {
        ExpBackoff {
            spin: Backoff::new(),
            attempt: 0,
        }
    }

    /// Waits before the next retry, escalating on every call.
    pub(crate) fn wait(&mut self) {
        if !self.spin.is_completed() {
            self.spin.snooze();
            return;
        }
        self.attempt += 1;
        thread::sleep(Duration::from_millis(Self::delay_ms(self.attempt)));
    }

    fn delay_ms(attempt: u32) -> u64 {
        let jitter = rand::random_range(0..JITTER_MS);
        MIN_SLEEP_MS
            .saturating_pow(attempt)
            .saturating_add(jitter)
            .min(MAX_SLEEP_MS)
    }
}
