//! Retry backoff policy shared by every channel.
//!
//! A fixed ordered schedule maps the attempt number to a delay; attempts
//! past the end of the schedule are clamped to the last entry, so reconnect
//! timing stays predictable and bounded. Pure function, no side effects.

use std::time::Duration;

/// Default delays in milliseconds: immediate, then 2s, 5s, 10s, 30s.
pub const DEFAULT_SCHEDULE_MS: [u64; 5] = [0, 2000, 5000, 10_000, 30_000];

/// Default cap on connection attempts before a channel goes terminal.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// An ordered retry schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays_ms: Vec<u64>,
}

impl BackoffSchedule {
    /// Create a schedule from explicit delays. Empty input falls back to
    /// the default schedule so `delay_for` always has an entry to clamp to.
    pub fn new(delays_ms: impl Into<Vec<u64>>) -> Self {
        let delays_ms: Vec<u64> = delays_ms.into();
        if delays_ms.is_empty() {
            return Self::default();
        }
        Self { delays_ms }
    }

    /// Schedule for tests: short delays so retry loops finish quickly.
    pub fn for_testing() -> Self {
        Self::new([0, 10, 20])
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// `schedule[min(attempt, len - 1)]` — non-decreasing as long as the
    /// schedule itself is, and always bounded by the last entry.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.delays_ms.len() - 1);
        Duration::from_millis(self.delays_ms[index])
    }

    /// Number of distinct schedule entries.
    pub fn len(&self) -> usize {
        self.delays_ms.len()
    }

    /// Whether the schedule has no entries (never true after `new`).
    pub fn is_empty(&self) -> bool {
        self.delays_ms.is_empty()
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            delays_ms: DEFAULT_SCHEDULE_MS.to_vec(),
        }
    }
}
