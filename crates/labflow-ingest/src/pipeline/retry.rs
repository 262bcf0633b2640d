//! Retry bookkeeping for files that failed to load

use std::time::{Duration, Instant};

/// Exponential backoff: `base * 2^(attempt - 1)`, never above `cap`
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// Failure history of one file still sitting in the inbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Consecutive failed attempts
    pub attempts: u32,
    /// Signature of the most recent deterministic failure
    pub last_signature: Option<String>,
    /// How many attempts in a row failed with `last_signature`
    pub repeats: u32,
    /// Earliest time the file may be attempted again
    pub next_at: Option<Instant>,
}

impl RetryState {
    /// Record a failed attempt and schedule the next one.
    ///
    /// Returns the number of consecutive attempts that failed with this same
    /// signature; transient failures (no signature) always return 0.
    pub fn record_failure(
        &mut self,
        signature: Option<String>,
        now: Instant,
        base: Duration,
        cap: Duration,
    ) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.repeats = match (&signature, &self.last_signature) {
            (Some(new), Some(old)) if new == old => self.repeats.saturating_add(1),
            (Some(_), _) => 1,
            (None, _) => 0,
        };
        self.last_signature = signature;
        self.next_at = Some(now + backoff_delay(base, self.attempts, cap));
        self.repeats
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_at.is_none_or(|at| now >= at)
    }

    /// Time left before the next attempt
    pub fn wait(&self, now: Instant) -> Duration {
        self.next_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or_default()
    }
}
