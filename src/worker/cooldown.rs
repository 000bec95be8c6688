/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exponential cooldowns after consecutive failures.

use std::time::{Duration, Instant, SystemTime};

/// `base * 2^min(failures, max_penalty)`.
pub fn cooldown_duration(base: Duration, consecutive_failures: u64, max_penalty: u32) -> Duration {
    let exponent = consecutive_failures.min(max_penalty as u64) as u32;
    base.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
}

/// One of a worker's cooldown clocks.
#[derive(Clone, Debug, Default)]
pub(crate) struct Cooldown {
    consecutive_failures: u64,
    recent_failure: Option<Instant>,
    recent_error: Option<String>,
    recent_error_time: Option<SystemTime>,
}

impl Cooldown {
    pub(crate) fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures
    }

    pub(crate) fn recent_error(&self) -> Option<&str> {
        self.recent_error.as_deref()
    }

    pub(crate) fn recent_error_time(&self) -> Option<SystemTime> {
        self.recent_error_time
    }

    /// Time left until the clock runs out. Zero when not cooling down.
    pub(crate) fn remaining(&self, base: Duration, max_penalty: u32) -> Duration {
        match self.recent_failure {
            None => Duration::ZERO,
            Some(at) => {
                let until = at + cooldown_duration(base, self.consecutive_failures, max_penalty);
                until.saturating_duration_since(Instant::now())
            }
        }
    }

    pub(crate) fn is_active(&self, base: Duration, max_penalty: u32) -> bool {
        self.remaining(base, max_penalty) > Duration::ZERO
    }

    /// Start a new cooldown. Returns the failure count and its length.
    pub(crate) fn record_failure(&mut self, err: String, base: Duration, max_penalty: u32) -> (u64, Duration) {
        self.consecutive_failures += 1;
        self.recent_failure = Some(Instant::now());
        self.recent_error = Some(err);
        self.recent_error_time = Some(SystemTime::now());
        (
            self.consecutive_failures,
            cooldown_duration(base, self.consecutive_failures, max_penalty),
        )
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_doubles_up_to_the_penalty_cap() {
        let base = Duration::from_secs(3);
        assert_eq!(cooldown_duration(base, 0, 10), base);
        assert_eq!(cooldown_duration(base, 1, 10), Duration::from_secs(6));
        assert_eq!(cooldown_duration(base, 4, 10), Duration::from_secs(48));
        assert_eq!(cooldown_duration(base, 40, 10), Duration::from_secs(3 * 1024));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let base = Duration::from_secs(60);
        let mut cooldown = Cooldown::default();
        assert!(!cooldown.is_active(base, 5));
        let (failures, length) = cooldown.record_failure("dial failed".into(), base, 5);
        assert_eq!(failures, 1);
        assert_eq!(length, Duration::from_secs(120));
        assert!(cooldown.is_active(base, 5));
        assert_eq!(cooldown.recent_error(), Some("dial failed"));
        cooldown.record_success();
        assert_eq!(cooldown.consecutive_failures(), 0);
        // The clock started by the last failure still runs out on its own.
        assert!(cooldown.is_active(base, 5));
    }
}
