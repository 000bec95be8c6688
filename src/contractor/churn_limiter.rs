/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Caps how much contract data the contractor gives up per period.
//!
//! Dropping a contract from the upload set means the data it holds has to be repaired onto another host.
//! Voluntary churn (a host that merely scores worse than the rest) is deferred once the data churned in
//! the current period would exceed the allowance's `max_period_churn`. Involuntary churn (a bad contract,
//! a vanished host, price gouging) always goes through, but still counts towards the cap.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::{BlockHeight, ContractID};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ChurnState {
    /// First block of the period the counter belongs to.
    pub period_start: BlockHeight,
    /// Bytes of contract data churned since `period_start`.
    pub churned_this_period: u64,
}

impl ChurnState {
    /// A fresh counter for the period starting at `period_start`.
    pub fn starting_at(period_start: BlockHeight) -> ChurnState {
        ChurnState {
            period_start,
            churned_this_period: 0,
        }
    }
}

/// What the churn limiter reports to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChurnStatus {
    pub churned_this_period: u64,
    pub max_period_churn: u64,
}

#[derive(Clone, Debug)]
pub struct ChurnLimiter {
    state: ChurnState,
    max_period_churn: u64,
}

impl ChurnLimiter {
    pub fn new(state: ChurnState, max_period_churn: u64) -> ChurnLimiter {
        ChurnLimiter { state, max_period_churn }
    }

    pub fn state(&self) -> ChurnState {
        self.state
    }

    pub fn status(&self) -> ChurnStatus {
        ChurnStatus {
            churned_this_period: self.state.churned_this_period,
            max_period_churn: self.max_period_churn,
        }
    }

    pub fn set_max_period_churn(&mut self, max_period_churn: u64) {
        self.max_period_churn = max_period_churn;
    }

    /// Start counting a new period.
    pub fn reset(&mut self, period_start: BlockHeight) {
        self.state = ChurnState::starting_at(period_start);
    }

    /// Bytes that may still be churned voluntarily this period.
    pub fn remaining(&self) -> u64 {
        self.max_period_churn.saturating_sub(self.state.churned_this_period)
    }

    /// Whether a contract holding `size` bytes may be churned voluntarily now.
    pub fn can_churn(&self, size: u64) -> bool {
        self.state.churned_this_period.saturating_add(size) <= self.max_period_churn
    }

    /// Count a churned contract of `size` bytes.
    pub fn record(&mut self, size: u64) {
        self.state.churned_this_period = self.state.churned_this_period.saturating_add(size);
    }

    /// Decide which of `candidates` (contract, bytes held) to churn, in order. Voluntary candidates that
    /// do not fit under the cap are left out; involuntary ones are always taken.
    pub fn select(&mut self, candidates: &[(ContractID, u64, bool)]) -> Vec<ContractID> {
        let mut churned = Vec::new();
        for &(id, size, voluntary) in candidates {
            if voluntary && !self.can_churn(size) {
                continue;
            }
            self.record(size);
            churned.push(id);
        }
        churned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;

    #[test]
    fn voluntary_churn_stops_at_the_cap_until_the_next_period() {
        let mut limiter = ChurnLimiter::new(ChurnState::default(), GIB);
        let candidates: Vec<(ContractID, u64, bool)> = (1..=3u8)
            .map(|i| (ContractID::new([i; 32]), 800 * MIB, true))
            .collect();

        let churned = limiter.select(&candidates);
        assert_eq!(churned, vec![ContractID::new([1; 32])]);
        assert_eq!(limiter.remaining(), GIB - 800 * MIB);

        // Still over the cap within the same period.
        assert!(limiter.select(&candidates[1..]).is_empty());

        limiter.reset(BlockHeight::new(100));
        assert_eq!(limiter.select(&candidates[1..]), vec![ContractID::new([2; 32])]);
    }

    #[test]
    fn involuntary_churn_always_passes_but_counts() {
        let mut limiter = ChurnLimiter::new(ChurnState::default(), GIB);
        let bad = (ContractID::new([9; 32]), 2 * GIB, false);
        assert_eq!(limiter.select(&[bad]), vec![bad.0]);
        assert_eq!(limiter.remaining(), 0);
        assert!(!limiter.can_churn(1));
        assert_eq!(limiter.status().churned_this_period, 2 * GIB);
    }
}
