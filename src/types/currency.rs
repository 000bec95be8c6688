/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Amounts of money moved between the renter and hosts.
//!
//! A [`Currency`] is an unsigned count of the smallest unit ("hastings"). Arithmetic used in spending
//! decisions saturates instead of overflowing: a price so high that it overflows is treated as
//! "unaffordable", never as a panic.

use std::{
    fmt::{self, Display, Formatter},
    iter::Sum,
    ops::{Add, AddAssign},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number of hastings in one coin.
pub const HASTINGS_PER_COIN: u128 = 1_000_000_000_000_000_000_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BorshSerialize, BorshDeserialize)]
pub struct Currency(u128);

impl Currency {
    pub const ZERO: Currency = Currency(0);

    pub const fn new(hastings: u128) -> Self {
        Self(hastings)
    }

    /// `coins` whole coins.
    pub const fn coins(coins: u64) -> Self {
        Self((coins as u128).saturating_mul(HASTINGS_PER_COIN))
    }

    pub const fn hastings(&self) -> u128 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_sub(self, rhs: Currency) -> Option<Currency> {
        self.0.checked_sub(rhs.0).map(Currency)
    }

    pub fn saturating_sub(self, rhs: Currency) -> Currency {
        Currency(self.0.saturating_sub(rhs.0))
    }

    pub fn saturating_add(self, rhs: Currency) -> Currency {
        Currency(self.0.saturating_add(rhs.0))
    }

    pub fn mul64(self, rhs: u64) -> Currency {
        Currency(self.0.saturating_mul(rhs as u128))
    }

    pub fn mul(self, rhs: Currency) -> Currency {
        Currency(self.0.saturating_mul(rhs.0))
    }

    /// Integer division. Division by zero yields zero.
    pub fn div64(self, rhs: u64) -> Currency {
        if rhs == 0 {
            return Currency::ZERO;
        }
        Currency(self.0 / rhs as u128)
    }

    /// Integer division. Division by zero yields zero.
    pub fn div(self, rhs: Currency) -> Currency {
        if rhs.0 == 0 {
            return Currency::ZERO;
        }
        Currency(self.0 / rhs.0)
    }

    /// `self * numerator / denominator`, computed without intermediate overflow for the ranges the
    /// renter works with.
    pub fn mul_ratio(self, numerator: u64, denominator: u64) -> Currency {
        if denominator == 0 {
            return Currency::ZERO;
        }
        let whole = self.0 / denominator as u128;
        let rem = self.0 % denominator as u128;
        Currency(
            whole
                .saturating_mul(numerator as u128)
                .saturating_add(rem.saturating_mul(numerator as u128) / denominator as u128),
        )
    }

    /// Approximate value as a float, used only for scoring.
    pub fn as_f64(&self) -> f64 {
        self.0 as f64
    }
}

impl Add for Currency {
    type Output = Currency;
    fn add(self, rhs: Currency) -> Currency {
        self.saturating_add(rhs)
    }
}

impl AddAssign for Currency {
    fn add_assign(&mut self, rhs: Currency) {
        *self = self.saturating_add(rhs)
    }
}

impl Sum for Currency {
    fn sum<I: Iterator<Item = Currency>>(iter: I) -> Currency {
        iter.fold(Currency::ZERO, |acc, c| acc + c)
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let whole = self.0 / HASTINGS_PER_COIN;
        let frac = self.0 % HASTINGS_PER_COIN;
        if frac == 0 {
            write!(f, "{} SCP", whole)
        } else {
            write!(f, "{} H", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_ratio_keeps_precision_for_large_amounts() {
        let funds = Currency::coins(1000);
        assert_eq!(funds.mul_ratio(1, 4), Currency::coins(250));
        assert_eq!(Currency::new(7).mul_ratio(1, 2), Currency::new(3));
        assert_eq!(Currency::new(7).mul_ratio(3, 0), Currency::ZERO);
    }

    #[test]
    fn arithmetic_saturates() {
        let max = Currency::new(u128::MAX);
        assert_eq!(max + Currency::new(1), max);
        assert_eq!(Currency::ZERO.saturating_sub(Currency::new(5)), Currency::ZERO);
        assert_eq!(Currency::new(5).checked_sub(Currency::new(6)), None);
    }
}
