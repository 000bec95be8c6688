/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The user's spending budget and expected usage profile.

use borsh::{BorshDeserialize, BorshSerialize};
use typed_builder::TypedBuilder;

use crate::types::currency::Currency;

/// Why an allowance was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllowanceError {
    #[error("allowance must form contracts with at least one host")]
    NoHosts,
    #[error("allowance period cannot be zero")]
    ZeroPeriod,
    #[error("allowance renew window cannot be zero")]
    ZeroWindow,
    #[error("renew window ({window}) must be shorter than the period ({period})")]
    WindowTooLarge { window: u64, period: u64 },
    #[error("expected storage cannot be zero")]
    ZeroExpectedStorage,
    #[error("expected upload cannot be zero")]
    ZeroExpectedUpload,
    #[error("expected download cannot be zero")]
    ZeroExpectedDownload,
    #[error("expected redundancy cannot be zero")]
    ZeroExpectedRedundancy,
}

/// What the renter may spend per period, and on what it expects to spend it.
///
/// Price caps of zero mean "no cap".
#[derive(Clone, Debug, PartialEq, TypedBuilder, BorshSerialize, BorshDeserialize)]
#[builder(builder_method(doc = "
    Create a builder for building an [Allowance]. Every field defaults to the stock profile of
    [Allowance::default_allowance], except `funds`, which is required.
"))]
pub struct Allowance {
    #[builder(setter(doc = "Set the funds available for contracts each period. Required."))]
    pub funds: Currency,
    #[builder(default = 50, setter(doc = "Set the number of hosts to form contracts with."))]
    pub hosts: u64,
    #[builder(default = 12096, setter(doc = "Set the length of a period in blocks."))]
    pub period: u64,
    #[builder(default = 4032, setter(doc = "Set how many blocks before a contract's end it is renewed."))]
    pub renew_window: u64,
    #[builder(default = 1 << 40, setter(doc = "Set the number of bytes the renter expects to store."))]
    pub expected_storage: u64,
    #[builder(default = 1 << 38, setter(doc = "Set the number of bytes the renter expects to upload per period."))]
    pub expected_upload: u64,
    #[builder(default = 1 << 40, setter(doc = "Set the number of bytes the renter expects to download per period."))]
    pub expected_download: u64,
    #[builder(default = 3.0, setter(doc = "Set the redundancy files are expected to be uploaded with."))]
    pub expected_redundancy: f64,
    #[builder(default = 1 << 40, setter(doc = "Set the largest amount of contract data that may be churned voluntarily per period, in bytes."))]
    pub max_period_churn: u64,

    #[builder(default, setter(doc = "Cap the base price of one RPC."))]
    pub max_rpc_price: Currency,
    #[builder(default, setter(doc = "Cap the price of forming a contract."))]
    pub max_contract_price: Currency,
    #[builder(default, setter(doc = "Cap the price of one sector access."))]
    pub max_sector_access_price: Currency,
    #[builder(default, setter(doc = "Cap the storage price per byte per block."))]
    pub max_storage_price: Currency,
    #[builder(default, setter(doc = "Cap the price per byte uploaded."))]
    pub max_upload_bandwidth_price: Currency,
    #[builder(default, setter(doc = "Cap the price per byte downloaded."))]
    pub max_download_bandwidth_price: Currency,
}

impl Allowance {
    /// The stock allowance profile with `funds`.
    pub fn default_allowance(funds: Currency) -> Allowance {
        Allowance::builder().funds(funds).build()
    }

    /// The allowance that cancels all contract activity.
    pub fn zero() -> Allowance {
        Allowance {
            funds: Currency::ZERO,
            hosts: 0,
            period: 0,
            renew_window: 0,
            expected_storage: 0,
            expected_upload: 0,
            expected_download: 0,
            expected_redundancy: 0.0,
            max_period_churn: 0,
            max_rpc_price: Currency::ZERO,
            max_contract_price: Currency::ZERO,
            max_sector_access_price: Currency::ZERO,
            max_storage_price: Currency::ZERO,
            max_upload_bandwidth_price: Currency::ZERO,
            max_download_bandwidth_price: Currency::ZERO,
        }
    }

    /// Whether this allowance cancels contract activity.
    pub fn is_cancelled(&self) -> bool {
        self.funds.is_zero()
    }

    /// Check that a non-cancelling allowance is usable.
    pub fn validate(&self) -> Result<(), AllowanceError> {
        if self.is_cancelled() {
            return Ok(());
        }
        if self.hosts == 0 {
            return Err(AllowanceError::NoHosts);
        }
        if self.period == 0 {
            return Err(AllowanceError::ZeroPeriod);
        }
        if self.renew_window == 0 {
            return Err(AllowanceError::ZeroWindow);
        }
        if self.renew_window >= self.period {
            return Err(AllowanceError::WindowTooLarge {
                window: self.renew_window,
                period: self.period,
            });
        }
        if self.expected_storage == 0 {
            return Err(AllowanceError::ZeroExpectedStorage);
        }
        if self.expected_upload == 0 {
            return Err(AllowanceError::ZeroExpectedUpload);
        }
        if self.expected_download == 0 {
            return Err(AllowanceError::ZeroExpectedDownload);
        }
        if self.expected_redundancy <= 0.0 {
            return Err(AllowanceError::ZeroExpectedRedundancy);
        }
        Ok(())
    }

    /// Funds set aside for each contract when it is formed.
    pub fn contract_funding(&self) -> Currency {
        if self.hosts == 0 {
            return Currency::ZERO;
        }
        // A third is kept back for renewals and refreshes.
        self.funds.mul_ratio(2, 3).div64(self.hosts)
    }
}

/// Whether `price` exceeds a cap, where a zero cap means no cap.
pub(crate) fn exceeds_cap(price: Currency, cap: Currency) -> bool {
    !cap.is_zero() && price > cap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_funds_is_a_valid_cancel() {
        assert!(Allowance::zero().validate().is_ok());
        assert!(Allowance::zero().is_cancelled());
    }

    #[test]
    fn every_zero_field_has_its_own_error() {
        let base = Allowance::default_allowance(Currency::coins(500));
        assert!(base.validate().is_ok());

        let cases: Vec<(Box<dyn Fn(&mut Allowance)>, AllowanceError)> = vec![
            (Box::new(|a: &mut Allowance| a.hosts = 0), AllowanceError::NoHosts),
            (Box::new(|a: &mut Allowance| a.period = 0), AllowanceError::ZeroPeriod),
            (Box::new(|a: &mut Allowance| a.renew_window = 0), AllowanceError::ZeroWindow),
            (Box::new(|a: &mut Allowance| a.expected_storage = 0), AllowanceError::ZeroExpectedStorage),
            (Box::new(|a: &mut Allowance| a.expected_upload = 0), AllowanceError::ZeroExpectedUpload),
            (Box::new(|a: &mut Allowance| a.expected_download = 0), AllowanceError::ZeroExpectedDownload),
            (Box::new(|a: &mut Allowance| a.expected_redundancy = 0.0), AllowanceError::ZeroExpectedRedundancy),
        ];
        for (mutate, expected) in cases {
            let mut allowance = base.clone();
            mutate(&mut allowance);
            assert_eq!(allowance.validate(), Err(expected));
        }
    }

    #[test]
    fn renew_window_must_fit_in_period() {
        let allowance = Allowance::builder()
            .funds(Currency::coins(1))
            .period(100)
            .renew_window(100)
            .build();
        assert!(matches!(allowance.validate(), Err(AllowanceError::WindowTooLarge { .. })));
    }
}
