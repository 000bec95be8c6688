/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Price-gouging checks run against a host's price table before every upload or download.
//!
//! Each check first compares individual prices with the caps of the allowance, and then asks whether
//! doing the same operation over and over until `1 / gouging_fraction_denom` of the allowance's expected
//! volume is reached would cost more than the whole allowance. Without an allowance there is no baseline
//! to judge prices by, so only the caps are checked.

use crate::contractor::allowance::{exceeds_cap, Allowance};
use crate::errors::RenterError;
use crate::host_protocol::price_table::PriceTable;
use crate::types::constants::SECTOR_SIZE;
use crate::types::currency::Currency;

fn check_caps(caps: &[(&str, Currency, Currency)]) -> Result<(), RenterError> {
    for (name, price, cap) in caps {
        if exceeds_cap(*price, *cap) {
            return Err(RenterError::PriceGouging(format!(
                "{} of host is {}, which is above the maximum allowed by the allowance: {}",
                name, price, cap
            )));
        }
    }
    Ok(())
}

/// Whether uploading a sector to the host is too expensive.
pub fn check_upload_gouging(pt: &PriceTable, allowance: &Allowance, gouging_fraction_denom: u64) -> Result<(), RenterError> {
    check_caps(&[
        ("rpc price", pt.init_base_cost, allowance.max_rpc_price),
        ("sector access price", pt.write_base_cost, allowance.max_sector_access_price),
        ("storage price", pt.write_store_cost, allowance.max_storage_price),
        ("upload bandwidth price", pt.upload_bandwidth_cost, allowance.max_upload_bandwidth_price),
    ])?;
    if allowance.is_cancelled() || gouging_fraction_denom == 0 {
        return Ok(());
    }
    let single_upload = pt.init_base_cost
        + pt.write_base_cost
        + pt.upload_bandwidth_cost.mul64(SECTOR_SIZE)
        + pt.write_store_cost.mul64(allowance.period).mul64(SECTOR_SIZE);
    let per_byte = single_upload.div64(SECTOR_SIZE);
    let reduced = per_byte.mul64(allowance.expected_storage).div64(gouging_fraction_denom);
    if reduced > allowance.funds {
        return Err(RenterError::PriceGouging(format!(
            "combined upload pricing of host yields {}, which is more than the renter is willing to pay for storage: {}",
            reduced, allowance.funds
        )));
    }
    Ok(())
}

/// Whether downloading from the host is too expensive.
pub fn check_download_gouging(pt: &PriceTable, allowance: &Allowance, gouging_fraction_denom: u64) -> Result<(), RenterError> {
    check_caps(&[
        ("rpc price", pt.init_base_cost, allowance.max_rpc_price),
        ("sector access price", pt.read_base_cost, allowance.max_sector_access_price),
        ("download bandwidth price", pt.download_bandwidth_cost, allowance.max_download_bandwidth_price),
    ])?;
    if allowance.is_cancelled() || gouging_fraction_denom == 0 {
        return Ok(());
    }
    let single_download =
        pt.init_base_cost + pt.read_base_cost + pt.download_bandwidth_cost.mul64(SECTOR_SIZE);
    let per_byte = single_download.div64(SECTOR_SIZE);
    let reduced = per_byte.mul64(allowance.expected_download).div64(gouging_fraction_denom);
    if reduced > allowance.funds {
        return Err(RenterError::PriceGouging(format!(
            "combined download pricing of host yields {}, which is more than the renter is willing to pay for downloads: {}",
            reduced, allowance.funds
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_protocol::messages::HostSettings;
    use crate::types::data_types::{BlockHeight, NetAddress};
    use std::time::Duration;

    fn price_table(storage_price: Currency, download_price: Currency) -> PriceTable {
        let settings = HostSettings {
            net_address: NetAddress::new("127.0.0.1:9982"),
            version: "1.5.0".into(),
            accepting_contracts: true,
            max_duration: 10_000,
            window_size: 144,
            collateral: Currency::new(1),
            max_collateral: Currency::coins(10),
            contract_price: Currency::coins(1),
            storage_price,
            upload_bandwidth_price: Currency::new(10),
            download_bandwidth_price: download_price,
            base_rpc_price: Currency::new(100),
            sector_access_price: Currency::new(100),
            remaining_storage: 1 << 40,
            total_storage: 1 << 40,
            sector_size: SECTOR_SIZE,
        };
        PriceTable::from_settings(&settings, [0; 16], BlockHeight::new(1), Duration::from_secs(60))
    }

    #[test]
    fn caps_are_enforced_individually() {
        let pt = price_table(Currency::new(5), Currency::new(5));
        let mut allowance = Allowance::default_allowance(Currency::coins(1_000_000));
        assert!(check_upload_gouging(&pt, &allowance, 4).is_ok());
        allowance.max_storage_price = Currency::new(4);
        let err = check_upload_gouging(&pt, &allowance, 4).unwrap_err();
        assert!(err.is_price_gouging());
        // Storage prices do not matter for downloads.
        assert!(check_download_gouging(&pt, &allowance, 4).is_ok());
        allowance.max_download_bandwidth_price = Currency::new(1);
        assert!(check_download_gouging(&pt, &allowance, 4).is_err());
    }

    #[test]
    fn combined_cost_is_checked_against_the_allowance() {
        let allowance = Allowance::builder()
            .funds(Currency::new(1_000_000))
            .expected_download(1 << 30)
            .build();
        let cheap = price_table(Currency::ZERO, Currency::ZERO);
        assert!(check_download_gouging(&cheap, &allowance, 4).is_ok());
        let expensive = price_table(Currency::ZERO, Currency::new(1000));
        assert!(check_download_gouging(&expensive, &allowance, 4).unwrap_err().is_price_gouging());
        // Without an allowance only the caps count.
        assert!(check_download_gouging(&expensive, &Allowance::zero(), 4).is_ok());
    }
}
