/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Host scoring.
//!
//! A host's score is the product of six independent factors, each in `(0, 1]`. Every factor is monotone
//! in the quantity it measures: an older host, a more reliable host, more collateral, lower prices,
//! more free storage, or a newer version never lowers the score.

use std::cmp::Ordering;

use super::entry::HostDBEntry;
use crate::contractor::allowance::{exceeds_cap, Allowance};
use crate::host_protocol::messages::HostSettings;
use crate::types::constants::MIN_HOST_VERSION;
use crate::types::currency::Currency;
use crate::types::data_types::BlockHeight;

/// Smallest value any factor takes, so that a single bad factor lowers but never zeroes a score.
const MIN_FACTOR: f64 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreBreakdown {
    pub age: f64,
    pub uptime: f64,
    pub collateral: f64,
    pub price: f64,
    pub storage_remaining: f64,
    pub version: f64,
}

impl ScoreBreakdown {
    pub fn score(&self) -> f64 {
        self.age * self.uptime * self.collateral * self.price * self.storage_remaining * self.version
    }
}

pub fn score(entry: &HostDBEntry, allowance: &Allowance, height: BlockHeight) -> ScoreBreakdown {
    let settings = entry.settings.as_ref();
    ScoreBreakdown {
        age: age_factor(height.saturating_sub(entry.first_seen)),
        uptime: uptime_factor(entry),
        collateral: settings.map_or(MIN_FACTOR, collateral_factor),
        price: settings.map_or(MIN_FACTOR, |settings| price_factor(settings, allowance)),
        storage_remaining: settings.map_or(MIN_FACTOR, |settings| storage_factor(settings, allowance)),
        version: settings.map_or(MIN_FACTOR, |settings| version_factor(&settings.version)),
    }
}

fn age_factor(blocks: u64) -> f64 {
    match blocks {
        b if b >= 12096 => 1.0,
        b if b >= 4032 => 0.9,
        b if b >= 1008 => 0.7,
        b if b >= 288 => 0.5,
        b if b >= 144 => 0.33,
        b if b >= 12 => 0.2,
        _ => 0.1,
    }
}

fn uptime_factor(entry: &HostDBEntry) -> f64 {
    let total = entry.historic_successes + entry.historic_failures;
    if total == 0 {
        // Unscanned hosts are neither trusted nor written off.
        return 0.25;
    }
    let ratio = entry.historic_successes as f64 / total as f64;
    let mut factor = ratio.powi(4).max(MIN_FACTOR);
    if !entry.is_online() {
        factor *= 0.5;
    }
    factor
}

fn collateral_factor(settings: &HostSettings) -> f64 {
    if settings.storage_price.is_zero() {
        return 1.0;
    }
    // Collateral of at least twice the storage price is the target.
    let ratio = settings.collateral.as_f64() / (2.0 * settings.storage_price.as_f64());
    ratio.clamp(MIN_FACTOR, 1.0).sqrt()
}

/// Expected cost of one contract with the host under `allowance`.
pub fn expected_contract_cost(settings: &HostSettings, allowance: &Allowance) -> Currency {
    let hosts = allowance.hosts.max(1);
    let redundancy_millis = (allowance.expected_redundancy.max(0.0) * 1000.0) as u64;
    let storage = allowance
        .expected_storage
        .saturating_mul(redundancy_millis)
        / 1000
        / hosts;
    let upload = allowance.expected_upload.saturating_mul(redundancy_millis) / 1000 / hosts;
    let download = allowance.expected_download / hosts;
    settings.contract_price
        + settings.storage_price.mul64(storage).mul64(allowance.period)
        + settings.upload_bandwidth_price.mul64(upload)
        + settings.download_bandwidth_price.mul64(download)
}

fn price_factor(settings: &HostSettings, allowance: &Allowance) -> f64 {
    if exceeds_cap(settings.base_rpc_price, allowance.max_rpc_price)
        || exceeds_cap(settings.contract_price, allowance.max_contract_price)
        || exceeds_cap(settings.sector_access_price, allowance.max_sector_access_price)
        || exceeds_cap(settings.storage_price, allowance.max_storage_price)
        || exceeds_cap(settings.upload_bandwidth_price, allowance.max_upload_bandwidth_price)
        || exceeds_cap(settings.download_bandwidth_price, allowance.max_download_bandwidth_price)
    {
        return MIN_FACTOR;
    }
    let cost = expected_contract_cost(settings, allowance);
    if cost.is_zero() || allowance.is_cancelled() {
        return 1.0;
    }
    let budget = allowance.funds.div64(allowance.hosts.max(1));
    let ratio = budget.as_f64() / cost.as_f64();
    ratio.clamp(MIN_FACTOR, 1.0).powi(2)
}

fn storage_factor(settings: &HostSettings, allowance: &Allowance) -> f64 {
    let wanted = (allowance.expected_storage as f64 * allowance.expected_redundancy.max(1.0))
        / allowance.hosts.max(1) as f64;
    if wanted <= 0.0 {
        return 1.0;
    }
    (settings.remaining_storage as f64 / wanted).clamp(MIN_FACTOR, 1.0)
}

fn version_factor(version: &str) -> f64 {
    match compare_versions(version, MIN_HOST_VERSION) {
        Ordering::Less => MIN_FACTOR,
        _ => 1.0,
    }
}

/// Compare dotted version strings numerically. Missing components count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> { v.split('.').map(|part| part.trim().parse().unwrap_or(0)).collect() };
    let (a, b) = (parse(a), parse(b));
    for i in 0..a.len().max(b.len()) {
        let ordering = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostdb::entry::HostDBEntry;
    use crate::types::constants::SECTOR_SIZE;
    use crate::types::data_types::{HostPublicKey, NetAddress};

    fn settings() -> HostSettings {
        HostSettings {
            net_address: NetAddress::new("10.0.0.1:9982"),
            version: "1.5.0".into(),
            accepting_contracts: true,
            max_duration: 30_000,
            window_size: 144,
            collateral: Currency::new(200),
            max_collateral: Currency::coins(100),
            contract_price: Currency::coins(1),
            storage_price: Currency::new(100),
            upload_bandwidth_price: Currency::new(10),
            download_bandwidth_price: Currency::new(10),
            base_rpc_price: Currency::new(1),
            sector_access_price: Currency::new(1),
            remaining_storage: 1 << 40,
            total_storage: 1 << 40,
            sector_size: SECTOR_SIZE,
        }
    }

    fn entry(settings: HostSettings) -> HostDBEntry {
        let mut entry = HostDBEntry::new(HostPublicKey::new([1; 32]), settings.net_address.clone(), BlockHeight::new(0));
        entry.record_scan(Ok(settings));
        entry
    }

    #[test]
    fn each_factor_is_monotone() {
        let allowance = Allowance::default_allowance(Currency::coins(1000));
        let height = BlockHeight::new(500);
        let base = score(&entry(settings()), &allowance, height);

        let mut cheaper = settings();
        cheaper.storage_price = Currency::new(1);
        cheaper.collateral = Currency::new(2);
        assert!(score(&entry(cheaper), &allowance, height).price >= base.price);

        let mut more_collateral = settings();
        more_collateral.collateral = Currency::new(50);
        assert!(score(&entry(more_collateral), &allowance, height).collateral <= base.collateral);

        let older = score(&entry(settings()), &allowance, BlockHeight::new(20_000));
        assert!(older.age > base.age);

        let mut outdated = settings();
        outdated.version = "1.3.9".into();
        assert!(score(&entry(outdated), &allowance, height).score() < base.score());
    }

    #[test]
    fn price_above_a_cap_collapses_the_price_factor() {
        let allowance = Allowance::builder()
            .funds(Currency::coins(1000))
            .max_storage_price(Currency::new(50))
            .build();
        let breakdown = score(&entry(settings()), &allowance, BlockHeight::new(10));
        assert_eq!(breakdown.price, MIN_FACTOR);
    }

    #[test]
    fn failed_scans_lower_uptime() {
        let mut flaky = entry(settings());
        let reliable = score(&flaky, &Allowance::zero(), BlockHeight::new(0)).uptime;
        flaky.record_scan(Err("connection refused".into()));
        assert!(score(&flaky, &Allowance::zero(), BlockHeight::new(0)).uptime < reliable);
    }

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(compare_versions("1.10.0", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.4", "1.4.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.3.7", MIN_HOST_VERSION), Ordering::Less);
    }
}
