/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Deciding what a contract is still good for.

use std::cmp::Ordering;

use super::allowance::{exceeds_cap, Allowance};
use crate::contract_set::record::{ContractMetadata, ContractUtility};
use crate::host_protocol::messages::HostSettings;
use crate::hostdb::entry::HostDBEntry;
use crate::hostdb::scoring::{compare_versions, expected_contract_cost, ScoreBreakdown};
use crate::types::constants::MIN_HOST_VERSION;
use crate::types::currency::Currency;

/// A host must score at least `1 / SCORE_LEEWAY` of the weakest host the allowance would pick.
pub const SCORE_LEEWAY: f64 = 100.0;

/// Everything a utility check looks at besides the contract and its host.
pub(crate) struct UtilityContext<'a> {
    pub allowance: &'a Allowance,
    pub score_threshold: f64,
    pub refresh_fraction: f64,
    pub gouging_fraction_denom: u64,
    pub double_spent: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Verdict {
    Keep(ContractUtility),
    /// The contract leaves the upload and renew set.
    Churn {
        utility: ContractUtility,
        voluntary: bool,
        reason: String,
    },
}

const GOOD: ContractUtility = ContractUtility {
    good_for_upload: true,
    good_for_renew: true,
    bad_contract: false,
    locked: false,
};

const USELESS: ContractUtility = ContractUtility {
    good_for_upload: false,
    good_for_renew: false,
    bad_contract: false,
    locked: false,
};

/// Score a host must beat to keep its contracts: the score of the `hosts`-th best active host, scaled
/// down by [`SCORE_LEEWAY`]. Zero when there are no active hosts.
pub fn score_threshold(mut scores: Vec<f64>, hosts: u64) -> f64 {
    if scores.is_empty() || hosts == 0 {
        return 0.0;
    }
    scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    let index = (hosts as usize).min(scores.len()) - 1;
    scores[index] / SCORE_LEEWAY
}

/// Why a host is gouging under `allowance`, if it is.
pub fn host_gouging(settings: &HostSettings, allowance: &Allowance, gouging_fraction_denom: u64) -> Option<String> {
    let caps = [
        ("base rpc price", settings.base_rpc_price, allowance.max_rpc_price),
        ("contract price", settings.contract_price, allowance.max_contract_price),
        ("sector access price", settings.sector_access_price, allowance.max_sector_access_price),
        ("storage price", settings.storage_price, allowance.max_storage_price),
        ("upload bandwidth price", settings.upload_bandwidth_price, allowance.max_upload_bandwidth_price),
        ("download bandwidth price", settings.download_bandwidth_price, allowance.max_download_bandwidth_price),
    ];
    for (name, price, cap) in caps {
        if exceeds_cap(price, cap) {
            return Some(format!("{} {} exceeds the cap of {}", name, price, cap));
        }
    }
    if allowance.is_cancelled() || gouging_fraction_denom == 0 {
        return None;
    }
    let cost = expected_contract_cost(settings, allowance);
    let limit = allowance.funds.div64(gouging_fraction_denom);
    if cost > limit {
        return Some(format!(
            "expected contract cost {} exceeds 1/{} of the allowance",
            cost, gouging_fraction_denom
        ));
    }
    None
}

/// Funds below which a contract is refreshed rather than used for uploads.
pub fn refresh_threshold(contract: &ContractMetadata, refresh_fraction: f64) -> Currency {
    let millis = (refresh_fraction.clamp(0.0, 1.0) * 1000.0) as u64;
    contract.initial_renter_funds.mul_ratio(millis, 1000)
}

/// The utility `contract` should have now.
pub(crate) fn check_utility(
    contract: &ContractMetadata,
    host: Option<&(HostDBEntry, ScoreBreakdown)>,
    ctx: &UtilityContext<'_>,
) -> Verdict {
    let current = contract.utility;
    if current.locked {
        return Verdict::Keep(current);
    }
    if ctx.double_spent || current.bad_contract {
        let bad = ContractUtility {
            bad_contract: true,
            ..USELESS
        };
        return Verdict::Churn {
            utility: bad,
            voluntary: false,
            reason: "contract is bad".into(),
        };
    }
    if ctx.allowance.is_cancelled() {
        return Verdict::Keep(USELESS);
    }

    let (entry, breakdown) = match host {
        Some(host) => host,
        None => {
            return Verdict::Churn {
                utility: USELESS,
                voluntary: false,
                reason: "host is no longer in the host database".into(),
            }
        }
    };
    let settings = match (&entry.settings, entry.is_online()) {
        (Some(settings), true) => settings,
        // An offline host may come back; keep the contract around for renewal.
        _ => {
            return Verdict::Keep(ContractUtility {
                good_for_upload: false,
                ..GOOD
            })
        }
    };
    if compare_versions(&settings.version, MIN_HOST_VERSION) == Ordering::Less {
        return Verdict::Churn {
            utility: USELESS,
            voluntary: false,
            reason: format!("host version {} is below {}", settings.version, MIN_HOST_VERSION),
        };
    }
    if let Some(reason) = host_gouging(settings, ctx.allowance, ctx.gouging_fraction_denom) {
        return Verdict::Churn {
            utility: USELESS,
            voluntary: false,
            reason,
        };
    }
    if breakdown.score() < ctx.score_threshold {
        return Verdict::Churn {
            utility: USELESS,
            voluntary: true,
            reason: format!("host score {:e} is below {:e}", breakdown.score(), ctx.score_threshold),
        };
    }
    if contract.renter_funds.is_zero() || contract.renter_funds < refresh_threshold(contract, ctx.refresh_fraction) {
        return Verdict::Keep(ContractUtility {
            good_for_upload: false,
            ..GOOD
        });
    }
    Verdict::Keep(GOOD)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::contract_set::record::ContractSpending;
    use crate::hostdb::scoring;
    use crate::types::constants::SECTOR_SIZE;
    use crate::types::data_types::{BlockHeight, ContractID, CryptoHash, HostPublicKey, NetAddress};

    fn settings() -> HostSettings {
        HostSettings {
            net_address: NetAddress::new("10.0.0.1:9982"),
            version: "1.5.0".into(),
            accepting_contracts: true,
            max_duration: 100_000,
            window_size: 144,
            collateral: Currency::new(2),
            max_collateral: Currency::coins(100),
            contract_price: Currency::new(1_000),
            storage_price: Currency::new(1),
            upload_bandwidth_price: Currency::new(1),
            download_bandwidth_price: Currency::new(1),
            base_rpc_price: Currency::new(1),
            sector_access_price: Currency::new(1),
            remaining_storage: 1 << 50,
            total_storage: 1 << 50,
            sector_size: SECTOR_SIZE,
        }
    }

    fn host() -> (HostDBEntry, ScoreBreakdown) {
        let mut entry = HostDBEntry::new(HostPublicKey::new([1; 32]), NetAddress::new("10.0.0.1:9982"), BlockHeight::new(0));
        entry.record_scan(Ok(settings()));
        let breakdown = scoring::score(&entry, &allowance(), BlockHeight::new(10));
        (entry, breakdown)
    }

    fn allowance() -> Allowance {
        Allowance::default_allowance(Currency::coins(1_000))
    }

    pub(crate) fn contract(renter_funds: Currency) -> ContractMetadata {
        ContractMetadata {
            id: ContractID::new([2; 32]),
            host: HostPublicKey::new([1; 32]),
            renter_key: HostPublicKey::new([3; 32]),
            start_height: BlockHeight::new(0),
            end_height: BlockHeight::new(1_000),
            renter_funds,
            initial_renter_funds: Currency::new(10_000),
            total_cost: Currency::new(11_000),
            spending: ContractSpending::default(),
            utility: GOOD,
            revision_number: 0,
            size: 0,
            merkle_root: CryptoHash::default(),
            num_sectors: 0,
            pending_intents: 0,
        }
    }

    fn context(allowance: &Allowance) -> UtilityContext<'_> {
        UtilityContext {
            allowance,
            score_threshold: 0.0,
            refresh_fraction: 0.2,
            gouging_fraction_denom: 4,
            double_spent: false,
        }
    }

    #[test]
    fn empty_contract_is_good_for_renew_only() {
        let allowance = allowance();
        let host = host();
        let verdict = check_utility(&contract(Currency::ZERO), Some(&host), &context(&allowance));
        assert_eq!(
            verdict,
            Verdict::Keep(ContractUtility {
                good_for_upload: false,
                good_for_renew: true,
                bad_contract: false,
                locked: false,
            })
        );
        let low = check_utility(&contract(Currency::new(1_999)), Some(&host), &context(&allowance));
        assert!(matches!(low, Verdict::Keep(u) if !u.good_for_upload && u.good_for_renew));
        let healthy = check_utility(&contract(Currency::new(5_000)), Some(&host), &context(&allowance));
        assert_eq!(healthy, Verdict::Keep(GOOD));
    }

    #[test]
    fn cancelled_allowance_disables_without_churning() {
        let allowance = Allowance::zero();
        let host = host();
        let verdict = check_utility(&contract(Currency::new(5_000)), Some(&host), &context(&allowance));
        assert_eq!(verdict, Verdict::Keep(USELESS));
    }

    #[test]
    fn low_score_is_voluntary_and_gouging_is_not() {
        let allowance = allowance();
        let host = host();
        let mut ctx = context(&allowance);
        ctx.score_threshold = 2.0;
        let verdict = check_utility(&contract(Currency::new(5_000)), Some(&host), &ctx);
        assert!(matches!(verdict, Verdict::Churn { voluntary: true, .. }));

        let capped = Allowance::builder()
            .funds(Currency::coins(1_000))
            .max_storage_price(Currency::new(0))
            .max_contract_price(Currency::new(10))
            .build();
        let verdict = check_utility(&contract(Currency::new(5_000)), Some(&host), &context(&capped));
        assert!(matches!(verdict, Verdict::Churn { voluntary: false, .. }));
    }

    #[test]
    fn threshold_uses_the_allowance_host_count() {
        let scores = vec![0.5, 4.0, 1.0, 2.0];
        assert_eq!(score_threshold(scores.clone(), 2), 2.0 / SCORE_LEEWAY);
        assert_eq!(score_threshold(scores, 10), 0.5 / SCORE_LEEWAY);
        assert_eq!(score_threshold(Vec::new(), 3), 0.0);
    }
}
