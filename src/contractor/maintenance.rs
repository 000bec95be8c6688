/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! One maintenance pass over the contract set.

use std::collections::HashSet;
use std::time::SystemTime;

use super::utility::{check_utility, refresh_threshold, score_threshold, UtilityContext, Verdict};
use super::{Contractor, DOUBLE_SPEND_DELAY};
use crate::alerts::{AlertID, AlertSeverity};
use crate::contract_set::record::{ContractMetadata, ContractUtility};
use crate::contractor::churn_limiter::ChurnLimiter;
use crate::errors::RenterError;
use crate::events::{ArchiveContractEvent, ChurnContractEvent, Event};
use crate::hostdb::scoring;
use crate::types::constants::{MATURITY_DELAY, WINDOW_SIZE};
use crate::types::currency::Currency;
use crate::types::data_types::{BlockHeight, ContractID, HostPublicKey};

const ALERT_WALLET_LOCKED: &str = "contractor-wallet-locked";
const ALERT_INSUFFICIENT_FUNDS: &str = "contractor-insufficient-allowance-funds";

struct ChurnCandidate {
    contract: ContractMetadata,
    utility: ContractUtility,
    voluntary: bool,
    reason: String,
}

impl Contractor {
    /// Run one maintenance pass: archive expired contracts, import recovered ones, recompute utilities,
    /// renew, refresh, and form contracts until the allowance's host target is met.
    ///
    /// Returns without doing anything if another pass holds the maintenance lock past the configured
    /// timeout, or if the renter is not synced.
    pub fn run_maintenance(&self) -> Result<(), RenterError> {
        let _lock = match self.try_lock_maintenance() {
            Some(lock) => lock,
            None => {
                log::debug!("Skipping contract maintenance, another pass is running");
                return Ok(());
            }
        };
        if !self.synced() {
            return Ok(());
        }

        self.archive_contracts();
        self.recover_contracts();
        self.update_utilities()?;

        let allowance = self.allowance();
        if allowance.is_cancelled() {
            return self.save();
        }

        if let Err(err) = self.seed() {
            self.alerter.register_alert(
                AlertID::from_name(ALERT_WALLET_LOCKED),
                "wallet is locked, contracts cannot be formed or renewed",
                err.to_string(),
                AlertSeverity::Warning,
            );
            return self.save();
        }
        self.alerter.unregister_alert(AlertID::from_name(ALERT_WALLET_LOCKED));

        let renewed = self.renew_contracts();
        self.refresh_contracts(&renewed);
        self.form_contracts();
        self.save()
    }

    /// Move contracts past their end height to the old contracts, and forget old contracts the host can no
    /// longer need.
    fn archive_contracts(&self) {
        let height = self.block_height();
        let expired: Vec<ContractMetadata> = self
            .contracts
            .view_all()
            .into_iter()
            .filter(|contract| height > contract.end_height)
            .collect();
        archive_each(&expired, |contract| {
            let handle = self.contracts.acquire(&contract.id)?;
            let (mut old, _) = handle.delete()?;
            old.utility.good_for_upload = false;
            old.utility.good_for_renew = false;
            self.write_state().old_contracts.insert(old.id, old);
            Event::publish(
                &self.event_publisher,
                Event::ArchiveContract(ArchiveContractEvent {
                    timestamp: SystemTime::now(),
                    contract: contract.id,
                    end_height: contract.end_height,
                }),
            );
            Ok(())
        });

        let mut state = self.write_state();
        let expired: Vec<ContractID> = state
            .old_contracts
            .values()
            .filter(|contract| height > contract.end_height + WINDOW_SIZE + MATURITY_DELAY)
            .map(|contract| contract.id)
            .collect();
        for id in expired {
            state.old_contracts.remove(&id);
            if let Some(successor) = state.renewed_to.remove(&id) {
                state.renewed_from.remove(&successor);
            }
        }
    }

    /// Contracts whose formation transaction has been missing from the chain for too long.
    fn double_spent_contracts(&self, height: BlockHeight) -> HashSet<ContractID> {
        let mut state = self.write_state();
        let double_spent: HashSet<ContractID> = state
            .unconfirmed
            .iter()
            .filter(|(_, formed)| height.saturating_sub(**formed) > DOUBLE_SPEND_DELAY)
            .map(|(id, _)| *id)
            .collect();
        for id in &double_spent {
            log::warn!("Formation transaction of contract {} never confirmed, marking it double-spent", id);
            state.unconfirmed.remove(id);
        }
        double_spent
    }

    fn update_utilities(&self) -> Result<(), RenterError> {
        let allowance = self.allowance();
        let height = self.block_height();
        let double_spent = self.double_spent_contracts(height);
        let threshold = score_threshold(
            self.hostdb
                .active_hosts()
                .iter()
                .map(|entry| scoring::score(entry, &allowance, height).score())
                .collect(),
            allowance.hosts,
        );

        let mut keep: Vec<(ContractID, ContractUtility)> = Vec::new();
        let mut candidates: Vec<ChurnCandidate> = Vec::new();
        for contract in self.contracts() {
            let ctx = UtilityContext {
                allowance: &allowance,
                score_threshold: threshold,
                refresh_fraction: self.config.refresh_fraction,
                gouging_fraction_denom: self.config.gouging_fraction_denom,
                double_spent: double_spent.contains(&contract.id),
            };
            let host = self.hostdb.host(&contract.host);
            match check_utility(&contract, host.as_ref(), &ctx) {
                Verdict::Keep(utility) => keep.push((contract.id, utility)),
                Verdict::Churn {
                    utility,
                    voluntary,
                    reason,
                } => {
                    // A contract already out of the set is not churned again.
                    if contract.utility.good_for_upload || contract.utility.good_for_renew {
                        candidates.push(ChurnCandidate {
                            contract,
                            utility,
                            voluntary,
                            reason,
                        });
                    } else {
                        keep.push((contract.id, utility));
                    }
                }
            }
        }

        // Involuntary churn goes first so that it is never crowded out by voluntary churn.
        candidates.sort_by_key(|candidate| (candidate.voluntary, candidate.contract.id));
        let mut limiter = {
            let state = self.read_state();
            ChurnLimiter::new(state.churn, allowance.max_period_churn)
        };
        let churned: HashSet<ContractID> = limiter
            .select(
                &candidates
                    .iter()
                    .map(|candidate| (candidate.contract.id, candidate.contract.size, candidate.voluntary))
                    .collect::<Vec<_>>(),
            )
            .into_iter()
            .collect();
        self.write_state().churn = limiter.state();

        for (id, utility) in keep {
            self.set_utility(&id, utility)?;
        }
        for candidate in candidates {
            let id = candidate.contract.id;
            if !churned.contains(&id) {
                log::debug!("Deferring churn of contract {}: {}", id, candidate.reason);
                continue;
            }
            log::debug!("Churning contract {}: {}", id, candidate.reason);
            self.set_utility(&id, candidate.utility)?;
            Event::publish(
                &self.event_publisher,
                Event::ChurnContract(ChurnContractEvent {
                    timestamp: SystemTime::now(),
                    contract: id,
                    host: candidate.contract.host,
                    data_bytes: candidate.contract.size,
                    voluntary: candidate.voluntary,
                }),
            );
        }
        Ok(())
    }

    fn set_utility(&self, id: &ContractID, utility: ContractUtility) -> Result<(), RenterError> {
        match self.contracts.view(id) {
            Some(contract) if contract.utility == utility => Ok(()),
            Some(_) => self.contracts.acquire(id)?.update_utility(utility),
            None => Ok(()),
        }
    }

    /// End height of contracts formed or renewed now.
    fn next_end_height(&self) -> BlockHeight {
        let state = self.read_state();
        state.current_period + state.allowance.period + state.allowance.renew_window
    }

    /// Whether the allowance still has `funding` left this period. Raises an alert if not.
    fn can_spend(&self, funding: Currency) -> bool {
        let unspent = self.period_spending().unspent;
        if unspent < funding {
            self.alerter.register_alert(
                AlertID::from_name(ALERT_INSUFFICIENT_FUNDS),
                "allowance funds are exhausted for this period",
                format!("{} left, {} needed", unspent, funding),
                AlertSeverity::Warning,
            );
            return false;
        }
        true
    }

    fn handle_lifecycle_error(&self, id: &ContractID, action: &str, err: RenterError) {
        log::warn!("Failed to {} contract {}: {}", action, id, err);
        if err.is_contract_fatal() {
            if let Err(err) = self.mark_contract_bad(id) {
                log::warn!("Failed to mark contract {} bad: {}", id, err);
            }
        }
    }

    /// Renew every contract that is good for renew and has entered the renew window. Returns the contracts
    /// that were replaced.
    fn renew_contracts(&self) -> HashSet<ContractID> {
        let allowance = self.allowance();
        let height = self.block_height();
        let end_height = self.next_end_height();
        let mut renewed = HashSet::new();
        for contract in self.contracts() {
            let utility = contract.utility;
            if !utility.good_for_renew || utility.bad_contract || utility.locked {
                continue;
            }
            if height + allowance.renew_window < contract.end_height || end_height <= contract.end_height {
                continue;
            }
            let funding = allowance.contract_funding();
            if !self.can_spend(funding) {
                break;
            }
            match self.renew_contract(&contract.id, funding, end_height, false) {
                Ok(new) => {
                    log::debug!("Renewed contract {} into {}", contract.id, new.id);
                    renewed.insert(contract.id);
                }
                Err(err) => self.handle_lifecycle_error(&contract.id, "renew", err),
            }
        }
        renewed
    }

    /// Replace contracts that ran out of funds by contracts with the same host and end height.
    fn refresh_contracts(&self, renewed: &HashSet<ContractID>) {
        let allowance = self.allowance();
        for contract in self.contracts() {
            let utility = contract.utility;
            if renewed.contains(&contract.id) || !utility.good_for_renew || utility.good_for_upload {
                continue;
            }
            if utility.bad_contract || utility.locked {
                continue;
            }
            if contract.renter_funds >= refresh_threshold(&contract, self.config.refresh_fraction) {
                continue;
            }
            let online = self
                .hostdb
                .host(&contract.host)
                .map_or(false, |(entry, _)| entry.is_online());
            if !online {
                continue;
            }
            let funding = allowance.contract_funding();
            if !self.can_spend(funding) {
                break;
            }
            match self.renew_contract(&contract.id, funding, contract.end_height, true) {
                Ok(new) => log::debug!("Refreshed contract {} into {}", contract.id, new.id),
                Err(err) => self.handle_lifecycle_error(&contract.id, "refresh", err),
            }
        }
    }

    /// Form contracts with new hosts until the allowance's host target is met.
    fn form_contracts(&self) {
        let allowance = self.allowance();
        let contracts = self.contracts();
        let active = contracts
            .iter()
            .filter(|contract| contract.utility.good_for_upload && contract.utility.good_for_renew)
            .count() as u64;
        if active >= allowance.hosts {
            self.alerter.unregister_alert(AlertID::from_name(ALERT_INSUFFICIENT_FUNDS));
            return;
        }
        let needed = (allowance.hosts - active) as usize;
        let used: Vec<HostPublicKey> = contracts.iter().map(|contract| contract.host).collect();
        let avoid: HashSet<HostPublicKey> = used.iter().copied().collect();
        let end_height = self.next_end_height();
        let funding = allowance.contract_funding();

        let mut formed = 0;
        // Ask for extra candidates; some will refuse or gouge.
        for host in self.hostdb.random_hosts(needed * 2 + 1, &avoid, &used) {
            if formed >= needed {
                break;
            }
            if !self.can_spend(funding) {
                return;
            }
            match self.form_contract(&host, funding, end_height) {
                Ok(contract) => {
                    log::debug!("Formed contract {} with host {}", contract.id, host.public_key);
                    formed += 1;
                }
                Err(err) => log::warn!("Failed to form a contract with host {}: {}", host.public_key, err),
            }
        }
        self.alerter.unregister_alert(AlertID::from_name(ALERT_INSUFFICIENT_FUNDS));
    }
}

/// Archive every contract in `expired`, skipping the ones that fail. Returns the IDs archived.
fn archive_each(
    expired: &[ContractMetadata],
    mut archive: impl FnMut(&ContractMetadata) -> Result<(), RenterError>,
) -> Vec<ContractID> {
    let mut archived = Vec::with_capacity(expired.len());
    for contract in expired {
        match archive(contract) {
            Ok(()) => archived.push(contract.id),
            Err(err) => log::warn!("Failed to archive contract {}: {}", contract.id, err),
        }
    }
    archived
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contractor::utility::tests::contract;

    #[test]
    fn a_failing_contract_does_not_stop_the_others_from_archiving() {
        let expired: Vec<ContractMetadata> = (1..=3u8)
            .map(|i| ContractMetadata {
                id: ContractID::new([i; 32]),
                ..contract(Currency::new(0))
            })
            .collect();
        let mut attempted = Vec::new();
        let archived = archive_each(&expired, |contract| {
            attempted.push(contract.id);
            if contract.id == ContractID::new([2; 32]) {
                return Err(RenterError::Transient("contract file is busy".into()));
            }
            Ok(())
        });
        assert_eq!(attempted.len(), 3);
        assert_eq!(archived, vec![ContractID::new([1; 32]), ContractID::new([3; 32])]);
    }
}
