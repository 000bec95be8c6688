/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Rescanning the chain for contracts signed with keys derived from the wallet seed.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use super::Contractor;
use crate::collaborators::ConsensusChange;
use crate::contract_set::record::{ContractHeader, ContractSpending, ContractUtility};
use crate::errors::{NotFoundKind, RenterError};
use crate::events::{EndRecoveryScanEvent, Event, RecoverContractEvent, StartRecoveryScanEvent};
use crate::host_protocol::session::HostSession;
use crate::merkle;
use crate::types::constants::SECTOR_SIZE;
use crate::types::data_types::{BlockHeight, ConsensusChangeID, ContractID};
use crate::types::keypair::RenterSeed;
use crate::types::transactions::FileContract;

const RECOVERY_POLL: Duration = Duration::from_millis(100);

/// Contracts in `change` that were signed with a key `seed` derives, are still running at `height`, and
/// are not in `known`.
fn find_recoverable(
    change: &ConsensusChange,
    seed: &RenterSeed,
    height: BlockHeight,
    known: &dyn Fn(&ContractID) -> bool,
) -> Vec<FileContract> {
    change
        .applied_blocks
        .iter()
        .flat_map(|block| block.transactions.iter())
        .flat_map(|transaction| transaction.file_contracts.iter())
        .filter(|contract| contract.window_start > height)
        .filter(|contract| seed.contract_keypair(&contract.host_key).public_key() == contract.renter_key)
        .filter(|contract| !known(&contract.id()))
        .cloned()
        .collect()
}

impl Contractor {
    /// Start a scan of the chain from `start` for contracts that can be recovered from the wallet seed.
    /// Fails if a scan is already running.
    pub fn init_recovery_scan(self: &Arc<Self>, start: ConsensusChangeID) -> Result<(), RenterError> {
        if self
            .recovery_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RenterError::InvalidArgument("a recovery scan is already in progress".into()));
        }
        let seed = match self.seed() {
            Ok(seed) => seed,
            Err(err) => {
                self.recovery_in_progress.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        self.recovery_height.store(0, Ordering::SeqCst);
        Event::publish(
            &self.event_publisher,
            Event::StartRecoveryScan(StartRecoveryScanEvent {
                timestamp: SystemTime::now(),
                height: self.block_height(),
            }),
        );

        let contractor = self.clone();
        thread::spawn(move || {
            let result = contractor.run_recovery_scan(start, &seed);
            let (recovered, succeeded) = match result {
                Ok(recovered) => (recovered, true),
                Err(err) => {
                    log::warn!("Recovery scan failed: {}", err);
                    (0, false)
                }
            };
            if let Err(err) = contractor.save() {
                log::warn!("Failed to persist contractor state after recovery scan: {}", err);
            }
            let height = BlockHeight::new(contractor.recovery_height.load(Ordering::SeqCst));
            contractor.recovery_height.store(0, Ordering::SeqCst);
            contractor.recovery_in_progress.store(false, Ordering::SeqCst);
            Event::publish(
                &contractor.event_publisher,
                Event::EndRecoveryScan(EndRecoveryScanEvent {
                    timestamp: SystemTime::now(),
                    height,
                    recovered,
                    succeeded,
                }),
            );
            if recovered > 0 {
                contractor.trigger_maintenance();
            }
        });
        Ok(())
    }

    fn run_recovery_scan(&self, start: ConsensusChangeID, seed: &RenterSeed) -> Result<usize, RenterError> {
        let _guard = self.thread_group.add()?;
        let (sender, changes) = mpsc::channel();
        self.consensus.subscribe(start, sender)?;

        let mut found: HashMap<ContractID, FileContract> = HashMap::new();
        loop {
            let change = match changes.recv_timeout(RECOVERY_POLL) {
                Ok(change) => change,
                Err(RecvTimeoutError::Timeout) => {
                    if self.thread_group.is_stopped() {
                        return Err(RenterError::Shutdown);
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RenterError::Transient("consensus subscription ended during recovery scan".into()))
                }
            };
            self.recovery_height.store(change.height.int(), Ordering::SeqCst);

            let height = self.block_height();
            let known = |id: &ContractID| {
                found.contains_key(id) || self.contracts.view(id).is_some() || self.read_state().known_ids().contains(id)
            };
            for contract in find_recoverable(&change, seed, height, &known) {
                found.insert(contract.id(), contract);
            }
            if change.synced {
                break;
            }
        }

        let recovered = found.len();
        self.write_state().recoverable.extend(found);
        Ok(recovered)
    }

    /// Whether a recovery scan is running, and the height it has reached.
    pub fn recovery_scan_status(&self) -> (bool, BlockHeight) {
        (
            self.recovery_in_progress.load(Ordering::SeqCst),
            BlockHeight::new(self.recovery_height.load(Ordering::SeqCst)),
        )
    }

    /// Import the contracts a recovery scan found, as far as their hosts can be reached. Contracts that
    /// ended in the meantime are forgotten; the others are retried on the next pass.
    pub(crate) fn recover_contracts(&self) {
        let height = self.block_height();
        let pending: Vec<FileContract> = {
            let mut state = self.write_state();
            state.recoverable.retain(|_, contract| contract.window_start > height);
            state.recoverable.values().cloned().collect()
        };
        if pending.is_empty() {
            return;
        }
        let seed = match self.seed() {
            Ok(seed) => seed,
            Err(err) => {
                log::debug!("Cannot recover contracts without the wallet seed: {}", err);
                return;
            }
        };

        for contract in pending {
            let id = contract.id();
            match self.recover_contract(&contract, &seed) {
                Ok(()) => {
                    self.write_state().recoverable.remove(&id);
                    Event::publish(
                        &self.event_publisher,
                        Event::RecoverContract(RecoverContractEvent {
                            timestamp: SystemTime::now(),
                            contract: id,
                            host: contract.host_key,
                        }),
                    );
                }
                Err(err) if err.is_exists() => {
                    self.write_state().recoverable.remove(&id);
                }
                Err(err) => log::debug!("Failed to recover contract {}: {}", id, err),
            }
        }
    }

    fn recover_contract(&self, contract: &FileContract, seed: &RenterSeed) -> Result<(), RenterError> {
        let id = contract.id();
        let (host, _) = self
            .hostdb
            .host(&contract.host_key)
            .ok_or(RenterError::NotFound(NotFoundKind::Host(contract.host_key)))?;
        let mut session = HostSession::connect(
            self.dialer.as_ref(),
            &host.net_address,
            host.public_key,
            self.contracts.rate_limit(),
            self.config.rpc_timeout,
        )?;

        let revision = session.latest_revision(id)?;
        if !revision.is_correct() || revision.revision.renter_key != contract.renter_key || revision.revision.parent_id != id {
            return Err(RenterError::HostProtocolViolation(format!(
                "host returned an unusable revision for recovered contract {}",
                id
            )));
        }
        let roots = session.sector_roots(id)?;
        if merkle::roots_root(&roots) != revision.revision.file_merkle_root
            || roots.len() as u64 * SECTOR_SIZE != revision.revision.file_size
        {
            return Err(RenterError::HostProtocolViolation(format!(
                "sector roots of recovered contract {} do not match its revision",
                id
            )));
        }

        let keypair = seed.contract_keypair(&contract.host_key);
        let header = ContractHeader {
            id,
            host: contract.host_key,
            renter_key: contract.renter_key,
            secret_key: keypair.0.to_bytes(),
            start_height: contract.start_height,
            end_height: contract.window_start,
            initial_renter_funds: contract.renter_funds,
            // Fees paid at formation are not recorded on chain.
            total_cost: contract.renter_funds,
            spending: ContractSpending::default(),
            utility: ContractUtility {
                good_for_upload: true,
                good_for_renew: true,
                bad_contract: false,
                locked: false,
            },
            last_revision: revision,
        };
        self.contracts.insert(header, roots)?;
        log::debug!("Recovered contract {} with host {}", id, contract.host_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::currency::Currency;
    use crate::types::data_types::{CryptoHash, HostPublicKey};
    use crate::types::transactions::{contract_unlock_hash, ChainBlock, Transaction};

    fn contract_for(seed: &RenterSeed, host: HostPublicKey, window_start: u64, nonce: u64) -> FileContract {
        let renter_key = seed.contract_keypair(&host).public_key();
        FileContract {
            renter_key,
            host_key: host,
            file_size: 0,
            file_merkle_root: CryptoHash::default(),
            start_height: BlockHeight::new(1),
            window_start: BlockHeight::new(window_start),
            window_end: BlockHeight::new(window_start + 144),
            renter_funds: Currency::coins(1),
            host_valid_payout: Currency::coins(1),
            host_missed_payout: Currency::coins(1),
            unlock_hash: contract_unlock_hash(&renter_key, &host),
            nonce,
        }
    }

    #[test]
    fn only_contracts_signed_with_derived_keys_are_found() {
        let seed = RenterSeed::from_wallet_seed(&[7; 32]);
        let other = RenterSeed::from_wallet_seed(&[8; 32]);
        let host = HostPublicKey::new([1; 32]);
        let ours = contract_for(&seed, host, 500, 1);
        let ended = contract_for(&seed, host, 50, 2);
        let foreign = contract_for(&other, host, 500, 3);
        let change = ConsensusChange {
            id: ConsensusChangeID::new(CryptoHash::new([1; 32])),
            reverted_blocks: Vec::new(),
            applied_blocks: vec![ChainBlock {
                id: CryptoHash::new([2; 32]),
                height: BlockHeight::new(100),
                transactions: vec![Transaction {
                    file_contracts: vec![ours.clone(), ended, foreign],
                    ..Default::default()
                }],
            }],
            height: BlockHeight::new(100),
            synced: true,
        };

        let found = find_recoverable(&change, &seed, BlockHeight::new(100), &|_| false);
        assert_eq!(found, vec![ours.clone()]);
        let known = ours.id();
        assert!(find_recoverable(&change, &seed, BlockHeight::new(100), &|id| *id == known).is_empty());
    }
}
