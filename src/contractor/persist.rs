/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The contractor's own state, kept in `contractor.dat` next to the contract set.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use borsh::{BorshDeserialize, BorshSerialize};

use super::allowance::Allowance;
use super::churn_limiter::ChurnState;
use crate::contract_set::record::ContractMetadata;
use crate::errors::RenterError;
use crate::persist::versioned_file::{self, Metadata};
use crate::types::crypto_primitives::new_specifier;
use crate::types::data_types::{BlockHeight, ConsensusChangeID, ContractID};
use crate::types::transactions::FileContract;

const CONTRACTOR_METADATA: Metadata = Metadata::new(new_specifier("Contractor"), new_specifier("1.4.3"));

pub(crate) const CONTRACTOR_FILE: &str = "contractor.dat";

/// Everything the contractor remembers across restarts.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ContractorState {
    pub allowance: Allowance,
    pub block_height: BlockHeight,
    /// First block of the current billing period.
    pub current_period: BlockHeight,
    pub last_change: ConsensusChangeID,
    pub synced: bool,
    /// Contracts that were renewed, refreshed, or that ended. Kept until the host can no longer need them.
    pub old_contracts: HashMap<ContractID, ContractMetadata>,
    /// New contract → the contract it replaced.
    pub renewed_from: HashMap<ContractID, ContractID>,
    /// Old contract → the contract that replaced it.
    pub renewed_to: HashMap<ContractID, ContractID>,
    /// Contracts whose formation transaction has not been seen on chain, with their formation height.
    pub unconfirmed: HashMap<ContractID, BlockHeight>,
    /// Contracts found by a recovery scan that are not in the contract set yet.
    pub recoverable: HashMap<ContractID, FileContract>,
    pub churn: ChurnState,
}

impl ContractorState {
    pub fn new() -> ContractorState {
        ContractorState {
            allowance: Allowance::zero(),
            block_height: BlockHeight::new(0),
            current_period: BlockHeight::new(0),
            last_change: ConsensusChangeID::BEGINNING,
            synced: false,
            old_contracts: HashMap::new(),
            renewed_from: HashMap::new(),
            renewed_to: HashMap::new(),
            unconfirmed: HashMap::new(),
            recoverable: HashMap::new(),
            churn: ChurnState::default(),
        }
    }

    /// Every contract ID the contractor knows of, current or old.
    pub fn known_ids(&self) -> HashSet<ContractID> {
        self.old_contracts
            .keys()
            .chain(self.renewed_from.keys())
            .chain(self.renewed_to.keys())
            .copied()
            .collect()
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
struct ContractorPersist {
    allowance: Allowance,
    block_height: BlockHeight,
    current_period: BlockHeight,
    last_change: ConsensusChangeID,
    synced: bool,
    old_contracts: Vec<ContractMetadata>,
    renewed_from: Vec<(ContractID, ContractID)>,
    renewed_to: Vec<(ContractID, ContractID)>,
    unconfirmed: Vec<(ContractID, BlockHeight)>,
    recoverable: Vec<FileContract>,
    churn: ChurnState,
}

fn sorted<K: Ord + Copy, V: Clone>(map: &HashMap<K, V>) -> Vec<(K, V)> {
    let mut pairs: Vec<(K, V)> = map.iter().map(|(k, v)| (*k, v.clone())).collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

impl From<&ContractorState> for ContractorPersist {
    fn from(state: &ContractorState) -> Self {
        ContractorPersist {
            allowance: state.allowance.clone(),
            block_height: state.block_height,
            current_period: state.current_period,
            last_change: state.last_change,
            synced: state.synced,
            old_contracts: sorted(&state.old_contracts).into_iter().map(|(_, c)| c).collect(),
            renewed_from: sorted(&state.renewed_from),
            renewed_to: sorted(&state.renewed_to),
            unconfirmed: sorted(&state.unconfirmed),
            recoverable: sorted(&state.recoverable).into_iter().map(|(_, c)| c).collect(),
            churn: state.churn,
        }
    }
}

impl From<ContractorPersist> for ContractorState {
    fn from(persist: ContractorPersist) -> Self {
        ContractorState {
            allowance: persist.allowance,
            block_height: persist.block_height,
            current_period: persist.current_period,
            last_change: persist.last_change,
            synced: persist.synced,
            old_contracts: persist.old_contracts.into_iter().map(|c| (c.id, c)).collect(),
            renewed_from: persist.renewed_from.into_iter().collect(),
            renewed_to: persist.renewed_to.into_iter().collect(),
            unconfirmed: persist.unconfirmed.into_iter().collect(),
            recoverable: persist.recoverable.into_iter().map(|c| (c.id(), c)).collect(),
            churn: persist.churn,
        }
    }
}

pub(crate) fn load(persist_dir: &Path) -> Result<ContractorState, RenterError> {
    match versioned_file::load::<ContractorPersist>(&CONTRACTOR_METADATA, &persist_dir.join(CONTRACTOR_FILE)) {
        Ok(persist) => Ok(persist.into()),
        Err(err) if err.is_not_found() => Ok(ContractorState::new()),
        Err(err) => Err(err.add_context("loading contractor state")),
    }
}

pub(crate) fn save(persist_dir: &Path, state: &ContractorState) -> Result<(), RenterError> {
    versioned_file::save(
        &CONTRACTOR_METADATA,
        &ContractorPersist::from(state),
        &persist_dir.join(CONTRACTOR_FILE),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::currency::Currency;

    #[test]
    fn state_survives_a_restart() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path();
        assert_eq!(load(dir).unwrap(), ContractorState::new());

        let mut state = ContractorState::new();
        state.allowance = Allowance::default_allowance(Currency::coins(10));
        state.current_period = BlockHeight::new(40);
        state.renewed_to.insert(ContractID::new([1; 32]), ContractID::new([2; 32]));
        state.renewed_from.insert(ContractID::new([2; 32]), ContractID::new([1; 32]));
        state.unconfirmed.insert(ContractID::new([2; 32]), BlockHeight::new(39));
        state.churn.churned_this_period = 77;
        save(dir, &state).unwrap();
        assert_eq!(load(dir).unwrap(), state);
        assert!(state.known_ids().contains(&ContractID::new([1; 32])));
    }
}
