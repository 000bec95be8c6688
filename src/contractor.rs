/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The contract lifecycle manager.
//!
//! The contractor owns the user's [`Allowance`] and the [`ContractSet`], and keeps the set of usable
//! contracts in line with the allowance as the chain advances.
//!
//! ## Contract states
//!
//! Every contract in the set carries a [`ContractUtility`](crate::contract_set::record::ContractUtility):
//! - **active**: good for upload and renew. Counted against the allowance's host target.
//! - **passive**: good for renew only, e.g. because its funds ran low or its host is offline. Still
//!   downloadable.
//! - **disabled**: neither. A bad contract (double-spent, host lost the data, protocol violation) is never
//!   used for new I/O again.
//!
//! A contract leaves the set when it is renewed, refreshed, or reaches its end height. It is then kept in
//! [`old_contracts`](Contractor::old_contracts) until the host's proof window and maturity delay have
//! passed.
//!
//! ## Maintenance
//!
//! After every consensus change that leaves the renter synced, and periodically otherwise, a
//! [maintenance pass](Contractor::run_maintenance) archives expired contracts, imports recovered
//! contracts, recomputes utilities (subject to the [churn limiter](churn_limiter)), renews contracts
//! entering the renew window, refreshes contracts that ran out of funds, and forms new contracts until
//! the host target is met. Passes are serialized by a lock that later triggers only try to take for a
//! short while, so maintenance passes never stack up.
//!
//! ## Recovery
//!
//! Contract keys are derived from the wallet seed ([`RenterSeed`](crate::types::keypair::RenterSeed)).
//! [`init_recovery_scan`](Contractor::init_recovery_scan) rescans the chain for contracts signed with
//! such keys and re-imports the ones still running.

pub mod allowance;

pub mod churn_limiter;

pub(crate) mod formation;

pub(crate) mod maintenance;

pub(crate) mod payment;

pub(crate) mod persist;

pub(crate) mod recovery;

pub(crate) mod utility;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use self::allowance::Allowance;
use self::churn_limiter::{ChurnLimiter, ChurnState, ChurnStatus};
use self::persist::ContractorState;
use crate::alerts::{Alert, Alerter};
use crate::collaborators::{ConsensusChange, ConsensusSet, TransactionPool, Wallet};
use crate::contract_set::record::{ContractMetadata, ContractUtility};
use crate::contract_set::ContractSet;
use crate::errors::RenterError;
use crate::events::{Event, EventPublisher, SetAllowanceEvent};
use crate::host_protocol::HostDialer;
use crate::hostdb::HostDB;
use crate::thread_group::ThreadGroup;
use crate::types::constants::{MATURITY_DELAY, WINDOW_SIZE};
use crate::types::currency::Currency;
use crate::types::data_types::{BlockHeight, ConsensusChangeID, ContractID, HostPublicKey};

/// A formation transaction not seen on chain after this many blocks marks the contract double-spent.
pub const DOUBLE_SPEND_DELAY: u64 = 48;

#[derive(Clone, Debug)]
pub struct ContractorConfiguration {
    pub persist_dir: PathBuf,
    pub rpc_timeout: Duration,
    /// How often maintenance runs when no block arrives.
    pub maintenance_interval: Duration,
    /// How long a triggered maintenance pass waits for a running one before giving up.
    pub maintenance_lock_timeout: Duration,
    /// A contract whose remaining funds fall below this fraction of its initial funds is refreshed.
    pub refresh_fraction: f64,
    /// A host whose expected contract cost exceeds `funds / gouging_fraction_denom` is gouging.
    pub gouging_fraction_denom: u64,
    pub abort_on_critical: bool,
}

/// How the money of the current period was spent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContractorSpending {
    pub contract_fees: Currency,
    /// Funds locked into contracts formed this period, including fees.
    pub total_allocated: Currency,
    pub upload: Currency,
    pub download: Currency,
    pub storage: Currency,
    /// Funds of ended contracts that are not released until `release_block`.
    pub withheld_funds: Currency,
    pub release_block: BlockHeight,
    /// Allocated in earlier periods.
    pub previous_spending: Currency,
    pub unspent: Currency,
}

pub struct Contractor {
    config: ContractorConfiguration,
    contracts: Arc<ContractSet>,
    hostdb: Arc<HostDB>,
    dialer: Arc<dyn HostDialer>,
    consensus: Arc<dyn ConsensusSet>,
    tpool: Arc<dyn TransactionPool>,
    wallet: Arc<dyn Wallet>,
    state: RwLock<ContractorState>,
    maintenance_lock: Mutex<()>,
    maintenance_trigger: Mutex<Option<Sender<()>>>,
    recovery_in_progress: AtomicBool,
    recovery_height: AtomicU64,
    alerter: Alerter,
    event_publisher: EventPublisher,
    thread_group: ThreadGroup,
}

impl Contractor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ContractorConfiguration,
        contracts: Arc<ContractSet>,
        hostdb: Arc<HostDB>,
        dialer: Arc<dyn HostDialer>,
        consensus: Arc<dyn ConsensusSet>,
        tpool: Arc<dyn TransactionPool>,
        wallet: Arc<dyn Wallet>,
        event_publisher: EventPublisher,
        thread_group: ThreadGroup,
    ) -> Result<Arc<Contractor>, RenterError> {
        let state = persist::load(&config.persist_dir)?;
        hostdb.set_allowance(state.allowance.clone());
        Ok(Arc::new(Contractor {
            config,
            contracts,
            hostdb,
            dialer,
            consensus,
            tpool,
            wallet,
            state: RwLock::new(state),
            maintenance_lock: Mutex::new(()),
            maintenance_trigger: Mutex::new(None),
            recovery_in_progress: AtomicBool::new(false),
            recovery_height: AtomicU64::new(0),
            alerter: Alerter::new("contractor", event_publisher.clone()),
            event_publisher,
            thread_group,
        }))
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ContractorState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ContractorState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save(&self) -> Result<(), RenterError> {
        let state = self.read_state().clone();
        persist::save(&self.config.persist_dir, &state)
    }

    pub fn contract_set(&self) -> &Arc<ContractSet> {
        &self.contracts
    }

    pub fn allowance(&self) -> Allowance {
        self.read_state().allowance.clone()
    }

    /// Replace the allowance. An allowance with zero funds cancels: no contract is formed or renewed and
    /// every contract stops being used for uploads, while downloads keep working until the contracts end.
    pub fn set_allowance(&self, allowance: Allowance) -> Result<(), RenterError> {
        allowance.validate()?;
        {
            let mut state = self.write_state();
            if state.allowance == allowance {
                return Ok(());
            }
            // The first allowance starts the first period.
            if state.allowance.is_cancelled() && !allowance.is_cancelled() {
                state.current_period = state.block_height;
                state.churn = ChurnState::starting_at(state.block_height);
            }
            state.allowance = allowance.clone();
        }
        self.hostdb.set_allowance(allowance.clone());
        self.save()?;
        Event::publish(
            &self.event_publisher,
            Event::SetAllowance(SetAllowanceEvent {
                timestamp: SystemTime::now(),
                funds: allowance.funds,
                hosts: allowance.hosts,
                period: allowance.period,
                cancelled: allowance.is_cancelled(),
            }),
        );
        self.trigger_maintenance();
        Ok(())
    }

    /// Every contract in the contract set.
    pub fn contracts(&self) -> Vec<ContractMetadata> {
        let mut contracts = self.contracts.view_all();
        contracts.sort_by_key(|contract| contract.id);
        contracts
    }

    /// Contracts that were renewed, refreshed, or that ended.
    pub fn old_contracts(&self) -> Vec<ContractMetadata> {
        let mut contracts: Vec<ContractMetadata> = self.read_state().old_contracts.values().cloned().collect();
        contracts.sort_by_key(|contract| contract.id);
        contracts
    }

    /// Old contracts whose end height has passed.
    pub fn expired_contracts(&self) -> Vec<ContractMetadata> {
        let height = self.block_height();
        self.old_contracts()
            .into_iter()
            .filter(|contract| contract.end_height <= height)
            .collect()
    }

    /// The contract with `host` that is used for new I/O, if any.
    pub fn contract_by_public_key(&self, host: &HostPublicKey) -> Option<ContractMetadata> {
        self.contracts
            .view_all()
            .into_iter()
            .filter(|contract| contract.host == *host && !contract.utility.locked)
            .max_by_key(|contract| (!contract.utility.bad_contract, contract.end_height))
    }

    /// The renter's public key in its contract with `host`.
    pub fn contract_public_key(&self, host: &HostPublicKey) -> Option<HostPublicKey> {
        self.contract_by_public_key(host).map(|contract| contract.renter_key)
    }

    /// The utility of contract `id`.
    pub fn contract_utility(&self, id: &ContractID) -> Option<ContractUtility> {
        self.contracts.view(id).map(|contract| contract.utility)
    }

    /// Whether contract `id` was replaced before its end height because it ran out of funds.
    pub fn refreshed_contract(&self, id: &ContractID) -> bool {
        let state = self.read_state();
        let successor = match state.renewed_to.get(id) {
            Some(successor) => *successor,
            None => return false,
        };
        let end_of = |id: &ContractID| {
            self.contracts
                .view(id)
                .or_else(|| state.old_contracts.get(id).cloned())
                .map(|contract| contract.end_height)
        };
        match (end_of(id), end_of(&successor)) {
            (Some(old), Some(new)) => old == new,
            _ => false,
        }
    }

    /// Mark contract `id` bad. Used when a host violates the protocol or loses the contract's data.
    pub fn mark_contract_bad(&self, id: &ContractID) -> Result<(), RenterError> {
        let mut handle = self.contracts.acquire(id)?;
        let mut utility = handle.header().utility;
        if utility.bad_contract {
            return Ok(());
        }
        utility.bad_contract = true;
        utility.good_for_upload = false;
        utility.good_for_renew = false;
        log::warn!("Marking contract {} with host {} bad", id, handle.header().host);
        handle.update_utility(utility)
    }

    /// Spending of the current period.
    pub fn period_spending(&self) -> ContractorSpending {
        let state = self.read_state();
        let mut spending = ContractorSpending::default();
        let mut tally = |contract: &ContractMetadata, spending: &mut ContractorSpending| {
            if contract.start_height >= state.current_period {
                spending.total_allocated += contract.total_cost;
                spending.contract_fees += contract.spending.fees;
                spending.upload += contract.spending.upload;
                spending.download += contract.spending.download;
                spending.storage += contract.spending.storage;
            } else {
                spending.previous_spending += contract.total_cost;
            }
        };
        for contract in self.contracts.view_all() {
            tally(&contract, &mut spending);
        }
        for contract in state.old_contracts.values() {
            tally(contract, &mut spending);
            let release = contract.end_height + WINDOW_SIZE + MATURITY_DELAY;
            if release > state.block_height && !contract.utility.locked {
                spending.withheld_funds += contract.renter_funds;
                spending.release_block = spending.release_block.max(release);
            }
        }
        spending.unspent = state.allowance.funds.saturating_sub(spending.total_allocated);
        spending
    }

    pub fn current_period(&self) -> BlockHeight {
        self.read_state().current_period
    }

    pub fn block_height(&self) -> BlockHeight {
        self.read_state().block_height
    }

    pub fn synced(&self) -> bool {
        self.read_state().synced
    }

    /// The last consensus change processed, from which a restarted renter resubscribes.
    pub fn last_change(&self) -> ConsensusChangeID {
        self.read_state().last_change
    }

    pub fn churn_status(&self) -> ChurnStatus {
        let state = self.read_state();
        ChurnLimiter::new(state.churn, state.allowance.max_period_churn).status()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerter.alerts()
    }

    pub(crate) fn alerter(&self) -> &Alerter {
        &self.alerter
    }

    /// Track the chain: height, sync status, billing periods, and confirmation of formation
    /// transactions.
    pub fn process_consensus_change(&self, change: &ConsensusChange) {
        {
            let mut state = self.write_state();
            for block in &change.applied_blocks {
                for transaction in &block.transactions {
                    for contract in &transaction.file_contracts {
                        state.unconfirmed.remove(&contract.id());
                    }
                }
            }
            state.block_height = change.height;
            state.last_change = change.id;
            state.synced = change.synced;

            let allowance = state.allowance.clone();
            if !allowance.is_cancelled() && state.block_height + allowance.renew_window >= state.current_period + allowance.period {
                state.current_period += allowance.period;
                log::debug!("Contractor entered the period starting at {}", state.current_period);
                state.churn = ChurnState::starting_at(state.current_period);
            }
        }
        if let Err(err) = self.save() {
            log::warn!("Failed to persist contractor state: {}", err);
        }
        if change.synced {
            self.trigger_maintenance();
        }
    }

    /// Ask the maintenance thread for a pass.
    pub fn trigger_maintenance(&self) {
        if let Some(trigger) = self.maintenance_trigger().as_ref() {
            let _ = trigger.send(());
        }
    }

    fn maintenance_trigger(&self) -> MutexGuard<'_, Option<Sender<()>>> {
        self.maintenance_trigger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the maintenance lock, waiting at most `maintenance_lock_timeout`.
    fn try_lock_maintenance(&self) -> Option<MutexGuard<'_, ()>> {
        let deadline = Instant::now() + self.config.maintenance_lock_timeout;
        loop {
            match self.maintenance_lock.try_lock() {
                Ok(guard) => return Some(guard),
                Err(std::sync::TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    /// Start the maintenance thread. It exits when `thread_group` is stopped.
    pub fn start_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let (trigger, triggered): (Sender<()>, Receiver<()>) = mpsc::channel();
        *self.maintenance_trigger() = Some(trigger);
        let contractor = self.clone();
        let thread_group = self.thread_group.clone();
        thread::spawn(move || loop {
            if thread_group.is_stopped() {
                return;
            }
            if contractor.synced() {
                if let Ok(_guard) = thread_group.add() {
                    if let Err(err) = contractor.run_maintenance() {
                        log::warn!("Contract maintenance failed: {}", err);
                    }
                }
            }
            match triggered.recv_timeout(contractor.config.maintenance_interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        })
    }

    pub(crate) fn config(&self) -> &ContractorConfiguration {
        &self.config
    }

    pub(crate) fn consensus(&self) -> &Arc<dyn ConsensusSet> {
        &self.consensus
    }
}
