/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build, run, and shut down a renter.
//!
//! The renter rents storage from hosts and stores erasure-coded files with them. It owns every
//! subsystem of this crate: the [host database](crate::hostdb), the [contractor](crate::contractor),
//! the [worker pool](crate::worker_pool), the [file system](crate::filesystem), the
//! [upload](crate::upload), [download](crate::download) and [repair](crate::repair) pipelines, and the
//! [pubfile](crate::pubfile) layer. The subsystems never reach each other through globals; everything
//! they share is handed to them here.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the renter](RenterSpec) with:
//!   1. `RenterSpec::builder` to construct a `RenterSpecBuilder`,
//!   2. The setters of the `RenterSpecBuilder`, and
//!   3. The `RenterSpecBuilder::build` method to construct a [RenterSpec],
//! - The function to [start](RenterSpec::start) a [Renter] given its specification,
//! - [The type](Renter) which keeps the renter alive and answers every user-facing request.
//!
//! ## Starting a renter
//!
//! ```ignore
//! let renter =
//!     RenterSpec::builder()
//!     .consensus_set(consensus_set)
//!     .gateway(gateway)
//!     .transaction_pool(transaction_pool)
//!     .wallet(wallet)
//!     .host_dialer(dialer)
//!     .configuration(configuration)
//!     .on_form_contract(form_contract_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//!
//! The required setters are for providing the systems the renter consumes (see
//! [collaborators](crate::collaborators)), the way it reaches hosts, and its configuration:
//! - `.consensus_set(...)`
//! - `.gateway(...)`
//! - `.transaction_pool(...)`
//! - `.wallet(...)`
//! - `.host_dialer(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! The optional setters are for registering user-defined event handlers for events from [crate::events]:
//! - `.on_form_contract(...)`
//! - `.on_renew_contract(...)`
//! - `.on_refresh_contract(...)`
//! - `.on_churn_contract(...)`
//! - `.on_archive_contract(...)`
//! - `.on_set_allowance(...)`
//! - `.on_start_recovery_scan(...)`
//! - `.on_end_recovery_scan(...)`
//! - `.on_recover_contract(...)`
//! - `.on_upload_piece(...)`
//! - `.on_upload_chunk_complete(...)`
//! - `.on_download_chunk_complete(...)`
//! - `.on_worker_cooldown(...)`
//! - `.on_fix_revision_mismatch(...)`
//! - `.on_bubble_directory(...)`
//! - `.on_repair_chunk(...)`
//! - `.on_upload_pubfile(...)`
//! - `.on_download_pubfile(...)`
//! - `.on_update_blacklist(...)`
//! - `.on_register_alert(...)`
//! - `.on_unregister_alert(...)`
//!
//! ## Shutting down
//!
//! [`Renter::close`] (or dropping the renter) stops the [thread group](crate::thread_group), which fails
//! memory requests that are still waiting, kills every worker and wakes every background loop. It then
//! waits for the loops to exit, closes the blacklist journal and finally drains the event bus, so that
//! the last events of a shutdown still reach their handlers.

pub mod backup;

use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::alerts::{merge_alerts, Alert, AlertID, AlertSeverity, Alerter};
use crate::collaborators::{ConsensusChange, ConsensusSet, Gateway, TransactionPool, Wallet};
use crate::config::Configuration;
use crate::contract_set::record::ContractMetadata;
use crate::contract_set::ContractSet;
use crate::contractor::allowance::Allowance;
use crate::contractor::{Contractor, ContractorSpending};
use crate::download::Downloader;
use crate::errors::{NotFoundKind, RenterError, ResultExt};
use crate::event_bus::*;
use crate::events::*;
use crate::filesystem::path::SiaPath;
use crate::filesystem::siadir::DirInfo;
use crate::filesystem::{FileInfo, FileNode, FileSystem};
use crate::host_protocol::rate_limit::RateLimits;
use crate::host_protocol::HostDialer;
use crate::hostdb::entry::HostDBEntry;
use crate::hostdb::HostDB;
use crate::memory::{MemoryManager, MemoryStatus};
use crate::persist::create_dir_all;
use crate::persist::wal::Wal;
use crate::pubaccesskey::PubaccesskeyManager;
use crate::pubfile::blacklist::Blacklist;
use crate::pubfile::metadata::PubfileMetadata;
use crate::pubfile::publink::Publink;
use crate::pubfile::streamer::PubfileStream;
use crate::pubfile::{PubfileUpload, PubfileUploadParams, Pubfiles};
use crate::refcounter;
use crate::repair::Repairer;
use crate::thread_group::ThreadGroup;
use crate::types::data_types::{BlockHeight, ConsensusChangeID, ContractID, HostPublicKey, SectorRoot};
use crate::upload::{FileUploadParams, Uploader};
use crate::worker::status::WorkerPoolStatus;
use crate::worker::WorkerEnvironment;
use crate::worker_pool::WorkerPool;

/// How often the consensus thread looks at the thread group while no change arrives.
const CONSENSUS_POLL: Duration = Duration::from_millis(100);

/// Raised while the allowance is cancelled.
const NO_ALLOWANCE_ALERT: &str = "renter-no-allowance";

/// Stores all necessary parameters and trait implementations required to run the [Renter].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [RenterSpec]. On the builder call the following methods to construct a valid [RenterSpec].

    Required:
    - `.consensus_set(...)`
    - `.gateway(...)`
    - `.transaction_pool(...)`
    - `.wallet(...)`
    - `.host_dialer(...)`
    - `.configuration(...)`

    Optional:
    - `.on_form_contract(...)`
    - `.on_renew_contract(...)`
    - `.on_refresh_contract(...)`
    - `.on_churn_contract(...)`
    - `.on_archive_contract(...)`
    - `.on_set_allowance(...)`
    - `.on_start_recovery_scan(...)`
    - `.on_end_recovery_scan(...)`
    - `.on_recover_contract(...)`
    - `.on_upload_piece(...)`
    - `.on_upload_chunk_complete(...)`
    - `.on_download_chunk_complete(...)`
    - `.on_worker_cooldown(...)`
    - `.on_fix_revision_mismatch(...)`
    - `.on_bubble_directory(...)`
    - `.on_repair_chunk(...)`
    - `.on_upload_pubfile(...)`
    - `.on_download_pubfile(...)`
    - `.on_update_blacklist(...)`
    - `.on_register_alert(...)`
    - `.on_unregister_alert(...)`
"))]
pub struct RenterSpec {
    // Required parameters
    #[builder(setter(doc = "Set the source of blocks. The argument must implement the [ConsensusSet](crate::collaborators::ConsensusSet) trait. Required."))]
    consensus_set: Arc<dyn ConsensusSet>,
    #[builder(setter(doc = "Set the node's peer-to-peer gateway. The argument must implement the [Gateway](crate::collaborators::Gateway) trait. Required."))]
    gateway: Arc<dyn Gateway>,
    #[builder(setter(doc = "Set the pool formation transactions are submitted to. The argument must implement the [TransactionPool](crate::collaborators::TransactionPool) trait. Required."))]
    transaction_pool: Arc<dyn TransactionPool>,
    #[builder(setter(doc = "Set the wallet that funds contracts. The argument must implement the [Wallet](crate::collaborators::Wallet) trait. Required."))]
    wallet: Arc<dyn Wallet>,
    #[builder(setter(doc = "Set how connections to hosts are opened. The argument must implement the [HostDialer](crate::host_protocol::HostDialer) trait. Required."))]
    host_dialer: Arc<dyn HostDialer>,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a renter. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&FormContractEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FormContractEvent>),
    doc = "Register a handler closure to be invoked after a contract is formed. Optional."))]
    on_form_contract: Option<HandlerPtr<FormContractEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RenewContractEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RenewContractEvent>),
    doc = "Register a handler closure to be invoked after a contract is renewed. Optional."))]
    on_renew_contract: Option<HandlerPtr<RenewContractEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RefreshContractEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RefreshContractEvent>),
    doc = "Register a handler closure to be invoked after a contract that ran out of funds is refreshed. Optional."))]
    on_refresh_contract: Option<HandlerPtr<RefreshContractEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ChurnContractEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ChurnContractEvent>),
    doc = "Register a handler closure to be invoked after a contract is churned out of the active set. Optional."))]
    on_churn_contract: Option<HandlerPtr<ChurnContractEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ArchiveContractEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ArchiveContractEvent>),
    doc = "Register a handler closure to be invoked after an expired contract is archived. Optional."))]
    on_archive_contract: Option<HandlerPtr<ArchiveContractEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SetAllowanceEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SetAllowanceEvent>),
    doc = "Register a handler closure to be invoked after the allowance is set or cancelled. Optional."))]
    on_set_allowance: Option<HandlerPtr<SetAllowanceEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartRecoveryScanEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartRecoveryScanEvent>),
    doc = "Register a handler closure to be invoked after a recovery scan starts. Optional."))]
    on_start_recovery_scan: Option<HandlerPtr<StartRecoveryScanEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EndRecoveryScanEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EndRecoveryScanEvent>),
    doc = "Register a handler closure to be invoked after a recovery scan ends. Optional."))]
    on_end_recovery_scan: Option<HandlerPtr<EndRecoveryScanEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RecoverContractEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RecoverContractEvent>),
    doc = "Register a handler closure to be invoked after a contract found by a recovery scan is imported. Optional."))]
    on_recover_contract: Option<HandlerPtr<RecoverContractEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UploadPieceEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UploadPieceEvent>),
    doc = "Register a handler closure to be invoked after a worker uploads a piece. Optional."))]
    on_upload_piece: Option<HandlerPtr<UploadPieceEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UploadChunkCompleteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UploadChunkCompleteEvent>),
    doc = "Register a handler closure to be invoked after every piece of a chunk was uploaded or given up on. Optional."))]
    on_upload_chunk_complete: Option<HandlerPtr<UploadChunkCompleteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DownloadChunkCompleteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DownloadChunkCompleteEvent>),
    doc = "Register a handler closure to be invoked after a chunk is downloaded and recovered. Optional."))]
    on_download_chunk_complete: Option<HandlerPtr<DownloadChunkCompleteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&WorkerCooldownEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<WorkerCooldownEvent>),
    doc = "Register a handler closure to be invoked after a worker is put on cooldown. Optional."))]
    on_worker_cooldown: Option<HandlerPtr<WorkerCooldownEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FixRevisionMismatchEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FixRevisionMismatchEvent>),
    doc = "Register a handler closure to be invoked after a worker resyncs its contract with the host. Optional."))]
    on_fix_revision_mismatch: Option<HandlerPtr<FixRevisionMismatchEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&BubbleDirectoryEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BubbleDirectoryEvent>),
    doc = "Register a handler closure to be invoked after the health of a directory is recomputed. Optional."))]
    on_bubble_directory: Option<HandlerPtr<BubbleDirectoryEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RepairChunkEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RepairChunkEvent>),
    doc = "Register a handler closure to be invoked after the repair loop works on a chunk. Optional."))]
    on_repair_chunk: Option<HandlerPtr<RepairChunkEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UploadPubfileEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UploadPubfileEvent>),
    doc = "Register a handler closure to be invoked after a pubfile is published. Optional."))]
    on_upload_pubfile: Option<HandlerPtr<UploadPubfileEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DownloadPubfileEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DownloadPubfileEvent>),
    doc = "Register a handler closure to be invoked after the base sector of a pubfile is fetched. Optional."))]
    on_download_pubfile: Option<HandlerPtr<DownloadPubfileEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UpdateBlacklistEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UpdateBlacklistEvent>),
    doc = "Register a handler closure to be invoked after the pubfile blacklist changes. Optional."))]
    on_update_blacklist: Option<HandlerPtr<UpdateBlacklistEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RegisterAlertEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RegisterAlertEvent>),
    doc = "Register a handler closure to be invoked after an alert is raised. Optional."))]
    on_register_alert: Option<HandlerPtr<RegisterAlertEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UnregisterAlertEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UnregisterAlertEvent>),
    doc = "Register a handler closure to be invoked after an alert is withdrawn. Optional."))]
    on_unregister_alert: Option<HandlerPtr<UnregisterAlertEvent>>,
}

impl RenterSpec {
    fn event_handlers(&mut self, log_events: bool) -> EventHandlers {
        let mut handlers = EventHandlers::default();
        handlers.form_contract_handlers.extend(self.on_form_contract.take());
        handlers.renew_contract_handlers.extend(self.on_renew_contract.take());
        handlers.refresh_contract_handlers.extend(self.on_refresh_contract.take());
        handlers.churn_contract_handlers.extend(self.on_churn_contract.take());
        handlers.archive_contract_handlers.extend(self.on_archive_contract.take());
        handlers.set_allowance_handlers.extend(self.on_set_allowance.take());
        handlers.start_recovery_scan_handlers.extend(self.on_start_recovery_scan.take());
        handlers.end_recovery_scan_handlers.extend(self.on_end_recovery_scan.take());
        handlers.recover_contract_handlers.extend(self.on_recover_contract.take());
        handlers.upload_piece_handlers.extend(self.on_upload_piece.take());
        handlers.upload_chunk_complete_handlers.extend(self.on_upload_chunk_complete.take());
        handlers.download_chunk_complete_handlers.extend(self.on_download_chunk_complete.take());
        handlers.worker_cooldown_handlers.extend(self.on_worker_cooldown.take());
        handlers.fix_revision_mismatch_handlers.extend(self.on_fix_revision_mismatch.take());
        handlers.bubble_directory_handlers.extend(self.on_bubble_directory.take());
        handlers.repair_chunk_handlers.extend(self.on_repair_chunk.take());
        handlers.upload_pubfile_handlers.extend(self.on_upload_pubfile.take());
        handlers.download_pubfile_handlers.extend(self.on_download_pubfile.take());
        handlers.update_blacklist_handlers.extend(self.on_update_blacklist.take());
        handlers.register_alert_handlers.extend(self.on_register_alert.take());
        handlers.unregister_alert_handlers.extend(self.on_unregister_alert.take());
        if log_events {
            handlers.add_loggers();
        }
        handlers
    }

    /// Recovers the renter's persisted state, starts all of its threads, and returns the handle to them in a
    /// [Renter] struct.
    pub fn start(mut self) -> Result<Renter, RenterError> {
        let event_handlers = self.event_handlers(self.configuration.log_events);
        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let persist_dir = self.configuration.persist_dir.clone();
        create_dir_all(&persist_dir).context("creating the persist directory")?;
        let (hostdb_config, contractor_config, worker_config, repair_config) = (&self.configuration).into();
        create_dir_all(&hostdb_config.persist_dir).context("creating the hostdb directory")?;

        // Transactions that were committed but not applied before the last shutdown.
        let (wal, unfinished) = Wal::open(&persist_dir.join("wal").join("renter.wal"))?;
        let recovered = unfinished.len();
        for transaction in unfinished {
            refcounter::apply_updates(transaction.updates())?;
            transaction.signal_updates_applied()?;
        }
        if recovered > 0 {
            log::info!("Applied {} unfinished WAL transactions", recovered);
        }

        let thread_group = ThreadGroup::new();
        let contracts = ContractSet::new(&persist_dir, wal.clone())?;
        let hostdb = HostDB::new(hostdb_config, self.host_dialer.clone(), contracts.rate_limit())?;
        let contractor = Contractor::new(
            contractor_config,
            contracts,
            hostdb.clone(),
            self.host_dialer.clone(),
            self.consensus_set.clone(),
            self.transaction_pool,
            self.wallet,
            event_publisher.clone(),
            thread_group.clone(),
        )?;

        let pool = WorkerPool::new(Arc::new(WorkerEnvironment {
            contractor: contractor.clone(),
            hostdb: hostdb.clone(),
            dialer: self.host_dialer,
            gateway: self.gateway,
            config: worker_config,
            event_publisher: event_publisher.clone(),
            thread_group: thread_group.clone(),
        }));
        let memory = MemoryManager::new(self.configuration.memory_limit, self.configuration.priority_memory_limit);
        let fs = FileSystem::new(&persist_dir, wal, event_publisher.clone())?;
        let uploader = Arc::new(Uploader::new(fs.clone(), pool.clone(), memory.clone(), event_publisher.clone()));
        let downloader = Arc::new(Downloader::new(
            fs.clone(),
            pool.clone(),
            memory.clone(),
            event_publisher.clone(),
            self.configuration.download_timeout,
        ));
        let repairer = Repairer::new(
            fs.clone(),
            pool.clone(),
            uploader.clone(),
            downloader.clone(),
            repair_config,
            event_publisher.clone(),
            thread_group.clone(),
        );
        let pubfiles = Pubfiles::new(
            fs.clone(),
            pool.clone(),
            uploader.clone(),
            Blacklist::open(&persist_dir)?,
            event_publisher.clone(),
        );
        let pubaccesskeys = PubaccesskeyManager::open(&persist_dir)?;

        let alerter = Alerter::new("renter", event_publisher.clone());
        if contractor.allowance().is_cancelled() {
            alerter.register_alert(
                AlertID::from_name(NO_ALLOWANCE_ALERT),
                "No allowance is set",
                "uploads and contract formation are disabled until an allowance is set",
                AlertSeverity::Warning,
            );
        }

        // Hooks run in reverse order: waiting memory requests fail first, then workers die, then every
        // loop is woken so that it sees the stopped group.
        {
            let (hostdb, contractor, pool, repairer) = (hostdb.clone(), contractor.clone(), pool.clone(), repairer.clone());
            thread_group.on_stop(move || {
                hostdb.trigger_scan();
                contractor.trigger_maintenance();
                pool.trigger_update();
                repairer.trigger();
            });
        }
        {
            let pool = pool.clone();
            thread_group.on_stop(move || pool.kill_all());
        }
        {
            let memory = memory.clone();
            thread_group.on_stop(move || memory.stop());
        }

        let (changes, change_receiver) = mpsc::channel();
        self.consensus_set
            .subscribe(contractor.last_change(), changes)
            .context("subscribing to consensus changes")?;
        let mut threads = vec![start_consensus_subscriber(
            change_receiver,
            hostdb.clone(),
            contractor.clone(),
            pool.clone(),
            thread_group.clone(),
        )];
        threads.push(hostdb.start_scanner(thread_group.clone()));
        threads.push(contractor.start_maintenance());
        threads.push(pool.start_updater(self.configuration.worker_pool_update_interval));
        threads.push(repairer.start());
        pool.update();

        let (event_bus_shutdown, event_bus_shutdown_receiver) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };
        let event_bus = match (event_subscriber, event_bus_shutdown_receiver) {
            (Some(event_subscriber), Some(shutdown_receiver)) => {
                Some(start_event_bus(event_handlers, event_subscriber, shutdown_receiver))
            }
            _ => None,
        };

        Ok(Renter {
            contractor,
            hostdb,
            pool,
            memory,
            fs,
            uploader,
            downloader,
            repairer,
            pubfiles,
            pubaccesskeys,
            alerter,
            thread_group,
            threads,
            event_bus,
            event_bus_shutdown,
            closed: false,
        })
    }
}

/// Feed every consensus change to the host database, then to the contractor. A change that leaves the
/// contractor synced also refreshes the worker pool, since maintenance may have changed the contract set.
fn start_consensus_subscriber(
    changes: Receiver<ConsensusChange>,
    hostdb: Arc<HostDB>,
    contractor: Arc<Contractor>,
    pool: Arc<WorkerPool>,
    thread_group: ThreadGroup,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        if thread_group.is_stopped() {
            return;
        }
        match changes.recv_timeout(CONSENSUS_POLL) {
            Ok(change) => {
                let _guard = match thread_group.add() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                hostdb.process_consensus_change(&change);
                contractor.process_consensus_change(&change);
                if change.synced {
                    pool.trigger_update();
                }
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

/// A handle to the background threads of a renter, and the entry point of every user-facing
/// operation. When this value is dropped, all background threads are gracefully shut down.
pub struct Renter {
    contractor: Arc<Contractor>,
    hostdb: Arc<HostDB>,
    pool: Arc<WorkerPool>,
    memory: Arc<MemoryManager>,
    fs: Arc<FileSystem>,
    uploader: Arc<Uploader>,
    downloader: Arc<Downloader>,
    repairer: Arc<Repairer>,
    pubfiles: Pubfiles,
    pubaccesskeys: PubaccesskeyManager,
    alerter: Alerter,
    thread_group: ThreadGroup,
    threads: Vec<JoinHandle<()>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
    closed: bool,
}

impl Renter {
    /* ↓↓↓ Allowance and spending ↓↓↓ */

    pub fn allowance(&self) -> Allowance {
        self.contractor.allowance()
    }

    /// Set the allowance. Setting [`Allowance::zero`] cancels it: no contract is formed or renewed any
    /// more, and existing contracts stay downloadable until they end.
    pub fn set_allowance(&self, allowance: Allowance) -> Result<(), RenterError> {
        let cancelled = allowance.is_cancelled();
        self.contractor.set_allowance(allowance)?;
        let id = AlertID::from_name(NO_ALLOWANCE_ALERT);
        if cancelled {
            self.alerter.register_alert(
                id,
                "No allowance is set",
                "the allowance was cancelled",
                AlertSeverity::Warning,
            );
        } else {
            self.alerter.unregister_alert(id);
        }
        self.pool.trigger_update();
        Ok(())
    }

    pub fn cancel_allowance(&self) -> Result<(), RenterError> {
        self.set_allowance(Allowance::zero())
    }

    pub fn period_spending(&self) -> ContractorSpending {
        self.contractor.period_spending()
    }

    pub fn current_period(&self) -> BlockHeight {
        self.contractor.current_period()
    }

    pub fn block_height(&self) -> BlockHeight {
        self.contractor.block_height()
    }

    pub fn rate_limits(&self) -> RateLimits {
        self.contractor.contract_set().rate_limits()
    }

    /// Limit the bandwidth of every host connection. Zero means unlimited.
    pub fn set_rate_limits(&self, read_bps: u64, write_bps: u64, packet_size: u64) -> Result<(), RenterError> {
        self.contractor.contract_set().set_rate_limits(read_bps, write_bps, packet_size)
    }

    /* ↓↓↓ Contracts and hosts ↓↓↓ */

    pub fn contracts(&self) -> Vec<ContractMetadata> {
        self.contractor.contracts()
    }

    pub fn old_contracts(&self) -> Vec<ContractMetadata> {
        self.contractor.old_contracts()
    }

    pub fn expired_contracts(&self) -> Vec<ContractMetadata> {
        self.contractor.expired_contracts()
    }

    pub fn contract(&self, id: &ContractID) -> Result<ContractMetadata, RenterError> {
        self.contractor
            .contract_set()
            .view(id)
            .ok_or(RenterError::NotFound(NotFoundKind::Contract(*id)))
    }

    pub fn contract_by_host(&self, host: &HostPublicKey) -> Result<ContractMetadata, RenterError> {
        self.contractor
            .contract_by_public_key(host)
            .ok_or(RenterError::NotFound(NotFoundKind::Host(*host)))
    }

    pub fn mark_contract_bad(&self, id: &ContractID) -> Result<(), RenterError> {
        self.contractor.mark_contract_bad(id)?;
        self.pool.trigger_update();
        Ok(())
    }

    /// Rescan the chain from genesis for contracts that can be recovered from the wallet seed.
    pub fn init_recovery_scan(&self) -> Result<(), RenterError> {
        self.contractor.init_recovery_scan(ConsensusChangeID::BEGINNING)
    }

    /// Whether a recovery scan is running, and the height it has reached.
    pub fn recovery_scan_status(&self) -> (bool, BlockHeight) {
        self.contractor.recovery_scan_status()
    }

    pub fn hosts(&self) -> Vec<HostDBEntry> {
        self.hostdb.all_hosts()
    }

    pub fn active_hosts(&self) -> Vec<HostDBEntry> {
        self.hostdb.active_hosts()
    }

    pub fn host(&self, host: &HostPublicKey) -> Result<HostDBEntry, RenterError> {
        self.hostdb
            .host(host)
            .map(|(entry, _)| entry)
            .ok_or(RenterError::NotFound(NotFoundKind::Host(*host)))
    }

    /// Run a maintenance pass now rather than waiting for the next block.
    pub fn trigger_maintenance(&self) {
        self.contractor.trigger_maintenance();
    }

    /* ↓↓↓ Files and directories ↓↓↓ */

    /// Upload everything `reader` yields to a new file. Returns once every chunk reached enough hosts to be
    /// recovered.
    pub fn upload(&self, params: FileUploadParams, reader: &mut impl Read) -> Result<FileNode, RenterError> {
        self.uploader.upload_stream(params, reader)
    }

    /// Write `length` bytes of the file at `path`, starting at `offset`, to `out`. `None` downloads up to the
    /// end of the file.
    pub fn download(&self, path: &SiaPath, offset: u64, length: Option<u64>, out: &mut impl Write) -> Result<u64, RenterError> {
        self.downloader.download(path, offset, length, out)
    }

    /// Fetch one sector from whichever host has it.
    pub fn download_by_root(&self, root: &SectorRoot, offset: u64, length: u64) -> Result<Vec<u8>, RenterError> {
        self.downloader.download_by_root(root, offset, length)
    }

    pub fn delete_file(&self, path: &SiaPath) -> Result<(), RenterError> {
        self.fs.delete_file(path)
    }

    pub fn rename_file(&self, from: &SiaPath, to: &SiaPath) -> Result<(), RenterError> {
        self.fs.rename_file(from, to)
    }

    pub fn file_info(&self, path: &SiaPath) -> Result<FileInfo, RenterError> {
        self.fs.file_info(path, &self.pool.health_context())
    }

    pub fn file_list(&self, path: &SiaPath, recursive: bool) -> Result<Vec<FileInfo>, RenterError> {
        self.fs.file_list(path, recursive, &self.pool.health_context())
    }

    pub fn create_dir(&self, path: &SiaPath, mode: u32) -> Result<(), RenterError> {
        self.fs.new_dir(path, mode)
    }

    pub fn delete_dir(&self, path: &SiaPath) -> Result<(), RenterError> {
        self.fs.delete_dir(path)
    }

    /// The directory at `path` and its immediate children.
    pub fn dir_list(&self, path: &SiaPath) -> Result<(Vec<DirInfo>, Vec<FileInfo>), RenterError> {
        self.fs.dir_list(path, &self.pool.health_context())
    }

    /// Recompute the health of every directory, then repair the worst ones first. The background loop does
    /// this on its own every repair interval.
    pub fn trigger_repair(&self) {
        self.repairer.trigger();
    }

    /* ↓↓↓ Workers and memory ↓↓↓ */

    pub fn worker_pool_status(&self) -> WorkerPoolStatus {
        self.pool.status()
    }

    pub fn memory_status(&self) -> MemoryStatus {
        self.memory.status()
    }

    /* ↓↓↓ Pubfiles ↓↓↓ */

    pub fn upload_pubfile(&self, params: PubfileUploadParams, reader: &mut impl Read) -> Result<PubfileUpload, RenterError> {
        self.pubfiles.upload(params, reader)
    }

    /// Publish the file already uploaded at `source`.
    pub fn create_pubfile_from_siafile(&self, params: PubfileUploadParams, source: &SiaPath) -> Result<PubfileUpload, RenterError> {
        self.pubfiles.create_from_siafile(params, source)
    }

    /// Fetch the metadata of a pubfile and a stream over its content. Fails at once if the publink is
    /// blacklisted.
    pub fn download_pubfile(&self, publink: &Publink) -> Result<(PubfileMetadata, PubfileStream), RenterError> {
        self.pubfiles.download(publink, self.downloader.timeout())
    }

    /// Re-upload a pubfile published by someone else so that our contracts keep it alive.
    pub fn pin_pubfile(&self, publink: &Publink, params: PubfileUploadParams) -> Result<(), RenterError> {
        self.pubfiles.pin(publink, params, self.downloader.timeout())
    }

    /// Delete every file that keeps `publink` alive. Returns the deleted paths.
    pub fn unpin_pubfile(&self, publink: &Publink) -> Result<Vec<SiaPath>, RenterError> {
        self.pubfiles.unpin(publink)
    }

    pub fn blacklist(&self) -> Vec<SectorRoot> {
        self.pubfiles.blacklist()
    }

    pub fn update_blacklist(&self, additions: &[Publink], removals: &[Publink]) -> Result<(), RenterError> {
        self.pubfiles.update_blacklist(additions, removals)
    }

    pub fn pubaccesskeys(&self) -> &PubaccesskeyManager {
        &self.pubaccesskeys
    }

    /* ↓↓↓ Alerts ↓↓↓ */

    /// Every alert currently raised, most severe first.
    pub fn alerts(&self) -> Vec<Alert> {
        merge_alerts([&self.alerter, self.contractor.alerter()])
    }

    /* ↓↓↓ Shutdown ↓↓↓ */

    /// Stop every background thread and wait for them to exit. Dropping the renter does the same; calling
    /// `close` lets the caller see shutdown errors.
    pub fn close(mut self) -> Result<(), RenterError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), RenterError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let stopped = self.thread_group.stop();
        let mut panicked = 0;
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                panicked += 1;
            }
        }
        self.pubfiles.close();

        // The event bus goes last so that it still handles the events of everything above.
        if let Some(shutdown) = self.event_bus_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            if event_bus.join().is_err() {
                panicked += 1;
            }
        }

        stopped?;
        if panicked > 0 {
            return Err(RenterError::Critical(format!("{} renter threads panicked", panicked)));
        }
        Ok(())
    }
}

impl Drop for Renter {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!("Renter did not shut down cleanly: {}", err);
        }
    }
}
