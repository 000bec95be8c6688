/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of renter events for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Subsystems publish events
//! into a channel; the [event bus](crate::event_bus) thread fires user-registered handlers and, if
//! enabled, the default [loggers](crate::logging).

use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use crate::alerts::{AlertID, AlertSeverity};
use crate::pubfile::publink::Publink;
use crate::types::{
    currency::Currency,
    data_types::{BlockHeight, ContractID, HostPublicKey, SectorRoot},
};

pub enum Event {
    // Contract lifecycle events.
    FormContract(FormContractEvent),
    RenewContract(RenewContractEvent),
    RefreshContract(RefreshContractEvent),
    ChurnContract(ChurnContractEvent),
    ArchiveContract(ArchiveContractEvent),
    SetAllowance(SetAllowanceEvent),
    // Recovery scan events.
    StartRecoveryScan(StartRecoveryScanEvent),
    EndRecoveryScan(EndRecoveryScanEvent),
    RecoverContract(RecoverContractEvent),
    // Worker events.
    UploadPiece(UploadPieceEvent),
    UploadChunkComplete(UploadChunkCompleteEvent),
    DownloadChunkComplete(DownloadChunkCompleteEvent),
    WorkerCooldown(WorkerCooldownEvent),
    FixRevisionMismatch(FixRevisionMismatchEvent),
    // File system health events.
    BubbleDirectory(BubbleDirectoryEvent),
    RepairChunk(RepairChunkEvent),
    // Pubfile events.
    UploadPubfile(UploadPubfileEvent),
    DownloadPubfile(DownloadPubfileEvent),
    UpdateBlacklist(UpdateBlacklistEvent),
    // Alert events.
    RegisterAlert(RegisterAlertEvent),
    UnregisterAlert(UnregisterAlertEvent),
}

/// The sending half of the event channel. `None` if nobody listens for events.
pub type EventPublisher = Option<Sender<Event>>;

impl Event {
    pub(crate) fn publish(event_publisher: &EventPublisher, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The bus thread only disappears during shutdown, when events are no longer interesting.
            let _ = event_publisher.send(event);
        }
    }
}

pub struct FormContractEvent {
    pub timestamp: SystemTime,
    pub contract: ContractID,
    pub host: HostPublicKey,
    pub end_height: BlockHeight,
    pub funds: Currency,
}

pub struct RenewContractEvent {
    pub timestamp: SystemTime,
    pub old_contract: ContractID,
    pub new_contract: ContractID,
    pub host: HostPublicKey,
    pub end_height: BlockHeight,
}

pub struct RefreshContractEvent {
    pub timestamp: SystemTime,
    pub old_contract: ContractID,
    pub new_contract: ContractID,
    pub host: HostPublicKey,
}

pub struct ChurnContractEvent {
    pub timestamp: SystemTime,
    pub contract: ContractID,
    pub host: HostPublicKey,
    pub data_bytes: u64,
    pub voluntary: bool,
}

pub struct ArchiveContractEvent {
    pub timestamp: SystemTime,
    pub contract: ContractID,
    pub end_height: BlockHeight,
}

pub struct SetAllowanceEvent {
    pub timestamp: SystemTime,
    pub funds: Currency,
    pub hosts: u64,
    pub period: u64,
    pub cancelled: bool,
}

pub struct StartRecoveryScanEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
}

pub struct EndRecoveryScanEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub recovered: usize,
    pub succeeded: bool,
}

pub struct RecoverContractEvent {
    pub timestamp: SystemTime,
    pub contract: ContractID,
    pub host: HostPublicKey,
}

pub struct UploadPieceEvent {
    pub timestamp: SystemTime,
    pub host: HostPublicKey,
    pub path: String,
    pub chunk_index: u64,
    pub piece_index: u64,
    pub root: SectorRoot,
}

pub struct UploadChunkCompleteEvent {
    pub timestamp: SystemTime,
    pub path: String,
    pub chunk_index: u64,
    pub pieces_completed: u64,
    pub stuck: bool,
}

pub struct DownloadChunkCompleteEvent {
    pub timestamp: SystemTime,
    pub path: String,
    pub chunk_index: u64,
    pub bytes: u64,
}

/// Which of a worker's two cooldown clocks was set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CooldownKind {
    Upload,
    Download,
}

pub struct WorkerCooldownEvent {
    pub timestamp: SystemTime,
    pub host: HostPublicKey,
    pub kind: CooldownKind,
    pub consecutive_failures: u64,
    pub cooldown: Duration,
}

pub struct FixRevisionMismatchEvent {
    pub timestamp: SystemTime,
    pub contract: ContractID,
    pub host: HostPublicKey,
    pub ours: u64,
    pub theirs: u64,
    pub fixed: bool,
}

pub struct BubbleDirectoryEvent {
    pub timestamp: SystemTime,
    pub path: String,
    pub aggregate_health: f64,
    pub aggregate_num_files: u64,
}

pub struct RepairChunkEvent {
    pub timestamp: SystemTime,
    pub path: String,
    pub chunk_index: u64,
    pub health: f64,
    pub stuck: bool,
}

pub struct UploadPubfileEvent {
    pub timestamp: SystemTime,
    pub publink: Publink,
    pub path: String,
    pub size: u64,
}

pub struct DownloadPubfileEvent {
    pub timestamp: SystemTime,
    pub publink: Publink,
}

pub struct UpdateBlacklistEvent {
    pub timestamp: SystemTime,
    pub additions: usize,
    pub removals: usize,
}

pub struct RegisterAlertEvent {
    pub timestamp: SystemTime,
    pub id: AlertID,
    pub module: String,
    pub severity: AlertSeverity,
    pub message: String,
}

pub struct UnregisterAlertEvent {
    pub timestamp: SystemTime,
    pub id: AlertID,
}
