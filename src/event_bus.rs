/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives [events](crate::events::Event) from every subsystem of the renter
//! and fires the handlers registered for them.

use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::TryRecvError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Polling interval of the event bus thread when no event is pending.
const EVENT_BUS_POLL: Duration = Duration::from_millis(50);

#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) form_contract_handlers: Vec<HandlerPtr<FormContractEvent>>,
    pub(crate) renew_contract_handlers: Vec<HandlerPtr<RenewContractEvent>>,
    pub(crate) refresh_contract_handlers: Vec<HandlerPtr<RefreshContractEvent>>,
    pub(crate) churn_contract_handlers: Vec<HandlerPtr<ChurnContractEvent>>,
    pub(crate) archive_contract_handlers: Vec<HandlerPtr<ArchiveContractEvent>>,
    pub(crate) set_allowance_handlers: Vec<HandlerPtr<SetAllowanceEvent>>,
    pub(crate) start_recovery_scan_handlers: Vec<HandlerPtr<StartRecoveryScanEvent>>,
    pub(crate) end_recovery_scan_handlers: Vec<HandlerPtr<EndRecoveryScanEvent>>,
    pub(crate) recover_contract_handlers: Vec<HandlerPtr<RecoverContractEvent>>,
    pub(crate) upload_piece_handlers: Vec<HandlerPtr<UploadPieceEvent>>,
    pub(crate) upload_chunk_complete_handlers: Vec<HandlerPtr<UploadChunkCompleteEvent>>,
    pub(crate) download_chunk_complete_handlers: Vec<HandlerPtr<DownloadChunkCompleteEvent>>,
    pub(crate) worker_cooldown_handlers: Vec<HandlerPtr<WorkerCooldownEvent>>,
    pub(crate) fix_revision_mismatch_handlers: Vec<HandlerPtr<FixRevisionMismatchEvent>>,
    pub(crate) bubble_directory_handlers: Vec<HandlerPtr<BubbleDirectoryEvent>>,
    pub(crate) repair_chunk_handlers: Vec<HandlerPtr<RepairChunkEvent>>,
    pub(crate) upload_pubfile_handlers: Vec<HandlerPtr<UploadPubfileEvent>>,
    pub(crate) download_pubfile_handlers: Vec<HandlerPtr<DownloadPubfileEvent>>,
    pub(crate) update_blacklist_handlers: Vec<HandlerPtr<UpdateBlacklistEvent>>,
    pub(crate) register_alert_handlers: Vec<HandlerPtr<RegisterAlertEvent>>,
    pub(crate) unregister_alert_handlers: Vec<HandlerPtr<UnregisterAlertEvent>>,
}

impl EventHandlers {
    /// Whether no handler at all is registered, in which case the renter does not start the bus.
    pub(crate) fn is_empty(&self) -> bool {
        self.form_contract_handlers.is_empty()
            && self.renew_contract_handlers.is_empty()
            && self.refresh_contract_handlers.is_empty()
            && self.churn_contract_handlers.is_empty()
            && self.archive_contract_handlers.is_empty()
            && self.set_allowance_handlers.is_empty()
            && self.start_recovery_scan_handlers.is_empty()
            && self.end_recovery_scan_handlers.is_empty()
            && self.recover_contract_handlers.is_empty()
            && self.upload_piece_handlers.is_empty()
            && self.upload_chunk_complete_handlers.is_empty()
            && self.download_chunk_complete_handlers.is_empty()
            && self.worker_cooldown_handlers.is_empty()
            && self.fix_revision_mismatch_handlers.is_empty()
            && self.bubble_directory_handlers.is_empty()
            && self.repair_chunk_handlers.is_empty()
            && self.upload_pubfile_handlers.is_empty()
            && self.download_pubfile_handlers.is_empty()
            && self.update_blacklist_handlers.is_empty()
            && self.register_alert_handlers.is_empty()
            && self.unregister_alert_handlers.is_empty()
    }

    /// Register the default logger of every event type.
    pub(crate) fn add_loggers(&mut self) {
        self.form_contract_handlers.push(FormContractEvent::get_logger());
        self.renew_contract_handlers.push(RenewContractEvent::get_logger());
        self.refresh_contract_handlers.push(RefreshContractEvent::get_logger());
        self.churn_contract_handlers.push(ChurnContractEvent::get_logger());
        self.archive_contract_handlers.push(ArchiveContractEvent::get_logger());
        self.set_allowance_handlers.push(SetAllowanceEvent::get_logger());
        self.start_recovery_scan_handlers.push(StartRecoveryScanEvent::get_logger());
        self.end_recovery_scan_handlers.push(EndRecoveryScanEvent::get_logger());
        self.recover_contract_handlers.push(RecoverContractEvent::get_logger());
        self.upload_piece_handlers.push(UploadPieceEvent::get_logger());
        self.upload_chunk_complete_handlers.push(UploadChunkCompleteEvent::get_logger());
        self.download_chunk_complete_handlers.push(DownloadChunkCompleteEvent::get_logger());
        self.worker_cooldown_handlers.push(WorkerCooldownEvent::get_logger());
        self.fix_revision_mismatch_handlers.push(FixRevisionMismatchEvent::get_logger());
        self.bubble_directory_handlers.push(BubbleDirectoryEvent::get_logger());
        self.repair_chunk_handlers.push(RepairChunkEvent::get_logger());
        self.upload_pubfile_handlers.push(UploadPubfileEvent::get_logger());
        self.download_pubfile_handlers.push(DownloadPubfileEvent::get_logger());
        self.update_blacklist_handlers.push(UpdateBlacklistEvent::get_logger());
        self.register_alert_handlers.push(RegisterAlertEvent::get_logger());
        self.unregister_alert_handlers.push(UnregisterAlertEvent::get_logger());
    }

    pub fn fire_handlers(&self, event: Event) {
        match event {
            Event::FormContract(e) => self.form_contract_handlers.iter().for_each(|handler| handler(&e)),
            Event::RenewContract(e) => self.renew_contract_handlers.iter().for_each(|handler| handler(&e)),
            Event::RefreshContract(e) => self.refresh_contract_handlers.iter().for_each(|handler| handler(&e)),
            Event::ChurnContract(e) => self.churn_contract_handlers.iter().for_each(|handler| handler(&e)),
            Event::ArchiveContract(e) => self.archive_contract_handlers.iter().for_each(|handler| handler(&e)),
            Event::SetAllowance(e) => self.set_allowance_handlers.iter().for_each(|handler| handler(&e)),
            Event::StartRecoveryScan(e) => self.start_recovery_scan_handlers.iter().for_each(|handler| handler(&e)),
            Event::EndRecoveryScan(e) => self.end_recovery_scan_handlers.iter().for_each(|handler| handler(&e)),
            Event::RecoverContract(e) => self.recover_contract_handlers.iter().for_each(|handler| handler(&e)),
            Event::UploadPiece(e) => self.upload_piece_handlers.iter().for_each(|handler| handler(&e)),
            Event::UploadChunkComplete(e) => self.upload_chunk_complete_handlers.iter().for_each(|handler| handler(&e)),
            Event::DownloadChunkComplete(e) => {
                self.download_chunk_complete_handlers.iter().for_each(|handler| handler(&e))
            }
            Event::WorkerCooldown(e) => self.worker_cooldown_handlers.iter().for_each(|handler| handler(&e)),
            Event::FixRevisionMismatch(e) => self.fix_revision_mismatch_handlers.iter().for_each(|handler| handler(&e)),
            Event::BubbleDirectory(e) => self.bubble_directory_handlers.iter().for_each(|handler| handler(&e)),
            Event::RepairChunk(e) => self.repair_chunk_handlers.iter().for_each(|handler| handler(&e)),
            Event::UploadPubfile(e) => self.upload_pubfile_handlers.iter().for_each(|handler| handler(&e)),
            Event::DownloadPubfile(e) => self.download_pubfile_handlers.iter().for_each(|handler| handler(&e)),
            Event::UpdateBlacklist(e) => self.update_blacklist_handlers.iter().for_each(|handler| handler(&e)),
            Event::RegisterAlert(e) => self.register_alert_handlers.iter().for_each(|handler| handler(&e)),
            Event::UnregisterAlert(e) => self.unregister_alert_handlers.iter().for_each(|handler| handler(&e)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => {
                // Drain what is already queued so that the last events of a shutdown are still handled.
                while let Ok(event) = event_subscriber.try_recv() {
                    event_handlers.fire_handlers(event)
                }
                return;
            }
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.recv_timeout(EVENT_BUS_POLL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Every publisher is gone: nothing more will arrive, wait for the shutdown signal.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(EVENT_BUS_POLL),
        }
    })
}
