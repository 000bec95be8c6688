/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the renter's
//! [config](crate::config::Configuration).
//!
//! The renter logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [FormContract](crate::events::FormContractEvent) is printed:
//!
//! ```text
//! FormContract, 1701329264, Id5u7f6, fNGCJyk, 1440
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the contract ID.
//! - The fourth value is the first seven characters of the Base64 encoding of the host's public key.
//! - The fifth value is the end height of the contract.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const FORM_CONTRACT: &str = "FormContract";
pub const RENEW_CONTRACT: &str = "RenewContract";
pub const REFRESH_CONTRACT: &str = "RefreshContract";
pub const CHURN_CONTRACT: &str = "ChurnContract";
pub const ARCHIVE_CONTRACT: &str = "ArchiveContract";
pub const SET_ALLOWANCE: &str = "SetAllowance";

pub const START_RECOVERY_SCAN: &str = "StartRecoveryScan";
pub const END_RECOVERY_SCAN: &str = "EndRecoveryScan";
pub const RECOVER_CONTRACT: &str = "RecoverContract";

pub const UPLOAD_PIECE: &str = "UploadPiece";
pub const UPLOAD_CHUNK_COMPLETE: &str = "UploadChunkComplete";
pub const DOWNLOAD_CHUNK_COMPLETE: &str = "DownloadChunkComplete";
pub const WORKER_COOLDOWN: &str = "WorkerCooldown";
pub const FIX_REVISION_MISMATCH: &str = "FixRevisionMismatch";

pub const BUBBLE_DIRECTORY: &str = "BubbleDirectory";
pub const REPAIR_CHUNK: &str = "RepairChunk";

pub const UPLOAD_PUBFILE: &str = "UploadPubfile";
pub const DOWNLOAD_PUBFILE: &str = "DownloadPubfile";
pub const UPDATE_BLACKLIST: &str = "UpdateBlacklist";

pub const REGISTER_ALERT: &str = "RegisterAlert";
pub const UNREGISTER_ALERT: &str = "UnregisterAlert";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for FormContractEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |form_contract_event: &FormContractEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                FORM_CONTRACT,
                secs_since_unix_epoch(form_contract_event.timestamp),
                first_seven_base64_chars(&form_contract_event.contract.bytes()),
                first_seven_base64_chars(&form_contract_event.host.bytes()),
                form_contract_event.end_height
            )
        };
        Box::new(logger)
    }
}

impl Logger for RenewContractEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |renew_contract_event: &RenewContractEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RENEW_CONTRACT,
                secs_since_unix_epoch(renew_contract_event.timestamp),
                first_seven_base64_chars(&renew_contract_event.old_contract.bytes()),
                first_seven_base64_chars(&renew_contract_event.new_contract.bytes()),
                first_seven_base64_chars(&renew_contract_event.host.bytes()),
                renew_contract_event.end_height
            )
        };
        Box::new(logger)
    }
}

impl Logger for RefreshContractEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |refresh_contract_event: &RefreshContractEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                REFRESH_CONTRACT,
                secs_since_unix_epoch(refresh_contract_event.timestamp),
                first_seven_base64_chars(&refresh_contract_event.old_contract.bytes()),
                first_seven_base64_chars(&refresh_contract_event.new_contract.bytes()),
                first_seven_base64_chars(&refresh_contract_event.host.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ChurnContractEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |churn_contract_event: &ChurnContractEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                CHURN_CONTRACT,
                secs_since_unix_epoch(churn_contract_event.timestamp),
                first_seven_base64_chars(&churn_contract_event.contract.bytes()),
                first_seven_base64_chars(&churn_contract_event.host.bytes()),
                churn_contract_event.data_bytes,
                churn_contract_event.voluntary
            )
        };
        Box::new(logger)
    }
}

impl Logger for ArchiveContractEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |archive_contract_event: &ArchiveContractEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ARCHIVE_CONTRACT,
                secs_since_unix_epoch(archive_contract_event.timestamp),
                first_seven_base64_chars(&archive_contract_event.contract.bytes()),
                archive_contract_event.end_height
            )
        };
        Box::new(logger)
    }
}

impl Logger for SetAllowanceEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |set_allowance_event: &SetAllowanceEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                SET_ALLOWANCE,
                secs_since_unix_epoch(set_allowance_event.timestamp),
                set_allowance_event.funds,
                set_allowance_event.hosts,
                set_allowance_event.period,
                set_allowance_event.cancelled
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartRecoveryScanEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_recovery_scan_event: &StartRecoveryScanEvent| {
            log::info!(
                "{}, {}, {}",
                START_RECOVERY_SCAN,
                secs_since_unix_epoch(start_recovery_scan_event.timestamp),
                start_recovery_scan_event.height
            )
        };
        Box::new(logger)
    }
}

impl Logger for EndRecoveryScanEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |end_recovery_scan_event: &EndRecoveryScanEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                END_RECOVERY_SCAN,
                secs_since_unix_epoch(end_recovery_scan_event.timestamp),
                end_recovery_scan_event.height,
                end_recovery_scan_event.recovered,
                end_recovery_scan_event.succeeded
            )
        };
        Box::new(logger)
    }
}

impl Logger for RecoverContractEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |recover_contract_event: &RecoverContractEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECOVER_CONTRACT,
                secs_since_unix_epoch(recover_contract_event.timestamp),
                first_seven_base64_chars(&recover_contract_event.contract.bytes()),
                first_seven_base64_chars(&recover_contract_event.host.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for UploadPieceEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |upload_piece_event: &UploadPieceEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                UPLOAD_PIECE,
                secs_since_unix_epoch(upload_piece_event.timestamp),
                first_seven_base64_chars(&upload_piece_event.host.bytes()),
                upload_piece_event.path,
                upload_piece_event.chunk_index,
                upload_piece_event.piece_index,
                first_seven_base64_chars(&upload_piece_event.root.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for UploadChunkCompleteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |upload_chunk_complete_event: &UploadChunkCompleteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                UPLOAD_CHUNK_COMPLETE,
                secs_since_unix_epoch(upload_chunk_complete_event.timestamp),
                upload_chunk_complete_event.path,
                upload_chunk_complete_event.chunk_index,
                upload_chunk_complete_event.pieces_completed,
                upload_chunk_complete_event.stuck
            )
        };
        Box::new(logger)
    }
}

impl Logger for DownloadChunkCompleteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |download_chunk_complete_event: &DownloadChunkCompleteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                DOWNLOAD_CHUNK_COMPLETE,
                secs_since_unix_epoch(download_chunk_complete_event.timestamp),
                download_chunk_complete_event.path,
                download_chunk_complete_event.chunk_index,
                download_chunk_complete_event.bytes
            )
        };
        Box::new(logger)
    }
}

impl Logger for WorkerCooldownEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |worker_cooldown_event: &WorkerCooldownEvent| {
            log::info!(
                "{}, {}, {}, {:?}, {}, {}",
                WORKER_COOLDOWN,
                secs_since_unix_epoch(worker_cooldown_event.timestamp),
                first_seven_base64_chars(&worker_cooldown_event.host.bytes()),
                worker_cooldown_event.kind,
                worker_cooldown_event.consecutive_failures,
                worker_cooldown_event.cooldown.as_millis()
            )
        };
        Box::new(logger)
    }
}

impl Logger for FixRevisionMismatchEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |fix_revision_mismatch_event: &FixRevisionMismatchEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                FIX_REVISION_MISMATCH,
                secs_since_unix_epoch(fix_revision_mismatch_event.timestamp),
                first_seven_base64_chars(&fix_revision_mismatch_event.contract.bytes()),
                first_seven_base64_chars(&fix_revision_mismatch_event.host.bytes()),
                fix_revision_mismatch_event.ours,
                fix_revision_mismatch_event.theirs,
                fix_revision_mismatch_event.fixed
            )
        };
        Box::new(logger)
    }
}

impl Logger for BubbleDirectoryEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |bubble_directory_event: &BubbleDirectoryEvent| {
            log::debug!(
                "{}, {}, {}, {:.3}, {}",
                BUBBLE_DIRECTORY,
                secs_since_unix_epoch(bubble_directory_event.timestamp),
                bubble_directory_event.path,
                bubble_directory_event.aggregate_health,
                bubble_directory_event.aggregate_num_files
            )
        };
        Box::new(logger)
    }
}

impl Logger for RepairChunkEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |repair_chunk_event: &RepairChunkEvent| {
            log::info!(
                "{}, {}, {}, {}, {:.3}, {}",
                REPAIR_CHUNK,
                secs_since_unix_epoch(repair_chunk_event.timestamp),
                repair_chunk_event.path,
                repair_chunk_event.chunk_index,
                repair_chunk_event.health,
                repair_chunk_event.stuck
            )
        };
        Box::new(logger)
    }
}

impl Logger for UploadPubfileEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |upload_pubfile_event: &UploadPubfileEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                UPLOAD_PUBFILE,
                secs_since_unix_epoch(upload_pubfile_event.timestamp),
                upload_pubfile_event.publink,
                upload_pubfile_event.path,
                upload_pubfile_event.size
            )
        };
        Box::new(logger)
    }
}

impl Logger for DownloadPubfileEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |download_pubfile_event: &DownloadPubfileEvent| {
            log::info!(
                "{}, {}, {}",
                DOWNLOAD_PUBFILE,
                secs_since_unix_epoch(download_pubfile_event.timestamp),
                download_pubfile_event.publink
            )
        };
        Box::new(logger)
    }
}

impl Logger for UpdateBlacklistEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |update_blacklist_event: &UpdateBlacklistEvent| {
            log::info!(
                "{}, {}, {}, {}",
                UPDATE_BLACKLIST,
                secs_since_unix_epoch(update_blacklist_event.timestamp),
                update_blacklist_event.additions,
                update_blacklist_event.removals
            )
        };
        Box::new(logger)
    }
}

impl Logger for RegisterAlertEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |register_alert_event: &RegisterAlertEvent| {
            log::warn!(
                "{}, {}, {}, {}, {:?}, {}",
                REGISTER_ALERT,
                secs_since_unix_epoch(register_alert_event.timestamp),
                first_seven_base64_chars(&register_alert_event.id.bytes()),
                register_alert_event.module,
                register_alert_event.severity,
                register_alert_event.message
            )
        };
        Box::new(logger)
    }
}

impl Logger for UnregisterAlertEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |unregister_alert_event: &UnregisterAlertEvent| {
            log::info!(
                "{}, {}, {}",
                UNREGISTER_ALERT,
                secs_since_unix_epoch(unregister_alert_event.timestamp),
                first_seven_base64_chars(&unregister_alert_event.id.bytes())
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

pub(crate) fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
