/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};

use super::job_queue::JobQueueStatus;
use super::Worker;
use crate::contract_set::record::ContractUtility;
use crate::types::data_types::{ContractID, HostPublicKey};

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerStatus {
    pub host: HostPublicKey,
    pub contract_id: Option<ContractID>,
    pub utility: ContractUtility,
    pub killed: bool,
    pub suspect_revision_mismatch: bool,

    pub download_on_cooldown: bool,
    pub download_cooldown_remaining: Duration,
    pub download_consecutive_failures: u64,
    pub download_recent_error: Option<String>,
    pub download_recent_error_time: Option<SystemTime>,
    pub download_queue_size: usize,
    pub download_terminated: bool,

    pub upload_on_cooldown: bool,
    pub upload_cooldown_remaining: Duration,
    pub upload_consecutive_failures: u64,
    pub upload_recent_error: Option<String>,
    pub upload_recent_error_time: Option<SystemTime>,
    pub upload_queue_size: usize,
    pub upload_terminated: bool,

    pub backup_queue_size: usize,
    pub download_by_root_queue_size: usize,

    pub async_jobs_running: u64,
    pub read_outstanding: u64,
    pub write_outstanding: u64,

    pub fetch_backups: JobQueueStatus,
    pub upload_snapshot: JobQueueStatus,
    pub download_by_root: JobQueueStatus,
    pub has_sector: JobQueueStatus,
    pub read_sector: JobQueueStatus,
}

/// Status of every worker, with totals over all of them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerPoolStatus {
    pub workers: Vec<WorkerStatus>,
    pub num_workers: usize,
    pub total_download_cooldown: usize,
    pub total_upload_cooldown: usize,
}

impl WorkerPoolStatus {
    pub fn new(workers: Vec<WorkerStatus>) -> WorkerPoolStatus {
        WorkerPoolStatus {
            num_workers: workers.len(),
            total_download_cooldown: workers.iter().filter(|worker| worker.download_on_cooldown).count(),
            total_upload_cooldown: workers.iter().filter(|worker| worker.upload_on_cooldown).count(),
            workers,
        }
    }
}

impl Worker {
    pub fn status(&self) -> WorkerStatus {
        let cache = self.cache();
        let config = &self.env.config;
        let (download, download_queue_size, download_terminated) = {
            let queue = self.download.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            (queue.cooldown.clone(), queue.chunks.len(), queue.terminated)
        };
        let (upload, upload_queue_size, upload_terminated) = {
            let queue = self.upload.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            (queue.cooldown.clone(), queue.chunks.len(), queue.terminated)
        };
        let download_cooldown_remaining =
            download.remaining(config.download_failure_cooldown, config.max_consecutive_penalty);
        let upload_cooldown_remaining = upload.remaining(config.upload_failure_cooldown, config.max_consecutive_penalty);
        let fetch_backups = self.fetch_backups.status();
        let upload_snapshot = self.upload_snapshot.status();
        let download_by_root = self.download_by_root.status();

        WorkerStatus {
            host: self.host,
            contract_id: cache.contract_id,
            utility: cache.utility,
            killed: self.is_killed(),
            suspect_revision_mismatch: self.suspect_revision_mismatch(),

            download_on_cooldown: download_cooldown_remaining > Duration::ZERO,
            download_cooldown_remaining,
            download_consecutive_failures: download.consecutive_failures(),
            download_recent_error: download.recent_error().map(str::to_string),
            download_recent_error_time: download.recent_error_time(),
            download_queue_size,
            download_terminated,

            upload_on_cooldown: upload_cooldown_remaining > Duration::ZERO,
            upload_cooldown_remaining,
            upload_consecutive_failures: upload.consecutive_failures(),
            upload_recent_error: upload.recent_error().map(str::to_string),
            upload_recent_error_time: upload.recent_error_time(),
            upload_queue_size,
            upload_terminated,

            backup_queue_size: fetch_backups.queue_size + upload_snapshot.queue_size,
            download_by_root_queue_size: download_by_root.queue_size,

            async_jobs_running: self.async_jobs_running.load(Ordering::SeqCst),
            read_outstanding: self.read_outstanding.load(Ordering::SeqCst),
            write_outstanding: self.write_outstanding.load(Ordering::SeqCst),

            fetch_backups,
            upload_snapshot,
            download_by_root,
            has_sector: self.has_sector.status(),
            read_sector: self.read_sector.status(),
        }
    }
}
