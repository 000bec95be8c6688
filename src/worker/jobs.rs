/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Jobs other parts of the renter queue on a worker, each answered through a channel.
//!
//! [`HasSectorJob`] and [`ReadSectorJob`] only read, so they run as async jobs. The others go through
//! the serial slot: [`DownloadByRootJob`] because a content-addressed download should not compete with
//! piece reads for bandwidth, and the snapshot jobs because they revise the contract.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use super::job_queue::{respond, CancelToken, Job, JobQueue};
use super::snapshot::SnapshotEntry;
use super::Worker;
use crate::errors::RenterError;
use crate::events::{CooldownKind, Event, WorkerCooldownEvent};
use crate::types::constants::SECTOR_SIZE;
use crate::types::data_types::{HostPublicKey, SectorRoot};

/// Answer of a has-sector query, tagged with the host that gave it.
pub type HasSectorResponse = (HostPublicKey, Result<bool, RenterError>);

pub struct HasSectorJob {
    pub root: SectorRoot,
    pub cancel: CancelToken,
    pub response: Sender<HasSectorResponse>,
    host: HostPublicKey,
}

impl HasSectorJob {
    pub fn new(host: HostPublicKey, root: SectorRoot, cancel: CancelToken, response: Sender<HasSectorResponse>) -> Self {
        HasSectorJob {
            root,
            cancel,
            response,
            host,
        }
    }
}

pub struct ReadSectorJob {
    pub root: SectorRoot,
    pub offset: u64,
    pub length: u64,
    pub cancel: CancelToken,
    pub response: Sender<Result<Vec<u8>, RenterError>>,
}

pub struct DownloadByRootJob {
    pub root: SectorRoot,
    pub offset: u64,
    pub length: u64,
    pub cancel: CancelToken,
    pub response: Sender<Result<Vec<u8>, RenterError>>,
}

pub struct FetchBackupsJob {
    pub cancel: CancelToken,
    pub response: Sender<(HostPublicKey, Result<Vec<SnapshotEntry>, RenterError>)>,
    host: HostPublicKey,
}

impl FetchBackupsJob {
    pub fn new(
        host: HostPublicKey,
        cancel: CancelToken,
        response: Sender<(HostPublicKey, Result<Vec<SnapshotEntry>, RenterError>)>,
    ) -> Self {
        FetchBackupsJob { cancel, response, host }
    }
}

pub struct UploadSnapshotJob {
    pub entry: SnapshotEntry,
    pub cancel: CancelToken,
    pub response: Sender<Result<(), RenterError>>,
}

impl Job for HasSectorJob {
    fn discard(self, err: RenterError) {
        let _ = self.response.send((self.host, Err(err)));
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn expected_bandwidth(&self) -> (u64, u64) {
        (0, 0)
    }
}

impl Job for ReadSectorJob {
    fn discard(self, err: RenterError) {
        respond(&self.response, Err(err))
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn expected_bandwidth(&self) -> (u64, u64) {
        (0, self.length)
    }
}

impl Job for DownloadByRootJob {
    fn discard(self, err: RenterError) {
        respond(&self.response, Err(err))
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn expected_bandwidth(&self) -> (u64, u64) {
        (0, self.length)
    }
}

impl Job for FetchBackupsJob {
    fn discard(self, err: RenterError) {
        let _ = self.response.send((self.host, Err(err)));
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn expected_bandwidth(&self) -> (u64, u64) {
        (0, SECTOR_SIZE)
    }
}

impl Job for UploadSnapshotJob {
    fn discard(self, err: RenterError) {
        respond(&self.response, Err(err))
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn expected_bandwidth(&self) -> (u64, u64) {
        (SECTOR_SIZE, SECTOR_SIZE)
    }
}

impl Worker {
    /// Record the outcome of a job from `queue`. Failures put the queue on cooldown.
    fn report<J: Job, T>(&self, queue: &JobQueue<J>, kind: CooldownKind, started: Instant, result: &Result<T, RenterError>) {
        match result {
            Ok(_) => queue.report_success(started.elapsed()),
            Err(err) if err.is_shutdown() => (),
            Err(err) => {
                let base = match kind {
                    CooldownKind::Upload => self.env.config.upload_failure_cooldown,
                    CooldownKind::Download => self.env.config.download_failure_cooldown,
                };
                let (consecutive_failures, cooldown) =
                    queue.report_failure(err, base, self.env.config.max_consecutive_penalty);
                log::debug!(
                    "Job queue of worker for host {} cools down for {:?} after {} failures: {}",
                    self.host,
                    cooldown,
                    consecutive_failures,
                    err
                );
                Event::publish(
                    &self.env.event_publisher,
                    Event::WorkerCooldown(WorkerCooldownEvent {
                        timestamp: SystemTime::now(),
                        host: self.host,
                        kind,
                        consecutive_failures,
                        cooldown,
                    }),
                );
            }
        }
    }

    /// Queue a has-sector query for `root`. Returns false if the worker refused it; the answer was sent either way.
    pub(crate) fn queue_has_sector(&self, job: HasSectorJob) -> bool {
        let queued = self.has_sector.add(job);
        self.wake();
        queued
    }

    pub(crate) fn queue_read_sector(&self, job: ReadSectorJob) -> bool {
        let queued = self.read_sector.add(job);
        self.wake();
        queued
    }

    pub(crate) fn queue_download_by_root(&self, job: DownloadByRootJob) -> bool {
        let queued = self.download_by_root.add(job);
        self.wake();
        queued
    }

    pub(crate) fn queue_fetch_backups(&self, job: FetchBackupsJob) -> bool {
        let queued = self.fetch_backups.add(job);
        self.wake();
        queued
    }

    pub(crate) fn queue_upload_snapshot(&self, job: UploadSnapshotJob) -> bool {
        let queued = self.upload_snapshot.add(job);
        self.wake();
        queued
    }
}

impl HasSectorJob {
    pub(crate) fn execute(self, worker: &Arc<Worker>) {
        let started = Instant::now();
        let result = self.cancel.check().and_then(|()| worker.check_sector(&self.root));
        worker.report(&worker.has_sector, CooldownKind::Download, started, &result);
        let _ = self.response.send((self.host, result));
    }
}

impl ReadSectorJob {
    pub(crate) fn execute(self, worker: &Arc<Worker>) {
        let started = Instant::now();
        let result = self
            .cancel
            .check()
            .and_then(|()| worker.read_sector(&self.root, self.offset, self.length));
        worker.report(&worker.read_sector, CooldownKind::Download, started, &result);
        respond(&self.response, result);
    }
}

impl DownloadByRootJob {
    pub(crate) fn execute(self, worker: &Arc<Worker>) {
        let started = Instant::now();
        let result = self
            .cancel
            .check()
            .and_then(|()| worker.read_sector(&self.root, self.offset, self.length));
        worker.report(&worker.download_by_root, CooldownKind::Download, started, &result);
        respond(&self.response, result);
    }
}

impl FetchBackupsJob {
    pub(crate) fn execute(self, worker: &Arc<Worker>) {
        let started = Instant::now();
        let result = self.cancel.check().and_then(|()| worker.fetch_snapshot_table());
        worker.report(&worker.fetch_backups, CooldownKind::Download, started, &result);
        let _ = self.response.send((self.host, result));
    }
}

impl UploadSnapshotJob {
    pub(crate) fn execute(self, worker: &Arc<Worker>) {
        let started = Instant::now();
        let result = self.cancel.check().and_then(|()| {
            if !worker.cache().utility.good_for_upload {
                return Err(RenterError::InvalidArgument(format!(
                    "contract with host {} is not good for upload",
                    worker.host
                )));
            }
            worker.upload_snapshot_entry(self.entry.clone())
        });
        worker.report(&worker.upload_snapshot, CooldownKind::Upload, started, &result);
        respond(&self.response, result);
    }
}

/// Longest a caller of a worker job waits before giving up.
pub(crate) const JOB_TIMEOUT: Duration = Duration::from_secs(5 * 60);
