/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! One worker per contract: the only code that talks to a host about stored data.
//!
//! ## Jobs
//!
//! A worker receives work through queues. Jobs that revise the contract (uploading or downloading a
//! piece of a chunk, fetching or writing the snapshot table, downloading a sector by root) are
//! **serial**: at most one of them runs at a time, because each one takes the contract's lock for the
//! duration of its RPC. Read-only jobs (sector reads and has-sector queries) are **async**: any number of
//! them may run at once, bounded by how many bytes they are expected to move.
//!
//! ## The work loop
//!
//! Each worker runs a loop on its own thread. An iteration:
//! 1. Waits while the gateway is offline, since failures while offline are not the host's fault.
//! 2. Resyncs the contract with the host if an earlier RPC hit a revision mismatch.
//! 3. Refreshes the [cache](cache) if it is stale.
//! 4. Launches the next serial job, in the priority order fetch-backups, upload-snapshot,
//!    download-by-root, download, upload, unless a serial job is already running.
//! 5. Launches async jobs until the outstanding read or write bytes reach their limits.
//! 6. Sleeps until new work arrives, a job finishes, or the worker is killed.
//!
//! ## Failures
//!
//! Failed uploads and downloads put the worker on an exponentially growing [cooldown](cooldown) during
//! which it takes no new chunks. Async queues keep cooldowns of their own.

pub mod cache;

pub mod cooldown;

pub mod gouging;

pub mod job_queue;

pub mod jobs;

pub(crate) mod download;

pub(crate) mod revision_mismatch;

pub(crate) mod rpc;

pub mod snapshot;

pub mod status;

pub(crate) mod upload;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use self::cache::WorkerCache;
use self::download::DownloadQueue;
use self::job_queue::{Job, JobQueue};
use self::jobs::{DownloadByRootJob, FetchBackupsJob, HasSectorJob, ReadSectorJob, UploadSnapshotJob};
use self::upload::UploadQueue;
use crate::collaborators::Gateway;
use crate::contractor::allowance::Allowance;
use crate::contractor::Contractor;
use crate::errors::critical;
use crate::events::EventPublisher;
use crate::host_protocol::price_table::PriceTable;
use crate::host_protocol::HostDialer;
use crate::hostdb::HostDB;
use crate::thread_group::ThreadGroup;
use crate::types::data_types::{CryptoHash, HostPublicKey};

/// How long an idle worker sleeps before looking at its queues again without being woken.
const IDLE_TICK: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct WorkerConfiguration {
    pub cache_ttl: Duration,
    pub rpc_timeout: Duration,
    /// How often a worker checks whether the gateway came back online.
    pub offline_check_frequency: Duration,
    pub upload_failure_cooldown: Duration,
    pub download_failure_cooldown: Duration,
    /// Failures beyond this many no longer lengthen a cooldown.
    pub max_consecutive_penalty: u32,
    pub max_async_read_bytes: u64,
    pub max_async_write_bytes: u64,
    pub gouging_fraction_denom: u64,
    pub abort_on_critical: bool,
    /// Account hosts refund unspent program budgets to.
    pub refund_account: CryptoHash,
}

/// What every worker shares with the rest of the renter.
pub(crate) struct WorkerEnvironment {
    pub(crate) contractor: Arc<Contractor>,
    pub(crate) hostdb: Arc<HostDB>,
    pub(crate) dialer: Arc<dyn HostDialer>,
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) config: WorkerConfiguration,
    pub(crate) event_publisher: EventPublisher,
    pub(crate) thread_group: ThreadGroup,
}

pub struct Worker {
    host: HostPublicKey,
    env: Arc<WorkerEnvironment>,

    cache: RwLock<Arc<WorkerCache>>,
    cache_updating: AtomicBool,
    /// The host's price table and when it stops being valid.
    price_table: Mutex<Option<(PriceTable, Instant)>>,

    suspect_revision_mismatch: AtomicBool,
    serial_job_running: AtomicBool,
    async_jobs_running: AtomicU64,
    read_outstanding: AtomicU64,
    write_outstanding: AtomicU64,

    upload: Mutex<UploadQueue>,
    download: Mutex<DownloadQueue>,
    fetch_backups: JobQueue<FetchBackupsJob>,
    upload_snapshot: JobQueue<UploadSnapshotJob>,
    download_by_root: JobQueue<DownloadByRootJob>,
    has_sector: JobQueue<HasSectorJob>,
    read_sector: JobQueue<ReadSectorJob>,

    wake: Mutex<Option<Sender<()>>>,
    killed: AtomicBool,
}

impl Worker {
    pub(crate) fn new(host: HostPublicKey, env: Arc<WorkerEnvironment>) -> Arc<Worker> {
        let worker = Worker {
            host,
            env,
            cache: RwLock::new(Arc::new(WorkerCache {
                block_height: Default::default(),
                contract_id: None,
                contract_end: Default::default(),
                utility: Default::default(),
                host_version: String::new(),
                allowance: Allowance::zero(),
                synced: false,
                last_update: Instant::now(),
            })),
            cache_updating: AtomicBool::new(false),
            price_table: Mutex::new(None),
            suspect_revision_mismatch: AtomicBool::new(false),
            serial_job_running: AtomicBool::new(false),
            async_jobs_running: AtomicU64::new(0),
            read_outstanding: AtomicU64::new(0),
            write_outstanding: AtomicU64::new(0),
            upload: Mutex::new(UploadQueue::default()),
            download: Mutex::new(DownloadQueue::default()),
            fetch_backups: JobQueue::new(),
            upload_snapshot: JobQueue::new(),
            download_by_root: JobQueue::new(),
            has_sector: JobQueue::new(),
            read_sector: JobQueue::new(),
            wake: Mutex::new(None),
            killed: AtomicBool::new(false),
        };
        worker.refresh_cache();
        Arc::new(worker)
    }

    pub fn host(&self) -> HostPublicKey {
        self.host
    }

    /// Start the work loop. It exits once the worker is killed or the renter shuts down.
    pub(crate) fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let (wake, woken) = mpsc::channel();
        *self.wake_sender() = Some(wake);
        let worker = self.clone();
        thread::spawn(move || worker.work_loop(woken))
    }

    fn wake_sender(&self) -> MutexGuard<'_, Option<Sender<()>>> {
        self.wake.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Nudge the work loop to look at its queues.
    pub(crate) fn wake(&self) {
        if let Some(wake) = self.wake_sender().as_ref() {
            let _ = wake.send(());
        }
    }

    /// Stop the worker. Queued jobs fail, and queued chunks continue with other workers.
    pub(crate) fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn suspect_revision_mismatch(&self) -> bool {
        self.suspect_revision_mismatch.load(Ordering::SeqCst)
    }

    pub(crate) fn set_suspect_revision_mismatch(&self) {
        self.suspect_revision_mismatch.store(true, Ordering::SeqCst);
        self.wake();
    }

    fn work_loop(self: Arc<Self>, woken: Receiver<()>) {
        loop {
            if self.is_killed() || self.env.thread_group.is_stopped() {
                self.shut_down();
                return;
            }

            if !self.env.gateway.online() {
                match woken.recv_timeout(self.env.config.offline_check_frequency) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        self.shut_down();
                        return;
                    }
                }
            }

            if self.suspect_revision_mismatch() {
                self.try_fix_revision_mismatch();
            }
            self.refresh_cache_if_stale();
            self.try_launch_serial_job();
            while self.try_launch_async_job() {}

            match woken.recv_timeout(IDLE_TICK) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => {
                    self.shut_down();
                    return;
                }
            }
        }
    }

    fn shut_down(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.kill_uploading();
        self.kill_downloading();
        self.fetch_backups.kill();
        self.upload_snapshot.kill();
        self.download_by_root.kill();
        self.has_sector.kill();
        self.read_sector.kill();
        log::debug!("Worker for host {} stopped", self.host);
    }

    fn try_launch_serial_job(self: &Arc<Self>) {
        if self.serial_job_running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(job) = self.fetch_backups.next() {
            self.launch_serial_job(move |worker| job.execute(worker));
        } else if let Some(job) = self.upload_snapshot.next() {
            self.launch_serial_job(move |worker| job.execute(worker));
        } else if let Some(job) = self.download_by_root.next() {
            self.launch_serial_job(move |worker| job.execute(worker));
        } else if self.has_download_job() {
            self.launch_serial_job(|worker| worker.perform_download_chunk_job());
        } else if self.has_upload_job() {
            self.launch_serial_job(|worker| worker.perform_upload_chunk_job());
        }
    }

    fn launch_serial_job(self: &Arc<Self>, job: impl FnOnce(&Arc<Worker>) + Send + 'static) {
        if self
            .serial_job_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            critical(self.env.config.abort_on_critical, "launching a serial job while another one runs");
            return;
        }
        let guard = match self.env.thread_group.add() {
            Ok(guard) => guard,
            Err(_) => {
                self.serial_job_running.store(false, Ordering::SeqCst);
                return;
            }
        };
        let worker = self.clone();
        thread::spawn(move || {
            let _guard = guard;
            job(&worker);
            worker.serial_job_running.store(false, Ordering::SeqCst);
            worker.wake();
        });
    }

    /// Launch one async job if one is queued and the bandwidth limits allow it.
    fn try_launch_async_job(self: &Arc<Self>) -> bool {
        if let Some(bandwidth) = self.has_sector.peek_bandwidth() {
            if self.bandwidth_available(bandwidth) {
                if let Some(job) = self.has_sector.next() {
                    return self.launch_async_job(job, |job, worker| job.execute(worker));
                }
            }
        }
        if let Some(bandwidth) = self.read_sector.peek_bandwidth() {
            if self.bandwidth_available(bandwidth) {
                if let Some(job) = self.read_sector.next() {
                    return self.launch_async_job(job, |job, worker| job.execute(worker));
                }
            }
        }
        false
    }

    /// Whether a job moving `(upload, download)` bytes fits under the limits. The first job always fits,
    /// so that a job larger than a limit still runs eventually.
    fn bandwidth_available(&self, (upload, download): (u64, u64)) -> bool {
        let read = self.read_outstanding.load(Ordering::SeqCst);
        let write = self.write_outstanding.load(Ordering::SeqCst);
        let read_ok = read == 0 || read + download <= self.env.config.max_async_read_bytes;
        let write_ok = write == 0 || write + upload <= self.env.config.max_async_write_bytes;
        read_ok && write_ok
    }

    fn launch_async_job<J: Job>(self: &Arc<Self>, job: J, execute: fn(J, &Arc<Worker>)) -> bool {
        let guard = match self.env.thread_group.add() {
            Ok(guard) => guard,
            Err(err) => {
                job.discard(err);
                return false;
            }
        };
        let (upload, download) = job.expected_bandwidth();
        self.read_outstanding.fetch_add(download, Ordering::SeqCst);
        self.write_outstanding.fetch_add(upload, Ordering::SeqCst);
        self.async_jobs_running.fetch_add(1, Ordering::SeqCst);
        let worker = self.clone();
        thread::spawn(move || {
            let _guard = guard;
            execute(job, &worker);
            worker.read_outstanding.fetch_sub(download, Ordering::SeqCst);
            worker.write_outstanding.fetch_sub(upload, Ordering::SeqCst);
            worker.async_jobs_running.fetch_sub(1, Ordering::SeqCst);
            worker.wake();
        });
        true
    }
}
