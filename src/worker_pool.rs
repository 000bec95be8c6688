/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The set of workers, one per host the renter holds a contract with.
//!
//! The pool follows the contractor: [`WorkerPool::update`] starts a worker for every host with a
//! contract and kills the workers whose host no longer has one. It runs whenever the updater thread
//! wakes up, which happens periodically and after every contract maintenance.
//!
//! The pool also fans jobs out over its workers for callers that do not care which host serves them,
//! such as downloads by sector root and snapshot table reads.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::contractor::Contractor;
use crate::errors::{NotFoundKind, RenterError};
use crate::filesystem::siafile::HealthContext;
use crate::types::data_types::{HostPublicKey, SectorRoot};
use crate::worker::job_queue::CancelToken;
use crate::worker::jobs::{DownloadByRootJob, FetchBackupsJob, HasSectorJob, ReadSectorJob, UploadSnapshotJob};
use crate::worker::snapshot::SnapshotEntry;
use crate::worker::status::WorkerPoolStatus;
use crate::worker::{Worker, WorkerEnvironment};

pub struct WorkerPool {
    env: Arc<WorkerEnvironment>,
    workers: RwLock<HashMap<HostPublicKey, Arc<Worker>>>,
    update_trigger: Mutex<Option<Sender<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(env: Arc<WorkerEnvironment>) -> Arc<WorkerPool> {
        Arc::new(WorkerPool {
            env,
            workers: RwLock::new(HashMap::new()),
            update_trigger: Mutex::new(None),
        })
    }

    pub fn contractor(&self) -> &Arc<Contractor> {
        &self.env.contractor
    }

    /// Start and kill workers until there is exactly one per contract.
    pub fn update(&self) {
        if self.env.thread_group.is_stopped() {
            return;
        }
        let hosts: HashSet<HostPublicKey> = self
            .env
            .contractor
            .contracts()
            .into_iter()
            .map(|contract| contract.host)
            .collect();
        let mut workers = self.workers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        workers.retain(|host, worker| {
            if hosts.contains(host) && !worker.is_killed() {
                return true;
            }
            log::debug!("Killing worker for host {}", host);
            worker.kill();
            false
        });
        for host in hosts {
            if workers.contains_key(&host) {
                continue;
            }
            log::debug!("Starting worker for host {}", host);
            let worker = Worker::new(host, self.env.clone());
            worker.start();
            workers.insert(host, worker);
        }
        for worker in workers.values() {
            worker.refresh_cache();
        }
    }

    /// Ask the updater thread to run [`update`](Self::update) soon.
    pub fn trigger_update(&self) {
        if let Some(trigger) = self.update_trigger.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).as_ref() {
            let _ = trigger.send(());
        }
    }

    /// Start the thread that keeps the pool in line with the contractor.
    pub(crate) fn start_updater(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let (trigger, triggered): (Sender<()>, Receiver<()>) = mpsc::channel();
        *self.update_trigger.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(trigger);
        let pool = self.clone();
        thread::spawn(move || loop {
            if pool.env.thread_group.is_stopped() {
                pool.kill_all();
                return;
            }
            pool.update();
            match triggered.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        })
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn worker(&self, host: &HostPublicKey) -> Result<Arc<Worker>, RenterError> {
        self.workers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(host)
            .cloned()
            .ok_or(RenterError::NotFound(NotFoundKind::Worker(*host)))
    }

    pub fn len(&self) -> usize {
        self.workers.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status of every worker, ordered by host.
    pub fn status(&self) -> WorkerPoolStatus {
        let mut workers: Vec<_> = self.workers().iter().map(|worker| worker.status()).collect();
        workers.sort_by(|a, b| a.host.cmp(&b.host));
        WorkerPoolStatus::new(workers)
    }

    pub fn kill_all(&self) {
        let workers: Vec<Arc<Worker>> = self
            .workers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .map(|(_, worker)| worker)
            .collect();
        for worker in workers {
            worker.kill();
        }
    }

    /// The hosts whose pieces count towards file health: hosts of contracts that are good for renew and
    /// that were reachable on their last scan.
    pub fn health_context(&self) -> HealthContext {
        let hostdb = &self.env.hostdb;
        HealthContext::new(
            self.env
                .contractor
                .contracts()
                .into_iter()
                .filter(|contract| contract.utility.good_for_renew && !contract.utility.bad_contract)
                .map(|contract| contract.host)
                .filter(|host| {
                    hostdb.host(host).map_or(true, |(entry, _)| {
                        entry.scan_history.last().map_or(true, |scan| scan.success)
                    })
                }),
        )
    }

    /// Hosts that report storing `root`, in the order they answered.
    pub fn has_sector(&self, root: &SectorRoot, timeout: Duration) -> Result<Vec<HostPublicKey>, RenterError> {
        let cancel = CancelToken::new();
        let (response, responses) = mpsc::channel();
        let mut outstanding = 0;
        for worker in self.workers() {
            worker.queue_has_sector(HasSectorJob::new(worker.host(), *root, cancel.clone(), response.clone()));
            outstanding += 1;
        }
        drop(response);

        let deadline = Instant::now() + timeout;
        let mut hosts = Vec::new();
        while outstanding > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match responses.recv_timeout(remaining) {
                Ok((host, Ok(true))) => hosts.push(host),
                Ok((_, Ok(false))) => (),
                Ok((host, Err(err))) => log::debug!("Host {} could not be asked for sector {}: {}", host, root, err),
                Err(_) => break,
            }
            outstanding -= 1;
        }
        cancel.cancel();
        Ok(hosts)
    }

    /// Fetch `length` bytes at `offset` of the sector with `root` from whichever host has it. Hosts are
    /// asked whether they store the sector first, and the first to answer yes is downloaded from; if
    /// that download fails, the next host that answered yes is tried.
    pub fn download_by_root(
        &self,
        root: &SectorRoot,
        offset: u64,
        length: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, RenterError> {
        let deadline = Instant::now() + timeout;
        let cancel = CancelToken::new();
        let (has_response, has_responses) = mpsc::channel();
        let mut outstanding = 0;
        for worker in self.workers() {
            worker.queue_has_sector(HasSectorJob::new(worker.host(), *root, cancel.clone(), has_response.clone()));
            outstanding += 1;
        }
        drop(has_response);

        let mut errors = Vec::new();
        while outstanding > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let host = match has_responses.recv_timeout(remaining) {
                Ok((host, Ok(true))) => host,
                Ok((_, Ok(false))) => {
                    outstanding -= 1;
                    continue;
                }
                Ok((host, Err(err))) => {
                    errors.push(Some(err.add_context(format!("asking host {} for sector {}", host, root))));
                    outstanding -= 1;
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {
                    cancel.cancel();
                    return Err(RenterError::Timeout);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            outstanding -= 1;

            let worker = match self.worker(&host) {
                Ok(worker) => worker,
                Err(_) => continue,
            };
            let (response, data) = mpsc::channel();
            worker.queue_download_by_root(DownloadByRootJob {
                root: *root,
                offset,
                length,
                cancel: cancel.clone(),
                response,
            });
            let remaining = deadline.saturating_duration_since(Instant::now());
            match data.recv_timeout(remaining) {
                Ok(Ok(data)) => {
                    cancel.cancel();
                    return Ok(data);
                }
                Ok(Err(err)) => errors.push(Some(err.add_context(format!("downloading sector {} from {}", root, host)))),
                Err(RecvTimeoutError::Timeout) => {
                    cancel.cancel();
                    return Err(RenterError::Timeout);
                }
                Err(RecvTimeoutError::Disconnected) => (),
            }
        }
        cancel.cancel();
        let not_found = RenterError::NotFound(NotFoundKind::Sector(*root));
        Err(match RenterError::compose(errors) {
            Some(err) => not_found.add_context(err.to_string()),
            None => not_found,
        })
    }

    /// Read `length` bytes at `offset` of the sector with `root` from `host`.
    pub fn read_sector(
        &self,
        host: &HostPublicKey,
        root: &SectorRoot,
        offset: u64,
        length: u64,
        cancel: CancelToken,
    ) -> Result<Receiver<Result<Vec<u8>, RenterError>>, RenterError> {
        let worker = self.worker(host)?;
        let (response, data) = mpsc::channel();
        worker.queue_read_sector(ReadSectorJob {
            root: *root,
            offset,
            length,
            cancel,
            response,
        });
        Ok(data)
    }

    /// Snapshot tables of every host, merged. Entries with the same UID are the same backup.
    pub fn fetch_backups(&self, timeout: Duration) -> Result<Vec<SnapshotEntry>, RenterError> {
        let cancel = CancelToken::new();
        let (response, responses) = mpsc::channel();
        let mut outstanding = 0;
        for worker in self.workers() {
            worker.queue_fetch_backups(FetchBackupsJob::new(worker.host(), cancel.clone(), response.clone()));
            outstanding += 1;
        }
        drop(response);

        let deadline = Instant::now() + timeout;
        let mut merged: HashMap<[u8; 16], SnapshotEntry> = HashMap::new();
        let mut errors = Vec::new();
        let mut answered = 0;
        while outstanding > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match responses.recv_timeout(remaining) {
                Ok((_, Ok(entries))) => {
                    answered += 1;
                    for entry in entries {
                        merged.entry(entry.uid).or_insert(entry);
                    }
                }
                Ok((host, Err(err))) => errors.push(Some(err.add_context(format!("fetching backups from {}", host)))),
                Err(_) => break,
            }
            outstanding -= 1;
        }
        cancel.cancel();
        if answered == 0 {
            if let Some(err) = RenterError::compose(errors) {
                return Err(err);
            }
        }
        let mut entries: Vec<SnapshotEntry> = merged.into_values().collect();
        entries.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    /// Write `entry` to the snapshot table of every worker whose contract is good for upload. Returns the
    /// number of hosts that stored it.
    pub fn upload_snapshot(&self, entry: &SnapshotEntry, timeout: Duration) -> Result<usize, RenterError> {
        let cancel = CancelToken::new();
        let mut pending = Vec::new();
        for worker in self.workers() {
            if !worker.cache().utility.good_for_upload {
                continue;
            }
            let (response, result) = mpsc::channel();
            worker.queue_upload_snapshot(UploadSnapshotJob {
                entry: entry.clone(),
                cancel: cancel.clone(),
                response,
            });
            pending.push((worker.host(), result));
        }

        let deadline = Instant::now() + timeout;
        let mut stored = 0;
        let mut errors = Vec::new();
        for (host, result) in pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match result.recv_timeout(remaining) {
                Ok(Ok(())) => stored += 1,
                Ok(Err(err)) => errors.push(Some(err.add_context(format!("uploading snapshot table to {}", host)))),
                Err(_) => errors.push(Some(RenterError::Timeout.add_context(format!("uploading snapshot table to {}", host)))),
            }
        }
        cancel.cancel();
        match (stored, RenterError::compose(errors)) {
            (0, Some(err)) => Err(err),
            _ => Ok(stored),
        }
    }
}
