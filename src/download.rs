/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Downloading files: fetching enough pieces of each chunk from workers and decoding them.
//!
//! A download chunk is offered to every worker whose host stores a piece of it. Each worker fetches one
//! piece (whole, with a Merkle proof against the piece's root), and the chunk is decoded as soon as
//! `k` pieces arrived. Workers that turn up while `k` fetches are already in flight wait on the standby
//! list and are given the chunk back when a fetch fails.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use crate::erasure::{ErasureCode, ErasureCoder};
use crate::errors::{RenterError, ResultExt};
use crate::events::{DownloadChunkCompleteEvent, Event, EventPublisher};
use crate::filesystem::path::SiaPath;
use crate::filesystem::{FileNode, FileSystem};
use crate::memory::{MemoryGrant, MemoryManager};
use crate::types::data_types::{HostPublicKey, SectorRoot};
use crate::worker::job_queue::CancelToken;
use crate::worker::Worker;
use crate::worker_pool::WorkerPool;

/// What a worker gets when it takes a download chunk out of its queue.
pub(crate) enum DownloadClaim {
    Piece(usize, SectorRoot),
    Standby,
    Drop,
}

struct DownloadChunkState {
    pieces: Vec<Option<Vec<u8>>>,
    /// Pieces fetched or being fetched.
    piece_usage: Vec<bool>,
    pieces_completed: usize,
    pieces_registered: usize,
    workers_remaining: usize,
    standby: Vec<Arc<Worker>>,
    memory: Option<MemoryGrant>,
    outcome: Option<Result<Vec<u8>, String>>,
}

pub struct UnfinishedDownloadChunk {
    path: SiaPath,
    index: u64,
    erasure_code: ErasureCode,
    piece_size: u64,
    /// Piece indices and roots held by each host.
    piece_map: HashMap<HostPublicKey, Vec<(usize, SectorRoot)>>,
    /// Byte range of the decoded chunk the caller wants.
    fetch_offset: u64,
    fetch_length: u64,
    cancel: CancelToken,
    event_publisher: EventPublisher,
    state: Mutex<DownloadChunkState>,
    finished: Condvar,
}

impl UnfinishedDownloadChunk {
    pub(crate) fn new(
        file: &FileNode,
        index: u64,
        fetch_offset: u64,
        fetch_length: u64,
        memory: Option<MemoryGrant>,
        event_publisher: EventPublisher,
    ) -> Result<Arc<UnfinishedDownloadChunk>, RenterError> {
        let (erasure_code, piece_size, piece_map) = file.read(|f| {
            let mut piece_map: HashMap<HostPublicKey, Vec<(usize, SectorRoot)>> = HashMap::new();
            for (piece_index, copies) in f.pieces(index)?.iter().enumerate() {
                for record in copies {
                    piece_map.entry(record.host).or_default().push((piece_index, record.root));
                }
            }
            Ok::<_, RenterError>((f.erasure_code(), f.piece_size(), piece_map))
        })?;
        let num_pieces = erasure_code.num_pieces();
        Ok(Arc::new(UnfinishedDownloadChunk {
            path: file.path(),
            index,
            erasure_code,
            piece_size,
            piece_map,
            fetch_offset,
            fetch_length,
            cancel: CancelToken::new(),
            event_publisher,
            state: Mutex::new(DownloadChunkState {
                pieces: vec![None; num_pieces],
                piece_usage: vec![false; num_pieces],
                pieces_completed: 0,
                pieces_registered: 0,
                workers_remaining: 0,
                standby: Vec::new(),
                memory,
                outcome: None,
            }),
            finished: Condvar::new(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, DownloadChunkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn path(&self) -> &SiaPath {
        &self.path
    }

    pub(crate) fn piece_size(&self) -> u64 {
        self.piece_size
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        let state = self.lock();
        self.clean_up(state);
    }

    /// Whether `host` stores a piece of this chunk.
    pub(crate) fn is_candidate(&self, host: &HostPublicKey) -> bool {
        self.piece_map.contains_key(host)
    }

    /// Number of distinct pieces stored with any of `hosts`.
    fn reachable_pieces(&self, hosts: &[HostPublicKey]) -> usize {
        let mut reachable = vec![false; self.erasure_code.num_pieces()];
        for host in hosts {
            for (piece_index, _) in self.piece_map.get(host).into_iter().flatten() {
                reachable[*piece_index] = true;
            }
        }
        reachable.iter().filter(|r| **r).count()
    }

    pub(crate) fn claim_piece(&self, worker: &Arc<Worker>) -> DownloadClaim {
        let mut state = self.lock();
        let candidates = match self.piece_map.get(&worker.host()) {
            Some(candidates) if state.outcome.is_none() && !self.cancel.is_cancelled() => candidates,
            _ => {
                drop(state);
                self.drop_worker();
                return DownloadClaim::Drop;
            }
        };
        let k = self.erasure_code.min_pieces();
        if state.pieces_completed + state.pieces_registered >= k {
            state.standby.push(worker.clone());
            return DownloadClaim::Standby;
        }
        match candidates.iter().find(|(piece_index, _)| !state.piece_usage[*piece_index]) {
            Some((piece_index, root)) => {
                let (piece_index, root) = (*piece_index, *root);
                state.piece_usage[piece_index] = true;
                state.pieces_registered += 1;
                state.workers_remaining -= 1;
                DownloadClaim::Piece(piece_index, root)
            }
            None => {
                // Every piece this host has is being fetched elsewhere. Wait in case a fetch fails.
                let in_flight = candidates
                    .iter()
                    .any(|(piece_index, _)| state.piece_usage[*piece_index] && state.pieces[*piece_index].is_none());
                if in_flight {
                    state.standby.push(worker.clone());
                    DownloadClaim::Standby
                } else {
                    drop(state);
                    self.drop_worker();
                    DownloadClaim::Drop
                }
            }
        }
    }

    pub(crate) fn piece_downloaded(&self, piece_index: usize, data: Vec<u8>) {
        let mut state = self.lock();
        state.pieces_registered -= 1;
        if state.outcome.is_none() {
            state.pieces[piece_index] = Some(data);
            state.pieces_completed += 1;
        }
        self.clean_up(state);
    }

    pub(crate) fn piece_failed(self: &Arc<Self>, piece_index: usize) {
        let standby = {
            let mut state = self.lock();
            state.pieces_registered -= 1;
            state.piece_usage[piece_index] = false;
            let standby = std::mem::take(&mut state.standby);
            self.clean_up(state);
            standby
        };
        for worker in standby {
            worker.queue_download_chunk(self.clone());
        }
    }

    pub(crate) fn drop_worker(&self) {
        let mut state = self.lock();
        state.workers_remaining = state.workers_remaining.saturating_sub(1);
        self.clean_up(state);
    }

    fn clean_up(&self, mut state: MutexGuard<'_, DownloadChunkState>) {
        if state.outcome.is_some() {
            return;
        }
        let k = self.erasure_code.min_pieces();
        let outcome = if state.pieces_completed >= k {
            let length = (k as u64 * self.piece_size) as usize;
            self.erasure_code
                .coder()
                .recover(&state.pieces, length)
                .map(|data| {
                    let start = self.fetch_offset as usize;
                    let end = (self.fetch_offset + self.fetch_length) as usize;
                    data[start..end.min(data.len())].to_vec()
                })
                .map_err(|err| err.to_string())
        } else if self.cancel.is_cancelled() {
            Err(RenterError::Cancelled.to_string())
        } else if state.pieces_registered == 0 && state.workers_remaining == 0 {
            Err(format!(
                "only {} of {} needed pieces could be downloaded",
                state.pieces_completed, k
            ))
        } else {
            return;
        };

        let bytes = outcome.as_ref().map(|data| data.len() as u64).ok();
        state.outcome = Some(outcome);
        state.memory = None;
        state.pieces = vec![None; self.erasure_code.num_pieces()];
        state.standby.clear();
        drop(state);

        if let Some(bytes) = bytes {
            Event::publish(
                &self.event_publisher,
                Event::DownloadChunkComplete(DownloadChunkCompleteEvent {
                    timestamp: SystemTime::now(),
                    path: self.path.to_string(),
                    chunk_index: self.index,
                    bytes,
                }),
            );
        }
        self.finished.notify_all();
    }

    /// Block until the chunk is decoded or failed, or until `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Result<Vec<u8>, RenterError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(outcome) = state.outcome.as_ref() {
                return outcome.clone().map_err(|err| {
                    RenterError::Transient(err).add_context(format!("downloading chunk {} of {}", self.index, self.path))
                });
            }
            let now = Instant::now();
            if now >= deadline {
                drop(state);
                self.cancel.cancel();
                return Err(RenterError::Timeout);
            }
            state = self
                .finished
                .wait_timeout(state, deadline - now)
                .map(|(state, _)| state)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

/// Fetches files and sectors through the worker pool.
pub struct Downloader {
    fs: Arc<FileSystem>,
    pool: Arc<WorkerPool>,
    memory: Arc<MemoryManager>,
    event_publisher: EventPublisher,
    timeout: Duration,
}

impl Downloader {
    pub(crate) fn new(
        fs: Arc<FileSystem>,
        pool: Arc<WorkerPool>,
        memory: Arc<MemoryManager>,
        event_publisher: EventPublisher,
        timeout: Duration,
    ) -> Downloader {
        Downloader {
            fs,
            pool,
            memory,
            event_publisher,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Write `length` bytes of the file at `path`, starting at `offset`, to `out`. `None` downloads up to
    /// the end of the file. Returns the number of bytes written.
    pub fn download(&self, path: &SiaPath, offset: u64, length: Option<u64>, out: &mut impl Write) -> Result<u64, RenterError> {
        let file = self.fs.open_file(path)?;
        let (size, chunk_size) = file.read(|f| (f.size(), f.chunk_size()));
        if offset > size {
            return Err(RenterError::InvalidArgument(format!(
                "offset {} is beyond the end of {} ({} bytes)",
                offset, path, size
            )));
        }
        let length = length.unwrap_or(size - offset);
        if offset + length > size {
            return Err(RenterError::InvalidArgument(format!(
                "cannot download {} bytes at {} of {} ({} bytes)",
                length, offset, path, size
            )));
        }

        let mut written = 0;
        while written < length {
            let position = offset + written;
            let index = position / chunk_size;
            let in_chunk = position % chunk_size;
            let wanted = (chunk_size - in_chunk).min(length - written);
            let data = self
                .download_chunk(&file, index, in_chunk, wanted, true)
                .context(format!("downloading {}", path))?;
            if data.len() as u64 != wanted {
                return Err(RenterError::Critical(format!(
                    "chunk {} of {} decoded to {} bytes instead of {}",
                    index,
                    path,
                    data.len(),
                    wanted
                )));
            }
            out.write_all(&data).context(format!("writing {}", path))?;
            written += data.len() as u64;
        }
        Ok(written)
    }

    /// Fetch `length` bytes at `offset` of chunk `index` of `file`.
    pub(crate) fn download_chunk(
        &self,
        file: &FileNode,
        index: u64,
        offset: u64,
        length: u64,
        priority: bool,
    ) -> Result<Vec<u8>, RenterError> {
        let chunk = self.start_chunk(file, index, offset, length, priority)?;
        chunk.wait(self.timeout)
    }

    fn start_chunk(
        &self,
        file: &FileNode,
        index: u64,
        offset: u64,
        length: u64,
        priority: bool,
    ) -> Result<Arc<UnfinishedDownloadChunk>, RenterError> {
        let (min_pieces, piece_size) = file.read(|f| (f.erasure_code().min_pieces() as u64, f.piece_size()));
        let memory = self.memory.request(min_pieces * piece_size, priority)?;
        let chunk = UnfinishedDownloadChunk::new(file, index, offset, length, Some(memory), self.event_publisher.clone())?;

        let workers: Vec<Arc<Worker>> = self
            .pool
            .workers()
            .into_iter()
            .filter(|worker| chunk.is_candidate(&worker.host()))
            .collect();
        let hosts: Vec<HostPublicKey> = workers.iter().map(|worker| worker.host()).collect();
        let reachable = chunk.reachable_pieces(&hosts);
        if reachable < min_pieces as usize {
            return Err(RenterError::Transient(format!(
                "chunk {} of {} has {} reachable pieces, {} are needed",
                index,
                file.path(),
                reachable,
                min_pieces
            )));
        }
        chunk.lock().workers_remaining = workers.len();
        for worker in workers {
            worker.queue_download_chunk(chunk.clone());
        }
        Ok(chunk)
    }

    /// Fetch `length` bytes at `offset` of the sector with `root` from any host that stores it.
    pub fn download_by_root(&self, root: &SectorRoot, offset: u64, length: u64) -> Result<Vec<u8>, RenterError> {
        self.pool.download_by_root(root, offset, length, self.timeout)
    }
}
