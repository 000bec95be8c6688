/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Uploading files: splitting a stream into chunks, erasure coding them, and handing the pieces to
//! workers.
//!
//! ## Unfinished chunks
//!
//! Every chunk on its way to hosts is an [`UnfinishedUploadChunk`] shared by all workers it was offered
//! to. A worker that takes the chunk out of its queue claims one piece of it, uploads that piece, and is
//! done with the chunk. Each host receives at most one piece of a chunk. A worker whose host could take
//! a piece, but finds every remaining piece already in flight on other workers, parks on the chunk's
//! standby list; if one of those uploads fails, the standby workers get the chunk back.
//!
//! A chunk finishes once nothing is in flight and either every piece it needs is uploaded or no worker
//! is left to take one. A chunk that finishes with pieces missing is marked stuck, so that the repair
//! loop picks it up later.
//!
//! ## Memory
//!
//! Before a chunk is encoded, the memory for all of its pieces is taken from the
//! [memory manager](crate::memory). Each uploaded piece hands its share back at once, which bounds the
//! bytes held by chunks in flight and makes fast streams wait for slow hosts.

use std::collections::HashSet;
use std::io::Read;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::SystemTime;

use typed_builder::TypedBuilder;

use crate::erasure::{ErasureCode, ErasureCoder};
use crate::errors::{RenterError, ResultExt};
use crate::events::{Event, EventPublisher, UploadChunkCompleteEvent};
use crate::filesystem::path::SiaPath;
use crate::filesystem::siafile::{CipherType, FileParams};
use crate::filesystem::{now_secs, FileNode, FileSystem};
use crate::memory::{MemoryGrant, MemoryManager};
use crate::types::constants::{SECTOR_SIZE, SEGMENT_SIZE};
use crate::types::data_types::HostPublicKey;
use crate::worker::job_queue::CancelToken;
use crate::worker::Worker;
use crate::worker_pool::WorkerPool;

/// How a new file is uploaded.
#[derive(Clone, Debug, TypedBuilder)]
pub struct FileUploadParams {
    #[builder(setter(doc = "Set the path the file is uploaded to. Required."))]
    pub path: SiaPath,
    #[builder(default = ErasureCode::DEFAULT, setter(doc = "Set the erasure code of the file's chunks."))]
    pub erasure_code: ErasureCode,
    #[builder(default = SECTOR_SIZE, setter(doc = "Set the size of one piece. A multiple of 64 bytes of at most one sector."))]
    pub piece_size: u64,
    #[builder(default = false, setter(doc = "Replace an existing file at the same path."))]
    pub force: bool,
    #[builder(default = false, setter(doc = "Mark the file as never sharing its last chunk with other files."))]
    pub disable_partial_upload: bool,
    #[builder(default = true, setter(doc = "Keep repairing the file from `source` once it is uploaded."))]
    pub repair: bool,
    #[builder(default = CipherType::Plaintext, setter(doc = "Set the cipher the pieces are stored with."))]
    pub cipher_type: CipherType,
    #[builder(default = 0o644, setter(doc = "Set the unix permission bits of the file."))]
    pub mode: u32,
    #[builder(default, setter(doc = "Set the local path the stream is read from, used for repairs."))]
    pub source: String,
    #[builder(default = false, setter(doc = "Take memory from the priority pool."))]
    pub priority: bool,
}

impl FileUploadParams {
    fn validate(&self) -> Result<(), RenterError> {
        if self.piece_size == 0 || self.piece_size % SEGMENT_SIZE != 0 || self.piece_size > SECTOR_SIZE {
            return Err(RenterError::InvalidArgument(format!(
                "piece size {} is not a positive multiple of {} of at most {}",
                self.piece_size, SEGMENT_SIZE, SECTOR_SIZE
            )));
        }
        if self.path.is_root() {
            return Err(RenterError::InvalidArgument("cannot upload to the root directory".into()));
        }
        Ok(())
    }
}

/// What a worker gets when it takes a chunk out of its queue.
pub(crate) enum PieceClaim {
    /// Upload piece `.0` with data `.1`.
    Piece(usize, Vec<u8>),
    /// Every remaining piece is in flight elsewhere. The worker was parked on the standby list.
    Standby,
    /// The chunk has nothing for this worker. It no longer counts the worker.
    Drop,
}

/// How an upload chunk ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadChunkOutcome {
    pub pieces_completed: usize,
    pub pieces_needed: usize,
    /// Pieces of the chunk on good hosts once the upload ended, old copies included.
    pub available_pieces: usize,
    pub min_pieces: usize,
}

impl UploadChunkOutcome {
    pub fn complete(&self) -> bool {
        self.pieces_completed >= self.pieces_needed
    }

    /// Whether enough pieces are stored to recover the chunk.
    pub fn available(&self) -> bool {
        self.available_pieces >= self.min_pieces
    }
}

struct UploadChunkState {
    /// Data of every piece that still has to be uploaded, indexed by piece index. Claimed pieces are
    /// taken out and given back if their upload fails.
    pieces: Vec<Option<Vec<u8>>>,
    pieces_needed: usize,
    pieces_completed: usize,
    pieces_registered: usize,
    unused_hosts: HashSet<HostPublicKey>,
    workers_remaining: usize,
    standby: Vec<Arc<Worker>>,
    memory: Option<MemoryGrant>,
    outcome: Option<UploadChunkOutcome>,
}

pub struct UnfinishedUploadChunk {
    file: FileNode,
    index: u64,
    piece_size: u64,
    min_pieces: usize,
    /// Pieces already on good hosts before this upload started.
    existing_pieces: usize,
    cancel: CancelToken,
    event_publisher: EventPublisher,
    state: Mutex<UploadChunkState>,
    finished: Condvar,
}

impl UnfinishedUploadChunk {
    /// A chunk that uploads the pieces of `pieces` that are `Some` to hosts outside `used_hosts`.
    pub(crate) fn new(
        file: FileNode,
        index: u64,
        pieces: Vec<Option<Vec<u8>>>,
        existing_pieces: usize,
        used_hosts: &HashSet<HostPublicKey>,
        workers: &[Arc<Worker>],
        memory: Option<MemoryGrant>,
        event_publisher: EventPublisher,
    ) -> Arc<UnfinishedUploadChunk> {
        let (piece_size, min_pieces) = file.read(|f| (f.piece_size(), f.erasure_code().min_pieces()));
        let pieces_needed = pieces.iter().filter(|piece| piece.is_some()).count();
        let unused_hosts = workers
            .iter()
            .map(|worker| worker.host())
            .filter(|host| !used_hosts.contains(host))
            .collect();
        Arc::new(UnfinishedUploadChunk {
            file,
            index,
            piece_size,
            min_pieces,
            existing_pieces,
            cancel: CancelToken::new(),
            event_publisher,
            state: Mutex::new(UploadChunkState {
                pieces,
                pieces_needed,
                pieces_completed: 0,
                pieces_registered: 0,
                unused_hosts,
                workers_remaining: workers.len(),
                standby: Vec::new(),
                memory,
                outcome: None,
            }),
            finished: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, UploadChunkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn file(&self) -> &FileNode {
        &self.file
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether `host` may still receive a piece of this chunk.
    pub(crate) fn is_candidate(&self, host: &HostPublicKey) -> bool {
        let state = self.lock();
        state.outcome.is_none() && state.unused_hosts.contains(host)
    }

    pub(crate) fn claim_piece(&self, worker: &Arc<Worker>) -> PieceClaim {
        let mut state = self.lock();
        if state.outcome.is_some() || self.cancel.is_cancelled() || !state.unused_hosts.contains(&worker.host()) {
            drop(state);
            self.drop_worker();
            return PieceClaim::Drop;
        }
        if state.pieces_completed + state.pieces_registered >= state.pieces_needed {
            state.standby.push(worker.clone());
            return PieceClaim::Standby;
        }
        let claimed = state
            .pieces
            .iter_mut()
            .enumerate()
            .find_map(|(index, piece)| piece.take().map(|data| (index, data)));
        match claimed {
            Some((index, data)) => {
                state.unused_hosts.remove(&worker.host());
                state.pieces_registered += 1;
                state.workers_remaining -= 1;
                PieceClaim::Piece(index, data)
            }
            None => {
                state.standby.push(worker.clone());
                PieceClaim::Standby
            }
        }
    }

    pub(crate) fn piece_uploaded(&self) {
        let mut state = self.lock();
        state.pieces_completed += 1;
        state.pieces_registered -= 1;
        let piece_size = self.piece_size;
        if let Some(memory) = state.memory.as_mut() {
            memory.release(piece_size);
        }
        self.clean_up(state);
    }

    /// Give piece `index` back after its upload failed, and offer the chunk to the standby workers again.
    pub(crate) fn piece_failed(self: &Arc<Self>, index: usize, data: Vec<u8>) {
        let standby = {
            let mut state = self.lock();
            state.pieces[index] = Some(data);
            state.pieces_registered -= 1;
            let standby = std::mem::take(&mut state.standby);
            self.clean_up(state);
            standby
        };
        for worker in standby {
            worker.queue_upload_chunk(self.clone());
        }
    }

    /// Forget a worker that will not take a piece.
    pub(crate) fn drop_worker(&self) {
        let mut state = self.lock();
        state.workers_remaining = state.workers_remaining.saturating_sub(1);
        self.clean_up(state);
    }

    /// Finish the chunk if nothing more can happen to it.
    fn clean_up(&self, mut state: MutexGuard<'_, UploadChunkState>) {
        if state.outcome.is_some() || state.pieces_registered > 0 {
            return;
        }
        let complete = state.pieces_completed >= state.pieces_needed;
        if !complete && state.workers_remaining > 0 && !self.cancel.is_cancelled() {
            return;
        }
        let standby = std::mem::take(&mut state.standby);
        state.workers_remaining = state.workers_remaining.saturating_sub(standby.len());
        state.memory = None;
        for piece in state.pieces.iter_mut() {
            *piece = None;
        }
        let outcome = UploadChunkOutcome {
            pieces_completed: state.pieces_completed,
            pieces_needed: state.pieces_needed,
            available_pieces: self.existing_pieces + state.pieces_completed,
            min_pieces: self.min_pieces,
        };
        state.outcome = Some(outcome);
        drop(state);

        let stuck = !outcome.complete();
        if let Err(err) = self.file.set_stuck(self.index, stuck) {
            log::warn!("Failed to update stuck status of chunk {} of {}: {}", self.index, self.file.path(), err);
        }
        if stuck {
            log::debug!(
                "Chunk {} of {} finished with {} of {} pieces",
                self.index,
                self.file.path(),
                outcome.pieces_completed,
                outcome.pieces_needed
            );
        }
        Event::publish(
            &self.event_publisher,
            Event::UploadChunkComplete(UploadChunkCompleteEvent {
                timestamp: SystemTime::now(),
                path: self.file.path().to_string(),
                chunk_index: self.index,
                pieces_completed: outcome.pieces_completed as u64,
                stuck,
            }),
        );
        self.finished.notify_all();
    }

    /// Block until the chunk finished.
    pub fn wait(&self) -> UploadChunkOutcome {
        let mut state = self.lock();
        loop {
            if let Some(outcome) = state.outcome {
                return outcome;
            }
            state = self
                .finished
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// The outcome, if the chunk finished.
    pub fn outcome(&self) -> Option<UploadChunkOutcome> {
        self.lock().outcome
    }
}

/// Turns byte streams into chunks on workers.
pub struct Uploader {
    fs: Arc<FileSystem>,
    pool: Arc<WorkerPool>,
    memory: Arc<MemoryManager>,
    event_publisher: EventPublisher,
}

impl Uploader {
    pub(crate) fn new(
        fs: Arc<FileSystem>,
        pool: Arc<WorkerPool>,
        memory: Arc<MemoryManager>,
        event_publisher: EventPublisher,
    ) -> Uploader {
        Uploader {
            fs,
            pool,
            memory,
            event_publisher,
        }
    }

    pub(crate) fn file_system(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    pub(crate) fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Upload everything `reader` yields to a new file. Returns once every chunk finished, with an error
    /// if any chunk did not reach enough pieces to be recovered.
    pub fn upload_stream(&self, params: FileUploadParams, reader: &mut impl Read) -> Result<FileNode, RenterError> {
        params.validate()?;
        if self.pool.contractor().allowance().is_cancelled() {
            return Err(RenterError::InvalidArgument("cannot upload without an allowance".into()));
        }
        let file = self
            .fs
            .new_file(
                &params.path,
                FileParams {
                    source: if params.repair { params.source.clone() } else { String::new() },
                    erasure_code: params.erasure_code,
                    cipher_type: params.cipher_type,
                    piece_size: params.piece_size,
                    size: 0,
                    mode: params.mode,
                    disable_partial_upload: params.disable_partial_upload,
                },
                params.force,
            )
            .context(format!("creating {}", params.path))?;

        let result = self.upload_chunks(&file, &params, reader);
        let bubbled = params
            .path
            .dir()
            .map_err(RenterError::from)
            .and_then(|dir| self.fs.bubble(&dir, &self.pool.health_context()));
        if let Err(err) = bubbled {
            log::debug!("Failed to bubble {} after upload: {}", params.path, err);
        }
        result.map(|()| file)
    }

    fn upload_chunks(&self, file: &FileNode, params: &FileUploadParams, reader: &mut impl Read) -> Result<(), RenterError> {
        let chunk_size = params.piece_size * params.erasure_code.min_pieces() as u64;
        let mut chunks = Vec::new();
        let mut size = 0u64;
        loop {
            let mut data = Vec::with_capacity(chunk_size as usize);
            reader
                .by_ref()
                .take(chunk_size)
                .read_to_end(&mut data)
                .context(format!("reading chunk {} of {}", chunks.len(), params.path))?;
            if data.is_empty() {
                break;
            }
            size += data.len() as u64;
            let index = chunks.len() as u64;
            file.update(|f| {
                f.set_size(size, now_secs());
                Ok(())
            })?;
            let last = (data.len() as u64) < chunk_size;
            chunks.push(self.upload_chunk(file, index, &data, params.priority)?);
            if last {
                break;
            }
        }

        let mut failed = Vec::new();
        for chunk in &chunks {
            let outcome = chunk.wait();
            if !outcome.available() {
                failed.push(Some(RenterError::Transient(format!(
                    "chunk {} of {} reached only {} of {} needed pieces",
                    chunk.index(),
                    params.path,
                    outcome.available_pieces,
                    outcome.min_pieces
                ))));
            }
        }
        match RenterError::compose(failed) {
            Some(err) => Err(err.add_context(format!("uploading {}", params.path))),
            None => Ok(()),
        }
    }

    /// Encode `data` as chunk `index` of `file` and offer every piece to the workers.
    pub(crate) fn upload_chunk(
        &self,
        file: &FileNode,
        index: u64,
        data: &[u8],
        priority: bool,
    ) -> Result<Arc<UnfinishedUploadChunk>, RenterError> {
        let (erasure_code, piece_size) = file.read(|f| (f.erasure_code(), f.piece_size()));
        let memory = self.memory.request(erasure_code.num_pieces() as u64 * piece_size, priority)?;
        let pieces = erasure_code.coder().encode(data, piece_size as usize)?;
        Ok(self.submit(file.clone(), index, pieces.into_iter().map(Some).collect(), 0, &HashSet::new(), memory))
    }

    /// Hand a chunk whose pieces are already encoded to every worker.
    pub(crate) fn submit(
        &self,
        file: FileNode,
        index: u64,
        pieces: Vec<Option<Vec<u8>>>,
        existing_pieces: usize,
        used_hosts: &HashSet<HostPublicKey>,
        memory: MemoryGrant,
    ) -> Arc<UnfinishedUploadChunk> {
        let workers = self.pool.workers();
        let chunk = UnfinishedUploadChunk::new(
            file,
            index,
            pieces,
            existing_pieces,
            used_hosts,
            &workers,
            Some(memory),
            self.event_publisher.clone(),
        );
        if workers.is_empty() {
            chunk.drop_worker();
        }
        for worker in workers {
            worker.queue_upload_chunk(chunk.clone());
        }
        chunk
    }
}
