/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The health loop, which keeps every chunk of every file on as many good hosts as its erasure code asks
//! for.
//!
//! A pass visits directories worst health first. For each file in a directory it looks at every chunk
//! that is missing pieces on good hosts, fetches the chunk's data, either from the file's local source or
//! by downloading it from the pieces that remain, and re-uploads the missing pieces to hosts that do not
//! hold a piece of the chunk yet. The directory is bubbled afterwards so that its health reflects the
//! repair.
//!
//! Chunks whose last upload or repair ended with pieces missing are **stuck**. They are only retried on
//! every few passes, and only if memory is free right away, so that they cannot hold up the chunks that
//! can still be repaired.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::download::Downloader;
use crate::erasure::ErasureCoder;
use crate::errors::{RenterError, ResultExt};
use crate::events::{Event, EventPublisher, RepairChunkEvent};
use crate::filesystem::path::SiaPath;
use crate::filesystem::siafile::HealthContext;
use crate::filesystem::{FileNode, FileSystem};
use crate::thread_group::ThreadGroup;
use crate::types::data_types::HostPublicKey;
use crate::upload::{UnfinishedUploadChunk, Uploader};
use crate::worker_pool::WorkerPool;

#[derive(Clone, Debug)]
pub struct RepairConfiguration {
    /// Time between two passes when nothing triggers one.
    pub interval: Duration,
    /// Stuck chunks are retried on every this many passes.
    pub stuck_retry_passes: u32,
}

pub struct Repairer {
    fs: Arc<FileSystem>,
    pool: Arc<WorkerPool>,
    uploader: Arc<Uploader>,
    downloader: Arc<Downloader>,
    config: RepairConfiguration,
    event_publisher: EventPublisher,
    thread_group: ThreadGroup,
    trigger: Mutex<Option<Sender<()>>>,
}

/// What a repair pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub chunks_repaired: u64,
    pub chunks_stuck: u64,
}

impl Repairer {
    pub(crate) fn new(
        fs: Arc<FileSystem>,
        pool: Arc<WorkerPool>,
        uploader: Arc<Uploader>,
        downloader: Arc<Downloader>,
        config: RepairConfiguration,
        event_publisher: EventPublisher,
        thread_group: ThreadGroup,
    ) -> Arc<Repairer> {
        Arc::new(Repairer {
            fs,
            pool,
            uploader,
            downloader,
            config,
            event_publisher,
            thread_group,
            trigger: Mutex::new(None),
        })
    }

    /// Ask the loop to start a pass soon.
    pub fn trigger(&self) {
        if let Some(trigger) = self.trigger.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).as_ref() {
            let _ = trigger.send(());
        }
    }

    pub(crate) fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let (trigger, triggered): (Sender<()>, Receiver<()>) = mpsc::channel();
        *self.trigger.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(trigger);
        let repairer = self.clone();
        thread::spawn(move || {
            let mut pass: u32 = 0;
            loop {
                if repairer.thread_group.is_stopped() {
                    return;
                }
                let include_stuck = pass % repairer.config.stuck_retry_passes.max(1) == 0;
                match repairer.repair_pass(include_stuck) {
                    Ok(report) if report != RepairReport::default() => log::info!(
                        "Repair pass repaired {} chunks, {} remain stuck",
                        report.chunks_repaired,
                        report.chunks_stuck
                    ),
                    Ok(_) => (),
                    Err(err) if err.is_shutdown() => return,
                    Err(err) => log::warn!("Repair pass failed: {}", err),
                }
                pass = pass.wrapping_add(1);
                match triggered.recv_timeout(repairer.config.interval) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => (),
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })
    }

    /// Refresh the health of every directory, then repair them worst first.
    pub fn repair_pass(&self, include_stuck: bool) -> Result<RepairReport, RenterError> {
        let mut report = RepairReport::default();
        if self.pool.is_empty() || self.pool.contractor().allowance().is_cancelled() {
            return Ok(report);
        }
        let ctx = self.pool.health_context();
        self.fs.bubble_all(&SiaPath::root(), &ctx)?;

        let mut dirs: Vec<(SiaPath, f64, u64)> = self
            .fs
            .walk_dirs(&SiaPath::root())?
            .into_iter()
            .filter_map(|path| {
                let metadata = self.fs.open_dir(&path).ok()?.metadata();
                Some((path, metadata.health, metadata.num_stuck_chunks))
            })
            .filter(|(_, health, stuck)| *health < 1.0 || (include_stuck && *stuck > 0))
            .collect();
        dirs.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        for (dir, _, _) in dirs {
            if self.thread_group.is_stopped() {
                return Err(RenterError::Shutdown);
            }
            for path in self.fs.child_files(&dir)? {
                let file = match self.fs.open_file(&path) {
                    Ok(file) => file,
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => return Err(err),
                };
                let file_report = self.repair_file(&file, include_stuck);
                report.chunks_repaired += file_report.chunks_repaired;
                report.chunks_stuck += file_report.chunks_stuck;
            }
            if let Err(err) = self.fs.bubble(&dir, &self.pool.health_context()) {
                log::debug!("Failed to bubble {} after repair: {}", dir, err);
            }
        }
        Ok(report)
    }

    /// Repair every chunk of `file` that is missing pieces.
    pub fn repair_file(&self, file: &FileNode, include_stuck: bool) -> RepairReport {
        let ctx = self.pool.health_context();
        let mut report = RepairReport::default();
        let mut repairing = Vec::new();
        let num_chunks = file.read(|f| f.num_chunks());
        for index in 0..num_chunks {
            if file.is_deleted() {
                break;
            }
            let (health, stuck) = match file.read(|f| Ok::<_, RenterError>((f.chunk_health(index, &ctx)?, f.stuck(index)?))) {
                Ok(status) => status,
                Err(err) => {
                    log::debug!("Skipping chunk {} of {}: {}", index, file.path(), err);
                    continue;
                }
            };
            if stuck && !include_stuck {
                continue;
            }
            if health >= 1.0 {
                if stuck {
                    let _ = file.set_stuck(index, false);
                }
                continue;
            }
            match self.repair_chunk(file, index, stuck, &ctx) {
                Ok(Some(chunk)) => repairing.push(chunk),
                Ok(None) => (),
                Err(err) => {
                    log::debug!("Failed to repair chunk {} of {}: {}", index, file.path(), err);
                    if !err.is_shutdown() {
                        let _ = file.set_stuck(index, true);
                    }
                    report.chunks_stuck += 1;
                    self.publish_repair(file, index, health, true);
                }
            }
        }

        let ctx = self.pool.health_context();
        for chunk in repairing {
            let outcome = chunk.wait();
            let health = file.read(|f| f.chunk_health(chunk.index(), &ctx)).unwrap_or(0.0);
            if outcome.complete() {
                report.chunks_repaired += 1;
            } else {
                report.chunks_stuck += 1;
            }
            self.publish_repair(file, chunk.index(), health, !outcome.complete());
        }
        report
    }

    /// Start re-uploading the pieces of chunk `index` that have no copy on a good host. Returns `None` if
    /// the chunk is stuck and memory is not free right away.
    fn repair_chunk(
        &self,
        file: &FileNode,
        index: u64,
        stuck: bool,
        ctx: &HealthContext,
    ) -> Result<Option<Arc<UnfinishedUploadChunk>>, RenterError> {
        let (erasure_code, piece_size, good_pieces, used_hosts) = file.read(|f| {
            let good_pieces = f.good_pieces(index, ctx)?;
            let used_hosts: HashSet<HostPublicKey> = f
                .pieces(index)?
                .iter()
                .flat_map(|copies| copies.iter().map(|record| record.host))
                .filter(|host| ctx.is_good(host))
                .collect();
            Ok::<_, RenterError>((f.erasure_code(), f.piece_size(), good_pieces, used_hosts))
        })?;
        let missing = erasure_code.num_pieces() - good_pieces.len();
        if missing == 0 {
            return Ok(None);
        }

        let memory = if stuck {
            match self.uploader.memory().try_request(missing as u64 * piece_size, false) {
                Some(memory) => memory,
                None => return Ok(None),
            }
        } else {
            self.uploader.memory().request(missing as u64 * piece_size, false)?
        };

        let data = self.chunk_data(file, index)?;
        let good: HashSet<usize> = good_pieces.iter().copied().collect();
        let pieces = erasure_code
            .coder()
            .encode(&data, piece_size as usize)?
            .into_iter()
            .enumerate()
            .map(|(piece_index, piece)| if good.contains(&piece_index) { None } else { Some(piece) })
            .collect();
        log::debug!(
            "Repairing {} pieces of chunk {} of {}{}",
            missing,
            index,
            file.path(),
            if stuck { " (stuck)" } else { "" }
        );
        Ok(Some(self.uploader.submit(
            file.clone(),
            index,
            pieces,
            good_pieces.len(),
            &used_hosts,
            memory,
        )))
    }

    /// The data of chunk `index`, read from the local source if it is still intact and downloaded
    /// otherwise.
    fn chunk_data(&self, file: &FileNode, index: u64) -> Result<Vec<u8>, RenterError> {
        let (local_path, size, chunk_size) = file.read(|f| (f.local_path().to_string(), f.size(), f.chunk_size()));
        let offset = index * chunk_size;
        let length = chunk_size.min(size.saturating_sub(offset));
        if !local_path.is_empty() {
            match read_local_chunk(&local_path, size, offset, length) {
                Ok(data) => return Ok(data),
                Err(err) => log::debug!(
                    "Local copy {} of {} is unusable, downloading chunk {}: {}",
                    local_path,
                    file.path(),
                    index,
                    err
                ),
            }
        }
        self.downloader.download_chunk(file, index, 0, length, false)
    }

    fn publish_repair(&self, file: &FileNode, chunk_index: u64, health: f64, stuck: bool) {
        Event::publish(
            &self.event_publisher,
            Event::RepairChunk(RepairChunkEvent {
                timestamp: SystemTime::now(),
                path: file.path().to_string(),
                chunk_index,
                health,
                stuck,
            }),
        );
    }
}

/// Read `length` bytes at `offset` of the file at `local_path`, which must still be `size` bytes long.
fn read_local_chunk(local_path: &str, size: u64, offset: u64, length: u64) -> Result<Vec<u8>, RenterError> {
    let mut source = File::open(local_path).context(format!("opening {}", local_path))?;
    let actual = source.metadata().context(format!("reading metadata of {}", local_path))?.len();
    if actual != size {
        return Err(RenterError::InvalidArgument(format!(
            "{} changed size from {} to {} bytes",
            local_path, size, actual
        )));
    }
    source.seek(SeekFrom::Start(offset)).context(format!("seeking {}", local_path))?;
    let mut data = Vec::with_capacity(length as usize);
    source
        .take(length)
        .read_to_end(&mut data)
        .context(format!("reading {}", local_path))?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn local_chunks_are_read_at_their_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source");
        let mut file = File::create(&path).unwrap();
        let contents: Vec<u8> = (0..100u8).collect();
        file.write_all(&contents).unwrap();
        let path = path.to_string_lossy().to_string();

        assert_eq!(read_local_chunk(&path, 100, 40, 30).unwrap(), contents[40..70].to_vec());
        assert_eq!(read_local_chunk(&path, 100, 90, 30).unwrap(), contents[90..].to_vec());
        assert!(read_local_chunk(&path, 99, 0, 10).is_err());
    }
}
