/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Seekable readers over the data of a pubfile.
//!
//! Small pubfiles are read straight from the base sector. Large ones go through a [`FanoutStreamer`],
//! which fetches a chunk the first time a read touches it. A chunk's pieces are read from the hosts the
//! fanout names when the renter has a worker for them; otherwise, or if that read fails, from any host
//! that answers a has-sector query for the piece's root. Workers verify every piece against its root.
//! The most recently read chunks are cached, so that sequential reads and short seeks back do not fetch
//! a chunk twice.

use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::fanout::{decode_fanout, FanoutEntry};
use super::layout::PubfileLayout;
use super::PubfileError;
use crate::erasure::{ErasureCode, ErasureCoder};
use crate::errors::RenterError;
use crate::types::constants::SECTOR_SIZE;
use crate::worker::job_queue::CancelToken;
use crate::worker_pool::WorkerPool;

/// Number of chunks a streamer keeps in memory.
const CHUNK_CACHE_SIZE: usize = 2;

pub struct FanoutStreamer {
    pool: Arc<WorkerPool>,
    erasure_code: ErasureCode,
    chunks: Vec<Vec<Option<FanoutEntry>>>,
    filesize: u64,
    chunk_size: u64,
    timeout: Duration,
    position: u64,
    cache: VecDeque<(u64, Arc<Vec<u8>>)>,
}

impl std::fmt::Debug for FanoutStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutStreamer")
            .field("filesize", &self.filesize)
            .field("chunk_size", &self.chunk_size)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl FanoutStreamer {
    pub(crate) fn new(
        pool: Arc<WorkerPool>,
        layout: &PubfileLayout,
        fanout: &[u8],
        timeout: Duration,
    ) -> Result<FanoutStreamer, RenterError> {
        let erasure_code = ErasureCode::new(layout.fanout_data_pieces, layout.fanout_parity_pieces)?;
        let chunks = decode_fanout(fanout, &erasure_code)?;
        let chunk_size = SECTOR_SIZE * erasure_code.min_pieces() as u64;
        let needed = (layout.filesize + chunk_size - 1) / chunk_size;
        if (chunks.len() as u64) < needed {
            return Err(PubfileError::FanoutTooShort {
                chunks: chunks.len() as u64,
                needed,
            }
            .into());
        }
        Ok(FanoutStreamer {
            pool,
            erasure_code,
            chunks,
            filesize: layout.filesize,
            chunk_size,
            timeout,
            position: 0,
            cache: VecDeque::with_capacity(CHUNK_CACHE_SIZE),
        })
    }

    pub fn len(&self) -> u64 {
        self.filesize
    }

    pub fn is_empty(&self) -> bool {
        self.filesize == 0
    }

    fn chunk(&mut self, index: u64) -> Result<Arc<Vec<u8>>, RenterError> {
        if let Some((_, data)) = self.cache.iter().find(|(cached, _)| *cached == index) {
            return Ok(data.clone());
        }
        let data = Arc::new(self.fetch_chunk(index)?);
        if self.cache.len() == CHUNK_CACHE_SIZE {
            self.cache.pop_front();
        }
        self.cache.push_back((index, data.clone()));
        Ok(data)
    }

    /// Fetch and decode chunk `index`. Only as many reads as there are pieces still needed are in flight.
    fn fetch_chunk(&self, index: u64) -> Result<Vec<u8>, RenterError> {
        let length = self.chunk_size.min(self.filesize - index * self.chunk_size);
        let min_pieces = self.erasure_code.min_pieces();
        let deadline = Instant::now() + self.timeout;
        let cancel = CancelToken::new();

        let mut candidates: VecDeque<(usize, FanoutEntry)> = self.chunks[index as usize]
            .iter()
            .enumerate()
            .filter_map(|(piece_index, slot)| slot.map(|entry| (piece_index, entry)))
            .collect();
        let mut pieces: Vec<Option<Vec<u8>>> = vec![None; self.erasure_code.num_pieces()];
        let mut fetched = 0;
        let mut in_flight = VecDeque::new();
        let mut fallback = Vec::new();

        while fetched < min_pieces {
            while fetched + in_flight.len() < min_pieces {
                let (piece_index, entry) = match candidates.pop_front() {
                    Some(candidate) => candidate,
                    None => break,
                };
                match self.pool.read_sector(&entry.host, &entry.root, 0, SECTOR_SIZE, cancel.clone()) {
                    Ok(response) => in_flight.push_back((piece_index, entry, response)),
                    Err(_) => fallback.push((piece_index, entry)),
                }
            }
            let (piece_index, entry, response) = match in_flight.pop_front() {
                Some(read) => read,
                None => break,
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            match response.recv_timeout(remaining) {
                Ok(Ok(data)) => {
                    pieces[piece_index] = Some(data);
                    fetched += 1;
                }
                Ok(Err(err)) => {
                    log::debug!("Reading piece {} of chunk {} from {} failed: {}", piece_index, index, entry.host, err);
                    fallback.push((piece_index, entry));
                }
                Err(_) => fallback.push((piece_index, entry)),
            }
        }

        let mut errors = Vec::new();
        for (piece_index, entry) in fallback {
            if fetched >= min_pieces {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                errors.push(Some(RenterError::Timeout));
                break;
            }
            match self.pool.download_by_root(&entry.root, 0, SECTOR_SIZE, remaining) {
                Ok(data) => {
                    pieces[piece_index] = Some(data);
                    fetched += 1;
                }
                Err(err) => errors.push(Some(err)),
            }
        }
        cancel.cancel();

        if fetched < min_pieces {
            let err = RenterError::Transient(format!(
                "fetched {} of the {} pieces needed for chunk {}",
                fetched, min_pieces, index
            ));
            return Err(match RenterError::compose(errors) {
                Some(cause) => err.add_context(cause.to_string()),
                None => err,
            });
        }
        self.erasure_code.coder().recover(&pieces, length as usize)
    }
}

impl Read for FanoutStreamer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.filesize {
            return Ok(0);
        }
        let index = self.position / self.chunk_size;
        let chunk = self.chunk(index).map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        let in_chunk = (self.position % self.chunk_size) as usize;
        if in_chunk >= chunk.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("chunk {} decoded to {} bytes", index, chunk.len()),
            ));
        }
        let n = buf.len().min(chunk.len() - in_chunk);
        buf[..n].copy_from_slice(&chunk[in_chunk..in_chunk + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for FanoutStreamer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.filesize.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(target) => {
                self.position = target;
                Ok(target)
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")),
        }
    }
}

/// The data of a downloaded pubfile.
#[derive(Debug)]
pub enum PubfileStream {
    Inline(Cursor<Vec<u8>>),
    Fanout(FanoutStreamer),
}

impl PubfileStream {
    pub fn len(&self) -> u64 {
        match self {
            PubfileStream::Inline(cursor) => cursor.get_ref().len() as u64,
            PubfileStream::Fanout(streamer) => streamer.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the whole stream from its current position.
    pub fn read_all(&mut self) -> Result<Vec<u8>, RenterError> {
        let mut data = Vec::new();
        self.read_to_end(&mut data).map_err(unwrap_io_error)?;
        Ok(data)
    }
}

impl Read for PubfileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PubfileStream::Inline(cursor) => cursor.read(buf),
            PubfileStream::Fanout(streamer) => streamer.read(buf),
        }
    }
}

impl Seek for PubfileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            PubfileStream::Inline(cursor) => cursor.seek(pos),
            PubfileStream::Fanout(streamer) => streamer.seek(pos),
        }
    }
}

/// Recover a [`RenterError`] that went through a [`Read`] implementation.
pub(crate) fn unwrap_io_error(err: io::Error) -> RenterError {
    if err.get_ref().map_or(false, |inner| inner.is::<RenterError>()) {
        if let Some(inner) = err.into_inner() {
            if let Ok(err) = inner.downcast::<RenterError>() {
                return *err;
            }
        }
        return RenterError::Critical("lost an error while unwrapping it".into());
    }
    RenterError::Io(err)
}
