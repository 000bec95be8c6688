/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The fanout: where the chunks of a large pubfile live.
//!
//! Per chunk, the fanout lists 64-byte `{host key [32], sector root [32]}` entries. With 1-of-N redundancy
//! every piece of a chunk is the same sector, so one entry per chunk suffices. With any other code the
//! chunk lists one entry per piece in piece order, and pieces with no known copy are zero-filled.

use std::io::Read;

use super::PubfileError;
use crate::erasure::{ErasureCode, ErasureCoder};
use crate::errors::{RenterError, ResultExt};
use crate::filesystem::siafile::{PieceRecord, SiaFile};
use crate::merkle::sector_root;
use crate::types::constants::SECTOR_SIZE;
use crate::types::data_types::{HostPublicKey, SectorRoot};

pub const FANOUT_ENTRY_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FanoutEntry {
    /// The host the piece was uploaded to. Zero if unknown, for example in dry runs.
    pub host: HostPublicKey,
    pub root: SectorRoot,
}

/// Number of entries each chunk takes in the fanout of a file with `erasure_code`.
pub fn entries_per_chunk(erasure_code: &ErasureCode) -> usize {
    if erasure_code.min_pieces() == 1 {
        1
    } else {
        erasure_code.num_pieces()
    }
}

fn push_entry(fanout: &mut Vec<u8>, entry: Option<FanoutEntry>) {
    match entry {
        Some(entry) => {
            fanout.extend_from_slice(&entry.host.bytes());
            fanout.extend_from_slice(&entry.root.bytes());
        }
        None => fanout.extend_from_slice(&[0u8; FANOUT_ENTRY_SIZE]),
    }
}

fn first_copy(copies: &[PieceRecord]) -> Option<FanoutEntry> {
    copies.first().map(|record| FanoutEntry {
        host: record.host,
        root: record.root,
    })
}

/// The fanout of an uploaded file.
pub fn encode_fanout(file: &SiaFile) -> Result<Vec<u8>, RenterError> {
    let erasure_code = file.erasure_code();
    let mut fanout = Vec::with_capacity(file.num_chunks() as usize * entries_per_chunk(&erasure_code) * FANOUT_ENTRY_SIZE);
    for chunk_index in 0..file.num_chunks() {
        let pieces = file.pieces(chunk_index)?;
        if erasure_code.min_pieces() == 1 {
            let entry = pieces
                .iter()
                .find_map(|copies| first_copy(copies))
                .ok_or(PubfileError::MissingFanoutPiece { chunk_index })?;
            push_entry(&mut fanout, Some(entry));
        } else {
            for copies in pieces {
                push_entry(&mut fanout, first_copy(copies));
            }
        }
    }
    Ok(fanout)
}

/// Split a fanout into its chunks. Each chunk has one slot per piece; with 1-of-N redundancy only the
/// first slot is filled.
pub fn decode_fanout(fanout: &[u8], erasure_code: &ErasureCode) -> Result<Vec<Vec<Option<FanoutEntry>>>, PubfileError> {
    let per_chunk = entries_per_chunk(erasure_code);
    let chunk_bytes = per_chunk * FANOUT_ENTRY_SIZE;
    if fanout.is_empty() || fanout.len() % chunk_bytes != 0 {
        return Err(PubfileError::InvalidFanoutSize {
            size: fanout.len() as u64,
            entries_per_chunk: per_chunk,
        });
    }
    Ok(fanout
        .chunks(chunk_bytes)
        .map(|chunk| {
            let mut slots: Vec<Option<FanoutEntry>> = chunk
                .chunks(FANOUT_ENTRY_SIZE)
                .map(|entry| {
                    let mut host = [0u8; 32];
                    let mut root = [0u8; 32];
                    host.copy_from_slice(&entry[..32]);
                    root.copy_from_slice(&entry[32..]);
                    let root = SectorRoot::new(root);
                    if root.is_zero() {
                        None
                    } else {
                        Some(FanoutEntry {
                            host: HostPublicKey::new(host),
                            root,
                        })
                    }
                })
                .collect();
            slots.resize(erasure_code.num_pieces(), None);
            slots
        })
        .collect())
}

/// The fanout `reader` would get if it were uploaded with `erasure_code` and full-sector pieces, computed
/// without uploading anything. Returns the fanout and the number of bytes read.
pub fn dry_run_fanout(reader: &mut impl Read, erasure_code: &ErasureCode) -> Result<(Vec<u8>, u64), RenterError> {
    let coder = erasure_code.coder();
    let chunk_size = SECTOR_SIZE * erasure_code.min_pieces() as u64;
    let mut fanout = Vec::new();
    let mut size = 0;
    loop {
        let mut data = Vec::with_capacity(chunk_size as usize);
        reader
            .by_ref()
            .take(chunk_size)
            .read_to_end(&mut data)
            .context("reading pubfile data")?;
        if data.is_empty() {
            break;
        }
        size += data.len() as u64;
        let pieces = coder.encode(&data, SECTOR_SIZE as usize)?;
        let roots = pieces.iter().map(|piece| sector_root(piece));
        let blank = HostPublicKey::new([0u8; 32]);
        for root in roots.take(entries_per_chunk(erasure_code)) {
            push_entry(&mut fanout, Some(FanoutEntry { host: blank, root }));
        }
        if (data.len() as u64) < chunk_size {
            break;
        }
    }
    Ok((fanout, size))
}
