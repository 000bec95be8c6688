/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Metadata of one erasure-coded file.
//!
//! A file of `size` bytes is cut into chunks of `piece_size × data_pieces` bytes. Each chunk is encoded
//! into `data_pieces + parity_pieces` pieces, and every piece is stored as one sector on one or more
//! hosts. The chunk table records, per chunk and piece index, which hosts hold the piece and under
//! which sector root.

use std::collections::HashSet;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::erasure::ErasureCode;
use crate::errors::RenterError;
use crate::persist::versioned_file::Metadata;
use crate::types::crypto_primitives::new_specifier;
use crate::types::data_types::{HostPublicKey, SectorRoot};

pub const SIAFILE_METADATA: Metadata = Metadata::new(new_specifier("SiaFile"), new_specifier("v1.4.0"));

/// How pieces are encrypted before upload. Only plaintext is supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum CipherType {
    Plaintext,
}

impl CipherType {
    /// The one-byte tag of this cipher in pubfile layouts.
    pub fn tag(&self) -> u8 {
        match self {
            CipherType::Plaintext => 0,
        }
    }

    pub fn from_tag(tag: u8) -> Option<CipherType> {
        match tag {
            0 => Some(CipherType::Plaintext),
            _ => None,
        }
    }
}

/// One copy of a piece on a host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PieceRecord {
    pub host: HostPublicKey,
    pub root: SectorRoot,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Chunk {
    /// Copies of each piece, indexed by piece index.
    pub pieces: Vec<Vec<PieceRecord>>,
    /// Whether the last attempt to repair this chunk failed.
    pub stuck: bool,
}

/// The hosts whose pieces count towards the health of a file: those we hold a contract with that is good
/// for renew and that are currently online.
#[derive(Clone, Debug, Default)]
pub struct HealthContext {
    pub good_hosts: HashSet<HostPublicKey>,
}

impl HealthContext {
    pub fn new(good_hosts: impl IntoIterator<Item = HostPublicKey>) -> HealthContext {
        HealthContext {
            good_hosts: good_hosts.into_iter().collect(),
        }
    }

    pub fn is_good(&self, host: &HostPublicKey) -> bool {
        self.good_hosts.contains(host)
    }
}

/// Health of a whole file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileHealth {
    /// Health of the worst chunk, in `[0, 1]`. `1` means every chunk has all of its pieces.
    pub health: f64,
    /// Good pieces of the worst chunk divided by the pieces needed to recover it.
    pub redundancy: f64,
    pub num_stuck_chunks: u64,
}

/// Health of one chunk with `good_pieces` recoverable pieces. `0` means exactly `data_pieces` remain.
pub fn chunk_health(erasure_code: &ErasureCode, good_pieces: usize) -> f64 {
    let k = erasure_code.min_pieces() as f64;
    let m = erasure_code.parity_pieces as f64;
    if m == 0.0 {
        return if good_pieces as f64 >= k { 1.0 } else { 0.0 };
    }
    ((good_pieces as f64 - k) / m).clamp(0.0, 1.0)
}

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct SiaFile {
    local_path: String,
    erasure_code: ErasureCode,
    cipher_type: CipherType,
    piece_size: u64,
    size: u64,
    mode: u32,
    disable_partial_upload: bool,
    created: u64,
    modified: u64,
    accessed: u64,
    last_health_check: u64,
    publinks: Vec<String>,
    chunks: Vec<Chunk>,
}

/// What a new file is created with.
#[derive(Clone, Debug)]
pub struct FileParams {
    /// Where the file's contents can be found locally. Empty if there is no local copy.
    pub source: String,
    pub erasure_code: ErasureCode,
    pub cipher_type: CipherType,
    pub piece_size: u64,
    pub size: u64,
    pub mode: u32,
    pub disable_partial_upload: bool,
}

impl SiaFile {
    pub fn new(params: FileParams, now: u64) -> Result<SiaFile, RenterError> {
        if params.piece_size == 0 {
            return Err(RenterError::InvalidArgument("piece size must not be zero".into()));
        }
        let mut file = SiaFile {
            local_path: params.source,
            erasure_code: params.erasure_code,
            cipher_type: params.cipher_type,
            piece_size: params.piece_size,
            size: params.size,
            mode: params.mode,
            disable_partial_upload: params.disable_partial_upload,
            created: now,
            modified: now,
            accessed: now,
            last_health_check: 0,
            publinks: Vec::new(),
            chunks: Vec::new(),
        };
        let num_chunks = file.chunks_for_size(params.size);
        file.grow(num_chunks);
        Ok(file)
    }

    /// Number of chunks needed to hold `size` bytes.
    fn chunks_for_size(&self, size: u64) -> u64 {
        let chunk_size = self.chunk_size();
        (size + chunk_size - 1) / chunk_size
    }

    pub fn local_path(&self) -> &str {
        &self.local_path
    }

    pub fn set_local_path(&mut self, local_path: String) {
        self.local_path = local_path;
    }

    pub fn erasure_code(&self) -> ErasureCode {
        self.erasure_code
    }

    pub fn cipher_type(&self) -> CipherType {
        self.cipher_type
    }

    pub fn piece_size(&self) -> u64 {
        self.piece_size
    }

    /// Bytes of file data per chunk.
    pub fn chunk_size(&self) -> u64 {
        self.piece_size * self.erasure_code.min_pieces() as u64
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn disable_partial_upload(&self) -> bool {
        self.disable_partial_upload
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn modified(&self) -> u64 {
        self.modified
    }

    pub fn accessed(&self) -> u64 {
        self.accessed
    }

    pub fn last_health_check(&self) -> u64 {
        self.last_health_check
    }

    pub fn set_last_health_check(&mut self, now: u64) {
        self.last_health_check = now;
    }

    pub fn touch(&mut self, now: u64) {
        self.accessed = now;
    }

    pub fn num_chunks(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Extend the chunk table to `num_chunks` chunks. Never shrinks it.
    pub fn grow(&mut self, num_chunks: u64) {
        let num_pieces = self.erasure_code.num_pieces();
        while (self.chunks.len() as u64) < num_chunks {
            self.chunks.push(Chunk {
                pieces: vec![Vec::new(); num_pieces],
                stuck: false,
            });
        }
    }

    /// Set the size of the file, growing the chunk table if it becomes larger.
    pub fn set_size(&mut self, size: u64, now: u64) {
        self.size = size;
        self.grow(self.chunks_for_size(size));
        self.modified = now;
    }

    fn chunk(&self, chunk_index: u64) -> Result<&Chunk, RenterError> {
        self.chunks.get(chunk_index as usize).ok_or_else(|| {
            RenterError::InvalidArgument(format!(
                "chunk {} out of range, file has {} chunks",
                chunk_index,
                self.chunks.len()
            ))
        })
    }

    fn chunk_mut(&mut self, chunk_index: u64) -> Result<&mut Chunk, RenterError> {
        let num_chunks = self.chunks.len();
        self.chunks.get_mut(chunk_index as usize).ok_or_else(|| {
            RenterError::InvalidArgument(format!(
                "chunk {} out of range, file has {} chunks",
                chunk_index, num_chunks
            ))
        })
    }

    /// Record that `host` stores piece `piece_index` of chunk `chunk_index` under `root`. A previous copy
    /// of the same piece on the same host is replaced.
    pub fn add_piece(
        &mut self,
        host: HostPublicKey,
        chunk_index: u64,
        piece_index: u64,
        root: SectorRoot,
        now: u64,
    ) -> Result<(), RenterError> {
        let num_pieces = self.erasure_code.num_pieces();
        let chunk = self.chunk_mut(chunk_index)?;
        let slot = chunk.pieces.get_mut(piece_index as usize).ok_or_else(|| {
            RenterError::InvalidArgument(format!("piece {} out of range, chunks have {} pieces", piece_index, num_pieces))
        })?;
        slot.retain(|record| record.host != host);
        slot.push(PieceRecord { host, root });
        self.modified = now;
        Ok(())
    }

    /// Every copy of every piece of chunk `chunk_index`, indexed by piece index.
    pub fn pieces(&self, chunk_index: u64) -> Result<&[Vec<PieceRecord>], RenterError> {
        Ok(&self.chunk(chunk_index)?.pieces)
    }

    pub fn stuck(&self, chunk_index: u64) -> Result<bool, RenterError> {
        Ok(self.chunk(chunk_index)?.stuck)
    }

    pub fn set_stuck(&mut self, chunk_index: u64, stuck: bool) -> Result<(), RenterError> {
        self.chunk_mut(chunk_index)?.stuck = stuck;
        Ok(())
    }

    pub fn num_stuck_chunks(&self) -> u64 {
        self.chunks.iter().filter(|chunk| chunk.stuck).count() as u64
    }

    /// Piece indices of chunk `chunk_index` that have a copy on a good host.
    pub fn good_pieces(&self, chunk_index: u64, ctx: &HealthContext) -> Result<Vec<usize>, RenterError> {
        Ok(self
            .chunk(chunk_index)?
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, copies)| copies.iter().any(|record| ctx.is_good(&record.host)))
            .map(|(piece_index, _)| piece_index)
            .collect())
    }

    pub fn chunk_health(&self, chunk_index: u64, ctx: &HealthContext) -> Result<f64, RenterError> {
        Ok(chunk_health(&self.erasure_code, self.good_pieces(chunk_index, ctx)?.len()))
    }

    pub fn health(&self, ctx: &HealthContext) -> FileHealth {
        let k = self.erasure_code.min_pieces() as f64;
        let mut health = 1.0f64;
        let mut redundancy = self.erasure_code.num_pieces() as f64 / k;
        for chunk in &self.chunks {
            let good = chunk
                .pieces
                .iter()
                .filter(|copies| copies.iter().any(|record| ctx.is_good(&record.host)))
                .count();
            health = health.min(chunk_health(&self.erasure_code, good));
            redundancy = redundancy.min(good as f64 / k);
        }
        FileHealth {
            health,
            redundancy,
            num_stuck_chunks: self.num_stuck_chunks(),
        }
    }

    /// Every host that stores at least one piece of the file.
    pub fn hosts(&self) -> HashSet<HostPublicKey> {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.pieces.iter())
            .flat_map(|copies| copies.iter().map(|record| record.host))
            .collect()
    }

    /// Bytes uploaded so far, counting every copy of every piece.
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.pieces.iter())
            .map(|copies| copies.len() as u64 * self.piece_size)
            .sum()
    }

    /// Fraction of the pieces needed for full redundancy that have been uploaded, in `[0, 1]`.
    pub fn upload_progress(&self) -> f64 {
        let wanted = self.chunks.len() as u64 * self.erasure_code.num_pieces() as u64;
        if wanted == 0 {
            return 1.0;
        }
        let uploaded: u64 = self
            .chunks
            .iter()
            .map(|chunk| chunk.pieces.iter().filter(|copies| !copies.is_empty()).count() as u64)
            .sum();
        (uploaded as f64 / wanted as f64).min(1.0)
    }

    pub fn publinks(&self) -> &[String] {
        &self.publinks
    }

    /// Tag the file as carrying data of `publink`.
    pub fn add_publink(&mut self, publink: String) {
        if !self.publinks.contains(&publink) {
            self.publinks.push(publink);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(size: u64) -> FileParams {
        FileParams {
            source: String::new(),
            erasure_code: ErasureCode::new(2, 2).unwrap(),
            cipher_type: CipherType::Plaintext,
            piece_size: 64,
            size,
            mode: 0o644,
            disable_partial_upload: false,
        }
    }

    fn host(b: u8) -> HostPublicKey {
        HostPublicKey::new([b; 32])
    }

    #[test]
    fn chunk_count_follows_size() {
        assert_eq!(SiaFile::new(params(0), 0).unwrap().num_chunks(), 0);
        assert_eq!(SiaFile::new(params(128), 0).unwrap().num_chunks(), 1);
        assert_eq!(SiaFile::new(params(129), 0).unwrap().num_chunks(), 2);
        let mut file = SiaFile::new(params(1), 0).unwrap();
        file.set_size(300, 1);
        assert_eq!(file.num_chunks(), 3);
    }

    #[test]
    fn one_root_per_host_per_piece() {
        let mut file = SiaFile::new(params(100), 0).unwrap();
        file.add_piece(host(1), 0, 0, SectorRoot::new([1; 32]), 1).unwrap();
        file.add_piece(host(1), 0, 0, SectorRoot::new([2; 32]), 2).unwrap();
        file.add_piece(host(2), 0, 0, SectorRoot::new([3; 32]), 3).unwrap();
        let pieces = file.pieces(0).unwrap();
        assert_eq!(pieces[0].len(), 2);
        assert_eq!(pieces[0][0].root, SectorRoot::new([2; 32]));
        assert!(file.add_piece(host(1), 1, 0, SectorRoot::default(), 4).is_err());
        assert!(file.add_piece(host(1), 0, 4, SectorRoot::default(), 4).is_err());
    }

    #[test]
    fn health_counts_good_hosts_only() {
        let mut file = SiaFile::new(params(100), 0).unwrap();
        for piece in 0..4u8 {
            file.add_piece(host(piece), 0, piece as u64, SectorRoot::new([piece; 32]), 1).unwrap();
        }
        let all = HealthContext::new((0..4).map(host));
        assert_eq!(file.health(&all).health, 1.0);
        assert_eq!(file.health(&all).redundancy, 2.0);

        let three = HealthContext::new((0..3).map(host));
        assert_eq!(file.health(&three).health, 0.5);

        let one = HealthContext::new([host(0)]);
        let health = file.health(&one);
        assert_eq!(health.health, 0.0);
        assert_eq!(health.redundancy, 0.5);
        assert_eq!(file.good_pieces(0, &one).unwrap(), vec![0]);
    }

    #[test]
    fn publinks_are_tagged_once() {
        let mut file = SiaFile::new(params(10), 0).unwrap();
        file.add_publink("AAA".into());
        file.add_publink("AAA".into());
        assert_eq!(file.publinks(), &["AAA".to_string()]);
    }
}
