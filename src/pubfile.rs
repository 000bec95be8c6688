/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pubfiles: files published under a [publink](publink::Publink) that anyone can fetch knowing only
//! the link.
//!
//! Every pubfile has a **base sector** holding a [layout](layout::PubfileLayout) header, a
//! [fanout](fanout), JSON [metadata](metadata::PubfileMetadata) and, for files small enough to fit, the
//! file's data itself. The publink is the Merkle root of the base sector plus the range of it worth
//! fetching, so a reader needs nothing but a host that stores the sector.
//!
//! Files too big for the base sector are uploaded as an ordinary file at `<path>-extended`, and the
//! fanout lists where each of its pieces went. Base sectors are uploaded 1-of-10, so that many hosts
//! can answer for them.
//!
//! Every siafile belonging to a pubfile is tagged with its publink, which is how [`Pubfiles::unpin`]
//! finds them. The [blacklist](blacklist) is consulted before any base sector is uploaded or fetched.

pub mod blacklist;

pub mod fanout;

pub mod layout;

pub mod metadata;

pub mod publink;

pub mod streamer;

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use typed_builder::TypedBuilder;

use crate::erasure::ErasureCode;
use crate::errors::{RenterError, ResultExt};
use crate::events::{DownloadPubfileEvent, Event, EventPublisher, UpdateBlacklistEvent, UploadPubfileEvent};
use crate::filesystem::path::SiaPath;
use crate::filesystem::siafile::CipherType;
use crate::filesystem::{FileNode, FileSystem};
use crate::merkle::sector_root;
use crate::types::constants::SECTOR_SIZE;
use crate::types::data_types::SectorRoot;
use crate::upload::{FileUploadParams, Uploader};
use crate::worker_pool::WorkerPool;

use self::blacklist::Blacklist;
use self::fanout::{dry_run_fanout, encode_fanout};
use self::layout::{build_base_sector, parse_base_sector, BaseSector, PubfileLayout, LAYOUT_SIZE, PUBFILE_VERSION};
use self::metadata::PubfileMetadata;
use self::publink::Publink;
use self::streamer::{FanoutStreamer, PubfileStream};

/// Number of hosts a base sector is uploaded to. Base sectors are stored 1-of-N.
pub const DEFAULT_BASE_CHUNK_REDUNDANCY: u8 = 10;

/// Appended to the path of a pubfile to name the file holding the data of a large pubfile.
pub const EXTENDED_SUFFIX: &str = "-extended";

/// Directory below [`SiaPath::var`] pubfiles are uploaded to unless their path is absolute.
pub const PUBACCESS_FOLDER: &str = "pubaccess";

#[derive(Debug, thiserror::Error)]
pub enum PubfileError {
    #[error("range at offset {offset} of {fetch_size} bytes cannot be addressed by a publink")]
    InvalidPublinkRange { offset: u64, fetch_size: u64 },

    #[error("unsupported publink version {0}")]
    UnsupportedPublinkVersion(u16),

    #[error("invalid publink bitfield {0:#06x}")]
    InvalidBitfield(u16),

    #[error("publink has length {0}")]
    InvalidPublinkLength(usize),

    #[error("publink is not valid base64: {0}")]
    InvalidPublinkEncoding(String),

    #[error("base sector holds only {0} bytes, too few for a layout")]
    TruncatedLayout(usize),

    #[error("unsupported cipher {0:?}")]
    UnsupportedCipher(Vec<u8>),

    #[error("base sector of {0} bytes is larger than a sector")]
    OversizedBaseSector(u64),

    #[error("unsupported pubfile version {0}")]
    UnsupportedVersion(u8),

    #[error("fanout of {fanout_size} bytes and metadata of {metadata_size} bytes exceed the base sector")]
    HeaderExceedsBaseSector { fanout_size: u64, metadata_size: u64 },

    #[error("base sector payload is truncated: expected {expected} bytes, found {found}")]
    TruncatedPayload { expected: u64, found: u64 },

    #[error("invalid pubfile metadata: {0}")]
    InvalidMetadata(String),

    #[error("metadata of {0} bytes does not fit in a base sector")]
    MetadataTooBig(u64),

    #[error("fanout of {fanout_size} bytes with metadata of {metadata_size} bytes does not fit in a base sector")]
    FanoutTooBig { fanout_size: u64, metadata_size: u64 },

    #[error("chunk {chunk_index} has no uploaded piece to list in the fanout")]
    MissingFanoutPiece { chunk_index: u64 },

    #[error("fanout of {size} bytes is not a whole number of chunks of {entries_per_chunk} entries")]
    InvalidFanoutSize { size: u64, entries_per_chunk: usize },

    #[error("fanout lists {chunks} chunks but the file needs {needed}")]
    FanoutTooShort { chunks: u64, needed: u64 },

    #[error("base sector redundancy must be at least 1, got {0}")]
    RedundancyNotSupported(u8),

    #[error("file {0} cannot be published: {1}")]
    NotPublishable(String, String),
}

/// How a pubfile is uploaded.
#[derive(Clone, Debug, TypedBuilder)]
pub struct PubfileUploadParams {
    #[builder(setter(doc = "Set the path of the pubfile's base sector file. Required."))]
    pub path: SiaPath,
    #[builder(default, setter(doc = "Set the metadata stored in the base sector. Its length is filled in on upload."))]
    pub metadata: PubfileMetadata,
    #[builder(default = false, setter(doc = "Compute the publink without uploading anything."))]
    pub dry_run: bool,
    #[builder(default = false, setter(doc = "Replace existing files at the pubfile's paths."))]
    pub force: bool,
    #[builder(default = false, setter(doc = "Treat `path` as absolute instead of relative to the pubaccess folder."))]
    pub root: bool,
    #[builder(default = DEFAULT_BASE_CHUNK_REDUNDANCY, setter(doc = "Set the number of hosts the base sector is stored on."))]
    pub base_chunk_redundancy: u8,
    #[builder(default = ErasureCode::DEFAULT, setter(doc = "Set the erasure code of the data of large pubfiles."))]
    pub fanout_erasure_code: ErasureCode,
}

impl PubfileUploadParams {
    fn base_path(&self) -> Result<SiaPath, RenterError> {
        if self.root {
            return Ok(self.path.clone());
        }
        Ok(SiaPath::var().join(PUBACCESS_FOLDER)?.join(self.path.as_str())?)
    }

    /// Permission bits of the siafiles backing the pubfile.
    fn mode(&self) -> u32 {
        match self.metadata.mode {
            0 => 0o644,
            mode => mode,
        }
    }
}

/// The outcome of an upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubfileUpload {
    pub publink: Publink,
    /// Number of meaningful bytes at the start of the base sector. The publink's fetch size is this,
    /// rounded up to its alignment.
    pub fetch_size: u64,
    /// Size of the published data.
    pub size: u64,
}

pub(crate) fn extended_path(path: &SiaPath) -> Result<SiaPath, RenterError> {
    Ok(SiaPath::new(&format!("{}{}", path.as_str(), EXTENDED_SUFFIX))?)
}

pub struct Pubfiles {
    fs: Arc<FileSystem>,
    pool: Arc<WorkerPool>,
    uploader: Arc<Uploader>,
    blacklist: Blacklist,
    event_publisher: EventPublisher,
}

impl Pubfiles {
    pub(crate) fn new(
        fs: Arc<FileSystem>,
        pool: Arc<WorkerPool>,
        uploader: Arc<Uploader>,
        blacklist: Blacklist,
        event_publisher: EventPublisher,
    ) -> Pubfiles {
        Pubfiles {
            fs,
            pool,
            uploader,
            blacklist,
            event_publisher,
        }
    }

    /// Publish everything `reader` yields.
    pub fn upload(&self, params: PubfileUploadParams, reader: &mut impl Read) -> Result<PubfileUpload, RenterError> {
        if params.base_chunk_redundancy == 0 {
            return Err(PubfileError::RedundancyNotSupported(0).into());
        }
        let metadata_size = params.metadata.to_json()?.len() as u64;
        if LAYOUT_SIZE as u64 + metadata_size + 1 > SECTOR_SIZE {
            return Err(PubfileError::MetadataTooBig(metadata_size).into());
        }
        let base_path = params.base_path()?;

        let mut head = Vec::new();
        reader
            .by_ref()
            .take(SECTOR_SIZE - LAYOUT_SIZE as u64 + 1)
            .read_to_end(&mut head)
            .context("reading pubfile data")?;
        let mut metadata = params.metadata.clone();
        metadata.length = head.len() as u64;
        let metadata_bytes = metadata.to_json()?;
        if LAYOUT_SIZE as u64 + metadata_bytes.len() as u64 + head.len() as u64 <= SECTOR_SIZE {
            return self.upload_small(&params, &base_path, metadata_bytes, head);
        }
        self.upload_large(&params, &base_path, &mut Cursor::new(head).chain(reader))
    }

    fn upload_small(
        &self,
        params: &PubfileUploadParams,
        base_path: &SiaPath,
        metadata: Vec<u8>,
        data: Vec<u8>,
    ) -> Result<PubfileUpload, RenterError> {
        let layout = PubfileLayout::small(data.len() as u64, metadata.len() as u64);
        let (sector, fetch_size) = build_base_sector(&layout, &[], &metadata, &data);
        let publink = Publink::new_v1(sector_root(&sector), 0, fetch_size)?;
        // Nothing has reached a host yet.
        if self.blacklist.is_blacklisted(&publink) {
            return Err(RenterError::Blacklisted);
        }
        let upload = PubfileUpload {
            publink,
            fetch_size,
            size: data.len() as u64,
        };
        if params.dry_run {
            return Ok(upload);
        }

        let base = self
            .upload_base_sector(params, base_path, &sector)
            .map_err(|err| self.remove_partial(err, &[base_path]))?;
        base.add_publink(publink.to_string())?;
        self.publish_upload(&upload, base_path);
        Ok(upload)
    }

    fn upload_large(
        &self,
        params: &PubfileUploadParams,
        base_path: &SiaPath,
        reader: &mut impl Read,
    ) -> Result<PubfileUpload, RenterError> {
        let erasure_code = params.fanout_erasure_code;
        let extended_path = extended_path(base_path)?;

        if params.dry_run {
            let (fanout, size) = dry_run_fanout(reader, &erasure_code)?;
            let (sector, fetch_size) = self.large_base_sector(params, &fanout, &erasure_code, size)?;
            let publink = Publink::new_v1(sector_root(&sector), 0, fetch_size)?;
            if self.blacklist.is_blacklisted(&publink) {
                return Err(RenterError::Blacklisted);
            }
            return Ok(PubfileUpload { publink, fetch_size, size });
        }

        let extended = self
            .uploader
            .upload_stream(
                FileUploadParams::builder()
                    .path(extended_path.clone())
                    .erasure_code(erasure_code)
                    .piece_size(SECTOR_SIZE)
                    .force(params.force)
                    .disable_partial_upload(true)
                    .repair(false)
                    .cipher_type(CipherType::Plaintext)
                    .mode(params.mode())
                    .build(),
                reader,
            )
            .map_err(|err| self.remove_partial(err, &[&extended_path]))?;

        let result = extended
            .read(|file| encode_fanout(file).map(|fanout| (fanout, file.size())))
            .and_then(|(fanout, size)| {
                let (sector, fetch_size) = self.large_base_sector(params, &fanout, &erasure_code, size)?;
                let publink = Publink::new_v1(sector_root(&sector), 0, fetch_size)?;
                if self.blacklist.is_blacklisted(&publink) {
                    return Err(RenterError::Blacklisted);
                }
                let base = self.upload_base_sector(params, base_path, &sector)?;
                Ok((base, PubfileUpload { publink, fetch_size, size }))
            });
        let (base, upload) = result.map_err(|err| self.remove_partial(err, &[&extended_path, base_path]))?;
        base.add_publink(upload.publink.to_string())?;
        extended.add_publink(upload.publink.to_string())?;
        self.publish_upload(&upload, base_path);
        Ok(upload)
    }

    fn large_base_sector(
        &self,
        params: &PubfileUploadParams,
        fanout: &[u8],
        erasure_code: &ErasureCode,
        size: u64,
    ) -> Result<(Vec<u8>, u64), RenterError> {
        let mut metadata = params.metadata.clone();
        metadata.length = size;
        let metadata = metadata.to_json()?;
        let (fanout_size, metadata_size) = (fanout.len() as u64, metadata.len() as u64);
        if LAYOUT_SIZE as u64 + fanout_size + metadata_size > SECTOR_SIZE {
            return Err(PubfileError::FanoutTooBig {
                fanout_size,
                metadata_size,
            }
            .into());
        }
        let layout = PubfileLayout {
            version: PUBFILE_VERSION,
            filesize: size,
            metadata_size,
            fanout_size,
            fanout_data_pieces: erasure_code.data_pieces,
            fanout_parity_pieces: erasure_code.parity_pieces,
            cipher_type: CipherType::Plaintext,
            cipher_key: [0u8; 64],
        };
        Ok(build_base_sector(&layout, fanout, &metadata, &[]))
    }

    fn upload_base_sector(
        &self,
        params: &PubfileUploadParams,
        path: &SiaPath,
        sector: &[u8],
    ) -> Result<FileNode, RenterError> {
        let erasure_code = ErasureCode::new(1, params.base_chunk_redundancy - 1)?;
        self.uploader.upload_stream(
            FileUploadParams::builder()
                .path(path.clone())
                .erasure_code(erasure_code)
                .piece_size(SECTOR_SIZE)
                .force(params.force)
                .disable_partial_upload(true)
                .repair(false)
                .cipher_type(CipherType::Plaintext)
                .mode(params.mode())
                .build(),
            &mut &sector[..],
        )
    }

    /// Publish an existing file whose pieces are whole plaintext sectors, by uploading a base sector
    /// pointing at them.
    pub fn create_from_siafile(&self, params: PubfileUploadParams, source: &SiaPath) -> Result<PubfileUpload, RenterError> {
        let file = self.fs.open_file(source)?;
        let (fanout, erasure_code, size) = file.read(|f| {
            if f.cipher_type() != CipherType::Plaintext || f.piece_size() != SECTOR_SIZE {
                return Err(RenterError::from(PubfileError::NotPublishable(
                    source.to_string(),
                    "pieces are not plaintext sectors".into(),
                )));
            }
            Ok((encode_fanout(f)?, f.erasure_code(), f.size()))
        })?;
        let base_path = params.base_path()?;
        let (sector, fetch_size) = self.large_base_sector(&params, &fanout, &erasure_code, size)?;
        let publink = Publink::new_v1(sector_root(&sector), 0, fetch_size)?;
        if self.blacklist.is_blacklisted(&publink) {
            return Err(RenterError::Blacklisted);
        }
        let upload = PubfileUpload { publink, fetch_size, size };
        if params.dry_run {
            return Ok(upload);
        }
        let base = self
            .upload_base_sector(&params, &base_path, &sector)
            .map_err(|err| self.remove_partial(err, &[&base_path]))?;
        base.add_publink(publink.to_string())?;
        file.add_publink(publink.to_string())?;
        self.publish_upload(&upload, &base_path);
        Ok(upload)
    }

    /// Fetch and parse the base sector `publink` points at. Also returns the bytes fetched.
    fn fetch_base_sector(&self, publink: &Publink, timeout: Duration) -> Result<(BaseSector, Vec<u8>), RenterError> {
        if self.blacklist.is_blacklisted(publink) {
            return Err(RenterError::Blacklisted);
        }
        let (offset, fetch_size) = publink.offset_and_fetch_size()?;
        let bytes = self
            .pool
            .download_by_root(&publink.merkle_root(), offset, fetch_size, timeout)
            .context(format!("fetching base sector of {}", publink))?;
        Ok((parse_base_sector(&bytes)?, bytes))
    }

    /// Fetch the pubfile at `publink`. The data is read lazily for large pubfiles, each chunk within
    /// `timeout`.
    pub fn download(&self, publink: &Publink, timeout: Duration) -> Result<(PubfileMetadata, PubfileStream), RenterError> {
        let (base, _) = self.fetch_base_sector(publink, timeout)?;
        let stream = match base.payload {
            Some(payload) => PubfileStream::Inline(Cursor::new(payload)),
            None => PubfileStream::Fanout(FanoutStreamer::new(self.pool.clone(), &base.layout, &base.fanout, timeout)?),
        };
        Event::publish(
            &self.event_publisher,
            Event::DownloadPubfile(DownloadPubfileEvent {
                timestamp: SystemTime::now(),
                publink: *publink,
            }),
        );
        Ok((base.metadata, stream))
    }

    /// Store the pubfile at `publink` under the renter's own contracts. Both its base sector and its data
    /// are uploaded again, so the publink stays the same.
    pub fn pin(&self, publink: &Publink, params: PubfileUploadParams, timeout: Duration) -> Result<(), RenterError> {
        let (offset, _) = publink.offset_and_fetch_size()?;
        if offset != 0 {
            return Err(RenterError::InvalidArgument("only publinks to whole base sectors can be pinned".into()));
        }
        let (base, mut sector) = self.fetch_base_sector(publink, timeout)?;
        // Everything past the fetched range is padding.
        sector.resize(SECTOR_SIZE as usize, 0);
        let base_path = params.base_path()?;
        if sector_root(&sector) != publink.merkle_root() {
            return Err(RenterError::HostProtocolViolation(format!(
                "base sector of {} does not hash to its root",
                publink
            )));
        }

        let mut extended = None;
        if base.payload.is_none() {
            let extended_path = extended_path(&base_path)?;
            let mut streamer = FanoutStreamer::new(self.pool.clone(), &base.layout, &base.fanout, timeout)?;
            let erasure_code = ErasureCode::new(base.layout.fanout_data_pieces, base.layout.fanout_parity_pieces)?;
            let node = self
                .uploader
                .upload_stream(
                    FileUploadParams::builder()
                        .path(extended_path.clone())
                        .erasure_code(erasure_code)
                        .piece_size(SECTOR_SIZE)
                        .force(params.force)
                        .disable_partial_upload(true)
                        .repair(false)
                        .mode(params.mode())
                        .build(),
                    &mut streamer,
                )
                .map_err(|err| self.remove_partial(err, &[&extended_path]))?;
            extended = Some((node, extended_path));
        }

        let node = self.upload_base_sector(&params, &base_path, &sector).map_err(|err| {
            let mut partial = vec![&base_path];
            if let Some((_, extended_path)) = &extended {
                partial.push(extended_path);
            }
            self.remove_partial(err, &partial)
        })?;
        node.add_publink(publink.to_string())?;
        if let Some((extended, _)) = extended {
            extended.add_publink(publink.to_string())?;
        }
        log::debug!("Pinned {} at {}", publink, base_path);
        Ok(())
    }

    /// Delete every file tagged with `publink`. Returns the paths deleted.
    pub fn unpin(&self, publink: &Publink) -> Result<Vec<SiaPath>, RenterError> {
        let tag = publink.to_string();
        let mut deleted = Vec::new();
        for path in self.fs.walk_files(&SiaPath::root())? {
            let node = match self.fs.open_file(&path) {
                Ok(node) => node,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            if node.read(|file| file.publinks().contains(&tag)) {
                drop(node);
                self.fs.delete_file(&path)?;
                deleted.push(path);
            }
        }
        Ok(deleted)
    }

    pub fn blacklist(&self) -> Vec<SectorRoot> {
        self.blacklist.blacklist()
    }

    pub fn is_blacklisted(&self, publink: &Publink) -> bool {
        self.blacklist.is_blacklisted(publink)
    }

    pub fn update_blacklist(&self, additions: &[Publink], removals: &[Publink]) -> Result<(), RenterError> {
        self.blacklist.update_blacklist(additions, removals)?;
        Event::publish(
            &self.event_publisher,
            Event::UpdateBlacklist(UpdateBlacklistEvent {
                timestamp: SystemTime::now(),
                additions: additions.len(),
                removals: removals.len(),
            }),
        );
        Ok(())
    }

    pub(crate) fn close(&self) {
        self.blacklist.close();
    }

    /// Delete the files a failed upload left at `paths`, then hand back `err`. Nothing is deleted if the
    /// upload failed because a file already existed, since the files at `paths` are then not ours.
    fn remove_partial(&self, err: RenterError, paths: &[&SiaPath]) -> RenterError {
        if err.is_exists() {
            return err;
        }
        for path in paths {
            match self.fs.delete_file(path) {
                Ok(()) => log::debug!("Removed partial pubfile upload {}", path),
                Err(err) if err.is_not_found() => (),
                Err(err) => log::warn!("Failed to remove partial pubfile upload {}: {}", path, err),
            }
        }
        err
    }

    fn publish_upload(&self, upload: &PubfileUpload, path: &SiaPath) {
        Event::publish(
            &self.event_publisher,
            Event::UploadPubfile(UploadPubfileEvent {
                timestamp: SystemTime::now(),
                publink: upload.publink,
                path: path.to_string(),
                size: upload.size,
            }),
        );
    }
}
