/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Journals that only ever grow.
//!
//! The first [`METADATA_PAGE_SIZE`] bytes of the file are a metadata page holding the header and version
//! specifiers and the persisted length of the file. Data is appended after the page; the persisted length
//! is only advanced once the appended bytes are synced, so a torn append is invisible on the next load.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{RenterError, ResultExt};
use crate::persist::versioned_file::Metadata;
use crate::persist::{create_dir_all, open_options};

/// Size of the metadata page at the start of every append-only file.
pub const METADATA_PAGE_SIZE: u64 = 4096;

const LENGTH_OFFSET: u64 = 32;

pub struct AppendOnlyFile {
    file: File,
    path: PathBuf,
    // Persisted length of the file, including the metadata page.
    length: u64,
}

impl AppendOnlyFile {
    /// Open or create the file at `path`, returning it along with every byte appended so far.
    pub fn open(path: &Path, metadata: &Metadata) -> Result<(AppendOnlyFile, Vec<u8>), RenterError> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent).context("creating journal directory")?;
        }
        let mut file = open_options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .context(format!("opening {}", path.display()))?;
        let size = file.metadata().context("reading journal size")?.len();

        if size == 0 {
            let mut page = vec![0u8; METADATA_PAGE_SIZE as usize];
            page[..16].copy_from_slice(&metadata.header);
            page[16..32].copy_from_slice(&metadata.version);
            page[32..40].copy_from_slice(&METADATA_PAGE_SIZE.to_le_bytes());
            file.write_all(&page).context("writing journal metadata")?;
            file.sync_all().context("syncing journal")?;
            let journal = AppendOnlyFile {
                file,
                path: path.to_path_buf(),
                length: METADATA_PAGE_SIZE,
            };
            return Ok((journal, Vec::new()));
        }

        let mut contents = Vec::with_capacity(size as usize);
        file.read_to_end(&mut contents).context("reading journal")?;
        if contents.len() < METADATA_PAGE_SIZE as usize {
            return Err(RenterError::Encoding(format!("{} has a truncated metadata page", path.display())));
        }
        if contents[..16] != metadata.header {
            return Err(RenterError::Encoding(format!("{} has the wrong header", path.display())));
        }
        if contents[16..32] != metadata.version {
            return Err(RenterError::Encoding(format!("{} has the wrong version", path.display())));
        }
        let mut length = [0u8; 8];
        length.copy_from_slice(&contents[32..40]);
        let length = u64::from_le_bytes(length);
        if length < METADATA_PAGE_SIZE || length > contents.len() as u64 {
            return Err(RenterError::Encoding(format!(
                "{} claims length {} but holds {} bytes",
                path.display(),
                length,
                contents.len()
            )));
        }
        let data = contents[METADATA_PAGE_SIZE as usize..length as usize].to_vec();
        let journal = AppendOnlyFile {
            file,
            path: path.to_path_buf(),
            length,
        };
        Ok((journal, data))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of data bytes in the journal, not counting the metadata page.
    pub fn data_len(&self) -> u64 {
        self.length - METADATA_PAGE_SIZE
    }

    /// Durably append `bytes`.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), RenterError> {
        self.file.seek(SeekFrom::Start(self.length)).context("seeking journal")?;
        self.file.write_all(bytes).context("appending to journal")?;
        self.file.sync_all().context("syncing journal")?;

        let new_length = self.length + bytes.len() as u64;
        self.file.seek(SeekFrom::Start(LENGTH_OFFSET)).context("seeking journal")?;
        self.file
            .write_all(&new_length.to_le_bytes())
            .context("updating journal length")?;
        self.file.sync_all().context("syncing journal")?;
        self.length = new_length;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::crypto_primitives::new_specifier;

    const METADATA: Metadata = Metadata::new(new_specifier("TestJournal\n"), new_specifier("v1\n"));

    #[test]
    fn appends_survive_reopen_and_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        {
            let (mut journal, data) = AppendOnlyFile::open(&path, &METADATA).unwrap();
            assert!(data.is_empty());
            journal.append(b"abc").unwrap();
            journal.append(b"de").unwrap();
            assert_eq!(journal.data_len(), 5);
        }
        {
            // Bytes written past the persisted length, as if a crash hit mid-append.
            let mut file = open_options().append(true).open(&path).unwrap();
            file.write_all(b"garbage").unwrap();
        }
        let (_journal, data) = AppendOnlyFile::open(&path, &METADATA).unwrap();
        assert_eq!(data, b"abcde");

        let other = Metadata::new(new_specifier("Other\n"), new_specifier("v1\n"));
        assert!(AppendOnlyFile::open(&path, &other).is_err());
    }
}
