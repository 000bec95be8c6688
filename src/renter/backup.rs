/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Backups of the file system's metadata, stored with the renter's own hosts.
//!
//! A backup is an archive of every directory and siafile outside `snapshots`. It is uploaded like any
//! other file, to `snapshots/<name>`, and the metadata of that file is then written to the snapshot
//! table every host keeps for us. A renter that lost its disk but recovered its contracts can therefore
//! list the tables, download the archive, and get its files back.

use std::io::Cursor;

use borsh::{BorshDeserialize, BorshSerialize};

use super::Renter;
use crate::erasure::ErasureCode;
use crate::errors::{NotFoundKind, RenterError, ResultExt};
use crate::filesystem::now_secs;
use crate::filesystem::path::SiaPath;
use crate::filesystem::siafile::{SiaFile, SIAFILE_METADATA};
use crate::persist::versioned_file::{self, Metadata};
use crate::types::crypto_primitives::new_specifier;
use crate::upload::FileUploadParams;
use crate::worker::snapshot::SnapshotEntry;

pub const BACKUP_METADATA: Metadata = Metadata::new(new_specifier("RenterBackup"), new_specifier("v1.4.0"));

#[derive(Debug, Default, PartialEq, BorshSerialize, BorshDeserialize)]
pub(crate) struct BackupArchive {
    /// Path and mode of every directory, parents before children.
    pub(crate) dirs: Vec<(String, u32)>,
    pub(crate) files: Vec<(String, SiaFile)>,
}

/// What a restore did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub dirs_created: usize,
    pub files_restored: usize,
    /// Files left alone because a file already exists at their path.
    pub files_skipped: usize,
}

impl Renter {
    /// Archive the file system and store the archive with every host that is good for upload.
    pub fn create_backup(&self, name: &str) -> Result<SnapshotEntry, RenterError> {
        let path = SiaPath::snapshots().join(name)?;
        let archive = self.archive_file_system()?;
        let bytes = versioned_file::encode(&BACKUP_METADATA, &archive)?;
        let size = bytes.len() as u64;

        // One full copy per host, so that any single host can hand the archive back.
        let parity = self.pool.len().saturating_sub(1).min(255) as u8;
        let params = FileUploadParams::builder()
            .path(path.clone())
            .erasure_code(ErasureCode::new(1, parity)?)
            .repair(false)
            .build();
        let file = self
            .uploader
            .upload_stream(params, &mut Cursor::new(bytes))
            .context(format!("uploading backup '{}'", name))?;

        let entry = SnapshotEntry {
            uid: rand::random(),
            name: name.to_string(),
            size,
            created: now_secs(),
            siafile: versioned_file::encode(&SIAFILE_METADATA, &file.metadata())?,
        };
        let stored = self.pool.upload_snapshot(&entry, self.downloader.timeout())?;
        if stored == 0 {
            return Err(RenterError::Transient(format!("no host stored the snapshot table of backup '{}'", name)));
        }
        log::info!("Backup '{}' of {} bytes stored with {} hosts", name, size, stored);
        Ok(entry)
    }

    /// Every backup any host knows about, oldest first.
    pub fn backups(&self) -> Result<Vec<SnapshotEntry>, RenterError> {
        self.pool.fetch_backups(self.downloader.timeout())
    }

    /// Download the backup called `name` and recreate its directories and files. Paths that already exist
    /// are never overwritten.
    pub fn restore_backup(&self, name: &str) -> Result<RestoreReport, RenterError> {
        let entry = self
            .backups()?
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| RenterError::NotFound(NotFoundKind::Backup(name.to_string())))?;

        let path = SiaPath::snapshots().join(name)?;
        if !self.fs.file_exists(&path) {
            let siafile: SiaFile = versioned_file::decode(&SIAFILE_METADATA, &entry.siafile)?;
            self.fs.import_file(&path, siafile)?;
        }
        let mut bytes = Vec::with_capacity(entry.size as usize);
        self.downloader
            .download(&path, 0, None, &mut bytes)
            .context(format!("downloading backup '{}'", name))?;
        let archive: BackupArchive = versioned_file::decode(&BACKUP_METADATA, &bytes)?;
        self.unpack(archive)
    }

    fn archive_file_system(&self) -> Result<BackupArchive, RenterError> {
        let snapshots = SiaPath::snapshots();
        let mut archive = BackupArchive::default();
        for dir in self.fs.walk_dirs(&SiaPath::root())? {
            if dir.is_root() || dir.is_within(&snapshots) {
                continue;
            }
            let mode = self.fs.open_dir(&dir)?.metadata().mode;
            archive.dirs.push((dir.to_string(), mode));
        }
        for file in self.fs.walk_files(&SiaPath::root())? {
            if file.is_within(&snapshots) {
                continue;
            }
            archive.files.push((file.to_string(), self.fs.open_file(&file)?.metadata()));
        }
        Ok(archive)
    }

    fn unpack(&self, archive: BackupArchive) -> Result<RestoreReport, RenterError> {
        let mut report = RestoreReport::default();
        for (dir, mode) in archive.dirs {
            let dir = SiaPath::new(&dir)?;
            if !self.fs.dir_exists(&dir) && !self.fs.file_exists(&dir) {
                self.fs.new_dir(&dir, mode)?;
                report.dirs_created += 1;
            }
        }
        for (file, siafile) in archive.files {
            let file = SiaPath::new(&file)?;
            if self.fs.file_exists(&file) || self.fs.dir_exists(&file) {
                report.files_skipped += 1;
                continue;
            }
            self.fs.import_file(&file, siafile)?;
            report.files_restored += 1;
        }
        if let Err(err) = self.fs.bubble_all(&SiaPath::root(), &self.pool.health_context()) {
            log::debug!("Failed to bubble the root after restoring a backup: {}", err);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_survives_encoding() {
        let archive = BackupArchive {
            dirs: vec![("home".into(), 0o755), ("home/photos".into(), 0o700)],
            files: Vec::new(),
        };
        let bytes = versioned_file::encode(&BACKUP_METADATA, &archive).unwrap();
        let decoded: BackupArchive = versioned_file::decode(&BACKUP_METADATA, &bytes).unwrap();
        assert_eq!(decoded, archive);
        assert!(versioned_file::decode::<BackupArchive>(&SIAFILE_METADATA, &bytes).is_err());
    }
}
