/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Durable storage primitives shared by every renter subsystem.
//!
//! 1. [`wal`]: the write-ahead log. Multi-step changes to files are first described as idempotent
//!    [`Update`](wal::Update)s and committed to the log; only then are they applied. Updates that were
//!    committed but not yet marked applied are replayed on startup.
//! 2. [`versioned_file`]: whole objects saved under a `{header, version, length, checksum}` prefix,
//!    either directly (write temp file, fsync, rename) or through the WAL.
//! 3. [`append_only`]: journals that only ever grow, with a persisted length so that a torn append is
//!    ignored on load.
//!
//! Files are created owner-only (`0600`) and directories owner-only (`0700`).

pub mod append_only;

pub mod versioned_file;

pub mod wal;

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::path::Path;

/// Permission bits of every file the renter creates.
pub const DEFAULT_FILE_PERM: u32 = 0o600;

/// Permission bits of every directory the renter creates.
pub const DEFAULT_DIR_PERM: u32 = 0o700;

/// Create `path` and all of its parents with owner-only permissions.
pub fn create_dir_all(path: &Path) -> io::Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DEFAULT_DIR_PERM);
    }
    builder.create(path)
}

/// Open options that create files with owner-only permissions.
pub fn open_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(DEFAULT_FILE_PERM);
    }
    options
}

/// Atomically replace the contents of `path` with `bytes`: write a sibling temp file, fsync it, and
/// rename it over the destination.
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    {
        let mut file = open_options().write(true).create(true).truncate(true).open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        // Persist the rename itself. Directories cannot be opened for syncing on every platform.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Remove `path`, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
