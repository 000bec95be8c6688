/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Whole-object files saved under a versioned header.
//!
//! Layout: `header [16] | version [16] | length u64 LE | checksum [32] | body`, where the body is the
//! borsh encoding of the object and the checksum is the SHA-256 of the body. A file whose header or
//! version does not match what the caller expects, or whose body fails the checksum, is rejected.
//!
//! Objects can be written directly ([`save`], which is crash-safe through write-then-rename) or through
//! the [WAL](super::wal) with [`save_update`] and [`apply_update`].

use std::fs;
use std::path::{Path, PathBuf};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::errors::{NotFoundKind, RenterError, ResultExt};
use crate::persist::wal::Update;
use crate::persist::{remove_file_if_exists, write_file_atomic};
use crate::types::crypto_primitives::{hash_bytes, Specifier};

const PREFIX_LEN: usize = 16 + 16 + 8 + 32;

pub const UPDATE_NAME_REPLACE_FILE: &str = "ReplaceFile";
pub const UPDATE_NAME_DELETE_FILE: &str = "DeleteFile";

/// Identifies what a persisted file contains and which layout version it uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub header: Specifier,
    pub version: Specifier,
}

impl Metadata {
    pub const fn new(header: Specifier, version: Specifier) -> Metadata {
        Metadata { header, version }
    }
}

/// Encode `object` under `metadata`.
pub fn encode<T: BorshSerialize>(metadata: &Metadata, object: &T) -> Result<Vec<u8>, RenterError> {
    let body = object.try_to_vec().context("encoding persisted object")?;
    let mut bytes = Vec::with_capacity(PREFIX_LEN + body.len());
    bytes.extend_from_slice(&metadata.header);
    bytes.extend_from_slice(&metadata.version);
    bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&hash_bytes(&body).bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Like [`decode`], but ignores anything after the encoded object, such as the zero padding of a sector.
pub fn decode_padded<T: BorshDeserialize>(metadata: &Metadata, bytes: &[u8]) -> Result<T, RenterError> {
    if bytes.len() < PREFIX_LEN {
        return Err(RenterError::Encoding("persisted object is too short".into()));
    }
    let mut length = [0u8; 8];
    length.copy_from_slice(&bytes[32..40]);
    let end = (u64::from_le_bytes(length) as usize).saturating_add(PREFIX_LEN);
    if end > bytes.len() {
        return Err(RenterError::Encoding("persisted object is truncated".into()));
    }
    decode(metadata, &bytes[..end])
}

/// Decode an object previously produced by [`encode`] under the same `metadata`.
pub fn decode<T: BorshDeserialize>(metadata: &Metadata, bytes: &[u8]) -> Result<T, RenterError> {
    if bytes.len() < PREFIX_LEN {
        return Err(RenterError::Encoding("persisted file is too short".into()));
    }
    if bytes[..16] != metadata.header {
        return Err(RenterError::Encoding("persisted file has the wrong header".into()));
    }
    if bytes[16..32] != metadata.version {
        return Err(RenterError::Encoding("persisted file has the wrong version".into()));
    }
    let mut length = [0u8; 8];
    length.copy_from_slice(&bytes[32..40]);
    let length = u64::from_le_bytes(length) as usize;
    let body = &bytes[PREFIX_LEN..];
    if body.len() != length {
        return Err(RenterError::Encoding(format!(
            "persisted file body is {} bytes, header says {}",
            body.len(),
            length
        )));
    }
    if hash_bytes(body).bytes() != bytes[40..72] {
        return Err(RenterError::Encoding("persisted file checksum mismatch".into()));
    }
    T::try_from_slice(body).map_err(|err| RenterError::Encoding(err.to_string()))
}

/// Atomically write `object` to `path`.
pub fn save<T: BorshSerialize>(metadata: &Metadata, object: &T, path: &Path) -> Result<(), RenterError> {
    let bytes = encode(metadata, object)?;
    write_file_atomic(path, &bytes).context(format!("saving {}", path.display()))
}

/// Load the object stored at `path`. A missing file is reported as [`RenterError::NotFound`].
pub fn load<T: BorshDeserialize>(metadata: &Metadata, path: &Path) -> Result<T, RenterError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(RenterError::NotFound(NotFoundKind::File(path.display().to_string())))
        }
        Err(err) => return Err(RenterError::from(err).add_context(format!("loading {}", path.display()))),
    };
    decode(metadata, &bytes).context(format!("loading {}", path.display()))
}

#[derive(BorshSerialize, BorshDeserialize)]
struct ReplaceFileInstructions {
    path: String,
    data: Vec<u8>,
}

/// A WAL update that replaces the contents of `path` with `data`.
pub fn replace_file_update(path: &Path, data: Vec<u8>) -> Result<Update, RenterError> {
    let instructions = ReplaceFileInstructions {
        path: path.display().to_string(),
        data,
    }
    .try_to_vec()
    .context("encoding replace-file update")?;
    Ok(Update::new(UPDATE_NAME_REPLACE_FILE, instructions))
}

/// A WAL update that saves `object` to `path` under `metadata`.
pub fn save_update<T: BorshSerialize>(metadata: &Metadata, object: &T, path: &Path) -> Result<Update, RenterError> {
    replace_file_update(path, encode(metadata, object)?)
}

/// A WAL update that deletes `path`.
pub fn delete_file_update(path: &Path) -> Update {
    Update::new(UPDATE_NAME_DELETE_FILE, path.display().to_string().into_bytes())
}

/// Whether `update` is one of the updates applied by [`apply_update`].
pub fn is_file_update(update: &Update) -> bool {
    update.name == UPDATE_NAME_REPLACE_FILE || update.name == UPDATE_NAME_DELETE_FILE
}

/// The file a replace-file or delete-file update targets.
pub fn update_path(update: &Update) -> Result<PathBuf, RenterError> {
    match update.name.as_str() {
        UPDATE_NAME_REPLACE_FILE => ReplaceFileInstructions::try_from_slice(&update.instructions)
            .map(|instructions| PathBuf::from(instructions.path))
            .map_err(|err| RenterError::Encoding(err.to_string())),
        UPDATE_NAME_DELETE_FILE => String::from_utf8(update.instructions.clone())
            .map(PathBuf::from)
            .map_err(|err| RenterError::Encoding(err.to_string())),
        other => Err(RenterError::InvalidArgument(format!("unknown file update '{}'", other))),
    }
}

/// Apply a replace-file or delete-file update. Both are idempotent.
pub fn apply_update(update: &Update) -> Result<(), RenterError> {
    match update.name.as_str() {
        UPDATE_NAME_REPLACE_FILE => {
            let instructions = ReplaceFileInstructions::try_from_slice(&update.instructions)
                .map_err(|err| RenterError::Encoding(err.to_string()))?;
            write_file_atomic(&PathBuf::from(&instructions.path), &instructions.data)
                .context(format!("replacing {}", instructions.path))
        }
        UPDATE_NAME_DELETE_FILE => {
            let path = String::from_utf8(update.instructions.clone())
                .map_err(|err| RenterError::Encoding(err.to_string()))?;
            remove_file_if_exists(Path::new(&path)).context(format!("deleting {}", path))
        }
        other => Err(RenterError::InvalidArgument(format!("unknown file update '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::crypto_primitives::new_specifier;

    const METADATA: Metadata = Metadata::new(new_specifier("TestObject"), new_specifier("v1"));

    #[derive(BorshSerialize, BorshDeserialize, Debug, PartialEq)]
    struct Object {
        name: String,
        count: u64,
    }

    #[test]
    fn header_mismatch_and_corruption_are_rejected() {
        let object = Object {
            name: "alpha".into(),
            count: 3,
        };
        let mut bytes = encode(&METADATA, &object).unwrap();
        assert_eq!(decode::<Object>(&METADATA, &bytes).unwrap(), object);

        let other = Metadata::new(new_specifier("TestObject"), new_specifier("v2"));
        assert!(decode::<Object>(&other, &bytes).is_err());

        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(decode::<Object>(&METADATA, &bytes).is_err());
    }

    #[test]
    fn updates_replace_and_delete_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object.dat");
        let object = Object {
            name: "beta".into(),
            count: 9,
        };
        apply_update(&save_update(&METADATA, &object, &path).unwrap()).unwrap();
        assert_eq!(load::<Object>(&METADATA, &path).unwrap(), object);

        let delete = delete_file_update(&path);
        apply_update(&delete).unwrap();
        apply_update(&delete).unwrap();
        assert!(load::<Object>(&METADATA, &path).unwrap_err().is_not_found());
    }
}
