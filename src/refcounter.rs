/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-contract sector reference counts.
//!
//! A refcounter file holds an 8-byte version header followed by one little-endian `u16` per sector of
//! the contract, giving the number of live references to that sector. A count that drops to zero marks
//! the sector as garbage that may be dropped from the contract.
//!
//! ## Update sessions
//!
//! The refcounter is never written directly. A caller opens an [`UpdateSession`] with
//! [`RefCounter::start_update`], which serialises all writers. Every mutating method of the session
//! returns idempotent [WAL updates](crate::persist::wal::Update) and records the new counts in memory, so
//! [`RefCounter::count`] sees them before they reach the disk. [`UpdateSession::apply`] commits the
//! updates to the WAL, applies them to the file, and ends the session. A session dropped without being
//! applied discards its in-memory changes.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::{RenterError, ResultExt};
use crate::persist::{open_options, remove_file_if_exists};
use crate::persist::versioned_file::{self, UPDATE_NAME_DELETE_FILE};
use crate::persist::wal::{create_and_apply_transaction, Update, Wal};

/// Version header of every refcounter file.
pub const REFCOUNTER_VERSION: [u8; 8] = [1, 0, 0, 0, 0, 0, 0, 0];

/// Size of the refcounter header in bytes.
pub const REFCOUNTER_HEADER_SIZE: u64 = 8;

pub const UPDATE_NAME_WRITE_AT: &str = "RC_WRITE_AT";
pub const UPDATE_NAME_TRUNCATE: &str = "RC_TRUNCATE";

#[derive(Debug, thiserror::Error)]
pub enum RefcounterError {
    #[error("invalid refcounter header data")]
    InvalidHeader,

    #[error("invalid refcounter version: expected {expected:?}, got {found:?}")]
    InvalidVersion { expected: [u8; 8], found: [u8; 8] },

    #[error("invalid sector {index}: refcounter holds {num_sectors} sectors")]
    InvalidSectorNumber { index: u64, num_sectors: u64 },

    #[error("sector count overflow at sector {index}")]
    Overflow { index: u64 },

    #[error("sector count underflow at sector {index}")]
    Underflow { index: u64 },

    #[error("refcounter was deleted")]
    Deleted,

    #[error("malformed refcounter update: {0}")]
    MalformedUpdate(String),
}

struct RefCounterState {
    num_sectors: u64,
    // Values written by the current update session but not yet applied to disk.
    pending: HashMap<u64, u16>,
    deleted: bool,
}

/// Reference counts for the sectors of one contract.
pub struct RefCounter {
    path: PathBuf,
    wal: Arc<Wal>,
    state: Mutex<RefCounterState>,
    update_lock: Mutex<()>,
}

impl RefCounter {
    /// Create a refcounter for a contract that already holds `num_sectors` sectors, each referenced once.
    pub fn new(path: &Path, num_sectors: u64, wal: Arc<Wal>) -> Result<RefCounter, RenterError> {
        let mut bytes = Vec::with_capacity((REFCOUNTER_HEADER_SIZE + 2 * num_sectors) as usize);
        bytes.extend_from_slice(&REFCOUNTER_VERSION);
        for _ in 0..num_sectors {
            bytes.extend_from_slice(&1u16.to_le_bytes());
        }
        let update = versioned_file::replace_file_update(path, bytes)?;
        create_and_apply_transaction(&wal, vec![update], apply_updates).context("creating refcounter")?;
        Ok(RefCounter {
            path: path.to_path_buf(),
            wal,
            state: Mutex::new(RefCounterState {
                num_sectors,
                pending: HashMap::new(),
                deleted: false,
            }),
            update_lock: Mutex::new(()),
        })
    }

    /// Load the refcounter stored at `path`.
    pub fn load(path: &Path, wal: Arc<Wal>) -> Result<RefCounter, RenterError> {
        let mut file = File::open(path).context(format!("opening refcounter {}", path.display()))?;
        let mut header = [0u8; REFCOUNTER_HEADER_SIZE as usize];
        file.read_exact(&mut header)
            .map_err(|_| RefcounterError::InvalidHeader)?;
        if header != REFCOUNTER_VERSION {
            return Err(RefcounterError::InvalidVersion {
                expected: REFCOUNTER_VERSION,
                found: header,
            }
            .into());
        }
        let size = file.metadata().context("reading refcounter size")?.len();
        let num_sectors = (size - REFCOUNTER_HEADER_SIZE) / 2;
        Ok(RefCounter {
            path: path.to_path_buf(),
            wal,
            state: Mutex::new(RefCounterState {
                num_sectors,
                pending: HashMap::new(),
                deleted: false,
            }),
            update_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> MutexGuard<'_, RefCounterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of sectors tracked, including changes of an in-progress session.
    pub fn num_sectors(&self) -> u64 {
        self.state().num_sectors
    }

    /// Number of live references to sector `index`.
    pub fn count(&self, index: u64) -> Result<u16, RenterError> {
        let state = self.state();
        self.read_count(&state, index)
    }

    fn read_count(&self, state: &RefCounterState, index: u64) -> Result<u16, RenterError> {
        if state.deleted {
            return Err(RefcounterError::Deleted.into());
        }
        if index >= state.num_sectors {
            return Err(RefcounterError::InvalidSectorNumber {
                index,
                num_sectors: state.num_sectors,
            }
            .into());
        }
        if let Some(count) = state.pending.get(&index) {
            return Ok(*count);
        }
        let mut file = File::open(&self.path).context("opening refcounter")?;
        file.seek(SeekFrom::Start(offset(index))).context("seeking refcounter")?;
        let mut bytes = [0u8; 2];
        file.read_exact(&mut bytes).context("reading refcounter")?;
        Ok(u16::from_le_bytes(bytes))
    }

    /// Become the only writer of this refcounter until the returned session is applied or dropped.
    pub fn start_update(&self) -> Result<UpdateSession<'_>, RenterError> {
        let guard = self.update_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = self.state();
        if state.deleted {
            return Err(RefcounterError::Deleted.into());
        }
        let num_sectors_before = state.num_sectors;
        drop(state);
        Ok(UpdateSession {
            refcounter: self,
            _guard: guard,
            num_sectors_before,
            deleted: false,
            applied: false,
        })
    }
}

/// Exclusive write access to a [`RefCounter`].
pub struct UpdateSession<'a> {
    refcounter: &'a RefCounter,
    _guard: MutexGuard<'a, ()>,
    num_sectors_before: u64,
    deleted: bool,
    applied: bool,
}

impl<'a> UpdateSession<'a> {
    fn check_index(state: &RefCounterState, index: u64) -> Result<(), RenterError> {
        if index >= state.num_sectors {
            return Err(RefcounterError::InvalidSectorNumber {
                index,
                num_sectors: state.num_sectors,
            }
            .into());
        }
        Ok(())
    }

    /// Track one more sector, referenced once.
    pub fn append(&mut self) -> Update {
        let mut state = self.refcounter.state();
        state.num_sectors += 1;
        let index = state.num_sectors - 1;
        state.pending.insert(index, 1);
        write_at_update(&self.refcounter.path, index, 1)
    }

    pub fn increment(&mut self, index: u64) -> Result<Update, RenterError> {
        let mut state = self.refcounter.state();
        Self::check_index(&state, index)?;
        let count = self.refcounter.read_count(&state, index)?;
        let count = count.checked_add(1).ok_or(RefcounterError::Overflow { index })?;
        state.pending.insert(index, count);
        Ok(write_at_update(&self.refcounter.path, index, count))
    }

    pub fn decrement(&mut self, index: u64) -> Result<Update, RenterError> {
        let mut state = self.refcounter.state();
        Self::check_index(&state, index)?;
        let count = self.refcounter.read_count(&state, index)?;
        let count = count.checked_sub(1).ok_or(RefcounterError::Underflow { index })?;
        state.pending.insert(index, count);
        Ok(write_at_update(&self.refcounter.path, index, count))
    }

    /// Stop tracking the last `n` sectors.
    pub fn drop_sectors(&mut self, n: u64) -> Result<Update, RenterError> {
        let mut state = self.refcounter.state();
        if n > state.num_sectors {
            return Err(RefcounterError::InvalidSectorNumber {
                index: n,
                num_sectors: state.num_sectors,
            }
            .into());
        }
        state.num_sectors -= n;
        let num_sectors = state.num_sectors;
        state.pending.retain(|index, _| *index < num_sectors);
        Ok(truncate_update(&self.refcounter.path, num_sectors))
    }

    /// Exchange the counts of sectors `first` and `second`.
    pub fn swap(&mut self, first: u64, second: u64) -> Result<Vec<Update>, RenterError> {
        let mut state = self.refcounter.state();
        Self::check_index(&state, first)?;
        Self::check_index(&state, second)?;
        let first_count = self.refcounter.read_count(&state, first)?;
        let second_count = self.refcounter.read_count(&state, second)?;
        state.pending.insert(first, second_count);
        state.pending.insert(second, first_count);
        Ok(vec![
            write_at_update(&self.refcounter.path, first, second_count),
            write_at_update(&self.refcounter.path, second, first_count),
        ])
    }

    /// Remove the refcounter file altogether.
    pub fn delete(&mut self) -> Update {
        self.deleted = true;
        versioned_file::delete_file_update(&self.refcounter.path)
    }

    /// Commit `updates` to the WAL, apply them, and end the session.
    pub fn apply(mut self, updates: Vec<Update>) -> Result<(), RenterError> {
        create_and_apply_transaction(&self.refcounter.wal, updates, apply_updates)?;
        let mut state = self.refcounter.state();
        state.pending.clear();
        if self.deleted {
            state.deleted = true;
        }
        self.applied = true;
        Ok(())
    }
}

impl<'a> Drop for UpdateSession<'a> {
    fn drop(&mut self) {
        if !self.applied {
            let mut state = self.refcounter.state();
            state.pending.clear();
            state.num_sectors = self.num_sectors_before;
        }
    }
}

fn offset(index: u64) -> u64 {
    REFCOUNTER_HEADER_SIZE + index * 2
}

/// `[index u64 LE][value u16 LE][path len u32 LE][path]`
fn write_at_update(path: &Path, index: u64, value: u16) -> Update {
    let path = path.display().to_string();
    let mut instructions = Vec::with_capacity(14 + path.len());
    instructions.extend_from_slice(&index.to_le_bytes());
    instructions.extend_from_slice(&value.to_le_bytes());
    instructions.extend_from_slice(&(path.len() as u32).to_le_bytes());
    instructions.extend_from_slice(path.as_bytes());
    Update::new(UPDATE_NAME_WRITE_AT, instructions)
}

/// `[new sector count u64 LE][path len u32 LE][path]`
fn truncate_update(path: &Path, num_sectors: u64) -> Update {
    let path = path.display().to_string();
    let mut instructions = Vec::with_capacity(12 + path.len());
    instructions.extend_from_slice(&num_sectors.to_le_bytes());
    instructions.extend_from_slice(&(path.len() as u32).to_le_bytes());
    instructions.extend_from_slice(path.as_bytes());
    Update::new(UPDATE_NAME_TRUNCATE, instructions)
}

fn read_path(bytes: &[u8], at: usize) -> Result<PathBuf, RenterError> {
    if bytes.len() < at + 4 {
        return Err(RefcounterError::MalformedUpdate("missing path length".into()).into());
    }
    let len = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as usize;
    let path = bytes
        .get(at + 4..at + 4 + len)
        .ok_or_else(|| RefcounterError::MalformedUpdate("path is truncated".into()))?;
    let path = std::str::from_utf8(path).map_err(|err| RefcounterError::MalformedUpdate(err.to_string()))?;
    Ok(PathBuf::from(path))
}

fn read_u64(bytes: &[u8]) -> Result<u64, RenterError> {
    let mut int = [0u8; 8];
    int.copy_from_slice(
        bytes
            .get(..8)
            .ok_or_else(|| RefcounterError::MalformedUpdate("instructions too short".into()))?,
    );
    Ok(u64::from_le_bytes(int))
}

/// Whether `update` is applied by [`apply_updates`].
pub fn is_refcounter_update(update: &Update) -> bool {
    update.name == UPDATE_NAME_WRITE_AT || update.name == UPDATE_NAME_TRUNCATE
}

/// The file `update` writes to.
fn update_target(update: &Update) -> Result<PathBuf, RenterError> {
    match update.name.as_str() {
        UPDATE_NAME_WRITE_AT => read_path(&update.instructions, 10),
        UPDATE_NAME_TRUNCATE => read_path(&update.instructions, 8),
        _ => versioned_file::update_path(update),
    }
}

/// Apply a batch of refcounter updates. A delete of a file makes every earlier update to that file in the
/// batch moot. Replace-file and delete-file updates are applied too, so one batch can carry both a
/// refcounter change and the record that goes with it.
pub fn apply_updates(updates: &[Update]) -> Result<(), RenterError> {
    let mut targets = Vec::with_capacity(updates.len());
    let mut last_delete: HashMap<PathBuf, usize> = HashMap::new();
    for (i, update) in updates.iter().enumerate() {
        let target = update_target(update)?;
        if update.name == UPDATE_NAME_DELETE_FILE {
            last_delete.insert(target.clone(), i);
        }
        targets.push(target);
    }

    let mut open_files: HashMap<PathBuf, File> = HashMap::new();
    for (i, (update, target)) in updates.iter().zip(targets).enumerate() {
        if last_delete.get(&target).map_or(false, |&deleted_at| i < deleted_at) {
            continue;
        }
        match update.name.as_str() {
            UPDATE_NAME_WRITE_AT => {
                let index = read_u64(&update.instructions)?;
                let value = update
                    .instructions
                    .get(8..10)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .ok_or_else(|| RefcounterError::MalformedUpdate("missing value".into()))?;
                let file = open_for_update(&mut open_files, target)?;
                file.seek(SeekFrom::Start(offset(index))).context("seeking refcounter")?;
                file.write_all(&value.to_le_bytes()).context("writing refcounter")?;
            }
            UPDATE_NAME_TRUNCATE => {
                let num_sectors = read_u64(&update.instructions)?;
                let file = open_for_update(&mut open_files, target)?;
                file.set_len(offset(num_sectors)).context("truncating refcounter")?;
            }
            _ if versioned_file::is_file_update(update) => {
                // The whole file is replaced or removed, so a handle opened earlier must not outlive it.
                if let Some(file) = open_files.remove(&target) {
                    file.sync_all().context("syncing refcounter")?;
                }
                versioned_file::apply_update(update)?;
            }
            other => {
                return Err(RefcounterError::MalformedUpdate(format!("unknown update type '{}'", other)).into());
            }
        }
    }
    for (_, file) in open_files {
        file.sync_all().context("syncing refcounter")?;
    }
    Ok(())
}

fn open_for_update(open_files: &mut HashMap<PathBuf, File>, path: PathBuf) -> Result<&mut File, RenterError> {
    match open_files.entry(path) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            let file = open_options()
                .read(true)
                .write(true)
                .create(true)
                .open(entry.key())
                .context(format!("opening refcounter {}", entry.key().display()))?;
            Ok(entry.insert(file))
        }
    }
}

/// Size in bytes a refcounter tracking `num_sectors` sectors has on disk.
pub fn file_size(num_sectors: u64) -> u64 {
    offset(num_sectors)
}

/// Remove a refcounter file outside of any session. Used when a contract is archived.
pub fn remove(path: &Path) -> Result<(), RenterError> {
    remove_file_if_exists(path).context("removing refcounter")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_refcounter(num_sectors: u64) -> (tempfile::TempDir, RefCounter) {
        let dir = tempfile::tempdir().unwrap();
        let (wal, _) = Wal::open(&dir.path().join("wal")).unwrap();
        let rc = RefCounter::new(&dir.path().join("contract.rc"), num_sectors, wal).unwrap();
        (dir, rc)
    }

    fn len_on_disk(rc: &RefCounter) -> u64 {
        std::fs::metadata(rc.path()).unwrap().len()
    }

    #[test]
    fn pending_counts_are_visible_before_apply() {
        let (_dir, rc) = new_refcounter(2);
        let mut session = rc.start_update().unwrap();
        let update = session.increment(0).unwrap();
        assert_eq!(rc.count(0).unwrap(), 2);
        session.apply(vec![update]).unwrap();
        assert_eq!(rc.count(0).unwrap(), 2);
    }

    #[test]
    fn dropped_session_discards_changes() {
        let (_dir, rc) = new_refcounter(2);
        {
            let mut session = rc.start_update().unwrap();
            session.append();
            session.increment(1).unwrap();
        }
        assert_eq!(rc.num_sectors(), 2);
        assert_eq!(rc.count(1).unwrap(), 1);
    }

    #[test]
    fn swap_twice_is_identity() {
        let (_dir, rc) = new_refcounter(3);
        let mut session = rc.start_update().unwrap();
        let mut updates = vec![session.increment(2).unwrap()];
        updates.extend(session.swap(0, 2).unwrap());
        session.apply(updates).unwrap();
        assert_eq!(rc.count(0).unwrap(), 2);
        assert_eq!(rc.count(2).unwrap(), 1);

        let mut session = rc.start_update().unwrap();
        let updates = session.swap(0, 2).unwrap();
        session.apply(updates).unwrap();
        assert_eq!(rc.count(0).unwrap(), 1);
        assert_eq!(rc.count(2).unwrap(), 2);
    }

    #[test]
    fn delete_subsumes_earlier_updates() {
        let (_dir, rc) = new_refcounter(2);
        let mut session = rc.start_update().unwrap();
        let updates = vec![session.increment(0).unwrap(), session.delete()];
        session.apply(updates).unwrap();
        assert!(!rc.path().exists());
        assert!(rc.count(0).is_err());
        assert!(rc.start_update().is_err());
    }

    #[test]
    fn increments_and_decrements_cancel_out() {
        let (_dir, rc) = new_refcounter(3);
        let mut session = rc.start_update().unwrap();
        let updates = vec![
            session.increment(1).unwrap(),
            session.increment(1).unwrap(),
            session.decrement(1).unwrap(),
            session.decrement(1).unwrap(),
            session.decrement(1).unwrap(),
        ];
        session.apply(updates).unwrap();
        assert_eq!(rc.count(1).unwrap(), 0);
        assert_eq!(len_on_disk(&rc), file_size(3));

        let mut session = rc.start_update().unwrap();
        assert!(matches!(
            session.decrement(1),
            Err(RenterError::Refcounter(RefcounterError::Underflow { index: 1 }))
        ));
    }

    #[test]
    fn file_length_follows_the_sector_count() {
        let (_dir, rc) = new_refcounter(1);
        assert_eq!(len_on_disk(&rc), file_size(1));

        let mut session = rc.start_update().unwrap();
        let updates = vec![session.append(), session.append()];
        session.apply(updates).unwrap();
        assert_eq!(rc.num_sectors(), 3);
        assert_eq!(len_on_disk(&rc), REFCOUNTER_HEADER_SIZE + 2 * 3);
        assert_eq!(rc.count(2).unwrap(), 1);

        let mut session = rc.start_update().unwrap();
        let update = session.drop_sectors(3).unwrap();
        session.apply(vec![update]).unwrap();
        assert_eq!(rc.num_sectors(), 0);
        assert_eq!(len_on_disk(&rc), REFCOUNTER_HEADER_SIZE);

        let mut session = rc.start_update().unwrap();
        assert!(session.drop_sectors(1).is_err());
    }
}
