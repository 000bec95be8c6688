/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The write-ahead log.
//!
//! ## Transaction lifecycle
//!
//! 1. [`Wal::new_transaction`] durably records the transaction's [`Update`]s (a `Begin` record).
//! 2. [`Transaction::signal_setup_complete`] commits it (a `Commit` record). From this point on the
//!    updates *will* be applied, either now or on the next startup.
//! 3. The caller applies the updates to their files.
//! 4. [`Transaction::signal_updates_applied`] records that the updates are on disk (an `Applied` record).
//!    When no transaction is outstanding any more the log is truncated.
//!
//! A transaction that never reached step 2 is discarded on startup; one that reached step 2 but not
//! step 4 is handed back by [`Wal::open`] for replay. Updates must therefore be idempotent.
//!
//! ## On-disk format
//!
//! The log is a sequence of records, each framed as `[len: u32 LE][checksum: 32 bytes][borsh payload]`.
//! A torn or corrupted trailing record ends the log.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::errors::{RenterError, ResultExt};
use crate::persist::{create_dir_all, open_options};
use crate::types::crypto_primitives::hash_bytes;

/// One idempotent change to a file. `name` selects the applier, `instructions` is its encoded payload.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Update {
    pub name: String,
    pub instructions: Vec<u8>,
}

impl Update {
    pub fn new(name: &str, instructions: Vec<u8>) -> Update {
        Update {
            name: name.to_string(),
            instructions,
        }
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
enum WalRecord {
    Begin { txn: u64, updates: Vec<Update> },
    Commit { txn: u64 },
    Applied { txn: u64 },
}

struct WalState {
    file: File,
    next_txn: u64,
    outstanding: BTreeSet<u64>,
}

pub struct Wal {
    path: PathBuf,
    state: Mutex<WalState>,
}

/// A set of updates recorded in the [`Wal`].
pub struct Transaction {
    wal: Arc<Wal>,
    id: u64,
    updates: Vec<Update>,
    committed: bool,
    applied: bool,
}

impl Wal {
    /// Open (or create) the log at `path`. Returns the log and every committed transaction whose updates
    /// were not marked applied; the caller must apply them and signal each one.
    pub fn open(path: &Path) -> Result<(Arc<Wal>, Vec<Transaction>), RenterError> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent).context("creating wal directory")?;
        }
        let mut file = open_options()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .context("opening wal")?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).context("reading wal")?;

        let mut begun: Vec<(u64, Vec<Update>)> = Vec::new();
        let mut committed = BTreeSet::new();
        let mut applied = BTreeSet::new();
        let mut max_txn = 0;
        for record in decode_records(&bytes) {
            match record {
                WalRecord::Begin { txn, updates } => {
                    max_txn = max_txn.max(txn);
                    begun.push((txn, updates));
                }
                WalRecord::Commit { txn } => {
                    committed.insert(txn);
                }
                WalRecord::Applied { txn } => {
                    applied.insert(txn);
                }
            }
        }

        let recovered: Vec<(u64, Vec<Update>)> = begun
            .into_iter()
            .filter(|(txn, _)| committed.contains(txn) && !applied.contains(txn))
            .collect();
        if recovered.is_empty() {
            file.set_len(0).context("truncating wal")?;
        }
        let outstanding = recovered.iter().map(|(txn, _)| *txn).collect();

        let wal = Arc::new(Wal {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                file,
                next_txn: max_txn + 1,
                outstanding,
            }),
        });
        let txns = recovered
            .into_iter()
            .map(|(id, updates)| Transaction {
                wal: wal.clone(),
                id,
                updates,
                committed: true,
                applied: false,
            })
            .collect();
        Ok((wal, txns))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, WalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Durably record `updates` as a new, uncommitted transaction.
    pub fn new_transaction(self: &Arc<Self>, updates: Vec<Update>) -> Result<Transaction, RenterError> {
        let mut state = self.lock();
        let id = state.next_txn;
        state.next_txn += 1;
        write_record(
            &mut state.file,
            &WalRecord::Begin {
                txn: id,
                updates: updates.clone(),
            },
        )?;
        state.outstanding.insert(id);
        Ok(Transaction {
            wal: self.clone(),
            id,
            updates,
            committed: false,
            applied: false,
        })
    }

    /// Number of transactions recorded but not yet applied.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn updates(&self) -> &[Update] {
        &self.updates
    }

    /// Commit the transaction. After this returns the updates will survive a crash.
    pub fn signal_setup_complete(&mut self) -> Result<(), RenterError> {
        if self.committed {
            return Ok(());
        }
        let mut state = self.wal.lock();
        write_record(&mut state.file, &WalRecord::Commit { txn: self.id })?;
        self.committed = true;
        Ok(())
    }

    /// Mark the transaction's updates as applied.
    pub fn signal_updates_applied(mut self) -> Result<(), RenterError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), RenterError> {
        if self.applied {
            return Ok(());
        }
        self.applied = true;
        let mut state = self.wal.lock();
        if self.committed {
            write_record(&mut state.file, &WalRecord::Applied { txn: self.id })?;
        }
        state.outstanding.remove(&self.id);
        if state.outstanding.is_empty() {
            state.file.set_len(0).context("truncating wal")?;
            state.file.sync_all().context("syncing wal")?;
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // An uncommitted transaction that is dropped is abandoned; a committed one stays outstanding so
        // that it is replayed on the next startup.
        if !self.committed && !self.applied {
            let _ = self.release();
        }
    }
}

/// Record, commit, apply, and release `updates` in one go.
pub fn create_and_apply_transaction(
    wal: &Arc<Wal>,
    updates: Vec<Update>,
    apply: impl FnOnce(&[Update]) -> Result<(), RenterError>,
) -> Result<(), RenterError> {
    let mut txn = wal.new_transaction(updates)?;
    txn.signal_setup_complete()?;
    apply(txn.updates())?;
    txn.signal_updates_applied()
}

fn write_record(file: &mut File, record: &WalRecord) -> Result<(), RenterError> {
    let payload = record.try_to_vec().context("encoding wal record")?;
    let mut framed = Vec::with_capacity(payload.len() + 36);
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(&hash_bytes(&payload).bytes());
    framed.extend_from_slice(&payload);
    file.write_all(&framed).context("writing wal record")?;
    file.sync_all().context("syncing wal")?;
    Ok(())
}

fn decode_records(mut bytes: &[u8]) -> Vec<WalRecord> {
    let mut records = Vec::new();
    while bytes.len() >= 36 {
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() < 36 + len {
            break;
        }
        let checksum = &bytes[4..36];
        let payload = &bytes[36..36 + len];
        if hash_bytes(payload).bytes() != checksum {
            break;
        }
        match WalRecord::try_from_slice(payload) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        bytes = &bytes[36 + len..];
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_wal_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("renter.wal");
        (dir, path)
    }

    #[test]
    fn committed_but_unapplied_transactions_are_recovered() {
        let (_dir, path) = temp_wal_path();
        {
            let (wal, recovered) = Wal::open(&path).unwrap();
            assert!(recovered.is_empty());
            let mut committed = wal.new_transaction(vec![Update::new("a", vec![1])]).unwrap();
            committed.signal_setup_complete().unwrap();
            let _uncommitted = wal.new_transaction(vec![Update::new("b", vec![2])]).unwrap();
            // Simulate a crash: the committed transaction is never applied.
            std::mem::forget(committed);
        }
        let (_wal, recovered) = Wal::open(&path).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].updates(), &[Update::new("a", vec![1])]);
        for txn in recovered {
            txn.signal_updates_applied().unwrap();
        }
        let (wal, recovered) = Wal::open(&path).unwrap();
        assert!(recovered.is_empty());
        assert_eq!(wal.outstanding(), 0);
    }

    #[test]
    fn torn_trailing_record_is_ignored() {
        let (_dir, path) = temp_wal_path();
        {
            let (wal, _) = Wal::open(&path).unwrap();
            let mut txn = wal.new_transaction(vec![Update::new("a", vec![1, 2, 3])]).unwrap();
            txn.signal_setup_complete().unwrap();
            std::mem::forget(txn);
        }
        {
            let mut file = open_options().append(true).open(&path).unwrap();
            file.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        }
        let (_wal, recovered) = Wal::open(&path).unwrap();
        assert_eq!(recovered.len(), 1);
    }
}
