/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The set of base sector roots the renter refuses to create or fetch.
//!
//! The set lives in memory and every change is appended to a journal as 33-byte entries,
//! `{merkle root [32], listed u8}`. Loading replays the journal in order: `listed = 1` inserts the root,
//! `listed = 0` removes it.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use super::publink::Publink;
use crate::errors::RenterError;
use crate::persist::append_only::AppendOnlyFile;
use crate::persist::versioned_file::Metadata;
use crate::types::crypto_primitives::new_specifier;
use crate::types::data_types::SectorRoot;

pub const BLACKLIST_FILENAME: &str = "pubaccessblacklist";

const BLACKLIST_METADATA: Metadata = Metadata::new(new_specifier("PublicBlacklist\n"), new_specifier("v1.4.3\n"));

const ENTRY_SIZE: usize = 33;

struct BlacklistState {
    roots: HashSet<SectorRoot>,
    // None once closed.
    journal: Option<AppendOnlyFile>,
}

pub struct Blacklist {
    state: Mutex<BlacklistState>,
}

impl Blacklist {
    /// Open the blacklist journal in `persist_dir`, creating it if missing.
    pub fn open(persist_dir: &Path) -> Result<Blacklist, RenterError> {
        let (journal, data) = AppendOnlyFile::open(&persist_dir.join(BLACKLIST_FILENAME), &BLACKLIST_METADATA)?;
        if data.len() % ENTRY_SIZE != 0 {
            return Err(RenterError::Encoding(format!(
                "blacklist journal holds {} bytes, not a whole number of entries",
                data.len()
            )));
        }
        let mut roots = HashSet::new();
        for entry in data.chunks(ENTRY_SIZE) {
            let mut root = [0u8; 32];
            root.copy_from_slice(&entry[..32]);
            let root = SectorRoot::new(root);
            match entry[32] {
                1 => {
                    roots.insert(root);
                }
                0 => {
                    roots.remove(&root);
                }
                listed => {
                    return Err(RenterError::Encoding(format!("blacklist entry has listed flag {}", listed)));
                }
            }
        }
        log::debug!("Loaded {} blacklisted roots", roots.len());
        Ok(Blacklist {
            state: Mutex::new(BlacklistState {
                roots,
                journal: Some(journal),
            }),
        })
    }

    /// Every blacklisted root, sorted.
    pub fn blacklist(&self) -> Vec<SectorRoot> {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut roots: Vec<SectorRoot> = state.roots.iter().copied().collect();
        roots.sort_by_key(|root| root.bytes());
        roots
    }

    pub fn is_blacklisted(&self, publink: &Publink) -> bool {
        self.is_root_blacklisted(&publink.merkle_root())
    }

    pub fn is_root_blacklisted(&self, root: &SectorRoot) -> bool {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.roots.contains(root)
    }

    /// Blacklist the roots of `additions` and lift the roots of `removals`, in that order. The journal is
    /// written before the set changes, so a failed write leaves the set as it was.
    pub fn update_blacklist(&self, additions: &[Publink], removals: &[Publink]) -> Result<(), RenterError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries = Vec::with_capacity((additions.len() + removals.len()) * ENTRY_SIZE);
        for (publinks, listed) in [(additions, 1u8), (removals, 0u8)] {
            for publink in publinks {
                entries.extend_from_slice(&publink.merkle_root().bytes());
                entries.push(listed);
            }
        }
        match state.journal.as_mut() {
            Some(journal) => journal.append(&entries)?,
            None => return Err(RenterError::Shutdown),
        }
        for publink in additions {
            state.roots.insert(publink.merkle_root());
        }
        for publink in removals {
            state.roots.remove(&publink.merkle_root());
        }
        Ok(())
    }

    /// Release the journal. Queries keep answering from memory; updates fail.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.journal = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publink(byte: u8) -> Publink {
        Publink::new_v1(SectorRoot::new([byte; 32]), 0, 4096).unwrap()
    }

    #[test]
    fn updates_are_replayed_in_order_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let blacklist = Blacklist::open(dir.path()).unwrap();
            blacklist.update_blacklist(&[publink(1), publink(2)], &[]).unwrap();
            blacklist.update_blacklist(&[publink(3)], &[publink(1)]).unwrap();
            assert!(!blacklist.is_blacklisted(&publink(1)));
            assert!(blacklist.is_blacklisted(&publink(2)));
            blacklist.close();
            assert!(matches!(
                blacklist.update_blacklist(&[publink(4)], &[]),
                Err(RenterError::Shutdown)
            ));
        }
        let blacklist = Blacklist::open(dir.path()).unwrap();
        assert_eq!(
            blacklist.blacklist(),
            vec![SectorRoot::new([2u8; 32]), SectorRoot::new([3u8; 32])]
        );
    }

    #[test]
    fn a_root_listed_and_lifted_in_one_update_ends_up_lifted() {
        let dir = tempfile::tempdir().unwrap();
        let blacklist = Blacklist::open(dir.path()).unwrap();
        blacklist.update_blacklist(&[publink(5)], &[publink(5)]).unwrap();
        assert!(blacklist.blacklist().is_empty());
    }
}
