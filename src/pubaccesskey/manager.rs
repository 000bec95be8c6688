/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The renter's collection of pubaccesskeys, indexed by ID and by name.
//!
//! Keys are journaled: adding a key appends it, deleting one appends a tombstone carrying its ID.
//! Loading replays the journal from the start.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use borsh::{BorshDeserialize, BorshSerialize};

use super::{check_name, Pubaccesskey, PubaccesskeyError, PubaccesskeyID, PubaccesskeyType, PUBACCESSKEY_ID_LEN};
use crate::errors::{NotFoundKind, RenterError};
use crate::persist::append_only::AppendOnlyFile;
use crate::persist::versioned_file::Metadata;
use crate::types::crypto_primitives::new_specifier;

pub const PUBACCESSKEY_FILENAME: &str = "pubaccesskeys.dat";

const PUBACCESSKEY_METADATA: Metadata = Metadata::new(new_specifier("PubaccesskeyFile"), new_specifier("1.4.4.0"));

#[derive(BorshSerialize, BorshDeserialize)]
enum KeyRecord {
    Add { name: String, key_type: u8, entropy: Vec<u8> },
    Delete { id: [u8; PUBACCESSKEY_ID_LEN] },
}

struct KeySet {
    ids_by_name: HashMap<String, PubaccesskeyID>,
    keys_by_id: HashMap<PubaccesskeyID, Pubaccesskey>,
    journal: AppendOnlyFile,
}

impl KeySet {
    fn insert(&mut self, key: Pubaccesskey) {
        self.ids_by_name.insert(key.name.clone(), key.id());
        self.keys_by_id.insert(key.id(), key);
    }

    fn remove(&mut self, id: &PubaccesskeyID) -> Option<Pubaccesskey> {
        let key = self.keys_by_id.remove(id)?;
        self.ids_by_name.remove(&key.name);
        Some(key)
    }

    fn check_unique(&self, key: &Pubaccesskey) -> Result<(), PubaccesskeyError> {
        if self.keys_by_id.contains_key(&key.id()) {
            return Err(PubaccesskeyError::IdExists(key.id()));
        }
        if self.ids_by_name.contains_key(&key.name) {
            return Err(PubaccesskeyError::NameExists(key.name.clone()));
        }
        Ok(())
    }

    fn append(&mut self, record: &KeyRecord) -> Result<(), RenterError> {
        let bytes = record
            .try_to_vec()
            .map_err(|err| RenterError::Encoding(format!("encoding pubaccesskey record: {}", err)))?;
        self.journal.append(&bytes)
    }
}

pub struct PubaccesskeyManager {
    keys: Mutex<KeySet>,
}

impl PubaccesskeyManager {
    /// Open the key journal in `persist_dir`, creating it if missing.
    pub fn open(persist_dir: &Path) -> Result<PubaccesskeyManager, RenterError> {
        let (journal, data) = AppendOnlyFile::open(&persist_dir.join(PUBACCESSKEY_FILENAME), &PUBACCESSKEY_METADATA)?;
        let mut keys = KeySet {
            ids_by_name: HashMap::new(),
            keys_by_id: HashMap::new(),
            journal,
        };
        let mut remaining = &data[..];
        while !remaining.is_empty() {
            let record = KeyRecord::deserialize(&mut remaining)
                .map_err(|err| RenterError::Encoding(format!("decoding pubaccesskey record: {}", err)))?;
            match record {
                KeyRecord::Add { name, key_type, entropy } => {
                    let key_type = PubaccesskeyType::from_tag(key_type)
                        .ok_or_else(|| RenterError::Encoding(format!("pubaccesskey type tag {}", key_type)))?;
                    keys.insert(Pubaccesskey::from_entropy(&name, key_type, &entropy)?);
                }
                KeyRecord::Delete { id } => {
                    keys.remove(&PubaccesskeyID(id));
                }
            }
        }
        log::debug!("Loaded {} pubaccesskeys", keys.keys_by_id.len());
        Ok(PubaccesskeyManager { keys: Mutex::new(keys) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KeySet> {
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generate and store a key.
    pub fn create_key(&self, name: &str, key_type: PubaccesskeyType) -> Result<Pubaccesskey, RenterError> {
        check_name(name)?;
        let mut keys = self.lock();
        if keys.ids_by_name.contains_key(name) {
            return Err(PubaccesskeyError::NameExists(name.to_string()).into());
        }
        let key = Pubaccesskey::generate(name, key_type)?;
        self.save(&mut keys, key.clone())?;
        Ok(key)
    }

    /// Store a key created elsewhere.
    pub fn add_key(&self, key: Pubaccesskey) -> Result<(), RenterError> {
        check_name(&key.name)?;
        let mut keys = self.lock();
        self.save(&mut keys, key)
    }

    fn save(&self, keys: &mut KeySet, key: Pubaccesskey) -> Result<(), RenterError> {
        keys.check_unique(&key)?;
        keys.append(&KeyRecord::Add {
            name: key.name.clone(),
            key_type: key.key_type.tag(),
            entropy: key.entropy().to_vec(),
        })?;
        keys.insert(key);
        Ok(())
    }

    pub fn key_by_id(&self, id: &PubaccesskeyID) -> Result<Pubaccesskey, RenterError> {
        self.lock()
            .keys_by_id
            .get(id)
            .cloned()
            .ok_or_else(|| RenterError::NotFound(NotFoundKind::Pubaccesskey(id.to_string())))
    }

    pub fn id_by_name(&self, name: &str) -> Result<PubaccesskeyID, RenterError> {
        self.lock()
            .ids_by_name
            .get(name)
            .copied()
            .ok_or_else(|| RenterError::NotFound(NotFoundKind::Pubaccesskey(name.to_string())))
    }

    pub fn key_by_name(&self, name: &str) -> Result<Pubaccesskey, RenterError> {
        let keys = self.lock();
        keys.ids_by_name
            .get(name)
            .and_then(|id| keys.keys_by_id.get(id))
            .cloned()
            .ok_or_else(|| RenterError::NotFound(NotFoundKind::Pubaccesskey(name.to_string())))
    }

    pub fn delete_key_by_id(&self, id: &PubaccesskeyID) -> Result<(), RenterError> {
        let mut keys = self.lock();
        if !keys.keys_by_id.contains_key(id) {
            return Err(RenterError::NotFound(NotFoundKind::Pubaccesskey(id.to_string())));
        }
        keys.append(&KeyRecord::Delete { id: id.bytes() })?;
        keys.remove(id);
        Ok(())
    }

    pub fn delete_key_by_name(&self, name: &str) -> Result<(), RenterError> {
        let id = self.id_by_name(name)?;
        self.delete_key_by_id(&id)
    }

    /// Every key, in no particular order.
    pub fn keys(&self) -> Vec<Pubaccesskey> {
        self.lock().keys_by_id.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_survive_reopen_and_deletes_stick() {
        let dir = tempfile::tempdir().unwrap();
        let (kept, deleted) = {
            let manager = PubaccesskeyManager::open(dir.path()).unwrap();
            let kept = manager.create_key("kept", PubaccesskeyType::PublicID).unwrap();
            let deleted = manager.create_key("deleted", PubaccesskeyType::PrivateID).unwrap();
            manager.delete_key_by_name("deleted").unwrap();
            (kept, deleted)
        };
        let manager = PubaccesskeyManager::open(dir.path()).unwrap();
        assert_eq!(manager.key_by_name("kept").unwrap(), kept);
        assert_eq!(manager.key_by_id(&kept.id()).unwrap(), kept);
        assert_eq!(manager.id_by_name("kept").unwrap(), kept.id());
        assert!(manager.key_by_id(&deleted.id()).unwrap_err().is_not_found());
        assert_eq!(manager.keys().len(), 1);

        // The name of a deleted key is free again.
        manager.add_key(deleted.clone()).unwrap();
        assert_eq!(manager.key_by_name("deleted").unwrap(), deleted);
    }

    #[test]
    fn duplicates_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PubaccesskeyManager::open(dir.path()).unwrap();
        let key = manager.create_key("key", PubaccesskeyType::PublicID).unwrap();

        assert!(matches!(
            manager.create_key("key", PubaccesskeyType::PrivateID),
            Err(RenterError::Pubaccesskey(PubaccesskeyError::NameExists(_)))
        ));
        let mut renamed = key.clone();
        renamed.name = "other".into();
        assert!(matches!(
            manager.add_key(renamed),
            Err(RenterError::Pubaccesskey(PubaccesskeyError::IdExists(_)))
        ));
        assert!(manager.delete_key_by_id(&Pubaccesskey::generate("", PubaccesskeyType::PublicID).unwrap().id()).is_err());
    }
}
