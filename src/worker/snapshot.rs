/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The snapshot table: a list of the backups stored with a host, kept in sector 0 of the contract.
//!
//! A renter that lost everything but its seed can recover its contracts, read the table from each
//! host, and restore the latest backup from there. The table is one versioned object, zero-padded to a
//! sector. Writing a new table appends it and swaps it into position 0; the previous table (now last)
//! is dropped, while a data sector that happened to be at position 0 is kept.

use borsh::{BorshDeserialize, BorshSerialize};

use super::Worker;
use crate::errors::{NotFoundKind, RenterError};
use crate::host_protocol::program::Instruction;
use crate::persist::versioned_file::{self, Metadata};
use crate::types::constants::SECTOR_SIZE;
use crate::types::crypto_primitives::new_specifier;

pub const SNAPSHOT_TABLE_METADATA: Metadata = Metadata::new(new_specifier("SnapshotTable"), new_specifier("v1.4.0"));

/// One backup known to a host.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SnapshotEntry {
    pub uid: [u8; 16],
    pub name: String,
    /// Size of the backup archive in bytes.
    pub size: u64,
    /// Seconds since the unix epoch.
    pub created: u64,
    /// Encoded metadata of the siafile holding the archive, so that it can be downloaded on a renter
    /// that has nothing but its contracts.
    pub siafile: Vec<u8>,
}

/// Encode `entries` as one zero-padded sector.
pub fn encode_table(entries: &[SnapshotEntry]) -> Result<Vec<u8>, RenterError> {
    let mut sector = versioned_file::encode(&SNAPSHOT_TABLE_METADATA, &entries.to_vec())?;
    if sector.len() as u64 > SECTOR_SIZE {
        return Err(RenterError::InvalidArgument(format!(
            "snapshot table of {} entries does not fit in a sector",
            entries.len()
        )));
    }
    sector.resize(SECTOR_SIZE as usize, 0);
    Ok(sector)
}

/// Decode a sector written by [`encode_table`].
pub fn decode_table(sector: &[u8]) -> Result<Vec<SnapshotEntry>, RenterError> {
    versioned_file::decode_padded(&SNAPSHOT_TABLE_METADATA, sector)
}

/// Add `entry` to `entries`, replacing an entry with the same name.
pub fn insert_entry(entries: &mut Vec<SnapshotEntry>, entry: SnapshotEntry) {
    entries.retain(|existing| existing.name != entry.name);
    entries.push(entry);
}

impl Worker {
    /// The sectors in the worker's contract, from the contract set.
    fn num_sectors(&self) -> Result<u64, RenterError> {
        let id = self
            .cache()
            .contract_id
            .ok_or(RenterError::NotFound(NotFoundKind::Host(self.host)))?;
        Ok(self
            .env
            .contractor
            .contract_set()
            .view(&id)
            .ok_or(RenterError::NotFound(NotFoundKind::Contract(id)))?
            .num_sectors)
    }

    /// Read the snapshot table. `None` if the contract holds no table.
    fn read_snapshot_table(&self) -> Result<Option<Vec<SnapshotEntry>>, RenterError> {
        if self.num_sectors()? == 0 {
            return Ok(None);
        }
        let sector = self.read_offset(0, SECTOR_SIZE)?;
        match decode_table(&sector) {
            Ok(entries) => Ok(Some(entries)),
            Err(err) => {
                log::debug!("Sector 0 of the contract with {} is not a snapshot table: {}", self.host, err);
                Ok(None)
            }
        }
    }

    /// The backups stored with the host.
    pub(crate) fn fetch_snapshot_table(&self) -> Result<Vec<SnapshotEntry>, RenterError> {
        Ok(self.read_snapshot_table()?.unwrap_or_default())
    }

    /// Add `entry` to the host's snapshot table.
    pub(crate) fn upload_snapshot_entry(&self, entry: SnapshotEntry) -> Result<(), RenterError> {
        let num_sectors = self.num_sectors()?;
        let existing = self.read_snapshot_table()?;
        let had_table = existing.is_some();
        let mut entries = existing.unwrap_or_default();
        insert_entry(&mut entries, entry);
        let sector = encode_table(&entries)?;

        let mut instructions = vec![Instruction::Append];
        if num_sectors > 0 {
            instructions.push(Instruction::SwapSectors {
                first: 0,
                second: num_sectors,
            });
            if had_table {
                instructions.push(Instruction::DropSectors { count: 1 });
            }
        }
        self.modify_sectors(instructions, sector)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, size: u64) -> SnapshotEntry {
        SnapshotEntry {
            uid: [size as u8; 16],
            name: name.into(),
            size,
            created: 1_600_000_000,
            siafile: vec![1, 2, 3],
        }
    }

    #[test]
    fn table_fills_exactly_one_sector() {
        let entries = vec![entry("monday", 10), entry("tuesday", 20)];
        let sector = encode_table(&entries).unwrap();
        assert_eq!(sector.len() as u64, SECTOR_SIZE);
        assert_eq!(decode_table(&sector).unwrap(), entries);
    }

    #[test]
    fn data_sectors_are_not_tables() {
        assert!(decode_table(&vec![7u8; SECTOR_SIZE as usize]).is_err());
        assert!(decode_table(&vec![0u8; SECTOR_SIZE as usize]).is_err());
    }

    #[test]
    fn entries_with_the_same_name_are_replaced() {
        let mut entries = vec![entry("monday", 10), entry("tuesday", 20)];
        insert_entry(&mut entries, entry("monday", 30));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], entry("monday", 30));
    }
}
