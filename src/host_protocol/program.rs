/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Programs a host executes against a contract's sectors.
//!
//! Both sides of the protocol need to agree on two things before a program runs: what it costs
//! ([`program_cost`]), and which sector roots the contract holds afterwards ([`apply_to_roots`]). The
//! renter uses the latter to sign a revision committing to the new roots up front; the host recomputes
//! it and refuses to counter-sign if the two disagree.

use borsh::{BorshDeserialize, BorshSerialize};

use super::price_table::PriceTable;
use crate::errors::RenterError;
use crate::merkle;
use crate::types::constants::SECTOR_SIZE;
use crate::types::currency::Currency;
use crate::types::data_types::{CryptoHash, SectorRoot};
use crate::types::transactions::SignedRevision;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Instruction {
    /// Whether the host stores a sector with `root`, in any contract.
    HasSector { root: SectorRoot },
    /// Read `length` bytes at `offset` of the sector with `root`.
    ReadSector { root: SectorRoot, offset: u64, length: u64, proof: bool },
    /// Read `length` bytes at `offset` of the contract's data, addressed as one contiguous byte range.
    ReadOffset { offset: u64, length: u64, proof: bool },
    /// The contract's latest revision.
    Revision,
    /// Append the next sector of the program data to the contract.
    Append,
    /// Drop the last `count` sectors of the contract.
    DropSectors { count: u64 },
    /// Exchange the sectors at indices `first` and `second`.
    SwapSectors { first: u64, second: u64 },
}

impl Instruction {
    pub fn is_modifying(&self) -> bool {
        matches!(
            self,
            Instruction::Append | Instruction::DropSectors { .. } | Instruction::SwapSectors { .. }
        )
    }

    /// Bytes the host sends back for this instruction.
    fn download_len(&self) -> u64 {
        match self {
            Instruction::ReadSector { length, .. } | Instruction::ReadOffset { length, .. } => *length,
            _ => 0,
        }
    }
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum InstructionOutput {
    HasSector(bool),
    ReadSector {
        data: Vec<u8>,
        proof: Vec<CryptoHash>,
    },
    ReadOffset {
        data: Vec<u8>,
        proof: Vec<CryptoHash>,
        sector_index: u64,
        sector_root: SectorRoot,
        /// Proof that `sector_root` is leaf `sector_index` of the contract's file Merkle root.
        roots_proof: Vec<CryptoHash>,
    },
    Revision(SignedRevision),
    Append {
        root: SectorRoot,
    },
    DropSectors,
    SwapSectors,
}

/// Whether any instruction of `instructions` changes the contract's sectors.
pub fn is_modifying(instructions: &[Instruction]) -> bool {
    instructions.iter().any(Instruction::is_modifying)
}

/// What `instructions` cost under `price_table` for a contract with `duration` blocks left.
pub fn program_cost(price_table: &PriceTable, instructions: &[Instruction], duration: u64) -> Currency {
    let mut cost = price_table.init_base_cost;
    for instruction in instructions {
        cost += match instruction {
            Instruction::HasSector { .. } => price_table.has_sector_base_cost,
            Instruction::ReadSector { .. } | Instruction::ReadOffset { .. } => {
                let length = instruction.download_len();
                price_table.read_base_cost
                    + price_table.read_length_cost.mul64(length)
                    + price_table.download_bandwidth_cost.mul64(length)
            }
            Instruction::Revision => price_table.revision_cost,
            Instruction::Append => {
                price_table.write_base_cost
                    + price_table.write_length_cost.mul64(SECTOR_SIZE)
                    + price_table.upload_bandwidth_cost.mul64(SECTOR_SIZE)
                    + price_table.write_store_cost.mul64(SECTOR_SIZE).mul64(duration)
            }
            Instruction::DropSectors { count } => price_table.drop_sectors_cost.mul64(*count),
            Instruction::SwapSectors { .. } => price_table.swap_sector_cost,
        };
    }
    cost
}

/// Apply the modifying instructions of a program to `roots`, consuming `data` for appends.
pub fn apply_to_roots(roots: &mut Vec<SectorRoot>, instructions: &[Instruction], data: &[u8]) -> Result<(), RenterError> {
    let mut sectors = data.chunks(SECTOR_SIZE as usize);
    for instruction in instructions {
        match instruction {
            Instruction::Append => {
                let sector = sectors
                    .next()
                    .filter(|sector| sector.len() == SECTOR_SIZE as usize)
                    .ok_or_else(|| RenterError::InvalidArgument("append without a full sector of data".into()))?;
                roots.push(merkle::sector_root(sector));
            }
            Instruction::DropSectors { count } => {
                let count = *count as usize;
                if count > roots.len() {
                    return Err(RenterError::InvalidArgument(format!(
                        "cannot drop {} of {} sectors",
                        count,
                        roots.len()
                    )));
                }
                roots.truncate(roots.len() - count);
            }
            Instruction::SwapSectors { first, second } => {
                let (first, second) = (*first as usize, *second as usize);
                if first >= roots.len() || second >= roots.len() {
                    return Err(RenterError::InvalidArgument(format!(
                        "cannot swap sectors {} and {} of {}",
                        first,
                        second,
                        roots.len()
                    )));
                }
                roots.swap(first, second);
            }
            _ => (),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_protocol::messages::HostSettings;
    use crate::types::data_types::{BlockHeight, NetAddress};
    use std::time::Duration;

    fn price_table() -> PriceTable {
        let settings = HostSettings {
            net_address: NetAddress::new("127.0.0.1:9982"),
            version: "1.5.0".into(),
            accepting_contracts: true,
            max_duration: 10_000,
            window_size: 144,
            collateral: Currency::new(1),
            max_collateral: Currency::coins(10),
            contract_price: Currency::coins(1),
            storage_price: Currency::new(2),
            upload_bandwidth_price: Currency::new(3),
            download_bandwidth_price: Currency::new(5),
            base_rpc_price: Currency::new(7),
            sector_access_price: Currency::new(11),
            remaining_storage: 1 << 40,
            total_storage: 1 << 40,
            sector_size: SECTOR_SIZE,
        };
        PriceTable::from_settings(&settings, [1; 16], BlockHeight::new(10), Duration::from_secs(600))
    }

    #[test]
    fn read_cost_scales_with_length() {
        let pt = price_table();
        let short = program_cost(&pt, &[Instruction::ReadOffset { offset: 0, length: 64, proof: true }], 0);
        let long = program_cost(&pt, &[Instruction::ReadOffset { offset: 0, length: 128, proof: true }], 0);
        // read_length_cost (1) + download_bandwidth_cost (5) per extra byte.
        assert_eq!(long.saturating_sub(short), Currency::new(64 * 6));
    }

    #[test]
    fn append_swap_drop_moves_the_new_root_to_the_front() {
        let mut roots = vec![CryptoHash::new([1; 32]), CryptoHash::new([2; 32])];
        let sector = vec![9u8; SECTOR_SIZE as usize];
        let program = [
            Instruction::Append,
            Instruction::SwapSectors { first: 0, second: 2 },
            Instruction::DropSectors { count: 1 },
        ];
        apply_to_roots(&mut roots, &program, &sector).unwrap();
        assert_eq!(roots, vec![merkle::sector_root(&sector), CryptoHash::new([2; 32])]);
    }

    #[test]
    fn dropping_more_sectors_than_exist_fails() {
        let mut roots = vec![CryptoHash::new([1; 32])];
        assert!(apply_to_roots(&mut roots, &[Instruction::DropSectors { count: 2 }], &[]).is_err());
        assert_eq!(roots.len(), 1);
    }
}
