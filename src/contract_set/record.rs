/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The persisted form of a contract and the read-only views handed out of the contract set.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::host_protocol::program::Instruction;
use crate::merkle;
use crate::types::constants::SECTOR_SIZE;
use crate::types::currency::Currency;
use crate::types::data_types::{BlockHeight, ContractID, CryptoHash, HostPublicKey, SectorRoot, SignatureBytes};
use crate::types::transactions::{FileContractRevision, SignedRevision};

/// Flags the contractor derives for each contract.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ContractUtility {
    pub good_for_upload: bool,
    pub good_for_renew: bool,
    /// Never used for new I/O again.
    pub bad_contract: bool,
    /// Utility is frozen: the contract was renewed or refreshed and only its successor matters.
    pub locked: bool,
}

/// Money spent through a contract, by purpose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ContractSpending {
    pub upload: Currency,
    pub download: Currency,
    pub storage: Currency,
    pub fees: Currency,
}

impl ContractSpending {
    pub fn total(&self) -> Currency {
        self.upload + self.download + self.storage + self.fees
    }

    pub(crate) fn add(&mut self, kind: SpendingKind, amount: Currency) {
        match kind {
            SpendingKind::Upload => self.upload += amount,
            SpendingKind::Download => self.download += amount,
            SpendingKind::Storage => self.storage += amount,
            SpendingKind::Fees => self.fees += amount,
        }
    }
}

/// What a payment was for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum SpendingKind {
    Upload,
    Download,
    Storage,
    Fees,
}

/// A change to a contract's sector list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum RootsOp {
    Append(SectorRoot),
    Swap(u64, u64),
    Drop(u64),
}

impl RootsOp {
    /// The sector changes a program makes.
    pub fn from_program(instructions: &[Instruction], data: &[u8]) -> Vec<RootsOp> {
        let mut sectors = data.chunks(SECTOR_SIZE as usize);
        instructions
            .iter()
            .filter_map(|instruction| match instruction {
                Instruction::Append => sectors.next().map(|sector| RootsOp::Append(merkle::sector_root(sector))),
                Instruction::SwapSectors { first, second } => Some(RootsOp::Swap(*first, *second)),
                Instruction::DropSectors { count } => Some(RootsOp::Drop(*count)),
                _ => None,
            })
            .collect()
    }

    pub fn apply(ops: &[RootsOp], roots: &mut Vec<SectorRoot>) {
        for op in ops {
            match *op {
                RootsOp::Append(root) => roots.push(root),
                RootsOp::Swap(first, second) => {
                    if (first as usize) < roots.len() && (second as usize) < roots.len() {
                        roots.swap(first as usize, second as usize);
                    }
                }
                RootsOp::Drop(count) => {
                    let keep = roots.len().saturating_sub(count as usize);
                    roots.truncate(keep);
                }
            }
        }
    }
}

/// A revision the renter signed and sent, but that the host has not yet been seen to accept.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PaymentIntent {
    pub id: u64,
    pub revision: FileContractRevision,
    pub renter_signature: SignatureBytes,
    pub amount: Currency,
    pub spending: SpendingKind,
    pub roots_ops: Vec<RootsOp>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ContractHeader {
    pub id: ContractID,
    pub host: HostPublicKey,
    pub renter_key: HostPublicKey,
    pub(crate) secret_key: [u8; 32],
    pub start_height: BlockHeight,
    /// The contract is usable up to this height.
    pub end_height: BlockHeight,
    pub initial_renter_funds: Currency,
    /// Everything the renter paid to form the contract, including fees.
    pub total_cost: Currency,
    pub spending: ContractSpending,
    pub utility: ContractUtility,
    pub last_revision: SignedRevision,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ContractRecord {
    pub header: ContractHeader,
    pub roots: Vec<SectorRoot>,
    pub intents: Vec<PaymentIntent>,
    pub next_intent: u64,
}

/// Point-in-time view of a contract.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ContractMetadata {
    pub id: ContractID,
    pub host: HostPublicKey,
    pub renter_key: HostPublicKey,
    pub start_height: BlockHeight,
    pub end_height: BlockHeight,
    pub renter_funds: Currency,
    pub initial_renter_funds: Currency,
    pub total_cost: Currency,
    pub spending: ContractSpending,
    pub utility: ContractUtility,
    pub revision_number: u64,
    /// Bytes of data stored under the contract.
    pub size: u64,
    pub merkle_root: CryptoHash,
    pub num_sectors: u64,
    pub pending_intents: usize,
}

impl From<&ContractRecord> for ContractMetadata {
    fn from(record: &ContractRecord) -> Self {
        let header = &record.header;
        let revision = &header.last_revision.revision;
        ContractMetadata {
            id: header.id,
            host: header.host,
            renter_key: header.renter_key,
            start_height: header.start_height,
            end_height: header.end_height,
            renter_funds: revision.renter_funds,
            initial_renter_funds: header.initial_renter_funds,
            total_cost: header.total_cost,
            spending: header.spending,
            utility: header.utility,
            revision_number: revision.revision_number,
            size: revision.file_size,
            merkle_root: revision.file_merkle_root,
            num_sectors: record.roots.len() as u64,
            pending_intents: record.intents.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_ops_follow_the_program() {
        let sector = vec![3u8; SECTOR_SIZE as usize];
        let program = [
            Instruction::Append,
            Instruction::SwapSectors { first: 0, second: 1 },
            Instruction::DropSectors { count: 1 },
        ];
        let ops = RootsOp::from_program(&program, &sector);
        let root = merkle::sector_root(&sector);
        assert_eq!(ops, vec![RootsOp::Append(root), RootsOp::Swap(0, 1), RootsOp::Drop(1)]);

        let mut roots = vec![CryptoHash::new([1; 32])];
        RootsOp::apply(&ops, &mut roots);
        assert_eq!(roots, vec![root]);
    }
}
