/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! On-chain objects the renter creates and reads: file contracts, their revisions, host announcements,
//! and the transactions and blocks that carry them.

use borsh::{BorshDeserialize, BorshSerialize};

use super::crypto_primitives::{hash_all, Verifier};
use super::currency::Currency;
use super::data_types::{BlockHeight, ContractID, CryptoHash, HostPublicKey, NetAddress, SignatureBytes};

/// Hash of the conditions under which a contract's outputs can be spent.
pub type UnlockHash = CryptoHash;

/// Unlock hash binding a contract to the renter key and host key that signed it.
pub fn contract_unlock_hash(renter_key: &HostPublicKey, host_key: &HostPublicKey) -> UnlockHash {
    hash_all(&[b"ContractUnlock", &renter_key.bytes(), &host_key.bytes()])
}

/// A file contract as it is first submitted to the blockchain.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FileContract {
    pub renter_key: HostPublicKey,
    pub host_key: HostPublicKey,
    pub file_size: u64,
    pub file_merkle_root: CryptoHash,
    pub start_height: BlockHeight,
    /// First block of the proof window. The contract is usable up to this height.
    pub window_start: BlockHeight,
    pub window_end: BlockHeight,
    /// Funds the renter may still spend on the host.
    pub renter_funds: Currency,
    /// Payout to the host if it submits a valid storage proof.
    pub host_valid_payout: Currency,
    /// Payout to the host if it misses the storage proof. Collateral is burnt.
    pub host_missed_payout: Currency,
    pub unlock_hash: UnlockHash,
    /// Distinguishes contracts between the same pair of keys.
    pub nonce: u64,
}

impl FileContract {
    /// The contract's ID, which is also the ID of all of its revisions.
    pub fn id(&self) -> ContractID {
        let bytes = self.try_to_vec().unwrap_or_default();
        ContractID::from(hash_all(&[b"FileContract", &bytes]))
    }

    /// Revision number 0 of the contract.
    pub fn initial_revision(&self) -> FileContractRevision {
        FileContractRevision {
            parent_id: self.id(),
            renter_key: self.renter_key,
            host_key: self.host_key,
            revision_number: 0,
            file_size: self.file_size,
            file_merkle_root: self.file_merkle_root,
            window_start: self.window_start,
            window_end: self.window_end,
            renter_funds: self.renter_funds,
            host_valid_payout: self.host_valid_payout,
            host_missed_payout: self.host_missed_payout,
            unlock_hash: self.unlock_hash,
        }
    }

    pub fn sig_hash(&self) -> CryptoHash {
        let bytes = self.try_to_vec().unwrap_or_default();
        hash_all(&[b"FileContractSig", &bytes])
    }
}

/// A revision of a file contract. Every revision has a strictly larger `revision_number` than the last.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FileContractRevision {
    pub parent_id: ContractID,
    pub renter_key: HostPublicKey,
    pub host_key: HostPublicKey,
    pub revision_number: u64,
    pub file_size: u64,
    pub file_merkle_root: CryptoHash,
    pub window_start: BlockHeight,
    pub window_end: BlockHeight,
    pub renter_funds: Currency,
    pub host_valid_payout: Currency,
    pub host_missed_payout: Currency,
    pub unlock_hash: UnlockHash,
}

impl FileContractRevision {
    /// The hash both parties sign.
    pub fn sig_hash(&self) -> CryptoHash {
        let bytes = self.try_to_vec().unwrap_or_default();
        hash_all(&[b"FileContractRevision", &bytes])
    }

    /// The next revision, moving `amount` from the renter to the host.
    pub fn payment_revision(&self, amount: Currency) -> Option<FileContractRevision> {
        let renter_funds = self.renter_funds.checked_sub(amount)?;
        let mut revision = self.clone();
        revision.revision_number += 1;
        revision.renter_funds = renter_funds;
        revision.host_valid_payout = self.host_valid_payout.saturating_add(amount);
        revision.host_missed_payout = self.host_missed_payout.saturating_add(amount);
        Some(revision)
    }

    /// The next revision, committing to a new set of sector roots.
    pub fn storage_revision(&self, file_size: u64, file_merkle_root: CryptoHash) -> FileContractRevision {
        let mut revision = self.clone();
        revision.revision_number += 1;
        revision.file_size = file_size;
        revision.file_merkle_root = file_merkle_root;
        revision
    }
}

/// A revision signed by both parties.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedRevision {
    pub revision: FileContractRevision,
    pub renter_signature: SignatureBytes,
    pub host_signature: SignatureBytes,
}

impl SignedRevision {
    /// Whether both signatures are valid for the keys named in the revision.
    pub fn is_correct(&self) -> bool {
        let hash = self.revision.sig_hash().bytes();
        let check = |key: &HostPublicKey, signature: &SignatureBytes| match key.verifying_key() {
            Ok(key) => key.verify(&hash, &signature.signature()).is_ok(),
            Err(_) => false,
        };
        check(&self.revision.renter_key, &self.renter_signature)
            && check(&self.revision.host_key, &self.host_signature)
    }
}

/// Announcement through which a host joins the network.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HostAnnouncement {
    pub public_key: HostPublicKey,
    pub net_address: NetAddress,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub file_contracts: Vec<FileContract>,
    pub file_contract_revisions: Vec<SignedRevision>,
    pub host_announcements: Vec<HostAnnouncement>,
    pub miner_fee: Currency,
    /// Signatures of the contract parties over the contracts' `sig_hash`.
    pub contract_signatures: Vec<(SignatureBytes, SignatureBytes)>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ChainBlock {
    pub id: CryptoHash,
    pub height: BlockHeight,
    pub transactions: Vec<Transaction>,
}
