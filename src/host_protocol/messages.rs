/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged with hosts.
//!
//! Each RPC starts with the renter writing a [`Request`]. What follows depends on the variant:
//!
//! |Request|Host answers with|
//! |---|---|
//! |[`Settings`](Request::Settings)|`Result<HostSettings, RpcError>`|
//! |[`UpdatePriceTable`](Request::UpdatePriceTable)|`Result<PriceTable, RpcError>`|
//! |[`FormContract`](Request::FormContract)|`Result<ContractSignatures, RpcError>`|
//! |[`RenewContract`](Request::RenewContract)|`Result<ContractSignatures, RpcError>`|
//! |[`LatestRevision`](Request::LatestRevision)|`Result<SignedRevision, RpcError>`|
//! |[`RecoverRevision`](Request::RecoverRevision)|`Result<(), RpcError>`|
//! |[`SectorRoots`](Request::SectorRoots)|`Result<Vec<SectorRoot>, RpcError>`|
//! |[`ExecuteProgram`](Request::ExecuteProgram)|see below|
//!
//! A program is followed by a [`PaymentRequest`] from the renter. The host checks the payment against
//! the program's cost, answers with `Result<PaymentResponse, RpcError>` carrying its counter-signature
//! over the new revision, and then streams the `Result<ProgramResponse, RpcError>`.

use borsh::{BorshDeserialize, BorshSerialize};

use super::program::{Instruction, InstructionOutput};
use crate::errors::{NotFoundKind, RenterError};
use crate::types::currency::Currency;
use crate::types::data_types::{ContractID, CryptoHash, NetAddress, SignatureBytes};
use crate::types::transactions::{FileContract, SignedRevision};

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum Request {
    Settings,
    UpdatePriceTable,
    FormContract(FormContractRequest),
    RenewContract(RenewContractRequest),
    LatestRevision(ContractID),
    RecoverRevision(SignedRevision),
    /// Every sector root of a contract, in order.
    SectorRoots(ContractID),
    ExecuteProgram(ProgramRequest),
}

/// Terms a host advertises.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HostSettings {
    pub net_address: NetAddress,
    pub version: String,
    pub accepting_contracts: bool,
    /// Longest contract the host accepts, in blocks.
    pub max_duration: u64,
    pub window_size: u64,
    /// Collateral per byte per block.
    pub collateral: Currency,
    pub max_collateral: Currency,
    pub contract_price: Currency,
    /// Storage price per byte per block.
    pub storage_price: Currency,
    /// Price per byte uploaded to the host.
    pub upload_bandwidth_price: Currency,
    /// Price per byte downloaded from the host.
    pub download_bandwidth_price: Currency,
    pub base_rpc_price: Currency,
    pub sector_access_price: Currency,
    pub remaining_storage: u64,
    pub total_storage: u64,
    pub sector_size: u64,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct FormContractRequest {
    pub contract: FileContract,
    /// The renter's signature over [`FileContract::sig_hash`].
    pub contract_signature: SignatureBytes,
    /// The renter's signature over the initial revision.
    pub revision_signature: SignatureBytes,
}

/// Renew `old_contract` into `new_contract`, carrying every sector over.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct RenewContractRequest {
    pub old_contract: ContractID,
    pub new_contract: FileContract,
    pub contract_signature: SignatureBytes,
    pub revision_signature: SignatureBytes,
}

/// The host's half of a formation or renewal.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct ContractSignatures {
    pub contract_signature: SignatureBytes,
    pub revision_signature: SignatureBytes,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct ProgramRequest {
    /// The price table the program is priced against.
    pub price_table: [u8; 16],
    pub contract: ContractID,
    pub instructions: Vec<Instruction>,
    /// Sector data consumed by `Append` instructions, in order.
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum PaymentRequest {
    PayByContract(PayByContractRequest),
}

/// Payment through a revision of `contract`. The revision also commits to the sector roots the contract
/// will hold after the program runs.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct PayByContractRequest {
    pub contract: ContractID,
    pub new_revision_number: u64,
    pub new_renter_funds: Currency,
    pub new_host_valid_payout: Currency,
    pub new_host_missed_payout: Currency,
    pub new_file_size: u64,
    pub new_file_merkle_root: CryptoHash,
    /// Account refunded with whatever the program does not spend.
    pub refund_account: CryptoHash,
    pub signature: SignatureBytes,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct PaymentResponse {
    pub host_signature: SignatureBytes,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct ProgramResponse {
    pub outputs: Vec<InstructionOutput>,
    pub new_size: u64,
    pub new_merkle_root: CryptoHash,
}

/// Why a host refused a request.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum RpcErrorKind {
    RevisionMismatch { renter_revision: u64, host_revision: u64 },
    InsufficientFunds,
    StorageObligationNotFound,
    PriceTableNotFound,
    PriceTableExpired,
    SectorNotFound,
    InvalidSignature,
    Rejected,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> RpcError {
        RpcError {
            kind,
            message: message.into(),
        }
    }
}

impl From<RpcError> for RenterError {
    fn from(err: RpcError) -> Self {
        match err.kind {
            RpcErrorKind::RevisionMismatch {
                renter_revision,
                host_revision,
            } => RenterError::RevisionMismatch {
                ours: renter_revision,
                theirs: host_revision,
            },
            RpcErrorKind::InsufficientFunds => RenterError::InsufficientFunds(err.message),
            RpcErrorKind::StorageObligationNotFound => RenterError::StorageObligationNotFound,
            RpcErrorKind::SectorNotFound => {
                RenterError::NotFound(NotFoundKind::Sector(CryptoHash::default())).add_context(err.message)
            }
            RpcErrorKind::PriceTableNotFound | RpcErrorKind::PriceTableExpired => {
                RenterError::Transient(format!("price table rejected: {}", err.message))
            }
            RpcErrorKind::InvalidSignature => {
                RenterError::HostProtocolViolation(format!("host rejected our signature: {}", err.message))
            }
            RpcErrorKind::Rejected => RenterError::Transient(format!("host rejected request: {}", err.message)),
        }
    }
}

