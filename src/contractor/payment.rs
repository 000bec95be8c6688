/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Paying hosts through contract revisions.

use std::io::{Read, Write};

use super::Contractor;
use crate::contract_set::record::{RootsOp, SpendingKind};
use crate::errors::{NotFoundKind, RenterError, ResultExt};
use crate::host_protocol::framing::{read_message, write_message};
use crate::host_protocol::messages::{PayByContractRequest, PaymentRequest, PaymentResponse, RpcError};
use crate::types::currency::Currency;
use crate::types::data_types::{BlockHeight, ContractID, CryptoHash, HostPublicKey};

impl Contractor {
    /// Pay `amount` to `host` over `stream`, using the contract with that host that is used for new I/O.
    #[allow(clippy::too_many_arguments)]
    pub fn provide_payment(
        &self,
        stream: &mut (impl Read + Write),
        host: &HostPublicKey,
        amount: Currency,
        refund_account: CryptoHash,
        block_height: BlockHeight,
        spending: SpendingKind,
        roots_ops: Vec<RootsOp>,
    ) -> Result<(), RenterError> {
        let contract = self
            .contract_by_public_key(host)
            .ok_or(RenterError::NotFound(NotFoundKind::Host(*host)))
            .context("no contract to pay with")?;
        self.pay_by_contract(stream, &contract.id, amount, refund_account, block_height, spending, roots_ops)
    }

    /// Pay `amount` through a revision of contract `id` that also applies `roots_ops`.
    ///
    /// The revision is recorded as a payment intent before it is sent. If the host refuses it, the intent
    /// is discarded. If the connection fails before the host answers, the intent stays recorded and is
    /// settled by the next resync with the host.
    #[allow(clippy::too_many_arguments)]
    pub fn pay_by_contract(
        &self,
        stream: &mut (impl Read + Write),
        id: &ContractID,
        amount: Currency,
        refund_account: CryptoHash,
        block_height: BlockHeight,
        spending: SpendingKind,
        roots_ops: Vec<RootsOp>,
    ) -> Result<(), RenterError> {
        let mut handle = self.contracts.acquire(id)?;
        if block_height > handle.header().end_height {
            return Err(RenterError::InvalidArgument(format!(
                "contract {} ended at {}, cannot pay at {}",
                id,
                handle.header().end_height,
                block_height
            )));
        }

        let revision = handle.next_revision(amount, &roots_ops)?;
        let intent = handle.record_payment_intent(revision.clone(), amount, spending, roots_ops)?;
        let signature = handle
            .intent(intent)
            .map(|intent| intent.renter_signature)
            .unwrap_or_else(|| handle.sign(&revision.sig_hash()));

        let request = PaymentRequest::PayByContract(PayByContractRequest {
            contract: *id,
            new_revision_number: revision.revision_number,
            new_renter_funds: revision.renter_funds,
            new_host_valid_payout: revision.host_valid_payout,
            new_host_missed_payout: revision.host_missed_payout,
            new_file_size: revision.file_size,
            new_file_merkle_root: revision.file_merkle_root,
            refund_account,
            signature,
        });
        write_message(stream, &request).context(format!("paying {} through {}", amount, id))?;

        let response: Result<PaymentResponse, RpcError> =
            read_message(stream).context(format!("reading payment response for {}", id))?;
        match response {
            Ok(response) => handle.commit_payment_intent(intent, response.host_signature),
            Err(rpc) => {
                handle.discard_payment_intent(intent)?;
                Err(RenterError::from(rpc).add_context(format!("host refused payment through {}", id)))
            }
        }
    }
}
