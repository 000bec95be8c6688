/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Forming, renewing, and refreshing contracts.

use std::time::SystemTime;

use super::utility::host_gouging;
use super::Contractor;
use crate::contract_set::record::{ContractHeader, ContractMetadata, ContractSpending, ContractUtility};
use crate::errors::{NotFoundKind, RenterError, ResultExt};
use crate::events::{Event, FormContractEvent, RefreshContractEvent, RenewContractEvent};
use crate::host_protocol::messages::{ContractSignatures, FormContractRequest, HostSettings, RenewContractRequest};
use crate::host_protocol::session::HostSession;
use crate::hostdb::entry::HostDBEntry;
use crate::types::crypto_primitives::Verifier;
use crate::types::currency::Currency;
use crate::types::data_types::{BlockHeight, ContractID, HostPublicKey, SectorRoot};
use crate::types::keypair::{Keypair, RenterSeed};
use crate::types::transactions::{contract_unlock_hash, FileContract, SignedRevision, Transaction};

/// Miner fee paid on every formation or renewal transaction.
pub const TRANSACTION_FEE: Currency = Currency::new(1_000_000_000_000_000_000_000_000);

/// Collateral a host is asked to put up for a contract of `duration` blocks.
fn collateral(settings: &HostSettings, storage: u64, duration: u64) -> Currency {
    settings
        .collateral
        .mul64(storage)
        .mul64(duration)
        .min(settings.max_collateral)
}

fn usable_settings<'a>(
    contractor: &Contractor,
    host: &'a HostDBEntry,
    end_height: BlockHeight,
) -> Result<&'a HostSettings, RenterError> {
    let settings = host
        .settings
        .as_ref()
        .ok_or_else(|| RenterError::Transient(format!("host {} has never been scanned", host.public_key)))?;
    if !settings.accepting_contracts {
        return Err(RenterError::Transient(format!("host {} is not accepting contracts", host.public_key)));
    }
    let allowance = contractor.allowance();
    if let Some(reason) = host_gouging(settings, &allowance, contractor.config.gouging_fraction_denom) {
        return Err(RenterError::PriceGouging(reason));
    }
    let duration = end_height.saturating_sub(contractor.block_height());
    if duration > settings.max_duration {
        return Err(RenterError::InvalidArgument(format!(
            "host {} accepts at most {} blocks, {} asked",
            host.public_key, settings.max_duration, duration
        )));
    }
    Ok(settings)
}

fn verify_host_signatures(
    host: &HostPublicKey,
    contract: &FileContract,
    revision: &SignedRevision,
    signatures: &ContractSignatures,
) -> Result<(), RenterError> {
    let key = host.verifying_key()?;
    key.verify(&contract.sig_hash().bytes(), &signatures.contract_signature.signature())?;
    if !revision.is_correct() {
        return Err(RenterError::HostSignatureInvalid);
    }
    Ok(())
}

impl Contractor {
    pub(crate) fn seed(&self) -> Result<RenterSeed, RenterError> {
        let wallet_seed = self.wallet.primary_seed().context("reading the wallet seed")?;
        Ok(RenterSeed::from_wallet_seed(&wallet_seed))
    }

    /// Have `host` sign `contract`, then fund and submit the formation transaction. `old` names the
    /// contract being renewed, if any.
    fn negotiate(
        &self,
        host: &HostDBEntry,
        contract: FileContract,
        keypair: &Keypair,
        funding: Currency,
        old: Option<ContractID>,
    ) -> Result<SignedRevision, RenterError> {
        let contract_signature = keypair.sign(&contract.sig_hash());
        let initial = contract.initial_revision();
        let revision_signature = keypair.sign(&initial.sig_hash());

        let mut session = HostSession::connect(
            self.dialer.as_ref(),
            &host.net_address,
            host.public_key,
            self.contracts.rate_limit(),
            self.config.rpc_timeout,
        )?;
        let signatures = match old {
            None => session.form_contract(FormContractRequest {
                contract: contract.clone(),
                contract_signature,
                revision_signature,
            })?,
            Some(old_contract) => session.renew_contract(RenewContractRequest {
                old_contract,
                new_contract: contract.clone(),
                contract_signature,
                revision_signature,
            })?,
        };
        let signed = SignedRevision {
            revision: initial,
            renter_signature: revision_signature,
            host_signature: signatures.revision_signature,
        };
        verify_host_signatures(&host.public_key, &contract, &signed, &signatures)?;

        let mut transaction = Transaction {
            file_contracts: vec![contract],
            miner_fee: TRANSACTION_FEE,
            contract_signatures: vec![(contract_signature, signatures.contract_signature)],
            ..Default::default()
        };
        self.wallet
            .fund_transaction(&mut transaction, funding)
            .context("funding the contract transaction")?;
        self.tpool
            .accept_transaction_set(vec![transaction])
            .context("submitting the contract transaction")?;
        Ok(signed)
    }

    /// Form a contract with `host` that locks `funding` and runs until `end_height`.
    pub(crate) fn form_contract(
        &self,
        host: &HostDBEntry,
        funding: Currency,
        end_height: BlockHeight,
    ) -> Result<ContractMetadata, RenterError> {
        let settings = usable_settings(self, host, end_height)?;
        let height = self.block_height();
        let allowance = self.allowance();
        let fees = settings.contract_price + TRANSACTION_FEE;
        let renter_funds = funding
            .checked_sub(fees)
            .filter(|funds| !funds.is_zero())
            .ok_or_else(|| {
                RenterError::InsufficientFunds(format!("funding {} does not cover fees of {}", funding, fees))
            })?;

        let keypair = self.seed()?.contract_keypair(&host.public_key);
        let renter_key = keypair.public_key();
        let storage = allowance.expected_storage / allowance.hosts.max(1);
        let payout = settings.contract_price + collateral(settings, storage, end_height.saturating_sub(height));
        let contract = FileContract {
            renter_key,
            host_key: host.public_key,
            file_size: 0,
            file_merkle_root: SectorRoot::default(),
            start_height: height,
            window_start: end_height,
            window_end: end_height + settings.window_size,
            renter_funds,
            host_valid_payout: payout,
            host_missed_payout: payout,
            unlock_hash: contract_unlock_hash(&renter_key, &host.public_key),
            nonce: rand::random(),
        };
        let id = contract.id();
        let signed = self.negotiate(host, contract, &keypair, funding, None)?;

        let header = ContractHeader {
            id,
            host: host.public_key,
            renter_key,
            secret_key: keypair.0.to_bytes(),
            start_height: height,
            end_height,
            initial_renter_funds: renter_funds,
            total_cost: funding,
            spending: ContractSpending {
                fees,
                ..Default::default()
            },
            utility: ContractUtility {
                good_for_upload: true,
                good_for_renew: true,
                bad_contract: false,
                locked: false,
            },
            last_revision: signed,
        };
        let metadata = self.contracts.insert(header, Vec::new())?;
        self.write_state().unconfirmed.insert(id, height);

        Event::publish(
            &self.event_publisher,
            Event::FormContract(FormContractEvent {
                timestamp: SystemTime::now(),
                contract: id,
                host: host.public_key,
                end_height,
                funds: funding,
            }),
        );
        Ok(metadata)
    }

    /// Replace contract `id` by a new contract with the same host that carries all of its data, locks
    /// `funding`, and runs until `end_height`. A refresh keeps the old end height.
    pub(crate) fn renew_contract(
        &self,
        id: &ContractID,
        funding: Currency,
        end_height: BlockHeight,
        refresh: bool,
    ) -> Result<ContractMetadata, RenterError> {
        let handle = self.contracts.acquire(id)?;
        let host_key = handle.header().host;
        let (host, _) = self
            .hostdb
            .host(&host_key)
            .ok_or(RenterError::NotFound(NotFoundKind::Host(host_key)))?;
        let settings = usable_settings(self, &host, end_height)?;
        let height = self.block_height();
        let old_end = handle.header().end_height;
        let last = handle.last_revision().revision.clone();

        // Existing data is paid for up front over the extension of the contract.
        let base_price = settings
            .storage_price
            .mul64(last.file_size)
            .mul64(end_height.saturating_sub(old_end));
        let fees = settings.contract_price + TRANSACTION_FEE + base_price;
        let renter_funds = funding
            .checked_sub(fees)
            .filter(|funds| !funds.is_zero())
            .ok_or_else(|| {
                RenterError::InsufficientFunds(format!("funding {} does not cover renewal fees of {}", funding, fees))
            })?;

        let keypair = handle.keypair();
        let renter_key = keypair.public_key();
        let payout = settings.contract_price
            + base_price
            + collateral(settings, last.file_size, end_height.saturating_sub(height));
        let contract = FileContract {
            renter_key,
            host_key,
            file_size: last.file_size,
            file_merkle_root: last.file_merkle_root,
            start_height: height,
            window_start: end_height,
            window_end: end_height + settings.window_size,
            renter_funds,
            host_valid_payout: payout,
            host_missed_payout: payout,
            unlock_hash: contract_unlock_hash(&renter_key, &host_key),
            nonce: rand::random(),
        };
        let new_id = contract.id();
        let signed = self.negotiate(&host, contract, &keypair, funding, Some(*id))?;

        let header = ContractHeader {
            id: new_id,
            host: host_key,
            renter_key,
            secret_key: keypair.0.to_bytes(),
            start_height: height,
            end_height,
            initial_renter_funds: renter_funds,
            total_cost: funding,
            spending: ContractSpending {
                fees,
                ..Default::default()
            },
            utility: ContractUtility {
                good_for_upload: true,
                good_for_renew: true,
                bad_contract: false,
                locked: false,
            },
            last_revision: signed,
        };
        let metadata = self.contracts.insert(header, handle.roots().to_vec())?;
        let (mut old, _) = handle.delete()?;
        old.utility = ContractUtility {
            good_for_upload: false,
            good_for_renew: false,
            bad_contract: old.utility.bad_contract,
            locked: true,
        };
        {
            let mut state = self.write_state();
            state.old_contracts.insert(*id, old);
            state.renewed_from.insert(new_id, *id);
            state.renewed_to.insert(*id, new_id);
            state.unconfirmed.insert(new_id, height);
        }

        let event = if refresh {
            Event::RefreshContract(RefreshContractEvent {
                timestamp: SystemTime::now(),
                old_contract: *id,
                new_contract: new_id,
                host: host_key,
            })
        } else {
            Event::RenewContract(RenewContractEvent {
                timestamp: SystemTime::now(),
                old_contract: *id,
                new_contract: new_id,
                host: host_key,
                end_height,
            })
        };
        Event::publish(&self.event_publisher, event);
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::constants::SECTOR_SIZE;
    use crate::types::data_types::NetAddress;

    #[test]
    fn collateral_is_capped() {
        let settings = HostSettings {
            net_address: NetAddress::new("10.0.0.1:9982"),
            version: "1.5.0".into(),
            accepting_contracts: true,
            max_duration: 10_000,
            window_size: 144,
            collateral: Currency::new(3),
            max_collateral: Currency::new(1_000),
            contract_price: Currency::new(10),
            storage_price: Currency::new(1),
            upload_bandwidth_price: Currency::new(1),
            download_bandwidth_price: Currency::new(1),
            base_rpc_price: Currency::new(1),
            sector_access_price: Currency::new(1),
            remaining_storage: 1 << 40,
            total_storage: 1 << 40,
            sector_size: SECTOR_SIZE,
        };
        assert_eq!(collateral(&settings, 10, 20), Currency::new(600));
        assert_eq!(collateral(&settings, 10, 200), Currency::new(1_000));
    }
}
