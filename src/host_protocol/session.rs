/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The renter's side of one RPC with one host.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use borsh::BorshDeserialize;

use super::framing::{read_message, write_message};
use super::messages::*;
use super::price_table::PriceTable;
use super::rate_limit::{RateLimit, RateLimitedStream};
use super::{HostDialer, HostStream};
use crate::errors::{RenterError, ResultExt};
use crate::types::data_types::{ContractID, HostPublicKey, NetAddress, SectorRoot};
use crate::types::transactions::SignedRevision;

/// A connection to `host`, ready to carry one RPC.
pub struct HostSession {
    stream: RateLimitedStream<Box<dyn HostStream>>,
    host: HostPublicKey,
}

impl HostSession {
    pub fn connect(
        dialer: &dyn HostDialer,
        address: &NetAddress,
        host: HostPublicKey,
        rate_limit: Arc<RateLimit>,
        timeout: Duration,
    ) -> Result<HostSession, RenterError> {
        let mut stream = dialer
            .dial(address)
            .map_err(super::framing::network_error)
            .context(format!("dialing {}", address))?;
        stream.set_timeout(Some(timeout)).map_err(super::framing::network_error)?;
        Ok(HostSession {
            stream: RateLimitedStream::new(stream, rate_limit),
            host,
        })
    }

    pub fn host(&self) -> HostPublicKey {
        self.host
    }

    /// The underlying stream, for steps of an RPC driven by another module.
    pub fn stream(&mut self) -> &mut (impl Read + Write) {
        &mut self.stream
    }

    fn call<T: BorshDeserialize>(&mut self, request: &Request) -> Result<T, RenterError> {
        write_message(&mut self.stream, request)?;
        self.read_reply()
    }

    fn read_reply<T: BorshDeserialize>(&mut self) -> Result<T, RenterError> {
        let reply: Result<T, RpcError> = read_message(&mut self.stream)?;
        reply.map_err(RenterError::from)
    }

    pub fn settings(&mut self) -> Result<HostSettings, RenterError> {
        self.call(&Request::Settings)
    }

    pub fn update_price_table(&mut self) -> Result<PriceTable, RenterError> {
        self.call(&Request::UpdatePriceTable)
    }

    pub fn form_contract(&mut self, request: FormContractRequest) -> Result<ContractSignatures, RenterError> {
        self.call(&Request::FormContract(request))
    }

    pub fn renew_contract(&mut self, request: RenewContractRequest) -> Result<ContractSignatures, RenterError> {
        self.call(&Request::RenewContract(request))
    }

    /// The latest revision of `contract` the host holds.
    pub fn latest_revision(&mut self, contract: ContractID) -> Result<SignedRevision, RenterError> {
        self.call(&Request::LatestRevision(contract))
    }

    /// Hand a host that fell behind our latest fully signed revision.
    pub fn recover_revision(&mut self, revision: SignedRevision) -> Result<(), RenterError> {
        self.call(&Request::RecoverRevision(revision))
    }

    /// The sector roots the host stores under `contract`. The caller checks them against a revision.
    pub fn sector_roots(&mut self, contract: ContractID) -> Result<Vec<SectorRoot>, RenterError> {
        self.call(&Request::SectorRoots(contract))
    }

    /// Send a program. Payment follows on [`stream`](Self::stream).
    pub fn start_program(&mut self, request: ProgramRequest) -> Result<(), RenterError> {
        write_message(&mut self.stream, &Request::ExecuteProgram(request))
    }

    pub fn read_program_response(&mut self) -> Result<ProgramResponse, RenterError> {
        self.read_reply()
    }
}
