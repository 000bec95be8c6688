/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Programs the worker runs on its host, paid for through its contract.

use std::time::{Duration, Instant};

use super::gouging::{check_download_gouging, check_upload_gouging};
use super::Worker;
use crate::contract_set::record::{RootsOp, SpendingKind};
use crate::contractor::allowance::Allowance;
use crate::errors::{NotFoundKind, RenterError, ResultExt};
use crate::host_protocol::messages::{ProgramRequest, ProgramResponse};
use crate::host_protocol::price_table::PriceTable;
use crate::host_protocol::program::{program_cost, Instruction, InstructionOutput};
use crate::host_protocol::session::HostSession;
use crate::merkle;
use crate::types::constants::{SECTOR_SIZE, SEGMENT_SIZE};
use crate::types::data_types::{ContractID, SectorRoot};

/// A price table is refreshed this long before the host stops accepting it.
const PRICE_TABLE_MARGIN: Duration = Duration::from_secs(5);

type GougingCheck = fn(&PriceTable, &Allowance, u64) -> Result<(), RenterError>;

impl Worker {
    /// Open a connection to the host, ready for one RPC.
    pub(crate) fn connect(&self) -> Result<HostSession, RenterError> {
        let (entry, _) = self
            .env
            .hostdb
            .host(&self.host)
            .ok_or(RenterError::NotFound(NotFoundKind::Host(self.host)))?;
        HostSession::connect(
            self.env.dialer.as_ref(),
            &entry.net_address,
            self.host,
            self.env.contractor.contract_set().rate_limit(),
            self.env.config.rpc_timeout,
        )
    }

    /// The host's current price table, fetched again once it is about to expire.
    pub(crate) fn price_table(&self) -> Result<PriceTable, RenterError> {
        let mut cached = self.price_table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((price_table, expiry)) = cached.as_ref() {
            if Instant::now() + PRICE_TABLE_MARGIN < *expiry {
                return Ok(price_table.clone());
            }
        }
        let price_table = self
            .connect()?
            .update_price_table()
            .context(format!("fetching the price table of {}", self.host))?;
        *cached = Some((price_table.clone(), Instant::now() + price_table.validity()));
        Ok(price_table)
    }

    fn forget_price_table(&self) {
        *self.price_table.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    fn contract_id(&self) -> Result<ContractID, RenterError> {
        self.cache()
            .contract_id
            .ok_or(RenterError::NotFound(NotFoundKind::Host(self.host)))
            .context("worker has no contract with its host")
    }

    /// Run `instructions` on the host, paying through the worker's contract.
    pub(crate) fn execute_program(
        &self,
        instructions: Vec<Instruction>,
        data: Vec<u8>,
        spending: SpendingKind,
        gouging: Option<GougingCheck>,
    ) -> Result<ProgramResponse, RenterError> {
        let cache = self.cache();
        let id = self.contract_id()?;
        let price_table = self.price_table()?;
        if let Some(check) = gouging {
            check(&price_table, &cache.allowance, self.env.config.gouging_fraction_denom)?;
        }

        let duration = cache.contract_end.saturating_sub(cache.block_height);
        let cost = program_cost(&price_table, &instructions, duration);
        let roots_ops = RootsOp::from_program(&instructions, &data);
        let expected_outputs = instructions.len();

        let result = self.connect().and_then(|mut session| {
            session.start_program(ProgramRequest {
                price_table: price_table.uid,
                contract: id,
                instructions,
                data,
            })?;
            self.env.contractor.pay_by_contract(
                session.stream(),
                &id,
                cost,
                self.env.config.refund_account,
                cache.block_height,
                spending,
                roots_ops,
            )?;
            session.read_program_response()
        });
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.handle_rpc_error(&id, &err);
                return Err(err);
            }
        };
        if response.outputs.len() != expected_outputs {
            let err = RenterError::HostProtocolViolation(format!(
                "host returned {} outputs for a program of {} instructions",
                response.outputs.len(),
                expected_outputs
            ));
            self.handle_rpc_error(&id, &err);
            return Err(err);
        }
        Ok(response)
    }

    /// React to a failed RPC on contract `id`.
    pub(crate) fn handle_rpc_error(&self, id: &ContractID, err: &RenterError) {
        self.forget_price_table();
        if err.is_revision_mismatch() {
            log::debug!("Worker for host {} suspects a revision mismatch: {}", self.host, err);
            self.set_suspect_revision_mismatch();
        }
        if err.is_contract_fatal() {
            if let Err(mark_err) = self.env.contractor.mark_contract_bad(id) {
                log::warn!("Failed to mark contract {} bad: {}", id, mark_err);
            }
            self.refresh_cache();
        }
    }

    /// Store `data` (at most one sector, zero-padded) on the host. Returns the new sector's root.
    pub(crate) fn upload_sector(&self, data: &[u8]) -> Result<SectorRoot, RenterError> {
        if data.len() as u64 > SECTOR_SIZE {
            return Err(RenterError::InvalidArgument(format!("{} bytes do not fit in a sector", data.len())));
        }
        let mut sector = data.to_vec();
        sector.resize(SECTOR_SIZE as usize, 0);
        let expected = merkle::sector_root(&sector);
        let response = self.execute_program(
            vec![Instruction::Append],
            sector,
            SpendingKind::Upload,
            Some(check_upload_gouging),
        )?;
        match response.outputs.into_iter().next() {
            Some(InstructionOutput::Append { root }) if root == expected => Ok(root),
            _ => {
                let id = self.contract_id()?;
                let err = RenterError::HostProtocolViolation("host reported a wrong root for an appended sector".into());
                self.handle_rpc_error(&id, &err);
                Err(err)
            }
        }
    }

    /// Read `length` bytes at `offset` of the sector with `root`, checking them against the root.
    pub(crate) fn read_sector(&self, root: &SectorRoot, offset: u64, length: u64) -> Result<Vec<u8>, RenterError> {
        if length == 0 || offset + length > SECTOR_SIZE {
            return Err(RenterError::InvalidArgument(format!(
                "cannot read {} bytes at {} of a sector",
                length, offset
            )));
        }
        let (start, end) = merkle::segment_bounds(offset, length);
        let aligned_offset = start as u64 * SEGMENT_SIZE;
        let aligned_length = (end - start) as u64 * SEGMENT_SIZE;
        let response = self.execute_program(
            vec![Instruction::ReadSector {
                root: *root,
                offset: aligned_offset,
                length: aligned_length,
                proof: true,
            }],
            Vec::new(),
            SpendingKind::Download,
            Some(check_download_gouging),
        )?;
        match response.outputs.into_iter().next() {
            Some(InstructionOutput::ReadSector { data, proof })
                if merkle::verify_sector_range(&data, &proof, start, end, root) =>
            {
                let skip = (offset - aligned_offset) as usize;
                Ok(data[skip..skip + length as usize].to_vec())
            }
            _ => {
                let id = self.contract_id()?;
                let err = RenterError::HostProtocolViolation(format!("host sent an invalid proof for sector {}", root));
                self.handle_rpc_error(&id, &err);
                Err(err)
            }
        }
    }

    /// Read `length` bytes at `offset` of the contract's data, viewed as one byte range.
    pub(crate) fn read_offset(&self, offset: u64, length: u64) -> Result<Vec<u8>, RenterError> {
        let id = self.contract_id()?;
        let in_sector = offset % SECTOR_SIZE;
        if length == 0 || in_sector + length > SECTOR_SIZE {
            return Err(RenterError::InvalidArgument(format!(
                "cannot read {} bytes at {} within one sector",
                length, offset
            )));
        }
        let (start, end) = merkle::segment_bounds(in_sector, length);
        let aligned_offset = offset - in_sector + start as u64 * SEGMENT_SIZE;
        let aligned_length = (end - start) as u64 * SEGMENT_SIZE;
        let response = self.execute_program(
            vec![Instruction::ReadOffset {
                offset: aligned_offset,
                length: aligned_length,
                proof: true,
            }],
            Vec::new(),
            SpendingKind::Download,
            Some(check_download_gouging),
        )?;
        let contract = self
            .env
            .contractor
            .contract_set()
            .view(&id)
            .ok_or(RenterError::NotFound(NotFoundKind::Contract(id)))?;
        match response.outputs.into_iter().next() {
            Some(InstructionOutput::ReadOffset {
                data,
                proof,
                sector_index,
                sector_root,
                roots_proof,
            }) if sector_index == offset / SECTOR_SIZE
                && merkle::verify_sector_range(&data, &proof, start, end, &sector_root)
                && merkle::verify_range_proof(
                    &merkle::roots_leaves(&[sector_root]),
                    &roots_proof,
                    sector_index as usize,
                    sector_index as usize + 1,
                    contract.num_sectors as usize,
                    &contract.merkle_root,
                ) =>
            {
                let skip = (in_sector - start as u64 * SEGMENT_SIZE) as usize;
                Ok(data[skip..skip + length as usize].to_vec())
            }
            _ => {
                let err = RenterError::HostProtocolViolation(format!("host sent an invalid proof for offset {}", offset));
                self.handle_rpc_error(&id, &err);
                Err(err)
            }
        }
    }

    /// Whether the host stores a sector with `root`.
    pub(crate) fn check_sector(&self, root: &SectorRoot) -> Result<bool, RenterError> {
        let response = self.execute_program(
            vec![Instruction::HasSector { root: *root }],
            Vec::new(),
            SpendingKind::Fees,
            Some(check_download_gouging),
        )?;
        match response.outputs.into_iter().next() {
            Some(InstructionOutput::HasSector(has)) => Ok(has),
            _ => Err(RenterError::HostProtocolViolation("host answered a has-sector query with another output".into())),
        }
    }

    /// Run `instructions` that rearrange the contract's sectors, appending `data` as needed.
    pub(crate) fn modify_sectors(&self, instructions: Vec<Instruction>, data: Vec<u8>) -> Result<ProgramResponse, RenterError> {
        self.execute_program(instructions, data, SpendingKind::Upload, Some(check_upload_gouging))
    }
}
