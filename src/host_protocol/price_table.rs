/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-operation prices quoted by a host.
//!
//! A host hands out price tables with a random `uid` and a validity period. Every program names the
//! table it is priced against; the host refuses programs quoting a table it did not issue or one that
//! has expired.

use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};

use super::messages::HostSettings;
use crate::types::currency::Currency;
use crate::types::data_types::BlockHeight;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PriceTable {
    pub uid: [u8; 16],
    /// How long the host honours this table after issuing it, in seconds.
    pub validity_secs: u64,
    /// The host's block height when the table was issued. Storage costs are computed against it.
    pub host_block_height: BlockHeight,

    pub init_base_cost: Currency,
    pub has_sector_base_cost: Currency,
    pub read_base_cost: Currency,
    /// Per byte read.
    pub read_length_cost: Currency,
    pub write_base_cost: Currency,
    /// Per byte written.
    pub write_length_cost: Currency,
    /// Per byte stored per block.
    pub write_store_cost: Currency,
    /// Per sector dropped.
    pub drop_sectors_cost: Currency,
    pub swap_sector_cost: Currency,
    pub revision_cost: Currency,
    /// Per byte sent to the host.
    pub upload_bandwidth_cost: Currency,
    /// Per byte sent by the host.
    pub download_bandwidth_cost: Currency,

    pub contract_price: Currency,
    /// Collateral per byte per block.
    pub collateral_cost: Currency,
}

impl PriceTable {
    /// The table a host with `settings` issues at `height`.
    pub fn from_settings(settings: &HostSettings, uid: [u8; 16], height: BlockHeight, validity: Duration) -> PriceTable {
        PriceTable {
            uid,
            validity_secs: validity.as_secs(),
            host_block_height: height,
            init_base_cost: settings.base_rpc_price,
            has_sector_base_cost: settings.sector_access_price,
            read_base_cost: settings.sector_access_price,
            read_length_cost: Currency::new(1),
            write_base_cost: settings.sector_access_price,
            write_length_cost: Currency::new(1),
            write_store_cost: settings.storage_price,
            drop_sectors_cost: Currency::new(1),
            swap_sector_cost: Currency::new(1),
            revision_cost: Currency::ZERO,
            upload_bandwidth_cost: settings.upload_bandwidth_price,
            download_bandwidth_cost: settings.download_bandwidth_price,
            contract_price: settings.contract_price,
            collateral_cost: settings.collateral,
        }
    }

    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_secs)
    }
}
