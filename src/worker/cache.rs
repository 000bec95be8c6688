/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Contractor and host database state a worker consults on every job.
//!
//! Reading that state from its owners on every job would contend on their locks, so each worker keeps
//! an immutable snapshot that is swapped out whole once it is older than the configured TTL. Only one
//! thread rebuilds the snapshot at a time; the others keep using the old one.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use super::Worker;
use crate::contract_set::record::ContractUtility;
use crate::contractor::allowance::Allowance;
use crate::types::data_types::{BlockHeight, ContractID};

#[derive(Clone, Debug)]
pub struct WorkerCache {
    pub block_height: BlockHeight,
    /// The contract the worker uses. `None` once the contract left the set.
    pub contract_id: Option<ContractID>,
    pub contract_end: BlockHeight,
    pub utility: ContractUtility,
    pub host_version: String,
    pub allowance: Allowance,
    pub synced: bool,
    pub last_update: Instant,
}

impl Worker {
    /// The current snapshot.
    pub fn cache(&self) -> Arc<WorkerCache> {
        self.cache.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub(crate) fn build_cache(&self) -> WorkerCache {
        let contract = self.env.contractor.contract_by_public_key(&self.host);
        let host_version = self
            .env
            .hostdb
            .host(&self.host)
            .and_then(|(entry, _)| entry.settings.map(|settings| settings.version))
            .unwrap_or_default();
        WorkerCache {
            block_height: self.env.contractor.block_height(),
            contract_id: contract.as_ref().map(|contract| contract.id),
            contract_end: contract.as_ref().map(|contract| contract.end_height).unwrap_or_default(),
            utility: contract.map(|contract| contract.utility).unwrap_or_default(),
            host_version,
            allowance: self.env.contractor.allowance(),
            synced: self.env.contractor.synced(),
            last_update: Instant::now(),
        }
    }

    /// Rebuild the snapshot now, unless another thread already is.
    pub(crate) fn refresh_cache(&self) {
        if self
            .cache_updating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let cache = Arc::new(self.build_cache());
        *self.cache.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = cache;
        self.cache_updating.store(false, Ordering::SeqCst);
    }

    /// Rebuild the snapshot if it is older than the TTL.
    pub(crate) fn refresh_cache_if_stale(&self) {
        if self.cache().last_update.elapsed() >= self.env.config.cache_ttl {
            self.refresh_cache();
        }
    }
}
