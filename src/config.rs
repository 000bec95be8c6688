/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! User-defined parameters of a renter.
//!
//! A [`Configuration`] is built with the builder pattern, and split by
//! [`RenterSpec::start`](crate::renter::RenterSpec::start) into the configurations of the subsystems
//! that need its fields:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .persist_dir(dir)
//!     .renter_key(signing_key)
//!     .log_events(true)
//!     .cache_ttl(Duration::from_secs(1))
//!     .build();
//! ```

use std::path::PathBuf;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::contractor::ContractorConfiguration;
use crate::hostdb::HostDBConfiguration;
use crate::repair::RepairConfiguration;
use crate::types::constants::DEFAULT_RPC_TIMEOUT;
use crate::types::crypto_primitives::hash_all;
use crate::worker::WorkerConfiguration;

/// Stores the user-defined parameters required to start the renter.
///
/// ## Persistence
///
/// Everything the renter persists lives below `persist_dir`: contracts and refcounters, the host
/// database, the contractor's state, siafile and siadir metadata, the pubfile blacklist, the
/// pubaccesskey journal, and the write-ahead log that keeps them consistent across crashes.
///
/// ## Memory
///
/// `memory_limit` bounds the bytes held by chunks in flight for normal uploads and downloads.
/// `priority_memory_limit` is kept for priority work, such as repairs of chunks close to being lost,
/// so that user traffic cannot starve it.
///
/// ## Log Events
///
/// The renter logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.persist_dir(...)`
    - `.renter_key(...)`

    Every other setter is optional and defaults to the value used in production.
"))]
pub struct Configuration {
    #[builder(setter(into, doc = "Set the directory everything the renter persists is stored in. Required."))]
    pub persist_dir: PathBuf,
    #[builder(setter(doc = "Set the renter's identity key, from which its refund account is derived. Required."))]
    pub renter_key: SigningKey,
    #[builder(default = true, setter(doc = "Enable logging of every event with the default loggers."))]
    pub log_events: bool,

    #[builder(default = Duration::from_secs(60), setter(doc = "Set how long a worker's cached view of its contract stays fresh."))]
    pub cache_ttl: Duration,
    #[builder(default = DEFAULT_RPC_TIMEOUT, setter(doc = "Set the timeout of a single read or write on a host connection."))]
    pub rpc_timeout: Duration,
    #[builder(default = Duration::from_secs(3), setter(doc = "Set how often an idle worker checks whether the gateway came back online."))]
    pub offline_check_frequency: Duration,
    #[builder(default = Duration::from_secs(1), setter(doc = "Set the base cooldown of a worker after a failed upload."))]
    pub upload_failure_cooldown: Duration,
    #[builder(default = Duration::from_secs(1), setter(doc = "Set the base cooldown of a worker after a failed download."))]
    pub download_failure_cooldown: Duration,
    #[builder(default = 10, setter(doc = "Set the number of consecutive failures after which a cooldown stops growing."))]
    pub max_consecutive_penalty: u32,
    #[builder(default = 10 << 20, setter(doc = "Set the bytes a worker may have in flight on async reads."))]
    pub max_async_read_bytes: u64,
    #[builder(default = 10 << 20, setter(doc = "Set the bytes a worker may have in flight on async writes."))]
    pub max_async_write_bytes: u64,

    #[builder(default = 1 << 30, setter(doc = "Set the memory available to normal uploads and downloads, in bytes."))]
    pub memory_limit: u64,
    #[builder(default = 256 << 20, setter(doc = "Set the memory reserved for priority work, in bytes."))]
    pub priority_memory_limit: u64,

    #[builder(default = Duration::from_secs(15 * 60), setter(doc = "Set the time between two repair passes when nothing triggers one."))]
    pub repair_interval: Duration,
    #[builder(default = 3, setter(doc = "Set on every how many repair passes stuck chunks are retried."))]
    pub stuck_retry_passes: u32,
    #[builder(default = Duration::from_secs(60), setter(doc = "Set how long a download chunk may go without progress before it fails."))]
    pub download_timeout: Duration,
    #[builder(default = Duration::from_secs(10 * 60), setter(doc = "Set how often the worker pool is compared with the contract set when no maintenance triggers it."))]
    pub worker_pool_update_interval: Duration,

    #[builder(default = Duration::from_secs(10 * 60), setter(doc = "Set how often contract maintenance runs when no block arrives."))]
    pub maintenance_interval: Duration,
    #[builder(default = Duration::from_secs(1), setter(doc = "Set how long a triggered maintenance pass waits for a running one."))]
    pub maintenance_lock_timeout: Duration,
    #[builder(default = 0.2, setter(doc = "Set the fraction of its initial funds below which a contract is refreshed."))]
    pub refresh_fraction: f64,
    #[builder(default = 4, setter(doc = "Set the denominator of the allowance share a single host may cost before it is gouging."))]
    pub gouging_fraction_denom: u64,

    #[builder(default = Duration::from_secs(4 * 60 * 60), setter(doc = "Set how long a host scan stays fresh."))]
    pub scan_interval: Duration,
    #[builder(default = Duration::from_secs(60), setter(doc = "Set how often the scanner looks for stale hosts when nothing wakes it."))]
    pub scan_check_interval: Duration,
    #[builder(default = true, setter(doc = "Refuse to form contracts with two hosts in the same subnet."))]
    pub ip_filter: bool,

    #[builder(default = false, setter(doc = "Panic on critical errors in debug builds instead of only logging them."))]
    pub abort_on_critical: bool,
}

impl Into<(HostDBConfiguration, ContractorConfiguration, WorkerConfiguration, RepairConfiguration)> for &Configuration {
    fn into(self) -> (HostDBConfiguration, ContractorConfiguration, WorkerConfiguration, RepairConfiguration) {
        let hostdb_config = HostDBConfiguration {
            persist_dir: self.persist_dir.join("hostdb"),
            scan_interval: self.scan_interval,
            scan_check_interval: self.scan_check_interval,
            rpc_timeout: self.rpc_timeout,
            ip_filter: self.ip_filter,
        };
        let contractor_config = ContractorConfiguration {
            persist_dir: self.persist_dir.clone(),
            rpc_timeout: self.rpc_timeout,
            maintenance_interval: self.maintenance_interval,
            maintenance_lock_timeout: self.maintenance_lock_timeout,
            refresh_fraction: self.refresh_fraction,
            gouging_fraction_denom: self.gouging_fraction_denom,
            abort_on_critical: self.abort_on_critical,
        };
        let worker_config = WorkerConfiguration {
            cache_ttl: self.cache_ttl,
            rpc_timeout: self.rpc_timeout,
            offline_check_frequency: self.offline_check_frequency,
            upload_failure_cooldown: self.upload_failure_cooldown,
            download_failure_cooldown: self.download_failure_cooldown,
            max_consecutive_penalty: self.max_consecutive_penalty,
            max_async_read_bytes: self.max_async_read_bytes,
            max_async_write_bytes: self.max_async_write_bytes,
            gouging_fraction_denom: self.gouging_fraction_denom,
            abort_on_critical: self.abort_on_critical,
            refund_account: hash_all(&[b"refund", self.renter_key.verifying_key().as_bytes()]),
        };
        let repair_config = RepairConfiguration {
            interval: self.repair_interval,
            stuck_retry_passes: self.stuck_retry_passes,
        };
        (hostdb_config, contractor_config, worker_config, repair_config)
    }
}
