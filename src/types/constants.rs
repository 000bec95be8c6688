/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Protocol-wide constants shared by the renter and the hosts it talks to.

use std::time::Duration;

/// Size of one sector, the unit of data stored on a host.
pub const SECTOR_SIZE: u64 = 1 << 22;

/// Size of one Merkle leaf inside a sector.
pub const SEGMENT_SIZE: u64 = 64;

/// Number of segments (Merkle leaves) in one sector.
pub const SEGMENTS_PER_SECTOR: u64 = SECTOR_SIZE / SEGMENT_SIZE;

/// Number of blocks a host waits after a contract's window closes before the contract is considered
/// finished and can be dropped from the renter's records.
pub const MATURITY_DELAY: u64 = 144;

/// Length of the storage proof window that follows a contract's end height.
pub const WINDOW_SIZE: u64 = 144;

/// Default timeout for a single RPC with a host.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Oldest host software version the renter forms contracts with.
pub const MIN_HOST_VERSION: &str = "1.4.0";
