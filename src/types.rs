/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for 'inert' types, i.e., those that are sent around, persisted, and inspected, but have
//! no active behavior of their own.
//!
//! The submodules are:
//! 1. [`constants`]: protocol-wide sizes (sector, segment) and version numbers.
//! 2. [`crypto_primitives`]: re-exports of the hashing and signing primitives the renter relies on.
//! 3. [`currency`]: the [`Currency`](currency::Currency) amount type.
//! 4. [`data_types`]: newtypes that exist only to store bytes (hashes, keys, IDs, heights).
//! 5. [`keypair`]: a facade over the renter's signing key.
//! 6. [`transactions`]: file contracts, revisions, and the chain objects that carry them.

pub mod constants;

pub mod crypto_primitives;

pub mod currency;

pub mod data_types;

pub mod keypair;

pub mod transactions;
