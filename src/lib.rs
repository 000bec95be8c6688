/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A renter engine for decentralized storage networks.
//!
//! A renter forms storage contracts with hosts it finds on chain, splits files into erasure-coded
//! pieces, spreads the pieces over its hosts, and keeps every file healthy as hosts come and go. On
//! top of that, pubfiles let anyone fetch a file knowing nothing but its publink.
//!
//! Start with [`renter`], which shows how to build and start a [`Renter`](renter::Renter) from a
//! [`Configuration`](config::Configuration) and implementations of the traits in [`collaborators`].

pub mod alerts;

pub mod collaborators;

pub mod config;

pub mod contract_set;

pub mod contractor;

pub mod download;

pub mod erasure;

pub mod errors;

pub(crate) mod event_bus;

pub mod events;

pub mod filesystem;

pub mod host_protocol;

pub mod hostdb;

pub mod logging;

pub mod memory;

pub mod merkle;

pub mod persist;

pub mod pubaccesskey;

pub mod pubfile;

pub mod refcounter;

pub mod renter;

pub mod repair;

pub mod thread_group;

pub mod types;

pub mod upload;

pub mod worker;

pub mod worker_pool;
