/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for the external systems the renter consumes.
//!
//! The renter does not run a blockchain node, a wallet, or a peer-to-peer gateway itself. Instead, the
//! library user provides implementations of the four traits in this module when building a
//! [`RenterSpec`](crate::renter::RenterSpec):
//! 1. [`ConsensusSet`]: the source of blocks, block height, and sync status.
//! 2. [`Gateway`]: the node's peer-to-peer connectivity.
//! 3. [`TransactionPool`]: where contract formation transactions are submitted.
//! 4. [`Wallet`]: funds contracts and provides the seed from which contract keys are derived.
//!
//! The implementations are shared between the renter's threads, so every trait requires `Send + Sync`.

use std::sync::mpsc::Sender;

use crate::errors::RenterError;
use crate::types::{
    currency::Currency,
    data_types::{BlockHeight, ConsensusChangeID, NetAddress},
    transactions::{ChainBlock, Transaction, UnlockHash},
};

/// A batch of blocks applied to (and possibly reverted from) the subscriber's view of the chain.
#[derive(Clone, Debug)]
pub struct ConsensusChange {
    pub id: ConsensusChangeID,
    pub reverted_blocks: Vec<ChainBlock>,
    pub applied_blocks: Vec<ChainBlock>,
    /// Height of the chain after this change.
    pub height: BlockHeight,
    /// Whether this change brings the subscriber up to the tip of the chain.
    pub synced: bool,
}

pub trait ConsensusSet: Send + Sync {
    /// Deliver every change after `start` to `subscriber`, then every future change, in order. The
    /// subscription ends when the receiving half of `subscriber` is dropped.
    ///
    /// Returns an error if `start` is not a change the consensus set knows about.
    fn subscribe(&self, start: ConsensusChangeID, subscriber: Sender<ConsensusChange>) -> Result<(), RenterError>;

    /// Current height of the chain.
    fn height(&self) -> BlockHeight;

    /// Whether the node believes it is at the tip of the chain.
    fn synced(&self) -> bool;
}

pub trait Gateway: Send + Sync {
    /// Whether the node has at least one live peer.
    fn online(&self) -> bool;

    fn address(&self) -> NetAddress;

    fn peers(&self) -> Vec<NetAddress>;

    fn connect(&self, address: &NetAddress) -> Result<(), RenterError>;

    fn disconnect(&self, address: &NetAddress) -> Result<(), RenterError>;

    /// Send `payload` under the RPC `name` to every peer without blocking.
    fn broadcast(&self, name: &str, payload: &[u8]);
}

pub trait TransactionPool: Send + Sync {
    /// Submit a set of dependent transactions for inclusion in the chain.
    fn accept_transaction_set(&self, transactions: Vec<Transaction>) -> Result<(), RenterError>;

    /// Drop every transaction the pool holds.
    fn purge(&self);
}

pub trait Wallet: Send + Sync {
    fn next_address(&self) -> Result<UnlockHash, RenterError>;

    /// The wallet's primary seed. Fails if the wallet is locked.
    fn primary_seed(&self) -> Result<[u8; 32], RenterError>;

    fn unlock(&self, password: &str) -> Result<(), RenterError>;

    /// Add inputs worth `amount` (plus the miner fee) to `transaction` and sign them. Fails with
    /// [`RenterError::InsufficientFunds`] if the wallet cannot cover the amount.
    fn fund_transaction(&self, transaction: &mut Transaction, amount: Currency) -> Result<(), RenterError>;

    /// Confirmed balance that can still be spent.
    fn confirmed_balance(&self) -> Currency;
}
