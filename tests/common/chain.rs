use std::sync::{mpsc::Sender, Arc, Mutex};

use renter_rs::{
    collaborators::{ConsensusChange, ConsensusSet, Gateway, TransactionPool, Wallet},
    errors::RenterError,
    types::{
        crypto_primitives::hash_all,
        currency::Currency,
        data_types::{BlockHeight, ConsensusChangeID, NetAddress},
        transactions::{ChainBlock, HostAnnouncement, Transaction, UnlockHash},
    },
};

/// A mock blockchain that holds every block in memory and replays them to subscribers. Transactions
/// submitted through its [TransactionPool] implementation are included in the next mined block.
pub(crate) struct MockChain {
    state: Mutex<ChainState>,
}

struct ChainState {
    changes: Vec<ConsensusChange>,
    subscribers: Vec<Sender<ConsensusChange>>,
    pending: Vec<Transaction>,
    confirmed_contracts: usize,
}

impl MockChain {
    /// Create a chain holding only a genesis block.
    pub(crate) fn new() -> Arc<MockChain> {
        let chain = Arc::new(MockChain {
            state: Mutex::new(ChainState {
                changes: Vec::new(),
                subscribers: Vec::new(),
                pending: Vec::new(),
                confirmed_contracts: 0,
            }),
        });
        chain.mine_block(Vec::new());
        chain
    }

    /// Mine a block holding every pending transaction plus `transactions`, and deliver it to every live
    /// subscriber.
    pub(crate) fn mine_block(&self, transactions: Vec<Transaction>) -> BlockHeight {
        let mut state = self.state.lock().unwrap();
        let height = state.changes.len() as u64;
        let mut included: Vec<Transaction> = state.pending.drain(..).collect();
        included.extend(transactions);
        state.confirmed_contracts += included.iter().map(|txn| txn.file_contracts.len()).sum::<usize>();

        let block = ChainBlock {
            id: hash_all(&[b"block", &height.to_le_bytes()]),
            height: BlockHeight::new(height),
            transactions: included,
        };
        let change = ConsensusChange {
            id: ConsensusChangeID::new(hash_all(&[b"change", &height.to_le_bytes()])),
            reverted_blocks: Vec::new(),
            applied_blocks: vec![block],
            height: BlockHeight::new(height),
            synced: true,
        };
        state.subscribers.retain(|subscriber| subscriber.send(change.clone()).is_ok());
        state.changes.push(change);
        BlockHeight::new(height)
    }

    /// Mine `n` empty blocks.
    pub(crate) fn mine_blocks(&self, n: u64) {
        for _ in 0..n {
            self.mine_block(Vec::new());
        }
    }

    /// Mine a block announcing every host in `announcements`.
    pub(crate) fn announce_hosts(&self, announcements: Vec<HostAnnouncement>) -> BlockHeight {
        self.mine_block(vec![Transaction {
            host_announcements: announcements,
            ..Default::default()
        }])
    }

    /// Number of file contracts that made it into a block.
    pub(crate) fn confirmed_contracts(&self) -> usize {
        self.state.lock().unwrap().confirmed_contracts
    }

    pub(crate) fn pending_transactions(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

impl ConsensusSet for MockChain {
    fn subscribe(&self, start: ConsensusChangeID, subscriber: Sender<ConsensusChange>) -> Result<(), RenterError> {
        let mut state = self.state.lock().unwrap();
        let first = if start == ConsensusChangeID::BEGINNING {
            0
        } else {
            match state.changes.iter().position(|change| change.id == start) {
                Some(index) => index + 1,
                None => {
                    return Err(RenterError::InvalidArgument(format!(
                        "unknown consensus change {:?}",
                        start
                    )))
                }
            }
        };
        for change in &state.changes[first..] {
            if subscriber.send(change.clone()).is_err() {
                return Ok(());
            }
        }
        state.subscribers.push(subscriber);
        Ok(())
    }

    fn height(&self) -> BlockHeight {
        BlockHeight::new(self.state.lock().unwrap().changes.len().saturating_sub(1) as u64)
    }

    fn synced(&self) -> bool {
        true
    }
}

impl TransactionPool for MockChain {
    fn accept_transaction_set(&self, transactions: Vec<Transaction>) -> Result<(), RenterError> {
        self.state.lock().unwrap().pending.extend(transactions);
        Ok(())
    }

    fn purge(&self) {
        self.state.lock().unwrap().pending.clear();
    }
}

/// A gateway that is always online and never talks to anyone.
pub(crate) struct MockGateway;

impl Gateway for MockGateway {
    fn online(&self) -> bool {
        true
    }

    fn address(&self) -> NetAddress {
        NetAddress::new("127.0.0.1:9981")
    }

    fn peers(&self) -> Vec<NetAddress> {
        vec![NetAddress::new("127.0.0.2:9981")]
    }

    fn connect(&self, _: &NetAddress) -> Result<(), RenterError> {
        Ok(())
    }

    fn disconnect(&self, _: &NetAddress) -> Result<(), RenterError> {
        Ok(())
    }

    fn broadcast(&self, _: &str, _: &[u8]) {}
}

/// An unlocked wallet with a fixed seed and unlimited funds.
pub(crate) struct MockWallet {
    pub(crate) seed: [u8; 32],
}

impl Wallet for MockWallet {
    fn next_address(&self) -> Result<UnlockHash, RenterError> {
        Ok(hash_all(&[b"address", &self.seed, &rand::random::<u64>().to_le_bytes()]))
    }

    fn primary_seed(&self) -> Result<[u8; 32], RenterError> {
        Ok(self.seed)
    }

    fn unlock(&self, _: &str) -> Result<(), RenterError> {
        Ok(())
    }

    fn fund_transaction(&self, _: &mut Transaction, _: Currency) -> Result<(), RenterError> {
        Ok(())
    }

    fn confirmed_balance(&self) -> Currency {
        Currency::coins(1_000_000)
    }
}
