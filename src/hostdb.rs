/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The scored catalog of known hosts.
//!
//! ## Discovery
//!
//! Hosts join the network by announcing their public key and address on chain. The host database reads
//! announcements from every applied block ([`process_consensus_change`](HostDB::process_consensus_change))
//! and creates an [entry](entry::HostDBEntry) for each new host. Entries are never removed; a host that
//! disappears only loses score.
//!
//! ## Scanning
//!
//! A scanner thread periodically dials every host and asks for its [settings](HostSettings). The outcome
//! of each scan is recorded on the entry and feeds the uptime factor of the host's
//! [score](scoring::score). Scan failures are never fatal to the database.
//!
//! ## Selection
//!
//! [`random_hosts`](HostDB::random_hosts) samples active hosts without replacement, with probability
//! proportional to their score. When the IP filter is on, no two selected hosts (and no selected host and
//! any host passed in `used`) share a subnet.

pub mod entry;

pub mod scoring;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;

use self::entry::{now_secs, HostDBEntry};
use self::scoring::ScoreBreakdown;
use crate::collaborators::ConsensusChange;
use crate::contractor::allowance::Allowance;
use crate::errors::{RenterError, ResultExt};
use crate::host_protocol::messages::HostSettings;
use crate::host_protocol::rate_limit::RateLimit;
use crate::host_protocol::session::HostSession;
use crate::host_protocol::HostDialer;
use crate::persist::versioned_file::{self, Metadata};
use crate::thread_group::ThreadGroup;
use crate::types::crypto_primitives::new_specifier;
use crate::types::data_types::{BlockHeight, HostPublicKey, NetAddress};

const HOSTDB_METADATA: Metadata = Metadata::new(new_specifier("HostDB"), new_specifier("1.0.0"));

/// Scans run concurrently in batches of this size.
const SCAN_BATCH_SIZE: usize = 8;

#[derive(Clone)]
pub struct HostDBConfiguration {
    pub persist_dir: PathBuf,
    /// How long a scan stays fresh.
    pub scan_interval: Duration,
    /// How often the scanner looks for stale entries when nothing wakes it.
    pub scan_check_interval: Duration,
    pub rpc_timeout: Duration,
    pub ip_filter: bool,
}

struct HostDBState {
    entries: HashMap<HostPublicKey, HostDBEntry>,
    height: BlockHeight,
}

pub struct HostDB {
    config: HostDBConfiguration,
    state: RwLock<HostDBState>,
    allowance: RwLock<Allowance>,
    ip_filter: RwLock<bool>,
    dialer: Arc<dyn HostDialer>,
    rate_limit: Arc<RateLimit>,
    scan_trigger: Mutex<Option<Sender<()>>>,
}

impl HostDB {
    /// Load the host database from `config.persist_dir`, or start empty.
    pub fn new(
        config: HostDBConfiguration,
        dialer: Arc<dyn HostDialer>,
        rate_limit: Arc<RateLimit>,
    ) -> Result<Arc<HostDB>, RenterError> {
        let path = config.persist_dir.join("hostdb.dat");
        let entries: Vec<HostDBEntry> = match versioned_file::load(&HOSTDB_METADATA, &path) {
            Ok(entries) => entries,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err.add_context("loading host database")),
        };
        let ip_filter = config.ip_filter;
        Ok(Arc::new(HostDB {
            config,
            state: RwLock::new(HostDBState {
                entries: entries.into_iter().map(|entry| (entry.public_key, entry)).collect(),
                height: BlockHeight::new(0),
            }),
            allowance: RwLock::new(Allowance::zero()),
            ip_filter: RwLock::new(ip_filter),
            dialer,
            rate_limit,
            scan_trigger: Mutex::new(None),
        }))
    }

    fn save(&self) -> Result<(), RenterError> {
        let entries: Vec<HostDBEntry> = self.read_state().entries.values().cloned().collect();
        versioned_file::save(&HOSTDB_METADATA, &entries, &self.config.persist_dir.join("hostdb.dat"))
            .context("saving host database")
    }

    fn read_state(&self) -> RwLockReadGuard<'_, HostDBState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, HostDBState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The entry and score of `host`.
    pub fn host(&self, host: &HostPublicKey) -> Option<(HostDBEntry, ScoreBreakdown)> {
        let state = self.read_state();
        let entry = state.entries.get(host)?.clone();
        let breakdown = scoring::score(&entry, &self.allowance(), state.height);
        Some((entry, breakdown))
    }

    pub fn all_hosts(&self) -> Vec<HostDBEntry> {
        self.read_state().entries.values().cloned().collect()
    }

    /// Hosts that answered their last scan and accept contracts.
    pub fn active_hosts(&self) -> Vec<HostDBEntry> {
        self.read_state()
            .entries
            .values()
            .filter(|entry| entry.is_active())
            .cloned()
            .collect()
    }

    pub fn allowance(&self) -> Allowance {
        self.allowance.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Update the price caps and usage profile hosts are scored against.
    pub fn set_allowance(&self, allowance: Allowance) {
        *self.allowance.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = allowance;
    }

    pub fn set_ip_filter(&self, enabled: bool) {
        *self.ip_filter.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = enabled;
    }

    pub fn height(&self) -> BlockHeight {
        self.read_state().height
    }

    /// Sample up to `n` active hosts weighted by score. Hosts in `avoid` are never returned. With the IP
    /// filter on, hosts sharing a subnet with a host in `used` or with an earlier pick are skipped.
    pub fn random_hosts(&self, n: usize, avoid: &HashSet<HostPublicKey>, used: &[HostPublicKey]) -> Vec<HostDBEntry> {
        let allowance = self.allowance();
        let ip_filter = *self.ip_filter.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = self.read_state();

        let mut taken_subnets: HashSet<Vec<u8>> = HashSet::new();
        if ip_filter {
            for host in used {
                if let Some(subnet) = state.entries.get(host).and_then(|entry| entry.net_address.subnet()) {
                    taken_subnets.insert(subnet);
                }
            }
        }

        let mut candidates: Vec<(HostDBEntry, f64)> = state
            .entries
            .values()
            .filter(|entry| entry.is_active() && !avoid.contains(&entry.public_key))
            .map(|entry| {
                let weight = scoring::score(entry, &allowance, state.height).score();
                (entry.clone(), weight)
            })
            .collect();
        drop(state);

        let mut rng = rand::thread_rng();
        let mut picked = Vec::new();
        while picked.len() < n && !candidates.is_empty() {
            let total: f64 = candidates.iter().map(|(_, weight)| weight).sum();
            let mut target = rng.gen::<f64>() * total;
            let mut index = candidates.len() - 1;
            for (i, (_, weight)) in candidates.iter().enumerate() {
                if target < *weight {
                    index = i;
                    break;
                }
                target -= weight;
            }
            let (entry, _) = candidates.swap_remove(index);
            if ip_filter {
                if let Some(subnet) = entry.net_address.subnet() {
                    if !taken_subnets.insert(subnet) {
                        continue;
                    }
                }
            }
            picked.push(entry);
        }
        picked
    }

    /// Read host announcements out of `change`.
    pub fn process_consensus_change(&self, change: &ConsensusChange) {
        let mut announced = false;
        {
            let mut state = self.write_state();
            state.height = change.height;
            for block in &change.applied_blocks {
                for transaction in &block.transactions {
                    for announcement in &transaction.host_announcements {
                        announced = true;
                        state
                            .entries
                            .entry(announcement.public_key)
                            .and_modify(|entry| entry.net_address = announcement.net_address.clone())
                            .or_insert_with(|| {
                                HostDBEntry::new(announcement.public_key, announcement.net_address.clone(), block.height)
                            });
                    }
                }
            }
        }
        if announced {
            if let Err(err) = self.save() {
                log::warn!("Failed to persist host announcements: {}", err);
            }
            self.trigger_scan();
        }
    }

    /// Wake the scanner.
    pub fn trigger_scan(&self) {
        if let Some(trigger) = self.scan_trigger.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).as_ref() {
            let _ = trigger.send(());
        }
    }

    /// Scan `host` now and record the result.
    pub fn scan_host(&self, host: &HostPublicKey) {
        let address = match self.read_state().entries.get(host) {
            Some(entry) => entry.net_address.clone(),
            None => return,
        };
        let result = self.fetch_settings(host, &address);
        if let Err(err) = &result {
            log::debug!("Scan of host {} failed: {}", host, err);
        }
        if let Some(entry) = self.write_state().entries.get_mut(host) {
            entry.record_scan(result.map_err(|err| err.to_string()));
        }
    }

    fn fetch_settings(&self, host: &HostPublicKey, address: &NetAddress) -> Result<HostSettings, RenterError> {
        let mut session = HostSession::connect(
            self.dialer.as_ref(),
            address,
            *host,
            self.rate_limit.clone(),
            self.config.rpc_timeout,
        )?;
        session.settings()
    }

    fn stale_hosts(&self) -> Vec<HostPublicKey> {
        let now = now_secs();
        let interval = self.config.scan_interval.as_secs();
        self.read_state()
            .entries
            .values()
            .filter(|entry| entry.last_scan().map_or(true, |last| now.saturating_sub(last) >= interval))
            .map(|entry| entry.public_key)
            .collect()
    }

    /// Start the scanner thread. It exits when `thread_group` is stopped.
    pub fn start_scanner(self: &Arc<Self>, thread_group: ThreadGroup) -> JoinHandle<()> {
        let (trigger, triggered): (Sender<()>, Receiver<()>) = mpsc::channel();
        *self.scan_trigger.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(trigger);
        let hostdb = self.clone();
        thread::spawn(move || loop {
            if thread_group.is_stopped() {
                return;
            }
            let stale = hostdb.stale_hosts();
            if !stale.is_empty() {
                let _guard = match thread_group.add() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                for batch in stale.chunks(SCAN_BATCH_SIZE) {
                    let handles: Vec<JoinHandle<()>> = batch
                        .iter()
                        .map(|host| {
                            let hostdb = hostdb.clone();
                            let host = *host;
                            thread::spawn(move || hostdb.scan_host(&host))
                        })
                        .collect();
                    for handle in handles {
                        let _ = handle.join();
                    }
                }
                if let Err(err) = hostdb.save() {
                    log::warn!("Failed to persist host scans: {}", err);
                }
            }
            match triggered.recv_timeout(hostdb.config.scan_check_interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::host_protocol::rate_limit::RateLimits;
    use crate::host_protocol::HostStream;
    use crate::types::constants::SECTOR_SIZE;
    use crate::types::currency::Currency;

    struct OfflineDialer;

    impl HostDialer for OfflineDialer {
        fn dial(&self, address: &NetAddress) -> io::Result<Box<dyn HostStream>> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, address.to_string()))
        }
    }

    fn hostdb(dir: &tempfile::TempDir, ip_filter: bool) -> Arc<HostDB> {
        let config = HostDBConfiguration {
            persist_dir: dir.path().to_path_buf(),
            scan_interval: Duration::from_secs(3600),
            scan_check_interval: Duration::from_secs(3600),
            rpc_timeout: Duration::from_secs(1),
            ip_filter,
        };
        let hostdb = HostDB::new(config, Arc::new(OfflineDialer), Arc::new(RateLimit::new(RateLimits::default()))).unwrap();
        hostdb.set_allowance(Allowance::default_allowance(Currency::coins(1000)));
        hostdb.write_state().height = BlockHeight::new(20_000);
        hostdb
    }

    fn key(byte: u8) -> HostPublicKey {
        HostPublicKey::new([byte; 32])
    }

    /// Add an active host at `address`, announced at height `first_seen`.
    fn add_host(hostdb: &HostDB, byte: u8, address: &str, first_seen: u64) {
        let net_address = NetAddress::new(address);
        let mut entry = HostDBEntry::new(key(byte), net_address.clone(), BlockHeight::new(first_seen));
        entry.record_scan(Ok(HostSettings {
            net_address,
            version: "1.5.0".into(),
            accepting_contracts: true,
            max_duration: 30_000,
            window_size: 144,
            collateral: Currency::new(200),
            max_collateral: Currency::coins(100),
            contract_price: Currency::coins(1),
            storage_price: Currency::new(100),
            upload_bandwidth_price: Currency::new(10),
            download_bandwidth_price: Currency::new(10),
            base_rpc_price: Currency::new(1),
            sector_access_price: Currency::new(1),
            remaining_storage: 1 << 40,
            total_storage: 1 << 40,
            sector_size: SECTOR_SIZE,
        }));
        hostdb.write_state().entries.insert(key(byte), entry);
    }

    fn keys(hosts: &[HostDBEntry]) -> HashSet<HostPublicKey> {
        hosts.iter().map(|entry| entry.public_key).collect()
    }

    #[test]
    fn avoided_hosts_are_never_returned() {
        let dir = tempfile::tempdir().unwrap();
        let hostdb = hostdb(&dir, true);
        for byte in 1..=5 {
            add_host(&hostdb, byte, &format!("10.0.{}.1:9982", byte), 0);
        }

        let avoid: HashSet<HostPublicKey> = [key(1), key(2)].into_iter().collect();
        for _ in 0..20 {
            let picked = hostdb.random_hosts(5, &avoid, &[]);
            assert_eq!(keys(&picked), [key(3), key(4), key(5)].into_iter().collect());
        }
    }

    #[test]
    fn fewer_hosts_are_returned_when_the_pool_runs_out() {
        let dir = tempfile::tempdir().unwrap();
        let hostdb = hostdb(&dir, true);
        for byte in 1..=3 {
            add_host(&hostdb, byte, &format!("10.0.{}.1:9982", byte), 0);
        }
        // Announced but never scanned, so not active.
        hostdb
            .write_state()
            .entries
            .insert(key(4), HostDBEntry::new(key(4), NetAddress::new("10.0.4.1:9982"), BlockHeight::new(0)));

        let picked = hostdb.random_hosts(10, &HashSet::new(), &[]);
        assert_eq!(picked.len(), 3);
        assert_eq!(keys(&picked), [key(1), key(2), key(3)].into_iter().collect());
        assert!(hostdb.random_hosts(0, &HashSet::new(), &[]).is_empty());
    }

    #[test]
    fn ip_filter_skips_hosts_sharing_a_subnet() {
        let dir = tempfile::tempdir().unwrap();
        let hostdb = hostdb(&dir, true);
        add_host(&hostdb, 1, "10.0.0.1:9982", 0);
        add_host(&hostdb, 2, "10.0.0.2:9982", 0);
        add_host(&hostdb, 3, "10.0.1.1:9982", 0);
        add_host(&hostdb, 4, "10.0.2.1:9982", 0);

        // 1. Hosts 1 and 2 share a /24, so only one of them is picked.
        for _ in 0..20 {
            let picked = keys(&hostdb.random_hosts(4, &HashSet::new(), &[]));
            assert_eq!(picked.len(), 3);
            assert!(picked.contains(&key(3)) && picked.contains(&key(4)));
            assert!(!(picked.contains(&key(1)) && picked.contains(&key(2))));
        }

        // 2. A host already in use takes its subnet out of the selection.
        let used = [key(1)];
        let avoid: HashSet<HostPublicKey> = used.iter().copied().collect();
        for _ in 0..20 {
            let picked = keys(&hostdb.random_hosts(4, &avoid, &used));
            assert_eq!(picked, [key(3), key(4)].into_iter().collect());
        }

        // 3. Without the filter every active host can be picked.
        hostdb.set_ip_filter(false);
        let picked = keys(&hostdb.random_hosts(4, &HashSet::new(), &used));
        assert_eq!(picked.len(), 4);
    }

    #[test]
    fn selection_is_weighted_by_score() {
        let dir = tempfile::tempdir().unwrap();
        let hostdb = hostdb(&dir, true);
        // Identical settings. The old host scores ten times the new one on age.
        add_host(&hostdb, 1, "10.0.1.1:9982", 0);
        add_host(&hostdb, 2, "10.0.2.1:9982", 19_995);
        let old = hostdb.host(&key(1)).unwrap().1.score();
        let new = hostdb.host(&key(2)).unwrap().1.score();
        assert!((old / new - 10.0).abs() < 1e-9);

        let rounds = 2000;
        let mut old_picked = 0;
        for _ in 0..rounds {
            let picked = hostdb.random_hosts(1, &HashSet::new(), &[]);
            assert_eq!(picked.len(), 1);
            if picked[0].public_key == key(1) {
                old_picked += 1;
            }
        }
        // Expected share is 10/11, about 1818 of 2000.
        assert!(old_picked > 1650, "old host picked {} of {} times", old_picked, rounds);
        assert!(old_picked < 1950, "old host picked {} of {} times", old_picked, rounds);
    }
}
