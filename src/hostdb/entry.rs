/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! What the host database remembers about one host.

use std::time::{SystemTime, UNIX_EPOCH};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::host_protocol::messages::HostSettings;
use crate::types::data_types::{BlockHeight, HostPublicKey, NetAddress};

/// Number of most recent scans kept per host.
pub const SCAN_HISTORY_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ScanRecord {
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub success: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HostDBEntry {
    pub public_key: HostPublicKey,
    pub net_address: NetAddress,
    /// Height of the block that carried the host's first announcement.
    pub first_seen: BlockHeight,
    /// Settings reported by the last successful scan.
    pub settings: Option<HostSettings>,
    pub scan_history: Vec<ScanRecord>,
    pub historic_successes: u64,
    pub historic_failures: u64,
    pub last_scan_error: Option<String>,
}

impl HostDBEntry {
    pub fn new(public_key: HostPublicKey, net_address: NetAddress, first_seen: BlockHeight) -> HostDBEntry {
        HostDBEntry {
            public_key,
            net_address,
            first_seen,
            settings: None,
            scan_history: Vec::new(),
            historic_successes: 0,
            historic_failures: 0,
            last_scan_error: None,
        }
    }

    /// Record the outcome of a scan.
    pub fn record_scan(&mut self, result: Result<HostSettings, String>) {
        let success = result.is_ok();
        match result {
            Ok(settings) => {
                self.settings = Some(settings);
                self.historic_successes += 1;
                self.last_scan_error = None;
            }
            Err(err) => {
                self.historic_failures += 1;
                self.last_scan_error = Some(err);
            }
        }
        self.scan_history.push(ScanRecord {
            timestamp: now_secs(),
            success,
        });
        if self.scan_history.len() > SCAN_HISTORY_LEN {
            let excess = self.scan_history.len() - SCAN_HISTORY_LEN;
            self.scan_history.drain(..excess);
        }
    }

    /// Seconds since the Unix epoch of the last scan, if any.
    pub fn last_scan(&self) -> Option<u64> {
        self.scan_history.last().map(|scan| scan.timestamp)
    }

    /// Whether the last scan reached the host.
    pub fn is_online(&self) -> bool {
        self.scan_history.last().map_or(false, |scan| scan.success)
    }

    /// Whether the host can be offered new contracts.
    pub fn is_active(&self) -> bool {
        self.is_online()
            && self
                .settings
                .as_ref()
                .map_or(false, |settings| settings.accepting_contracts)
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
