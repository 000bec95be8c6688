/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Metadata of one directory.
//!
//! The direct fields describe the files immediately inside the directory. The aggregate fields also
//! take every subdirectory into account; they are recomputed by [bubbling](super::bubble) and may lag
//! behind the files they summarize.

use borsh::{BorshDeserialize, BorshSerialize};

use super::path::SiaPath;
use crate::persist::versioned_file::Metadata;
use crate::types::crypto_primitives::new_specifier;

pub const SIADIR_METADATA: Metadata = Metadata::new(new_specifier("SiaDirectory"), new_specifier("v1.4.0"));

/// Minimum redundancy of a directory that holds no files.
pub const EMPTY_DIR_REDUNDANCY: f64 = -1.0;

pub const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct SiaDirMetadata {
    pub aggregate_health: f64,
    pub aggregate_last_health_check: u64,
    pub aggregate_min_redundancy: f64,
    pub aggregate_mod_time: u64,
    pub aggregate_num_files: u64,
    pub aggregate_num_stuck_chunks: u64,
    pub aggregate_num_subdirs: u64,
    pub aggregate_size: u64,

    pub health: f64,
    pub last_health_check: u64,
    pub min_redundancy: f64,
    pub mod_time: u64,
    pub num_files: u64,
    pub num_stuck_chunks: u64,
    pub num_subdirs: u64,
    pub size: u64,

    pub mode: u32,
}

impl SiaDirMetadata {
    pub fn new(mode: u32, now: u64) -> SiaDirMetadata {
        SiaDirMetadata {
            aggregate_health: 1.0,
            aggregate_last_health_check: 0,
            aggregate_min_redundancy: EMPTY_DIR_REDUNDANCY,
            aggregate_mod_time: now,
            aggregate_num_files: 0,
            aggregate_num_stuck_chunks: 0,
            aggregate_num_subdirs: 0,
            aggregate_size: 0,
            health: 1.0,
            last_health_check: 0,
            min_redundancy: EMPTY_DIR_REDUNDANCY,
            mod_time: now,
            num_files: 0,
            num_stuck_chunks: 0,
            num_subdirs: 0,
            size: 0,
            mode,
        }
    }

    /// Fold the aggregate fields of a subdirectory into the aggregate fields of `self`.
    pub(crate) fn absorb_subdir(&mut self, child: &SiaDirMetadata) {
        self.aggregate_health = self.aggregate_health.min(child.aggregate_health);
        self.aggregate_last_health_check = oldest_check(self.aggregate_last_health_check, child.aggregate_last_health_check);
        self.aggregate_min_redundancy = min_redundancy(self.aggregate_min_redundancy, child.aggregate_min_redundancy);
        self.aggregate_mod_time = self.aggregate_mod_time.max(child.aggregate_mod_time);
        self.aggregate_num_files += child.aggregate_num_files;
        self.aggregate_num_stuck_chunks += child.aggregate_num_stuck_chunks;
        self.aggregate_num_subdirs += child.aggregate_num_subdirs;
        self.aggregate_size += child.aggregate_size;
    }

    /// Copy the direct fields into the aggregate fields, as the starting point of a bubble.
    pub(crate) fn reset_aggregates(&mut self) {
        self.aggregate_health = self.health;
        self.aggregate_last_health_check = self.last_health_check;
        self.aggregate_min_redundancy = self.min_redundancy;
        self.aggregate_mod_time = self.mod_time;
        self.aggregate_num_files = self.num_files;
        self.aggregate_num_stuck_chunks = self.num_stuck_chunks;
        self.aggregate_num_subdirs = self.num_subdirs;
        self.aggregate_size = self.size;
    }
}

/// The minimum of two redundancies, where a negative value stands for "no files".
pub(crate) fn min_redundancy(a: f64, b: f64) -> f64 {
    match (a < 0.0, b < 0.0) {
        (true, _) => b,
        (_, true) => a,
        _ => a.min(b),
    }
}

/// The older of two health check times, where `0` stands for "never checked".
pub(crate) fn oldest_check(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}

/// A directory as reported to callers.
#[derive(Clone, Debug, PartialEq)]
pub struct DirInfo {
    pub path: SiaPath,
    pub metadata: SiaDirMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorbing_children_sums_and_takes_worst() {
        let mut parent = SiaDirMetadata::new(DEFAULT_DIR_MODE, 10);
        parent.num_files = 1;
        parent.size = 100;
        parent.health = 0.8;
        parent.min_redundancy = 2.0;
        parent.num_subdirs = 1;
        parent.reset_aggregates();

        let mut child = SiaDirMetadata::new(DEFAULT_DIR_MODE, 20);
        child.num_files = 2;
        child.size = 50;
        child.health = 0.3;
        child.min_redundancy = 1.5;
        child.num_stuck_chunks = 4;
        child.reset_aggregates();

        parent.absorb_subdir(&child);
        assert_eq!(parent.aggregate_num_files, 3);
        assert_eq!(parent.aggregate_size, 150);
        assert_eq!(parent.aggregate_health, 0.3);
        assert_eq!(parent.aggregate_min_redundancy, 1.5);
        assert_eq!(parent.aggregate_num_stuck_chunks, 4);
        assert_eq!(parent.aggregate_num_subdirs, 1);
        assert_eq!(parent.aggregate_mod_time, 20);
    }

    #[test]
    fn empty_directories_do_not_lower_redundancy() {
        assert_eq!(min_redundancy(EMPTY_DIR_REDUNDANCY, 2.0), 2.0);
        assert_eq!(min_redundancy(3.0, EMPTY_DIR_REDUNDANCY), 3.0);
        assert_eq!(min_redundancy(EMPTY_DIR_REDUNDANCY, EMPTY_DIR_REDUNDANCY), EMPTY_DIR_REDUNDANCY);
        assert_eq!(oldest_check(0, 5), 5);
        assert_eq!(oldest_check(7, 5), 5);
    }
}
