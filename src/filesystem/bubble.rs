/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Recomputing directory metadata from the leaves up.
//!
//! [`FileSystem::bubble`] recomputes the direct fields of a directory from its files, folds in the
//! aggregate fields of its subdirectories, and then repeats for every ancestor up to the root. Callers
//! that dirty many directories at once collect them in a [`UniqueRefreshPaths`] first, so that every
//! ancestor is bubbled once per deepest path instead of once per file.

use std::collections::BTreeSet;
use std::time::SystemTime;

use super::path::SiaPath;
use super::siadir::{min_redundancy, oldest_check, SiaDirMetadata, EMPTY_DIR_REDUNDANCY};
use super::siafile::HealthContext;
use super::{now_secs, FileSystem};
use crate::errors::RenterError;
use crate::events::{BubbleDirectoryEvent, Event};

impl FileSystem {
    /// Recompute the metadata of `path` and of every ancestor of it.
    pub fn bubble(&self, path: &SiaPath, ctx: &HealthContext) -> Result<(), RenterError> {
        for dir in path.ancestors() {
            self.bubble_one(&dir, ctx)?;
        }
        Ok(())
    }

    /// Recompute the metadata of `path` alone, trusting the aggregates stored in its subdirectories.
    pub fn bubble_one(&self, path: &SiaPath, ctx: &HealthContext) -> Result<SiaDirMetadata, RenterError> {
        let node = self.open_dir(path)?;
        let now = now_secs();
        let mut metadata = node.metadata();

        metadata.health = 1.0;
        metadata.last_health_check = 0;
        metadata.min_redundancy = EMPTY_DIR_REDUNDANCY;
        metadata.num_files = 0;
        metadata.num_stuck_chunks = 0;
        metadata.size = 0;
        let mut mod_time = 0;
        for file_path in self.child_files(path)? {
            let file = match self.open_file(&file_path) {
                Ok(file) => file,
                // Deleted between listing and opening.
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            let (health, size, modified) = file.read(|file| (file.health(ctx), file.size(), file.modified()));
            file.update(|file| {
                file.set_last_health_check(now);
                Ok(())
            })?;
            metadata.health = metadata.health.min(health.health);
            metadata.min_redundancy = min_redundancy(metadata.min_redundancy, health.redundancy);
            metadata.num_stuck_chunks += health.num_stuck_chunks;
            metadata.num_files += 1;
            metadata.size += size;
            metadata.last_health_check = oldest_check(metadata.last_health_check, now);
            mod_time = mod_time.max(modified);
        }
        if mod_time > 0 {
            metadata.mod_time = mod_time;
        }

        let children = self.child_dirs(path)?;
        metadata.num_subdirs = children.len() as u64;
        metadata.reset_aggregates();
        for child in children {
            match self.open_dir(&child) {
                Ok(child) => metadata.absorb_subdir(&child.metadata()),
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }
        node.set_metadata(metadata.clone())?;

        Event::publish(
            self.event_publisher(),
            Event::BubbleDirectory(BubbleDirectoryEvent {
                timestamp: SystemTime::now(),
                path: path.to_string(),
                aggregate_health: metadata.aggregate_health,
                aggregate_num_files: metadata.aggregate_num_files,
            }),
        );
        Ok(metadata)
    }

    /// Bubble every directory below and including `path`, deepest first, so that the result is exact.
    pub fn bubble_all(&self, path: &SiaPath, ctx: &HealthContext) -> Result<(), RenterError> {
        let mut dirs = self.walk_dirs(path)?;
        dirs.reverse();
        for dir in &dirs {
            self.bubble_one(dir, ctx)?;
        }
        // Ancestors of `path` summarize it too.
        if let Ok(parent) = path.dir() {
            self.bubble(&parent, ctx)?;
        }
        Ok(())
    }
}

/// A set of directories to bubble, reduced to the deepest ones: bubbling a directory also bubbles all of
/// its ancestors.
#[derive(Debug, Default)]
pub struct UniqueRefreshPaths {
    paths: BTreeSet<SiaPath>,
}

impl UniqueRefreshPaths {
    pub fn new() -> UniqueRefreshPaths {
        UniqueRefreshPaths::default()
    }

    /// Add `path` unless a directory below it is already in the set. Ancestors of `path` in the set are
    /// dropped.
    pub fn add(&mut self, path: SiaPath) {
        if self.paths.iter().any(|existing| existing.is_within(&path)) {
            return;
        }
        self.paths.retain(|existing| !path.is_within(existing));
        self.paths.insert(path);
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &SiaPath> {
        self.paths.iter()
    }

    /// Bubble every path in the set. Failures do not stop the others; they are returned together.
    pub fn refresh_all(&self, fs: &FileSystem, ctx: &HealthContext) -> Result<(), RenterError> {
        let errors = self
            .paths
            .iter()
            .map(|path| fs.bubble(path, ctx).err().map(|err| err.add_context(format!("bubbling {}", path))));
        match RenterError::compose(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::tests::{params, temp_fs};
    use crate::types::data_types::{HostPublicKey, SectorRoot};

    fn path(s: &str) -> SiaPath {
        SiaPath::new(s).unwrap()
    }

    #[test]
    fn refresh_paths_keep_only_the_deepest() {
        let mut paths = UniqueRefreshPaths::new();
        for p in ["a", "a/b", "a/b/c", "a/d", "e", "a/b/c", "e/f/g", "e/f", "h", ""] {
            paths.add(path(p));
        }
        let kept: Vec<&str> = paths.paths().map(|p| p.as_str()).collect();
        assert_eq!(kept, vec!["a/b/c", "a/d", "e/f/g", "h"]);
    }

    #[test]
    fn bubble_aggregates_up_to_the_root() {
        let (_dir, fs) = temp_fs();
        let host = HostPublicKey::new([1; 32]);
        let healthy = fs.new_file(&path("home/a/healthy"), params(10), false).unwrap();
        for piece in 0..3 {
            healthy.add_piece(host, 0, piece, SectorRoot::new([piece as u8; 32])).unwrap();
        }
        let missing = fs.new_file(&path("home/a/b/missing"), params(20), false).unwrap();
        missing.set_stuck(0, true).unwrap();

        let root = fs.dir_info(&SiaPath::root()).unwrap();
        assert_eq!(root.metadata.aggregate_num_files, 0);

        let ctx = HealthContext::new([host]);
        let mut paths = UniqueRefreshPaths::new();
        paths.add(path("home/a"));
        paths.add(path("home/a/b"));
        paths.refresh_all(&fs, &ctx).unwrap();

        let b = fs.dir_info(&path("home/a/b")).unwrap().metadata;
        assert_eq!(b.num_files, 1);
        assert_eq!(b.health, 0.0);
        assert_eq!(b.num_stuck_chunks, 1);

        let a = fs.dir_info(&path("home/a")).unwrap().metadata;
        assert_eq!(a.num_files, 1);
        assert_eq!(a.health, 1.0);
        assert_eq!(a.min_redundancy, 3.0);
        assert_eq!(a.aggregate_num_files, 2);
        assert_eq!(a.aggregate_size, 30);
        assert_eq!(a.aggregate_health, 0.0);
        assert_eq!(a.aggregate_min_redundancy, 0.0);
        assert_eq!(a.aggregate_num_subdirs, 1);

        let root = fs.dir_info(&SiaPath::root()).unwrap().metadata;
        assert_eq!(root.aggregate_num_files, 2);
        assert_eq!(root.aggregate_num_stuck_chunks, 1);
        // home, snapshots, var, home/a, home/a/b.
        assert_eq!(root.aggregate_num_subdirs, 5);
    }
}
