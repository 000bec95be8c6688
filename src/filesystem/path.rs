/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Paths inside the renter's file system.
//!
//! A [`SiaPath`] is a slash-separated path relative to the renter's root directory. `"/"`, `""`, and
//! `"."` all name the root. Every other path is a sequence of non-empty names that contain neither
//! `NUL` nor the special names `.` and `..`, and that does not start with a slash.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

use borsh::{BorshDeserialize, BorshSerialize};

/// Extension of file metadata on disk.
pub const SIAFILE_EXTENSION: &str = "sia";

/// Name of the metadata file inside every directory on disk.
pub const SIADIR_FILE_NAME: &str = ".siadir";

/// Directory that user uploads go to by default.
pub const HOME_FOLDER: &str = "home";

/// Directory that backups are uploaded to.
pub const SNAPSHOTS_FOLDER: &str = "snapshots";

/// Directory for renter-internal files, such as pubfiles.
pub const VAR_FOLDER: &str = "var";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path '{path}' starts with a slash")]
    LeadingSlash { path: String },

    #[error("path '{path}' contains an empty name")]
    EmptyName { path: String },

    #[error("path '{path}' contains the name '{name}'")]
    ReservedName { path: String, name: String },

    #[error("path '{path}' contains a NUL byte")]
    NulByte { path: String },

    #[error("the root directory has no parent")]
    RootHasNoParent,
}

/// A validated path inside the renter's file system.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BorshSerialize, BorshDeserialize)]
pub struct SiaPath(String);

impl SiaPath {
    /// Validate `path`. A single trailing slash is ignored.
    pub fn new(path: &str) -> Result<SiaPath, PathError> {
        if path.is_empty() || path == "/" || path == "." {
            return Ok(SiaPath::root());
        }
        if path.starts_with('/') {
            return Err(PathError::LeadingSlash { path: path.to_string() });
        }
        let trimmed = path.strip_suffix('/').unwrap_or(path);
        if trimmed.contains('\0') {
            return Err(PathError::NulByte { path: path.to_string() });
        }
        for name in trimmed.split('/') {
            if name.is_empty() {
                return Err(PathError::EmptyName { path: path.to_string() });
            }
            if name == "." || name == ".." {
                return Err(PathError::ReservedName {
                    path: path.to_string(),
                    name: name.to_string(),
                });
            }
        }
        Ok(SiaPath(trimmed.to_string()))
    }

    pub fn root() -> SiaPath {
        SiaPath(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `self` followed by `child`, which may itself contain several names.
    pub fn join(&self, child: &str) -> Result<SiaPath, PathError> {
        let child = SiaPath::new(child)?;
        if self.is_root() {
            return Ok(child);
        }
        if child.is_root() {
            return Ok(self.clone());
        }
        Ok(SiaPath(format!("{}/{}", self.0, child.0)))
    }

    /// The directory containing `self`.
    pub fn dir(&self) -> Result<SiaPath, PathError> {
        if self.is_root() {
            return Err(PathError::RootHasNoParent);
        }
        Ok(match self.0.rfind('/') {
            Some(i) => SiaPath(self.0[..i].to_string()),
            None => SiaPath::root(),
        })
    }

    /// The last name of `self`. Empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(i) => &self.0[i + 1..],
            None => &self.0,
        }
    }

    /// Whether `self` is `other` or lies below it.
    pub fn is_within(&self, other: &SiaPath) -> bool {
        other.is_root() || self == other || self.0.starts_with(&format!("{}/", other.0))
    }

    /// `self` with the prefix `from` replaced by `to`. Returns `None` if `self` is not within `from`.
    pub fn rebase(&self, from: &SiaPath, to: &SiaPath) -> Option<SiaPath> {
        if !self.is_within(from) {
            return None;
        }
        let rest = if from.is_root() {
            self.0.as_str()
        } else {
            self.0[from.0.len()..].trim_start_matches('/')
        };
        to.join(rest).ok()
    }

    /// `self` and every ancestor up to and including the root, deepest first.
    pub fn ancestors(&self) -> Vec<SiaPath> {
        let mut ancestors = vec![self.clone()];
        let mut current = self.clone();
        while let Ok(parent) = current.dir() {
            ancestors.push(parent.clone());
            current = parent;
        }
        ancestors
    }

    /// Where the metadata of a file at `self` lives below `root`.
    pub fn siafile_sys_path(&self, root: &Path) -> PathBuf {
        root.join(format!("{}.{}", self.0, SIAFILE_EXTENSION))
    }

    /// Where the directory `self` lives below `root`.
    pub fn dir_sys_path(&self, root: &Path) -> PathBuf {
        if self.is_root() {
            root.to_path_buf()
        } else {
            root.join(&self.0)
        }
    }

    /// The default location of user uploads.
    pub fn home() -> SiaPath {
        SiaPath(HOME_FOLDER.to_string())
    }

    /// The location of backups.
    pub fn snapshots() -> SiaPath {
        SiaPath(SNAPSHOTS_FOLDER.to_string())
    }

    /// The location of pubfiles.
    pub fn var() -> SiaPath {
        SiaPath(VAR_FOLDER.to_string())
    }
}

impl Display for SiaPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl fmt::Debug for SiaPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SiaPath({})", self)
    }
}

impl TryFrom<&str> for SiaPath {
    type Error = PathError;

    fn try_from(path: &str) -> Result<Self, Self::Error> {
        SiaPath::new(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_spellings() {
        for root in ["", "/", "."] {
            assert!(SiaPath::new(root).unwrap().is_root());
        }
        assert_eq!(SiaPath::root().to_string(), "/");
        assert_eq!(SiaPath::root().name(), "");
        assert_eq!(SiaPath::root().dir(), Err(PathError::RootHasNoParent));
    }

    #[test]
    fn invalid_paths_are_rejected() {
        assert!(matches!(SiaPath::new("/home"), Err(PathError::LeadingSlash { .. })));
        assert!(matches!(SiaPath::new("a//b"), Err(PathError::EmptyName { .. })));
        assert!(matches!(SiaPath::new("a/../b"), Err(PathError::ReservedName { .. })));
        assert!(matches!(SiaPath::new("a/./b"), Err(PathError::ReservedName { .. })));
        assert!(matches!(SiaPath::new("a\0b"), Err(PathError::NulByte { .. })));
        assert!(SiaPath::new("a..b/c.d").is_ok());
    }

    #[test]
    fn join_dir_and_name() {
        let home = SiaPath::home();
        let file = home.join("photos/cat.jpg").unwrap();
        assert_eq!(file.as_str(), "home/photos/cat.jpg");
        assert_eq!(file.name(), "cat.jpg");
        assert_eq!(file.dir().unwrap().as_str(), "home/photos");
        assert_eq!(SiaPath::root().join("a").unwrap().as_str(), "a");
        assert_eq!(home.join("").unwrap(), home);
        assert!(home.join("../etc").is_err());
        assert_eq!(SiaPath::new("a/b/").unwrap().as_str(), "a/b");
    }

    #[test]
    fn ancestors_end_at_root() {
        let path = SiaPath::new("a/b/c").unwrap();
        let ancestors: Vec<String> = path.ancestors().iter().map(|p| p.as_str().to_string()).collect();
        assert_eq!(ancestors, vec!["a/b/c", "a/b", "a", ""]);
    }

    #[test]
    fn rebase_moves_subtrees() {
        let from = SiaPath::new("a/b").unwrap();
        let to = SiaPath::new("x").unwrap();
        let path = SiaPath::new("a/b/c/d").unwrap();
        assert_eq!(path.rebase(&from, &to).unwrap().as_str(), "x/c/d");
        assert!(SiaPath::new("a/bc").unwrap().rebase(&from, &to).is_none());
        assert!(SiaPath::new("a/bc").unwrap().is_within(&SiaPath::new("a").unwrap()));
    }
}
