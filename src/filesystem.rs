/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The renter's file system: a tree of directories and erasure-coded files addressed by [`SiaPath`].
//!
//! ## On-disk layout
//!
//! File metadata lives at `<persist_dir>/siafiles/<path>.sia` and directory metadata at
//! `<persist_dir>/siadirs/<path>/.siadir`. Both are [versioned files](crate::persist::versioned_file)
//! written through the WAL, so a crash never leaves a torn metadata file behind.
//!
//! ## Nodes and handles
//!
//! Open files and directories are kept in an arena keyed by path. Opening a path that is already open
//! returns a new handle to the same node, so every thread sees the same metadata. A node lives as long
//! as any of its handles; each handle registers a random UID with its node when it is created and
//! removes it when dropped, so leaked handles can be found with [`FileNode::open_handles`].
//!
//! Deleting a path removes its metadata from disk at once and detaches the node from the arena. Handles
//! that are still open keep working on the in-memory metadata, but nothing they do is persisted, and
//! the path can be reused immediately.
//!
//! The root directory holds three standard directories: `home` for user uploads, `snapshots` for
//! backups, and `var` for renter-internal files such as pubfiles.

pub mod bubble;

pub mod path;

pub mod siadir;

pub mod siafile;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::SystemTime;

use borsh::BorshSerialize;

use self::path::{SiaPath, SIADIR_FILE_NAME, SIAFILE_EXTENSION};
use self::siadir::{DirInfo, SiaDirMetadata, DEFAULT_DIR_MODE, SIADIR_METADATA};
use self::siafile::{FileParams, HealthContext, SiaFile, SIAFILE_METADATA};
use crate::erasure::ErasureCode;
use crate::errors::{NotFoundKind, RenterError, ResultExt};
use crate::events::EventPublisher;
use crate::logging::secs_since_unix_epoch;
use crate::persist::versioned_file::{self, Metadata};
use crate::persist::wal::{create_and_apply_transaction, Update, Wal};
use crate::persist::{create_dir_all, remove_file_if_exists};
use crate::types::data_types::{HostPublicKey, SectorRoot};

pub(crate) fn now_secs() -> u64 {
    secs_since_unix_epoch(SystemTime::now())
}

/// Apply replace-file and delete-file updates.
pub(crate) fn apply_file_updates(updates: &[Update]) -> Result<(), RenterError> {
    for update in updates {
        versioned_file::apply_update(update)?;
    }
    Ok(())
}

fn persist<T: BorshSerialize>(wal: &Arc<Wal>, metadata: &Metadata, object: &T, path: &Path) -> Result<(), RenterError> {
    let update = versioned_file::save_update(metadata, object, path)?;
    create_and_apply_transaction(wal, vec![update], apply_file_updates)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Where a node lives, in the file system and on disk.
struct Location {
    path: SiaPath,
    sys_path: PathBuf,
}

struct Node<T> {
    location: RwLock<Location>,
    data: Mutex<T>,
    deleted: AtomicBool,
    threads: Mutex<HashMap<u64, SystemTime>>,
    wal: Arc<Wal>,
}

impl<T: BorshSerialize + Clone> Node<T> {
    fn new(path: SiaPath, sys_path: PathBuf, data: T, wal: Arc<Wal>) -> Arc<Node<T>> {
        Arc::new(Node {
            location: RwLock::new(Location { path, sys_path }),
            data: Mutex::new(data),
            deleted: AtomicBool::new(false),
            threads: Mutex::new(HashMap::new()),
            wal,
        })
    }

    fn path(&self) -> SiaPath {
        self.location
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .path
            .clone()
    }

    /// Apply `f` to a copy of the data, persist the copy, and only then make it visible.
    fn update<R>(&self, metadata: &Metadata, f: impl FnOnce(&mut T) -> Result<R, RenterError>) -> Result<R, RenterError> {
        let mut data = lock(&self.data);
        let mut updated = data.clone();
        let result = f(&mut updated)?;
        if !self.deleted.load(Ordering::SeqCst) {
            let location = self.location.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            persist(&self.wal, metadata, &updated, &location.sys_path)?;
        }
        *data = updated;
        Ok(result)
    }
}

/// A handle that registers itself with its node for as long as it lives.
struct Handle<T> {
    node: Arc<Node<T>>,
    uid: u64,
}

impl<T> Handle<T> {
    fn new(node: Arc<Node<T>>) -> Handle<T> {
        let uid = rand::random::<u64>();
        lock(&node.threads).insert(uid, SystemTime::now());
        Handle { node, uid }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle::new(self.node.clone())
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        lock(&self.node.threads).remove(&self.uid);
    }
}

/// An open file.
#[derive(Clone)]
pub struct FileNode(Handle<SiaFile>);

impl std::fmt::Debug for FileNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileNode")
            .field("path", &self.path())
            .field("uid", &self.uid())
            .finish_non_exhaustive()
    }
}

impl FileNode {
    pub fn path(&self) -> SiaPath {
        self.0.node.path()
    }

    /// The UID this handle registered with its node.
    pub fn uid(&self) -> u64 {
        self.0.uid
    }

    /// Number of handles open on this file.
    pub fn open_handles(&self) -> usize {
        lock(&self.0.node.threads).len()
    }

    pub fn is_deleted(&self) -> bool {
        self.0.node.deleted.load(Ordering::SeqCst)
    }

    /// Whether `self` and `other` are handles to the same node.
    pub fn same_node(&self, other: &FileNode) -> bool {
        Arc::ptr_eq(&self.0.node, &other.0.node)
    }

    /// A copy of the file's metadata.
    pub fn metadata(&self) -> SiaFile {
        lock(&self.0.node.data).clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&SiaFile) -> R) -> R {
        f(&lock(&self.0.node.data))
    }

    /// Change the file's metadata with `f` and persist the change. If `f` or persisting fails, the
    /// metadata is left as it was.
    pub fn update<R>(&self, f: impl FnOnce(&mut SiaFile) -> Result<R, RenterError>) -> Result<R, RenterError> {
        self.0.node.update(&SIAFILE_METADATA, f)
    }

    pub fn add_piece(
        &self,
        host: HostPublicKey,
        chunk_index: u64,
        piece_index: u64,
        root: SectorRoot,
    ) -> Result<(), RenterError> {
        self.update(|file| file.add_piece(host, chunk_index, piece_index, root, now_secs()))
    }

    pub fn set_stuck(&self, chunk_index: u64, stuck: bool) -> Result<(), RenterError> {
        if self.read(|file| file.stuck(chunk_index))? == stuck {
            return Ok(());
        }
        self.update(|file| file.set_stuck(chunk_index, stuck))
    }

    pub fn add_publink(&self, publink: String) -> Result<(), RenterError> {
        self.update(|file| {
            file.add_publink(publink);
            Ok(())
        })
    }
}

/// An open directory.
#[derive(Clone)]
pub struct DirNode(Handle<SiaDirMetadata>);

impl DirNode {
    pub fn path(&self) -> SiaPath {
        self.0.node.path()
    }

    pub fn open_handles(&self) -> usize {
        lock(&self.0.node.threads).len()
    }

    pub fn is_deleted(&self) -> bool {
        self.0.node.deleted.load(Ordering::SeqCst)
    }

    pub fn same_node(&self, other: &DirNode) -> bool {
        Arc::ptr_eq(&self.0.node, &other.0.node)
    }

    pub fn metadata(&self) -> SiaDirMetadata {
        lock(&self.0.node.data).clone()
    }

    /// Replace the directory's metadata and persist it.
    pub fn set_metadata(&self, metadata: SiaDirMetadata) -> Result<(), RenterError> {
        self.0.node.update(&SIADIR_METADATA, |current| {
            *current = metadata;
            Ok(())
        })
    }
}

/// A file as reported to callers.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    pub path: SiaPath,
    pub local_path: String,
    pub on_disk: bool,
    pub size: u64,
    pub mode: u32,
    pub erasure_code: ErasureCode,
    pub num_chunks: u64,
    pub health: f64,
    pub redundancy: f64,
    pub recoverable: bool,
    pub num_stuck_chunks: u64,
    pub stuck: bool,
    pub uploaded_bytes: u64,
    pub upload_progress: f64,
    pub created: u64,
    pub modified: u64,
    pub accessed: u64,
    pub publinks: Vec<String>,
}

impl FileInfo {
    fn new(path: SiaPath, file: &SiaFile, ctx: &HealthContext) -> FileInfo {
        let health = file.health(ctx);
        FileInfo {
            path,
            local_path: file.local_path().to_string(),
            on_disk: !file.local_path().is_empty() && Path::new(file.local_path()).exists(),
            size: file.size(),
            mode: file.mode(),
            erasure_code: file.erasure_code(),
            num_chunks: file.num_chunks(),
            health: health.health,
            redundancy: health.redundancy,
            recoverable: health.redundancy >= 1.0,
            num_stuck_chunks: health.num_stuck_chunks,
            stuck: health.num_stuck_chunks > 0,
            uploaded_bytes: file.uploaded_bytes(),
            upload_progress: file.upload_progress(),
            created: file.created(),
            modified: file.modified(),
            accessed: file.accessed(),
            publinks: file.publinks().to_vec(),
        }
    }
}

pub struct FileSystem {
    files_root: PathBuf,
    dirs_root: PathBuf,
    wal: Arc<Wal>,
    files: Mutex<HashMap<SiaPath, Weak<Node<SiaFile>>>>,
    dirs: Mutex<HashMap<SiaPath, Weak<Node<SiaDirMetadata>>>>,
    event_publisher: EventPublisher,
}

impl FileSystem {
    /// Open the file system below `persist_dir`, creating the root and the standard directories if they
    /// do not exist yet.
    pub fn new(persist_dir: &Path, wal: Arc<Wal>, event_publisher: EventPublisher) -> Result<Arc<FileSystem>, RenterError> {
        let fs = FileSystem {
            files_root: persist_dir.join("siafiles"),
            dirs_root: persist_dir.join("siadirs"),
            wal,
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            event_publisher,
        };
        create_dir_all(&fs.files_root).context("creating the siafiles directory")?;
        create_dir_all(&fs.dirs_root).context("creating the siadirs directory")?;
        for standard in [SiaPath::root(), SiaPath::home(), SiaPath::snapshots(), SiaPath::var()] {
            fs.ensure_dir(&standard)?;
        }
        Ok(Arc::new(fs))
    }

    pub fn files_root(&self) -> &Path {
        &self.files_root
    }

    pub fn dirs_root(&self) -> &Path {
        &self.dirs_root
    }

    pub(crate) fn event_publisher(&self) -> &EventPublisher {
        &self.event_publisher
    }

    fn file_sys_path(&self, path: &SiaPath) -> PathBuf {
        path.siafile_sys_path(&self.files_root)
    }

    fn dir_sys_path(&self, path: &SiaPath) -> PathBuf {
        path.dir_sys_path(&self.dirs_root).join(SIADIR_FILE_NAME)
    }

    pub fn file_exists(&self, path: &SiaPath) -> bool {
        !path.is_root() && self.file_sys_path(path).is_file()
    }

    pub fn dir_exists(&self, path: &SiaPath) -> bool {
        self.dir_sys_path(path).is_file()
    }

    /// Create `path` and every missing ancestor. Existing directories are left alone.
    fn ensure_dir(&self, path: &SiaPath) -> Result<(), RenterError> {
        for dir in path.ancestors().into_iter().rev() {
            if self.dir_exists(&dir) {
                continue;
            }
            if self.file_exists(&dir) {
                return Err(RenterError::Exists(format!("file {}", dir)));
            }
            create_dir_all(&dir.dir_sys_path(&self.files_root)).context(format!("creating {}", dir))?;
            let metadata = SiaDirMetadata::new(DEFAULT_DIR_MODE, now_secs());
            persist(&self.wal, &SIADIR_METADATA, &metadata, &self.dir_sys_path(&dir))?;
        }
        Ok(())
    }

    /// Create the directory `path` and its missing ancestors.
    pub fn new_dir(&self, path: &SiaPath, mode: u32) -> Result<(), RenterError> {
        if self.dir_exists(path) || self.file_exists(path) {
            return Err(RenterError::Exists(path.to_string()));
        }
        if let Ok(parent) = path.dir() {
            self.ensure_dir(&parent)?;
        }
        create_dir_all(&path.dir_sys_path(&self.files_root)).context(format!("creating {}", path))?;
        persist(
            &self.wal,
            &SIADIR_METADATA,
            &SiaDirMetadata::new(mode, now_secs()),
            &self.dir_sys_path(path),
        )
    }

    /// Delete the directory `path` with everything in it.
    pub fn delete_dir(&self, path: &SiaPath) -> Result<(), RenterError> {
        if path.is_root() {
            return Err(RenterError::InvalidArgument("the root directory cannot be deleted".into()));
        }
        if !self.dir_exists(path) {
            return Err(RenterError::NotFound(NotFoundKind::Directory(path.to_string())));
        }
        {
            let mut files = lock(&self.files);
            detach_within(&mut files, path);
            let mut dirs = lock(&self.dirs);
            detach_within(&mut dirs, path);
        }
        for root in [&self.dirs_root, &self.files_root] {
            match fs::remove_dir_all(path.dir_sys_path(root)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(RenterError::from(err).add_context(format!("deleting {}", path))),
            }
        }
        Ok(())
    }

    /// Create a file at `path`. An existing file is replaced only if `force` is set.
    pub fn new_file(&self, path: &SiaPath, params: FileParams, force: bool) -> Result<FileNode, RenterError> {
        if path.is_root() {
            return Err(RenterError::InvalidArgument("a file cannot be created at the root".into()));
        }
        if self.dir_exists(path) {
            return Err(RenterError::Exists(format!("directory {}", path)));
        }
        if self.file_exists(path) {
            if !force {
                return Err(RenterError::Exists(path.to_string()));
            }
            self.delete_file(path)?;
        }
        self.ensure_dir(&path.dir()?)?;
        self.insert_file(path, SiaFile::new(params, now_secs())?)
    }

    /// Create a file at `path` from existing metadata, as when restoring a backup. Existing files are
    /// never replaced.
    pub fn import_file(&self, path: &SiaPath, file: SiaFile) -> Result<FileNode, RenterError> {
        if path.is_root() || self.dir_exists(path) || self.file_exists(path) {
            return Err(RenterError::Exists(path.to_string()));
        }
        self.ensure_dir(&path.dir()?)?;
        self.insert_file(path, file)
    }

    fn insert_file(&self, path: &SiaPath, file: SiaFile) -> Result<FileNode, RenterError> {
        let sys_path = self.file_sys_path(path);
        persist(&self.wal, &SIAFILE_METADATA, &file, &sys_path)?;

        let node = Node::new(path.clone(), sys_path, file, self.wal.clone());
        let mut files = lock(&self.files);
        files.retain(|_, node| node.strong_count() > 0);
        files.insert(path.clone(), Arc::downgrade(&node));
        Ok(FileNode(Handle::new(node)))
    }

    /// Delete the file at `path`. Open handles to it stay usable but are no longer persisted.
    pub fn delete_file(&self, path: &SiaPath) -> Result<(), RenterError> {
        if !self.file_exists(path) {
            return Err(RenterError::NotFound(NotFoundKind::File(path.to_string())));
        }
        let sys_path = self.file_sys_path(path);
        let mut files = lock(&self.files);
        if let Some(node) = files.remove(path).and_then(|node| node.upgrade()) {
            // Holding the data lock keeps a concurrent update from persisting after the delete.
            let _data = lock(&node.data);
            node.deleted.store(true, Ordering::SeqCst);
            create_and_apply_transaction(&self.wal, vec![versioned_file::delete_file_update(&sys_path)], apply_file_updates)?;
            return Ok(());
        }
        create_and_apply_transaction(&self.wal, vec![versioned_file::delete_file_update(&sys_path)], apply_file_updates)
    }

    /// Open the file at `path`, sharing the node with every other open handle.
    pub fn open_file(&self, path: &SiaPath) -> Result<FileNode, RenterError> {
        let mut files = lock(&self.files);
        if let Some(node) = files.get(path).and_then(Weak::upgrade) {
            return Ok(FileNode(Handle::new(node)));
        }
        let sys_path = self.file_sys_path(path);
        if path.is_root() || !sys_path.is_file() {
            return Err(RenterError::NotFound(NotFoundKind::File(path.to_string())));
        }
        let file: SiaFile = versioned_file::load(&SIAFILE_METADATA, &sys_path)?;
        let node = Node::new(path.clone(), sys_path, file, self.wal.clone());
        files.retain(|_, node| node.strong_count() > 0);
        files.insert(path.clone(), Arc::downgrade(&node));
        Ok(FileNode(Handle::new(node)))
    }

    /// Open the directory at `path`, sharing the node with every other open handle.
    pub fn open_dir(&self, path: &SiaPath) -> Result<DirNode, RenterError> {
        let mut dirs = lock(&self.dirs);
        if let Some(node) = dirs.get(path).and_then(Weak::upgrade) {
            return Ok(DirNode(Handle::new(node)));
        }
        let sys_path = self.dir_sys_path(path);
        if !sys_path.is_file() {
            return Err(RenterError::NotFound(NotFoundKind::Directory(path.to_string())));
        }
        let metadata: SiaDirMetadata = versioned_file::load(&SIADIR_METADATA, &sys_path)?;
        let node = Node::new(path.clone(), sys_path, metadata, self.wal.clone());
        dirs.retain(|_, node| node.strong_count() > 0);
        dirs.insert(path.clone(), Arc::downgrade(&node));
        Ok(DirNode(Handle::new(node)))
    }

    /// Move the file at `from` to `to`, creating missing directories on the way.
    pub fn rename_file(&self, from: &SiaPath, to: &SiaPath) -> Result<(), RenterError> {
        if !self.file_exists(from) {
            return Err(RenterError::NotFound(NotFoundKind::File(from.to_string())));
        }
        if to.is_root() || self.file_exists(to) || self.dir_exists(to) {
            return Err(RenterError::Exists(to.to_string()));
        }
        self.ensure_dir(&to.dir()?)?;
        let old_sys_path = self.file_sys_path(from);
        let new_sys_path = self.file_sys_path(to);

        let mut files = lock(&self.files);
        match files.remove(from).and_then(|node| node.upgrade()) {
            Some(node) => {
                let _data = lock(&node.data);
                let mut location = node.location.write().unwrap_or_else(|poisoned| poisoned.into_inner());
                fs::rename(&old_sys_path, &new_sys_path).context(format!("renaming {} to {}", from, to))?;
                location.path = to.clone();
                location.sys_path = new_sys_path;
                files.insert(to.clone(), Arc::downgrade(&node));
            }
            None => {
                fs::rename(&old_sys_path, &new_sys_path).context(format!("renaming {} to {}", from, to))?;
            }
        }
        Ok(())
    }

    pub fn file_info(&self, path: &SiaPath, ctx: &HealthContext) -> Result<FileInfo, RenterError> {
        let node = self.open_file(path)?;
        Ok(node.read(|file| FileInfo::new(path.clone(), file, ctx)))
    }

    pub fn dir_info(&self, path: &SiaPath) -> Result<DirInfo, RenterError> {
        let node = self.open_dir(path)?;
        Ok(DirInfo {
            path: path.clone(),
            metadata: node.metadata(),
        })
    }

    /// The directory `path` followed by its immediate subdirectories, and the files immediately in it.
    pub fn dir_list(&self, path: &SiaPath, ctx: &HealthContext) -> Result<(Vec<DirInfo>, Vec<FileInfo>), RenterError> {
        let mut dirs = vec![self.dir_info(path)?];
        for child in self.child_dirs(path)? {
            dirs.push(self.dir_info(&child)?);
        }
        let mut files = Vec::new();
        for child in self.child_files(path)? {
            files.push(self.file_info(&child, ctx)?);
        }
        Ok((dirs, files))
    }

    /// Every file below `path`, or only those immediately in it if `recursive` is not set.
    pub fn file_list(&self, path: &SiaPath, recursive: bool, ctx: &HealthContext) -> Result<Vec<FileInfo>, RenterError> {
        let paths = if recursive {
            self.walk_files(path)?
        } else {
            self.child_files(path)?
        };
        paths.iter().map(|file| self.file_info(file, ctx)).collect()
    }

    /// Immediate subdirectories of `path`, sorted.
    pub fn child_dirs(&self, path: &SiaPath) -> Result<Vec<SiaPath>, RenterError> {
        if !self.dir_exists(path) {
            return Err(RenterError::NotFound(NotFoundKind::Directory(path.to_string())));
        }
        let mut children = Vec::new();
        for entry in fs::read_dir(path.dir_sys_path(&self.dirs_root)).context(format!("listing {}", path))? {
            let entry = entry.context(format!("listing {}", path))?;
            if !entry.file_type().context(format!("listing {}", path))?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                children.push(path.join(name)?);
            }
        }
        children.sort();
        Ok(children)
    }

    /// Files immediately in `path`, sorted.
    pub fn child_files(&self, path: &SiaPath) -> Result<Vec<SiaPath>, RenterError> {
        if !self.dir_exists(path) {
            return Err(RenterError::NotFound(NotFoundKind::Directory(path.to_string())));
        }
        let dir = path.dir_sys_path(&self.files_root);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(RenterError::from(err).add_context(format!("listing {}", path))),
        };
        let suffix = format!(".{}", SIAFILE_EXTENSION);
        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.context(format!("listing {}", path))?;
            if !entry.file_type().context(format!("listing {}", path))?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str().and_then(|name| name.strip_suffix(&suffix)) {
                children.push(path.join(name)?);
            }
        }
        children.sort();
        Ok(children)
    }

    /// Every directory below `path`, including `path` itself, parents before children.
    pub fn walk_dirs(&self, path: &SiaPath) -> Result<Vec<SiaPath>, RenterError> {
        let mut dirs = vec![path.clone()];
        let mut i = 0;
        while i < dirs.len() {
            let children = self.child_dirs(&dirs[i])?;
            dirs.extend(children);
            i += 1;
        }
        Ok(dirs)
    }

    /// Every file below `path`.
    pub fn walk_files(&self, path: &SiaPath) -> Result<Vec<SiaPath>, RenterError> {
        let mut files = Vec::new();
        for dir in self.walk_dirs(path)? {
            files.extend(self.child_files(&dir)?);
        }
        Ok(files)
    }

    /// Remove the metadata of a file without going through the arena. Used for files that never
    /// finished being created.
    pub(crate) fn remove_file_metadata(&self, path: &SiaPath) -> Result<(), RenterError> {
        remove_file_if_exists(&self.file_sys_path(path)).context(format!("removing {}", path))
    }
}

/// Mark every live node at or below `path` deleted and drop it from `map`.
fn detach_within<T>(map: &mut HashMap<SiaPath, Weak<Node<T>>>, path: &SiaPath) {
    map.retain(|node_path, node| {
        if !node_path.is_within(path) {
            return true;
        }
        if let Some(node) = node.upgrade() {
            node.deleted.store(true, Ordering::SeqCst);
        }
        false
    });
}

#[cfg(test)]
mod tests {
    use super::siafile::CipherType;
    use super::*;

    pub(crate) fn temp_fs() -> (tempfile::TempDir, Arc<FileSystem>) {
        let dir = tempfile::tempdir().unwrap();
        let (wal, _) = Wal::open(&dir.path().join("renter.wal")).unwrap();
        let fs = FileSystem::new(dir.path(), wal, None).unwrap();
        (dir, fs)
    }

    pub(crate) fn params(size: u64) -> FileParams {
        FileParams {
            source: String::new(),
            erasure_code: ErasureCode::new(1, 2).unwrap(),
            cipher_type: CipherType::Plaintext,
            piece_size: 64,
            size,
            mode: 0o644,
            disable_partial_upload: false,
        }
    }

    #[test]
    fn standard_dirs_exist() {
        let (_dir, fs) = temp_fs();
        let root = fs.child_dirs(&SiaPath::root()).unwrap();
        assert_eq!(root, vec![SiaPath::home(), SiaPath::snapshots(), SiaPath::var()]);
    }

    #[test]
    fn repeat_opens_share_a_node() {
        let (_dir, fs) = temp_fs();
        let path = SiaPath::new("home/a/file").unwrap();
        let created = fs.new_file(&path, params(100), false).unwrap();
        let opened = fs.open_file(&path).unwrap();
        assert!(created.same_node(&opened));
        assert_eq!(opened.open_handles(), 2);

        opened.add_piece(HostPublicKey::new([1; 32]), 0, 0, SectorRoot::new([9; 32])).unwrap();
        assert_eq!(created.read(|file| file.pieces(0).unwrap()[0].len()), 1);
        drop(opened);
        assert_eq!(created.open_handles(), 1);
        drop(created);

        // Closed and reopened from disk.
        let reopened = fs.open_file(&path).unwrap();
        assert_eq!(reopened.read(|file| file.pieces(0).unwrap()[0].len()), 1);
        assert!(fs.dir_exists(&SiaPath::new("home/a").unwrap()));
    }

    #[test]
    fn existing_files_need_force() {
        let (_dir, fs) = temp_fs();
        let path = SiaPath::new("home/file").unwrap();
        fs.new_file(&path, params(100), false).unwrap();
        assert!(fs.new_file(&path, params(100), false).unwrap_err().is_exists());
        fs.new_file(&path, params(300), true).unwrap();
        assert_eq!(fs.open_file(&path).unwrap().read(|file| file.size()), 300);
    }

    #[test]
    fn deleted_files_detach_open_handles() {
        let (_dir, fs) = temp_fs();
        let path = SiaPath::new("home/file").unwrap();
        let node = fs.new_file(&path, params(100), false).unwrap();
        fs.delete_file(&path).unwrap();
        assert!(node.is_deleted());
        assert!(fs.open_file(&path).unwrap_err().is_not_found());
        // Updates on a deleted node succeed in memory but do not recreate the file.
        node.set_stuck(0, true).unwrap();
        assert!(!fs.file_exists(&path));

        let replacement = fs.new_file(&path, params(100), false).unwrap();
        assert!(!replacement.same_node(&node));
        assert!(fs.delete_file(&SiaPath::new("home/missing").unwrap()).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_dir_removes_everything_below() {
        let (_dir, fs) = temp_fs();
        let file = SiaPath::new("home/a/b/file").unwrap();
        let node = fs.new_file(&file, params(10), false).unwrap();
        fs.delete_dir(&SiaPath::new("home/a").unwrap()).unwrap();
        assert!(node.is_deleted());
        assert!(!fs.file_exists(&file));
        assert!(!fs.dir_exists(&SiaPath::new("home/a/b").unwrap()));
        assert!(fs.dir_exists(&SiaPath::home()));
        assert!(fs.delete_dir(&SiaPath::root()).is_err());
    }

    #[test]
    fn rename_moves_open_nodes() {
        let (_dir, fs) = temp_fs();
        let from = SiaPath::new("home/old").unwrap();
        let to = SiaPath::new("home/new/name").unwrap();
        let node = fs.new_file(&from, params(10), false).unwrap();
        fs.rename_file(&from, &to).unwrap();
        assert_eq!(node.path(), to);
        assert!(!fs.file_exists(&from));
        assert!(fs.open_file(&to).unwrap().same_node(&node));
        node.set_stuck(0, true).unwrap();
        drop(node);
        assert!(fs.open_file(&to).unwrap().read(|file| file.stuck(0).unwrap()));
    }

    #[test]
    fn listing_and_walking() {
        let (_dir, fs) = temp_fs();
        for path in ["home/a", "home/b", "home/sub/c", "var/d"] {
            fs.new_file(&SiaPath::new(path).unwrap(), params(10), false).unwrap();
        }
        fs.new_dir(&SiaPath::new("home/empty").unwrap(), 0o755).unwrap();
        let ctx = HealthContext::default();
        let (dirs, files) = fs.dir_list(&SiaPath::home(), &ctx).unwrap();
        let dir_names: Vec<&str> = dirs.iter().map(|dir| dir.path.as_str()).collect();
        assert_eq!(dir_names, vec!["home", "home/empty", "home/sub"]);
        let file_names: Vec<&str> = files.iter().map(|file| file.path.as_str()).collect();
        assert_eq!(file_names, vec!["home/a", "home/b"]);
        assert_eq!(fs.walk_files(&SiaPath::root()).unwrap().len(), 4);
        assert!(fs.new_dir(&SiaPath::new("home/empty").unwrap(), 0o755).unwrap_err().is_exists());
        assert!(fs.new_dir(&SiaPath::new("home/a").unwrap(), 0o755).unwrap_err().is_exists());
    }
}
