//! In-memory virtual filesystem for sandboxed executions.
//!
//! One `MemFs` per sandbox: a tree of [`FileNode`]s under a byte quota, with
//! canonical path handling and prefix-subscription watch notifications. All
//! operations are synchronous; mutations commit atomically under one lock and
//! notify watchers strictly afterwards.

mod metadata;
mod node;
pub mod path;
mod watcher;

use std::time::SystemTime;

use errors::SandboxError;
use parking_lot::Mutex;

pub use crate::{
    metadata::{
        FileMetadata,
        DEFAULT_PERMISSIONS,
    },
    node::FileNode,
    path::normalize_path,
    watcher::{
        FsEvent,
        FsEventKind,
        FsWatcher,
        WatchCallback,
        WatchId,
    },
};
use crate::path::{
    path_segments,
    split_parent,
};

/// Mount points that always exist, including right after [`MemFs::clear`].
pub const MOUNT_POINTS: &[&str] = &["/sandbox", "/tmp", "/cache"];

pub const DEFAULT_MAX_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct MemFsConfig {
    /// Quota over the sum of all file content bytes.
    pub max_size: u64,
}

impl Default for MemFsConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QuotaUsage {
    pub used: u64,
    pub limit: u64,
    pub percentage: f64,
}

#[derive(Clone, Debug)]
pub struct FileStat {
    pub is_directory: bool,
    pub size: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
    pub permissions: u32,
}

struct FsState {
    root: FileNode,
    used: u64,
}

/// The virtual filesystem. Cheap to share behind an `Arc`; all state sits
/// under one short-lived lock.
pub struct MemFs {
    max_size: u64,
    state: Mutex<FsState>,
    watcher: FsWatcher,
}

impl std::fmt::Debug for MemFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemFs")
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

/// Result of walking a normalised path without mutating the tree.
enum Located {
    Found,
    /// Every ancestor up to `depth` exists and is a directory; the segment at
    /// `depth` is missing.
    MissingAt(usize),
    /// An interior segment resolved to a file; `0..=index` is the prefix that
    /// exists, with the file at `index`.
    FileInPath(usize),
}

fn locate(root: &FileNode, segments: &[String]) -> Located {
    let mut node = root;
    for (depth, segment) in segments.iter().enumerate() {
        if !node.is_dir() {
            return Located::FileInPath(depth - 1);
        }
        match node.child(segment) {
            Some(child) => node = child,
            None => return Located::MissingAt(depth),
        }
    }
    Located::Found
}

fn prefix_path(segments: &[String], end: usize) -> String {
    if end == 0 {
        "/".to_string()
    } else {
        format!("/{}", segments[..end].join("/"))
    }
}

impl MemFs {
    pub fn new(config: MemFsConfig) -> Self {
        let mut root = FileNode::new_dir();
        for mount in MOUNT_POINTS {
            let name = mount.trim_start_matches('/').to_string();
            root.add_child(name, FileNode::new_dir());
        }
        Self {
            max_size: config.max_size,
            state: Mutex::new(FsState { root, used: 0 }),
            watcher: FsWatcher::new(),
        }
    }

    /// Write a file, creating missing parent directories. Overwrites adjust
    /// the quota by the size delta and leave the existing content untouched
    /// when the quota check fails.
    pub fn write(&self, raw_path: &str, contents: impl AsRef<[u8]>) -> Result<(), SandboxError> {
        let path = normalize_path(raw_path);
        if path == "/" {
            return Err(SandboxError::is_directory(&path));
        }
        let bytes = contents.as_ref().to_vec();
        let new_size = bytes.len() as u64;
        let segments: Vec<String> = path_segments(&path).into_iter().map(String::from).collect();

        let mut events = Vec::new();
        {
            let mut state = self.state.lock();

            // Validate the full path and find any node being overwritten
            // before touching the tree.
            let old_size = match locate(&state.root, &segments) {
                Located::FileInPath(index) => {
                    return Err(SandboxError::not_a_directory(&prefix_path(
                        &segments,
                        index + 1,
                    )));
                },
                Located::MissingAt(_) => None,
                Located::Found => {
                    let mut node = &state.root;
                    for segment in &segments {
                        node = node.child(segment).expect("locate said Found");
                    }
                    match node {
                        FileNode::Dir { .. } => return Err(SandboxError::is_directory(&path)),
                        FileNode::File { content, .. } => Some(content.len() as u64),
                    }
                },
            };

            let used_after = state.used - old_size.unwrap_or(0) + new_size;
            if used_after > self.max_size {
                return Err(SandboxError::quota_exceeded(used_after, self.max_size));
            }

            // Commit: create missing parents, then insert.
            let (name, parents) = segments.split_last().expect("non-root path");
            let mut node = &mut state.root;
            for (depth, segment) in parents.iter().enumerate() {
                let is_new = node.child(segment).is_none();
                if is_new {
                    node.add_child(segment.clone(), FileNode::new_dir());
                    events.push(FsEvent {
                        path: prefix_path(&segments, depth + 1),
                        kind: FsEventKind::Create,
                    });
                }
                node = node.child_mut(segment).expect("just inserted");
            }
            let kind = if old_size.is_some() {
                FsEventKind::Modify
            } else {
                FsEventKind::Create
            };
            match node.child_mut(name) {
                Some(FileNode::File { content, metadata }) => {
                    *content = bytes;
                    metadata.update_modified(Some(new_size));
                },
                Some(FileNode::Dir { .. }) => unreachable!("validated above"),
                None => node.add_child(name.clone(), FileNode::new_file(bytes)),
            }
            state.used = used_after;
            events.push(FsEvent { path, kind });
        }
        for event in &events {
            self.watcher.notify(event);
        }
        Ok(())
    }

    /// Read a file's content, byte-exact. Bumps the access time.
    pub fn read(&self, raw_path: &str) -> Result<Vec<u8>, SandboxError> {
        let path = normalize_path(raw_path);
        let segments: Vec<String> = path_segments(&path).into_iter().map(String::from).collect();
        let mut state = self.state.lock();
        let mut node = &mut state.root;
        for segment in &segments {
            node = node
                .child_mut(segment)
                .ok_or_else(|| SandboxError::file_not_found(&path))?;
        }
        match node {
            FileNode::Dir { .. } => Err(SandboxError::is_directory(&path)),
            FileNode::File { content, metadata } => {
                metadata.touch();
                Ok(content.clone())
            },
        }
    }

    /// Read a file as UTF-8 text.
    pub fn read_to_string(&self, raw_path: &str) -> Result<String, SandboxError> {
        let bytes = self.read(raw_path)?;
        String::from_utf8(bytes).map_err(|_| {
            SandboxError::new(
                errors::ErrorCode::InvalidInput,
                format!("{} is not valid UTF-8", normalize_path(raw_path)),
            )
        })
    }

    /// Create a directory. Idempotent on an existing directory.
    pub fn mkdir(&self, raw_path: &str, recursive: bool) -> Result<(), SandboxError> {
        let path = normalize_path(raw_path);
        if path == "/" {
            return Ok(());
        }
        let segments: Vec<String> = path_segments(&path).into_iter().map(String::from).collect();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let create_from = match locate(&state.root, &segments) {
                Located::Found => {
                    let mut node = &state.root;
                    for segment in &segments {
                        node = node.child(segment).expect("locate said Found");
                    }
                    if node.is_dir() {
                        return Ok(());
                    }
                    return Err(SandboxError::not_a_directory(&path));
                },
                Located::FileInPath(index) => {
                    return Err(SandboxError::not_a_directory(&prefix_path(
                        &segments,
                        index + 1,
                    )));
                },
                Located::MissingAt(depth) => {
                    if !recursive && depth < segments.len() - 1 {
                        return Err(SandboxError::file_not_found(&prefix_path(
                            &segments,
                            depth + 1,
                        )));
                    }
                    depth
                },
            };
            let mut node = &mut state.root;
            for (depth, segment) in segments.iter().enumerate() {
                if depth >= create_from {
                    node.add_child(segment.clone(), FileNode::new_dir());
                    events.push(FsEvent {
                        path: prefix_path(&segments, depth + 1),
                        kind: FsEventKind::Create,
                    });
                }
                node = node.child_mut(segment).expect("exists or just inserted");
            }
        }
        for event in &events {
            self.watcher.notify(event);
        }
        Ok(())
    }

    /// Delete a file or directory. Non-empty directories require
    /// `recursive = true`. Fires one delete event per removed descendant.
    pub fn delete(&self, raw_path: &str, recursive: bool) -> Result<(), SandboxError> {
        let path = normalize_path(raw_path);
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if path == "/" {
                // The root itself is permanent; recursive delete empties it.
                let children: Vec<String> = state
                    .root
                    .children()
                    .expect("root is a directory")
                    .keys()
                    .cloned()
                    .collect();
                if !children.is_empty() && !recursive {
                    return Err(SandboxError::directory_not_empty(&path));
                }
                for name in children {
                    let removed = state.root.remove_child(&name).expect("listed above");
                    state.used -= removed.subtree_size();
                    collect_delete_events(&removed, &format!("/{name}"), &mut events);
                }
            } else {
                let segments: Vec<String> =
                    path_segments(&path).into_iter().map(String::from).collect();
                match locate(&state.root, &segments) {
                    Located::Found => {},
                    Located::MissingAt(_) | Located::FileInPath(_) => {
                        return Err(SandboxError::file_not_found(&path));
                    },
                }
                let (parent_path, name) = split_parent(&path).expect("non-root path");
                let parent_segments: Vec<String> = path_segments(&parent_path)
                    .into_iter()
                    .map(String::from)
                    .collect();
                let mut parent = &mut state.root;
                for segment in &parent_segments {
                    parent = parent.child_mut(segment).expect("locate said Found");
                }
                {
                    let target = parent.child(&name).expect("locate said Found");
                    if let Some(children) = target.children() {
                        if !children.is_empty() && !recursive {
                            return Err(SandboxError::directory_not_empty(&path));
                        }
                    }
                }
                let removed = parent.remove_child(&name).expect("locate said Found");
                state.used -= removed.subtree_size();
                collect_delete_events(&removed, &path, &mut events);
            }
        }
        for event in &events {
            self.watcher.notify(event);
        }
        Ok(())
    }

    /// Directory listing, sorted by name. Bumps the access time.
    pub fn read_dir(&self, raw_path: &str) -> Result<Vec<String>, SandboxError> {
        let path = normalize_path(raw_path);
        let segments: Vec<String> = path_segments(&path).into_iter().map(String::from).collect();
        let mut state = self.state.lock();
        let mut node = &mut state.root;
        for segment in &segments {
            node = node
                .child_mut(segment)
                .ok_or_else(|| SandboxError::file_not_found(&path))?;
        }
        match node {
            FileNode::File { .. } => Err(SandboxError::not_a_directory(&path)),
            FileNode::Dir { children, metadata } => {
                metadata.touch();
                Ok(children.keys().cloned().collect())
            },
        }
    }

    pub fn stat(&self, raw_path: &str) -> Result<FileStat, SandboxError> {
        let path = normalize_path(raw_path);
        let segments: Vec<String> = path_segments(&path).into_iter().map(String::from).collect();
        let state = self.state.lock();
        let mut node = &state.root;
        for segment in &segments {
            node = node
                .child(segment)
                .ok_or_else(|| SandboxError::file_not_found(&path))?;
        }
        let metadata = node.metadata();
        Ok(FileStat {
            is_directory: node.is_dir(),
            size: metadata.size,
            created: metadata.created,
            modified: metadata.modified,
            accessed: metadata.accessed,
            permissions: metadata.permissions,
        })
    }

    pub fn exists(&self, raw_path: &str) -> bool {
        let path = normalize_path(raw_path);
        let segments: Vec<String> = path_segments(&path).into_iter().map(String::from).collect();
        let state = self.state.lock();
        matches!(locate(&state.root, &segments), Located::Found)
    }

    /// Reset the tree, re-create the mount points, zero the quota, and drop
    /// all watch subscriptions.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let mut root = FileNode::new_dir();
        for mount in MOUNT_POINTS {
            let name = mount.trim_start_matches('/').to_string();
            root.add_child(name, FileNode::new_dir());
        }
        state.root = root;
        state.used = 0;
        drop(state);
        self.watcher.clear();
    }

    pub fn quota_usage(&self) -> QuotaUsage {
        let used = self.state.lock().used;
        QuotaUsage {
            used,
            limit: self.max_size,
            percentage: if self.max_size == 0 {
                0.0
            } else {
                used as f64 / self.max_size as f64 * 100.0
            },
        }
    }

    pub fn watch(&self, path: &str, callback: WatchCallback) -> WatchId {
        self.watcher.subscribe(path, callback)
    }

    pub fn unwatch(&self, id: WatchId) -> bool {
        self.watcher.unsubscribe(id)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Recomputed sum of all file sizes; equals `quota_usage().used` by
    /// construction. Exposed for invariant checks in tests.
    pub fn recomputed_usage(&self) -> u64 {
        self.state.lock().root.subtree_size()
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new(MemFsConfig::default())
    }
}

fn collect_delete_events(node: &FileNode, path: &str, events: &mut Vec<FsEvent>) {
    if let Some(children) = node.children() {
        for (name, child) in children {
            collect_delete_events(child, &format!("{path}/{name}"), events);
        }
    }
    events.push(FsEvent {
        path: path.to_string(),
        kind: FsEventKind::Delete,
    });
}
