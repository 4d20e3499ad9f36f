use std::collections::BTreeMap;

use crate::metadata::FileMetadata;

/// One node of the virtual filesystem tree. Directory children are kept
/// ordered so `read_dir` output is deterministic.
#[derive(Clone, Debug)]
pub enum FileNode {
    File {
        content: Vec<u8>,
        metadata: FileMetadata,
    },
    Dir {
        children: BTreeMap<String, FileNode>,
        metadata: FileMetadata,
    },
}

impl FileNode {
    pub fn new_file(content: Vec<u8>) -> Self {
        let metadata = FileMetadata::new(content.len() as u64);
        Self::File { content, metadata }
    }

    pub fn new_dir() -> Self {
        Self::Dir {
            children: BTreeMap::new(),
            metadata: FileMetadata::new(0),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir { .. })
    }

    pub fn metadata(&self) -> &FileMetadata {
        match self {
            Self::File { metadata, .. } => metadata,
            Self::Dir { metadata, .. } => metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut FileMetadata {
        match self {
            Self::File { metadata, .. } => metadata,
            Self::Dir { metadata, .. } => metadata,
        }
    }

    /// Child lookup; `None` on files.
    pub fn child(&self, name: &str) -> Option<&FileNode> {
        match self {
            Self::Dir { children, .. } => children.get(name),
            Self::File { .. } => None,
        }
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut FileNode> {
        match self {
            Self::Dir { children, .. } => children.get_mut(name),
            Self::File { .. } => None,
        }
    }

    /// Insert a child, replacing any existing entry. Panics on files: the
    /// filesystem validates directory-ness before descending.
    pub fn add_child(&mut self, name: String, node: FileNode) {
        match self {
            Self::Dir { children, .. } => {
                children.insert(name, node);
            },
            Self::File { .. } => panic!("add_child on a file node"),
        }
    }

    pub fn remove_child(&mut self, name: &str) -> Option<FileNode> {
        match self {
            Self::Dir { children, .. } => children.remove(name),
            Self::File { .. } => None,
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, FileNode>> {
        match self {
            Self::Dir { children, .. } => Some(children),
            Self::File { .. } => None,
        }
    }

    /// Total size of all file content at or below this node.
    pub fn subtree_size(&self) -> u64 {
        match self {
            Self::File { content, .. } => content.len() as u64,
            Self::Dir { children, .. } => children.values().map(FileNode::subtree_size).sum(),
        }
    }
}
