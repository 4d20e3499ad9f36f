use std::time::SystemTime;

pub const DEFAULT_PERMISSIONS: u32 = 0o644;

/// Timestamps, size, and permissions for one tree node.
#[derive(Clone, Debug)]
pub struct FileMetadata {
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
    pub size: u64,
    pub permissions: u32,
}

impl FileMetadata {
    pub fn new(size: u64) -> Self {
        let now = SystemTime::now();
        Self {
            created: now,
            modified: now,
            accessed: now,
            size,
            permissions: DEFAULT_PERMISSIONS,
        }
    }

    /// Bump the access time.
    pub fn touch(&mut self) {
        self.accessed = SystemTime::now();
    }

    /// Bump the modification time, optionally recording a new size.
    pub fn update_modified(&mut self, new_size: Option<u64>) {
        self.modified = SystemTime::now();
        if let Some(size) = new_size {
            self.size = size;
        }
    }
}
