use serde::{Deserialize, Serialize};

use super::hash::Hash;

// File-kind bits of the mode word, as recorded by lstat.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Permission bits (everything below the kind bits).
pub const MODE_PERM_MASK: u32 = 0o7777;

/// Inode backing a regular file. Content identity is the hash; the rest is
/// metadata that must also match for two files to be considered equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_seconds: i64,
    pub mtime_nanoseconds: u32,
    pub size: u64,
    pub hash: Hash,
}

/// Inode for non-regular, non-directory entries: symlinks, device nodes,
/// fifos and sockets. The kind is carried in the mode bits; `rdev` is only
/// meaningful for device nodes and `symlink_target` only for symlinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_seconds: i64,
    pub size: u64,
    pub rdev: u64,
    #[serde(default)]
    pub symlink_target: String,
}

impl Inode {
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_device(&self) -> bool {
        let kind = self.mode & S_IFMT;
        kind == S_IFBLK || kind == S_IFCHR
    }
}

/// A slot in the inode table. Directories are not table entries; they are
/// owned by their parent in the snapshot tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeEntry {
    Regular(RegularInode),
    Other(Inode),
}

/// Opaque index into an [`InodeTable`]. Multiple directory entries may hold
/// the same id; that is how hard links are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InodeId(pub u32);

/// Arena of inodes for one snapshot. Directories reference entries by id so
/// a hard-linked inode is stored exactly once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InodeTable {
    entries: Vec<InodeEntry>,
    regular_count: usize,
}

impl InodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: InodeEntry) -> InodeId {
        if matches!(entry, InodeEntry::Regular(_)) {
            self.regular_count += 1;
        }
        let id = InodeId(self.entries.len() as u32);
        self.entries.push(entry);
        id
    }

    pub fn get(&self, id: InodeId) -> &InodeEntry {
        &self.entries[id.0 as usize]
    }

    pub fn regular(&self, id: InodeId) -> Option<&RegularInode> {
        match self.get(id) {
            InodeEntry::Regular(inode) => Some(inode),
            InodeEntry::Other(_) => None,
        }
    }

    pub fn other(&self, id: InodeId) -> Option<&Inode> {
        match self.get(id) {
            InodeEntry::Regular(_) => None,
            InodeEntry::Other(inode) => Some(inode),
        }
    }

    /// Total number of inodes in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of regular-file inodes.
    pub fn regular_count(&self) -> usize {
        self.regular_count
    }

    pub fn iter(&self) -> std::slice::Iter<'_, InodeEntry> {
        self.entries.iter()
    }

    /// Content hashes referenced by the regular inodes, one per inode.
    pub fn regular_hashes(&self) -> impl Iterator<Item = Hash> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            InodeEntry::Regular(inode) => Some(inode.hash),
            InodeEntry::Other(_) => None,
        })
    }
}
