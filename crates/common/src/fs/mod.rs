//! The content-addressed filesystem snapshot model.
//!
//! A [`FileSystem`] is an immutable tree capturing one filesystem's structure
//! and content identities at a point in time. Snapshots are produced by the
//! subscriber-side scanner or by the image builder, consumed by the
//! comparator, and never mutated in place.

mod compare;
mod hash;
mod inode;

pub use compare::compare_filesystems;
pub use hash::{Hash, HashParseError, Hasher};
pub use inode::{
    Inode, InodeEntry, InodeId, InodeTable, RegularInode, MODE_PERM_MASK, S_IFBLK, S_IFCHR,
    S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
};

use serde::{Deserialize, Serialize};

/// A named reference from a directory to an inode in the snapshot's table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub inode: InodeId,
}

/// One directory in the snapshot tree. Children are kept in three disjoint
/// lists; names are unique across all three (a producer invariant, not
/// checked here). List order is the producer's insertion order and is
/// significant for comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub regular_files: Vec<FileEntry>,
    pub files: Vec<FileEntry>,
    pub directories: Vec<Directory>,
}

impl Directory {
    /// Number of directories in this subtree, including this one.
    fn count(&self) -> usize {
        1 + self.directories.iter().map(Directory::count).sum::<usize>()
    }
}

/// An immutable snapshot of one filesystem: the directory tree, the inode
/// arena backing it, and the set of content objects held locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSystem {
    pub root: Directory,
    pub inode_table: InodeTable,
    directory_count: usize,
    /// Content hashes the producer holds locally, sorted. For a subscriber
    /// snapshot every hash referenced by a regular inode appears here; a
    /// target snapshot makes no such promise.
    pub object_cache: Vec<Hash>,
}

impl FileSystem {
    pub fn new(root: Directory, inode_table: InodeTable, mut object_cache: Vec<Hash>) -> Self {
        object_cache.sort_unstable();
        object_cache.dedup();
        let directory_count = root.count();
        Self {
            root,
            inode_table,
            directory_count,
            object_cache,
        }
    }

    pub fn regular_inode_count(&self) -> usize {
        self.inode_table.regular_count()
    }

    pub fn inode_count(&self) -> usize {
        self.inode_table.len()
    }

    pub fn directory_count(&self) -> usize {
        self.directory_count
    }

    /// Depth-first traversal in child-list order, yielding each directory
    /// and file with its path from the snapshot root.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: vec![WalkFrame {
                dir: &self.root,
                path: String::from("/"),
                stage: WalkStage::Announce,
                index: 0,
            }],
        }
    }
}

/// One visited node during a [`FileSystem::walk`] traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEntry<'a> {
    Directory { path: String, directory: &'a Directory },
    RegularFile { path: String, entry: &'a FileEntry },
    File { path: String, entry: &'a FileEntry },
}

struct WalkFrame<'a> {
    dir: &'a Directory,
    path: String,
    stage: WalkStage,
    index: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WalkStage {
    Announce,
    Regular,
    Files,
    Dirs,
}

/// Iterator over a snapshot tree, depth first, child lists in fixed order.
pub struct Walk<'a> {
    stack: Vec<WalkFrame<'a>>,
}

fn join(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

impl<'a> Iterator for Walk<'a> {
    type Item = WalkEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            // Copy the directory reference out of the frame so yielded
            // references carry the tree's lifetime, not the frame's.
            let dir = frame.dir;
            match frame.stage {
                WalkStage::Announce => {
                    frame.stage = WalkStage::Regular;
                    return Some(WalkEntry::Directory {
                        path: frame.path.clone(),
                        directory: dir,
                    });
                }
                WalkStage::Regular => {
                    if let Some(entry) = dir.regular_files.get(frame.index) {
                        frame.index += 1;
                        return Some(WalkEntry::RegularFile {
                            path: join(&frame.path, &entry.name),
                            entry,
                        });
                    }
                    frame.stage = WalkStage::Files;
                    frame.index = 0;
                }
                WalkStage::Files => {
                    if let Some(entry) = dir.files.get(frame.index) {
                        frame.index += 1;
                        return Some(WalkEntry::File {
                            path: join(&frame.path, &entry.name),
                            entry,
                        });
                    }
                    frame.stage = WalkStage::Dirs;
                    frame.index = 0;
                }
                WalkStage::Dirs => {
                    if let Some(sub) = dir.directories.get(frame.index) {
                        frame.index += 1;
                        let path = join(&frame.path, &sub.name);
                        self.stack.push(WalkFrame {
                            dir: sub,
                            path,
                            stage: WalkStage::Announce,
                            index: 0,
                        });
                        continue;
                    }
                    self.stack.pop();
                }
            }
        }
    }
}
