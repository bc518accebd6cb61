//! Turns a detected difference into a minimal patch.
//!
//! Unlike the comparator, generation diffs the two trees by name: the
//! comparator only answers yes/no, while the generator must figure out
//! which paths to touch. Equivalence rules for individual inodes match the
//! comparator's, so a patch is only generated for drift the comparator can
//! see, and applying it converges.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::fs::{Directory, FileSystem, Hash, Inode, InodeTable, S_IFBLK, S_IFCHR, S_IFLNK, S_IFMT};
use crate::triggers::Triggers;

use super::{InodeSpec, InodeToMake, UpdateRequest};

/// A generated patch plus the objects the controller must ensure are
/// fetchable before the patch is pushed. The object list is not part of the
/// wire request; the subscriber discovers missing objects itself.
#[derive(Debug, Default)]
pub struct GeneratedUpdate {
    pub request: UpdateRequest,
    pub required_objects: Vec<Hash>,
}

/// Generate the patch that moves `subscriber` to `target`.
pub fn generate_update(
    target: &FileSystem,
    subscriber: &FileSystem,
    triggers: &Triggers,
    wait: bool,
) -> GeneratedUpdate {
    let mut diff = Diff {
        target_table: &target.inode_table,
        sub_table: &subscriber.inode_table,
        sub_objects: subscriber.object_cache.iter().copied().collect(),
        creations: Vec::new(),
        deletions: Vec::new(),
        required: BTreeSet::new(),
    };
    diff.directory(&target.root, Some(&subscriber.root), "/");

    let mut changed_paths: Vec<String> = diff
        .creations
        .iter()
        .map(|op| op.path.clone())
        .chain(diff.deletions.iter().cloned())
        .collect();
    changed_paths.sort_unstable();

    GeneratedUpdate {
        request: UpdateRequest {
            inodes_to_make: diff.creations,
            paths_to_delete: diff.deletions,
            triggers: triggers.matched(&changed_paths),
            wait,
        },
        required_objects: diff.required.into_iter().collect(),
    }
}

struct Diff<'a> {
    target_table: &'a InodeTable,
    sub_table: &'a InodeTable,
    sub_objects: HashSet<Hash>,
    creations: Vec<InodeToMake>,
    deletions: Vec<String>,
    required: BTreeSet<Hash>,
}

/// What a name resolves to on the subscriber side of one directory.
enum SubEntry<'a> {
    Regular(crate::fs::InodeId),
    Other(crate::fs::InodeId),
    Directory(&'a Directory),
}

fn join(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

impl<'a> Diff<'a> {
    fn directory(&mut self, target: &Directory, subscriber: Option<&'a Directory>, path: &str) {
        let needs_create = match subscriber {
            Some(sub) => {
                target.mode != sub.mode || target.uid != sub.uid || target.gid != sub.gid
            }
            None => true,
        };
        if needs_create {
            self.creations.push(InodeToMake {
                path: path.to_string(),
                spec: InodeSpec::Directory {
                    mode: target.mode,
                    uid: target.uid,
                    gid: target.gid,
                },
            });
        }

        let mut sub_entries: HashMap<&str, SubEntry<'a>> = HashMap::new();
        if let Some(sub) = subscriber {
            for entry in &sub.regular_files {
                sub_entries.insert(entry.name.as_str(), SubEntry::Regular(entry.inode));
            }
            for entry in &sub.files {
                sub_entries.insert(entry.name.as_str(), SubEntry::Other(entry.inode));
            }
            for dir in &sub.directories {
                sub_entries.insert(dir.name.as_str(), SubEntry::Directory(dir));
            }
        }

        for entry in &target.regular_files {
            let target_inode = self
                .target_table
                .regular(entry.inode)
                .expect("regular entry backed by regular inode");
            let child_path = join(path, &entry.name);
            match sub_entries.remove(entry.name.as_str()) {
                Some(SubEntry::Regular(sub_id)) => {
                    let sub_inode = self
                        .sub_table
                        .regular(sub_id)
                        .expect("regular entry backed by regular inode");
                    if target_inode != sub_inode {
                        self.create_regular(child_path, target_inode.clone());
                    }
                }
                Some(_) => {
                    // Wrong kind in the way: clear it, then materialize.
                    self.deletions.push(child_path.clone());
                    self.create_regular(child_path, target_inode.clone());
                }
                None => self.create_regular(child_path, target_inode.clone()),
            }
        }

        for entry in &target.files {
            let target_inode = self
                .target_table
                .other(entry.inode)
                .expect("file entry backed by non-regular inode");
            let child_path = join(path, &entry.name);
            match sub_entries.remove(entry.name.as_str()) {
                Some(SubEntry::Other(sub_id)) => {
                    let sub_inode = self
                        .sub_table
                        .other(sub_id)
                        .expect("file entry backed by non-regular inode");
                    if !inodes_equivalent(target_inode, sub_inode) {
                        self.creations.push(InodeToMake {
                            path: child_path,
                            spec: InodeSpec::Other(target_inode.clone()),
                        });
                    }
                }
                Some(_) => {
                    self.deletions.push(child_path.clone());
                    self.creations.push(InodeToMake {
                        path: child_path,
                        spec: InodeSpec::Other(target_inode.clone()),
                    });
                }
                None => self.creations.push(InodeToMake {
                    path: child_path,
                    spec: InodeSpec::Other(target_inode.clone()),
                }),
            }
        }

        for target_sub in &target.directories {
            let child_path = join(path, &target_sub.name);
            match sub_entries.remove(target_sub.name.as_str()) {
                Some(SubEntry::Directory(sub_dir)) => {
                    self.directory(target_sub, Some(sub_dir), &child_path);
                }
                Some(_) => {
                    self.deletions.push(child_path.clone());
                    self.directory(target_sub, None, &child_path);
                }
                None => self.directory(target_sub, None, &child_path),
            }
        }

        // Anything left on the subscriber side has no counterpart in the
        // target and gets deleted.
        let mut stale: Vec<&str> = sub_entries.keys().copied().collect();
        stale.sort_unstable();
        for name in stale {
            self.deletions.push(join(path, name));
        }
    }

    fn create_regular(&mut self, path: String, inode: crate::fs::RegularInode) {
        if !self.sub_objects.contains(&inode.hash) {
            self.required.insert(inode.hash);
        }
        self.creations.push(InodeToMake {
            path,
            spec: InodeSpec::Regular(inode),
        });
    }
}

/// The comparator's equivalence for non-regular inodes: mtime is ignored
/// for symlinks, rdev only matters for devices, the target string only for
/// symlinks.
fn inodes_equivalent(left: &Inode, right: &Inode) -> bool {
    if left.mode != right.mode
        || left.uid != right.uid
        || left.gid != right.gid
        || left.size != right.size
    {
        return false;
    }
    let kind = left.mode & S_IFMT;
    if kind != S_IFLNK && left.mtime_seconds != right.mtime_seconds {
        return false;
    }
    if (kind == S_IFBLK || kind == S_IFCHR) && left.rdev != right.rdev {
        return false;
    }
    if kind == S_IFLNK && left.symlink_target != right.symlink_target {
        return false;
    }
    true
}
