//! Deep structural comparison of two snapshots.
//!
//! Aggregate counts are checked first so the steady-state "in sync" case
//! never descends into the tree. Child lists are compared element by
//! element in fixed order, so a reordering without content change counts
//! as a difference. That bias is deliberate and regression-tested:
//! image builders may rely on stable ordering.

use std::io::Write;

use super::inode::{Inode, RegularInode, S_IFBLK, S_IFCHR, S_IFLNK, S_IFMT};
use super::{Directory, FileEntry, FileSystem, InodeTable};

/// Optional mismatch trace. Writes a line for the first differing field at
/// each level; traversal stops once a substructure is known to differ.
struct Trace<'a>(Option<&'a mut dyn Write>);

impl Trace<'_> {
    fn log(&mut self, args: std::fmt::Arguments<'_>) {
        if let Some(writer) = self.0.as_deref_mut() {
            let _ = writer.write_fmt(args);
            let _ = writer.write_all(b"\n");
        }
    }
}

macro_rules! trace {
    ($t:expr, $($arg:tt)*) => { $t.log(format_args!($($arg)*)) };
}

/// Compare two snapshots, returning true when they match. When `log` is
/// supplied it receives a human-readable trace of what differed first.
pub fn compare_filesystems(
    left: &FileSystem,
    right: &FileSystem,
    log: Option<&mut dyn Write>,
) -> bool {
    let mut trace = Trace(log);
    if left.regular_inode_count() != right.regular_inode_count() {
        trace!(
            trace,
            "left vs. right: {} vs. {} regular file inodes",
            left.regular_inode_count(),
            right.regular_inode_count()
        );
        return false;
    }
    if left.inode_count() != right.inode_count() {
        trace!(
            trace,
            "left vs. right: {} vs. {} inodes",
            left.inode_count(),
            right.inode_count()
        );
        return false;
    }
    if left.directory_count() != right.directory_count() {
        trace!(
            trace,
            "left vs. right: {} vs. {} directory inodes",
            left.directory_count(),
            right.directory_count()
        );
        return false;
    }
    if left.object_cache.len() != right.object_cache.len() {
        trace!(
            trace,
            "left vs. right: {} vs. {} objects",
            left.object_cache.len(),
            right.object_cache.len()
        );
        return false;
    }
    if !compare_directories(
        &left.root,
        &right.root,
        &left.inode_table,
        &right.inode_table,
        &mut trace,
    ) {
        return false;
    }
    compare_objects(&left.object_cache, &right.object_cache, &mut trace)
}

fn compare_directories(
    left: &Directory,
    right: &Directory,
    left_table: &InodeTable,
    right_table: &InodeTable,
    trace: &mut Trace<'_>,
) -> bool {
    if left.name != right.name {
        trace!(
            trace,
            "dirname: left vs. right: {} vs. {}",
            left.name,
            right.name
        );
        return false;
    }
    if left.mode != right.mode {
        trace!(
            trace,
            "mode: left vs. right: {:o} vs. {:o}",
            left.mode,
            right.mode
        );
        return false;
    }
    if left.uid != right.uid {
        trace!(trace, "uid: left vs. right: {} vs. {}", left.uid, right.uid);
        return false;
    }
    if left.gid != right.gid {
        trace!(trace, "gid: left vs. right: {} vs. {}", left.gid, right.gid);
        return false;
    }
    if left.regular_files.len() != right.regular_files.len() {
        trace!(
            trace,
            "left vs. right: {} vs. {} regular files",
            left.regular_files.len(),
            right.regular_files.len()
        );
        return false;
    }
    if left.files.len() != right.files.len() {
        trace!(
            trace,
            "left vs. right: {} vs. {} files",
            left.files.len(),
            right.files.len()
        );
        return false;
    }
    if left.directories.len() != right.directories.len() {
        trace!(
            trace,
            "left vs. right: {} vs. {} subdirs",
            left.directories.len(),
            right.directories.len()
        );
        return false;
    }
    for (left_entry, right_entry) in left.regular_files.iter().zip(&right.regular_files) {
        if !compare_regular_files(left_entry, right_entry, left_table, right_table, trace) {
            return false;
        }
    }
    for (left_entry, right_entry) in left.files.iter().zip(&right.files) {
        if !compare_files(left_entry, right_entry, left_table, right_table, trace) {
            return false;
        }
    }
    for (left_sub, right_sub) in left.directories.iter().zip(&right.directories) {
        if !compare_directories(left_sub, right_sub, left_table, right_table, trace) {
            return false;
        }
    }
    true
}

fn compare_regular_files(
    left: &FileEntry,
    right: &FileEntry,
    left_table: &InodeTable,
    right_table: &InodeTable,
    trace: &mut Trace<'_>,
) -> bool {
    if left.name != right.name {
        trace!(
            trace,
            "filename: left vs. right: {} vs. {}",
            left.name,
            right.name
        );
        return false;
    }
    let left_inode = left_table.regular(left.inode);
    let right_inode = right_table.regular(right.inode);
    match (left_inode, right_inode) {
        (Some(left_inode), Some(right_inode)) => {
            compare_regular_inodes(left_inode, right_inode, trace)
        }
        _ => {
            trace!(trace, "inode kind: {} is not regular on both sides", left.name);
            false
        }
    }
}

fn compare_regular_inodes(
    left: &RegularInode,
    right: &RegularInode,
    trace: &mut Trace<'_>,
) -> bool {
    if left.mode != right.mode {
        trace!(
            trace,
            "mode: left vs. right: {:o} vs. {:o}",
            left.mode,
            right.mode
        );
        return false;
    }
    if left.uid != right.uid {
        trace!(trace, "uid: left vs. right: {} vs. {}", left.uid, right.uid);
        return false;
    }
    if left.gid != right.gid {
        trace!(trace, "gid: left vs. right: {} vs. {}", left.gid, right.gid);
        return false;
    }
    if left.size != right.size {
        trace!(
            trace,
            "size: left vs. right: {} vs. {}",
            left.size,
            right.size
        );
        return false;
    }
    if left.mtime_seconds != right.mtime_seconds
        || left.mtime_nanoseconds != right.mtime_nanoseconds
    {
        trace!(
            trace,
            "mtime: left vs. right: {}.{:09} vs. {}.{:09}",
            left.mtime_seconds,
            left.mtime_nanoseconds,
            right.mtime_seconds,
            right.mtime_nanoseconds
        );
        return false;
    }
    if left.hash != right.hash {
        trace!(
            trace,
            "hash: left vs. right: {} vs. {}",
            left.hash,
            right.hash
        );
        return false;
    }
    true
}

fn compare_files(
    left: &FileEntry,
    right: &FileEntry,
    left_table: &InodeTable,
    right_table: &InodeTable,
    trace: &mut Trace<'_>,
) -> bool {
    if left.name != right.name {
        trace!(
            trace,
            "filename: left vs. right: {} vs. {}",
            left.name,
            right.name
        );
        return false;
    }
    let left_inode = left_table.other(left.inode);
    let right_inode = right_table.other(right.inode);
    match (left_inode, right_inode) {
        (Some(left_inode), Some(right_inode)) => compare_inodes(left_inode, right_inode, trace),
        _ => {
            trace!(trace, "inode kind: {} differs in kind", left.name);
            false
        }
    }
}

fn compare_inodes(left: &Inode, right: &Inode, trace: &mut Trace<'_>) -> bool {
    if left.mode != right.mode {
        trace!(
            trace,
            "mode: left vs. right: {:o} vs. {:o}",
            left.mode,
            right.mode
        );
        return false;
    }
    if left.uid != right.uid {
        trace!(trace, "uid: left vs. right: {} vs. {}", left.uid, right.uid);
        return false;
    }
    if left.gid != right.gid {
        trace!(trace, "gid: left vs. right: {} vs. {}", left.gid, right.gid);
        return false;
    }
    if left.size != right.size {
        trace!(
            trace,
            "size: left vs. right: {} vs. {}",
            left.size,
            right.size
        );
        return false;
    }
    // Symlink mtimes are not compared: materializing a symlink cannot
    // restore its timestamp, so it would flag permanent false drift.
    if left.mode & S_IFMT != S_IFLNK && left.mtime_seconds != right.mtime_seconds {
        trace!(
            trace,
            "mtime: left vs. right: {} vs. {}",
            left.mtime_seconds,
            right.mtime_seconds
        );
        return false;
    }
    let kind = left.mode & S_IFMT;
    if (kind == S_IFBLK || kind == S_IFCHR) && left.rdev != right.rdev {
        trace!(
            trace,
            "rdev: left vs. right: {:x} vs. {:x}",
            left.rdev,
            right.rdev
        );
        return false;
    }
    if kind == S_IFLNK && left.symlink_target != right.symlink_target {
        trace!(
            trace,
            "symlink: left vs. right: {} vs. {}",
            left.symlink_target,
            right.symlink_target
        );
        return false;
    }
    true
}

fn compare_objects(left: &[crate::fs::Hash], right: &[crate::fs::Hash], trace: &mut Trace<'_>) -> bool {
    for (left_hash, right_hash) in left.iter().zip(right) {
        if left_hash != right_hash {
            trace!(
                trace,
                "hash: left vs. right: {} vs. {}",
                left_hash,
                right_hash
            );
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{Directory, FileSystem, Hash, S_IFBLK, S_IFDIR};
    use super::*;

    fn compare_with_trace(left: &FileSystem, right: &FileSystem) -> (bool, String) {
        let mut buf = Vec::new();
        let matched = compare_filesystems(left, right, Some(&mut buf));
        (matched, String::from_utf8(buf).unwrap())
    }

    #[test]
    fn snapshot_matches_itself() {
        let fs = SnapshotBuilder::new()
            .regular("motd", regular_inode(b"welcome", 100))
            .file("localtime", symlink_inode("/usr/share/zoneinfo/UTC", 100))
            .build();
        assert!(compare_filesystems(&fs, &fs, None));
    }

    #[test]
    fn differing_regular_count_short_circuits() {
        let one = SnapshotBuilder::new()
            .regular("a", regular_inode(b"a", 1))
            .build();
        let two = SnapshotBuilder::new()
            .regular("a", regular_inode(b"a", 1))
            .regular("b", regular_inode(b"b", 1))
            .build();
        let (matched, trace) = compare_with_trace(&one, &two);
        assert!(!matched);
        assert!(trace.contains("regular file inodes"), "trace: {trace}");
        // The short circuit fires before any per-entry comparison.
        assert!(!trace.contains("filename"));
    }

    #[test]
    fn differing_object_cache_size_short_circuits() {
        let one = SnapshotBuilder::new().build();
        let two = SnapshotBuilder::new()
            .extra_object(Hash::of(b"orphaned object"))
            .build();
        let (matched, trace) = compare_with_trace(&one, &two);
        assert!(!matched);
        assert!(trace.contains("objects"), "trace: {trace}");
    }

    #[test]
    fn symlink_mtime_is_exempt() {
        let left = SnapshotBuilder::new()
            .file("localtime", symlink_inode("/usr/share/zoneinfo/UTC", 100))
            .build();
        let right = SnapshotBuilder::new()
            .file("localtime", symlink_inode("/usr/share/zoneinfo/UTC", 999))
            .build();
        assert!(compare_filesystems(&left, &right, None));
    }

    #[test]
    fn symlink_target_is_compared() {
        let left = SnapshotBuilder::new()
            .file("localtime", symlink_inode("/usr/share/zoneinfo/UTC", 100))
            .build();
        let right = SnapshotBuilder::new()
            .file("localtime", symlink_inode("/usr/share/zoneinfo/EST", 100))
            .build();
        let (matched, trace) = compare_with_trace(&left, &right);
        assert!(!matched);
        assert!(trace.contains("symlink"), "trace: {trace}");
    }

    #[test]
    fn regular_mtime_is_compared() {
        let left = SnapshotBuilder::new()
            .regular("motd", regular_inode(b"welcome", 100))
            .build();
        let right = SnapshotBuilder::new()
            .regular("motd", regular_inode(b"welcome", 101))
            .build();
        let (matched, trace) = compare_with_trace(&left, &right);
        assert!(!matched);
        assert!(trace.contains("mtime"), "trace: {trace}");
    }

    #[test]
    fn device_rdev_is_compared() {
        let mut dev = symlink_inode("", 10);
        dev.mode = S_IFBLK | 0o660;
        dev.symlink_target.clear();
        dev.rdev = 0x0801;
        let mut other = dev.clone();
        other.rdev = 0x0802;
        let left = SnapshotBuilder::new().file("sda1", dev).build();
        let right = SnapshotBuilder::new().file("sda1", other).build();
        let (matched, trace) = compare_with_trace(&left, &right);
        assert!(!matched);
        assert!(trace.contains("rdev"), "trace: {trace}");
    }

    #[test]
    fn reordered_children_compare_different() {
        // Same child set, different insertion order. The comparator works
        // element by element, so this must report a difference even though
        // the trees are "logically" equal.
        let ab = SnapshotBuilder::new()
            .regular("a", regular_inode(b"a", 1))
            .regular("b", regular_inode(b"b", 1))
            .build();
        let ba = SnapshotBuilder::new()
            .regular("b", regular_inode(b"b", 1))
            .regular("a", regular_inode(b"a", 1))
            .build();
        let (matched, trace) = compare_with_trace(&ab, &ba);
        assert!(!matched);
        assert!(trace.contains("filename"), "trace: {trace}");
    }

    #[test]
    fn hash_and_size_mismatch_is_traced() {
        // Target has motd with hash H1 size 12; subscriber has hash H2
        // size 9. The first differing field in comparison order is size.
        let target = SnapshotBuilder::new()
            .regular("motd", regular_inode(b"hello world\n", 100))
            .build();
        let subscriber = SnapshotBuilder::new()
            .regular("motd", regular_inode(b"goodbye\n", 100))
            .build();
        let (matched, trace) = compare_with_trace(&target, &subscriber);
        assert!(!matched);
        assert!(
            trace.contains("size") || trace.contains("hash"),
            "trace: {trace}"
        );
    }

    #[test]
    fn differing_subdir_metadata_compares_different() {
        let subdir = |mode| Directory {
            name: "ssh".to_string(),
            mode: S_IFDIR | mode,
            uid: 0,
            gid: 0,
            ..Directory::default()
        };
        let left = SnapshotBuilder::new().subdir(subdir(0o755)).build();
        let right = SnapshotBuilder::new().subdir(subdir(0o700)).build();
        let (matched, trace) = compare_with_trace(&left, &right);
        assert!(!matched);
        assert!(trace.contains("mode"), "trace: {trace}");
    }
}
