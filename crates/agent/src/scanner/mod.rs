//! The rate-limited filesystem scanner.
//!
//! Walks the managed tree and materializes a snapshot. Every regular file's
//! bytes are streamed through the rate limiter while hashing, which is the
//! deliberate backpressure that keeps scanning from starving foreground
//! I/O. Hard links are deduplicated through a (device, inode) table so one
//! inode is hashed and stored once however many paths reference it.

mod daemon;

pub use daemon::{start_scan_loop, ScanLoopConfig};

use std::collections::HashMap;
use std::future::Future;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::AsyncReadExt;
use tracing::warn;

use common::filter::Filter;
use common::fs::{
    Directory, FileEntry, FileSystem, Hasher, Inode, InodeEntry, InodeId, InodeTable,
    RegularInode, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};
use common::rateio::RateLimiter;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A condition that aborts the whole scan cycle. Per-file problems are
/// recorded as warnings instead and the walk continues.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("cannot scan root {path}: {source}")]
    UnreadableRoot {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("scan root {0} is not a directory")]
    RootNotDirectory(PathBuf),
}

/// One tolerated per-file failure. The affected path is simply absent from
/// this cycle's snapshot.
#[derive(Debug, Clone)]
pub struct ScanWarning {
    pub path: String,
    pub error: String,
}

/// A completed scan: the snapshot plus whatever was skipped.
#[derive(Debug)]
pub struct ScanOutcome {
    pub file_system: FileSystem,
    pub warnings: Vec<ScanWarning>,
}

/// Walk the live tree rooted at `root` and build a snapshot. Paths are
/// matched against `filter` relative to the root (always starting with
/// `/`); excluded entries are neither hashed nor listed.
pub async fn scan(
    root: &Path,
    filter: &Filter,
    limiter: &mut RateLimiter,
) -> Result<ScanOutcome, ScanError> {
    let meta = tokio::fs::symlink_metadata(root)
        .await
        .map_err(|source| ScanError::UnreadableRoot {
            path: root.to_path_buf(),
            source,
        })?;
    if !meta.is_dir() {
        return Err(ScanError::RootNotDirectory(root.to_path_buf()));
    }

    let mut walker = Walker {
        filter,
        limiter,
        table: InodeTable::new(),
        seen: HashMap::new(),
        warnings: Vec::new(),
        buf: vec![0u8; READ_CHUNK_SIZE],
    };
    let root_dir = walker
        .walk_directory(
            root.to_path_buf(),
            String::from("/"),
            String::new(),
            meta.mode(),
            meta.uid(),
            meta.gid(),
        )
        .await;

    let object_cache = walker.table.regular_hashes().collect();
    Ok(ScanOutcome {
        file_system: FileSystem::new(root_dir, walker.table, object_cache),
        warnings: walker.warnings,
    })
}

struct Walker<'a> {
    filter: &'a Filter,
    limiter: &'a mut RateLimiter,
    table: InodeTable,
    seen: HashMap<(u64, u64), InodeId>,
    warnings: Vec<ScanWarning>,
    buf: Vec<u8>,
}

fn join(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

impl Walker<'_> {
    fn warn(&mut self, path: String, error: impl std::fmt::Display) {
        warn!(%path, %error, "scan entry skipped");
        self.warnings.push(ScanWarning {
            path,
            error: error.to_string(),
        });
    }

    /// Recursive directory walk. Boxed because async recursion needs an
    /// explicitly sized future.
    fn walk_directory<'b>(
        &'b mut self,
        fs_path: PathBuf,
        rel_path: String,
        name: String,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Pin<Box<dyn Future<Output = Directory> + Send + 'b>> {
        Box::pin(async move {
            let mut dir = Directory {
                name,
                mode,
                uid,
                gid,
                ..Directory::default()
            };

            let mut reader = match tokio::fs::read_dir(&fs_path).await {
                Ok(reader) => reader,
                Err(err) => {
                    self.warn(rel_path, err);
                    return dir;
                }
            };
            let mut children = Vec::new();
            loop {
                match reader.next_entry().await {
                    Ok(Some(entry)) => children.push(entry.file_name()),
                    Ok(None) => break,
                    Err(err) => {
                        self.warn(rel_path.clone(), err);
                        break;
                    }
                }
            }
            // Lexical order fixes the child-list order for comparison.
            children.sort_unstable();

            for child_name in children {
                let Some(child_str) = child_name.to_str() else {
                    self.warn(
                        format!("{rel_path}/{}", child_name.to_string_lossy()),
                        "name is not valid UTF-8",
                    );
                    continue;
                };
                let child_str = child_str.to_string();
                let child_rel = join(&rel_path, &child_str);
                if self.filter.matches(&child_rel) {
                    continue;
                }
                let child_fs = fs_path.join(&child_name);

                self.limiter.throttle(0, 1).await;
                let meta = match tokio::fs::symlink_metadata(&child_fs).await {
                    Ok(meta) => meta,
                    Err(err) => {
                        self.warn(child_rel, err);
                        continue;
                    }
                };
                let mode = meta.mode();
                let uid = meta.uid();
                let gid = meta.gid();

                match mode & S_IFMT {
                    S_IFDIR => {
                        let sub = self
                            .walk_directory(child_fs, child_rel, child_str, mode, uid, gid)
                            .await;
                        dir.directories.push(sub);
                    }
                    S_IFREG => {
                        let key = (meta.dev(), meta.ino());
                        let id = match self.seen.get(&key) {
                            Some(&id) => id,
                            None => {
                                let hash = match self.hash_file(&child_fs).await {
                                    Ok(hash) => hash,
                                    Err(err) => {
                                        self.warn(child_rel, err);
                                        continue;
                                    }
                                };
                                let id = self.table.insert(InodeEntry::Regular(RegularInode {
                                    mode,
                                    uid,
                                    gid,
                                    mtime_seconds: meta.mtime(),
                                    mtime_nanoseconds: meta.mtime_nsec() as u32,
                                    size: meta.size(),
                                    hash,
                                }));
                                self.seen.insert(key, id);
                                id
                            }
                        };
                        dir.regular_files.push(FileEntry {
                            name: child_str,
                            inode: id,
                        });
                    }
                    S_IFLNK => {
                        let target = match tokio::fs::read_link(&child_fs).await {
                            Ok(target) => target.to_string_lossy().into_owned(),
                            Err(err) => {
                                self.warn(child_rel, err);
                                continue;
                            }
                        };
                        let id = self.insert_other(
                            (meta.dev(), meta.ino()),
                            Inode {
                                mode,
                                uid,
                                gid,
                                mtime_seconds: meta.mtime(),
                                size: meta.size(),
                                rdev: 0,
                                symlink_target: target,
                            },
                        );
                        dir.files.push(FileEntry {
                            name: child_str,
                            inode: id,
                        });
                    }
                    _ => {
                        // Devices, fifos and sockets carry no content.
                        let id = self.insert_other(
                            (meta.dev(), meta.ino()),
                            Inode {
                                mode,
                                uid,
                                gid,
                                mtime_seconds: meta.mtime(),
                                size: meta.size(),
                                rdev: meta.rdev(),
                                symlink_target: String::new(),
                            },
                        );
                        dir.files.push(FileEntry {
                            name: child_str,
                            inode: id,
                        });
                    }
                }
            }
            dir
        })
    }

    fn insert_other(&mut self, key: (u64, u64), inode: Inode) -> InodeId {
        match self.seen.get(&key) {
            Some(&id) => id,
            None => {
                let id = self.table.insert(InodeEntry::Other(inode));
                self.seen.insert(key, id);
                id
            }
        }
    }

    /// Stream a file through the rate limiter while hashing it.
    async fn hash_file(&mut self, path: &Path) -> std::io::Result<common::fs::Hash> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Hasher::new();
        loop {
            let n = file.read(&mut self.buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&self.buf[..n]);
            self.limiter.throttle(n as u64, 1).await;
        }
        Ok(hasher.finalize())
    }
}
