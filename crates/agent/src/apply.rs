//! Applies a pushed update to the managed tree.
//!
//! Content objects are fetched into the local cache and verified before any
//! dependent inode creation runs; a regular file whose object cannot be
//! produced is rejected, never approximated. Item failures are collected
//! and reported, they do not abort the rest of the patch: the next
//! rescan-and-rediff picks up whatever is still off.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use common::fs::{Hash, Inode, RegularInode, MODE_PERM_MASK, S_IFLNK};
use common::update::{InodeSpec, UpdateRequest, UpdateResponse};
use object_store::rpc::ObjectClient;
use object_store::{LocalStore, ObjectStore};

/// Apply `request` under `root`. Missing content is pulled through
/// `remote` into `cache` first; with no remote configured, only already
/// cached objects can be materialized.
pub async fn apply_update(
    root: &Path,
    cache: &LocalStore,
    remote: Option<&ObjectClient>,
    request: &UpdateRequest,
) -> UpdateResponse {
    let mut errors: Vec<String> = Vec::new();

    stage_objects(cache, remote, request, &mut errors).await;

    for path in &request.paths_to_delete {
        if let Err(err) = delete_path(root, path).await {
            warn!(%path, error = %err, "delete failed");
            errors.push(format!("delete {path}: {err}"));
        }
    }

    for op in &request.inodes_to_make {
        let result = match &op.spec {
            InodeSpec::Directory { mode, uid, gid } => {
                make_directory(root, &op.path, *mode, *uid, *gid).await
            }
            InodeSpec::Regular(inode) => make_regular(root, &op.path, inode, cache).await,
            InodeSpec::Other(inode) => make_other(root, &op.path, inode).await,
        };
        if let Err(err) = result {
            warn!(path = %op.path, error = %err, "inode creation failed");
            errors.push(format!("create {}: {err}", op.path));
        }
    }

    for trigger in &request.triggers {
        // Corrective actions (service restarts) are the operator's glue;
        // the agent surfaces what fired.
        if trigger.high_impact {
            warn!(trigger = %trigger.name, service = %trigger.service, "high-impact trigger fired");
        } else {
            info!(trigger = %trigger.name, service = %trigger.service, "trigger fired");
        }
    }

    if errors.is_empty() {
        UpdateResponse::ok()
    } else {
        UpdateResponse::failed(errors.join("; "))
    }
}

/// Fetch every object the patch depends on into the cache. Runs before any
/// creation so a half-fetched patch never materializes files out of order.
async fn stage_objects(
    cache: &LocalStore,
    remote: Option<&ObjectClient>,
    request: &UpdateRequest,
    errors: &mut Vec<String>,
) {
    for op in &request.inodes_to_make {
        let InodeSpec::Regular(inode) = &op.spec else {
            continue;
        };
        match cache.contains(&inode.hash).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => {
                errors.push(format!("cache check {}: {err}", inode.hash));
                continue;
            }
        }
        let Some(remote) = remote else {
            // No remote configured; the creation will be rejected below.
            continue;
        };
        match fetch_object(cache, remote, &inode.hash).await {
            Ok(()) => {}
            Err(err) => {
                warn!(hash = %inode.hash, error = %err, "object fetch failed");
                errors.push(format!("fetch {}: {err}", inode.hash));
            }
        }
    }
}

async fn fetch_object(
    cache: &LocalStore,
    remote: &ObjectClient,
    hash: &Hash,
) -> anyhow::Result<()> {
    // The client verifies the transfer; the cache re-derives the hash on
    // put, so a mismatch can't land under the requested name.
    let data = remote.fetch(hash).await?;
    let stored = cache.put(data).await?;
    if stored != *hash {
        anyhow::bail!("fetched object hashes to {stored}, wanted {hash}");
    }
    Ok(())
}

fn fs_path(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

async fn delete_path(root: &Path, path: &str) -> std::io::Result<()> {
    let target = fs_path(root, path);
    let meta = match tokio::fs::symlink_metadata(&target).await {
        Ok(meta) => meta,
        // Already gone is the desired end state.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(&target).await
    } else {
        tokio::fs::remove_file(&target).await
    }
}

async fn make_directory(
    root: &Path,
    path: &str,
    mode: u32,
    uid: u32,
    gid: u32,
) -> anyhow::Result<()> {
    let target = fs_path(root, path);
    match tokio::fs::symlink_metadata(&target).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            // A non-directory in the way gets replaced.
            tokio::fs::remove_file(&target).await?;
            tokio::fs::create_dir(&target).await?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir(&target).await?;
        }
        Err(err) => return Err(err.into()),
    }
    set_ownership_and_mode(&target, uid, gid, mode)?;
    Ok(())
}

async fn make_regular(
    root: &Path,
    path: &str,
    inode: &RegularInode,
    cache: &LocalStore,
) -> anyhow::Result<()> {
    // Hard precondition: the content object must already be cached. A file
    // must never be created from anything but its declared content.
    let data = match cache.fetch(&inode.hash).await {
        Ok(data) => data,
        Err(object_store::ObjectError::NotFound(hash)) => {
            anyhow::bail!("content object {hash} not in local cache");
        }
        Err(err) => return Err(err.into()),
    };

    let target = fs_path(root, path);
    let parent = target
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path {path} has no parent"))?;
    let name = target
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path {path} has no file name"))?;

    if let Ok(meta) = tokio::fs::symlink_metadata(&target).await {
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&target).await?;
        }
    }

    // Write to a temp name, fix up metadata, then rename into place so
    // readers never observe partial content.
    let tmp = parent.join(format!(".fleetsync-tmp-{}", name.to_string_lossy()));
    tokio::fs::write(&tmp, &data).await?;
    set_ownership_and_mode(&tmp, inode.uid, inode.gid, inode.mode)?;
    let mtime = SystemTime::UNIX_EPOCH
        + Duration::new(
            inode.mtime_seconds.max(0) as u64,
            inode.mtime_nanoseconds,
        );
    let file = std::fs::File::options().write(true).open(&tmp)?;
    file.set_modified(mtime)?;
    drop(file);
    tokio::fs::rename(&tmp, &target).await?;
    Ok(())
}

async fn make_other(root: &Path, path: &str, inode: &Inode) -> anyhow::Result<()> {
    let target = fs_path(root, path);
    delete_path(root, path).await?;

    if inode.mode & common::fs::S_IFMT == S_IFLNK {
        tokio::fs::symlink(&inode.symlink_target, &target).await?;
        std::os::unix::fs::lchown(&target, Some(inode.uid), Some(inode.gid))?;
        return Ok(());
    }

    // Devices, fifos and sockets go through mknod.
    let c_path = CString::new(target.as_os_str().as_bytes())
        .map_err(|_| anyhow::anyhow!("path contains NUL"))?;
    let rc = unsafe { libc::mknod(c_path.as_ptr(), inode.mode, inode.rdev as libc::dev_t) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    set_ownership_and_mode(&target, inode.uid, inode.gid, inode.mode)?;
    Ok(())
}

fn set_ownership_and_mode(path: &Path, uid: u32, gid: u32, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & MODE_PERM_MASK))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    use common::fs::{S_IFREG, S_IFLNK};
    use common::update::InodeToMake;

    fn current_ids(path: &Path) -> (u32, u32) {
        let meta = std::fs::metadata(path).unwrap();
        (meta.uid(), meta.gid())
    }

    fn regular_spec(data: &[u8], mode: u32, uid: u32, gid: u32) -> RegularInode {
        RegularInode {
            mode: S_IFREG | mode,
            uid,
            gid,
            mtime_seconds: 1_600_000_000,
            mtime_nanoseconds: 0,
            size: data.len() as u64,
            hash: Hash::of(data),
        }
    }

    #[tokio::test]
    async fn creates_regular_file_from_cache() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = LocalStore::open(cache_dir.path()).await.unwrap();

        let data = b"managed contents\n";
        cache.put(data.to_vec()).await.unwrap();
        let (uid, gid) = current_ids(root.path());

        // Parent directory op first, then the file, as the generator
        // emits them.
        let request = UpdateRequest {
            inodes_to_make: vec![
                InodeToMake {
                    path: "/etc".to_string(),
                    spec: InodeSpec::Directory {
                        mode: 0o40755,
                        uid,
                        gid,
                    },
                },
                InodeToMake {
                    path: "/etc/motd".to_string(),
                    spec: InodeSpec::Regular(regular_spec(data, 0o644, uid, gid)),
                },
            ],
            ..UpdateRequest::default()
        };

        let response = apply_update(root.path(), &cache, None, &request).await;
        assert!(response.success, "error: {}", response.error);

        let target = root.path().join("etc/motd");
        assert_eq!(std::fs::read(&target).unwrap(), data);
        let meta = std::fs::metadata(&target).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o644);
        assert_eq!(meta.mtime(), 1_600_000_000);
    }

    #[tokio::test]
    async fn missing_object_rejects_creation() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = LocalStore::open(cache_dir.path()).await.unwrap();
        let (uid, gid) = current_ids(root.path());

        let cached = b"have this one";
        cache.put(cached.to_vec()).await.unwrap();

        let request = UpdateRequest {
            inodes_to_make: vec![
                InodeToMake {
                    path: "/orphan".to_string(),
                    spec: InodeSpec::Regular(regular_spec(b"never fetched", 0o644, uid, gid)),
                },
                InodeToMake {
                    path: "/present".to_string(),
                    spec: InodeSpec::Regular(regular_spec(cached, 0o644, uid, gid)),
                },
            ],
            ..UpdateRequest::default()
        };

        let response = apply_update(root.path(), &cache, None, &request).await;
        // The unfetchable creation is rejected, not silently skipped; the
        // other item still lands.
        assert!(!response.success);
        assert!(response.error.contains("/orphan"), "error: {}", response.error);
        assert!(!root.path().join("orphan").exists());
        assert_eq!(std::fs::read(root.path().join("present")).unwrap(), cached);
    }

    #[tokio::test]
    async fn deletions_remove_files_and_trees() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = LocalStore::open(cache_dir.path()).await.unwrap();

        std::fs::write(root.path().join("stale"), b"x").unwrap();
        std::fs::create_dir(root.path().join("staledir")).unwrap();
        std::fs::write(root.path().join("staledir/inner"), b"y").unwrap();

        let request = UpdateRequest {
            paths_to_delete: vec![
                "/stale".to_string(),
                "/staledir".to_string(),
                "/never-existed".to_string(),
            ],
            ..UpdateRequest::default()
        };
        let response = apply_update(root.path(), &cache, None, &request).await;
        assert!(response.success, "error: {}", response.error);
        assert!(!root.path().join("stale").exists());
        assert!(!root.path().join("staledir").exists());
    }

    #[tokio::test]
    async fn creates_symlink() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = LocalStore::open(cache_dir.path()).await.unwrap();
        let (uid, gid) = current_ids(root.path());

        let request = UpdateRequest {
            inodes_to_make: vec![InodeToMake {
                path: "/localtime".to_string(),
                spec: InodeSpec::Other(Inode {
                    mode: S_IFLNK | 0o777,
                    uid,
                    gid,
                    mtime_seconds: 0,
                    size: 0,
                    rdev: 0,
                    symlink_target: "/usr/share/zoneinfo/UTC".to_string(),
                }),
            }],
            ..UpdateRequest::default()
        };
        let response = apply_update(root.path(), &cache, None, &request).await;
        assert!(response.success, "error: {}", response.error);
        let target = std::fs::read_link(root.path().join("localtime")).unwrap();
        assert_eq!(target.to_str().unwrap(), "/usr/share/zoneinfo/UTC");
    }

    #[tokio::test]
    async fn noop_patch_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = LocalStore::open(cache_dir.path()).await.unwrap();
        let response = apply_update(root.path(), &cache, None, &UpdateRequest::default()).await;
        assert!(response.success);
        assert!(response.error.is_empty());
    }
}
