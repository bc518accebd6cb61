//! Filesystem-backed object store: one file per object, named by hash and
//! sharded by the leading hex byte to keep directories small.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use common::fs::Hash;

use crate::{ObjectError, ObjectStore};

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: &Path) -> Result<Self, ObjectError> {
        tokio::fs::create_dir_all(root).await?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn object_path(&self, hash: &Hash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, data: Vec<u8>) -> Result<Hash, ObjectError> {
        let hash = Hash::of(&data);
        let path = self.object_path(&hash);
        if tokio::fs::try_exists(&path).await? {
            return Ok(hash);
        }
        let parent = path.parent().expect("object path has a shard parent");
        tokio::fs::create_dir_all(parent).await?;
        // Write-then-rename so a crashed put never leaves a partial object
        // under its final name.
        let tmp = parent.join(format!(".tmp-{hash}"));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(%hash, size = data.len(), "object stored");
        Ok(hash)
    }

    async fn fetch(&self, hash: &Hash) -> Result<Vec<u8>, ObjectError> {
        let path = self.object_path(hash);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectError::NotFound(*hash));
            }
            Err(err) => return Err(err.into()),
        };
        let actual = Hash::of(&data);
        if actual != *hash {
            warn!(expected = %hash, %actual, "corrupt object in store");
            return Err(ObjectError::Corrupt {
                expected: *hash,
                actual,
            });
        }
        Ok(data)
    }

    async fn contains(&self, hash: &Hash) -> Result<bool, ObjectError> {
        Ok(tokio::fs::try_exists(self.object_path(hash)).await?)
    }

    async fn list(&self) -> Result<Vec<Hash>, ObjectError> {
        let mut hashes = Vec::new();
        let mut shards = tokio::fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut objects = tokio::fs::read_dir(shard.path()).await?;
            while let Some(object) = objects.next_entry().await? {
                let name = object.file_name();
                let Some(name) = name.to_str() else { continue };
                match name.parse::<Hash>() {
                    Ok(hash) => hashes.push(hash),
                    // Temp files and strays are not objects.
                    Err(_) => continue,
                }
            }
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_fetch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        let data = b"object payload".to_vec();
        let hash = store.put(data.clone()).await.unwrap();
        assert!(store.contains(&hash).await.unwrap());
        assert_eq!(store.fetch(&hash).await.unwrap(), data);

        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![hash]);
    }

    #[tokio::test]
    async fn fetch_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let missing = Hash::of(b"never stored");
        assert!(!store.contains(&missing).await.unwrap());
        assert!(matches!(
            store.fetch(&missing).await,
            Err(ObjectError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn tampered_object_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let hash = store.put(b"pristine".to_vec()).await.unwrap();

        let path = store.object_path(&hash);
        tokio::fs::write(&path, b"tampered").await.unwrap();

        assert!(matches!(
            store.fetch(&hash).await,
            Err(ObjectError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let first = store.put(b"same bytes".to_vec()).await.unwrap();
        let second = store.put(b"same bytes".to_vec()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
