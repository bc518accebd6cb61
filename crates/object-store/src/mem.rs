//! In-memory store for tests and ephemeral setups.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use common::fs::Hash;

use crate::{ObjectError, ObjectStore};

#[derive(Debug, Clone, Default)]
pub struct MemStore {
    objects: Arc<RwLock<HashMap<Hash, Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn put(&self, data: Vec<u8>) -> Result<Hash, ObjectError> {
        let hash = Hash::of(&data);
        self.objects.write().insert(hash, data);
        Ok(hash)
    }

    async fn fetch(&self, hash: &Hash) -> Result<Vec<u8>, ObjectError> {
        self.objects
            .read()
            .get(hash)
            .cloned()
            .ok_or(ObjectError::NotFound(*hash))
    }

    async fn contains(&self, hash: &Hash) -> Result<bool, ObjectError> {
        Ok(self.objects.read().contains_key(hash))
    }

    async fn list(&self) -> Result<Vec<Hash>, ObjectError> {
        Ok(self.objects.read().keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let store = MemStore::new();
        let hash = store.put(b"in memory".to_vec()).await.unwrap();
        assert!(store.contains(&hash).await.unwrap());
        assert_eq!(store.fetch(&hash).await.unwrap(), b"in memory");
        assert!(matches!(
            store.fetch(&Hash::of(b"other")).await,
            Err(ObjectError::NotFound(_))
        ));
    }
}
