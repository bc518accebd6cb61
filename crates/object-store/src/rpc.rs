//! SRPC access to an object store.
//!
//! The service side adapts any [`ObjectStore`] to the transport; the client
//! side implements fetch/put/check against a remote store. Fetched bytes
//! are re-hashed by the caller's store on `put`, so a corrupted transfer
//! cannot enter a cache under the wrong name.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::fs::Hash;
use common::srpc::{Client, Conn, MethodHandler, Registry};

use crate::{ObjectError, ObjectStore};

pub const SERVICE_NAME: &str = "ObjectStore";

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchRequest {
    pub hash: Hash,
}

/// Header record for a fetch reply; the object bytes follow as a blob when
/// `found` is set.
#[derive(Debug, Serialize, Deserialize)]
pub struct FetchResponse {
    pub found: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutResponse {
    pub hash: Hash,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckRequest {
    pub hashes: Vec<Hash>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub missing: Vec<Hash>,
}

/// Register the object service methods on a registry.
pub fn register_service(registry: &mut Registry, store: Arc<dyn ObjectStore>) {
    registry.register(
        SERVICE_NAME,
        "Fetch",
        Arc::new(FetchMethod {
            store: store.clone(),
        }),
    );
    registry.register(
        SERVICE_NAME,
        "Put",
        Arc::new(PutMethod {
            store: store.clone(),
        }),
    );
    registry.register(SERVICE_NAME, "Check", Arc::new(CheckMethod { store }));
}

struct FetchMethod {
    store: Arc<dyn ObjectStore>,
}

#[async_trait]
impl MethodHandler for FetchMethod {
    async fn serve(&self, conn: &mut Conn) -> anyhow::Result<()> {
        let request: FetchRequest = conn.read_frame().await?;
        match self.store.fetch(&request.hash).await {
            Ok(data) => {
                conn.write_frame(&FetchResponse { found: true }).await?;
                conn.write_blob(&data).await?;
            }
            Err(ObjectError::NotFound(hash)) => {
                debug!(%hash, "fetch for unknown object");
                conn.write_frame(&FetchResponse { found: false }).await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

struct PutMethod {
    store: Arc<dyn ObjectStore>,
}

#[async_trait]
impl MethodHandler for PutMethod {
    async fn serve(&self, conn: &mut Conn) -> anyhow::Result<()> {
        let data = conn.read_blob().await?;
        match self.store.put(data).await {
            Ok(hash) => {
                conn.write_frame(&PutResponse {
                    hash,
                    error: String::new(),
                })
                .await?;
            }
            Err(err) => {
                conn.write_frame(&PutResponse {
                    hash: Hash::from_bytes([0; 32]),
                    error: err.to_string(),
                })
                .await?;
            }
        }
        Ok(())
    }
}

struct CheckMethod {
    store: Arc<dyn ObjectStore>,
}

#[async_trait]
impl MethodHandler for CheckMethod {
    async fn serve(&self, conn: &mut Conn) -> anyhow::Result<()> {
        let request: CheckRequest = conn.read_frame().await?;
        let mut missing = Vec::new();
        for hash in request.hashes {
            if !self.store.contains(&hash).await? {
                missing.push(hash);
            }
        }
        conn.write_frame(&CheckResponse { missing }).await?;
        Ok(())
    }
}

/// Client for a remote object store.
#[derive(Debug, Clone)]
pub struct ObjectClient {
    addr: String,
}

impl ObjectClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Pull one object by hash.
    pub async fn fetch(&self, hash: &Hash) -> Result<Vec<u8>, ObjectError> {
        let mut client = Client::dial(&self.addr, "ObjectStore.Fetch").await?;
        client
            .conn()
            .write_frame(&FetchRequest { hash: *hash })
            .await?;
        let response: FetchResponse = client.conn().read_frame().await?;
        if !response.found {
            return Err(ObjectError::NotFound(*hash));
        }
        let data = client.conn().read_blob().await?;
        let actual = Hash::of(&data);
        if actual != *hash {
            return Err(ObjectError::Corrupt {
                expected: *hash,
                actual,
            });
        }
        Ok(data)
    }

    /// Push one object, returning the hash the server derived.
    pub async fn put(&self, data: &[u8]) -> Result<Hash, ObjectError> {
        let mut client = Client::dial(&self.addr, "ObjectStore.Put").await?;
        client.conn().write_blob(data).await?;
        let response: PutResponse = client.conn().read_frame().await?;
        if !response.error.is_empty() {
            return Err(ObjectError::Remote(response.error));
        }
        Ok(response.hash)
    }

    /// Which of `hashes` the remote store does not hold.
    pub async fn check(&self, hashes: Vec<Hash>) -> Result<Vec<Hash>, ObjectError> {
        let mut client = Client::dial(&self.addr, "ObjectStore.Check").await?;
        client.conn().write_frame(&CheckRequest { hashes }).await?;
        let response: CheckResponse = client.conn().read_frame().await?;
        Ok(response.missing)
    }
}
