//! Content-addressed object storage for fleetsync.
//!
//! Objects are immutable byte blobs identified by their BLAKE3 hash. The
//! subscriber's local object cache and the central object server both sit
//! behind the same [`ObjectStore`] trait; [`rpc`] exposes a store over the
//! SRPC transport and consumes one remotely.

mod local;
mod mem;
pub mod rpc;

pub use local::LocalStore;
pub use mem::MemStore;

use async_trait::async_trait;

use common::fs::Hash;

#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("object {0} not found")]
    NotFound(Hash),
    #[error("object {expected} is corrupt: content hashes to {actual}")]
    Corrupt { expected: Hash, actual: Hash },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(#[from] common::srpc::SrpcError),
    #[error("object server refused: {0}")]
    Remote(String),
}

/// A content-addressed object store. `put` derives the hash from the data;
/// `fetch` verifies it before returning, so a corrupt object can never
/// silently back a file.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object, returning its content hash.
    async fn put(&self, data: Vec<u8>) -> Result<Hash, ObjectError>;

    /// Retrieve an object's bytes. Fails with [`ObjectError::NotFound`]
    /// for unknown hashes and [`ObjectError::Corrupt`] when stored bytes
    /// no longer match the hash.
    async fn fetch(&self, hash: &Hash) -> Result<Vec<u8>, ObjectError>;

    /// Whether the store currently holds an object.
    async fn contains(&self, hash: &Hash) -> Result<bool, ObjectError>;

    /// All hashes held, in unspecified order.
    async fn list(&self) -> Result<Vec<Hash>, ObjectError>;
}
