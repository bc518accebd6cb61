//! Access to target snapshots from the image builder.
//!
//! The builder itself is a black box; the controller only consumes its
//! `(image stream, leaf) -> snapshot` lookup. Freshness and versioning of
//! images are the builder's concern.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use common::fs::FileSystem;
use common::srpc::{Client, Conn, MethodHandler, Registry, SrpcError};

pub const SERVICE_NAME: &str = "ImageServer";

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image {stream}/{leaf} not found")]
    NotFound { stream: String, leaf: String },
    #[error("transport error: {0}")]
    Transport(#[from] SrpcError),
    #[error("malformed image snapshot: {0}")]
    Decode(#[from] bincode::Error),
}

/// Source of target snapshots.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn get_target_snapshot(
        &self,
        stream_name: &str,
        leaf_name: &str,
    ) -> Result<Arc<FileSystem>, ImageError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct GetImageRequest {
    stream: String,
    leaf: String,
}

/// Header record for an image reply; the encoded snapshot follows as a
/// blob when `found` is set.
#[derive(Debug, Serialize, Deserialize)]
struct GetImageResponse {
    found: bool,
}

/// Fetches target snapshots from an image server over SRPC.
#[derive(Debug, Clone)]
pub struct RpcImageFetcher {
    addr: String,
}

impl RpcImageFetcher {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl ImageFetcher for RpcImageFetcher {
    async fn get_target_snapshot(
        &self,
        stream_name: &str,
        leaf_name: &str,
    ) -> Result<Arc<FileSystem>, ImageError> {
        let mut client = Client::dial(&self.addr, "ImageServer.Get").await?;
        client
            .conn()
            .write_frame(&GetImageRequest {
                stream: stream_name.to_string(),
                leaf: leaf_name.to_string(),
            })
            .await?;
        let response: GetImageResponse = client.conn().read_frame().await?;
        if !response.found {
            return Err(ImageError::NotFound {
                stream: stream_name.to_string(),
                leaf: leaf_name.to_string(),
            });
        }
        let payload = client.conn().read_blob().await?;
        let file_system: FileSystem = bincode::deserialize(&payload)?;
        Ok(Arc::new(file_system))
    }
}

/// In-memory fetcher for tests and for serving a fixed image set.
#[derive(Debug, Default)]
pub struct FixedImageFetcher {
    images: RwLock<HashMap<(String, String), Arc<FileSystem>>>,
}

impl FixedImageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, stream: &str, leaf: &str, file_system: FileSystem) {
        self.images.write().insert(
            (stream.to_string(), leaf.to_string()),
            Arc::new(file_system),
        );
    }
}

#[async_trait]
impl ImageFetcher for FixedImageFetcher {
    async fn get_target_snapshot(
        &self,
        stream_name: &str,
        leaf_name: &str,
    ) -> Result<Arc<FileSystem>, ImageError> {
        self.images
            .read()
            .get(&(stream_name.to_string(), leaf_name.to_string()))
            .cloned()
            .ok_or_else(|| ImageError::NotFound {
                stream: stream_name.to_string(),
                leaf: leaf_name.to_string(),
            })
    }
}

/// Serve an [`ImageFetcher`] over the transport, for setups where the
/// builder publishes through this process.
pub struct ImageService {
    fetcher: Arc<dyn ImageFetcher>,
}

#[async_trait]
impl MethodHandler for ImageService {
    async fn serve(&self, conn: &mut Conn) -> anyhow::Result<()> {
        let request: GetImageRequest = conn.read_frame().await?;
        match self
            .fetcher
            .get_target_snapshot(&request.stream, &request.leaf)
            .await
        {
            Ok(file_system) => {
                conn.write_frame(&GetImageResponse { found: true }).await?;
                let payload = bincode::serialize(file_system.as_ref())?;
                conn.write_blob(&payload).await?;
            }
            Err(ImageError::NotFound { .. }) => {
                conn.write_frame(&GetImageResponse { found: false }).await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

pub fn register_service(registry: &mut Registry, fetcher: Arc<dyn ImageFetcher>) {
    registry.register(SERVICE_NAME, "Get", Arc::new(ImageService { fetcher }));
}
