//! The call-scoped connection: a raw byte stream carrying length-prefixed
//! bincode records and, for bulk data, u64-prefixed blobs.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::{SrpcError, MAX_BLOB_SIZE, MAX_FRAME_SIZE};

/// One upgraded connection, dedicated to a single call for its lifetime.
/// Dropping it closes the stream; the initiator does so when the call
/// completes, on both success and failure paths.
#[derive(Debug)]
pub struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Conn {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
        }
    }

    pub(crate) fn from_parts(
        reader: BufReader<OwnedReadHalf>,
        writer: BufWriter<OwnedWriteHalf>,
    ) -> Self {
        Self { reader, writer }
    }

    /// Write one record and flush it. Returns the encoded size so callers
    /// can feed their network rate limiter.
    pub async fn write_frame<T: Serialize>(&mut self, message: &T) -> Result<usize, SrpcError> {
        let payload = bincode::serialize(message).map_err(SrpcError::Encode)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(SrpcError::FrameTooLarge {
                size: payload.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        self.writer.write_u32_le(payload.len() as u32).await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(payload.len() + 4)
    }

    /// Read one record.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<T, SrpcError> {
        let len = self.reader.read_u32_le().await.map_err(eof_as_closed)? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(SrpcError::FrameTooLarge {
                size: len,
                limit: MAX_FRAME_SIZE,
            });
        }
        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(eof_as_closed)?;
        bincode::deserialize(&payload).map_err(SrpcError::Decode)
    }

    /// Write bulk bytes: a u64 length then the raw data.
    pub async fn write_blob(&mut self, data: &[u8]) -> Result<(), SrpcError> {
        self.writer.write_u64_le(data.len() as u64).await?;
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read bulk bytes written by [`write_blob`](Self::write_blob).
    pub async fn read_blob(&mut self) -> Result<Vec<u8>, SrpcError> {
        let len = self.reader.read_u64_le().await.map_err(eof_as_closed)?;
        if len > MAX_BLOB_SIZE {
            return Err(SrpcError::BlobTooLarge {
                size: len,
                limit: MAX_BLOB_SIZE,
            });
        }
        let mut data = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut data)
            .await
            .map_err(eof_as_closed)?;
        Ok(data)
    }
}

fn eof_as_closed(err: std::io::Error) -> SrpcError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        SrpcError::UnexpectedEof
    } else {
        SrpcError::Io(err)
    }
}
