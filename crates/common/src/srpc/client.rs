//! Client side of the transport: dial, upgrade, and own the call stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

use super::{Conn, SrpcError, CONNECT_STATUS, RPC_PATH};

/// Ceiling on the server's status line.
const MAX_STATUS_LINE: u64 = 4096;

/// One in-flight call. The client owns the upgraded connection; dropping it
/// closes the stream, which is how the initiator releases a call on every
/// path.
#[derive(Debug)]
pub struct Client {
    conn: Conn,
}

impl Client {
    /// Connect to `addr` and upgrade the connection for `Service.Method`.
    pub async fn dial(addr: &str, method: &str) -> Result<Self, SrpcError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        writer
            .write_all(format!("CONNECT {RPC_PATH}{method} HTTP/1.0\r\n\r\n").as_bytes())
            .await?;
        writer.flush().await?;

        let mut status = String::new();
        let mut limited = AsyncReadExt::take(&mut reader, MAX_STATUS_LINE);
        if limited.read_line(&mut status).await? == 0 {
            return Err(SrpcError::UnexpectedEof);
        }
        let status = status.trim_end_matches(['\r', '\n']);
        let expected = format!("HTTP/1.0 {CONNECT_STATUS}");
        if status != expected {
            return match status.strip_prefix("HTTP/1.0 ") {
                Some(reason) => Err(SrpcError::Refused(reason.to_string())),
                None => Err(SrpcError::BadStatusLine(status.to_string())),
            };
        }
        // Skip the blank line terminating the response head.
        let mut blank = String::new();
        let mut limited = AsyncReadExt::take(&mut reader, MAX_STATUS_LINE);
        limited.read_line(&mut blank).await?;

        Ok(Self {
            conn: Conn::from_parts(reader, writer),
        })
    }

    pub fn conn(&mut self) -> &mut Conn {
        &mut self.conn
    }

    /// Request/response convenience over the upgraded stream.
    pub async fn roundtrip<Req, Resp>(&mut self, request: &Req) -> Result<Resp, SrpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.conn.write_frame(request).await?;
        self.conn.read_frame().await
    }
}

/// Dial, perform one request/response call, and close the connection.
pub async fn call<Req, Resp>(addr: &str, method: &str, request: &Req) -> Result<Resp, SrpcError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let mut client = Client::dial(addr, method).await?;
    client.roundtrip(request).await
}
