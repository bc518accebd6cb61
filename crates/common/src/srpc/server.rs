//! Server side of the transport: the method registry and the accept loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch::Receiver as WatchReceiver;

use super::{Conn, SrpcError, CONNECT_STATUS, RPC_PATH};

/// Ceiling on one handshake line; anything longer is not a legitimate call.
const MAX_HANDSHAKE_LINE: u64 = 4096;

/// Ceiling on the number of handshake header lines consumed.
const MAX_HANDSHAKE_HEADERS: usize = 64;

/// A registered method. Handlers own their request/response framing on the
/// call-scoped connection and return no value to the transport.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn serve(&self, conn: &mut Conn) -> anyhow::Result<()>;
}

/// Process-wide map from `Service.Method` to handler. Populated once at
/// startup and read-only afterwards; there is no dynamic re-registration.
#[derive(Default)]
pub struct Registry {
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a handler under `ServiceName.MethodName`. Registering the same
    /// name twice replaces the earlier handler; startup code treats that as
    /// a bug and does not do it.
    pub fn register(&mut self, service: &str, method: &str, handler: Arc<dyn MethodHandler>) {
        self.methods.insert(format!("{service}.{method}"), handler);
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Accept loop dispatching upgraded connections to registered handlers.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Server {
    pub async fn bind(addr: SocketAddr, registry: Arc<Registry>) -> Result<Self, SrpcError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SrpcError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown signal fires. Each connection carries
    /// exactly one call and is handled on its own task.
    pub async fn serve(self, mut shutdown: WatchReceiver<()>) -> Result<(), SrpcError> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let registry = self.registry.clone();
                            tokio::spawn(async move {
                                if let Err(error) = handle_connection(registry, stream, peer).await {
                                    tracing::debug!(%peer, %error, "rpc connection ended with error");
                                }
                            });
                        }
                        // Transient accept failures (fd pressure, resets)
                        // must not take the listener down.
                        Err(error) => {
                            tracing::warn!(%error, "accept failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("rpc server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Outcome of parsing the handshake request.
enum Handshake {
    Call(String),
    Reject(&'static str),
}

async fn handle_connection(
    registry: Arc<Registry>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), SrpcError> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    let request_line = read_line(&mut reader).await?;
    // Consume headers up to the blank line; their content is ignored.
    for _ in 0..MAX_HANDSHAKE_HEADERS {
        let header = read_line(&mut reader).await?;
        if header.is_empty() {
            break;
        }
    }

    let handler = match parse_handshake(&request_line) {
        Handshake::Reject(status) => {
            write_status(&mut writer, status).await?;
            return Ok(());
        }
        Handshake::Call(name) => match registry.lookup(&name) {
            Some(handler) => {
                tracing::debug!(%peer, method = %name, "rpc call accepted");
                handler
            }
            None => {
                tracing::debug!(%peer, method = %name, "rpc call to unknown method");
                write_status(&mut writer, "404 Not Found").await?;
                return Ok(());
            }
        },
    };

    write_status(&mut writer, CONNECT_STATUS).await?;
    let mut conn = Conn::from_parts(reader, writer);
    if let Err(error) = handler.serve(&mut conn).await {
        tracing::debug!(%peer, %error, "rpc handler failed");
    }
    Ok(())
}

fn parse_handshake(request_line: &str) -> Handshake {
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => (method, path),
        _ => return Handshake::Reject("400 Bad Request"),
    };
    if method != "CONNECT" {
        return Handshake::Reject("405 Method Not Allowed");
    }
    let name = match path.strip_prefix(RPC_PATH) {
        Some(name) => name,
        None => return Handshake::Reject("404 Not Found"),
    };
    let mut pieces = name.split('.');
    match (pieces.next(), pieces.next(), pieces.next()) {
        (Some(service), Some(method), None) if !service.is_empty() && !method.is_empty() => {
            Handshake::Call(name.to_string())
        }
        _ => Handshake::Reject("400 Bad Request"),
    }
}

async fn read_line(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Result<String, SrpcError> {
    let mut line = String::new();
    let mut limited = AsyncReadExt::take(&mut *reader, MAX_HANDSHAKE_LINE);
    let read = limited.read_line(&mut line).await?;
    if read == 0 {
        return Err(SrpcError::UnexpectedEof);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn write_status(
    writer: &mut BufWriter<tokio::net::tcp::OwnedWriteHalf>,
    status: &str,
) -> Result<(), SrpcError> {
    writer.write_all(format!("HTTP/1.0 {status}\r\n\r\n").as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
