//! Transport-level tests: handshake status codes, registry dispatch and
//! framed request/response round trips over real sockets.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use common::srpc::{self, Client, Conn, MethodHandler, Registry, Server};

#[derive(Debug, Serialize, Deserialize)]
struct EchoRequest {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EchoReply {
    text: String,
}

struct EchoMethod;

#[async_trait]
impl MethodHandler for EchoMethod {
    async fn serve(&self, conn: &mut Conn) -> Result<()> {
        let request: EchoRequest = conn.read_frame().await?;
        conn.write_frame(&EchoReply { text: request.text }).await?;
        Ok(())
    }
}

async fn start_server() -> (String, watch::Sender<()>) {
    let mut registry = Registry::new();
    registry.register("Echo", "Say", Arc::new(EchoMethod));
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::new(registry))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        let _ = server.serve(shutdown_rx).await;
    });
    (addr, shutdown_tx)
}

#[tokio::test]
async fn round_trip_call() {
    let (addr, _shutdown) = start_server().await;
    let reply: EchoReply = srpc::call(
        &addr,
        "Echo.Say",
        &EchoRequest {
            text: "hello".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(reply.text, "hello");
}

#[tokio::test]
async fn unknown_method_is_not_found() {
    let (addr, _shutdown) = start_server().await;
    let err = Client::dial(&addr, "Echo.Missing").await.unwrap_err();
    match err {
        srpc::SrpcError::Refused(reason) => assert!(reason.starts_with("404"), "{reason}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unknown_service_is_not_found() {
    let (addr, _shutdown) = start_server().await;
    let err = Client::dial(&addr, "Nothing.Say").await.unwrap_err();
    match err {
        srpc::SrpcError::Refused(reason) => assert!(reason.starts_with("404"), "{reason}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn malformed_name_is_bad_request() {
    let (addr, _shutdown) = start_server().await;
    let err = Client::dial(&addr, "NoDotHere").await.unwrap_err();
    match err {
        srpc::SrpcError::Refused(reason) => assert!(reason.starts_with("400"), "{reason}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn non_connect_is_method_not_allowed() {
    let (addr, _shutdown) = start_server().await;
    let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET /_SRPC_/Echo.Say HTTP/1.0\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.0 405"), "{response}");
}

#[tokio::test]
async fn blob_round_trip() {
    struct BlobMethod;

    #[async_trait]
    impl MethodHandler for BlobMethod {
        async fn serve(&self, conn: &mut Conn) -> Result<()> {
            let data = conn.read_blob().await?;
            conn.write_blob(&data).await?;
            Ok(())
        }
    }

    let mut registry = Registry::new();
    registry.register("Blob", "Bounce", Arc::new(BlobMethod));
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::new(registry))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        let _ = server.serve(shutdown_rx).await;
    });

    let mut client = Client::dial(&addr, "Blob.Bounce").await.unwrap();
    let payload: Vec<u8> = (0..2_000_000u32).map(|i| i as u8).collect();
    client.conn().write_blob(&payload).await.unwrap();
    let bounced = client.conn().read_blob().await.unwrap();
    assert_eq!(bounced, payload);
}
