//! Full reconciliation cycles over real sockets: a drifted subscriber is
//! polled, diffed, patched and converges on its target image; an in-sync
//! subscriber costs zero update RPCs.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;

use agent::config::ScanSettings;
use agent::rpc::AgentState;
use agent::scanner::scan;
use common::filter::Filter;
use common::fs::{compare_filesystems, FileSystem};
use common::rateio::RateLimiter;
use common::srpc::{Conn, MethodHandler, Registry, Server};
use common::triggers::Triggers;
use common::update::{PollRequest, PollResponse, UpdateResponse};
use controller::fleet::{Fleet, FleetConfig, SubSpec};
use controller::images::{FixedImageFetcher, RpcImageFetcher};
use object_store::rpc::register_service as register_object_service;
use object_store::{LocalStore, MemStore, ObjectStore};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("info")
        .try_init();
}

async fn start_server(registry: Registry) -> (String, watch::Sender<()>) {
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

fn set_mtime(path: &Path, secs: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

async fn scan_tree(root: &Path) -> FileSystem {
    let filter = Filter::new(Vec::<String>::new()).unwrap();
    let mut limiter = RateLimiter::unlimited();
    scan(root, &filter, &mut limiter)
        .await
        .unwrap()
        .file_system
}

fn test_settings() -> agent::config::SharedSettings {
    Arc::new(RwLock::new(ScanSettings {
        filter: Filter::new(Vec::<String>::new()).unwrap(),
        scan_speed_percent: 100,
        network_speed_percent: 100,
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drifted_subscriber_converges_on_target() {
    init_tracing();

    // Golden tree: what the image says the subscriber should look like.
    let golden = tempfile::tempdir().unwrap();
    std::fs::write(golden.path().join("motd"), b"hello world\n").unwrap();
    std::fs::create_dir(golden.path().join("ssh")).unwrap();
    std::fs::write(golden.path().join("ssh/sshd_config"), b"Port 22\n").unwrap();
    set_mtime(&golden.path().join("motd"), 1_600_000_000);
    set_mtime(&golden.path().join("ssh/sshd_config"), 1_600_000_000);

    // Subscriber tree: drifted motd, one stale file.
    let sub_root = tempfile::tempdir().unwrap();
    std::fs::write(sub_root.path().join("motd"), b"goodbye\n").unwrap();
    std::fs::create_dir(sub_root.path().join("ssh")).unwrap();
    std::fs::write(sub_root.path().join("ssh/sshd_config"), b"Port 22\n").unwrap();
    std::fs::write(sub_root.path().join("stale"), b"left over").unwrap();
    set_mtime(&sub_root.path().join("motd"), 1_500_000_000);
    set_mtime(&sub_root.path().join("ssh/sshd_config"), 1_600_000_000);

    let target = scan_tree(golden.path()).await;

    // Object server holding the image content.
    let object_store = Arc::new(MemStore::new());
    object_store.put(b"hello world\n".to_vec()).await.unwrap();
    object_store.put(b"Port 22\n".to_vec()).await.unwrap();
    let mut object_registry = Registry::new();
    register_object_service(&mut object_registry, object_store);
    let (object_addr, _object_shutdown) = start_server(object_registry).await;

    // Image server publishing the target snapshot.
    let images = FixedImageFetcher::new();
    images.insert("base", "v1", target.clone());
    let mut image_registry = Registry::new();
    controller::images::register_service(&mut image_registry, Arc::new(images));
    let (image_addr, _image_shutdown) = start_server(image_registry).await;

    // The agent, with one scanned snapshot installed.
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = LocalStore::open(cache_dir.path()).await.unwrap();
    let agent_state = Arc::new(AgentState::new(
        sub_root.path().to_path_buf(),
        cache,
        Some(object_store::rpc::ObjectClient::new(object_addr.clone())),
        test_settings(),
    ));
    let sub_scan = scan(
        sub_root.path(),
        &Filter::new(Vec::<String>::new()).unwrap(),
        &mut RateLimiter::unlimited(),
    )
    .await
    .unwrap();
    agent_state.install_snapshot(Arc::new(sub_scan));
    let mut agent_registry = Registry::new();
    agent::rpc::register_service(&mut agent_registry, agent_state);
    let (agent_addr, _agent_shutdown) = start_server(agent_registry).await;

    // The fleet: one subscriber, short pass interval, acked pushes.
    let mut fleet = Fleet::new(
        FleetConfig {
            min_interval: Duration::from_millis(50),
            fd_limit: 16,
            wait_for_ack: true,
            object_server_addr: Some(object_addr),
        },
        Arc::new(RpcImageFetcher::new(image_addr)),
        Arc::new(Triggers::default()),
    );
    fleet.add_sub(SubSpec {
        hostname: "sub-1".to_string(),
        address: agent_addr,
        image_stream: "base".to_string(),
        image_leaf: "v1".to_string(),
    });

    let (fleet_shutdown_tx, fleet_shutdown_rx) = watch::channel(());
    let (status_tx, mut status_rx) = watch::channel(Vec::new());
    tokio::spawn(async move {
        fleet.run(fleet_shutdown_rx, Some(status_tx)).await;
    });

    // Wait for the first completed cycle.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            status_rx.changed().await.unwrap();
            let reports = status_rx.borrow_and_update().clone();
            if let Some(report) = reports.first() {
                assert_eq!(report.error_count, 0, "cycle failed: {}", report.last_error);
                if report.cycles >= 1 {
                    break;
                }
            }
        }
    })
    .await
    .expect("fleet never completed a cycle");
    fleet_shutdown_tx.send(()).unwrap();

    // The push landed: drift corrected, stale path deleted.
    assert_eq!(
        std::fs::read(sub_root.path().join("motd")).unwrap(),
        b"hello world\n"
    );
    assert!(!sub_root.path().join("stale").exists());

    // A rescan of the subscriber now matches the target exactly.
    let converged = scan_tree(sub_root.path()).await;
    let mut trace = Vec::new();
    assert!(
        compare_filesystems(&converged, &target, Some(&mut trace)),
        "still drifted: {}",
        String::from_utf8_lossy(&trace)
    );
}

/// A subscriber service that serves a fixed snapshot and counts update
/// pushes.
struct FixedPoll {
    snapshot: Arc<FileSystem>,
}

#[async_trait]
impl MethodHandler for FixedPoll {
    async fn serve(&self, conn: &mut Conn) -> anyhow::Result<()> {
        let request: PollRequest = conn.read_frame().await?;
        let send = request.have_generation != 1;
        conn.write_frame(&PollResponse {
            generation: 1,
            has_snapshot: send,
        })
        .await?;
        if send {
            conn.write_blob(&bincode::serialize(self.snapshot.as_ref())?)
                .await?;
        }
        Ok(())
    }
}

struct CountingUpdate {
    pushes: Arc<AtomicUsize>,
}

#[async_trait]
impl MethodHandler for CountingUpdate {
    async fn serve(&self, conn: &mut Conn) -> anyhow::Result<()> {
        let _payload = conn.read_blob().await?;
        self.pushes.fetch_add(1, Ordering::SeqCst);
        conn.write_frame(&UpdateResponse::ok()).await?;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_sync_subscriber_costs_zero_update_rpcs() {
    init_tracing();

    let golden = tempfile::tempdir().unwrap();
    std::fs::write(golden.path().join("motd"), b"steady state\n").unwrap();
    set_mtime(&golden.path().join("motd"), 1_600_000_000);
    let target = scan_tree(golden.path()).await;

    let pushes = Arc::new(AtomicUsize::new(0));
    let mut sub_registry = Registry::new();
    sub_registry.register(
        "Subscriber",
        "Poll",
        Arc::new(FixedPoll {
            snapshot: Arc::new(target.clone()),
        }),
    );
    sub_registry.register(
        "Subscriber",
        "Update",
        Arc::new(CountingUpdate {
            pushes: pushes.clone(),
        }),
    );
    let (sub_addr, _sub_shutdown) = start_server(sub_registry).await;

    let images = FixedImageFetcher::new();
    images.insert("base", "v1", target);

    let mut fleet = Fleet::new(
        FleetConfig {
            min_interval: Duration::from_millis(20),
            fd_limit: 16,
            wait_for_ack: true,
            object_server_addr: None,
        },
        Arc::new(images),
        Arc::new(Triggers::default()),
    );
    fleet.add_sub(SubSpec {
        hostname: "sub-1".to_string(),
        address: sub_addr,
        image_stream: "base".to_string(),
        image_leaf: "v1".to_string(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let (status_tx, mut status_rx) = watch::channel(Vec::new());
    tokio::spawn(async move {
        fleet.run(shutdown_rx, Some(status_tx)).await;
    });

    // Let several cycles complete: the first compares equal, later ones
    // take the unchanged-generation fast path.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            status_rx.changed().await.unwrap();
            let reports = status_rx.borrow_and_update().clone();
            if let Some(report) = reports.first() {
                assert_eq!(report.error_count, 0, "cycle failed: {}", report.last_error);
                if report.cycles >= 3 {
                    break;
                }
            }
        }
    })
    .await
    .expect("fleet never completed three cycles");
    shutdown_tx.send(()).unwrap();

    assert_eq!(pushes.load(Ordering::SeqCst), 0);
}
