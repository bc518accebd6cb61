//! The subscriber's RPC surface: `Subscriber.Poll`, `Subscriber.Update`
//! and `Subscriber.SetConfiguration`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use common::filter::Filter;
use common::rateio::RateContext;
use common::srpc::{Conn, MethodHandler, Registry};
use common::update::{
    PollRequest, PollResponse, SetConfigurationRequest, SetConfigurationResponse, UpdateRequest,
    UpdateResponse,
};
use object_store::rpc::ObjectClient;
use object_store::LocalStore;

use crate::config::SharedSettings;
use crate::scanner::ScanOutcome;

pub const SERVICE_NAME: &str = "Subscriber";

/// Assumed link capacity the network-speed percentage scales against.
const NETWORK_CAPACITY_BYTES_PER_SECOND: u64 = 125_000_000;

/// Shared state behind the RPC surface: the newest snapshot with its
/// generation counter, the object cache, and the hot scan settings.
pub struct AgentState {
    root_dir: PathBuf,
    cache: LocalStore,
    remote: Option<ObjectClient>,
    settings: SharedSettings,
    latest: RwLock<Latest>,
}

#[derive(Default)]
struct Latest {
    generation: u64,
    outcome: Option<Arc<ScanOutcome>>,
}

impl AgentState {
    pub fn new(
        root_dir: PathBuf,
        cache: LocalStore,
        remote: Option<ObjectClient>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            root_dir,
            cache,
            remote,
            settings,
            latest: RwLock::new(Latest::default()),
        }
    }

    /// Install a freshly scanned snapshot, bumping the generation.
    pub fn install_snapshot(&self, outcome: Arc<ScanOutcome>) {
        let mut latest = self.latest.write();
        latest.generation += 1;
        latest.outcome = Some(outcome);
    }

    pub fn latest(&self) -> (u64, Option<Arc<ScanOutcome>>) {
        let latest = self.latest.read();
        (latest.generation, latest.outcome.clone())
    }

    pub fn root_dir(&self) -> &PathBuf {
        &self.root_dir
    }

    pub fn cache(&self) -> &LocalStore {
        &self.cache
    }
}

/// Register the subscriber service methods. Called once at startup; the
/// registry is read-only afterwards.
pub fn register_service(registry: &mut Registry, state: Arc<AgentState>) {
    registry.register(
        SERVICE_NAME,
        "Poll",
        Arc::new(PollMethod {
            state: state.clone(),
        }),
    );
    registry.register(
        SERVICE_NAME,
        "Update",
        Arc::new(UpdateMethod {
            state: state.clone(),
        }),
    );
    registry.register(
        SERVICE_NAME,
        "SetConfiguration",
        Arc::new(SetConfigurationMethod { state }),
    );
}

struct PollMethod {
    state: Arc<AgentState>,
}

#[async_trait]
impl MethodHandler for PollMethod {
    async fn serve(&self, conn: &mut Conn) -> anyhow::Result<()> {
        let request: PollRequest = conn.read_frame().await?;
        let (generation, outcome) = self.state.latest();

        let snapshot = match outcome {
            // Nothing new for this caller; skip the expensive transfer.
            Some(_) if request.have_generation == generation => None,
            other => other,
        };
        let response = PollResponse {
            generation,
            has_snapshot: snapshot.is_some(),
        };
        conn.write_frame(&response).await?;

        if let Some(outcome) = snapshot {
            let payload = bincode::serialize(&outcome.file_system)?;
            // Delivery shares the host's network budget; pace it before
            // the bytes go out.
            let network_percent = self.state.settings.read().network_speed_percent;
            let mut limiter =
                RateContext::new(NETWORK_CAPACITY_BYTES_PER_SECOND, 0, network_percent).limiter();
            limiter.throttle(payload.len() as u64, 1).await;
            conn.write_blob(&payload).await?;
        }
        Ok(())
    }
}

struct UpdateMethod {
    state: Arc<AgentState>,
}

#[async_trait]
impl MethodHandler for UpdateMethod {
    async fn serve(&self, conn: &mut Conn) -> anyhow::Result<()> {
        let payload = conn.read_blob().await?;
        let request: UpdateRequest = bincode::deserialize(&payload)?;
        info!(
            creations = request.inodes_to_make.len(),
            deletions = request.paths_to_delete.len(),
            triggers = request.triggers.len(),
            wait = request.wait,
            "applying pushed update"
        );

        let response = crate::apply::apply_update(
            &self.state.root_dir,
            &self.state.cache,
            self.state.remote.as_ref(),
            &request,
        )
        .await;
        if !response.success {
            warn!(error = %response.error, "update applied with errors");
        }
        // The reply is always written; a fire-and-forget caller just
        // closes without reading it.
        conn.write_frame(&response).await?;
        Ok(())
    }
}

struct SetConfigurationMethod {
    state: Arc<AgentState>,
}

#[async_trait]
impl MethodHandler for SetConfigurationMethod {
    async fn serve(&self, conn: &mut Conn) -> anyhow::Result<()> {
        let request: SetConfigurationRequest = conn.read_frame().await?;
        let filter = match Filter::new(&request.scan_exclusion_list) {
            Ok(filter) => filter,
            Err(err) => {
                warn!(error = %err, "rejected configuration update");
                conn.write_frame(&SetConfigurationResponse { success: false })
                    .await?;
                return Ok(());
            }
        };
        {
            let mut settings = self.state.settings.write();
            settings.filter = filter;
            settings.scan_speed_percent = request.scan_speed_percent;
            settings.network_speed_percent = request.network_speed_percent;
        }
        info!(
            scan_speed_percent = request.scan_speed_percent,
            network_speed_percent = request.network_speed_percent,
            exclusions = request.scan_exclusion_list.len(),
            "configuration updated"
        );
        conn.write_frame(&SetConfigurationResponse { success: true })
            .await?;
        Ok(())
    }
}
