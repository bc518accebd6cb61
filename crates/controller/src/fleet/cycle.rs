//! One reconciliation cycle for one subscriber:
//! poll, compare, generate, push, optionally await the ack.

use std::sync::Arc;

use tracing::{debug, info};

use common::fs::{compare_filesystems, FileSystem};
use common::srpc::{Client, SrpcError};
use common::triggers::Triggers;
use common::update::{PollRequest, PollResponse, UpdateResponse};
use object_store::rpc::ObjectClient;
use object_store::ObjectError;

use super::sub::StatusCell;
use super::SubStatus;

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("poll failed: {0}")]
    Poll(SrpcError),
    #[error("malformed snapshot from subscriber: {0}")]
    Decode(#[from] bincode::Error),
    #[error("{0} required objects missing from the object store")]
    MissingObjects(usize),
    #[error("object store check failed: {0}")]
    ObjectCheck(#[from] ObjectError),
    #[error("push failed: {0}")]
    Push(SrpcError),
    #[error("subscriber rejected update: {0}")]
    UpdateRejected(String),
}

/// How a completed cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The subscriber's generation was unchanged (or it has not produced a
    /// snapshot yet); nothing was compared.
    Unchanged,
    /// Compared equal, or the name-keyed diff came up empty: no push.
    InSync,
    Pushed {
        creations: usize,
        deletions: usize,
        acked: bool,
    },
}

/// Everything a cycle task needs, captured before it is spawned so the
/// fleet structures are never shared with in-flight work.
pub struct CycleContext {
    pub hostname: String,
    pub address: String,
    pub target: Arc<FileSystem>,
    pub have_generation: u64,
    pub last_snapshot: Option<Arc<FileSystem>>,
    pub triggers: Arc<Triggers>,
    /// Checked before a push so a patch never goes out with unfetchable
    /// content. `None` skips the check (trusted store).
    pub object_client: Option<ObjectClient>,
    pub wait_for_ack: bool,
    pub status: StatusCell,
}

/// Result delivered back to the fleet loop through its queue.
pub struct CycleResult {
    pub hostname: String,
    pub generation: u64,
    pub snapshot: Option<Arc<FileSystem>>,
    pub outcome: Result<CycleOutcome, CycleError>,
}

pub async fn run_cycle(ctx: CycleContext) -> CycleResult {
    let mut generation = ctx.have_generation;
    let mut snapshot = ctx.last_snapshot.clone();
    let outcome = run_cycle_inner(&ctx, &mut generation, &mut snapshot).await;
    CycleResult {
        hostname: ctx.hostname,
        generation,
        snapshot,
        outcome,
    }
}

async fn run_cycle_inner(
    ctx: &CycleContext,
    generation: &mut u64,
    snapshot: &mut Option<Arc<FileSystem>>,
) -> Result<CycleOutcome, CycleError> {
    ctx.status.set(SubStatus::Polling);
    let mut client = Client::dial(&ctx.address, "Subscriber.Poll")
        .await
        .map_err(CycleError::Poll)?;
    client
        .conn()
        .write_frame(&PollRequest {
            have_generation: *generation,
        })
        .await
        .map_err(CycleError::Poll)?;
    let response: PollResponse = client.conn().read_frame().await.map_err(CycleError::Poll)?;

    if response.has_snapshot {
        let payload = client.conn().read_blob().await.map_err(CycleError::Poll)?;
        let file_system: FileSystem = bincode::deserialize(&payload)?;
        *snapshot = Some(Arc::new(file_system));
    } else if response.generation == *generation && snapshot.is_some() {
        // Nothing changed on the subscriber since the last cycle.
        debug!(sub = %ctx.hostname, generation = *generation, "subscriber unchanged");
        *generation = response.generation;
        return Ok(CycleOutcome::Unchanged);
    }
    *generation = response.generation;
    drop(client);

    let Some(current) = snapshot.as_ref() else {
        // The subscriber's scanner has not delivered a snapshot yet.
        debug!(sub = %ctx.hostname, "no snapshot available yet");
        return Ok(CycleOutcome::Unchanged);
    };

    ctx.status.set(SubStatus::Comparing);
    if compare_filesystems(current, &ctx.target, None) {
        return Ok(CycleOutcome::InSync);
    }

    ctx.status.set(SubStatus::Pushing);
    let update =
        common::update::generate_update(&ctx.target, current, &ctx.triggers, ctx.wait_for_ack);
    if update.request.is_noop() {
        // The ordered comparator can flag differences the name-keyed diff
        // resolves to nothing; still in sync, skip the RPC.
        return Ok(CycleOutcome::InSync);
    }

    if let Some(object_client) = &ctx.object_client {
        if !update.required_objects.is_empty() {
            let missing = object_client
                .check(update.required_objects.clone())
                .await?;
            if !missing.is_empty() {
                return Err(CycleError::MissingObjects(missing.len()));
            }
        }
    }

    let creations = update.request.inodes_to_make.len();
    let deletions = update.request.paths_to_delete.len();
    info!(
        sub = %ctx.hostname,
        creations,
        deletions,
        triggers = update.request.triggers.len(),
        wait = ctx.wait_for_ack,
        "pushing update"
    );

    let mut client = Client::dial(&ctx.address, "Subscriber.Update")
        .await
        .map_err(CycleError::Push)?;
    let payload = bincode::serialize(&update.request)?;
    client
        .conn()
        .write_blob(&payload)
        .await
        .map_err(CycleError::Push)?;

    let mut acked = false;
    if ctx.wait_for_ack {
        ctx.status.set(SubStatus::AwaitingAck);
        let reply: UpdateResponse = client.conn().read_frame().await.map_err(CycleError::Push)?;
        if !reply.success {
            return Err(CycleError::UpdateRejected(reply.error));
        }
        acked = true;
    }
    // The initiator closes the connection on every path; dropping the
    // client does exactly that.
    Ok(CycleOutcome::Pushed {
        creations,
        deletions,
        acked,
    })
}
