//! Model Actor boundary (§1 Non-goals: "the Model Actor ... is consumed
//! only where the core consumes it").
//!
//! The actor itself — the in-process object at a sub-pool address that
//! owns a loaded model — lives outside this crate. What the Worker needs
//! is a narrow, transport-aware RPC surface to create, load, destroy and
//! rewire one. Modeled as a trait so tests can swap in an in-memory double
//! instead of a real cross-process transport (§9 design note: "model these
//! as typed RPC services over a message transport").

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kiln_common::{LaunchArgs, RequestLimits, WorkerError};

/// Everything the Model Actor needs at creation time (§4.E step 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateActorRequest {
    pub replica_uid: String,
    pub supervisor_address: String,
    pub worker_address: String,
    pub model_description: serde_json::Value,
    pub request_limits: Option<RequestLimits>,
    pub xavier_config: Option<serde_json::Value>,
    pub n_worker: u32,
    pub shard: u32,
    pub driver_info: Option<serde_json::Value>,
}

impl CreateActorRequest {
    pub fn from_launch_args(
        args: &LaunchArgs,
        supervisor_address: &str,
        worker_address: &str,
        model_description: serde_json::Value,
    ) -> Self {
        Self {
            replica_uid: args.model_uid.clone(),
            supervisor_address: supervisor_address.to_string(),
            worker_address: worker_address.to_string(),
            model_description,
            request_limits: args.request_limits,
            xavier_config: args
                .xavier_config
                .as_ref()
                .map(|x| serde_json::to_value(x).unwrap_or(serde_json::Value::Null)),
            n_worker: args.n_worker,
            shard: args.shard,
            driver_info: args.driver_info.clone(),
        }
    }
}

/// The Model Actor's narrow remote surface, as consumed by the Launch
/// Controller, Terminate and the Recovery Controller.
#[async_trait]
pub trait ModelActorTransport: Send + Sync {
    async fn create_actor(&self, address: &str, request: CreateActorRequest) -> Result<(), WorkerError>;

    /// `model.load()` (§4.E step 8). May return a "server closed" signal —
    /// callers re-check cancellation on that signal rather than treating it
    /// as success (§4.E Loaded).
    async fn load(&self, address: &str) -> Result<(), WorkerError>;

    /// Bounded destroy (§5 Timeouts: 5s, transport-aware — must not assume
    /// a local timeout stops the remote work, only that the caller stops
    /// waiting on it).
    async fn destroy(&self, address: &str) -> Result<(), WorkerError>;

    async fn bind_extra_pools(&self, address: &str, extra_addresses: Vec<String>) -> Result<(), WorkerError>;

    async fn start_transfer_for_vllm(&self, address: &str, rank_addresses: Vec<String>) -> Result<()>;

    /// `model_ref.get_driver_info()` (§4.E "After commit"): opaque metadata
    /// the rank-0/shard-0 replica produces once loaded, handed back to the
    /// Launch Controller so peer shards can join. Distinct from
    /// `LaunchArgs::driver_info`, which is only an inbound hint.
    async fn get_driver_info(&self, address: &str) -> Result<Option<serde_json::Value>>;
}

// `Result<(), WorkerError>` used above for the trailing method too, but
// spelled out so the import of `Result` stays unambiguous.
type Result<T> = std::result::Result<T, WorkerError>;

/// Destroy bounded at 5s per §5. On timeout we still proceed — the caller's
/// `finally`-equivalent cleanup (table/device/guard removal) always runs
/// regardless of whether the remote end actually tore down in time.
pub async fn destroy_with_deadline(transport: &dyn ModelActorTransport, address: &str) -> Result<()> {
    match tokio::time::timeout(Duration::from_secs(5), transport.destroy(address)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(%address, "model actor destroy timed out after 5s, proceeding with cleanup anyway");
            Ok(())
        }
    }
}

/// A rank-0 coordinator actor creation request (§4.E "Rank-0 fast path").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRank0Request {
    pub replica_uid: String,
    pub xavier_config: serde_json::Value,
}

/// In-memory double used by tests and, until a real transport is wired at
/// the process boundary, by the binary itself. Tracks created/loaded/
/// destroyed addresses so assertions can inspect call history.
#[derive(Default)]
pub struct InMemoryModelActorTransport {
    state: tokio::sync::Mutex<HashMap<String, bool>>,
}

impl InMemoryModelActorTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModelActorTransport for InMemoryModelActorTransport {
    async fn create_actor(&self, address: &str, _request: CreateActorRequest) -> Result<()> {
        self.state.lock().await.insert(address.to_string(), false);
        Ok(())
    }

    async fn load(&self, address: &str) -> Result<()> {
        if let Some(loaded) = self.state.lock().await.get_mut(address) {
            *loaded = true;
        }
        Ok(())
    }

    async fn destroy(&self, address: &str) -> Result<()> {
        self.state.lock().await.remove(address);
        Ok(())
    }

    async fn bind_extra_pools(&self, _address: &str, _extra_addresses: Vec<String>) -> Result<()> {
        Ok(())
    }

    async fn start_transfer_for_vllm(&self, _address: &str, _rank_addresses: Vec<String>) -> Result<()> {
        Ok(())
    }

    async fn get_driver_info(&self, _address: &str) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }
}
