//! The Worker facade (§6 "Inbound operations"): one public async method per
//! row of the inbound operation table, each a thin wrapper delegating to
//! the Launch Controller, Recovery Controller, Registration Facade, or
//! Cache/Deletion helpers that already hold the real logic. Mirrors the
//! teacher's separation of `reconcile_model` (pure logic) from `main.rs`
//! (wiring) — this type is the logic half.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kiln_common::{
    origin_uid, LaunchArgs, LaunchStatus, ModelDescription, ModelType, NodeStatus, WorkerError,
    WorkerResult, XavierConfig,
};

use crate::cache;
use crate::gpu;
use crate::launch::{self, LaunchOutcome, WorkerCtx};
use crate::registration::{RegistrationEntry, RegistrationFacade};

pub struct Worker {
    ctx: Arc<WorkerCtx>,
    registrations: RegistrationFacade,
}

impl Worker {
    pub fn new(ctx: Arc<WorkerCtx>, registrations: RegistrationFacade) -> Self {
        Self { ctx, registrations }
    }

    // ---- Launch / Terminate / Cancel (§4.E) ----

    pub async fn launch_builtin_model(&self, args: LaunchArgs) -> WorkerResult<LaunchOutcome> {
        launch::launch_builtin_model(&self.ctx, args).await
    }

    pub async fn launch_rank0_model(&self, uid: &str, xavier_config: XavierConfig) -> WorkerResult<(String, u16)> {
        launch::launch_rank0_model(&self.ctx, uid, xavier_config).await
    }

    pub async fn cancel_launch_model(&self, uid: &str) -> WorkerResult<()> {
        launch::cancel_launch_model(&self.ctx, uid).await
    }

    pub async fn terminate_model(&self, uid: &str, is_model_die: bool) -> WorkerResult<()> {
        launch::terminate_model(&self.ctx, uid, is_model_die).await
    }

    /// Polls until `uid` either lands in the Model Table (success) or
    /// disappears from both the Model Table and the Launching Guard without
    /// ever landing (failure/cancellation) — useful when a caller dispatched
    /// `launch_builtin_model` on a background task rather than awaiting it
    /// directly.
    pub async fn wait_for_load(&self, uid: &str) -> WorkerResult<()> {
        loop {
            let state = self.ctx.state.lock().await;
            if let Some(entry) = state.model_table.get(uid) {
                return match &entry.last_error {
                    Some(e) => Err(WorkerError::Downstream(anyhow::anyhow!(e.clone()))),
                    None => Ok(()),
                };
            }
            if !state.launching_guard.contains_key(uid) {
                return Err(WorkerError::NotFound(uid.to_string()));
            }
            drop(state);
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    // ---- Metadata (§6 "describe_model, list_models, get_model_count") ----

    /// Raises the replica's stored fault, if any, per §6 "user-visible
    /// behavior": `get_model` raises with the stored `last_error`.
    pub async fn get_model(&self, uid: &str) -> WorkerResult<ModelDescription> {
        let state = self.ctx.state.lock().await;
        let entry = state.model_table.get(uid).ok_or_else(|| WorkerError::NotFound(uid.to_string()))?;
        if let Some(err) = &entry.last_error {
            return Err(WorkerError::Downstream(anyhow::anyhow!(err.clone())));
        }
        Ok(entry.description.clone())
    }

    pub async fn describe_model(&self, uid: &str) -> WorkerResult<ModelDescription> {
        let state = self.ctx.state.lock().await;
        state
            .model_table
            .get(uid)
            .map(|e| e.description.clone())
            .ok_or_else(|| WorkerError::NotFound(uid.to_string()))
    }

    /// `list_models`: never raises for individual entries (§6 user-visible
    /// behavior) — faulted replicas are listed with their description intact.
    pub async fn list_models(&self) -> HashMap<String, ModelDescription> {
        let state = self.ctx.state.lock().await;
        state
            .model_table
            .iter()
            .map(|(uid, entry)| (uid.clone(), entry.description.clone()))
            .collect()
    }

    pub async fn get_model_count(&self) -> usize {
        self.ctx.state.lock().await.model_table.len()
    }

    // ---- Registration catalog (§4.H) ----

    pub async fn register_model(&self, model_type: ModelType, json: &str, persist: bool) -> WorkerResult<()> {
        self.registrations.register(model_type, json, persist, &self.ctx.supervisor).await
    }

    pub fn unregister_model(&self, model_type: ModelType, model_name: &str) -> WorkerResult<()> {
        self.registrations.unregister(model_type, model_name)
    }

    pub fn list_model_registrations(&self, model_type: ModelType, detailed: bool) -> WorkerResult<Vec<RegistrationEntry>> {
        self.registrations.list_registrations(model_type, detailed)
    }

    pub fn get_model_registration(&self, model_type: ModelType, model_name: &str) -> WorkerResult<Option<RegistrationEntry>> {
        self.registrations.get_registration(model_type, model_name)
    }

    /// Which engines currently serve replicas of `model_name` — a linear
    /// scan of the Model Table's origin UIDs, mirroring
    /// `find_uid_by_sub_pool_address`'s "a worker holds few models" note.
    pub async fn query_engines_by_model_name(&self, model_name: &str) -> Vec<String> {
        let state = self.ctx.state.lock().await;
        state
            .model_table
            .iter()
            .filter(|(uid, _)| origin_uid(uid) == model_name)
            .filter_map(|(_, entry)| entry.launch_args.model_engine.clone())
            .collect()
    }

    // ---- Cache/Deletion (§4.J [EXPANDED]) ----

    pub async fn list_cached_models(&self) -> WorkerResult<Vec<kiln_common::ModelCacheEntry>> {
        self.ctx.supervisor.list_cached_models().await
    }

    pub async fn list_deletable_models(&self, model_version: &str) -> WorkerResult<Vec<std::path::PathBuf>> {
        cache::list_deletable_paths(&self.ctx.supervisor, model_version).await
    }

    pub async fn confirm_and_remove_model(&self, model_version: &str) -> WorkerResult<bool> {
        cache::confirm_and_remove_model(&self.ctx.supervisor, model_version).await
    }

    // ---- Introspection (§6) ----

    pub async fn get_workers_info(&self) -> NodeStatus {
        gather_node_status(&self.ctx).await
    }

    pub async fn get_model_status(&self, uid: &str) -> WorkerResult<LaunchStatus> {
        let state = self.ctx.state.lock().await;
        if let Some(entry) = state.model_table.get(uid) {
            return Ok(if entry.last_error.is_some() { LaunchStatus::Error } else { LaunchStatus::Ready });
        }
        if state.launching_guard.contains_key(uid) {
            return Ok(LaunchStatus::Creating);
        }
        Err(WorkerError::NotFound(uid.to_string()))
    }

    pub async fn update_model_status(&self, uid: &str, status: LaunchStatus) {
        let origin = origin_uid(uid);
        self.ctx
            .supervisor
            .update_instance_info(&origin, crate::outbound::InstanceInfo { status: Some(status), model_ability: None })
            .await;
    }

    pub async fn get_model_launch_status(&self, uid: &str) -> WorkerResult<LaunchStatus> {
        self.get_model_status(uid).await
    }

    // ---- Xavier / collective (§4.E rank-0) ----

    pub async fn start_transfer_for_vllm(&self, uid: &str, rank_addresses: Vec<String>) -> WorkerResult<()> {
        let address = {
            let state = self.ctx.state.lock().await;
            state
                .model_table
                .get(uid)
                .map(|e| e.sub_pool_address.clone())
                .ok_or_else(|| WorkerError::NotFound(uid.to_string()))?
        };
        self.ctx.transport.start_transfer_for_vllm(&address, rank_addresses).await
    }

    // ---- Shutdown ----

    /// Requests graceful shutdown; `main` and the Health Reporter watch
    /// `ctx.shutdown` and exit once it is cancelled. Always returns `true`
    /// (§6: "trigger_exit | — | bool").
    pub async fn trigger_exit(&self) -> bool {
        self.ctx.shutdown.cancel();
        true
    }
}

/// §4.G "gather node info (CPU/mem/GPU util)", bounded at 2s. CPU/memory
/// sampling has no in-scope primitive (§1 Non-goals: "the `.resource`
/// module that produces it is not part of this node's code") so those two
/// fields stay `None` — only GPU status is genuinely gathered here.
pub async fn gather_node_status(ctx: &WorkerCtx) -> NodeStatus {
    let gpus = match tokio::time::timeout(Duration::from_secs(2), gpu::read_gpu_statuses()).await {
        Ok(gpus) => gpus,
        Err(_) => {
            tracing::warn!("gather_node_info timed out after 2s");
            Vec::new()
        }
    };
    NodeStatus {
        node_id: ctx.config.node_id.clone(),
        last_heartbeat_ms: now_ms(),
        cpu_utilization_pct: None,
        memory_used_bytes: None,
        memory_total_bytes: None,
        gpus,
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::{test_ctx, test_launch_args};
    use crate::registration::RegistrationFacade;

    fn test_worker() -> Worker {
        Worker::new(test_ctx(), RegistrationFacade::new(HashMap::new()))
    }

    #[tokio::test]
    async fn empty_worker_has_no_models() {
        let worker = test_worker();
        assert_eq!(worker.get_model_count().await, 0);
        assert!(worker.list_models().await.is_empty());
    }

    #[tokio::test]
    async fn get_model_status_of_unknown_uid_is_not_found() {
        let worker = test_worker();
        let err = worker.get_model_status("ghost-0").await.unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));
    }

    #[tokio::test]
    async fn launch_then_describe_and_count() {
        let worker = test_worker();
        worker.launch_builtin_model(test_launch_args("w-1-0")).await.unwrap();

        assert_eq!(worker.get_model_count().await, 1);
        let description = worker.describe_model("w-1-0").await.unwrap();
        assert_eq!(description.model_name, "demo-model");
        assert_eq!(worker.get_model_status("w-1-0").await.unwrap(), LaunchStatus::Ready);
    }

    #[tokio::test]
    async fn wait_for_load_resolves_once_committed() {
        let worker = test_worker();
        worker.launch_builtin_model(test_launch_args("w-2-0")).await.unwrap();
        worker.wait_for_load("w-2-0").await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_load_of_never_launched_uid_is_not_found() {
        let worker = test_worker();
        let err = worker.wait_for_load("never-w-0").await.unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));
    }

    #[tokio::test]
    async fn trigger_exit_cancels_shutdown_token() {
        let worker = test_worker();
        assert!(!worker.ctx.shutdown.is_cancelled());
        assert!(worker.trigger_exit().await);
        assert!(worker.ctx.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn query_engines_filters_by_origin_model_name() {
        let worker = test_worker();
        let mut args = test_launch_args("multi-0");
        args.model_name = "multi".to_string();
        args.model_engine = Some("vllm".to_string());
        worker.launch_builtin_model(args).await.unwrap();

        let engines = worker.query_engines_by_model_name("multi").await;
        assert_eq!(engines, vec!["vllm".to_string()]);
        assert!(worker.query_engines_by_model_name("no-such-model").await.is_empty());
    }
}
