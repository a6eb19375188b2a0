//! Launch Controller (§4.E) — the core of the Worker.
//!
//! Drives the launch state machine through
//! `PreValidated -> EnvReady -> SubPoolUp -> Downloaded -> VenvInstalled ->
//! ActorCreated -> ExtraPoolsUp -> Loaded -> Committed`, enforcing a
//! cancellation check at every suspension point and unwinding through one
//! shared failure path on any error. Also hosts `Terminate` and
//! `CancelLaunch` (§4.E-Terminate / §4.E-Cancel) since both touch the same
//! guarded `WorkerState`.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_common::{
    parse_replica_model_uid, strip_rank0_suffix, GpuPreference, LaunchArgs, ModelType, WorkerError,
    WorkerResult, XavierConfig,
};

use crate::config::WorkerConfig;
use crate::device::DeviceAccountant;
use crate::downloader::DownloaderHandle;
use crate::factory::{compute_abilities, ModelFamilyFactory};
use crate::metrics::WorkerMetrics;
use crate::model_actor::{destroy_with_deadline, CreateActorRequest, ModelActorTransport};
use crate::model_table::{LaunchingGuardEntry, ModelTableEntry, SharedWorkerState};
use crate::outbound::{EventType, InstanceInfo, SupervisorClient};
use crate::progress::ProgressStream;
use crate::subpool::SubPoolBroker;
use crate::venv::{self, VirtualEnvSettings};

/// Everything the Launch Controller (and Terminate/Cancel, which share its
/// state) needs. Held behind `Arc` and cloned cheaply into every inbound
/// call.
pub struct WorkerCtx {
    pub state: SharedWorkerState,
    pub config: WorkerConfig,
    pub subpool: Arc<SubPoolBroker>,
    pub supervisor: Arc<SupervisorClient>,
    pub transport: Arc<dyn ModelActorTransport>,
    pub factories: HashMap<ModelType, Arc<dyn ModelFamilyFactory>>,
    pub worker_address: String,
    pub metrics: Arc<WorkerMetrics>,
    /// Signaled by `trigger_exit` (§6); `main` and the Health Reporter watch
    /// it to start shutdown. A `CancellationToken` (rather than
    /// `tokio::sync::Notify`) so the "shut down now" state persists even if
    /// nothing happened to be awaiting it at the moment `cancel()` was
    /// called.
    pub shutdown: tokio_util::sync::CancellationToken,
}

impl WorkerCtx {
    fn factory_for(&self, model_type: ModelType) -> WorkerResult<Arc<dyn ModelFamilyFactory>> {
        self.factories
            .get(&model_type)
            .cloned()
            .ok_or_else(|| WorkerError::InvalidArg(format!("no model family factory registered for {model_type:?}")))
    }
}

pub enum LaunchOutcome {
    Address(String),
    WithDriverInfo(String, Option<serde_json::Value>),
}

/// §4.E pre-validation steps 1-8. Must run before any side effect.
fn pre_validate(ctx: &WorkerCtx, args: &LaunchArgs, is_free: bool) -> WorkerResult<GpuPreference> {
    // Step 3/4: coerce gpu_idx, ignoring n_gpu if both present; validate n_gpu.
    let gpu = match &args.gpu {
        GpuPreference::Pinned(idx) => GpuPreference::Pinned(idx.clone()),
        GpuPreference::Count(n) => {
            let host_count = ctx.config.total_gpus.len() as u32;
            if *n < 1 || *n > host_count {
                return Err(WorkerError::InvalidArg(format!(
                    "n_gpu={n} out of range [1, {host_count}]"
                )));
            }
            GpuPreference::Count(*n)
        }
        GpuPreference::Auto => GpuPreference::Auto,
        GpuPreference::None => GpuPreference::None,
    };

    // Step 5: PEFT compatibility.
    if let Some(peft) = &args.peft_model_config {
        if !peft.peft_model.is_empty() {
            if matches!(args.model_type, ModelType::Embedding | ModelType::Rerank) {
                return Err(WorkerError::InvalidArg(
                    "peft adapters are not supported for embedding/rerank models".to_string(),
                ));
            }
            if args.model_type == ModelType::Llm && args.model_format.as_deref() == Some("ggufv2") {
                return Err(WorkerError::InvalidArg(
                    "peft adapters are not supported for LLM ggufv2 models".to_string(),
                ));
            }
        }
    }

    // Step 6: model_path, if set, must exist.
    if let Some(path) = &args.model_path {
        if !std::path::Path::new(path).exists() {
            return Err(WorkerError::InvalidArg(format!("model_path {path} does not exist")));
        }
    }

    // Step 7: uid must be free.
    if !is_free {
        return Err(WorkerError::Conflict(format!(
            "model {} already launching or already launched",
            args.model_uid
        )));
    }

    // Step 8: platform sanity check.
    platform_sanity_check(args)?;

    Ok(gpu)
}

/// Certain model-name/format combinations are forbidden on macOS (§4.E
/// pre-validation step 8). The original ties this to vLLM's lack of macOS
/// support; ported as a simple, extensible rule table.
fn platform_sanity_check(args: &LaunchArgs) -> WorkerResult<()> {
    if std::env::consts::OS != "macos" {
        return Ok(());
    }
    if args.model_engine.as_deref() == Some("vllm") {
        return Err(WorkerError::Unsupported(
            "vLLM engine is not supported on macOS".to_string(),
        ));
    }
    Ok(())
}

/// §4.E step 3: allocate devices per the coerced GPU preference.
async fn allocate_devices(
    devices: &mut DeviceAccountant,
    uid: &str,
    gpu: &GpuPreference,
    model_type: ModelType,
    is_vllm_backed: impl Fn(String) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>,
) -> WorkerResult<Vec<u32>> {
    match gpu {
        GpuPreference::None => Ok(Vec::new()),
        GpuPreference::Count(n) => devices.allocate_exclusive(uid, *n as usize),
        GpuPreference::Auto => {
            if model_type.is_shareable() {
                devices
                    .allocate_for_embedding(uid, is_vllm_backed)
                    .await
                    .map(|g| vec![g])
            } else {
                devices.allocate_exclusive(uid, 1)
            }
        }
        GpuPreference::Pinned(idx) => {
            devices
                .allocate_pinned(uid, model_type, idx.clone(), is_vllm_backed)
                .await
        }
    }
}

/// Clean up every side effect a partially-completed launch may have left
/// behind: release devices, remove every recorded sub-pool (best-effort),
/// and drop the Launching Guard entry. Shared by the failure path and by
/// cancellation (§4.E "Failure/cancellation policy").
async fn unwind_launch(ctx: &WorkerCtx, uid: &str, guard: &LaunchingGuardEntry) {
    {
        let mut state = ctx.state.lock().await;
        state.devices.release(uid);
    }
    for addr in &guard.sub_pools {
        let _ = ctx.subpool.remove_sub_pool(addr, true).await;
    }
    if let Some(venv) = &guard.virtualenv_manager {
        venv.cancel_install();
    }
}

fn checkpoint(cancel: &tokio_util::sync::CancellationToken, uid: &str) -> WorkerResult<()> {
    if cancel.is_cancelled() {
        return Err(WorkerError::Cancelled("Launch cancelled".to_string()));
    }
    let _ = uid;
    Ok(())
}

/// `Launch(args)` (§4.E). The full pipeline.
pub async fn launch_builtin_model(ctx: &WorkerCtx, args: LaunchArgs) -> WorkerResult<LaunchOutcome> {
    let uid = args.model_uid.clone();
    let (origin_uid, _) = parse_replica_model_uid(&uid);
    ctx.metrics.record_launch_attempt();

    ctx.supervisor
        .report_event(&origin_uid, EventType::Info, "Launch model".to_string())
        .await;

    let is_free = {
        let state = ctx.state.lock().await;
        state.is_free(&uid)
    };
    let gpu = match pre_validate(ctx, &args, is_free) {
        Ok(gpu) => gpu,
        Err(e) => {
            ctx.metrics.record_launch_failure();
            return Err(e);
        }
    };

    // Step 1: insert the Launching Guard entry with a fresh cancel flag.
    let guard_entry = LaunchingGuardEntry::new();
    let cancel = guard_entry.cancel.clone();
    {
        let mut state = ctx.state.lock().await;
        state.launching_guard.insert(uid.clone(), guard_entry);
    }

    let result = run_launch_pipeline(ctx, &args, &uid, &origin_uid, gpu, &cancel).await;

    match &result {
        Ok(_) => {}
        Err(_) => {
            ctx.metrics.record_launch_failure();
            let guard = {
                let mut state = ctx.state.lock().await;
                state.launching_guard.remove(&uid)
            };
            if let Some(guard) = guard {
                unwind_launch(ctx, &uid, &guard).await;
            }
            ctx.supervisor
                .update_instance_info(
                    &origin_uid,
                    InstanceInfo { status: Some(kiln_common::LaunchStatus::Error), model_ability: None },
                )
                .await;
        }
    }
    result
}

async fn run_launch_pipeline(
    ctx: &WorkerCtx,
    args: &LaunchArgs,
    uid: &str,
    origin_uid: &str,
    gpu: GpuPreference,
    cancel: &tokio_util::sync::CancellationToken,
) -> WorkerResult<LaunchOutcome> {
    let model_type = args.model_type;

    // EnvReady: prepare the virtualenv off the main loop.
    checkpoint(cancel, uid)?;
    let venv_enabled = ctx.config.virtual_env_enabled;
    let venv_root = ctx.config.virtual_env_root.clone();
    let skip_installed = ctx.config.virtual_env_skip_installed;
    let per_launch_enable = args.enable_virtual_env;
    let venv_name = uid.to_string();
    let virtualenv_manager = venv::ensure_env(
        venv_enabled,
        per_launch_enable,
        &venv_root,
        &venv_name,
        skip_installed,
    )
    .await?;
    {
        let mut state = ctx.state.lock().await;
        if let Some(entry) = state.launching_guard.get_mut(uid) {
            entry.virtualenv_manager = virtualenv_manager.clone();
        }
    }

    // SubPoolUp: allocate devices, then create the sub-pool. "auto" on a
    // host with no GPUs at all falls back to CPU-only (§4.E step 3: the GPU
    // visibility var is omitted entirely in that case, not set to "-1").
    checkpoint(cancel, uid)?;
    let cpu_only_auto = matches!(gpu, GpuPreference::Auto) && ctx.config.total_gpus.is_empty();
    let supervisor = ctx.supervisor.clone();
    let accelerators = if cpu_only_auto {
        Vec::new()
    } else {
        let mut state = ctx.state.lock().await;
        let supervisor = supervisor.clone();
        let probe = move |owner: String| {
            let supervisor = supervisor.clone();
            Box::pin(async move { supervisor.is_vllm_backed(&owner).await })
                as std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>
        };
        allocate_devices(&mut state.devices, uid, &gpu, model_type, probe).await?
    };

    let visibility_var = ctx.config.gpu_visibility_env_var.clone();
    let mut env: HashMap<String, String> = args.envs.clone().unwrap_or_default();
    let visibility_value = if cpu_only_auto {
        None
    } else {
        ctx.config.gpu_visibility_value(Some(&accelerators[..]))
    };
    if let Some(value) = visibility_value {
        env.insert(visibility_var, value);
    }

    let interpreter = virtualenv_manager
        .as_ref()
        .map(|m| m.env_path().join("bin").join("python").to_string_lossy().to_string());
    let sub_pool_address = ctx.subpool.create_sub_pool(env, interpreter).await?;
    {
        let mut state = ctx.state.lock().await;
        if let Some(entry) = state.launching_guard.get_mut(uid) {
            entry.sub_pools.push(sub_pool_address.clone());
        }
    }

    // Downloaded: cancellable download + off-loop factory call.
    checkpoint(cancel, uid)?;
    let downloader = DownloaderHandle::new(cancel.clone());
    {
        let mut state = ctx.state.lock().await;
        if let Some(entry) = state.launching_guard.get_mut(uid) {
            entry.downloader = Some(downloader.clone());
        }
    }
    ctx.supervisor.progress_start(uid).await;
    let mut progress = ProgressStream::download_load();
    let pump_handle = downloader.clone();
    let pump_uid = uid.to_string();
    let pump_supervisor = ctx.supervisor.clone();
    let pump = tokio::spawn(async move {
        loop {
            if pump_handle.is_cancelled() {
                return;
            }
            if pump_handle.is_done() {
                progress.set_progress(1.0, Some("Start to load model"));
                pump_supervisor
                    .progress_set(&pump_uid, progress.absolute_fraction(), progress.label.as_deref())
                    .await;
                return;
            }
            progress.set_progress(pump_handle.fraction(), None);
            pump_supervisor.progress_set(&pump_uid, progress.absolute_fraction(), None).await;
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });

    let factory = ctx.factory_for(model_type)?;
    let instance = factory
        .create_model_instance(args, &accelerators, &downloader)
        .await;
    downloader.mark_done();
    let _ = pump_handle_abort(pump).await;
    let mut instance = instance?;
    ctx.supervisor
        .record_model_version(
            &instance.description.model_name.clone(),
            &HashMap::from([(instance.description.model_name.clone(), instance.description.clone())]),
        )
        .await
        .unwrap_or_else(|e| tracing::warn!(error = %e, "record_model_version failed"));

    // VenvInstalled.
    checkpoint(cancel, uid)?;
    if let Some(manager) = &virtualenv_manager {
        let settings = VirtualEnvSettings {
            packages: instance.virtualenv_packages.clone(),
            inherit_pip_config: args.envs.is_some(),
            index_url: None,
            extra_index_url: None,
        };
        let extra: Vec<String> = args.virtual_env_packages.clone().unwrap_or_default();
        venv::install_packages(manager, Some(&settings), &extra).await?;
    }

    // ActorCreated.
    checkpoint(cancel, uid)?;
    let description_json = serde_json::to_value(&instance.description)
        .map_err(|e| WorkerError::Downstream(anyhow::anyhow!(e)))?;
    let request = CreateActorRequest::from_launch_args(
        args,
        &ctx.config.node_id,
        &ctx.worker_address,
        description_json,
    );
    ctx.transport.create_actor(&sub_pool_address, request).await?;

    // ExtraPoolsUp: one additional sub-pool per device if the model needs
    // it and this is a multi-device or multi-worker replica.
    checkpoint(cancel, uid)?;
    let mut extra_addresses = Vec::new();
    if instance.needs_extra_pools && (accelerators.len() > 1 || args.n_worker > 1) {
        for _device in accelerators.iter() {
            checkpoint(cancel, uid)?;
            let mut extra_env: HashMap<String, String> = args.envs.clone().unwrap_or_default();
            if let Some(value) = ctx.config.gpu_visibility_value(Some(&accelerators[..])) {
                extra_env.insert(ctx.config.gpu_visibility_env_var.clone(), value);
            }
            let extra_interpreter = virtualenv_manager
                .as_ref()
                .map(|m| m.env_path().join("bin").join("python").to_string_lossy().to_string());
            let extra_addr = ctx.subpool.create_sub_pool(extra_env, extra_interpreter).await?;
            {
                let mut state = ctx.state.lock().await;
                if let Some(entry) = state.launching_guard.get_mut(uid) {
                    entry.sub_pools.push(extra_addr.clone());
                }
            }
            extra_addresses.push(extra_addr);
        }
        ctx.transport
            .bind_extra_pools(&sub_pool_address, extra_addresses.clone())
            .await?;
    }
    instance.description.extra.insert(
        "sub_pool_address".to_string(),
        serde_json::Value::String(sub_pool_address.clone()),
    );
    instance.description.extra.insert(
        "accelerators".to_string(),
        serde_json::to_value(&accelerators).unwrap_or(serde_json::Value::Null),
    );
    if let Some(projector) = &instance.multimodal_projector {
        instance
            .description
            .extra
            .insert("multimodal_projector".to_string(), serde_json::Value::String(projector.clone()));
    }

    // Loaded.
    checkpoint(cancel, uid)?;
    loop {
        match ctx.transport.load(&sub_pool_address).await {
            Ok(()) => break,
            Err(WorkerError::Transient(msg)) if msg.contains("server closed") => {
                checkpoint(cancel, uid)?;
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    // Committed: atomically move the Guard entry into the Model Table.
    let abilities = compute_abilities(model_type, &instance);
    {
        let mut state = ctx.state.lock().await;
        let guard = state.launching_guard.remove(uid).unwrap_or_else(LaunchingGuardEntry::new);
        state.model_table.insert(
            uid.to_string(),
            ModelTableEntry {
                description: instance.description,
                last_error: None,
                sub_pool_address: sub_pool_address.clone(),
                extra_sub_pool_addresses: extra_addresses,
                recovery_remaining: ctx.config.auto_recover_limit,
                launch_args: args.clone(),
            },
        );
        let _ = guard;
    }
    ctx.supervisor.progress_end(uid).await;
    ctx.supervisor
        .update_instance_info(
            origin_uid,
            InstanceInfo {
                status: Some(kiln_common::LaunchStatus::Ready),
                model_ability: Some(kiln_common::ModelAbilities(abilities)),
            },
        )
        .await;

    if args.n_worker > 1 && args.shard == 0 {
        let driver_info = ctx.transport.get_driver_info(&sub_pool_address).await?;
        Ok(LaunchOutcome::WithDriverInfo(sub_pool_address, driver_info))
    } else {
        Ok(LaunchOutcome::Address(sub_pool_address))
    }
}

async fn pump_handle_abort(handle: tokio::task::JoinHandle<()>) -> WorkerResult<()> {
    handle.abort();
    Ok(())
}

/// `LaunchRank0(uid, xavier_config)` (§4.E "Rank-0 fast path"): bypasses the
/// full state machine — a bare sub-pool plus a fresh TCP rendezvous port.
pub async fn launch_rank0_model(
    ctx: &WorkerCtx,
    uid: &str,
    mut xavier_config: XavierConfig,
) -> WorkerResult<(String, u16)> {
    let sub_pool_address = ctx.subpool.create_sub_pool(HashMap::new(), None).await?;

    let store_port = match allocate_local_tcp_port().await {
        Ok(p) => p,
        Err(e) => {
            let _ = ctx.subpool.remove_sub_pool(&sub_pool_address, true).await;
            return Err(e);
        }
    };

    xavier_config.rank_address = Some(sub_pool_address.clone());
    xavier_config.store_address = Some(ctx.config.node_id.clone());
    xavier_config.store_port = Some(store_port);

    let request = CreateActorRequest {
        replica_uid: uid.to_string(),
        supervisor_address: ctx.config.node_id.clone(),
        worker_address: ctx.worker_address.clone(),
        model_description: serde_json::Value::Null,
        request_limits: None,
        xavier_config: Some(serde_json::to_value(&xavier_config).unwrap_or(serde_json::Value::Null)),
        n_worker: 1,
        shard: 0,
        driver_info: None,
    };

    if let Err(e) = ctx.transport.create_actor(&sub_pool_address, request).await {
        let _ = ctx.subpool.remove_sub_pool(&sub_pool_address, true).await;
        return Err(e);
    }

    {
        let mut state = ctx.state.lock().await;
        state.model_table.insert(
            uid.to_string(),
            ModelTableEntry {
                description: kiln_common::ModelDescription::default(),
                last_error: None,
                sub_pool_address: sub_pool_address.clone(),
                extra_sub_pool_addresses: Vec::new(),
                recovery_remaining: ctx.config.auto_recover_limit,
                launch_args: LaunchArgs {
                    model_uid: uid.to_string(),
                    model_name: String::new(),
                    model_size_in_billions: None,
                    model_format: None,
                    quantization: None,
                    model_engine: None,
                    model_type: ModelType::Llm,
                    gpu: GpuPreference::None,
                    n_worker: 1,
                    shard: 0,
                    driver_info: None,
                    peft_model_config: None,
                    request_limits: None,
                    download_hub: None,
                    model_path: None,
                    enable_virtual_env: None,
                    virtual_env_packages: None,
                    envs: None,
                    xavier_config: Some(xavier_config),
                    extensions: HashMap::new(),
                },
            },
        );
    }

    Ok((sub_pool_address, store_port))
}

async fn allocate_local_tcp_port() -> WorkerResult<u16> {
    let listener = tokio::net::TcpListener::bind("0.0.0.0:0")
        .await
        .map_err(|e| WorkerError::Downstream(anyhow::anyhow!("failed to bind rendezvous port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| WorkerError::Downstream(anyhow::anyhow!(e)))?
        .port();
    // Drop the listener immediately — rank0 only needs a free port number,
    // the actual store binds it later.
    drop(listener);
    Ok(port)
}

/// `Terminate(uid, is_model_die?)` (§4.E-Terminate). Idempotent: a second
/// call for an unknown/already-gone `uid` is a no-op that still drives the
/// Status Guard to the right terminal state and never raises.
pub async fn terminate_model(ctx: &WorkerCtx, uid: &str, is_model_die: bool) -> WorkerResult<()> {
    {
        let state = ctx.state.lock().await;
        if state.launching_guard.contains_key(uid) {
            return Err(WorkerError::Busy(format!("{uid} is currently launching")));
        }
    }
    ctx.metrics.record_termination();

    let origin_uid = if uid.ends_with("-rank0") {
        strip_rank0_suffix(uid)
    } else {
        parse_replica_model_uid(uid).0
    };

    ctx.supervisor
        .report_event(&origin_uid, EventType::Info, "Terminate model".to_string())
        .await;
    ctx.supervisor
        .update_instance_info(
            &origin_uid,
            InstanceInfo { status: Some(kiln_common::LaunchStatus::Terminating), model_ability: None },
        )
        .await;

    let entry = {
        let state = ctx.state.lock().await;
        state.model_table.get(uid).cloned()
    };

    if let Some(entry) = &entry {
        let _ = destroy_with_deadline(ctx.transport.as_ref(), &entry.sub_pool_address).await;
        for extra in &entry.extra_sub_pool_addresses {
            let _ = ctx.subpool.remove_sub_pool(extra, true).await;
        }
        let _ = ctx.subpool.remove_sub_pool(&entry.sub_pool_address, true).await;
    }

    {
        let mut state = ctx.state.lock().await;
        state.model_table.remove(uid);
        state.devices.release(uid);
    }

    if is_model_die {
        ctx.supervisor
            .update_instance_info(
                &origin_uid,
                InstanceInfo { status: Some(kiln_common::LaunchStatus::Error), model_ability: None },
            )
            .await;
    } else {
        ctx.supervisor
            .update_instance_info(
                &origin_uid,
                InstanceInfo { status: Some(kiln_common::LaunchStatus::Terminated), model_ability: None },
            )
            .await;
        ctx.supervisor.clear_instance_info(&origin_uid).await;
    }

    Ok(())
}

/// Builds a fully-wired `WorkerCtx` against in-memory/no-op collaborators
/// (`MemoryMetaStore`, `InMemoryModelActorTransport`, the `true` binary as
/// the sub-pool "process") so the Launch/Terminate/Cancel/Recovery pipelines
/// can be exercised end to end without any real GPU, filesystem artifact, or
/// network dependency. Shared by `recovery.rs` and `worker.rs`'s own test
/// modules.
#[cfg(test)]
pub(crate) fn test_ctx() -> Arc<WorkerCtx> {
    use crate::model_actor::InMemoryModelActorTransport;
    use crate::model_table::WorkerState;
    use kiln_meta::MemoryMetaStore;

    let (subpool, _death_rx) = SubPoolBroker::new("true");
    let mut factories: HashMap<ModelType, Arc<dyn ModelFamilyFactory>> = HashMap::new();
    let factory: Arc<dyn ModelFamilyFactory> = Arc::new(crate::factory::LocalPathModelFamilyFactory);
    for model_type in [ModelType::Llm, ModelType::Embedding, ModelType::Rerank] {
        factories.insert(model_type, factory.clone());
    }

    Arc::new(WorkerCtx {
        state: Arc::new(tokio::sync::Mutex::new(WorkerState::new(vec![0, 1]))),
        config: WorkerConfig {
            node_id: "test-node".to_string(),
            total_gpus: vec![0, 1],
            gpu_visibility_env_var: "CUDA_VISIBLE_DEVICES".to_string(),
            health_check_enabled: false,
            health_check_interval_secs: 30,
            metrics_enabled: false,
            metrics_host: None,
            metrics_port: None,
            auto_recover_limit: None,
            virtual_env_enabled: false,
            virtual_env_skip_installed: true,
            virtual_env_root: std::path::PathBuf::from("/tmp/kiln-test-venvs"),
            cache_dir: std::path::PathBuf::from("/tmp/kiln-test-cache"),
            default_interpreter: "true".to_string(),
        },
        subpool: Arc::new(subpool),
        supervisor: Arc::new(SupervisorClient::new(Arc::new(MemoryMetaStore::new()), "test-node".to_string())),
        transport: Arc::new(InMemoryModelActorTransport::new()),
        factories,
        worker_address: "test-node:worker".to_string(),
        metrics: Arc::new(WorkerMetrics::default()),
        shutdown: tokio_util::sync::CancellationToken::new(),
    })
}

#[cfg(test)]
pub(crate) fn test_launch_args(uid: &str) -> LaunchArgs {
    LaunchArgs {
        model_uid: uid.to_string(),
        model_name: "demo-model".to_string(),
        model_size_in_billions: None,
        model_format: None,
        quantization: None,
        model_engine: None,
        model_type: ModelType::Llm,
        gpu: GpuPreference::None,
        n_worker: 1,
        shard: 0,
        driver_info: None,
        peft_model_config: None,
        request_limits: None,
        download_hub: None,
        model_path: None,
        enable_virtual_env: None,
        virtual_env_packages: None,
        envs: None,
        xavier_config: None,
        extensions: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_then_launch_again_is_a_conflict() {
        let ctx = test_ctx();
        let args = test_launch_args("model-1-0");
        launch_builtin_model(&ctx, args.clone()).await.expect("first launch succeeds");
        let err = launch_builtin_model(&ctx, args).await.unwrap_err();
        assert!(matches!(err, WorkerError::Conflict(_)));
    }

    #[tokio::test]
    async fn successful_launch_lands_in_model_table_as_ready() {
        let ctx = test_ctx();
        let outcome = launch_builtin_model(&ctx, test_launch_args("model-2-0")).await.unwrap();
        match outcome {
            LaunchOutcome::Address(addr) => assert!(addr.starts_with("subpool-")),
            LaunchOutcome::WithDriverInfo(..) => panic!("single-shard launch should not carry driver info"),
        }
        let state = ctx.state.lock().await;
        let entry = state.model_table.get("model-2-0").expect("committed");
        assert!(entry.last_error.is_none());
    }

    #[tokio::test]
    async fn cancel_launch_of_unknown_uid_is_not_launching() {
        let ctx = test_ctx();
        let err = cancel_launch_model(&ctx, "does-not-exist").await.unwrap_err();
        assert!(matches!(err, WorkerError::NotLaunching(_)));
    }

    #[tokio::test]
    async fn terminate_of_unknown_uid_is_a_no_op() {
        let ctx = test_ctx();
        terminate_model(&ctx, "never-launched", false).await.unwrap();
    }

    #[tokio::test]
    async fn terminate_after_launch_frees_the_uid_for_relaunch() {
        let ctx = test_ctx();
        let args = test_launch_args("model-3-0");
        launch_builtin_model(&ctx, args.clone()).await.unwrap();
        terminate_model(&ctx, "model-3-0", false).await.unwrap();
        {
            let state = ctx.state.lock().await;
            assert!(state.is_free("model-3-0"));
        }
        launch_builtin_model(&ctx, args).await.expect("relaunch after terminate succeeds");
    }

    #[tokio::test]
    async fn rank0_launch_allocates_a_rendezvous_port_and_commits() {
        let ctx = test_ctx();
        let (address, port) = launch_rank0_model(&ctx, "model-4-rank0", XavierConfig::default()).await.unwrap();
        assert!(address.starts_with("subpool-"));
        assert!(port > 0);
        let state = ctx.state.lock().await;
        assert!(state.model_table.contains_key("model-4-rank0"));
    }

    #[tokio::test]
    async fn n_gpu_out_of_range_is_rejected() {
        let ctx = test_ctx();
        let mut args = test_launch_args("oversized-0");
        args.gpu = GpuPreference::Count(99);
        let err = launch_builtin_model(&ctx, args).await.unwrap_err();
        assert!(matches!(err, WorkerError::InvalidArg(_)));
        // The rejected launch must not have left a Launching Guard entry
        // behind (invariant 1: a UID that failed pre-validation is free).
        let state = ctx.state.lock().await;
        assert!(state.is_free("oversized-0"));
    }

    #[tokio::test]
    async fn peft_adapter_is_rejected_for_embedding_models() {
        let ctx = test_ctx();
        let mut args = test_launch_args("embed-peft-0");
        args.model_type = ModelType::Embedding;
        args.peft_model_config = Some(kiln_common::PeftModelConfig {
            peft_model: vec![kiln_common::PeftAdapter { lora_name: "l".to_string(), local_path: "/tmp/l".to_string() }],
            ..Default::default()
        });
        let err = launch_builtin_model(&ctx, args).await.unwrap_err();
        assert!(matches!(err, WorkerError::InvalidArg(_)));
    }
}

/// `CancelLaunch(uid)` (§4.E-Cancel).
pub async fn cancel_launch_model(ctx: &WorkerCtx, uid: &str) -> WorkerResult<()> {
    let (cancel, downloader, venv_manager, sub_pools) = {
        let state = ctx.state.lock().await;
        let entry = state
            .launching_guard
            .get(uid)
            .ok_or_else(|| WorkerError::NotLaunching(uid.to_string()))?;
        (
            entry.cancel.clone(),
            entry.downloader.clone(),
            entry.virtualenv_manager.clone(),
            entry.sub_pools.clone(),
        )
    };

    cancel.cancel();
    if let Some(d) = &downloader {
        d.cancel();
    }
    if let Some(v) = &venv_manager {
        v.cancel_install();
    }
    for addr in &sub_pools {
        let _ = ctx.subpool.remove_sub_pool(addr, true).await;
    }

    let (origin_uid, _) = parse_replica_model_uid(uid);
    ctx.supervisor
        .update_instance_info(
            &origin_uid,
            InstanceInfo { status: Some(kiln_common::LaunchStatus::Error), model_ability: None },
        )
        .await;

    Ok(())
}
