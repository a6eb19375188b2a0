//! Process entry point: parses configuration, wires every component behind
//! a single [`WorkerCtx`], spawns the Health Reporter, Recovery Controller,
//! and Metrics Exporter as independent long-running tasks/threads, and waits
//! for graceful shutdown (§6 "trigger_exit", SIGINT).

mod cache;
mod config;
mod device;
mod downloader;
mod factory;
mod gpu;
mod heartbeat;
mod launch;
mod metrics;
mod model_actor;
mod model_table;
mod outbound;
mod progress;
mod recovery;
mod registration;
mod subpool;
mod venv;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;

use config::{Args, WorkerConfig};
use kiln_common::telemetry::{self, LogFormat};
use kiln_common::ModelType;
use kiln_meta::{EtcdMetaStore, MetaStore};
use launch::WorkerCtx;
use model_actor::{InMemoryModelActorTransport, ModelActorTransport};
use model_table::WorkerState;
use outbound::SupervisorClient;
use registration::RegistrationFacade;
use subpool::SubPoolBroker;
use worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_format = LogFormat::parse(&args.log_format);
    let _otel_guard = telemetry::init_tracing(
        "kiln-worker",
        log_format,
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );

    tracing::info!(node_id = %args.node_id, "kiln-worker starting");

    if let Err(e) = tokio::fs::remove_dir_all(&args.cache_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(cache_dir = ?args.cache_dir, error = %e, "failed to purge cache dir at startup");
        }
    }
    tokio::fs::create_dir_all(&args.cache_dir).await.ok();

    let discovered_gpus = if args.auto_discover_gpus {
        Some(gpu::discover_total_gpus().await)
    } else {
        None
    };
    let config = WorkerConfig::from_args(&args, discovered_gpus);
    tracing::info!(total_gpus = ?config.total_gpus, "device set resolved");

    let store: Arc<dyn MetaStore> = Arc::new(
        EtcdMetaStore::connect(&[args.etcd_endpoint.clone()])
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect to etcd at {}: {e}", args.etcd_endpoint))?,
    );

    let supervisor = Arc::new(SupervisorClient::new(store, config.node_id.clone()));
    let (subpool, death_rx) = SubPoolBroker::new(config.default_interpreter.clone());
    let subpool = Arc::new(subpool);

    let transport: Arc<dyn ModelActorTransport> = Arc::new(InMemoryModelActorTransport::new());

    let default_factory: Arc<dyn factory::ModelFamilyFactory> = Arc::new(factory::LocalPathModelFamilyFactory);
    let mut factories: HashMap<ModelType, Arc<dyn factory::ModelFamilyFactory>> = HashMap::new();
    for model_type in [
        ModelType::Llm,
        ModelType::Embedding,
        ModelType::Rerank,
        ModelType::Image,
        ModelType::Audio,
        ModelType::Video,
        ModelType::Flexible,
    ] {
        factories.insert(model_type, default_factory.clone());
    }

    let worker_address = format!("{}:worker", config.node_id);
    let worker_metrics = Arc::new(metrics::WorkerMetrics::default());
    let ctx = Arc::new(WorkerCtx {
        state: Arc::new(tokio::sync::Mutex::new(WorkerState::new(config.total_gpus.clone()))),
        config: config.clone(),
        subpool,
        supervisor: supervisor.clone(),
        transport,
        factories,
        worker_address,
        metrics: worker_metrics.clone(),
        shutdown: tokio_util::sync::CancellationToken::new(),
    });

    if let Err(e) = supervisor.ensure_connected(true, true).await {
        tracing::warn!(error = %e, "initial supervisor connect failed, continuing anyway");
    }

    tokio::spawn(recovery::recovery_loop(ctx.clone(), death_rx));

    let health_handle = if config.health_check_enabled {
        Some(heartbeat::spawn_health_reporter(
            ctx.clone(),
            std::time::Duration::from_secs(config.health_check_interval_secs),
        ))
    } else {
        None
    };

    if config.metrics_enabled {
        let host = config.metrics_host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        let port = config.metrics_port.unwrap_or(0);
        let addr = metrics::spawn_metrics_exporter(worker_metrics, host, port, ctx.shutdown.clone())?;
        tracing::info!(%addr, "metrics exporter listening");
    }

    let registrations = RegistrationFacade::new(HashMap::new());
    let worker = Arc::new(Worker::new(ctx.clone(), registrations));
    // `worker` is the façade a transport layer (gRPC/HTTP, wired at the
    // process boundary per the outbound-collaborator design) would dispatch
    // inbound calls onto; kept alive here so its presence is unambiguous
    // even before such a layer exists.
    let _worker = worker;

    #[cfg(unix)]
    {
        let sigint_ctx = ctx.clone();
        let sigint_supervisor = supervisor.clone();
        tokio::spawn(async move {
            if let Ok(mut sigint) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("received SIGINT, shutting down");
                sigint_ctx.shutdown.cancel();
                let _ = sigint_supervisor.remove_worker().await;
            }
        });
    }

    ctx.shutdown.cancelled().await;
    if let Some(handle) = health_handle {
        let _ = handle.join();
    }
    tracing::info!("kiln-worker exiting");
    Ok(())
}
