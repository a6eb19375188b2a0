//! Health/Status Reporter (§4.G).
//!
//! Runs on its own OS thread with its own single-threaded `tokio` runtime,
//! isolated from the main multi-threaded runtime so a busy main loop never
//! stalls the periodic push to the Supervisor. Grounded in the teacher's
//! `heartbeat.rs` loop shape (periodic gather + push, log-and-continue on
//! transient failure) generalized from container-health polling to the
//! spec's `gather_node_info`/`report_worker_status` contract.

use std::sync::Arc;
use std::time::Duration;

use crate::launch::WorkerCtx;
use crate::worker::gather_node_status;

/// Spawns the isolated health loop on a dedicated OS thread. Returns a
/// `JoinHandle` the caller can use to detect the thread dying unexpectedly;
/// the loop itself exits only when `ctx.shutdown` fires.
pub fn spawn_health_reporter(ctx: Arc<WorkerCtx>, interval: Duration) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("kiln-health-reporter".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build health reporter runtime");
                    return;
                }
            };
            runtime.block_on(health_loop(ctx, interval));
        })
        .expect("failed to spawn health reporter thread")
}

async fn health_loop(ctx: Arc<WorkerCtx>, interval: Duration) {
    tracing::info!(?interval, "health reporter started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = ctx.shutdown.cancelled() => {
                tracing::info!("health reporter shutting down");
                return;
            }
        }

        let status = gather_node_status(&ctx).await;
        ctx.supervisor.report_worker_status(&status).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_is_positive() {
        assert!(Duration::from_secs(30) > Duration::ZERO);
    }
}
