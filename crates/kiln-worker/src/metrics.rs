//! Metrics exporter bootstrap (§4.K [EXPANDED]).
//!
//! A background axum HTTP server on a dedicated OS thread with its own
//! current-thread runtime, matching the Health Reporter's isolation
//! rationale (§4.G) so the metrics endpoint answers even if the main
//! runtime is saturated. A bounded `std::sync::mpsc` handshake, busy-polled
//! with a short deadline, stands in for the original's `queue.Queue`
//! startup-confirmation pattern: if the thread dies before reporting its
//! bound address, construction fails fast rather than silently serving
//! nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);
const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Process-wide counters the exporter renders. Cheap to clone (`Arc`
/// internally); every component that wants to be observable holds one.
#[derive(Default)]
pub struct WorkerMetrics {
    pub launches_total: AtomicU64,
    pub launch_failures_total: AtomicU64,
    pub terminations_total: AtomicU64,
    pub recoveries_total: AtomicU64,
}

impl WorkerMetrics {
    pub fn record_launch_attempt(&self) {
        self.launches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_launch_failure(&self) {
        self.launch_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_termination(&self) {
        self.terminations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self) {
        self.recoveries_total.fetch_add(1, Ordering::Relaxed);
    }
}

fn render(metrics: &WorkerMetrics) -> String {
    format!(
        "kiln_worker_launches_total {}\nkiln_worker_launch_failures_total {}\nkiln_worker_terminations_total {}\nkiln_worker_recoveries_total {}\n",
        metrics.launches_total.load(Ordering::Relaxed),
        metrics.launch_failures_total.load(Ordering::Relaxed),
        metrics.terminations_total.load(Ordering::Relaxed),
        metrics.recoveries_total.load(Ordering::Relaxed),
    )
}

async fn metrics_handler(State(metrics): State<Arc<WorkerMetrics>>) -> impl IntoResponse {
    (axum::http::StatusCode::OK, render(&metrics))
}

/// Spawns the exporter thread and blocks (briefly) until it has bound its
/// listener, returning the address it actually bound to. Fails fast
/// (`anyhow::bail!`) if the thread dies or the handshake times out.
pub fn spawn_metrics_exporter(
    metrics: Arc<WorkerMetrics>,
    host: String,
    port: u16,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<std::net::SocketAddr> {
    let (tx, rx) = std_mpsc::channel::<anyhow::Result<std::net::SocketAddr>>();

    let handle = std::thread::Builder::new()
        .name("kiln-metrics-exporter".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = tx.send(Err(anyhow::anyhow!("failed to build metrics runtime: {e}")));
                    return;
                }
            };
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::bind((host.as_str(), port)).await {
                    Ok(l) => l,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow::anyhow!("failed to bind {host}:{port}: {e}")));
                        return;
                    }
                };
                let addr = match listener.local_addr() {
                    Ok(a) => a,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow::anyhow!(e)));
                        return;
                    }
                };
                let _ = tx.send(Ok(addr));

                let router = Router::new().route("/metrics", get(metrics_handler)).with_state(metrics);
                let serve = axum::serve(listener, router);
                tokio::select! {
                    result = serve => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, "metrics exporter server error");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!("metrics exporter shutting down");
                    }
                }
            });
        })?;

    let deadline = Instant::now() + HANDSHAKE_DEADLINE;
    loop {
        match rx.try_recv() {
            Ok(Ok(addr)) => return Ok(addr),
            Ok(Err(e)) => return Err(e),
            Err(std_mpsc::TryRecvError::Empty) => {
                if handle.is_finished() {
                    anyhow::bail!("metrics exporter thread exited before completing handshake");
                }
                if Instant::now() >= deadline {
                    anyhow::bail!("metrics exporter handshake timed out after {HANDSHAKE_DEADLINE:?}");
                }
                std::thread::sleep(HANDSHAKE_POLL_INTERVAL);
            }
            Err(std_mpsc::TryRecvError::Disconnected) => {
                anyhow::bail!("metrics exporter thread dropped its handshake channel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_zeroed_counters() {
        let metrics = WorkerMetrics::default();
        let body = render(&metrics);
        assert!(body.contains("kiln_worker_launches_total 0"));
    }

    #[test]
    fn record_helpers_increment_the_matching_counter() {
        let metrics = WorkerMetrics::default();
        metrics.record_launch_attempt();
        metrics.record_launch_failure();
        metrics.record_termination();
        metrics.record_recovery();
        let body = render(&metrics);
        assert!(body.contains("kiln_worker_launches_total 1"));
        assert!(body.contains("kiln_worker_launch_failures_total 1"));
        assert!(body.contains("kiln_worker_terminations_total 1"));
        assert!(body.contains("kiln_worker_recoveries_total 1"));
    }
}
