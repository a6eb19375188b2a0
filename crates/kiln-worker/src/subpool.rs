//! Sub-Pool Broker (§4.B): a thin adapter over the process-pool primitive.
//!
//! The primitive itself — what a "sub-pool" actually is once spawned — is
//! out of this crate's scope (§1 Non-goals); the broker only knows how to
//! start one as a child process with an environment and an optional
//! interpreter override, address it, and tear it down. Unexpected death is
//! reported by forwarding the address on an unbounded channel rather than
//! invoking a callback directly from the reaping task — the recovery
//! controller drains that channel on the Worker's own main loop, so no
//! Worker state is ever mutated from outside it (§9 design note).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use kiln_common::WorkerError;

/// Emitted when a sub-pool this broker owns exits without having been asked
/// to via [`SubPoolBroker::remove_sub_pool`].
#[derive(Debug, Clone)]
pub struct SubPoolDied {
    pub address: String,
}

/// Shared so the reaper can poll `try_wait()` without holding the map lock
/// for the whole process lifetime, while `remove_sub_pool` can still reach
/// in and `kill()` concurrently.
type SharedChild = Arc<Mutex<Child>>;

pub struct SubPoolBroker {
    /// The binary hosting the sub-pool runtime when no interpreter override
    /// is given. Out of scope to specify further — the broker only needs to
    /// be able to launch *something* addressable.
    default_interpreter: String,
    entries: Arc<Mutex<HashMap<String, SharedChild>>>,
    removing: Arc<Mutex<HashSet<String>>>,
    death_tx: mpsc::UnboundedSender<SubPoolDied>,
}

impl SubPoolBroker {
    pub fn new(default_interpreter: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<SubPoolDied>) {
        let (death_tx, death_rx) = mpsc::unbounded_channel();
        (
            Self {
                default_interpreter: default_interpreter.into(),
                entries: Arc::new(Mutex::new(HashMap::new())),
                removing: Arc::new(Mutex::new(HashSet::new())),
                death_tx,
            },
            death_rx,
        )
    }

    /// Spawn a new sub-pool and return its address.
    pub async fn create_sub_pool(
        &self,
        env: HashMap<String, String>,
        interpreter: Option<String>,
    ) -> Result<String, WorkerError> {
        let program = interpreter.unwrap_or_else(|| self.default_interpreter.clone());
        let address = format!("subpool-{}", uuid::Uuid::new_v4());

        let mut cmd = Command::new(&program);
        cmd.envs(env.iter())
            .env("KILN_SUBPOOL_ADDRESS", &address)
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            WorkerError::Downstream(anyhow::anyhow!("failed to spawn sub-pool {address}: {e}"))
        })?;

        let shared: SharedChild = Arc::new(Mutex::new(child));
        self.entries.lock().await.insert(address.clone(), shared);

        self.spawn_reaper(address.clone());
        Ok(address)
    }

    /// Polls `try_wait()` on a short interval rather than calling the
    /// borrowing `wait()` directly — that would tie a future to the guard
    /// protecting this entry, which `remove_sub_pool` also needs to lock to
    /// `kill()` concurrently.
    fn spawn_reaper(&self, address: String) {
        let entries = self.entries.clone();
        let removing = self.removing.clone();
        let death_tx = self.death_tx.clone();

        tokio::spawn(async move {
            let child = {
                let guard = entries.lock().await;
                match guard.get(&address) {
                    Some(c) => c.clone(),
                    None => return,
                }
            };

            let status = loop {
                let mut locked = child.lock().await;
                match locked.try_wait() {
                    Ok(Some(status)) => break Ok(status),
                    Ok(None) => {
                        drop(locked);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Err(e) => break Err(e),
                }
            };

            entries.lock().await.remove(&address);
            let was_intentional = removing.lock().await.remove(&address);
            if !was_intentional {
                match status {
                    Ok(status) => tracing::warn!(%address, %status, "sub-pool exited unexpectedly"),
                    Err(_) => tracing::warn!(%address, "sub-pool wait() failed"),
                }
                let _ = death_tx.send(SubPoolDied { address });
            }
        });
    }

    /// Remove a sub-pool. `force` kills it immediately; otherwise this just
    /// marks it for removal and kills it (the primitive offers no graceful
    /// shutdown contract beyond "remove").
    pub async fn remove_sub_pool(&self, address: &str, _force: bool) -> Result<(), WorkerError> {
        self.removing.lock().await.insert(address.to_string());

        let child = {
            let mut entries = self.entries.lock().await;
            entries.remove(address)
        };
        match child {
            Some(child) => {
                let _ = child.lock().await.kill().await;
                Ok(())
            }
            None => {
                // Already gone — removal of an unknown address is tolerated
                // everywhere this is called from (Terminate, launch failure
                // cleanup both treat "not found" as success).
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn removing_unknown_address_is_a_no_op() {
        let (broker, _rx) = SubPoolBroker::new("true");
        broker.remove_sub_pool("does-not-exist", true).await.unwrap();
    }
}
