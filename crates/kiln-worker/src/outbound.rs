//! Supervisor Client (§4.I) and the narrow interfaces it fronts: Status
//! Guard, Event Collector, Cache Tracker, Progress Tracker (§6 "Outbound").
//!
//! All five are realized as typed key/value operations against a single
//! [`MetaStore`] handle — the re-architecture §9 calls for ("`xo.actor_ref`
//! becomes 'obtain client handle'"), generalizing the teacher's
//! `EtcdMetaStore` from a placement-reconciliation substrate into the
//! Worker's RPC transport to its remote collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use kiln_common::{LaunchStatus, ModelAbilities, ModelDescription, NodeStatus, WorkerError};
use kiln_meta::MetaStore;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub event_ts: u64,
    pub event_content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstanceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LaunchStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_ability: Option<ModelAbilities>,
}

fn to_json(v: &impl Serialize) -> Vec<u8> {
    serde_json::to_vec(v).expect("value is always serializable")
}

/// Lazy, idempotent handle to the Worker's remote collaborators. A single
/// `connected` latch stands in for the original's four separately-resolved
/// actor refs — all four live behind the same store, so one handshake
/// covers them.
pub struct SupervisorClient {
    store: Arc<dyn MetaStore>,
    node_id: String,
    connected: OnceCell<()>,
}

impl SupervisorClient {
    pub fn new(store: Arc<dyn MetaStore>, node_id: String) -> Self {
        Self {
            store,
            node_id,
            connected: OnceCell::new(),
        }
    }

    /// `GetSupervisor(add_worker)`: connects at most once; if this is the
    /// first connect and the Model Table is empty, registers this node.
    pub async fn ensure_connected(&self, add_worker: bool, model_table_empty: bool) -> Result<(), WorkerError> {
        let mut first_connect = false;
        self.connected
            .get_or_try_init(|| async {
                first_connect = true;
                Ok::<_, WorkerError>(())
            })
            .await?;

        if first_connect && add_worker && model_table_empty {
            self.add_worker().await?;
        }
        Ok(())
    }

    // ---- Supervisor ----

    pub async fn add_worker(&self) -> Result<(), WorkerError> {
        self.store
            .put(&format!("/workers/{}", self.node_id), to_json(&true), None)
            .await
            .map(|_| ())
            .map_err(downstream)
    }

    pub async fn remove_worker(&self) -> Result<(), WorkerError> {
        self.store
            .delete(&format!("/workers/{}", self.node_id))
            .await
            .map(|_| ())
            .map_err(downstream)
    }

    /// Transient: failures here are logged and swallowed (§7 propagation).
    pub async fn report_worker_status(&self, status: &NodeStatus) {
        let key = format!("/worker_status/{}", self.node_id);
        if let Err(e) = self.store.put(&key, to_json(status), Some(30_000)).await {
            tracing::warn!(error = %e, node_id = %self.node_id, "report_worker_status failed");
        }
    }

    pub async fn get_model(&self, origin_uid: &str) -> Result<Option<ModelDescription>, WorkerError> {
        let key = format!("/models/{origin_uid}/spec");
        match self.store.get(&key).await.map_err(downstream)? {
            Some((bytes, _rev)) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| WorkerError::Downstream(anyhow::anyhow!(e))),
            None => Ok(None),
        }
    }

    /// Device Accountant probe (§4.A rationale): "is this replica vLLM-backed?"
    /// Transient failures resolve to `false` rather than blocking allocation.
    pub async fn is_vllm_backed(&self, replica_uid: &str) -> bool {
        let key = format!("/model_engine/{replica_uid}");
        match self.store.get(&key).await {
            Ok(Some((bytes, _))) => String::from_utf8_lossy(&bytes).eq_ignore_ascii_case("vllm"),
            _ => false,
        }
    }

    pub async fn register_rank(&self, origin_uid: &str, rank: u32, address: &str) -> Result<(), WorkerError> {
        let key = format!("/collective/{origin_uid}/rank/{rank}");
        self.store.put(&key, address.as_bytes().to_vec(), None).await.map(|_| ()).map_err(downstream)
    }

    pub async fn unregister_rank(&self, origin_uid: &str, rank: u32) -> Result<(), WorkerError> {
        let key = format!("/collective/{origin_uid}/rank/{rank}");
        self.store.delete(&key).await.map(|_| ()).map_err(downstream)
    }

    // ---- Status Guard ----

    pub async fn update_instance_info(&self, origin_uid: &str, info: InstanceInfo) {
        let key = format!("/instance_info/{origin_uid}");
        if let Err(e) = self.store.put(&key, to_json(&info), None).await {
            tracing::warn!(error = %e, %origin_uid, "update_instance_info failed");
        }
    }

    pub async fn clear_instance_info(&self, origin_uid: &str) {
        let key = format!("/instance_info/{origin_uid}");
        if let Err(e) = self.store.delete(&key).await {
            tracing::warn!(error = %e, %origin_uid, "clear_instance_info failed");
        }
    }

    // ---- Event Collector ----

    /// Best-effort: callers log and continue on failure (§4.E step 2).
    pub async fn report_event(&self, origin_uid: &str, event_type: EventType, content: impl Into<String>) {
        let event = Event {
            event_type,
            event_ts: now_ms(),
            event_content: content.into(),
        };
        let key = format!("/events/{origin_uid}/{}", event.event_ts);
        if let Err(e) = self.store.put(&key, to_json(&event), Some(3_600_000)).await {
            tracing::error!(error = %e, %origin_uid, "report_event failed");
        }
    }

    // ---- Cache Tracker ----

    pub async fn record_model_version(&self, model_name: &str, descriptions: &HashMap<String, ModelDescription>) -> Result<(), WorkerError> {
        let key = format!("/model_cache_versions/{}/{model_name}", self.node_id);
        self.store.put(&key, to_json(descriptions), None).await.map(|_| ()).map_err(downstream)
    }

    pub async fn update_cache_status(&self, model_name: &str, version: Option<u32>, model_path: &str) -> Result<(), WorkerError> {
        let key = format!("/model_cache/{}/{model_name}", self.node_id);
        #[derive(Serialize)]
        struct Status<'a> {
            version: Option<u32>,
            model_path: &'a str,
        }
        self.store
            .put(&key, to_json(&Status { version, model_path }), None)
            .await
            .map(|_| ())
            .map_err(downstream)
    }

    pub async fn list_cached_models(&self) -> Result<Vec<kiln_common::ModelCacheEntry>, WorkerError> {
        let entries = self.store.list_prefix(&format!("/model_cache/{}/", self.node_id)).await.map_err(downstream)?;
        entries
            .into_iter()
            .map(|(_, bytes, _)| serde_json::from_slice(&bytes).map_err(|e| WorkerError::Downstream(anyhow::anyhow!(e))))
            .collect()
    }

    pub async fn list_deletable_models(&self, model_name: &str) -> Result<Vec<String>, WorkerError> {
        let key = format!("/model_cache/{}/{model_name}", self.node_id);
        match self.store.get(&key).await.map_err(downstream)? {
            Some((bytes, _)) => {
                let entry: kiln_common::ModelCacheEntry =
                    serde_json::from_slice(&bytes).map_err(|e| WorkerError::Downstream(anyhow::anyhow!(e)))?;
                Ok(vec![entry.cache_path])
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn confirm_and_remove_model(&self, model_name: &str) -> Result<(), WorkerError> {
        let key = format!("/model_cache/{}/{model_name}", self.node_id);
        self.store.delete(&key).await.map(|_| ()).map_err(downstream)
    }

    // ---- Progress Tracker ----

    pub async fn progress_start(&self, uid: &str) {
        let key = format!("/progress/launching-{uid}");
        #[derive(Serialize)]
        struct P {
            fraction: f64,
            label: Option<String>,
        }
        let _ = self.store.put(&key, to_json(&P { fraction: 0.0, label: None }), None).await;
    }

    pub async fn progress_set(&self, uid: &str, fraction: f64, label: Option<&str>) {
        let key = format!("/progress/launching-{uid}");
        #[derive(Serialize)]
        struct P<'a> {
            fraction: f64,
            label: Option<&'a str>,
        }
        let _ = self.store.put(&key, to_json(&P { fraction, label }), None).await;
    }

    pub async fn progress_end(&self, uid: &str) {
        let key = format!("/progress/launching-{uid}");
        let _ = self.store.delete(&key).await;
    }
}

fn downstream(e: anyhow::Error) -> WorkerError {
    WorkerError::Downstream(e)
}
