use serde::{Deserialize, Serialize};

/// Status a replica reports to the Status Guard interface over its launch
/// lifetime. Mirrors the original's `LaunchStatus` enum (`CREATING`,
/// `READY`, `ERROR`, `TERMINATING`, `TERMINATED`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LaunchStatus {
    Creating,
    Ready,
    Error,
    Terminating,
    Terminated,
}

/// The abilities a loaded model instance exposes, reported to the Status
/// Guard alongside `LaunchStatus::Ready`. Fixed vocabularies for
/// embedding/rerank/flexible model types; LLM, image, audio and video model
/// types surface whatever abilities the underlying model family declares.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ModelAbilities(pub Vec<String>);

impl ModelAbilities {
    pub fn embed() -> Self {
        Self(vec!["embed".to_string()])
    }

    pub fn rerank() -> Self {
        Self(vec!["rerank".to_string()])
    }

    pub fn flexible() -> Self {
        Self(vec!["flexible".to_string()])
    }
}

/// Per-replica serving statistics, scraped from the sub-pool and forwarded
/// to the Event Collector on request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointStats {
    pub model_uid: String,
    pub replica_id: u32,
    pub last_updated_ms: u64,

    pub pending_requests: u64,

    pub prefix_cache_hit_rate: Option<f64>,
    pub prompt_cache_hit_rate: Option<f64>,

    pub kv_cache_used_bytes: Option<u64>,
    pub kv_cache_free_bytes: Option<u64>,
}
