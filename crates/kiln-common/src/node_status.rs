use serde::{Deserialize, Serialize};

/// Per-GPU snapshot gathered off-loop by the Health/Status Reporter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuStatus {
    pub index: u32,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utilization_pct: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f32>,
}

/// The node-wide status snapshot pushed to `supervisor.report_worker_status`.
///
/// Grounded in the original's `gather_node_info()` (CPU/mem/GPU util,
/// bounded by a 2-second timeout per §4.G and §5) — the `.resource` module
/// that produces it is not part of this node's code, so the exact field set
/// is inferred from the spec's "gather node info (CPU/mem/GPU util)"
/// description rather than copied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    pub node_id: String,
    pub last_heartbeat_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_utilization_pct: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_bytes: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_total_bytes: Option<u64>,

    #[serde(default)]
    pub gpus: Vec<GpuStatus>,
}
