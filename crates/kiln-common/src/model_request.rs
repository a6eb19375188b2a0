use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Model family/category. Drives both GPU allocation policy (embedding/
/// rerank models can share a GPU; the others cannot) and the abilities
/// computed after a successful launch (§4.E "After commit").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    #[serde(rename = "LLM")]
    Llm,
    Embedding,
    Rerank,
    Image,
    Audio,
    Video,
    Flexible,
}

impl ModelType {
    /// Whether this model type shares GPUs rather than exclusively owning
    /// them (§4.A `AllocateForEmbedding` candidates).
    pub fn is_shareable(self) -> bool {
        matches!(self, ModelType::Embedding | ModelType::Rerank)
    }
}

/// Hub to resolve model artifacts from when a download is required.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadHub {
    Huggingface,
    Modelscope,
    OpenmindHub,
    Csghub,
}

/// GPU preference attached to a launch request: either an automatic count
/// (`n_gpu`) or an explicit, caller-chosen set of device indices
/// (`gpu_idx`). Mutually exclusive — §4.E pre-validation step 3 coerces
/// `gpu_idx` to a list and, if present, ignores `n_gpu` entirely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum GpuPreference {
    /// `n_gpu` is absent — no GPU requested (CPU-only).
    None,
    /// `n_gpu="auto"` — let the Device Accountant decide the count.
    Auto,
    /// `n_gpu=<n>` — request exactly `n` GPUs, accountant picks which.
    Count(u32),
    /// `gpu_idx=[...]` — caller pins specific device indices.
    Pinned(Vec<u32>),
}

/// A single LoRA (or similar) adapter to attach at load time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeftAdapter {
    pub lora_name: String,
    pub local_path: String,
}

/// PEFT adapter configuration for a launch. Rejected outright for
/// embedding/rerank model types and for `(LLM, format=ggufv2)` — see §4.E
/// pre-validation step 5.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PeftModelConfig {
    #[serde(default)]
    pub peft_model: Vec<PeftAdapter>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_lora_load_kwargs: Option<HashMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_lora_fuse_kwargs: Option<HashMap<String, String>>,
}

/// Per-replica serving limits passed through to the Model Actor at creation.
/// Opaque to the Worker beyond validation that it parses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestLimits(pub u32);

/// Xavier (multi-replica coordination) configuration. Populated by the
/// caller for ordinary replicas and by the Worker itself for the rank-0
/// fast path (`LaunchRank0`), which injects `rank_address`, `store_address`
/// and `store_port` before creating the coordinator actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct XavierConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_port: Option<u16>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// The verbatim snapshot of a launch call, stored in the Model Table at
/// commit time and replayed unchanged by the Recovery Controller.
///
/// Grounded in the original's `locals()` capture at the top of
/// `launch_builtin_model` — rather than reflect over a call frame, this is
/// declared as a record up front and passed through unmodified (§9 design
/// note: "do not try to reflect it").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchArgs {
    pub model_uid: String,
    pub model_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_size_in_billions: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_format: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_engine: Option<String>,

    #[serde(default = "default_model_type")]
    pub model_type: ModelType,

    #[serde(default)]
    pub gpu: GpuPreference,

    #[serde(default = "default_n_worker")]
    pub n_worker: u32,

    #[serde(default)]
    pub shard: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_info: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peft_model_config: Option<PeftModelConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_limits: Option<RequestLimits>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_hub: Option<DownloadHub>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_virtual_env: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_env_packages: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envs: Option<HashMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xavier_config: Option<XavierConfig>,

    /// Catch-all for family-specific extensions, mirroring the original's
    /// `**kwargs`.
    #[serde(flatten)]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl Default for GpuPreference {
    fn default() -> Self {
        GpuPreference::None
    }
}

fn default_model_type() -> ModelType {
    ModelType::Llm
}

fn default_n_worker() -> u32 {
    1
}
