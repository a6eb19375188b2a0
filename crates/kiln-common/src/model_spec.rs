use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Source of model files — determines how the Worker resolves model files
/// (download vs. a local path already present on disk).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    HuggingFace,
    ModelScope,
    #[default]
    Local,
    Csghub,
}

/// The serialized model description stored in the Model Table alongside a
/// replica's handle.
///
/// Grounded in the original's `model.model_family.to_description()`: a
/// free-form snapshot of the model family's static facts (name, size,
/// format, quantization, revision) plus whatever extra fields that model
/// type's family attaches. Produced once at launch commit time and returned
/// verbatim by `describe_model`/`list_models`; the Worker never interprets
/// its contents beyond passing them through.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelDescription {
    pub model_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_size_in_billions: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_format: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_revision: Option<String>,

    pub model_source: ModelSource,

    /// Free-form fields the model family attaches on top of the above (e.g.
    /// LoRA adapter names, context length). Kept opaque: the Worker passes
    /// these through rather than interpreting them.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}
