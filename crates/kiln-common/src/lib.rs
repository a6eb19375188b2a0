pub mod endpoint;
pub mod errors;
pub mod model_cache;
pub mod model_request;
pub mod model_spec;
pub mod node_status;
pub mod telemetry;
pub mod uid;

pub use endpoint::{EndpointStats, LaunchStatus, ModelAbilities};
pub use errors::{WorkerError, WorkerResult};
pub use model_cache::{DownloadPhase, DownloadProgress, ModelCacheEntry};
pub use model_request::{
    DownloadHub, GpuPreference, LaunchArgs, ModelType, PeftAdapter, PeftModelConfig, RequestLimits,
    XavierConfig,
};
pub use model_spec::{ModelDescription, ModelSource};
pub use node_status::{GpuStatus, NodeStatus};
pub use uid::{origin_uid, parse_replica_model_uid, strip_rank0_suffix};
