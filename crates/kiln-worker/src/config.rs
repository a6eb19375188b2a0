//! Construction-time configuration (§6 "Environment", §9 design note:
//! "treat environment reads as construction-time configuration injected
//! into the Worker").
//!
//! [`Args`] is the `clap`-parsed process entry point; [`WorkerConfig`] is
//! the plain struct derived from it once at startup and threaded through
//! every component instead of re-reading the environment later.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "kiln-worker", about = "Per-node model-serving worker")]
pub struct Args {
    #[arg(long, env = "KILN_NODE_ID", default_value = "node_1")]
    pub node_id: String,

    #[arg(long, env = "KILN_ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    /// Comma-separated GPU indices this worker may allocate from. Empty
    /// means CPU-only.
    #[arg(long, env = "KILN_GPUS", value_delimiter = ',')]
    pub gpus: Vec<u32>,

    /// Auto-discover `total_gpus` via `nvidia-smi` instead of trusting
    /// `--gpus`.
    #[arg(long, env = "KILN_AUTO_DISCOVER_GPUS", default_value_t = false)]
    pub auto_discover_gpus: bool,

    /// Environment variable name the sub-pool reads to learn which GPUs it
    /// may see. Defaults to `CUDA_VISIBLE_DEVICES` (§4.E step 3).
    #[arg(long, env = "KILN_GPU_VISIBILITY_VAR", default_value = "CUDA_VISIBLE_DEVICES")]
    pub gpu_visibility_env_var: String,

    #[arg(long, env = "KILN_DISABLE_HEALTH_CHECK", default_value_t = false)]
    pub disable_health_check: bool,

    #[arg(long, env = "KILN_HEALTH_CHECK_INTERVAL_SECS", default_value_t = 30)]
    pub health_check_interval_secs: u64,

    #[arg(long, env = "KILN_DISABLE_METRICS", default_value_t = false)]
    pub disable_metrics: bool,

    #[arg(long, env = "KILN_METRICS_HOST")]
    pub metrics_host: Option<String>,

    #[arg(long, env = "KILN_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// `None` means unlimited recovery attempts per replica (§3 invariant 4).
    #[arg(long, env = "KILN_AUTO_RECOVER_LIMIT")]
    pub auto_recover_limit: Option<u32>,

    #[arg(long, env = "KILN_VIRTUAL_ENV_ENABLED", default_value_t = false)]
    pub virtual_env_enabled: bool,

    #[arg(long, env = "KILN_VIRTUAL_ENV_SKIP_INSTALLED", default_value_t = true)]
    pub virtual_env_skip_installed: bool,

    #[arg(long, env = "KILN_VIRTUAL_ENV_ROOT", default_value = "/tmp/kiln/venvs")]
    pub virtual_env_root: PathBuf,

    /// Purged at startup (§6 "Persisted state").
    #[arg(long, env = "KILN_CACHE_DIR", default_value = "/tmp/kiln/cache")]
    pub cache_dir: PathBuf,

    /// Interpreter/binary used to host a sub-pool when no venv override
    /// applies.
    #[arg(long, env = "KILN_DEFAULT_INTERPRETER", default_value = "python3")]
    pub default_interpreter: String,

    #[arg(long, env = "XTRACE_URL")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "XTRACE_TOKEN")]
    pub otlp_token: Option<String>,

    #[arg(long, env = "KILN_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Derived, immutable configuration threaded through the Worker's
/// components. Built once from [`Args`] plus whatever host probing
/// (`--auto-discover-gpus`) happened at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub node_id: String,
    pub total_gpus: Vec<u32>,
    pub gpu_visibility_env_var: String,
    pub health_check_enabled: bool,
    pub health_check_interval_secs: u64,
    pub metrics_enabled: bool,
    pub metrics_host: Option<String>,
    pub metrics_port: Option<u16>,
    pub auto_recover_limit: Option<u32>,
    pub virtual_env_enabled: bool,
    pub virtual_env_skip_installed: bool,
    pub virtual_env_root: PathBuf,
    pub cache_dir: PathBuf,
    pub default_interpreter: String,
}

impl WorkerConfig {
    pub fn from_args(args: &Args, discovered_gpus: Option<Vec<u32>>) -> Self {
        let total_gpus = discovered_gpus.unwrap_or_else(|| args.gpus.clone());
        Self {
            node_id: args.node_id.clone(),
            total_gpus,
            gpu_visibility_env_var: args.gpu_visibility_env_var.clone(),
            health_check_enabled: !args.disable_health_check,
            health_check_interval_secs: args.health_check_interval_secs,
            metrics_enabled: !args.disable_metrics,
            metrics_host: args.metrics_host.clone(),
            metrics_port: args.metrics_port,
            auto_recover_limit: args.auto_recover_limit,
            virtual_env_enabled: args.virtual_env_enabled,
            virtual_env_skip_installed: args.virtual_env_skip_installed,
            virtual_env_root: args.virtual_env_root.clone(),
            cache_dir: args.cache_dir.clone(),
            default_interpreter: args.default_interpreter.clone(),
        }
    }

    /// §6 "gpu preferences": the literal value to set the GPU visibility
    /// env var to for a given set of allocated accelerators, or `None` when
    /// the variable should be omitted entirely (CPU-only `auto`).
    pub fn gpu_visibility_value(&self, accelerators: Option<&[u32]>) -> Option<String> {
        match accelerators {
            Some(ids) if !ids.is_empty() => Some(
                ids.iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            Some(_) => Some("-1".to_string()),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            node_id: "node-1".to_string(),
            etcd_endpoint: "http://127.0.0.1:2379".to_string(),
            gpus: vec![0, 1],
            auto_discover_gpus: false,
            gpu_visibility_env_var: "CUDA_VISIBLE_DEVICES".to_string(),
            disable_health_check: false,
            health_check_interval_secs: 30,
            disable_metrics: false,
            metrics_host: None,
            metrics_port: None,
            auto_recover_limit: None,
            virtual_env_enabled: false,
            virtual_env_skip_installed: true,
            virtual_env_root: PathBuf::from("/tmp/venvs"),
            cache_dir: PathBuf::from("/tmp/cache"),
            default_interpreter: "python3".to_string(),
            otlp_endpoint: None,
            otlp_token: None,
            log_format: "pretty".to_string(),
        }
    }

    #[test]
    fn auto_discovery_overrides_the_explicit_gpu_list() {
        let args = base_args();
        let config = WorkerConfig::from_args(&args, Some(vec![2, 3, 4]));
        assert_eq!(config.total_gpus, vec![2, 3, 4]);
    }

    #[test]
    fn no_discovery_falls_back_to_the_explicit_gpu_list() {
        let args = base_args();
        let config = WorkerConfig::from_args(&args, None);
        assert_eq!(config.total_gpus, vec![0, 1]);
    }

    #[test]
    fn disable_flags_invert_into_enabled_flags() {
        let mut args = base_args();
        args.disable_health_check = true;
        args.disable_metrics = true;
        let config = WorkerConfig::from_args(&args, None);
        assert!(!config.health_check_enabled);
        assert!(!config.metrics_enabled);
    }

    #[test]
    fn gpu_visibility_value_is_none_for_cpu_only_auto() {
        let config = WorkerConfig::from_args(&base_args(), None);
        assert_eq!(config.gpu_visibility_value(None), None);
    }

    #[test]
    fn gpu_visibility_value_joins_multiple_indices() {
        let config = WorkerConfig::from_args(&base_args(), None);
        assert_eq!(config.gpu_visibility_value(Some(&[0, 2, 5])), Some("0,2,5".to_string()));
    }

    #[test]
    fn gpu_visibility_value_is_sentinel_for_empty_pinned_set() {
        let config = WorkerConfig::from_args(&base_args(), None);
        assert_eq!(config.gpu_visibility_value(Some(&[])), Some("-1".to_string()));
    }
}
