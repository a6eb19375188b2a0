//! VirtualEnv Preparer (§4.C).
//!
//! Creates and populates an isolated package environment per model family,
//! rooted under the worker's configured virtualenv directory. Grounded in
//! the original's `_create_virtual_env_manager`/`_prepare_virtual_env`
//! (`uv`-backed; the actual package manager invocation is shelled out to
//! `uv`, matching the original's choice of backend name).

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use kiln_common::WorkerError;

/// Settings carried on a `LaunchArgs.envs`/family config for package
/// installation — merged with any caller-supplied extra packages.
#[derive(Debug, Clone, Default)]
pub struct VirtualEnvSettings {
    pub packages: Vec<String>,
    pub inherit_pip_config: bool,
    pub index_url: Option<String>,
    pub extra_index_url: Option<String>,
}

#[derive(Clone)]
pub struct VenvManagerHandle {
    pub env_path: PathBuf,
    cancel: CancellationToken,
}

impl VenvManagerHandle {
    pub fn env_path(&self) -> &PathBuf {
        &self.env_path
    }

    pub fn cancel_install(&self) {
        self.cancel.cancel();
    }
}

/// `EnsureEnv`: if disabled globally or per-launch, returns `None`.
/// Otherwise creates a `uv`-backed venv rooted at `<virtual_env_root>/<name
/// or model_uid>`.
pub async fn ensure_env(
    globally_enabled: bool,
    per_launch_enable: Option<bool>,
    virtual_env_root: &std::path::Path,
    name: &str,
    skip_installed: bool,
) -> Result<Option<VenvManagerHandle>, WorkerError> {
    let enabled = per_launch_enable.unwrap_or(globally_enabled);
    if !enabled {
        return Ok(None);
    }

    let env_path = virtual_env_root.join(name);
    tokio::fs::create_dir_all(&env_path).await.map_err(|e| {
        WorkerError::Downstream(anyhow::anyhow!("failed to create virtualenv dir {env_path:?}: {e}"))
    })?;

    let python_path = std::env::current_exe().ok();

    let mut cmd = Command::new("uv");
    cmd.arg("venv").arg(&env_path);
    if let Some(py) = &python_path {
        cmd.arg("--python").arg(py);
    }
    if skip_installed {
        cmd.arg("--seed");
    }
    cmd.stdout(Stdio::null()).stderr(Stdio::piped());

    let output = cmd.output().await.map_err(|e| {
        WorkerError::Downstream(anyhow::anyhow!("failed to run `uv venv`: {e}"))
    })?;
    if !output.status.success() {
        return Err(WorkerError::Downstream(anyhow::anyhow!(
            "uv venv failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(Some(VenvManagerHandle {
        env_path,
        cancel: CancellationToken::new(),
    }))
}

/// `InstallPackages`: merges inherited pip config, combines
/// `settings.packages + extra_packages`, and runs the install.
pub async fn install_packages(
    manager: &VenvManagerHandle,
    settings: Option<&VirtualEnvSettings>,
    extra_packages: &[String],
) -> Result<(), WorkerError> {
    let Some(settings) = settings else {
        return Ok(());
    };
    if settings.packages.is_empty() && extra_packages.is_empty() {
        return Ok(());
    }

    let mut packages = settings.packages.clone();
    packages.extend(extra_packages.iter().cloned());

    let mut cmd = Command::new("uv");
    cmd.arg("pip")
        .arg("install")
        .arg("--python")
        .arg(manager.env_path.join("bin").join("python"));

    if let Some(url) = &settings.index_url {
        cmd.arg("--index-url").arg(url);
    }
    if let Some(url) = &settings.extra_index_url {
        cmd.arg("--extra-index-url").arg(url);
    }
    cmd.args(&packages);
    cmd.stdout(Stdio::null()).stderr(Stdio::piped());

    tracing::info!(env_path = ?manager.env_path, ?packages, "installing virtualenv packages");

    let mut child = cmd.spawn().map_err(|e| {
        WorkerError::Downstream(anyhow::anyhow!("failed to spawn `uv pip install`: {e}"))
    })?;

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| WorkerError::Downstream(anyhow::anyhow!(e)))?;
            if !status.success() {
                return Err(WorkerError::Downstream(anyhow::anyhow!("uv pip install exited with {status}")));
            }
            Ok(())
        }
        _ = manager.cancel.cancelled() => {
            let _ = child.kill().await;
            Err(WorkerError::Cancelled("Launch cancelled".to_string()))
        }
    }
}
