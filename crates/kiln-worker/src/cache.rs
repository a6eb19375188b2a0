//! Cache/Deletion (§4.J, [EXPANDED]).
//!
//! Physical filesystem deletion the Worker performs on behalf of the Cache
//! Tracker interface. Grounded directly in the original's
//! `list_deletable_models`/`confirm_and_remove_model`: the Cache Tracker
//! resolves a model version to a single path; if that path is a file its
//! parent directory is the real target; everything inside that directory
//! (plus a sibling "tensorizer" directory, if present) is deletable.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use kiln_common::WorkerError;

use crate::outbound::SupervisorClient;

/// List the on-disk paths that would be removed for `model_version`,
/// without deleting anything.
pub async fn list_deletable_paths(
    supervisor: &SupervisorClient,
    model_version: &str,
) -> Result<Vec<PathBuf>, WorkerError> {
    let resolved = supervisor.list_deletable_models(model_version).await?;
    let Some(raw_path) = resolved.into_iter().next() else {
        return Ok(Vec::new());
    };

    let mut path = PathBuf::from(raw_path);
    if path.is_file() {
        path = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(path);
    }

    let mut paths: HashSet<PathBuf> = HashSet::new();
    if path.is_dir() {
        if let Ok(entries) = tokio::fs::read_dir(&path).await {
            collect_dir_entries(entries, &mut paths).await;
        }

        // Resolve symlinks to their real targets too, matching the
        // original's "search real path" pass.
        let mut real_paths = HashSet::new();
        for p in &paths {
            if let Ok(real) = tokio::fs::canonicalize(p).await {
                real_paths.insert(real);
            }
        }
        paths.extend(real_paths);

        let tensorizer_dir = tensorizer_dir_for(&path);
        if tensorizer_dir.is_dir() {
            if let Ok(entries) = tokio::fs::read_dir(&tensorizer_dir).await {
                collect_dir_entries(entries, &mut paths).await;
            }
        }
    }

    Ok(paths.into_iter().collect())
}

async fn collect_dir_entries(mut entries: tokio::fs::ReadDir, out: &mut HashSet<PathBuf>) {
    while let Ok(Some(entry)) = entries.next_entry().await {
        out.insert(entry.path());
    }
}

/// A sibling "tensorizer" directory kept alongside the resolved model
/// directory by some LLM backends, named `<model_dir>_tensorizer` in the
/// same parent rather than nested inside `model_dir`.
fn tensorizer_dir_for(model_dir: &Path) -> PathBuf {
    let name = model_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    match model_dir.parent() {
        Some(parent) => parent.join(format!("{name}_tensorizer")),
        None => PathBuf::from(format!("{name}_tensorizer")),
    }
}

/// Delete every path from [`list_deletable_paths`], then their now-empty
/// enclosing directories, then confirm with the Cache Tracker. Returns
/// `false` (without raising) on the first deletion failure, matching the
/// original's "log and return false" behavior.
pub async fn confirm_and_remove_model(
    supervisor: &SupervisorClient,
    model_version: &str,
) -> Result<bool, WorkerError> {
    let paths = list_deletable_paths(supervisor, model_version).await?;
    let mut dir_paths: HashSet<PathBuf> = HashSet::new();

    for path in &paths {
        if let Some(parent) = path.parent() {
            dir_paths.insert(parent.to_path_buf());
        }

        let meta = tokio::fs::symlink_metadata(path).await;
        let result = match meta {
            Ok(m) if m.file_type().is_symlink() => tokio::fs::remove_file(path).await,
            Ok(m) if m.is_file() => tokio::fs::remove_file(path).await,
            Ok(m) if m.is_dir() => tokio::fs::remove_dir_all(path).await,
            _ => {
                tracing::debug!(?path, "not a valid path to delete");
                continue;
            }
        };
        if let Err(e) = result {
            tracing::error!(?path, error = %e, "failed to delete cache path");
            return Ok(false);
        }
    }

    for dir in &dir_paths {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(?dir, error = %e, "failed to delete parent dir");
                return Ok(false);
            }
        }
    }

    supervisor.confirm_and_remove_model(model_version).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensorizer_dir_is_a_sibling_of_model_dir() {
        let model_dir = Path::new("/data/models/qwen2.5-7b");
        assert_eq!(
            tensorizer_dir_for(model_dir),
            PathBuf::from("/data/models/qwen2.5-7b_tensorizer")
        );
    }
}
