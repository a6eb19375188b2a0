//! Model-family factory boundary (§1 Non-goals: "model-family registration
//! catalogs ... the core treats each as an opaque quadruple"). The fourth
//! member of that quadruple relevant here is artifact resolution: the
//! factory that `Launch` calls off-loop to resolve and instantiate a model
//! once its bytes are local (§4.E step 4, "Downloaded").
//!
//! Distinct from [`crate::registration::ModelFamilyCatalog`], which governs
//! user-defined registration (§4.H) — the two concerns are separate in the
//! original per-family modules and stay separate here.

use async_trait::async_trait;

use kiln_common::{LaunchArgs, ModelDescription, ModelType, WorkerError};

use crate::downloader::DownloaderHandle;

/// What a successful `CreateModelInstance` call hands back. The Launch
/// Controller attaches `sub_pool_address`/`accelerators` after the fact
/// (§4.E step 4, "attach sub-pool address, chosen accelerators ... to the
/// returned model family") rather than the factory knowing about either.
#[derive(Debug, Clone)]
pub struct ModelInstance {
    pub description: ModelDescription,
    /// Abilities declared by the family itself; only consulted for
    /// model types without a fixed vocabulary (§4.E "After commit").
    pub declared_abilities: Vec<String>,
    /// Whether this model needs one additional sub-pool per device
    /// (§4.E step 7, "ExtraPoolsUp").
    pub needs_extra_pools: bool,
    pub virtualenv_packages: Vec<String>,
    pub multimodal_projector: Option<String>,
}

/// Dispatched by `model_type`. A single factory instance may serve more
/// than one `ModelType`, mirroring the original's per-family modules that
/// each cover one or a handful of related types.
#[async_trait]
pub trait ModelFamilyFactory: Send + Sync {
    /// Blocks (off the main scheduling loop — callers must
    /// `spawn_blocking` or otherwise offload this) until artifacts are
    /// resolved locally, then constructs the model instance.
    async fn create_model_instance(
        &self,
        args: &LaunchArgs,
        accelerators: &[u32],
        downloader: &DownloaderHandle,
    ) -> Result<ModelInstance, WorkerError>;
}

/// §4.E "After commit": abilities computed by a type-dispatched helper —
/// fixed vocabularies for embedding/rerank/flexible, declared abilities
/// for everything else (LLM, image, audio, video).
pub fn compute_abilities(model_type: ModelType, instance: &ModelInstance) -> Vec<String> {
    match model_type {
        ModelType::Embedding => vec!["embed".to_string()],
        ModelType::Rerank => vec!["rerank".to_string()],
        ModelType::Flexible => vec!["flexible".to_string()],
        ModelType::Llm | ModelType::Image | ModelType::Audio | ModelType::Video => {
            instance.declared_abilities.clone()
        }
    }
}

/// A minimal factory that resolves artifacts already present at
/// `args.model_path` (§1 Non-goals: real family-specific resolution —
/// download, format conversion, multimodal projector discovery — lives in
/// the model-family registration catalogs this crate treats as opaque).
/// Used to wire the binary end-to-end before a real family plugs in;
/// `InMemoryModelActorTransport` plays the same role for the actor side.
pub struct LocalPathModelFamilyFactory;

#[async_trait]
impl ModelFamilyFactory for LocalPathModelFamilyFactory {
    async fn create_model_instance(
        &self,
        args: &LaunchArgs,
        _accelerators: &[u32],
        downloader: &DownloaderHandle,
    ) -> Result<ModelInstance, WorkerError> {
        if downloader.is_cancelled() {
            return Err(downloader.raise_cancelled());
        }
        let source = if args.model_path.is_some() {
            kiln_common::ModelSource::Local
        } else {
            match args.download_hub {
                Some(kiln_common::DownloadHub::Huggingface) | None => kiln_common::ModelSource::HuggingFace,
                Some(kiln_common::DownloadHub::Modelscope) => kiln_common::ModelSource::ModelScope,
                Some(kiln_common::DownloadHub::Csghub) => kiln_common::ModelSource::Csghub,
                Some(kiln_common::DownloadHub::OpenmindHub) => kiln_common::ModelSource::HuggingFace,
            }
        };
        downloader.report_progress(1.0);
        downloader.mark_done();

        Ok(ModelInstance {
            description: kiln_common::ModelDescription {
                model_name: args.model_name.clone(),
                model_size_in_billions: args.model_size_in_billions.clone(),
                model_format: args.model_format.clone(),
                quantization: args.quantization.clone(),
                model_revision: None,
                model_source: source,
                extra: std::collections::HashMap::new(),
            },
            declared_abilities: vec!["generate".to_string()],
            needs_extra_pools: false,
            virtualenv_packages: Vec::new(),
            multimodal_projector: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::ModelSource;

    fn instance() -> ModelInstance {
        ModelInstance {
            description: ModelDescription {
                model_name: "m".to_string(),
                model_source: ModelSource::Local,
                ..Default::default()
            },
            declared_abilities: vec!["generate".to_string(), "chat".to_string()],
            needs_extra_pools: false,
            virtualenv_packages: Vec::new(),
            multimodal_projector: None,
        }
    }

    #[test]
    fn fixed_vocabularies_override_declared_abilities() {
        assert_eq!(compute_abilities(ModelType::Embedding, &instance()), vec!["embed"]);
        assert_eq!(compute_abilities(ModelType::Rerank, &instance()), vec!["rerank"]);
    }

    #[test]
    fn llm_uses_declared_abilities() {
        assert_eq!(
            compute_abilities(ModelType::Llm, &instance()),
            vec!["generate".to_string(), "chat".to_string()]
        );
    }

    fn args_with(model_path: Option<&str>, download_hub: Option<kiln_common::DownloadHub>) -> LaunchArgs {
        LaunchArgs {
            model_uid: "f-0".to_string(),
            model_name: "f".to_string(),
            model_size_in_billions: None,
            model_format: None,
            quantization: None,
            model_engine: None,
            model_type: ModelType::Llm,
            gpu: kiln_common::GpuPreference::None,
            n_worker: 1,
            shard: 0,
            driver_info: None,
            peft_model_config: None,
            request_limits: None,
            download_hub,
            model_path: model_path.map(str::to_string),
            enable_virtual_env: None,
            virtual_env_packages: None,
            envs: None,
            xavier_config: None,
            extensions: std::collections::HashMap::new(),
        }
    }

    #[tokio::test]
    async fn local_path_factory_resolves_local_source_when_model_path_is_set() {
        let factory = LocalPathModelFamilyFactory;
        let downloader = DownloaderHandle::new(async_cancel());
        let args = args_with(Some("/tmp/whatever"), None);
        let instance = factory.create_model_instance(&args, &[], &downloader).await.unwrap();
        assert_eq!(instance.description.model_source, ModelSource::Local);
        assert!(downloader.is_done());
    }

    #[tokio::test]
    async fn local_path_factory_infers_source_from_download_hub() {
        let factory = LocalPathModelFamilyFactory;
        let downloader = DownloaderHandle::new(async_cancel());
        let args = args_with(None, Some(kiln_common::DownloadHub::Modelscope));
        let instance = factory.create_model_instance(&args, &[], &downloader).await.unwrap();
        assert_eq!(instance.description.model_source, ModelSource::ModelScope);
    }

    #[tokio::test]
    async fn local_path_factory_raises_cancelled_when_already_cancelled() {
        let factory = LocalPathModelFamilyFactory;
        let cancel = async_cancel();
        cancel.cancel();
        let downloader = DownloaderHandle::new(cancel);
        let args = args_with(Some("/tmp/whatever"), None);
        let err = factory.create_model_instance(&args, &[], &downloader).await.unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled(_)));
    }

    fn async_cancel() -> tokio_util::sync::CancellationToken {
        tokio_util::sync::CancellationToken::new()
    }
}
