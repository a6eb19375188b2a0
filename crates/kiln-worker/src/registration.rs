//! Registration Facade (§4.H).
//!
//! Each model family's registration catalog (spec parsing, register,
//! unregister, describe) is an opaque external collaborator (§1 Non-goals)
//! — the Worker only needs a uniform way to dispatch into whichever one a
//! given `ModelType` names. `video` is wired read-only per spec: it
//! participates in description/version listing but never in user-defined
//! registration (§9 open question — left as-is, undocumented upstream).

use std::collections::HashMap;
use std::sync::Arc;

use kiln_common::{ModelType, WorkerError};

use crate::outbound::SupervisorClient;

/// A parsed, family-specific registration payload. Kept opaque — the
/// Worker never looks inside it beyond handing it to the family's own
/// functions.
pub type RegistrationSpec = serde_json::Value;

/// One user-defined registration entry, as returned by `ListRegistrations`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RegistrationEntry {
    pub model_name: String,
    pub spec: RegistrationSpec,
}

pub trait ModelFamilyCatalog: Send + Sync {
    fn parse_spec(&self, json: &str) -> Result<RegistrationSpec, WorkerError>;
    fn register(&self, spec: RegistrationSpec, persist: bool) -> Result<(), WorkerError>;
    fn unregister(&self, model_name: &str, raise_error: bool) -> Result<(), WorkerError>;
    fn list(&self, detailed: bool) -> Vec<RegistrationEntry>;
    fn get(&self, model_name: &str) -> Option<RegistrationEntry>;
    /// Version info for every entry, merged for `record_model_version`.
    fn describe_all(&self) -> HashMap<String, serde_json::Value>;
}

/// Read-only stand-in for `video`: participates in description/version
/// listing but rejects user-defined registration outright.
pub struct ReadOnlyCatalog;

impl ModelFamilyCatalog for ReadOnlyCatalog {
    fn parse_spec(&self, _json: &str) -> Result<RegistrationSpec, WorkerError> {
        Err(WorkerError::Unsupported("registration is read-only for this model type".to_string()))
    }
    fn register(&self, _spec: RegistrationSpec, _persist: bool) -> Result<(), WorkerError> {
        Err(WorkerError::Unsupported("registration is read-only for this model type".to_string()))
    }
    fn unregister(&self, _model_name: &str, _raise_error: bool) -> Result<(), WorkerError> {
        Err(WorkerError::Unsupported("registration is read-only for this model type".to_string()))
    }
    fn list(&self, _detailed: bool) -> Vec<RegistrationEntry> {
        Vec::new()
    }
    fn get(&self, _model_name: &str) -> Option<RegistrationEntry> {
        None
    }
    fn describe_all(&self) -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }
}

pub struct RegistrationFacade {
    catalogs: HashMap<ModelType, Arc<dyn ModelFamilyCatalog>>,
}

impl RegistrationFacade {
    pub fn new(mut catalogs: HashMap<ModelType, Arc<dyn ModelFamilyCatalog>>) -> Self {
        catalogs.entry(ModelType::Video).or_insert_with(|| Arc::new(ReadOnlyCatalog));
        Self { catalogs }
    }

    fn catalog(&self, model_type: ModelType) -> Result<&Arc<dyn ModelFamilyCatalog>, WorkerError> {
        self.catalogs
            .get(&model_type)
            .ok_or_else(|| WorkerError::InvalidArg(format!("unknown model type {model_type:?}")))
    }

    /// `Register(type, json, persist)`: parse, register, push version info
    /// to the Cache Tracker. On Cache Tracker failure, roll back via
    /// `unregister` (best-effort) and re-raise.
    pub async fn register(
        &self,
        model_type: ModelType,
        json: &str,
        persist: bool,
        supervisor: &SupervisorClient,
    ) -> Result<(), WorkerError> {
        let catalog = self.catalog(model_type)?;
        let spec = catalog.parse_spec(json)?;
        let model_name = spec
            .get("model_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| WorkerError::InvalidArg("registration payload missing model_name".to_string()))?
            .to_string();

        catalog.register(spec, persist)?;

        let descriptions = catalog.describe_all();
        let to_push: HashMap<String, kiln_common::ModelDescription> = descriptions
            .into_iter()
            .filter_map(|(k, v)| serde_json::from_value(v).ok().map(|d| (k, d)))
            .collect();

        if let Err(e) = supervisor.record_model_version(&model_name, &to_push).await {
            let _ = catalog.unregister(&model_name, false);
            return Err(e);
        }
        Ok(())
    }

    pub fn unregister(&self, model_type: ModelType, model_name: &str) -> Result<(), WorkerError> {
        self.catalog(model_type)?.unregister(model_name, true)
    }

    /// Returns user-defined entries only, sorted by lowercased `model_name`.
    pub fn list_registrations(&self, model_type: ModelType, detailed: bool) -> Result<Vec<RegistrationEntry>, WorkerError> {
        let mut entries = self.catalog(model_type)?.list(detailed);
        entries.sort_by_key(|e| e.model_name.to_lowercase());
        Ok(entries)
    }

    pub fn get_registration(&self, model_type: ModelType, model_name: &str) -> Result<Option<RegistrationEntry>, WorkerError> {
        Ok(self.catalog(model_type)?.get(model_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_is_read_only_by_default() {
        let facade = RegistrationFacade::new(HashMap::new());
        let err = facade.unregister(ModelType::Video, "anything").unwrap_err();
        assert!(matches!(err, WorkerError::Unsupported(_)));
        assert!(facade.list_registrations(ModelType::Video, false).unwrap().is_empty());
    }
}
