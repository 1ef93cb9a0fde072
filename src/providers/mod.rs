//! Provider adapters and the static constructor table.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use reqwest::{Client, Response};

use crate::error::{LlmError, Result};
use crate::traits::{
    resolve_default_model, Capability, Model, ModelService, ModelStatus, ProviderId, ServiceConfig,
};

pub mod anthropic;
pub mod mock;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicService;
pub use mock::MockService;
pub use ollama::OllamaService;
pub use openai::OpenAIService;

/// Construct the adapter for `provider`.
///
/// Every known backend is registered here; adding a provider means adding
/// an arm.
pub fn construct(provider: ProviderId, config: ServiceConfig) -> Result<Arc<dyn ModelService>> {
    let service: Arc<dyn ModelService> = match provider {
        ProviderId::Ollama => Arc::new(OllamaService::new(config)?),
        ProviderId::OpenAI => Arc::new(OpenAIService::new(config)?),
        ProviderId::Anthropic => Arc::new(AnthropicService::new(config)?),
    };
    Ok(service)
}

/// HTTP client honouring the configured timeout.
pub(crate) fn http_client(config: &ServiceConfig) -> Result<Client> {
    Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| LlmError::ConfigError(format!("Failed to create HTTP client: {}", e)))
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Pass successful responses through; turn the rest into a transport error.
pub(crate) async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(LlmError::from_status(status.as_u16(), body))
}

/// Model id for a call: explicit option, else the configured default (chat
/// only), else the service's default for `capability`.
pub(crate) async fn resolve_model(
    service: &dyn ModelService,
    config: &ServiceConfig,
    requested: Option<&String>,
    capability: Capability,
) -> Result<String> {
    if let Some(id) = requested {
        return Ok(id.clone());
    }
    if capability == Capability::Chat {
        if let Some(id) = &config.default_model {
            return Ok(id.clone());
        }
    }
    service.default_model(Some(capability)).await
}

/// Load/last-used bookkeeping shared by all adapters.
#[derive(Debug, Default)]
pub struct ActiveModels {
    loaded: RwLock<HashSet<String>>,
    last_used: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl ActiveModels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_loaded(&self, id: &str) {
        self.write_loaded().insert(id.to_string());
        self.touch(id);
    }

    /// Returns whether the model was loaded.
    pub fn unload(&self, id: &str) -> bool {
        self.write_loaded().remove(id)
    }

    pub fn touch(&self, id: &str) {
        let mut last_used = self.last_used.write().unwrap_or_else(|p| p.into_inner());
        last_used.insert(id.to_string(), Utc::now());
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.loaded
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains(id)
    }

    pub fn last_used(&self, id: &str) -> Option<DateTime<Utc>> {
        self.last_used
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .copied()
    }

    /// Copy the loaded flag and last-used timestamp onto listed models.
    pub fn annotate(&self, models: Vec<Model>) -> Vec<Model> {
        models
            .into_iter()
            .map(|mut m| {
                m.loaded = self.is_loaded(&m.id);
                m.last_used = self.last_used(&m.id);
                m
            })
            .collect()
    }

    fn write_loaded(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<String>> {
        self.loaded.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Built-in model table for hosted providers without a discovery endpoint.
///
/// Loading and unloading are bookkeeping only.
#[derive(Debug)]
pub struct StaticCatalog {
    provider: ProviderId,
    models: Vec<Model>,
    active: ActiveModels,
}

impl StaticCatalog {
    pub fn new(provider: ProviderId, models: Vec<Model>) -> Self {
        Self {
            provider,
            models,
            active: ActiveModels::new(),
        }
    }

    pub fn models(&self) -> Vec<Model> {
        self.active.annotate(self.models.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.iter().any(|m| m.id == id)
    }

    /// `ModelNotFound` unless `id` is in the table.
    pub fn ensure_known(&self, id: &str) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(LlmError::ModelNotFound {
                model: id.to_string(),
                provider: self.provider.to_string(),
            })
        }
    }

    pub fn load(&self, id: &str) -> Result<()> {
        self.ensure_known(id)?;
        self.active.mark_loaded(id);
        Ok(())
    }

    pub fn unload(&self, id: &str) {
        self.active.unload(id);
    }

    pub fn touch(&self, id: &str) {
        self.active.touch(id);
    }

    pub fn active(&self) -> Vec<Model> {
        self.models().into_iter().filter(|m| m.loaded).collect()
    }

    pub fn status(&self, id: &str) -> Result<ModelStatus> {
        self.ensure_known(id)?;
        Ok(ModelStatus {
            model_id: id.to_string(),
            available: true,
            loaded: self.active.is_loaded(id),
            last_used: self.active.last_used(id),
        })
    }

    pub fn default_model(&self, configured: Option<&str>, capability: Option<Capability>) -> Result<String> {
        resolve_default_model(configured, &self.models(), capability).ok_or_else(|| {
            LlmError::ModelNotFound {
                model: "<default>".to_string(),
                provider: self.provider.to_string(),
            }
        })
    }
}
