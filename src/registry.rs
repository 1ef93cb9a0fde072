//! Model registry: which models are reachable right now.
//!
//! # Detection
//!
//! ```text
//!   ┌─ ollama.list_models() ────┐
//!   ├─ openai.list_models() ────┼──► join_all ──► dedupe ──► pick default ──► swap table
//!   └─ anthropic.list_models() ─┘
//! ```
//!
//! All sources are queried concurrently and the registry waits for every
//! outcome. A failing source is logged and recorded in
//! [`ModelRegistry::detection_errors`]; its models are simply absent.
//!
//! The detected table is immutable once built and replaced wholesale on each
//! sweep, so readers never observe a half-updated registry.
//!
//! # Default selection
//!
//! 1. The configured default model, if detected
//! 2. The first detected model from the fallback list
//! 3. The first chat-capable model
//! 4. The first model

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use tracing::{info, warn};

use crate::config::ConfigManager;
use crate::providers;
use crate::traits::{Capability, DetectedModel, ModelService, ProviderId};

/// One provider the registry asks for models.
#[derive(Clone)]
pub struct DetectionSource {
    pub provider: ProviderId,
    pub service: Arc<dyn ModelService>,
}

impl std::fmt::Debug for DetectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionSource")
            .field("provider", &self.provider)
            .finish()
    }
}

/// Result of one detection sweep.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub models: Vec<DetectedModel>,
    pub errors: BTreeMap<ProviderId, String>,
    pub default_model: Option<String>,
}

/// Detected-model table with default-model selection.
#[derive(Debug)]
pub struct ModelRegistry {
    sources: Vec<DetectionSource>,
    default_model: Option<String>,
    fallback_models: Vec<String>,
    /// Providers whose adapter could not be built at all.
    unbuildable: BTreeMap<ProviderId, String>,
    table: RwLock<Arc<Detection>>,
}

impl ModelRegistry {
    /// Registry over explicit sources.
    pub fn new(
        sources: Vec<DetectionSource>,
        default_model: Option<String>,
        fallback_models: Vec<String>,
    ) -> Self {
        Self {
            sources,
            default_model,
            fallback_models,
            unbuildable: BTreeMap::new(),
            table: RwLock::new(Arc::new(Detection::default())),
        }
    }

    /// One adapter per enabled provider, configured from `config`.
    ///
    /// An adapter that cannot be built is recorded as a detection error.
    pub fn from_config(config: &ConfigManager) -> Self {
        let router = config.config();
        let mut sources = Vec::new();
        let mut errors = BTreeMap::new();

        for provider in router.enabled_providers() {
            match providers::construct(provider, config.service_config(provider)) {
                Ok(service) => sources.push(DetectionSource { provider, service }),
                Err(e) => {
                    warn!(%provider, error = %e, "Failed to construct detection adapter");
                    errors.insert(provider, e.to_string());
                }
            }
        }

        let mut registry = Self::new(
            sources,
            router.default_model.clone(),
            router.fallback_models.clone(),
        );
        registry.swap(Detection {
            errors: errors.clone(),
            ..Default::default()
        });
        registry.unbuildable = errors;
        registry
    }

    /// Run the first detection sweep.
    pub async fn initialize(&self) -> Arc<Detection> {
        self.refresh().await
    }

    /// Query every source and replace the table. Never fails; unreachable
    /// providers contribute no models.
    pub async fn refresh(&self) -> Arc<Detection> {
        let outcomes = join_all(self.sources.iter().map(|source| async move {
            (source.provider, source.service.list_models().await)
        }))
        .await;

        let mut seen = HashSet::new();
        let mut detection = Detection {
            errors: self.unbuildable.clone(),
            ..Default::default()
        };
        for (provider, outcome) in outcomes {
            match outcome {
                Ok(models) => {
                    for model in models {
                        if seen.insert(model.id.clone()) {
                            detection.models.push(DetectedModel::available(model, provider));
                        }
                    }
                }
                Err(e) => {
                    warn!(%provider, error = %e, "Model detection failed");
                    detection.errors.insert(provider, e.to_string());
                }
            }
        }
        detection.default_model = self.select_default(&detection.models);

        info!(
            models = detection.models.len(),
            failed_providers = detection.errors.len(),
            default = detection.default_model.as_deref().unwrap_or("<none>"),
            "Model detection complete"
        );
        self.swap(detection)
    }

    fn select_default(&self, models: &[DetectedModel]) -> Option<String> {
        let detected = |id: &str| models.iter().any(|m| m.id() == id);

        self.default_model
            .iter()
            .chain(self.fallback_models.iter())
            .find(|id| detected(id))
            .cloned()
            .or_else(|| {
                models
                    .iter()
                    .find(|m| m.model.supports(Capability::Chat))
                    .or_else(|| models.first())
                    .map(|m| m.id().to_string())
            })
    }

    fn swap(&self, detection: Detection) -> Arc<Detection> {
        let detection = Arc::new(detection);
        *self.table.write().unwrap_or_else(|p| p.into_inner()) = detection.clone();
        detection
    }

    /// Current table.
    pub fn snapshot(&self) -> Arc<Detection> {
        self.table.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn available_models(&self) -> Vec<DetectedModel> {
        self.snapshot().models.clone()
    }

    pub fn default_model(&self) -> Option<String> {
        self.snapshot().default_model.clone()
    }

    pub fn get(&self, id: &str) -> Option<DetectedModel> {
        self.snapshot().models.iter().find(|m| m.id() == id).cloned()
    }

    /// Per-provider error from the last sweep.
    pub fn detection_errors(&self) -> BTreeMap<ProviderId, String> {
        self.snapshot().errors.clone()
    }

    pub fn sources(&self) -> &[DetectionSource] {
        &self.sources
    }
}
