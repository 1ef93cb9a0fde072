//! Service factory: one decorated service per detected model.
//!
//! # Pipeline
//!
//! Every service handed out is built once, in a fixed order:
//!
//! ```text
//! caller ──► MetricsService ──► CachingService ──► adapter ──► network
//! ```
//!
//! Metrics and caching are each optional (see [`crate::config::CacheSettings`]
//! and [`crate::config::MetricsSettings`]); when present they always sit in
//! this order. All metrics decorators share one [`UsageStore`].
//!
//! # Refresh
//!
//! [`ServiceFactory::refresh`] re-runs detection and builds a new service
//! table. Handles returned earlier keep pointing at the old instances.
//!
//! # Example
//!
//! ```rust,ignore
//! use edgequake_router::{ConfigManager, ServiceFactory};
//!
//! let factory = ServiceFactory::new(ConfigManager::load()?);
//! factory.initialize().await;
//!
//! let service = factory.resolve(None)?;
//! let response = service.complete("Hello", &Default::default()).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::cache::CachingService;
use crate::config::ConfigManager;
use crate::error::{LlmError, Result};
use crate::metrics::{MetricsService, UsageStore};
use crate::providers;
use crate::registry::ModelRegistry;
use crate::traits::{DetectedModel, ModelService, ProviderId, ServiceConfig};

/// Builds the adapter for one provider. [`providers::construct`] unless
/// replaced with [`ServiceFactory::with_constructor`].
pub type Constructor =
    Arc<dyn Fn(ProviderId, ServiceConfig) -> Result<Arc<dyn ModelService>> + Send + Sync>;

#[derive(Default)]
struct ServiceTable {
    services: HashMap<String, Arc<dyn ModelService>>,
    /// Model ids in detection order.
    order: Vec<String>,
    default: Option<String>,
}

/// Detected models mapped to ready-to-use services.
pub struct ServiceFactory {
    config: ConfigManager,
    registry: ModelRegistry,
    constructor: Constructor,
    usage: UsageStore,
    table: RwLock<Arc<ServiceTable>>,
}

impl std::fmt::Debug for ServiceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceFactory")
            .field("models", &self.model_ids())
            .field("default", &self.default_model())
            .finish()
    }
}

impl ServiceFactory {
    /// Factory over a registry built from `config`.
    pub fn new(config: ConfigManager) -> Self {
        let registry = ModelRegistry::from_config(&config);
        Self::with_registry(config, registry)
    }

    /// Factory over an explicit registry.
    pub fn with_registry(config: ConfigManager, registry: ModelRegistry) -> Self {
        Self {
            config,
            registry,
            constructor: Arc::new(providers::construct),
            usage: UsageStore::new(),
            table: RwLock::new(Arc::new(ServiceTable::default())),
        }
    }

    /// Replace the adapter constructor.
    pub fn with_constructor<F>(mut self, constructor: F) -> Self
    where
        F: Fn(ProviderId, ServiceConfig) -> Result<Arc<dyn ModelService>> + Send + Sync + 'static,
    {
        self.constructor = Arc::new(constructor);
        self
    }

    /// Detect models and build their services.
    pub async fn initialize(&self) {
        self.refresh().await;
    }

    /// Re-run detection and rebuild every service. Returns the number of
    /// services now available.
    pub async fn refresh(&self) -> usize {
        let detection = self.registry.refresh().await;

        let mut table = ServiceTable::default();
        for detected in &detection.models {
            let id = detected.id().to_string();
            match self.build(detected) {
                Ok(service) => {
                    table.order.push(id.clone());
                    table.services.insert(id, service);
                }
                Err(e) => warn!(model = %id, error = %e, "Failed to construct service"),
            }
        }

        table.default = detection
            .default_model
            .clone()
            .filter(|id| table.services.contains_key(id))
            .or_else(|| table.order.first().cloned());

        let count = table.services.len();
        info!(
            services = count,
            default = table.default.as_deref().unwrap_or("<none>"),
            "Service factory ready"
        );
        *self.table.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(table);
        count
    }

    fn build(&self, detected: &DetectedModel) -> Result<Arc<dyn ModelService>> {
        let settings = self.config.config();
        let service_config = self
            .config
            .service_config(detected.provider)
            .with_default_model(detected.id());

        let mut service = (self.constructor)(detected.provider, service_config)?;
        if settings.cache.enabled {
            service = Arc::new(CachingService::new(service, settings.cache.to_cache_config()));
        }
        if settings.metrics.enabled {
            service = Arc::new(MetricsService::new(service, self.usage.clone()));
        }
        debug!(model = %detected.id(), provider = %detected.provider, "Built service");
        Ok(service)
    }

    fn table(&self) -> Arc<ServiceTable> {
        self.table.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Service for `id`, or `ModelNotFound`.
    pub fn service(&self, id: &str) -> Result<Arc<dyn ModelService>> {
        self.table()
            .services
            .get(id)
            .cloned()
            .ok_or_else(|| LlmError::ModelNotFound {
                model: id.to_string(),
                provider: self
                    .registry
                    .get(id)
                    .map(|m| m.provider.to_string())
                    .unwrap_or_else(|| "router".to_string()),
            })
    }

    pub fn default_service(&self) -> Option<Arc<dyn ModelService>> {
        let table = self.table();
        table.default.as_ref().and_then(|id| table.services.get(id).cloned())
    }

    pub fn default_model(&self) -> Option<String> {
        self.table().default.clone()
    }

    /// Explicit id, else the default service.
    pub fn resolve(&self, id: Option<&str>) -> Result<Arc<dyn ModelService>> {
        match id {
            Some(id) => self.service(id),
            None => self.default_service().ok_or_else(|| LlmError::ModelNotFound {
                model: "<default>".to_string(),
                provider: "router".to_string(),
            }),
        }
    }

    /// Ids with a service, in detection order.
    pub fn model_ids(&self) -> Vec<String> {
        self.table().order.clone()
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    /// Counters shared by every metrics decorator this factory builds.
    pub fn usage(&self) -> &UsageStore {
        &self.usage
    }
}
