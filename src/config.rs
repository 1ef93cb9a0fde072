//! Router configuration.
//!
//! # Configuration File Location
//!
//! The config file is loaded from (in order of priority):
//! 1. `EDGEQUAKE_ROUTER_CONFIG` environment variable
//! 2. `./edgequake-router.json` (current working directory)
//! 3. `~/.edgequake/router.json` (user config)
//! 4. Built-in defaults
//!
//! A path ending in `.toml` is read and written as TOML; anything else is JSON.
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "default_model": "llama3.1:8b",
//!   "fallback_models": ["gpt-4o-mini", "claude-3-5-haiku-20241022"],
//!   "providers": {
//!     "ollama": { "base_url": "http://gpu-box:11434", "timeout_secs": 300 },
//!     "anthropic": { "enabled": false }
//!   },
//!   "cache": { "max_entries": 500, "completion_ttl_secs": 600 },
//!   "metrics": { "enabled": true }
//! }
//! ```
//!
//! Credentials are never stored in the file. They come from the
//! environment: `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`. Base URLs fall back
//! to `OLLAMA_HOST`, `OPENAI_BASE_URL` and `ANTHROPIC_BASE_URL` when the
//! file does not set one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::CacheConfig;
use crate::error::LlmError;
use crate::providers::{anthropic, ollama, openai};
use crate::traits::{ProviderId, ServiceConfig};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "EDGEQUAKE_ROUTER_CONFIG";

const LOCAL_CONFIG: &str = "edgequake-router.json";

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur when loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or write the configuration file.
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse or serialize the configuration.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// Invalid configuration values.
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// `save` on a configuration that has no backing file.
    #[error("Configuration has no backing file")]
    NoPath,
}

impl From<ConfigError> for LlmError {
    fn from(e: ConfigError) -> Self {
        LlmError::ConfigError(e.to_string())
    }
}

// ============================================================================
// Schema
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    500
}

/// Connection settings for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            default_model: None,
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Settings for every known provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub ollama: ProviderSettings,
    #[serde(default)]
    pub openai: ProviderSettings,
    #[serde(default)]
    pub anthropic: ProviderSettings,
}

impl ProvidersConfig {
    pub fn get(&self, provider: ProviderId) -> &ProviderSettings {
        match provider {
            ProviderId::Ollama => &self.ollama,
            ProviderId::OpenAI => &self.openai,
            ProviderId::Anthropic => &self.anthropic,
        }
    }

    pub fn get_mut(&mut self, provider: ProviderId) -> &mut ProviderSettings {
        match provider {
            ProviderId::Ollama => &mut self.ollama,
            ProviderId::OpenAI => &mut self.openai,
            ProviderId::Anthropic => &mut self.anthropic,
        }
    }
}

fn default_cache_entries() -> usize {
    1000
}

fn default_completion_ttl() -> u64 {
    3600
}

fn default_embedding_ttl() -> u64 {
    86_400
}

fn default_model_list_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

/// Cache section of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_completion_ttl")]
    pub completion_ttl_secs: u64,
    #[serde(default = "default_embedding_ttl")]
    pub embedding_ttl_secs: u64,
    #[serde(default = "default_model_list_ttl")]
    pub model_list_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_entries(),
            completion_ttl_secs: default_completion_ttl(),
            embedding_ttl_secs: default_embedding_ttl(),
            model_list_ttl_secs: default_model_list_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig::new(self.max_entries)
            .with_completion_ttl(Duration::from_secs(self.completion_ttl_secs))
            .with_embedding_ttl(Duration::from_secs(self.embedding_ttl_secs))
            .with_model_list_ttl(Duration::from_secs(self.model_list_ttl_secs))
            .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Metrics section of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Preferred default model id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Tried in order when the default is unavailable.
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl RouterConfig {
    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Providers with `enabled = true`, in detection order.
    pub fn enabled_providers(&self) -> Vec<ProviderId> {
        ProviderId::ALL
            .into_iter()
            .filter(|p| self.providers.get(*p).enabled)
            .collect()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(model) = &self.default_model {
            if model.trim().is_empty() {
                return Err(ConfigError::Validation("default_model is empty".to_string()));
            }
        }

        let mut seen = HashSet::new();
        for model in &self.fallback_models {
            if model.trim().is_empty() {
                return Err(ConfigError::Validation("fallback_models contains an empty id".to_string()));
            }
            if !seen.insert(model) {
                return Err(ConfigError::Validation(format!("Duplicate fallback model: '{}'", model)));
            }
        }

        for provider in ProviderId::ALL {
            let settings = self.providers.get(provider);
            if settings.max_concurrent == 0 {
                return Err(ConfigError::Validation(format!(
                    "max_concurrent for '{}' must be at least 1",
                    provider
                )));
            }
            if settings.timeout_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "timeout_secs for '{}' must be at least 1",
                    provider
                )));
            }
            if let Some(url) = &settings.base_url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ConfigError::Validation(format!(
                        "base_url for '{}' must be an http(s) URL: {}",
                        provider, url
                    )));
                }
            }
        }

        Ok(())
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}

fn user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".edgequake").join("router.json"))
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_base_url(provider: ProviderId) -> Option<String> {
    match provider {
        // OLLAMA_HOST is often given as bare host:port.
        ProviderId::Ollama => non_empty_env("OLLAMA_HOST").map(|host| {
            if host.contains("://") {
                host
            } else {
                format!("http://{}", host)
            }
        }),
        ProviderId::OpenAI => non_empty_env("OPENAI_BASE_URL"),
        ProviderId::Anthropic => non_empty_env("ANTHROPIC_BASE_URL"),
    }
}

fn env_api_key(provider: ProviderId) -> Option<String> {
    match provider {
        ProviderId::Ollama => None,
        ProviderId::OpenAI => non_empty_env("OPENAI_API_KEY"),
        ProviderId::Anthropic => non_empty_env("ANTHROPIC_API_KEY"),
    }
}

fn default_base_url(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::Ollama => ollama::DEFAULT_OLLAMA_HOST,
        ProviderId::OpenAI => openai::OPENAI_API_BASE,
        ProviderId::Anthropic => anthropic::ANTHROPIC_API_BASE,
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Loaded configuration plus the file it persists to.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: RouterConfig,
    path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from the default location.
    ///
    /// Without any file, built-in defaults are used and later changes are
    /// persisted to `~/.edgequake/router.json`.
    pub fn load() -> Result<Self, ConfigError> {
        if let Some(path) = non_empty_env(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Self::from_file(path);
            }
            debug!(path = %path.display(), "Configured router config file does not exist yet");
            return Ok(Self {
                config: RouterConfig::default(),
                path: Some(path),
            });
        }

        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            return Self::from_file(local);
        }

        if let Some(user) = user_config_path() {
            if user.exists() {
                return Self::from_file(user);
            }
            return Ok(Self {
                config: RouterConfig::default(),
                path: Some(user),
            });
        }

        Ok(Self::in_memory(RouterConfig::default()))
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path)?;
        let config = if is_toml(&path) {
            RouterConfig::from_toml(&content)?
        } else {
            RouterConfig::from_json(&content)?
        };
        info!(path = %path.display(), "Loaded router config");
        Ok(Self {
            config,
            path: Some(path),
        })
    }

    /// Configuration without a backing file; changes stay in memory.
    pub fn in_memory(config: RouterConfig) -> Self {
        Self { config, path: None }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the configuration to its file, creating parent directories.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoPath)?;
        let content = if is_toml(path) {
            toml::to_string_pretty(&self.config).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            serde_json::to_string_pretty(&self.config).map_err(|e| ConfigError::Parse(e.to_string()))?
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        debug!(path = %path.display(), "Saved router config");
        Ok(())
    }

    fn persist(&self) -> Result<(), ConfigError> {
        match self.path {
            Some(_) => self.save(),
            None => Ok(()),
        }
    }

    /// Set and persist the default model.
    pub fn set_default_model(&mut self, model: impl Into<String>) -> Result<(), ConfigError> {
        self.config.default_model = Some(model.into());
        self.config.validate()?;
        self.persist()
    }

    /// Set and persist the fallback order.
    pub fn set_fallback_models(&mut self, models: Vec<String>) -> Result<(), ConfigError> {
        self.config.fallback_models = models;
        self.config.validate()?;
        self.persist()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.config.validate()
    }

    /// Connection parameters for `provider`: file settings, then environment,
    /// then built-in defaults. The credential always comes from the environment.
    pub fn service_config(&self, provider: ProviderId) -> ServiceConfig {
        let settings = self.config.providers.get(provider);
        let base_url = settings
            .base_url
            .clone()
            .or_else(|| env_base_url(provider))
            .unwrap_or_else(|| default_base_url(provider).to_string());

        let mut config = ServiceConfig::new(base_url)
            .with_timeout(Duration::from_secs(settings.timeout_secs))
            .with_retries(settings.max_retries, Duration::from_millis(settings.retry_delay_ms));
        config.max_concurrent = settings.max_concurrent;
        if let Some(model) = &settings.default_model {
            config = config.with_default_model(model.clone());
        }
        if let Some(key) = env_api_key(provider) {
            config = config.with_api_key(key);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        for var in [
            CONFIG_ENV,
            "OLLAMA_HOST",
            "OPENAI_API_KEY",
            "OPENAI_BASE_URL",
            "ANTHROPIC_API_KEY",
            "ANTHROPIC_BASE_URL",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults_from_empty_json() {
        let config = RouterConfig::from_json("{}").unwrap();
        assert_eq!(config, RouterConfig::default());
        assert_eq!(config.providers.ollama.max_retries, 2);
        assert_eq!(config.cache.max_entries, 1000);
        assert!(config.metrics.enabled);
        assert_eq!(config.enabled_providers().len(), 3);
    }

    #[test]
    fn test_partial_provider_settings() {
        let config = RouterConfig::from_json(
            r#"{"default_model":"llama3","providers":{"ollama":{"timeout_secs":300},"anthropic":{"enabled":false}}}"#,
        )
        .unwrap();
        assert_eq!(config.providers.ollama.timeout_secs, 300);
        assert_eq!(config.providers.ollama.max_concurrent, 4);
        assert_eq!(
            config.enabled_providers(),
            vec![ProviderId::Ollama, ProviderId::OpenAI]
        );
    }

    #[test]
    fn test_toml_config() {
        let config = RouterConfig::from_toml(
            r#"
default_model = "gpt-4o-mini"
fallback_models = ["llama3.1:8b"]

[cache]
completion_ttl_secs = 10
"#,
        )
        .unwrap();
        assert_eq!(config.fallback_models, vec!["llama3.1:8b"]);
        assert_eq!(
            config.cache.to_cache_config().completion_ttl,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_validation() {
        let mut config = RouterConfig::default();
        assert!(config.validate().is_ok());

        config.fallback_models = vec!["a".into(), "a".into()];
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        config.fallback_models.clear();
        config.providers.openai.base_url = Some("api.openai.com".into());
        assert!(config.validate().is_err());

        config.providers.openai.base_url = None;
        config.providers.ollama.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("router.json");
        let mut manager = ConfigManager {
            config: RouterConfig::default(),
            path: Some(path.clone()),
        };

        manager.set_default_model("claude-3-5-haiku-20241022").unwrap();
        manager
            .set_fallback_models(vec!["gpt-4o-mini".into()])
            .unwrap();

        let reloaded = ConfigManager::from_file(&path).unwrap();
        assert_eq!(
            reloaded.config().default_model.as_deref(),
            Some("claude-3-5-haiku-20241022")
        );
        assert_eq!(reloaded.config().fallback_models, vec!["gpt-4o-mini"]);
    }

    #[test]
    fn test_save_and_reload_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("router.toml");
        let mut config = RouterConfig::default();
        config.providers.ollama.base_url = Some("http://gpu-box:11434".into());
        let manager = ConfigManager {
            config,
            path: Some(path.clone()),
        };
        manager.save().unwrap();

        let reloaded = ConfigManager::from_file(&path).unwrap();
        assert_eq!(reloaded.config(), manager.config());
    }

    #[test]
    fn test_in_memory_does_not_persist() {
        let mut manager = ConfigManager::in_memory(RouterConfig::default());
        manager.set_default_model("llama3").unwrap();
        assert_eq!(manager.config().default_model.as_deref(), Some("llama3"));
        assert!(matches!(manager.save(), Err(ConfigError::NoPath)));
    }

    #[test]
    #[serial]
    fn test_load_from_env_path() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.json");
        std::fs::write(&path, r#"{"default_model":"mistral:7b"}"#).unwrap();
        std::env::set_var(CONFIG_ENV, &path);

        let manager = ConfigManager::load().unwrap();
        assert_eq!(manager.config().default_model.as_deref(), Some("mistral:7b"));
        assert_eq!(manager.path(), Some(path.as_path()));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_service_config_credentials_from_env() {
        clear_env();
        std::env::set_var("OPENAI_API_KEY", "sk-env");
        std::env::set_var("OLLAMA_HOST", "gpu-box:11434");

        let mut config = RouterConfig::default();
        config.providers.openai.default_model = Some("gpt-4o".into());
        config.providers.openai.retry_delay_ms = 10;
        let manager = ConfigManager::in_memory(config);

        let hosted = manager.service_config(ProviderId::OpenAI);
        assert_eq!(hosted.api_key.as_deref(), Some("sk-env"));
        assert_eq!(hosted.base_url, openai::OPENAI_API_BASE);
        assert_eq!(hosted.default_model.as_deref(), Some("gpt-4o"));
        assert_eq!(hosted.retry_delay, Duration::from_millis(10));

        let local = manager.service_config(ProviderId::Ollama);
        assert_eq!(local.base_url, "http://gpu-box:11434");
        assert!(local.api_key.is_none());

        let anthropic = manager.service_config(ProviderId::Anthropic);
        assert!(anthropic.api_key.is_none());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_file_base_url_beats_env() {
        clear_env();
        std::env::set_var("OLLAMA_HOST", "http://env-host:11434");
        let mut config = RouterConfig::default();
        config.providers.ollama.base_url = Some("http://file-host:11434".into());

        let manager = ConfigManager::in_memory(config);
        assert_eq!(
            manager.service_config(ProviderId::Ollama).base_url,
            "http://file-host:11434"
        );
        clear_env();
    }
}
