//! The uniform service contract and the data model it speaks.
//!
//! # WHY: One Trait For Adapters And Decorators
//!
//! Provider adapters and the caching/metrics decorators all implement
//! [`ModelService`], so a decorated service is interchangeable with a bare
//! adapter. The factory builds the fixed pipeline
//! `MetricsService -> CachingService -> adapter` once and hands out
//! `Arc<dyn ModelService>` handles.
//!
//! # Key Types
//!
//! - [`ModelService`]: the contract
//! - [`Model`], [`DetectedModel`]: discovery records
//! - [`CompletionOptions`], [`ChatMessage`], [`CompletionResponse`]: request/response
//! - [`ServiceConfig`]: per-adapter connection parameters

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{LlmError, Result};
use crate::retry::RetryPolicy;
use crate::stream::FragmentStream;
use crate::tokenizer::{approximate_tokenize, estimate_tokens};

// ============================================================================
// Providers and capabilities
// ============================================================================

/// Closed set of backends the router knows how to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Local inference server (Ollama wire protocol).
    Ollama,
    /// Hosted, OpenAI-compatible chat completions.
    #[serde(rename = "openai")]
    OpenAI,
    /// Hosted Anthropic messages API.
    Anthropic,
}

impl ProviderId {
    /// All providers, in detection order.
    pub const ALL: [ProviderId; 3] = [ProviderId::Ollama, ProviderId::OpenAI, ProviderId::Anthropic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
        }
    }

    /// Local servers need no credential; hosted APIs do.
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Ollama => ProviderKind::Local,
            Self::OpenAI | Self::Anthropic => ProviderKind::Api,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ollama" | "local" => Ok(Self::Ollama),
            "openai" | "open-ai" | "gpt" => Ok(Self::OpenAI),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            other => Err(LlmError::ConfigError(format!("unknown provider: {}", other))),
        }
    }
}

/// Where a provider runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Api,
}

/// What a model can be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Chat,
    Code,
    Embeddings,
    Instruct,
    FunctionCalling,
    Vision,
}

// ============================================================================
// Models
// ============================================================================

/// A model an adapter can serve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub name: String,
    pub context_length: usize,
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default)]
    pub loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl Model {
    pub fn new(id: impl Into<String>, context_length: usize, capabilities: Vec<Capability>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            context_length,
            capabilities,
            family: None,
            parameter_size: None,
            quantization: None,
            loaded: false,
            last_used: None,
        }
    }

    /// Set a human-readable name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the model family.
    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Load state of a single model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    pub model_id: String,
    pub available: bool,
    pub loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

/// Registry record: a model plus where it was detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedModel {
    pub model: Model,
    pub provider: ProviderId,
    pub kind: ProviderKind,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectedModel {
    pub fn available(model: Model, provider: ProviderId) -> Self {
        Self {
            model,
            provider,
            kind: provider.kind(),
            available: true,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.model.id
    }
}

/// Per-provider connection parameters, fixed for the adapter's lifetime.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: Option<String>,
    /// Advisory ceiling; not enforced by a queue here.
    pub max_concurrent: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl ServiceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            default_model: None,
            max_concurrent: 4,
            timeout: Duration::from_secs(120),
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay)
    }

    /// Credential, or `ApiKeyMissing` when absent or blank.
    pub fn require_api_key(&self, provider: ProviderId) -> Result<&str> {
        match self.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(LlmError::ApiKeyMissing {
                provider: provider.to_string(),
            }),
        }
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Function,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Function => "function",
        }
    }
}

/// A function call emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as returned by the provider.
    pub arguments: String,
}

impl FunctionCall {
    /// Parse the arguments into a typed value.
    pub fn parse_arguments<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.arguments).map_err(LlmError::from)
    }
}

/// A function the model may choose to call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: JsonValue,
}

/// How the model should pick among the offered functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionCallMode {
    Auto,
    None,
    Named(String),
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl ChatMessage {
    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            function_call: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    /// Result of a function invocation, fed back to the model.
    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::with_role(MessageRole::Function, content)
        }
    }
}

/// Sampling and routing options for completions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOptions {
    /// Explicit model id; the service default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Provider-specific response format, e.g. `{"type": "json_object"}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<FunctionDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCallMode>,
}

impl CompletionOptions {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Options for embedding calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl EmbeddingOptions {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
        }
    }
}

/// Token accounting for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    /// Build usage; `total_tokens` is always the sum of the parts.
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    FunctionCall,
}

/// Response from a blocking completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    pub text: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    pub model: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl CompletionResponse {
    pub fn new(text: impl Into<String>, model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: Usage::default(),
            finish_reason: FinishReason::Stop,
            model: model.into(),
            provider: provider.into(),
            function_call: None,
        }
    }

    pub fn with_usage(mut self, prompt: usize, completion: usize) -> Self {
        self.usage = Usage::new(prompt, completion);
        self
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }

    pub fn with_function_call(mut self, call: FunctionCall) -> Self {
        self.function_call = Some(call);
        self.finish_reason = FinishReason::FunctionCall;
        self
    }
}

// ============================================================================
// The contract
// ============================================================================

/// What a service is, for attribution through decorator chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceIdentity {
    /// A concrete adapter talking to the named provider.
    Provider(String),
    /// A caching decorator.
    Cache,
    /// A metrics decorator.
    Metrics,
}

/// Uniform contract implemented by every adapter and decorator.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Concrete identity of this service.
    fn identity(&self) -> ServiceIdentity;

    /// The wrapped service, for decorators.
    fn inner(&self) -> Option<&dyn ModelService> {
        None
    }

    async fn list_models(&self) -> Result<Vec<Model>>;

    async fn load_model(&self, id: &str) -> Result<()>;

    async fn unload_model(&self, id: &str) -> Result<()>;

    async fn active_models(&self) -> Result<Vec<Model>>;

    async fn model_status(&self, id: &str) -> Result<ModelStatus>;

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<CompletionResponse>;

    async fn complete_chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse>;

    /// Lazy, finite, non-restartable sequence of text fragments.
    async fn stream(&self, prompt: &str, options: &CompletionOptions) -> Result<FragmentStream>;

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<FragmentStream>;

    async fn embed(&self, text: &str, options: &EmbeddingOptions) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String], options: &EmbeddingOptions) -> Result<Vec<Vec<f32>>>;

    /// Split text into tokens. Approximated as 4-character pieces by default.
    async fn tokenize(&self, text: &str, _model: Option<&str>) -> Result<Vec<String>> {
        Ok(approximate_tokenize(text))
    }

    /// Count tokens. Approximated as `ceil(chars / 4)` by default.
    async fn count_tokens(&self, text: &str, _model: Option<&str>) -> Result<usize> {
        Ok(estimate_tokens(text))
    }

    /// Cheap liveness probe. Never fails.
    async fn is_healthy(&self) -> bool;

    /// Configured default, else first model with `capability`, else first active model.
    async fn default_model(&self, capability: Option<Capability>) -> Result<String>;

    /// Model id a call with `requested` will be sent to.
    async fn request_model(&self, requested: Option<&str>, capability: Capability) -> Result<String> {
        match requested {
            Some(id) => Ok(id.to_string()),
            None => self.default_model(Some(capability)).await,
        }
    }
}

/// Shared default-model resolution over a model list.
///
/// Order: the configured id (if it is listed and supports `capability`),
/// then the first listed model supporting `capability`, then the first
/// loaded model, then the first listed model.
pub fn resolve_default_model(
    configured: Option<&str>,
    models: &[Model],
    capability: Option<Capability>,
) -> Option<String> {
    let fits = |m: &Model| capability.map_or(true, |c| m.supports(c));

    if let Some(id) = configured {
        match models.iter().find(|m| m.id == id) {
            Some(m) if fits(m) => return Some(m.id.clone()),
            None if capability.is_none() => return Some(id.to_string()),
            _ => {}
        }
    }

    models
        .iter()
        .find(|m| capability.is_some() && fits(m))
        .or_else(|| models.iter().find(|m| m.loaded))
        .or_else(|| models.first())
        .map(|m| m.id.clone())
}
