//! EdgeQuake Router - multi-provider model routing
//!
//! One uniform contract ([`ModelService`]) over a local inference server and
//! hosted completion APIs, plus the plumbing around it:
//!
//! - Model discovery across providers, with per-provider failure isolation
//! - A factory handing out one ready-to-use service per detected model
//! - Response caching for blocking completions and embeddings
//! - Per-model usage metrics
//! - Retry with a fixed delay on transient failures
//! - A REST facade with Server-Sent Events streaming
//!
//! # Providers
//!
//! | Provider  | Kind  | Chat | Stream | Embeddings | Load/Unload |
//! |-----------|-------|------|--------|------------|-------------|
//! | Ollama    | local | ✓    | NDJSON | ✓          | ✓           |
//! | OpenAI    | api   | ✓    | SSE    | ✓          | tracked     |
//! | Anthropic | api   | ✓    | SSE    | ✗          | tracked     |
//! | Mock      | test  | ✓    | ✓      | ✓          | ✓           |
//!
//! # Example
//!
//! ```ignore
//! use edgequake_router::{ConfigManager, ServiceFactory};
//!
//! let factory = ServiceFactory::new(ConfigManager::load()?);
//! factory.initialize().await;
//!
//! let service = factory.resolve(None)?;
//! let response = service.complete("Hello, world!", &Default::default()).await?;
//! ```
//!
//! # See Also
//!
//! - [`crate::traits`] for the service contract and shared types
//! - [`crate::providers`] for concrete adapters
//! - [`crate::factory`] for the decorator pipeline

pub mod cache;
pub mod config;
pub mod error;
pub mod factory;
pub mod metrics;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod server;
pub mod stream;
pub mod tokenizer;
pub mod traits;

pub use cache::{CacheConfig, CacheStats, CachingService};
pub use config::{ConfigError, ConfigManager, RouterConfig};
pub use error::{LlmError, Result};
pub use factory::ServiceFactory;
pub use metrics::{MetricsService, MetricsSummary, UsageCounter, UsageStore};
pub use providers::{AnthropicService, MockService, OllamaService, OpenAIService};
pub use registry::{Detection, ModelRegistry};
pub use retry::{RetryExecutor, RetryPolicy};
pub use server::{router, AppState};
pub use stream::{FragmentStream, StreamCallbacks};
pub use tokenizer::Tokenizer;
pub use traits::{
    Capability, ChatMessage, CompletionOptions, CompletionResponse, DetectedModel,
    EmbeddingOptions, FinishReason, FunctionCall, FunctionCallMode, FunctionDefinition,
    MessageRole, Model, ModelService, ModelStatus, ProviderId, ProviderKind, ServiceConfig,
    ServiceIdentity, Usage,
};
