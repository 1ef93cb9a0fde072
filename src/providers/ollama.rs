//! Ollama adapter for the local inference server.
//!
//! # Wire Protocol
//!
//! - `GET /api/tags`: model discovery
//! - `POST /api/generate`: prompt completion (NDJSON when streaming)
//! - `POST /api/chat`: chat completion (NDJSON when streaming)
//! - `POST /api/embeddings`: one embedding per call
//! - `POST /api/pull`: download a model, streaming progress
//!
//! # Model Inference
//!
//! Ollama reports name, size, digest and family, but not capabilities or
//! context windows. Both are inferred from the model name: `code` in the
//! name adds [`Capability::Code`], `32k`/`16k`/`8k` set the context length,
//! and known family prefixes supply defaults.
//!
//! "Loading" pulls the model if it is missing and issues one throw-away
//! generation so Ollama keeps it resident. There is no unload endpoint;
//! unloading only clears local bookkeeping.
//!
//! # Environment Variables
//!
//! - `OLLAMA_HOST`: server URL (default: http://localhost:11434)
//! - `OLLAMA_MODEL`: default model

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use super::{check_status, http_client, join_url, resolve_model, ActiveModels};
use crate::error::{LlmError, Result};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::stream::{fragments, lines, Frame, FragmentStream};
use crate::traits::{
    resolve_default_model, Capability, ChatMessage, CompletionOptions, CompletionResponse,
    EmbeddingOptions, FinishReason, Model, ModelService, ModelStatus, ProviderId, ServiceConfig,
    ServiceIdentity,
};

/// Default Ollama host URL
pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

const PROVIDER: ProviderId = ProviderId::Ollama;

/// Context length when neither the name nor the family says otherwise.
const DEFAULT_CONTEXT_LENGTH: usize = 4096;

/// Explicit context-size markers, checked before family defaults.
const CONTEXT_MARKERS: &[(&str, usize)] = &[
    ("128k", 131_072),
    ("64k", 65_536),
    ("32k", 32_768),
    ("16k", 16_384),
    ("8k", 8_192),
];

/// Family defaults by name prefix. Longer prefixes come first.
const FAMILY_CONTEXT: &[(&str, usize)] = &[
    ("llama3.1", 131_072),
    ("llama3.2", 131_072),
    ("llama3", 8_192),
    ("llama2", 4_096),
    ("codellama", 16_384),
    ("deepseek-coder", 16_384),
    ("mixtral", 32_768),
    ("mistral", 32_768),
    ("gemma2", 8_192),
    ("gemma", 8_192),
    ("qwen2.5", 32_768),
    ("qwen", 32_768),
    ("phi3", 4_096),
    ("phi", 2_048),
    ("nomic-embed", 8_192),
];

/// Families that accept tool/function definitions.
const FUNCTION_CALLING_FAMILIES: &[&str] = &["llama3.1", "llama3.2", "mistral", "qwen2.5", "command-r"];

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Default, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

impl From<&CompletionOptions> for OllamaOptions {
    fn from(options: &CompletionOptions) -> Self {
        Self {
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
            num_predict: options.max_tokens,
            stop: options.stop.clone(),
            seed: options.seed,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<usize>,
    #[serde(default)]
    eval_count: Option<usize>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<usize>,
    #[serde(default)]
    eval_count: Option<usize>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    name: &'a str,
    stream: bool,
}

/// Response from GET /api/tags.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModelsResponse {
    pub models: Vec<OllamaModelInfo>,
}

/// One entry of GET /api/tags.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModelInfo {
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub details: Option<OllamaModelDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModelDetails {
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub parameter_size: Option<String>,
    #[serde(default)]
    pub quantization_level: Option<String>,
}

/// One progress object streamed by POST /api/pull.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PullProgress {
    /// Completion percentage of the current layer, when sizes are known.
    pub fn percent(&self) -> Option<f64> {
        match (self.completed, self.total) {
            (Some(done), Some(total)) if total > 0 => Some(done as f64 * 100.0 / total as f64),
            _ => None,
        }
    }
}

// ============================================================================
// Name-based inference
// ============================================================================

fn base_name(name: &str) -> String {
    let lower = name.to_lowercase();
    match lower.rsplit_once('/') {
        Some((_, tail)) => tail.to_string(),
        None => lower,
    }
}

/// Infer capabilities from a model name.
pub fn infer_capabilities(name: &str) -> Vec<Capability> {
    let name = base_name(name);

    if name.contains("embed") {
        return vec![Capability::Embeddings];
    }

    let mut caps = vec![Capability::Chat];
    if name.contains("code") || name.contains("coder") {
        caps.push(Capability::Code);
    }
    if name.contains("instruct") {
        caps.push(Capability::Instruct);
    }
    if name.contains("llava") || name.contains("vision") {
        caps.push(Capability::Vision);
    }
    if FUNCTION_CALLING_FAMILIES.iter().any(|f| name.starts_with(f)) {
        caps.push(Capability::FunctionCalling);
    }
    caps
}

/// Infer context length from a model name.
pub fn infer_context_length(name: &str) -> usize {
    let name = base_name(name);

    if let Some((_, len)) = CONTEXT_MARKERS.iter().find(|(m, _)| name.contains(m)) {
        return *len;
    }
    FAMILY_CONTEXT
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|(_, len)| *len)
        .unwrap_or(DEFAULT_CONTEXT_LENGTH)
}

/// Build a [`Model`] from a tags entry.
pub fn infer_model(info: &OllamaModelInfo) -> Model {
    let details = info.details.clone();
    let family = details
        .as_ref()
        .and_then(|d| d.family.clone())
        .or_else(|| base_name(&info.name).split(':').next().map(str::to_string));

    Model {
        id: info.name.clone(),
        name: info.name.clone(),
        context_length: infer_context_length(&info.name),
        capabilities: infer_capabilities(&info.name),
        family,
        parameter_size: details.as_ref().and_then(|d| d.parameter_size.clone()),
        quantization: details.and_then(|d| d.quantization_level),
        loaded: false,
        last_used: None,
    }
}

fn ollama_format(response_format: &Option<JsonValue>) -> Option<JsonValue> {
    let format = response_format.as_ref()?;
    match format.get("type").and_then(JsonValue::as_str) {
        Some("json_object") | Some("json") => Some(JsonValue::String("json".to_string())),
        Some("json_schema") => format
            .get("json_schema")
            .and_then(|s| s.get("schema"))
            .cloned()
            .or_else(|| Some(JsonValue::String("json".to_string()))),
        _ => Some(format.clone()),
    }
}

fn finish_reason(done_reason: Option<&str>) -> FinishReason {
    match done_reason {
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

/// Decode one NDJSON line with `extract`, which returns the fragment and
/// the `done` flag.
fn ndjson_fragments<T, F>(response: Response, extract: F) -> FragmentStream
where
    T: DeserializeOwned + 'static,
    F: Fn(T) -> Result<(String, bool)> + Send + 'static,
{
    fragments(lines(response.bytes_stream()), move |line| {
        let chunk = serde_json::from_str::<T>(line).map_err(|e| {
            warn!("Failed to parse Ollama stream line: {} | data: {}", e, line);
            LlmError::from(e)
        })?;
        let (text, done) = extract(chunk)?;
        Ok(if done { Frame::Final(text) } else { Frame::Text(text) })
    })
}

// ============================================================================
// Service
// ============================================================================

/// Adapter for a local Ollama server.
#[derive(Debug)]
pub struct OllamaService {
    client: Client,
    config: ServiceConfig,
    policy: RetryPolicy,
    retry: RetryExecutor,
    active: ActiveModels,
}

impl OllamaService {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(&config)?,
            policy: config.retry_policy(),
            retry: RetryExecutor::new(),
            active: ActiveModels::new(),
            config,
        })
    }

    /// Create from `OLLAMA_HOST` / `OLLAMA_MODEL`.
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| DEFAULT_OLLAMA_HOST.to_string());
        let mut config = ServiceConfig::new(host);
        if let Ok(model) = std::env::var("OLLAMA_MODEL") {
            config = config.with_default_model(model);
        }
        Self::new(config)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.config.base_url, path)
    }

    /// One POST; a 404 means Ollama does not have the model.
    async fn send<B: Serialize + ?Sized>(&self, path: &str, body: &B, model: &str) -> Result<Response> {
        debug!("Ollama request: {} model={}", path, model);
        let response = self.client.post(self.url(path)).json(body).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            let text = response.text().await.unwrap_or_default();
            debug!("Ollama 404 for {}: {}", model, text);
            return Err(LlmError::ModelNotFound {
                model: model.to_string(),
                provider: PROVIDER.to_string(),
            });
        }
        check_status(response).await
    }

    /// POST with retry and JSON decoding.
    async fn post_json<B, R>(&self, path: &str, body: &B, model: &str) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        self.retry
            .execute(&self.policy, || async {
                let response = self.send(path, body, model).await?;
                Ok(response.json::<R>().await?)
            })
            .await
    }

    /// Raw GET /api/tags.
    pub async fn list_tags(&self) -> Result<Vec<OllamaModelInfo>> {
        let response = self.client.get(self.url("/api/tags")).send().await?;
        let response = check_status(response).await?;
        let tags: OllamaModelsResponse = response.json().await?;
        Ok(tags.models)
    }

    /// Start pulling a model; yields progress objects until the server finishes.
    pub async fn pull_model(&self, id: &str) -> Result<BoxStream<'static, Result<PullProgress>>> {
        let request = PullRequest { name: id, stream: true };
        let response = self.send("/api/pull", &request, id).await?;

        let progress = lines(response.bytes_stream()).map(|line| {
            let progress: PullProgress = serde_json::from_str(&line?)?;
            match progress.error {
                Some(error) => Err(LlmError::ApiError(error)),
                None => Ok(progress),
            }
        });
        Ok(progress.boxed())
    }

    async fn pull_to_completion(&self, id: &str) -> Result<()> {
        info!("Pulling Ollama model {}", id);
        let mut progress = self.pull_model(id).await?;
        while let Some(update) = progress.next().await {
            let update = update?;
            match update.percent() {
                Some(pct) => debug!("pull {}: {} {:.1}%", id, update.status, pct),
                None => debug!("pull {}: {}", id, update.status),
            }
        }
        Ok(())
    }

    fn chat_messages(messages: &[ChatMessage], options: &CompletionOptions) -> Vec<OllamaMessage> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = &options.system_prompt {
            out.push(OllamaMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        out.extend(messages.iter().map(|m| OllamaMessage {
            // Ollama has no function role; tool output goes back as a user turn.
            role: match m.role {
                crate::traits::MessageRole::Function => "user".to_string(),
                role => role.as_str().to_string(),
            },
            content: m.content.clone(),
        }));
        out
    }
}

#[async_trait]
impl ModelService for OllamaService {
    fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::Provider(PROVIDER.to_string())
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        let tags = self.list_tags().await?;
        let models = tags.iter().map(infer_model).collect();
        Ok(self.active.annotate(models))
    }

    #[instrument(skip(self))]
    async fn load_model(&self, id: &str) -> Result<()> {
        let load_error = |e: LlmError| LlmError::ModelLoad {
            model: id.to_string(),
            reason: e.to_string(),
        };

        let present = self
            .list_tags()
            .await
            .map_err(load_error)?
            .iter()
            .any(|m| m.name == id || m.model == id);
        if !present {
            self.pull_to_completion(id).await.map_err(load_error)?;
        }

        // Empty prompt: Ollama loads the model and returns immediately.
        let warm_up = GenerateRequest {
            model: id,
            prompt: "",
            system: None,
            stream: false,
            options: OllamaOptions {
                num_predict: Some(1),
                ..Default::default()
            },
            format: None,
        };
        let _: GenerateResponse = self
            .post_json("/api/generate", &warm_up, id)
            .await
            .map_err(load_error)?;

        self.active.mark_loaded(id);
        info!("Ollama model {} loaded", id);
        Ok(())
    }

    async fn unload_model(&self, id: &str) -> Result<()> {
        if !self.active.unload(id) {
            debug!("Ollama model {} was not loaded", id);
        }
        Ok(())
    }

    async fn active_models(&self) -> Result<Vec<Model>> {
        Ok(self.list_models().await?.into_iter().filter(|m| m.loaded).collect())
    }

    async fn model_status(&self, id: &str) -> Result<ModelStatus> {
        let models = self.list_models().await?;
        let model = models
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| LlmError::ModelNotFound {
                model: id.to_string(),
                provider: PROVIDER.to_string(),
            })?;
        Ok(ModelStatus {
            model_id: model.id,
            available: true,
            loaded: model.loaded,
            last_used: model.last_used,
        })
    }

    #[instrument(skip(self, prompt, options))]
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<CompletionResponse> {
        let model = resolve_model(self, &self.config, options.model.as_ref(), Capability::Chat).await?;
        let request = GenerateRequest {
            model: &model,
            prompt,
            system: options.system_prompt.as_deref(),
            stream: false,
            options: options.into(),
            format: ollama_format(&options.response_format),
        };

        let response: GenerateResponse = self
            .post_json("/api/generate", &request, &model)
            .await
            .map_err(|e| LlmError::completion(&model, prompt, e))?;
        if let Some(error) = response.error {
            return Err(LlmError::completion(&model, prompt, LlmError::ApiError(error)));
        }

        self.active.touch(&model);
        Ok(CompletionResponse::new(response.response, &model, PROVIDER.as_str())
            .with_usage(
                response.prompt_eval_count.unwrap_or(0),
                response.eval_count.unwrap_or(0),
            )
            .with_finish_reason(finish_reason(response.done_reason.as_deref())))
    }

    #[instrument(skip(self, messages, options))]
    async fn complete_chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        let model = resolve_model(self, &self.config, options.model.as_ref(), Capability::Chat).await?;
        let preview = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let request = ChatRequest {
            model: &model,
            messages: Self::chat_messages(messages, options),
            stream: false,
            options: options.into(),
            format: ollama_format(&options.response_format),
        };

        let response: ChatResponse = self
            .post_json("/api/chat", &request, &model)
            .await
            .map_err(|e| LlmError::completion(&model, preview, e))?;
        if let Some(error) = response.error {
            return Err(LlmError::completion(&model, preview, LlmError::ApiError(error)));
        }

        self.active.touch(&model);
        let text = response.message.map(|m| m.content).unwrap_or_default();
        Ok(CompletionResponse::new(text, &model, PROVIDER.as_str())
            .with_usage(
                response.prompt_eval_count.unwrap_or(0),
                response.eval_count.unwrap_or(0),
            )
            .with_finish_reason(finish_reason(response.done_reason.as_deref())))
    }

    async fn stream(&self, prompt: &str, options: &CompletionOptions) -> Result<FragmentStream> {
        let model = resolve_model(self, &self.config, options.model.as_ref(), Capability::Chat).await?;
        let request = GenerateRequest {
            model: &model,
            prompt,
            system: options.system_prompt.as_deref(),
            stream: true,
            options: options.into(),
            format: ollama_format(&options.response_format),
        };

        let response = self
            .send("/api/generate", &request, &model)
            .await
            .map_err(|e| LlmError::completion(&model, prompt, e))?;
        self.active.touch(&model);

        Ok(ndjson_fragments(response, |chunk: GenerateResponse| match chunk.error {
            Some(error) => Err(LlmError::ApiError(error)),
            None => Ok((chunk.response, chunk.done)),
        }))
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<FragmentStream> {
        let model = resolve_model(self, &self.config, options.model.as_ref(), Capability::Chat).await?;
        let preview = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let request = ChatRequest {
            model: &model,
            messages: Self::chat_messages(messages, options),
            stream: true,
            options: options.into(),
            format: ollama_format(&options.response_format),
        };

        let response = self
            .send("/api/chat", &request, &model)
            .await
            .map_err(|e| LlmError::completion(&model, preview, e))?;
        self.active.touch(&model);

        Ok(ndjson_fragments(response, |chunk: ChatResponse| match chunk.error {
            Some(error) => Err(LlmError::ApiError(error)),
            None => Ok((chunk.message.map(|m| m.content).unwrap_or_default(), chunk.done)),
        }))
    }

    async fn embed(&self, text: &str, options: &EmbeddingOptions) -> Result<Vec<f32>> {
        let model =
            resolve_model(self, &self.config, options.model.as_ref(), Capability::Embeddings).await?;
        let request = EmbeddingsRequest {
            model: &model,
            prompt: text,
        };
        let response: EmbeddingsResponse = self
            .post_json("/api/embeddings", &request, &model)
            .await
            .map_err(|e| LlmError::completion(&model, text, e))?;
        self.active.touch(&model);
        Ok(response.embedding)
    }

    /// No native batch endpoint; texts are embedded one after another.
    async fn embed_batch(&self, texts: &[String], options: &EmbeddingOptions) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text, options).await?);
        }
        Ok(out)
    }

    async fn is_healthy(&self) -> bool {
        match self.list_tags().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Ollama health probe failed: {}", e);
                false
            }
        }
    }

    async fn default_model(&self, capability: Option<Capability>) -> Result<String> {
        let models = match self.list_models().await {
            Ok(models) => models,
            Err(e) => {
                debug!("Ollama listing failed while resolving default: {}", e);
                Vec::new()
            }
        };
        resolve_default_model(self.config.default_model.as_deref(), &models, capability).ok_or_else(|| {
            LlmError::ModelNotFound {
                model: "<default>".to_string(),
                provider: PROVIDER.to_string(),
            }
        })
    }

    async fn request_model(&self, requested: Option<&str>, capability: Capability) -> Result<String> {
        let requested = requested.map(str::to_string);
        resolve_model(self, &self.config, requested.as_ref(), capability).await
    }
}
