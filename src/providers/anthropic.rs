//! Anthropic adapter (Messages API).
//!
//! The Messages API differs from chat-completions in three ways this
//! adapter has to absorb:
//!
//! - System messages are not part of `messages`; they go in a top-level
//!   `system` field.
//! - `max_tokens` is mandatory (default 4096 here).
//! - There is no embeddings endpoint. `embed`/`embed_batch` fail with
//!   `NotSupported` before any request is built.
//!
//! The model catalog is a static table; loading is bookkeeping only.
//!
//! # Environment Variables
//! - `ANTHROPIC_API_KEY`: API key
//! - `ANTHROPIC_BASE_URL`: custom endpoint (default: https://api.anthropic.com/v1)

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{http_client, join_url, resolve_model, StaticCatalog};
use crate::error::{LlmError, Result};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::stream::{fragments, sse_data, Frame, FragmentStream};
use crate::traits::{
    Capability, ChatMessage, CompletionOptions, CompletionResponse, EmbeddingOptions, FinishReason,
    FunctionCall, MessageRole, Model, ModelService, ModelStatus, ProviderId, ServiceConfig,
    ServiceIdentity,
};

/// Anthropic API base URL
pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";

/// Anthropic API version (required header)
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// Default model
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

const DEFAULT_MAX_TOKENS: usize = 4096;

const PROVIDER: ProviderId = ProviderId::Anthropic;

fn catalog() -> Vec<Model> {
    use Capability::*;
    vec![
        Model::new("claude-3-5-sonnet-20241022", 200_000, vec![Chat, Code, Vision])
            .with_name("Claude 3.5 Sonnet")
            .with_family("claude-3.5"),
        Model::new("claude-3-5-haiku-20241022", 200_000, vec![Chat, Code])
            .with_name("Claude 3.5 Haiku")
            .with_family("claude-3.5"),
        Model::new("claude-3-opus-20240229", 200_000, vec![Chat, Code, Vision])
            .with_name("Claude 3 Opus")
            .with_family("claude-3"),
        Model::new("claude-3-haiku-20240307", 200_000, vec![Chat, Vision])
            .with_name("Claude 3 Haiku")
            .with_family("claude-3"),
    ]
}

// ============================================================================
// Anthropic API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: usize,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: usize,
    #[serde(default)]
    output_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: String,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type", default)]
    error_type: String,
    message: String,
}

/// SSE event for streaming responses
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: DeltaBlock },
    MessageStop,
    Error { error: AnthropicError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct DeltaBlock {
    #[serde(default)]
    text: Option<String>,
}

/// Split out system content and map the rest onto user/assistant turns.
///
/// All system messages (and `options.system_prompt`, first) are joined with
/// blank lines. Function results become user turns. Consecutive turns with
/// the same role are merged, since the API requires alternation.
fn convert_messages(
    messages: &[ChatMessage],
    options: &CompletionOptions,
) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_parts: Vec<&str> = options.system_prompt.iter().map(String::as_str).collect();
    let mut out: Vec<AnthropicMessage> = Vec::with_capacity(messages.len());

    for msg in messages {
        let role = match msg.role {
            MessageRole::System => {
                system_parts.push(&msg.content);
                continue;
            }
            MessageRole::Assistant => "assistant",
            MessageRole::User | MessageRole::Function => "user",
        };
        match out.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&msg.content);
            }
            _ => out.push(AnthropicMessage {
                role: role.to_string(),
                content: msg.content.clone(),
            }),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, out)
}

fn finish_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::FunctionCall,
        _ => FinishReason::Stop,
    }
}

fn parse_response(response: MessagesResponse, fallback_model: &str) -> CompletionResponse {
    let mut text = String::new();
    let mut call = None;

    for block in response.content {
        match block.content_type.as_str() {
            "text" => text.push_str(block.text.as_deref().unwrap_or_default()),
            "tool_use" => {
                if let (Some(name), Some(input)) = (block.name, block.input) {
                    call = Some(FunctionCall {
                        name,
                        arguments: input.to_string(),
                    });
                }
            }
            other => debug!("Unknown content block type: {}", other),
        }
    }

    let model = if response.model.is_empty() {
        fallback_model.to_string()
    } else {
        response.model
    };
    let result = CompletionResponse::new(text, model, PROVIDER.as_str())
        .with_usage(response.usage.input_tokens, response.usage.output_tokens)
        .with_finish_reason(finish_reason(response.stop_reason.as_deref()));
    match call {
        Some(call) => result.with_function_call(call),
        None => result,
    }
}

fn decode_event(data: &str) -> Result<Frame> {
    if data.trim() == "[DONE]" {
        return Ok(Frame::End);
    }
    match serde_json::from_str::<StreamEvent>(data) {
        Ok(StreamEvent::ContentBlockDelta { delta }) => Ok(Frame::Text(delta.text.unwrap_or_default())),
        Ok(StreamEvent::MessageStop) => Ok(Frame::End),
        Ok(StreamEvent::Error { error }) => {
            warn!("Stream error: {}", error.message);
            Err(LlmError::ApiError(format!("{}: {}", error.error_type, error.message)))
        }
        Ok(StreamEvent::Other) => Ok(Frame::Skip),
        Err(e) => {
            warn!("Failed to parse stream event: {} | data: {}", e, data);
            Err(LlmError::from(e))
        }
    }
}

// ============================================================================
// Service
// ============================================================================

/// Anthropic (Claude) adapter.
#[derive(Debug)]
pub struct AnthropicService {
    client: Client,
    config: ServiceConfig,
    policy: RetryPolicy,
    retry: RetryExecutor,
    catalog: StaticCatalog,
}

impl AnthropicService {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(&config)?,
            policy: config.retry_policy(),
            retry: RetryExecutor::new(),
            catalog: StaticCatalog::new(PROVIDER, catalog()),
            config,
        })
    }

    /// Create from `ANTHROPIC_API_KEY` / `ANTHROPIC_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let base = std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| ANTHROPIC_API_BASE.to_string());
        let mut config = ServiceConfig::new(base).with_default_model(DEFAULT_MODEL);
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            config = config.with_api_key(key);
        }
        Self::new(config)
    }

    fn headers(&self, api_key: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key)
                .map_err(|_| LlmError::ConfigError("API key contains invalid characters".into()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_API_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Credential and a model id from the catalog, both checked before any I/O.
    async fn prepare(&self, requested: Option<&String>) -> Result<(HeaderMap, String)> {
        let key = self.config.require_api_key(PROVIDER)?;
        let headers = self.headers(key)?;
        let model = resolve_model(self, &self.config, requested, Capability::Chat).await?;
        self.catalog.ensure_known(&model)?;
        Ok((headers, model))
    }

    fn build_request(
        model: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> MessagesRequest {
        let (system, messages) = convert_messages(messages, options);
        MessagesRequest {
            model: model.to_string(),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            stream: stream.then_some(true),
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
            stop_sequences: options.stop.clone(),
        }
    }

    #[instrument(skip(self, headers, request))]
    async fn send(&self, headers: &HeaderMap, request: &MessagesRequest) -> Result<Response> {
        debug!("Sending request to Anthropic API: model={}", request.model);

        let response = self
            .client
            .post(join_url(&self.config.base_url, "/messages"))
            .headers(headers.clone())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<AnthropicErrorResponse>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        Err(LlmError::from_status(status.as_u16(), message))
    }

    async fn send_messages(&self, headers: &HeaderMap, request: &MessagesRequest) -> Result<MessagesResponse> {
        self.retry
            .execute(&self.policy, || async {
                let response = self.send(headers, request).await?;
                Ok(response.json::<MessagesResponse>().await?)
            })
            .await
    }
}

#[async_trait]
impl ModelService for AnthropicService {
    fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::Provider(PROVIDER.to_string())
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        self.config.require_api_key(PROVIDER)?;
        Ok(self.catalog.models())
    }

    async fn load_model(&self, id: &str) -> Result<()> {
        self.catalog.load(id)
    }

    async fn unload_model(&self, id: &str) -> Result<()> {
        self.catalog.unload(id);
        Ok(())
    }

    async fn active_models(&self) -> Result<Vec<Model>> {
        Ok(self.catalog.active())
    }

    async fn model_status(&self, id: &str) -> Result<ModelStatus> {
        self.catalog.status(id)
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<CompletionResponse> {
        self.complete_chat(&[ChatMessage::user(prompt)], options).await
    }

    #[instrument(skip(self, messages, options))]
    async fn complete_chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        let (headers, model) = self.prepare(options.model.as_ref()).await?;
        let preview = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let request = Self::build_request(&model, messages, options, false);

        let response = self
            .send_messages(&headers, &request)
            .await
            .map_err(|e| LlmError::completion(&model, preview, e))?;
        self.catalog.touch(&model);
        Ok(parse_response(response, &model))
    }

    async fn stream(&self, prompt: &str, options: &CompletionOptions) -> Result<FragmentStream> {
        self.stream_chat(&[ChatMessage::user(prompt)], options).await
    }

    #[instrument(skip(self, messages, options))]
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<FragmentStream> {
        let (headers, model) = self.prepare(options.model.as_ref()).await?;
        let preview = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let request = Self::build_request(&model, messages, options, true);

        let response = self
            .send(&headers, &request)
            .await
            .map_err(|e| LlmError::completion(&model, preview, e))?;
        self.catalog.touch(&model);

        Ok(fragments(sse_data(response.bytes_stream()), decode_event))
    }

    async fn embed(&self, _text: &str, _options: &EmbeddingOptions) -> Result<Vec<f32>> {
        Err(LlmError::NotSupported(
            "Anthropic does not provide an embeddings endpoint".to_string(),
        ))
    }

    async fn embed_batch(&self, _texts: &[String], _options: &EmbeddingOptions) -> Result<Vec<Vec<f32>>> {
        Err(LlmError::NotSupported(
            "Anthropic does not provide an embeddings endpoint".to_string(),
        ))
    }

    /// One-token completion against the default model.
    async fn is_healthy(&self) -> bool {
        let options = CompletionOptions::default().with_max_tokens(1);
        match self.complete("ping", &options).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Anthropic health probe failed: {}", e);
                false
            }
        }
    }

    async fn default_model(&self, capability: Option<Capability>) -> Result<String> {
        self.catalog
            .default_model(self.config.default_model.as_deref(), capability)
    }

    async fn request_model(&self, requested: Option<&str>, capability: Capability) -> Result<String> {
        let requested = requested.map(str::to_string);
        resolve_model(self, &self.config, requested.as_ref(), capability).await
    }
}
