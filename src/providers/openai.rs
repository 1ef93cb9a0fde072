//! OpenAI-compatible adapter (chat completions + embeddings).
//!
//! Speaks the `/chat/completions`, `/embeddings` and `/models` endpoints of
//! the OpenAI REST API with bearer authentication, so any compatible host
//! works by pointing `base_url` at it.
//!
//! # Features
//!
//! - Function calling (`functions` / `function_call`)
//! - JSON mode and seeds passed through untouched
//! - Server-sent event streaming via `reqwest-eventsource`
//! - Exact token counts through `tiktoken-rs`
//!
//! # Environment Variables
//! - `OPENAI_API_KEY`: API key
//! - `OPENAI_BASE_URL`: custom endpoint (default: https://api.openai.com/v1)

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::{http_client, join_url, resolve_model, StaticCatalog};
use crate::error::{LlmError, Result};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::stream::{fragments, Frame, FragmentStream};
use crate::tokenizer::Tokenizer;
use crate::traits::{
    Capability, ChatMessage, CompletionOptions, CompletionResponse, EmbeddingOptions, FinishReason,
    FunctionCall, FunctionCallMode, FunctionDefinition, Model, ModelService, ModelStatus,
    ProviderId, ServiceConfig, ServiceIdentity,
};

/// OpenAI API base URL
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Default chat model
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Default embedding model
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

const PROVIDER: ProviderId = ProviderId::OpenAI;

fn catalog() -> Vec<Model> {
    use Capability::*;
    vec![
        Model::new("gpt-4o", 128_000, vec![Chat, Code, FunctionCalling, Vision])
            .with_name("GPT-4o")
            .with_family("gpt-4o"),
        Model::new("gpt-4o-mini", 128_000, vec![Chat, Code, FunctionCalling, Vision])
            .with_name("GPT-4o mini")
            .with_family("gpt-4o"),
        Model::new("gpt-4-turbo", 128_000, vec![Chat, Code, FunctionCalling, Vision])
            .with_name("GPT-4 Turbo")
            .with_family("gpt-4"),
        Model::new("gpt-3.5-turbo", 16_385, vec![Chat, FunctionCalling])
            .with_name("GPT-3.5 Turbo")
            .with_family("gpt-3.5"),
        Model::new("text-embedding-3-small", 8191, vec![Embeddings]).with_family("text-embedding-3"),
        Model::new("text-embedding-3-large", 8191, vec![Embeddings]).with_family("text-embedding-3"),
        Model::new("text-embedding-ada-002", 8191, vec![Embeddings]).with_family("ada"),
    ]
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.as_str(),
            content: Some(msg.content.clone()),
            name: msg.name.clone(),
            function_call: msg.function_call.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    functions: Option<&'a [FunctionDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

fn error_message(body: String) -> String {
    serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error.message)
        .unwrap_or(body)
}

fn function_call_value(mode: &FunctionCallMode) -> Value {
    match mode {
        FunctionCallMode::Auto => json!("auto"),
        FunctionCallMode::None => json!("none"),
        FunctionCallMode::Named(name) => json!({ "name": name }),
    }
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("function_call") | Some("tool_calls") => FinishReason::FunctionCall,
        _ => FinishReason::Stop,
    }
}

fn wire_messages(messages: &[ChatMessage], options: &CompletionOptions) -> Vec<WireMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = &options.system_prompt {
        out.push(WireMessage::from(&ChatMessage::system(system.clone())));
    }
    out.extend(messages.iter().map(WireMessage::from));
    out
}

fn parse_response(response: ChatResponse, fallback_model: &str) -> Result<CompletionResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::ApiError("response contained no choices".to_string()))?;
    let usage = response.usage.unwrap_or_default();
    let model = if response.model.is_empty() {
        fallback_model.to_string()
    } else {
        response.model
    };

    let result = CompletionResponse::new(choice.message.content.unwrap_or_default(), model, PROVIDER.as_str())
        .with_usage(usage.prompt_tokens, usage.completion_tokens)
        .with_finish_reason(finish_reason(choice.finish_reason.as_deref()));
    Ok(match choice.message.function_call {
        Some(call) => result.with_function_call(call),
        None => result,
    })
}

fn decode_chunk(data: &str) -> Result<Frame> {
    if data.trim() == "[DONE]" {
        return Ok(Frame::End);
    }
    let chunk: ChatStreamChunk = serde_json::from_str(data).map_err(|e| {
        warn!("Failed to parse stream chunk: {} | data: {}", e, data);
        LlmError::from(e)
    })?;
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(Frame::Skip);
    };
    let text = choice.delta.content.unwrap_or_default();
    Ok(match choice.finish_reason {
        Some(_) => Frame::Final(text),
        None => Frame::Text(text),
    })
}

async fn event_error(err: reqwest_eventsource::Error) -> LlmError {
    use reqwest_eventsource::Error as EsError;
    match err {
        EsError::InvalidStatusCode(status, response) => {
            let body = response.text().await.unwrap_or_default();
            LlmError::from_status(status.as_u16(), error_message(body))
        }
        EsError::Transport(e) => LlmError::from(e),
        EsError::InvalidContentType(value, _) => {
            LlmError::ApiError(format!("unexpected stream content type: {:?}", value))
        }
        other => LlmError::NetworkError(other.to_string()),
    }
}

/// Wait for the event source to connect. HTTP failures surface here, before
/// any fragment is handed out.
async fn open_events(request: RequestBuilder) -> Result<EventSource> {
    let mut source = EventSource::new(request)
        .map_err(|e| LlmError::InvalidRequest(format!("request cannot be streamed: {}", e)))?;
    match source.next().await {
        Some(Ok(Event::Open)) => Ok(source),
        Some(Ok(Event::Message(_))) => {
            source.close();
            Err(LlmError::ApiError("event stream sent data before opening".to_string()))
        }
        Some(Err(e)) => {
            source.close();
            Err(event_error(e).await)
        }
        None => Err(LlmError::NetworkError("event stream closed before opening".to_string())),
    }
}

/// `data` payloads of an open event source. Ends on close instead of
/// reconnecting.
fn event_data(source: EventSource) -> futures::stream::BoxStream<'static, Result<String>> {
    stream::unfold(Some(source), |state| async move {
        let mut source = state?;
        loop {
            match source.next().await {
                Some(Ok(Event::Open)) => continue,
                Some(Ok(Event::Message(message))) => return Some((Ok(message.data), Some(source))),
                Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                    source.close();
                    return None;
                }
                Some(Err(e)) => {
                    source.close();
                    return Some((Err(event_error(e).await), None));
                }
            }
        }
    })
    .boxed()
}

// ============================================================================
// Service
// ============================================================================

/// OpenAI (and OpenAI-compatible) adapter.
#[derive(Debug)]
pub struct OpenAIService {
    client: Client,
    config: ServiceConfig,
    policy: RetryPolicy,
    retry: RetryExecutor,
    catalog: StaticCatalog,
}

impl OpenAIService {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(&config)?,
            policy: config.retry_policy(),
            retry: RetryExecutor::new(),
            catalog: StaticCatalog::new(PROVIDER, catalog()),
            config,
        })
    }

    /// Create from `OPENAI_API_KEY` / `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let base = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| OPENAI_API_BASE.to_string());
        let mut config = ServiceConfig::new(base).with_default_model(DEFAULT_MODEL);
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config = config.with_api_key(key);
        }
        Self::new(config)
    }

    fn post(&self, key: &str, path: &str) -> RequestBuilder {
        self.client
            .post(join_url(&self.config.base_url, path))
            .bearer_auth(key)
    }

    async fn checked(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LlmError::from_status(status.as_u16(), error_message(body)))
    }

    fn build_request<'a>(
        model: &'a str,
        messages: &[ChatMessage],
        options: &'a CompletionOptions,
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model,
            messages: wire_messages(messages, options),
            temperature: options.temperature,
            top_p: options.top_p,
            max_tokens: options.max_tokens,
            stop: options.stop.as_deref(),
            seed: options.seed,
            response_format: options.response_format.as_ref(),
            functions: options.functions.as_deref(),
            function_call: options.function_call.as_ref().map(function_call_value),
            stream: stream.then_some(true),
        }
    }

    #[instrument(skip(self, key, request), fields(model = %request.model))]
    async fn send_chat(&self, key: &str, request: &ChatRequest<'_>) -> Result<ChatResponse> {
        self.retry
            .execute(&self.policy, || async {
                debug!("Sending chat completion request");
                let response = self.post(key, "/chat/completions").json(request).send().await?;
                let response = Self::checked(response).await?;
                Ok(response.json::<ChatResponse>().await?)
            })
            .await
    }

    async fn send_embeddings(&self, key: &str, model: &str, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest { model, input };
        let mut response: EmbeddingResponse = self
            .retry
            .execute(&self.policy, || async {
                let response = self.post(key, "/embeddings").json(&request).send().await?;
                let response = Self::checked(response).await?;
                Ok(response.json::<EmbeddingResponse>().await?)
            })
            .await?;

        if response.data.len() != input.len() {
            return Err(LlmError::ApiError(format!(
                "expected {} embeddings, got {}",
                input.len(),
                response.data.len()
            )));
        }
        response.data.sort_by_key(|d| d.index);
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }

    fn tokenizer(&self, model: Option<&str>) -> Result<Tokenizer> {
        let model = model
            .or(self.config.default_model.as_deref())
            .unwrap_or(DEFAULT_MODEL);
        Tokenizer::for_model(model)
    }
}

#[async_trait]
impl ModelService for OpenAIService {
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

    async fn complete_chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        let key = self.config.require_api_key(PROVIDER)?;
        let model = resolve_model(self, &self.config, options.model.as_ref(), Capability::Chat).await?;
        self.catalog.ensure_known(&model)?;
        let preview = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let request = Self::build_request(&model, messages, options, false);

        let response = self
            .send_chat(key, &request)
            .await
            .map_err(|e| LlmError::completion(&model, preview, e))?;
        self.catalog.touch(&model);
        parse_response(response, &model).map_err(|e| LlmError::completion(&model, preview, e))
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
        let key = self.config.require_api_key(PROVIDER)?;
        let model = resolve_model(self, &self.config, options.model.as_ref(), Capability::Chat).await?;
        self.catalog.ensure_known(&model)?;
        let preview = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let request = Self::build_request(&model, messages, options, true);

        let source = open_events(self.post(key, "/chat/completions").json(&request))
            .await
            .map_err(|e| LlmError::completion(&model, preview, e))?;
        self.catalog.touch(&model);

        Ok(fragments(event_data(source), decode_chunk))
    }

    async fn embed(&self, text: &str, options: &EmbeddingOptions) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()], options).await?;
        vectors
            .pop()
            .ok_or_else(|| LlmError::ApiError("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String], options: &EmbeddingOptions) -> Result<Vec<Vec<f32>>> {
        let key = self.config.require_api_key(PROVIDER)?;
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model =
            resolve_model(self, &self.config, options.model.as_ref(), Capability::Embeddings).await?;
        self.catalog.ensure_known(&model)?;
        let preview = texts.first().map(String::as_str).unwrap_or_default();

        let vectors = self
            .send_embeddings(key, &model, texts)
            .await
            .map_err(|e| LlmError::completion(&model, preview, e))?;
        self.catalog.touch(&model);
        Ok(vectors)
    }

    async fn tokenize(&self, text: &str, model: Option<&str>) -> Result<Vec<String>> {
        self.tokenizer(model)?.tokenize(text)
    }

    async fn count_tokens(&self, text: &str, model: Option<&str>) -> Result<usize> {
        Ok(self.tokenizer(model)?.count_tokens(text))
    }

    /// `GET /models` with the configured key.
    async fn is_healthy(&self) -> bool {
        let Ok(key) = self.config.require_api_key(PROVIDER) else {
            return false;
        };
        let probe = self
            .client
            .get(join_url(&self.config.base_url, "/models"))
            .bearer_auth(key)
            .send()
            .await;
        match probe {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("OpenAI health probe failed: {}", e);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::collect_text;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn config(base_url: String) -> ServiceConfig {
        ServiceConfig::new(base_url)
            .with_api_key("sk-test")
            .with_default_model(DEFAULT_MODEL)
            .with_retries(2, Duration::from_millis(1))
    }

    fn chat_body(content: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12 }
        })
    }

    #[test]
    fn test_function_call_mode_wire_values() {
        assert_eq!(function_call_value(&FunctionCallMode::Auto), json!("auto"));
        assert_eq!(function_call_value(&FunctionCallMode::None), json!("none"));
        assert_eq!(
            function_call_value(&FunctionCallMode::Named("lookup".into())),
            json!({ "name": "lookup" })
        );
    }

    #[test]
    fn test_decode_chunks() {
        let delta = r#"{"choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        assert_eq!(decode_chunk(delta).unwrap(), Frame::Text("Hi".into()));
        let last = r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(decode_chunk(last).unwrap(), Frame::Final(String::new()));
        assert_eq!(decode_chunk(r#"{"choices":[]}"#).unwrap(), Frame::Skip);
        assert_eq!(decode_chunk("[DONE]").unwrap(), Frame::End);
        assert!(decode_chunk("not json").is_err());
    }

    #[test]
    fn test_system_prompt_prepended() {
        let options = CompletionOptions::default().with_system_prompt("Be brief");
        let wire = wire_messages(&[ChatMessage::user("Hi")], &options);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].content.as_deref(), Some("Hi"));
    }

    #[tokio::test]
    async fn test_complete_reports_usage() {
        let server = MockServer::start_async().await;
        let chat = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .header("authorization", "Bearer sk-test")
                    .json_body_partial(r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"Hi"}]}"#);
                then.status(200).json_body(chat_body("Hello there"));
            })
            .await;

        let service = OpenAIService::new(config(server.base_url())).unwrap();
        let response = service.complete("Hi", &CompletionOptions::default()).await.unwrap();

        chat.assert_async().await;
        assert_eq!(response.text, "Hello there");
        assert_eq!(response.provider, "openai");
        assert_eq!(response.usage.total_tokens, 12);
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_function_call_response() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{"function_call":"auto","functions":[{"name":"get_weather"}]}"#);
                then.status(200).json_body(json!({
                    "model": "gpt-4o",
                    "choices": [{
                        "message": {
                            "role": "assistant",
                            "content": null,
                            "function_call": { "name": "get_weather", "arguments": "{\"city\":\"Paris\"}" }
                        },
                        "finish_reason": "function_call"
                    }],
                    "usage": { "prompt_tokens": 40, "completion_tokens": 12 }
                }));
            })
            .await;

        let options = CompletionOptions {
            model: Some("gpt-4o".into()),
            functions: Some(vec![FunctionDefinition {
                name: "get_weather".into(),
                description: "Current weather".into(),
                parameters: json!({ "type": "object", "properties": { "city": { "type": "string" } } }),
            }]),
            function_call: Some(FunctionCallMode::Auto),
            ..Default::default()
        };

        let service = OpenAIService::new(config(server.base_url())).unwrap();
        let response = service.complete("Weather in Paris?", &options).await.unwrap();

        assert_eq!(response.finish_reason, FinishReason::FunctionCall);
        let call = response.function_call.unwrap();
        assert_eq!(call.name, "get_weather");
        let args: Value = call.parse_arguments().unwrap();
        assert_eq!(args["city"], "Paris");
    }

    #[tokio::test]
    async fn test_rate_limit_retried_then_auth_not() {
        let server = MockServer::start_async().await;
        let limited = server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(429)
                    .json_body(json!({ "error": { "message": "Rate limit reached", "type": "requests" } }));
            })
            .await;

        let service = OpenAIService::new(config(server.base_url())).unwrap();
        let err = service.complete("Hi", &CompletionOptions::default()).await.unwrap_err();
        assert_eq!(err.http_status(), 429);
        limited.assert_hits_async(3).await;
        limited.delete_async().await;

        let unauthorized = server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(401)
                    .json_body(json!({ "error": { "message": "Incorrect API key provided" } }));
            })
            .await;
        let err = service.complete("Hi", &CompletionOptions::default()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Incorrect API key"));
        unauthorized.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_missing_key_fails_fast() {
        let server = MockServer::start_async().await;
        let any = server
            .mock_async(|_when, then| {
                then.status(200).json_body(chat_body("never"));
            })
            .await;

        let service = OpenAIService::new(ServiceConfig::new(server.base_url())).unwrap();
        let err = service.complete("Hi", &CompletionOptions::default()).await.unwrap_err();
        assert!(matches!(err, LlmError::ApiKeyMissing { .. }));
        assert!(service.embed("Hi", &EmbeddingOptions::default()).await.is_err());
        assert!(!service.is_healthy().await);
        any.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn test_unknown_model_rejected_before_request() {
        let server = MockServer::start_async().await;
        let any = server
            .mock_async(|_when, then| {
                then.status(404).json_body(json!({ "error": { "message": "no such model" } }));
            })
            .await;

        let service = OpenAIService::new(config(server.base_url())).unwrap();
        let err = service
            .complete("Hi", &CompletionOptions::for_model("gpt-9"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MODEL_NOT_FOUND");

        let err = service
            .stream("Hi", &CompletionOptions::for_model("gpt-9"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "MODEL_NOT_FOUND");

        let err = service
            .embed("Hi", &EmbeddingOptions::for_model("embed-9"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MODEL_NOT_FOUND");
        any.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn test_embed_batch_sorted_by_index() {
        let server = MockServer::start_async().await;
        let embeddings = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/embeddings")
                    .json_body_partial(r#"{"model":"text-embedding-3-small","input":["a","b"]}"#);
                then.status(200).json_body(json!({
                    "object": "list",
                    "data": [
                        { "object": "embedding", "index": 1, "embedding": [0.0, 1.0] },
                        { "object": "embedding", "index": 0, "embedding": [1.0, 0.0] }
                    ],
                    "usage": { "prompt_tokens": 2, "total_tokens": 2 }
                }));
            })
            .await;

        let service = OpenAIService::new(config(server.base_url())).unwrap();
        let vectors = service
            .embed_batch(&["a".to_string(), "b".to_string()], &EmbeddingOptions::default())
            .await
            .unwrap();

        embeddings.assert_async().await;
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_stream_sse() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{"stream":true}"#);
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(concat!(
                        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
                        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
                        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
                        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
                        "data: [DONE]\n\n",
                    ));
            })
            .await;

        let service = OpenAIService::new(config(server.base_url())).unwrap();
        let stream = service.stream("Hi", &CompletionOptions::default()).await.unwrap();
        assert_eq!(collect_text(stream).await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn test_stream_unauthorized_fails_before_fragments() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(401)
                    .json_body(json!({ "error": { "message": "bad key" } }));
            })
            .await;

        let service = OpenAIService::new(config(server.base_url())).unwrap();
        let err = service
            .stream("Hi", &CompletionOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.http_status(), 401);
    }

    #[tokio::test]
    async fn test_health_probe_lists_models() {
        let server = MockServer::start_async().await;
        let models = server
            .mock_async(|when, then| {
                when.method(GET).path("/models").header("authorization", "Bearer sk-test");
                then.status(200).json_body(json!({ "object": "list", "data": [] }));
            })
            .await;

        let service = OpenAIService::new(config(server.base_url())).unwrap();
        assert!(service.is_healthy().await);
        models.assert_async().await;
    }

    #[tokio::test]
    async fn test_exact_token_count() {
        let service = OpenAIService::new(config("http://127.0.0.1:9".into())).unwrap();
        let count = service.count_tokens("Hello, world!", None).await.unwrap();
        let pieces = service.tokenize("Hello, world!", Some("gpt-4")).await.unwrap();
        assert!(count > 0 && count < 13);
        assert_eq!(pieces.concat(), "Hello, world!");
    }

    #[tokio::test]
    async fn test_embedding_default_resolves_embedding_model() {
        let service = OpenAIService::new(config("http://127.0.0.1:9".into())).unwrap();
        let model = service.default_model(Some(Capability::Embeddings)).await.unwrap();
        assert_eq!(model, DEFAULT_EMBEDDING_MODEL);
    }
}
