//! Scripted in-process service for tests.
//!
//! `MockService` answers from a queue of scripted replies and counts every
//! call that reaches it, so decorator tests can assert whether a request
//! was served from cache or forwarded. When the queue is empty it answers
//! `"Mock response"`.
//!
//! ```
//! use edgequake_router::providers::MockService;
//!
//! let mock = MockService::new();
//! mock.push_text("Hello from the mock");
//! assert_eq!(mock.completions(), 0);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use super::ActiveModels;
use crate::error::{LlmError, Result};
use crate::stream::FragmentStream;
use crate::tokenizer::estimate_tokens;
use crate::traits::{
    resolve_default_model, Capability, ChatMessage, CompletionOptions, CompletionResponse,
    EmbeddingOptions, Model, ModelService, ModelStatus, ServiceIdentity,
};

/// Embedding width produced by the mock.
pub const MOCK_DIMENSION: usize = 8;

const DEFAULT_REPLY: &str = "Mock response";

enum Script {
    Text(String),
    Fail(LlmError),
    /// Stream these fragments, then fail.
    Partial(Vec<String>, LlmError),
}

/// Deterministic test double implementing [`ModelService`].
pub struct MockService {
    name: String,
    models: Vec<Model>,
    replies: Mutex<VecDeque<Script>>,
    list_error: Option<String>,
    healthy: AtomicBool,
    active: ActiveModels,
    completions: AtomicUsize,
    streams: AtomicUsize,
    embeddings: AtomicUsize,
    list_calls: AtomicUsize,
}

impl std::fmt::Debug for MockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockService")
            .field("name", &self.name)
            .field("models", &self.models.len())
            .finish()
    }
}

impl MockService {
    /// A chat model `mock-chat` and an embedding model `mock-embed`.
    pub fn new() -> Self {
        Self::with_models(vec![
            Model::new("mock-chat", 4096, vec![Capability::Chat]),
            Model::new("mock-embed", 512, vec![Capability::Embeddings]),
        ])
    }

    pub fn with_models(models: Vec<Model>) -> Self {
        Self {
            name: "mock".to_string(),
            models,
            replies: Mutex::new(VecDeque::new()),
            list_error: None,
            healthy: AtomicBool::new(true),
            active: ActiveModels::new(),
            completions: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
            embeddings: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Report a different provider name through [`ModelService::identity`].
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Make `list_models` fail with a network error.
    pub fn failing_discovery(mut self, message: impl Into<String>) -> Self {
        self.list_error = Some(message.into());
        self
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.script().push_back(Script::Text(text.into()));
    }

    pub fn push_error(&self, error: LlmError) {
        self.script().push_back(Script::Fail(error));
    }

    /// Next stream yields `fragments`, then `error`.
    pub fn push_partial_stream(&self, fragments: Vec<String>, error: LlmError) {
        self.script().push_back(Script::Partial(fragments, error));
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Completion and chat calls received.
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    /// Embedding calls received (single and batch).
    pub fn embeddings(&self) -> usize {
        self.embeddings.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn script(&self) -> std::sync::MutexGuard<'_, VecDeque<Script>> {
        self.replies.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn next_reply(&self) -> Script {
        self.script()
            .pop_front()
            .unwrap_or_else(|| Script::Text(DEFAULT_REPLY.to_string()))
    }

    fn model_for(&self, options: &CompletionOptions) -> String {
        options
            .model
            .clone()
            .or_else(|| resolve_default_model(None, &self.models, Some(Capability::Chat)))
            .unwrap_or_else(|| "mock-model".to_string())
    }

    fn not_found(&self, id: &str) -> LlmError {
        LlmError::ModelNotFound {
            model: id.to_string(),
            provider: self.name.clone(),
        }
    }

    fn vector(text: &str) -> Vec<f32> {
        let seed = text.chars().map(|c| c as u32).sum::<u32>();
        (0..MOCK_DIMENSION)
            .map(|i| ((seed + i as u32) % 97) as f32 / 97.0)
            .collect()
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelService for MockService {
    fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::Provider(self.name.clone())
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        match &self.list_error {
            Some(message) => Err(LlmError::NetworkError(message.clone())),
            None => Ok(self.active.annotate(self.models.clone())),
        }
    }

    async fn load_model(&self, id: &str) -> Result<()> {
        if !self.models.iter().any(|m| m.id == id) {
            return Err(self.not_found(id));
        }
        self.active.mark_loaded(id);
        Ok(())
    }

    async fn unload_model(&self, id: &str) -> Result<()> {
        self.active.unload(id);
        Ok(())
    }

    async fn active_models(&self) -> Result<Vec<Model>> {
        Ok(self
            .active
            .annotate(self.models.clone())
            .into_iter()
            .filter(|m| m.loaded)
            .collect())
    }

    async fn model_status(&self, id: &str) -> Result<ModelStatus> {
        if !self.models.iter().any(|m| m.id == id) {
            return Err(self.not_found(id));
        }
        Ok(ModelStatus {
            model_id: id.to_string(),
            available: true,
            loaded: self.active.is_loaded(id),
            last_used: self.active.last_used(id),
        })
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<CompletionResponse> {
        self.complete_chat(&[ChatMessage::user(prompt)], options).await
    }

    async fn complete_chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        let model = self.model_for(options);
        let prompt: String = messages.iter().map(|m| m.content.as_str()).collect();

        match self.next_reply() {
            Script::Text(text) => {
                self.active.touch(&model);
                let completion_tokens = estimate_tokens(&text);
                Ok(CompletionResponse::new(text, model, self.name.clone())
                    .with_usage(estimate_tokens(&prompt), completion_tokens))
            }
            Script::Fail(e) | Script::Partial(_, e) => Err(e),
        }
    }

    async fn stream(&self, prompt: &str, options: &CompletionOptions) -> Result<FragmentStream> {
        self.stream_chat(&[ChatMessage::user(prompt)], options).await
    }

    async fn stream_chat(
        &self,
        _messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<FragmentStream> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        match self.next_reply() {
            Script::Text(text) => {
                let pieces: Vec<Result<String>> =
                    text.split_inclusive(' ').map(|p| Ok(p.to_string())).collect();
                Ok(stream::iter(pieces).boxed())
            }
            Script::Fail(e) => Err(e),
            Script::Partial(fragments, e) => {
                let items = fragments.into_iter().map(Ok).chain(std::iter::once(Err(e)));
                Ok(stream::iter(items.collect::<Vec<_>>()).boxed())
            }
        }
    }

    async fn embed(&self, text: &str, options: &EmbeddingOptions) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()], options).await?;
        Ok(vectors.pop().unwrap_or_default())
    }

    async fn embed_batch(&self, texts: &[String], _options: &EmbeddingOptions) -> Result<Vec<Vec<f32>>> {
        self.embeddings.fetch_add(1, Ordering::SeqCst);
        let fails = matches!(self.script().front(), Some(Script::Fail(_)));
        if fails {
            if let Script::Fail(e) = self.next_reply() {
                return Err(e);
            }
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn default_model(&self, capability: Option<Capability>) -> Result<String> {
        resolve_default_model(None, &self.models, capability).ok_or_else(|| self.not_found("<default>"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::collect_text;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let mock = MockService::new();
        mock.push_text("first");
        mock.push_error(LlmError::RateLimited("slow down".into()));

        let options = CompletionOptions::default();
        assert_eq!(mock.complete("a", &options).await.unwrap().text, "first");
        assert!(mock.complete("b", &options).await.is_err());
        assert_eq!(mock.complete("c", &options).await.unwrap().text, DEFAULT_REPLY);
        assert_eq!(mock.completions(), 3);
    }

    #[tokio::test]
    async fn test_stream_fragments_rejoin() {
        let mock = MockService::new();
        mock.push_text("one two three");
        let stream = mock.stream("hi", &CompletionOptions::default()).await.unwrap();
        assert_eq!(collect_text(stream).await.unwrap(), "one two three");
        assert_eq!(mock.streams(), 1);
    }

    #[tokio::test]
    async fn test_embeddings_are_deterministic() {
        let mock = MockService::new();
        let a = mock.embed("hello", &EmbeddingOptions::default()).await.unwrap();
        let b = mock.embed("hello", &EmbeddingOptions::default()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), MOCK_DIMENSION);
        assert_eq!(mock.embeddings(), 2);
    }

    #[tokio::test]
    async fn test_default_model_by_capability() {
        let mock = MockService::new();
        assert_eq!(mock.default_model(Some(Capability::Embeddings)).await.unwrap(), "mock-embed");
        assert_eq!(mock.default_model(None).await.unwrap(), "mock-chat");
    }

    #[tokio::test]
    async fn test_failing_discovery() {
        let mock = MockService::new().failing_discovery("connection refused");
        assert!(mock.list_models().await.is_err());
        assert_eq!(mock.list_calls(), 1);
    }
}
