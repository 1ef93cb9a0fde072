//! Usage metrics decorator.
//!
//! [`MetricsService`] wraps any [`ModelService`] and records, per model id,
//! request count, error count, total tokens and a rolling mean latency into
//! a shared [`UsageStore`]. Results and errors pass through unchanged.
//!
//! # Token accounting
//!
//! | Call | Tokens recorded |
//! |------|-----------------|
//! | `complete`, `complete_chat` | `usage.total_tokens` from the response |
//! | `stream`, `stream_chat` | `ceil(chars / 4)` over the fragments seen |
//! | `embed`, `embed_batch` | `ceil(chars / 4)` over the inputs |
//! | any failure | 0, plus one error |
//!
//! A stream is recorded once: when it ends, when it yields an error, or when
//! the consumer drops it, whichever comes first.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::stream::FragmentStream;
use crate::tokenizer::{estimate_tokens, CHARS_PER_TOKEN};
use crate::traits::{
    Capability, ChatMessage, CompletionOptions, CompletionResponse, EmbeddingOptions, Model,
    ModelService, ModelStatus, ServiceIdentity,
};

/// Cumulative usage for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageCounter {
    pub provider: String,
    pub requests: u64,
    pub errors: u64,
    pub total_tokens: u64,
    /// Rolling mean over all requests, failed ones included.
    pub avg_latency_ms: f64,
}

impl UsageCounter {
    fn record(&mut self, tokens: u64, latency: Duration, failed: bool) {
        self.requests += 1;
        if failed {
            self.errors += 1;
        }
        self.total_tokens += tokens;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.requests as f64;
    }
}

/// Aggregate over several counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub requests: u64,
    pub errors: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
}

impl MetricsSummary {
    fn add(&mut self, counter: &UsageCounter) {
        let requests = self.requests + counter.requests;
        if requests > 0 {
            self.avg_latency_ms = (self.avg_latency_ms * self.requests as f64
                + counter.avg_latency_ms * counter.requests as f64)
                / requests as f64;
        }
        self.requests = requests;
        self.errors += counter.errors;
        self.total_tokens += counter.total_tokens;
    }

    /// Fraction of requests that failed.
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reqs={} errors={} tokens={} latency={:.0}ms",
            self.requests, self.errors, self.total_tokens, self.avg_latency_ms
        )
    }
}

/// Per-model counters, shared by every metrics decorator a factory builds.
#[derive(Debug, Clone, Default)]
pub struct UsageStore {
    counters: Arc<Mutex<HashMap<String, UsageCounter>>>,
}

impl UsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, UsageCounter>> {
        self.counters.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record one resolved call.
    pub fn record(&self, model: &str, provider: &str, tokens: u64, latency: Duration, failed: bool) {
        let mut counters = self.lock();
        let counter = counters.entry(model.to_string()).or_insert_with(|| UsageCounter {
            provider: provider.to_string(),
            ..Default::default()
        });
        counter.record(tokens, latency, failed);
    }

    pub fn get(&self, model: &str) -> Option<UsageCounter> {
        self.lock().get(model).cloned()
    }

    /// Copy of every counter, ordered by model id.
    pub fn snapshot(&self) -> BTreeMap<String, UsageCounter> {
        self.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn summary(&self) -> MetricsSummary {
        let mut summary = MetricsSummary::default();
        for counter in self.lock().values() {
            summary.add(counter);
        }
        summary
    }

    pub fn by_provider(&self) -> BTreeMap<String, MetricsSummary> {
        let mut out: BTreeMap<String, MetricsSummary> = BTreeMap::new();
        for counter in self.lock().values() {
            out.entry(counter.provider.clone()).or_default().add(counter);
        }
        out
    }

    pub fn reset(&self) {
        self.lock().clear();
    }
}

/// Provider name behind a service, looking through decorators.
pub fn provider_of(service: &dyn ModelService) -> String {
    match service.identity() {
        ServiceIdentity::Provider(name) => name,
        ServiceIdentity::Cache | ServiceIdentity::Metrics => service
            .inner()
            .map(provider_of)
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

struct StreamRecord {
    store: UsageStore,
    model: String,
    provider: String,
    started: Instant,
    chars: usize,
    failed: bool,
}

impl StreamRecord {
    fn finish(self) {
        let tokens = self.chars.div_ceil(CHARS_PER_TOKEN) as u64;
        self.store
            .record(&self.model, &self.provider, tokens, self.started.elapsed(), self.failed);
    }
}

/// Fragment stream that reports its usage exactly once.
struct MeteredStream {
    inner: FragmentStream,
    record: Option<StreamRecord>,
}

impl Stream for MeteredStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = match this.inner.poll_next_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(item) => item,
        };
        match &item {
            Some(Ok(fragment)) => {
                if let Some(record) = this.record.as_mut() {
                    record.chars += fragment.chars().count();
                }
            }
            Some(Err(_)) => {
                if let Some(mut record) = this.record.take() {
                    record.failed = true;
                    record.finish();
                }
            }
            None => {
                if let Some(record) = this.record.take() {
                    record.finish();
                }
            }
        }
        Poll::Ready(item)
    }
}

impl Drop for MeteredStream {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            record.finish();
        }
    }
}

/// Metrics decorator over any [`ModelService`].
pub struct MetricsService {
    inner: Arc<dyn ModelService>,
    store: UsageStore,
    provider: String,
}

impl fmt::Debug for MetricsService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsService")
            .field("provider", &self.provider)
            .finish()
    }
}

impl MetricsService {
    /// Wrap `inner`, recording into `store`.
    pub fn new(inner: Arc<dyn ModelService>, store: UsageStore) -> Self {
        let provider = provider_of(inner.as_ref());
        Self {
            inner,
            store,
            provider,
        }
    }

    /// Provider every call is attributed to.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn usage(&self) -> &UsageStore {
        &self.store
    }

    /// Same resolution the adapter applies, so usage lands on the model called.
    async fn model_for(&self, requested: Option<&String>, capability: Capability) -> String {
        self.inner
            .request_model(requested.map(String::as_str), capability)
            .await
            .unwrap_or_else(|_| "unknown".to_string())
    }

    async fn observed<T, Fut>(
        &self,
        op: &'static str,
        model: String,
        call: Fut,
        tokens: impl FnOnce(&T) -> u64 + Send,
    ) -> Result<T>
    where
        T: Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let span = info_span!(
            "model_call",
            request_id = %Uuid::new_v4(),
            op,
            model = %model,
            provider = %self.provider
        );
        async move {
            let started = Instant::now();
            let result = call.await;
            let latency = started.elapsed();
            match &result {
                Ok(value) => self.store.record(&model, &self.provider, tokens(value), latency, false),
                Err(e) => {
                    debug!(error = %e, "Call failed");
                    self.store.record(&model, &self.provider, 0, latency, true);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn metered<Fut>(&self, op: &'static str, model: String, call: Fut) -> Result<FragmentStream>
    where
        Fut: Future<Output = Result<FragmentStream>> + Send,
    {
        let span = info_span!(
            "model_stream",
            request_id = %Uuid::new_v4(),
            op,
            model = %model,
            provider = %self.provider
        );
        let started = Instant::now();
        match call.instrument(span).await {
            Ok(inner) => {
                let record = StreamRecord {
                    store: self.store.clone(),
                    model,
                    provider: self.provider.clone(),
                    started,
                    chars: 0,
                    failed: false,
                };
                Ok(MeteredStream {
                    inner,
                    record: Some(record),
                }
                .boxed())
            }
            Err(e) => {
                self.store
                    .record(&model, &self.provider, 0, started.elapsed(), true);
                Err(e)
            }
        }
    }
}

fn response_tokens(response: &CompletionResponse) -> u64 {
    response.usage.total_tokens as u64
}

#[async_trait]
impl ModelService for MetricsService {
    fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::Metrics
    }

    fn inner(&self) -> Option<&dyn ModelService> {
        Some(self.inner.as_ref())
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        self.inner.list_models().await
    }

    async fn load_model(&self, id: &str) -> Result<()> {
        self.inner.load_model(id).await
    }

    async fn unload_model(&self, id: &str) -> Result<()> {
        self.inner.unload_model(id).await
    }

    async fn active_models(&self) -> Result<Vec<Model>> {
        self.inner.active_models().await
    }

    async fn model_status(&self, id: &str) -> Result<ModelStatus> {
        self.inner.model_status(id).await
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<CompletionResponse> {
        let model = self.model_for(options.model.as_ref(), Capability::Chat).await;
        self.observed("complete", model, self.inner.complete(prompt, options), response_tokens)
            .await
    }

    async fn complete_chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        let model = self.model_for(options.model.as_ref(), Capability::Chat).await;
        self.observed(
            "complete_chat",
            model,
            self.inner.complete_chat(messages, options),
            response_tokens,
        )
        .await
    }

    async fn stream(&self, prompt: &str, options: &CompletionOptions) -> Result<FragmentStream> {
        let model = self.model_for(options.model.as_ref(), Capability::Chat).await;
        self.metered("stream", model, self.inner.stream(prompt, options)).await
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<FragmentStream> {
        let model = self.model_for(options.model.as_ref(), Capability::Chat).await;
        self.metered("stream_chat", model, self.inner.stream_chat(messages, options))
            .await
    }

    async fn embed(&self, text: &str, options: &EmbeddingOptions) -> Result<Vec<f32>> {
        let model = self.model_for(options.model.as_ref(), Capability::Embeddings).await;
        let tokens = estimate_tokens(text) as u64;
        self.observed("embed", model, self.inner.embed(text, options), move |_| tokens)
            .await
    }

    async fn embed_batch(&self, texts: &[String], options: &EmbeddingOptions) -> Result<Vec<Vec<f32>>> {
        let model = self.model_for(options.model.as_ref(), Capability::Embeddings).await;
        let tokens: u64 = texts.iter().map(|t| estimate_tokens(t) as u64).sum();
        self.observed(
            "embed_batch",
            model,
            self.inner.embed_batch(texts, options),
            move |_| tokens,
        )
        .await
    }

    async fn tokenize(&self, text: &str, model: Option<&str>) -> Result<Vec<String>> {
        self.inner.tokenize(text, model).await
    }

    async fn count_tokens(&self, text: &str, model: Option<&str>) -> Result<usize> {
        self.inner.count_tokens(text, model).await
    }

    async fn is_healthy(&self) -> bool {
        self.inner.is_healthy().await
    }

    async fn default_model(&self, capability: Option<Capability>) -> Result<String> {
        self.inner.default_model(capability).await
    }

    async fn request_model(&self, requested: Option<&str>, capability: Capability) -> Result<String> {
        self.inner.request_model(requested, capability).await
    }
}
