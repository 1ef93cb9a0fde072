//! Response caching decorator.
//!
//! [`CachingService`] memoizes the blocking completion calls, the embedding
//! calls and model listings of the service it wraps. Streaming calls pass
//! through untouched.
//!
//! ## Semantics
//!
//! - Keys are a SHA-256 over a canonical JSON rendering of the request, so
//!   option fields hash the same regardless of object key order.
//! - Each value kind has its own map and TTL. Expired entries are removed on
//!   read and by a periodic background sweep.
//! - At capacity, inserting evicts the single entry with the oldest insertion
//!   time. Reads do not refresh an entry's position.
//! - Failed calls are never cached.
//! - `load_model`/`unload_model` invalidate the model-listing cache.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::stream::FragmentStream;
use crate::traits::{
    Capability, ChatMessage, CompletionOptions, CompletionResponse, EmbeddingOptions, Model,
    ModelService, ModelStatus, ServiceIdentity,
};

/// Configuration for the response cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of entries per value kind.
    pub max_entries: usize,
    pub completion_ttl: Duration,
    pub embedding_ttl: Duration,
    pub model_list_ttl: Duration,
    /// Period of the background expiry sweep. Zero disables it.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            completion_ttl: Duration::from_secs(3600),
            embedding_ttl: Duration::from_secs(24 * 3600),
            model_list_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with specified max entries.
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Default::default()
        }
    }

    /// Use the same TTL for every value kind.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.completion_ttl = ttl;
        self.embedding_ttl = ttl;
        self.model_list_ttl = ttl;
        self
    }

    pub fn with_completion_ttl(mut self, ttl: Duration) -> Self {
        self.completion_ttl = ttl;
        self
    }

    pub fn with_embedding_ttl(mut self, ttl: Duration) -> Self {
        self.embedding_ttl = ttl;
        self
    }

    pub fn with_model_list_ttl(mut self, ttl: Duration) -> Self {
        self.model_list_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    /// Current number of entries.
    pub entries: usize,
    /// Entries dropped to make room.
    pub evictions: usize,
    /// Entries dropped because their TTL elapsed.
    pub expired: usize,
}

impl CacheStats {
    /// Get the cache hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn merge(self, other: CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            entries: self.entries + other.entries,
            evictions: self.evictions + other.evictions,
            expired: self.expired + other.expired,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    hits: u64,
}

/// Bounded map with per-entry TTL and oldest-insertion eviction.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    ttl: Duration,
    capacity: usize,
    stats: CacheStats,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity,
            stats: CacheStats::default(),
        }
    }

    /// Live value for `key`. An expired entry is removed and reported as a miss.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let expired = match self.entries.get(key) {
            None => {
                self.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
        };

        if expired {
            self.entries.remove(key);
            self.stats.expired += 1;
            self.stats.misses += 1;
            return None;
        }

        self.stats.hits += 1;
        self.entries.get_mut(key).map(|entry| {
            entry.hits += 1;
            entry.value.clone()
        })
    }

    /// Insert, evicting the oldest entry when full. Re-inserting a key
    /// replaces it and restarts its TTL.
    pub fn insert(&mut self, key: String, value: V) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
                self.stats.evictions += 1;
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                hits: 0,
            },
        );
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
        let removed = before - self.entries.len();
        self.stats.expired += removed;
        removed
    }

    /// Number of reads served by `key` since insertion.
    pub fn hits_for(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.hits)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }
}

/// Sort object keys recursively so equal values render identically.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let sorted: Map<String, Value> = entries
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Stable cache key: SHA-256 hex over canonical JSON.
pub fn cache_key<T: Serialize>(value: &T) -> String {
    let canonical = serde_json::to_value(value)
        .map(canonicalize)
        .unwrap_or(Value::Null);
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    format!("{:x}", digest)
}

/// Every option an adapter puts on the wire.
fn completion_fields(options: &CompletionOptions) -> Value {
    json!({
        "model": options.model,
        "temperature": options.temperature,
        "topP": options.top_p,
        "topK": options.top_k,
        "maxTokens": options.max_tokens,
        "stop": options.stop,
        "seed": options.seed,
        "systemPrompt": options.system_prompt,
        "responseFormat": options.response_format,
        "functions": options.functions,
        "functionCall": options.function_call,
    })
}

const MODEL_LIST_KEY: &str = "models";

#[derive(Debug)]
struct CacheStore {
    completions: RwLock<TtlCache<CompletionResponse>>,
    embeddings: RwLock<TtlCache<Vec<Vec<f32>>>>,
    models: RwLock<TtlCache<Vec<Model>>>,
}

impl CacheStore {
    fn new(config: &CacheConfig) -> Self {
        Self {
            completions: RwLock::new(TtlCache::new(config.max_entries, config.completion_ttl)),
            embeddings: RwLock::new(TtlCache::new(config.max_entries, config.embedding_ttl)),
            models: RwLock::new(TtlCache::new(config.max_entries, config.model_list_ttl)),
        }
    }

    async fn sweep(&self) -> usize {
        self.completions.write().await.purge_expired()
            + self.embeddings.write().await.purge_expired()
            + self.models.write().await.purge_expired()
    }
}

fn spawn_sweeper(store: Weak<CacheStore>, period: Duration) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        return None;
    }
    let handle = tokio::runtime::Handle::try_current().ok()?;
    Some(handle.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                break;
            };
            let removed = store.sweep().await;
            if removed > 0 {
                debug!(removed, "Swept expired cache entries");
            }
        }
    }))
}

/// Caching decorator over any [`ModelService`].
///
/// Each instance owns its maps; nothing is shared between instances.
pub struct CachingService {
    inner: Arc<dyn ModelService>,
    store: Arc<CacheStore>,
    sweeper: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CachingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingService")
            .field("inner", &self.inner.identity())
            .field("sweeping", &self.sweeper.is_some())
            .finish()
    }
}

impl CachingService {
    /// Wrap `inner`. The expiry sweep only runs when created inside a Tokio runtime.
    pub fn new(inner: Arc<dyn ModelService>, config: CacheConfig) -> Self {
        let store = Arc::new(CacheStore::new(&config));
        let sweeper = spawn_sweeper(Arc::downgrade(&store), config.sweep_interval);
        Self {
            inner,
            store,
            sweeper,
        }
    }

    /// Combined statistics over all value kinds.
    pub async fn stats(&self) -> CacheStats {
        let completions = self.store.completions.read().await.stats();
        let embeddings = self.store.embeddings.read().await.stats();
        let models = self.store.models.read().await.stats();
        completions.merge(embeddings).merge(models)
    }

    pub async fn completion_stats(&self) -> CacheStats {
        self.store.completions.read().await.stats()
    }

    pub async fn embedding_stats(&self) -> CacheStats {
        self.store.embeddings.read().await.stats()
    }

    /// Clear all cache entries.
    pub async fn clear(&self) {
        self.store.completions.write().await.clear();
        self.store.embeddings.write().await.clear();
        self.store.models.write().await.clear();
    }

    async fn cached_completion<F, Fut>(&self, key: String, call: F) -> Result<CompletionResponse>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CompletionResponse>>,
    {
        if let Some(hit) = self.store.completions.write().await.get(&key) {
            debug!("Completion cache hit");
            return Ok(hit);
        }
        let response = call().await?;
        self.store
            .completions
            .write()
            .await
            .insert(key, response.clone());
        Ok(response)
    }

    async fn cached_embeddings<F, Fut>(&self, key: String, call: F) -> Result<Vec<Vec<f32>>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<Vec<f32>>>>,
    {
        if let Some(hit) = self.store.embeddings.write().await.get(&key) {
            debug!("Embedding cache hit");
            return Ok(hit);
        }
        let vectors = call().await?;
        self.store
            .embeddings
            .write()
            .await
            .insert(key, vectors.clone());
        Ok(vectors)
    }

    async fn invalidate_models(&self) {
        self.store.models.write().await.clear();
    }
}

impl Drop for CachingService {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[async_trait]
impl ModelService for CachingService {
    fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::Cache
    }

    fn inner(&self) -> Option<&dyn ModelService> {
        Some(self.inner.as_ref())
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        if let Some(models) = self.store.models.write().await.get(MODEL_LIST_KEY) {
            return Ok(models);
        }
        let models = self.inner.list_models().await?;
        self.store
            .models
            .write()
            .await
            .insert(MODEL_LIST_KEY.to_string(), models.clone());
        Ok(models)
    }

    async fn load_model(&self, id: &str) -> Result<()> {
        let result = self.inner.load_model(id).await;
        self.invalidate_models().await;
        result
    }

    async fn unload_model(&self, id: &str) -> Result<()> {
        let result = self.inner.unload_model(id).await;
        self.invalidate_models().await;
        result
    }

    async fn active_models(&self) -> Result<Vec<Model>> {
        self.inner.active_models().await
    }

    async fn model_status(&self, id: &str) -> Result<ModelStatus> {
        self.inner.model_status(id).await
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<CompletionResponse> {
        let key = cache_key(&json!({
            "op": "complete",
            "prompt": prompt,
            "options": completion_fields(options),
        }));
        self.cached_completion(key, || self.inner.complete(prompt, options))
            .await
    }

    async fn complete_chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        let key = cache_key(&json!({
            "op": "chat",
            "messages": messages,
            "options": completion_fields(options),
        }));
        self.cached_completion(key, || self.inner.complete_chat(messages, options))
            .await
    }

    async fn stream(&self, prompt: &str, options: &CompletionOptions) -> Result<FragmentStream> {
        self.inner.stream(prompt, options).await
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<FragmentStream> {
        self.inner.stream_chat(messages, options).await
    }

    async fn embed(&self, text: &str, options: &EmbeddingOptions) -> Result<Vec<f32>> {
        let key = cache_key(&json!({ "op": "embed", "text": text, "model": options.model }));
        let mut vectors = self
            .cached_embeddings(key, || async {
                self.inner.embed(text, options).await.map(|v| vec![v])
            })
            .await?;
        Ok(vectors.pop().unwrap_or_default())
    }

    async fn embed_batch(&self, texts: &[String], options: &EmbeddingOptions) -> Result<Vec<Vec<f32>>> {
        let key = cache_key(&json!({ "op": "embed_batch", "texts": texts, "model": options.model }));
        self.cached_embeddings(key, || self.inner.embed_batch(texts, options))
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
