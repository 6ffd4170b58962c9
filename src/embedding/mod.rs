//! Embedding models, loaders and the per-model cache.
//!
//! An [`EmbeddingModel`] turns a batch of texts into vectors. A
//! [`ModelLoader`] produces models by id. The [`Embedder`] sits in front of a
//! loader and keeps every successfully loaded model for the life of the
//! process:
//!
//! - **[`LocalLoader`]**: runs models locally via fastembed (primary) or
//!   tract (musl/Intel Mac). The model is downloaded on first use and kept
//!   in memory afterwards.
//! - **[`OpenAiLoader`]**: `POST /v1/embeddings` with batching, retry and
//!   backoff.
//! - **[`OllamaLoader`]**: `POST /api/embed` on a local Ollama instance.
//!
//! # Cache
//!
//! The cache key is the model id. Each id owns a once-only cell, so
//! concurrent first callers wait on a single in-flight load and then share
//! the result. A failed load evicts its cell; the next call retries.
//!
//! Callers may only name the default model or one listed in
//! `embedding.models`, so request input cannot grow the cache.
//!
//! # Retry Strategy
//!
//! The OpenAI and Ollama backends use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

#[cfg(feature = "local-embeddings-tract")]
mod local_tract;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;

use docqa_core::embedding::{uniform_dimension, Vector};
use docqa_core::{PipelineError, Result};

use crate::config::EmbeddingConfig;

/// A loaded embedding model.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Identifier the model was loaded under.
    fn model_id(&self) -> &str;

    /// Embed `texts`, one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>>;
}

/// Produces [`EmbeddingModel`]s by id. Called at most once per id by a
/// successful [`Embedder`] lookup.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn EmbeddingModel>>;
}

type ModelCell = Arc<OnceCell<Arc<dyn EmbeddingModel>>>;

/// Cached front for a [`ModelLoader`].
pub struct Embedder {
    loader: Arc<dyn ModelLoader>,
    default_model: String,
    allowed: Vec<String>,
    models: Mutex<HashMap<String, ModelCell>>,
}

impl Embedder {
    pub fn new(loader: Arc<dyn ModelLoader>, default_model: impl Into<String>) -> Self {
        let default_model = default_model.into();
        Self {
            loader,
            allowed: vec![default_model.clone()],
            default_model,
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Also accept `ids` from callers, besides the default model.
    pub fn with_models<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            let id = id.into();
            if !self.allowed.contains(&id) {
                self.allowed.push(id);
            }
        }
        self
    }

    /// Build an embedder with the loader selected by `config.provider`.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self::new(create_loader(config)?, config.model.clone())
            .with_models(config.models.iter().cloned()))
    }

    /// Model id used when a caller does not name one.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Model ids callers may request.
    pub fn allowed_models(&self) -> &[String] {
        &self.allowed
    }

    /// Resolve an optional caller-supplied id to the id actually used.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] for an id that is not allowed.
    pub fn resolve_model<'a>(&'a self, model_id: Option<&'a str>) -> Result<&'a str> {
        match model_id {
            Some(id) if !id.trim().is_empty() => {
                if self.allowed.iter().any(|m| m == id) {
                    Ok(id)
                } else {
                    Err(PipelineError::Configuration(format!(
                        "embedding model '{}' is not enabled (allowed: {})",
                        id,
                        self.allowed.join(", ")
                    )))
                }
            }
            _ => Ok(&self.default_model),
        }
    }

    /// Return the cached model for `model_id`, loading it on first use.
    pub async fn model(&self, model_id: &str) -> Result<Arc<dyn EmbeddingModel>> {
        let cell = {
            let mut models = self.models.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(models.entry(model_id.to_string()).or_default())
        };
        let loaded = cell
            .get_or_try_init(|| async {
                let started = std::time::Instant::now();
                let model = self.loader.load(model_id).await?;
                tracing::info!(
                    model = model_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "loaded embedding model"
                );
                Ok::<_, PipelineError>(model)
            })
            .await;
        match loaded {
            Ok(model) => Ok(Arc::clone(model)),
            Err(e) => {
                self.evict_failed(model_id, &cell);
                tracing::warn!(model = model_id, error = %e, "embedding model failed to load");
                Err(e)
            }
        }
    }

    /// Drop `cell` from the cache unless it is initialized or was replaced.
    fn evict_failed(&self, model_id: &str, cell: &ModelCell) {
        let mut models = self.models.lock().unwrap_or_else(PoisonError::into_inner);
        let stale = models
            .get(model_id)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && !current.initialized());
        if stale {
            models.remove(model_id);
        }
    }

    /// Number of model ids with a cache slot.
    pub fn cached_model_count(&self) -> usize {
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether `model_id` has been loaded successfully.
    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model_id)
            .is_some_and(|cell| cell.initialized())
    }

    /// Embed `texts` with `model_id`. An empty batch yields no vectors
    /// without loading anything.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmbeddingBackend`] on load or inference failure, or
    /// when the backend returns the wrong number of vectors or vectors of
    /// different lengths.
    pub async fn embed(&self, texts: &[String], model_id: &str) -> Result<Vec<Vector>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model(model_id).await?;
        let vectors = model.embed(texts).await?;

        if vectors.len() != texts.len() {
            return Err(PipelineError::EmbeddingBackend(format!(
                "model '{}' returned {} vectors for {} texts",
                model_id,
                vectors.len(),
                texts.len()
            )));
        }
        let dim = uniform_dimension(&vectors).map_err(|e| {
            PipelineError::EmbeddingBackend(format!("model '{}': {}", model_id, e))
        })?;
        tracing::debug!(model = model_id, count = vectors.len(), dim, "embedded batch");
        Ok(vectors)
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str, model_id: &str) -> Result<Vector> {
        self.embed(&[text.to_string()], model_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::EmbeddingBackend("empty embedding response".into()))
    }
}

fn backend_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::EmbeddingBackend(e.to_string())
}

/// Create the [`ModelLoader`] for `config.provider`.
///
/// | Config Value | Loader |
/// |-------------|----------|
/// | `"local"` | [`LocalLoader`] (fastembed or tract, see features) |
/// | `"openai"` | [`OpenAiLoader`] |
/// | `"ollama"` | [`OllamaLoader`] |
pub fn create_loader(config: &EmbeddingConfig) -> Result<Arc<dyn ModelLoader>> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(LocalLoader::new(config))),
        "openai" => Ok(Arc::new(OpenAiLoader::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaLoader::new(config)?)),
        other => Err(PipelineError::Configuration(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Local Loader (fastembed or tract) ============

/// Loads models for local inference.
///
/// Models are downloaded on first use from Hugging Face and cached on disk.
/// After that, embeddings run entirely offline.
pub struct LocalLoader {
    batch_size: usize,
}

impl LocalLoader {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size,
        }
    }
}

#[async_trait]
impl ModelLoader for LocalLoader {
    #[cfg(feature = "local-embeddings-fastembed")]
    async fn load(&self, model_id: &str) -> Result<Arc<dyn EmbeddingModel>> {
        Ok(Arc::new(FastembedModel::load(model_id, self.batch_size).await?))
    }

    #[cfg(all(
        feature = "local-embeddings-tract",
        not(feature = "local-embeddings-fastembed")
    ))]
    async fn load(&self, model_id: &str) -> Result<Arc<dyn EmbeddingModel>> {
        Ok(Arc::new(
            local_tract::TractModel::load(model_id, self.batch_size).await?,
        ))
    }

    #[cfg(not(any(
        feature = "local-embeddings-fastembed",
        feature = "local-embeddings-tract"
    )))]
    async fn load(&self, _model_id: &str) -> Result<Arc<dyn EmbeddingModel>> {
        let _ = self.batch_size;
        Err(PipelineError::EmbeddingBackend(
            "local embedding provider requires one of: --features local-embeddings-fastembed, --features local-embeddings-tract".into(),
        ))
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" | "sentence-transformers/all-MiniLM-L6-v2" => {
            Ok(fastembed::EmbeddingModel::AllMiniLML6V2)
        }
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        other => Err(PipelineError::EmbeddingBackend(format!(
            "unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small",
            other
        ))),
    }
}

/// A fastembed model held in memory. Inference needs `&mut`, so calls are
/// serialized per model.
#[cfg(feature = "local-embeddings-fastembed")]
struct FastembedModel {
    id: String,
    batch_size: usize,
    inner: Arc<Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl FastembedModel {
    async fn load(model_id: &str, batch_size: usize) -> Result<Self> {
        let kind = fastembed_model(model_id)?;
        let model = tokio::task::spawn_blocking(move || {
            fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(kind).with_show_download_progress(false),
            )
        })
        .await
        .map_err(backend_err)?
        .map_err(|e| {
            PipelineError::EmbeddingBackend(format!(
                "failed to initialize local embedding model '{}': {}",
                model_id, e
            ))
        })?;
        Ok(Self {
            id: model_id.to_string(),
            batch_size,
            inner: Arc::new(Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingModel for FastembedModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let inner = Arc::clone(&self.inner);
        let batch_size = self.batch_size;
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut model = inner.lock().unwrap_or_else(PoisonError::into_inner);
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| PipelineError::EmbeddingBackend(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(backend_err)?
    }
}

// ============ Remote Loaders ============

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(backend_err)
}

/// POST `body` to `url` with retry and backoff, returning the parsed JSON.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(attempt, delay_secs = delay.as_secs(), backend = label, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json().await.map_err(backend_err);
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = PipelineError::EmbeddingBackend(format!(
                    "{} API error {}: {}",
                    label, status, body_text
                ));
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(PipelineError::EmbeddingBackend(format!(
                    "{} connection error ({}): {}",
                    label, url, e
                )));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        PipelineError::EmbeddingBackend(format!("{} embedding failed after retries", label))
    }))
}

fn json_vector(value: &serde_json::Value) -> Option<Vector> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vector>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| backend_err("invalid OpenAI response: missing data array"))?;

    let mut rows = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let vector = item
            .get("embedding")
            .and_then(json_vector)
            .ok_or_else(|| backend_err("invalid OpenAI response: missing embedding"))?;
        rows.push((index, vector));
    }
    rows.sort_by_key(|(index, _)| *index);
    Ok(rows.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vector>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| backend_err("invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|e| json_vector(e).ok_or_else(|| backend_err("invalid Ollama response: embedding is not an array")))
        .collect()
}

/// Shared state of an HTTP-backed model.
struct RemoteModel {
    id: String,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    batch_size: usize,
    max_retries: u32,
    label: &'static str,
    parse: fn(&serde_json::Value) -> Result<Vec<Vector>>,
}

#[async_trait]
impl EmbeddingModel for RemoteModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            let body = serde_json::json!({
                "model": self.id,
                "input": batch,
            });
            let json = post_with_retry(
                &self.client,
                &self.endpoint,
                self.api_key.as_deref(),
                &body,
                self.max_retries,
                self.label,
            )
            .await?;
            out.extend((self.parse)(&json)?);
        }
        Ok(out)
    }
}

/// OpenAI embeddings API. Requires `OPENAI_API_KEY`.
pub struct OpenAiLoader {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
}

impl OpenAiLoader {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            PipelineError::Configuration("OPENAI_API_KEY environment variable not set".into())
        })?;
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl ModelLoader for OpenAiLoader {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn EmbeddingModel>> {
        Ok(Arc::new(RemoteModel {
            id: model_id.to_string(),
            client: self.client.clone(),
            endpoint: format!("{}/embeddings", self.base_url.trim_end_matches('/')),
            api_key: Some(self.api_key.clone()),
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            label: "OpenAI",
            parse: parse_openai_response,
        }))
    }
}

/// Local Ollama instance. `OLLAMA_BASE_URL` overrides the configured URL.
pub struct OllamaLoader {
    client: reqwest::Client,
    base_url: String,
    batch_size: usize,
    max_retries: u32,
}

impl OllamaLoader {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: ollama_base_url(config.url.as_deref()),
            batch_size: config.batch_size,
            max_retries: config.max_retries,
        })
    }
}

/// `OLLAMA_BASE_URL`, then the configured URL, then the local default.
pub(crate) fn ollama_base_url(configured: Option<&str>) -> String {
    std::env::var("OLLAMA_BASE_URL")
        .ok()
        .filter(|u| !u.trim().is_empty())
        .or_else(|| configured.map(str::to_string))
        .unwrap_or_else(|| "http://localhost:11434".to_string())
}

#[async_trait]
impl ModelLoader for OllamaLoader {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn EmbeddingModel>> {
        Ok(Arc::new(RemoteModel {
            id: model_id.to_string(),
            client: self.client.clone(),
            endpoint: format!("{}/api/embed", self.base_url.trim_end_matches('/')),
            api_key: None,
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            label: "Ollama",
            parse: parse_ollama_response,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        loads: AtomicUsize,
        fail_first: bool,
        dim: usize,
    }

    struct ConstModel {
        id: String,
        dim: usize,
        ragged: bool,
    }

    #[async_trait]
    impl EmbeddingModel for ConstModel {
        fn model_id(&self) -> &str {
            &self.id
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>> {
            Ok(texts
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    let dim = if self.ragged && i == 1 { self.dim + 1 } else { self.dim };
                    vec![t.len() as f32; dim]
                })
                .collect())
        }
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self, model_id: &str) -> Result<Arc<dyn EmbeddingModel>> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_first && n == 0 {
                return Err(PipelineError::EmbeddingBackend("download failed".into()));
            }
            Ok(Arc::new(ConstModel {
                id: model_id.to_string(),
                dim: self.dim,
                ragged: model_id == "ragged",
            }))
        }
    }

    fn embedder(fail_first: bool) -> (Arc<Embedder>, Arc<CountingLoader>) {
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
            fail_first,
            dim: 3,
        });
        let embedder = Arc::new(Embedder::new(loader.clone(), "m"));
        (embedder, loader)
    }

    #[tokio::test]
    async fn test_concurrent_first_use_loads_once() {
        let (embedder, loader) = embedder(false);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let embedder = Arc::clone(&embedder);
                tokio::spawn(async move { embedder.embed_one("hello", "m").await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), vec![5.0; 3]);
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert!(embedder.is_loaded("m"));
    }

    #[tokio::test]
    async fn test_distinct_ids_get_distinct_models() {
        let (embedder, loader) = embedder(false);
        let a = embedder.model("a").await.unwrap();
        let b = embedder.model("b").await.unwrap();
        assert_eq!(a.model_id(), "a");
        assert_eq!(b.model_id(), "b");
        embedder.model("a").await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let (embedder, loader) = embedder(true);
        assert!(matches!(
            embedder.embed_one("x", "m").await,
            Err(PipelineError::EmbeddingBackend(_))
        ));
        assert!(!embedder.is_loaded("m"));
        assert_eq!(embedder.cached_model_count(), 0);
        assert!(embedder.embed_one("x", "m").await.is_ok());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert_eq!(embedder.cached_model_count(), 1);
    }

    struct BrokenLoader;

    #[async_trait]
    impl ModelLoader for BrokenLoader {
        async fn load(&self, model_id: &str) -> Result<Arc<dyn EmbeddingModel>> {
            Err(PipelineError::EmbeddingBackend(format!("no such model: {}", model_id)))
        }
    }

    #[tokio::test]
    async fn test_failed_loads_leave_no_cache_entries() {
        let embedder = Embedder::new(Arc::new(BrokenLoader), "m");
        for i in 0..200 {
            let id = format!("missing-{}", i);
            assert!(embedder.embed_one("x", &id).await.is_err());
        }
        assert_eq!(embedder.cached_model_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_failed_loads_leave_no_cache_entries() {
        let embedder = Arc::new(Embedder::new(Arc::new(BrokenLoader), "m"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let embedder = Arc::clone(&embedder);
                tokio::spawn(async move { embedder.model("m").await.is_err() })
            })
            .collect();
        for h in handles {
            assert!(h.await.unwrap());
        }
        assert_eq!(embedder.cached_model_count(), 0);
    }

    #[tokio::test]
    async fn test_ragged_vectors_rejected() {
        let (embedder, _) = embedder(false);
        let texts = vec!["a".to_string(), "b".to_string()];
        let err = embedder.embed(&texts, "ragged").await.unwrap_err();
        assert!(matches!(err, PipelineError::EmbeddingBackend(_)));
    }

    #[tokio::test]
    async fn test_empty_batch_does_not_load() {
        let (embedder, loader) = embedder(false);
        assert!(embedder.embed(&[], "m").await.unwrap().is_empty());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resolve_model() {
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
            fail_first: false,
            dim: 3,
        });
        let embedder = Embedder::new(loader, "m").with_models(["other", "m"]);
        assert_eq!(embedder.allowed_models(), ["m", "other"]);
        assert_eq!(embedder.resolve_model(None).unwrap(), "m");
        assert_eq!(embedder.resolve_model(Some(" ")).unwrap(), "m");
        assert_eq!(embedder.resolve_model(Some("other")).unwrap(), "other");
        assert!(matches!(
            embedder.resolve_model(Some("unlisted")),
            Err(PipelineError::Configuration(_))
        ));
        assert_eq!(embedder.cached_model_count(), 0);
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [2.0, 2.0]},
                {"index": 0, "embedding": [1.0, 1.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
    }

    #[test]
    fn test_parse_openai_rejects_missing_data() {
        assert!(parse_openai_response(&serde_json::json!({"error": "nope"})).is_err());
    }

    #[test]
    fn test_parse_ollama() {
        let json = serde_json::json!({"embeddings": [[0.5, 1.5], [2.5, 3.5]]});
        assert_eq!(
            parse_ollama_response(&json).unwrap(),
            vec![vec![0.5, 1.5], vec![2.5, 3.5]]
        );
        assert!(parse_ollama_response(&serde_json::json!({"embeddings": [["x"]]})).is_err());
    }
}
