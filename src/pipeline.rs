//! The retrieval pipeline as a set of operations.
//!
//! [`RagPipeline`] is the composition root: it owns the [`Embedder`] (and
//! its model cache), the [`IndexRegistry`] and the [`Generator`]. The HTTP
//! handlers and sessions call the four operations below and nothing else:
//!
//! | Operation | Method |
//! |-----------|--------|
//! | chunk-and-embed | [`RagPipeline::chunk_and_embed`] |
//! | build-index | [`RagPipeline::build_index`] |
//! | query-index | [`RagPipeline::query_index`] |
//! | generate-answer | [`RagPipeline::generate_answer`] |
//!
//! Embedding calls are bounded by the configured timeouts. Index builds and
//! searches run on the blocking pool.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use docqa_core::chunk::{split_text, validate_window};
use docqa_core::embedding::Vector;
use docqa_core::registry::{ChunkMatch, IndexRegistry};
use docqa_core::{PipelineError, Result};

use crate::answer::{GenerationResult, Generator};
use crate::config::{Config, MIN_CHUNK_SIZE};
use crate::embedding::Embedder;

/// Output of chunk-and-embed.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddedChunks {
    pub chunks: Vec<String>,
    pub vectors: Vec<Vector>,
    pub n_vectors: usize,
    pub vector_dim: usize,
    /// Model id the vectors were produced with.
    pub model: String,
}

/// Output of query-index; the three lists are parallel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub matches: Vec<String>,
    pub distances: Vec<f32>,
    pub indices: Vec<usize>,
}

impl From<Vec<ChunkMatch>> for QueryResult {
    fn from(found: Vec<ChunkMatch>) -> Self {
        let mut out = QueryResult::default();
        for m in found {
            out.indices.push(m.index);
            out.distances.push(m.distance);
            out.matches.push(m.text);
        }
        out
    }
}

pub struct RagPipeline {
    config: Config,
    embedder: Arc<Embedder>,
    registry: Arc<IndexRegistry>,
    generator: Arc<Generator>,
}

impl RagPipeline {
    pub fn new(config: Config, embedder: Embedder, generator: Generator) -> Self {
        Self {
            config,
            embedder: Arc::new(embedder),
            registry: Arc::new(IndexRegistry::new()),
            generator: Arc::new(generator),
        }
    }

    /// Wire up the backends named in `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let embedder = Embedder::from_config(&config.embedding)?;
        let generator = Generator::from_config(&config.generation)?;
        tracing::info!(
            embedding = %config.embedding.provider,
            embedding_model = %config.embedding.model,
            generation = generator.backend_name(),
            generation_model = %config.generation.model,
            "pipeline ready"
        );
        Ok(Self::new(config, embedder, generator))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Split `text` and embed every chunk.
    ///
    /// Window parameters default to `[chunking]`; `model` defaults to
    /// `embedding.model`. Parameters are validated before any work is done,
    /// with the same bounds the configuration file is held to.
    pub async fn chunk_and_embed(
        &self,
        text: &str,
        chunk_size: Option<usize>,
        overlap: Option<usize>,
        model: Option<&str>,
    ) -> Result<EmbeddedChunks> {
        let chunk_size = chunk_size.unwrap_or(self.config.chunking.chunk_size);
        let overlap = overlap.unwrap_or(self.config.chunking.overlap);
        check_window(chunk_size, overlap)?;
        let model = self.embedder.resolve_model(model)?.to_string();
        let chunks = split_text(text, chunk_size, overlap)?;

        let started = std::time::Instant::now();
        let vectors = with_timeout(
            self.config.timeouts.ingest(),
            "embedding chunks",
            self.embedder.embed(&chunks, &model),
        )
        .await?;
        let vector_dim = vectors.first().map(Vec::len).unwrap_or(0);
        tracing::info!(
            chunks = chunks.len(),
            chunk_size,
            overlap,
            model = %model,
            vector_dim,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chunked and embedded text"
        );
        Ok(EmbeddedChunks {
            n_vectors: vectors.len(),
            vector_dim,
            chunks,
            vectors,
            model,
        })
    }

    /// Register `chunks` and `vectors` under `key`, replacing any previous
    /// entry. Returns the number of chunks indexed.
    pub async fn build_index(&self, key: &str, chunks: Vec<String>, vectors: Vec<Vector>) -> Result<usize> {
        let registry = Arc::clone(&self.registry);
        let key = key.to_string();
        blocking(move || registry.put(&key, chunks, vectors)).await
    }

    /// Embed `query` and return the `top_k` nearest chunks under `key`.
    ///
    /// `top_k` defaults to `retrieval.top_k`. The query must be embedded with
    /// the model the index was built with; `model` defaults to
    /// `embedding.model`.
    pub async fn query_index(
        &self,
        key: &str,
        query: &str,
        top_k: Option<usize>,
        model: Option<&str>,
    ) -> Result<QueryResult> {
        let top_k = top_k.unwrap_or(self.config.retrieval.top_k);
        // Fail on an unknown key before paying for an embedding.
        self.registry.get(key)?;

        let model = self.embedder.resolve_model(model)?.to_string();
        let query_vector = with_timeout(
            self.config.timeouts.query(),
            "embedding query",
            self.embedder.embed_one(query, &model),
        )
        .await?;

        let registry = Arc::clone(&self.registry);
        let owned_key = key.to_string();
        let found = blocking(move || registry.query(&owned_key, &query_vector, top_k)).await?;
        tracing::debug!(key, top_k, returned = found.len(), "queried index");
        Ok(found.into())
    }

    /// Build the prompt and generate. `stream` defaults to
    /// `generation.stream`. Never fails: errors are in the result.
    pub async fn generate_answer(&self, context: &str, question: &str, stream: Option<bool>) -> GenerationResult {
        let stream = stream.unwrap_or(self.generator.stream_default());
        self.generator.answer(context, question, stream).await
    }
}

/// Reject windows outside `chunk_size > 50` and `overlap < chunk_size`.
pub fn check_window(chunk_size: usize, overlap: usize) -> Result<()> {
    if chunk_size < MIN_CHUNK_SIZE {
        return Err(PipelineError::Configuration(format!(
            "chunk_size must be > {} (got {})",
            MIN_CHUNK_SIZE - 1,
            chunk_size
        )));
    }
    validate_window(chunk_size, overlap)
}

async fn with_timeout<T>(limit: Duration, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(what, limit_secs = limit.as_secs(), "timed out");
            Err(PipelineError::EmbeddingBackend(format!(
                "{} timed out after {}s",
                what,
                limit.as_secs()
            )))
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(PipelineError::Configuration(format!(
            "index task cancelled: {}",
            e
        ))),
    }
}
