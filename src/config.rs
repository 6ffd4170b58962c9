//! TOML configuration.
//!
//! Every section has defaults, so an empty file (or no file at all, see
//! [`Config::default`]) yields a working local setup: fastembed embeddings
//! and the Hugging Face router for generation.
//!
//! ```toml
//! [chunking]
//! chunk_size = 1000
//! overlap = 200
//!
//! [embedding]
//! provider = "local"          # local | openai | ollama
//! model = "all-minilm-l6-v2"
//!
//! [generation]
//! provider = "huggingface"    # huggingface | together | openai | openai-compatible | ollama | disabled
//! model = "moonshotai/Kimi-K2-Thinking"
//! max_tokens = 512
//! temperature = 0.7
//! stream = true
//!
//! [retrieval]
//! top_k = 3
//!
//! [timeouts]
//! ingest_secs = 120
//! query_secs = 30
//!
//! [server]
//! bind = "127.0.0.1:8081"
//! ```
//!
//! API keys are never read from the file: see [`GenerationConfig::api_key`]
//! and the embedding providers.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use docqa_core::chunk::validate_window;
use docqa_core::prompt::DEFAULT_MAX_CONTEXT_CHARS;

/// Smallest accepted `chunking.chunk_size`.
pub const MIN_CHUNK_SIZE: usize = 51;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Characters per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Extra model ids requests may name besides `model`.
    #[serde(default)]
    pub models: Vec<String>,
    /// Base URL override (Ollama, OpenAI-compatible gateways).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            models: Vec::new(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_embedding_model() -> String {
    "all-minilm-l6-v2".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    /// Base URL override. Required for `openai-compatible`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Stream answers by default.
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Character budget for the context block of the prompt.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            stream: default_stream(),
            max_context_chars: default_max_context_chars(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "huggingface".to_string()
}
fn default_generation_model() -> String {
    "moonshotai/Kimi-K2-Thinking".to_string()
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.7
}
fn default_stream() -> bool {
    true
}
fn default_max_context_chars() -> usize {
    DEFAULT_MAX_CONTEXT_CHARS
}
fn default_generation_timeout_secs() -> u64 {
    60
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Environment variable holding the API key for the configured provider.
    pub fn api_key_var(&self) -> Option<&'static str> {
        match self.provider.as_str() {
            "huggingface" => Some("HF_API_KEY"),
            "together" => Some("TOGETHER_API_KEY"),
            "openai" | "openai-compatible" => Some("OPENAI_API_KEY"),
            _ => None,
        }
    }

    /// API key for the configured provider, read from the environment.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_var()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Chunks retrieved per question.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    3
}

/// Upper bounds on waits for external capabilities.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// Bound on document embedding (includes model cold start).
    #[serde(default = "default_ingest_secs")]
    pub ingest_secs: u64,
    /// Bound on question embedding and first response from generation.
    #[serde(default = "default_query_secs")]
    pub query_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ingest_secs: default_ingest_secs(),
            query_secs: default_query_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn ingest(&self) -> Duration {
        Duration::from_secs(self.ingest_secs)
    }

    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }
}

fn default_ingest_secs() -> u64 {
    120
}
fn default_query_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8081".to_string()
}

const EMBEDDING_PROVIDERS: &[&str] = &["local", "openai", "ollama"];
const GENERATION_PROVIDERS: &[&str] = &[
    "huggingface",
    "together",
    "openai",
    "openai-compatible",
    "ollama",
    "disabled",
];

impl Config {
    /// Check cross-field constraints. Called by [`load_config`].
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size < MIN_CHUNK_SIZE {
            bail!(
                "chunking.chunk_size must be > {} (got {})",
                MIN_CHUNK_SIZE - 1,
                self.chunking.chunk_size
            );
        }
        validate_window(self.chunking.chunk_size, self.chunking.overlap)
            .map_err(|e| anyhow::anyhow!("chunking: {}", e))?;

        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }

        if !EMBEDDING_PROVIDERS.contains(&self.embedding.provider.as_str()) {
            bail!(
                "Unknown embedding provider: '{}'. Must be one of: {}",
                self.embedding.provider,
                EMBEDDING_PROVIDERS.join(", ")
            );
        }
        if self.embedding.model.trim().is_empty() {
            bail!("embedding.model must not be empty");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        if !GENERATION_PROVIDERS.contains(&self.generation.provider.as_str()) {
            bail!(
                "Unknown generation provider: '{}'. Must be one of: {}",
                self.generation.provider,
                GENERATION_PROVIDERS.join(", ")
            );
        }
        if self.generation.provider == "openai-compatible" && self.generation.url.is_none() {
            bail!("generation.url is required when provider is 'openai-compatible'");
        }
        if self.generation.is_enabled() && self.generation.model.trim().is_empty() {
            bail!("generation.model must not be empty");
        }
        if self.generation.max_tokens == 0 {
            bail!("generation.max_tokens must be > 0");
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            bail!("generation.temperature must be in [0.0, 2.0]");
        }
        if self.generation.max_context_chars == 0 {
            bail!("generation.max_context_chars must be > 0");
        }

        if self.timeouts.ingest_secs == 0 || self.timeouts.query_secs == 0 {
            bail!("timeouts must be > 0 seconds");
        }
        Ok(())
    }
}

/// Parse and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
