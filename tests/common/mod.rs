//! Deterministic embedding and generation backends for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docqa::answer::Generator;
use docqa::config::Config;
use docqa::embedding::{Embedder, EmbeddingModel, ModelLoader};
use docqa::generation::{GenerationBackend, GenerationParams};
use docqa::pipeline::RagPipeline;
use docqa_core::embedding::Vector;
use docqa_core::stream::DeltaStream;
use docqa_core::{PipelineError, Result};

pub const MODEL: &str = "keywords";

/// Words the keyword model counts, one dimension each.
pub const VOCABULARY: &[&str] = &["sky", "sea", "forest", "desert", "river"];

/// One dimension per vocabulary word plus a constant bias dimension.
pub struct KeywordModel;

impl KeywordModel {
    pub fn vector(text: &str) -> Vector {
        let lower = text.to_lowercase();
        let mut v: Vector = VOCABULARY
            .iter()
            .map(|word| lower.matches(word).count() as f32)
            .collect();
        v.push(1.0);
        v
    }
}

#[async_trait]
impl EmbeddingModel for KeywordModel {
    fn model_id(&self) -> &str {
        MODEL
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

pub struct KeywordLoader;

#[async_trait]
impl ModelLoader for KeywordLoader {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn EmbeddingModel>> {
        if model_id == MODEL {
            Ok(Arc::new(KeywordModel))
        } else {
            Err(PipelineError::EmbeddingBackend(format!(
                "unknown model: {}",
                model_id
            )))
        }
    }
}

/// Keyword model that takes a while to answer.
pub struct SlowModel {
    pub delay: Duration,
}

#[async_trait]
impl EmbeddingModel for SlowModel {
    fn model_id(&self) -> &str {
        MODEL
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>> {
        tokio::time::sleep(self.delay).await;
        KeywordModel.embed(texts).await
    }
}

pub struct SlowLoader {
    pub delay: Duration,
}

#[async_trait]
impl ModelLoader for SlowLoader {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn EmbeddingModel>> {
        KeywordLoader.load(model_id).await?;
        Ok(Arc::new(SlowModel { delay: self.delay }))
    }
}

/// Generation backend that replays fixed deltas and records every prompt.
pub struct ScriptedBackend {
    deltas: Vec<String>,
    /// Fail the stream after this many deltas.
    fail_after: Option<usize>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            fail_after: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_after(deltas: &[&str], n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::new(deltas)
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn record(&self, prompt: &str) {
        self.prompts.lock().unwrap().push(prompt.to_string());
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String> {
        self.record(prompt);
        if self.fail_after.is_some() {
            return Err(PipelineError::GenerationBackend("connection reset".into()));
        }
        Ok(self.deltas.concat())
    }

    async fn generate_stream(&self, prompt: &str, _params: &GenerationParams) -> Result<DeltaStream> {
        self.record(prompt);
        let mut items: Vec<Result<String>> = self.deltas.iter().cloned().map(Ok).collect();
        if let Some(n) = self.fail_after {
            items.truncate(n);
            items.push(Err(PipelineError::GenerationBackend("connection reset".into())));
        }
        Ok(stream::iter(items).boxed())
    }
}

/// Small windows so that each [`section`] becomes exactly one chunk.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.chunking.chunk_size = 60;
    config.chunking.overlap = 0;
    config.embedding.model = MODEL.to_string();
    config.retrieval.top_k = 1;
    config
}

pub fn pipeline_with(backend: Arc<dyn GenerationBackend>) -> Arc<RagPipeline> {
    pipeline_with_loader(Arc::new(KeywordLoader), backend)
}

pub fn pipeline_with_loader(
    loader: Arc<dyn ModelLoader>,
    backend: Arc<dyn GenerationBackend>,
) -> Arc<RagPipeline> {
    let config = test_config();
    let embedder = Embedder::new(loader, MODEL);
    let generator = Generator::new(backend, &config.generation);
    Arc::new(RagPipeline::new(config, embedder, generator))
}

/// A 60-character block that mentions `word` three times.
pub fn section(word: &str) -> String {
    let mut s = format!("{w} {w} {w} ", w = word);
    while s.chars().count() < 60 {
        s.push('.');
    }
    s
}

/// Three sections: sky, sea, forest.
pub fn landscape_document() -> String {
    [section("sky"), section("sea"), section("forest")].concat()
}
