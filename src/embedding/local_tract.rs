//! Tract-based local embedding model (fallback for musl and Intel Mac).
//!
//! Pure-Rust path: the ONNX graph is loaded with tract-onnx and tokenized
//! with the tokenizers crate. Both are built once in [`TractModel::load`] and
//! reused; inference runs in `spawn_blocking`.
#![cfg_attr(
    all(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"),
    allow(dead_code)
)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tract_onnx::prelude::*;

use docqa_core::embedding::{normalize_l2, Vector};
use docqa_core::{PipelineError, Result};

use super::EmbeddingModel;

const ALL_MINILM_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";
const ALL_MINILM_DIMS: usize = 384;
const DEFAULT_MAX_LEN: usize = 256;

type Runnable = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

fn err(context: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::EmbeddingBackend(format!("{}: {}", context, e))
}

/// name -> (repo, onnx path in repo, tokenizer path in repo, dims).
fn model_manifest(model_id: &str) -> Result<(&'static str, &'static str, &'static str, usize)> {
    match model_id {
        "all-minilm-l6-v2" | "sentence-transformers/all-MiniLM-L6-v2" => Ok((
            ALL_MINILM_REPO,
            "onnx/model.onnx",
            "tokenizer.json",
            ALL_MINILM_DIMS,
        )),
        other => Err(PipelineError::EmbeddingBackend(format!(
            "tract backend supports only all-minilm-l6-v2. Requested: '{}'",
            other
        ))),
    }
}

fn cache_dir() -> Result<PathBuf> {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let dir = PathBuf::from(base).join(".cache").join("docqa").join("models");
    std::fs::create_dir_all(&dir).map_err(|e| err("create cache dir", e))?;
    Ok(dir)
}

fn download_to_cache(repo: &str, path: &str, cache_path: &Path) -> Result<()> {
    if cache_path.exists() {
        return Ok(());
    }
    let url = format!("https://huggingface.co/{}/resolve/main/{}", repo, path);
    tracing::info!(%url, "downloading model file");
    let bytes = reqwest::blocking::get(&url)
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.bytes())
        .map_err(|e| err(&format!("download {}", url), e))?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| err("create cache parent", e))?;
    }
    std::fs::write(cache_path, &bytes).map_err(|e| err("write cache", e))
}

/// A loaded tract graph plus its tokenizer.
pub struct TractModel {
    id: String,
    batch_size: usize,
    dims: usize,
    inner: Arc<(Runnable, tokenizers::Tokenizer)>,
}

impl TractModel {
    /// Fetch (if needed) and load `model_id` on the blocking pool.
    pub async fn load(model_id: &str, batch_size: usize) -> Result<Self> {
        let (repo, onnx_rel, tokenizer_rel, dims) = model_manifest(model_id)?;
        let id = model_id.to_string();
        let dir_name = id.replace('/', "--");

        let inner = tokio::task::spawn_blocking(move || -> Result<(Runnable, tokenizers::Tokenizer)> {
            let model_dir = cache_dir()?.join(dir_name);
            let onnx_path = model_dir.join(onnx_rel);
            let tokenizer_path = model_dir.join(tokenizer_rel);
            download_to_cache(repo, onnx_rel, &onnx_path)?;
            download_to_cache(repo, tokenizer_rel, &tokenizer_path)?;

            let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| err("load tokenizer", e))?;
            let plan = tract_onnx::onnx()
                .model_for_path(&onnx_path)
                .map_err(|e| err("load ONNX", e))?
                .into_optimized()
                .map_err(|e| err("optimize", e))?
                .into_runnable()
                .map_err(|e| err("build tract runnable", e))?;
            Ok((plan, tokenizer))
        })
        .await
        .map_err(|e| err("model load task", e))??;

        Ok(Self {
            id,
            batch_size: batch_size.max(1),
            dims,
            inner: Arc::new(inner),
        })
    }
}

#[async_trait]
impl EmbeddingModel for TractModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let inner = Arc::clone(&self.inner);
        let texts = texts.to_vec();
        let (batch_size, dims) = (self.batch_size, self.dims);
        tokio::task::spawn_blocking(move || {
            let (plan, tokenizer) = &*inner;
            texts
                .chunks(batch_size)
                .map(|batch| run_batch(plan, tokenizer, dims, batch))
                .collect::<Result<Vec<_>>>()
                .map(|batches| batches.into_iter().flatten().collect())
        })
        .await
        .map_err(|e| err("embedding task", e))?
    }
}

fn run_batch(
    plan: &Runnable,
    tokenizer: &tokenizers::Tokenizer,
    dims: usize,
    batch: &[String],
) -> Result<Vec<Vector>> {
    let encodings = batch
        .iter()
        .map(|s| tokenizer.encode(s.as_str(), true).map_err(|e| err("tokenize", e)))
        .collect::<Result<Vec<_>>>()?;

    let max_len = encodings
        .iter()
        .map(|e| e.get_ids().len())
        .max()
        .unwrap_or(1)
        .clamp(1, DEFAULT_MAX_LEN);

    let rows = encodings.len();
    let mut input_ids = vec![0i64; rows * max_len];
    let mut attention_mask = vec![0i64; rows * max_len];
    for (i, enc) in encodings.iter().enumerate() {
        for (j, &id) in enc.get_ids().iter().take(max_len).enumerate() {
            input_ids[i * max_len + j] = id as i64;
            attention_mask[i * max_len + j] = 1;
        }
    }

    let input_ids = ndarray::Array2::from_shape_vec((rows, max_len), input_ids)
        .map_err(|e| err("input ids shape", e))?;
    let attention_mask = ndarray::Array2::from_shape_vec((rows, max_len), attention_mask)
        .map_err(|e| err("attention mask shape", e))?;

    let input_ids: Tensor = input_ids.into();
    let attention_mask: Tensor = attention_mask.into();
    let outputs = plan
        .run(tvec!(input_ids.into(), attention_mask.into()))
        .map_err(|e| err("inference", e))?;
    let output = outputs
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::EmbeddingBackend("no output tensor".into()))?;
    let view = output
        .to_array_view::<f32>()
        .map_err(|e| err("output to array", e))?;

    // [batch, dims] is a pooled sentence embedding; [batch, seq, dims] is
    // last_hidden_state and gets mean-pooled over the attended tokens.
    let shape = view.shape().to_vec();
    match shape.len() {
        2 => Ok((0..shape[0])
            .map(|i| normalize_l2(view.slice(ndarray::s![i, ..]).iter().copied().collect()))
            .collect()),
        3 => Ok(encodings
            .iter()
            .enumerate()
            .map(|(i, enc)| {
                let valid = enc.get_ids().len().min(shape[1]).min(max_len);
                let mut sum = vec![0f32; dims];
                for j in 0..valid {
                    for (k, &v) in view.slice(ndarray::s![i, j, ..]).iter().take(dims).enumerate() {
                        sum[k] += v;
                    }
                }
                if valid > 0 {
                    sum.iter_mut().for_each(|x| *x /= valid as f32);
                }
                normalize_l2(sum)
            })
            .collect()),
        _ => Err(PipelineError::EmbeddingBackend(format!(
            "unexpected output shape: {:?}",
            shape
        ))),
    }
}
