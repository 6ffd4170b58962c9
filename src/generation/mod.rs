//! Generation backends.
//!
//! One [`GenerationBackend`] trait, one implementation per wire protocol:
//!
//! - **[`OpenAiCompatBackend`]**: `POST {base}/chat/completions`. Serves the
//!   Hugging Face router, Together, OpenAI and any OpenAI-compatible gateway;
//!   they differ only in base URL and key variable.
//! - **[`OllamaBackend`]**: `POST {base}/api/generate`, NDJSON when streaming.
//! - **[`DisabledBackend`]**: always fails; used when `provider = "disabled"`.
//!
//! [`create_backend`] picks the variant once from configuration.
//!
//! Streaming responses are decoded line by line by [`decode_lines`]; each
//! protocol only supplies a parser for a single line.

mod ollama;
mod openai_compat;

pub use ollama::OllamaBackend;
pub use openai_compat::OpenAiCompatBackend;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use docqa_core::stream::DeltaStream;
use docqa_core::{PipelineError, Result};

use crate::config::GenerationConfig;

/// Per-request sampling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerationParams {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

/// A text generation capability.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Generate the complete answer for `prompt`.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;

    /// Start a streamed generation. Resolves once the backend accepted the
    /// request; the returned stream yields text deltas.
    async fn generate_stream(&self, prompt: &str, params: &GenerationParams) -> Result<DeltaStream>;
}

/// Backend that refuses every request.
pub struct DisabledBackend;

#[async_trait]
impl GenerationBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> Result<String> {
        Err(PipelineError::GenerationBackend(
            "generation provider is disabled".into(),
        ))
    }

    async fn generate_stream(&self, _prompt: &str, _params: &GenerationParams) -> Result<DeltaStream> {
        Err(PipelineError::GenerationBackend(
            "generation provider is disabled".into(),
        ))
    }
}

/// Create the backend for `config.provider`.
///
/// | Config Value | Backend | Default base URL |
/// |-------------|---------|------------------|
/// | `"huggingface"` | [`OpenAiCompatBackend`] | `https://router.huggingface.co/v1` |
/// | `"together"` | [`OpenAiCompatBackend`] | `https://api.together.xyz/v1` |
/// | `"openai"` | [`OpenAiCompatBackend`] | `https://api.openai.com/v1` |
/// | `"openai-compatible"` | [`OpenAiCompatBackend`] | `generation.url` (required) |
/// | `"ollama"` | [`OllamaBackend`] | `http://localhost:11434` |
/// | `"disabled"` | [`DisabledBackend`] | |
///
/// A missing API key is not an error here; the first request fails instead,
/// so the server can start without generation credentials.
pub fn create_backend(config: &GenerationConfig) -> Result<Arc<dyn GenerationBackend>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let default_base = match config.provider.as_str() {
        "huggingface" => Some("https://router.huggingface.co/v1"),
        "together" => Some("https://api.together.xyz/v1"),
        "openai" => Some("https://api.openai.com/v1"),
        _ => None,
    };

    match config.provider.as_str() {
        "huggingface" | "together" | "openai" | "openai-compatible" => {
            let base_url = config
                .url
                .clone()
                .or_else(|| default_base.map(str::to_string))
                .ok_or_else(|| {
                    PipelineError::Configuration(
                        "generation.url is required for provider 'openai-compatible'".into(),
                    )
                })?;
            let api_key = config.api_key();
            if api_key.is_none() {
                tracing::warn!(
                    provider = %config.provider,
                    var = config.api_key_var().unwrap_or_default(),
                    "no API key in environment; generation requests may be rejected"
                );
            }
            Ok(Arc::new(OpenAiCompatBackend::new(
                config.provider.clone(),
                base_url,
                api_key,
                timeout,
            )?))
        }
        "ollama" => Ok(Arc::new(OllamaBackend::new(
            crate::embedding::ollama_base_url(config.url.as_deref()),
            timeout,
        )?)),
        "disabled" => Ok(Arc::new(DisabledBackend)),
        other => Err(PipelineError::Configuration(format!(
            "unknown generation provider: {}",
            other
        ))),
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| PipelineError::GenerationBackend(e.to_string()))
}

/// Turn a non-success response into an error carrying the body.
pub(crate) async fn check_status(label: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PipelineError::GenerationBackend(format!(
        "{} API error {}: {}",
        label, status, body
    )))
}

// ============ Line Decoding ============

/// Outcome of parsing one line of a streamed response.
#[derive(Debug, PartialEq)]
pub(crate) enum LineEvent {
    /// Keep-alive, comment or metadata.
    Skip,
    Delta(String),
    /// End of stream, with an optional final delta.
    Done(Option<String>),
    /// The upstream reported an error in-band.
    Fail(String),
}

struct LineDecoder<S> {
    inner: std::pin::Pin<Box<S>>,
    buf: Vec<u8>,
    pending: VecDeque<Result<String>>,
    finished: bool,
    parse: fn(&str) -> LineEvent,
}

impl<S> LineDecoder<S> {
    fn handle_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match (self.parse)(line) {
            LineEvent::Skip => {}
            LineEvent::Delta(text) => self.pending.push_back(Ok(text)),
            LineEvent::Done(last) => {
                if let Some(text) = last {
                    self.pending.push_back(Ok(text));
                }
                self.finished = true;
            }
            LineEvent::Fail(message) => {
                self.pending
                    .push_back(Err(PipelineError::GenerationBackend(message)));
                self.finished = true;
            }
        }
    }

    fn drain_lines(&mut self) {
        while !self.finished {
            let Some(end) = self.buf.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            self.handle_line(&line);
        }
    }
}

/// Split a byte stream into lines and map each through `parse`.
///
/// Lines may span chunk boundaries, including mid code point. The stream
/// ends at the first `Done` or `Fail` event, at upstream end, or after a
/// transport error (yielded as the last item).
pub(crate) fn decode_lines<S, B, E>(bytes: S, parse: fn(&str) -> LineEvent) -> DeltaStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let decoder = LineDecoder {
        inner: Box::pin(bytes),
        buf: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        parse,
    };
    stream::unfold(decoder, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(chunk.as_ref());
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.pending.push_back(Err(PipelineError::GenerationBackend(format!(
                        "stream interrupted: {}",
                        e
                    ))));
                }
                None => {
                    let rest = std::mem::take(&mut st.buf);
                    st.handle_line(&rest);
                    st.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ndjson_like(line: &str) -> LineEvent {
        match line {
            "stop" => LineEvent::Done(None),
            "last" => LineEvent::Done(Some("!".into())),
            "bad" => LineEvent::Fail("upstream said no".into()),
            "#" => LineEvent::Skip,
            other => LineEvent::Delta(other.to_string()),
        }
    }

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = std::result::Result<Vec<u8>, String>> + Send {
        stream::iter(parts.iter().map(|p| Ok(p.to_vec())).collect::<Vec<_>>())
    }

    async fn collect(s: DeltaStream) -> Vec<Result<String>> {
        s.collect().await
    }

    #[tokio::test]
    async fn test_lines_across_chunks() {
        let s = decode_lines(chunks(&[b"he", b"llo\nwor", b"ld\n#\n", b"tail"]), ndjson_like);
        let out: Vec<String> = collect(s).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(out, vec!["hello", "world", "tail"]);
    }

    #[tokio::test]
    async fn test_split_code_point_is_reassembled() {
        let bytes = "é\n".as_bytes();
        let s = decode_lines(chunks(&[&bytes[..1], &bytes[1..]]), ndjson_like);
        let out = collect(s).await;
        assert_eq!(out, vec![Ok("é".to_string())]);
    }

    #[tokio::test]
    async fn test_done_stops_reading() {
        let s = decode_lines(chunks(&[b"a\nlast\nnever\n"]), ndjson_like);
        let out: Vec<String> = collect(s).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(out, vec!["a", "!"]);

        let s = decode_lines(chunks(&[b"a\nstop\nb\n"]), ndjson_like);
        assert_eq!(collect(s).await.len(), 1);
    }

    #[tokio::test]
    async fn test_in_band_failure_is_last_item() {
        let s = decode_lines(chunks(&[b"a\nbad\nb\n"]), ndjson_like);
        let out = collect(s).await;
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[1],
            Err(PipelineError::GenerationBackend("upstream said no".into()))
        );
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let parts: Vec<std::result::Result<Vec<u8>, String>> =
            vec![Ok(b"a\n".to_vec()), Err("reset".into()), Ok(b"b\n".to_vec())];
        let out = collect(decode_lines(stream::iter(parts), ndjson_like)).await;
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[1], Err(PipelineError::GenerationBackend(m)) if m.contains("reset")));
    }

    #[tokio::test]
    async fn test_disabled_backend_fails() {
        let params = GenerationParams {
            model: "m".into(),
            max_tokens: 8,
            temperature: 0.0,
        };
        assert!(DisabledBackend.generate("p", &params).await.is_err());
        assert!(DisabledBackend.generate_stream("p", &params).await.is_err());
    }

    #[test]
    fn test_factory_selects_backend() {
        let mut config = GenerationConfig::default();
        assert_eq!(create_backend(&config).unwrap().name(), "huggingface");
        config.provider = "ollama".into();
        assert_eq!(create_backend(&config).unwrap().name(), "ollama");
        config.provider = "disabled".into();
        assert_eq!(create_backend(&config).unwrap().name(), "disabled");
        config.provider = "openai-compatible".into();
        assert!(create_backend(&config).is_err());
        config.url = Some("http://localhost:8000/v1".into());
        assert_eq!(create_backend(&config).unwrap().name(), "openai-compatible");
    }
}
