//! Grounded answer generation.
//!
//! [`Generator`] builds the prompt from retrieved context and a question,
//! calls the configured [`GenerationBackend`], and folds every failure into
//! a [`GenerationResult`] instead of returning an error.
//!
//! # Streaming
//!
//! A streamed answer is relayed through a channel of capacity 1. A spawned
//! producer pulls deltas from the backend and waits for the consumer to take
//! each one before reading the next. When the consumer drops its end, the
//! producer stops and drops the upstream response, which closes the HTTP
//! connection to the backend.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use docqa_core::prompt::build_prompt;
use docqa_core::stream::DeltaStream;
use docqa_core::{PipelineError, Result};

use crate::config::GenerationConfig;
use crate::generation::{create_backend, GenerationBackend, GenerationParams};

/// Reported when a backend returns an empty answer.
pub const NO_RESPONSE: &str = "No response from LLM.";

/// Answer payload.
pub enum GenerationOutput {
    Text(String),
    Stream(DeltaStream),
}

impl std::fmt::Debug for GenerationOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationOutput::Text(text) => f.debug_tuple("Text").field(text).finish(),
            GenerationOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Outcome of a generation request. `output` is set iff `success`.
#[derive(Debug)]
pub struct GenerationResult {
    pub success: bool,
    pub output: Option<GenerationOutput>,
    pub error: Option<String>,
}

impl GenerationResult {
    pub fn text(text: String) -> Self {
        Self {
            success: true,
            output: Some(GenerationOutput::Text(text)),
            error: None,
        }
    }

    pub fn stream(stream: DeltaStream) -> Self {
        Self {
            success: true,
            output: Some(GenerationOutput::Stream(stream)),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(message.into()),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.output, Some(GenerationOutput::Stream(_)))
    }

    /// Split into the payload or the error message.
    pub fn into_output(self) -> std::result::Result<GenerationOutput, String> {
        match (self.output, self.error) {
            (Some(output), _) if self.success => Ok(output),
            (_, error) => Err(error.unwrap_or_else(|| NO_RESPONSE.to_string())),
        }
    }
}

/// Prompt builder plus backend, configured once at startup.
pub struct Generator {
    backend: Arc<dyn GenerationBackend>,
    params: GenerationParams,
    max_context_chars: usize,
    stream_default: bool,
    start_timeout: Duration,
}

impl Generator {
    pub fn new(backend: Arc<dyn GenerationBackend>, config: &GenerationConfig) -> Self {
        Self {
            backend,
            params: GenerationParams::from_config(config),
            max_context_chars: config.max_context_chars,
            stream_default: config.stream,
            start_timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Build a generator with the backend selected by `config.provider`.
    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        Ok(Self::new(create_backend(config)?, config))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Whether answers stream unless a caller says otherwise.
    pub fn stream_default(&self) -> bool {
        self.stream_default
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn build_prompt(&self, context: &str, question: &str) -> String {
        build_prompt(context, question, self.max_context_chars)
    }

    /// Build the prompt and generate.
    pub async fn answer(&self, context: &str, question: &str, stream: bool) -> GenerationResult {
        let prompt = self.build_prompt(context, question);
        self.generate(&prompt, stream).await
    }

    /// Build the prompt and generate the whole answer.
    pub async fn answer_text(&self, context: &str, question: &str) -> std::result::Result<String, String> {
        let prompt = self.build_prompt(context, question);
        self.complete(&prompt).await
    }

    /// Build the prompt and start a relayed delta stream.
    pub async fn answer_stream(&self, context: &str, question: &str) -> std::result::Result<DeltaStream, String> {
        let prompt = self.build_prompt(context, question);
        self.start_stream(&prompt).await
    }

    /// Generate for a ready-made prompt.
    pub async fn generate(&self, prompt: &str, stream: bool) -> GenerationResult {
        if stream {
            match self.start_stream(prompt).await {
                Ok(deltas) => GenerationResult::stream(deltas),
                Err(message) => GenerationResult::failure(message),
            }
        } else {
            match self.complete(prompt).await {
                Ok(text) => GenerationResult::text(text),
                Err(message) => GenerationResult::failure(message),
            }
        }
    }

    fn log_request(&self, prompt: &str, stream: bool) {
        tracing::info!(
            backend = self.backend.name(),
            model = %self.params.model,
            stream,
            prompt_chars = prompt.chars().count(),
            "generating answer"
        );
    }

    async fn start_stream(&self, prompt: &str) -> std::result::Result<DeltaStream, String> {
        self.log_request(prompt, true);
        let backend = self.backend.name();
        let started = tokio::time::timeout(
            self.start_timeout,
            self.backend.generate_stream(prompt, &self.params),
        )
        .await;
        match started {
            Ok(Ok(upstream)) => Ok(relay(upstream)),
            Ok(Err(e)) => {
                tracing::error!(backend, error = %e, "failed to start generation stream");
                Err(e.to_string())
            }
            Err(_) => {
                tracing::warn!(backend, limit_secs = self.start_timeout.as_secs(), "generation stream did not start in time");
                Err(timeout_message(self.start_timeout))
            }
        }
    }

    async fn complete(&self, prompt: &str) -> std::result::Result<String, String> {
        self.log_request(prompt, false);
        let backend = self.backend.name();
        match self.backend.generate(prompt, &self.params).await {
            Ok(text) if text.trim().is_empty() => {
                tracing::warn!(backend, "backend returned an empty answer");
                Err(NO_RESPONSE.to_string())
            }
            Ok(text) => Ok(text),
            Err(e) => {
                tracing::error!(backend, error = %e, "generation failed");
                Err(e.to_string())
            }
        }
    }
}

fn timeout_message(after: Duration) -> String {
    PipelineError::GenerationBackend(format!(
        "no response from backend within {}s",
        after.as_secs()
    ))
    .to_string()
}

/// Relay `upstream` through a capacity-1 channel served by a spawned
/// producer. Must be called inside a tokio runtime.
///
/// The producer ends after forwarding the first error, at end of stream, or
/// as soon as the receiving side is dropped.
pub fn relay(upstream: DeltaStream) -> DeltaStream {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut upstream = upstream;
        let mut forwarded = 0usize;
        loop {
            let item = tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!(forwarded, "stream consumer went away; cancelling generation");
                    break;
                }
                item = upstream.next() => item,
            };
            let Some(item) = item else {
                tracing::debug!(forwarded, "generation stream finished");
                break;
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() {
                tracing::debug!(forwarded, "stream consumer went away; cancelling generation");
                break;
            }
            forwarded += 1;
            if failed {
                break;
            }
        }
    });
    ReceiverStream::new(rx).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        answer: &'static str,
        deltas: Vec<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl GenerationBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String> {
            if self.fail {
                return Err(PipelineError::GenerationBackend("503 upstream".into()));
            }
            assert!(prompt.starts_with("Answer based only on the provided context."));
            Ok(self.answer.to_string())
        }
        async fn generate_stream(&self, _prompt: &str, _params: &GenerationParams) -> Result<DeltaStream> {
            if self.fail {
                return Err(PipelineError::GenerationBackend("503 upstream".into()));
            }
            let items: Vec<Result<String>> = self.deltas.iter().map(|d| Ok(d.to_string())).collect();
            Ok(stream::iter(items).boxed())
        }
    }

    fn generator(answer: &'static str, deltas: Vec<&'static str>, fail: bool) -> Generator {
        Generator::new(
            Arc::new(Scripted { answer, deltas, fail }),
            &GenerationConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_text_answer() {
        let result = generator("Paris", vec![], false).answer("ctx", "capital?", false).await;
        assert!(result.success);
        assert!(!result.is_stream());
        match result.into_output() {
            Ok(GenerationOutput::Text(t)) => assert_eq!(t, "Paris"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_answer_is_failure() {
        let result = generator("  ", vec![], false).answer("", "q", false).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(NO_RESPONSE));
    }

    #[tokio::test]
    async fn test_backend_error_is_captured() {
        let result = generator("", vec![], true).answer("c", "q", false).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("503 upstream"));

        let result = generator("", vec![], true).answer("c", "q", true).await;
        assert!(!result.success);
        assert!(result.output.is_none());
    }

    #[tokio::test]
    async fn test_stream_answer_relays_deltas() {
        let result = generator("", vec!["Hel", "lo"], false).answer("c", "q", true).await;
        assert!(result.is_stream());
        let Ok(GenerationOutput::Stream(s)) = result.into_output() else {
            panic!("expected stream");
        };
        let out: Vec<String> = s.map(|r| r.unwrap()).collect().await;
        assert_eq!(out, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_relay_stops_producer_when_consumer_drops() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let upstream = stream::iter(0..1000)
            .map(move |i| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, PipelineError>(i.to_string())
            })
            .boxed();

        let mut relayed = relay(upstream);
        assert_eq!(relayed.next().await.unwrap().unwrap(), "0");
        drop(relayed);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One item in hand, at most one buffered, one blocked in send.
        assert!(pulled.load(Ordering::SeqCst) <= 4);
    }

    /// Accepts the request but never starts the stream.
    struct Stalled;

    #[async_trait]
    impl GenerationBackend for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }
        async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> Result<String> {
            std::future::pending().await
        }
        async fn generate_stream(&self, _prompt: &str, _params: &GenerationParams) -> Result<DeltaStream> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_start_times_out() {
        let generator = Generator::new(Arc::new(Stalled), &GenerationConfig::default());
        let result = generator.generate("prompt", true).await;
        assert!(!result.success);
        assert!(result.output.is_none());
        let error = result.error.unwrap();
        assert!(error.contains("no response from backend within 60s"), "{}", error);

        let started = generator.answer_stream("c", "q").await;
        assert!(started.is_err());
    }

    #[tokio::test]
    async fn test_relay_ends_after_error() {
        let items: Vec<Result<String>> = vec![
            Ok("a".into()),
            Err(PipelineError::GenerationBackend("cut".into())),
            Ok("b".into()),
        ];
        let out: Vec<Result<String>> = relay(stream::iter(items).boxed()).collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[1].is_err());
    }
}
