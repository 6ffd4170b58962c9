//! Ollama `/api/generate`.
//!
//! Streamed responses are NDJSON: one object per line with a `response`
//! fragment, the last one carrying `"done": true`.

use async_trait::async_trait;
use std::time::Duration;

use docqa_core::stream::DeltaStream;
use docqa_core::{PipelineError, Result};

use super::{check_status, decode_lines, http_client, GenerationBackend, GenerationParams, LineEvent};

pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn request(&self, prompt: &str, params: &GenerationParams, stream: bool) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/api/generate", self.base_url))
            .json(&serde_json::json!({
                "model": params.model,
                "prompt": prompt,
                "stream": stream,
                "options": {
                    "temperature": params.temperature,
                    "num_predict": params.max_tokens,
                },
            }))
    }

    fn transport_err(&self, e: reqwest::Error) -> PipelineError {
        PipelineError::GenerationBackend(format!(
            "Ollama connection error (is Ollama running at {}?): {}",
            self.base_url, e
        ))
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let response = self
            .request(prompt, params, false)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        let response = check_status("Ollama", response).await?;
        let json: serde_json::Value = response.json().await.map_err(|e| self.transport_err(e))?;
        if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
            return Err(PipelineError::GenerationBackend(err.to_string()));
        }
        Ok(json
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    async fn generate_stream(&self, prompt: &str, params: &GenerationParams) -> Result<DeltaStream> {
        let response = self
            .request(prompt, params, true)
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        let response = check_status("Ollama", response).await?;
        Ok(decode_lines(response.bytes_stream(), parse_ndjson_line))
    }
}

fn parse_ndjson_line(line: &str) -> LineEvent {
    let json: serde_json::Value = match serde_json::from_str(line) {
        Ok(json) => json,
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed Ollama line");
            return LineEvent::Skip;
        }
    };
    if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
        return LineEvent::Fail(format!("Ollama generation failed: {}", err));
    }
    let text = json
        .get("response")
        .and_then(|r| r.as_str())
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    if json.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
        return LineEvent::Done(text);
    }
    text.map_or(LineEvent::Skip, LineEvent::Delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ndjson_fragments() {
        assert_eq!(
            parse_ndjson_line(r#"{"model":"llama3","response":"Hi","done":false}"#),
            LineEvent::Delta("Hi".into())
        );
        assert_eq!(
            parse_ndjson_line(r#"{"response":"","done":true,"eval_count":12}"#),
            LineEvent::Done(None)
        );
        assert_eq!(
            parse_ndjson_line(r#"{"response":".","done":true}"#),
            LineEvent::Done(Some(".".into()))
        );
    }

    #[test]
    fn test_ndjson_error_and_garbage() {
        assert_eq!(
            parse_ndjson_line(r#"{"error":"model 'x' not found"}"#),
            LineEvent::Fail("Ollama generation failed: model 'x' not found".into())
        );
        assert_eq!(parse_ndjson_line("not json"), LineEvent::Skip);
    }
}
