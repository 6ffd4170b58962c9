//! OpenAI-compatible chat completions.
//!
//! The prompt is sent as a single user message. Streaming responses are
//! server-sent events: `data: {json}` lines carrying
//! `choices[0].delta.content`, terminated by `data: [DONE]`.

use async_trait::async_trait;
use std::time::Duration;

use docqa_core::stream::DeltaStream;
use docqa_core::{PipelineError, Result};

use super::{check_status, decode_lines, http_client, GenerationBackend, GenerationParams, LineEvent};

pub struct OpenAiCompatBackend {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiCompatBackend {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            client: http_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }

    fn request(&self, prompt: &str, params: &GenerationParams, stream: bool) -> reqwest::RequestBuilder {
        let body = serde_json::json!({
            "model": params.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "stream": stream,
        });
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    fn transport_err(&self, e: reqwest::Error) -> PipelineError {
        PipelineError::GenerationBackend(format!(
            "{} request to {} failed: {}",
            self.name, self.base_url, e
        ))
    }
}

#[async_trait]
impl GenerationBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let response = self
            .request(prompt, params, false)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        let response = check_status(&self.name, response).await?;
        let json: serde_json::Value = response.json().await.map_err(|e| self.transport_err(e))?;
        parse_completion(&json)
    }

    async fn generate_stream(&self, prompt: &str, params: &GenerationParams) -> Result<DeltaStream> {
        let response = self
            .request(prompt, params, true)
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        let response = check_status(&self.name, response).await?;
        Ok(decode_lines(response.bytes_stream(), parse_sse_line))
    }
}

fn upstream_error(json: &serde_json::Value) -> Option<String> {
    let err = json.get("error")?;
    Some(
        err.get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
    )
}

/// `choices[0].message.content` of a non-streamed completion. A missing or
/// null content is an empty answer, not an error.
fn parse_completion(json: &serde_json::Value) -> Result<String> {
    if let Some(message) = upstream_error(json) {
        return Err(PipelineError::GenerationBackend(message));
    }
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| PipelineError::GenerationBackend("invalid completion response: missing choices".into()))?;
    Ok(choice
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string())
}

pub(super) fn parse_sse_line(line: &str) -> LineEvent {
    // Comments (`: keep-alive`) and `event:` / `id:` fields carry no text.
    let Some(data) = line.strip_prefix("data:") else {
        return LineEvent::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return LineEvent::Done(None);
    }
    let json: serde_json::Value = match serde_json::from_str(data) {
        Ok(json) => json,
        Err(e) => return LineEvent::Fail(format!("invalid stream payload: {}", e)),
    };
    if let Some(message) = upstream_error(&json) {
        return LineEvent::Fail(message);
    }
    match json.pointer("/choices/0/delta/content").and_then(|c| c.as_str()) {
        Some(text) if !text.is_empty() => LineEvent::Delta(text.to_string()),
        _ => LineEvent::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_delta() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#),
            LineEvent::Delta("Hel".into())
        );
        assert_eq!(
            parse_sse_line(r#"data:{"choices":[{"delta":{"content":"lo"}}]}"#),
            LineEvent::Delta("lo".into())
        );
    }

    #[test]
    fn test_sse_control_lines() {
        assert_eq!(parse_sse_line("data: [DONE]"), LineEvent::Done(None));
        assert_eq!(parse_sse_line(": keep-alive"), LineEvent::Skip);
        assert_eq!(parse_sse_line("event: message"), LineEvent::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            LineEvent::Skip
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            LineEvent::Skip
        );
    }

    #[test]
    fn test_sse_errors() {
        assert_eq!(
            parse_sse_line(r#"data: {"error":{"message":"rate limited"}}"#),
            LineEvent::Fail("rate limited".into())
        );
        assert!(matches!(parse_sse_line("data: {not json"), LineEvent::Fail(_)));
    }

    #[test]
    fn test_parse_completion() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "42" } }]
        });
        assert_eq!(parse_completion(&json).unwrap(), "42");

        let empty = serde_json::json!({ "choices": [{ "message": { "content": null } }] });
        assert_eq!(parse_completion(&empty).unwrap(), "");

        assert!(parse_completion(&serde_json::json!({ "error": "bad model" })).is_err());
        assert!(parse_completion(&serde_json::json!({})).is_err());
    }
}
