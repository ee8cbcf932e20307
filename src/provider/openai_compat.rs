//! HTTP client for OpenAI-compatible chat completion endpoints.
//!
//! Works against any backend speaking the `/chat/completions` shape
//! (OpenAI, OpenRouter, local inference servers). Non-streaming calls parse
//! the JSON body; streaming calls consume SSE `data:` frames and forward
//! content deltas as token events. Retry policy lives in the fallback
//! chain, not here — this client makes exactly one attempt per call.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde::{Deserialize, Serialize};

use super::{classify_http_status, ProviderClient, ProviderError};
use crate::event::{Event, EventSink};
use crate::request::Budget;

/// Client for one OpenAI-compatible backend + model pair.
pub struct OpenAiCompatClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// The model this client requests.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_builder(&self, body: &ChatRequest) -> reqwest::RequestBuilder {
        self.client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
    }

    fn build_request(&self, prompt: &str, budget: &Budget, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream,
            max_tokens: budget.max_tokens,
        }
    }

    /// Parse Retry-After header if present (seconds form only).
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }

    fn transport_error(e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Unavailable(format!("request failed: {e}"))
        }
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatClient {
    async fn generate(&self, prompt: &str, budget: &Budget) -> Result<String, ProviderError> {
        let body = self.build_request(prompt, budget, false);
        tracing::debug!(model = %self.model, "Sending chat completion request");

        let response = self
            .request_builder(&body)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(classify_http_status(status.as_u16(), &text, retry_after));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::InvalidResponse(format!("failed to parse response: {e}"))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("no choices in response".into()))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        budget: &Budget,
        sink: &dyn EventSink,
    ) -> Result<String, ProviderError> {
        let body = self.build_request(prompt, budget, true);
        tracing::debug!(model = %self.model, "Opening chat completion stream");

        let mut source = EventSource::new(self.request_builder(&body)).map_err(|e| {
            ProviderError::InvalidResponse(format!("failed to build stream request: {e}"))
        })?;

        let mut accumulated = String::new();

        while let Some(item) = source.next().await {
            match item {
                Ok(SseEvent::Open) => {}
                Ok(SseEvent::Message(message)) => {
                    // OpenAI-style end-of-stream sentinel.
                    if message.data.trim() == "[DONE]" {
                        break;
                    }
                    let chunk: StreamChunk = match serde_json::from_str(&message.data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            source.close();
                            return Err(ProviderError::InvalidResponse(format!(
                                "failed to parse stream chunk: {e}"
                            )));
                        }
                    };
                    if let Some(delta) = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                    {
                        if !delta.is_empty() {
                            accumulated.push_str(&delta);
                            sink.emit(Event::Token { text: delta });
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    let retry_after = Self::parse_retry_after(response.headers());
                    source.close();
                    return Err(classify_http_status(status.as_u16(), "", retry_after));
                }
                Err(reqwest_eventsource::Error::Transport(e)) => {
                    source.close();
                    return Err(Self::transport_error(e));
                }
                Err(e) => {
                    source.close();
                    return Err(ProviderError::InvalidResponse(format!(
                        "stream error: {e}"
                    )));
                }
            }
        }
        source.close();

        if accumulated.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "stream ended without content".into(),
            ));
        }
        Ok(accumulated)
    }
}

/// Chat completions request body.
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

/// Non-streaming response body.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// One SSE frame of a streaming response.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_normalizes_trailing_slash() {
        let a = OpenAiCompatClient::new("https://api.example.com/v1/", "k", "m");
        let b = OpenAiCompatClient::new("https://api.example.com/v1", "k", "m");
        assert_eq!(a.endpoint(), "https://api.example.com/v1/chat/completions");
        assert_eq!(a.endpoint(), b.endpoint());
    }

    #[test]
    fn stream_chunk_parses_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"},"index":0}]}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
    }

    #[test]
    fn stream_chunk_tolerates_empty_delta() {
        let data = r#"{"choices":[{"delta":{},"index":0,"finish_reason":"stop"}]}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        assert!(chunk.choices[0].delta.content.is_none());
    }

    #[test]
    fn response_parses_first_choice() {
        let data = r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(data).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("hi")
        );
    }
}
