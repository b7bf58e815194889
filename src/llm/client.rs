// =============================================================================
// LLM HTTP Client — OpenAI-compatible chat completions endpoint
// =============================================================================
//
// SECURITY: the API key is never logged or serialised. The same client serves
// both tiers; the caller picks the model per call (chat roles vs. reasoner).
// =============================================================================

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChatMessage, LlmError, LlmProvider, LlmReply, LlmUsage};

/// HTTP client for any OpenAI-compatible `/chat/completions` provider.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl LlmClient {
    /// Create a client for `base_url` (e.g. `https://api.deepseek.com/v1`).
    ///
    /// No default timeout is set on the inner client; every call carries its
    /// own per-request timeout so role and referee budgets can differ.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for LlmClient {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f64,
        timeout: Duration,
    ) -> Result<LlmReply, LlmError> {
        let start = Instant::now();

        let req = ChatCompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            max_tokens: Some(max_tokens),
            temperature: Some(temperature),
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(model, url = %url, messages = messages.len(), "llm request");

        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(timeout)
                } else {
                    LlmError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            warn!(model, status = status.as_u16(), %snippet, "llm provider error");
            return Err(LlmError::Http { status: status.as_u16(), snippet });
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Parse(e.to_string()))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(LlmError::Parse("empty completion content".to_string()));
        }

        let usage = LlmUsage {
            prompt_tokens: parsed.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            completion_tokens: parsed
                .usage
                .as_ref()
                .map(|u| u.completion_tokens)
                .unwrap_or(0),
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        debug!(model, latency_ms, tokens_out = usage.completion_tokens, "llm reply");

        Ok(LlmReply {
            model: model.to_string(),
            content,
            usage,
            latency_ms,
        })
    }
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOut {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(LlmError::Timeout(Duration::from_secs(45)).is_retryable());
        assert!(LlmError::Network("reset".into()).is_retryable());
        assert!(LlmError::Http { status: 429, snippet: String::new() }.is_retryable());
        assert!(LlmError::Http { status: 503, snippet: String::new() }.is_retryable());
        assert!(!LlmError::Http { status: 400, snippet: String::new() }.is_retryable());
        assert!(!LlmError::Http { status: 404, snippet: String::new() }.is_retryable());
        assert!(!LlmError::Parse("bad json".into()).is_retryable());
    }

    #[test]
    fn response_parses_openai_shape() {
        let body = r#"{
            "choices": [{"message": {"content": "HOLD"}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 8}
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices[0].message.as_ref().unwrap().content, "HOLD");
        assert_eq!(parsed.usage.unwrap().prompt_tokens, 120);
    }

    #[test]
    fn request_omits_empty_options() {
        let req = ChatCompletionRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            max_tokens: None,
            temperature: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("max_tokens"));
        assert!(!json.contains("temperature"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let client = LlmClient::new("https://api.example.com/v1/", "sk-secret");
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("redacted"));
    }
}
