// =============================================================================
// LLM provider layer — chat (role analysts) and reasoner (referee) tiers
// =============================================================================

pub mod client;
pub mod quota;

use serde::{Deserialize, Serialize};

pub use client::LlmClient;

/// One message in an OpenAI-compatible chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// Token usage reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Successful completion.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub model: String,
    pub content: String,
    pub usage: LlmUsage,
    pub latency_ms: u64,
}

/// Typed failure from a provider call, classified for the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("llm transport error: {0}")]
    Network(String),
    #[error("llm provider returned {status}: {snippet}")]
    Http { status: u16, snippet: String },
    #[error("llm response could not be parsed: {0}")]
    Parse(String),
    #[error("llm call canceled")]
    Canceled,
}

impl LlmError {
    /// Timeouts, transport failures, 5xx and 429 are retryable; other HTTP
    /// statuses (unknown model, bad request) are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Parse(_) | Self::Canceled => false,
        }
    }
}

/// Seam between the orchestrator and the concrete HTTP client; lets tests
/// substitute scripted analysts.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f64,
        timeout: std::time::Duration,
    ) -> Result<LlmReply, LlmError>;
}
