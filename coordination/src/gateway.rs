//! Provider gateway contract.
//!
//! Backends are consumed through [`ProviderGateway`], which turns one
//! participant request into a canonical stream of chunk / complete / error
//! events. Wire formats live behind this trait.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::recovery::{millis, DebateError, ErrorKind};

/// Identity of a backend (provider + endpoint). Limiter slots and circuit
/// breakers are keyed by it.
pub type BackendId = String;

/// Role of a message in a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One message sent to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    /// Speaker label for transcript messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            name: None,
        }
    }

    /// Attach a speaker label.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Everything a gateway needs to address one backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantConfig {
    /// Participant (or judge) the call is made for.
    pub participant_id: String,
    /// Backend identity.
    pub backend: BackendId,
    /// Model name on that backend.
    pub model: String,
    /// Output token cap for the call.
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// Prompt for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptContext {
    pub messages: Vec<ChatMessage>,
    /// Round the call belongs to (0 for out-of-round calls such as summaries).
    pub round: u32,
}

/// Token accounting reported on completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another usage record.
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Error reported by a gateway, already mapped to an [`ErrorKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Provider retry-after hint, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after_ms = Some(millis(delay));
        self
    }

    /// Lift into a [`DebateError`] for `participant_id` after `retry_count` retries.
    pub fn into_debate_error(self, participant_id: &str, retry_count: u32) -> DebateError {
        let mut err = DebateError::new(self.kind, self.message)
            .for_participant(participant_id)
            .with_retry_count(retry_count);
        err.retry_after_ms = self.retry_after_ms;
        err
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One event of a canonical backend stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(String),
    Complete(TokenUsage),
    Error(ErrorInfo),
}

/// Boxed canonical stream.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// Contract every backend adapter fulfils.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Start a streaming call. Setup failures are returned as `Err`; failures
    /// after the stream started arrive as [`StreamEvent::Error`].
    async fn start_stream(
        &self,
        config: &ParticipantConfig,
        prompt: PromptContext,
    ) -> Result<EventStream, ErrorInfo>;
}

/// Drain a stream into its full text and usage.
///
/// Used for one-shot calls (judge, summarizer) that don't relay chunks.
pub async fn collect_text(mut stream: EventStream) -> Result<(String, TokenUsage), ErrorInfo> {
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Chunk(chunk) => text.push_str(&chunk),
            StreamEvent::Complete(usage) => return Ok((text, usage)),
            StreamEvent::Error(info) => return Err(info),
        }
    }
    Err(ErrorInfo::new(
        ErrorKind::Network,
        "stream ended without a completion event",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_collect_text_concatenates_chunks() {
        let events = vec![
            StreamEvent::Chunk("Hello, ".into()),
            StreamEvent::Chunk("world".into()),
            StreamEvent::Complete(TokenUsage {
                input_tokens: 10,
                output_tokens: 2,
            }),
        ];
        let (text, usage) = collect_text(stream::iter(events).boxed()).await.unwrap();
        assert_eq!(text, "Hello, world");
        assert_eq!(usage.total(), 12);
    }

    #[tokio::test]
    async fn test_collect_text_surfaces_error() {
        let events = vec![
            StreamEvent::Chunk("partial".into()),
            StreamEvent::Error(ErrorInfo::new(ErrorKind::ApiError, "502")),
        ];
        let err = collect_text(stream::iter(events).boxed()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ApiError);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_network_error() {
        let events = vec![StreamEvent::Chunk("cut".into())];
        let err = collect_text(stream::iter(events).boxed()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
    }

    #[test]
    fn test_error_info_lifts_retry_hint() {
        let err = ErrorInfo::new(ErrorKind::RateLimit, "slow down")
            .with_retry_after(Duration::from_secs(3))
            .into_debate_error("p-1", 2);
        assert_eq!(err.retry_after_ms, Some(3_000));
        assert_eq!(err.retry_count, 2);
        assert_eq!(err.participant_id.as_deref(), Some("p-1"));
    }
}
