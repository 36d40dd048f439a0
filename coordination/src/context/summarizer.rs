//! Transcript summarizer: condenses the oldest part of a debate into one
//! synthetic message.
//!
//! [`GatewaySummarizer`] issues a secondary generation call through the
//! provider gateway; it is selected by `context.summarizer` in the engine
//! config. [`ExtractiveSummarizer`] is deterministic and needs no backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::gateway::{collect_text, ChatMessage, ParticipantConfig, PromptContext, ProviderGateway};
use crate::limiter::SharedRateLimiter;
use crate::recovery::{millis, DebateError, ErrorKind};

/// Participant id summary calls are made under.
const SUMMARIZER_ID: &str = "summarizer";
const SUMMARY_TEMPERATURE: f32 = 0.3;
const DEFAULT_SUMMARY_TIMEOUT: Duration = Duration::from_secs(120);

/// One transcript entry handed to a summarizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryInputEntry {
    pub speaker: String,
    pub round: u32,
    pub content: String,
}

/// Summarization request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRequest {
    /// Debate topic.
    pub topic: String,
    /// Summary of entries preceding `entries`, to extend rather than redo.
    pub previous_summary: Option<String>,
    /// Entries to condense, oldest first.
    pub entries: Vec<SummaryInputEntry>,
    /// Output cap for the summary.
    pub max_output_tokens: u32,
}

/// Trait for summarizers.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Condense the request into one paragraph of text.
    async fn summarize(&self, request: &SummaryRequest) -> Result<String, DebateError>;

    /// Summarizer name for logging.
    fn name(&self) -> &str;
}

/// Backend model that writes summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizerModel {
    pub backend: String,
    pub model: String,
}

impl SummarizerModel {
    pub fn participant_config(&self, max_output_tokens: u32) -> ParticipantConfig {
        ParticipantConfig {
            participant_id: SUMMARIZER_ID.to_string(),
            backend: self.backend.clone(),
            model: self.model.clone(),
            max_output_tokens,
            temperature: SUMMARY_TEMPERATURE,
        }
    }
}

/// Summarizer backed by a generation call through the provider gateway.
///
/// The call takes a limiter slot on its backend when a limiter is attached
/// and is bounded by the call timeout.
pub struct GatewaySummarizer {
    gateway: Arc<dyn ProviderGateway>,
    config: ParticipantConfig,
    limiter: Option<SharedRateLimiter>,
    call_timeout: Duration,
}

impl GatewaySummarizer {
    pub fn new(gateway: Arc<dyn ProviderGateway>, config: ParticipantConfig) -> Self {
        Self {
            gateway,
            config,
            limiter: None,
            call_timeout: DEFAULT_SUMMARY_TIMEOUT,
        }
    }

    pub fn with_limiter(mut self, limiter: SharedRateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    async fn generate(&self, request: &SummaryRequest) -> Result<String, DebateError> {
        let mut config = self.config.clone();
        config.max_output_tokens = request.max_output_tokens;
        let _permit = match &self.limiter {
            Some(limiter) => Some(
                limiter
                    .acquire(&config.backend)
                    .await
                    .map_err(|e| DebateError::new(ErrorKind::ApiError, e.to_string()))?,
            ),
            None => None,
        };
        let stream = self
            .gateway
            .start_stream(&config, Self::prompt(request))
            .await
            .map_err(|info| info.into_debate_error(&config.participant_id, 0))?;
        let (text, usage) = collect_text(stream)
            .await
            .map_err(|info| info.into_debate_error(&config.participant_id, 0))?;
        debug!(
            backend = %config.backend,
            entries = request.entries.len(),
            output_tokens = usage.output_tokens,
            "summary generated"
        );
        Ok(text)
    }

    fn prompt(request: &SummaryRequest) -> PromptContext {
        let mut body = format!("Debate topic: {}\n\n", request.topic);
        if let Some(previous) = &request.previous_summary {
            body.push_str("Summary so far:\n");
            body.push_str(previous);
            body.push_str("\n\nExtend the summary with these later arguments:\n");
        } else {
            body.push_str("Summarize these arguments:\n");
        }
        for entry in &request.entries {
            body.push_str(&format!(
                "- {} (round {}): {}\n",
                entry.speaker, entry.round, entry.content
            ));
        }
        PromptContext {
            messages: vec![
                ChatMessage::system(format!(
                    "You condense debate transcripts. Keep every participant's main claims \
                     and the points of disagreement. Answer in at most {} tokens of plain prose.",
                    request.max_output_tokens
                )),
                ChatMessage::user(body),
            ],
            round: 0,
        }
    }
}

#[async_trait]
impl Summarizer for GatewaySummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<String, DebateError> {
        let text = tokio::time::timeout(self.call_timeout, self.generate(request))
            .await
            .map_err(|_| {
                DebateError::new(
                    ErrorKind::Timeout,
                    format!("summary call exceeded {}ms", millis(self.call_timeout)),
                )
            })??;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(DebateError::new(
                ErrorKind::InvalidResponse,
                "summarizer returned empty text",
            ));
        }
        Ok(text)
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

/// Deterministic summarizer keeping the first sentence of every entry.
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    /// Longest excerpt kept per entry, in characters.
    pub max_excerpt_chars: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            max_excerpt_chars: 160,
        }
    }
}

impl ExtractiveSummarizer {
    fn excerpt(&self, content: &str) -> String {
        let sentence = content
            .split_inclusive(['.', '!', '?'])
            .next()
            .unwrap_or(content)
            .trim();
        truncate(sentence, self.max_excerpt_chars)
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<String, DebateError> {
        let mut parts: Vec<String> = Vec::new();
        if let Some(previous) = &request.previous_summary {
            parts.push(previous.clone());
        }
        for entry in &request.entries {
            parts.push(format!(
                "{} (round {}): {}",
                entry.speaker,
                entry.round,
                self.excerpt(&entry.content)
            ));
        }
        // ~4 chars per token
        let cap = (request.max_output_tokens as usize).saturating_mul(4);
        Ok(truncate(&parts.join(" "), cap))
    }

    fn name(&self) -> &str {
        "extractive"
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ErrorInfo, EventStream, StreamEvent, TokenUsage};
    use crate::limiter::RateLimiter;
    use futures::StreamExt;
    use std::sync::Mutex;

    fn entries() -> Vec<SummaryInputEntry> {
        vec![
            SummaryInputEntry {
                speaker: "alpha".into(),
                round: 1,
                content: "Nuclear power is safe. It has the lowest deaths per TWh.".into(),
            },
            SummaryInputEntry {
                speaker: "beta".into(),
                round: 1,
                content: "Waste storage remains unsolved! Costs keep rising.".into(),
            },
        ]
    }

    #[tokio::test]
    async fn test_extractive_keeps_first_sentences() {
        let s = ExtractiveSummarizer::default();
        let out = s
            .summarize(&SummaryRequest {
                topic: "nuclear".into(),
                previous_summary: None,
                entries: entries(),
                max_output_tokens: 200,
            })
            .await
            .unwrap();
        assert!(out.contains("alpha (round 1): Nuclear power is safe."));
        assert!(out.contains("beta (round 1): Waste storage remains unsolved!"));
        assert!(!out.contains("Costs keep rising"));
    }

    #[tokio::test]
    async fn test_extractive_extends_previous_summary() {
        let s = ExtractiveSummarizer::default();
        let out = s
            .summarize(&SummaryRequest {
                topic: "nuclear".into(),
                previous_summary: Some("Earlier: both sides agreed on nothing.".into()),
                entries: entries(),
                max_output_tokens: 200,
            })
            .await
            .unwrap();
        assert!(out.starts_with("Earlier:"));
    }

    #[tokio::test]
    async fn test_extractive_respects_output_cap() {
        let s = ExtractiveSummarizer::default();
        let out = s
            .summarize(&SummaryRequest {
                topic: "nuclear".into(),
                previous_summary: None,
                entries: entries(),
                max_output_tokens: 5,
            })
            .await
            .unwrap();
        assert!(out.chars().count() <= 20);
    }

    #[test]
    fn test_truncate_utility() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 8), "hello...");
    }

    /// Gateway answering summary calls with a fixed reply, or never.
    struct SummaryGateway {
        reply: Option<String>,
        limiter: SharedRateLimiter,
        calls: Mutex<Vec<(ParticipantConfig, PromptContext, usize)>>,
    }

    impl SummaryGateway {
        fn new(reply: Option<&str>, limiter: SharedRateLimiter) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(str::to_string),
                limiter,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProviderGateway for SummaryGateway {
        async fn start_stream(
            &self,
            config: &ParticipantConfig,
            prompt: PromptContext,
        ) -> Result<EventStream, ErrorInfo> {
            let in_flight = self.limiter.in_flight(&config.backend).await;
            self.calls
                .lock()
                .unwrap()
                .push((config.clone(), prompt, in_flight));
            match &self.reply {
                Some(text) => Ok(futures::stream::iter(vec![
                    StreamEvent::Chunk(text.clone()),
                    StreamEvent::Complete(TokenUsage::default()),
                ])
                .boxed()),
                None => Ok(futures::stream::pending::<StreamEvent>().boxed()),
            }
        }
    }

    fn summarizer(gateway: Arc<SummaryGateway>) -> GatewaySummarizer {
        let model = SummarizerModel {
            backend: "cloud".into(),
            model: "small".into(),
        };
        let limiter = gateway.limiter.clone();
        GatewaySummarizer::new(gateway, model.participant_config(400))
            .with_limiter(limiter)
            .with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_gateway_summary_holds_a_limiter_slot() {
        let limiter = RateLimiter::default().shared();
        let gateway = SummaryGateway::new(
            Some("  Alpha defends safety; beta doubts storage.  "),
            limiter.clone(),
        );
        let out = summarizer(gateway.clone())
            .summarize(&SummaryRequest {
                topic: "nuclear".into(),
                previous_summary: Some("Both opened cautiously.".into()),
                entries: entries(),
                max_output_tokens: 120,
            })
            .await
            .unwrap();
        assert_eq!(out, "Alpha defends safety; beta doubts storage.");

        let calls = gateway.calls.lock().unwrap();
        let (config, prompt, in_flight) = &calls[0];
        assert_eq!(config.participant_id, "summarizer");
        assert_eq!(config.max_output_tokens, 120);
        assert_eq!(*in_flight, 1);
        let body = &prompt.messages[1].content;
        assert!(body.contains("Summary so far:\nBoth opened cautiously."));
        assert!(body.contains("alpha (round 1): Nuclear power is safe."));
        drop(calls);
        assert_eq!(limiter.in_flight("cloud").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_summary_call_times_out() {
        let limiter = RateLimiter::default().shared();
        let gateway = SummaryGateway::new(None, limiter.clone());
        let err = summarizer(gateway)
            .summarize(&SummaryRequest {
                topic: "nuclear".into(),
                previous_summary: None,
                entries: entries(),
                max_output_tokens: 120,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.message.contains("5000ms"));
        assert_eq!(limiter.in_flight("cloud").await, 0);
    }

    #[tokio::test]
    async fn test_blank_summary_is_invalid() {
        let gateway = SummaryGateway::new(Some("   "), RateLimiter::default().shared());
        let err = summarizer(gateway)
            .summarize(&SummaryRequest {
                topic: "nuclear".into(),
                previous_summary: None,
                entries: entries(),
                max_output_tokens: 120,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidResponse);
    }
}
