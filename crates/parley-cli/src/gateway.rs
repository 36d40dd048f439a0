//! OpenAI-compatible chat completions adapter.
//!
//! One non-streaming request per call; the reply is relayed as a single
//! chunk followed by completion.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use coordination::gateway::{
    ChatMessage, ErrorInfo, EventStream, ParticipantConfig, PromptContext, ProviderGateway,
    StreamEvent, TokenUsage,
};
use coordination::recovery::ErrorKind;

use crate::config::Endpoints;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub struct OpenAiCompatGateway {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl OpenAiCompatGateway {
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }
}

#[async_trait]
impl ProviderGateway for OpenAiCompatGateway {
    async fn start_stream(
        &self,
        config: &ParticipantConfig,
        prompt: PromptContext,
    ) -> Result<EventStream, ErrorInfo> {
        let endpoint = self.endpoints.resolve(&config.backend);
        let url = format!("{}/chat/completions", endpoint.url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &config.model,
            messages: &prompt.messages,
            max_tokens: config.max_output_tokens,
            temperature: config.temperature,
            stream: false,
        };
        debug!(
            participant = %config.participant_id,
            backend = %config.backend,
            round = prompt.round,
            "sending chat completion"
        );

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &endpoint.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            let mut info = ErrorInfo::new(classify_status(status, &text), format!("{status}: {text}"));
            if let Some(delay) = retry_after {
                info = info.with_retry_after(delay);
            }
            return Err(info);
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            ErrorInfo::new(ErrorKind::InvalidResponse, format!("malformed completion: {e}"))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ErrorInfo::new(ErrorKind::InvalidResponse, "completion has no content"))?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        let events = vec![StreamEvent::Chunk(content), StreamEvent::Complete(usage)];
        Ok(futures::stream::iter(events).boxed())
    }
}

fn transport_error(e: reqwest::Error) -> ErrorInfo {
    let kind = if e.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Network
    };
    ErrorInfo::new(kind, e.to_string())
}

/// Map an HTTP failure to an error kind.
pub fn classify_status(status: StatusCode, body: &str) -> ErrorKind {
    match status.as_u16() {
        401 | 403 => ErrorKind::Authentication,
        408 | 504 => ErrorKind::Timeout,
        429 => ErrorKind::RateLimit,
        400 | 413 | 422 => {
            let lower = body.to_lowercase();
            if lower.contains("context_length") || lower.contains("maximum context") {
                ErrorKind::ContextOverflow
            } else {
                ErrorKind::Validation
            }
        }
        _ => ErrorKind::ApiError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED, ""), ErrorKind::Authentication);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS, ""), ErrorKind::RateLimit);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY, ""), ErrorKind::ApiError);
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT, ""), ErrorKind::Timeout);
        assert_eq!(
            classify_status(
                StatusCode::BAD_REQUEST,
                r#"{"error":{"code":"context_length_exceeded"}}"#
            ),
            ErrorKind::ContextOverflow
        );
        assert_eq!(classify_status(StatusCode::BAD_REQUEST, "bad"), ErrorKind::Validation);
    }

    #[test]
    fn test_request_body_shape() {
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("go").named("pro")];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            max_tokens: 64,
            temperature: 0.5,
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["name"], "pro");
        assert!(json["messages"][0].get("name").is_none());
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_response_parse() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("hi"));
        assert_eq!(parsed.usage.unwrap().completion_tokens, 1);
    }
}
