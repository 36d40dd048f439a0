//! Debate error taxonomy.
//!
//! Every failure a participant stream, the judge, or the context builder can
//! raise is reduced to a [`DebateError`] carrying one [`ErrorKind`]. The kind
//! decides retryability and the remedy shown to the user.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure class for a debate error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection reset, DNS failure, broken stream.
    Network,
    /// Provider throttled the call.
    RateLimit,
    /// Provider returned a server-side error.
    ApiError,
    /// Call exceeded its maximum duration.
    Timeout,
    /// Prompt does not fit the participant's context window.
    ContextOverflow,
    /// Credential rejected.
    Authentication,
    /// Request rejected as malformed.
    Validation,
    /// Output could not be parsed or failed schema validation.
    InvalidResponse,
}

impl ErrorKind {
    /// Whether this error is retried automatically.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::RateLimit | Self::ApiError | Self::Timeout
        )
    }

    /// Whether the failure says something about the backend's health.
    ///
    /// Only these kinds count toward the circuit breaker.
    pub fn counts_against_backend(self) -> bool {
        matches!(
            self,
            Self::Network | Self::RateLimit | Self::ApiError | Self::Timeout | Self::Authentication
        )
    }

    /// Suggested remedial action for this error kind.
    pub fn suggested_action(self) -> &'static str {
        match self {
            Self::Network => "check connectivity to the provider and retry",
            Self::RateLimit => "wait for the provider's rate limit window and retry",
            Self::ApiError => "provider is failing; wait and retry or swap the backend",
            Self::Timeout => "increase the call timeout or retry later",
            Self::ContextOverflow => "enable summarization or continue with truncation",
            Self::Authentication => "update the credential for this backend",
            Self::Validation => "fix the participant configuration (model name, limits)",
            Self::InvalidResponse => "swap the judge or continue without one",
        }
    }

    /// All kinds, in declaration order.
    pub fn all() -> &'static [ErrorKind] {
        &[
            Self::Network,
            Self::RateLimit,
            Self::ApiError,
            Self::Timeout,
            Self::ContextOverflow,
            Self::Authentication,
            Self::Validation,
            Self::InvalidResponse,
        ]
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::ApiError => write!(f, "api_error"),
            Self::Timeout => write!(f, "timeout"),
            Self::ContextOverflow => write!(f, "context_overflow"),
            Self::Authentication => write!(f, "authentication"),
            Self::Validation => write!(f, "validation"),
            Self::InvalidResponse => write!(f, "invalid_response"),
        }
    }
}

/// A classified debate failure with full context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateError {
    /// Error kind.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Whether the kind is retried automatically.
    pub retryable: bool,
    /// Participant the error belongs to (`None` for judge/debate errors).
    pub participant_id: Option<String>,
    /// Retries already spent on this call when the error was raised.
    pub retry_count: u32,
    /// Provider-supplied retry hint, in milliseconds.
    pub retry_after_ms: Option<u64>,
    /// Suggested remedy for the user.
    pub remedy: String,
    /// When the error was raised.
    pub timestamp: DateTime<Utc>,
}

impl DebateError {
    /// Create a new error of `kind`.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
            participant_id: None,
            retry_count: 0,
            retry_after_ms: None,
            remedy: kind.suggested_action().to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the participant the error belongs to.
    pub fn for_participant(mut self, participant_id: &str) -> Self {
        self.participant_id = Some(participant_id.to_string());
        self
    }

    /// Record how many retries were already spent.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Attach a provider retry-after hint.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after_ms = Some(millis(delay));
        self
    }

    /// Provider retry-after hint as a duration.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }

    /// One-line rendering for notifications and logs.
    pub fn summary_line(&self) -> String {
        match &self.participant_id {
            Some(pid) => format!("[{}] {}: {} ({})", self.kind, pid, self.message, self.remedy),
            None => format!("[{}] {} ({})", self.kind, self.message, self.remedy),
        }
    }
}

impl std::fmt::Display for DebateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for DebateError {}

/// Whole milliseconds in `delay`, saturating at `u64::MAX`.
pub fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_partition() {
        let retryable: Vec<ErrorKind> = ErrorKind::all()
            .iter()
            .copied()
            .filter(|k| k.is_retryable())
            .collect();
        assert_eq!(
            retryable,
            vec![
                ErrorKind::Network,
                ErrorKind::RateLimit,
                ErrorKind::ApiError,
                ErrorKind::Timeout
            ]
        );
    }

    #[test]
    fn test_every_kind_has_remedy() {
        for kind in ErrorKind::all() {
            assert!(!kind.suggested_action().is_empty(), "{kind} lacks remedy");
        }
    }

    #[test]
    fn test_new_error_carries_remedy_and_flag() {
        let err = DebateError::new(ErrorKind::Authentication, "401 from provider")
            .for_participant("p-2");
        assert!(!err.retryable);
        assert_eq!(err.participant_id.as_deref(), Some("p-2"));
        assert!(err.remedy.contains("credential"));
        assert!(err.summary_line().contains("p-2"));
    }

    #[test]
    fn test_retry_after_roundtrip() {
        let err = DebateError::new(ErrorKind::RateLimit, "429")
            .with_retry_after(Duration::from_millis(1500));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(250)), 250);
        assert_eq!(millis(Duration::MAX), u64::MAX);
        let err = DebateError::new(ErrorKind::RateLimit, "429").with_retry_after(Duration::MAX);
        assert_eq!(err.retry_after_ms, Some(u64::MAX));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::RateLimit.to_string(), "rate_limit");
        assert_eq!(ErrorKind::ContextOverflow.to_string(), "context_overflow");
        assert_eq!(ErrorKind::InvalidResponse.to_string(), "invalid_response");
    }

    #[test]
    fn test_context_overflow_does_not_count_against_backend() {
        assert!(!ErrorKind::ContextOverflow.counts_against_backend());
        assert!(!ErrorKind::InvalidResponse.counts_against_backend());
        assert!(ErrorKind::Timeout.counts_against_backend());
    }
}
