//! Recovery manager: turns a classified [`DebateError`] into one
//! [`RecoveryAction`].
//!
//! ```text
//! retryable (network, rate_limit, api_error, timeout)
//!   ├─ retries left   → RetryAfter(max(retry_after hint, backoff ± jitter))
//!   └─ exhausted      → FailParticipant (judge: judge-failure choice)
//! context_overflow    → UserChoice(summarize | truncate | end now)
//! authentication,
//! validation          → FailParticipant (needs user action) / FailDebate for the judge
//! invalid_response    → judge: RetryStricter once, then judge-failure choice
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::errors::{millis, DebateError, ErrorKind};

/// Retry policy for one class of transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_retries: u32,
    /// Backoff before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Relative jitter applied to each delay (0.2 = ±20%).
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy with `max_retries` and the default backoff curve.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Un-jittered backoff before retry number `attempt` (1-indexed).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let delay =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32 - 1);
        (delay as u64).min(self.max_backoff_ms)
    }

    /// Whether another retry is allowed after `retries_spent` retries.
    pub fn should_retry(&self, retries_spent: u32) -> bool {
        retries_spent < self.max_retries
    }

    /// Jittered backoff before retry number `attempt`.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.backoff_ms(attempt) as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        Duration::from_millis((base * factor).round() as u64)
    }
}

impl Default for RetryPolicy {
    /// Default: 3 retries, 1s initial backoff, 2x multiplier, 30s max, ±20% jitter.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            jitter: 0.2,
        }
    }
}

/// Per-kind retry ceilings and curves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub network: RetryPolicy,
    pub rate_limit: RetryPolicy,
    pub api_error: RetryPolicy,
    pub timeout: RetryPolicy,
}

impl RetryConfig {
    /// Policy for a retryable kind; `None` for structural kinds.
    pub fn policy_for(&self, kind: ErrorKind) -> Option<&RetryPolicy> {
        match kind {
            ErrorKind::Network => Some(&self.network),
            ErrorKind::RateLimit => Some(&self.rate_limit),
            ErrorKind::ApiError => Some(&self.api_error),
            ErrorKind::Timeout => Some(&self.timeout),
            _ => None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            network: RetryPolicy::with_max_retries(3),
            rate_limit: RetryPolicy::with_max_retries(5),
            api_error: RetryPolicy::with_max_retries(3),
            timeout: RetryPolicy::with_max_retries(3),
        }
    }
}

/// Who raised the error being classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// A debating participant's stream.
    Participant,
    /// The judge/evaluator.
    Judge,
}

/// Option offered to the user when the engine cannot decide alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOption {
    /// Context overflow: enable summarization and continue.
    SummarizeAndContinue,
    /// Context overflow: switch to truncation and continue.
    TruncateAndContinue,
    /// Context overflow: conclude now.
    EndNow,
    /// Judge failure: install a different judge.
    SwapJudge,
    /// Judge failure: carry on with heuristic assessments only.
    ContinueWithoutJudge,
    /// Judge failure: conclude now.
    EndDebate,
}

impl DecisionOption {
    /// Options offered on context overflow.
    pub fn context_overflow() -> Vec<DecisionOption> {
        vec![
            Self::SummarizeAndContinue,
            Self::TruncateAndContinue,
            Self::EndNow,
        ]
    }

    /// Options offered on judge failure.
    pub fn judge_failure() -> Vec<DecisionOption> {
        vec![Self::SwapJudge, Self::ContinueWithoutJudge, Self::EndDebate]
    }

    /// Whether choosing this option concludes the debate.
    pub fn ends_debate(self) -> bool {
        matches!(self, Self::EndNow | Self::EndDebate)
    }
}

impl std::fmt::Display for DecisionOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SummarizeAndContinue => write!(f, "summarize_and_continue"),
            Self::TruncateAndContinue => write!(f, "truncate_and_continue"),
            Self::EndNow => write!(f, "end_now"),
            Self::SwapJudge => write!(f, "swap_judge"),
            Self::ContinueWithoutJudge => write!(f, "continue_without_judge"),
            Self::EndDebate => write!(f, "end_debate"),
        }
    }
}

/// What to do about an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Retry the same call after `delay`; `attempt` is the retry number.
    RetryAfter { delay: Duration, attempt: u32 },
    /// Retry the judge call once with a stricter formatting instruction.
    RetryStricter,
    /// Surface a choice to the user.
    UserChoice {
        options: Vec<DecisionOption>,
        reason: String,
    },
    /// Stop this participant. `permanent` participants sit out the rest of
    /// the debate; non-permanent ones rejoin next round.
    FailParticipant { permanent: bool, remedy: String },
    /// The debate cannot proceed without external action.
    FailDebate { remedy: String },
}

impl RecoveryAction {
    /// Whether the action retries automatically.
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::RetryAfter { .. } | Self::RetryStricter)
    }
}

/// Shared reference to the circuit breaker.
pub type SharedCircuitBreaker = Arc<Mutex<CircuitBreaker>>;

/// Classifies failures and guards backends with the circuit breaker.
pub struct RecoveryManager {
    retry: RetryConfig,
    breaker: SharedCircuitBreaker,
}

impl RecoveryManager {
    /// Create a manager with its own circuit breaker.
    pub fn new(retry: RetryConfig, breaker: CircuitBreaker) -> Self {
        Self {
            retry,
            breaker: Arc::new(Mutex::new(breaker)),
        }
    }

    /// Create a shared reference to this manager.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Retry configuration in use.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Classify `error` into a single recovery action.
    pub fn classify(&self, error: &DebateError, source: ErrorSource) -> RecoveryAction {
        let kind = error.kind;

        if let Some(policy) = self.retry.policy_for(kind) {
            if policy.should_retry(error.retry_count) {
                let attempt = error.retry_count + 1;
                let backoff = policy.backoff_duration(attempt);
                let delay = error.retry_after().map_or(backoff, |hint| hint.max(backoff));
                debug!(%kind, attempt, delay_ms = millis(delay), "scheduling retry");
                return RecoveryAction::RetryAfter { delay, attempt };
            }
            warn!(%kind, retries = error.retry_count, "retries exhausted");
            return match source {
                ErrorSource::Participant => RecoveryAction::FailParticipant {
                    // Throttling passes; a participant that exhausted its
                    // rate-limit budget rejoins next round.
                    permanent: kind != ErrorKind::RateLimit,
                    remedy: error.remedy.clone(),
                },
                ErrorSource::Judge => RecoveryAction::UserChoice {
                    options: DecisionOption::judge_failure(),
                    reason: format!("judge unavailable after {} retries: {}", error.retry_count, error.message),
                },
            };
        }

        match (kind, source) {
            (ErrorKind::ContextOverflow, _) => RecoveryAction::UserChoice {
                options: DecisionOption::context_overflow(),
                reason: error.message.clone(),
            },
            (ErrorKind::Authentication | ErrorKind::Validation, ErrorSource::Participant) => {
                RecoveryAction::FailParticipant {
                    permanent: true,
                    remedy: error.remedy.clone(),
                }
            }
            (ErrorKind::Authentication | ErrorKind::Validation, ErrorSource::Judge) => {
                RecoveryAction::FailDebate {
                    remedy: error.remedy.clone(),
                }
            }
            (ErrorKind::InvalidResponse, ErrorSource::Judge) => {
                if error.retry_count == 0 {
                    RecoveryAction::RetryStricter
                } else {
                    RecoveryAction::UserChoice {
                        options: DecisionOption::judge_failure(),
                        reason: format!("judge output invalid twice: {}", error.message),
                    }
                }
            }
            (ErrorKind::InvalidResponse, ErrorSource::Participant) => {
                RecoveryAction::FailParticipant {
                    permanent: false,
                    remedy: "participant produced no usable output this round".to_string(),
                }
            }
            // Retryable kinds are handled above.
            _ => RecoveryAction::FailDebate {
                remedy: error.remedy.clone(),
            },
        }
    }

    /// Ask the breaker whether a call to `backend` may go out.
    pub async fn before_call(&self, backend: &str) -> Result<(), Duration> {
        self.breaker.lock().await.try_acquire(backend)
    }

    /// Record a successful call.
    pub async fn record_success(&self, backend: &str) {
        self.breaker.lock().await.record_success(backend);
    }

    /// Record a failed call of `kind`.
    pub async fn record_failure(&self, backend: &str, kind: ErrorKind) {
        let mut breaker = self.breaker.lock().await;
        if kind.counts_against_backend() {
            breaker.record_failure(backend);
            if breaker.state(backend) == CircuitState::Open {
                warn!(backend, failures = breaker.failure_count(backend), "circuit opened");
            }
        } else {
            breaker.abandon_trial(backend);
        }
    }

    /// Release a half-open trial for a call that was canceled.
    pub async fn abandon_call(&self, backend: &str) {
        self.breaker.lock().await.abandon_trial(backend);
    }

    /// Current circuit state for `backend`.
    pub async fn circuit_state(&self, backend: &str) -> CircuitState {
        self.breaker.lock().await.state(backend)
    }
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default(), CircuitBreaker::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RecoveryManager {
        RecoveryManager::default()
    }

    #[test]
    fn test_backoff_curve() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_ms(0), 0);
        assert_eq!(policy.backoff_ms(1), 1_000);
        assert_eq!(policy.backoff_ms(2), 2_000);
        assert_eq!(policy.backoff_ms(3), 4_000);
        assert_eq!(policy.backoff_ms(10), 30_000);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.backoff_duration(2).as_millis() as u64;
            assert!((1_600..=2_400).contains(&d), "delay {d} out of band");
        }
    }

    #[test]
    fn test_timeout_retries_three_times_with_growing_delay() {
        let m = manager();
        let mut last = Duration::ZERO;
        for spent in 0..3 {
            let err = DebateError::new(ErrorKind::Timeout, "slow").with_retry_count(spent);
            match m.classify(&err, ErrorSource::Participant) {
                RecoveryAction::RetryAfter { delay, attempt } => {
                    assert_eq!(attempt, spent + 1);
                    assert!(delay > last);
                    last = delay;
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }
        let err = DebateError::new(ErrorKind::Timeout, "slow").with_retry_count(3);
        assert!(matches!(
            m.classify(&err, ErrorSource::Participant),
            RecoveryAction::FailParticipant { permanent: true, .. }
        ));
    }

    #[test]
    fn test_rate_limit_ceiling_is_five_and_not_permanent() {
        let m = manager();
        let err = DebateError::new(ErrorKind::RateLimit, "429").with_retry_count(4);
        assert!(m.classify(&err, ErrorSource::Participant).is_retry());
        let err = DebateError::new(ErrorKind::RateLimit, "429").with_retry_count(5);
        assert!(matches!(
            m.classify(&err, ErrorSource::Participant),
            RecoveryAction::FailParticipant { permanent: false, .. }
        ));
    }

    #[test]
    fn test_retry_after_hint_is_honored() {
        let m = manager();
        let err = DebateError::new(ErrorKind::RateLimit, "429")
            .with_retry_after(Duration::from_secs(20));
        match m.classify(&err, ErrorSource::Participant) {
            RecoveryAction::RetryAfter { delay, .. } => {
                assert!(delay >= Duration::from_secs(20))
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_context_overflow_offers_choice() {
        let m = manager();
        let err = DebateError::new(ErrorKind::ContextOverflow, "prompt too long");
        match m.classify(&err, ErrorSource::Participant) {
            RecoveryAction::UserChoice { options, .. } => {
                assert_eq!(options, DecisionOption::context_overflow())
            }
            other => panic!("expected user choice, got {other:?}"),
        }
    }

    #[test]
    fn test_authentication_fails_participant_but_debate_for_judge() {
        let m = manager();
        let err = DebateError::new(ErrorKind::Authentication, "401");
        assert!(matches!(
            m.classify(&err, ErrorSource::Participant),
            RecoveryAction::FailParticipant { permanent: true, .. }
        ));
        assert!(matches!(
            m.classify(&err, ErrorSource::Judge),
            RecoveryAction::FailDebate { .. }
        ));
    }

    #[test]
    fn test_invalid_judge_output_retries_once_then_escalates() {
        let m = manager();
        let first = DebateError::new(ErrorKind::InvalidResponse, "bad json");
        assert_eq!(
            m.classify(&first, ErrorSource::Judge),
            RecoveryAction::RetryStricter
        );
        let second = first.clone().with_retry_count(1);
        match m.classify(&second, ErrorSource::Judge) {
            RecoveryAction::UserChoice { options, .. } => {
                assert_eq!(options, DecisionOption::judge_failure())
            }
            other => panic!("expected judge failure choice, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_after_five_consecutive_failures() {
        let m = manager();
        for _ in 0..5 {
            assert!(m.before_call("b").await.is_ok());
            m.record_failure("b", ErrorKind::ApiError).await;
        }
        assert_eq!(m.circuit_state("b").await, CircuitState::Open);
        assert!(m.before_call("b").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_structural_failures_do_not_trip_breaker() {
        let m = manager();
        for _ in 0..10 {
            m.record_failure("b", ErrorKind::ContextOverflow).await;
        }
        assert_eq!(m.circuit_state("b").await, CircuitState::Closed);
    }

    #[test]
    fn test_decision_option_display() {
        assert_eq!(DecisionOption::SwapJudge.to_string(), "swap_judge");
        assert!(DecisionOption::EndNow.ends_debate());
        assert!(!DecisionOption::TruncateAndContinue.ends_debate());
    }
}
