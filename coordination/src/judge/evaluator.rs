//! Evaluator contract, the gateway-backed judge, and the retry driver.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::prompts::{assessment_prompt, verdict_prompt};
use super::schema::{parse_assessment, parse_verdict, FinalVerdict, RoundAssessment};
use crate::gateway::{collect_text, ErrorInfo, ParticipantConfig, PromptContext, ProviderGateway};
use crate::recovery::{
    millis, DebateError, ErrorKind, ErrorSource, RecoveryAction, RecoveryManager,
};

/// A response as the judge sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgedResponse {
    pub participant_id: String,
    pub position: String,
    pub round: u32,
    pub content: String,
}

/// Input for a round assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentRequest {
    pub topic: String,
    pub round: u32,
    pub responses: Vec<JudgedResponse>,
    pub previous_assessments: Vec<RoundAssessment>,
}

impl AssessmentRequest {
    pub fn participant_ids(&self) -> Vec<&str> {
        self.responses
            .iter()
            .map(|r| r.participant_id.as_str())
            .collect()
    }
}

/// Input for the final verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictRequest {
    pub topic: String,
    pub transcript: Vec<JudgedResponse>,
    pub assessments: Vec<RoundAssessment>,
}

impl VerdictRequest {
    pub fn participant_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for r in &self.transcript {
            if !ids.contains(&r.participant_id.as_str()) {
                ids.push(&r.participant_id);
            }
        }
        ids
    }
}

/// Formatting pressure applied to a judge call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    Normal,
    /// Retry after an unparseable reply.
    Strict,
}

/// Judge call failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JudgeError {
    #[error("invalid judge output: {0}")]
    InvalidResponse(String),

    #[error("judge provider error: {0}")]
    Provider(DebateError),
}

impl JudgeError {
    pub fn is_invalid_response(&self) -> bool {
        matches!(self, Self::InvalidResponse(_))
    }

    /// Lift into a [`DebateError`] with `retry_count` retries already spent.
    pub fn into_debate_error(self, retry_count: u32) -> DebateError {
        match self {
            Self::InvalidResponse(detail) => {
                DebateError::new(ErrorKind::InvalidResponse, detail).with_retry_count(retry_count)
            }
            Self::Provider(err) => err.with_retry_count(retry_count),
        }
    }
}

/// Scoring agent contract.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn assess_round(
        &self,
        request: &AssessmentRequest,
        strictness: Strictness,
    ) -> Result<RoundAssessment, JudgeError>;

    async fn final_verdict(
        &self,
        request: &VerdictRequest,
        strictness: Strictness,
    ) -> Result<FinalVerdict, JudgeError>;

    /// Judge identity for logging.
    fn name(&self) -> &str;
}

/// Judge prompting a backend through the provider gateway.
pub struct GatewayEvaluator {
    gateway: Arc<dyn ProviderGateway>,
    config: ParticipantConfig,
}

impl GatewayEvaluator {
    pub fn new(gateway: Arc<dyn ProviderGateway>, config: ParticipantConfig) -> Self {
        Self { gateway, config }
    }

    async fn complete(&self, prompt: PromptContext) -> Result<String, JudgeError> {
        let judge_id = self.config.participant_id.as_str();
        let provider_error =
            |info: ErrorInfo| JudgeError::Provider(info.into_debate_error(judge_id, 0));
        let stream = self
            .gateway
            .start_stream(&self.config, prompt)
            .await
            .map_err(provider_error)?;
        let (text, _usage) = collect_text(stream).await.map_err(provider_error)?;
        Ok(text)
    }
}

#[async_trait]
impl Evaluator for GatewayEvaluator {
    async fn assess_round(
        &self,
        request: &AssessmentRequest,
        strictness: Strictness,
    ) -> Result<RoundAssessment, JudgeError> {
        let text = self.complete(assessment_prompt(request, strictness)).await?;
        parse_assessment(&text, request.round, &request.participant_ids())
            .map_err(JudgeError::InvalidResponse)
    }

    async fn final_verdict(
        &self,
        request: &VerdictRequest,
        strictness: Strictness,
    ) -> Result<FinalVerdict, JudgeError> {
        let text = self.complete(verdict_prompt(request, strictness)).await?;
        parse_verdict(&text, &request.participant_ids()).map_err(JudgeError::InvalidResponse)
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

/// Judge call that could not be recovered automatically.
#[derive(Debug, Clone)]
pub struct JudgeFailure {
    pub error: DebateError,
    /// `UserChoice` (judge-failure options) or `FailDebate`.
    pub action: RecoveryAction,
}

/// Drive one judge operation through recovery: transient provider errors
/// back off and retry, an invalid reply gets exactly one stricter retry, and
/// everything else comes back as a [`JudgeFailure`].
pub async fn call_with_recovery<T, F, Fut>(
    recovery: &RecoveryManager,
    call_timeout: Duration,
    mut call: F,
) -> Result<T, JudgeFailure>
where
    F: FnMut(Strictness) -> Fut,
    Fut: Future<Output = Result<T, JudgeError>>,
{
    let mut strictness = Strictness::Normal;
    let mut invalid_retries = 0u32;
    let mut transient_retries = 0u32;

    loop {
        let outcome = match tokio::time::timeout(call_timeout, call(strictness)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(JudgeError::Provider(DebateError::new(
                ErrorKind::Timeout,
                format!("judge call exceeded {}s", call_timeout.as_secs()),
            ))),
        };
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let retry_count = if err.is_invalid_response() {
            invalid_retries
        } else {
            transient_retries
        };
        let error = err.into_debate_error(retry_count);
        match recovery.classify(&error, ErrorSource::Judge) {
            RecoveryAction::RetryStricter => {
                info!(error = %error, "judge output invalid, retrying with stricter instruction");
                invalid_retries += 1;
                strictness = Strictness::Strict;
            }
            RecoveryAction::RetryAfter { delay, attempt } => {
                warn!(
                    error = %error,
                    attempt,
                    delay_ms = millis(delay),
                    "judge call failed, backing off"
                );
                transient_retries += 1;
                tokio::time::sleep(delay).await;
            }
            action => return Err(JudgeFailure { error, action }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{EventStream, StreamEvent, TokenUsage};
    use crate::judge::schema::ContinuationFlags;
    use crate::recovery::DecisionOption;
    use futures::StreamExt;
    use std::sync::Mutex;

    struct CannedGateway {
        replies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProviderGateway for CannedGateway {
        async fn start_stream(
            &self,
            _config: &ParticipantConfig,
            _prompt: PromptContext,
        ) -> Result<EventStream, ErrorInfo> {
            let reply = self.replies.lock().unwrap().remove(0);
            Ok(futures::stream::iter(vec![
                StreamEvent::Chunk(reply),
                StreamEvent::Complete(TokenUsage::default()),
            ])
            .boxed())
        }
    }

    fn judge_config() -> ParticipantConfig {
        ParticipantConfig {
            participant_id: "judge".into(),
            backend: "mock".into(),
            model: "judge-model".into(),
            max_output_tokens: 1_000,
            temperature: 0.0,
        }
    }

    fn request() -> AssessmentRequest {
        AssessmentRequest {
            topic: "t".into(),
            round: 1,
            responses: vec![
                JudgedResponse {
                    participant_id: "a".into(),
                    position: "Proponent".into(),
                    round: 1,
                    content: "yes".into(),
                },
                JudgedResponse {
                    participant_id: "b".into(),
                    position: "Opponent".into(),
                    round: 1,
                    content: "no".into(),
                },
            ],
            previous_assessments: Vec::new(),
        }
    }

    fn valid_assessment() -> RoundAssessment {
        RoundAssessment {
            round: 1,
            should_continue: true,
            quality_score: 6.0,
            participants: Vec::new(),
            flags: ContinuationFlags::default(),
            reasoning: "ok".into(),
        }
    }

    #[tokio::test]
    async fn test_gateway_evaluator_parses_reply() {
        let reply = serde_json::to_string(&valid_assessment()).unwrap();
        let evaluator = GatewayEvaluator::new(
            Arc::new(CannedGateway {
                replies: Mutex::new(vec![reply]),
            }),
            judge_config(),
        );
        let a = evaluator
            .assess_round(&request(), Strictness::Normal)
            .await
            .unwrap();
        assert_eq!(a.quality_score, 6.0);
    }

    #[tokio::test]
    async fn test_gateway_evaluator_flags_prose_as_invalid() {
        let evaluator = GatewayEvaluator::new(
            Arc::new(CannedGateway {
                replies: Mutex::new(vec!["a won, clearly".into()]),
            }),
            judge_config(),
        );
        let err = evaluator
            .assess_round(&request(), Strictness::Normal)
            .await
            .unwrap_err();
        assert!(err.is_invalid_response());
    }

    #[tokio::test]
    async fn test_one_stricter_retry_then_escalation() {
        let recovery = RecoveryManager::default();
        let seen = Mutex::new(Vec::new());
        let result: Result<RoundAssessment, _> =
            call_with_recovery(&recovery, Duration::from_secs(5), |strictness| {
                seen.lock().unwrap().push(strictness);
                async { Err(JudgeError::InvalidResponse("not json".into())) }
            })
            .await;
        let failure = result.unwrap_err();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Strictness::Normal, Strictness::Strict]
        );
        match failure.action {
            RecoveryAction::UserChoice { options, .. } => {
                assert_eq!(options, DecisionOption::judge_failure())
            }
            other => panic!("expected judge failure choice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stricter_retry_can_succeed() {
        let recovery = RecoveryManager::default();
        let result = call_with_recovery(&recovery, Duration::from_secs(5), |strictness| async move {
            match strictness {
                Strictness::Normal => Err(JudgeError::InvalidResponse("prose".into())),
                Strictness::Strict => Ok(valid_assessment()),
            }
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_back_off_then_escalate() {
        let recovery = RecoveryManager::default();
        let calls = Mutex::new(0u32);
        let result: Result<RoundAssessment, _> =
            call_with_recovery(&recovery, Duration::from_secs(5), |_| {
                *calls.lock().unwrap() += 1;
                async {
                    Err(JudgeError::Provider(DebateError::new(
                        ErrorKind::ApiError,
                        "503",
                    )))
                }
            })
            .await;
        // initial call + 3 retries
        assert_eq!(*calls.lock().unwrap(), 4);
        assert!(matches!(
            result.unwrap_err().action,
            RecoveryAction::UserChoice { .. }
        ));
    }

    #[tokio::test]
    async fn test_authentication_fails_debate() {
        let recovery = RecoveryManager::default();
        let result: Result<RoundAssessment, _> =
            call_with_recovery(&recovery, Duration::from_secs(5), |_| async {
                Err(JudgeError::Provider(DebateError::new(
                    ErrorKind::Authentication,
                    "401",
                )))
            })
            .await;
        assert!(matches!(
            result.unwrap_err().action,
            RecoveryAction::FailDebate { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_judge_times_out() {
        let recovery = RecoveryManager::default();
        let result: Result<RoundAssessment, _> =
            call_with_recovery(&recovery, Duration::from_secs(1), |_| async {
                std::future::pending::<()>().await;
                Err(JudgeError::InvalidResponse("unreachable".into()))
            })
            .await;
        assert_eq!(result.unwrap_err().error.kind, ErrorKind::Timeout);
    }
}
