//! Debate data model: debates, participants, responses.
//!
//! Only the coordination task holds a `&mut Debate`. Transcript and token
//! usage change in exactly one place, [`Debate::finalize_response`].

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{DebateStatus, RoundPhase, TimelineEntry, TransitionError};
use crate::context::{ContextWarning, TranscriptEntry};
use crate::gateway::{BackendId, ParticipantConfig, TokenUsage};
use crate::judge::{FinalVerdict, JudgedResponse, RoundAssessment};
use crate::recovery::{DebateError, DecisionOption, ErrorKind};

/// Minimum participants in a debate.
pub const MIN_PARTICIPANTS: usize = 2;
/// Maximum participants in a debate.
pub const MAX_PARTICIPANTS: usize = 4;

/// Debate format; decides the stopping rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateFormat {
    #[default]
    FreeForm,
    StructuredRounds,
    /// Ends after `round_limit` rounds.
    RoundLimited,
    /// Ends on convergence or diminishing returns.
    ConvergenceSeeking,
}

impl std::fmt::Display for DebateFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FreeForm => write!(f, "free_form"),
            Self::StructuredRounds => write!(f, "structured_rounds"),
            Self::RoundLimited => write!(f, "round_limited"),
            Self::ConvergenceSeeking => write!(f, "convergence_seeking"),
        }
    }
}

/// How participants take turns within a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateMode {
    /// All participants stream concurrently.
    #[default]
    Simultaneous,
    /// One participant at a time, in list order.
    Sequential,
}

impl std::fmt::Display for DebateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simultaneous => write!(f, "simultaneous"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

/// Per-round participant status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    #[default]
    Idle,
    Streaming,
    Complete,
    /// Failed this round; rejoins next round.
    Error,
    /// Out for the rest of the debate.
    Failed,
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Streaming => write!(f, "streaming"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A finalized response. Immutable once in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub participant_id: String,
    pub round: u32,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub token_count: u64,
}

/// The judge assigned to a debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeRef {
    pub id: String,
    pub backend: BackendId,
    pub model: String,
}

/// Participant configuration supplied at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSpec {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub backend: BackendId,
    pub model: String,
    /// Assigned by the persona strategy when absent.
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_output_tokens() -> u32 {
    1_024
}

fn default_temperature() -> f32 {
    0.7
}

impl ParticipantSpec {
    pub fn new(backend: &str, model: &str) -> Self {
        Self {
            id: None,
            backend: backend.to_string(),
            model: model.to_string(),
            position: None,
            persona: None,
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_position(mut self, position: &str) -> Self {
        self.position = Some(position.to_string());
        self
    }
}

/// A debating participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub backend: BackendId,
    pub model: String,
    pub position: Option<String>,
    pub persona: Option<String>,
    status: ParticipantStatus,
    /// Present iff `status == Streaming`.
    #[serde(skip)]
    buffer: Option<String>,
    /// Indices into the debate transcript.
    pub response_indices: Vec<usize>,
    pub usage: TokenUsage,
    pub errors: Vec<DebateError>,
    /// Retries spent across the debate.
    pub retry_count: u32,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl Participant {
    pub fn from_spec(spec: ParticipantSpec, index: usize) -> Self {
        Self {
            id: spec.id.unwrap_or_else(|| format!("p{}", index + 1)),
            backend: spec.backend,
            model: spec.model,
            position: spec.position,
            persona: spec.persona,
            status: ParticipantStatus::Idle,
            buffer: None,
            response_indices: Vec::new(),
            usage: TokenUsage::default(),
            errors: Vec::new(),
            retry_count: 0,
            max_output_tokens: spec.max_output_tokens,
            temperature: spec.temperature,
        }
    }

    pub fn status(&self) -> ParticipantStatus {
        self.status
    }

    /// Streaming buffer (only while streaming).
    pub fn buffer(&self) -> Option<&str> {
        self.buffer.as_deref()
    }

    /// Not permanently failed.
    pub fn is_active(&self) -> bool {
        self.status != ParticipantStatus::Failed
    }

    /// Whether this round reached a terminal outcome.
    pub fn is_round_terminal(&self) -> bool {
        matches!(
            self.status,
            ParticipantStatus::Complete | ParticipantStatus::Error | ParticipantStatus::Failed
        )
    }

    /// Kind of the error that ended this participant's round, if any.
    pub fn round_error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            ParticipantStatus::Error | ParticipantStatus::Failed => {
                self.errors.last().map(|e| e.kind)
            }
            _ => None,
        }
    }

    pub fn begin_stream(&mut self) {
        self.status = ParticipantStatus::Streaming;
        self.buffer = Some(String::new());
    }

    /// Append a chunk. Ignored unless streaming.
    pub fn push_chunk(&mut self, text: &str) -> bool {
        match self.buffer.as_mut() {
            Some(buffer) => {
                buffer.push_str(text);
                true
            }
            None => false,
        }
    }

    /// Discard partial output before a retry.
    pub fn reset_buffer(&mut self) {
        if self.status == ParticipantStatus::Streaming {
            self.buffer = Some(String::new());
        }
    }

    /// Round ended with an error; rejoins next round.
    pub fn mark_error(&mut self, error: DebateError) {
        self.status = ParticipantStatus::Error;
        self.buffer = None;
        self.errors.push(error);
    }

    /// Out for the rest of the debate.
    pub fn mark_failed(&mut self, error: DebateError) {
        self.status = ParticipantStatus::Failed;
        self.buffer = None;
        self.errors.push(error);
    }

    /// Drop an in-flight stream without finalizing it.
    pub fn abandon_stream(&mut self) {
        if self.status == ParticipantStatus::Streaming {
            self.status = ParticipantStatus::Idle;
            self.buffer = None;
        }
    }

    /// Back to idle for a new round (failed participants stay failed).
    pub fn reset_for_round(&mut self) {
        if self.status != ParticipantStatus::Failed {
            self.status = ParticipantStatus::Idle;
            self.buffer = None;
        }
    }

    /// Back to a fresh participant (lifecycle reset).
    fn reset_all(&mut self) {
        self.status = ParticipantStatus::Idle;
        self.buffer = None;
        self.response_indices.clear();
        self.usage = TokenUsage::default();
        self.errors.clear();
        self.retry_count = 0;
    }

    /// Gateway addressing for this participant.
    pub fn gateway_config(&self) -> ParticipantConfig {
        ParticipantConfig {
            participant_id: self.id.clone(),
            backend: self.backend.clone(),
            model: self.model.clone(),
            max_output_tokens: self.max_output_tokens,
            temperature: self.temperature,
        }
    }

    /// Position label, or a neutral default.
    pub fn position_label(&self) -> &str {
        self.position.as_deref().unwrap_or("Participant")
    }

    /// System prompt: persona plus position.
    pub fn system_prompt(&self, topic: &str) -> String {
        let mut prompt = format!(
            "You are {} in a structured debate on: {}. Your position: {}.",
            self.id,
            topic,
            self.position_label()
        );
        if let Some(persona) = &self.persona {
            prompt.push(' ');
            prompt.push_str(persona);
        }
        prompt.push_str(
            " Engage directly with the other participants' latest arguments. Be concise.",
        );
        prompt
    }
}

/// Why the debate waits for a user decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    ContextOverflow,
    /// The judge failed on a round assessment.
    JudgeFailure,
    /// The judge failed on the final verdict.
    VerdictFailure,
}

impl DecisionKind {
    /// Whether a judge swap answers this decision.
    pub fn is_judge(self) -> bool {
        matches!(self, Self::JudgeFailure | Self::VerdictFailure)
    }
}

/// Decision awaiting the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub kind: DecisionKind,
    pub options: Vec<DecisionOption>,
    pub reason: String,
    pub participant_id: Option<String>,
}

/// Where a retried debate picks up after an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "at", rename_all = "snake_case")]
pub enum ResumePoint {
    /// Nothing ran yet.
    #[default]
    Fresh,
    /// Re-enter the current round at `phase`.
    Round { phase: RoundPhase },
    /// Re-run completion.
    Completing,
}

/// A context warning recorded against a participant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedWarning {
    pub round: u32,
    pub participant_id: String,
    pub warning: ContextWarning,
}

/// Setup for a new debate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebateSetup {
    pub topic: String,
    #[serde(default)]
    pub format: DebateFormat,
    #[serde(default)]
    pub mode: DebateMode,
    /// Required for `round_limited`.
    #[serde(default)]
    pub round_limit: Option<u32>,
    pub participants: Vec<ParticipantSpec>,
    #[serde(default)]
    pub judge: Option<JudgeRef>,
    /// Overrides the engine's global round cap.
    #[serde(default)]
    pub max_rounds: Option<u32>,
}

/// Model-level invariant violations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("participant {0} is not streaming")]
    NotStreaming(String),

    #[error("unknown participant {0}")]
    UnknownParticipant(String),

    #[error("final verdict already recorded")]
    VerdictAlreadySet,
}

/// One debate run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debate {
    pub id: String,
    pub topic: String,
    status: DebateStatus,
    pub format: DebateFormat,
    pub mode: DebateMode,
    current_round: u32,
    pub round_limit: Option<u32>,
    pub max_rounds: u32,
    pub participants: Vec<Participant>,
    pub judge: Option<JudgeRef>,
    /// Cleared when the user continues without a judge.
    pub judge_enabled: bool,
    transcript: Vec<Response>,
    timeline: Vec<TimelineEntry>,
    pub assessments: Vec<RoundAssessment>,
    verdict: Option<FinalVerdict>,
    /// Errors surfaced to the user.
    pub errors: Vec<DebateError>,
    pub context_warnings: Vec<RecordedWarning>,
    /// Decisions awaiting the user; the front one is asked first.
    pub pending_decisions: VecDeque<PendingDecision>,
    pub resume_point: ResumePoint,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Debate {
    /// Create a debate in `Configuring`.
    pub fn new(id: &str, setup: DebateSetup, default_max_rounds: u32) -> Self {
        Self {
            id: id.to_string(),
            topic: setup.topic,
            status: DebateStatus::Configuring,
            format: setup.format,
            mode: setup.mode,
            current_round: 0,
            round_limit: setup.round_limit,
            max_rounds: setup.max_rounds.unwrap_or(default_max_rounds),
            participants: setup
                .participants
                .into_iter()
                .enumerate()
                .map(|(i, spec)| Participant::from_spec(spec, i))
                .collect(),
            judge: setup.judge,
            judge_enabled: true,
            transcript: Vec::new(),
            timeline: Vec::new(),
            assessments: Vec::new(),
            verdict: None,
            errors: Vec::new(),
            context_warnings: Vec::new(),
            pending_decisions: VecDeque::new(),
            resume_point: ResumePoint::Fresh,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn status(&self) -> DebateStatus {
        self.status
    }

    pub fn current_round(&self) -> u32 {
        self.current_round
    }

    pub fn transcript(&self) -> &[Response] {
        &self.transcript
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    pub fn verdict(&self) -> Option<&FinalVerdict> {
        self.verdict.as_ref()
    }

    /// Check the setup a debate needs before it can run.
    pub fn validate_setup(&self) -> Result<(), String> {
        if self.topic.trim().is_empty() {
            return Err("topic is empty".to_string());
        }
        let count = self.participants.len();
        if !(MIN_PARTICIPANTS..=MAX_PARTICIPANTS).contains(&count) {
            return Err(format!(
                "need {MIN_PARTICIPANTS}-{MAX_PARTICIPANTS} participants, got {count}"
            ));
        }
        for (i, p) in self.participants.iter().enumerate() {
            if self.participants[..i].iter().any(|q| q.id == p.id) {
                return Err(format!("duplicate participant id {}", p.id));
            }
        }
        if self.judge.is_none() {
            return Err("no judge assigned".to_string());
        }
        if self.format == DebateFormat::RoundLimited && !self.round_limit.is_some_and(|l| l > 0) {
            return Err("round_limited format needs a positive round_limit".to_string());
        }
        if self.max_rounds == 0 {
            return Err("max_rounds must be positive".to_string());
        }
        Ok(())
    }

    /// Transition with a reason; records the timeline entry.
    ///
    /// The round advances only on `RoundComplete → AwaitingResponses`.
    pub fn transition(&mut self, to: DebateStatus, reason: &str) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
                reason: format!("not allowed ({reason})"),
            });
        }
        if self.status == DebateStatus::ROUND_COMPLETE && to == DebateStatus::AWAITING {
            self.current_round += 1;
        }
        if to == DebateStatus::Completed {
            self.completed_at = Some(Utc::now());
        }
        self.timeline.push(TimelineEntry {
            from: self.status,
            to,
            round: self.current_round,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.status = to;
        Ok(())
    }

    /// Fresh run: round 1 and zeroed counters. Resumed runs keep their round.
    pub fn begin_run(&mut self) {
        if self.resume_point == ResumePoint::Fresh {
            self.current_round = 1;
            for p in &mut self.participants {
                p.usage = TokenUsage::default();
            }
        }
    }

    /// Put every active participant back to idle for a new round.
    pub fn begin_round(&mut self) {
        for p in &mut self.participants {
            p.reset_for_round();
        }
    }

    /// The decision the user is asked for now.
    pub fn pending_decision(&self) -> Option<&PendingDecision> {
        self.pending_decisions.front()
    }

    pub fn has_pending(&self, kind: DecisionKind) -> bool {
        self.pending_decisions.iter().any(|d| d.kind == kind)
    }

    /// Queue a decision. Judge failures block the phase they happen in, so
    /// they are asked before anything already queued.
    pub fn raise_decision(&mut self, decision: PendingDecision) {
        if decision.kind.is_judge() {
            self.pending_decisions.push_front(decision);
        } else {
            self.pending_decisions.push_back(decision);
        }
    }

    /// Clear all run state (lifecycle reset). Participants and setup stay.
    pub fn clear_run_state(&mut self) {
        self.current_round = 0;
        self.transcript.clear();
        self.assessments.clear();
        self.verdict = None;
        self.errors.clear();
        self.context_warnings.clear();
        self.pending_decisions.clear();
        self.resume_point = ResumePoint::Fresh;
        self.judge_enabled = true;
        self.completed_at = None;
        for p in &mut self.participants {
            p.reset_all();
        }
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn participant_mut(&mut self, id: &str) -> Result<&mut Participant, ModelError> {
        self.participants
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ModelError::UnknownParticipant(id.to_string()))
    }

    pub fn active_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active_participants().count()
    }

    /// Turn the participant's buffer into a transcript response.
    pub fn finalize_response(
        &mut self,
        participant_id: &str,
        usage: TokenUsage,
    ) -> Result<&Response, ModelError> {
        let round = self.current_round;
        let index = self.transcript.len();
        let participant = self.participant_mut(participant_id)?;
        let content = participant
            .buffer
            .take()
            .ok_or_else(|| ModelError::NotStreaming(participant_id.to_string()))?;
        participant.status = ParticipantStatus::Complete;
        participant.usage.add(usage);
        participant.response_indices.push(index);
        let token_count = if usage.output_tokens > 0 {
            usage.output_tokens
        } else {
            // ~4 chars per token when the backend reports nothing
            (content.chars().count() as u64).div_ceil(4)
        };
        self.transcript.push(Response {
            participant_id: participant_id.to_string(),
            round,
            content,
            created_at: Utc::now(),
            token_count,
        });
        Ok(&self.transcript[index])
    }

    /// Record the final verdict (once).
    pub fn set_verdict(&mut self, verdict: FinalVerdict) -> Result<(), ModelError> {
        if self.verdict.is_some() {
            return Err(ModelError::VerdictAlreadySet);
        }
        self.verdict = Some(verdict);
        Ok(())
    }

    /// Responses of `round`, in transcript order.
    pub fn round_responses(&self, round: u32) -> impl Iterator<Item = &Response> {
        self.transcript.iter().filter(move |r| r.round == round)
    }

    /// Latest response of `participant_id` before `round`.
    pub fn previous_response(&self, participant_id: &str, round: u32) -> Option<&Response> {
        self.transcript
            .iter()
            .rev()
            .find(|r| r.participant_id == participant_id && r.round < round)
    }

    /// Transcript in the shape the context builder consumes.
    pub fn transcript_entries(&self) -> Vec<TranscriptEntry> {
        self.transcript
            .iter()
            .map(|r| TranscriptEntry {
                speaker: r.participant_id.clone(),
                round: r.round,
                content: r.content.clone(),
            })
            .collect()
    }

    /// Response in the shape the judge consumes.
    pub fn judged(&self, response: &Response) -> JudgedResponse {
        let position = self
            .participant(&response.participant_id)
            .map(|p| p.position_label().to_string())
            .unwrap_or_default();
        JudgedResponse {
            participant_id: response.participant_id.clone(),
            position,
            round: response.round,
            content: response.content.clone(),
        }
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        let limit = match self.round_limit {
            Some(limit) => limit.min(self.max_rounds),
            None => self.max_rounds,
        };
        format!(
            "[{}] round {}/{} | {} responses | {}/{} active | {} {} | debate={}",
            self.status,
            self.current_round,
            limit,
            self.transcript.len(),
            self.active_count(),
            self.participants.len(),
            self.format,
            self.mode,
            self.id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> DebateSetup {
        DebateSetup {
            topic: "Should cities ban cars?".into(),
            format: DebateFormat::RoundLimited,
            mode: DebateMode::Simultaneous,
            round_limit: Some(2),
            participants: vec![
                ParticipantSpec::new("mock", "m1").with_id("alpha"),
                ParticipantSpec::new("mock", "m2"),
            ],
            judge: Some(JudgeRef {
                id: "judge".into(),
                backend: "mock".into(),
                model: "j".into(),
            }),
            max_rounds: None,
        }
    }

    fn running_debate() -> Debate {
        let mut d = Debate::new("d-1", setup(), 10);
        for (to, why) in [
            (DebateStatus::Validating, "start"),
            (DebateStatus::Ready, "valid"),
            (DebateStatus::Initializing, "init"),
        ] {
            d.transition(to, why).unwrap();
        }
        d.begin_run();
        d.transition(DebateStatus::AWAITING, "round 1").unwrap();
        d
    }

    #[test]
    fn test_generated_participant_ids() {
        let d = Debate::new("d-1", setup(), 10);
        assert_eq!(d.participants[0].id, "alpha");
        assert_eq!(d.participants[1].id, "p2");
        assert_eq!(d.max_rounds, 10);
    }

    #[test]
    fn test_round_advances_only_leaving_round_complete() {
        let mut d = running_debate();
        assert_eq!(d.current_round(), 1);
        d.transition(DebateStatus::JUDGING, "judge").unwrap();
        assert_eq!(d.current_round(), 1);
        d.transition(DebateStatus::ROUND_COMPLETE, "assessed").unwrap();
        assert_eq!(d.current_round(), 1);
        d.transition(DebateStatus::AWAITING, "next").unwrap();
        assert_eq!(d.current_round(), 2);
        assert_eq!(d.timeline().last().unwrap().round, 2);
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut d = Debate::new("d-1", setup(), 10);
        let err = d.transition(DebateStatus::Completed, "skip").unwrap_err();
        assert_eq!(err.from, DebateStatus::Configuring);
        assert_eq!(d.status(), DebateStatus::Configuring);
        assert!(d.timeline().is_empty());
    }

    #[test]
    fn test_buffer_present_iff_streaming() {
        let mut d = running_debate();
        let p = &mut d.participants[0];
        assert!(p.buffer().is_none());
        assert!(!p.push_chunk("lost"));
        p.begin_stream();
        assert_eq!(p.status(), ParticipantStatus::Streaming);
        assert!(p.push_chunk("Hello"));
        assert_eq!(p.buffer(), Some("Hello"));
        p.reset_buffer();
        assert_eq!(p.buffer(), Some(""));
        p.mark_error(DebateError::new(ErrorKind::Timeout, "slow"));
        assert!(p.buffer().is_none());
        assert!(p.is_active());
    }

    #[test]
    fn test_finalize_appends_with_current_round() {
        let mut d = running_debate();
        d.participant_mut("alpha").unwrap().begin_stream();
        d.participant_mut("alpha").unwrap().push_chunk("Cars out.");
        let usage = TokenUsage {
            input_tokens: 50,
            output_tokens: 3,
        };
        let response = d.finalize_response("alpha", usage).unwrap().clone();
        assert_eq!(response.round, 1);
        assert_eq!(response.content, "Cars out.");
        assert_eq!(response.token_count, 3);
        let p = d.participant("alpha").unwrap();
        assert_eq!(p.status(), ParticipantStatus::Complete);
        assert!(p.buffer().is_none());
        assert_eq!(p.response_indices, vec![0]);
        assert_eq!(p.usage.total(), 53);
    }

    #[test]
    fn test_finalize_requires_streaming() {
        let mut d = running_debate();
        let err = d
            .finalize_response("alpha", TokenUsage::default())
            .unwrap_err();
        assert_eq!(err, ModelError::NotStreaming("alpha".into()));
        assert!(d.transcript().is_empty());
    }

    #[test]
    fn test_verdict_set_once() {
        let mut d = running_debate();
        let verdict = crate::judge::heuristics::local_verdict("t", &[], &[]);
        d.set_verdict(verdict.clone()).unwrap();
        assert_eq!(d.set_verdict(verdict), Err(ModelError::VerdictAlreadySet));
    }

    #[test]
    fn test_failed_participant_stays_failed() {
        let mut d = running_debate();
        d.participants[1].mark_failed(DebateError::new(ErrorKind::Authentication, "401"));
        d.participants[1].reset_for_round();
        assert_eq!(d.participants[1].status(), ParticipantStatus::Failed);
        assert_eq!(d.active_count(), 1);
        assert_eq!(
            d.participants[1].round_error_kind(),
            Some(ErrorKind::Authentication)
        );
    }

    #[test]
    fn test_judge_decisions_jump_the_queue() {
        let mut d = running_debate();
        d.raise_decision(PendingDecision {
            kind: DecisionKind::ContextOverflow,
            options: DecisionOption::context_overflow(),
            reason: "alpha is full".into(),
            participant_id: Some("alpha".into()),
        });
        d.raise_decision(PendingDecision {
            kind: DecisionKind::JudgeFailure,
            options: vec![DecisionOption::ContinueWithoutJudge],
            reason: "judge failed".into(),
            participant_id: None,
        });
        assert_eq!(d.pending_decisions.len(), 2);
        assert_eq!(
            d.pending_decision().map(|p| p.kind),
            Some(DecisionKind::JudgeFailure)
        );
        assert!(d.has_pending(DecisionKind::ContextOverflow));

        d.pending_decisions.pop_front();
        assert_eq!(
            d.pending_decision().map(|p| p.kind),
            Some(DecisionKind::ContextOverflow)
        );
        assert!(!d.has_pending(DecisionKind::JudgeFailure));
    }

    #[test]
    fn test_clear_run_state() {
        let mut d = running_debate();
        d.participant_mut("alpha").unwrap().begin_stream();
        d.finalize_response("alpha", TokenUsage::default()).unwrap();
        d.clear_run_state();
        assert_eq!(d.current_round(), 0);
        assert!(d.transcript().is_empty());
        assert!(d.participants[0].response_indices.is_empty());
    }

    #[test]
    fn test_validate_setup() {
        assert_eq!(Debate::new("d", setup(), 10).validate_setup(), Ok(()));

        let mut no_judge = setup();
        no_judge.judge = None;
        assert!(Debate::new("d", no_judge, 10)
            .validate_setup()
            .unwrap_err()
            .contains("judge"));

        let mut lonely = setup();
        lonely.participants.truncate(1);
        assert!(Debate::new("d", lonely, 10).validate_setup().is_err());

        let mut blank = setup();
        blank.topic = "  ".into();
        assert!(Debate::new("d", blank, 10).validate_setup().is_err());

        let mut dup = setup();
        dup.participants[1].id = Some("alpha".into());
        assert!(Debate::new("d", dup, 10)
            .validate_setup()
            .unwrap_err()
            .contains("duplicate"));

        let mut unlimited = setup();
        unlimited.round_limit = None;
        assert!(Debate::new("d", unlimited, 10).validate_setup().is_err());
    }

    #[test]
    fn test_status_line() {
        let d = running_debate();
        let line = d.status_line();
        assert!(line.contains("[running:awaiting_responses]"));
        assert!(line.contains("round 1/2"));
        assert!(line.contains("2/2 active"));
        assert!(line.contains("debate=d-1"));
    }

    #[test]
    fn test_system_prompt_mentions_position() {
        let mut d = running_debate();
        d.participants[0].position = Some("Proponent".into());
        d.participants[0].persona = Some("You cite urban planning studies.".into());
        let prompt = d.participants[0].system_prompt(&d.topic);
        assert!(prompt.contains("Proponent"));
        assert!(prompt.contains("urban planning"));
    }
}
