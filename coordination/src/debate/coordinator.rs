//! Lifecycle coordinator: the one task that owns a debate.
//!
//! Control operations arrive as [`Command`]s over an mpsc channel, each with
//! a oneshot acknowledgment. The current [`DebateStatus`] is published on a
//! watch channel and every transition is also broadcast as a
//! [`DebateEvent::StatusChanged`].
//!
//! Phases that await something (a round's join barrier, the judge, the
//! settle delay) keep serving commands: pause freezes the workers behind a
//! pause gate or drops the pending judge call, stop cancels everything and
//! routes to `Completing`.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::{RoundRun, WorkerContext};
use super::model::{Debate, DecisionKind, JudgeRef, PendingDecision, ResumePoint};
use super::persistence::DebateSnapshot;
use super::policy::{can_continue, should_end_debate, ContinueBlocker};
use super::registry::Services;
use super::state::{DebateStatus, ErrorOrigin, RoundPhase, TransitionError};
use crate::context::{ContextBuilder, ContextStrategy};
use crate::events::{
    DebateEvent, EventBusExt, EventFilter, FilteredReceiver, NotificationLevel,
};
use crate::judge::{
    call_with_recovery, derive_signals, heuristic_assessment, local_verdict, merge_signals,
    AssessmentRequest, Evaluator, FinalVerdict, JudgeFailure, RoundAssessment, RoundText,
    VerdictRequest,
};
use crate::recovery::{DebateError, DecisionOption, ErrorKind, RecoveryAction};

/// Capacity of a debate's command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Engine-level failures returned by control operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot {command} while {status}")]
    InvalidCommand {
        command: &'static str,
        status: DebateStatus,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no decision is pending")]
    NoPendingDecision,

    #[error("{0} is not an offered option")]
    DecisionNotOffered(DecisionOption),

    #[error("a decision is pending: {0}")]
    DecisionPending(String),

    #[error("debate {0} not found")]
    NotFound(String),

    #[error("debate {0} already exists")]
    AlreadyExists(String),

    #[error("coordinator for debate {0} has shut down")]
    Closed(String),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// User answer to a [`PendingDecision`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    SummarizeAndContinue,
    TruncateAndContinue,
    EndNow,
    SwapJudge(JudgeRef),
    ContinueWithoutJudge,
    EndDebate,
}

impl Decision {
    /// The option this decision answers.
    pub fn option(&self) -> DecisionOption {
        match self {
            Self::SummarizeAndContinue => DecisionOption::SummarizeAndContinue,
            Self::TruncateAndContinue => DecisionOption::TruncateAndContinue,
            Self::EndNow => DecisionOption::EndNow,
            Self::SwapJudge(_) => DecisionOption::SwapJudge,
            Self::ContinueWithoutJudge => DecisionOption::ContinueWithoutJudge,
            Self::EndDebate => DecisionOption::EndDebate,
        }
    }
}

type Ack = oneshot::Sender<Result<(), EngineError>>;

/// Control command for one debate.
enum Command {
    Start(Ack),
    Pause(Ack),
    Resume(Ack),
    Stop(Ack),
    Retry(Ack),
    Reset(Ack),
    Decide(Decision, Ack),
    SwapJudge(JudgeRef, Ack),
    Snapshot(oneshot::Sender<Debate>),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Pause(_) => "pause",
            Self::Resume(_) => "resume",
            Self::Stop(_) => "stop",
            Self::Retry(_) => "retry",
            Self::Reset(_) => "reset",
            Self::Decide(..) => "decide",
            Self::SwapJudge(..) => "swap judge",
            Self::Snapshot(_) => "snapshot",
        }
    }

    /// Answer with an error. Snapshots are always answerable, so they never
    /// reach this.
    fn reject(self, err: EngineError) {
        match self {
            Self::Start(ack)
            | Self::Pause(ack)
            | Self::Resume(ack)
            | Self::Stop(ack)
            | Self::Retry(ack)
            | Self::Reset(ack)
            | Self::Decide(_, ack)
            | Self::SwapJudge(_, ack) => {
                let _ = ack.send(Err(err));
            }
            Self::Snapshot(_) => {}
        }
    }
}

/// Cloneable handle to a running debate.
#[derive(Clone)]
pub struct DebateHandle {
    id: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<DebateStatus>,
    services: Arc<Services>,
}

impl DebateHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn request(&self, make: impl FnOnce(Ack) -> Command) -> Result<(), EngineError> {
        let (ack, reply) = oneshot::channel();
        self.commands
            .send(make(ack))
            .await
            .map_err(|_| EngineError::Closed(self.id.clone()))?;
        reply
            .await
            .map_err(|_| EngineError::Closed(self.id.clone()))?
    }

    /// Validate and run the debate (or resume it after `retry`).
    pub async fn start(&self) -> Result<(), EngineError> {
        self.request(Command::Start).await
    }

    /// Freeze in-flight work at the current sub-state.
    pub async fn pause(&self) -> Result<(), EngineError> {
        self.request(Command::Pause).await
    }

    /// Re-enter the sub-state the debate was paused in.
    pub async fn resume(&self) -> Result<(), EngineError> {
        self.request(Command::Resume).await
    }

    /// Cancel in-flight work and conclude the debate.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.request(Command::Stop).await
    }

    /// From `Error` back to `Ready`; the next `start` resumes where it failed.
    pub async fn retry(&self) -> Result<(), EngineError> {
        self.request(Command::Retry).await
    }

    /// From `Error` back to `Configuring`, clearing all run state.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.request(Command::Reset).await
    }

    /// Resolve the pending decision.
    pub async fn decide(&self, decision: Decision) -> Result<(), EngineError> {
        self.request(|ack| Command::Decide(decision, ack)).await
    }

    /// Replace the judge. Resolves a pending judge-failure decision.
    pub async fn swap_judge(&self, judge: JudgeRef) -> Result<(), EngineError> {
        self.request(|ack| Command::SwapJudge(judge, ack)).await
    }

    /// Copy of the debate as the coordinator currently sees it.
    pub async fn snapshot(&self) -> Result<Debate, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| EngineError::Closed(self.id.clone()))?;
        rx.await.map_err(|_| EngineError::Closed(self.id.clone()))
    }

    /// Latest published status.
    pub fn status(&self) -> DebateStatus {
        *self.status.borrow()
    }

    /// Status watch channel.
    pub fn watch_status(&self) -> watch::Receiver<DebateStatus> {
        self.status.clone()
    }

    /// Presentation events of this debate.
    pub fn subscribe(&self) -> FilteredReceiver {
        self.services
            .bus
            .subscribe_filtered(EventFilter::new().debate(&self.id))
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_until(
        &self,
        predicate: impl Fn(DebateStatus) -> bool,
    ) -> Result<DebateStatus, EngineError> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| predicate(*s))
            .await
            .map_err(|_| EngineError::Closed(self.id.clone()))?;
        Ok(*reached)
    }

    /// Wait for `Completed`.
    pub async fn wait_terminal(&self) -> Result<DebateStatus, EngineError> {
        self.wait_until(DebateStatus::is_terminal).await
    }

    /// Wait until the debate needs a command to move on.
    pub async fn wait_settled(&self) -> Result<DebateStatus, EngineError> {
        self.wait_until(DebateStatus::is_settled).await
    }
}

/// Next command; pends forever once every handle is gone so active phases
/// can run to completion.
async fn next_command(commands: &mut mpsc::Receiver<Command>) -> Command {
    match commands.recv().await {
        Some(command) => command,
        None => std::future::pending().await,
    }
}

/// What a command received mid-phase asks of the phase.
enum Interrupt {
    None,
    /// Now `Paused`; drop the phase's pending work.
    Paused,
    Stop(Ack),
}

/// Owner of one debate.
pub(crate) struct Coordinator {
    debate: Debate,
    services: Arc<Services>,
    commands: mpsc::Receiver<Command>,
    status_tx: watch::Sender<DebateStatus>,
    evaluator: Option<Arc<dyn Evaluator>>,
    builder: ContextBuilder,
    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
}

impl Coordinator {
    /// Spawn the coordination task and return its handle.
    pub(crate) fn spawn(debate: Debate, services: Arc<Services>) -> DebateHandle {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(debate.status());
        let (pause_tx, _) = watch::channel(false);
        let handle = DebateHandle {
            id: debate.id.clone(),
            commands: commands_tx,
            status: status_rx,
            services: services.clone(),
        };
        let builder = services.context_builder();
        let coordinator = Self {
            debate,
            services,
            commands,
            status_tx,
            evaluator: None,
            builder,
            cancel: CancellationToken::new(),
            pause_tx,
        };
        tokio::spawn(coordinator.run());
        handle
    }

    async fn run(mut self) {
        info!(debate_id = %self.debate.id, topic = %self.debate.topic, "coordinator started");
        loop {
            match self.debate.status() {
                DebateStatus::Initializing => self.initialize().await,
                DebateStatus::Running { phase } => match phase {
                    RoundPhase::AwaitingResponses => self.run_round().await,
                    RoundPhase::Judging => self.judge_round().await,
                    RoundPhase::RoundComplete => self.settle().await,
                },
                DebateStatus::Completing => self.complete().await,
                _ => match self.commands.recv().await {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }
        debug!(debate_id = %self.debate.id, status = %self.debate.status(), "coordinator stopped");
    }

    // ── State plumbing ─────────────────────────────────────────────────

    fn transition(&mut self, to: DebateStatus, reason: &str) -> Result<(), TransitionError> {
        let from = self.debate.status();
        self.debate.transition(to, reason)?;
        info!(
            debate_id = %self.debate.id,
            %from,
            %to,
            round = self.debate.current_round(),
            reason,
            "debate transition"
        );
        self.status_tx.send_replace(to);
        self.services.bus.publish(DebateEvent::StatusChanged {
            debate_id: self.debate.id.clone(),
            from,
            to,
            round: self.debate.current_round(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Transition the run loop relies on; a rejection is a coordinator bug
    /// and is logged.
    fn advance(&mut self, to: DebateStatus, reason: &str) {
        if let Err(e) = self.transition(to, reason) {
            error!(debate_id = %self.debate.id, error = %e, "transition rejected");
        }
    }

    fn notify(&self, level: NotificationLevel, message: String, remedy: Option<String>) {
        self.services.bus.publish(DebateEvent::Notification {
            debate_id: self.debate.id.clone(),
            level,
            message,
            remedy,
            participant_id: None,
            timestamp: Utc::now(),
        });
    }

    fn evaluator(&mut self) -> Option<Arc<dyn Evaluator>> {
        if self.evaluator.is_none() {
            if let Some(judge) = &self.debate.judge {
                self.evaluator = Some(self.services.judges.evaluator(judge));
            }
        }
        self.evaluator.clone()
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            debate_id: self.debate.id.clone(),
            gateway: self.services.gateway.clone(),
            limiter: self.services.limiter.clone(),
            recovery: self.services.recovery.clone(),
            call_timeout: self.services.config.timeouts.call(),
        }
    }

    /// Serve a command that arrived while a phase is in flight.
    ///
    /// `pausable` is the running sub-state, if pausing is allowed here.
    fn interrupt(&mut self, command: Command, pausable: Option<RoundPhase>) -> Interrupt {
        let status = self.debate.status();
        match command {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.debate.clone());
                Interrupt::None
            }
            Command::Pause(ack) => match pausable {
                Some(phase) if status.is_running() => {
                    let result = self
                        .transition(DebateStatus::Paused { resume_to: phase }, "paused by user")
                        .map_err(EngineError::from);
                    let paused = result.is_ok();
                    if paused {
                        self.pause_tx.send_replace(true);
                    }
                    let _ = ack.send(result);
                    if paused {
                        Interrupt::Paused
                    } else {
                        Interrupt::None
                    }
                }
                _ => {
                    let _ = ack.send(Err(EngineError::InvalidCommand {
                        command: "pause",
                        status,
                    }));
                    Interrupt::None
                }
            },
            Command::Stop(ack) if status.can_transition_to(DebateStatus::Completing) => {
                Interrupt::Stop(ack)
            }
            other => {
                let command = other.name();
                other.reject(EngineError::InvalidCommand { command, status });
                Interrupt::None
            }
        }
    }

    fn stop_now(&mut self, ack: Ack) {
        self.cancel.cancel();
        self.pause_tx.send_replace(false);
        let result = self
            .transition(DebateStatus::Completing, "stopped by user")
            .map_err(EngineError::from);
        let _ = ack.send(result);
    }

    // ── Idle commands ──────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) {
        let status = self.debate.status();
        match command {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.debate.clone());
            }
            Command::Start(ack) => {
                let _ = ack.send(self.start());
            }
            Command::Resume(ack) => {
                let _ = ack.send(self.resume());
            }
            Command::Stop(ack) if matches!(status, DebateStatus::Paused { .. }) => {
                if self.debate.has_pending(DecisionKind::VerdictFailure) {
                    // the judge already failed on the verdict; conclude locally
                    self.debate.judge_enabled = false;
                }
                self.debate.pending_decisions.clear();
                self.stop_now(ack);
            }
            Command::Retry(ack) if matches!(status, DebateStatus::Error { .. }) => {
                let result = self
                    .transition(DebateStatus::Ready, "retry requested")
                    .map_err(EngineError::from);
                let _ = ack.send(result);
            }
            Command::Reset(ack) if matches!(status, DebateStatus::Error { .. }) => {
                let result = self.reset();
                let _ = ack.send(result);
            }
            Command::Decide(decision, ack) => {
                let _ = ack.send(self.decide(decision));
            }
            Command::SwapJudge(judge, ack) => {
                let result = match self.debate.pending_decision() {
                    Some(p) if p.kind.is_judge() => self.decide(Decision::SwapJudge(judge)),
                    _ if status.is_terminal() => Err(EngineError::InvalidCommand {
                        command: "swap judge",
                        status,
                    }),
                    _ => {
                        self.install_judge(judge);
                        Ok(())
                    }
                };
                let _ = ack.send(result);
            }
            other => {
                let command = other.name();
                other.reject(EngineError::InvalidCommand { command, status });
            }
        }
    }

    fn start(&mut self) -> Result<(), EngineError> {
        match self.debate.status() {
            DebateStatus::Configuring => {
                self.transition(DebateStatus::Validating, "start requested")?;
                if let Err(detail) = self.debate.validate_setup() {
                    warn!(debate_id = %self.debate.id, %detail, "debate setup invalid");
                    self.debate
                        .errors
                        .push(DebateError::new(ErrorKind::Validation, detail.clone()));
                    self.notify(
                        NotificationLevel::Error,
                        format!("setup invalid: {detail}"),
                        Some(ErrorKind::Validation.suggested_action().to_string()),
                    );
                    self.transition(DebateStatus::Configuring, &detail)?;
                    return Err(EngineError::Validation(detail));
                }
                self.transition(DebateStatus::Ready, "setup valid")?;
                self.transition(DebateStatus::Initializing, "starting")?;
                Ok(())
            }
            DebateStatus::Ready => {
                self.transition(DebateStatus::Initializing, "resuming after retry")?;
                Ok(())
            }
            status => Err(EngineError::InvalidCommand {
                command: "start",
                status,
            }),
        }
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        let status = self.debate.status();
        let DebateStatus::Paused { resume_to } = status else {
            return Err(EngineError::InvalidCommand {
                command: "resume",
                status,
            });
        };
        if let Some(pending) = self.debate.pending_decision() {
            return Err(EngineError::DecisionPending(pending.reason.clone()));
        }
        self.pause_tx.send_replace(false);
        self.transition(DebateStatus::Running { phase: resume_to }, "resumed by user")?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        self.transition(DebateStatus::Configuring, "reset requested")?;
        self.debate.clear_run_state();
        self.builder = self.services.context_builder();
        self.evaluator = None;
        self.cancel = CancellationToken::new();
        self.pause_tx.send_replace(false);
        Ok(())
    }

    fn install_judge(&mut self, judge: JudgeRef) {
        info!(debate_id = %self.debate.id, judge = %judge.id, model = %judge.model, "judge installed");
        self.evaluator = Some(self.services.judges.evaluator(&judge));
        self.debate.judge = Some(judge);
        self.debate.judge_enabled = true;
    }

    fn decide(&mut self, decision: Decision) -> Result<(), EngineError> {
        let status = self.debate.status();
        let DebateStatus::Paused { resume_to } = status else {
            return Err(EngineError::NoPendingDecision);
        };
        let Some(pending) = self.debate.pending_decision().cloned() else {
            return Err(EngineError::NoPendingDecision);
        };
        let option = decision.option();
        if !pending.options.contains(&option) {
            return Err(EngineError::DecisionNotOffered(option));
        }
        info!(
            debate_id = %self.debate.id,
            decision = %option,
            kind = ?pending.kind,
            "decision received"
        );

        let mut end = false;
        match decision {
            Decision::SummarizeAndContinue => {
                self.builder.enable_summarization();
                self.builder.set_strategy(ContextStrategy::Summarize);
            }
            Decision::TruncateAndContinue => {
                self.builder.set_strategy(ContextStrategy::Truncate);
            }
            Decision::SwapJudge(judge) => self.install_judge(judge),
            Decision::ContinueWithoutJudge => self.debate.judge_enabled = false,
            Decision::EndNow => end = true,
            Decision::EndDebate => {
                // the judge just failed; conclude with a local verdict
                self.debate.judge_enabled = false;
                end = true;
            }
        }
        self.debate.pending_decisions.pop_front();
        if end {
            self.debate.pending_decisions.clear();
        }
        self.pause_tx.send_replace(false);
        let reason = format!("decision: {option}");
        // every answer to a failed verdict goes back to completion
        if end || pending.kind == DecisionKind::VerdictFailure {
            self.transition(DebateStatus::Completing, &reason)?;
        } else {
            self.transition(DebateStatus::Running { phase: resume_to }, &reason)?;
        }
        Ok(())
    }

    // ── Phases ─────────────────────────────────────────────────────────

    async fn initialize(&mut self) {
        self.cancel = CancellationToken::new();
        self.pause_tx.send_replace(false);
        if self.evaluator().is_none() {
            self.advance(
                DebateStatus::Error {
                    origin: ErrorOrigin::Initializing,
                },
                "no judge assigned",
            );
            return;
        }

        match self.debate.resume_point {
            ResumePoint::Fresh => {}
            ResumePoint::Round { phase } => {
                self.debate.resume_point = ResumePoint::Fresh;
                self.advance(DebateStatus::Running { phase }, "resuming after retry");
                return;
            }
            ResumePoint::Completing => {
                self.debate.resume_point = ResumePoint::Fresh;
                self.advance(DebateStatus::Completing, "resuming completion after retry");
                return;
            }
        }

        let missing = self
            .debate
            .participants
            .iter()
            .any(|p| p.position.is_none());
        if missing {
            let personas = self.services.personas.clone();
            let topic = self.debate.topic.clone();
            let count = self.debate.participants.len();
            let assign = async move { personas.assign(&topic, count).await };
            tokio::pin!(assign);
            let assigned = loop {
                tokio::select! {
                    assigned = &mut assign => break assigned,
                    command = next_command(&mut self.commands) => {
                        if let Interrupt::Stop(ack) = self.interrupt(command, None) {
                            self.stop_now(ack);
                            return;
                        }
                    }
                }
            };
            match assigned {
                Ok(assignments) => {
                    for (p, a) in self.debate.participants.iter_mut().zip(assignments) {
                        if p.position.is_none() {
                            p.position = Some(a.position);
                            if p.persona.is_none() {
                                p.persona = a.persona;
                            }
                        }
                    }
                    info!(
                        debate_id = %self.debate.id,
                        strategy = self.services.personas.name(),
                        "positions assigned"
                    );
                }
                Err(e) => {
                    warn!(debate_id = %self.debate.id, error = %e, "persona assignment failed");
                    self.notify(
                        NotificationLevel::Error,
                        e.summary_line(),
                        Some(e.remedy.clone()),
                    );
                    self.debate.errors.push(e);
                    self.advance(
                        DebateStatus::Error {
                            origin: ErrorOrigin::Initializing,
                        },
                        "persona assignment failed",
                    );
                    return;
                }
            }
        }

        self.debate.begin_run();
        self.debate.begin_round();
        self.advance(DebateStatus::AWAITING, "round 1");
    }

    async fn run_round(&mut self) {
        let ctx = self.worker_context();
        let bus = self.services.bus.clone();
        let mut run = RoundRun::new(
            &self.debate,
            self.cancel.child_token(),
            self.pause_tx.subscribe(),
        );
        run.launch(&ctx, &mut self.debate, &mut self.builder, &bus)
            .await;

        while !run.is_complete() {
            tokio::select! {
                event = run.recv() => {
                    let Some(event) = event else { break };
                    run.apply(&mut self.debate, &bus, event);
                    run.launch(&ctx, &mut self.debate, &mut self.builder, &bus).await;
                }
                command = next_command(&mut self.commands) => {
                    match self.round_command(command) {
                        Interrupt::Stop(ack) => {
                            run.abort(&mut self.debate).await;
                            self.stop_now(ack);
                            return;
                        }
                        Interrupt::Paused | Interrupt::None => {}
                    }
                }
            }
        }
        run.finish().await;

        if self.debate.status() == DebateStatus::AWAITING {
            let round = self.debate.current_round();
            let responses = self.debate.round_responses(round).count();
            self.advance(
                DebateStatus::JUDGING,
                &format!("round {round} joined with {responses} response(s)"),
            );
        }
        // Paused at the barrier: Resume re-enters with nothing left to launch.
    }

    /// Commands during a round; pause and resume flip the worker gate
    /// without leaving the round.
    fn round_command(&mut self, command: Command) -> Interrupt {
        match command {
            Command::Resume(ack) => {
                let _ = ack.send(self.resume());
                Interrupt::None
            }
            Command::Stop(ack) => Interrupt::Stop(ack),
            other => self.interrupt(other, Some(RoundPhase::AwaitingResponses)),
        }
    }

    async fn judge_round(&mut self) {
        let round = self.debate.current_round();
        let config = self.services.config.judge.clone();
        let prior_quality: Vec<f64> = self
            .debate
            .assessments
            .iter()
            .map(|a| a.quality_score)
            .collect();
        let responses: Vec<_> = self
            .debate
            .round_responses(round)
            .map(|r| self.debate.judged(r))
            .collect();

        let evaluator = if self.debate.judge_enabled {
            self.evaluator()
        } else {
            None
        };
        let judged = match evaluator {
            Some(evaluator) if !responses.is_empty() => {
                let request = AssessmentRequest {
                    topic: self.debate.topic.clone(),
                    round,
                    responses: responses.clone(),
                    previous_assessments: self.debate.assessments.clone(),
                };
                let outcome = self
                    .call_judge(Some(RoundPhase::Judging), move |strictness| {
                        let evaluator = evaluator.clone();
                        let request = request.clone();
                        async move { evaluator.assess_round(&request, strictness).await }
                    })
                    .await;
                match outcome {
                    None => return,
                    Some(Ok(assessment)) => Some(assessment),
                    Some(Err(failure)) => {
                        self.judge_failed(failure, DecisionKind::JudgeFailure);
                        return;
                    }
                }
            }
            _ => None,
        };

        let texts: Vec<RoundText<'_>> = responses
            .iter()
            .map(|r| RoundText {
                participant_id: &r.participant_id,
                current: &r.content,
                previous: self
                    .debate
                    .previous_response(&r.participant_id, round)
                    .map(|p| p.content.as_str()),
            })
            .collect();
        let assessment = match judged {
            Some(mut assessment) => {
                let mut history = prior_quality.clone();
                history.push(assessment.quality_score);
                let signals = derive_signals(&config, &texts, &history);
                merge_signals(&mut assessment, &signals);
                assessment
            }
            None => heuristic_assessment(&config, round, &texts, &prior_quality),
        };
        drop(texts);
        self.record_assessment(assessment);
    }

    fn record_assessment(&mut self, assessment: RoundAssessment) {
        let round = assessment.round;
        info!(
            debate_id = %self.debate.id,
            round,
            quality = assessment.quality_score,
            should_continue = assessment.should_continue,
            repetitive = assessment.flags.repetitive,
            diminishing = assessment.flags.diminishing_returns,
            converged = assessment.flags.convergence_reached,
            "round assessed"
        );
        let ends = should_end_debate(&assessment, &self.debate);
        self.debate.assessments.push(assessment.clone());
        self.services.bus.publish(DebateEvent::RoundAssessed {
            debate_id: self.debate.id.clone(),
            assessment,
            timestamp: Utc::now(),
        });
        info!(debate_id = %self.debate.id, "{}", self.debate.status_line());

        if ends {
            self.advance(
                DebateStatus::Completing,
                &format!("{} stopping rule met after round {round}", self.debate.format),
            );
        } else {
            self.advance(DebateStatus::ROUND_COMPLETE, &format!("round {round} assessed"));
        }
    }

    /// Run a judge operation through recovery while serving commands.
    ///
    /// `None` means the call was abandoned (paused or stopped).
    async fn call_judge<T, F, Fut>(
        &mut self,
        pausable: Option<RoundPhase>,
        call: F,
    ) -> Option<Result<T, JudgeFailure>>
    where
        F: FnMut(crate::judge::Strictness) -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::judge::JudgeError>>,
    {
        let recovery = self.services.recovery.clone();
        let timeout = self.services.config.timeouts.judge();
        let judged = call_with_recovery(&recovery, timeout, call);
        tokio::pin!(judged);
        loop {
            tokio::select! {
                outcome = &mut judged => return Some(outcome),
                command = next_command(&mut self.commands) => {
                    match self.interrupt(command, pausable) {
                        Interrupt::None => {}
                        Interrupt::Paused => return None,
                        Interrupt::Stop(ack) => {
                            self.stop_now(ack);
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Escalate a judge failure: a user decision when one is offered,
    /// otherwise an error the debate can be retried from.
    fn judge_failed(&mut self, failure: JudgeFailure, kind: DecisionKind) {
        let JudgeFailure { error, action } = failure;
        let (phase, origin, resume_point) = match kind {
            DecisionKind::VerdictFailure => (
                RoundPhase::RoundComplete,
                ErrorOrigin::Completing,
                ResumePoint::Completing,
            ),
            _ => (
                RoundPhase::Judging,
                ErrorOrigin::Running,
                ResumePoint::Round {
                    phase: RoundPhase::Judging,
                },
            ),
        };
        warn!(debate_id = %self.debate.id, error = %error, ?kind, ?action, "judge failed");
        self.debate.errors.push(error.clone());
        match action {
            RecoveryAction::UserChoice { options, reason } => {
                self.debate.raise_decision(PendingDecision {
                    kind,
                    options: options.clone(),
                    reason: reason.clone(),
                    participant_id: None,
                });
                let why = match kind {
                    DecisionKind::VerdictFailure => "final verdict failed",
                    _ => "judge failure",
                };
                self.advance(DebateStatus::Paused { resume_to: phase }, why);
                self.notify(
                    NotificationLevel::Error,
                    error.summary_line(),
                    Some(error.remedy.clone()),
                );
                self.services.bus.publish(DebateEvent::DecisionRequired {
                    debate_id: self.debate.id.clone(),
                    options,
                    reason,
                    timestamp: Utc::now(),
                });
            }
            RecoveryAction::FailDebate { remedy } => {
                self.debate.resume_point = resume_point;
                self.advance(
                    DebateStatus::Error { origin },
                    &format!("judge failed: {}", error.message),
                );
                self.notify(NotificationLevel::Error, error.summary_line(), Some(remedy));
            }
            other => {
                // call_with_recovery only hands back terminal actions
                error!(debate_id = %self.debate.id, action = ?other, "unexpected judge recovery action");
                self.debate.resume_point = resume_point;
                self.advance(DebateStatus::Error { origin }, "judge failed");
            }
        }
    }

    async fn settle(&mut self) {
        let delay = tokio::time::sleep(self.services.config.timeouts.settle());
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                command = next_command(&mut self.commands) => {
                    match self.interrupt(command, Some(RoundPhase::RoundComplete)) {
                        Interrupt::None => {}
                        Interrupt::Paused => return,
                        Interrupt::Stop(ack) => {
                            self.stop_now(ack);
                            return;
                        }
                    }
                }
            }
        }

        match can_continue(&self.debate) {
            Ok(()) => {
                let next = self.debate.current_round() + 1;
                self.advance(DebateStatus::AWAITING, &format!("round {next}"));
                self.debate.begin_round();
            }
            Err(ContinueBlocker::UnresolvedOverflow) => {
                let Some(pending) = self.debate.pending_decision().cloned() else {
                    return;
                };
                self.advance(
                    DebateStatus::Paused {
                        resume_to: RoundPhase::RoundComplete,
                    },
                    "context overflow needs a decision",
                );
                self.notify(
                    NotificationLevel::Warning,
                    format!("context overflow: {}", pending.reason),
                    Some(ErrorKind::ContextOverflow.suggested_action().to_string()),
                );
                self.services.bus.publish(DebateEvent::DecisionRequired {
                    debate_id: self.debate.id.clone(),
                    options: pending.options,
                    reason: pending.reason,
                    timestamp: Utc::now(),
                });
            }
            Err(blocker) => {
                self.notify(NotificationLevel::Warning, blocker.to_string(), None);
                self.advance(DebateStatus::Completing, &blocker.to_string());
            }
        }
    }

    async fn complete(&mut self) {
        self.cancel.cancel();
        self.pause_tx.send_replace(false);

        if self.debate.verdict().is_none() {
            let verdict = match self.verdict().await {
                None => return,
                Some(Ok(verdict)) => verdict,
                Some(Err(failure)) => {
                    self.judge_failed(failure, DecisionKind::VerdictFailure);
                    return;
                }
            };
            if let Err(e) = self.debate.set_verdict(verdict.clone()) {
                warn!(debate_id = %self.debate.id, error = %e, "verdict not recorded");
            }
            self.services.bus.publish(DebateEvent::VerdictReady {
                debate_id: self.debate.id.clone(),
                verdict,
                timestamp: Utc::now(),
            });
        }

        self.advance(DebateStatus::Completed, "final verdict recorded");
        let snapshot = DebateSnapshot::new(&self.debate);
        match self.services.store.save(&snapshot).await {
            Ok(()) => info!(
                debate_id = %self.debate.id,
                store = self.services.store.name(),
                rounds = self.debate.current_round(),
                responses = self.debate.transcript().len(),
                "debate completed"
            ),
            Err(e) => {
                error!(debate_id = %self.debate.id, error = %e, "failed to persist debate");
                self.notify(
                    NotificationLevel::Error,
                    format!("failed to persist debate: {e}"),
                    None,
                );
            }
        }
    }

    /// Final verdict from the judge, or a local one when the debate runs
    /// without a judge.
    async fn verdict(&mut self) -> Option<Result<FinalVerdict, JudgeFailure>> {
        let evaluator = if self.debate.judge_enabled {
            self.evaluator()
        } else {
            None
        };
        match evaluator {
            Some(evaluator) if !self.debate.transcript().is_empty() => {
                let request = VerdictRequest {
                    topic: self.debate.topic.clone(),
                    transcript: self
                        .debate
                        .transcript()
                        .iter()
                        .map(|r| self.debate.judged(r))
                        .collect(),
                    assessments: self.debate.assessments.clone(),
                };
                self.call_judge(None, move |strictness| {
                    let evaluator = evaluator.clone();
                    let request = request.clone();
                    async move { evaluator.final_verdict(&request, strictness).await }
                })
                .await
            }
            _ => {
                let last: Vec<(&str, &str)> = self
                    .debate
                    .participants
                    .iter()
                    .filter_map(|p| {
                        p.response_indices
                            .last()
                            .and_then(|&i| self.debate.transcript().get(i))
                            .map(|r| (p.id.as_str(), r.content.as_str()))
                    })
                    .collect();
                Some(Ok(local_verdict(
                    &self.debate.topic,
                    &last,
                    &self.debate.assessments,
                )))
            }
        }
    }
}
