//! Round executor: per-participant stream workers and the round barrier.
//!
//! ```text
//!   RoundRun::launch ──spawn──▶ worker × N (JoinSet)
//!        ▲                          │ breaker → limiter slot → gateway stream
//!        │                          │ pause gate between stream events
//!        └──── WorkerEvent (mpsc) ◀─┘ started | chunk | retrying | completed | failed
//! ```
//!
//! Workers never touch the [`Debate`]; the coordination task applies every
//! [`WorkerEvent`] through [`RoundRun::apply`]. In sequential mode the next
//! participant's context is built and its worker launched only after the
//! previous one reached a terminal outcome.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{
    Debate, DebateMode, DecisionKind, ParticipantStatus, PendingDecision, RecordedWarning,
};
use crate::context::{ContextBuilder, ContextRequest};
use crate::events::{DebateEvent, NotificationLevel, SharedEventBus};
use crate::gateway::{
    ErrorInfo, ParticipantConfig, PromptContext, ProviderGateway, StreamEvent, TokenUsage,
};
use crate::limiter::SharedRateLimiter;
use crate::recovery::{
    millis, DebateError, DecisionOption, ErrorKind, ErrorSource, RecoveryAction,
    RecoveryManager,
};

/// Channel capacity between workers and the coordination task.
const WORKER_CHANNEL_CAPACITY: usize = 256;

/// Message from a worker to the coordination task.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A gateway call went out (`attempt` is 1-indexed).
    Started { participant_id: String, attempt: u32 },
    Chunk { participant_id: String, text: String },
    /// The call failed transiently and will be retried after `delay`.
    Retrying {
        participant_id: String,
        attempt: u32,
        delay: Duration,
        error: DebateError,
    },
    Completed {
        participant_id: String,
        usage: TokenUsage,
    },
    /// Terminal failure after classification.
    Failed {
        participant_id: String,
        error: DebateError,
        action: RecoveryAction,
    },
}

impl WorkerEvent {
    pub fn participant_id(&self) -> &str {
        match self {
            Self::Started { participant_id, .. }
            | Self::Chunk { participant_id, .. }
            | Self::Retrying { participant_id, .. }
            | Self::Completed { participant_id, .. }
            | Self::Failed { participant_id, .. } => participant_id,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Collaborators shared by every worker of a debate.
#[derive(Clone)]
pub struct WorkerContext {
    pub debate_id: String,
    pub gateway: Arc<dyn ProviderGateway>,
    pub limiter: SharedRateLimiter,
    pub recovery: Arc<RecoveryManager>,
    /// Maximum duration of one gateway call (paused time excluded).
    pub call_timeout: Duration,
}

/// Everything one worker needs for one participant turn.
struct WorkerJob {
    config: ParticipantConfig,
    prompt: PromptContext,
}

enum CallOutcome {
    Completed(TokenUsage),
    Failed(ErrorInfo),
    Cancelled,
}

/// Wait while the pause gate is closed. Returns the time spent paused, or
/// `None` if the run was cancelled meanwhile.
async fn pass_gate(
    pause: &mut watch::Receiver<bool>,
    cancel: &CancellationToken,
) -> Option<Duration> {
    let started = Instant::now();
    loop {
        if !*pause.borrow_and_update() {
            return Some(started.elapsed());
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            changed = pause.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }
    }
}

/// Run one participant turn to a terminal outcome.
async fn run_worker(
    ctx: WorkerContext,
    job: WorkerJob,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
    mut pause: watch::Receiver<bool>,
) {
    let pid = job.config.participant_id.clone();
    let backend = job.config.backend.clone();
    let mut retries = 0u32;

    loop {
        if pass_gate(&mut pause, &cancel).await.is_none() {
            return;
        }

        let failure = match ctx.recovery.before_call(&backend).await {
            Err(wait) => ErrorInfo::new(
                ErrorKind::ApiError,
                format!("circuit open for backend {backend}"),
            )
            .with_retry_after(wait),
            Ok(()) => {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        ctx.recovery.abandon_call(&backend).await;
                        return;
                    }
                    permit = ctx.limiter.acquire(&backend) => permit,
                };
                let permit = match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        ctx.recovery.abandon_call(&backend).await;
                        let error = DebateError::new(ErrorKind::ApiError, e.to_string())
                            .for_participant(&pid);
                        let action = RecoveryAction::FailParticipant {
                            permanent: false,
                            remedy: error.remedy.clone(),
                        };
                        let _ = events
                            .send(WorkerEvent::Failed {
                                participant_id: pid,
                                error,
                                action,
                            })
                            .await;
                        return;
                    }
                };

                let attempt = retries + 1;
                if events
                    .send(WorkerEvent::Started {
                        participant_id: pid.clone(),
                        attempt,
                    })
                    .await
                    .is_err()
                {
                    ctx.recovery.abandon_call(&backend).await;
                    return;
                }

                let outcome = stream_once(&ctx, &job, &events, &cancel, &mut pause).await;
                drop(permit);

                match outcome {
                    CallOutcome::Completed(usage) => {
                        ctx.recovery.record_success(&backend).await;
                        let _ = events
                            .send(WorkerEvent::Completed {
                                participant_id: pid,
                                usage,
                            })
                            .await;
                        return;
                    }
                    CallOutcome::Cancelled => {
                        ctx.recovery.abandon_call(&backend).await;
                        return;
                    }
                    CallOutcome::Failed(info) => {
                        ctx.recovery.record_failure(&backend, info.kind).await;
                        info
                    }
                }
            }
        };

        let error = failure.into_debate_error(&pid, retries);
        match ctx.recovery.classify(&error, ErrorSource::Participant) {
            RecoveryAction::RetryAfter { delay, attempt } => {
                warn!(
                    debate_id = %ctx.debate_id,
                    participant = %pid,
                    error = %error,
                    attempt,
                    delay_ms = millis(delay),
                    "participant call failed, backing off"
                );
                if events
                    .send(WorkerEvent::Retrying {
                        participant_id: pid.clone(),
                        attempt,
                        delay,
                        error,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                retries += 1;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            action => {
                let _ = events
                    .send(WorkerEvent::Failed {
                        participant_id: pid,
                        error,
                        action,
                    })
                    .await;
                return;
            }
        }
    }
}

/// One gateway call: open the stream and relay it until a terminal event.
async fn stream_once(
    ctx: &WorkerContext,
    job: &WorkerJob,
    events: &mpsc::Sender<WorkerEvent>,
    cancel: &CancellationToken,
    pause: &mut watch::Receiver<bool>,
) -> CallOutcome {
    let pid = &job.config.participant_id;
    let timeout_error = || {
        ErrorInfo::new(
            ErrorKind::Timeout,
            format!("gateway call exceeded {}ms", ctx.call_timeout.as_millis()),
        )
    };
    let mut deadline = Instant::now() + ctx.call_timeout;

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return CallOutcome::Cancelled,
        opened = tokio::time::timeout_at(
            deadline,
            ctx.gateway.start_stream(&job.config, job.prompt.clone()),
        ) => opened,
    };
    let mut stream = match opened {
        Err(_) => return CallOutcome::Failed(timeout_error()),
        Ok(Err(info)) => return CallOutcome::Failed(info),
        Ok(Ok(stream)) => stream,
    };

    loop {
        match pass_gate(pause, cancel).await {
            None => return CallOutcome::Cancelled,
            Some(paused) => deadline += paused,
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return CallOutcome::Cancelled,
            changed = pause.changed() => {
                if changed.is_err() {
                    return CallOutcome::Cancelled;
                }
            }
            item = tokio::time::timeout_at(deadline, stream.next()) => match item {
                Err(_) => return CallOutcome::Failed(timeout_error()),
                Ok(None) => {
                    return CallOutcome::Failed(ErrorInfo::new(
                        ErrorKind::Network,
                        "stream ended without a completion event",
                    ))
                }
                Ok(Some(StreamEvent::Chunk(text))) => {
                    let sent = events
                        .send(WorkerEvent::Chunk {
                            participant_id: pid.clone(),
                            text,
                        })
                        .await;
                    if sent.is_err() {
                        return CallOutcome::Cancelled;
                    }
                }
                Ok(Some(StreamEvent::Complete(usage))) => return CallOutcome::Completed(usage),
                Ok(Some(StreamEvent::Error(info))) => return CallOutcome::Failed(info),
            },
        }
    }
}

/// Instruction appended to a participant's prompt.
fn turn_instruction(round: u32) -> String {
    if round <= 1 {
        "Present your opening argument on the topic.".to_string()
    } else {
        format!(
            "Round {round}: respond to the latest arguments from the other participants and \
             advance your position."
        )
    }
}

/// One round in flight.
pub struct RoundRun {
    mode: DebateMode,
    round: u32,
    /// Participants not launched yet, in list order.
    queue: VecDeque<String>,
    /// Launched and not yet terminal.
    outstanding: HashSet<String>,
    workers: JoinSet<()>,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,
    cancel: CancellationToken,
    pause: watch::Receiver<bool>,
}

impl RoundRun {
    /// Prepare the round for every active participant still idle in it.
    ///
    /// Participants that already completed this round (a re-entered round)
    /// are skipped.
    pub fn new(debate: &Debate, cancel: CancellationToken, pause: watch::Receiver<bool>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let queue = debate
            .participants
            .iter()
            .filter(|p| p.status() == ParticipantStatus::Idle)
            .map(|p| p.id.clone())
            .collect();
        Self {
            mode: debate.mode,
            round: debate.current_round(),
            queue,
            outstanding: HashSet::new(),
            workers: JoinSet::new(),
            events_tx,
            events_rx,
            cancel,
            pause,
        }
    }

    /// Every participant reached a terminal outcome.
    pub fn is_complete(&self) -> bool {
        self.queue.is_empty() && self.outstanding.is_empty()
    }

    /// Launch whatever the mode allows now.
    ///
    /// Simultaneous: build every context first, then spawn all workers
    /// back-to-back. Sequential: launch the next participant if none is in
    /// flight.
    pub async fn launch(
        &mut self,
        ctx: &WorkerContext,
        debate: &mut Debate,
        builder: &mut ContextBuilder,
        bus: &SharedEventBus,
    ) {
        match self.mode {
            DebateMode::Simultaneous => {
                let mut jobs = Vec::new();
                while let Some(pid) = self.queue.pop_front() {
                    if let Some(job) = prepare_job(debate, builder, bus, &pid).await {
                        jobs.push(job);
                    }
                }
                for job in jobs {
                    self.spawn(ctx, job);
                }
            }
            DebateMode::Sequential => {
                while self.outstanding.is_empty() {
                    let Some(pid) = self.queue.pop_front() else {
                        break;
                    };
                    if let Some(job) = prepare_job(debate, builder, bus, &pid).await {
                        self.spawn(ctx, job);
                    }
                }
            }
        }
    }

    fn spawn(&mut self, ctx: &WorkerContext, job: WorkerJob) {
        let pid = job.config.participant_id.clone();
        debug!(debate_id = %ctx.debate_id, participant = %pid, round = self.round, "launching worker");
        self.outstanding.insert(pid);
        self.workers.spawn(run_worker(
            ctx.clone(),
            job,
            self.events_tx.clone(),
            self.cancel.clone(),
            self.pause.clone(),
        ));
    }

    /// Next worker event. Cancel-safe.
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        self.events_rx.recv().await
    }

    /// Apply a worker event to the debate. The only place where a round's
    /// responses enter the transcript.
    pub fn apply(&mut self, debate: &mut Debate, bus: &SharedEventBus, event: WorkerEvent) {
        let debate_id = debate.id.clone();
        let round = debate.current_round();
        let terminal = event.is_terminal();
        let pid = event.participant_id().to_string();
        if !self.outstanding.contains(&pid) {
            debug!(debate_id = %debate_id, participant = %pid, "event for settled participant ignored");
            return;
        }
        let participant = match debate.participant_mut(&pid) {
            Ok(p) => p,
            Err(e) => {
                warn!(debate_id = %debate_id, error = %e, "worker event dropped");
                return;
            }
        };

        match event {
            WorkerEvent::Started {
                participant_id,
                attempt,
            } => {
                if participant.status() == ParticipantStatus::Streaming {
                    participant.reset_buffer();
                } else {
                    participant.begin_stream();
                }
                bus.publish(DebateEvent::StreamStarted {
                    debate_id,
                    participant_id,
                    round,
                    attempt,
                    timestamp: Utc::now(),
                });
            }
            WorkerEvent::Chunk {
                participant_id,
                text,
            } => {
                if participant.push_chunk(&text) {
                    bus.publish(DebateEvent::Chunk {
                        debate_id,
                        participant_id,
                        round,
                        text,
                        timestamp: Utc::now(),
                    });
                }
            }
            WorkerEvent::Retrying {
                participant_id,
                attempt,
                delay,
                error,
            } => {
                participant.retry_count += 1;
                participant.reset_buffer();
                bus.publish(DebateEvent::StreamRetrying {
                    debate_id,
                    participant_id,
                    round,
                    attempt,
                    delay_ms: millis(delay),
                    error_kind: error.kind,
                    timestamp: Utc::now(),
                });
            }
            WorkerEvent::Completed {
                participant_id,
                usage,
            } => match debate.finalize_response(&participant_id, usage) {
                Ok(response) => {
                    info!(
                        debate_id = %debate_id,
                        participant = %participant_id,
                        round,
                        tokens = response.token_count,
                        "response finalized"
                    );
                    let response = response.clone();
                    bus.publish(DebateEvent::ResponseFinalized {
                        debate_id,
                        response,
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => warn!(debate_id = %debate_id, error = %e, "finalize failed"),
            },
            WorkerEvent::Failed {
                participant_id,
                error,
                action,
            } => {
                fail_participant(debate, bus, &participant_id, error, action);
            }
        }

        if terminal {
            self.outstanding.remove(&pid);
        }
    }

    /// Cancel every worker and drop in-flight streams without finalizing.
    pub async fn abort(mut self, debate: &mut Debate) {
        self.cancel.cancel();
        self.workers.abort_all();
        while self.workers.join_next().await.is_some() {}
        for pid in self.outstanding.drain() {
            if let Ok(p) = debate.participant_mut(&pid) {
                p.abandon_stream();
            }
        }
    }

    /// Reap finished worker tasks.
    pub async fn finish(mut self) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "participant worker panicked");
            }
        }
    }
}

/// Build the participant's context and job. On context overflow the
/// participant is marked failed for the round and a decision is queued.
async fn prepare_job(
    debate: &mut Debate,
    builder: &mut ContextBuilder,
    bus: &SharedEventBus,
    pid: &str,
) -> Option<WorkerJob> {
    let participant = debate.participant(pid)?;
    let config = participant.gateway_config();
    let system_prompt = participant.system_prompt(&debate.topic);
    let instruction = turn_instruction(debate.current_round());
    let transcript = debate.transcript_entries();
    let request = ContextRequest {
        participant_id: pid,
        topic: &debate.topic,
        system_prompt: &system_prompt,
        instruction: &instruction,
        transcript: &transcript,
        round: debate.current_round(),
    };

    match builder.build(&request).await {
        Ok(built) => {
            if let Some(warning) = built.warning {
                bus.publish(DebateEvent::Notification {
                    debate_id: debate.id.clone(),
                    level: NotificationLevel::Warning,
                    message: warning.message.clone(),
                    remedy: None,
                    participant_id: Some(pid.to_string()),
                    timestamp: Utc::now(),
                });
                debate.context_warnings.push(RecordedWarning {
                    round: debate.current_round(),
                    participant_id: pid.to_string(),
                    warning,
                });
            }
            Some(WorkerJob {
                config,
                prompt: built.prompt,
            })
        }
        Err(e) => {
            let error = e.to_debate_error(pid);
            let action = RecoveryAction::UserChoice {
                options: DecisionOption::context_overflow(),
                reason: e.to_string(),
            };
            fail_participant(debate, bus, pid, error, action);
            None
        }
    }
}

/// Record a participant's terminal failure for the round.
fn fail_participant(
    debate: &mut Debate,
    bus: &SharedEventBus,
    pid: &str,
    error: DebateError,
    action: RecoveryAction,
) {
    let debate_id = debate.id.clone();
    let permanent = matches!(
        action,
        RecoveryAction::FailParticipant {
            permanent: true,
            ..
        }
    );
    if let RecoveryAction::UserChoice { options, reason } = &action {
        if error.kind == ErrorKind::ContextOverflow
            && !debate.has_pending(DecisionKind::ContextOverflow)
        {
            debate.raise_decision(PendingDecision {
                kind: DecisionKind::ContextOverflow,
                options: options.clone(),
                reason: reason.clone(),
                participant_id: Some(pid.to_string()),
            });
        }
    }
    warn!(
        debate_id = %debate_id,
        participant = %pid,
        kind = %error.kind,
        permanent,
        "participant failed: {}",
        error.message
    );
    bus.publish(DebateEvent::Notification {
        debate_id,
        level: NotificationLevel::Error,
        message: error.summary_line(),
        remedy: Some(error.remedy.clone()),
        participant_id: Some(pid.to_string()),
        timestamp: Utc::now(),
    });
    debate.errors.push(error.clone());
    if let Ok(p) = debate.participant_mut(pid) {
        if permanent {
            p.mark_failed(error);
        } else {
            p.mark_error(error);
        }
    }
}
