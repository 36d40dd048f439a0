//! Scripted collaborators shared by the lifecycle integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::Instant;

use coordination::config::EngineConfig;
use coordination::debate::{
    DebateFormat, DebateMode, DebateRegistry, DebateSetup, JudgeFactory, JudgeRef, MemoryStore,
    ParticipantSpec,
};
use coordination::events::{DebateEvent, EventBusExt, EventFilter};
use coordination::gateway::{
    ErrorInfo, EventStream, ParticipantConfig, PromptContext, ProviderGateway, StreamEvent,
    TokenUsage,
};
use coordination::judge::{
    AssessmentRequest, ContinuationFlags, Evaluator, FinalVerdict, JudgeError,
    ParticipantAssessment, RoundAssessment, Strictness, VerdictRequest,
};
use coordination::recovery::ErrorKind;

// ── Gateway ────────────────────────────────────────────────────────

/// One step of a scripted stream.
#[derive(Debug, Clone)]
pub enum Step {
    Chunk(String),
    Delay(Duration),
    Complete,
    Fail(ErrorKind),
    /// Never yields again.
    Hang,
}

pub fn reply(text: &str) -> Vec<Step> {
    vec![Step::Chunk(text.to_string()), Step::Complete]
}

/// Gateway replaying per-participant scripts, one script per call.
///
/// Participants without a queued script get a short distinct reply.
#[derive(Default)]
pub struct ScriptedGateway {
    scripts: Mutex<HashMap<String, VecDeque<Vec<Step>>>>,
    fallback: Mutex<HashMap<String, Vec<Step>>>,
    starts: Mutex<Vec<(String, Instant)>>,
    prompts: Mutex<Vec<(String, PromptContext)>>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the script for the next call of `participant`.
    pub fn script(&self, participant: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(participant.to_string())
            .or_default()
            .push_back(steps);
    }

    /// Script used for every call of `participant` once its queue is empty.
    pub fn always(&self, participant: &str, steps: Vec<Step>) {
        self.fallback
            .lock()
            .unwrap()
            .insert(participant.to_string(), steps);
    }

    /// Stream start instants, in call order.
    pub fn starts(&self) -> Vec<(String, Instant)> {
        self.starts.lock().unwrap().clone()
    }

    pub fn calls_for(&self, participant: &str) -> usize {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == participant)
            .count()
    }

    pub fn prompts_for(&self, participant: &str) -> Vec<PromptContext> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == participant)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl ProviderGateway for ScriptedGateway {
    async fn start_stream(
        &self,
        config: &ParticipantConfig,
        prompt: PromptContext,
    ) -> Result<EventStream, ErrorInfo> {
        let pid = config.participant_id.clone();
        let round = prompt.round;
        let call = {
            let mut starts = self.starts.lock().unwrap();
            starts.push((pid.clone(), Instant::now()));
            starts.iter().filter(|(p, _)| *p == pid).count()
        };
        self.prompts.lock().unwrap().push((pid.clone(), prompt));

        let queued = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&pid)
            .and_then(|q| q.pop_front());
        let steps = queued
            .or_else(|| self.fallback.lock().unwrap().get(&pid).cloned())
            .unwrap_or_else(|| {
                reply(&format!(
                    "{pid} makes argument number {call} in round {round}. It differs from before."
                ))
            });

        let stream = futures::stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    Step::Delay(d) => tokio::time::sleep(d).await,
                    Step::Hang => std::future::pending::<()>().await,
                    Step::Chunk(text) => return Some((StreamEvent::Chunk(text), steps)),
                    Step::Complete => {
                        let usage = TokenUsage {
                            input_tokens: 40,
                            output_tokens: 12,
                        };
                        return Some((StreamEvent::Complete(usage), steps));
                    }
                    Step::Fail(kind) => {
                        let info = ErrorInfo::new(kind, format!("scripted {kind} failure"));
                        return Some((StreamEvent::Error(info), steps));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ── Evaluator ──────────────────────────────────────────────────────

/// Evaluator returning queued outcomes, then well-formed defaults.
#[derive(Default)]
pub struct ScriptedEvaluator {
    assessments: Mutex<VecDeque<Result<RoundAssessment, JudgeError>>>,
    verdicts: Mutex<VecDeque<Result<FinalVerdict, JudgeError>>>,
    strictness: Mutex<Vec<Strictness>>,
    assess_instants: Mutex<Vec<Instant>>,
    verdict_calls: Mutex<u32>,
}

impl ScriptedEvaluator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue_assessment(&self, outcome: Result<RoundAssessment, JudgeError>) {
        self.assessments.lock().unwrap().push_back(outcome);
    }

    pub fn queue_verdict(&self, outcome: Result<FinalVerdict, JudgeError>) {
        self.verdicts.lock().unwrap().push_back(outcome);
    }

    /// Strictness of every assessment call, in order.
    pub fn strictness_log(&self) -> Vec<Strictness> {
        self.strictness.lock().unwrap().clone()
    }

    pub fn assess_instants(&self) -> Vec<Instant> {
        self.assess_instants.lock().unwrap().clone()
    }

    pub fn assess_calls(&self) -> usize {
        self.strictness.lock().unwrap().len()
    }

    pub fn verdict_calls(&self) -> u32 {
        *self.verdict_calls.lock().unwrap()
    }
}

pub fn assessment(round: u32, participants: &[&str], should_continue: bool) -> RoundAssessment {
    RoundAssessment {
        round,
        should_continue,
        quality_score: 7.0,
        participants: participants
            .iter()
            .map(|p| ParticipantAssessment {
                participant_id: p.to_string(),
                score: 7.0,
                strengths: vec!["specific".to_string()],
                weaknesses: Vec::new(),
            })
            .collect(),
        flags: ContinuationFlags::default(),
        reasoning: "scripted".to_string(),
    }
}

pub fn verdict(summary: &str) -> FinalVerdict {
    FinalVerdict {
        summary: summary.to_string(),
        key_arguments: Vec::new(),
        agreements: Vec::new(),
        disagreements: Vec::new(),
        winner: None,
        winner_reasoning: None,
        overall_score: 7.0,
        insights: Vec::new(),
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn assess_round(
        &self,
        request: &AssessmentRequest,
        strictness: Strictness,
    ) -> Result<RoundAssessment, JudgeError> {
        self.strictness.lock().unwrap().push(strictness);
        self.assess_instants.lock().unwrap().push(Instant::now());
        let queued = self.assessments.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| {
            Ok(assessment(
                request.round,
                &request.participant_ids(),
                true,
            ))
        })
    }

    async fn final_verdict(
        &self,
        _request: &VerdictRequest,
        _strictness: Strictness,
    ) -> Result<FinalVerdict, JudgeError> {
        *self.verdict_calls.lock().unwrap() += 1;
        let queued = self.verdicts.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| Ok(verdict("scripted verdict")))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Judge factory resolving judge ids to scripted evaluators.
pub struct ScriptedJudges {
    judges: HashMap<String, Arc<ScriptedEvaluator>>,
}

impl ScriptedJudges {
    pub fn new(judges: &[(&str, Arc<ScriptedEvaluator>)]) -> Arc<Self> {
        Arc::new(Self {
            judges: judges
                .iter()
                .map(|(id, e)| (id.to_string(), e.clone()))
                .collect(),
        })
    }
}

impl JudgeFactory for ScriptedJudges {
    fn evaluator(&self, judge: &JudgeRef) -> Arc<dyn Evaluator> {
        match self.judges.get(&judge.id) {
            Some(e) => e.clone(),
            None => ScriptedEvaluator::new(),
        }
    }
}

// ── Fixtures ───────────────────────────────────────────────────────

pub fn judge_ref(id: &str) -> JudgeRef {
    JudgeRef {
        id: id.to_string(),
        backend: "judge-backend".to_string(),
        model: "judge-model".to_string(),
    }
}

/// Participants `ids`, each on its own backend, judged by `judge`.
pub fn setup(format: DebateFormat, mode: DebateMode, ids: &[&str]) -> DebateSetup {
    DebateSetup {
        topic: "Should remote work be the default?".to_string(),
        format,
        mode,
        round_limit: None,
        participants: ids
            .iter()
            .map(|id| ParticipantSpec::new(&format!("backend-{id}"), "model").with_id(id))
            .collect(),
        judge: Some(judge_ref("judge")),
        max_rounds: None,
    }
}

/// Short timeouts so failure paths resolve quickly under paused time.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.timeouts.call_ms = 5_000;
    config.timeouts.judge_ms = 5_000;
    config.timeouts.settle_ms = 10;
    config
}

pub struct Harness {
    pub registry: DebateRegistry,
    pub gateway: Arc<ScriptedGateway>,
    pub judge: Arc<ScriptedEvaluator>,
    pub store: Arc<MemoryStore>,
}

pub fn harness() -> Harness {
    harness_with(test_config(), &[])
}

/// Registry over a scripted gateway; `extra_judges` are reachable by id
/// besides the default `"judge"`.
pub fn harness_with(config: EngineConfig, extra_judges: &[(&str, Arc<ScriptedEvaluator>)]) -> Harness {
    let gateway = ScriptedGateway::new();
    let judge = ScriptedEvaluator::new();
    let store = Arc::new(MemoryStore::new());
    let mut judges = vec![("judge", judge.clone())];
    judges.extend(extra_judges.iter().cloned());
    let registry = DebateRegistry::builder(gateway.clone())
        .with_config(config)
        .with_store(store.clone())
        .with_judges(ScriptedJudges::new(&judges))
        .build()
        .unwrap();
    Harness {
        registry,
        gateway,
        judge,
        store,
    }
}

// ── Event capture ──────────────────────────────────────────────────

/// Collects every event of one debate in the background.
pub struct EventLog {
    events: Arc<Mutex<Vec<DebateEvent>>>,
}

impl EventLog {
    pub fn attach(harness: &Harness, debate_id: &str) -> Self {
        let mut rx = harness
            .registry
            .bus()
            .subscribe_filtered(EventFilter::new().debate(debate_id));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                sink.lock().unwrap().push(event);
            }
        });
        Self { events }
    }

    pub fn all(&self) -> Vec<DebateEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<DebateEvent> {
        self.all()
            .into_iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }
}

/// Let spawned tasks drain (paused clock advances instantly).
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
