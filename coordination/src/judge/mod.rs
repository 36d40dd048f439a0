//! Judge: structured round assessments, final verdicts, and stopping
//! criteria.

pub mod evaluator;
pub mod heuristics;
pub mod prompts;
pub mod schema;

pub use evaluator::{
    call_with_recovery, AssessmentRequest, Evaluator, GatewayEvaluator, JudgeError, JudgeFailure,
    JudgedResponse, Strictness, VerdictRequest,
};
pub use heuristics::{
    derive_signals, heuristic_assessment, local_verdict, merge_signals, HeuristicsConfig,
    LocalSignals, RoundText,
};
pub use schema::{
    ContinuationFlags, FinalVerdict, ParticipantArguments, ParticipantAssessment, RoundAssessment,
};
