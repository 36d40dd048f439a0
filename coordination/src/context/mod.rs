//! Context management: token budgeting, transcript summarization, and the
//! per-participant context builder.

pub mod budget;
pub mod builder;
pub mod summarizer;

pub use budget::{
    CharCountEstimator, ContextBudget, EstimatorKind, TokenEstimator, WordCountEstimator,
    MESSAGE_OVERHEAD_TOKENS,
};
pub use builder::{
    AppliedStrategy, BuiltContext, ContextBuilder, ContextConfig, ContextError, ContextRequest,
    ContextStrategy, ContextUsage, ContextWarning, TranscriptEntry, WarningLevel,
};
pub use summarizer::{
    ExtractiveSummarizer, GatewaySummarizer, SummarizerModel, SummaryInputEntry, SummaryRequest,
    Summarizer,
};
