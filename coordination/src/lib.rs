//! Parley Coordination Library
//!
//! This library runs structured debates between AI models:
//! - Lifecycle coordination with a strict state machine, pause/resume and
//!   user decisions when recovery needs a human
//! - Parallel (or sequential) response streaming per round behind a
//!   provider gateway, with per-backend rate limiting
//! - Token-budgeted context building with truncation and summarization
//! - A judge that scores rounds, decides when to stop, and delivers a verdict
//!
//! # Features
//!
//! ## Formats
//! - `free_form`: runs until the judge stops it
//! - `structured_rounds`: like free-form, with per-round instructions
//! - `round_limited`: stops after a fixed number of rounds
//! - `convergence_seeking`: stops on convergence or diminishing returns
//!
//! ## Recovery
//! - Exponential backoff with jitter for transient provider errors
//! - Per-backend circuit breakers
//! - User decisions for context overflow and judge failures
//!
//! # Usage
//!
//! ```ignore
//! let registry = DebateRegistry::builder(gateway).build()?;
//! let debate = registry.create(setup).await?;
//! let mut events = debate.subscribe();
//! debate.start().await?;
//! debate.wait_terminal().await?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod context;
pub mod debate;
pub mod events;
pub mod gateway;
pub mod judge;
pub mod limiter;
pub mod recovery;

// Re-export configuration types
pub use config::{BreakerConfig, ConfigError, EngineConfig, TimeoutConfig};

// Re-export debate lifecycle types
pub use debate::{
    Debate, DebateFormat, DebateHandle, DebateMode, DebateRegistry, DebateSetup, DebateSnapshot,
    DebateStatus, DebateStore, Decision, EngineError, JsonFileStore, JudgeRef, MemoryStore,
    ParticipantSpec, RoundPhase,
};

// Re-export event types
pub use events::{DebateEvent, EventBus, EventFilter, NotificationLevel, SharedEventBus};

// Re-export gateway contract
pub use gateway::{
    ChatMessage, ErrorInfo, EventStream, ParticipantConfig, PromptContext, ProviderGateway,
    StreamEvent, TokenUsage,
};

// Re-export judge types
pub use judge::{Evaluator, FinalVerdict, RoundAssessment};

// Re-export recovery types
pub use recovery::{DebateError, DecisionOption, ErrorKind, RecoveryAction};
