//! Debate lifecycle: model, state machine, round execution, and the
//! coordinator that owns each debate.
//!
//! # Lifecycle
//!
//! ```text
//! Configuring → Validating → Ready → Initializing → Running ─┐
//!      ▲            │                     │     ┌────────────┘
//!      └────────────┘ (invalid)           │     │  AwaitingResponses → Judging → RoundComplete
//!                                         │     │         ▲                          │
//!                                         │     │         └──────────────────────────┘
//!                                         │     ├─ pause ⇄ Paused
//!                                         │     └─ stop / stopping rule → Completing → Completed
//!                                         └─ failure → Error → Ready (retry) | Configuring (reset)
//! ```
//!
//! Each debate is owned by one coordinator task. Everything outside it talks
//! to the debate through a [`DebateHandle`].

pub mod coordinator;
mod executor;
pub mod model;
pub mod persistence;
pub mod persona;
pub mod policy;
pub mod registry;
pub mod state;

pub use coordinator::{Decision, DebateHandle, EngineError};
pub use model::{
    Debate, DebateFormat, DebateMode, DebateSetup, DecisionKind, JudgeRef, ModelError,
    Participant, ParticipantSpec, ParticipantStatus, PendingDecision, RecordedWarning, Response,
    ResumePoint, MAX_PARTICIPANTS, MIN_PARTICIPANTS,
};
pub use persistence::{DebateSnapshot, DebateStore, JsonFileStore, MemoryStore, StoreError};
pub use persona::{GatewayPersonas, PersonaAssignment, PersonaStrategy, StandardPositions};
pub use policy::{can_continue, should_end_debate, ContinueBlocker};
pub use registry::{DebateRegistry, GatewayJudges, JudgeFactory, RegistryBuilder};
pub use state::{DebateStatus, ErrorOrigin, RoundPhase, TimelineEntry, TransitionError};
