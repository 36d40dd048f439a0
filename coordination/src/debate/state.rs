//! Debate state machine: lifecycle states and the transition table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sub-state of a running debate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Participants are producing this round's responses.
    AwaitingResponses,
    /// The evaluator is assessing the round.
    Judging,
    /// Assessment done; settling before the next round.
    RoundComplete,
}

impl std::fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingResponses => write!(f, "awaiting_responses"),
            Self::Judging => write!(f, "judging"),
            Self::RoundComplete => write!(f, "round_complete"),
        }
    }
}

/// Where an unrecoverable failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    Validating,
    Initializing,
    Running,
    Completing,
}

impl std::fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validating => write!(f, "validating"),
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Completing => write!(f, "completing"),
        }
    }
}

/// Lifecycle status of a debate.
///
/// ```text
/// Configuring → Validating → Ready → Initializing → Running{…} → Completing → Completed
///      ▲            │                     │          │    ▲           │
///      └────────────┘                     │          ▼    │           │
///                                         │        Paused             │
///                                         └──────▶ Error ◀────────────┘
///                                        (retry → Ready, reset → Configuring)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DebateStatus {
    Configuring,
    Validating,
    Ready,
    Initializing,
    Running { phase: RoundPhase },
    Paused { resume_to: RoundPhase },
    Completing,
    Completed,
    Error { origin: ErrorOrigin },
}

impl DebateStatus {
    pub const AWAITING: DebateStatus = DebateStatus::Running {
        phase: RoundPhase::AwaitingResponses,
    };
    pub const JUDGING: DebateStatus = DebateStatus::Running {
        phase: RoundPhase::Judging,
    };
    pub const ROUND_COMPLETE: DebateStatus = DebateStatus::Running {
        phase: RoundPhase::RoundComplete,
    };

    /// Whether this is the terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether the debate waits for a user command (terminal, paused or errored).
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error { .. } | Self::Paused { .. } | Self::Configuring | Self::Ready
        )
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Whether the transition table allows `self → to`.
    pub fn can_transition_to(self, to: DebateStatus) -> bool {
        use DebateStatus::*;
        use RoundPhase::*;
        match (self, to) {
            (Configuring, Validating) => true,
            (Validating, Ready | Configuring) => true,
            (Validating, Error { origin }) => origin == ErrorOrigin::Validating,
            (Ready, Initializing) => true,
            (Initializing, Running { phase }) => phase != RoundComplete,
            (Initializing, Completing) => true,
            (Initializing, Error { origin }) => origin == ErrorOrigin::Initializing,
            (Running { phase: from }, Running { phase: next }) => matches!(
                (from, next),
                (AwaitingResponses, Judging)
                    | (Judging, RoundComplete)
                    | (RoundComplete, AwaitingResponses)
            ),
            (Running { phase }, Paused { resume_to }) => phase == resume_to,
            (Running { .. }, Completing) => true,
            (Running { .. }, Error { origin }) => origin == ErrorOrigin::Running,
            (Paused { resume_to }, Running { phase }) => resume_to == phase,
            (Paused { .. }, Completing) => true,
            (Completing, Completed) => true,
            // a failed final verdict waits for a decision after the last round
            (Completing, Paused { resume_to }) => resume_to == RoundComplete,
            (Completing, Error { origin }) => origin == ErrorOrigin::Completing,
            (Error { .. }, Ready | Configuring) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for DebateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuring => write!(f, "configuring"),
            Self::Validating => write!(f, "validating"),
            Self::Ready => write!(f, "ready"),
            Self::Initializing => write!(f, "initializing"),
            Self::Running { phase } => write!(f, "running:{}", phase),
            Self::Paused { resume_to } => write!(f, "paused:{}", resume_to),
            Self::Completing => write!(f, "completing"),
            Self::Completed => write!(f, "completed"),
            Self::Error { origin } => write!(f, "error:{}", origin),
        }
    }
}

/// A lifecycle transition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Previous status.
    pub from: DebateStatus,
    /// New status.
    pub to: DebateStatus,
    /// Round after the transition.
    pub round: u32,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Reason for the transition.
    pub reason: String,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: DebateStatus,
    pub to: DebateStatus,
    pub reason: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} → {}: {}",
            self.from, self.to, self.reason
        )
    }
}

impl std::error::Error for TransitionError {}
