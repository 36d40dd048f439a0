//! Event types pushed to the presentation layer.
//!
//! Events are one-way: the coordinator publishes, subscribers render. No
//! acknowledgment flows back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::debate::{DebateStatus, Response};
use crate::judge::{FinalVerdict, RoundAssessment};
use crate::recovery::{DecisionOption, ErrorKind};

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// All debate presentation events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebateEvent {
    /// Lifecycle transition.
    StatusChanged {
        debate_id: String,
        from: DebateStatus,
        to: DebateStatus,
        round: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A participant's gateway stream opened.
    StreamStarted {
        debate_id: String,
        participant_id: String,
        round: u32,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// Partial output; renderers append it to the participant's buffer.
    Chunk {
        debate_id: String,
        participant_id: String,
        round: u32,
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// The stream failed transiently; the buffer was discarded and the call
    /// will be retried.
    StreamRetrying {
        debate_id: String,
        participant_id: String,
        round: u32,
        attempt: u32,
        delay_ms: u64,
        error_kind: ErrorKind,
        timestamp: DateTime<Utc>,
    },

    /// A response entered the transcript.
    ResponseFinalized {
        debate_id: String,
        response: Response,
        timestamp: DateTime<Utc>,
    },

    /// The judge (or the heuristics) assessed a round.
    RoundAssessed {
        debate_id: String,
        assessment: RoundAssessment,
        timestamp: DateTime<Utc>,
    },

    /// Human-readable message, optionally with a remedy.
    Notification {
        debate_id: String,
        level: NotificationLevel,
        message: String,
        remedy: Option<String>,
        participant_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// The debate paused waiting for a user decision.
    DecisionRequired {
        debate_id: String,
        options: Vec<DecisionOption>,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The final verdict was produced.
    VerdictReady {
        debate_id: String,
        verdict: FinalVerdict,
        timestamp: DateTime<Utc>,
    },
}

impl DebateEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::StatusChanged { timestamp, .. }
            | Self::StreamStarted { timestamp, .. }
            | Self::Chunk { timestamp, .. }
            | Self::StreamRetrying { timestamp, .. }
            | Self::ResponseFinalized { timestamp, .. }
            | Self::RoundAssessed { timestamp, .. }
            | Self::Notification { timestamp, .. }
            | Self::DecisionRequired { timestamp, .. }
            | Self::VerdictReady { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::StreamStarted { .. } => "stream_started",
            Self::Chunk { .. } => "chunk",
            Self::StreamRetrying { .. } => "stream_retrying",
            Self::ResponseFinalized { .. } => "response_finalized",
            Self::RoundAssessed { .. } => "round_assessed",
            Self::Notification { .. } => "notification",
            Self::DecisionRequired { .. } => "decision_required",
            Self::VerdictReady { .. } => "verdict_ready",
        }
    }

    /// Debate the event belongs to
    pub fn debate_id(&self) -> &str {
        match self {
            Self::StatusChanged { debate_id, .. }
            | Self::StreamStarted { debate_id, .. }
            | Self::Chunk { debate_id, .. }
            | Self::StreamRetrying { debate_id, .. }
            | Self::ResponseFinalized { debate_id, .. }
            | Self::RoundAssessed { debate_id, .. }
            | Self::Notification { debate_id, .. }
            | Self::DecisionRequired { debate_id, .. }
            | Self::VerdictReady { debate_id, .. } => debate_id,
        }
    }

    /// Participant the event concerns, if any
    pub fn participant_id(&self) -> Option<&str> {
        match self {
            Self::StreamStarted { participant_id, .. }
            | Self::Chunk { participant_id, .. }
            | Self::StreamRetrying { participant_id, .. } => Some(participant_id),
            Self::ResponseFinalized { response, .. } => Some(&response.participant_id),
            Self::Notification { participant_id, .. } => participant_id.as_deref(),
            _ => None,
        }
    }
}
