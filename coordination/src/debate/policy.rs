//! Stopping and continuation policy.

use super::model::{Debate, DebateFormat, DecisionKind, ParticipantStatus, MIN_PARTICIPANTS};
use crate::judge::RoundAssessment;
use crate::recovery::ErrorKind;

/// Whether the assessed round ends the debate.
pub fn should_end_debate(assessment: &RoundAssessment, debate: &Debate) -> bool {
    let round = debate.current_round();
    if round >= debate.max_rounds {
        return true;
    }
    match debate.format {
        DebateFormat::RoundLimited => debate.round_limit.is_some_and(|limit| round >= limit),
        DebateFormat::ConvergenceSeeking => {
            assessment.flags.convergence_reached || assessment.flags.diminishing_returns
        }
        DebateFormat::FreeForm | DebateFormat::StructuredRounds => !assessment.should_continue,
    }
}

/// Why the next round cannot start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinueBlocker {
    /// A context overflow awaits a user decision.
    UnresolvedOverflow,
    /// Fewer than two participants remain active.
    TooFewActive { active: usize },
    /// Every active participant hit its rate limit.
    AllRateLimited,
}

impl std::fmt::Display for ContinueBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnresolvedOverflow => write!(f, "context overflow awaits a decision"),
            Self::TooFewActive { active } => {
                write!(f, "only {} active participant(s) remain", active)
            }
            Self::AllRateLimited => write!(f, "all active participants are rate-limited"),
        }
    }
}

/// Check whether another round may start.
pub fn can_continue(debate: &Debate) -> Result<(), ContinueBlocker> {
    if debate.has_pending(DecisionKind::ContextOverflow) {
        return Err(ContinueBlocker::UnresolvedOverflow);
    }
    let active = debate.active_count();
    if active < MIN_PARTICIPANTS {
        return Err(ContinueBlocker::TooFewActive { active });
    }
    let all_rate_limited = debate.active_participants().all(|p| {
        p.status() == ParticipantStatus::Error && p.round_error_kind() == Some(ErrorKind::RateLimit)
    });
    if all_rate_limited {
        return Err(ContinueBlocker::AllRateLimited);
    }
    Ok(())
}
