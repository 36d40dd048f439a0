//! Plain-text rendering of debate events.

use coordination::events::{DebateEvent, NotificationLevel};
use coordination::judge::FinalVerdict;

/// Turns events into terminal text.
///
/// Chunks from one participant are appended to the same line until another
/// speaker (or any other event) interrupts it.
#[derive(Debug, Default)]
pub struct Renderer {
    speaking: Option<(String, u32)>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, event: &DebateEvent) -> Option<String> {
        match event {
            DebateEvent::Chunk {
                participant_id,
                round,
                text,
                ..
            } => {
                let key = (participant_id.clone(), *round);
                if self.speaking.as_ref() == Some(&key) {
                    return Some(text.clone());
                }
                let prefix = self.break_line();
                self.speaking = Some(key);
                Some(format!("{prefix}[{participant_id} r{round}] {text}"))
            }
            DebateEvent::StatusChanged {
                to, round, reason, ..
            } => Some(self.line(format!("== {to} (round {round}): {reason}"))),
            DebateEvent::StreamRetrying {
                participant_id,
                attempt,
                delay_ms,
                error_kind,
                ..
            } => Some(self.line(format!(
                "!! {participant_id}: {error_kind}, retry {attempt} in {delay_ms}ms"
            ))),
            DebateEvent::ResponseFinalized { .. } => {
                let prefix = self.break_line();
                (!prefix.is_empty()).then_some(prefix)
            }
            DebateEvent::RoundAssessed { assessment, .. } => Some(self.line(format!(
                "-- round {} scored {:.1}: {}",
                assessment.round, assessment.quality_score, assessment.reasoning
            ))),
            DebateEvent::Notification {
                level,
                message,
                remedy,
                ..
            } => {
                let tag = match level {
                    NotificationLevel::Info => "info",
                    NotificationLevel::Warning => "warn",
                    NotificationLevel::Error => "error",
                };
                let text = match remedy {
                    Some(remedy) => format!("[{tag}] {message} ({remedy})"),
                    None => format!("[{tag}] {message}"),
                };
                Some(self.line(text))
            }
            DebateEvent::DecisionRequired {
                options, reason, ..
            } => {
                let options: Vec<String> = options.iter().map(|o| o.to_string()).collect();
                Some(self.line(format!(
                    "?? decision required: {reason} [{}]",
                    options.join(", ")
                )))
            }
            DebateEvent::VerdictReady { verdict, .. } => Some(self.line(verdict_text(verdict))),
            DebateEvent::StreamStarted { .. } => None,
        }
    }

    fn break_line(&mut self) -> String {
        match self.speaking.take() {
            Some(_) => "\n".to_string(),
            None => String::new(),
        }
    }

    fn line(&mut self, text: String) -> String {
        format!("{}{text}\n", self.break_line())
    }
}

fn verdict_text(verdict: &FinalVerdict) -> String {
    let mut out = format!("\n=== Verdict ===\n{}\n", verdict.summary);
    for args in &verdict.key_arguments {
        out.push_str(&format!("\n{}:\n", args.participant_id));
        for arg in &args.arguments {
            out.push_str(&format!("  - {arg}\n"));
        }
    }
    if !verdict.agreements.is_empty() {
        out.push_str(&format!("\nAgreements: {}\n", verdict.agreements.join("; ")));
    }
    if !verdict.disagreements.is_empty() {
        out.push_str(&format!(
            "Disagreements: {}\n",
            verdict.disagreements.join("; ")
        ));
    }
    match (&verdict.winner, &verdict.winner_reasoning) {
        (Some(winner), Some(why)) => out.push_str(&format!("Winner: {winner} ({why})\n")),
        (Some(winner), None) => out.push_str(&format!("Winner: {winner}\n")),
        _ => out.push_str("No clear winner\n"),
    }
    out.push_str(&format!("Overall score: {:.1}/10", verdict.overall_score));
    out
}
