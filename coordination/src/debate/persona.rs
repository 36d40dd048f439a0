//! Persona assignment strategies.
//!
//! Initialization calls a [`PersonaStrategy`] with the topic and participant
//! count and applies the returned positions to participants lacking one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gateway::{collect_text, ChatMessage, ParticipantConfig, PromptContext, ProviderGateway};
use crate::recovery::{DebateError, ErrorKind};

/// Position and optional persona for one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaAssignment {
    pub position: String,
    pub persona: Option<String>,
}

impl PersonaAssignment {
    pub fn new(position: &str, persona: Option<&str>) -> Self {
        Self {
            position: position.to_string(),
            persona: persona.map(str::to_string),
        }
    }
}

/// Assigns positions for a topic.
#[async_trait]
pub trait PersonaStrategy: Send + Sync {
    /// Return exactly `count` assignments, in participant order.
    async fn assign(&self, topic: &str, count: usize)
        -> Result<Vec<PersonaAssignment>, DebateError>;

    fn name(&self) -> &str;
}

const STANDARD: [(&str, &str); 4] = [
    (
        "Proponent",
        "Argue in favor of the proposition with concrete evidence.",
    ),
    (
        "Opponent",
        "Argue against the proposition and expose its costs.",
    ),
    (
        "Skeptic",
        "Question the assumptions both sides rely on.",
    ),
    (
        "Pragmatist",
        "Look for workable middle ground and implementation details.",
    ),
];

/// Fixed positions: proponent, opponent, skeptic, pragmatist.
#[derive(Debug, Clone, Default)]
pub struct StandardPositions;

#[async_trait]
impl PersonaStrategy for StandardPositions {
    async fn assign(
        &self,
        _topic: &str,
        count: usize,
    ) -> Result<Vec<PersonaAssignment>, DebateError> {
        if count > STANDARD.len() {
            return Err(DebateError::new(
                ErrorKind::Validation,
                format!("no standard positions for {count} participants"),
            ));
        }
        Ok(STANDARD
            .iter()
            .take(count)
            .map(|(position, persona)| PersonaAssignment::new(position, Some(persona)))
            .collect())
    }

    fn name(&self) -> &str {
        "standard"
    }
}

/// Asks a backend for one position per line.
pub struct GatewayPersonas {
    gateway: Arc<dyn ProviderGateway>,
    config: ParticipantConfig,
}

impl GatewayPersonas {
    pub fn new(gateway: Arc<dyn ProviderGateway>, config: ParticipantConfig) -> Self {
        Self { gateway, config }
    }
}

#[async_trait]
impl PersonaStrategy for GatewayPersonas {
    async fn assign(
        &self,
        topic: &str,
        count: usize,
    ) -> Result<Vec<PersonaAssignment>, DebateError> {
        let prompt = PromptContext {
            messages: vec![
                ChatMessage::system(
                    "You design debates. Reply with one line per position, formatted \
                     `Position: one-sentence persona`. No other text.",
                ),
                ChatMessage::user(format!(
                    "Propose {count} distinct positions for a debate on: {topic}"
                )),
            ],
            round: 0,
        };
        let pid = self.config.participant_id.as_str();
        let stream = self
            .gateway
            .start_stream(&self.config, prompt)
            .await
            .map_err(|e| e.into_debate_error(pid, 0))?;
        let (text, _) = collect_text(stream)
            .await
            .map_err(|e| e.into_debate_error(pid, 0))?;

        let assignments = parse_position_lines(&text);
        if assignments.len() < count {
            return Err(DebateError::new(
                ErrorKind::InvalidResponse,
                format!(
                    "persona reply had {} position(s), need {count}",
                    assignments.len()
                ),
            )
            .for_participant(pid));
        }
        Ok(assignments.into_iter().take(count).collect())
    }

    fn name(&self) -> &str {
        "gateway"
    }
}

/// Parse `Position: persona` lines; list markers are stripped.
fn parse_position_lines(text: &str) -> Vec<PersonaAssignment> {
    text.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c == '-' || c == '*' || c.is_ascii_digit() || c == '.')
                .trim()
        })
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(':') {
            Some((position, persona)) if !persona.trim().is_empty() => {
                PersonaAssignment::new(position.trim(), Some(persona.trim()))
            }
            Some((position, _)) => PersonaAssignment::new(position.trim(), None),
            None => PersonaAssignment::new(line, None),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ErrorInfo, EventStream, StreamEvent, TokenUsage};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_standard_positions() {
        let assigned = StandardPositions.assign("topic", 3).await.unwrap();
        let positions: Vec<&str> = assigned.iter().map(|a| a.position.as_str()).collect();
        assert_eq!(positions, vec!["Proponent", "Opponent", "Skeptic"]);
        assert!(assigned[0].persona.is_some());
    }

    #[tokio::test]
    async fn test_standard_positions_too_many() {
        let err = StandardPositions.assign("topic", 5).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_parse_position_lines() {
        let parsed = parse_position_lines(
            "1. Economist: weighs costs\n- Urbanist: cares about density\n\nResident\n",
        );
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], PersonaAssignment::new("Economist", Some("weighs costs")));
        assert_eq!(parsed[1].position, "Urbanist");
        assert_eq!(parsed[2], PersonaAssignment::new("Resident", None));
    }

    struct OneReply(&'static str);

    #[async_trait]
    impl ProviderGateway for OneReply {
        async fn start_stream(
            &self,
            _config: &ParticipantConfig,
            _prompt: PromptContext,
        ) -> Result<EventStream, ErrorInfo> {
            Ok(futures::stream::iter(vec![
                StreamEvent::Chunk(self.0.to_string()),
                StreamEvent::Complete(TokenUsage::default()),
            ])
            .boxed())
        }
    }

    fn config() -> ParticipantConfig {
        ParticipantConfig {
            participant_id: "personas".into(),
            backend: "mock".into(),
            model: "m".into(),
            max_output_tokens: 200,
            temperature: 0.5,
        }
    }

    #[tokio::test]
    async fn test_gateway_personas() {
        let strategy = GatewayPersonas::new(Arc::new(OneReply("A: one\nB: two\nC: three")), config());
        let assigned = strategy.assign("topic", 2).await.unwrap();
        assert_eq!(assigned.len(), 2);
        assert_eq!(assigned[1].position, "B");
    }

    #[tokio::test]
    async fn test_gateway_personas_short_reply() {
        let strategy = GatewayPersonas::new(Arc::new(OneReply("Only: one")), config());
        let err = strategy.assign("topic", 2).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidResponse);
    }
}
