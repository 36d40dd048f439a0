//! Structured judge outputs and their validation.
//!
//! Both outputs are requested as JSON matching a `schemars`-generated
//! schema, then parsed and checked here. Anything that fails parsing or
//! validation is an `invalid_response`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Continuation flags raised by the judge (and by local heuristics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ContinuationFlags {
    #[schemars(description = "Participants are restating earlier arguments")]
    #[serde(default)]
    pub repetitive: bool,
    #[schemars(description = "The discussion has moved away from the topic")]
    #[serde(default)]
    pub drifting: bool,
    #[schemars(description = "Quality or novelty is declining round over round")]
    #[serde(default)]
    pub diminishing_returns: bool,
    #[schemars(description = "Participants have converged on a shared position")]
    #[serde(default)]
    pub convergence_reached: bool,
}

impl ContinuationFlags {
    /// Union of two flag sets.
    pub fn or(self, other: ContinuationFlags) -> Self {
        Self {
            repetitive: self.repetitive || other.repetitive,
            drifting: self.drifting || other.drifting,
            diminishing_returns: self.diminishing_returns || other.diminishing_returns,
            convergence_reached: self.convergence_reached || other.convergence_reached,
        }
    }
}

/// Judge's view of one participant in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParticipantAssessment {
    #[schemars(description = "Participant id exactly as given in the prompt")]
    pub participant_id: String,
    #[schemars(description = "Score from 0 to 10")]
    pub score: f64,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

/// Assessment of one completed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoundAssessment {
    #[schemars(description = "Round number being assessed")]
    pub round: u32,
    #[schemars(description = "Whether another round would add value")]
    pub should_continue: bool,
    #[schemars(description = "Overall quality of the round from 0 to 10")]
    pub quality_score: f64,
    pub participants: Vec<ParticipantAssessment>,
    pub flags: ContinuationFlags,
    #[schemars(description = "Short justification of the assessment")]
    pub reasoning: String,
}

impl RoundAssessment {
    /// Check ranges and participant ids.
    pub fn validate(&self, participant_ids: &[&str]) -> Result<(), String> {
        check_score("quality_score", self.quality_score)?;
        for p in &self.participants {
            if !participant_ids.contains(&p.participant_id.as_str()) {
                return Err(format!("unknown participant_id '{}'", p.participant_id));
            }
            check_score(&format!("score of {}", p.participant_id), p.score)?;
        }
        if self.reasoning.trim().is_empty() {
            return Err("reasoning is empty".to_string());
        }
        Ok(())
    }

    /// Score the judge gave `participant_id`, if any.
    pub fn score_for(&self, participant_id: &str) -> Option<f64> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
            .map(|p| p.score)
    }
}

/// Key arguments one participant made over the debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParticipantArguments {
    pub participant_id: String,
    pub arguments: Vec<String>,
}

/// Final verdict over the whole debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FinalVerdict {
    pub summary: String,
    pub key_arguments: Vec<ParticipantArguments>,
    #[serde(default)]
    pub agreements: Vec<String>,
    #[serde(default)]
    pub disagreements: Vec<String>,
    #[schemars(description = "Winning participant id, or null when there is no clear winner")]
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub winner_reasoning: Option<String>,
    #[schemars(description = "Overall debate quality from 0 to 10")]
    pub overall_score: f64,
    #[serde(default)]
    pub insights: Vec<String>,
}

impl FinalVerdict {
    pub fn validate(&self, participant_ids: &[&str]) -> Result<(), String> {
        if self.summary.trim().is_empty() {
            return Err("summary is empty".to_string());
        }
        check_score("overall_score", self.overall_score)?;
        for args in &self.key_arguments {
            if !participant_ids.contains(&args.participant_id.as_str()) {
                return Err(format!(
                    "unknown participant_id '{}' in key_arguments",
                    args.participant_id
                ));
            }
        }
        if let Some(winner) = &self.winner {
            if !participant_ids.contains(&winner.as_str()) {
                return Err(format!("winner '{winner}' is not a participant"));
            }
        }
        Ok(())
    }
}

fn check_score(label: &str, value: f64) -> Result<(), String> {
    if !(0.0..=10.0).contains(&value) {
        return Err(format!("{label} {value} outside 0..=10"));
    }
    Ok(())
}

/// Pretty JSON schema for `T`, embedded in judge prompts.
pub fn schema_json<T: JsonSchema>() -> String {
    let schema = schemars::schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// Locate the JSON object in a model reply (fenced block or outermost braces).
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let candidate = body[..end].trim();
            if candidate.starts_with('{') {
                return Some(candidate);
            }
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse and validate a round assessment reply.
pub fn parse_assessment(
    text: &str,
    round: u32,
    participant_ids: &[&str],
) -> Result<RoundAssessment, String> {
    let json = extract_json(text).ok_or_else(|| "no JSON object in judge reply".to_string())?;
    let mut assessment: RoundAssessment =
        serde_json::from_str(json).map_err(|e| format!("assessment does not match schema: {e}"))?;
    // The round is ours to decide.
    assessment.round = round;
    assessment.validate(participant_ids)?;
    Ok(assessment)
}

/// Parse and validate a final verdict reply.
pub fn parse_verdict(text: &str, participant_ids: &[&str]) -> Result<FinalVerdict, String> {
    let json = extract_json(text).ok_or_else(|| "no JSON object in judge reply".to_string())?;
    let verdict: FinalVerdict =
        serde_json::from_str(json).map_err(|e| format!("verdict does not match schema: {e}"))?;
    verdict.validate(participant_ids)?;
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDS: &[&str] = &["alpha", "beta"];

    fn assessment_json() -> &'static str {
        r#"{
            "round": 9,
            "should_continue": true,
            "quality_score": 7.5,
            "participants": [
                {"participant_id": "alpha", "score": 8, "strengths": ["data"], "weaknesses": []},
                {"participant_id": "beta", "score": 6.5, "strengths": [], "weaknesses": ["vague"]}
            ],
            "flags": {"repetitive": false, "drifting": false, "diminishing_returns": false, "convergence_reached": false},
            "reasoning": "Both sides engaged."
        }"#
    }

    #[test]
    fn test_parse_assessment_overrides_round() {
        let a = parse_assessment(assessment_json(), 2, IDS).unwrap();
        assert_eq!(a.round, 2);
        assert_eq!(a.score_for("beta"), Some(6.5));
    }

    #[test]
    fn test_parse_assessment_from_fenced_block() {
        let reply = format!("Here you go:\n```json\n{}\n```\nThanks", assessment_json());
        assert!(parse_assessment(&reply, 1, IDS).is_ok());
    }

    #[test]
    fn test_parse_assessment_rejects_out_of_range() {
        let bad = assessment_json().replace("7.5", "11");
        let err = parse_assessment(&bad, 1, IDS).unwrap_err();
        assert!(err.contains("quality_score"));
    }

    #[test]
    fn test_parse_assessment_rejects_unknown_participant() {
        let bad = assessment_json().replace("\"beta\"", "\"gamma\"");
        assert!(parse_assessment(&bad, 1, IDS).is_err());
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(parse_assessment("I think alpha won.", 1, IDS).is_err());
    }

    #[test]
    fn test_flags_default_when_missing() {
        let json = r#"{"round":1,"should_continue":false,"quality_score":3,"participants":[],"flags":{},"reasoning":"done"}"#;
        let a = parse_assessment(json, 1, IDS).unwrap();
        assert_eq!(a.flags, ContinuationFlags::default());
    }

    #[test]
    fn test_parse_verdict_checks_winner() {
        let json = r#"{"summary":"close","key_arguments":[{"participant_id":"alpha","arguments":["cost"]}],"winner":"zeta","overall_score":6}"#;
        let err = parse_verdict(json, IDS).unwrap_err();
        assert!(err.contains("zeta"));
        let ok = json.replace("zeta", "alpha");
        assert_eq!(parse_verdict(&ok, IDS).unwrap().winner.as_deref(), Some("alpha"));
    }

    #[test]
    fn test_schema_mentions_fields() {
        let schema = schema_json::<RoundAssessment>();
        assert!(schema.contains("should_continue"));
        assert!(schema.contains("convergence_reached"));
        let schema = schema_json::<FinalVerdict>();
        assert!(schema.contains("key_arguments"));
    }

    #[test]
    fn test_flags_or() {
        let a = ContinuationFlags {
            repetitive: true,
            ..Default::default()
        };
        let b = ContinuationFlags {
            diminishing_returns: true,
            ..Default::default()
        };
        let c = a.or(b);
        assert!(c.repetitive && c.diminishing_returns && !c.drifting);
    }
}
