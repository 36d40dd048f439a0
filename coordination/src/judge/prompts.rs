//! Judge prompt templates.

use super::evaluator::{AssessmentRequest, Strictness, VerdictRequest};
use super::schema::{schema_json, FinalVerdict, RoundAssessment};
use crate::gateway::{ChatMessage, PromptContext};

const JUDGE_SYSTEM: &str = "You are the impartial judge of a structured debate. \
You never take sides on the topic itself; you assess the quality of argumentation: \
evidence, logic, engagement with the other participants, and novelty.";

/// Appended on the single retry after an unparseable reply.
pub const STRICT_FORMAT_INSTRUCTION: &str = "Your previous reply could not be parsed. \
Respond with ONLY one JSON object that matches the schema exactly. \
No prose, no markdown fences, no comments, no trailing text.";

fn strictness_suffix(strictness: Strictness) -> &'static str {
    match strictness {
        Strictness::Normal => "Respond with a single JSON object matching the schema.",
        Strictness::Strict => STRICT_FORMAT_INSTRUCTION,
    }
}

pub fn assessment_prompt(request: &AssessmentRequest, strictness: Strictness) -> PromptContext {
    let mut body = format!(
        "Debate topic: {}\n\nRound {} responses:\n",
        request.topic, request.round
    );
    for r in &request.responses {
        body.push_str(&format!(
            "\n--- participant_id: {} (position: {}) ---\n{}\n",
            r.participant_id, r.position, r.content
        ));
    }
    if !request.previous_assessments.is_empty() {
        body.push_str("\nQuality scores of earlier rounds: ");
        let scores: Vec<String> = request
            .previous_assessments
            .iter()
            .map(|a| format!("round {}: {:.1}", a.round, a.quality_score))
            .collect();
        body.push_str(&scores.join(", "));
        body.push('\n');
    }
    body.push_str(&format!(
        "\nAssess this round. Set should_continue to false when another round would add \
         little. Set convergence_reached when the participants now substantially agree.\n\n\
         JSON schema:\n{}\n\n{}",
        schema_json::<RoundAssessment>(),
        strictness_suffix(strictness)
    ));
    PromptContext {
        messages: vec![ChatMessage::system(JUDGE_SYSTEM), ChatMessage::user(body)],
        round: request.round,
    }
}

pub fn verdict_prompt(request: &VerdictRequest, strictness: Strictness) -> PromptContext {
    let mut body = format!("Debate topic: {}\n\nFull transcript:\n", request.topic);
    for r in &request.transcript {
        body.push_str(&format!(
            "\n[round {}] {} ({}):\n{}\n",
            r.round, r.participant_id, r.position, r.content
        ));
    }
    if !request.assessments.is_empty() {
        body.push_str("\nRound assessments:\n");
        for a in &request.assessments {
            body.push_str(&format!(
                "- round {}: quality {:.1}; {}\n",
                a.round, a.quality_score, a.reasoning
            ));
        }
    }
    body.push_str(&format!(
        "\nDeliver the final verdict. Name a winner only when one participant clearly \
         argued better; otherwise leave winner null.\n\nJSON schema:\n{}\n\n{}",
        schema_json::<FinalVerdict>(),
        strictness_suffix(strictness)
    ));
    let round = request.transcript.last().map(|r| r.round).unwrap_or(0);
    PromptContext {
        messages: vec![ChatMessage::system(JUDGE_SYSTEM), ChatMessage::user(body)],
        round,
    }
}
