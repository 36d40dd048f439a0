//! Local stopping heuristics.
//!
//! Repetition is word-trigram Jaccard overlap between a participant's
//! current and previous response. Diminishing returns is a non-increasing
//! quality trend with a net drop across the trailing window of assessments.
//! Both are OR-ed into whatever the judge reported.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::schema::{
    ContinuationFlags, FinalVerdict, ParticipantArguments, ParticipantAssessment, RoundAssessment,
};

/// Heuristic thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicsConfig {
    /// Jaccard overlap at or above which a response counts as repetitive.
    pub repetition_threshold: f64,
    /// Word n-gram size used for overlap.
    pub ngram_size: usize,
    /// Number of trailing assessments inspected for a downward trend.
    pub trend_window: usize,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            repetition_threshold: 0.6,
            ngram_size: 3,
            trend_window: 3,
        }
    }
}

impl HeuristicsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.repetition_threshold) {
            return Err(format!(
                "repetition_threshold ({}) must be in [0, 1]",
                self.repetition_threshold
            ));
        }
        if self.ngram_size == 0 {
            return Err("ngram_size must be positive".to_string());
        }
        if self.trend_window < 2 {
            return Err("trend_window must be at least 2".to_string());
        }
        Ok(())
    }
}

fn words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn ngrams(text: &str, n: usize) -> HashSet<Vec<String>> {
    let words = words(text);
    if words.len() < n {
        // Short texts compare as a single gram.
        return if words.is_empty() {
            HashSet::new()
        } else {
            HashSet::from([words])
        };
    }
    words.windows(n).map(|w| w.to_vec()).collect()
}

/// Word n-gram Jaccard similarity in `[0, 1]`.
pub fn ngram_similarity(a: &str, b: &str, n: usize) -> f64 {
    let a = ngrams(a, n);
    let b = ngrams(b, n);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    intersection as f64 / union as f64
}

/// Whether `scores` ends in a non-increasing run of `window` values with a
/// net drop.
pub fn diminishing_trend(scores: &[f64], window: usize) -> bool {
    if window < 2 || scores.len() < window {
        return false;
    }
    let tail = &scores[scores.len() - window..];
    let non_increasing = tail.windows(2).all(|w| w[1] <= w[0]);
    non_increasing && tail[window - 1] < tail[0]
}

/// One participant's text in the round being assessed.
#[derive(Debug, Clone)]
pub struct RoundText<'a> {
    pub participant_id: &'a str,
    pub current: &'a str,
    /// The same participant's previous response, if any.
    pub previous: Option<&'a str>,
}

/// Locally derived signals for one round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalSignals {
    /// Similarity to the previous response, per participant.
    pub similarity: HashMap<String, f64>,
    pub repetitive: bool,
    pub diminishing_returns: bool,
}

impl LocalSignals {
    pub fn flags(&self) -> ContinuationFlags {
        ContinuationFlags {
            repetitive: self.repetitive,
            diminishing_returns: self.diminishing_returns,
            ..ContinuationFlags::default()
        }
    }
}

/// Derive repetition and trend signals.
///
/// `quality_history` holds prior assessments' quality scores followed by the
/// current one.
pub fn derive_signals(
    config: &HeuristicsConfig,
    texts: &[RoundText<'_>],
    quality_history: &[f64],
) -> LocalSignals {
    let mut signals = LocalSignals::default();
    for text in texts {
        if let Some(previous) = text.previous {
            let sim = ngram_similarity(text.current, previous, config.ngram_size);
            if sim >= config.repetition_threshold {
                signals.repetitive = true;
            }
            signals.similarity.insert(text.participant_id.to_string(), sim);
        }
    }
    signals.diminishing_returns = diminishing_trend(quality_history, config.trend_window);
    signals
}

/// OR local signals into a judge assessment.
pub fn merge_signals(assessment: &mut RoundAssessment, signals: &LocalSignals) {
    assessment.flags = assessment.flags.or(signals.flags());
}

/// Assessment built from heuristics alone, for debates running without a judge.
///
/// Participant scores reward novelty against their previous response.
pub fn heuristic_assessment(
    config: &HeuristicsConfig,
    round: u32,
    texts: &[RoundText<'_>],
    prior_quality: &[f64],
) -> RoundAssessment {
    let participants: Vec<ParticipantAssessment> = texts
        .iter()
        .map(|t| {
            let sim = t
                .previous
                .map(|p| ngram_similarity(t.current, p, config.ngram_size))
                .unwrap_or(0.0);
            ParticipantAssessment {
                participant_id: t.participant_id.to_string(),
                score: round_to_tenth(10.0 * (1.0 - sim)),
                strengths: Vec::new(),
                weaknesses: if sim >= config.repetition_threshold {
                    vec!["restates the previous response".to_string()]
                } else {
                    Vec::new()
                },
            }
        })
        .collect();
    let quality = if participants.is_empty() {
        0.0
    } else {
        round_to_tenth(participants.iter().map(|p| p.score).sum::<f64>() / participants.len() as f64)
    };

    let mut history = prior_quality.to_vec();
    history.push(quality);
    let signals = derive_signals(config, texts, &history);

    RoundAssessment {
        round,
        should_continue: !(signals.repetitive && signals.diminishing_returns),
        quality_score: quality,
        participants,
        flags: signals.flags(),
        reasoning: "heuristic assessment (no judge): scores reflect novelty against each \
                    participant's previous response"
            .to_string(),
    }
}

/// Verdict built locally when the debate runs without a judge.
///
/// `last_responses` maps participant id to its final response.
pub fn local_verdict(
    topic: &str,
    last_responses: &[(&str, &str)],
    assessments: &[RoundAssessment],
) -> FinalVerdict {
    let key_arguments = last_responses
        .iter()
        .map(|(pid, text)| ParticipantArguments {
            participant_id: pid.to_string(),
            arguments: first_sentence(text).into_iter().collect(),
        })
        .collect();
    let overall = if assessments.is_empty() {
        0.0
    } else {
        round_to_tenth(
            assessments.iter().map(|a| a.quality_score).sum::<f64>() / assessments.len() as f64,
        )
    };
    FinalVerdict {
        summary: format!(
            "Debate on \"{topic}\" concluded after {} assessed round(s) without a judge.",
            assessments.len()
        ),
        key_arguments,
        agreements: Vec::new(),
        disagreements: Vec::new(),
        winner: None,
        winner_reasoning: None,
        overall_score: overall,
        insights: Vec::new(),
    }
}

fn first_sentence(text: &str) -> Option<String> {
    let sentence = text.split_inclusive(['.', '!', '?']).next()?.trim();
    (!sentence.is_empty()).then(|| sentence.to_string())
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
