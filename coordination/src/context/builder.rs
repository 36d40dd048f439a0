//! Context builder: bounds the shared transcript view for one participant
//! request.
//!
//! The prompt is `[system persona] + [topic, transcript…] + [instruction]`.
//! System prompt and instruction are mandatory; the transcript part is cut
//! down by the configured strategy until the whole prompt fits
//! `max_tokens - reserve`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::budget::{ContextBudget, EstimatorKind, TokenEstimator};
use super::summarizer::{SummarizerModel, SummaryInputEntry, SummaryRequest, Summarizer};
use crate::gateway::{ChatMessage, PromptContext};
use crate::recovery::{DebateError, ErrorKind};

/// Strategy for fitting the transcript into the budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Most recent messages that fit.
    Truncate,
    /// Topic message plus most recent messages that fit.
    SlidingWindow,
    /// Condense the oldest half once usage passes the high-water mark.
    Summarize,
    /// Full → sliding/summary → summary/aggressive truncation by usage band.
    #[default]
    Hybrid,
}

impl std::fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncate => write!(f, "truncate"),
            Self::SlidingWindow => write!(f, "sliding_window"),
            Self::Summarize => write!(f, "summarize"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Context builder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub strategy: ContextStrategy,
    pub budget: ContextBudget,
    /// Usage ratio where reduction starts.
    pub high_water: f64,
    /// Usage ratio where reduction becomes aggressive.
    pub critical: f64,
    /// Whether the 80–90% band summarizes instead of sliding.
    pub summarization_enabled: bool,
    /// Output cap for one summary.
    pub summary_max_tokens: u32,
    /// Model that writes summaries; unset keeps summaries local and
    /// extractive.
    pub summarizer: Option<SummarizerModel>,
    /// Budget share the sliding window shrinks to in the elevated band.
    pub sliding_target: f64,
    /// Budget share aggressive truncation shrinks to in the critical band.
    pub aggressive_target: f64,
    pub estimator: EstimatorKind,
}

impl ContextConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.budget.validate()?;
        if !(self.high_water > 0.0 && self.high_water < self.critical && self.critical <= 1.0) {
            return Err(format!(
                "thresholds must satisfy 0 < high_water ({}) < critical ({}) <= 1",
                self.high_water, self.critical
            ));
        }
        for (name, value) in [
            ("sliding_target", self.sliding_target),
            ("aggressive_target", self.aggressive_target),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(format!("{name} ({value}) must be in (0, 1]"));
            }
        }
        if self.summary_max_tokens == 0 {
            return Err("summary_max_tokens must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            strategy: ContextStrategy::Hybrid,
            budget: ContextBudget::default(),
            high_water: 0.8,
            critical: 0.9,
            summarization_enabled: false,
            summary_max_tokens: 400,
            summarizer: None,
            sliding_target: 0.6,
            aggressive_target: 0.5,
            estimator: EstimatorKind::CharCount,
        }
    }
}

/// One finalized transcript entry as the builder sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: String,
    pub round: u32,
    pub content: String,
}

impl TranscriptEntry {
    fn to_message(&self) -> ChatMessage {
        ChatMessage::user(format!(
            "[round {}] {}: {}",
            self.round, self.speaker, self.content
        ))
        .named(self.speaker.clone())
    }
}

impl From<&TranscriptEntry> for SummaryInputEntry {
    fn from(entry: &TranscriptEntry) -> Self {
        Self {
            speaker: entry.speaker.clone(),
            round: entry.round,
            content: entry.content.clone(),
        }
    }
}

/// Input for one build.
#[derive(Debug, Clone, Copy)]
pub struct ContextRequest<'a> {
    pub participant_id: &'a str,
    pub topic: &'a str,
    /// Participant persona.
    pub system_prompt: &'a str,
    /// Turn instruction appended last.
    pub instruction: &'a str,
    pub transcript: &'a [TranscriptEntry],
    pub round: u32,
}

/// How the transcript part was reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedStrategy {
    Full,
    Truncated,
    SlidingWindow,
    Summarized,
}

/// Severity of a context warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    /// High-water band.
    Elevated,
    /// Critical band.
    Critical,
}

/// Warning surfaced when the transcript had to be reduced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextWarning {
    pub level: WarningLevel,
    /// Usage of the unreduced prompt relative to the budget.
    pub usage_ratio: f64,
    pub message: String,
}

/// Result of a build.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub prompt: PromptContext,
    /// Estimated prompt tokens.
    pub tokens: u32,
    /// `max_tokens - reserve`.
    pub budget: u32,
    pub applied: AppliedStrategy,
    /// Usage of the unreduced prompt.
    pub usage_ratio: f64,
    pub warning: Option<ContextWarning>,
    /// Transcript entries folded into the synthetic summary.
    pub summarized_entries: usize,
    /// Transcript entries left out of the view.
    pub dropped_entries: usize,
}

/// Prompt usage measured before any reduction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    pub mandatory_tokens: u32,
    pub transcript_tokens: u32,
    pub budget: u32,
    pub ratio: f64,
}

/// Builder errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("system prompt and instruction need {required} tokens but the budget is {budget}")]
    MandatoryOverflow { required: u32, budget: u32 },

    #[error("no transcript message fits the remaining {remaining} tokens")]
    TranscriptOverflow { remaining: u32 },
}

impl ContextError {
    /// Surface as a `context_overflow` debate error.
    pub fn to_debate_error(&self, participant_id: &str) -> DebateError {
        DebateError::new(ErrorKind::ContextOverflow, self.to_string()).for_participant(participant_id)
    }
}

#[derive(Debug, Clone)]
struct SummaryCache {
    /// Number of leading transcript entries the summary covers.
    covered: usize,
    text: String,
}

/// Per-debate context builder.
pub struct ContextBuilder {
    config: ContextConfig,
    estimator: Box<dyn TokenEstimator>,
    summarizer: Option<Arc<dyn Summarizer>>,
    cache: Option<SummaryCache>,
}

impl ContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        let estimator = config.estimator.build();
        Self {
            config,
            estimator,
            summarizer: None,
            cache: None,
        }
    }

    pub fn with_estimator(mut self, estimator: Box<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Whether a summarizer is installed.
    pub fn can_summarize(&self) -> bool {
        self.summarizer.is_some()
    }

    /// Turn on summarization for the elevated band.
    pub fn enable_summarization(&mut self) {
        self.config.summarization_enabled = true;
    }

    pub fn set_strategy(&mut self, strategy: ContextStrategy) {
        self.config.strategy = strategy;
    }

    /// Drop the cached summary (after a reset).
    pub fn clear_cache(&mut self) {
        self.cache = None;
    }

    fn cost(&self, message: &ChatMessage) -> u32 {
        self.estimator.message_tokens(message)
    }

    fn topic_message(topic: &str) -> ChatMessage {
        ChatMessage::user(format!("Debate topic: {topic}"))
    }

    /// Measure the unreduced prompt.
    pub fn measure(&self, request: &ContextRequest<'_>) -> ContextUsage {
        let mandatory = self.cost(&ChatMessage::system(request.system_prompt))
            + self.cost(&ChatMessage::user(request.instruction));
        let transcript = self.cost(&Self::topic_message(request.topic))
            + request
                .transcript
                .iter()
                .map(|e| self.cost(&e.to_message()))
                .sum::<u32>();
        ContextUsage {
            mandatory_tokens: mandatory,
            transcript_tokens: transcript,
            budget: self.config.budget.available(),
            ratio: self.config.budget.usage_ratio(mandatory + transcript),
        }
    }

    /// Build the bounded prompt for one participant turn.
    pub async fn build(&mut self, request: &ContextRequest<'_>) -> Result<BuiltContext, ContextError> {
        let budget = self.config.budget.available();
        let system = ChatMessage::system(request.system_prompt);
        let instruction = ChatMessage::user(request.instruction);
        let mandatory = self.cost(&system) + self.cost(&instruction);
        if mandatory > budget {
            return Err(ContextError::MandatoryOverflow {
                required: mandatory,
                budget,
            });
        }
        let remaining = budget - mandatory;

        let items: Vec<ChatMessage> = std::iter::once(Self::topic_message(request.topic))
            .chain(request.transcript.iter().map(TranscriptEntry::to_message))
            .collect();
        let costs: Vec<u32> = items.iter().map(|m| self.cost(m)).collect();
        let total: u32 = costs.iter().sum();
        let usage = self.config.budget.usage_ratio(mandatory + total);

        let mut plan = match self.config.strategy {
            ContextStrategy::Truncate => {
                Plan::select(&items, select_suffix(&costs, remaining), AppliedStrategy::Truncated)
            }
            ContextStrategy::SlidingWindow => Plan::select(
                &items,
                select_window(&costs, remaining, 1),
                AppliedStrategy::SlidingWindow,
            ),
            ContextStrategy::Summarize => {
                if usage < self.config.high_water {
                    Plan::full(&items)
                } else {
                    let mut plan = match self.summarized(request, remaining).await {
                        Some(plan) => plan,
                        None => Plan::select(
                            &items,
                            select_window(&costs, remaining, 1),
                            AppliedStrategy::SlidingWindow,
                        ),
                    };
                    plan.warning = Some(warning(WarningLevel::Elevated, usage, plan.applied));
                    plan
                }
            }
            ContextStrategy::Hybrid => {
                self.hybrid(request, &items, &costs, mandatory, remaining, usage)
                    .await
            }
        };

        // Whatever the strategy produced, the prompt never exceeds the budget.
        let plan_cost: u32 = plan.messages.iter().map(|m| self.cost(m)).sum();
        if plan_cost > remaining {
            let plan_costs: Vec<u32> = plan.messages.iter().map(|m| self.cost(m)).collect();
            let keep = select_suffix(&plan_costs, remaining);
            plan.messages = keep.into_iter().map(|i| plan.messages[i].clone()).collect();
            plan.applied = AppliedStrategy::Truncated;
        }
        if plan.messages.is_empty() {
            return Err(ContextError::TranscriptOverflow { remaining });
        }

        let transcript_tokens: u32 = plan.messages.iter().map(|m| self.cost(m)).sum();
        let kept_entries = plan
            .messages
            .iter()
            .filter(|m| matches!(m.name.as_deref(), Some(name) if name != SUMMARY_SPEAKER))
            .count();
        let dropped = request
            .transcript
            .len()
            .saturating_sub(kept_entries + plan.summarized);

        if let Some(w) = &plan.warning {
            warn!(
                participant = request.participant_id,
                round = request.round,
                usage = w.usage_ratio,
                applied = ?plan.applied,
                "{}",
                w.message
            );
        }
        debug!(
            participant = request.participant_id,
            tokens = mandatory + transcript_tokens,
            budget,
            applied = ?plan.applied,
            "context built"
        );

        let mut messages = Vec::with_capacity(plan.messages.len() + 2);
        messages.push(system);
        messages.extend(plan.messages);
        messages.push(instruction);

        Ok(BuiltContext {
            prompt: PromptContext {
                messages,
                round: request.round,
            },
            tokens: mandatory + transcript_tokens,
            budget,
            applied: plan.applied,
            usage_ratio: usage,
            warning: plan.warning,
            summarized_entries: plan.summarized,
            dropped_entries: dropped,
        })
    }

    async fn hybrid(
        &mut self,
        request: &ContextRequest<'_>,
        items: &[ChatMessage],
        costs: &[u32],
        mandatory: u32,
        remaining: u32,
        usage: f64,
    ) -> Plan {
        let budget = self.config.budget.available();
        let target = |share: f64| -> u32 {
            ((budget as f64 * share) as u32)
                .saturating_sub(mandatory)
                .min(remaining)
        };

        if usage < self.config.high_water {
            return Plan::full(items);
        }

        if usage <= self.config.critical {
            let summarized = if self.config.summarization_enabled {
                self.summarized(request, remaining).await
            } else {
                None
            };
            let mut plan = summarized.unwrap_or_else(|| {
                let mut keep = select_window(costs, target(self.config.sliding_target), 1);
                if keep.is_empty() {
                    keep = select_window(costs, remaining, 1);
                }
                Plan::select(items, keep, AppliedStrategy::SlidingWindow)
            });
            plan.warning = Some(warning(WarningLevel::Elevated, usage, plan.applied));
            return plan;
        }

        let summarized = self.summarized(request, remaining).await;
        let mut plan = summarized.unwrap_or_else(|| {
            let mut keep = select_suffix(costs, target(self.config.aggressive_target));
            if keep.is_empty() {
                keep = select_suffix(costs, remaining);
            }
            Plan::select(items, keep, AppliedStrategy::Truncated)
        });
        plan.warning = Some(warning(WarningLevel::Critical, usage, plan.applied));
        plan
    }

    /// View with the oldest half of the responses condensed into one message.
    async fn summarized(&mut self, request: &ContextRequest<'_>, remaining: u32) -> Option<Plan> {
        let summarizer = self.summarizer.clone()?;
        let transcript = request.transcript;
        let covered = transcript.len() / 2;
        if covered == 0 {
            return None;
        }

        let text = match &self.cache {
            Some(cache) if cache.covered == covered => cache.text.clone(),
            cache => {
                let (previous, from) = match cache {
                    Some(c) if c.covered < covered => (Some(c.text.clone()), c.covered),
                    _ => (None, 0),
                };
                let summary_request = SummaryRequest {
                    topic: request.topic.to_string(),
                    previous_summary: previous,
                    entries: transcript[from..covered].iter().map(Into::into).collect(),
                    max_output_tokens: self.config.summary_max_tokens,
                };
                match summarizer.summarize(&summary_request).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(
                            participant = request.participant_id,
                            summarizer = summarizer.name(),
                            error = %e,
                            "summarization failed, falling back"
                        );
                        return None;
                    }
                }
            }
        };
        self.cache = Some(SummaryCache {
            covered,
            text: text.clone(),
        });

        let first_round = transcript[0].round;
        let last_round = transcript[covered - 1].round;
        let summary = ChatMessage::user(format!(
            "Summary of the earlier debate (rounds {first_round}-{last_round}): {text}"
        ))
        .named(SUMMARY_SPEAKER);

        let view: Vec<ChatMessage> = std::iter::once(Self::topic_message(request.topic))
            .chain(std::iter::once(summary))
            .chain(transcript[covered..].iter().map(TranscriptEntry::to_message))
            .collect();
        let view_costs: Vec<u32> = view.iter().map(|m| self.cost(m)).collect();
        let keep = select_window(&view_costs, remaining, 2);
        let summary_kept = keep.contains(&1);
        let mut plan = Plan::select(&view, keep, AppliedStrategy::Summarized);
        plan.summarized = if summary_kept { covered } else { 0 };
        Some(plan)
    }
}

const SUMMARY_SPEAKER: &str = "summary";

struct Plan {
    messages: Vec<ChatMessage>,
    applied: AppliedStrategy,
    warning: Option<ContextWarning>,
    summarized: usize,
}

impl Plan {
    fn full(items: &[ChatMessage]) -> Self {
        Self {
            messages: items.to_vec(),
            applied: AppliedStrategy::Full,
            warning: None,
            summarized: 0,
        }
    }

    fn select(items: &[ChatMessage], keep: Vec<usize>, applied: AppliedStrategy) -> Self {
        let applied = if keep.len() == items.len() && applied != AppliedStrategy::Summarized {
            AppliedStrategy::Full
        } else {
            applied
        };
        Self {
            messages: keep.into_iter().map(|i| items[i].clone()).collect(),
            applied,
            warning: None,
            summarized: 0,
        }
    }
}

fn warning(level: WarningLevel, usage_ratio: f64, applied: AppliedStrategy) -> ContextWarning {
    let action = match applied {
        AppliedStrategy::Full => "kept the full transcript",
        AppliedStrategy::Truncated => "dropped older messages",
        AppliedStrategy::SlidingWindow => "kept the topic and the most recent messages",
        AppliedStrategy::Summarized => "condensed the oldest half into a summary",
    };
    let message = match level {
        WarningLevel::Elevated => format!(
            "context at {:.0}% of budget; {action}",
            usage_ratio * 100.0
        ),
        WarningLevel::Critical => format!(
            "context critical at {:.0}% of budget; {action}. Enable summarization to keep more history",
            usage_ratio * 100.0
        ),
    };
    ContextWarning {
        level,
        usage_ratio,
        message,
    }
}

/// Indices of the longest most-recent suffix fitting `limit`.
fn select_suffix(costs: &[u32], limit: u32) -> Vec<usize> {
    let mut used = 0u32;
    let mut start = costs.len();
    for (i, &cost) in costs.iter().enumerate().rev() {
        if used + cost > limit {
            break;
        }
        used += cost;
        start = i;
    }
    (start..costs.len()).collect()
}

/// The first `pinned` indices plus the longest suffix of the rest fitting
/// the remainder. Falls back to a plain suffix when the pinned prefix alone
/// does not fit.
fn select_window(costs: &[u32], limit: u32, pinned: usize) -> Vec<usize> {
    let pinned = pinned.min(costs.len());
    let pinned_cost: u32 = costs[..pinned].iter().sum();
    if pinned_cost > limit {
        return select_suffix(costs, limit);
    }
    let tail = select_suffix(&costs[pinned..], limit - pinned_cost);
    (0..pinned).chain(tail.into_iter().map(|i| i + pinned)).collect()
}
