//! Token budgeting: pluggable estimator and the per-request context budget.

use serde::{Deserialize, Serialize};

use crate::gateway::ChatMessage;

/// Fixed per-message framing cost (role markers, separators).
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Approximate tokenizer. Estimates only need to be stable and slightly
/// pessimistic; the reserve absorbs the error.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u32;

    fn name(&self) -> &str;

    /// Tokens one prompt message costs, framing included.
    fn message_tokens(&self, message: &ChatMessage) -> u32 {
        self.estimate(&message.content) + MESSAGE_OVERHEAD_TOKENS
    }
}

/// Whitespace words scaled by `factor` (about 1.3 for English prose).
#[derive(Debug, Clone)]
pub struct WordCountEstimator {
    pub factor: f64,
}

impl Default for WordCountEstimator {
    fn default() -> Self {
        Self { factor: 1.3 }
    }
}

impl TokenEstimator for WordCountEstimator {
    fn estimate(&self, text: &str) -> u32 {
        let words = text.split_whitespace().count() as f64;
        (words * self.factor).ceil() as u32
    }

    fn name(&self) -> &str {
        "word_count"
    }
}

/// Characters divided by `chars_per_token`. The default estimator.
#[derive(Debug, Clone)]
pub struct CharCountEstimator {
    pub chars_per_token: f64,
}

impl Default for CharCountEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
        }
    }
}

impl TokenEstimator for CharCountEstimator {
    fn estimate(&self, text: &str) -> u32 {
        (text.chars().count() as f64 / self.chars_per_token).ceil() as u32
    }

    fn name(&self) -> &str {
        "char_count"
    }
}

/// Which estimator a config selects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    #[default]
    CharCount,
    WordCount,
}

impl EstimatorKind {
    pub fn build(self) -> Box<dyn TokenEstimator> {
        match self {
            Self::CharCount => Box::new(CharCountEstimator::default()),
            Self::WordCount => Box::new(WordCountEstimator::default()),
        }
    }
}

/// Context window budget for one participant request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    /// Context window of the participant's model.
    pub max_tokens: u32,
    /// Headroom reserved for the response.
    pub reserve: u32,
}

impl ContextBudget {
    /// Tokens available to the prompt (max - reserve).
    pub fn available(&self) -> u32 {
        self.max_tokens.saturating_sub(self.reserve)
    }

    /// Usage of `tokens` relative to the available budget.
    pub fn usage_ratio(&self, tokens: u32) -> f64 {
        let available = self.available();
        if available == 0 {
            return f64::INFINITY;
        }
        tokens as f64 / available as f64
    }

    /// The reserve must leave room for a prompt.
    pub fn validate(&self) -> Result<(), String> {
        if self.reserve < self.max_tokens {
            Ok(())
        } else {
            Err(format!(
                "context reserve {} leaves no prompt room in a {}-token window",
                self.reserve, self.max_tokens
            ))
        }
    }
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_tokens: 8_192,
            reserve: 1_024,
        }
    }
}
