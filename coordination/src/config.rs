//! Engine configuration: TOML file, `PARLEY_*` environment overrides, and
//! validation.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::{ContextConfig, SummarizerModel};
use crate::judge::HeuristicsConfig;
use crate::limiter::LimiterConfig;
use crate::recovery::{CircuitBreaker, RetryConfig, RetryPolicy};

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Cool-down before the half-open trial, in milliseconds.
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn build(&self) -> CircuitBreaker {
        CircuitBreaker::new(self.failure_threshold, Duration::from_millis(self.cooldown_ms))
    }
}

/// Timeouts and delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Maximum duration of one participant gateway call.
    pub call_ms: u64,
    /// Maximum duration of one judge call.
    pub judge_ms: u64,
    /// Pause between rounds.
    pub settle_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_ms: 120_000,
            judge_ms: 120_000,
            settle_ms: 500,
        }
    }
}

impl TimeoutConfig {
    pub fn call(&self) -> Duration {
        Duration::from_millis(self.call_ms)
    }

    pub fn judge(&self) -> Duration {
        Duration::from_millis(self.judge_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: BreakerConfig,
    pub limiter: LimiterConfig,
    pub context: ContextConfig,
    pub judge: HeuristicsConfig,
    pub timeouts: TimeoutConfig,
    /// Round cap applied to every format.
    pub max_rounds: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            limiter: LimiterConfig::default(),
            context: ContextConfig::default(),
            judge: HeuristicsConfig::default(),
            timeouts: TimeoutConfig::default(),
            max_rounds: 10,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value:?}")]
    InvalidOverride { var: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl EngineConfig {
    /// Parse TOML; missing sections take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults with `PARLEY_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `PARLEY_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides read through `lookup`.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `PARLEY_MAX_ROUNDS` | `max_rounds` |
    /// | `PARLEY_CALL_TIMEOUT_MS` | `timeouts.call_ms` |
    /// | `PARLEY_JUDGE_TIMEOUT_MS` | `timeouts.judge_ms` |
    /// | `PARLEY_SETTLE_MS` | `timeouts.settle_ms` |
    /// | `PARLEY_MAX_TOKENS` | `context.budget.max_tokens` |
    /// | `PARLEY_RESERVE_TOKENS` | `context.budget.reserve` |
    /// | `PARLEY_SUMMARIZATION` | `context.summarization_enabled` |
    /// | `PARLEY_SUMMARIZER` (`backend:model`) | `context.summarizer` |
    /// | `PARLEY_MAX_CONCURRENT` | `limiter.defaults.max_concurrent` |
    /// | `PARLEY_BREAKER_THRESHOLD` | `circuit_breaker.failure_threshold` |
    /// | `PARLEY_BREAKER_COOLDOWN_MS` | `circuit_breaker.cooldown_ms` |
    /// | `PARLEY_REPETITION_THRESHOLD` | `judge.repetition_threshold` |
    /// | `PARLEY_TREND_WINDOW` | `judge.trend_window` |
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidOverride {
                    var: var.to_string(),
                    value,
                })
        }

        macro_rules! override_field {
            ($var:literal => $field:expr) => {
                if let Some(value) = lookup($var) {
                    $field = parse($var, value)?;
                }
            };
        }

        override_field!("PARLEY_MAX_ROUNDS" => self.max_rounds);
        override_field!("PARLEY_CALL_TIMEOUT_MS" => self.timeouts.call_ms);
        override_field!("PARLEY_JUDGE_TIMEOUT_MS" => self.timeouts.judge_ms);
        override_field!("PARLEY_SETTLE_MS" => self.timeouts.settle_ms);
        override_field!("PARLEY_MAX_TOKENS" => self.context.budget.max_tokens);
        override_field!("PARLEY_RESERVE_TOKENS" => self.context.budget.reserve);
        override_field!("PARLEY_MAX_CONCURRENT" => self.limiter.defaults.max_concurrent);
        override_field!("PARLEY_BREAKER_THRESHOLD" => self.circuit_breaker.failure_threshold);
        override_field!("PARLEY_BREAKER_COOLDOWN_MS" => self.circuit_breaker.cooldown_ms);
        override_field!("PARLEY_REPETITION_THRESHOLD" => self.judge.repetition_threshold);
        override_field!("PARLEY_TREND_WINDOW" => self.judge.trend_window);

        if let Some(value) = lookup("PARLEY_SUMMARIZATION") {
            self.context.summarization_enabled = matches!(
                value.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(value) = lookup("PARLEY_SUMMARIZER") {
            match value.trim().split_once(':') {
                Some((backend, model)) if !backend.is_empty() && !model.is_empty() => {
                    self.context.summarizer = Some(SummarizerModel {
                        backend: backend.to_string(),
                        model: model.to_string(),
                    });
                }
                _ => {
                    return Err(ConfigError::InvalidOverride {
                        var: "PARLEY_SUMMARIZER".to_string(),
                        value: value.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.context.validate().map_err(ConfigError::Invalid)?;
        self.judge.validate().map_err(ConfigError::Invalid)?;
        if self.max_rounds == 0 {
            return Err(ConfigError::Invalid("max_rounds must be positive".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be positive".into(),
            ));
        }
        if self.timeouts.call_ms == 0 || self.timeouts.judge_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if self.limiter.defaults.max_concurrent == 0
            || self.limiter.backends.values().any(|l| l.max_concurrent == 0)
        {
            return Err(ConfigError::Invalid(
                "limiter max_concurrent must be positive".into(),
            ));
        }
        for (name, policy) in [
            ("network", &self.retry.network),
            ("rate_limit", &self.retry.rate_limit),
            ("api_error", &self.retry.api_error),
            ("timeout", &self.retry.timeout),
        ] {
            validate_policy(name, policy)?;
        }
        Ok(())
    }
}

fn validate_policy(name: &str, policy: &RetryPolicy) -> Result<(), ConfigError> {
    if policy.max_retries == 0 {
        return Err(ConfigError::Invalid(format!(
            "retry.{name}.max_retries must be positive"
        )));
    }
    if policy.backoff_multiplier < 1.0 {
        return Err(ConfigError::Invalid(format!(
            "retry.{name}.backoff_multiplier must be >= 1"
        )));
    }
    if !(0.0..=1.0).contains(&policy.jitter) {
        return Err(ConfigError::Invalid(format!(
            "retry.{name}.jitter must be in [0, 1]"
        )));
    }
    if policy.initial_backoff_ms > policy.max_backoff_ms {
        return Err(ConfigError::Invalid(format!(
            "retry.{name}.initial_backoff_ms exceeds max_backoff_ms"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_rounds, 10);
        assert_eq!(config.retry.rate_limit.max_retries, 5);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
max_rounds = 4

[context.budget]
max_tokens = 4096
reserve = 512

[retry.network]
max_retries = 2
initial_backoff_ms = 100
backoff_multiplier = 2.0
max_backoff_ms = 1000
jitter = 0.0

[limiter.backends.local]
max_concurrent = 1
"#,
        )
        .unwrap();
        assert_eq!(config.max_rounds, 4);
        assert_eq!(config.context.budget.max_tokens, 4096);
        assert_eq!(config.retry.network.max_retries, 2);
        assert_eq!(config.retry.timeout.max_retries, 3);
        assert_eq!(config.limiter.backends["local"].max_concurrent, 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");
        std::fs::write(&path, "max_rounds = 3\n").unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().max_rounds, 3);
        assert!(matches!(
            EngineConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PARLEY_MAX_ROUNDS", "6"),
            ("PARLEY_SUMMARIZATION", "true"),
            ("PARLEY_SETTLE_MS", "0"),
            ("PARLEY_REPETITION_THRESHOLD", "0.75"),
            ("PARLEY_SUMMARIZER", "ollama:qwen2.5:7b"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config
            .apply_overrides_from(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_rounds, 6);
        assert!(config.context.summarization_enabled);
        assert_eq!(config.timeouts.settle_ms, 0);
        assert_eq!(config.judge.repetition_threshold, 0.75);
        let summarizer = config.context.summarizer.unwrap();
        assert_eq!(summarizer.backend, "ollama");
        assert_eq!(summarizer.model, "qwen2.5:7b");
    }

    #[test]
    fn test_bad_override() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides_from(|var| (var == "PARLEY_MAX_ROUNDS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));

        let err = config
            .apply_overrides_from(|var| (var == "PARLEY_SUMMARIZER").then(|| "ollama".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
        assert!(config.context.summarizer.is_none());
    }

    #[test]
    fn test_validate_rejects_reserve_over_budget() {
        let mut config = EngineConfig::default();
        config.context.budget.reserve = config.context.budget.max_tokens;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_round_cap() {
        let config = EngineConfig {
            max_rounds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
