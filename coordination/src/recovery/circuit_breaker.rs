//! Circuit breaker keyed by backend identity.
//!
//! The breaker tracks consecutive failures per backend. When failures reach
//! the threshold the circuit *opens* and calls to that backend are rejected.
//! After the cooldown the circuit is *half-open*: exactly one trial call is
//! admitted. A successful trial closes the circuit, a failed one re-opens it
//! for another cooldown.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::gateway::BackendId;

/// Wait suggested to callers that lose the race for a half-open trial.
const TRIAL_BUSY_WAIT: Duration = Duration::from_secs(1);

/// Circuit breaker state for a single backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy: calls allowed.
    Closed,
    /// Tripped: calls rejected until cooldown expires.
    Open,
    /// Cooldown expired: one trial call allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BackendCircuit {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-backend circuit breaker tracking consecutive failures.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    circuits: HashMap<BackendId, BackendCircuit>,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time after the last failure before Open → HalfOpen.
    pub cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            circuits: HashMap::new(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    /// Record a success: resets the circuit to Closed.
    pub fn record_success(&mut self, backend: &str) {
        self.circuits.remove(backend);
    }

    /// Record a failure: may trip (or re-trip) the circuit.
    pub fn record_failure(&mut self, backend: &str) {
        let circuit = self.circuits.entry(backend.to_string()).or_default();
        circuit.consecutive_failures += 1;
        circuit.last_failure = Some(Instant::now());
        circuit.trial_in_flight = false;
    }

    /// Release a half-open trial that ended without a verdict (canceled call).
    pub fn abandon_trial(&mut self, backend: &str) {
        if let Some(circuit) = self.circuits.get_mut(backend) {
            circuit.trial_in_flight = false;
        }
    }

    /// Current state of the circuit for `backend`.
    pub fn state(&self, backend: &str) -> CircuitState {
        let Some(circuit) = self.circuits.get(backend) else {
            return CircuitState::Closed;
        };
        if circuit.consecutive_failures < self.failure_threshold {
            return CircuitState::Closed;
        }
        match circuit.last_failure {
            Some(at) if at.elapsed() < self.cooldown => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    /// Ask to place a call. `Err` carries how long the caller should wait.
    pub fn try_acquire(&mut self, backend: &str) -> Result<(), Duration> {
        match self.state(backend) {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(self.remaining_cooldown(backend)),
            CircuitState::HalfOpen => {
                let circuit = self.circuits.entry(backend.to_string()).or_default();
                if circuit.trial_in_flight {
                    Err(TRIAL_BUSY_WAIT.min(self.cooldown.max(Duration::from_millis(1))))
                } else {
                    circuit.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Whether a call to `backend` would currently be admitted.
    pub fn is_available(&self, backend: &str) -> bool {
        match self.state(backend) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self
                .circuits
                .get(backend)
                .map(|c| !c.trial_in_flight)
                .unwrap_or(true),
        }
    }

    /// Consecutive failures recorded for `backend`.
    pub fn failure_count(&self, backend: &str) -> u32 {
        self.circuits
            .get(backend)
            .map(|c| c.consecutive_failures)
            .unwrap_or(0)
    }

    fn remaining_cooldown(&self, backend: &str) -> Duration {
        self.circuits
            .get(backend)
            .and_then(|c| c.last_failure)
            .map(|at| self.cooldown.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKEND: &str = "openai-compat:http://localhost:8080";

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state(BACKEND), CircuitState::Closed);
        assert!(cb.is_available(BACKEND));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold() {
        let mut cb = CircuitBreaker::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            cb.record_failure(BACKEND);
        }
        assert_eq!(cb.state(BACKEND), CircuitState::Closed);
        cb.record_failure(BACKEND);
        assert_eq!(cb.state(BACKEND), CircuitState::Open);
        let wait = cb.try_acquire(BACKEND).unwrap_err();
        assert!(wait <= Duration::from_secs(60));
        assert!(wait > Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(10));
        cb.record_failure(BACKEND);
        cb.record_failure(BACKEND);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.state(BACKEND), CircuitState::HalfOpen);

        assert!(cb.try_acquire(BACKEND).is_ok());
        assert!(cb.try_acquire(BACKEND).is_err());
        assert!(!cb.is_available(BACKEND));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(10));
        cb.record_failure(BACKEND);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.try_acquire(BACKEND).is_ok());
        cb.record_failure(BACKEND);
        assert_eq!(cb.state(BACKEND), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_trial_closes() {
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(10));
        cb.record_failure(BACKEND);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.try_acquire(BACKEND).is_ok());
        cb.record_success(BACKEND);
        assert_eq!(cb.state(BACKEND), CircuitState::Closed);
        assert_eq!(cb.failure_count(BACKEND), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_is_released() {
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(5));
        cb.record_failure(BACKEND);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cb.try_acquire(BACKEND).is_ok());
        cb.abandon_trial(BACKEND);
        assert!(cb.try_acquire(BACKEND).is_ok());
    }

    #[test]
    fn test_backends_are_isolated() {
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(60));
        cb.record_failure("a");
        assert_eq!(cb.state("a"), CircuitState::Open);
        assert_eq!(cb.state("b"), CircuitState::Closed);
    }
}
