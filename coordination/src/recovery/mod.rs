//! Error recovery: taxonomy, circuit breaker, and the recovery manager.

pub mod circuit_breaker;
pub mod errors;
pub mod manager;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use errors::{millis, DebateError, ErrorKind};
pub use manager::{
    DecisionOption, ErrorSource, RecoveryAction, RecoveryManager, RetryConfig, RetryPolicy,
    SharedCircuitBreaker,
};
