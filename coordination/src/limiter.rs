//! Rate/concurrency limiter shared across debates.
//!
//! Each backend identity gets a bounded number of concurrent call slots
//! (tokio [`Semaphore`]) and, optionally, a rolling call-rate window. Excess
//! requests queue; nothing is rejected while the limiter is open.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::gateway::BackendId;

/// Limits for a single backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendLimits {
    /// Maximum simultaneous in-flight calls.
    pub max_concurrent: usize,
    /// Maximum calls started per rolling window (`None` = unlimited).
    #[serde(default)]
    pub calls_per_window: Option<u32>,
    /// Rolling window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_window_ms() -> u64 {
    60_000
}

impl Default for BackendLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            calls_per_window: None,
            window_ms: default_window_ms(),
        }
    }
}

/// Limiter configuration: defaults plus per-backend overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub defaults: BackendLimits,
    pub backends: HashMap<BackendId, BackendLimits>,
}

impl LimiterConfig {
    fn limits_for(&self, backend: &str) -> BackendLimits {
        self.backends
            .get(backend)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}

/// Limiter errors.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("limiter closed for backend {0}")]
    Closed(BackendId),
}

struct BackendSlot {
    limits: BackendLimits,
    semaphore: Arc<Semaphore>,
    recent_calls: Mutex<VecDeque<Instant>>,
}

impl BackendSlot {
    fn new(limits: BackendLimits) -> Self {
        let permits = limits.max_concurrent.max(1);
        Self {
            limits,
            semaphore: Arc::new(Semaphore::new(permits)),
            recent_calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until the rolling window admits another call, then record it.
    async fn admit_rate(&self) {
        let Some(cap) = self.limits.calls_per_window else {
            return;
        };
        let window = Duration::from_millis(self.limits.window_ms);
        loop {
            let wait = {
                let mut calls = self.recent_calls.lock().await;
                let now = Instant::now();
                while calls
                    .front()
                    .is_some_and(|at| now.duration_since(*at) >= window)
                {
                    calls.pop_front();
                }
                if (calls.len() as u32) < cap {
                    calls.push_back(now);
                    return;
                }
                match calls.front() {
                    Some(oldest) => window.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// A held call slot. Dropping it releases the slot.
pub struct LimiterPermit {
    backend: BackendId,
    _permit: OwnedSemaphorePermit,
}

impl LimiterPermit {
    pub fn backend(&self) -> &str {
        &self.backend
    }
}

impl std::fmt::Debug for LimiterPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterPermit")
            .field("backend", &self.backend)
            .finish()
    }
}

/// Shared reference to the limiter.
pub type SharedRateLimiter = Arc<RateLimiter>;

/// Per-backend concurrency and rate limiter.
pub struct RateLimiter {
    config: LimiterConfig,
    slots: Mutex<HashMap<BackendId, Arc<BackendSlot>>>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Create a shared reference to this limiter.
    pub fn shared(self) -> SharedRateLimiter {
        Arc::new(self)
    }

    async fn slot(&self, backend: &str) -> Arc<BackendSlot> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(BackendSlot::new(self.config.limits_for(backend))))
            .clone()
    }

    /// Wait for a call slot on `backend`. Queues while the backend is saturated.
    pub async fn acquire(&self, backend: &str) -> Result<LimiterPermit, LimiterError> {
        let slot = self.slot(backend).await;
        let permit = slot
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed(backend.to_string()))?;
        slot.admit_rate().await;
        debug!(
            backend,
            available = slot.semaphore.available_permits(),
            "limiter slot acquired"
        );
        Ok(LimiterPermit {
            backend: backend.to_string(),
            _permit: permit,
        })
    }

    /// Calls currently holding a slot on `backend`.
    pub async fn in_flight(&self, backend: &str) -> usize {
        let slots = self.slots.lock().await;
        match slots.get(backend) {
            Some(slot) => slot
                .limits
                .max_concurrent
                .max(1)
                .saturating_sub(slot.semaphore.available_permits()),
            None => 0,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}
