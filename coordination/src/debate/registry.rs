//! Debate registry: shared services and the set of live debates.
//!
//! One registry owns the collaborators every debate shares (gateway, rate
//! limiter, recovery manager, event bus, store) and spawns a coordinator per
//! debate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use super::coordinator::{Coordinator, DebateHandle, EngineError};
use super::model::{Debate, DebateSetup, JudgeRef};
use super::persistence::{DebateStore, MemoryStore};
use super::persona::{PersonaStrategy, StandardPositions};
use crate::config::EngineConfig;
use crate::context::{ContextBuilder, ExtractiveSummarizer, GatewaySummarizer, Summarizer};
use crate::events::{EventBus, SharedEventBus};
use crate::gateway::{ParticipantConfig, ProviderGateway};
use crate::judge::{Evaluator, GatewayEvaluator};
use crate::limiter::{RateLimiter, SharedRateLimiter};
use crate::recovery::RecoveryManager;

/// Output cap for judge calls made through the gateway.
const JUDGE_MAX_OUTPUT_TOKENS: u32 = 2048;
const JUDGE_TEMPERATURE: f32 = 0.2;

/// Turns a judge reference into an evaluator.
pub trait JudgeFactory: Send + Sync {
    fn evaluator(&self, judge: &JudgeRef) -> Arc<dyn Evaluator>;
}

impl<F> JudgeFactory for F
where
    F: Fn(&JudgeRef) -> Arc<dyn Evaluator> + Send + Sync,
{
    fn evaluator(&self, judge: &JudgeRef) -> Arc<dyn Evaluator> {
        self(judge)
    }
}

/// Judges that prompt their backend through the provider gateway.
pub struct GatewayJudges {
    gateway: Arc<dyn ProviderGateway>,
}

impl GatewayJudges {
    pub fn new(gateway: Arc<dyn ProviderGateway>) -> Self {
        Self { gateway }
    }
}

impl JudgeFactory for GatewayJudges {
    fn evaluator(&self, judge: &JudgeRef) -> Arc<dyn Evaluator> {
        let config = ParticipantConfig {
            participant_id: judge.id.clone(),
            backend: judge.backend.clone(),
            model: judge.model.clone(),
            max_output_tokens: JUDGE_MAX_OUTPUT_TOKENS,
            temperature: JUDGE_TEMPERATURE,
        };
        Arc::new(GatewayEvaluator::new(self.gateway.clone(), config))
    }
}

/// Collaborators shared by every debate of a registry.
pub(crate) struct Services {
    pub gateway: Arc<dyn ProviderGateway>,
    pub limiter: SharedRateLimiter,
    pub recovery: Arc<RecoveryManager>,
    pub bus: SharedEventBus,
    pub store: Arc<dyn DebateStore>,
    pub personas: Arc<dyn PersonaStrategy>,
    pub judges: Arc<dyn JudgeFactory>,
    pub summarizer: Arc<dyn Summarizer>,
    pub config: EngineConfig,
}

impl Services {
    /// Fresh per-debate context builder.
    pub fn context_builder(&self) -> ContextBuilder {
        ContextBuilder::new(self.config.context.clone()).with_summarizer(self.summarizer.clone())
    }
}

/// Builder for [`DebateRegistry`].
pub struct RegistryBuilder {
    gateway: Arc<dyn ProviderGateway>,
    config: EngineConfig,
    bus: Option<SharedEventBus>,
    store: Option<Arc<dyn DebateStore>>,
    personas: Option<Arc<dyn PersonaStrategy>>,
    judges: Option<Arc<dyn JudgeFactory>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl RegistryBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_bus(mut self, bus: SharedEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DebateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_personas(mut self, personas: Arc<dyn PersonaStrategy>) -> Self {
        self.personas = Some(personas);
        self
    }

    pub fn with_judges(mut self, judges: Arc<dyn JudgeFactory>) -> Self {
        self.judges = Some(judges);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Validate the configuration and wire the shared services.
    pub fn build(self) -> Result<DebateRegistry, EngineError> {
        self.config.validate()?;
        let config = self.config;
        let limiter = RateLimiter::new(config.limiter.clone()).shared();
        let recovery =
            RecoveryManager::new(config.retry.clone(), config.circuit_breaker.build()).shared();
        let judges = self
            .judges
            .unwrap_or_else(|| Arc::new(GatewayJudges::new(self.gateway.clone())));
        let summarizer = self
            .summarizer
            .unwrap_or_else(|| configured_summarizer(&config, &self.gateway, &limiter));
        let services = Services {
            gateway: self.gateway,
            limiter,
            recovery,
            bus: self.bus.unwrap_or_else(|| EventBus::new().shared()),
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            personas: self
                .personas
                .unwrap_or_else(|| Arc::new(StandardPositions)),
            judges,
            summarizer,
            config,
        };
        Ok(DebateRegistry {
            services: Arc::new(services),
            debates: RwLock::new(HashMap::new()),
        })
    }
}

/// Summarizer named by `context.summarizer`, else the extractive one.
fn configured_summarizer(
    config: &EngineConfig,
    gateway: &Arc<dyn ProviderGateway>,
    limiter: &SharedRateLimiter,
) -> Arc<dyn Summarizer> {
    match &config.context.summarizer {
        Some(model) => {
            info!(backend = %model.backend, model = %model.model, "summaries use a backend model");
            let summarizer = GatewaySummarizer::new(
                gateway.clone(),
                model.participant_config(config.context.summary_max_tokens),
            )
            .with_limiter(limiter.clone())
            .with_timeout(config.timeouts.call());
            Arc::new(summarizer)
        }
        None => Arc::new(ExtractiveSummarizer::default()),
    }
}

/// Live debates keyed by id.
pub struct DebateRegistry {
    services: Arc<Services>,
    debates: RwLock<HashMap<String, DebateHandle>>,
}

impl DebateRegistry {
    pub fn builder(gateway: Arc<dyn ProviderGateway>) -> RegistryBuilder {
        RegistryBuilder {
            gateway,
            config: EngineConfig::default(),
            bus: None,
            store: None,
            personas: None,
            judges: None,
            summarizer: None,
        }
    }

    /// Create a debate in `Configuring` and spawn its coordinator.
    pub async fn create(&self, setup: DebateSetup) -> Result<DebateHandle, EngineError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_with_id(&id, setup).await
    }

    /// Create a debate under a caller-chosen id.
    pub async fn create_with_id(
        &self,
        id: &str,
        setup: DebateSetup,
    ) -> Result<DebateHandle, EngineError> {
        let mut debates = self.debates.write().await;
        if debates.contains_key(id) {
            return Err(EngineError::AlreadyExists(id.to_string()));
        }
        let debate = Debate::new(id, setup, self.services.config.max_rounds);
        info!(
            debate_id = id,
            topic = %debate.topic,
            format = %debate.format,
            mode = %debate.mode,
            participants = debate.participants.len(),
            "debate created"
        );
        let handle = Coordinator::spawn(debate, self.services.clone());
        debates.insert(id.to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, id: &str) -> Result<DebateHandle, EngineError> {
        self.debates
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Ids of all registered debates.
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.debates.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop a debate that is not running. Its coordinator exits once the
    /// last handle is gone.
    pub async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let mut debates = self.debates.write().await;
        let handle = debates
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let status = handle.status();
        if !status.is_settled() {
            return Err(EngineError::InvalidCommand {
                command: "remove",
                status,
            });
        }
        debates.remove(id);
        info!(debate_id = id, %status, "debate removed");
        Ok(())
    }

    /// Event bus all debates of this registry publish on.
    pub fn bus(&self) -> SharedEventBus {
        self.services.bus.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Snapshot store.
    pub fn store(&self) -> Arc<dyn DebateStore> {
        self.services.store.clone()
    }
}
