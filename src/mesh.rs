//! Process-wide service bundle
//!
//! Built once per process from [`MeshConfig`] and passed by handle. All
//! components share one store handle; the breaker table and subscriber
//! registry are the only in-process state.

use crate::agent_status::AgentStatusCache;
use crate::breaker::BreakerRegistry;
use crate::bus::{MessageBus, SubscriberRegistry};
use crate::config::MeshConfig;
use crate::decision::{DecisionCoordinator, DecisionRepository, SqliteDecisionRepository};
use crate::lock::LockManager;
use crate::queue::TaskQueue;
use crate::rate_limit::RateLimiter;
use crate::store::{self, SharedStore};
use crate::Result;
use std::sync::Arc;

pub struct Mesh {
    config: MeshConfig,
    store: SharedStore,
    pub queue: TaskQueue,
    pub bus: MessageBus,
    pub subscribers: SubscriberRegistry,
    pub locks: LockManager,
    pub limiter: RateLimiter,
    pub breakers: BreakerRegistry,
    pub agents: AgentStatusCache,
    decisions: Option<Arc<DecisionCoordinator>>,
}

impl Mesh {
    /// Wire every component to `store`, without a decision coordinator
    pub fn new(config: MeshConfig, store: SharedStore) -> Self {
        Self {
            queue: TaskQueue::new(store.clone()),
            bus: MessageBus::new(store.clone(), config.bus.clone()),
            subscribers: SubscriberRegistry::new(store.clone()),
            locks: LockManager::new(store.clone()),
            limiter: RateLimiter::new(store.clone(), config.rate_limits.claude),
            breakers: BreakerRegistry::from_settings(&config.breakers),
            agents: AgentStatusCache::new(store.clone(), config.agent_status_ttl),
            decisions: None,
            store,
            config,
        }
    }

    /// Connect to the configured store
    pub fn connect(config: MeshConfig) -> Result<Self> {
        let store = store::connect(&config)?;
        Ok(Self::new(config, store))
    }

    /// Attach a decision coordinator backed by `repo`
    pub fn with_decisions(mut self, repo: Arc<dyn DecisionRepository>) -> Self {
        let coordinator = DecisionCoordinator::new(
            repo,
            self.bus.clone(),
            self.locks.clone(),
            self.config.decisions.clone(),
        );
        self.decisions = Some(Arc::new(coordinator));
        self
    }

    /// Attach a decision coordinator on the configured SQLite database
    pub fn with_default_decisions(self) -> Result<Self> {
        let repo = SqliteDecisionRepository::open(&self.config.decisions.db_path)?;
        Ok(self.with_decisions(Arc::new(repo)))
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn decisions(&self) -> Option<&Arc<DecisionCoordinator>> {
        self.decisions.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Tier;
    use meshstore::MemoryStore;

    #[tokio::test]
    async fn test_components_share_the_store() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mesh = Mesh::new(MeshConfig::new(), store);

        mesh.queue.enqueue("a1", serde_json::json!({"n": 1})).await.unwrap();
        assert_eq!(mesh.queue.depth("a1").await.unwrap().queued, 1);
        assert!(mesh.locks.acquire("lock:container:c1", std::time::Duration::from_secs(5)).await.unwrap());
        assert!(mesh.locks.is_held("lock:container:c1").await.unwrap());
        assert!(mesh.decisions().is_none());
    }

    #[tokio::test]
    async fn test_with_decisions() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let repo = Arc::new(SqliteDecisionRepository::open_in_memory().unwrap());
        let mesh = Mesh::new(MeshConfig::new(), store).with_decisions(repo);

        let coordinator = mesh.decisions().unwrap();
        let decision = coordinator.propose("t", "", "a1", Tier::Minor).await.unwrap();
        assert_eq!(coordinator.get(&decision.id).await.unwrap().id, decision.id);
        let depth = mesh.bus.stream_depth("stream:clevel").await.unwrap();
        assert_eq!(depth.length, 1);
    }
}
