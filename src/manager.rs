//! Process-wide cache entry point
//!
//! A [`CacheManager`] owns the configuration, the failover controller and the
//! counters. Entity caches handed out by it share those. Each entity name gets
//! one local store and one in-flight map, shared by all of its handles.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::entity_cache::{Cacheable, EntityCache, EntityCacheBuilder, RegisteredEntity};
use crate::failover::FailoverController;
use crate::remote::{RedisConnector, RemoteConnector};
use crate::stats::{CacheStats, StatsSnapshot};
use crate::{CacheConfig, CacheError};

/// State shared by every entity cache of one manager
pub(crate) struct CacheContext {
    pub(crate) config: CacheConfig,
    pub(crate) controller: FailoverController,
    pub(crate) stats: Arc<CacheStats>,
    /// Per-entity shared state, keyed by entity name
    pub(crate) entities: Mutex<HashMap<String, RegisteredEntity>>,
}

#[derive(Clone)]
pub struct CacheManager {
    ctx: Arc<CacheContext>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("cache_version", &self.ctx.config.cache_version)
            .field("shard_mode", &self.ctx.config.shard_mode)
            .field("failover", &self.ctx.controller)
            .finish()
    }
}

impl CacheManager {
    /// Build a manager without connecting. Call [`CacheManager::start`] next.
    pub fn new(config: CacheConfig, connector: Arc<dyn RemoteConnector>) -> Result<Self, CacheError> {
        config.validate()?;
        let stats = Arc::new(CacheStats::new());
        let controller = FailoverController::new(config.clone(), connector, Arc::clone(&stats));
        Ok(Self {
            ctx: Arc::new(CacheContext {
                config,
                controller,
                stats,
                entities: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Build a manager over redis endpoints and connect it.
    pub async fn connect_redis(config: CacheConfig) -> Result<Self, CacheError> {
        let manager = Self::new(config, Arc::new(RedisConnector))?;
        manager.start().await;
        Ok(manager)
    }

    /// Connect the remote tier. An unreachable remote is not fatal: the
    /// controller degrades and keeps retrying after its cool-down.
    pub async fn start(&self) {
        match self.ctx.controller.connect().await {
            Ok(()) => info!(
                "Cache manager started (version {}, shard_mode: {}, state: {:?})",
                self.ctx.config.cache_version,
                self.ctx.config.shard_mode,
                self.ctx.controller.state()
            ),
            Err(e) => warn!("Remote cache unavailable at startup: {}. Continuing degraded.", e),
        }
    }

    /// Cache for entity `name` using JSON encoding. Every call with the same
    /// name returns a handle on the same local store and in-flight map; asking
    /// for it with another value type is a `Config` error.
    pub fn entity<V: Cacheable>(&self, name: impl Into<String>) -> Result<EntityCache<V>, CacheError> {
        self.entity_builder(name).build()
    }

    pub fn entity_builder<V: Cacheable>(&self, name: impl Into<String>) -> EntityCacheBuilder<V> {
        EntityCacheBuilder::new(Arc::clone(&self.ctx), name)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.ctx.config
    }

    pub fn failover(&self) -> &FailoverController {
        &self.ctx.controller
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Stop background reconnect and health tasks and drop the connection.
    pub fn shutdown(&self) {
        self.ctx.controller.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryConnector;
    use crate::{ConnectionState, Endpoints};

    #[test]
    fn test_invalid_config_rejected() {
        let config = CacheConfig {
            cache_version: String::new(),
            ..Default::default()
        };
        let result = CacheManager::new(config, Arc::new(MemoryConnector::new(&[])));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_connects_first_endpoint() {
        let connector = Arc::new(MemoryConnector::new(&["redis://a", "redis://b"]));
        let config = CacheConfig {
            endpoints: Endpoints::Url("redis://a,redis://b".into()),
            health_check_interval_ms: 0,
            ..Default::default()
        };
        let manager = CacheManager::new(config, connector.clone()).unwrap();
        manager.start().await;
        assert_eq!(manager.failover().state(), ConnectionState::Connected { index: 0 });
        assert_eq!(connector.attempts("redis://b"), 0);
        manager.shutdown();
        assert_eq!(manager.failover().state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_survives_unreachable_remote() {
        let connector = Arc::new(MemoryConnector::new(&["redis://a"]));
        connector.take_down("redis://a");
        let config = CacheConfig {
            endpoints: Endpoints::Url("redis://a".into()),
            max_connect_attempts: 2,
            ..Default::default()
        };
        let manager = CacheManager::new(config, connector.clone()).unwrap();
        manager.start().await;
        assert!(manager.failover().is_degraded());
        assert_eq!(connector.attempts("redis://a"), 2);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_entities_have_separate_local_stores() {
        let manager = CacheManager::new(CacheConfig::default(), Arc::new(MemoryConnector::new(&[])))
            .unwrap();
        manager.start().await;
        let users = manager.entity::<String>("users").unwrap();
        let teams = manager.entity::<String>("teams").unwrap();
        let fetch = || async { Ok::<_, crate::BoxError>(Some("x".to_owned())) };

        users
            .get_or_fetch("all", fetch, Default::default())
            .await
            .unwrap();
        assert_eq!(users.local_len().await, 1);
        assert_eq!(teams.local_len().await, 0);
        assert_ne!(
            users.key_for(&"all".into()),
            teams.key_for(&"all".into())
        );
        assert_eq!(manager.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_handles_on_one_entity_share_state() {
        let manager = CacheManager::new(CacheConfig::default(), Arc::new(MemoryConnector::new(&[])))
            .unwrap();
        manager.start().await;
        let reader = manager.entity::<String>("users").unwrap();
        let writer = manager.entity::<String>("users").unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fetch = |value: &'static str| {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Ok::<_, crate::BoxError>(Some(value.to_owned()))
            }
        };

        let (a, b) = tokio::join!(
            reader.get_or_fetch("all", fetch("old"), Default::default()),
            writer.get_or_fetch("all", fetch("old"), Default::default()),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(writer.local_len().await, 1);

        let removed = writer
            .invalidate_by_tags(&[crate::Tag::entity("users")])
            .await;
        assert_eq!(removed, 1);
        let fresh = reader
            .get_or_fetch("all", fetch("new"), Default::default())
            .await
            .unwrap();
        assert_eq!(fresh.as_deref().map(String::as_str), Some("new"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_conflicting_value_type_rejected() {
        let manager = CacheManager::new(CacheConfig::default(), Arc::new(MemoryConnector::new(&[])))
            .unwrap();
        manager.entity::<String>("users").unwrap();
        assert!(matches!(
            manager.entity::<u64>("users"),
            Err(CacheError::Config(_))
        ));
        assert!(manager.entity::<u64>("orders").is_ok());
    }
}
