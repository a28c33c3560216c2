//! querycache - Hybrid query cache
//!
//! Sits between an application and its source of truth (usually a database)
//! and memoizes query results:
//! - Remote: redis, shared across instances, with ordered multi-endpoint failover
//! - Local: in-process Moka cache, used only while the remote tier is degraded
//! - Source: whatever async query the caller hands to `get_or_fetch`
//!
//! The cache supports:
//! - Deterministic keys from structured query descriptions
//! - Negative caching of empty results
//! - Tag-based invalidation, remote and local
//! - Coalescing of concurrent identical misses into one source query
//! - Shard mode, where no local state is ever kept

mod config;
mod entity_cache;
mod error;
mod failover;
pub mod key;
mod local_store;
mod manager;
mod remote;
mod stats;
mod tags;

#[cfg(test)]
mod test_support;

pub use config::{CacheConfig, EndpointConfig, EndpointOptions, Endpoints};
pub use entity_cache::{
    Cacheable, EntityCache, EntityCacheBuilder, FetchOptions, JsonCodec, ValueCodec,
};
pub use error::{BoxError, CacheError};
pub use failover::{ActiveRemote, ConnectionState, FailoverController, FailoverSnapshot};
pub use key::{Clause, Op, Query, QueryDescription};
pub use local_store::{Cached, LocalStore};
pub use manager::CacheManager;
pub use remote::{NEGATIVE_MARKER, RedisConnector, RedisStore, RemoteConnector, RemoteStore};
pub use stats::{CacheStats, HitSource, StatsSnapshot};
pub use tags::{Tag, ValueTagger};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
