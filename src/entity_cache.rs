//! Per-entity cache router with request coalescing
//!
//! [`EntityCache::get_or_fetch`] resolves a query against whichever backend is
//! active:
//! - the remote store while the failover controller is connected
//! - otherwise the local store, unless shard mode disabled it
//! - otherwise nothing: every call goes straight to the source
//!
//! Concurrent misses for the same key are coalesced: the first caller spawns
//! one resolver task and every caller, the first included, waits on its
//! result. The resolver writes the cache before it leaves the in-flight map,
//! so a caller arriving afterwards always finds the written entry. Because the
//! resolver runs on its own task, a caller that gives up does not cancel the
//! source query for everyone else.
//!
//! Any failure inside the cache degrades to a miss. Only the source query's
//! own failure reaches the caller.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::failover::ActiveRemote;
use crate::key::{self, Query};
use crate::local_store::{Cached, LocalStore};
use crate::manager::CacheContext;
use crate::remote::{NEGATIVE_MARKER, with_timeout};
use crate::stats::HitSource;
use crate::tags::{Tag, ValueTagger, invalidate_remote, merge_tags, remote_tag_key};
use crate::{BoxError, CacheError};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Serialize/deserialize pair for values stored remotely
pub trait ValueCodec<V>: Send + Sync + 'static {
    fn encode(&self, value: &V) -> Result<String, CacheError>;
    fn decode(&self, payload: &str) -> Result<V, CacheError>;
}

/// JSON codec via serde_json
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<V: Cacheable> ValueCodec<V> for JsonCodec {
    fn encode(&self, value: &V) -> Result<String, CacheError> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, payload: &str) -> Result<V, CacheError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Per-call TTL and tags
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<Tag>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }
}

type FetchResult<V> = Result<Option<Arc<V>>, CacheError>;

/// Represents an in-flight source query that other requests can wait on
type InFlightFetch<V> = watch::Receiver<Option<FetchResult<V>>>;
type InFlightSender<V> = watch::Sender<Option<FetchResult<V>>>;
type InFlightMap<V> = Arc<Mutex<HashMap<String, InFlightFetch<V>>>>;

/// Ensures the in-flight entry is removed and waiters are woken even if the
/// resolver panics or is aborted.
struct InFlightGuard<V: Cacheable> {
    key: String,
    in_flight: InFlightMap<V>,
    tx: Option<InFlightSender<V>>,
}

impl<V: Cacheable> InFlightGuard<V> {
    fn complete(mut self, result: FetchResult<V>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

impl<V: Cacheable> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err(CacheError::Cancelled)));
        }
        self.in_flight.lock().remove(&self.key);
    }
}

enum Backend {
    Remote(ActiveRemote),
    Local,
    PassThrough,
}

/// State shared by every handle on one entity name: the local store with
/// its tag index, the in-flight map and the value tagger.
struct EntityState<V: Cacheable> {
    local: LocalStore<V>,
    in_flight: InFlightMap<V>,
    tagger: RwLock<Option<ValueTagger<V>>>,
}

/// Registry slot for one entity name
pub(crate) struct RegisteredEntity {
    codec: TypeId,
    state: Arc<dyn Any + Send + Sync>,
}

/// Look up the shared state of `entity`, creating it on first use. A second
/// registration with another value type or codec is rejected.
fn shared_state<V: Cacheable, C: ValueCodec<V>>(
    ctx: &CacheContext,
    entity: &str,
) -> Result<Arc<EntityState<V>>, CacheError> {
    let mut entities = ctx.entities.lock();
    if let Some(existing) = entities.get(entity) {
        if existing.codec != TypeId::of::<C>() {
            return Err(CacheError::Config(format!(
                "entity {} is already cached with a different codec",
                entity
            )));
        }
        return Arc::clone(&existing.state)
            .downcast::<EntityState<V>>()
            .map_err(|_| {
                CacheError::Config(format!(
                    "entity {} is already cached with a different value type",
                    entity
                ))
            });
    }

    let local = if ctx.config.shard_mode {
        LocalStore::disabled()
    } else {
        LocalStore::new(ctx.config.max_local_entries)
    };
    let state = Arc::new(EntityState {
        local,
        in_flight: Arc::new(Mutex::new(HashMap::new())),
        tagger: RwLock::new(None),
    });
    entities.insert(
        entity.to_owned(),
        RegisteredEntity {
            codec: TypeId::of::<C>(),
            state: Arc::clone(&state) as Arc<dyn Any + Send + Sync>,
        },
    );
    debug!("Registered cached entity: {}", entity);
    Ok(state)
}

struct EntityInner<V: Cacheable, C: ValueCodec<V>> {
    entity: String,
    ctx: Arc<CacheContext>,
    state: Arc<EntityState<V>>,
    codec: C,
}

/// Cache for one entity type
pub struct EntityCache<V: Cacheable, C: ValueCodec<V> = JsonCodec> {
    inner: Arc<EntityInner<V, C>>,
}

impl<V: Cacheable, C: ValueCodec<V>> Clone for EntityCache<V, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Cacheable, C: ValueCodec<V>> std::fmt::Debug for EntityCache<V, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("entity", &self.inner.entity)
            .field("local", &self.inner.state.local)
            .finish()
    }
}

/// Configures an [`EntityCache`]. Every handle built for the same entity name
/// shares one local store and one in-flight map.
pub struct EntityCacheBuilder<V: Cacheable, C: ValueCodec<V> = JsonCodec> {
    entity: String,
    ctx: Arc<CacheContext>,
    codec: C,
    tagger: Option<ValueTagger<V>>,
}

impl<V: Cacheable> EntityCacheBuilder<V, JsonCodec> {
    pub(crate) fn new(ctx: Arc<CacheContext>, entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ctx,
            codec: JsonCodec,
            tagger: None,
        }
    }
}

impl<V: Cacheable, C: ValueCodec<V>> EntityCacheBuilder<V, C> {
    pub fn codec<C2: ValueCodec<V>>(self, codec: C2) -> EntityCacheBuilder<V, C2> {
        EntityCacheBuilder {
            entity: self.entity,
            ctx: self.ctx,
            codec,
            tagger: self.tagger,
        }
    }

    /// Derive extra tags from every positive value written. Replaces the
    /// tagger of every existing handle on this entity.
    pub fn tagger<F>(mut self, tagger: F) -> Self
    where
        F: Fn(&V) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.tagger = Some(Arc::new(tagger));
        self
    }

    pub fn build(self) -> Result<EntityCache<V, C>, CacheError> {
        let state = shared_state::<V, C>(&self.ctx, &self.entity)?;
        if let Some(tagger) = self.tagger {
            *state.tagger.write() = Some(tagger);
        }
        Ok(EntityCache {
            inner: Arc::new(EntityInner {
                entity: self.entity,
                ctx: self.ctx,
                state,
                codec: self.codec,
            }),
        })
    }
}

impl<V: Cacheable, C: ValueCodec<V>> EntityCache<V, C> {
    pub fn entity(&self) -> &str {
        &self.inner.entity
    }

    /// Full cache key for `query`
    pub fn key_for(&self, query: &Query) -> String {
        key::cache_key(&self.inner.ctx.config.cache_version, &self.inner.entity, query)
    }

    /// Live entries in this entity's local store
    pub async fn local_len(&self) -> u64 {
        self.inner.state.local.len().await
    }

    /// Return the cached result for `query`, or run `fetch` once (no matter
    /// how many callers ask concurrently), cache its result and return it.
    ///
    /// `Ok(None)` is a legitimate empty result and is cached as such.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        query: impl Into<Query>,
        fetch: F,
        options: FetchOptions,
    ) -> Result<Option<Arc<V>>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, BoxError>> + Send + 'static,
    {
        let key = self.key_for(&query.into());

        let rx = {
            let mut in_flight = self.inner.state.in_flight.lock();
            if let Some(rx) = in_flight.get(&key) {
                debug!("Joining in-flight query for key: {}", key);
                self.inner.ctx.stats.record_coalesced();
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                in_flight.insert(key.clone(), rx.clone());
                let guard = InFlightGuard {
                    key: key.clone(),
                    in_flight: Arc::clone(&self.inner.state.in_flight),
                    tx: Some(tx),
                };
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    let result = inner.resolve(&key, fetch, options).await;
                    guard.complete(result);
                });
                rx
            }
        };

        wait_for_result(rx).await
    }

    /// Remove every entry written with any of `tags`. Returns the number of
    /// keys removed.
    pub async fn invalidate_by_tags(&self, tags: &[Tag]) -> u64 {
        let inner = &self.inner;
        let mut removed = 0;
        if let Some(remote) = inner.ctx.controller.active() {
            match invalidate_remote(
                remote.store.as_ref(),
                &inner.ctx.config.cache_version,
                tags,
                inner.ctx.config.operation_timeout(),
            )
            .await
            {
                Ok(n) => {
                    inner.ctx.controller.report_success(&remote);
                    removed += n;
                }
                Err(e) => {
                    warn!("Remote tag invalidation failed for {:?}: {}", tags, e);
                    inner.ctx.controller.report(&remote, &e);
                }
            }
        }
        // Local entries may outlive a failover; clear them as well
        removed += inner.state.local.invalidate_tags(tags).await;
        inner.ctx.stats.record_clears(removed);
        debug!("Invalidated {} keys for tags {:?}", removed, tags);
        removed
    }

    /// Invalidate a record after a write or delete at the domain layer:
    /// its primary-key tag plus any tags derived from the value.
    pub async fn invalidate_record(
        &self,
        primary_key: impl std::fmt::Display,
        value: Option<&V>,
    ) -> u64 {
        let mut tags = vec![Tag::record(&self.inner.entity, primary_key)];
        if let (Some(tagger), Some(value)) = (self.inner.tagger(), value) {
            tags = merge_tags(tags, tagger(value));
        }
        self.invalidate_by_tags(&tags).await
    }

    /// Drop every key of this entity. Locally this is a namespace prefix clear.
    pub async fn invalidate_entity(&self) -> u64 {
        let inner = &self.inner;
        let mut removed = self
            .invalidate_by_tags(&[Tag::entity(&inner.entity)])
            .await;
        let prefix = key::entity_prefix(&inner.ctx.config.cache_version, &inner.entity);
        let local = inner.state.local.clear_by_prefix(&prefix).await;
        inner.ctx.stats.record_clears(local);
        removed += local;
        removed
    }

    /// Remove the entry for one query.
    pub async fn clear(&self, query: impl Into<Query>) {
        let inner = &self.inner;
        let key = self.key_for(&query.into());
        if let Some(remote) = inner.ctx.controller.active() {
            let timeout = inner.ctx.config.operation_timeout();
            if let Err(e) = with_timeout(timeout, remote.store.delete(&key)).await {
                warn!("Remote DEL error for key {}: {}", key, e);
                inner.ctx.controller.report(&remote, &e);
            }
        }
        inner.state.local.delete(&key).await;
        inner.ctx.stats.record_clears(1);
    }
}

async fn wait_for_result<V: Cacheable>(mut rx: InFlightFetch<V>) -> FetchResult<V> {
    loop {
        if let Some(result) = rx.borrow().as_ref() {
            return result.clone();
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone().unwrap_or(Err(CacheError::Cancelled));
        }
    }
}

impl<V: Cacheable, C: ValueCodec<V>> EntityInner<V, C> {
    fn tagger(&self) -> Option<ValueTagger<V>> {
        self.state.tagger.read().clone()
    }

    fn backend(&self) -> Backend {
        if let Some(remote) = self.ctx.controller.active() {
            Backend::Remote(remote)
        } else if self.state.local.is_enabled() {
            Backend::Local
        } else {
            Backend::PassThrough
        }
    }

    async fn resolve<F, Fut>(&self, key: &str, fetch: F, options: FetchOptions) -> FetchResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        if let Some(hit) = self.probe(key).await {
            return Ok(match hit {
                Cached::Value(v) => Some(v),
                Cached::Negative => None,
            });
        }
        self.ctx.stats.record_miss();
        debug!("Cache miss - querying source for key: {}", key);

        let value = match fetch().await {
            Ok(v) => v.map(Arc::new),
            Err(e) => {
                error!("Source query failed for key {}: {}", key, e);
                return Err(CacheError::from_source(e));
            }
        };

        self.store(key, value.clone(), &options).await;
        Ok(value)
    }

    async fn probe(&self, key: &str) -> Option<Cached<Arc<V>>> {
        match self.backend() {
            Backend::Remote(remote) => self.probe_remote(&remote, key).await,
            Backend::Local => {
                let hit = self.state.local.get(key).await;
                if let Some(hit) = &hit {
                    self.ctx
                        .stats
                        .record_hit(HitSource::Local, matches!(hit, Cached::Negative));
                }
                hit
            }
            Backend::PassThrough => None,
        }
    }

    async fn probe_remote(&self, remote: &ActiveRemote, key: &str) -> Option<Cached<Arc<V>>> {
        let timeout = self.ctx.config.operation_timeout();
        let payload = match with_timeout(timeout, remote.store.get(key)).await {
            Ok(payload) => {
                self.ctx.controller.report_success(remote);
                payload?
            }
            Err(e) => {
                warn!("Remote GET error for key {} ({}). Falling back to source.", key, e);
                self.ctx.controller.report(remote, &e);
                return None;
            }
        };

        if payload == NEGATIVE_MARKER {
            debug!("Remote negative hit for key: {}", key);
            self.ctx.stats.record_hit(HitSource::Remote, true);
            return Some(Cached::Negative);
        }

        match self.codec.decode(&payload) {
            Ok(value) => {
                debug!("Remote hit for key: {}", key);
                self.ctx.stats.record_hit(HitSource::Remote, false);
                Some(Cached::Value(Arc::new(value)))
            }
            Err(e) => {
                warn!(
                    "Failed to decode cached value for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                self.ctx.stats.record_error();
                if let Err(del_err) = with_timeout(timeout, remote.store.delete(key)).await {
                    warn!("Failed to delete corrupt entry for key {}: {}", key, del_err);
                    self.ctx.controller.report(remote, &del_err);
                }
                None
            }
        }
    }

    async fn store(&self, key: &str, value: Option<Arc<V>>, options: &FetchOptions) {
        let ttl = options.ttl.unwrap_or_else(|| self.ctx.config.default_ttl());
        let mut tags = merge_tags(vec![Tag::entity(&self.entity)], options.tags.iter().cloned());
        if let (Some(tagger), Some(value)) = (self.tagger(), &value) {
            tags = merge_tags(tags, tagger(value.as_ref()));
        }

        // Re-evaluated: the backend may have changed while the source ran
        match self.backend() {
            Backend::Remote(remote) => {
                let payload = match &value {
                    Some(v) => match self.codec.encode(v) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("Failed to encode value for key {}: {}. Not caching.", key, e);
                            self.ctx.stats.record_error();
                            return;
                        }
                    },
                    None => NEGATIVE_MARKER.to_owned(),
                };
                let version = &self.ctx.config.cache_version;
                let tag_keys: Vec<String> =
                    tags.iter().map(|t| remote_tag_key(version, t)).collect();

                let write = remote.store.set_with_tags_atomic(
                    key,
                    &payload,
                    ttl,
                    &tag_keys,
                    self.ctx.config.tag_ttl(),
                );
                match with_timeout(self.ctx.config.operation_timeout(), write).await {
                    Ok(()) => {
                        self.ctx.controller.report_success(&remote);
                        self.ctx.stats.record_set();
                    }
                    Err(e) => {
                        warn!("Remote SET error for key {}: {}. Continuing.", key, e);
                        self.ctx.controller.report(&remote, &e);
                    }
                }
            }
            Backend::Local => {
                self.state.local.set(key, value, ttl, &tags).await;
                self.ctx.stats.record_set();
            }
            Backend::PassThrough => {}
        }
    }
}
