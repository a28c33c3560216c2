//! In-memory remote backend with injectable failures, for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::remote::{RemoteConnector, RemoteStore};
use crate::{CacheError, EndpointConfig};

/// Route `tracing` output through the test harness; `RUST_LOG` filters it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct MemoryState {
    values: HashMap<String, (String, Instant)>,
    sets: HashMap<String, (HashSet<String>, Instant)>,
}

impl MemoryState {
    fn drop_expired_set(&mut self, tag_key: &str, now: Instant) {
        if matches!(self.sets.get(tag_key), Some((_, expires_at)) if *expires_at <= now) {
            self.sets.remove(tag_key);
        }
    }
}

/// Remote store kept in process memory
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
    failing: AtomicBool,
    hanging: AtomicBool,
    pub gets: AtomicUsize,
    pub flushes: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent call fails with a connectivity error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every subsequent call never completes
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    /// Write a raw value directly, bypassing tags
    pub fn seed(&self, key: &str, value: &str) {
        self.state.lock().values.insert(
            key.to_owned(),
            (value.to_owned(), Instant::now() + Duration::from_secs(3600)),
        );
    }

    pub fn has_key(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.drop_expired_set(key, now);
        state.values.contains_key(key) || state.sets.contains_key(key)
    }

    /// Remaining lifetime of a tag set
    pub fn tag_ttl(&self, tag_key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.drop_expired_set(tag_key, now);
        state
            .sets
            .get(tag_key)
            .map(|(_, expires_at)| expires_at.duration_since(now))
    }

    pub fn value_count(&self) -> usize {
        self.state.lock().values.len()
    }

    async fn check(&self) -> Result<(), CacheError> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Connectivity("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check().await?;
        self.gets.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired = matches!(state.values.get(key), Some((_, expires_at)) if *expires_at <= now);
        if expired {
            state.values.remove(key);
            return Ok(None);
        }
        Ok(state.values.get(key).map(|(value, _)| value.clone()))
    }

    async fn set_with_tags_atomic(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        tag_keys: &[String],
        tag_ttl: Duration,
    ) -> Result<(), CacheError> {
        self.check().await?;
        let now = Instant::now();
        let tag_expiry = now + tag_ttl.max(ttl);
        let mut state = self.state.lock();
        state
            .values
            .insert(key.to_owned(), (value.to_owned(), now + ttl));
        for tag_key in tag_keys {
            state.drop_expired_set(tag_key, now);
            let (members, expires_at) = state
                .sets
                .entry(tag_key.clone())
                .or_insert_with(|| (HashSet::new(), tag_expiry));
            members.insert(key.to_owned());
            // same rule as the redis script: extend, never shorten
            *expires_at = (*expires_at).max(tag_expiry);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check().await?;
        self.state.lock().values.remove(key);
        Ok(())
    }

    async fn union_keys_for_tags(&self, tag_keys: &[String]) -> Result<Vec<String>, CacheError> {
        self.check().await?;
        let now = Instant::now();
        let state = self.state.lock();
        let keys: HashSet<String> = tag_keys
            .iter()
            .filter_map(|t| state.sets.get(t))
            .filter(|(_, expires_at)| *expires_at > now)
            .flat_map(|(members, _)| members)
            .cloned()
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn delete_keys_and_tags(
        &self,
        keys: &[String],
        tag_keys: &[String],
    ) -> Result<(), CacheError> {
        self.check().await?;
        let mut state = self.state.lock();
        for key in keys {
            state.values.remove(key);
        }
        for tag_key in tag_keys {
            state.sets.remove(tag_key);
        }
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        self.check().await?;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.values.clear();
        state.sets.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check().await
    }
}

/// Connector handing out [`MemoryRemote`]s by endpoint URL
#[derive(Default)]
pub struct MemoryConnector {
    remotes: HashMap<String, Arc<MemoryRemote>>,
    refused: Mutex<HashSet<String>>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl MemoryConnector {
    pub fn new(urls: &[&str]) -> Self {
        Self {
            remotes: urls
                .iter()
                .map(|u| ((*u).to_owned(), Arc::new(MemoryRemote::new())))
                .collect(),
            ..Default::default()
        }
    }

    pub fn remote(&self, url: &str) -> Arc<MemoryRemote> {
        Arc::clone(&self.remotes[url])
    }

    /// Refuse new connections to `url`; also fails calls on existing ones.
    pub fn take_down(&self, url: &str) {
        self.refused.lock().insert(url.to_owned());
        if let Some(remote) = self.remotes.get(url) {
            remote.set_failing(true);
        }
    }

    pub fn bring_up(&self, url: &str) {
        self.refused.lock().remove(url);
        if let Some(remote) = self.remotes.get(url) {
            remote.set_failing(false);
        }
    }

    pub fn attempts(&self, url: &str) -> usize {
        self.attempts.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RemoteConnector for MemoryConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn RemoteStore>, CacheError> {
        let url = endpoint.connection_url();
        *self.attempts.lock().entry(url.to_owned()).or_default() += 1;
        if self.refused.lock().contains(url) {
            return Err(CacheError::Connectivity(format!("{} refused", url)));
        }
        match self.remotes.get(url) {
            Some(remote) => Ok(Arc::clone(remote) as Arc<dyn RemoteStore>),
            None => Err(CacheError::Connectivity(format!("{} unknown host", url))),
        }
    }
}
