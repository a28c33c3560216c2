//! Remote store adapter
//!
//! [`RemoteStore`] is one connected endpoint treated as a key-value store with
//! TTLs, sets and atomic batches. [`RedisStore`] implements it over a
//! `redis::aio::ConnectionManager`; [`RemoteConnector`] produces stores for the
//! failover controller so tests can substitute an in-memory backend.
//!
//! Callers never see these errors directly: every failure is classified,
//! reported to the failover controller and downgraded to a miss.

use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, ConnectionInfo, IntoConnectionInfo};
use tracing::debug;

use crate::{CacheError, EndpointConfig};

/// Stored in place of a serialized value when the source returned nothing.
/// Cannot collide with JSON output, which never starts with a control character.
pub const NEGATIVE_MARKER: &str = "\u{1}nil";

/// One connected remote endpoint
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write `value` with `ttl` and add `key` to every tag set, as one atomic
    /// batch. Each tag set's expiry is extended to `max(tag_ttl, ttl)` when
    /// shorter, and never shortened.
    async fn set_with_tags_atomic(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        tag_keys: &[String],
        tag_ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Union of the members of every tag set
    async fn union_keys_for_tags(&self, tag_keys: &[String]) -> Result<Vec<String>, CacheError>;

    /// Delete `keys` and the tag sets in one batch
    async fn delete_keys_and_tags(
        &self,
        keys: &[String],
        tag_keys: &[String],
    ) -> Result<(), CacheError>;

    /// Drop the endpoint's entire keyspace
    async fn flush_all(&self) -> Result<(), CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

/// Opens connections to endpoints
#[async_trait]
pub trait RemoteConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn RemoteStore>, CacheError>;
}

/// Run a remote call with a bounded timeout.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout(timeout)),
    }
}

/// SET the entry, add it to every tag set and push each set's expiry out to
/// at least ARGV[3]. A set's expiry is never shortened, so a key stays
/// reachable from its tags for as long as it lives.
static SET_WITH_TAGS: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
local tag_ttl = tonumber(ARGV[3])
for i = 2, #KEYS do
  redis.call('SADD', KEYS[i], KEYS[1])
  if redis.call('PTTL', KEYS[i]) < tag_ttl then
    redis.call('PEXPIRE', KEYS[i], tag_ttl)
  end
end
return 1
",
    )
});

fn as_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis-backed remote store using ConnectionManager
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: redis::aio::ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection_manager", &"ConnectionManager")
            .finish()
    }
}

impl RedisStore {
    pub fn new(connection_manager: redis::aio::ConnectionManager) -> Self {
        Self { connection_manager }
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection_manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_with_tags_atomic(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        tag_keys: &[String],
        tag_ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection_manager.clone();
        let mut invocation = SET_WITH_TAGS.key(key);
        for tag_key in tag_keys {
            invocation.key(tag_key);
        }
        invocation
            .arg(value)
            .arg(as_millis(ttl))
            .arg(as_millis(tag_ttl.max(ttl)));
        let (): () = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection_manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn union_keys_for_tags(&self, tag_keys: &[String]) -> Result<Vec<String>, CacheError> {
        if tag_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection_manager.clone();
        let keys: Vec<String> = redis::cmd("SUNION")
            .arg(tag_keys)
            .query_async(&mut conn)
            .await?;
        Ok(keys)
    }

    async fn delete_keys_and_tags(
        &self,
        keys: &[String],
        tag_keys: &[String],
    ) -> Result<(), CacheError> {
        let doomed: Vec<&String> = keys.iter().chain(tag_keys.iter()).collect();
        if doomed.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection_manager.clone();
        redis::pipe()
            .atomic()
            .del(doomed)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
        debug!("Remote keyspace flushed");
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection_manager.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(CacheError::Protocol(format!("unexpected PING reply: {}", pong)))
        }
    }
}

/// Connection parameters for `endpoint`. Structured credentials are set on
/// the parsed info directly, so any characters are allowed in them.
pub(crate) fn connection_info(endpoint: &EndpointConfig) -> Result<ConnectionInfo, CacheError> {
    let mut info = endpoint.connection_url().into_connection_info().map_err(|e| {
        CacheError::Config(format!(
            "invalid redis endpoint {}: {}",
            endpoint.redacted(),
            e
        ))
    })?;
    if let Some(username) = endpoint.username() {
        info.redis.username = Some(username.to_owned());
    }
    if let Some(password) = endpoint.password() {
        info.redis.password = Some(password.to_owned());
    }
    Ok(info)
}

/// Connects to redis endpoints
#[derive(Debug, Clone, Default)]
pub struct RedisConnector;

#[async_trait]
impl RemoteConnector for RedisConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn RemoteStore>, CacheError> {
        let client = redis::Client::open(connection_info(endpoint)?).map_err(|e| {
            CacheError::Config(format!(
                "invalid redis endpoint {}: {}",
                endpoint.redacted(),
                e
            ))
        })?;
        let connection_manager = redis::aio::ConnectionManager::new(client).await?;
        let store = RedisStore::new(connection_manager);
        store.ping().await?;

        debug!("Redis endpoint connected: {}", endpoint.redacted());
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_marker_is_not_json() {
        assert!(serde_json::from_str::<serde_json::Value>(NEGATIVE_MARKER).is_err());
        let encoded = serde_json::to_string("\u{1}nil").unwrap();
        assert_ne!(encoded, NEGATIVE_MARKER);
    }

    #[test]
    fn test_as_millis_never_zero() {
        assert_eq!(as_millis(Duration::ZERO), 1);
        assert_eq!(as_millis(Duration::from_secs(2)), 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_bounds_hanging_calls() {
        let result: Result<(), CacheError> = with_timeout(
            Duration::from_secs(2),
            std::future::pending::<Result<(), CacheError>>(),
        )
        .await;
        assert!(matches!(result, Err(CacheError::Timeout(d)) if d == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_results_through() {
        let ok = with_timeout(Duration::from_secs(1), async { Ok::<_, CacheError>(5) }).await;
        assert_eq!(ok.unwrap(), 5);
        let err = with_timeout(Duration::from_secs(1), async {
            Err::<u32, _>(CacheError::Protocol("bad".into()))
        })
        .await;
        assert!(matches!(err, Err(CacheError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let result = RedisConnector
            .connect(&EndpointConfig::new("not a url"))
            .await;
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_structured_credentials_are_not_url_escaped() {
        let config: crate::CacheConfig = serde_json::from_str(
            r#"{"endpoints": [{"host": "cache-1", "username": "app", "password": "p@ss/w:rd", "db": 2}]}"#,
        )
        .unwrap();
        let info = connection_info(&config.endpoint_list()[0]).unwrap();
        assert!(matches!(&info.addr, redis::ConnectionAddr::Tcp(host, 6379) if host == "cache-1"));
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.username.as_deref(), Some("app"));
        assert_eq!(info.redis.password.as_deref(), Some("p@ss/w:rd"));
    }

    // Requires a running redis instance; run with `REDIS_URL=redis://... cargo test -- --ignored`
    #[tokio::test]
    #[ignore = "requires a running redis at REDIS_URL"]
    async fn test_redis_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let store = RedisConnector
            .connect(&EndpointConfig::new(url))
            .await
            .unwrap();
        let ttl = Duration::from_secs(30);
        let tag = "querycache-test:tag:users".to_owned();

        store
            .set_with_tags_atomic("querycache-test:k", "\"v\"", ttl, &[tag.clone()], ttl)
            .await
            .unwrap();
        assert_eq!(
            store.get("querycache-test:k").await.unwrap(),
            Some("\"v\"".to_owned())
        );
        let keys = store.union_keys_for_tags(&[tag.clone()]).await.unwrap();
        assert_eq!(keys, vec!["querycache-test:k".to_owned()]);
        store.delete_keys_and_tags(&keys, &[tag]).await.unwrap();
        assert_eq!(store.get("querycache-test:k").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "requires a running redis at REDIS_URL"]
    async fn test_redis_tag_set_expiry_only_grows() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let client = redis::Client::open(url).unwrap();
        let mut conn = redis::aio::ConnectionManager::new(client).await.unwrap();
        let store = RedisStore::new(conn.clone());
        let hour = Duration::from_secs(3600);
        let tag = "querycache-test#tag:expiry".to_owned();

        store
            .set_with_tags_atomic("querycache-test:long", "1", hour * 48, &[tag.clone()], hour * 24)
            .await
            .unwrap();
        store
            .set_with_tags_atomic("querycache-test:short", "2", Duration::from_secs(60), &[tag.clone()], hour * 24)
            .await
            .unwrap();

        let pttl: i64 = redis::cmd("PTTL").arg(&tag).query_async(&mut conn).await.unwrap();
        assert!(pttl > (hour * 47).as_millis() as i64);

        let keys = store.union_keys_for_tags(&[tag.clone()]).await.unwrap();
        store.delete_keys_and_tags(&keys, &[tag]).await.unwrap();
    }
}
