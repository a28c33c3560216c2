//! Cache configuration

use std::time::Duration;

use serde::Deserialize;

use crate::CacheError;

/// Configuration for the hybrid query cache.
///
/// Durations are expressed in milliseconds so the struct can be loaded
/// directly from JSON/YAML. Both `snake_case` and `camelCase` keys are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Remote endpoints, tried in order
    pub endpoints: Endpoints,
    /// Disable the local store entirely
    #[serde(alias = "shardMode")]
    pub shard_mode: bool,
    /// Prefix of every key; bumping it orphans all previously written keys
    #[serde(alias = "cacheVersion")]
    pub cache_version: String,
    #[serde(alias = "defaultTtlMs")]
    pub default_ttl_ms: u64,
    /// Maximum number of positive entries in the local store
    #[serde(alias = "maxLocalEntries")]
    pub max_local_entries: u64,
    /// Errors within `error_tolerance_interval_ms` that force a failover
    #[serde(alias = "errorToleranceCount")]
    pub error_tolerance_count: usize,
    #[serde(alias = "errorToleranceIntervalMs")]
    pub error_tolerance_interval_ms: u64,
    /// Wait in degraded mode before retrying the endpoint list from the top
    #[serde(alias = "reconnectCooldownMs")]
    pub reconnect_cooldown_ms: u64,
    #[serde(alias = "operationTimeoutMs")]
    pub operation_timeout_ms: u64,
    #[serde(alias = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,
    #[serde(alias = "maxConnectAttempts")]
    pub max_connect_attempts: u32,
    #[serde(alias = "backoffStepMs")]
    pub backoff_step_ms: u64,
    #[serde(alias = "backoffCapMs")]
    pub backoff_cap_ms: u64,
    /// PING interval while connected, 0 disables the health check
    #[serde(alias = "healthCheckIntervalMs")]
    pub health_check_interval_ms: u64,
    /// Consecutive protocol errors that count as one connectivity error
    #[serde(alias = "protocolErrorThreshold")]
    pub protocol_error_threshold: u32,
    /// Minimum lifetime of remote tag sets
    #[serde(alias = "tagTtlMs")]
    pub tag_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            shard_mode: false,
            cache_version: "v1".to_owned(),
            default_ttl_ms: 300_000, // 5 minutes
            max_local_entries: 1000,
            error_tolerance_count: 3,
            error_tolerance_interval_ms: 10_000,
            reconnect_cooldown_ms: 300_000,
            operation_timeout_ms: 2000,
            connect_timeout_ms: 3000,
            max_connect_attempts: 5,
            backoff_step_ms: 500,
            backoff_cap_ms: 2000,
            health_check_interval_ms: 30_000,
            protocol_error_threshold: 5,
            tag_ttl_ms: 86_400_000, // 24 hours
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn error_tolerance_interval(&self) -> Duration {
        Duration::from_millis(self.error_tolerance_interval_ms)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }

    pub fn tag_ttl(&self) -> Duration {
        Duration::from_millis(self.tag_ttl_ms)
    }

    /// Delay before connect attempt `attempt` (1-based): `min(attempt * step, cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = u64::from(attempt)
            .saturating_mul(self.backoff_step_ms)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }

    /// Normalized endpoint list
    pub fn endpoint_list(&self) -> Vec<EndpointConfig> {
        self.endpoints.to_list()
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.cache_version.is_empty() {
            return Err(CacheError::Config("cache_version must not be empty".into()));
        }
        if self.max_local_entries == 0 {
            return Err(CacheError::Config("max_local_entries must be > 0".into()));
        }
        if self.error_tolerance_count == 0 {
            return Err(CacheError::Config("error_tolerance_count must be > 0".into()));
        }
        if self.max_connect_attempts == 0 {
            return Err(CacheError::Config("max_connect_attempts must be > 0".into()));
        }
        if self.operation_timeout_ms == 0 {
            return Err(CacheError::Config("operation_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Structured connection options for a single endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointOptions {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: Option<i64>,
    #[serde(default)]
    pub tls: bool,
}

fn default_port() -> u16 {
    6379
}

/// Endpoint configuration as it may appear in configuration files
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Endpoints {
    /// A single URL, or several separated by commas
    Url(String),
    Urls(Vec<String>),
    Options(Vec<EndpointOptions>),
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints::Urls(Vec::new())
    }
}

impl Endpoints {
    pub fn to_list(&self) -> Vec<EndpointConfig> {
        match self {
            Endpoints::Url(s) => split_urls(std::iter::once(s.as_str())),
            Endpoints::Urls(list) => split_urls(list.iter().map(String::as_str)),
            Endpoints::Options(opts) => opts.iter().map(EndpointConfig::from_options).collect(),
        }
    }
}

fn split_urls<'a>(items: impl Iterator<Item = &'a str>) -> Vec<EndpointConfig> {
    items
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(EndpointConfig::new)
        .collect()
}

/// One normalized remote endpoint.
///
/// Credentials given as structured options are kept out of the URL so they
/// never need escaping; connection strings carry their own.
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    url: String,
    username: Option<String>,
    password: Option<String>,
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("url", &self.redacted())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    fn from_options(opts: &EndpointOptions) -> Self {
        let scheme = if opts.tls { "rediss" } else { "redis" };
        let db = opts.db.map(|db| format!("/{}", db)).unwrap_or_default();
        Self {
            url: format!("{}://{}:{}{}", scheme, opts.host, opts.port, db),
            username: opts.username.clone(),
            password: opts.password.clone(),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn connection_url(&self) -> &str {
        &self.url
    }

    /// URL with any password replaced, for logging
    pub fn redacted(&self) -> String {
        let url = &self.url;
        if let Some(at_pos) = url.find('@') {
            let head = &url[..at_pos];
            let scheme_end = head.find("://").map(|p| p + 3).unwrap_or(0);
            if let Some(colon_pos) = head[scheme_end..].find(':') {
                let colon_pos = scheme_end + colon_pos;
                return format!("{}***{}", &url[..=colon_pos], &url[at_pos..]);
            }
        }
        url.clone()
    }
}
