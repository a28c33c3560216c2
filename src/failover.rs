//! Endpoint failover controller
//!
//! Owns the ordered endpoint list and the single active remote connection.
//!
//! ```text
//! Disconnected -> Connecting -> Connected { index }
//!                     |  ^            |
//!    all endpoints    |  | next       | disconnect signal, failed PING,
//!    failed           v  | endpoint   | or >= N errors within W
//!                  Degraded <---------+
//!                     |
//!                     +-- after cool-down: index = 0, failed = {}, Connecting
//! ```
//!
//! Connecting to an endpoint retries with capped backoff before the endpoint
//! is marked failed. Landing on a different endpoint than the one last used
//! (or coming back from degraded mode) flushes that endpoint before it serves
//! reads, since its contents cannot be trusted.
//!
//! Reconnect, cool-down and health-check work runs on spawned tasks whose
//! handles live in the controller state, so [`FailoverController::shutdown`]
//! can cancel them deterministically.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::remote::{RemoteConnector, RemoteStore, with_timeout};
use crate::stats::CacheStats;
use crate::{CacheConfig, CacheError, EndpointConfig};

/// Connection state of the remote backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { index: usize },
    /// Every endpoint failed; waiting for the cool-down to retry
    Degraded,
}

/// Observable controller state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverSnapshot {
    pub state: ConnectionState,
    pub current_index: usize,
    pub failed_indexes: Vec<usize>,
    pub recent_errors: usize,
    pub endpoint_count: usize,
}

/// The connected remote store, stamped with the connection generation so
/// errors from a superseded connection are not charged to its successor.
#[derive(Clone)]
pub struct ActiveRemote {
    pub store: Arc<dyn RemoteStore>,
    generation: u64,
}

struct ControllerState {
    phase: ConnectionState,
    current_index: usize,
    failed: HashSet<usize>,
    errors: VecDeque<Instant>,
    protocol_streak: u32,
    active: Option<Arc<dyn RemoteStore>>,
    generation: u64,
    last_connected: Option<usize>,
    was_degraded: bool,
    reconnect: Option<JoinHandle<()>>,
    cooldown: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
    shut_down: bool,
}

struct Inner {
    endpoints: Vec<EndpointConfig>,
    connector: Arc<dyn RemoteConnector>,
    config: CacheConfig,
    stats: Arc<CacheStats>,
    state: Mutex<ControllerState>,
}

/// Manages the endpoint list, error window and reconnect scheduling
#[derive(Clone)]
pub struct FailoverController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FailoverController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverController")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl FailoverController {
    pub fn new(
        config: CacheConfig,
        connector: Arc<dyn RemoteConnector>,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoints: config.endpoint_list(),
                connector,
                config,
                stats,
                state: Mutex::new(ControllerState {
                    phase: ConnectionState::Disconnected,
                    current_index: 0,
                    failed: HashSet::new(),
                    errors: VecDeque::new(),
                    protocol_streak: 0,
                    active: None,
                    generation: 0,
                    last_connected: None,
                    was_degraded: false,
                    reconnect: None,
                    cooldown: None,
                    health: None,
                    shut_down: false,
                }),
            }),
        }
    }

    /// Connect to the first reachable endpoint. Exhausting the list leaves
    /// the controller degraded with a cool-down scheduled.
    pub async fn connect(&self) -> Result<(), CacheError> {
        if self.inner.endpoints.is_empty() {
            let mut state = self.inner.state.lock();
            state.phase = ConnectionState::Degraded;
            debug!("No remote endpoints configured; remote cache disabled");
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock();
            if matches!(
                state.phase,
                ConnectionState::Connecting | ConnectionState::Connected { .. }
            ) {
                return Ok(());
            }
            state.phase = ConnectionState::Connecting;
        }
        run_connect(&self.inner).await;
        match self.state() {
            ConnectionState::Connected { .. } => Ok(()),
            _ => Err(CacheError::Exhausted(self.inner.endpoints.len())),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    pub fn is_degraded(&self) -> bool {
        self.state() == ConnectionState::Degraded
    }

    /// The remote store to use, if connected
    pub fn active(&self) -> Option<ActiveRemote> {
        let state = self.inner.state.lock();
        match (state.phase, &state.active) {
            (ConnectionState::Connected { .. }, Some(store)) => Some(ActiveRemote {
                store: Arc::clone(store),
                generation: state.generation,
            }),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> FailoverSnapshot {
        let state = self.inner.state.lock();
        let mut failed_indexes: Vec<usize> = state.failed.iter().copied().collect();
        failed_indexes.sort_unstable();
        FailoverSnapshot {
            state: state.phase,
            current_index: state.current_index,
            failed_indexes,
            recent_errors: state.errors.len(),
            endpoint_count: self.inner.endpoints.len(),
        }
    }

    /// Account for an error raised by `remote`. Connectivity errors go into the
    /// sliding window; protocol errors only once they repeat.
    pub fn report(&self, remote: &ActiveRemote, err: &CacheError) {
        self.inner.stats.record_error();
        let mut state = self.inner.state.lock();
        if state.generation != remote.generation {
            return;
        }
        if err.is_protocol() {
            state.protocol_streak += 1;
            if state.protocol_streak < self.inner.config.protocol_error_threshold {
                debug!(
                    "Remote protocol error {} of {} tolerated: {}",
                    state.protocol_streak, self.inner.config.protocol_error_threshold, err
                );
                return;
            }
            state.protocol_streak = 0;
        } else if !err.is_connectivity() {
            return;
        }
        record_error(&self.inner, &mut state);
    }

    pub fn report_success(&self, remote: &ActiveRemote) {
        let mut state = self.inner.state.lock();
        if state.generation == remote.generation {
            state.protocol_streak = 0;
        }
    }

    /// The active connection reported close/error: fail over immediately.
    pub fn signal_disconnect(&self) {
        let generation = self.inner.state.lock().generation;
        signal_disconnect(&self.inner, generation);
    }

    /// Wait for any in-progress reconnect/failover to finish.
    pub async fn settle(&self) {
        loop {
            let handle = self.inner.state.lock().reconnect.take();
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }

    /// Cancel every background task and drop the connection.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shut_down = true;
        for handle in [
            state.reconnect.take(),
            state.cooldown.take(),
            state.health.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        state.active = None;
        state.phase = ConnectionState::Disconnected;
        info!("Failover controller shut down");
    }
}

fn record_error(inner: &Arc<Inner>, state: &mut ControllerState) {
    if !matches!(state.phase, ConnectionState::Connected { .. }) {
        return;
    }
    let now = Instant::now();
    let window = inner.config.error_tolerance_interval();
    state.errors.push_back(now);
    while let Some(front) = state.errors.front() {
        if now.duration_since(*front) > window {
            state.errors.pop_front();
        } else {
            break;
        }
    }
    debug!(
        "Remote error window: {} of {} within {:?}",
        state.errors.len(),
        inner.config.error_tolerance_count,
        window
    );
    if state.errors.len() >= inner.config.error_tolerance_count {
        warn!(
            "Remote endpoint {} exceeded error tolerance; failing over",
            inner.endpoints[state.current_index].redacted()
        );
        begin_failover(inner, state);
    }
}

fn signal_disconnect(inner: &Arc<Inner>, generation: u64) {
    let mut state = inner.state.lock();
    if state.generation != generation || !matches!(state.phase, ConnectionState::Connected { .. })
    {
        return;
    }
    state.errors.push_back(Instant::now());
    warn!(
        "Remote endpoint {} disconnected; failing over",
        inner.endpoints[state.current_index].redacted()
    );
    begin_failover(inner, &mut state);
}

/// Mark the current endpoint failed and move on to the next one in the background.
fn begin_failover(inner: &Arc<Inner>, state: &mut ControllerState) {
    if state.shut_down {
        return;
    }
    inner.stats.record_failover();
    state.errors.clear();
    state.protocol_streak = 0;
    state.active = None;
    if let Some(health) = state.health.take() {
        health.abort();
    }
    let failed = state.current_index;
    state.failed.insert(failed);

    match next_candidate(inner, state) {
        Some(next) => {
            state.current_index = next;
            state.phase = ConnectionState::Connecting;
            state.reconnect = Some(tokio::spawn(connect_task(Arc::clone(inner))));
        }
        None => degrade(inner, state),
    }
}

fn next_candidate(inner: &Inner, state: &ControllerState) -> Option<usize> {
    let n = inner.endpoints.len();
    (1..=n)
        .map(|offset| (state.current_index + offset) % n)
        .find(|i| !state.failed.contains(i))
}

fn degrade(inner: &Arc<Inner>, state: &mut ControllerState) {
    state.phase = ConnectionState::Degraded;
    state.active = None;
    state.was_degraded = true;
    error!(
        "All {} remote endpoints failed; remote cache degraded for {:?}",
        inner.endpoints.len(),
        inner.config.reconnect_cooldown()
    );
    if state.shut_down {
        return;
    }
    if let Some(old) = state.cooldown.take() {
        // a still-sleeping cool-down would double the retry
        if !old.is_finished() {
            old.abort();
        }
    }
    state.cooldown = Some(tokio::spawn(cooldown_task(Arc::clone(inner))));
}

fn connect_task(inner: Arc<Inner>) -> BoxFuture<'static, ()> {
    Box::pin(async move { run_connect(&inner).await })
}

fn cooldown_task(inner: Arc<Inner>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        tokio::time::sleep(inner.config.reconnect_cooldown()).await;
        let mut state = inner.state.lock();
        if state.shut_down || state.phase != ConnectionState::Degraded {
            return;
        }
        info!("Reconnect cool-down elapsed; retrying remote endpoints from the top");
        state.current_index = 0;
        state.failed.clear();
        state.phase = ConnectionState::Connecting;
        state.reconnect = Some(tokio::spawn(connect_task(Arc::clone(&inner))));
    })
}

fn health_task(inner: Arc<Inner>, generation: u64) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Some(interval) = inner.config.health_check_interval() else {
            return;
        };
        loop {
            tokio::time::sleep(interval).await;
            let store = {
                let state = inner.state.lock();
                match (&state.active, state.generation == generation) {
                    (Some(store), true) => Arc::clone(store),
                    _ => return,
                }
            };
            if let Err(e) = with_timeout(inner.config.operation_timeout(), store.ping()).await {
                warn!("Remote health check failed: {}", e);
                inner.stats.record_error();
                signal_disconnect(&inner, generation);
                return;
            }
        }
    })
}

/// Try `current_index`, then every later non-failed endpoint, until one
/// connects or the list is exhausted.
async fn run_connect(inner: &Arc<Inner>) {
    loop {
        let (index, endpoint) = {
            let state = inner.state.lock();
            if state.shut_down {
                return;
            }
            (
                state.current_index,
                inner.endpoints[state.current_index].clone(),
            )
        };

        let result = match connect_with_retries(inner, &endpoint).await {
            Ok(store) => prepare(inner, index, store).await,
            Err(e) => Err(e),
        };

        let mut state = inner.state.lock();
        if state.shut_down {
            return;
        }
        match result {
            Ok(store) => {
                state.generation += 1;
                state.phase = ConnectionState::Connected { index };
                state.active = Some(store);
                state.errors.clear();
                state.protocol_streak = 0;
                state.last_connected = Some(index);
                state.was_degraded = false;
                if let Some(old) = state.health.take() {
                    old.abort();
                }
                if inner.config.health_check_interval().is_some() {
                    state.health = Some(tokio::spawn(health_task(
                        Arc::clone(inner),
                        state.generation,
                    )));
                }
                info!(
                    "Remote cache connected to endpoint {} ({})",
                    index,
                    endpoint.redacted()
                );
                return;
            }
            Err(e) => {
                warn!(
                    "Remote endpoint {} ({}) marked failed: {}",
                    index,
                    endpoint.redacted(),
                    e
                );
                state.failed.insert(index);
                match next_candidate(inner, &state) {
                    Some(next) => state.current_index = next,
                    None => {
                        degrade(inner, &mut state);
                        return;
                    }
                }
            }
        }
    }
}

/// Flush an endpoint that cannot be trusted as warm cache.
async fn prepare(
    inner: &Arc<Inner>,
    index: usize,
    store: Arc<dyn RemoteStore>,
) -> Result<Arc<dyn RemoteStore>, CacheError> {
    let needs_flush = {
        let state = inner.state.lock();
        match state.last_connected {
            None => index != 0 || state.was_degraded,
            Some(last) => last != index || state.was_degraded,
        }
    };
    if needs_flush {
        info!("Flushing remote endpoint {} before use", index);
        with_timeout(inner.config.operation_timeout(), store.flush_all()).await?;
    }
    Ok(store)
}

async fn connect_with_retries(
    inner: &Arc<Inner>,
    endpoint: &EndpointConfig,
) -> Result<Arc<dyn RemoteStore>, CacheError> {
    let max_attempts = inner.config.max_connect_attempts;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match with_timeout(
            inner.config.connect_timeout(),
            inner.connector.connect(endpoint),
        )
        .await
        {
            Ok(store) => return Ok(store),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = inner.config.backoff(attempt);
                debug!(
                    "Connect attempt {} to {} failed ({}); retrying in {:?}",
                    attempt,
                    endpoint.redacted(),
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
