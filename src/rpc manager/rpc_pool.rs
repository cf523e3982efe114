//! Weighted RPC endpoint pool with health tracking and failover
//!
//! - Configurable endpoint list with relative weights, premium flag and rate limits
//! - Periodic health probing (get_slot) on a detached ticker
//! - Live call outcomes feed the same health record as the prober
//! - Weighted random selection among healthy endpoints
//! - `with_failover` / `with_retry` call execution with per-call timeouts
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use solana_client::nonblocking::rpc_client::RpcClient;
use std::collections::HashSet;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::rpc_atomics::{AtomicEndpointStats, HealthTransition};
use super::rpc_config::{RpcEndpoint, RpcManagerConfig};
use super::rpc_errors::RpcManagerError;
use super::rpc_metrics::{EndpointHealth, PoolStats};
use crate::scheduler::{sleep_cancellable, Ticker};

/// Selection multiplier applied to premium endpoints
const PREMIUM_WEIGHT_BONUS: f64 = 2.0;

/// Cap for same-endpoint backoff in `with_retry`
const MAX_SAME_ENDPOINT_BACKOFF_MS: u64 = 10_000;

/// Health status of an RPC endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Still selectable, but has recent consecutive failures
    Degraded,
    Unhealthy,
}

/// Health change event for propagation
#[derive(Debug, Clone)]
pub struct HealthChangeEvent {
    pub name: String,
    pub url: String,
    pub old_status: HealthStatus,
    pub new_status: HealthStatus,
    pub timestamp: DateTime<Utc>,
}

/// Connection handed to callers and to failover closures
#[derive(Clone)]
pub struct EndpointHandle {
    pub name: String,
    pub url: String,
    pub client: Arc<RpcClient>,
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Endpoint with health tracking
struct HealthTrackedEndpoint {
    config: RpcEndpoint,
    client: Arc<RpcClient>,
    stats: AtomicEndpointStats,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl std::fmt::Debug for HealthTrackedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTrackedEndpoint")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl HealthTrackedEndpoint {
    fn new(config: RpcEndpoint, pool: &RpcManagerConfig) -> Self {
        let limiter = config
            .rate_limit_rps
            .and_then(NonZeroU32::new)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));

        Self {
            client: Arc::new(RpcClient::new_with_timeout(
                config.url.clone(),
                pool.request_timeout(),
            )),
            stats: AtomicEndpointStats::new(pool.failure_threshold, pool.latency_alpha),
            limiter,
            config,
        }
    }

    fn name(&self) -> &str {
        self.config.display_name()
    }

    fn effective_weight(&self) -> f64 {
        if self.config.premium {
            self.config.weight * PREMIUM_WEIGHT_BONUS
        } else {
            self.config.weight
        }
    }

    fn status(&self) -> HealthStatus {
        if !self.stats.is_healthy() {
            HealthStatus::Unhealthy
        } else if self.stats.consecutive_failures() > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            name: self.name().to_string(),
            url: self.config.url.clone(),
            client: self.client.clone(),
        }
    }
}

/// Multi-endpoint RPC transport
pub struct RpcPool {
    endpoints: Vec<Arc<HealthTrackedEndpoint>>,
    config: RpcManagerConfig,
    health_event_tx: broadcast::Sender<HealthChangeEvent>,
}

impl std::fmt::Debug for RpcPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPool")
            .field("endpoints", &self.endpoints.len())
            .field("failure_threshold", &self.config.failure_threshold)
            .finish_non_exhaustive()
    }
}

impl RpcPool {
    /// Create a new RPC pool from a validated configuration
    pub fn new(config: RpcManagerConfig) -> Result<Self, RpcManagerError> {
        config
            .validate()
            .map_err(|e| RpcManagerError::Configuration(e.to_string()))?;

        let endpoints = config
            .endpoints
            .iter()
            .cloned()
            .map(|ep| Arc::new(HealthTrackedEndpoint::new(ep, &config)))
            .collect();

        let (health_event_tx, _) = broadcast::channel(100);

        Ok(Self {
            endpoints,
            config,
            health_event_tx,
        })
    }

    pub fn config(&self) -> &RpcManagerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Subscribe to health change events
    pub fn subscribe_health_events(&self) -> broadcast::Receiver<HealthChangeEvent> {
        self.health_event_tx.subscribe()
    }

    fn emit_health_event(&self, endpoint: &HealthTrackedEndpoint, transition: HealthTransition) {
        let (old_status, new_status) = match transition {
            HealthTransition::Unchanged => return,
            HealthTransition::BecameUnhealthy => (HealthStatus::Degraded, HealthStatus::Unhealthy),
            HealthTransition::Recovered => (HealthStatus::Unhealthy, HealthStatus::Healthy),
        };

        info!(
            endpoint = %endpoint.name(),
            old = ?old_status,
            new = ?new_status,
            "Health status changed"
        );

        // Best effort send - don't block if no receivers
        let _ = self.health_event_tx.send(HealthChangeEvent {
            name: endpoint.name().to_string(),
            url: endpoint.config.url.clone(),
            old_status,
            new_status,
            timestamp: Utc::now(),
        });
    }

    fn find(&self, name_or_url: &str) -> Option<usize> {
        self.endpoints
            .iter()
            .position(|ep| ep.config.url == name_or_url || ep.name() == name_or_url)
    }

    fn record_outcome(&self, idx: usize, latency_ms: f64, error: Option<&str>) {
        let endpoint = &self.endpoints[idx];
        let transition = match error {
            None => endpoint.stats.record_success(latency_ms),
            Some(err) => endpoint.stats.record_failure(latency_ms, err),
        };
        self.emit_health_event(endpoint, transition);
    }

    /// Feed a successful call made outside the pool back into endpoint health
    pub fn record_success(&self, name_or_url: &str, latency_ms: f64) {
        if let Some(idx) = self.find(name_or_url) {
            self.record_outcome(idx, latency_ms, None);
        }
    }

    /// Feed a failed call made outside the pool back into endpoint health
    pub fn record_failure(&self, name_or_url: &str, latency_ms: f64, error: &str) {
        if let Some(idx) = self.find(name_or_url) {
            self.record_outcome(idx, latency_ms, Some(error));
        }
    }

    /// Current status of one endpoint
    pub fn health_status(&self, name_or_url: &str) -> Option<HealthStatus> {
        self.find(name_or_url).map(|idx| self.endpoints[idx].status())
    }

    fn healthy_indices(&self) -> Vec<usize> {
        (0..self.endpoints.len())
            .filter(|&i| self.endpoints[i].stats.is_healthy())
            .collect()
    }

    /// Cumulative-weight draw over `candidates`
    fn pick_weighted_with<R: Rng + ?Sized>(&self, candidates: &[usize], rng: &mut R) -> Option<usize> {
        let total: f64 = candidates
            .iter()
            .map(|&i| self.endpoints[i].effective_weight())
            .sum();

        if candidates.is_empty() || total <= 0.0 {
            return candidates.first().copied();
        }

        let draw = rng.gen::<f64>() * total;
        let mut cumulative = 0.0;
        for &idx in candidates {
            cumulative += self.endpoints[idx].effective_weight();
            if draw < cumulative {
                return Some(idx);
            }
        }
        candidates.last().copied()
    }

    fn pick_weighted(&self, candidates: &[usize]) -> Option<usize> {
        self.pick_weighted_with(candidates, &mut rand::thread_rng())
    }

    fn select_index(&self) -> usize {
        let healthy = self.healthy_indices();
        match self.pick_weighted(&healthy) {
            Some(idx) => idx,
            None => {
                warn!(
                    total = self.endpoints.len(),
                    "No healthy RPC endpoints, falling back to first configured endpoint"
                );
                0
            }
        }
    }

    /// Pick a connection: weighted among healthy endpoints, first endpoint if none is healthy
    pub fn get_connection(&self) -> EndpointHandle {
        let idx = self.select_index();
        let selected = &self.endpoints[idx];
        debug!(
            endpoint = %selected.name(),
            status = ?selected.status(),
            "Selected RPC endpoint (weighted)"
        );
        selected.handle()
    }

    /// Run one call on one endpoint: rate limit, timeout, health bookkeeping
    async fn call_endpoint<T, F, Fut>(&self, idx: usize, op: &mut F) -> Result<T, RpcManagerError>
    where
        F: FnMut(EndpointHandle) -> Fut,
        Fut: Future<Output = Result<T, RpcManagerError>>,
    {
        let endpoint = &self.endpoints[idx];
        if let Some(limiter) = &endpoint.limiter {
            limiter.until_ready().await;
        }

        let timeout = self.config.request_timeout();
        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, op(endpoint.handle())).await {
            Ok(result) => result,
            Err(_) => Err(RpcManagerError::Timeout {
                endpoint: endpoint.config.url.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(_) => self.record_outcome(idx, latency_ms, None),
            Err(err) if err.is_endpoint_fault() => {
                self.record_outcome(idx, latency_ms, Some(&err.to_string()))
            }
            // The node answered; the request itself was bad
            Err(_) => self.record_outcome(idx, latency_ms, None),
        }
        result
    }

    /// Run `op` against healthy endpoints, rotating on endpoint faults.
    ///
    /// Endpoints already tried in this call are skipped until every healthy
    /// endpoint has been tried, then the tried-set is cleared. At most
    /// `max_retries` calls are made; the last error is returned when all fail.
    #[instrument(skip(self, op))]
    pub async fn with_failover<T, F, Fut>(&self, mut op: F, max_retries: u32) -> Result<T, RpcManagerError>
    where
        F: FnMut(EndpointHandle) -> Fut,
        Fut: Future<Output = Result<T, RpcManagerError>>,
    {
        let mut tried: HashSet<usize> = HashSet::new();
        let mut last_error = None;

        for attempt in 0..max_retries.max(1) {
            let healthy = self.healthy_indices();
            let mut candidates: Vec<usize> =
                healthy.iter().copied().filter(|i| !tried.contains(i)).collect();

            if candidates.is_empty() && !tried.is_empty() {
                debug!(attempt, "All healthy endpoints tried, starting a new round");
                tried.clear();
                candidates = healthy;
            }

            let idx = match self.pick_weighted(&candidates) {
                Some(idx) => idx,
                None => {
                    warn!(attempt, "No healthy endpoints, using first configured endpoint");
                    0
                }
            };
            tried.insert(idx);

            match self.call_endpoint(idx, &mut op).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_endpoint_fault() => return Err(err),
                Err(err) => {
                    warn!(
                        endpoint = %self.endpoints[idx].name(),
                        attempt = attempt + 1,
                        max_retries,
                        error = %err,
                        "RPC call failed, failing over"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RpcManagerError::NoHealthyEndpoints {
            total: self.endpoints.len(),
            unhealthy: self.endpoints.len() - self.healthy_indices().len(),
        }))
    }

    /// Retry on one endpoint with capped exponential backoff, then escalate to `with_failover`.
    ///
    /// Cancelling `cancel` ends a pending backoff with `RpcManagerError::Cancelled`.
    #[instrument(skip(self, op, cancel))]
    pub async fn with_retry<T, F, Fut>(
        &self,
        mut op: F,
        endpoint: Option<&str>,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<T, RpcManagerError>
    where
        F: FnMut(EndpointHandle) -> Fut,
        Fut: Future<Output = Result<T, RpcManagerError>>,
    {
        let idx = endpoint
            .and_then(|e| self.find(e))
            .unwrap_or_else(|| self.select_index());

        for attempt in 0..max_retries {
            match self.call_endpoint(idx, &mut op).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    if attempt + 1 < max_retries {
                        let backoff = same_endpoint_backoff(attempt);
                        debug!(
                            endpoint = %self.endpoints[idx].name(),
                            attempt = attempt + 1,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err,
                            "Retrying on same endpoint"
                        );
                        if sleep_cancellable(backoff, cancel).await.is_err() {
                            return Err(RpcManagerError::Cancelled);
                        }
                    }
                }
            }
        }

        info!(
            endpoint = %self.endpoints[idx].name(),
            "Same-endpoint retries exhausted, escalating to failover"
        );
        self.with_failover(op, max_retries).await
    }

    /// Probe one endpoint with a cheap call
    async fn probe(&self, idx: usize) -> bool {
        let endpoint = &self.endpoints[idx];
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.config.probe_timeout(), endpoint.client.get_slot()).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(Ok(slot)) => {
                debug!(endpoint = %endpoint.name(), slot, "Health probe succeeded");
                self.record_outcome(idx, latency_ms, None);
                true
            }
            Ok(Err(e)) => {
                warn!(endpoint = %endpoint.name(), error = %e, "Health probe failed");
                self.record_outcome(idx, latency_ms, Some(&e.to_string()));
                false
            }
            Err(_) => {
                warn!(endpoint = %endpoint.name(), "Health probe timed out");
                self.record_outcome(idx, latency_ms, Some("health probe timed out"));
                false
            }
        }
    }

    /// Probe every endpoint concurrently; returns how many answered
    #[instrument(skip(self))]
    pub async fn probe_all(&self) -> usize {
        let probes = (0..self.endpoints.len()).map(|idx| self.probe(idx));
        futures::future::join_all(probes)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }

    /// Start background health probing.
    ///
    /// The ticker only holds a weak reference, so it ends when the pool is
    /// dropped or the token is cancelled.
    pub fn start_health_checks(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        Ticker::new(self.config.health_check_interval(), token).spawn("rpc-health", move || {
            let pool = pool.clone();
            async move {
                match pool.upgrade() {
                    Some(pool) => {
                        pool.probe_all().await;
                        true
                    }
                    None => false,
                }
            }
        })
    }

    /// Health snapshot per endpoint
    pub fn get_health_status(&self) -> Vec<EndpointHealth> {
        self.endpoints
            .iter()
            .map(|ep| ep.stats.snapshot(ep.name(), &ep.config.url))
            .collect()
    }

    /// Aggregate pool statistics
    pub fn get_stats(&self) -> PoolStats {
        PoolStats::from_health(&self.get_health_status())
    }

    /// Clear all health records
    pub fn reset_health(&self) {
        for endpoint in &self.endpoints {
            endpoint.stats.reset();
        }
    }
}

/// `min(1000 * 2^attempt, 10000)` ms
pub fn same_endpoint_backoff(attempt: u32) -> Duration {
    let ms = 1000u64.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(ms.min(MAX_SAME_ENDPOINT_BACKOFF_MS))
}
