use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::rpc_metrics::EndpointHealth;

/// Outcome of a single health transition check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    BecameUnhealthy,
    Recovered,
}

/// Mutable bits that cannot be atomics
#[derive(Debug, Default)]
struct HealthDetail {
    last_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Exponential blend of previous average and latest sample
    avg_latency_ms: f64,
}

/// Live health record for one RPC endpoint.
///
/// Counters are lock-free; the detail block sits behind a per-endpoint lock.
/// Updated on every call outcome and by the background prober.
#[derive(Debug)]
pub struct AtomicEndpointStats {
    success_count: AtomicU64,
    failure_count: AtomicU64,
    /// Reset to zero by any success
    consecutive_failures: AtomicU64,
    is_healthy: AtomicBool,
    failure_threshold: u64,
    latency_alpha: f64,
    detail: RwLock<HealthDetail>,
}

impl AtomicEndpointStats {
    pub fn new(failure_threshold: u64, latency_alpha: f64) -> Self {
        Self {
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            is_healthy: AtomicBool::new(true),
            failure_threshold: failure_threshold.max(1),
            latency_alpha: latency_alpha.clamp(0.01, 0.99),
            detail: RwLock::new(HealthDetail::default()),
        }
    }

    fn blend_latency(&self, detail: &mut HealthDetail, latency_ms: f64) {
        if detail.avg_latency_ms == 0.0 {
            detail.avg_latency_ms = latency_ms;
        } else {
            detail.avg_latency_ms =
                self.latency_alpha * latency_ms + (1.0 - self.latency_alpha) * detail.avg_latency_ms;
        }
    }

    /// Record a successful call
    pub fn record_success(&self, latency_ms: f64) -> HealthTransition {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let was_healthy = self.is_healthy.swap(true, Ordering::Relaxed);

        let mut detail = self.detail.write();
        self.blend_latency(&mut detail, latency_ms);
        detail.last_check = Some(Utc::now());

        if was_healthy {
            HealthTransition::Unchanged
        } else {
            HealthTransition::Recovered
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, latency_ms: f64, error: &str) -> HealthTransition {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        {
            let mut detail = self.detail.write();
            self.blend_latency(&mut detail, latency_ms);
            detail.last_check = Some(Utc::now());
            detail.last_error = Some(error.to_string());
        }

        if consecutive >= self.failure_threshold && self.is_healthy.swap(false, Ordering::Relaxed) {
            HealthTransition::BecameUnhealthy
        } else {
            HealthTransition::Unchanged
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.success_count() + self.failure_count()
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.detail.read().avg_latency_ms
    }

    /// Success rate (0.0 - 1.0); an unused endpoint counts as perfect
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 1.0;
        }
        self.success_count() as f64 / total as f64
    }

    /// Point-in-time copy for observability
    pub fn snapshot(&self, name: &str, url: &str) -> EndpointHealth {
        let detail = self.detail.read();
        EndpointHealth {
            name: name.to_string(),
            url: url.to_string(),
            is_healthy: self.is_healthy(),
            last_check: detail.last_check,
            last_error: detail.last_error.clone(),
            avg_latency_ms: detail.avg_latency_ms,
            success_count: self.success_count(),
            failure_count: self.failure_count(),
            consecutive_failures: self.consecutive_failures(),
        }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.success_count.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.is_healthy.store(true, Ordering::Relaxed);
        *self.detail.write() = HealthDetail::default();
    }
}
