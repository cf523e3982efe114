use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health snapshot for one endpoint, as exposed to observability integrations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointHealth {
    pub name: String,
    pub url: String,
    pub is_healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub avg_latency_ms: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
}

/// Aggregate pool statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_endpoints: usize,
    pub healthy_count: usize,
    /// Successful calls over all calls, across endpoints (1.0 when idle)
    pub success_rate: f64,
    /// Mean of the per-endpoint rolling averages that have samples
    pub avg_latency: f64,
}

impl PoolStats {
    pub fn from_health(endpoints: &[EndpointHealth]) -> Self {
        let healthy_count = endpoints.iter().filter(|e| e.is_healthy).count();

        let successes: u64 = endpoints.iter().map(|e| e.success_count).sum();
        let failures: u64 = endpoints.iter().map(|e| e.failure_count).sum();
        let total = successes + failures;
        let success_rate = if total == 0 {
            1.0
        } else {
            successes as f64 / total as f64
        };

        let sampled: Vec<f64> = endpoints
            .iter()
            .filter(|e| e.success_count + e.failure_count > 0)
            .map(|e| e.avg_latency_ms)
            .collect();
        let avg_latency = if sampled.is_empty() {
            0.0
        } else {
            sampled.iter().sum::<f64>() / sampled.len() as f64
        };

        Self {
            total_endpoints: endpoints.len(),
            healthy_count,
            success_rate,
            avg_latency,
        }
    }

    /// Overall label used by the CLI health report
    pub fn overall_status(&self) -> &'static str {
        if self.total_endpoints == 0 || self.healthy_count == 0 {
            "unhealthy"
        } else if self.healthy_count < self.total_endpoints {
            "degraded"
        } else {
            "healthy"
        }
    }
}
