use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ConfigError;

/// Configuration for an individual RPC endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcEndpoint {
    /// Human readable name used in logs and events
    #[serde(default)]
    pub name: String,

    /// The RPC endpoint URL
    pub url: String,

    /// Relative weight for load balancing (higher = more requests)
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Rate limit (requests per second), unlimited when absent
    #[serde(default)]
    pub rate_limit_rps: Option<u32>,

    /// Paid endpoint; receives a selection bonus
    #[serde(default)]
    pub premium: bool,
}

impl RpcEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            weight,
            rate_limit_rps: None,
            premium: false,
        }
    }

    pub fn premium(mut self) -> Self {
        self.premium = true;
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.url
        } else {
            &self.name
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_failure_threshold() -> u64 {
    3
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_latency_alpha() -> f64 {
    0.2
}

fn default_failover_retries() -> u32 {
    3
}

/// RPC transport configuration for one network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcManagerConfig {
    /// List of RPC endpoints
    pub endpoints: Vec<RpcEndpoint>,

    /// Background probe interval in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Consecutive failures before an endpoint is marked unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,

    /// Upper bound for any single RPC call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Upper bound for a health probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Weight of the newest latency sample in the rolling average
    #[serde(default = "default_latency_alpha")]
    pub latency_alpha: f64,

    /// Attempts for `with_failover` when callers do not specify one
    #[serde(default = "default_failover_retries")]
    pub failover_retries: u32,
}

impl Default for RpcManagerConfig {
    fn default() -> Self {
        Self::from_urls(&["https://api.mainnet-beta.solana.com".to_string()])
    }
}

impl RpcManagerConfig {
    /// Build a configuration from plain URLs with default settings
    pub fn from_urls(urls: &[String]) -> Self {
        let endpoints = urls
            .iter()
            .enumerate()
            .map(|(i, url)| RpcEndpoint::new(format!("rpc-{}", i), url.clone(), default_weight()))
            .collect();

        Self {
            endpoints,
            health_check_interval_secs: default_health_check_interval(),
            failure_threshold: default_failure_threshold(),
            request_timeout_ms: default_request_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            latency_alpha: default_latency_alpha(),
            failover_retries: default_failover_retries(),
        }
    }

    /// Parse a comma separated URL list, e.g. from `FLOWMINT_RPC_ENDPOINTS`
    pub fn parse_url_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::Validation(
                "At least one RPC endpoint must be configured".to_string(),
            ));
        }

        let mut seen_urls = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if !seen_urls.insert(&endpoint.url) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate RPC URL: {}",
                    endpoint.url
                )));
            }

            if !endpoint.url.starts_with("http://") && !endpoint.url.starts_with("https://") {
                return Err(ConfigError::Validation(format!(
                    "Invalid URL format: {}",
                    endpoint.url
                )));
            }

            if endpoint.weight <= 0.0 || !endpoint.weight.is_finite() {
                return Err(ConfigError::Validation(format!(
                    "Invalid weight for {}: must be > 0",
                    endpoint.url
                )));
            }

            if endpoint.rate_limit_rps == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "Invalid rate limit for {}: must be > 0",
                    endpoint.url
                )));
            }
        }

        if self.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "failure_threshold must be at least 1".to_string(),
            ));
        }

        if self.latency_alpha <= 0.0 || self.latency_alpha >= 1.0 {
            return Err(ConfigError::Validation(
                "latency_alpha must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "request_timeout_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
