//! Configuration module for the swap execution pipeline
//!
//! This module handles configuration loading from TOML files and
//! environment variables, and provides structured configuration types.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::execution::profile::ExecutionProfile;
use crate::risk::RiskPolicy;
use crate::rpc_manager::RpcManagerConfig;

pub const ENV_RPC_ENDPOINTS: &str = "FLOWMINT_RPC_ENDPOINTS";
pub const ENV_JITO_URL: &str = "FLOWMINT_JITO_URL";
pub const ENV_PROTECTED_MODE: &str = "FLOWMINT_PROTECTED_MODE";
pub const ENV_PROFILE: &str = "FLOWMINT_PROFILE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnvVar { name: String, value: String },
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// RPC endpoints and health tracking
    #[serde(default)]
    pub rpc: RpcManagerConfig,

    /// Risk thresholds and token lists
    #[serde(default)]
    pub risk: RiskPolicy,

    /// Bundle relay (Jito block engine)
    #[serde(default)]
    pub relay: RelayConfig,

    /// Retry profile and timeouts
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Quote / swap / token metadata APIs
    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Block engine base URL
    #[serde(default = "default_block_engine_url")]
    pub block_engine_url: String,

    /// Tip used when the request does not carry one
    #[serde(default = "default_tip_lamports")]
    pub default_tip_lamports: u64,

    #[serde(default = "default_min_tip")]
    pub min_tip_lamports: u64,

    #[serde(default = "default_max_tip")]
    pub max_tip_lamports: u64,

    /// Bundle status poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up on the relay and fall back to direct send after this long
    #[serde(default = "default_bundle_timeout_ms")]
    pub bundle_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Retry budget used when the caller does not pick one
    #[serde(default)]
    pub default_profile: ExecutionProfile,

    /// Default for requests that do not set protected mode
    #[serde(default)]
    pub protected_mode: bool,

    /// Upper bound for every network operation of an attempt
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Priority fee used in priority mode when the request does not carry one
    #[serde(default = "default_priority_fee")]
    pub default_priority_fee_micro_lamports: u64,

    /// Append-only JSONL audit log; events only go to tracing when unset
    #[serde(default)]
    pub event_log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Jupiter swap API base (`/quote`, `/swap`)
    #[serde(default = "default_quote_api_url")]
    pub quote_api_url: String,

    /// Token metadata lookup base (`/{mint}`)
    #[serde(default = "default_token_api_url")]
    pub token_api_url: String,

    #[serde(default = "default_aggregator_timeout_ms")]
    pub request_timeout_ms: u64,
}

// Default value functions
fn default_block_engine_url() -> String {
    "https://mainnet.block-engine.jito.wtf".to_string()
}
fn default_tip_lamports() -> u64 {
    10_000
}
fn default_min_tip() -> u64 {
    1_000
}
fn default_max_tip() -> u64 {
    1_000_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_bundle_timeout_ms() -> u64 {
    15_000
}
fn default_operation_timeout_ms() -> u64 {
    30_000
}
fn default_priority_fee() -> u64 {
    10_000
}
fn default_quote_api_url() -> String {
    "https://quote-api.jup.ag/v6".to_string()
}
fn default_token_api_url() -> String {
    "https://tokens.jup.ag/token".to_string()
}
fn default_aggregator_timeout_ms() -> u64 {
    10_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            block_engine_url: default_block_engine_url(),
            default_tip_lamports: default_tip_lamports(),
            min_tip_lamports: default_min_tip(),
            max_tip_lamports: default_max_tip(),
            poll_interval_ms: default_poll_interval_ms(),
            bundle_timeout_ms: default_bundle_timeout_ms(),
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn bundle_timeout(&self) -> Duration {
        Duration::from_millis(self.bundle_timeout_ms)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_profile: ExecutionProfile::default(),
            protected_mode: false,
            operation_timeout_ms: default_operation_timeout_ms(),
            default_priority_fee_micro_lamports: default_priority_fee(),
            event_log_path: None,
        }
    }
}

impl ExecutionConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            quote_api_url: default_quote_api_url(),
            token_api_url: default_token_api_url(),
            request_timeout_ms: default_aggregator_timeout_ms(),
        }
    }
}

impl AggregatorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load the file (or defaults), apply `.env` and process environment overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FLOWMINT_*` overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_RPC_ENDPOINTS) {
            let urls = RpcManagerConfig::parse_url_list(&raw);
            if !urls.is_empty() {
                let mut rpc = RpcManagerConfig::from_urls(&urls);
                rpc.health_check_interval_secs = self.rpc.health_check_interval_secs;
                rpc.failure_threshold = self.rpc.failure_threshold;
                rpc.request_timeout_ms = self.rpc.request_timeout_ms;
                rpc.probe_timeout_ms = self.rpc.probe_timeout_ms;
                rpc.latency_alpha = self.rpc.latency_alpha;
                rpc.failover_retries = self.rpc.failover_retries;
                self.rpc = rpc;
            }
        }

        if let Some(url) = lookup(ENV_JITO_URL) {
            self.relay.block_engine_url = url;
        }

        if let Some(raw) = lookup(ENV_PROTECTED_MODE) {
            self.execution.protected_mode = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnvVar {
                        name: ENV_PROTECTED_MODE.to_string(),
                        value: raw,
                    })
                }
            };
        }

        if let Some(raw) = lookup(ENV_PROFILE) {
            self.execution.default_profile =
                raw.parse().map_err(|_| ConfigError::InvalidEnvVar {
                    name: ENV_PROFILE.to_string(),
                    value: raw.clone(),
                })?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rpc.validate()?;
        self.risk.validate()?;

        if self.relay.min_tip_lamports > self.relay.max_tip_lamports {
            return Err(ConfigError::Validation(format!(
                "relay.min_tip_lamports ({}) exceeds relay.max_tip_lamports ({})",
                self.relay.min_tip_lamports, self.relay.max_tip_lamports
            )));
        }

        for (key, url) in [
            ("relay.block_engine_url", &self.relay.block_engine_url),
            ("aggregator.quote_api_url", &self.aggregator.quote_api_url),
            ("aggregator.token_api_url", &self.aggregator.token_api_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Validation(format!("{} is not an http(s) URL: {}", key, url)));
            }
        }

        if self.relay.poll_interval_ms == 0 || self.execution.operation_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "poll interval and operation timeout must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
