//! RPC Manager Module
//!
//! Multi-endpoint RPC transport with health tracking, weighted selection and failover

pub mod rpc_atomics;
pub mod rpc_config;
pub mod rpc_errors;
pub mod rpc_metrics;
pub mod rpc_pool;

// Re-exports for convenience
pub use rpc_config::{RpcEndpoint, RpcManagerConfig};
pub use rpc_errors::RpcManagerError;
pub use rpc_metrics::{EndpointHealth, PoolStats};
pub use rpc_pool::{EndpointHandle, HealthChangeEvent, HealthStatus, RpcPool};
