//! Flowmint - risk-gated swap execution for Solana
//!
//! Scores a quoted swap before anything is signed, builds and submits it
//! through a bundle relay, a priority lane or a plain send, and drives
//! retries and requotes from a classified view of every failure.
//!
//! ## Modules
//!
//! - **risk**: pre-trade scoring (GREEN / AMBER / RED) and token safety
//! - **rpc_manager**: weighted endpoint pool with health tracking and failover
//! - **submission**: relay bundles, priority and direct sends
//! - **execution**: error classification, retry budgets, the orchestrator
//! - **aggregator**: quote provider and swap builder backed by the Jupiter API

pub mod aggregator;
pub mod config;
pub mod execution;
pub mod metrics;
pub mod observability;
pub mod risk;
pub mod scheduler;
pub mod submission;
pub mod types;

// Component modules with non-standard paths (directories with spaces)
#[path = "rpc manager/mod.rs"]
pub mod rpc_manager;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use config::AppConfig;
use execution::{
    ExecutionEventSink, ExecutionOrchestrator, JsonlEventSink, QuoteProvider, SwapTransactionBuilder,
    TracingEventSink,
};
use metrics::Metrics;
use risk::{RiskGate, RpcMintSource};
use rpc_manager::RpcPool;
use submission::{JitoBundler, SubmissionRouter};

// Re-export commonly used types
pub use solana_sdk::{pubkey::Pubkey, signature::Signature};
pub use types::{Quote, SubmissionMode, SwapRequest};

/// Long-lived services, built once at start-up and shared by `Arc`
pub struct ServiceContainer {
    pub config: AppConfig,
    pub metrics: Arc<Metrics>,
    pub rpc: Arc<RpcPool>,
    pub risk: Arc<RiskGate>,
    pub router: Arc<SubmissionRouter>,
    pub sink: Arc<dyn ExecutionEventSink>,
}

impl ServiceContainer {
    pub async fn build(config: AppConfig) -> Result<Self> {
        let metrics = Arc::new(Metrics::new().context("registering metrics")?);
        let rpc = Arc::new(RpcPool::new(config.rpc.clone()).context("building RPC pool")?);

        let token_api = Some(config.aggregator.token_api_url.clone()).filter(|url| !url.is_empty());
        let mints = Arc::new(RpcMintSource::new(
            rpc.clone(),
            token_api,
            config.aggregator.request_timeout(),
        )?);
        let risk = Arc::new(
            RiskGate::new(Arc::new(config.risk.clone()), mints).with_metrics(metrics.clone()),
        );

        let bundler = JitoBundler::new(&config.relay.block_engine_url, config.relay.bundle_timeout())
            .context("building relay client")?;
        let router = Arc::new(
            SubmissionRouter::new(rpc.clone(), config.relay.clone())
                .with_bundler(Arc::new(bundler))
                .with_confirm_timeout(config.execution.operation_timeout())
                .with_metrics(metrics.clone()),
        );

        let sink: Arc<dyn ExecutionEventSink> = match &config.execution.event_log_path {
            Some(path) => Arc::new(JsonlEventSink::open(path).await?),
            None => Arc::new(TracingEventSink),
        };

        info!(
            endpoints = rpc.len(),
            relay = %config.relay.block_engine_url,
            profile = %config.execution.default_profile,
            "Services initialized"
        );

        Ok(Self {
            config,
            metrics,
            rpc,
            risk,
            router,
            sink,
        })
    }

    /// Orchestrator wired to the shared services
    pub fn orchestrator(
        &self,
        quotes: Arc<dyn QuoteProvider>,
        builder: Arc<dyn SwapTransactionBuilder>,
    ) -> ExecutionOrchestrator {
        ExecutionOrchestrator::new(
            self.risk.clone(),
            quotes,
            builder,
            self.router.clone(),
            self.config.execution.clone(),
        )
        .with_sink(self.sink.clone())
        .with_metrics(self.metrics.clone())
    }
}
