//! Metrics collection and export module

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Instant;

/// Pipeline metrics; one instance per process, shared by `Arc`
pub struct Metrics {
    registry: Registry,

    // Counters
    pub executions_total: IntCounterVec,
    pub execution_retries_total: IntCounter,
    pub execution_requotes_total: IntCounter,
    pub relay_fallbacks_total: IntCounter,
    pub risk_assessments_total: IntCounterVec,
    pub rpc_requests_total: IntCounterVec,

    // Histograms
    pub submission_latency_ms: Histogram,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let executions_total = IntCounterVec::new(
            Opts::new("executions_total", "Executions by terminal state"),
            &["state"],
        )?;

        let execution_retries_total = IntCounter::with_opts(Opts::new(
            "execution_retries_total",
            "Retries scheduled by the orchestrator (transient and requote)",
        ))?;

        let execution_requotes_total = IntCounter::with_opts(Opts::new(
            "execution_requotes_total",
            "Fresh quotes fetched after a requote-class failure",
        ))?;

        let relay_fallbacks_total = IntCounter::with_opts(Opts::new(
            "relay_fallbacks_total",
            "Relay submissions that fell back to direct send",
        ))?;

        let risk_assessments_total = IntCounterVec::new(
            Opts::new("risk_assessments_total", "Risk assessments by overall level"),
            &["level"],
        )?;

        let rpc_requests_total = IntCounterVec::new(
            Opts::new("rpc_requests_total", "Submission RPC outcomes"),
            &["outcome"],
        )?;

        let submission_latency_ms = Histogram::with_opts(
            HistogramOpts::new("submission_latency_ms", "Submit-to-confirm latency in milliseconds")
                .buckets(vec![100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 30000.0]),
        )?;

        // Register all metrics
        registry.register(Box::new(executions_total.clone()))?;
        registry.register(Box::new(execution_retries_total.clone()))?;
        registry.register(Box::new(execution_requotes_total.clone()))?;
        registry.register(Box::new(relay_fallbacks_total.clone()))?;
        registry.register(Box::new(risk_assessments_total.clone()))?;
        registry.register(Box::new(rpc_requests_total.clone()))?;
        registry.register(Box::new(submission_latency_ms.clone()))?;

        Ok(Self {
            registry,
            executions_total,
            execution_retries_total,
            execution_requotes_total,
            relay_fallbacks_total,
            risk_assessments_total,
            rpc_requests_total,
            submission_latency_ms,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_execution(&self, state: &str) {
        self.executions_total.with_label_values(&[state]).inc();
    }

    pub fn record_risk_level(&self, level: &str) {
        self.risk_assessments_total.with_label_values(&[level]).inc();
    }

    pub fn record_rpc_outcome(&self, outcome: &str) {
        self.rpc_requests_total.with_label_values(&[outcome]).inc();
    }

    /// Text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Record elapsed milliseconds into `histogram` and return them
    pub fn observe_ms(&self, histogram: &Histogram) -> u64 {
        let ms = self.elapsed_ms();
        histogram.observe(ms as f64);
        ms
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
