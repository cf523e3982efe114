//! Submission channel selection: relay bundle, priority lane or direct send

use super::bundle::{BundleStatus, Bundler, RelayError};
use super::sender::{Landed, SendOptions, TransactionSender};
use crate::config::RelayConfig;
use crate::metrics::{Metrics, Timer};
use crate::rpc_manager::RpcManagerError;
use crate::types::SubmissionMode;
use serde::{Deserialize, Serialize};
use solana_sdk::commitment_config::CommitmentLevel;
use solana_sdk::transaction::VersionedTransaction;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Node-side rebroadcasts for the priority lane
pub const PRIORITY_MAX_RETRIES: usize = 3;
/// Node-side rebroadcasts for plain sends
pub const DIRECT_MAX_RETRIES: usize = 5;

const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Submission failures.
///
/// Display strings keep the wording the execution classifier matches on.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubmissionError {
    #[error(transparent)]
    Rpc(#[from] RpcManagerError),

    /// Landed but the program failed
    #[error("Transaction {signature} failed on chain: {message}")]
    OnChain { signature: String, message: String },

    #[error("Transaction {signature} expired: block height exceeded {last_valid_block_height}")]
    Expired {
        signature: String,
        last_valid_block_height: u64,
    },

    #[error("Transaction {signature} was not confirmed: timed out after {timeout_ms}ms")]
    ConfirmTimeout { signature: String, timeout_ms: u64 },

    /// Only surfaced when the direct fallback is unavailable too
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl SubmissionError {
    pub fn signature(&self) -> Option<&str> {
        match self {
            SubmissionError::OnChain { signature, .. }
            | SubmissionError::Expired { signature, .. }
            | SubmissionError::ConfirmTimeout { signature, .. } => Some(signature),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        match self {
            SubmissionError::Rpc(e) => e.endpoint(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOptions {
    pub mode: SubmissionMode,
    /// Requested relay tip, clamped before use
    pub tip_lamports: Option<u64>,
    /// Priority fee the transaction was built with, reported back only
    pub priority_fee_micro_lamports: Option<u64>,
    pub commitment: CommitmentLevel,
}

impl SubmitOptions {
    pub fn new(mode: SubmissionMode) -> Self {
        Self {
            mode,
            tip_lamports: None,
            priority_fee_micro_lamports: None,
            commitment: CommitmentLevel::Confirmed,
        }
    }
}

/// Terminal output of one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MevSubmitResult {
    pub signature: String,
    /// Landed through the relay
    pub protected: bool,
    /// Mode that actually landed the transaction
    pub mode: SubmissionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    pub confirmed: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip_lamports: Option<u64>,
    /// Relay was requested but direct send landed the transaction
    #[serde(default)]
    pub fell_back: bool,
}

/// Chooses the channel for a signed transaction and waits for confirmation
pub struct SubmissionRouter {
    sender: Arc<dyn TransactionSender>,
    bundler: Option<Arc<dyn Bundler>>,
    config: RelayConfig,
    confirm_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for SubmissionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionRouter")
            .field("relay", &self.bundler.is_some())
            .field("config", &self.config)
            .field("confirm_timeout", &self.confirm_timeout)
            .finish_non_exhaustive()
    }
}

impl SubmissionRouter {
    pub fn new(sender: Arc<dyn TransactionSender>, config: RelayConfig) -> Self {
        Self {
            sender,
            bundler: None,
            config,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            metrics: None,
        }
    }

    pub fn with_bundler(mut self, bundler: Arc<dyn Bundler>) -> Self {
        self.bundler = Some(bundler);
        self
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn relay_config(&self) -> &RelayConfig {
        &self.config
    }

    /// Requested tip (or the default) clamped to `[min_tip, max_tip]`
    pub fn clamp_tip(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.config.default_tip_lamports)
            .clamp(self.config.min_tip_lamports, self.config.max_tip_lamports)
    }

    #[instrument(skip(self, transaction, options), fields(mode = %options.mode))]
    pub async fn submit(
        &self,
        transaction: &VersionedTransaction,
        options: &SubmitOptions,
    ) -> Result<MevSubmitResult, SubmissionError> {
        let timer = Timer::new();
        let result = match options.mode {
            SubmissionMode::Relay => self.submit_relay(transaction, options, &timer).await,
            SubmissionMode::Priority => {
                self.submit_direct(transaction, options, SubmissionMode::Priority, &timer)
                    .await
            }
            SubmissionMode::Direct => {
                self.submit_direct(transaction, options, SubmissionMode::Direct, &timer)
                    .await
            }
        };

        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(_) => {
                    metrics.submission_latency_ms.observe(timer.elapsed_ms() as f64);
                    metrics.record_rpc_outcome("success");
                }
                Err(_) => metrics.record_rpc_outcome("error"),
            }
        }
        result
    }

    async fn submit_direct(
        &self,
        transaction: &VersionedTransaction,
        options: &SubmitOptions,
        mode: SubmissionMode,
        timer: &Timer,
    ) -> Result<MevSubmitResult, SubmissionError> {
        let send = SendOptions {
            skip_preflight: false,
            max_retries: match mode {
                SubmissionMode::Priority => PRIORITY_MAX_RETRIES,
                _ => DIRECT_MAX_RETRIES,
            },
            commitment: options.commitment,
            confirm_timeout: self.confirm_timeout,
        };

        let Landed {
            signature,
            slot,
            endpoint,
        } = self.sender.send_and_confirm(transaction, &send).await?;

        let latency_ms = timer.elapsed_ms();
        debug!(signature = %signature, slot, endpoint = %endpoint, latency_ms, "Transaction confirmed");

        Ok(MevSubmitResult {
            signature: signature.to_string(),
            protected: false,
            mode,
            bundle_id: None,
            slot: Some(slot),
            confirmed: true,
            latency_ms,
            endpoint: Some(endpoint),
            tip_lamports: None,
            fell_back: false,
        })
    }

    async fn submit_relay(
        &self,
        transaction: &VersionedTransaction,
        options: &SubmitOptions,
        timer: &Timer,
    ) -> Result<MevSubmitResult, SubmissionError> {
        let tip = self.clamp_tip(options.tip_lamports);

        let relay_error = match &self.bundler {
            Some(bundler) => match self.land_bundle(bundler.as_ref(), transaction).await {
                Ok((bundle_id, slot)) => {
                    let latency_ms = timer.elapsed_ms();
                    info!(bundle_id = %bundle_id, slot, tip_lamports = tip, latency_ms, "Bundle landed");
                    return Ok(MevSubmitResult {
                        signature: transaction
                            .signatures
                            .first()
                            .map(|s| s.to_string())
                            .unwrap_or_default(),
                        protected: true,
                        mode: SubmissionMode::Relay,
                        bundle_id: Some(bundle_id),
                        slot: Some(slot),
                        confirmed: true,
                        latency_ms,
                        endpoint: None,
                        tip_lamports: Some(tip),
                        fell_back: false,
                    });
                }
                Err(e) => e,
            },
            None => RelayError::NotConfigured,
        };

        // Same signed transaction: the network dedups by signature if the bundle lands late
        warn!(error = %relay_error, "Relay submission failed, falling back to direct send");
        if let Some(metrics) = &self.metrics {
            metrics.relay_fallbacks_total.inc();
        }

        let mut result = self
            .submit_direct(transaction, options, SubmissionMode::Direct, timer)
            .await?;
        result.fell_back = true;
        Ok(result)
    }

    /// Send a single-transaction bundle and poll until it lands, fails or times out
    async fn land_bundle(
        &self,
        bundler: &dyn Bundler,
        transaction: &VersionedTransaction,
    ) -> Result<(String, u64), RelayError> {
        let timeout = self.config.bundle_timeout();
        let deadline = Instant::now() + timeout;

        let bundle_id = tokio::time::timeout(timeout, bundler.send_bundle(std::slice::from_ref(transaction)))
            .await
            .map_err(|_| RelayError::Timeout {
                bundle_id: String::new(),
                timeout_ms: timeout.as_millis() as u64,
            })??;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(RelayError::Timeout {
                    bundle_id,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;

            match tokio::time::timeout(deadline.saturating_duration_since(Instant::now()), bundler.bundle_status(&bundle_id)).await {
                Ok(Ok(BundleStatus::Landed { slot })) => return Ok((bundle_id, slot)),
                Ok(Ok(BundleStatus::Failed { reason })) => {
                    return Err(RelayError::BundleFailed { bundle_id, reason });
                }
                Ok(Ok(BundleStatus::Pending)) => {
                    debug!(bundle_id = %bundle_id, "Bundle pending");
                }
                Ok(Err(e)) => {
                    // Status endpoint hiccups do not end the wait
                    warn!(bundle_id = %bundle_id, error = %e, "Bundle status check failed");
                }
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use solana_sdk::signature::Signature;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeSender {
        outcomes: Mutex<VecDeque<Result<Landed, SubmissionError>>>,
        calls: Mutex<Vec<SendOptions>>,
    }

    impl FakeSender {
        fn landing() -> Self {
            let fake = Self::default();
            fake.outcomes.lock().push_back(Ok(Landed {
                signature: Signature::default(),
                slot: 77,
                endpoint: "primary".to_string(),
            }));
            fake
        }
    }

    #[async_trait]
    impl TransactionSender for FakeSender {
        async fn send_and_confirm(
            &self,
            _transaction: &VersionedTransaction,
            options: &SendOptions,
        ) -> Result<Landed, SubmissionError> {
            self.calls.lock().push(options.clone());
            self.outcomes.lock().pop_front().unwrap_or_else(|| {
                Err(SubmissionError::Rpc(RpcManagerError::Internal("no scripted outcome".into())))
            })
        }
    }

    struct FakeBundler {
        send: Result<String, RelayError>,
        status: BundleStatus,
    }

    #[async_trait]
    impl Bundler for FakeBundler {
        async fn send_bundle(&self, transactions: &[VersionedTransaction]) -> Result<String, RelayError> {
            assert_eq!(transactions.len(), 1);
            self.send.clone()
        }

        async fn bundle_status(&self, _bundle_id: &str) -> Result<BundleStatus, RelayError> {
            Ok(self.status.clone())
        }
    }

    fn relay_config() -> RelayConfig {
        RelayConfig {
            min_tip_lamports: 1_000,
            max_tip_lamports: 100_000,
            default_tip_lamports: 10_000,
            poll_interval_ms: 500,
            bundle_timeout_ms: 3_000,
            ..RelayConfig::default()
        }
    }

    fn router(sender: Arc<FakeSender>, bundler: Option<FakeBundler>) -> SubmissionRouter {
        let router = SubmissionRouter::new(sender, relay_config())
            .with_metrics(Arc::new(Metrics::new().unwrap()));
        match bundler {
            Some(b) => router.with_bundler(Arc::new(b)),
            None => router,
        }
    }

    #[test]
    fn test_clamp_tip() {
        let r = router(Arc::new(FakeSender::default()), None);
        assert_eq!(r.clamp_tip(None), 10_000);
        assert_eq!(r.clamp_tip(Some(10)), 1_000);
        assert_eq!(r.clamp_tip(Some(5_000_000)), 100_000);
        assert_eq!(r.clamp_tip(Some(42_000)), 42_000);
    }

    #[tokio::test]
    async fn test_priority_and_direct_retry_counts() {
        let sender = Arc::new(FakeSender::landing());
        sender.outcomes.lock().push_back(Ok(Landed {
            signature: Signature::default(),
            slot: 78,
            endpoint: "backup".to_string(),
        }));
        let r = router(sender.clone(), None);
        let tx = VersionedTransaction::default();

        let res = r.submit(&tx, &SubmitOptions::new(SubmissionMode::Priority)).await.unwrap();
        assert_eq!(res.mode, SubmissionMode::Priority);
        assert!(!res.protected);
        assert_eq!(res.slot, Some(77));

        let res = r.submit(&tx, &SubmitOptions::new(SubmissionMode::Direct)).await.unwrap();
        assert_eq!(res.endpoint.as_deref(), Some("backup"));

        let calls = sender.calls.lock();
        assert_eq!(calls[0].max_retries, PRIORITY_MAX_RETRIES);
        assert_eq!(calls[1].max_retries, DIRECT_MAX_RETRIES);
        assert!(calls.iter().all(|c| !c.skip_preflight));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_landed() {
        let sender = Arc::new(FakeSender::default());
        let r = router(
            sender.clone(),
            Some(FakeBundler {
                send: Ok("bundle-1".to_string()),
                status: BundleStatus::Landed { slot: 900 },
            }),
        );
        let mut options = SubmitOptions::new(SubmissionMode::Relay);
        options.tip_lamports = Some(1);

        let res = r.submit(&VersionedTransaction::default(), &options).await.unwrap();
        assert!(res.protected);
        assert_eq!(res.mode, SubmissionMode::Relay);
        assert_eq!(res.bundle_id.as_deref(), Some("bundle-1"));
        assert_eq!(res.slot, Some(900));
        assert_eq!(res.tip_lamports, Some(1_000));
        assert!(sender.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_timeout_falls_back_to_direct() {
        let sender = Arc::new(FakeSender::landing());
        let metrics = Arc::new(Metrics::new().unwrap());
        let r = SubmissionRouter::new(sender.clone(), relay_config())
            .with_bundler(Arc::new(FakeBundler {
                send: Ok("bundle-2".to_string()),
                status: BundleStatus::Pending,
            }))
            .with_metrics(metrics.clone());

        let res = r
            .submit(&VersionedTransaction::default(), &SubmitOptions::new(SubmissionMode::Relay))
            .await
            .unwrap();
        assert_eq!(res.mode, SubmissionMode::Direct);
        assert!(res.fell_back);
        assert!(!res.protected);
        assert_eq!(metrics.relay_fallbacks_total.get(), 1);
        assert_eq!(sender.calls.lock()[0].max_retries, DIRECT_MAX_RETRIES);
    }

    #[tokio::test]
    async fn test_relay_rejection_falls_back() {
        let sender = Arc::new(FakeSender::landing());
        let r = router(
            sender,
            Some(FakeBundler {
                send: Err(RelayError::Rejected {
                    code: -32602,
                    message: "bundle must tip".to_string(),
                }),
                status: BundleStatus::Pending,
            }),
        );
        let res = r
            .submit(&VersionedTransaction::default(), &SubmitOptions::new(SubmissionMode::Relay))
            .await
            .unwrap();
        assert!(res.fell_back);
    }

    #[tokio::test]
    async fn test_relay_without_bundler_uses_direct() {
        let r = router(Arc::new(FakeSender::landing()), None);
        let res = r
            .submit(&VersionedTransaction::default(), &SubmitOptions::new(SubmissionMode::Relay))
            .await
            .unwrap();
        assert_eq!(res.mode, SubmissionMode::Direct);
        assert!(res.fell_back);
    }

    #[tokio::test]
    async fn test_failure_propagates_when_fallback_fails() {
        let sender = Arc::new(FakeSender::default());
        sender
            .outcomes
            .lock()
            .push_back(Err(SubmissionError::Rpc(RpcManagerError::InsufficientFunds {
                endpoint: "primary".to_string(),
            })));
        let r = router(sender, None);
        let err = r
            .submit(&VersionedTransaction::default(), &SubmitOptions::new(SubmissionMode::Direct))
            .await
            .unwrap_err();
        assert_eq!(err.endpoint(), Some("primary"));
        assert!(err.to_string().contains("Insufficient funds"));
    }
}
