//! Direct send and confirmation through the RPC pool

use super::router::SubmissionError;
use crate::rpc_manager::{RpcManagerError, RpcPool};
use async_trait::async_trait;
use solana_rpc_client_api::config::RpcSendTransactionConfig;
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub struct SendOptions {
    pub skip_preflight: bool,
    /// Node-side rebroadcast count
    pub max_retries: usize,
    pub commitment: CommitmentLevel,
    /// Upper bound on send plus confirmation
    pub confirm_timeout: Duration,
}

/// A transaction the network accepted at the requested commitment
#[derive(Debug, Clone, PartialEq)]
pub struct Landed {
    pub signature: Signature,
    pub slot: u64,
    pub endpoint: String,
}

#[async_trait]
pub trait TransactionSender: Send + Sync {
    async fn send_and_confirm(
        &self,
        transaction: &VersionedTransaction,
        options: &SendOptions,
    ) -> Result<Landed, SubmissionError>;
}

impl RpcPool {
    async fn send_once(
        &self,
        transaction: &VersionedTransaction,
        options: &SendOptions,
    ) -> Result<(Signature, String), RpcManagerError> {
        let config = RpcSendTransactionConfig {
            skip_preflight: options.skip_preflight,
            preflight_commitment: Some(options.commitment),
            max_retries: Some(options.max_retries),
            ..Default::default()
        };
        self.with_failover(
            |handle| {
                let tx = transaction.clone();
                let config = config.clone();
                async move {
                    handle
                        .client
                        .send_transaction_with_config(&tx, config)
                        .await
                        .map(|sig| (sig, handle.name.clone()))
                        .map_err(|e| RpcManagerError::from_client_error(e, &handle.url))
                }
            },
            self.config().failover_retries,
        )
        .await
    }

    async fn last_valid_block_height(&self, commitment: CommitmentConfig) -> Result<u64, RpcManagerError> {
        self.with_failover(
            |handle| async move {
                handle
                    .client
                    .get_latest_blockhash_with_commitment(commitment)
                    .await
                    .map(|(_, height)| height)
                    .map_err(|e| RpcManagerError::from_client_error(e, &handle.url))
            },
            self.config().failover_retries,
        )
        .await
    }

    /// `Some(slot)` once the signature reached `commitment`; program errors are surfaced
    async fn poll_status(
        &self,
        signature: &Signature,
        commitment: CommitmentConfig,
    ) -> Result<Option<u64>, SubmissionError> {
        let signature = *signature;
        let statuses = self
            .with_failover(
                |handle| async move {
                    handle
                        .client
                        .get_signature_statuses(&[signature])
                        .await
                        .map(|response| response.value)
                        .map_err(|e| RpcManagerError::from_client_error(e, &handle.url))
                },
                self.config().failover_retries,
            )
            .await?;

        match statuses.into_iter().next().flatten() {
            Some(status) => {
                if let Some(err) = status.err {
                    return Err(SubmissionError::OnChain {
                        signature: signature.to_string(),
                        message: err.to_string(),
                    });
                }
                if status.satisfies_commitment(commitment) {
                    Ok(Some(status.slot))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    async fn block_height(&self, commitment: CommitmentConfig) -> Result<u64, RpcManagerError> {
        self.with_failover(
            |handle| async move {
                handle
                    .client
                    .get_block_height_with_commitment(commitment)
                    .await
                    .map_err(|e| RpcManagerError::from_client_error(e, &handle.url))
            },
            self.config().failover_retries,
        )
        .await
    }
}

#[async_trait]
impl TransactionSender for RpcPool {
    #[instrument(skip(self, transaction, options), fields(commitment = ?options.commitment))]
    async fn send_and_confirm(
        &self,
        transaction: &VersionedTransaction,
        options: &SendOptions,
    ) -> Result<Landed, SubmissionError> {
        let commitment = CommitmentConfig {
            commitment: options.commitment,
        };
        let deadline = Instant::now() + options.confirm_timeout;

        let last_valid = self.last_valid_block_height(commitment).await?;
        let (signature, endpoint) = self.send_once(transaction, options).await?;
        debug!(signature = %signature, endpoint = %endpoint, last_valid, "Transaction sent");

        loop {
            if let Some(slot) = self.poll_status(&signature, commitment).await? {
                return Ok(Landed {
                    signature,
                    slot,
                    endpoint,
                });
            }

            match self.block_height(commitment).await {
                Ok(height) if height > last_valid => {
                    return Err(SubmissionError::Expired {
                        signature: signature.to_string(),
                        last_valid_block_height: last_valid,
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Block height check failed, still polling"),
            }

            if Instant::now() + CONFIRM_POLL_INTERVAL > deadline {
                return Err(SubmissionError::ConfirmTimeout {
                    signature: signature.to_string(),
                    timeout_ms: options.confirm_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
        }
    }
}
