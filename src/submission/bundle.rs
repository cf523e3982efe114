//! Block-engine relay integration.
//!
//! Bundles go to the Jito block engine over its JSON-RPC HTTP API
//! (`sendBundle`, `getBundleStatuses` on `{url}/api/v1/bundles`).

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use solana_sdk::pubkey;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_instruction::SystemInstruction;
use solana_sdk::system_program;
use solana_sdk::transaction::VersionedTransaction;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Published block-engine tip accounts; a bundle must pay one of them
pub const JITO_TIP_ACCOUNTS: [Pubkey; 8] = [
    pubkey!("96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5"),
    pubkey!("HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe"),
    pubkey!("Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY"),
    pubkey!("ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49"),
    pubkey!("DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh"),
    pubkey!("ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt"),
    pubkey!("DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL"),
    pubkey!("3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT"),
];

pub fn is_tip_account(key: &Pubkey) -> bool {
    JITO_TIP_ACCOUNTS.contains(key)
}

/// Lamports the transaction transfers to a tip account, if any.
///
/// Only statically addressed accounts are inspected; a tip routed through an
/// address lookup table is not seen.
pub fn bundle_tip_lamports(tx: &VersionedTransaction) -> Option<u64> {
    let keys = tx.message.static_account_keys();
    let mut total: Option<u64> = None;
    for ix in tx.message.instructions() {
        let Some(program) = keys.get(ix.program_id_index as usize) else {
            continue;
        };
        if *program != system_program::id() {
            continue;
        }
        let Ok(SystemInstruction::Transfer { lamports }) = bincode::deserialize::<SystemInstruction>(&ix.data) else {
            continue;
        };
        let destination = ix.accounts.get(1).and_then(|i| keys.get(*i as usize));
        if destination.is_some_and(is_tip_account) {
            total = Some(total.unwrap_or(0).saturating_add(lamports));
        }
    }
    total
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RelayError {
    #[error("Relay HTTP error: {0}")]
    Http(String),

    #[error("Relay rejected request: {message} (code: {code})")]
    Rejected { code: i64, message: String },

    #[error("Relay returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to encode transaction: {0}")]
    Encoding(String),

    #[error("Bundle {bundle_id} failed: {reason}")]
    BundleFailed { bundle_id: String, reason: String },

    #[error("Bundle {bundle_id} not landed after {timeout_ms}ms")]
    Timeout { bundle_id: String, timeout_ms: u64 },

    #[error("No relay configured")]
    NotConfigured,
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Http(err.to_string())
    }
}

/// Relay-side view of a submitted bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleStatus {
    /// Not seen on chain yet
    Pending,
    Landed { slot: u64 },
    Failed { reason: String },
}

#[async_trait]
pub trait Bundler: Send + Sync {
    /// Submit `transactions` as one atomic bundle and return the bundle id
    async fn send_bundle(&self, transactions: &[VersionedTransaction]) -> Result<String, RelayError>;

    async fn bundle_status(&self, bundle_id: &str) -> Result<BundleStatus, RelayError>;
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct BundleStatusesResult {
    #[serde(default)]
    value: Option<Vec<Option<BundleStatusEntry>>>,
}

#[derive(Debug, Deserialize)]
struct BundleStatusEntry {
    slot: u64,
    #[serde(default)]
    confirmation_status: Option<String>,
    #[serde(default)]
    err: Option<Value>,
}

impl BundleStatusEntry {
    fn into_status(self) -> BundleStatus {
        match self.err {
            None | Some(Value::Null) => BundleStatus::Landed { slot: self.slot },
            Some(Value::Object(ref map)) if map.get("Ok").is_some() => BundleStatus::Landed { slot: self.slot },
            Some(other) => BundleStatus::Failed {
                reason: other.to_string(),
            },
        }
    }
}

/// HTTP client for one block-engine region
#[derive(Debug, Clone)]
pub struct JitoBundler {
    client: reqwest::Client,
    bundles_url: String,
}

impl JitoBundler {
    pub fn new(block_engine_url: &str, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            bundles_url: format!("{}/api/v1/bundles", block_engine_url.trim_end_matches('/')),
        })
    }

    pub fn bundles_url(&self) -> &str {
        &self.bundles_url
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RelayError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self.client.post(&self.bundles_url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(RelayError::Rejected {
                code: status.as_u16() as i64,
                message: text,
            });
        }

        let parsed: JsonRpcResponse<T> =
            serde_json::from_str(&text).map_err(|e| RelayError::InvalidResponse(e.to_string()))?;
        if let Some(err) = parsed.error {
            return Err(RelayError::Rejected {
                code: err.code,
                message: err.message,
            });
        }
        parsed
            .result
            .ok_or_else(|| RelayError::InvalidResponse(format!("{} returned no result", method)))
    }
}

#[async_trait]
impl Bundler for JitoBundler {
    #[instrument(skip(self, transactions), fields(count = transactions.len()))]
    async fn send_bundle(&self, transactions: &[VersionedTransaction]) -> Result<String, RelayError> {
        if !transactions.iter().any(|tx| bundle_tip_lamports(tx).is_some()) {
            warn!("Bundle carries no tip transfer, the block engine may drop it");
        }

        let encoded = transactions
            .iter()
            .map(|tx| {
                bincode::serialize(tx)
                    .map(|bytes| STANDARD.encode(bytes))
                    .map_err(|e| RelayError::Encoding(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let bundle_id: String = self
            .call("sendBundle", json!([encoded, { "encoding": "base64" }]))
            .await?;
        debug!(bundle_id = %bundle_id, "Bundle accepted by block engine");
        Ok(bundle_id)
    }

    async fn bundle_status(&self, bundle_id: &str) -> Result<BundleStatus, RelayError> {
        let result: BundleStatusesResult = self.call("getBundleStatuses", json!([[bundle_id]])).await?;
        let entry = result.value.and_then(|v| v.into_iter().next().flatten());
        Ok(match entry {
            Some(entry) => {
                debug!(
                    bundle_id,
                    slot = entry.slot,
                    confirmation = entry.confirmation_status.as_deref().unwrap_or("-"),
                    "Bundle status"
                );
                entry.into_status()
            }
            None => BundleStatus::Pending,
        })
    }
}
