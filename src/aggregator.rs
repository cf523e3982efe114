//! Jupiter swap API client.
//!
//! Provides fresh quotes for requotes (`GET /quote`) and builds signed swap
//! transactions (`POST /swap`). The local keypair only signs; route finding
//! stays with the aggregator.

use crate::config::AggregatorConfig;
use crate::execution::{BuildParams, QuoteProvider, SwapTransactionBuilder};
use crate::types::{now_ms, Quote, SubmissionMode, SwapRequest};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use solana_sdk::transaction::VersionedTransaction;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    swap_transaction: String,
    #[serde(default)]
    last_valid_block_height: Option<u64>,
}

pub struct JupiterClient {
    http: reqwest::Client,
    base_url: String,
    signer: Option<Arc<Keypair>>,
}

impl std::fmt::Debug for JupiterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JupiterClient")
            .field("base_url", &self.base_url)
            .field("signer", &self.signer.as_ref().map(|k| k.pubkey()))
            .finish()
    }
}

impl JupiterClient {
    pub fn new(config: &AggregatorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("building aggregator HTTP client")?;
        Ok(Self {
            http,
            base_url: config.quote_api_url.trim_end_matches('/').to_string(),
            signer: None,
        })
    }

    pub fn with_signer(mut self, keypair: Arc<Keypair>) -> Self {
        self.signer = Some(keypair);
        self
    }

    /// Fetch a quote for `request`, stamped with the local receive time
    #[instrument(skip(self, request), fields(input = %request.input_mint, output = %request.output_mint, amount = request.amount))]
    pub async fn quote(&self, request: &SwapRequest) -> Result<Quote> {
        let url = format!("{}/quote", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("inputMint", request.input_mint.to_string()),
                ("outputMint", request.output_mint.to_string()),
                ("amount", request.amount.to_string()),
                ("slippageBps", request.slippage_bps.to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("requesting {}", url))?;

        let status = response.status();
        let body = response.text().await.context("reading quote response")?;
        if !status.is_success() {
            bail!("aggregator /quote returned {}: {}", status, body);
        }

        let mut quote: Quote = serde_json::from_str(&body).context("decoding quote")?;
        quote.timestamp_ms = Some(now_ms());
        debug!(
            out_amount = %quote.out_amount,
            price_impact = %quote.price_impact_pct,
            hops = quote.hop_count(),
            "Quote received"
        );
        Ok(quote)
    }

    /// Request body for `POST /swap`
    pub fn swap_body(&self, request: &SwapRequest, quote: &Quote, params: &BuildParams) -> Result<Value> {
        let mut quote_response = serde_json::to_value(quote).context("encoding quote")?;
        if let Some(map) = quote_response.as_object_mut() {
            map.remove("timestampMs");
        }

        let mut body = json!({
            "quoteResponse": quote_response,
            "userPublicKey": request.user.to_string(),
            "wrapAndUnwrapSol": true,
            "dynamicComputeUnitLimit": true,
        });
        match params.mode {
            SubmissionMode::Relay => {
                if let Some(tip) = params.tip_lamports {
                    body["prioritizationFeeLamports"] = json!({ "jitoTipLamports": tip });
                }
            }
            SubmissionMode::Priority => {
                if let Some(fee) = params.priority_fee_micro_lamports {
                    body["computeUnitPriceMicroLamports"] = json!(fee);
                }
            }
            SubmissionMode::Direct => {}
        }
        Ok(body)
    }

    #[instrument(skip_all, fields(mode = %params.mode))]
    pub async fn swap_transaction(
        &self,
        request: &SwapRequest,
        quote: &Quote,
        params: &BuildParams,
    ) -> Result<VersionedTransaction> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| anyhow!("no signer configured for swap building"))?;
        if signer.pubkey() != request.user {
            bail!(
                "signer {} does not match request user {}",
                signer.pubkey(),
                request.user
            );
        }

        let url = format!("{}/swap", self.base_url);
        let body = self.swap_body(request, quote, params)?;
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("requesting {}", url))?;

        let status = response.status();
        let text = response.text().await.context("reading swap response")?;
        if !status.is_success() {
            bail!("aggregator /swap returned {}: {}", status, text);
        }
        let swap: SwapResponse = serde_json::from_str(&text).context("decoding swap response")?;

        let bytes = STANDARD
            .decode(swap.swap_transaction.as_bytes())
            .context("swap transaction is not base64")?;
        let unsigned: VersionedTransaction =
            bincode::deserialize(&bytes).context("swap transaction does not deserialize")?;
        let signed = VersionedTransaction::try_new(unsigned.message, &[signer.as_ref()])
            .context("signing swap transaction")?;

        debug!(
            last_valid_block_height = ?swap.last_valid_block_height,
            signature = ?signed.signatures.first(),
            "Swap transaction built"
        );
        Ok(signed)
    }
}

#[async_trait]
impl QuoteProvider for JupiterClient {
    async fn get_quote(&self, request: &SwapRequest) -> Result<Quote> {
        self.quote(request).await
    }
}

#[async_trait]
impl SwapTransactionBuilder for JupiterClient {
    async fn build(&self, request: &SwapRequest, quote: &Quote, params: &BuildParams) -> Result<VersionedTransaction> {
        self.swap_transaction(request, quote, params).await
    }
}
