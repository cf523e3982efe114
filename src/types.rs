//! Common types used throughout the execution pipeline

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Serde adapter that writes a `Pubkey` as its base58 string.
pub mod pubkey_string {
    use serde::{Deserialize, Deserializer, Serializer};
    use solana_sdk::pubkey::Pubkey;
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(key: &Pubkey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&key.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pubkey, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Pubkey::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// Current wall clock in unix milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Channel used to land a signed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionMode {
    /// Single-transaction bundle through the block-engine relay
    Relay,
    /// Preflighted send with an explicit priority fee
    Priority,
    /// Plain send, no protection requested
    #[default]
    Direct,
}

impl SubmissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionMode::Relay => "relay",
            SubmissionMode::Priority => "priority",
            SubmissionMode::Direct => "direct",
        }
    }
}

impl fmt::Display for SubmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relay" | "jito" => Ok(SubmissionMode::Relay),
            "priority" => Ok(SubmissionMode::Priority),
            "direct" => Ok(SubmissionMode::Direct),
            other => Err(format!("unknown submission mode '{}'", other)),
        }
    }
}

/// A user's intent to exchange `amount` of `input_mint` for `output_mint`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRequest {
    /// Caller-supplied idempotency key; derived from the swap fields when absent
    #[serde(default)]
    pub id: Option<String>,

    #[serde(with = "pubkey_string")]
    pub user: Pubkey,

    #[serde(with = "pubkey_string")]
    pub input_mint: Pubkey,

    #[serde(with = "pubkey_string")]
    pub output_mint: Pubkey,

    /// Amount of input token in base units
    pub amount: u64,

    /// Slippage tolerance in basis points
    pub slippage_bps: u16,

    #[serde(default)]
    pub protected_mode: bool,

    #[serde(default)]
    pub mode: SubmissionMode,

    /// Compute unit price for priority submissions
    #[serde(default)]
    pub priority_fee_micro_lamports: Option<u64>,

    /// Requested relay tip; clamped by the router
    #[serde(default)]
    pub tip_lamports: Option<u64>,
}

impl SwapRequest {
    /// Key identifying one user intent; two executions with the same key must never overlap
    pub fn swap_key(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!(
                "{}:{}:{}:{}",
                self.user, self.input_mint, self.output_mint, self.amount
            ),
        }
    }
}

/// One hop of an aggregator route
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SwapInfo {
    #[serde(default)]
    pub label: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoutePlanStep {
    #[serde(default)]
    pub swap_info: SwapInfo,

    #[serde(default)]
    pub percent: Option<u8>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Aggregator quote, read-only for this crate.
///
/// Unknown fields are preserved in `extra` so the quote can be handed back
/// to the aggregator's swap endpoint unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: String,
    pub out_amount: String,

    #[serde(default)]
    pub other_amount_threshold: String,

    pub slippage_bps: u16,

    /// Decimal fraction, "0.035" is 3.5 %
    #[serde(default)]
    pub price_impact_pct: String,

    #[serde(default)]
    pub route_plan: Vec<RoutePlanStep>,

    /// When the quote was obtained (unix ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Quote {
    /// Price impact as a fraction, `None` when the field does not parse
    pub fn price_impact(&self) -> Option<f64> {
        let raw = self.price_impact_pct.trim();
        if raw.is_empty() {
            return Some(0.0);
        }
        raw.parse::<f64>().ok().filter(|v| v.is_finite()).map(f64::abs)
    }

    pub fn in_amount_u64(&self) -> Option<u64> {
        self.in_amount.parse().ok()
    }

    pub fn out_amount_u64(&self) -> Option<u64> {
        self.out_amount.parse().ok()
    }

    pub fn min_out_amount_u64(&self) -> Option<u64> {
        self.other_amount_threshold.parse().ok()
    }

    pub fn hop_count(&self) -> usize {
        self.route_plan.len()
    }

    pub fn route_labels(&self) -> Vec<String> {
        self.route_plan
            .iter()
            .map(|step| step.swap_info.label.clone().unwrap_or_else(|| "unknown".to_string()))
            .collect()
    }

    /// Age of the quote in seconds at `now_ms`; zero when the quote carries no timestamp
    pub fn age_secs(&self, now_ms: i64) -> f64 {
        match self.timestamp_ms {
            Some(ts) if ts > 0 => ((now_ms - ts).max(0) as f64) / 1000.0,
            _ => 0.0,
        }
    }

    /// Check that this quote prices exactly the swap that was requested
    pub fn validate_against(&self, request: &SwapRequest) -> Result<(), String> {
        if self.input_mint != request.input_mint.to_string() {
            return Err(format!(
                "quote input mint {} does not match request {}",
                self.input_mint, request.input_mint
            ));
        }
        if self.output_mint != request.output_mint.to_string() {
            return Err(format!(
                "quote output mint {} does not match request {}",
                self.output_mint, request.output_mint
            ));
        }
        match self.in_amount_u64() {
            Some(amount) if amount == request.amount => {}
            Some(amount) => {
                return Err(format!(
                    "quote in amount {} does not match requested {}",
                    amount, request.amount
                ))
            }
            None => return Err(format!("quote in amount '{}' is not a number", self.in_amount)),
        }
        if self.slippage_bps > request.slippage_bps {
            return Err(format!(
                "quote slippage {} bps exceeds requested {} bps",
                self.slippage_bps, request.slippage_bps
            ));
        }
        Ok(())
    }
}
