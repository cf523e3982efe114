//! Pre-trade risk scoring
//!
//! The gate combines a trade-risk pass over the quote with a token-safety
//! pass over both mints and returns a traffic-light verdict plus the
//! protected-mode blocking decision.

pub mod gate;
pub mod policy;
pub mod token_safety;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use gate::RiskGate;
pub use policy::{KnownToken, RiskPolicy, RiskThresholds};
pub use token_safety::{
    MintAccount, MintSource, RpcMintSource, StaticMintSource, TokenMetadata, TokenSafetyChecker,
    TokenSafetyInfo,
};

/// Traffic-light verdict; ordering is severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    #[default]
    Green,
    Amber,
    Red,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Green => "GREEN",
            RiskLevel::Amber => "AMBER",
            RiskLevel::Red => "RED",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskCode {
    PriceImpactHigh,
    PriceImpactUnsafe,
    /// `priceImpactPct` did not parse
    PriceImpactUnknown,
    SlippageHigh,
    SlippageUnsafe,
    /// Quick-check absolute ceiling
    SlippageAboveCeiling,
    RouteTooComplex,
    QuoteStale,
    QuoteExpired,
    TokenBlacklisted,
    TokenNotWhitelisted,
    /// Mint account could not be read
    TokenUnknown,
    TokenHasFreezeAuthority,
    TokenHasMintAuthority,
    #[serde(rename = "TOKEN_2022_TRANSFER_FEE")]
    Token2022TransferFee,
    #[serde(rename = "TOKEN_2022_UNSUPPORTED")]
    Token2022Unsupported,
    TokenSymbolSpoof,
    UnknownTokenRiskyTrade,
    /// AMBER swap above the protected-mode slippage ceiling
    ProtectedSlippageExceeded,
    /// AMBER swap above the protected-mode price impact ceiling
    ProtectedPriceImpactExceeded,
}

impl RiskCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCode::PriceImpactHigh => "PRICE_IMPACT_HIGH",
            RiskCode::PriceImpactUnsafe => "PRICE_IMPACT_UNSAFE",
            RiskCode::PriceImpactUnknown => "PRICE_IMPACT_UNKNOWN",
            RiskCode::SlippageHigh => "SLIPPAGE_HIGH",
            RiskCode::SlippageUnsafe => "SLIPPAGE_UNSAFE",
            RiskCode::SlippageAboveCeiling => "SLIPPAGE_ABOVE_CEILING",
            RiskCode::RouteTooComplex => "ROUTE_TOO_COMPLEX",
            RiskCode::QuoteStale => "QUOTE_STALE",
            RiskCode::QuoteExpired => "QUOTE_EXPIRED",
            RiskCode::TokenBlacklisted => "TOKEN_BLACKLISTED",
            RiskCode::TokenNotWhitelisted => "TOKEN_NOT_WHITELISTED",
            RiskCode::TokenUnknown => "TOKEN_UNKNOWN",
            RiskCode::TokenHasFreezeAuthority => "TOKEN_HAS_FREEZE_AUTHORITY",
            RiskCode::TokenHasMintAuthority => "TOKEN_HAS_MINT_AUTHORITY",
            RiskCode::Token2022TransferFee => "TOKEN_2022_TRANSFER_FEE",
            RiskCode::Token2022Unsupported => "TOKEN_2022_UNSUPPORTED",
            RiskCode::TokenSymbolSpoof => "TOKEN_SYMBOL_SPOOF",
            RiskCode::UnknownTokenRiskyTrade => "UNKNOWN_TOKEN_RISKY_TRADE",
            RiskCode::ProtectedSlippageExceeded => "PROTECTED_SLIPPAGE_EXCEEDED",
            RiskCode::ProtectedPriceImpactExceeded => "PROTECTED_PRICE_IMPACT_EXCEEDED",
        }
    }
}

impl fmt::Display for RiskCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value that tripped a rule next to the limit it was compared with
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub used: f64,
    pub limit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskReason {
    pub code: RiskCode,
    pub severity: RiskLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Threshold>,
}

impl RiskReason {
    pub fn new(code: RiskCode, severity: RiskLevel, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            threshold: None,
        }
    }

    pub fn with_threshold(mut self, used: f64, limit: f64) -> Self {
        self.threshold = Some(Threshold { used, limit });
        self
    }
}

impl fmt::Display for RiskReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.code, self.message)?;
        if let Some(t) = &self.threshold {
            write!(f, " (used {}, limit {})", t.used, t.limit)?;
        }
        Ok(())
    }
}

/// Result of one scoring call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Evaluation order, not severity order
    pub reasons: Vec<RiskReason>,
    pub input_token: TokenSafetyInfo,
    pub output_token: TokenSafetyInfo,
    pub blocked_in_protected_mode: bool,
    pub requires_acknowledgement: bool,
    pub quote_age_secs: f64,
    pub thresholds: RiskThresholds,
}

impl RiskAssessment {
    pub fn has_code(&self, code: RiskCode) -> bool {
        self.reasons.iter().any(|r| r.code == code)
    }

    pub fn codes(&self) -> Vec<RiskCode> {
        self.reasons.iter().map(|r| r.code).collect()
    }

    /// Reasons at the overall level, the ones a user needs to see first
    pub fn top_reasons(&self) -> impl Iterator<Item = &RiskReason> {
        self.reasons.iter().filter(move |r| r.severity == self.level)
    }
}

/// Max severity over `reasons`, GREEN when empty
pub fn overall_level(reasons: &[RiskReason]) -> RiskLevel {
    reasons
        .iter()
        .map(|r| r.severity)
        .max()
        .unwrap_or(RiskLevel::Green)
}

/// Executed output against quoted output in signed basis points.
///
/// Negative means the user received less than quoted.
pub fn calculate_actual_slippage_bps(expected: u64, actual: u64) -> i64 {
    if expected == 0 {
        return 0;
    }
    let diff = actual as i128 - expected as i128;
    let bps = diff * 10_000 / expected as i128;
    i64::try_from(bps).unwrap_or(if bps > 0 { i64::MAX } else { i64::MIN })
}
