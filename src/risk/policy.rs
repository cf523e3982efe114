use serde::{Deserialize, Serialize};
use crate::config::ConfigError;

pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";
pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
pub const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";
pub const PYUSD_MINT: &str = "2b1kV6DkPAnxd5ixfnxCpjxmKwqjjaYmCZfHsFu24GXo";

/// Numeric limits, also echoed back in every assessment.
///
/// Price impact limits are percentages; quotes carry a fraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    #[serde(default = "default_price_impact_caution")]
    pub price_impact_caution_pct: f64,
    #[serde(default = "default_price_impact_unsafe")]
    pub price_impact_unsafe_pct: f64,
    #[serde(default = "default_protected_max_price_impact")]
    pub protected_max_price_impact_pct: f64,

    #[serde(default = "default_slippage_caution")]
    pub slippage_caution_bps: u16,
    #[serde(default = "default_slippage_unsafe")]
    pub slippage_unsafe_bps: u16,
    #[serde(default = "default_protected_max_slippage")]
    pub protected_max_slippage_bps: u16,
    /// Anything above this is rejected by the quick check
    #[serde(default = "default_slippage_ceiling")]
    pub slippage_ceiling_bps: u16,

    #[serde(default = "default_max_route_hops")]
    pub max_route_hops: usize,

    #[serde(default = "default_quote_stale")]
    pub quote_stale_secs: f64,
    #[serde(default = "default_quote_expired")]
    pub quote_expired_secs: f64,
}

fn default_price_impact_caution() -> f64 {
    2.0
}
fn default_price_impact_unsafe() -> f64 {
    3.0
}
fn default_protected_max_price_impact() -> f64 {
    1.0
}
fn default_slippage_caution() -> u16 {
    100
}
fn default_slippage_unsafe() -> u16 {
    300
}
fn default_protected_max_slippage() -> u16 {
    100
}
fn default_slippage_ceiling() -> u16 {
    1_000
}
fn default_max_route_hops() -> usize {
    3
}
fn default_quote_stale() -> f64 {
    30.0
}
fn default_quote_expired() -> f64 {
    60.0
}
fn default_token_cache_ttl() -> u64 {
    1_800
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            price_impact_caution_pct: default_price_impact_caution(),
            price_impact_unsafe_pct: default_price_impact_unsafe(),
            protected_max_price_impact_pct: default_protected_max_price_impact(),
            slippage_caution_bps: default_slippage_caution(),
            slippage_unsafe_bps: default_slippage_unsafe(),
            protected_max_slippage_bps: default_protected_max_slippage(),
            slippage_ceiling_bps: default_slippage_ceiling(),
            max_route_hops: default_max_route_hops(),
            quote_stale_secs: default_quote_stale(),
            quote_expired_secs: default_quote_expired(),
        }
    }
}

/// Allowlisted mint with its canonical symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownToken {
    pub symbol: String,
    pub mint: String,
}

impl KnownToken {
    fn new(symbol: &str, mint: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            mint: mint.to_string(),
        }
    }
}

fn default_allowlist() -> Vec<KnownToken> {
    vec![
        KnownToken::new("SOL", WSOL_MINT),
        KnownToken::new("USDC", USDC_MINT),
        KnownToken::new("USDT", USDT_MINT),
        KnownToken::new("PYUSD", PYUSD_MINT),
        KnownToken::new("JUP", "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN"),
        KnownToken::new("BONK", "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263"),
        KnownToken::new("MSOL", "mSoLzYCxHdYgdzU16g5QSh3i5K3z3KZK7ytfqcJm7So"),
        KnownToken::new("JITOSOL", "J1toso1uCk3RLmjorhTtrVwY9HJ7X8V9yYac6Y7kGCPn"),
    ]
}

/// Issuer-controlled stablecoins; their authorities are expected
fn default_authority_exempt() -> Vec<String> {
    vec![
        USDC_MINT.to_string(),
        USDT_MINT.to_string(),
        PYUSD_MINT.to_string(),
    ]
}

/// `[risk]` section: thresholds plus token lists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPolicy {
    #[serde(flatten)]
    pub thresholds: RiskThresholds,

    #[serde(default = "default_allowlist")]
    pub allowlist: Vec<KnownToken>,

    #[serde(default)]
    pub denylist: Vec<String>,

    /// Mints whose freeze/mint authority is not reported
    #[serde(default = "default_authority_exempt")]
    pub authority_exempt: Vec<String>,

    #[serde(default = "default_token_cache_ttl")]
    pub token_cache_ttl_secs: u64,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            thresholds: RiskThresholds::default(),
            allowlist: default_allowlist(),
            denylist: Vec::new(),
            authority_exempt: default_authority_exempt(),
            token_cache_ttl_secs: default_token_cache_ttl(),
        }
    }
}

impl RiskPolicy {
    pub fn is_denylisted(&self, mint: &str) -> bool {
        self.denylist.iter().any(|m| m == mint)
    }

    pub fn is_allowlisted(&self, mint: &str) -> bool {
        self.allowlist.iter().any(|t| t.mint == mint)
    }

    pub fn is_authority_exempt(&self, mint: &str) -> bool {
        self.authority_exempt.iter().any(|m| m == mint)
    }

    /// Mint that owns `symbol` on the allowlist
    pub fn canonical_mint(&self, symbol: &str) -> Option<&str> {
        let symbol = symbol.trim();
        self.allowlist
            .iter()
            .find(|t| t.symbol.eq_ignore_ascii_case(symbol))
            .map(|t| t.mint.as_str())
    }

    /// Canonical symbol of an allowlisted mint
    pub fn known_symbol(&self, mint: &str) -> Option<&str> {
        self.allowlist
            .iter()
            .find(|t| t.mint == mint)
            .map(|t| t.symbol.as_str())
    }

    pub fn with_denylisted(mut self, mint: impl Into<String>) -> Self {
        self.denylist.push(mint.into());
        self
    }

    pub fn with_allowlisted(mut self, symbol: &str, mint: impl Into<String>) -> Self {
        self.allowlist.push(KnownToken {
            symbol: symbol.to_string(),
            mint: mint.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        if t.price_impact_caution_pct >= t.price_impact_unsafe_pct {
            return Err(ConfigError::Validation(format!(
                "risk: price impact caution ({}%) must be below unsafe ({}%)",
                t.price_impact_caution_pct, t.price_impact_unsafe_pct
            )));
        }
        if t.slippage_caution_bps >= t.slippage_unsafe_bps {
            return Err(ConfigError::Validation(format!(
                "risk: slippage caution ({} bps) must be below unsafe ({} bps)",
                t.slippage_caution_bps, t.slippage_unsafe_bps
            )));
        }
        if t.quote_stale_secs >= t.quote_expired_secs {
            return Err(ConfigError::Validation(
                "risk: quote_stale_secs must be below quote_expired_secs".to_string(),
            ));
        }
        if t.max_route_hops == 0 {
            return Err(ConfigError::Validation("risk: max_route_hops must be >= 1".to_string()));
        }
        if let Some(mint) = self.denylist.iter().find(|m| self.is_allowlisted(m)) {
            return Err(ConfigError::Validation(format!(
                "risk: mint {} is both allowlisted and denylisted",
                mint
            )));
        }
        Ok(())
    }
}
