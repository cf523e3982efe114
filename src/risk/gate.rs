use std::sync::Arc;
use tracing::{info, instrument};

use super::policy::{RiskPolicy, RiskThresholds};
use super::token_safety::{MintSource, TokenSafetyChecker, TokenSafetyInfo};
use super::{overall_level, RiskAssessment, RiskCode, RiskLevel, RiskReason};
use crate::metrics::Metrics;
use crate::types::{now_ms, Quote, SwapRequest};

/// AMBER codes that block in protected mode regardless of ceilings
const PROTECTED_BLOCK_CODES: [RiskCode; 3] = [
    RiskCode::TokenUnknown,
    RiskCode::TokenNotWhitelisted,
    RiskCode::Token2022Unsupported,
];

/// Pre-trade risk gate
pub struct RiskGate {
    policy: Arc<RiskPolicy>,
    tokens: TokenSafetyChecker,
    metrics: Option<Arc<Metrics>>,
}

impl RiskGate {
    pub fn new(policy: Arc<RiskPolicy>, source: Arc<dyn MintSource>) -> Self {
        Self {
            tokens: TokenSafetyChecker::new(source, policy.clone()),
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    pub fn tokens(&self) -> &TokenSafetyChecker {
        &self.tokens
    }

    /// Cheap synchronous rejection before any token lookup
    pub fn quick_check(&self, request: &SwapRequest) -> Result<(), RiskReason> {
        let ceiling = self.policy.thresholds.slippage_ceiling_bps;
        if request.slippage_bps > ceiling {
            return Err(RiskReason::new(
                RiskCode::SlippageAboveCeiling,
                RiskLevel::Red,
                format!(
                    "Slippage {} bps is above the absolute ceiling of {} bps",
                    request.slippage_bps, ceiling
                ),
            )
            .with_threshold(request.slippage_bps as f64, ceiling as f64));
        }

        for (side, mint) in [("input", &request.input_mint), ("output", &request.output_mint)] {
            if self.policy.is_denylisted(&mint.to_string()) {
                return Err(blacklisted_reason(side, mint));
            }
        }

        Ok(())
    }

    /// Score a swap at the current wall clock
    pub async fn score_swap(&self, request: &SwapRequest, quote: &Quote) -> RiskAssessment {
        self.score_swap_at(request, quote, now_ms()).await
    }

    #[instrument(skip_all, fields(input = %request.input_mint, output = %request.output_mint))]
    pub async fn score_swap_at(&self, request: &SwapRequest, quote: &Quote, now_ms: i64) -> RiskAssessment {
        let (input, output) = tokio::join!(
            self.tokens.check(&request.input_mint),
            self.tokens.check(&request.output_mint)
        );

        let assessment = assess(&self.policy, request, quote, input, output, now_ms);

        info!(
            level = %assessment.level,
            reasons = assessment.reasons.len(),
            blocked = assessment.blocked_in_protected_mode,
            protected = request.protected_mode,
            "Swap risk assessed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_risk_level(assessment.level.as_str());
        }

        assessment
    }
}

fn blacklisted_reason(side: &str, mint: &impl std::fmt::Display) -> RiskReason {
    RiskReason::new(
        RiskCode::TokenBlacklisted,
        RiskLevel::Red,
        format!("{} token {} is on the denylist", side, mint),
    )
}

/// Pure scoring over already-fetched token facts
pub fn assess(
    policy: &RiskPolicy,
    request: &SwapRequest,
    quote: &Quote,
    input: TokenSafetyInfo,
    output: TokenSafetyInfo,
    now_ms: i64,
) -> RiskAssessment {
    let thresholds = &policy.thresholds;
    let age_secs = quote.age_secs(now_ms);
    let slippage_bps = request.slippage_bps.max(quote.slippage_bps);
    let price_impact = quote.price_impact();

    let mut reasons = trade_risk_reasons(thresholds, quote, slippage_bps, age_secs);
    let trade_level = overall_level(&reasons);

    reasons.extend(token_reasons(policy, &input, "input", request.protected_mode));
    reasons.extend(token_reasons(policy, &output, "output", request.protected_mode));

    if (input.is_unknown() || output.is_unknown()) && trade_level != RiskLevel::Green {
        reasons.push(RiskReason::new(
            RiskCode::UnknownTokenRiskyTrade,
            RiskLevel::Red,
            format!("Unvetted token combined with {} trade risk", trade_level),
        ));
    }

    let level = overall_level(&reasons);
    let blocked_in_protected_mode = match protected_mode_block(level, &reasons, thresholds, slippage_bps, price_impact, age_secs) {
        Some(ceilings) if request.protected_mode => {
            reasons.extend(ceilings);
            true
        }
        _ => false,
    };

    RiskAssessment {
        level,
        reasons,
        input_token: input,
        output_token: output,
        blocked_in_protected_mode,
        requires_acknowledgement: level == RiskLevel::Amber && !request.protected_mode,
        quote_age_secs: age_secs,
        thresholds: thresholds.clone(),
    }
}

/// Price impact, slippage, route length and quote age
pub fn trade_risk_reasons(
    thresholds: &RiskThresholds,
    quote: &Quote,
    slippage_bps: u16,
    age_secs: f64,
) -> Vec<RiskReason> {
    let mut reasons = Vec::new();

    match quote.price_impact() {
        None => reasons.push(RiskReason::new(
            RiskCode::PriceImpactUnknown,
            RiskLevel::Amber,
            format!("Price impact '{}' could not be read", quote.price_impact_pct),
        )),
        Some(impact) if impact > thresholds.price_impact_unsafe_pct / 100.0 => reasons.push(
            RiskReason::new(
                RiskCode::PriceImpactUnsafe,
                RiskLevel::Red,
                format!("Price impact {:.2}% is unsafe", impact * 100.0),
            )
            .with_threshold(impact * 100.0, thresholds.price_impact_unsafe_pct),
        ),
        Some(impact) if impact > thresholds.price_impact_caution_pct / 100.0 => reasons.push(
            RiskReason::new(
                RiskCode::PriceImpactHigh,
                RiskLevel::Amber,
                format!("Price impact {:.2}% is high", impact * 100.0),
            )
            .with_threshold(impact * 100.0, thresholds.price_impact_caution_pct),
        ),
        Some(_) => {}
    }

    if slippage_bps > thresholds.slippage_unsafe_bps {
        reasons.push(
            RiskReason::new(
                RiskCode::SlippageUnsafe,
                RiskLevel::Red,
                format!("Slippage tolerance {} bps is unsafe", slippage_bps),
            )
            .with_threshold(slippage_bps as f64, thresholds.slippage_unsafe_bps as f64),
        );
    } else if slippage_bps > thresholds.slippage_caution_bps {
        reasons.push(
            RiskReason::new(
                RiskCode::SlippageHigh,
                RiskLevel::Amber,
                format!("Slippage tolerance {} bps is high", slippage_bps),
            )
            .with_threshold(slippage_bps as f64, thresholds.slippage_caution_bps as f64),
        );
    }

    let hops = quote.hop_count();
    if hops > thresholds.max_route_hops {
        reasons.push(
            RiskReason::new(
                RiskCode::RouteTooComplex,
                RiskLevel::Amber,
                format!("Route has {} hops ({})", hops, quote.route_labels().join(" -> ")),
            )
            .with_threshold(hops as f64, thresholds.max_route_hops as f64),
        );
    }

    if age_secs > thresholds.quote_expired_secs {
        reasons.push(
            RiskReason::new(
                RiskCode::QuoteExpired,
                RiskLevel::Red,
                format!("Quote is {:.0}s old and has expired", age_secs),
            )
            .with_threshold(age_secs, thresholds.quote_expired_secs),
        );
    } else if age_secs > thresholds.quote_stale_secs {
        reasons.push(
            RiskReason::new(
                RiskCode::QuoteStale,
                RiskLevel::Amber,
                format!("Quote is {:.0}s old", age_secs),
            )
            .with_threshold(age_secs, thresholds.quote_stale_secs),
        );
    }

    reasons
}

/// Token-safety reasons for one side of the swap
pub fn token_reasons(
    policy: &RiskPolicy,
    info: &TokenSafetyInfo,
    side: &str,
    protected_mode: bool,
) -> Vec<RiskReason> {
    if info.is_blacklisted {
        return vec![blacklisted_reason(side, &info.mint)];
    }

    let label = info.symbol.as_deref().unwrap_or(&info.mint);
    let mut reasons = Vec::new();

    if !info.is_whitelisted {
        reasons.push(RiskReason::new(
            RiskCode::TokenNotWhitelisted,
            RiskLevel::Amber,
            format!("{} token {} is not on the allowlist", side, label),
        ));
    }

    if info.lookup_failed {
        reasons.push(RiskReason::new(
            RiskCode::TokenUnknown,
            RiskLevel::Amber,
            format!("{} token {} could not be inspected", side, label),
        ));
        return reasons;
    }

    let exempt = policy.is_authority_exempt(&info.mint);
    if info.has_freeze_authority && !exempt {
        reasons.push(RiskReason::new(
            RiskCode::TokenHasFreezeAuthority,
            RiskLevel::Red,
            format!("{} token {} has a freeze authority", side, label),
        ));
    }
    if info.has_mint_authority && !exempt {
        reasons.push(RiskReason::new(
            RiskCode::TokenHasMintAuthority,
            RiskLevel::Amber,
            format!("{} token {} has a mint authority", side, label),
        ));
    }

    if info.is_token_2022 {
        if info.has_transfer_fee {
            reasons.push(RiskReason::new(
                RiskCode::Token2022TransferFee,
                RiskLevel::Red,
                format!("{} token {} charges a transfer fee", side, label),
            ));
        } else {
            let severity = if protected_mode {
                RiskLevel::Red
            } else {
                RiskLevel::Amber
            };
            reasons.push(RiskReason::new(
                RiskCode::Token2022Unsupported,
                severity,
                format!("{} token {} is a Token-2022 mint", side, label),
            ));
        }
    }

    if let Some(symbol) = &info.symbol {
        if let Some(canonical) = policy.canonical_mint(symbol) {
            if canonical != info.mint {
                reasons.push(RiskReason::new(
                    RiskCode::TokenSymbolSpoof,
                    RiskLevel::Red,
                    format!(
                        "{} token uses symbol {} which belongs to {}",
                        side, symbol, canonical
                    ),
                ));
            }
        }
    }

    reasons
}

/// Protected-mode rule: RED always blocks, AMBER blocks on a protected ceiling or code.
///
/// Returns `None` when the swap may proceed, otherwise the reasons for the
/// ceilings it broke. Those are AMBER so the overall level is unchanged; a
/// stale quote or an unreadable impact is already named by its own reason.
fn protected_mode_block(
    level: RiskLevel,
    reasons: &[RiskReason],
    thresholds: &RiskThresholds,
    slippage_bps: u16,
    price_impact: Option<f64>,
    age_secs: f64,
) -> Option<Vec<RiskReason>> {
    match level {
        RiskLevel::Green => None,
        RiskLevel::Red => Some(Vec::new()),
        RiskLevel::Amber => {
            let mut ceilings = Vec::new();
            if slippage_bps > thresholds.protected_max_slippage_bps {
                ceilings.push(
                    RiskReason::new(
                        RiskCode::ProtectedSlippageExceeded,
                        RiskLevel::Amber,
                        format!(
                            "Slippage {} bps is above the protected-mode limit of {} bps",
                            slippage_bps, thresholds.protected_max_slippage_bps
                        ),
                    )
                    .with_threshold(slippage_bps as f64, thresholds.protected_max_slippage_bps as f64),
                );
            }
            if let Some(impact) = price_impact {
                if impact > thresholds.protected_max_price_impact_pct / 100.0 {
                    ceilings.push(
                        RiskReason::new(
                            RiskCode::ProtectedPriceImpactExceeded,
                            RiskLevel::Amber,
                            format!(
                                "Price impact {:.2}% is above the protected-mode limit of {}%",
                                impact * 100.0,
                                thresholds.protected_max_price_impact_pct
                            ),
                        )
                        .with_threshold(impact * 100.0, thresholds.protected_max_price_impact_pct),
                    );
                }
            }

            let blocked = !ceilings.is_empty()
                // an unreadable impact cannot be shown to be under the ceiling
                || price_impact.is_none()
                || age_secs > thresholds.quote_stale_secs
                || reasons.iter().any(|r| PROTECTED_BLOCK_CODES.contains(&r.code));
            blocked.then_some(ceilings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::policy::{USDC_MINT, WSOL_MINT};
    use crate::types::{RoutePlanStep, SubmissionMode, SwapInfo};
    use proptest::prelude::*;
    use solana_sdk::pubkey::Pubkey;
    use std::str::FromStr;

    fn request(slippage_bps: u16, protected_mode: bool) -> SwapRequest {
        SwapRequest {
            id: None,
            user: Pubkey::new_unique(),
            input_mint: Pubkey::from_str(WSOL_MINT).unwrap(),
            output_mint: Pubkey::from_str(USDC_MINT).unwrap(),
            amount: 1_000_000_000,
            slippage_bps,
            protected_mode,
            mode: SubmissionMode::Direct,
            priority_fee_micro_lamports: None,
            tip_lamports: None,
        }
    }

    fn quote(impact: &str, slippage_bps: u16, hops: usize) -> Quote {
        Quote {
            input_mint: WSOL_MINT.to_string(),
            output_mint: USDC_MINT.to_string(),
            in_amount: "1000000000".to_string(),
            out_amount: "150000000".to_string(),
            other_amount_threshold: "149250000".to_string(),
            slippage_bps,
            price_impact_pct: impact.to_string(),
            route_plan: (0..hops)
                .map(|i| RoutePlanStep {
                    swap_info: SwapInfo {
                        label: Some(format!("amm-{}", i)),
                        ..Default::default()
                    },
                    percent: Some(100),
                    ..Default::default()
                })
                .collect(),
            timestamp_ms: Some(1_000_000),
            ..Default::default()
        }
    }

    fn safe_token(mint: &str) -> TokenSafetyInfo {
        TokenSafetyInfo {
            mint: mint.to_string(),
            decimals: 6,
            is_known_token: true,
            is_whitelisted: true,
            ..Default::default()
        }
    }

    fn unknown_token() -> TokenSafetyInfo {
        TokenSafetyInfo {
            mint: Pubkey::new_unique().to_string(),
            decimals: 6,
            ..Default::default()
        }
    }

    const NOW: i64 = 1_000_000;

    #[test]
    fn test_clean_swap_is_green() {
        let policy = RiskPolicy::default();
        let a = assess(
            &policy,
            &request(50, false),
            &quote("0.02", 50, 1),
            safe_token(WSOL_MINT),
            safe_token(USDC_MINT),
            NOW,
        );
        assert_eq!(a.level, RiskLevel::Green);
        assert!(a.reasons.is_empty());
        assert!(!a.requires_acknowledgement);
    }

    #[test]
    fn test_trade_risk_thresholds() {
        let t = RiskThresholds::default();
        let codes = |q: &Quote, slip: u16, age: f64| -> Vec<RiskCode> {
            trade_risk_reasons(&t, q, slip, age).into_iter().map(|r| r.code).collect()
        };

        assert_eq!(codes(&quote("0.025", 50, 1), 50, 0.0), vec![RiskCode::PriceImpactHigh]);
        assert_eq!(codes(&quote("0.035", 50, 1), 50, 0.0), vec![RiskCode::PriceImpactUnsafe]);
        assert_eq!(codes(&quote("-0.035", 50, 1), 50, 0.0), vec![RiskCode::PriceImpactUnsafe]);
        assert_eq!(codes(&quote("garbage", 50, 1), 50, 0.0), vec![RiskCode::PriceImpactUnknown]);
        assert_eq!(codes(&quote("0", 50, 1), 150, 0.0), vec![RiskCode::SlippageHigh]);
        assert_eq!(codes(&quote("0", 50, 1), 301, 0.0), vec![RiskCode::SlippageUnsafe]);
        assert_eq!(codes(&quote("0", 50, 4), 50, 0.0), vec![RiskCode::RouteTooComplex]);
        assert_eq!(codes(&quote("0", 50, 1), 50, 31.0), vec![RiskCode::QuoteStale]);
        assert_eq!(codes(&quote("0", 50, 1), 50, 61.0), vec![RiskCode::QuoteExpired]);
        // Limits are exclusive
        assert!(codes(&quote("0", 50, 3), 100, 30.0).is_empty());
    }

    #[test]
    fn test_authority_exempt_stablecoin() {
        let policy = RiskPolicy::default();
        let mut usdc = safe_token(USDC_MINT);
        usdc.has_freeze_authority = true;
        usdc.has_mint_authority = true;
        assert!(token_reasons(&policy, &usdc, "output", false).is_empty());

        let mut other = safe_token(&Pubkey::new_unique().to_string());
        other.has_freeze_authority = true;
        let reasons = token_reasons(&policy, &other, "input", false);
        assert_eq!(reasons[0].code, RiskCode::TokenHasFreezeAuthority);
        assert_eq!(reasons[0].severity, RiskLevel::Red);
    }

    #[test]
    fn test_token_2022_escalates_in_protected_mode() {
        let policy = RiskPolicy::default();
        let mut info = safe_token(&Pubkey::new_unique().to_string());
        info.is_token_2022 = true;

        let relaxed = token_reasons(&policy, &info, "input", false);
        assert_eq!(relaxed[0].code, RiskCode::Token2022Unsupported);
        assert_eq!(relaxed[0].severity, RiskLevel::Amber);

        let strict = token_reasons(&policy, &info, "input", true);
        assert_eq!(strict[0].severity, RiskLevel::Red);

        info.has_transfer_fee = true;
        let fee = token_reasons(&policy, &info, "input", false);
        assert_eq!(fee[0].code, RiskCode::Token2022TransferFee);
        assert_eq!(fee[0].severity, RiskLevel::Red);
    }

    #[test]
    fn test_symbol_spoof() {
        let policy = RiskPolicy::default();
        let mut fake = safe_token(&Pubkey::new_unique().to_string());
        fake.symbol = Some("usdc".to_string());
        let reasons = token_reasons(&policy, &fake, "output", false);
        assert!(reasons.iter().any(|r| r.code == RiskCode::TokenSymbolSpoof));

        let mut real = safe_token(USDC_MINT);
        real.symbol = Some("USDC".to_string());
        assert!(token_reasons(&policy, &real, "output", false).is_empty());
    }

    #[test]
    fn test_unknown_token_with_risky_trade() {
        let policy = RiskPolicy::default();

        // Unknown token alone: AMBER
        let a = assess(
            &policy,
            &request(50, false),
            &quote("0.001", 50, 1),
            safe_token(WSOL_MINT),
            unknown_token(),
            NOW,
        );
        assert_eq!(a.level, RiskLevel::Amber);
        assert!(a.requires_acknowledgement);
        assert!(!a.has_code(RiskCode::UnknownTokenRiskyTrade));

        // Unknown token plus AMBER trade risk: RED
        let a = assess(
            &policy,
            &request(150, false),
            &quote("0.001", 50, 1),
            safe_token(WSOL_MINT),
            unknown_token(),
            NOW,
        );
        assert_eq!(a.level, RiskLevel::Red);
        assert!(a.has_code(RiskCode::UnknownTokenRiskyTrade));
    }

    #[test]
    fn test_protected_amber_ceilings() {
        let policy = RiskPolicy::default();

        // Mint authority: AMBER, within all ceilings, code not in the block-list
        let mut minty = safe_token(&Pubkey::new_unique().to_string());
        minty.has_mint_authority = true;
        let a = assess(
            &policy,
            &request(50, true),
            &quote("0.005", 50, 1),
            safe_token(WSOL_MINT),
            minty.clone(),
            NOW,
        );
        assert_eq!(a.level, RiskLevel::Amber);
        assert!(!a.blocked_in_protected_mode);
        assert!(!a.requires_acknowledgement);

        // Same AMBER but price impact above the protected maximum
        let a = assess(
            &policy,
            &request(50, true),
            &quote("0.015", 50, 1),
            safe_token(WSOL_MINT),
            minty.clone(),
            NOW,
        );
        assert!(a.blocked_in_protected_mode);
        assert_eq!(a.level, RiskLevel::Amber);
        let ceiling = a
            .reasons
            .iter()
            .find(|r| r.code == RiskCode::ProtectedPriceImpactExceeded)
            .unwrap();
        assert_eq!(ceiling.threshold.unwrap().limit, 1.0);
        assert!(a.top_reasons().any(|r| r.code == RiskCode::ProtectedPriceImpactExceeded));

        // The ceiling is only reported when protection is on
        let a = assess(
            &policy,
            &request(50, false),
            &quote("0.015", 50, 1),
            safe_token(WSOL_MINT),
            minty,
            NOW,
        );
        assert!(!a.has_code(RiskCode::ProtectedPriceImpactExceeded));

        // Not-allowlisted is always blocked under protection
        let a = assess(
            &policy,
            &request(50, true),
            &quote("0.001", 50, 1),
            safe_token(WSOL_MINT),
            unknown_token(),
            NOW,
        );
        assert_eq!(a.level, RiskLevel::Amber);
        assert!(a.blocked_in_protected_mode);
    }

    #[test]
    fn test_quick_check() {
        let mint = Pubkey::new_unique();
        let policy = RiskPolicy::default().with_denylisted(mint.to_string());
        let gate = RiskGate::new(
            Arc::new(policy),
            Arc::new(crate::risk::token_safety::StaticMintSource::new()),
        );

        assert!(gate.quick_check(&request(50, false)).is_ok());

        let err = gate.quick_check(&request(1_500, false)).unwrap_err();
        assert_eq!(err.code, RiskCode::SlippageAboveCeiling);

        let mut bad = request(50, false);
        bad.output_mint = mint;
        assert_eq!(gate.quick_check(&bad).unwrap_err().code, RiskCode::TokenBlacklisted);
    }

    fn arb_token() -> impl Strategy<Value = TokenSafetyInfo> {
        (
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(freeze, mint_auth, t22, fee, black, white, failed)| TokenSafetyInfo {
                mint: Pubkey::new_unique().to_string(),
                has_freeze_authority: freeze,
                has_mint_authority: mint_auth,
                is_token_2022: t22,
                has_transfer_fee: fee,
                is_blacklisted: black,
                is_whitelisted: white,
                lookup_failed: failed,
                ..Default::default()
            })
    }

    proptest! {
        #[test]
        fn prop_level_is_max_severity(
            impact in 0u32..600,
            slippage in 0u16..1000,
            hops in 0usize..6,
            age_ms in 0i64..120_000,
            protected in any::<bool>(),
            input in arb_token(),
            output in arb_token(),
        ) {
            let policy = RiskPolicy::default();
            let mut q = quote(&format!("{}", impact as f64 / 10_000.0), 0, hops);
            q.timestamp_ms = Some(NOW - age_ms);
            let req = request(slippage, protected);

            let a = assess(&policy, &req, &q, input.clone(), output.clone(), NOW);

            prop_assert_eq!(a.level, overall_level(&a.reasons));
            if protected && a.level == RiskLevel::Red {
                prop_assert!(a.blocked_in_protected_mode);
            }
            if !protected {
                prop_assert!(!a.blocked_in_protected_mode);
            }
            if input.is_blacklisted || output.is_blacklisted {
                prop_assert_eq!(a.level, RiskLevel::Red);
            }
            prop_assert_eq!(a.requires_acknowledgement, a.level == RiskLevel::Amber && !protected);
        }
    }
}
