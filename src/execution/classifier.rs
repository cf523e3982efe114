//! Failure classification.
//!
//! Raw failures reach the orchestrator as text (RPC error strings, relay
//! responses, aggregator errors). They are matched against an ordered
//! pattern table: transient patterns first, then requote, then fatal.
//! The first match wins.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::error;

/// What the orchestrator must do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorCategory {
    /// Network or infrastructure hiccup, resend the same transaction
    Transient,
    /// Market moved or quote went stale, rebuild from a fresh quote
    Requote,
    /// User, account or program error, never retried
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "TRANSIENT",
            ErrorCategory::Requote => "REQUOTE",
            ErrorCategory::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Transient
    BlockhashNotFound,
    BlockhashExpired,
    NodeBehind,
    ConnectionReset,
    Timeout,
    RateLimited,
    ServerError,
    TransactionDropped,

    // Requote
    SlippageExceeded,
    PriceMoved,
    QuoteStale,
    InsufficientOutput,
    InsufficientLiquidity,

    // Fatal
    InsufficientFunds,
    InvalidAccount,
    SignatureFailure,
    AlreadyProcessed,
    Unauthorized,
    Blacklisted,
    /// Quote does not price the requested swap
    QuoteMismatch,
    /// Local signing key missing or not the request's user
    SignerUnavailable,

    /// Matched nothing in the table
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BlockhashNotFound => "BLOCKHASH_NOT_FOUND",
            ErrorCode::BlockhashExpired => "BLOCKHASH_EXPIRED",
            ErrorCode::NodeBehind => "NODE_BEHIND",
            ErrorCode::ConnectionReset => "CONNECTION_RESET",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::TransactionDropped => "TRANSACTION_DROPPED",
            ErrorCode::SlippageExceeded => "SLIPPAGE_EXCEEDED",
            ErrorCode::PriceMoved => "PRICE_MOVED",
            ErrorCode::QuoteStale => "QUOTE_STALE",
            ErrorCode::InsufficientOutput => "INSUFFICIENT_OUTPUT",
            ErrorCode::InsufficientLiquidity => "INSUFFICIENT_LIQUIDITY",
            ErrorCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorCode::InvalidAccount => "INVALID_ACCOUNT",
            ErrorCode::SignatureFailure => "SIGNATURE_FAILURE",
            ErrorCode::AlreadyProcessed => "ALREADY_PROCESSED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Blacklisted => "BLACKLISTED",
            ErrorCode::QuoteMismatch => "QUOTE_MISMATCH",
            ErrorCode::SignerUnavailable => "SIGNER_UNAVAILABLE",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure after classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub code: ErrorCode,
    pub retryable: bool,
    pub requires_requote: bool,
    /// Delay the pattern asks for; `None` means use the strategy's backoff
    #[serde(with = "option_duration_ms", default)]
    pub suggested_delay: Option<Duration>,
    /// Message of the original failure
    pub message: String,
}

impl ClassifiedError {
    pub fn new(
        category: ErrorCategory,
        code: ErrorCode,
        suggested_delay: Option<Duration>,
        requires_requote: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code,
            retryable: category != ErrorCategory::Fatal,
            requires_requote: category == ErrorCategory::Requote || requires_requote,
            suggested_delay,
            message: message.into(),
        }
    }

    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Fatal, code, None, false, message)
    }

    pub fn is_fatal(&self) -> bool {
        self.category == ErrorCategory::Fatal
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.category, self.code, self.message)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Delay used for failures that match no pattern
pub const UNKNOWN_ERROR_DELAY: Duration = Duration::from_millis(1_000);

/// (pattern, code, category, suggested delay ms, requires requote), in priority order.
///
/// Requote and fatal rows carry no delay; the strategy's backoff applies.
const PATTERN_TABLE: &[(&str, ErrorCode, ErrorCategory, Option<u64>, bool)] = &[
    (
        r"blockhash not found",
        ErrorCode::BlockhashNotFound,
        ErrorCategory::Transient,
        Some(500),
        false,
    ),
    (
        r"block height exceeded|blockhash (has )?expired|transaction expired",
        ErrorCode::BlockhashExpired,
        ErrorCategory::Transient,
        Some(0),
        true,
    ),
    (
        r"node is behind|node is unhealthy|behind by \d+ slots",
        ErrorCode::NodeBehind,
        ErrorCategory::Transient,
        Some(2_000),
        false,
    ),
    (
        r"connection (reset|refused|closed)|econnreset|broken pipe|error sending request",
        ErrorCode::ConnectionReset,
        ErrorCategory::Transient,
        Some(1_000),
        false,
    ),
    (
        r"timed out|timeout|deadline exceeded",
        ErrorCode::Timeout,
        ErrorCategory::Transient,
        Some(1_000),
        false,
    ),
    (
        r"rate limit|too many requests|\b429\b",
        ErrorCode::RateLimited,
        ErrorCategory::Transient,
        Some(5_000),
        false,
    ),
    (
        r"(http|status)\D{0,20}5\d\d\b|internal server error|bad gateway|service unavailable",
        ErrorCode::ServerError,
        ErrorCategory::Transient,
        Some(2_000),
        false,
    ),
    (
        r"transaction (was )?dropped|was not confirmed",
        ErrorCode::TransactionDropped,
        ErrorCategory::Transient,
        Some(500),
        false,
    ),
    (
        // 0x1771 is the aggregator program's SlippageToleranceExceeded
        r"slippage tolerance exceeded|slippage exceeded|exceeds desired slippage|0x1771\b",
        ErrorCode::SlippageExceeded,
        ErrorCategory::Requote,
        None,
        true,
    ),
    (
        r"price (has )?(moved|changed)|price impact too high",
        ErrorCode::PriceMoved,
        ErrorCategory::Requote,
        None,
        true,
    ),
    (
        r"(quote|route) (is )?(stale|expired)|stale quote",
        ErrorCode::QuoteStale,
        ErrorCategory::Requote,
        None,
        true,
    ),
    (
        r"insufficient output|minimum (output|amount) not met|less than minimum",
        ErrorCode::InsufficientOutput,
        ErrorCategory::Requote,
        None,
        true,
    ),
    (
        r"insufficient liquidity|not enough liquidity|no route found|could not find any route",
        ErrorCode::InsufficientLiquidity,
        ErrorCategory::Requote,
        None,
        true,
    ),
    (
        r"insufficient (funds|balance|lamports)|custom program error: 0x1\b|no record of a prior credit",
        ErrorCode::InsufficientFunds,
        ErrorCategory::Fatal,
        None,
        false,
    ),
    (
        r"invalid (account|mint)|account not found|could not find account",
        ErrorCode::InvalidAccount,
        ErrorCategory::Fatal,
        None,
        false,
    ),
    (
        r"signature verification fail|missing signature|invalid signature",
        ErrorCode::SignatureFailure,
        ErrorCategory::Fatal,
        None,
        false,
    ),
    (
        r"already (been )?processed",
        ErrorCode::AlreadyProcessed,
        ErrorCategory::Fatal,
        None,
        false,
    ),
    (
        r"unauthorized|forbidden|\b401\b|\b403\b",
        ErrorCode::Unauthorized,
        ErrorCategory::Fatal,
        None,
        false,
    ),
    (
        r"blacklist|denylist",
        ErrorCode::Blacklisted,
        ErrorCategory::Fatal,
        None,
        false,
    ),
    (
        r"quote mismatch",
        ErrorCode::QuoteMismatch,
        ErrorCategory::Fatal,
        None,
        false,
    ),
    (
        r"no signer configured|signer \w+ does not match request user",
        ErrorCode::SignerUnavailable,
        ErrorCategory::Fatal,
        None,
        false,
    ),
];

struct ErrorPattern {
    regex: Regex,
    code: ErrorCode,
    category: ErrorCategory,
    delay: Option<Duration>,
    requires_requote: bool,
}

static PATTERNS: Lazy<Vec<ErrorPattern>> = Lazy::new(|| {
    PATTERN_TABLE
        .iter()
        .filter_map(|&(source, code, category, delay_ms, requires_requote)| {
            match RegexBuilder::new(source).case_insensitive(true).build() {
                Ok(regex) => Some(ErrorPattern {
                    regex,
                    code,
                    category,
                    delay: delay_ms.map(Duration::from_millis),
                    requires_requote,
                }),
                Err(e) => {
                    error!(pattern = source, error = %e, "Invalid error pattern skipped");
                    None
                }
            }
        })
        .collect()
});

/// Classify any displayable failure
pub fn classify<E: fmt::Display + ?Sized>(error: &E) -> ClassifiedError {
    classify_message(&error.to_string())
}

pub fn classify_message(message: &str) -> ClassifiedError {
    for pattern in PATTERNS.iter() {
        if pattern.regex.is_match(message) {
            return ClassifiedError::new(
                pattern.category,
                pattern.code,
                pattern.delay,
                pattern.requires_requote,
                message,
            );
        }
    }

    ClassifiedError::new(
        ErrorCategory::Transient,
        ErrorCode::Unknown,
        Some(UNKNOWN_ERROR_DELAY),
        false,
        message,
    )
}
