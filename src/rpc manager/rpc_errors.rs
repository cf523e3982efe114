use once_cell::sync::Lazy;
use regex::Regex;
use solana_client::client_error::ClientError;
use thiserror::Error;

/// HTTP 429 as a standalone number, not a digit run inside a slot or signature
static HTTP_429: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\b429\b").ok());

/// RPC transport error types.
///
/// Display strings keep the upstream wording ("blockhash not found",
/// "insufficient funds", ...) so the execution classifier can read them.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcManagerError {
    /// Transport-level errors (network, connection)
    #[error("Transport error: {message} (endpoint: {endpoint})")]
    Transport { endpoint: String, message: String },

    /// Timeout errors
    #[error("Timeout after {timeout_ms}ms (endpoint: {endpoint})")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// RPC response errors (from the RPC server)
    #[error("RPC response error: {message} (endpoint: {endpoint}, code: {code:?})")]
    RpcResponse {
        endpoint: String,
        message: String,
        code: Option<i64>,
    },

    /// Rate limit exceeded
    #[error("Rate limit exceeded (endpoint: {endpoint})")]
    RateLimitExceeded { endpoint: String },

    /// No healthy endpoints available
    #[error("No healthy endpoints available (total: {total}, unhealthy: {unhealthy})")]
    NoHealthyEndpoints { total: usize, unhealthy: usize },

    #[error("Blockhash not found (endpoint: {endpoint})")]
    BlockhashNotFound { endpoint: String },

    #[error("Transaction expired: block height exceeded (endpoint: {endpoint})")]
    TransactionExpired { endpoint: String },

    #[error("Account not found: {account} (endpoint: {endpoint})")]
    AccountNotFound { account: String, endpoint: String },

    #[error("Insufficient funds (endpoint: {endpoint})")]
    InsufficientFunds { endpoint: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Caller cancelled while waiting to retry
    #[error("RPC call cancelled")]
    Cancelled,
}

impl RpcManagerError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcManagerError::Transport { .. } => true,
            RpcManagerError::Timeout { .. } => true,
            RpcManagerError::RateLimitExceeded { .. } => true,
            RpcManagerError::NoHealthyEndpoints { .. } => true,
            RpcManagerError::BlockhashNotFound { .. } => true,

            RpcManagerError::Configuration(_) => false,
            RpcManagerError::TransactionExpired { .. } => false,
            RpcManagerError::AccountNotFound { .. } => false,
            RpcManagerError::InsufficientFunds { .. } => false,
            RpcManagerError::Internal(_) => false,
            RpcManagerError::Cancelled => false,

            // Retry on server errors (5xx)
            RpcManagerError::RpcResponse { code, .. } => {
                matches!(code, Some(c) if (500..600).contains(c))
            }
        }
    }

    /// Whether the failure says something about the endpoint itself.
    ///
    /// Only endpoint faults count against endpoint health and trigger failover;
    /// application errors would fail the same way on every node.
    pub fn is_endpoint_fault(&self) -> bool {
        match self {
            RpcManagerError::Transport { .. } => true,
            RpcManagerError::Timeout { .. } => true,
            RpcManagerError::RateLimitExceeded { .. } => true,
            // A lagging node does not know the blockhash yet
            RpcManagerError::BlockhashNotFound { .. } => true,
            RpcManagerError::RpcResponse { code, .. } => {
                matches!(code, Some(c) if (500..600).contains(c))
            }
            _ => false,
        }
    }

    /// Get the endpoint associated with this error, if any
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            RpcManagerError::Transport { endpoint, .. } => Some(endpoint),
            RpcManagerError::Timeout { endpoint, .. } => Some(endpoint),
            RpcManagerError::RpcResponse { endpoint, .. } => Some(endpoint),
            RpcManagerError::RateLimitExceeded { endpoint } => Some(endpoint),
            RpcManagerError::BlockhashNotFound { endpoint } => Some(endpoint),
            RpcManagerError::TransactionExpired { endpoint } => Some(endpoint),
            RpcManagerError::AccountNotFound { endpoint, .. } => Some(endpoint),
            RpcManagerError::InsufficientFunds { endpoint } => Some(endpoint),
            _ => None,
        }
    }

    /// Create from ClientError with context
    pub fn from_client_error(err: ClientError, endpoint: &str) -> Self {
        Self::from_message(&err.to_string(), endpoint)
    }

    /// Classify a raw RPC error message
    pub fn from_message(message: &str, endpoint: &str) -> Self {
        let err_str = message.to_lowercase();
        let endpoint = endpoint.to_string();

        if err_str.contains("blockhash not found") {
            RpcManagerError::BlockhashNotFound { endpoint }
        } else if err_str.contains("transaction expired") || err_str.contains("block height exceeded") {
            RpcManagerError::TransactionExpired { endpoint }
        } else if err_str.contains("account not found") {
            RpcManagerError::AccountNotFound {
                account: "unknown".to_string(),
                endpoint,
            }
        } else if err_str.contains("insufficient funds") || err_str.contains("insufficient lamports") {
            RpcManagerError::InsufficientFunds { endpoint }
        } else if err_str.contains("rate limit")
            || err_str.contains("too many requests")
            || HTTP_429.as_ref().is_some_and(|re| re.is_match(&err_str))
        {
            RpcManagerError::RateLimitExceeded { endpoint }
        } else if err_str.contains("timeout") || err_str.contains("timed out") {
            RpcManagerError::Timeout {
                endpoint,
                timeout_ms: 0,
            }
        } else if err_str.contains("error sending request")
            || err_str.contains("connection")
            || err_str.contains("node is behind")
            || err_str.contains("node is unhealthy")
        {
            RpcManagerError::Transport {
                endpoint,
                message: message.to_string(),
            }
        } else {
            // Extract error code if available
            let code = err_str
                .split("code:")
                .nth(1)
                .and_then(|s| s.split_whitespace().next())
                .and_then(|s| s.trim_matches(|c: char| !c.is_ascii_digit() && c != '-').parse::<i64>().ok())
                .or_else(|| http_status(&err_str));

            RpcManagerError::RpcResponse {
                endpoint,
                message: message.to_string(),
                code,
            }
        }
    }
}

/// Pull an HTTP 5xx status out of messages like "HTTP status server error (503 Service Unavailable)"
fn http_status(err_str: &str) -> Option<i64> {
    if !err_str.contains("status") {
        return None;
    }
    err_str
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| s.len() == 3)
        .filter_map(|s| s.parse::<i64>().ok())
        .find(|c| (500..600).contains(c))
}
