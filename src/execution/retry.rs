//! Retry budget bookkeeping and the retry/requote/give-up decision

use super::classifier::{ClassifiedError, ErrorCategory, ErrorCode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Retry budget and backoff shape for one execution
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStrategy {
    /// Retries after the first attempt (transient and requote alike)
    pub max_retries: u32,
    /// Subset of retries that may fetch a fresh quote
    pub max_requotes: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the uniform random delay added to each backoff
    pub jitter: Duration,
}

impl RetryStrategy {
    /// Exponential backoff for retry number `attempt`, without jitter, capped at `max_delay`
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exp = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }
}

/// Counters for one execution; discarded at the terminal state
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempts: u32,
    pub requotes: u32,
    pub errors: Vec<ClassifiedError>,
    pub started_at: Instant,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            requotes: 0,
            errors: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn record(&mut self, error: ClassifiedError) {
        self.errors.push(error);
    }

    pub fn begin_retry(&mut self) {
        self.attempts += 1;
    }

    /// A requote is also a retry
    pub fn begin_requote(&mut self) {
        self.attempts += 1;
        self.requotes += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn error_codes(&self) -> Vec<ErrorCode> {
        self.errors.iter().map(|e| e.code).collect()
    }

    pub fn last_error(&self) -> Option<&ClassifiedError> {
        self.errors.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GiveUpReason {
    Fatal,
    RetriesExhausted,
    RequotesExhausted,
    /// Unclassified failures get one retry per execution
    UnknownRepeated,
}

impl fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GiveUpReason::Fatal => "fatal error",
            GiveUpReason::RetriesExhausted => "retry budget exhausted",
            GiveUpReason::RequotesExhausted => "requote budget exhausted",
            GiveUpReason::UnknownRepeated => "unclassified error repeated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resend the same transaction after `delay`
    Retry { delay: Duration },
    /// Fetch a fresh quote and rebuild after `delay`
    Requote { delay: Duration },
    GiveUp { reason: GiveUpReason },
}

/// Why `error` ends the execution, if it does.
///
/// `state` must not yet contain `error`.
pub fn give_up_reason(error: &ClassifiedError, state: &RetryState, strategy: &RetryStrategy) -> Option<GiveUpReason> {
    if error.category == ErrorCategory::Fatal || !error.retryable {
        return Some(GiveUpReason::Fatal);
    }
    if error.requires_requote && state.requotes >= strategy.max_requotes {
        return Some(GiveUpReason::RequotesExhausted);
    }
    if state.attempts >= strategy.max_retries {
        return Some(GiveUpReason::RetriesExhausted);
    }
    if error.code == ErrorCode::Unknown && state.errors.iter().any(|e| e.code == ErrorCode::Unknown) {
        return Some(GiveUpReason::UnknownRepeated);
    }
    None
}

pub fn should_retry(error: &ClassifiedError, state: &RetryState, strategy: &RetryStrategy) -> bool {
    give_up_reason(error, state, strategy).is_none()
}

/// Delay before the next attempt.
///
/// A suggested delay wins (capped at `max_delay`); otherwise exponential
/// backoff plus jitter, capped at `max_delay`.
pub fn retry_delay_with<R: Rng + ?Sized>(
    error: &ClassifiedError,
    state: &RetryState,
    strategy: &RetryStrategy,
    rng: &mut R,
) -> Duration {
    if let Some(suggested) = error.suggested_delay {
        return suggested.min(strategy.max_delay);
    }

    let base = strategy.base_backoff(state.attempts);
    let jitter_ms = strategy.jitter.as_millis() as u64;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rng.gen_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    (base + jitter).min(strategy.max_delay)
}

pub fn retry_delay(error: &ClassifiedError, state: &RetryState, strategy: &RetryStrategy) -> Duration {
    retry_delay_with(error, state, strategy, &mut rand::thread_rng())
}

/// Full decision for `error`; `state` must not yet contain it
pub fn next_action(error: &ClassifiedError, state: &RetryState, strategy: &RetryStrategy) -> RetryDecision {
    if let Some(reason) = give_up_reason(error, state, strategy) {
        return RetryDecision::GiveUp { reason };
    }
    let delay = retry_delay(error, state, strategy);
    if error.requires_requote {
        RetryDecision::Requote { delay }
    } else {
        RetryDecision::Retry { delay }
    }
}
