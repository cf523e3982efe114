//! Swap execution
//!
//! - **classifier**: failure text to TRANSIENT / REQUOTE / FATAL
//! - **retry**: per-execution counters and the retry/requote/give-up decision
//! - **profile**: AUTO / FAST / CHEAP retry budgets
//! - **events**: timeline events and audit sinks
//! - **orchestrator**: the state machine tying risk, build, submit and retry together

pub mod classifier;
pub mod events;
pub mod orchestrator;
pub mod profile;
pub mod retry;

pub use classifier::{classify, classify_message, ClassifiedError, ErrorCategory, ErrorCode};
pub use events::{
    EventType, ExecutionEvent, ExecutionEventSink, ExecutionState, JsonlEventSink, MemoryEventSink,
    TracingEventSink,
};
pub use orchestrator::{
    BuildParams, ErrorReport, ExecutionError, ExecutionOrchestrator, ExecutionResult, FailureCategory,
    QuoteProvider, SwapReceipt, SwapTransactionBuilder,
};
pub use profile::ExecutionProfile;
pub use retry::{next_action, should_retry, GiveUpReason, RetryDecision, RetryState, RetryStrategy};
