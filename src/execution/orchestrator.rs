//! Execution state machine.
//!
//! `QUOTE_READY -> RISK_GATE -> BUILD -> SUBMIT -> SUCCESS`, with failures
//! going through `CLASSIFY` to a resubmit, a requote-and-rebuild, or a
//! terminal `FAILED`. Risk-blocked or cancelled runs end in `ABORTED`.
//! Attempts for one swap are strictly sequential and two runs for the same
//! swap key never overlap.

use super::classifier::{classify, classify_message, ClassifiedError, ErrorCategory, ErrorCode};
use super::events::{EventType, ExecutionEvent, ExecutionEventSink, ExecutionState, TracingEventSink};
use super::profile::ExecutionProfile;
use super::retry::{next_action, GiveUpReason, RetryDecision, RetryState, RetryStrategy};
use crate::config::ExecutionConfig;
use crate::metrics::Metrics;
use crate::observability::CorrelationId;
use crate::risk::{calculate_actual_slippage_bps, RiskAssessment, RiskGate, RiskReason};
use crate::scheduler::sleep_cancellable;
use crate::submission::{MevSubmitResult, SubmissionRouter, SubmitOptions};
use crate::types::{Quote, SubmissionMode, SwapRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use solana_sdk::transaction::VersionedTransaction;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Source of fresh quotes for requotes
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn get_quote(&self, request: &SwapRequest) -> anyhow::Result<Quote>;
}

/// Fee settings handed to the transaction builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildParams {
    pub mode: SubmissionMode,
    pub priority_fee_micro_lamports: Option<u64>,
    /// Already clamped
    pub tip_lamports: Option<u64>,
}

/// Turns a quote into a signed transaction
#[async_trait]
pub trait SwapTransactionBuilder: Send + Sync {
    async fn build(
        &self,
        request: &SwapRequest,
        quote: &Quote,
        params: &BuildParams,
    ) -> anyhow::Result<VersionedTransaction>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Swap {swap_key} is already executing (execution {execution_id})")]
    AlreadyInFlight { swap_key: String, execution_id: String },
}

/// Category reported for a run that did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    RiskBlocked,
    Transient,
    Requote,
    Fatal,
    Cancelled,
}

impl From<ErrorCategory> for FailureCategory {
    fn from(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::Transient => FailureCategory::Transient,
            ErrorCategory::Requote => FailureCategory::Requote,
            ErrorCategory::Fatal => FailureCategory::Fatal,
        }
    }
}

/// Aggregated history of a failed or aborted run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub category: FailureCategory,
    pub message: String,
    /// Every error code seen, in order
    pub codes: Vec<String>,
    pub attempts: u32,
    pub requotes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub give_up_reason: Option<GiveUpReason>,
    /// Risk reasons that caused the block
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<RiskReason>,
}

/// Record of a completed swap
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapReceipt {
    pub execution_id: CorrelationId,
    pub user: String,
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u64,
    pub quoted_out_amount: u64,
    pub min_out_amount: u64,
    pub slippage_bps: u16,
    /// Minimum acceptable output against quoted output, signed bps
    pub quoted_vs_min_bps: i64,
    pub protected: bool,
    pub mode: SubmissionMode,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl SwapReceipt {
    fn new(execution_id: &CorrelationId, request: &SwapRequest, quote: &Quote, submission: &MevSubmitResult) -> Self {
        let quoted_out = quote.out_amount_u64().unwrap_or(0);
        let min_out = quote.min_out_amount_u64().unwrap_or(quoted_out);
        Self {
            execution_id: execution_id.clone(),
            user: request.user.to_string(),
            input_mint: request.input_mint.to_string(),
            output_mint: request.output_mint.to_string(),
            in_amount: request.amount,
            quoted_out_amount: quoted_out,
            min_out_amount: min_out,
            slippage_bps: quote.slippage_bps,
            quoted_vs_min_bps: calculate_actual_slippage_bps(quoted_out, min_out),
            protected: submission.protected,
            mode: submission.mode,
            signature: submission.signature.clone(),
            slot: submission.slot,
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of `execute`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: CorrelationId,
    pub swap_key: String,
    pub profile: ExecutionProfile,
    /// SUCCESS, FAILED or ABORTED
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission: Option<MevSubmitResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<SwapReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskAssessment>,
    pub attempts: u32,
    pub requotes: u32,
    pub elapsed_ms: u64,
    pub events: Vec<ExecutionEvent>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.state == ExecutionState::Success
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.events.iter().map(|e| e.event_type).collect()
    }
}

/// Removes the swap key from the in-flight map when the run ends
struct InFlightGuard<'a> {
    map: &'a DashMap<String, CorrelationId>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Per-run bookkeeping: identity, timeline, retry counters
struct Run<'a> {
    id: CorrelationId,
    swap_key: String,
    profile: ExecutionProfile,
    strategy: RetryStrategy,
    retry: RetryState,
    events: Vec<ExecutionEvent>,
    sink: &'a dyn ExecutionEventSink,
    risk: Option<RiskAssessment>,
}

impl Run<'_> {
    fn event(&self, event_type: EventType, state: ExecutionState) -> ExecutionEvent {
        ExecutionEvent::new(self.id.clone(), self.swap_key.clone(), event_type, state, self.retry.attempts)
    }

    async fn emit(&mut self, event: ExecutionEvent) {
        debug!(
            execution_id = %event.execution_id,
            event = ?event.event_type,
            state = %event.state,
            attempt = event.attempt,
            "Execution transition"
        );
        if let Err(e) = self.sink.record(&event).await {
            warn!(execution_id = %self.id, error = %e, "Failed to persist execution event");
        }
        self.events.push(event);
    }

    fn finish(
        self,
        state: ExecutionState,
        submission: Option<MevSubmitResult>,
        receipt: Option<SwapReceipt>,
        error: Option<ErrorReport>,
    ) -> ExecutionResult {
        ExecutionResult {
            execution_id: self.id,
            swap_key: self.swap_key,
            profile: self.profile,
            state,
            submission,
            receipt,
            error,
            risk: self.risk,
            attempts: self.retry.attempts,
            requotes: self.retry.requotes,
            elapsed_ms: self.retry.elapsed().as_millis() as u64,
            events: self.events,
        }
    }

    fn report(&self, category: FailureCategory, message: impl Into<String>) -> ErrorReport {
        ErrorReport {
            category,
            message: message.into(),
            codes: self.retry.errors.iter().map(|e| e.code.as_str().to_string()).collect(),
            attempts: self.retry.attempts,
            requotes: self.retry.requotes,
            give_up_reason: None,
            violations: Vec::new(),
        }
    }
}

/// What the loop does after a failure was classified
enum Next {
    /// Resend the built transaction, or build again if there is none
    Resubmit,
    /// Fetch a fresh quote, then build
    Requote,
    Failed(ErrorReport),
    Cancelled,
}

pub struct ExecutionOrchestrator {
    risk: Arc<RiskGate>,
    quotes: Arc<dyn QuoteProvider>,
    builder: Arc<dyn SwapTransactionBuilder>,
    router: Arc<SubmissionRouter>,
    sink: Arc<dyn ExecutionEventSink>,
    metrics: Option<Arc<Metrics>>,
    config: ExecutionConfig,
    in_flight: DashMap<String, CorrelationId>,
}

impl ExecutionOrchestrator {
    pub fn new(
        risk: Arc<RiskGate>,
        quotes: Arc<dyn QuoteProvider>,
        builder: Arc<dyn SwapTransactionBuilder>,
        router: Arc<SubmissionRouter>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            risk,
            quotes,
            builder,
            router,
            sink: Arc::new(TracingEventSink),
            metrics: None,
            config,
            in_flight: DashMap::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ExecutionEventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Run with the given (or the configured default) profile
    pub async fn execute(
        &self,
        request: SwapRequest,
        quote: Quote,
        profile: Option<ExecutionProfile>,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.execute_with_cancel(request, quote, profile, CancellationToken::new())
            .await
    }

    /// Run the state machine to a terminal state.
    ///
    /// Cancelling `cancel` aborts the run at the next wait point; a transaction
    /// already handed to the router is not recalled.
    pub async fn execute_with_cancel(
        &self,
        mut request: SwapRequest,
        quote: Quote,
        profile: Option<ExecutionProfile>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let profile = profile.unwrap_or(self.config.default_profile);
        let swap_key = request.swap_key();
        let id = CorrelationId::new();

        let _guard = match self.in_flight.entry(swap_key.clone()) {
            Entry::Occupied(existing) => {
                warn!(swap_key = %swap_key, execution_id = %existing.get(), "Duplicate execution rejected");
                return Err(ExecutionError::AlreadyInFlight {
                    execution_id: existing.get().to_string(),
                    swap_key,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
                InFlightGuard {
                    map: &self.in_flight,
                    key: swap_key.clone(),
                }
            }
        };

        request.protected_mode |= self.config.protected_mode;

        let run = Run {
            id,
            swap_key,
            profile,
            strategy: profile.strategy(),
            retry: RetryState::new(),
            events: Vec::new(),
            sink: self.sink.as_ref(),
            risk: None,
        };

        let result = self.run(run, request, quote, &cancel).await;

        info!(
            execution_id = %result.execution_id,
            swap_key = %result.swap_key,
            state = %result.state,
            attempts = result.attempts,
            requotes = result.requotes,
            elapsed_ms = result.elapsed_ms,
            "Execution finished"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_execution(result.state.as_str());
        }
        Ok(result)
    }

    #[instrument(skip_all, fields(execution_id = %run.id, profile = %run.profile))]
    async fn run(
        &self,
        mut run: Run<'_>,
        request: SwapRequest,
        mut quote: Quote,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = run
            .event(EventType::ExecutionStarted, ExecutionState::QuoteReady)
            .with_mode(request.mode, None);
        run.emit(started).await;

        // RISK_GATE
        if let Err(reason) = self.risk.quick_check(&request) {
            return self.abort_blocked(run, vec![reason]).await;
        }
        let assessment = self.risk.score_swap(&request, &quote).await;
        let assessed = run
            .event(EventType::RiskAssessed, ExecutionState::RiskGate)
            .with_message(assessment.level.as_str())
            .with_data(&assessment);
        run.emit(assessed).await;
        let blocked = assessment.blocked_in_protected_mode;
        let violations: Vec<RiskReason> = assessment.top_reasons().cloned().collect();
        run.risk = Some(assessment);
        if blocked {
            return self.abort_blocked(run, violations).await;
        }

        let params = self.build_params(&request);
        let submit_options = SubmitOptions {
            tip_lamports: params.tip_lamports,
            priority_fee_micro_lamports: params.priority_fee_micro_lamports,
            ..SubmitOptions::new(request.mode)
        };
        let fee = params.tip_lamports.or(params.priority_fee_micro_lamports);

        let mut transaction: Option<VersionedTransaction> = None;
        let mut needs_quote = false;

        loop {
            if cancel.is_cancelled() {
                return self.abort_cancelled(run).await;
            }

            // Fresh QUOTE_READY; the risk gate is not re-run, the quote is re-validated at BUILD
            if needs_quote {
                match self.timed(self.quotes.get_quote(&request)).await {
                    Ok(fresh) => {
                        quote = fresh;
                        needs_quote = false;
                        let refreshed = run
                            .event(EventType::QuoteRefreshed, ExecutionState::QuoteReady)
                            .with_message(format!("out_amount={}", quote.out_amount));
                        run.emit(refreshed).await;
                    }
                    Err(err) => match self.on_failure(&mut run, err, None, cancel).await {
                        Next::Resubmit | Next::Requote => continue,
                        Next::Failed(report) => return run.finish(ExecutionState::Failed, None, None, Some(report)),
                        Next::Cancelled => return self.abort_cancelled(run).await,
                    },
                }
            }

            // BUILD
            let tx = match transaction.take() {
                Some(tx) => tx,
                None => {
                    let built = match quote.validate_against(&request) {
                        Ok(()) => self.timed(self.builder.build(&request, &quote, &params)).await,
                        Err(msg) => Err(ClassifiedError::fatal(
                            ErrorCode::QuoteMismatch,
                            format!("quote mismatch: {}", msg),
                        )),
                    };
                    match built {
                        Ok(tx) => {
                            let event = run
                                .event(EventType::TransactionBuilt, ExecutionState::Build)
                                .with_mode(request.mode, fee);
                            run.emit(event).await;
                            tx
                        }
                        Err(err) => match self.on_failure(&mut run, err, None, cancel).await {
                            Next::Resubmit => continue,
                            Next::Requote => {
                                needs_quote = true;
                                continue;
                            }
                            Next::Failed(report) => {
                                return run.finish(ExecutionState::Failed, None, None, Some(report))
                            }
                            Next::Cancelled => return self.abort_cancelled(run).await,
                        },
                    }
                }
            };

            if cancel.is_cancelled() {
                return self.abort_cancelled(run).await;
            }

            // SUBMIT
            let submitting = run
                .event(EventType::SubmissionStarted, ExecutionState::Submit)
                .with_mode(request.mode, fee);
            run.emit(submitting).await;

            match self.router.submit(&tx, &submit_options).await {
                Ok(submission) => {
                    let mut confirmed = run
                        .event(EventType::SubmissionConfirmed, ExecutionState::Submit)
                        .with_mode(submission.mode, fee)
                        .with_message(submission.signature.clone());
                    if let Some(endpoint) = &submission.endpoint {
                        confirmed = confirmed.with_endpoint(endpoint.clone());
                    }
                    run.emit(confirmed).await;

                    let receipt = SwapReceipt::new(&run.id, &request, &quote, &submission);
                    let succeeded = run
                        .event(EventType::ExecutionSucceeded, ExecutionState::Success)
                        .with_data(&receipt);
                    run.emit(succeeded).await;
                    return run.finish(ExecutionState::Success, Some(submission), Some(receipt), None);
                }
                Err(err) => {
                    let endpoint = err.endpoint().map(str::to_string);
                    let mut failed = run
                        .event(EventType::SubmissionFailed, ExecutionState::Submit)
                        .with_mode(request.mode, fee)
                        .with_message(err.to_string());
                    if let Some(endpoint) = &endpoint {
                        failed = failed.with_endpoint(endpoint.clone());
                    }
                    run.emit(failed).await;

                    match self.on_failure(&mut run, classify(&err), endpoint, cancel).await {
                        Next::Resubmit => transaction = Some(tx),
                        Next::Requote => needs_quote = true,
                        Next::Failed(report) => {
                            return run.finish(ExecutionState::Failed, None, None, Some(report))
                        }
                        Next::Cancelled => return self.abort_cancelled(run).await,
                    }
                }
            }
        }
    }

    /// CLASSIFY: decide, record, back off
    async fn on_failure(
        &self,
        run: &mut Run<'_>,
        error: ClassifiedError,
        endpoint: Option<String>,
        cancel: &CancellationToken,
    ) -> Next {
        // Decide before recording: the unknown-error rule looks at earlier errors only
        let decision = next_action(&error, &run.retry, &run.strategy);

        let mut classified = run
            .event(EventType::ErrorClassified, ExecutionState::Classify)
            .with_error_code(error.code.as_str())
            .with_message(format!("{}: {}", error.category, error.message));
        if let Some(endpoint) = endpoint {
            classified = classified.with_endpoint(endpoint);
        }
        run.emit(classified).await;
        run.retry.record(error.clone());

        let (next, delay, event_type) = match decision {
            RetryDecision::GiveUp { reason } => {
                warn!(
                    execution_id = %run.id,
                    code = %error.code,
                    attempts = run.retry.attempts,
                    reason = %reason,
                    "Giving up on execution"
                );
                let mut report = run.report(error.category.into(), format!("{} ({})", error.message, reason));
                report.give_up_reason = Some(reason);
                let failed = run
                    .event(EventType::ExecutionFailed, ExecutionState::Failed)
                    .with_error_code(error.code.as_str())
                    .with_data(&report);
                run.emit(failed).await;
                return Next::Failed(report);
            }
            RetryDecision::Retry { delay } => {
                run.retry.begin_retry();
                (Next::Resubmit, delay, EventType::RetryScheduled)
            }
            RetryDecision::Requote { delay } => {
                run.retry.begin_requote();
                if let Some(metrics) = &self.metrics {
                    metrics.execution_requotes_total.inc();
                }
                (Next::Requote, delay, EventType::RequoteScheduled)
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.execution_retries_total.inc();
        }
        let scheduled = run
            .event(event_type, ExecutionState::Classify)
            .with_error_code(error.code.as_str())
            .with_message(format!("delay_ms={}", delay.as_millis()));
        run.emit(scheduled).await;

        debug!(
            execution_id = %run.id,
            attempt = run.retry.attempts,
            backoff_ms = delay.as_millis() as u64,
            "Backing off before next attempt"
        );
        if sleep_cancellable(delay, cancel).await.is_err() {
            return Next::Cancelled;
        }
        next
    }

    async fn abort_blocked(&self, mut run: Run<'_>, violations: Vec<RiskReason>) -> ExecutionResult {
        let message = violations
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        let mut report = run.report(FailureCategory::RiskBlocked, message);
        report.codes = violations.iter().map(|r| r.code.as_str().to_string()).collect();
        report.violations = violations;

        let blocked = run
            .event(EventType::RiskBlocked, ExecutionState::Aborted)
            .with_error_code("RISK_BLOCKED")
            .with_data(&report);
        run.emit(blocked).await;
        let aborted = run.event(EventType::ExecutionAborted, ExecutionState::Aborted);
        run.emit(aborted).await;
        run.finish(ExecutionState::Aborted, None, None, Some(report))
    }

    async fn abort_cancelled(&self, mut run: Run<'_>) -> ExecutionResult {
        info!(execution_id = %run.id, attempts = run.retry.attempts, "Execution cancelled");
        let report = run.report(FailureCategory::Cancelled, "execution cancelled by caller");
        let aborted = run
            .event(EventType::ExecutionAborted, ExecutionState::Aborted)
            .with_error_code("CANCELLED")
            .with_data(&report);
        run.emit(aborted).await;
        run.finish(ExecutionState::Aborted, None, None, Some(report))
    }

    fn build_params(&self, request: &SwapRequest) -> BuildParams {
        match request.mode {
            SubmissionMode::Relay => BuildParams {
                mode: SubmissionMode::Relay,
                priority_fee_micro_lamports: request.priority_fee_micro_lamports,
                tip_lamports: Some(self.router.clamp_tip(request.tip_lamports)),
            },
            SubmissionMode::Priority => BuildParams {
                mode: SubmissionMode::Priority,
                priority_fee_micro_lamports: Some(
                    request
                        .priority_fee_micro_lamports
                        .unwrap_or(self.config.default_priority_fee_micro_lamports),
                ),
                tip_lamports: None,
            },
            SubmissionMode::Direct => BuildParams::default(),
        }
    }

    /// Bound a collaborator call by the operation timeout and classify its failure
    async fn timed<T>(&self, fut: impl Future<Output = anyhow::Result<T>>) -> Result<T, ClassifiedError> {
        let timeout = self.config.operation_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_message(&format!("{:#}", e))),
            Err(_) => Err(classify_message(&format!(
                "operation timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}
