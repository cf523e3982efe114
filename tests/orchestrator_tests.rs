//! End-to-end runs of the execution state machine
//!
//! Quote provider, transaction builder and sender are scripted fakes; the
//! risk gate, classifier, retry budgets and router are the real ones.
//! Time is paused so backoff sleeps complete instantly.

use async_trait::async_trait;
use flowmint_exec::config::{ExecutionConfig, RelayConfig};
use flowmint_exec::execution::{
    BuildParams, EventType, ExecutionError, ExecutionOrchestrator, ExecutionProfile, ExecutionState,
    FailureCategory, GiveUpReason, MemoryEventSink, QuoteProvider, SwapTransactionBuilder,
};
use flowmint_exec::metrics::Metrics;
use flowmint_exec::risk::policy::{USDC_MINT, WSOL_MINT};
use flowmint_exec::risk::{MintAccount, RiskCode, RiskGate, RiskPolicy, StaticMintSource};
use flowmint_exec::types::{RoutePlanStep, SwapInfo};
use flowmint_exec::rpc_manager::RpcManagerError;
use flowmint_exec::submission::{Landed, SendOptions, SubmissionError, SubmissionRouter, TransactionSender};
use flowmint_exec::{Quote, SubmissionMode, SwapRequest};
use parking_lot::Mutex;
use solana_sdk::message::{Message, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn wsol() -> Pubkey {
    Pubkey::from_str(WSOL_MINT).unwrap()
}

fn usdc() -> Pubkey {
    Pubkey::from_str(USDC_MINT).unwrap()
}

fn request(id: &str) -> SwapRequest {
    SwapRequest {
        id: Some(id.to_string()),
        user: Pubkey::new_unique(),
        input_mint: wsol(),
        output_mint: usdc(),
        amount: 1_000_000_000,
        slippage_bps: 50,
        protected_mode: false,
        mode: SubmissionMode::Priority,
        priority_fee_micro_lamports: None,
        tip_lamports: None,
    }
}

fn quote_for(req: &SwapRequest, out_amount: u64) -> Quote {
    Quote {
        input_mint: req.input_mint.to_string(),
        output_mint: req.output_mint.to_string(),
        in_amount: req.amount.to_string(),
        out_amount: out_amount.to_string(),
        other_amount_threshold: (out_amount - out_amount / 200).to_string(),
        slippage_bps: req.slippage_bps,
        price_impact_pct: "0.001".to_string(),
        ..Default::default()
    }
}

/// Always hands out the same fresh quote
struct FixedQuotes {
    quote: Quote,
    calls: AtomicUsize,
}

#[async_trait]
impl QuoteProvider for FixedQuotes {
    async fn get_quote(&self, _request: &SwapRequest) -> anyhow::Result<Quote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.quote.clone())
    }
}

#[derive(Default)]
struct CountingBuilder {
    builds: AtomicUsize,
    params: Mutex<Vec<BuildParams>>,
}

#[async_trait]
impl SwapTransactionBuilder for CountingBuilder {
    async fn build(
        &self,
        _request: &SwapRequest,
        _quote: &Quote,
        params: &BuildParams,
    ) -> anyhow::Result<VersionedTransaction> {
        let n = self.builds.fetch_add(1, Ordering::SeqCst) as u8;
        self.params.lock().push(*params);
        Ok(VersionedTransaction {
            signatures: vec![Signature::from([n + 1; 64])],
            message: VersionedMessage::Legacy(Message::default()),
        })
    }
}

/// Pops one scripted outcome per send; lands once the script runs out
#[derive(Default)]
struct ScriptedSender {
    outcomes: Mutex<VecDeque<SubmissionError>>,
    sent: Mutex<Vec<Signature>>,
    hold: Option<Arc<Notify>>,
}

impl ScriptedSender {
    fn failing(errors: Vec<SubmissionError>) -> Self {
        Self {
            outcomes: Mutex::new(errors.into()),
            ..Default::default()
        }
    }

    fn sends(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl TransactionSender for ScriptedSender {
    async fn send_and_confirm(
        &self,
        transaction: &VersionedTransaction,
        _options: &SendOptions,
    ) -> Result<Landed, SubmissionError> {
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        self.sent.lock().push(transaction.signatures[0]);
        if let Some(err) = self.outcomes.lock().pop_front() {
            return Err(err);
        }
        Ok(Landed {
            signature: transaction.signatures[0],
            slot: 4242,
            endpoint: "primary".to_string(),
        })
    }
}

fn blockhash_not_found() -> SubmissionError {
    SubmissionError::Rpc(RpcManagerError::BlockhashNotFound {
        endpoint: "primary".to_string(),
    })
}

struct Harness {
    orchestrator: Arc<ExecutionOrchestrator>,
    quotes: Arc<FixedQuotes>,
    builder: Arc<CountingBuilder>,
    sender: Arc<ScriptedSender>,
    sink: Arc<MemoryEventSink>,
    mints: Arc<StaticMintSource>,
    metrics: Arc<Metrics>,
}

fn harness(sender: ScriptedSender, fresh_quote: Quote) -> Harness {
    let mints = Arc::new(
        StaticMintSource::new()
            .with_mint(wsol(), MintAccount::default())
            .with_mint(usdc(), MintAccount::default()),
    );
    let metrics = Arc::new(Metrics::new().unwrap());
    let risk = Arc::new(RiskGate::new(Arc::new(RiskPolicy::default()), mints.clone()).with_metrics(metrics.clone()));
    let sender = Arc::new(sender);
    let router = Arc::new(SubmissionRouter::new(sender.clone(), RelayConfig::default()).with_metrics(metrics.clone()));
    let quotes = Arc::new(FixedQuotes {
        quote: fresh_quote,
        calls: AtomicUsize::new(0),
    });
    let builder = Arc::new(CountingBuilder::default());
    let sink = Arc::new(MemoryEventSink::new());

    let orchestrator = ExecutionOrchestrator::new(risk, quotes.clone(), builder.clone(), router, ExecutionConfig::default())
        .with_sink(sink.clone())
        .with_metrics(metrics.clone());

    Harness {
        orchestrator: Arc::new(orchestrator),
        quotes,
        builder,
        sender,
        sink,
        mints,
        metrics,
    }
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_produces_receipt() {
    let req = request("happy");
    let h = harness(ScriptedSender::default(), quote_for(&req, 150_000_000));

    let result = h
        .orchestrator
        .execute(req.clone(), quote_for(&req, 150_000_000), None)
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.profile, ExecutionProfile::Auto);
    assert_eq!(result.attempts, 0);
    assert_eq!(
        result.event_types(),
        vec![
            EventType::ExecutionStarted,
            EventType::RiskAssessed,
            EventType::TransactionBuilt,
            EventType::SubmissionStarted,
            EventType::SubmissionConfirmed,
            EventType::ExecutionSucceeded,
        ]
    );

    let receipt = result.receipt.clone().unwrap();
    assert_eq!(receipt.in_amount, 1_000_000_000);
    assert_eq!(receipt.quoted_out_amount, 150_000_000);
    assert_eq!(receipt.quoted_vs_min_bps, -50);
    assert_eq!(receipt.slot, Some(4242));
    assert!(!receipt.protected);

    // Priority mode gets the configured default fee
    let params = h.builder.params.lock().clone();
    assert_eq!(params[0].priority_fee_micro_lamports, Some(10_000));

    // Every event went through the sink too
    assert_eq!(h.sink.event_types(), result.event_types());
    assert!(h.metrics.render().contains("executions_total{state=\"SUCCESS\"} 1"));
    assert_eq!(h.orchestrator.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_resends_same_transaction() {
    let req = request("transient");
    let h = harness(
        ScriptedSender::failing(vec![blockhash_not_found()]),
        quote_for(&req, 150_000_000),
    );

    let result = h
        .orchestrator
        .execute(req.clone(), quote_for(&req, 150_000_000), None)
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.attempts, 1);
    assert_eq!(result.requotes, 0);
    assert!(result.event_types().contains(&EventType::RetryScheduled));
    assert_eq!(h.builder.builds.load(Ordering::SeqCst), 1);

    let sent = h.sender.sent.lock().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
    assert_eq!(h.metrics.execution_retries_total.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slippage_failure_requotes_and_rebuilds() {
    let req = request("requote");
    let slippage = SubmissionError::OnChain {
        signature: "sig".to_string(),
        message: "Error processing Instruction 3: custom program error: 0x1771".to_string(),
    };
    let h = harness(ScriptedSender::failing(vec![slippage]), quote_for(&req, 149_000_000));

    let result = h
        .orchestrator
        .execute(req.clone(), quote_for(&req, 150_000_000), None)
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.attempts, 1);
    assert_eq!(result.requotes, 1);
    assert_eq!(h.quotes.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.builder.builds.load(Ordering::SeqCst), 2);

    let types = result.event_types();
    assert!(types.contains(&EventType::RequoteScheduled));
    assert!(types.contains(&EventType::QuoteRefreshed));
    // Requotes do not re-run the risk gate
    assert_eq!(types.iter().filter(|t| **t == EventType::RiskAssessed).count(), 1);

    // The receipt prices the fresh quote
    assert_eq!(result.receipt.unwrap().quoted_out_amount, 149_000_000);

    let sent = h.sender.sent.lock().clone();
    assert_ne!(sent[0], sent[1]);
}

#[tokio::test(start_paused = true)]
async fn test_expired_blockhash_goes_down_requote_path() {
    let req = request("expired");
    let expired = SubmissionError::Expired {
        signature: "sig".to_string(),
        last_valid_block_height: 100,
    };
    let h = harness(ScriptedSender::failing(vec![expired]), quote_for(&req, 150_000_000));

    let result = h
        .orchestrator
        .execute(req.clone(), quote_for(&req, 150_000_000), None)
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.requotes, 1);
    assert_eq!(h.quotes.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_is_never_retried() {
    let req = request("fatal");
    let funds = SubmissionError::Rpc(RpcManagerError::InsufficientFunds {
        endpoint: "primary".to_string(),
    });
    let h = harness(ScriptedSender::failing(vec![funds]), quote_for(&req, 150_000_000));

    let result = h
        .orchestrator
        .execute(req.clone(), quote_for(&req, 150_000_000), None)
        .await
        .unwrap();

    assert_eq!(result.state, ExecutionState::Failed);
    assert_eq!(result.attempts, 0);
    assert_eq!(h.sender.sends(), 1);

    let error = result.error.unwrap();
    assert_eq!(error.category, FailureCategory::Fatal);
    assert_eq!(error.codes, vec!["INSUFFICIENT_FUNDS".to_string()]);
    assert_eq!(error.give_up_reason, Some(GiveUpReason::Fatal));
    assert_eq!(result.events.last().unwrap().event_type, EventType::ExecutionFailed);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_is_exhausted() {
    let req = request("budget");
    let h = harness(
        ScriptedSender::failing((0..10).map(|_| blockhash_not_found()).collect()),
        quote_for(&req, 150_000_000),
    );

    let result = h
        .orchestrator
        .execute(req.clone(), quote_for(&req, 150_000_000), Some(ExecutionProfile::Fast))
        .await
        .unwrap();

    let max_retries = ExecutionProfile::Fast.strategy().max_retries;
    assert_eq!(result.state, ExecutionState::Failed);
    assert_eq!(result.attempts, max_retries);
    assert_eq!(h.sender.sends() as u32, max_retries + 1);

    let error = result.error.unwrap();
    assert_eq!(error.category, FailureCategory::Transient);
    assert_eq!(error.give_up_reason, Some(GiveUpReason::RetriesExhausted));
    assert_eq!(error.codes.len() as u32, max_retries + 1);
    assert!(error.codes.iter().all(|c| c == "BLOCKHASH_NOT_FOUND"));
}

#[tokio::test(start_paused = true)]
async fn test_protected_mode_blocks_risky_swap() {
    let mut req = request("blocked");
    req.protected_mode = true;
    req.slippage_bps = 500;
    let h = harness(ScriptedSender::default(), quote_for(&req, 150_000_000));

    let result = h
        .orchestrator
        .execute(req.clone(), quote_for(&req, 150_000_000), None)
        .await
        .unwrap();

    assert_eq!(result.state, ExecutionState::Aborted);
    assert_eq!(h.builder.builds.load(Ordering::SeqCst), 0);
    assert_eq!(h.sender.sends(), 0);

    let error = result.error.clone().unwrap();
    assert_eq!(error.category, FailureCategory::RiskBlocked);
    assert!(error.codes.contains(&"SLIPPAGE_UNSAFE".to_string()));
    assert!(!error.violations.is_empty());
    assert!(result.risk.as_ref().unwrap().blocked_in_protected_mode);
    assert!(result.event_types().contains(&EventType::RiskBlocked));
}

#[tokio::test(start_paused = true)]
async fn test_protected_block_names_price_impact_limit() {
    let mut req = request("impact-ceiling");
    req.protected_mode = true;
    let h = harness(ScriptedSender::default(), quote_for(&req, 150_000_000));

    // Long route makes the swap AMBER; 1.5 % impact is under the caution
    // threshold but over the 1 % protected-mode limit
    let mut quote = quote_for(&req, 150_000_000);
    quote.price_impact_pct = "0.015".to_string();
    quote.route_plan = (0..4)
        .map(|i| RoutePlanStep {
            swap_info: SwapInfo {
                label: Some(format!("amm-{}", i)),
                ..Default::default()
            },
            percent: Some(100),
            ..Default::default()
        })
        .collect();

    let result = h.orchestrator.execute(req, quote, None).await.unwrap();

    assert_eq!(result.state, ExecutionState::Aborted);
    assert_eq!(h.sender.sends(), 0);

    let error = result.error.unwrap();
    assert_eq!(error.category, FailureCategory::RiskBlocked);
    assert!(error.codes.contains(&"PROTECTED_PRICE_IMPACT_EXCEEDED".to_string()));
    let limit = error
        .violations
        .iter()
        .find(|r| r.code == RiskCode::ProtectedPriceImpactExceeded)
        .and_then(|r| r.threshold)
        .unwrap();
    assert_eq!(limit.limit, 1.0);
    assert!((limit.used - 1.5).abs() < 1e-9);
    assert!(error.message.contains("protected-mode limit of 1%"));
}

#[tokio::test(start_paused = true)]
async fn test_quick_check_rejects_before_token_lookup() {
    let mut req = request("ceiling");
    req.slippage_bps = 2_000;
    let h = harness(ScriptedSender::default(), quote_for(&req, 150_000_000));

    let result = h
        .orchestrator
        .execute(req.clone(), quote_for(&req, 150_000_000), None)
        .await
        .unwrap();

    assert_eq!(result.state, ExecutionState::Aborted);
    assert!(result.risk.is_none());
    assert_eq!(h.mints.calls(), 0);
    assert_eq!(
        result.error.unwrap().codes,
        vec!["SLIPPAGE_ABOVE_CEILING".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unprotected_red_swap_still_executes() {
    let mut req = request("red-unprotected");
    req.slippage_bps = 500;
    let h = harness(ScriptedSender::default(), quote_for(&req, 150_000_000));

    let result = h
        .orchestrator
        .execute(req.clone(), quote_for(&req, 150_000_000), None)
        .await
        .unwrap();

    assert!(result.is_success());
    assert!(!result.risk.unwrap().blocked_in_protected_mode);
}

#[tokio::test(start_paused = true)]
async fn test_quote_mismatch_is_fatal_and_never_submitted() {
    let req = request("mismatch");
    let mut quote = quote_for(&req, 150_000_000);
    quote.in_amount = "999".to_string();
    let h = harness(ScriptedSender::default(), quote.clone());

    let result = h.orchestrator.execute(req, quote, None).await.unwrap();

    assert_eq!(result.state, ExecutionState::Failed);
    assert_eq!(h.builder.builds.load(Ordering::SeqCst), 0);
    assert_eq!(h.sender.sends(), 0);
    let error = result.error.unwrap();
    assert_eq!(error.category, FailureCategory::Fatal);
    assert_eq!(error.codes, vec!["QUOTE_MISMATCH".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_swap_key_is_rejected_while_in_flight() {
    let req = request("dup");
    let hold = Arc::new(Notify::new());
    let sender = ScriptedSender {
        hold: Some(hold.clone()),
        ..Default::default()
    };
    let h = harness(sender, quote_for(&req, 150_000_000));

    let first = {
        let orchestrator = h.orchestrator.clone();
        let (req, quote) = (req.clone(), quote_for(&req, 150_000_000));
        tokio::spawn(async move { orchestrator.execute(req, quote, None).await })
    };
    while h.orchestrator.in_flight_count() == 0 {
        tokio::task::yield_now().await;
    }

    let second = h
        .orchestrator
        .execute(req.clone(), quote_for(&req, 150_000_000), None)
        .await;
    match second {
        Err(ExecutionError::AlreadyInFlight { swap_key, .. }) => assert_eq!(swap_key, "dup"),
        other => panic!("expected AlreadyInFlight, got {:?}", other.map(|r| r.state)),
    }

    hold.notify_one();
    let first = first.await.unwrap().unwrap();
    assert!(first.is_success());
    assert_eq!(h.orchestrator.in_flight_count(), 0);

    // The key is free again once the first run finished
    hold.notify_one();
    let third = h
        .orchestrator
        .execute(req.clone(), quote_for(&req, 150_000_000), None)
        .await
        .unwrap();
    assert!(third.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_aborts() {
    let req = request("cancel");
    let h = harness(
        ScriptedSender::failing((0..10).map(|_| blockhash_not_found()).collect()),
        quote_for(&req, 150_000_000),
    );
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
    }

    let result = h
        .orchestrator
        .execute_with_cancel(req.clone(), quote_for(&req, 150_000_000), None, cancel)
        .await
        .unwrap();

    assert_eq!(result.state, ExecutionState::Aborted);
    assert_eq!(h.sender.sends(), 1);
    let error = result.error.unwrap();
    assert_eq!(error.category, FailureCategory::Cancelled);
    assert_eq!(result.events.last().unwrap().error_code.as_deref(), Some("CANCELLED"));
}

#[tokio::test(start_paused = true)]
async fn test_relay_without_bundler_falls_back_to_direct() {
    let mut req = request("relay");
    req.mode = SubmissionMode::Relay;
    req.tip_lamports = Some(50_000_000);
    let h = harness(ScriptedSender::default(), quote_for(&req, 150_000_000));

    let result = h
        .orchestrator
        .execute(req.clone(), quote_for(&req, 150_000_000), None)
        .await
        .unwrap();

    assert!(result.is_success());
    let submission = result.submission.unwrap();
    assert!(submission.fell_back);
    assert!(!submission.protected);

    // The tip handed to the builder is clamped to the relay maximum
    let params = h.builder.params.lock().clone();
    assert_eq!(params[0].tip_lamports, Some(RelayConfig::default().max_tip_lamports));
    assert_eq!(h.metrics.relay_fallbacks_total.get(), 1);
}
