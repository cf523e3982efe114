//! Submission router with the relay served by a mockito block engine
//!
//! The direct path uses a recording fake sender so fallbacks can be counted.

use async_trait::async_trait;
use flowmint_exec::config::RelayConfig;
use flowmint_exec::execution::{classify, ErrorCategory};
use flowmint_exec::metrics::Metrics;
use flowmint_exec::submission::router::PRIORITY_MAX_RETRIES;
use flowmint_exec::submission::{
    JitoBundler, Landed, SendOptions, SubmissionError, SubmissionRouter, SubmitOptions, TransactionSender,
    JITO_TIP_ACCOUNTS,
};
use flowmint_exec::SubmissionMode;
use mockito::{Matcher, Mock, Server, ServerGuard};
use parking_lot::Mutex;
use serde_json::{json, Value};
use solana_sdk::hash::Hash;
use solana_sdk::message::{v0, VersionedMessage};
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::system_instruction;
use solana_sdk::transaction::VersionedTransaction;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingSender {
    calls: Mutex<Vec<SendOptions>>,
    failures: Mutex<VecDeque<SubmissionError>>,
}

impl RecordingSender {
    fn calls(&self) -> Vec<SendOptions> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TransactionSender for RecordingSender {
    async fn send_and_confirm(
        &self,
        transaction: &VersionedTransaction,
        options: &SendOptions,
    ) -> Result<Landed, SubmissionError> {
        self.calls.lock().push(options.clone());
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        Ok(Landed {
            signature: transaction.signatures[0],
            slot: 999,
            endpoint: "direct-node".to_string(),
        })
    }
}

/// Swap stand-in that pays a relay tip
fn tipped_transaction() -> VersionedTransaction {
    let payer = Keypair::new();
    let ixs = [
        system_instruction::transfer(&payer.pubkey(), &Keypair::new().pubkey(), 5_000),
        system_instruction::transfer(&payer.pubkey(), &JITO_TIP_ACCOUNTS[0], 20_000),
    ];
    let message = v0::Message::try_compile(&payer.pubkey(), &ixs, &[], Hash::new_unique()).unwrap();
    VersionedTransaction::try_new(VersionedMessage::V0(message), &[&payer]).unwrap()
}

fn rpc_result(result: Value) -> String {
    json!({ "jsonrpc": "2.0", "result": result, "id": 1 }).to_string()
}

async fn mock_relay(server: &mut ServerGuard, method: &str, body: String) -> Mock {
    server
        .mock("POST", "/api/v1/bundles")
        .match_body(Matcher::PartialJson(json!({ "method": method })))
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await
}

fn relay_config(server: &ServerGuard) -> RelayConfig {
    RelayConfig {
        block_engine_url: server.url(),
        default_tip_lamports: 20_000,
        min_tip_lamports: 1_000,
        max_tip_lamports: 50_000,
        poll_interval_ms: 20,
        bundle_timeout_ms: 500,
    }
}

struct Setup {
    router: SubmissionRouter,
    sender: Arc<RecordingSender>,
    metrics: Arc<Metrics>,
}

fn setup(server: &ServerGuard) -> Setup {
    let config = relay_config(server);
    let bundler = JitoBundler::new(&config.block_engine_url, Duration::from_secs(2)).unwrap();
    let sender = Arc::new(RecordingSender::default());
    let metrics = Arc::new(Metrics::new().unwrap());
    let router = SubmissionRouter::new(sender.clone(), config)
        .with_bundler(Arc::new(bundler))
        .with_metrics(metrics.clone());
    Setup {
        router,
        sender,
        metrics,
    }
}

fn relay_options(tip: u64) -> SubmitOptions {
    SubmitOptions {
        tip_lamports: Some(tip),
        ..SubmitOptions::new(SubmissionMode::Relay)
    }
}

#[tokio::test]
async fn test_relay_bundle_lands() {
    let mut server = Server::new_async().await;
    let send = server
        .mock("POST", "/api/v1/bundles")
        .match_body(Matcher::AllOf(vec![
            Matcher::PartialJson(json!({ "method": "sendBundle" })),
            Matcher::Regex("\"encoding\":\"base64\"".to_string()),
        ]))
        .with_header("content-type", "application/json")
        .with_body(rpc_result(json!("bundle-abc")))
        .expect(1)
        .create_async()
        .await;
    mock_relay(
        &mut server,
        "getBundleStatuses",
        rpc_result(json!({
            "context": { "slot": 301 },
            "value": [{
                "bundle_id": "bundle-abc",
                "transactions": [],
                "slot": 300,
                "confirmation_status": "confirmed",
                "err": { "Ok": null }
            }]
        })),
    )
    .await;

    let s = setup(&server);
    let tx = tipped_transaction();
    let result = s.router.submit(&tx, &relay_options(500_000)).await.unwrap();

    send.assert_async().await;
    assert!(result.protected);
    assert!(!result.fell_back);
    assert_eq!(result.mode, SubmissionMode::Relay);
    assert_eq!(result.bundle_id.as_deref(), Some("bundle-abc"));
    assert_eq!(result.slot, Some(300));
    assert_eq!(result.signature, tx.signatures[0].to_string());
    // Requested tip is clamped to the configured maximum
    assert_eq!(result.tip_lamports, Some(50_000));
    assert!(s.sender.calls().is_empty());
}

#[tokio::test]
async fn test_rejected_bundle_falls_back_to_direct() {
    let mut server = Server::new_async().await;
    mock_relay(
        &mut server,
        "sendBundle",
        json!({
            "jsonrpc": "2.0",
            "error": { "code": -32602, "message": "bundle must contain a tip" },
            "id": 1
        })
        .to_string(),
    )
    .await;

    let s = setup(&server);
    let result = s.router.submit(&tipped_transaction(), &relay_options(20_000)).await.unwrap();

    assert!(result.fell_back);
    assert!(!result.protected);
    assert_eq!(result.mode, SubmissionMode::Direct);
    assert_eq!(result.endpoint.as_deref(), Some("direct-node"));
    assert_eq!(s.sender.calls().len(), 1);
    assert_eq!(s.metrics.relay_fallbacks_total.get(), 1);
}

#[tokio::test]
async fn test_failed_bundle_falls_back_to_direct() {
    let mut server = Server::new_async().await;
    mock_relay(&mut server, "sendBundle", rpc_result(json!("bundle-err"))).await;
    mock_relay(
        &mut server,
        "getBundleStatuses",
        rpc_result(json!({
            "context": { "slot": 301 },
            "value": [{
                "bundle_id": "bundle-err",
                "transactions": [],
                "slot": 300,
                "confirmation_status": "processed",
                "err": { "Err": { "InstructionError": [2, { "Custom": 6001 }] } }
            }]
        })),
    )
    .await;

    let s = setup(&server);
    let result = s.router.submit(&tipped_transaction(), &relay_options(20_000)).await.unwrap();

    assert!(result.fell_back);
    assert_eq!(s.sender.calls().len(), 1);
}

#[tokio::test]
async fn test_pending_bundle_times_out_then_falls_back() {
    let mut server = Server::new_async().await;
    mock_relay(&mut server, "sendBundle", rpc_result(json!("bundle-slow"))).await;
    let status = server
        .mock("POST", "/api/v1/bundles")
        .match_body(Matcher::PartialJson(json!({ "method": "getBundleStatuses" })))
        .with_header("content-type", "application/json")
        .with_body(rpc_result(json!({ "context": { "slot": 301 }, "value": [null] })))
        .expect_at_least(2)
        .create_async()
        .await;

    let s = setup(&server);
    let result = s.router.submit(&tipped_transaction(), &relay_options(20_000)).await.unwrap();

    status.assert_async().await;
    assert!(result.fell_back);
    assert_eq!(s.metrics.relay_fallbacks_total.get(), 1);
}

#[tokio::test]
async fn test_fallback_failure_surfaces_direct_error() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/api/v1/bundles")
        .with_status(503)
        .with_body("block engine overloaded")
        .create_async()
        .await;

    let s = setup(&server);
    s.sender.failures.lock().push_back(SubmissionError::Expired {
        signature: "sig".to_string(),
        last_valid_block_height: 10,
    });

    let err = s
        .router
        .submit(&tipped_transaction(), &relay_options(20_000))
        .await
        .unwrap_err();

    assert!(matches!(err, SubmissionError::Expired { .. }));
    let classified = classify(&err);
    assert!(classified.requires_requote);
    assert_ne!(classified.category, ErrorCategory::Fatal);
    assert!(s.metrics.render().contains("rpc_requests_total{outcome=\"error\"} 1"));
}

#[tokio::test]
async fn test_priority_mode_never_touches_relay() {
    let server = Server::new_async().await;
    let s = setup(&server);

    let options = SubmitOptions {
        priority_fee_micro_lamports: Some(25_000),
        ..SubmitOptions::new(SubmissionMode::Priority)
    };
    let result = s.router.submit(&tipped_transaction(), &options).await.unwrap();

    assert_eq!(result.mode, SubmissionMode::Priority);
    assert!(!result.protected);
    assert_eq!(result.slot, Some(999));

    let calls = s.sender.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].max_retries, PRIORITY_MAX_RETRIES);
    assert!(!calls[0].skip_preflight);
}
