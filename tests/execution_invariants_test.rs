//! Cross-component execution invariants, driven through the public API
//! against the paper collaborators:
//! - a bundle is never submitted without a prior successful simulation
//! - slippage minimums are enforced at fill time, not just at build time
//! - the retry budget bounds the number of attempts exactly
//! - concurrent orders on one account never share a sequence number

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use volley::bundle::BundleProtection;
use volley::config::{Config, ExecutionConfig};
use volley::coordinator::{CancelHandle, SubmissionCoordinator};
use volley::engine::TradeOptions;
use volley::events::EventBus;
use volley::interfaces::RelayEndpoint;
use volley::nonce::NonceRegistry;
use volley::order::{OrderBuilder, OrderRequest, OrderState};
use volley::paper::{
    PaperFeeEstimator, PaperQuoteSource, PaperRelay, PaperRpc, PaperSafety, RelayCall, UNIT,
};
use volley::types::{FeeBounds, Side, SubmissionChannel, Urgency};
use volley::wallet::ManagedAccount;
use volley::{Address, Asset, Engine, Mode};

fn token() -> Asset {
    Asset::Token(Address([0x99; 20]))
}

fn fast_execution() -> ExecutionConfig {
    ExecutionConfig {
        inclusion_poll_ms: 10,
        inclusion_wait_blocks: 2,
        submission_blocks: 1,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..ExecutionConfig::default()
    }
}

/// Hand-wired coordinator around a single scripted relay
struct Rig {
    quotes: Arc<PaperQuoteSource>,
    rpc: Arc<PaperRpc>,
    nonces: Arc<NonceRegistry>,
    builder: Arc<OrderBuilder>,
    coordinator: SubmissionCoordinator,
    account_id: uuid::Uuid,
}

fn rig<F>(config: ExecutionConfig, make_relay: F) -> (Rig, Arc<PaperRelay>)
where
    F: FnOnce(&Arc<PaperRpc>, &Arc<PaperQuoteSource>) -> PaperRelay,
{
    let quotes = Arc::new(PaperQuoteSource::new());
    quotes.set_rate(token(), 1000.0);
    let rpc = Arc::new(PaperRpc::with_quotes(quotes.clone()));
    let relay = Arc::new(make_relay(&rpc, &quotes));
    let nonces = Arc::new(NonceRegistry::new(rpc.clone()));
    let account_id = nonces.register(ManagedAccount::generate("rig"));

    let builder = Arc::new(OrderBuilder::new(
        quotes.clone(),
        Arc::new(PaperSafety::allow_all()),
        Arc::new(PaperFeeEstimator::default()),
        Duration::from_millis(200),
    ));
    let relay_dyn: Arc<dyn RelayEndpoint> = relay.clone();
    let protection = Arc::new(BundleProtection::new(
        vec![relay_dyn],
        Duration::from_millis(200),
    ));
    let coordinator = SubmissionCoordinator::new(
        nonces.clone(),
        builder.clone(),
        protection,
        rpc.clone(),
        EventBus::default(),
        config,
        Address([0xee; 20]),
    );

    (
        Rig {
            quotes,
            rpc,
            nonces,
            builder,
            coordinator,
            account_id,
        },
        relay,
    )
}

fn request(rig: &Rig, slippage: f64, retry_budget: u32) -> OrderRequest {
    OrderRequest {
        side: Side::Buy,
        source_asset: Asset::Native,
        target_asset: token(),
        amount_in: UNIT,
        slippage_percent: slippage,
        deadline: Utc::now() + chrono::Duration::seconds(30),
        fee_bounds: FeeBounds {
            max_fee_per_gas: 100_000_000_000,
            max_priority_fee_per_gas: 2_000_000_000,
            gas_limit: 300_000,
        },
        account_id: rig.account_id,
        channel: SubmissionChannel::Bundle,
        urgency: Urgency::High,
        safety_check: false,
        retry_budget,
        auto_manage: false,
        exit_plan: None,
        tags: vec![],
        detected_at: Utc::now(),
    }
}

#[tokio::test]
async fn simulation_always_precedes_submission() {
    let (r, relay) = rig(fast_execution(), |rpc, quotes| {
        PaperRelay::accepting("recording")
            .with_ledger(rpc.clone())
            .with_fill_enforcement(quotes.clone())
    });

    let order = r.builder.build(request(&r, 10.0, 1)).await.unwrap();
    let confirmed = r.coordinator.execute(order).await;
    assert_eq!(confirmed.state, OrderState::Confirmed);

    let calls = relay.calls();
    let first_simulate = calls
        .iter()
        .position(|c| matches!(c, RelayCall::Simulate(_)))
        .expect("no simulation recorded");
    let first_submit = calls
        .iter()
        .position(|c| matches!(c, RelayCall::Submit(_)))
        .expect("no submission recorded");
    assert!(
        first_simulate < first_submit,
        "submission before simulation: {calls:?}"
    );
}

#[tokio::test]
async fn minimum_output_enforced_on_actual_fill() {
    // The relay's simulation fills against the same quote table the order
    // was built from
    let (r, relay) = rig(fast_execution(), |rpc, quotes| {
        PaperRelay::accepting("enforcing")
            .with_ledger(rpc.clone())
            .with_fill_enforcement(quotes.clone())
    });

    // Build at a quote of 1000 with 10% slippage: minimum is exactly 900
    let order = r.builder.build(request(&r, 10.0, 1)).await.unwrap();
    assert_eq!(order.expected_out, 1000);
    assert_eq!(order.min_out, 900);

    // Fill moves to 899 before execution: simulation reverts, nothing is
    // submitted, the order fails
    r.quotes.set_rate(token(), 899.0);
    let failed = r.coordinator.execute(order).await;
    assert_eq!(failed.state, OrderState::Failed);
    assert_eq!(relay.submitted_count(), 0);
    assert!(failed.failure.unwrap().contains("below minimum"));
}

#[tokio::test]
async fn exact_boundary_fill_accepted_end_to_end() {
    // Same scenario with the fill landing at exactly the minimum: a quote
    // of 900 against a minimum of 900 is accepted
    let (r, relay) = rig(fast_execution(), |rpc, quotes| {
        PaperRelay::accepting("boundary")
            .with_ledger(rpc.clone())
            .with_fill_enforcement(quotes.clone())
    });

    let order = r.builder.build(request(&r, 10.0, 1)).await.unwrap();
    assert_eq!(order.min_out, 900);

    r.quotes.set_rate(token(), 900.0);
    let confirmed = r.coordinator.execute(order).await;
    assert_eq!(confirmed.state, OrderState::Confirmed);
    assert!(relay.submitted_count() > 0);
}

#[tokio::test]
async fn retry_budget_bounds_attempts_exactly() {
    // Relay acknowledges but nothing ever lands; two attempts, not three
    let (r, relay) = rig(fast_execution(), |_, _| PaperRelay::accepting("blackhole"));

    let rpc = r.rpc.clone();
    let ticker = tokio::spawn(async move {
        loop {
            rpc.advance_block();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let order = r.builder.build(request(&r, 10.0, 2)).await.unwrap();
    let failed = r.coordinator.execute(order).await;
    ticker.abort();

    assert_eq!(failed.state, OrderState::Failed);
    assert_eq!(failed.retries, 2);
    // One bundle submission per attempt (submission_blocks = 1)
    assert_eq!(relay.submitted_count(), 2);

    let failure = failed.failure.unwrap();
    assert!(failure.contains("after 2 attempts"), "{failure}");
    // Nonce consumption status is reported to the caller
    assert!(failure.contains("not included"), "{failure}");
}

#[tokio::test]
async fn concurrent_orders_never_share_a_sequence() {
    let quotes = Arc::new(PaperQuoteSource::new());
    quotes.set_rate(token(), 1000.0);
    let rpc = Arc::new(PaperRpc::with_quotes(quotes.clone()));
    let relay: Arc<dyn RelayEndpoint> = Arc::new(
        PaperRelay::accepting("ledger")
            .with_ledger(rpc.clone())
            .with_fill_enforcement(quotes.clone()),
    );

    let mut config = Config::default();
    config.execution = fast_execution();
    let engine = Arc::new(Engine::new(
        config,
        Mode::Simulation,
        quotes.clone(),
        Arc::new(PaperSafety::allow_all()),
        Arc::new(PaperFeeEstimator::default()),
        rpc.clone(),
        vec![relay],
    ));
    let account_id = engine.register_account(ManagedAccount::generate("concurrent"));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine
                .buy(token(), UNIT, account_id, TradeOptions::default())
                .await
                .unwrap()
        }));
    }

    let mut sequences = HashSet::new();
    for handle in handles {
        let order = handle.await.unwrap();
        assert_eq!(order.state, OrderState::Confirmed);
        let seq = order.sequence.unwrap();
        assert!(sequences.insert(seq), "duplicate sequence {seq}");
    }
    assert_eq!(sequences.len(), 10);
}

#[tokio::test]
async fn cancellation_guaranteed_before_submission() {
    let (r, relay) = rig(fast_execution(), |_, _| PaperRelay::accepting("idle"));

    let cancel = CancelHandle::new();
    cancel.cancel();

    let order = r.builder.build(request(&r, 10.0, 3)).await.unwrap();
    let result = r.coordinator.execute_cancellable(order, cancel).await;

    assert_eq!(result.state, OrderState::Failed);
    assert_eq!(relay.submitted_count(), 0);
    assert_eq!(r.rpc.broadcast_count(), 0);
    // The never-used sequence stays available
    assert_eq!(r.nonces.allocate(r.account_id).await.unwrap(), 0);
}
