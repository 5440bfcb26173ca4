//! End-to-end position lifecycle scenarios: a managed buy through the
//! bundle channel, the monitor polling live valuations, and trigger-driven
//! exits feeding back through the order pipeline.

use std::sync::Arc;
use std::time::Duration;

use volley::engine::TradeOptions;
use volley::interfaces::RelayEndpoint;
use volley::order::OrderState;
use volley::paper::{
    PaperFeeEstimator, PaperQuoteSource, PaperRelay, PaperRpc, PaperSafety, UNIT,
};
use volley::position::{ExitPlan, TakeProfitSpec};
use volley::wallet::ManagedAccount;
use volley::{Address, Asset, Config, Engine, Mode};

fn token() -> Asset {
    Asset::Token(Address([0xaa; 20]))
}

struct Sim {
    engine: Arc<Engine>,
    quotes: Arc<PaperQuoteSource>,
    account_id: uuid::Uuid,
}

/// Engine over the paper stack with a fast monitor cadence
fn sim() -> Sim {
    let quotes = Arc::new(PaperQuoteSource::new());
    quotes.set_rate(token(), 1000.0);
    let rpc = Arc::new(PaperRpc::with_quotes(quotes.clone()));
    let relay: Arc<dyn RelayEndpoint> = Arc::new(
        PaperRelay::accepting("paper")
            .with_ledger(rpc.clone())
            .with_fill_enforcement(quotes.clone()),
    );

    let mut config = Config::default();
    config.execution.inclusion_poll_ms = 10;
    config.execution.backoff_base_ms = 1;
    config.execution.submission_blocks = 1;
    config.monitor.tick_interval_ms = 20;

    let engine = Arc::new(Engine::new(
        config,
        Mode::Simulation,
        quotes.clone(),
        Arc::new(PaperSafety::allow_all()),
        Arc::new(PaperFeeEstimator::default()),
        rpc,
        vec![relay],
    ));
    let account_id = engine.register_account(ManagedAccount::generate("lifecycle"));
    Sim {
        engine,
        quotes,
        account_id,
    }
}

/// Poll the (single) managed position until the predicate holds
async fn wait_for_position<F>(engine: &Engine, timeout_ms: u64, what: &str, predicate: F)
where
    F: Fn(&volley::Position) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let positions = engine.positions().snapshot_all().await;
        if positions.first().map(&predicate).unwrap_or(false) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn take_profit_ladder_partial_then_full_exit() {
    let s = sim();

    let order = s
        .engine
        .buy(
            token(),
            UNIT,
            s.account_id,
            TradeOptions {
                auto_manage: true,
                exit_plan: Some(ExitPlan {
                    take_profits: vec![
                        TakeProfitSpec {
                            gain_percent: 50.0,
                            sell_fraction: 0.5,
                        },
                        TakeProfitSpec {
                            gain_percent: 100.0,
                            sell_fraction: 1.0,
                        },
                    ],
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(order.state, OrderState::Confirmed);

    // +60% crosses only the first rung: half the balance is sold, the
    // position stays open
    s.quotes.set_rate(token(), 625.0);
    wait_for_position(&s.engine, 3_000, "first ladder rung to fire", |p| {
        p.live_balance == 500
    })
    .await;
    let snapshot = s.engine.positions().snapshot_all().await.remove(0);
    assert!(snapshot.is_open());
    assert!(snapshot.take_profits[0].fired);
    assert!(!snapshot.take_profits[1].fired);
    assert!(snapshot.realized_pnl > 0);

    // The remaining half doubles: second rung exits in full, closing the
    // position
    s.quotes.set_rate(token(), 450.0);
    wait_for_position(
        &s.engine,
        3_000,
        "second ladder rung to close the position",
        |p| !p.is_open(),
    )
    .await;
    let snapshot = s.engine.positions().snapshot_all().await.remove(0);
    assert_eq!(snapshot.live_balance, 0);
    assert!(snapshot.take_profits[1].fired);
    assert!(snapshot.take_profits[1].exit_tx.is_some());

    s.engine.shutdown();
    assert_eq!(s.engine.stats().positions_closed, 1);
}

#[tokio::test]
async fn stop_loss_wins_over_take_profit_and_closes() {
    let s = sim();

    let order = s
        .engine
        .buy(
            token(),
            UNIT,
            s.account_id,
            TradeOptions {
                auto_manage: true,
                exit_plan: Some(ExitPlan {
                    take_profits: vec![TakeProfitSpec {
                        // Deliberately breached the moment the stop-loss
                        // is: priority must pick the stop-loss
                        gain_percent: -50.0,
                        sell_fraction: 0.5,
                    }],
                    stop_loss_percent: Some(10.0),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(order.state, OrderState::Confirmed);

    // -20%: both conditions hold in the same tick
    s.quotes.set_rate(token(), 1250.0);
    wait_for_position(&s.engine, 3_000, "stop-loss to close the position", |p| {
        !p.is_open()
    })
    .await;
    s.engine.shutdown();

    let snapshot = s.engine.positions().snapshot_all().await.remove(0);
    assert!(snapshot.stop_loss.as_ref().unwrap().fired);
    // The take-profit never fired: the stop-loss exit ran alone
    assert!(!snapshot.take_profits[0].fired);
    assert!(snapshot.realized_pnl < 0);
}

#[tokio::test]
async fn trailing_stop_follows_peak_then_exits() {
    let s = sim();

    let order = s
        .engine
        .buy(
            token(),
            UNIT,
            s.account_id,
            TradeOptions {
                auto_manage: true,
                exit_plan: Some(ExitPlan {
                    trailing_stop_percent: Some(10.0),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(order.state, OrderState::Confirmed);

    // Run up to +100%; the high-water mark follows, nothing fires
    s.quotes.set_rate(token(), 500.0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    {
        let positions = s.engine.positions().snapshot_all().await;
        assert!(positions[0].is_open());
        assert!(positions[0].trailing_stop.as_ref().unwrap().high_water_price > 0.0);
    }

    // 15% drawdown from the peak breaches the 10% trail: full exit, and
    // the position still closes in profit
    s.quotes.set_rate(token(), 588.0);
    wait_for_position(
        &s.engine,
        3_000,
        "trailing stop to close the position",
        |p| !p.is_open(),
    )
    .await;
    s.engine.shutdown();

    let snapshot = s.engine.positions().snapshot_all().await.remove(0);
    assert!(snapshot.trailing_stop.as_ref().unwrap().fired);
    assert!(snapshot.realized_pnl > 0);
}

#[tokio::test]
async fn unmanaged_position_reports_unrealized_only() {
    let s = sim();

    let order = s
        .engine
        .buy(
            token(),
            UNIT,
            s.account_id,
            TradeOptions {
                auto_manage: true,
                exit_plan: None,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(order.state, OrderState::Confirmed);

    // Big move in both directions; with no exits configured the position
    // just tracks unrealized P&L
    s.quotes.set_rate(token(), 400.0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    {
        let positions = s.engine.positions().snapshot_all().await;
        assert!(positions[0].is_open());
        assert!(positions[0].unrealized_pnl > 0);
        assert_eq!(positions[0].realized_pnl, 0);
    }

    s.quotes.set_rate(token(), 4_000.0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let positions = s.engine.positions().snapshot_all().await;
    assert!(positions[0].is_open());
    assert!(positions[0].unrealized_pnl < 0);
    assert_eq!(positions[0].realized_pnl, 0);

    s.engine.shutdown();
}
