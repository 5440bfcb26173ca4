//! Position lifecycle engine
//!
//! One scheduler polls every open position on a fixed cadence. Each
//! position's poll-evaluate-act cycle runs under that position's own
//! mutex: a tick that finds the previous cycle still running (an exit
//! order in flight) skips the position instead of interleaving with it,
//! which is what keeps "at most one exit trade per tick" true. Positions
//! never lock against one another.

use crate::config::Config;
use crate::coordinator::SubmissionCoordinator;
use crate::error::EngineResult;
use crate::events::{Event, EventBus};
use crate::interfaces::{QuoteSource, RpcAccess};
use crate::nonce::NonceRegistry;
use crate::order::{OrderBuilder, OrderRequest, OrderState};
use crate::position::{Position, PositionBook, TriggerFire};
use crate::types::{Asset, FeeBounds, Side, Stats, Urgency};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct PositionMonitor {
    book: Arc<PositionBook>,
    quotes: Arc<dyn QuoteSource>,
    rpc: Arc<dyn RpcAccess>,
    builder: Arc<OrderBuilder>,
    coordinator: Arc<SubmissionCoordinator>,
    nonces: Arc<NonceRegistry>,
    events: EventBus,
    stats: Arc<RwLock<Stats>>,
    config: Arc<Config>,
}

impl PositionMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        book: Arc<PositionBook>,
        quotes: Arc<dyn QuoteSource>,
        rpc: Arc<dyn RpcAccess>,
        builder: Arc<OrderBuilder>,
        coordinator: Arc<SubmissionCoordinator>,
        nonces: Arc<NonceRegistry>,
        events: EventBus,
        stats: Arc<RwLock<Stats>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            book,
            quotes,
            rpc,
            builder,
            coordinator,
            nonces,
            events,
            stats,
            config,
        }
    }

    /// Start the polling loop. Runs until the handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                self.config.monitor.tick_interval_ms,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                Arc::clone(&self).tick().await;
            }
        })
    }

    /// One sweep over the book. Positions are polled concurrently with
    /// each other; a position still busy from the previous tick is
    /// skipped, never entered twice.
    pub async fn tick(self: Arc<Self>) {
        let mut tasks = Vec::new();
        for (_, handle) in self.book.handles() {
            let monitor = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                let Ok(mut position) = handle.try_lock() else {
                    return;
                };
                if !position.is_open() {
                    return;
                }
                if let Err(e) = monitor.poll_position(&mut position).await {
                    warn!(
                        position_id = %position.id,
                        error = %e,
                        "position poll failed"
                    );
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Refresh valuation, evaluate triggers, act on at most one
    async fn poll_position(&self, position: &mut Position) -> EngineResult<()> {
        let address = self.nonces.address(position.account_id)?;
        let balance = self.rpc.get_balance(address, position.asset).await?;

        let valuation = if balance == 0 {
            0
        } else {
            self.quotes
                .quote(&[position.asset, Asset::Native], balance)
                .await?
        };

        position.update_valuation(balance, valuation);
        debug!(
            position_id = %position.id,
            balance,
            valuation,
            pnl_percent = position.unrealized_pnl_percent,
            "position refreshed"
        );
        self.events.publish(Event::PositionUpdated {
            position: position.clone(),
        });

        if balance == 0 {
            self.close_position(position);
            return Ok(());
        }

        if let Some(fire) = position.evaluate_triggers() {
            info!(
                position_id = %position.id,
                trigger = ?fire.kind,
                sell_fraction = fire.sell_fraction,
                pnl_percent = position.unrealized_pnl_percent,
                "exit trigger fired"
            );
            self.execute_exit(position, fire).await?;
        }

        Ok(())
    }

    /// Build and execute the exit order a fired trigger demands
    async fn execute_exit(&self, position: &mut Position, fire: TriggerFire) -> EngineResult<()> {
        let sell_amount = if fire.sell_fraction >= 1.0 {
            position.live_balance
        } else {
            (position.live_balance as f64 * fire.sell_fraction) as u128
        };
        if sell_amount == 0 {
            return Ok(());
        }

        let request = OrderRequest {
            side: Side::Sell,
            source_asset: position.asset,
            target_asset: Asset::Native,
            amount_in: sell_amount,
            slippage_percent: self.config.monitor.exit_slippage_percent,
            deadline: Utc::now()
                + chrono::Duration::seconds(self.config.trading.default_deadline_secs as i64),
            fee_bounds: FeeBounds {
                max_fee_per_gas: self.config.fees.max_fee_per_gas,
                max_priority_fee_per_gas: self.config.fees.max_priority_fee_per_gas,
                gas_limit: self.config.fees.gas_limit,
            },
            account_id: position.account_id,
            channel: self.config.trading.default_channel,
            urgency: Urgency::High,
            // A position we already hold is exited regardless of what the
            // safety oracle thinks of the asset today
            safety_check: false,
            retry_budget: self.config.monitor.exit_retry_budget,
            auto_manage: false,
            exit_plan: None,
            tags: vec![format!("exit:{:?}", fire.kind)],
            detected_at: Utc::now(),
        };

        let order = self.builder.build(request).await?;
        self.events.publish(Event::OrderCreated {
            order: order.clone(),
        });

        let executed = self.coordinator.execute(order).await;
        match executed.state {
            OrderState::Confirmed => {
                if let Some(hash) = executed.tx_hash {
                    position.record_exit_tx(fire.kind, hash);
                }
                // Proceeds estimated at the confirming quote; the next
                // tick reconciles against the real ledger balance
                position.apply_exit(sell_amount, executed.expected_out);
                info!(
                    position_id = %position.id,
                    sold = sell_amount,
                    remaining = position.live_balance,
                    realized_pnl = position.realized_pnl,
                    "exit executed"
                );
                if position.is_open() {
                    self.events.publish(Event::PositionUpdated {
                        position: position.clone(),
                    });
                } else {
                    self.close_position(position);
                }
            }
            _ => {
                // The trigger stays consumed; operators see the failure
                // and can exit manually
                warn!(
                    position_id = %position.id,
                    trigger = ?fire.kind,
                    failure = executed.failure.as_deref().unwrap_or("unknown"),
                    "exit order failed terminally"
                );
            }
        }
        Ok(())
    }

    fn close_position(&self, position: &mut Position) {
        position.close();
        self.stats.write().positions_closed += 1;
        info!(
            position_id = %position.id,
            realized_pnl = position.realized_pnl,
            "position closed"
        );
        self.events.publish(Event::PositionClosed {
            position: position.clone(),
        });
    }
}
