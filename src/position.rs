//! Position model, exit triggers, and the position book
//!
//! A position is created when an auto-managed order confirms and lives
//! until its balance reaches zero. Trigger evaluation is pure and
//! synchronous here; the monitor drives it on a polling cadence and
//! executes the resulting exit orders.

use crate::types::{Asset, TxHash};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One rung of a take-profit ladder, as configured by the caller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitSpec {
    /// Unrealized gain, in percent, at which this rung fires
    pub gain_percent: f64,
    /// Fraction of the *current* balance to sell, in (0, 1]
    pub sell_fraction: f64,
}

/// Exit plan attached to an order request / managed position
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitPlan {
    pub take_profits: Vec<TakeProfitSpec>,
    /// Loss percent (positive number) forcing a full exit
    pub stop_loss_percent: Option<f64>,
    /// Drawdown percent from the high-water mark forcing a full exit
    pub trailing_stop_percent: Option<f64>,
}

impl ExitPlan {
    pub fn is_empty(&self) -> bool {
        self.take_profits.is_empty()
            && self.stop_loss_percent.is_none()
            && self.trailing_stop_percent.is_none()
    }
}

/// A take-profit rung installed on a live position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitTarget {
    pub gain_percent: f64,
    pub sell_fraction: f64,
    pub fired: bool,
    pub fired_at: Option<DateTime<Utc>>,
    pub exit_tx: Option<TxHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLoss {
    pub loss_percent: f64,
    pub fired: bool,
    pub fired_at: Option<DateTime<Utc>>,
    pub exit_tx: Option<TxHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStop {
    pub trail_percent: f64,
    /// Highest price seen since entry, updated every tick
    pub high_water_price: f64,
    pub fired: bool,
    pub fired_at: Option<DateTime<Utc>>,
    pub exit_tx: Option<TxHash>,
}

impl TrailingStop {
    /// Price level at which the stop fires, always derived from the
    /// current high-water mark
    pub fn trigger_level(&self) -> f64 {
        self.high_water_price * (1.0 - self.trail_percent / 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Open,
    Closed,
}

/// Which trigger fired during an evaluation tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerKind {
    StopLoss,
    TrailingStop,
    TakeProfit { index: usize },
}

/// A fired trigger and the exit it demands
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerFire {
    pub kind: TriggerKind,
    /// Fraction of the current balance to sell
    pub sell_fraction: f64,
}

/// A live position under management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub account_id: Uuid,
    pub asset: Asset,
    /// Source-asset amount spent at entry
    pub entry_amount_in: u128,
    /// Target-asset amount received at entry
    pub entry_amount_out: u128,
    /// Source units per target unit at entry
    pub entry_price: f64,
    pub entry_tx: Option<TxHash>,
    pub entry_block: Option<u64>,
    /// Current target-asset balance
    pub live_balance: u128,
    /// Current value of the balance in source-asset units
    pub live_valuation: u128,
    /// Unrealized P&L in source-asset units (valuation minus the cost
    /// basis of what is still held)
    pub unrealized_pnl: i128,
    pub unrealized_pnl_percent: f64,
    /// Realized P&L accumulated across exits, in source-asset units
    pub realized_pnl: i128,
    pub take_profits: Vec<TakeProfitTarget>,
    pub stop_loss: Option<StopLoss>,
    pub trailing_stop: Option<TrailingStop>,
    pub state: PositionState,
    pub tags: Vec<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn new(
        account_id: Uuid,
        asset: Asset,
        entry_amount_in: u128,
        entry_amount_out: u128,
        exit_plan: Option<&ExitPlan>,
    ) -> Self {
        let entry_price = if entry_amount_out > 0 {
            entry_amount_in as f64 / entry_amount_out as f64
        } else {
            0.0
        };

        let mut take_profits: Vec<TakeProfitTarget> = exit_plan
            .map(|plan| {
                plan.take_profits
                    .iter()
                    .map(|spec| TakeProfitTarget {
                        gain_percent: spec.gain_percent,
                        sell_fraction: spec.sell_fraction,
                        fired: false,
                        fired_at: None,
                        exit_tx: None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        // Evaluation order is ascending trigger percent
        take_profits.sort_by(|a, b| a.gain_percent.total_cmp(&b.gain_percent));

        let stop_loss = exit_plan.and_then(|p| p.stop_loss_percent).map(|pct| StopLoss {
            loss_percent: pct,
            fired: false,
            fired_at: None,
            exit_tx: None,
        });
        let trailing_stop =
            exit_plan
                .and_then(|p| p.trailing_stop_percent)
                .map(|pct| TrailingStop {
                    trail_percent: pct,
                    high_water_price: entry_price,
                    fired: false,
                    fired_at: None,
                    exit_tx: None,
                });

        Self {
            id: Uuid::new_v4(),
            account_id,
            asset,
            entry_amount_in,
            entry_amount_out,
            entry_price,
            entry_tx: None,
            entry_block: None,
            live_balance: entry_amount_out,
            live_valuation: entry_amount_in,
            unrealized_pnl: 0,
            unrealized_pnl_percent: 0.0,
            realized_pnl: 0,
            take_profits,
            stop_loss,
            trailing_stop,
            state: PositionState::Open,
            tags: Vec::new(),
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == PositionState::Open
    }

    /// Current price implied by the latest valuation
    pub fn current_price(&self) -> f64 {
        if self.live_balance == 0 {
            return 0.0;
        }
        self.live_valuation as f64 / self.live_balance as f64
    }

    /// Cost basis of the balance still held, in source-asset units
    fn remaining_cost_basis(&self) -> u128 {
        if self.entry_amount_out == 0 {
            return 0;
        }
        self.entry_amount_in * self.live_balance / self.entry_amount_out
    }

    /// Refresh balance and valuation, recompute P&L, and advance the
    /// trailing high-water mark. Runs every tick regardless of whether
    /// anything fires.
    pub fn update_valuation(&mut self, live_balance: u128, live_valuation: u128) {
        self.live_balance = live_balance;
        self.live_valuation = live_valuation;

        let basis = self.remaining_cost_basis();
        self.unrealized_pnl = live_valuation as i128 - basis as i128;
        self.unrealized_pnl_percent = if basis > 0 {
            (self.unrealized_pnl as f64 / basis as f64) * 100.0
        } else {
            0.0
        };

        let price = self.current_price();
        if let Some(ts) = self.trailing_stop.as_mut() {
            if price > ts.high_water_price {
                ts.high_water_price = price;
            }
        }
    }

    /// Evaluate exit triggers against the latest valuation.
    ///
    /// Priority order is fixed: stop-loss, trailing stop, take-profit
    /// targets ascending. Only the single highest-priority newly-triggered
    /// condition fires per call, and the fired flag is set immediately so
    /// a second evaluation with unchanged state fires nothing.
    pub fn evaluate_triggers(&mut self) -> Option<TriggerFire> {
        if !self.is_open() || self.live_balance == 0 {
            return None;
        }

        let pnl_percent = self.unrealized_pnl_percent;
        let price = self.current_price();

        if let Some(sl) = self.stop_loss.as_mut() {
            if !sl.fired && pnl_percent <= -sl.loss_percent {
                sl.fired = true;
                sl.fired_at = Some(Utc::now());
                return Some(TriggerFire {
                    kind: TriggerKind::StopLoss,
                    sell_fraction: 1.0,
                });
            }
        }

        if let Some(ts) = self.trailing_stop.as_mut() {
            if !ts.fired && price > 0.0 && price <= ts.trigger_level() {
                ts.fired = true;
                ts.fired_at = Some(Utc::now());
                return Some(TriggerFire {
                    kind: TriggerKind::TrailingStop,
                    sell_fraction: 1.0,
                });
            }
        }

        for (index, tp) in self.take_profits.iter_mut().enumerate() {
            if !tp.fired && pnl_percent >= tp.gain_percent {
                tp.fired = true;
                tp.fired_at = Some(Utc::now());
                return Some(TriggerFire {
                    kind: TriggerKind::TakeProfit { index },
                    sell_fraction: tp.sell_fraction,
                });
            }
        }

        None
    }

    /// Attach the exit transaction hash to the trigger that demanded it
    pub fn record_exit_tx(&mut self, kind: TriggerKind, tx: TxHash) {
        match kind {
            TriggerKind::StopLoss => {
                if let Some(sl) = self.stop_loss.as_mut() {
                    sl.exit_tx = Some(tx);
                }
            }
            TriggerKind::TrailingStop => {
                if let Some(ts) = self.trailing_stop.as_mut() {
                    ts.exit_tx = Some(tx);
                }
            }
            TriggerKind::TakeProfit { index } => {
                if let Some(tp) = self.take_profits.get_mut(index) {
                    tp.exit_tx = Some(tx);
                }
            }
        }
    }

    /// Account for a completed (partial or full) exit: reduce the balance,
    /// realize the P&L on the sold portion, and close at zero balance.
    pub fn apply_exit(&mut self, sold_amount: u128, proceeds: u128) {
        let sold = sold_amount.min(self.live_balance);
        let basis_sold = if self.entry_amount_out > 0 {
            self.entry_amount_in * sold / self.entry_amount_out
        } else {
            0
        };
        self.realized_pnl += proceeds as i128 - basis_sold as i128;
        self.live_balance -= sold;

        if self.live_balance == 0 {
            self.live_valuation = 0;
            self.unrealized_pnl = 0;
            self.unrealized_pnl_percent = 0.0;
            self.close();
        }
    }

    pub fn close(&mut self) {
        if self.state == PositionState::Open {
            self.state = PositionState::Closed;
            self.closed_at = Some(Utc::now());
        }
    }
}

/// Concurrent book of managed positions.
///
/// Each position sits behind its own async mutex: the monitor's
/// poll-evaluate-act cycle for one position is serialized against itself,
/// while distinct positions never contend.
pub struct PositionBook {
    positions: DashMap<Uuid, Arc<Mutex<Position>>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            positions: DashMap::new(),
        }
    }

    pub fn insert(&self, position: Position) -> Uuid {
        let id = position.id;
        self.positions.insert(id, Arc::new(Mutex::new(position)));
        id
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Mutex<Position>>> {
        self.positions.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Handles to every tracked position, for the monitor's sweep
    pub fn handles(&self) -> Vec<(Uuid, Arc<Mutex<Position>>)> {
        self.positions
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    pub async fn snapshot(&self, id: Uuid) -> Option<Position> {
        let handle = self.get(id)?;
        let position = handle.lock().await;
        Some(position.clone())
    }

    pub async fn snapshot_all(&self) -> Vec<Position> {
        let mut out = Vec::with_capacity(self.positions.len());
        for (_, handle) in self.handles() {
            out.push(handle.lock().await.clone());
        }
        out
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<Mutex<Position>>> {
        self.positions.remove(&id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}
