//! Engine facade
//!
//! Composes the builder, coordinator, and position lifecycle engine
//! behind the two-call public surface: `buy` and `sell`. Directives fall
//! back to configured defaults for anything they leave unset, and a
//! confirmed buy with `auto_manage` set becomes a managed position that
//! the monitor polls until it closes.

use crate::bundle::BundleProtection;
use crate::config::Config;
use crate::coordinator::{CancelHandle, SubmissionCoordinator};
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::interfaces::{FeeEstimator, QuoteSource, RelayEndpoint, RpcAccess, SafetyCheck};
use crate::monitor::PositionMonitor;
use crate::nonce::NonceRegistry;
use crate::order::{Order, OrderBuilder, OrderRequest, OrderState};
use crate::position::{ExitPlan, Position, PositionBook};
use crate::types::{Asset, FeeBounds, Mode, Side, Stats, SubmissionChannel, Urgency};
use crate::wallet::ManagedAccount;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// Per-trade options; anything unset falls back to the engine config
#[derive(Debug, Clone, Default)]
pub struct TradeOptions {
    pub slippage_percent: Option<f64>,
    pub deadline_secs: Option<u64>,
    pub channel: Option<SubmissionChannel>,
    pub retry_budget: Option<u32>,
    pub safety_check: Option<bool>,
    pub urgency: Option<Urgency>,
    /// Open a managed position when the (buy) order confirms
    pub auto_manage: bool,
    pub exit_plan: Option<ExitPlan>,
    pub tags: Vec<String>,
}

/// Amount selector for `sell`
#[derive(Debug, Clone, Copy)]
pub enum SellAmount {
    /// Exact amount in base units of the asset
    Exact(u128),
    /// Fraction of the account's current balance, in (0, 1]
    Fraction(f64),
}

pub struct Engine {
    mode: Mode,
    config: Arc<Config>,
    nonces: Arc<NonceRegistry>,
    builder: Arc<OrderBuilder>,
    coordinator: Arc<SubmissionCoordinator>,
    book: Arc<PositionBook>,
    monitor: Arc<PositionMonitor>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    events: EventBus,
    stats: Arc<RwLock<Stats>>,
    paused: AtomicBool,
    rpc: Arc<dyn RpcAccess>,
}

impl Engine {
    pub fn new(
        config: Config,
        mode: Mode,
        quotes: Arc<dyn QuoteSource>,
        safety: Arc<dyn SafetyCheck>,
        fees: Arc<dyn FeeEstimator>,
        rpc: Arc<dyn RpcAccess>,
        relays: Vec<Arc<dyn RelayEndpoint>>,
    ) -> Self {
        let config = Arc::new(config);
        let events = EventBus::default();
        let stats = Arc::new(RwLock::new(Stats::default()));
        let nonces = Arc::new(NonceRegistry::new(rpc.clone()));
        let builder = Arc::new(OrderBuilder::new(
            quotes.clone(),
            safety,
            fees,
            Duration::from_millis(config.execution.quote_timeout_ms),
        ));
        let protection = Arc::new(BundleProtection::new(
            relays,
            Duration::from_millis(config.execution.simulation_timeout_ms),
        ));
        let coordinator = Arc::new(SubmissionCoordinator::new(
            nonces.clone(),
            builder.clone(),
            protection,
            rpc.clone(),
            events.clone(),
            config.execution.clone(),
            config.trading.router,
        ));
        let book = Arc::new(PositionBook::new());
        let monitor = Arc::new(PositionMonitor::new(
            book.clone(),
            quotes,
            rpc.clone(),
            builder.clone(),
            coordinator.clone(),
            nonces.clone(),
            events.clone(),
            stats.clone(),
            config.clone(),
        ));

        Self {
            mode,
            config,
            nonces,
            builder,
            coordinator,
            book,
            monitor,
            monitor_handle: Mutex::new(None),
            events,
            stats,
            paused: AtomicBool::new(false),
            rpc,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Start the position lifecycle monitor. Idempotent.
    pub fn start(&self) {
        let mut handle = self.monitor_handle.lock();
        if handle.is_none() {
            info!(
                tick_ms = self.config.monitor.tick_interval_ms,
                "position monitor started"
            );
            *handle = Some(Arc::clone(&self.monitor).spawn());
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.monitor_handle.lock().take() {
            handle.abort();
            info!("position monitor stopped");
        }
    }

    pub fn register_account(&self, account: ManagedAccount) -> Uuid {
        self.nonces.register(account)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> Stats {
        self.stats.read().clone()
    }

    pub fn positions(&self) -> &Arc<PositionBook> {
        &self.book
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Buy `asset` spending `amount_in` of the native coin.
    ///
    /// Returns the order in its terminal state. `Err` is reserved for
    /// precondition failures (unsafe asset, no quote, invalid request);
    /// execution failures come back as a terminally `Failed` order.
    pub async fn buy(
        &self,
        asset: Asset,
        amount_in: u128,
        account_id: Uuid,
        options: TradeOptions,
    ) -> EngineResult<Order> {
        self.ensure_running()?;
        let request = self.compose_request(
            Side::Buy,
            Asset::Native,
            asset,
            amount_in,
            account_id,
            &options,
        );
        let order = self.builder.build(request).await?;
        self.stats.write().orders_created += 1;
        self.events.publish(Event::OrderCreated {
            order: order.clone(),
        });

        let executed = self.coordinator.execute(order).await;
        self.settle_buy(&executed, &options);
        Ok(executed)
    }

    /// Sell `asset` back into the native coin
    pub async fn sell(
        &self,
        asset: Asset,
        amount: SellAmount,
        account_id: Uuid,
        options: TradeOptions,
    ) -> EngineResult<Order> {
        self.ensure_running()?;

        let address = self.nonces.address(account_id)?;
        let balance = self.rpc.get_balance(address, asset).await?;
        let amount_in = match amount {
            SellAmount::Exact(amount) => amount.min(balance),
            SellAmount::Fraction(fraction) => {
                if !(0.0..=1.0).contains(&fraction) {
                    return Err(EngineError::InvalidRequest(format!(
                        "sell fraction {fraction} out of range (0, 1]"
                    )));
                }
                (balance as f64 * fraction) as u128
            }
        };
        if amount_in == 0 {
            return Err(EngineError::InvalidRequest(
                "nothing to sell: zero balance or zero amount".into(),
            ));
        }

        let mut request = self.compose_request(
            Side::Sell,
            asset,
            Asset::Native,
            amount_in,
            account_id,
            &options,
        );
        // Selling what we hold is never blocked by the safety oracle
        // unless the caller insists
        request.safety_check = options.safety_check.unwrap_or(false);

        let order = self.builder.build(request).await?;
        self.stats.write().orders_created += 1;
        self.events.publish(Event::OrderCreated {
            order: order.clone(),
        });

        let executed = self.coordinator.execute(order).await;
        self.settle_sell(&executed, asset, account_id, amount_in).await;
        Ok(executed)
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.is_paused() {
            return Err(EngineError::InvalidRequest("engine is paused".into()));
        }
        Ok(())
    }

    fn compose_request(
        &self,
        side: Side,
        source_asset: Asset,
        target_asset: Asset,
        amount_in: u128,
        account_id: Uuid,
        options: &TradeOptions,
    ) -> OrderRequest {
        let trading = &self.config.trading;
        let fees = &self.config.fees;
        let now = Utc::now();
        OrderRequest {
            side,
            source_asset,
            target_asset,
            amount_in,
            slippage_percent: options
                .slippage_percent
                .unwrap_or(trading.default_slippage_percent),
            deadline: now
                + chrono::Duration::seconds(
                    options
                        .deadline_secs
                        .unwrap_or(trading.default_deadline_secs) as i64,
                ),
            fee_bounds: FeeBounds {
                max_fee_per_gas: fees.max_fee_per_gas,
                max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
                gas_limit: fees.gas_limit,
            },
            account_id,
            channel: options.channel.unwrap_or(trading.default_channel),
            urgency: options.urgency.unwrap_or(Urgency::Normal),
            safety_check: options.safety_check.unwrap_or(trading.safety_check_buys),
            retry_budget: options
                .retry_budget
                .unwrap_or(self.config.execution.retry_budget),
            auto_manage: options.auto_manage,
            exit_plan: options.exit_plan.clone(),
            tags: options.tags.clone(),
            detected_at: now,
        }
    }

    /// Post-execution accounting for a buy: stats, and a managed position
    /// when requested
    fn settle_buy(&self, order: &Order, options: &TradeOptions) {
        match order.state {
            OrderState::Confirmed => {
                {
                    let mut stats = self.stats.write();
                    stats.orders_confirmed += 1;
                    stats.total_volume_in += order.request.amount_in;
                }
                if options.auto_manage {
                    let mut position = Position::new(
                        order.request.account_id,
                        order.request.target_asset,
                        order.request.amount_in,
                        order.expected_out,
                        options.exit_plan.as_ref(),
                    );
                    position.entry_tx = order.tx_hash;
                    position.entry_block = order.inclusion_block;
                    position.tags = options.tags.clone();
                    let position_id = self.book.insert(position.clone());
                    self.stats.write().positions_opened += 1;
                    info!(
                        position_id = %position_id,
                        asset = %position.asset,
                        "position opened"
                    );
                    self.events.publish(Event::PositionOpened { position });
                    self.start();
                }
            }
            _ => self.stats.write().orders_failed += 1,
        }
    }

    /// Post-execution accounting for a sell: stats, plus reconciling any
    /// managed position on the same (account, asset)
    async fn settle_sell(
        &self,
        order: &Order,
        asset: Asset,
        account_id: Uuid,
        sold_amount: u128,
    ) {
        match order.state {
            OrderState::Confirmed => {
                {
                    let mut stats = self.stats.write();
                    stats.orders_confirmed += 1;
                }
                for (_, handle) in self.book.handles() {
                    let mut position = handle.lock().await;
                    if position.is_open()
                        && position.asset == asset
                        && position.account_id == account_id
                    {
                        position.apply_exit(sold_amount, order.expected_out);
                        if position.is_open() {
                            self.events.publish(Event::PositionUpdated {
                                position: position.clone(),
                            });
                        } else {
                            self.stats.write().positions_closed += 1;
                            self.events.publish(Event::PositionClosed {
                                position: position.clone(),
                            });
                        }
                        break;
                    }
                }
            }
            _ => self.stats.write().orders_failed += 1,
        }
    }

    /// Execute a pre-built order with a caller-held cancellation handle
    pub async fn execute_with_cancel(
        &self,
        request: OrderRequest,
        cancel: CancelHandle,
    ) -> EngineResult<Order> {
        self.ensure_running()?;
        let order = self.builder.build(request).await?;
        self.stats.write().orders_created += 1;
        self.events.publish(Event::OrderCreated {
            order: order.clone(),
        });
        Ok(self.coordinator.execute_cancellable(order, cancel).await)
    }
}
