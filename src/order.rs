//! Order model and order builder
//!
//! The builder turns a trade directive into a concrete, executable order:
//! it runs the safety precondition, prices the trade through the quote
//! source, derives the minimum accepted output from the slippage tolerance,
//! and clamps the fee estimator's advice to the directive's hard bounds.
//! It has no side effects; nothing touches the network for real until the
//! coordinator executes the built order.

use crate::bundle::SimulationResult;
use crate::error::{EngineError, EngineResult};
use crate::interfaces::{FeeEstimator, QuoteSource, SafetyCheck};
use crate::position::ExitPlan;
use crate::types::{Asset, FeeBounds, Side, SubmissionChannel, TxHash, Urgency};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Order lifecycle state.
///
/// `Failed` re-enters `Executing` on retry while budget remains; `Confirmed`
/// and budget-exhausted `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Executing,
    Confirmed,
    Failed,
}

/// A trade directive as supplied by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub side: Side,
    pub source_asset: Asset,
    pub target_asset: Asset,
    /// Input amount in base units of the source asset
    pub amount_in: u128,
    /// Slippage tolerance in percent, 0..=100
    pub slippage_percent: f64,
    /// Absolute deadline; the order fails terminally once passed
    pub deadline: DateTime<Utc>,
    pub fee_bounds: FeeBounds,
    pub account_id: Uuid,
    pub channel: SubmissionChannel,
    pub urgency: Urgency,
    /// Run the asset safety precondition before building
    pub safety_check: bool,
    pub retry_budget: u32,
    /// Open a managed position once the order confirms
    pub auto_manage: bool,
    /// Exit plan attached to the managed position
    pub exit_plan: Option<ExitPlan>,
    pub tags: Vec<String>,
    /// When the opportunity was first detected, for latency accounting
    pub detected_at: DateTime<Utc>,
}

impl OrderRequest {
    pub fn validate(&self) -> EngineResult<()> {
        if self.amount_in == 0 {
            return Err(EngineError::InvalidRequest("amount_in is zero".into()));
        }
        if !(0.0..=100.0).contains(&self.slippage_percent) {
            return Err(EngineError::InvalidRequest(format!(
                "slippage {} out of range [0, 100]",
                self.slippage_percent
            )));
        }
        if self.source_asset == self.target_asset {
            return Err(EngineError::InvalidRequest(
                "source and target asset are identical".into(),
            ));
        }
        if self.retry_budget == 0 {
            return Err(EngineError::InvalidRequest("retry_budget is zero".into()));
        }
        if self.deadline <= Utc::now() {
            return Err(EngineError::InvalidRequest("deadline already passed".into()));
        }
        Ok(())
    }

    /// Quote path for this directive
    pub fn path(&self) -> [Asset; 2] {
        [self.source_asset, self.target_asset]
    }
}

/// A priced, executable order derived from an [`OrderRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub request: OrderRequest,
    pub state: OrderState,
    /// Output expected at the latest quote
    pub expected_out: u128,
    /// Minimum output accepted at execution, after slippage
    pub min_out: u128,
    /// Fees actually used for signing: estimator advice clamped to bounds
    pub fees: FeeBounds,
    pub sequence: Option<u64>,
    pub channel_used: Option<SubmissionChannel>,
    pub tx_hash: Option<TxHash>,
    pub inclusion_block: Option<u64>,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Structured reason attached on terminal failure
    pub failure: Option<String>,
    /// Last bundle simulation, kept for the audit trail
    pub simulation: Option<SimulationResult>,
}

impl Order {
    fn new(request: OrderRequest, expected_out: u128, min_out: u128, fees: FeeBounds) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            state: OrderState::Pending,
            expected_out,
            min_out,
            fees,
            sequence: None,
            channel_used: None,
            tx_hash: None,
            inclusion_block: None,
            retries: 0,
            created_at: Utc::now(),
            submitted_at: None,
            confirmed_at: None,
            failure: None,
            simulation: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, OrderState::Confirmed)
            || (matches!(self.state, OrderState::Failed)
                && self.retries >= self.request.retry_budget)
    }

    /// Detected-to-confirmed latency, available once confirmed
    pub fn latency(&self) -> Option<chrono::Duration> {
        self.confirmed_at
            .map(|confirmed| confirmed - self.request.detected_at)
    }

    pub(crate) fn mark_executing(&mut self) {
        if !self.is_terminal() {
            self.state = OrderState::Executing;
        }
    }

    pub(crate) fn mark_confirmed(&mut self, block: u64) {
        if self.is_terminal() {
            return;
        }
        self.state = OrderState::Confirmed;
        self.inclusion_block = Some(block);
        self.confirmed_at = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&mut self, reason: &EngineError) {
        if self.is_terminal() {
            return;
        }
        self.state = OrderState::Failed;
        self.failure = Some(reason.to_string());
    }
}

/// Minimum accepted output for a quote under a slippage tolerance:
/// `floor(expected * (1 - slippage/100))`, floored at zero.
///
/// Integer math in basis points so large u128 amounts never round through
/// an f64 mantissa.
pub fn min_out_for(expected_out: u128, slippage_percent: f64) -> u128 {
    let bps = (slippage_percent.clamp(0.0, 100.0) * 100.0).round() as u128;
    expected_out.saturating_mul(10_000 - bps.min(10_000)) / 10_000
}

/// Turns trade directives into executable orders
pub struct OrderBuilder {
    quotes: Arc<dyn QuoteSource>,
    safety: Arc<dyn SafetyCheck>,
    fees: Arc<dyn FeeEstimator>,
    quote_timeout: Duration,
}

impl OrderBuilder {
    pub fn new(
        quotes: Arc<dyn QuoteSource>,
        safety: Arc<dyn SafetyCheck>,
        fees: Arc<dyn FeeEstimator>,
        quote_timeout: Duration,
    ) -> Self {
        Self {
            quotes,
            safety,
            fees,
            quote_timeout,
        }
    }

    /// Build an executable order from a directive.
    ///
    /// Signals `UnsafeAsset` on a negative safety verdict (hard
    /// precondition, never retried) and `QuoteUnavailable` when no path
    /// yields a quote.
    pub async fn build(&self, request: OrderRequest) -> EngineResult<Order> {
        request.validate()?;

        if request.safety_check {
            self.assert_safe(&request).await?;
        }

        let expected_out = self.fresh_quote(&request).await?;
        let min_out = min_out_for(expected_out, request.slippage_percent);
        let fees = self.clamped_fees(&request).await;

        debug!(
            account_id = %request.account_id,
            target = %request.target_asset,
            amount_in = request.amount_in,
            expected_out,
            min_out,
            "order built"
        );

        Ok(Order::new(request, expected_out, min_out, fees))
    }

    /// Re-run the safety precondition; used by the coordinator when
    /// `recheck_safety_on_retry` is enabled
    pub async fn assert_safe(&self, request: &OrderRequest) -> EngineResult<()> {
        let verdict = self.safety.check(request.target_asset).await?;
        if !verdict.safe {
            return Err(EngineError::UnsafeAsset {
                asset: request.target_asset,
                reason: verdict
                    .reason
                    .unwrap_or_else(|| "no reason given".to_string()),
            });
        }
        Ok(())
    }

    /// Read-only quote with the configured timeout
    pub async fn fresh_quote(&self, request: &OrderRequest) -> EngineResult<u128> {
        let path = request.path();
        let quoted = tokio::time::timeout(
            self.quote_timeout,
            self.quotes.quote(&path, request.amount_in),
        )
        .await
        .map_err(|_| EngineError::Timeout("quote"))??;

        if quoted == 0 {
            return Err(EngineError::QuoteUnavailable(format!(
                "zero output quoted for path {} -> {}",
                request.source_asset, request.target_asset
            )));
        }
        Ok(quoted)
    }

    /// Re-price an order for a retry attempt: fresh expected output and a
    /// recomputed minimum, amounts may have moved since the last attempt
    pub async fn reprice(&self, order: &mut Order) -> EngineResult<()> {
        let expected_out = self.fresh_quote(&order.request).await?;
        order.expected_out = expected_out;
        order.min_out = min_out_for(expected_out, order.request.slippage_percent);
        Ok(())
    }

    /// Fee estimator advice clamped to the directive's hard bounds. The
    /// estimator is advisory and may be unavailable; the bounds always win.
    async fn clamped_fees(&self, request: &OrderRequest) -> FeeBounds {
        let bounds = request.fee_bounds;
        match self.fees.estimate(request.urgency).await {
            Ok(estimate) => FeeBounds {
                max_fee_per_gas: estimate.max_fee.min(bounds.max_fee_per_gas),
                max_priority_fee_per_gas: estimate
                    .priority_fee
                    .min(bounds.max_priority_fee_per_gas),
                gas_limit: bounds.gas_limit,
            },
            Err(e) => {
                warn!(error = %e, "fee estimator unavailable, using hard bounds");
                bounds
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperFeeEstimator, PaperQuoteSource, PaperSafety};
    use crate::types::Address;

    fn token() -> Asset {
        Asset::Token(Address([0x11; 20]))
    }

    fn request(slippage: f64) -> OrderRequest {
        OrderRequest {
            side: Side::Buy,
            source_asset: Asset::Native,
            target_asset: token(),
            amount_in: 1_000_000_000_000_000_000, // 1.0 unit
            slippage_percent: slippage,
            deadline: Utc::now() + chrono::Duration::seconds(60),
            fee_bounds: FeeBounds {
                max_fee_per_gas: 100_000_000_000,
                max_priority_fee_per_gas: 2_000_000_000,
                gas_limit: 300_000,
            },
            account_id: Uuid::new_v4(),
            channel: SubmissionChannel::Bundle,
            urgency: Urgency::Normal,
            safety_check: true,
            retry_budget: 3,
            auto_manage: false,
            exit_plan: None,
            tags: vec![],
            detected_at: Utc::now(),
        }
    }

    fn builder(quotes: Arc<PaperQuoteSource>, safety: Arc<PaperSafety>) -> OrderBuilder {
        OrderBuilder::new(
            quotes,
            safety,
            Arc::new(PaperFeeEstimator::default()),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_min_out_basic() {
        // 1000 tokens at 10% slippage -> 900 minimum
        assert_eq!(min_out_for(1000, 10.0), 900);
        assert_eq!(min_out_for(1000, 0.0), 1000);
        assert_eq!(min_out_for(1000, 100.0), 0);
    }

    #[test]
    fn test_min_out_floors_fractions() {
        // 999 * 0.9 = 899.1 -> floored to 899
        assert_eq!(min_out_for(999, 10.0), 899);
    }

    #[tokio::test]
    async fn test_build_prices_order() {
        let quotes = Arc::new(PaperQuoteSource::new());
        quotes.set_rate(token(), 1000.0);
        let builder = builder(quotes, Arc::new(PaperSafety::allow_all()));

        let order = builder.build(request(10.0)).await.unwrap();
        assert_eq!(order.state, OrderState::Pending);
        assert_eq!(order.expected_out, 1000 * order.request.amount_in / 1_000_000_000_000_000_000);
        assert_eq!(order.min_out, min_out_for(order.expected_out, 10.0));
    }

    #[tokio::test]
    async fn test_unsafe_asset_aborts_build() {
        let quotes = Arc::new(PaperQuoteSource::new());
        quotes.set_rate(token(), 1000.0);
        let safety = Arc::new(PaperSafety::allow_all());
        safety.deny(token(), "liquidity not locked");
        let builder = builder(quotes, safety);

        let err = builder.build(request(1.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::UnsafeAsset { .. }));
        assert!(err.is_precondition());
    }

    #[tokio::test]
    async fn test_missing_quote_is_precondition() {
        // No rate configured for the token
        let builder = builder(
            Arc::new(PaperQuoteSource::new()),
            Arc::new(PaperSafety::allow_all()),
        );

        let err = builder.build(request(1.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::QuoteUnavailable(_)));
    }

    #[tokio::test]
    async fn test_fee_advice_clamped_to_bounds() {
        let quotes = Arc::new(PaperQuoteSource::new());
        quotes.set_rate(token(), 1000.0);
        // Estimator advises far above the directive's cap
        let fees = Arc::new(PaperFeeEstimator::with_estimate(crate::types::FeeEstimate {
            base_fee: 50_000_000_000,
            priority_fee: 90_000_000_000,
            max_fee: 900_000_000_000,
        }));
        let builder = OrderBuilder::new(
            quotes,
            Arc::new(PaperSafety::allow_all()),
            fees,
            Duration::from_millis(500),
        );

        let req = request(1.0);
        let order = builder.build(req.clone()).await.unwrap();
        assert_eq!(order.fees.max_fee_per_gas, req.fee_bounds.max_fee_per_gas);
        assert_eq!(
            order.fees.max_priority_fee_per_gas,
            req.fee_bounds.max_priority_fee_per_gas
        );
    }

    #[tokio::test]
    async fn test_validation_rejects_zero_amount() {
        let builder = builder(
            Arc::new(PaperQuoteSource::new()),
            Arc::new(PaperSafety::allow_all()),
        );
        let mut req = request(1.0);
        req.amount_in = 0;
        assert!(matches!(
            builder.build(req).await,
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_rejects_past_deadline() {
        let builder = builder(
            Arc::new(PaperQuoteSource::new()),
            Arc::new(PaperSafety::allow_all()),
        );
        let mut req = request(1.0);
        req.deadline = Utc::now() - chrono::Duration::seconds(1);
        assert!(matches!(
            builder.build(req).await,
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_order_terminal_states_absorb() {
        let req = request(1.0);
        let budget = req.retry_budget;
        let mut order = Order::new(req, 1000, 900, FeeBounds {
            max_fee_per_gas: 1,
            max_priority_fee_per_gas: 1,
            gas_limit: 21_000,
        });

        order.mark_confirmed(42);
        assert_eq!(order.state, OrderState::Confirmed);

        // Confirmed never transitions out
        order.mark_failed(&EngineError::Cancelled);
        assert_eq!(order.state, OrderState::Confirmed);

        let mut failed = Order::new(request(1.0), 1000, 900, FeeBounds {
            max_fee_per_gas: 1,
            max_priority_fee_per_gas: 1,
            gas_limit: 21_000,
        });
        failed.retries = budget;
        failed.mark_failed(&EngineError::NotIncluded {
            nonce_consumed: false,
        });
        assert!(failed.is_terminal());
        failed.mark_confirmed(43);
        assert_eq!(failed.state, OrderState::Failed);
    }
}

#[cfg(test)]
mod slippage_properties {
    use super::min_out_for;
    use proptest::prelude::*;

    proptest! {
        /// min_out = floor(Q * (1 - s/100)) for s in [0, 100], never
        /// exceeding the quote and hitting the exact endpoints
        #[test]
        fn min_out_matches_formula(
            expected in 0u128..=u64::MAX as u128,
            slippage in 0.0f64..=100.0,
        ) {
            let out = min_out_for(expected, slippage);
            prop_assert!(out <= expected);

            let bps = (slippage * 100.0).round() as u128;
            let reference = expected * (10_000 - bps) / 10_000;
            prop_assert_eq!(out, reference);
        }

        #[test]
        fn zero_slippage_is_identity(expected in 0u128..=u64::MAX as u128) {
            prop_assert_eq!(min_out_for(expected, 0.0), expected);
        }

        #[test]
        fn full_slippage_floors_at_zero(expected in 0u128..=u64::MAX as u128) {
            prop_assert_eq!(min_out_for(expected, 100.0), 0);
        }
    }
}
