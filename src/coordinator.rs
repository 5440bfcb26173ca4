//! Submission coordinator
//!
//! Drives a built order through sign -> wrap -> simulate -> submit ->
//! inclusion polling, retrying with a fresh quote while budget remains.
//! The replace-by-fee rule lives here: after a non-inclusion the account's
//! on-ledger sequence is re-queried before deciding whether to reuse the
//! assigned nonce (unconsumed: same nonce, bumped priority fee) or
//! allocate a fresh one (consumed by something that was not our
//! transaction). Exhausting the budget is terminal and reported with the
//! last known nonce-consumption status, never silently dropped.

use crate::bundle::{BundleProtection, SignedTransaction, SwapCall};
use crate::config::ExecutionConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::interfaces::RpcAccess;
use crate::nonce::NonceRegistry;
use crate::order::{Order, OrderBuilder};
use crate::types::{Address, Asset, SubmissionChannel};
use crate::wallet::ManagedAccount;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Cooperative cancellation handle for an in-flight order.
///
/// Cancellation is guaranteed to take effect before the first submission
/// acknowledgment; afterwards it degrades to a best-effort replacement
/// transaction on the same sequence number.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Exponential backoff with jitter between retry attempts
struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
}

impl ExponentialBackoff {
    fn new(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let clamped = exp.min(self.max_ms);
        // +/-10% jitter so synchronized retries spread out
        let jitter = (clamped / 10).max(1);
        let offset = fastrand::u64(0..=jitter * 2);
        Duration::from_millis(clamped.saturating_sub(jitter).saturating_add(offset))
    }
}

/// Drives orders to a terminal state
pub struct SubmissionCoordinator {
    nonces: Arc<NonceRegistry>,
    builder: Arc<OrderBuilder>,
    protection: Arc<BundleProtection>,
    rpc: Arc<dyn RpcAccess>,
    events: EventBus,
    config: ExecutionConfig,
    /// Execution venue all swap transactions target
    router: Address,
}

impl SubmissionCoordinator {
    pub fn new(
        nonces: Arc<NonceRegistry>,
        builder: Arc<OrderBuilder>,
        protection: Arc<BundleProtection>,
        rpc: Arc<dyn RpcAccess>,
        events: EventBus,
        config: ExecutionConfig,
        router: Address,
    ) -> Self {
        Self {
            nonces,
            builder,
            protection,
            rpc,
            events,
            config,
            router,
        }
    }

    /// Execute an order to a terminal state. The returned order is either
    /// `Confirmed` or terminally `Failed` with a structured reason.
    pub async fn execute(&self, order: Order) -> Order {
        self.execute_cancellable(order, CancelHandle::new()).await
    }

    pub async fn execute_cancellable(&self, mut order: Order, cancel: CancelHandle) -> Order {
        let account = match self.nonces.account(order.request.account_id) {
            Ok(account) => account,
            Err(e) => return self.finish_failed(order, e),
        };

        let backoff =
            ExponentialBackoff::new(self.config.backoff_base_ms, self.config.backoff_max_ms);
        let budget = order.request.retry_budget;
        let mut assigned_nonce: Option<u64> = None;
        let mut nonce_consumed: Option<bool> = None;
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=budget {
            order.mark_executing();

            match self
                .attempt(&mut order, &account, &mut assigned_nonce, &cancel, attempt)
                .await
            {
                Ok(block) => {
                    order.mark_confirmed(block);
                    info!(
                        order_id = %order.id,
                        block,
                        attempt,
                        latency_ms = order.latency().map(|l| l.num_milliseconds()).unwrap_or(-1),
                        "order confirmed"
                    );
                    self.events.publish(Event::OrderConfirmed {
                        order: order.clone(),
                    });
                    return order;
                }
                Err(e) => {
                    order.retries = attempt;
                    match &e {
                        EngineError::NotIncluded {
                            nonce_consumed: consumed,
                        } => nonce_consumed = Some(*consumed),
                        EngineError::Reverted(_) => nonce_consumed = Some(true),
                        _ => {}
                    }

                    warn!(
                        order_id = %order.id,
                        attempt,
                        category = e.category(),
                        error = %e,
                        "order attempt failed"
                    );

                    if !e.is_retryable() {
                        return self.finish_failed(order, e);
                    }
                    last_error = e.to_string();
                    order.mark_failed(&e);

                    if attempt < budget {
                        sleep(backoff.delay(attempt)).await;
                    }
                }
            }
        }

        // Budget exhausted: release the sequence if we know it is unused
        if let (Some(seq), Some(false)) = (assigned_nonce, nonce_consumed) {
            let _ = self
                .nonces
                .release(order.request.account_id, seq)
                .await;
        }

        let err = EngineError::RetriesExhausted {
            attempts: budget,
            last_error,
            nonce_consumed,
        };
        self.finish_failed(order, err)
    }

    fn finish_failed(&self, mut order: Order, error: EngineError) -> Order {
        // Force terminality even when budget was not the limiting factor,
        // and let the terminal reason replace any per-attempt reason.
        // Confirmed stays absorbing.
        if order.state != crate::order::OrderState::Confirmed {
            order.retries = order.retries.max(order.request.retry_budget);
            order.state = crate::order::OrderState::Failed;
            order.failure = Some(error.to_string());
        }
        self.events.publish(Event::OrderFailed {
            order: order.clone(),
        });
        order
    }

    /// One full attempt: price, nonce, sign, dispatch, await inclusion.
    /// Returns the inclusion block on success.
    async fn attempt(
        &self,
        order: &mut Order,
        account: &Arc<ManagedAccount>,
        assigned_nonce: &mut Option<u64>,
        cancel: &CancelHandle,
        attempt: u32,
    ) -> EngineResult<u64> {
        if Utc::now() >= order.request.deadline {
            return Err(EngineError::DeadlineExceeded);
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        if attempt > 1 {
            if self.config.recheck_safety_on_retry && order.request.safety_check {
                self.builder.assert_safe(&order.request).await?;
            }
            // Amounts may have moved since the last attempt
            self.builder.reprice(order).await?;
        }

        // Before touching the nonce: did the previous attempt's
        // transaction land after we gave up on it?
        if let Some(block) = self.check_late_inclusion(order).await? {
            return Ok(block);
        }

        let sequence = self
            .resolve_sequence(order, assigned_nonce, attempt)
            .await?;
        order.sequence = Some(sequence);

        let tx = self.sign_order(order, account, sequence)?;
        order.tx_hash = Some(tx.hash);

        // Last guaranteed cancellation point: nothing is on the wire yet
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let target_block = self.rpc.get_block_number().await? + 1;
        let channel = self.dispatch(order, &tx, target_block).await?;
        order.channel_used = Some(channel);
        order.submitted_at = Some(Utc::now());
        debug!(order_id = %order.id, tx_hash = %tx.hash, channel = ?channel, "order submitted");
        self.events.publish(Event::OrderSubmitted {
            order: order.clone(),
        });

        self.await_inclusion(order, &tx, target_block, cancel).await
    }

    /// Pick the sequence number for this attempt per replace-by-fee rules
    async fn resolve_sequence(
        &self,
        order: &mut Order,
        assigned_nonce: &mut Option<u64>,
        attempt: u32,
    ) -> EngineResult<u64> {
        let account_id = order.request.account_id;
        match *assigned_nonce {
            None => {
                let seq = self.nonces.allocate(account_id).await?;
                *assigned_nonce = Some(seq);
                Ok(seq)
            }
            Some(prev) => {
                let observed = self.nonces.observed_sequence(account_id).await?;
                if observed > prev {
                    // Slot is gone; a fresh allocation absorbs the gap
                    let seq = self.nonces.allocate(account_id).await?;
                    debug!(
                        order_id = %order.id,
                        previous = prev,
                        fresh = seq,
                        "nonce consumed externally, reallocated"
                    );
                    *assigned_nonce = Some(seq);
                    Ok(seq)
                } else {
                    // Unconsumed: reuse with a bumped priority fee
                    self.escalate_fees(order, attempt);
                    Ok(prev)
                }
            }
        }
    }

    /// If our own transaction landed after we gave up on it, confirm
    /// instead of re-submitting
    async fn check_late_inclusion(&self, order: &Order) -> EngineResult<Option<u64>> {
        let Some(hash) = order.tx_hash else {
            return Ok(None);
        };
        match self.rpc.get_transaction(hash).await? {
            Some(info) if info.success => Ok(Some(info.block_number)),
            _ => Ok(None),
        }
    }

    fn escalate_fees(&self, order: &mut Order, attempt: u32) {
        if attempt <= 1 {
            return;
        }
        let pct = self.config.fee_escalation_percent as u128;
        let bounds = order.request.fee_bounds;
        order.fees.max_priority_fee_per_gas = (order.fees.max_priority_fee_per_gas * pct
            / 100)
            .min(bounds.max_priority_fee_per_gas)
            .max(1);
        order.fees.max_fee_per_gas =
            (order.fees.max_fee_per_gas * pct / 100).min(bounds.max_fee_per_gas);
    }

    fn sign_order(
        &self,
        order: &Order,
        account: &Arc<ManagedAccount>,
        sequence: u64,
    ) -> EngineResult<SignedTransaction> {
        let swap = SwapCall {
            path: order.request.path().to_vec(),
            amount_in: order.request.amount_in,
            min_out: order.min_out,
            deadline_unix: order.request.deadline.timestamp(),
        };
        let value = match order.request.source_asset {
            Asset::Native => order.request.amount_in,
            Asset::Token(_) => 0,
        };
        SignedTransaction::sign(
            account,
            self.router,
            value,
            &swap.encode()?,
            sequence,
            &order.fees,
        )
    }

    /// Send the transaction through the preferred channel, degrading along
    /// the fallback chain when every endpoint on a channel rejects
    async fn dispatch(
        &self,
        order: &mut Order,
        tx: &SignedTransaction,
        target_block: u64,
    ) -> EngineResult<SubmissionChannel> {
        let mut channel = order.request.channel;
        loop {
            let result = self.dispatch_one(order, tx, channel, target_block).await;
            match result {
                Ok(()) => return Ok(channel),
                Err(e @ EngineError::AllEndpointsRejected { .. }) => {
                    let next = if self.config.allow_channel_fallback {
                        channel.fallback()
                    } else {
                        None
                    };
                    match next {
                        Some(next_channel) => {
                            warn!(
                                order_id = %order.id,
                                from = ?channel,
                                to = ?next_channel,
                                error = %e,
                                "channel rejected, falling back"
                            );
                            channel = next_channel;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch_one(
        &self,
        order: &mut Order,
        tx: &SignedTransaction,
        channel: SubmissionChannel,
        target_block: u64,
    ) -> EngineResult<()> {
        match channel {
            SubmissionChannel::Bundle => {
                if !self.protection.has_relays() {
                    return Err(EngineError::AllEndpointsRejected {
                        endpoints: 0,
                        last_reason: "no relay endpoints configured".into(),
                    });
                }
                let mut bundle = self.protection.wrap(vec![tx.clone()], target_block);
                let sim = self.protection.simulate(&mut bundle).await?;
                // Audit trail: the simulation survives the bundle
                order.simulation = Some(sim.clone());
                if !sim.success {
                    return Err(EngineError::SimulationFailed(
                        sim.failure_reason
                            .unwrap_or_else(|| "bundle reverted in simulation".to_string()),
                    ));
                }
                self.protection
                    .submit_across_blocks(&mut bundle, self.config.submission_blocks)
                    .await?;
                Ok(())
            }
            SubmissionChannel::PrivateRelay => {
                if !self.protection.has_relays() {
                    return Err(EngineError::AllEndpointsRejected {
                        endpoints: 0,
                        last_reason: "no relay endpoints configured".into(),
                    });
                }
                self.protection.submit_private(tx).await?;
                Ok(())
            }
            SubmissionChannel::Public => {
                self.rpc.broadcast(&tx.raw).await?;
                Ok(())
            }
        }
    }

    /// Poll the ledger for inclusion up to the configured block/time
    /// window. A timeout re-queries the account sequence so the caller
    /// learns whether the nonce is still free.
    async fn await_inclusion(
        &self,
        order: &Order,
        tx: &SignedTransaction,
        target_block: u64,
        cancel: &CancelHandle,
    ) -> EngineResult<u64> {
        let deadline_block =
            target_block + self.config.submission_blocks + self.config.inclusion_wait_blocks;
        let poll = Duration::from_millis(self.config.inclusion_poll_ms);

        loop {
            if let Some(info) = self.rpc.get_transaction(tx.hash).await? {
                if info.success {
                    return Ok(info.block_number);
                }
                return Err(EngineError::Reverted(format!(
                    "transaction {} reverted in block {}",
                    tx.hash, info.block_number
                )));
            }

            if cancel.is_cancelled() {
                // Best-effort: race an empty replacement on the same nonce
                self.try_replace(order, tx).await;
                return Err(EngineError::Cancelled);
            }

            let now_block = self.rpc.get_block_number().await?;
            let deadline_passed = Utc::now() >= order.request.deadline;
            if now_block >= deadline_block || deadline_passed {
                let observed = self
                    .nonces
                    .observed_sequence(order.request.account_id)
                    .await?;
                let consumed = tx.nonce < observed;
                return Err(EngineError::NotIncluded {
                    nonce_consumed: consumed,
                });
            }

            sleep(poll).await;
        }
    }

    /// Superseding empty transaction on the same sequence number with a
    /// bumped fee. Failure here is acceptable: post-submission
    /// cancellation is best-effort by contract.
    async fn try_replace(&self, order: &Order, tx: &SignedTransaction) {
        let account = match self.nonces.account(order.request.account_id) {
            Ok(account) => account,
            Err(_) => return,
        };
        let mut fees = order.fees;
        let pct = self.config.fee_escalation_percent as u128;
        fees.max_priority_fee_per_gas = (fees.max_priority_fee_per_gas * pct / 100)
            .min(order.request.fee_bounds.max_priority_fee_per_gas)
            .max(1);

        match SignedTransaction::sign(&account, account.address(), 0, b"", tx.nonce, &fees) {
            Ok(replacement) => {
                if let Err(e) = self.rpc.broadcast(&replacement.raw).await {
                    warn!(order_id = %order.id, error = %e, "replacement broadcast failed");
                }
            }
            Err(e) => warn!(order_id = %order.id, error = %e, "replacement signing failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::order::{OrderRequest, OrderState};
    use crate::paper::{PaperFeeEstimator, PaperQuoteSource, PaperRelay, PaperRpc, PaperSafety, UNIT};
    use crate::types::{FeeBounds, Side, Urgency};
    use crate::wallet::ManagedAccount;
    use uuid::Uuid;

    struct Harness {
        quotes: Arc<PaperQuoteSource>,
        rpc: Arc<PaperRpc>,
        nonces: Arc<NonceRegistry>,
        events: EventBus,
        account_id: Uuid,
    }

    fn token() -> Asset {
        Asset::Token(crate::types::Address([0x55; 20]))
    }

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig {
            retry_budget: 3,
            quote_timeout_ms: 200,
            simulation_timeout_ms: 200,
            inclusion_wait_blocks: 2,
            inclusion_poll_ms: 10,
            submission_blocks: 1,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            fee_escalation_percent: 112,
            recheck_safety_on_retry: false,
            allow_channel_fallback: true,
        }
    }

    fn harness(relays: Vec<Arc<dyn crate::interfaces::RelayEndpoint>>) -> (Harness, SubmissionCoordinator) {
        let quotes = Arc::new(PaperQuoteSource::new());
        quotes.set_rate(token(), 1000.0);
        let rpc = Arc::new(PaperRpc::with_quotes(quotes.clone()));
        let nonces = Arc::new(NonceRegistry::new(rpc.clone()));
        let account_id = nonces.register(ManagedAccount::generate("trader"));
        let events = EventBus::default();

        let builder = Arc::new(OrderBuilder::new(
            quotes.clone(),
            Arc::new(PaperSafety::allow_all()),
            Arc::new(PaperFeeEstimator::default()),
            Duration::from_millis(200),
        ));
        let protection = Arc::new(BundleProtection::new(
            relays,
            Duration::from_millis(200),
        ));
        let coordinator = SubmissionCoordinator::new(
            nonces.clone(),
            builder,
            protection,
            rpc.clone(),
            events.clone(),
            fast_config(),
            crate::types::Address([0xee; 20]),
        );
        (
            Harness {
                quotes,
                rpc,
                nonces,
                events,
                account_id,
            },
            coordinator,
        )
    }

    async fn build_order(h: &Harness, retry_budget: u32) -> Order {
        let builder = OrderBuilder::new(
            h.quotes.clone(),
            Arc::new(PaperSafety::allow_all()),
            Arc::new(PaperFeeEstimator::default()),
            Duration::from_millis(200),
        );
        builder
            .build(OrderRequest {
                side: Side::Buy,
                source_asset: Asset::Native,
                target_asset: token(),
                amount_in: UNIT,
                slippage_percent: 10.0,
                deadline: Utc::now() + chrono::Duration::seconds(30),
                fee_bounds: FeeBounds {
                    max_fee_per_gas: 100_000_000_000,
                    max_priority_fee_per_gas: 2_000_000_000,
                    gas_limit: 300_000,
                },
                account_id: h.account_id,
                channel: SubmissionChannel::Bundle,
                urgency: Urgency::High,
                safety_check: false,
                retry_budget,
                auto_manage: false,
                exit_plan: None,
                tags: vec![],
                detected_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bundle_path_confirms() {
        let (h, coordinator) = {
            let quotes = Arc::new(PaperQuoteSource::new());
            quotes.set_rate(token(), 1000.0);
            let rpc = Arc::new(PaperRpc::with_quotes(quotes.clone()));
            let relay: Arc<dyn crate::interfaces::RelayEndpoint> = Arc::new(
                PaperRelay::accepting("relay-a")
                    .with_ledger(rpc.clone())
                    .with_fill_enforcement(quotes.clone()),
            );
            let nonces = Arc::new(NonceRegistry::new(rpc.clone()));
            let account_id = nonces.register(ManagedAccount::generate("trader"));
            let events = EventBus::default();
            let builder = Arc::new(OrderBuilder::new(
                quotes.clone(),
                Arc::new(PaperSafety::allow_all()),
                Arc::new(PaperFeeEstimator::default()),
                Duration::from_millis(200),
            ));
            let protection =
                Arc::new(BundleProtection::new(vec![relay], Duration::from_millis(200)));
            let coordinator = SubmissionCoordinator::new(
                nonces.clone(),
                builder,
                protection,
                rpc.clone(),
                events.clone(),
                fast_config(),
                crate::types::Address([0xee; 20]),
            );
            (
                Harness {
                    quotes,
                    rpc,
                    nonces,
                    events,
                    account_id,
                },
                coordinator,
            )
        };

        let mut rx = h.events.subscribe();
        let order = build_order(&h, 3).await;
        let result = coordinator.execute(order).await;

        assert_eq!(result.state, OrderState::Confirmed);
        assert_eq!(result.sequence, Some(0));
        assert_eq!(result.channel_used, Some(SubmissionChannel::Bundle));
        assert!(result.tx_hash.is_some());
        assert!(result.inclusion_block.is_some());
        assert!(result.latency().is_some());

        // Sequence consumed on the ledger
        let address = h.nonces.address(h.account_id).unwrap();
        assert_eq!(h.rpc.get_sequence(address).await.unwrap(), 1);

        // submitted then confirmed
        assert_eq!(rx.recv().await.unwrap().name(), "order:submitted");
        assert_eq!(rx.recv().await.unwrap().name(), "order:confirmed");
    }

    #[tokio::test]
    async fn test_simulation_revert_fails_without_submission() {
        let relay = Arc::new(PaperRelay::reverting("relay-a", "output below minimum"));
        let relay_dyn: Arc<dyn crate::interfaces::RelayEndpoint> = relay.clone();
        let (h, coordinator) = harness(vec![relay_dyn]);

        let mut order = build_order(&h, 1).await;
        order.request.retry_budget = 1;
        let result = coordinator.execute(order).await;

        assert_eq!(result.state, OrderState::Failed);
        assert!(result.failure.as_ref().unwrap().contains("retry budget exhausted"));
        // Simulation failed every time; nothing was ever submitted
        assert_eq!(relay.submitted_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_on_non_inclusion() {
        // Relay accepts but never lands anything; chain keeps moving
        let relay: Arc<dyn crate::interfaces::RelayEndpoint> =
            Arc::new(PaperRelay::accepting("relay-a"));
        let (h, coordinator) = harness(vec![relay]);
        h.rpc.set_auto_include(false);

        let rpc = h.rpc.clone();
        let ticker = tokio::spawn(async move {
            loop {
                rpc.advance_block();
                sleep(Duration::from_millis(5)).await;
            }
        });

        let mut order = build_order(&h, 2).await;
        order.request.retry_budget = 2;
        let result = coordinator.execute(order).await;
        ticker.abort();

        assert_eq!(result.state, OrderState::Failed);
        assert_eq!(result.retries, 2);
        let failure = result.failure.unwrap();
        assert!(failure.contains("after 2 attempts"), "{failure}");
        assert!(failure.contains("not included"), "{failure}");

        // Nonce was never consumed: the registry may hand it out again
        let next = h.nonces.allocate(h.account_id).await.unwrap();
        assert_eq!(next, result.sequence.unwrap());
    }

    #[tokio::test]
    async fn test_unconsumed_nonce_reused_with_escalated_fee() {
        let relay: Arc<dyn crate::interfaces::RelayEndpoint> =
            Arc::new(PaperRelay::accepting("relay-a"));
        let (h, coordinator) = harness(vec![relay]);
        h.rpc.set_auto_include(false);

        let rpc = h.rpc.clone();
        let ticker = tokio::spawn(async move {
            loop {
                rpc.advance_block();
                sleep(Duration::from_millis(5)).await;
            }
        });

        let order = build_order(&h, 2).await;
        let original_priority = order.fees.max_priority_fee_per_gas;
        let result = coordinator.execute(order).await;
        ticker.abort();

        // Same sequence number across both attempts (replace-by-fee)
        assert_eq!(result.sequence, Some(0));
        assert!(result.fees.max_priority_fee_per_gas > original_priority);
    }

    #[tokio::test]
    async fn test_channel_falls_back_to_public() {
        // Every relay rejects everything; public broadcast still works
        let a: Arc<dyn crate::interfaces::RelayEndpoint> =
            Arc::new(PaperRelay::rejecting("relay-a", "busy"));
        let b: Arc<dyn crate::interfaces::RelayEndpoint> =
            Arc::new(PaperRelay::rejecting("relay-b", "busy"));
        let (h, coordinator) = harness(vec![a, b]);

        let order = build_order(&h, 3).await;
        let result = coordinator.execute(order).await;

        assert_eq!(result.state, OrderState::Confirmed);
        assert_eq!(result.channel_used, Some(SubmissionChannel::Public));
        assert_eq!(h.rpc.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_submission_is_guaranteed() {
        let relay: Arc<dyn crate::interfaces::RelayEndpoint> =
            Arc::new(PaperRelay::accepting("relay-a"));
        let (h, coordinator) = harness(vec![relay]);

        let cancel = CancelHandle::new();
        cancel.cancel();

        let order = build_order(&h, 3).await;
        let result = coordinator.execute_cancellable(order, cancel).await;

        assert_eq!(result.state, OrderState::Failed);
        assert!(result.failure.unwrap().contains("cancelled"));
        assert_eq!(h.rpc.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_account_is_precondition_failure() {
        let relay: Arc<dyn crate::interfaces::RelayEndpoint> =
            Arc::new(PaperRelay::accepting("relay-a"));
        let (h, coordinator) = harness(vec![relay]);

        let mut order = build_order(&h, 3).await;
        order.request.account_id = Uuid::new_v4();
        let result = coordinator.execute(order).await;

        assert_eq!(result.state, OrderState::Failed);
        assert!(result.failure.unwrap().contains("account not found"));
        assert_eq!(result.retries, 3); // terminal, no re-entry
    }

    #[test]
    fn test_backoff_grows_and_clamps() {
        let backoff = ExponentialBackoff::new(100, 1_000);
        let d1 = backoff.delay(1);
        let d4 = backoff.delay(4);
        assert!(d1 >= Duration::from_millis(90) && d1 <= Duration::from_millis(110));
        // 100 * 2^3 = 800, jitter +/-80
        assert!(d4 >= Duration::from_millis(720) && d4 <= Duration::from_millis(880));
        // Clamped at max regardless of attempt
        let d10 = backoff.delay(10);
        assert!(d10 <= Duration::from_millis(1_100));
    }
}
