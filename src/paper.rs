//! Paper collaborators
//!
//! Deterministic, in-memory implementations of every external interface.
//! They back the binary's simulation mode and the test suite: the full
//! order/bundle/position lifecycle runs against them without a network.
//!
//! The paper ledger enforces the same rules a real one would: sequence
//! numbers advance on inclusion, and a swap whose live fill comes in under
//! its `min_out` is included as a revert.

use crate::bundle::{raw_tx_hash, Bundle, DecodedTx, SimulationResult, TxOutcome};
use crate::error::{EngineError, EngineResult};
use crate::interfaces::{
    FeeEstimator, QuoteSource, RelayAck, RelayEndpoint, RpcAccess, SafetyCheck,
};
use crate::types::{
    Address, Asset, FeeEstimate, InclusionInfo, SafetyVerdict, TxHash, Urgency,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// One whole unit of the native coin, in base units
pub const UNIT: u128 = 1_000_000_000_000_000_000;

// ============================================================================
// Quote source
// ============================================================================

/// Fixed-rate quote table. A rate of `R` means one whole native unit buys
/// `R` base units of the token; the reverse direction is derived.
pub struct PaperQuoteSource {
    rates: DashMap<Asset, f64>,
}

impl PaperQuoteSource {
    pub fn new() -> Self {
        Self {
            rates: DashMap::new(),
        }
    }

    pub fn set_rate(&self, asset: Asset, tokens_per_unit: f64) {
        self.rates.insert(asset, tokens_per_unit);
    }

    /// Synchronous quote used internally and by the paper ledger's fill
    /// enforcement
    pub fn quote_sync(&self, path: &[Asset], amount_in: u128) -> Option<u128> {
        let (first, last) = (path.first()?, path.last()?);
        match (first, last) {
            (Asset::Native, token @ Asset::Token(_)) => {
                let rate = *self.rates.get(token)?;
                if rate <= 0.0 {
                    return None;
                }
                Some((amount_in as f64 * rate / UNIT as f64) as u128)
            }
            (token @ Asset::Token(_), Asset::Native) => {
                let rate = *self.rates.get(token)?;
                if rate <= 0.0 {
                    return None;
                }
                Some((amount_in as f64 * UNIT as f64 / rate) as u128)
            }
            _ => None,
        }
    }
}

impl Default for PaperQuoteSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuoteSource for PaperQuoteSource {
    async fn quote(&self, path: &[Asset], amount_in: u128) -> EngineResult<u128> {
        self.quote_sync(path, amount_in).ok_or_else(|| {
            EngineError::QuoteUnavailable(format!(
                "no rate for path {:?}",
                path.iter().map(|a| a.to_string()).collect::<Vec<_>>()
            ))
        })
    }
}

// ============================================================================
// Safety check
// ============================================================================

/// Allow-by-default safety oracle with an explicit deny list
pub struct PaperSafety {
    denied: DashMap<Asset, String>,
    checks: AtomicUsize,
}

impl PaperSafety {
    pub fn allow_all() -> Self {
        Self {
            denied: DashMap::new(),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn deny(&self, asset: Asset, reason: impl Into<String>) {
        self.denied.insert(asset, reason.into());
    }

    pub fn allow(&self, asset: Asset) {
        self.denied.remove(&asset);
    }

    /// How many verdicts have been requested
    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SafetyCheck for PaperSafety {
    async fn check(&self, asset: Asset) -> EngineResult<SafetyVerdict> {
        self.checks.fetch_add(1, Ordering::Relaxed);
        Ok(match self.denied.get(&asset) {
            Some(reason) => SafetyVerdict::unsafe_because(reason.value().clone()),
            None => SafetyVerdict::safe(),
        })
    }
}

// ============================================================================
// Fee estimator
// ============================================================================

pub struct PaperFeeEstimator {
    estimate: FeeEstimate,
}

impl PaperFeeEstimator {
    pub fn with_estimate(estimate: FeeEstimate) -> Self {
        Self { estimate }
    }
}

impl Default for PaperFeeEstimator {
    fn default() -> Self {
        Self {
            estimate: FeeEstimate {
                base_fee: 20_000_000_000,
                priority_fee: 1_000_000_000,
                max_fee: 41_000_000_000,
            },
        }
    }
}

#[async_trait]
impl FeeEstimator for PaperFeeEstimator {
    async fn estimate(&self, _urgency: Urgency) -> EngineResult<FeeEstimate> {
        Ok(self.estimate)
    }
}

// ============================================================================
// RPC access / paper ledger
// ============================================================================

/// In-memory ledger: sequences, balances, block height, and inclusion
/// records. `auto_include` (on by default) lands every broadcast in the
/// next block, which is what simulation mode wants; tests that exercise
/// the non-inclusion paths switch it off and drive inclusion by hand.
pub struct PaperRpc {
    sequences: DashMap<Address, u64>,
    balances: DashMap<(Address, Asset), u128>,
    block: AtomicU64,
    included: DashMap<TxHash, InclusionInfo>,
    broadcasts: Mutex<Vec<TxHash>>,
    auto_include: AtomicBool,
    quotes: Option<Arc<PaperQuoteSource>>,
}

impl PaperRpc {
    pub fn new() -> Self {
        Self {
            sequences: DashMap::new(),
            balances: DashMap::new(),
            block: AtomicU64::new(1),
            included: DashMap::new(),
            broadcasts: Mutex::new(Vec::new()),
            auto_include: AtomicBool::new(true),
            quotes: None,
        }
    }

    /// Ledger that computes live fills through the given quote table and
    /// reverts inclusions whose fill is below the swap's minimum
    pub fn with_quotes(quotes: Arc<PaperQuoteSource>) -> Self {
        let mut rpc = Self::new();
        rpc.quotes = Some(quotes);
        rpc
    }

    pub fn set_sequence(&self, account: Address, sequence: u64) {
        self.sequences.insert(account, sequence);
    }

    pub fn set_balance(&self, account: Address, asset: Asset, amount: u128) {
        self.balances.insert((account, asset), amount);
    }

    pub fn set_block(&self, block: u64) {
        self.block.store(block, Ordering::SeqCst);
    }

    pub fn advance_block(&self) -> u64 {
        self.block.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_auto_include(&self, enabled: bool) {
        self.auto_include.store(enabled, Ordering::SeqCst);
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().len()
    }

    pub fn is_included(&self, hash: TxHash) -> bool {
        self.included.contains_key(&hash)
    }

    /// Land a raw transaction in the next block: advance the sender's
    /// sequence, apply swap effects (or revert on an under-minimum fill),
    /// and record the inclusion.
    pub fn include_raw(&self, raw: &[u8]) {
        let hash = raw_tx_hash(raw);
        if self.included.contains_key(&hash) {
            return;
        }
        let Some(decoded) = DecodedTx::from_raw(raw) else {
            return;
        };

        // Sequence consumption, regardless of execution outcome
        let mut seq = self.sequences.entry(decoded.sender).or_insert(0);
        *seq = (*seq).max(decoded.nonce + 1);
        drop(seq);

        let block_number = self.block.load(Ordering::SeqCst) + 1;
        let mut success = true;

        if let Some(swap) = decoded.swap_call() {
            let fill = self
                .quotes
                .as_ref()
                .and_then(|q| q.quote_sync(&swap.path, swap.amount_in));
            match fill {
                Some(fill) if fill >= swap.min_out => {
                    if let (Some(source), Some(target)) =
                        (swap.path.first(), swap.path.last())
                    {
                        let mut debit = self
                            .balances
                            .entry((decoded.sender, *source))
                            .or_insert(0);
                        *debit = debit.saturating_sub(swap.amount_in);
                        drop(debit);
                        *self
                            .balances
                            .entry((decoded.sender, *target))
                            .or_insert(0) += fill;
                    }
                }
                // No quote table attached: optimistic fill at min_out
                None if self.quotes.is_none() => {
                    if let (Some(source), Some(target)) =
                        (swap.path.first(), swap.path.last())
                    {
                        let mut debit = self
                            .balances
                            .entry((decoded.sender, *source))
                            .or_insert(0);
                        *debit = debit.saturating_sub(swap.amount_in);
                        drop(debit);
                        *self
                            .balances
                            .entry((decoded.sender, *target))
                            .or_insert(0) += swap.min_out;
                    }
                }
                // Fill below minimum (or no path): included as a revert
                _ => success = false,
            }
        }

        self.included.insert(
            hash,
            InclusionInfo {
                block_number,
                success,
                gas_used: 21_000,
                effective_fee: decoded.max_fee_per_gas * 21_000,
            },
        );
    }
}

impl Default for PaperRpc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcAccess for PaperRpc {
    async fn broadcast(&self, raw_tx: &[u8]) -> EngineResult<TxHash> {
        let hash = raw_tx_hash(raw_tx);
        self.broadcasts.lock().push(hash);
        if self.auto_include.load(Ordering::SeqCst) {
            self.include_raw(raw_tx);
        }
        Ok(hash)
    }

    async fn get_sequence(&self, account: Address) -> EngineResult<u64> {
        Ok(self.sequences.get(&account).map(|s| *s).unwrap_or(0))
    }

    async fn get_balance(&self, account: Address, asset: Asset) -> EngineResult<u128> {
        Ok(self
            .balances
            .get(&(account, asset))
            .map(|b| *b)
            .unwrap_or(0))
    }

    async fn get_block_number(&self) -> EngineResult<u64> {
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn get_transaction(&self, hash: TxHash) -> EngineResult<Option<InclusionInfo>> {
        Ok(self.included.get(&hash).map(|i| *i))
    }
}

// ============================================================================
// Relay endpoint
// ============================================================================

/// Recorded relay interaction, for asserting the simulate-before-submit
/// ordering invariant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCall {
    Simulate(Uuid),
    Submit(Uuid),
    Private(TxHash),
}

enum RelayBehavior {
    Accept,
    Reject(String),
    RevertSimulation(String),
}

/// Scripted relay endpoint with call recording
pub struct PaperRelay {
    name: String,
    behavior: RelayBehavior,
    /// When attached, accepted submissions land on this ledger
    ledger: Option<Arc<PaperRpc>>,
    /// When attached, simulation computes live fills and reverts swaps
    /// whose output falls under their minimum
    fills: Option<Arc<PaperQuoteSource>>,
    calls: Mutex<Vec<RelayCall>>,
}

impl PaperRelay {
    pub fn accepting(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: RelayBehavior::Accept,
            ledger: None,
            fills: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            behavior: RelayBehavior::Reject(reason.into()),
            ..Self::accepting(name)
        }
    }

    pub fn reverting(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            behavior: RelayBehavior::RevertSimulation(reason.into()),
            ..Self::accepting(name)
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<PaperRpc>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_fill_enforcement(mut self, quotes: Arc<PaperQuoteSource>) -> Self {
        self.fills = Some(quotes);
        self
    }

    pub fn calls(&self) -> Vec<RelayCall> {
        self.calls.lock().clone()
    }

    pub fn submitted_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, RelayCall::Submit(_) | RelayCall::Private(_)))
            .count()
    }

    fn simulate_tx(&self, raw: &[u8], hash: TxHash) -> TxOutcome {
        let revert_reason = self.fills.as_ref().and_then(|quotes| {
            let decoded = DecodedTx::from_raw(raw)?;
            let swap = decoded.swap_call()?;
            match quotes.quote_sync(&swap.path, swap.amount_in) {
                Some(fill) if fill >= swap.min_out => None,
                Some(fill) => Some(format!(
                    "output below minimum: {fill} < {}",
                    swap.min_out
                )),
                None => Some("no execution path".to_string()),
            }
        });
        TxOutcome {
            hash,
            success: revert_reason.is_none(),
            gas_used: 21_000,
            effective_fee: 21_000,
            revert_reason,
        }
    }
}

#[async_trait]
impl RelayEndpoint for PaperRelay {
    fn name(&self) -> &str {
        &self.name
    }

    async fn simulate(&self, bundle: &Bundle) -> EngineResult<SimulationResult> {
        self.calls.lock().push(RelayCall::Simulate(bundle.id));

        if let RelayBehavior::RevertSimulation(reason) = &self.behavior {
            return Ok(SimulationResult {
                success: false,
                outcomes: bundle
                    .transactions
                    .iter()
                    .map(|tx| TxOutcome {
                        hash: tx.hash,
                        success: false,
                        gas_used: 0,
                        effective_fee: 0,
                        revert_reason: Some(reason.clone()),
                    })
                    .collect(),
                total_gas_used: 0,
                total_fee: 0,
                failure_reason: Some(reason.clone()),
            });
        }

        let outcomes: Vec<TxOutcome> = bundle
            .transactions
            .iter()
            .map(|tx| self.simulate_tx(&tx.raw, tx.hash))
            .collect();
        let success = !outcomes.is_empty() && outcomes.iter().all(|o| o.success);
        let failure_reason = outcomes
            .iter()
            .find_map(|o| o.revert_reason.clone());

        Ok(SimulationResult {
            success,
            total_gas_used: outcomes.iter().map(|o| o.gas_used).sum(),
            total_fee: outcomes.iter().map(|o| o.effective_fee).sum(),
            failure_reason,
            outcomes,
        })
    }

    async fn submit_bundle(&self, bundle: &Bundle) -> EngineResult<RelayAck> {
        self.calls.lock().push(RelayCall::Submit(bundle.id));

        if let RelayBehavior::Reject(reason) = &self.behavior {
            return Err(EngineError::Rpc(format!("{}: {reason}", self.name)));
        }

        if let Some(ledger) = &self.ledger {
            for tx in &bundle.transactions {
                ledger.include_raw(&tx.raw);
            }
        }

        Ok(RelayAck {
            endpoint: self.name.clone(),
            bundle_hash: bundle.lead_hash(),
        })
    }

    async fn submit_private(&self, raw_tx: &[u8]) -> EngineResult<TxHash> {
        let hash = raw_tx_hash(raw_tx);
        self.calls.lock().push(RelayCall::Private(hash));

        if let RelayBehavior::Reject(reason) = &self.behavior {
            return Err(EngineError::Rpc(format!("{}: {reason}", self.name)));
        }

        if let Some(ledger) = &self.ledger {
            ledger.include_raw(raw_tx);
        }
        Ok(hash)
    }
}
