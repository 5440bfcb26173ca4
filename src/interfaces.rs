//! External collaborator interfaces
//!
//! The engine consumes discovery, safety scoring, fee prediction, quoting,
//! and RPC failover through these narrow traits. Everything behind them is
//! out of scope here: the RPC access layer is assumed to already provide
//! its own multi-endpoint failover and is treated as a single reliable
//! logical endpoint.

use crate::bundle::{Bundle, SimulationResult};
use crate::error::EngineResult;
use crate::types::{
    Address, Asset, FeeEstimate, InclusionInfo, SafetyVerdict, TxHash, Urgency,
};
use async_trait::async_trait;

/// Asset safety check, consulted as a hard precondition before order
/// building when the request asks for it
#[async_trait]
pub trait SafetyCheck: Send + Sync {
    async fn check(&self, asset: Asset) -> EngineResult<SafetyVerdict>;
}

/// Advisory fee estimator. The order builder clamps whatever this returns
/// to the request's hard fee bounds.
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    async fn estimate(&self, urgency: Urgency) -> EngineResult<FeeEstimate>;
}

/// Read-only quote source used for entry pricing and live valuation
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Amount of `path.last()` received for `amount_in` of `path.first()`
    async fn quote(&self, path: &[Asset], amount_in: u128) -> EngineResult<u128>;
}

/// RPC access layer
#[async_trait]
pub trait RpcAccess: Send + Sync {
    async fn broadcast(&self, raw_tx: &[u8]) -> EngineResult<TxHash>;
    async fn get_sequence(&self, account: Address) -> EngineResult<u64>;
    async fn get_balance(&self, account: Address, asset: Asset) -> EngineResult<u128>;
    async fn get_block_number(&self) -> EngineResult<u64>;
    /// Inclusion lookup for a previously broadcast transaction
    async fn get_transaction(&self, hash: TxHash) -> EngineResult<Option<InclusionInfo>>;
}

/// Positive acknowledgment from a relay/builder endpoint
#[derive(Debug, Clone)]
pub struct RelayAck {
    pub endpoint: String,
    pub bundle_hash: Option<TxHash>,
}

/// A relay/builder endpoint accepting bundle simulation and submission,
/// plus private single-transaction submission for the relay fallback path
#[async_trait]
pub trait RelayEndpoint: Send + Sync {
    /// Stable name for logs and acknowledgments
    fn name(&self) -> &str;

    async fn simulate(&self, bundle: &Bundle) -> EngineResult<SimulationResult>;

    async fn submit_bundle(&self, bundle: &Bundle) -> EngineResult<RelayAck>;

    async fn submit_private(&self, raw_tx: &[u8]) -> EngineResult<TxHash>;
}
