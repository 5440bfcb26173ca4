//! Error taxonomy for the execution engine
//!
//! Errors fall into three tiers that the coordinator treats differently:
//! - Precondition errors: never retried, surfaced to the caller immediately
//! - Simulation errors: terminal for the bundle, retryable for the order
//!   with a fresh quote while budget remains
//! - Submission errors: retried up to the order's budget, then terminal
//!   with the last known nonce-consumption status attached

use crate::types::Asset;
use thiserror::Error;
use uuid::Uuid;

/// Result alias used across the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Comprehensive error type for the order/bundle/position lifecycle
#[derive(Error, Debug)]
pub enum EngineError {
    /// The referenced account id is not registered
    #[error("account not found: {0}")]
    AccountNotFound(Uuid),

    /// The asset safety collaborator returned a negative verdict.
    /// Hard precondition for order building, never retried.
    #[error("unsafe asset {asset}: {reason}")]
    UnsafeAsset { asset: Asset, reason: String },

    /// No execution path yielded a quote
    #[error("quote unavailable: {0}")]
    QuoteUnavailable(String),

    /// The order request failed validation before any network call
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Bundle simulation reverted, errored, or timed out.
    /// Terminal for the bundle that produced it.
    #[error("simulation failed: {0}")]
    SimulationFailed(String),

    /// Every configured relay/builder endpoint rejected the submission
    #[error("all {endpoints} relay endpoints rejected the bundle: {last_reason}")]
    AllEndpointsRejected {
        endpoints: usize,
        last_reason: String,
    },

    /// Submission was acknowledged but inclusion was not observed within
    /// the polling window. `nonce_consumed` records what the ledger said
    /// about the account's sequence at timeout.
    #[error("not included within the polling window (nonce consumed: {nonce_consumed})")]
    NotIncluded { nonce_consumed: bool },

    /// The transaction was included but reverted on the ledger. The nonce
    /// is consumed; a retry needs a fresh one.
    #[error("included but reverted on-chain: {0}")]
    Reverted(String),

    /// Signing failed
    #[error("signing failed: {0}")]
    Signing(String),

    /// RPC access layer error
    #[error("rpc error: {0}")]
    Rpc(String),

    /// A collaborator call exceeded its configured timeout
    #[error("timeout during {0}")]
    Timeout(&'static str),

    /// The caller cancelled the order before submission acknowledgment
    #[error("order cancelled")]
    Cancelled,

    /// The order's absolute deadline passed before it could confirm
    #[error("order deadline exceeded")]
    DeadlineExceeded,

    /// Retry budget exhausted. Carries the final attempt's failure and the
    /// last known nonce-consumption status so the caller knows whether the
    /// sequence number is still available.
    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: String,
        nonce_consumed: Option<bool>,
    },

    /// Internal invariant violation; indicates a bug
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the coordinator may retry the order after this failure.
    ///
    /// Precondition errors and terminal outcomes are not retryable; failed
    /// simulations and submission failures are, until budget runs out.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SimulationFailed(_) => true,
            Self::AllEndpointsRejected { .. } => true,
            Self::NotIncluded { .. } => true,
            Self::Reverted(_) => true,
            Self::Rpc(_) => true,
            Self::Timeout(_) => true,

            Self::AccountNotFound(_) => false,
            Self::UnsafeAsset { .. } => false,
            Self::QuoteUnavailable(_) => false,
            Self::InvalidRequest(_) => false,
            Self::Signing(_) => false,
            Self::Cancelled => false,
            Self::DeadlineExceeded => false,
            Self::RetriesExhausted { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Error category for logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::AccountNotFound(_) => "account",
            Self::UnsafeAsset { .. } => "safety",
            Self::QuoteUnavailable(_) => "quote",
            Self::InvalidRequest(_) => "validation",
            Self::SimulationFailed(_) => "simulation",
            Self::AllEndpointsRejected { .. } => "submission",
            Self::NotIncluded { .. } => "inclusion",
            Self::Reverted(_) => "revert",
            Self::Signing(_) => "signing",
            Self::Rpc(_) => "rpc",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline",
            Self::RetriesExhausted { .. } => "exhausted",
            Self::Internal(_) => "internal",
        }
    }

    /// True for errors that must surface to the caller without any retry
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::AccountNotFound(_)
                | Self::UnsafeAsset { .. }
                | Self::QuoteUnavailable(_)
                | Self::InvalidRequest(_)
        )
    }
}
