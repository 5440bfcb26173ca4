//! Bundle protection layer
//!
//! Wraps signed transactions into a simulate-then-submit unit. The hard
//! invariant lives here: a bundle is never submitted without a prior
//! successful simulation, and a failed (or timed-out) simulation is
//! terminal for that bundle. Submission fans out to every configured
//! relay/builder endpoint in parallel and succeeds on the first positive
//! acknowledgment.

use crate::error::{EngineError, EngineResult};
use crate::interfaces::RelayEndpoint;
use crate::types::{Address, Asset, FeeBounds, TxHash};
use crate::wallet::ManagedAccount;
use futures::future::select_ok;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Swap instruction carried as the opaque call payload of an order's
/// transaction. Execution venues (and simulations) enforce `min_out`
/// against the actual fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapCall {
    pub path: Vec<Asset>,
    pub amount_in: u128,
    pub min_out: u128,
    pub deadline_unix: i64,
}

impl SwapCall {
    pub fn encode(&self) -> EngineResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| EngineError::Signing(format!("swap encoding failed: {e}")))
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// A fully signed transaction ready for wrapping or broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Raw signed payload as handed to relays / the RPC layer
    pub raw: Vec<u8>,
    pub hash: TxHash,
    pub sender: Address,
    pub recipient: Address,
    pub value: u128,
    pub gas_limit: u64,
    pub nonce: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Canonical pre-signature encoding. Field order is fixed; the signature
/// covers exactly these bytes.
#[derive(Serialize)]
struct TxPayload<'a> {
    sender: Address,
    recipient: Address,
    value: u128,
    gas_limit: u64,
    max_fee_per_gas: u128,
    max_priority_fee_per_gas: u128,
    nonce: u64,
    data: &'a str,
}

/// Decoded view of a raw signed payload, for ledger-side bookkeeping
/// (paper implementations, audit tooling)
#[derive(Debug, Clone, Deserialize)]
pub struct DecodedTx {
    pub sender: Address,
    pub recipient: Address,
    pub value: u128,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub nonce: u64,
    pub data: String,
}

impl DecodedTx {
    /// Strip the trailing signature and decode the canonical payload
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        let body = raw.get(..raw.len().checked_sub(64)?)?;
        serde_json::from_slice(body).ok()
    }

    /// Decode the inner swap instruction, if the payload carries one
    pub fn swap_call(&self) -> Option<SwapCall> {
        let data = hex::decode(&self.data).ok()?;
        SwapCall::decode(&data)
    }
}

/// Hash of a raw signed payload, as the ledger would compute it
pub fn raw_tx_hash(raw: &[u8]) -> TxHash {
    let digest = Sha256::digest(raw);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    TxHash(hash)
}

impl SignedTransaction {
    /// Sign a transaction for `account`. `data` is the opaque call payload
    /// (swap instruction) executed by the recipient contract.
    pub fn sign(
        account: &ManagedAccount,
        recipient: Address,
        value: u128,
        data: &[u8],
        nonce: u64,
        fees: &FeeBounds,
    ) -> EngineResult<Self> {
        let data_hex = hex::encode(data);
        let payload = TxPayload {
            sender: account.address(),
            recipient,
            value,
            gas_limit: fees.gas_limit,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            nonce,
            data: &data_hex,
        };
        let mut raw = serde_json::to_vec(&payload)
            .map_err(|e| EngineError::Signing(format!("payload encoding failed: {e}")))?;
        let signature = account.sign(&raw);
        raw.extend_from_slice(&signature);
        let hash = raw_tx_hash(&raw);

        Ok(Self {
            raw,
            hash,
            sender: account.address(),
            recipient,
            value,
            gas_limit: fees.gas_limit,
            nonce,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
        })
    }
}

/// Bundle lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleState {
    Pending,
    Simulated,
    Submitted,
    Included,
    Failed,
}

/// Per-transaction simulation outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutcome {
    pub hash: TxHash,
    pub success: bool,
    pub gas_used: u64,
    pub effective_fee: u128,
    pub revert_reason: Option<String>,
}

/// Result of simulating a bundle against a relay endpoint. Produced once
/// per bundle and attached to it; read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub success: bool,
    pub outcomes: Vec<TxOutcome>,
    pub total_gas_used: u64,
    pub total_fee: u128,
    pub failure_reason: Option<String>,
}

/// An atomically-simulated group of transactions targeting one block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: Uuid,
    pub transactions: Vec<SignedTransaction>,
    pub target_block: u64,
    /// Optional validity window (min, max timestamp) forwarded to relays
    pub window: Option<(u64, u64)>,
    pub state: BundleState,
    pub simulation: Option<SimulationResult>,
}

impl Bundle {
    /// Hash of the first transaction, used for audit trails
    pub fn lead_hash(&self) -> Option<TxHash> {
        self.transactions.first().map(|tx| tx.hash)
    }

    fn simulated_ok(&self) -> bool {
        self.state == BundleState::Simulated
            && self
                .simulation
                .as_ref()
                .map(|s| s.success)
                .unwrap_or(false)
    }
}

/// Outcome of a bundle submission
#[derive(Debug, Clone)]
pub enum SubmissionOutcome {
    /// At least one endpoint acknowledged the bundle
    Accepted {
        endpoint: String,
        target_blocks: Vec<u64>,
    },
    /// No submission happened (failed simulation) or every endpoint said no
    Rejected { reason: String },
}

/// The protection layer: wrap, simulate, submit
pub struct BundleProtection {
    relays: Vec<Arc<dyn RelayEndpoint>>,
    simulation_timeout: Duration,
}

impl BundleProtection {
    pub fn new(relays: Vec<Arc<dyn RelayEndpoint>>, simulation_timeout: Duration) -> Self {
        Self {
            relays,
            simulation_timeout,
        }
    }

    pub fn has_relays(&self) -> bool {
        !self.relays.is_empty()
    }

    /// Wrap signed transactions into a pending bundle for `target_block`
    pub fn wrap(&self, transactions: Vec<SignedTransaction>, target_block: u64) -> Bundle {
        Bundle {
            id: Uuid::new_v4(),
            transactions,
            target_block,
            window: None,
            state: BundleState::Pending,
            simulation: None,
        }
    }

    /// Simulate the bundle. A revert, endpoint error, or timeout marks the
    /// bundle `Failed`; no submission will be attempted for it afterwards.
    pub async fn simulate(&self, bundle: &mut Bundle) -> EngineResult<SimulationResult> {
        if self.relays.is_empty() {
            bundle.state = BundleState::Failed;
            return Err(EngineError::SimulationFailed(
                "no relay endpoints configured".into(),
            ));
        }

        // First endpoint that returns a verdict wins; endpoint errors fall
        // through to the next relay
        let mut last_err: Option<EngineError> = None;
        for relay in &self.relays {
            match tokio::time::timeout(self.simulation_timeout, relay.simulate(bundle)).await {
                Err(_) => {
                    warn!(relay = relay.name(), bundle_id = %bundle.id, "simulation timed out");
                    last_err = Some(EngineError::Timeout("simulation"));
                }
                Ok(Err(e)) => {
                    warn!(relay = relay.name(), bundle_id = %bundle.id, error = %e, "simulation errored");
                    last_err = Some(e);
                }
                Ok(Ok(result)) => {
                    bundle.state = if result.success {
                        BundleState::Simulated
                    } else {
                        BundleState::Failed
                    };
                    bundle.simulation = Some(result.clone());
                    debug!(
                        bundle_id = %bundle.id,
                        relay = relay.name(),
                        success = result.success,
                        gas = result.total_gas_used,
                        "bundle simulated"
                    );
                    return Ok(result);
                }
            }
        }

        bundle.state = BundleState::Failed;
        Err(match last_err {
            Some(EngineError::Timeout(op)) => EngineError::Timeout(op),
            Some(e) => EngineError::SimulationFailed(e.to_string()),
            None => EngineError::SimulationFailed("no simulation verdict".into()),
        })
    }

    /// Submit an already-simulated bundle to every relay in parallel.
    /// First positive acknowledgment wins; if every endpoint rejects, the
    /// bundle is failed and `AllEndpointsRejected` is returned.
    pub async fn submit(&self, bundle: &mut Bundle) -> EngineResult<SubmissionOutcome> {
        if !bundle.simulated_ok() {
            // Invariant: never on the wire without a clean simulation
            let reason = bundle
                .simulation
                .as_ref()
                .and_then(|s| s.failure_reason.clone())
                .unwrap_or_else(|| "bundle not simulated".to_string());
            return Ok(SubmissionOutcome::Rejected { reason });
        }
        if self.relays.is_empty() {
            bundle.state = BundleState::Failed;
            return Err(EngineError::AllEndpointsRejected {
                endpoints: 0,
                last_reason: "no relay endpoints configured".into(),
            });
        }

        let futures: Vec<_> = self
            .relays
            .iter()
            .map(|relay| {
                let relay = Arc::clone(relay);
                let bundle_ref = bundle.clone();
                Box::pin(async move {
                    relay
                        .submit_bundle(&bundle_ref)
                        .await
                        .map(|ack| (relay.name().to_string(), ack))
                })
            })
            .collect();

        match select_ok(futures).await {
            Ok(((endpoint, _ack), _rest)) => {
                bundle.state = BundleState::Submitted;
                info!(
                    bundle_id = %bundle.id,
                    endpoint = %endpoint,
                    target_block = bundle.target_block,
                    "bundle accepted"
                );
                Ok(SubmissionOutcome::Accepted {
                    endpoint,
                    target_blocks: vec![bundle.target_block],
                })
            }
            Err(e) => {
                bundle.state = BundleState::Failed;
                Err(EngineError::AllEndpointsRejected {
                    endpoints: self.relays.len(),
                    last_reason: e.to_string(),
                })
            }
        }
    }

    /// Replicate the bundle across the next `n` candidate blocks, each as
    /// an independent submission, to raise inclusion odds. Succeeds if any
    /// replica is accepted anywhere.
    pub async fn submit_across_blocks(
        &self,
        bundle: &mut Bundle,
        n: u64,
    ) -> EngineResult<SubmissionOutcome> {
        if !bundle.simulated_ok() {
            let reason = bundle
                .simulation
                .as_ref()
                .and_then(|s| s.failure_reason.clone())
                .unwrap_or_else(|| "bundle not simulated".to_string());
            return Ok(SubmissionOutcome::Rejected { reason });
        }

        let base_block = bundle.target_block;
        let mut accepted_blocks = Vec::new();
        let mut accepted_endpoint = None;
        let mut last_reason = String::from("no submissions attempted");

        for offset in 0..n.max(1) {
            let mut replica = bundle.clone();
            replica.id = Uuid::new_v4();
            replica.target_block = base_block + offset;

            match self.submit(&mut replica).await {
                Ok(SubmissionOutcome::Accepted { endpoint, .. }) => {
                    accepted_blocks.push(replica.target_block);
                    accepted_endpoint.get_or_insert(endpoint);
                }
                Ok(SubmissionOutcome::Rejected { reason }) => last_reason = reason,
                Err(e) => last_reason = e.to_string(),
            }
        }

        if let Some(endpoint) = accepted_endpoint {
            bundle.state = BundleState::Submitted;
            Ok(SubmissionOutcome::Accepted {
                endpoint,
                target_blocks: accepted_blocks,
            })
        } else {
            bundle.state = BundleState::Failed;
            Err(EngineError::AllEndpointsRejected {
                endpoints: self.relays.len(),
                last_reason,
            })
        }
    }

    /// Private single-transaction fallback channel
    pub async fn submit_private(&self, tx: &SignedTransaction) -> EngineResult<TxHash> {
        if self.relays.is_empty() {
            return Err(EngineError::AllEndpointsRejected {
                endpoints: 0,
                last_reason: "no relay endpoints configured".into(),
            });
        }

        let futures: Vec<_> = self
            .relays
            .iter()
            .map(|relay| {
                let relay = Arc::clone(relay);
                let raw = tx.raw.clone();
                Box::pin(async move { relay.submit_private(&raw).await })
            })
            .collect();

        match select_ok(futures).await {
            Ok((hash, _rest)) => Ok(hash),
            Err(e) => Err(EngineError::AllEndpointsRejected {
                endpoints: self.relays.len(),
                last_reason: e.to_string(),
            }),
        }
    }
}
