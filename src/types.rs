//! Common types used throughout the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error raised when parsing an address or transaction hash from text
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid length: expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
}

/// A 20-byte account address on the target ledger
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim_start_matches("0x"))?;
        let bytes: [u8; 20] = raw.as_slice().try_into().map_err(|_| ParseError::Length {
            expected: 20,
            got: raw.len(),
        })?;
        Ok(Address(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A 32-byte transaction hash
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", self)
    }
}

impl FromStr for TxHash {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim_start_matches("0x"))?;
        let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| ParseError::Length {
            expected: 32,
            got: raw.len(),
        })?;
        Ok(TxHash(bytes))
    }
}

impl Serialize for TxHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Tradeable asset: the ledger's native coin or a token contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    /// Native coin of the ledger (gas currency)
    Native,
    /// Token identified by its contract address
    Token(Address),
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Native => write!(f, "native"),
            Asset::Token(addr) => write!(f, "{}", addr),
        }
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Submission channel preference for an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionChannel {
    /// Simulate-then-submit bundle via relay/builder endpoints
    Bundle,
    /// Single transaction via a private relay (no public mempool exposure)
    PrivateRelay,
    /// Plain public broadcast through the RPC layer
    Public,
}

impl SubmissionChannel {
    /// Next channel to try when all endpoints on this one reject.
    /// Bundle degrades to private relay, private relay to public broadcast.
    pub fn fallback(self) -> Option<SubmissionChannel> {
        match self {
            SubmissionChannel::Bundle => Some(SubmissionChannel::PrivateRelay),
            SubmissionChannel::PrivateRelay => Some(SubmissionChannel::Public),
            SubmissionChannel::Public => None,
        }
    }
}

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Paper collaborators, no network, full lifecycle exercised
    Simulation,
    /// Real collaborators, real submissions
    Production,
}

/// Hard fee bounds for an order. The fee estimator is advisory; these
/// values are the ceiling regardless of what it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBounds {
    /// Maximum total fee per gas unit (base + priority), in wei-equivalent
    pub max_fee_per_gas: u128,
    /// Maximum priority fee per gas unit
    pub max_priority_fee_per_gas: u128,
    /// Gas limit per transaction
    pub gas_limit: u64,
}

/// Advisory fee estimate from the external estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub base_fee: u128,
    pub priority_fee: u128,
    pub max_fee: u128,
}

/// Urgency hint passed to the fee estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
}

/// Verdict from the external asset safety collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub safe: bool,
    pub reason: Option<String>,
}

impl SafetyVerdict {
    pub fn safe() -> Self {
        Self {
            safe: true,
            reason: None,
        }
    }

    pub fn unsafe_because(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
        }
    }
}

/// Inclusion details for a transaction observed on the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionInfo {
    pub block_number: u64,
    pub success: bool,
    pub gas_used: u64,
    pub effective_fee: u128,
}

/// Engine-wide statistics, updated as orders complete
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub orders_created: u64,
    pub orders_confirmed: u64,
    pub orders_failed: u64,
    pub positions_opened: u64,
    pub positions_closed: u64,
    /// Total input volume across confirmed orders, in base units
    pub total_volume_in: u128,
}
