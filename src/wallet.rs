//! Wallet management: signing keys and ledger addresses
//!
//! A `ManagedAccount` owns one ed25519 signing key. Accounts are registered
//! with the nonce registry, which is the only component allowed to hand out
//! sequence numbers for them.

use crate::error::{EngineError, EngineResult};
use crate::types::Address;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;
use zeroize::Zeroizing;

/// A signing account managed by the engine
pub struct ManagedAccount {
    id: Uuid,
    label: String,
    signing: SigningKey,
    address: Address,
    /// When set, the account is reserved for a single strategy and the
    /// engine refuses to share it across concurrent directives
    exclusive: bool,
}

impl ManagedAccount {
    /// Create an account from a 32-byte secret key
    pub fn from_secret_bytes(label: impl Into<String>, secret: &[u8; 32]) -> EngineResult<Self> {
        if secret.iter().all(|&b| b == 0) {
            return Err(EngineError::Signing(
                "all-zero secret key rejected".to_string(),
            ));
        }
        let signing = SigningKey::from_bytes(secret);
        let address = derive_address(&signing.verifying_key());
        Ok(Self {
            id: Uuid::new_v4(),
            label: label.into(),
            signing,
            address,
            exclusive: false,
        })
    }

    /// Load a key file. Accepts raw 32-byte secrets, raw 64-byte keypairs
    /// (secret || public), and JSON arrays of either length.
    pub fn from_file(label: impl Into<String>, path: &str) -> EngineResult<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| EngineError::Signing(format!("failed to read key file {path}: {e}")))?;
        let raw = Zeroizing::new(raw);

        let bytes: Zeroizing<Vec<u8>> = if raw.len() == 32 || raw.len() == 64 {
            raw
        } else {
            let json: Vec<u8> = serde_json::from_slice(&raw)
                .map_err(|e| EngineError::Signing(format!("failed to parse key JSON: {e}")))?;
            Zeroizing::new(json)
        };

        let secret: [u8; 32] = match bytes.len() {
            32 | 64 => bytes[..32].try_into().expect("length checked"),
            n => {
                return Err(EngineError::Signing(format!(
                    "invalid key length: expected 32 or 64 bytes, got {n}"
                )))
            }
        };
        Self::from_secret_bytes(label, &secret)
    }

    /// Generate a fresh random account (tests, simulation mode)
    pub fn generate(label: impl Into<String>) -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let address = derive_address(&signing.verifying_key());
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            signing,
            address,
            exclusive: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn set_exclusive(&mut self, exclusive: bool) {
        self.exclusive = exclusive;
    }

    /// Sign an arbitrary payload, returning the 64-byte signature
    pub fn sign(&self, payload: &[u8]) -> [u8; 64] {
        self.signing.sign(payload).to_bytes()
    }

    /// Shared handle for use across tasks
    pub fn into_shared(self) -> Arc<ManagedAccount> {
        Arc::new(self)
    }
}

impl fmt::Debug for ManagedAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material intentionally omitted
        f.debug_struct("ManagedAccount")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("address", &self.address)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

/// Ledger address: last 20 bytes of sha256 over the verifying key
fn derive_address(key: &VerifyingKey) -> Address {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..32]);
    Address(out)
}
