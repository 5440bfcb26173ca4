//! Wallet/nonce registry
//!
//! Owns the managed accounts and hands out per-account sequence numbers.
//! Allocation is serialized per account by one async mutex per entry, so
//! two allocations for the same account can never race, while different
//! accounts allocate concurrently. The cached counter is reconciled against
//! the ledger's observed sequence on every allocation, which absorbs gaps
//! caused by transactions sent outside this process.

use crate::error::{EngineError, EngineResult};
use crate::interfaces::RpcAccess;
use crate::types::Address;
use crate::wallet::ManagedAccount;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

struct AccountEntry {
    account: Arc<ManagedAccount>,
    /// Next sequence number this process would assign; None until the
    /// first allocation reconciles with the ledger
    next: Mutex<Option<u64>>,
}

/// Registry of managed accounts and their sequence counters
pub struct NonceRegistry {
    rpc: Arc<dyn RpcAccess>,
    entries: DashMap<Uuid, Arc<AccountEntry>>,
}

impl NonceRegistry {
    pub fn new(rpc: Arc<dyn RpcAccess>) -> Self {
        Self {
            rpc,
            entries: DashMap::new(),
        }
    }

    /// Register an account and return its id
    pub fn register(&self, account: ManagedAccount) -> Uuid {
        let id = account.id();
        let entry = Arc::new(AccountEntry {
            account: account.into_shared(),
            next: Mutex::new(None),
        });
        self.entries.insert(id, entry);
        debug!(account_id = %id, "account registered");
        id
    }

    /// Shared handle to the signing account
    pub fn account(&self, id: Uuid) -> EngineResult<Arc<ManagedAccount>> {
        self.entries
            .get(&id)
            .map(|e| Arc::clone(&e.value().account))
            .ok_or(EngineError::AccountNotFound(id))
    }

    pub fn address(&self, id: Uuid) -> EngineResult<Address> {
        self.account(id).map(|a| a.address())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate the next sequence number for the account.
    ///
    /// Returns a number guaranteed unused by this process for that account.
    /// The cached counter is raised to `max(cached, observed)` before the
    /// increment, so externally-caused gaps are absorbed instead of
    /// producing a stale, already-consumed sequence.
    pub async fn allocate(&self, id: Uuid) -> EngineResult<u64> {
        let entry = self
            .entries
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(EngineError::AccountNotFound(id))?;

        // Serializes same-account callers; other accounts are untouched
        let mut next = entry.next.lock().await;

        let observed = self.rpc.get_sequence(entry.account.address()).await?;
        let seq = match *next {
            Some(cached) => cached.max(observed),
            None => observed,
        };
        *next = Some(seq + 1);

        debug!(
            account_id = %id,
            sequence = seq,
            observed = observed,
            "sequence allocated"
        );
        Ok(seq)
    }

    /// Re-query the ledger's current sequence for the account without
    /// touching the cached counter. Used by the coordinator to decide
    /// whether a previously assigned nonce was consumed.
    pub async fn observed_sequence(&self, id: Uuid) -> EngineResult<u64> {
        let address = self.address(id)?;
        self.rpc.get_sequence(address).await
    }

    /// Lower the cached counter when an assigned sequence is known to be
    /// reusable (order terminally failed without consuming its nonce).
    pub async fn release(&self, id: Uuid, sequence: u64) -> EngineResult<()> {
        let entry = self
            .entries
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(EngineError::AccountNotFound(id))?;

        let mut next = entry.next.lock().await;
        if let Some(cached) = *next {
            if cached == sequence + 1 {
                *next = Some(sequence);
                debug!(account_id = %id, sequence, "sequence released");
            }
        }
        Ok(())
    }
}
