//! Per-account serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cadence_core::AccountId;

#[derive(Debug, thiserror::Error)]
#[error("account lock poisoned")]
pub struct LockPoisoned;

/// One mutex per account, created on first use and dropped once no caller
/// holds or waits on it.
///
/// Holding an account lock serializes recomputes of that account; other accounts
/// proceed in parallel.
#[derive(Debug, Default)]
pub struct AccountLocks {
    locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, account_id: AccountId) -> Result<Arc<Mutex<()>>, LockPoisoned> {
        let mut locks = self.locks.lock().map_err(|_| LockPoisoned)?;
        Ok(locks.entry(account_id).or_default().clone())
    }

    /// Run `f` while holding the account's lock.
    pub fn with_account<T>(&self, account_id: AccountId, f: impl FnOnce() -> T) -> Result<T, LockPoisoned> {
        let lock = self.lock_for(account_id)?;
        let out = {
            // Commit is atomic: a recompute that panicked left nothing half-written.
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f()
        };
        self.release(account_id, &lock);
        Ok(out)
    }

    fn release(&self, account_id: AccountId, lock: &Arc<Mutex<()>>) {
        // Clones are only taken under the map lock, so the count is stable here.
        if let Ok(mut locks) = self.locks.lock() {
            if Arc::strong_count(lock) == 2 {
                locks.remove(&account_id);
            }
        }
    }

    /// Number of accounts currently locked or waited on.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
