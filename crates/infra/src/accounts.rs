//! Account billing context.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use cadence_core::{AccountId, Currency, DomainError};

use crate::ledger::LedgerError;

/// What the engine needs to know about an account to project its billing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingAccount {
    pub account_id: AccountId,
    /// `None` falls back to the engine's configured default zone.
    #[serde(default)]
    pub time_zone: Option<Tz>,
    pub currency: Currency,
    /// Day of month (1..=31) for account-aligned billing.
    pub bill_cycle_day: Option<u32>,
}

impl BillingAccount {
    pub fn new(account_id: AccountId, time_zone: Tz, currency: Currency) -> Self {
        Self {
            time_zone: Some(time_zone),
            ..Self::without_time_zone(account_id, currency)
        }
    }

    /// An account that bills in the engine's default zone.
    pub fn without_time_zone(account_id: AccountId, currency: Currency) -> Self {
        Self {
            account_id,
            time_zone: None,
            currency,
            bill_cycle_day: None,
        }
    }

    pub fn time_zone_or(&self, default: Tz) -> Tz {
        self.time_zone.unwrap_or(default)
    }

    pub fn with_bill_cycle_day(mut self, day: u32) -> Self {
        self.bill_cycle_day = Some(day);
        self
    }
}

/// Source of account billing context.
pub trait AccountStore: Send + Sync {
    /// Fails with `NotFound` for an unknown account.
    fn billing_account(&self, account_id: AccountId) -> Result<BillingAccount, LedgerError>;
}

impl<S> AccountStore for Arc<S>
where
    S: AccountStore + ?Sized,
{
    fn billing_account(&self, account_id: AccountId) -> Result<BillingAccount, LedgerError> {
        (**self).billing_account(account_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<AccountId, BillingAccount>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an account.
    pub fn upsert(&self, account: BillingAccount) -> Result<(), LedgerError> {
        let mut accounts = self.accounts.write().map_err(|_| LedgerError::Poisoned)?;
        accounts.insert(account.account_id, account);
        Ok(())
    }
}

impl AccountStore for InMemoryAccountStore {
    fn billing_account(&self, account_id: AccountId) -> Result<BillingAccount, LedgerError> {
        let accounts = self.accounts.read().map_err(|_| LedgerError::Poisoned)?;
        accounts
            .get(&account_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found(format!("account {account_id}")).into())
    }
}
