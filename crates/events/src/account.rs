use cadence_core::AccountId;

use crate::EventEnvelope;
use crate::integration::BillingTrigger;

/// Messages that belong to one billing account.
///
/// Workers use this to pin themselves to a subset of accounts and the
/// dispatcher uses it to pick the per-account lock.
pub trait AccountScoped {
    fn account_id(&self) -> AccountId;
}

impl<E> AccountScoped for EventEnvelope<E> {
    fn account_id(&self) -> AccountId {
        EventEnvelope::account_id(self)
    }
}

impl AccountScoped for BillingTrigger {
    fn account_id(&self) -> AccountId {
        self.account_id
    }
}
