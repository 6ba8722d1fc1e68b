//! Subscription lifecycle events, as recorded by the subscription system.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cadence_billing::BillingEvent;
use cadence_core::{AccountId, DomainError};

use crate::ledger::LedgerError;

/// Read access to the billing events of an account.
///
/// Events are returned in recording order; the billing event set sorts them.
pub trait BillingEventSource: Send + Sync {
    fn billing_events(&self, account_id: AccountId) -> Result<Vec<BillingEvent>, LedgerError>;
}

impl<S> BillingEventSource for Arc<S>
where
    S: BillingEventSource + ?Sized,
{
    fn billing_events(&self, account_id: AccountId) -> Result<Vec<BillingEvent>, LedgerError> {
        (**self).billing_events(account_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBillingEventSource {
    events: RwLock<HashMap<AccountId, Vec<BillingEvent>>>,
}

impl InMemoryBillingEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event. Re-recording the same `(subscription, sequence)`
    /// is a no-op when identical and a conflict otherwise.
    pub fn record(&self, account_id: AccountId, event: BillingEvent) -> Result<(), LedgerError> {
        let mut events = self.events.write().map_err(|_| LedgerError::Poisoned)?;
        let stream = events.entry(account_id).or_default();

        if let Some(existing) = stream
            .iter()
            .find(|e| e.subscription_id == event.subscription_id && e.sequence == event.sequence)
        {
            if *existing == event {
                return Ok(());
            }
            return Err(DomainError::conflict(format!(
                "event {} of subscription {} already recorded with different content",
                event.sequence, event.subscription_id
            ))
            .into());
        }

        stream.push(event);
        Ok(())
    }
}

impl BillingEventSource for InMemoryBillingEventSource {
    fn billing_events(&self, account_id: AccountId) -> Result<Vec<BillingEvent>, LedgerError> {
        let events = self.events.read().map_err(|_| LedgerError::Poisoned)?;
        Ok(events.get(&account_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_billing::{BillingEventKind, PlanPhaseRef};
    use cadence_core::SubscriptionId;
    use chrono::{TimeZone, Utc};

    fn start(sub: SubscriptionId, plan: &str) -> BillingEvent {
        BillingEvent {
            subscription_id: sub,
            effective_at: Utc.with_ymd_and_hms(2024, 4, 12, 4, 0, 0).unwrap(),
            sequence: 1,
            kind: BillingEventKind::Start,
            phase: PlanPhaseRef::new(plan, format!("{plan}-evergreen")),
        }
    }

    #[test]
    fn identical_redelivery_is_absorbed() {
        let source = InMemoryBillingEventSource::new();
        let account = AccountId::new();
        let sub = SubscriptionId::new();

        source.record(account, start(sub, "plan-b")).unwrap();
        source.record(account, start(sub, "plan-b")).unwrap();
        assert_eq!(source.billing_events(account).unwrap().len(), 1);

        let err = source.record(account, start(sub, "plan-c")).unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Conflict(_))));
        assert!(source.billing_events(AccountId::new()).unwrap().is_empty());
    }
}
