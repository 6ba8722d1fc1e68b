use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use cadence_core::{AccountId, Currency, DomainError, DomainResult, SubscriptionId};

use crate::catalog::PlanPhaseRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventKind {
    Start,
    PhaseChange,
    PlanChange,
    Cancel,
    Pause,
    Resume,
}

/// A subscription lifecycle change that affects billing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub subscription_id: SubscriptionId,
    pub effective_at: DateTime<Utc>,
    /// Tie-breaker for events at the same instant.
    pub sequence: u64,
    pub kind: BillingEventKind,
    /// Phase in force from this event on (for cancel and pause, the phase
    /// that was active).
    pub phase: PlanPhaseRef,
}

/// All billing events of one account plus the account context needed to
/// project them. Events are kept ordered by `(effective_at, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEventSet {
    account_id: AccountId,
    time_zone: Tz,
    currency: Currency,
    bill_cycle_day: Option<u32>,
    events: Vec<BillingEvent>,
}

impl BillingEventSet {
    pub fn new(
        account_id: AccountId,
        time_zone: Tz,
        currency: Currency,
        bill_cycle_day: Option<u32>,
        mut events: Vec<BillingEvent>,
    ) -> DomainResult<Self> {
        if let Some(day) = bill_cycle_day {
            if !(1..=31).contains(&day) {
                return Err(DomainError::validation(format!(
                    "bill cycle day {day} is not in 1..=31"
                )));
            }
        }

        let mut seen = HashSet::with_capacity(events.len());
        for e in &events {
            if !seen.insert((e.subscription_id, e.sequence)) {
                return Err(DomainError::validation(format!(
                    "duplicate event sequence {} for subscription {}",
                    e.sequence, e.subscription_id
                )));
            }
        }

        events.sort_by(|a, b| {
            a.effective_at
                .cmp(&b.effective_at)
                .then(a.sequence.cmp(&b.sequence))
        });

        Ok(Self {
            account_id,
            time_zone,
            currency,
            bill_cycle_day,
            events,
        })
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn bill_cycle_day(&self) -> Option<u32> {
        self.bill_cycle_day
    }

    pub fn events(&self) -> &[BillingEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn subscriptions(&self) -> BTreeSet<SubscriptionId> {
        self.events.iter().map(|e| e.subscription_id).collect()
    }

    /// Events of one subscription, in order.
    pub fn events_for(&self, subscription_id: SubscriptionId) -> impl Iterator<Item = &BillingEvent> {
        self.events
            .iter()
            .filter(move |e| e.subscription_id == subscription_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(sub: SubscriptionId, hour: u32, sequence: u64, kind: BillingEventKind) -> BillingEvent {
        BillingEvent {
            subscription_id: sub,
            effective_at: Utc.with_ymd_and_hms(2024, 4, 12, hour, 0, 0).unwrap(),
            sequence,
            kind,
            phase: PlanPhaseRef::new("plan-b", "plan-b-evergreen"),
        }
    }

    #[test]
    fn events_are_ordered_by_instant_then_sequence() {
        let sub = SubscriptionId::new();
        let set = BillingEventSet::new(
            AccountId::new(),
            chrono_tz::UTC,
            Currency::Usd,
            None,
            vec![
                event(sub, 12, 3, BillingEventKind::Cancel),
                event(sub, 10, 2, BillingEventKind::PlanChange),
                event(sub, 10, 1, BillingEventKind::Start),
            ],
        )
        .unwrap();

        let sequences: Vec<u64> = set.events().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(set.subscriptions().len(), 1);
    }

    #[test]
    fn duplicate_sequence_is_rejected() {
        let sub = SubscriptionId::new();
        let err = BillingEventSet::new(
            AccountId::new(),
            chrono_tz::UTC,
            Currency::Usd,
            None,
            vec![
                event(sub, 10, 1, BillingEventKind::Start),
                event(sub, 11, 1, BillingEventKind::Cancel),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn bill_cycle_day_must_be_a_day_of_month() {
        let result = BillingEventSet::new(AccountId::new(), chrono_tz::UTC, Currency::Usd, Some(32), vec![]);
        assert!(result.is_err());
    }
}
