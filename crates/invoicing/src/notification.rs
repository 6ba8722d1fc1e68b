use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::SubscriptionId;

/// Instants at which each subscription of an account must be re-evaluated.
///
/// Replaced wholesale on every successful recompute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FutureAccountNotifications {
    per_subscription: BTreeMap<SubscriptionId, BTreeSet<DateTime<Utc>>>,
}

impl FutureAccountNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, subscription_id: SubscriptionId, at: DateTime<Utc>) {
        self.per_subscription.entry(subscription_id).or_default().insert(at);
    }

    pub fn is_empty(&self) -> bool {
        self.per_subscription.values().all(BTreeSet::is_empty)
    }

    pub fn for_subscription(&self, subscription_id: SubscriptionId) -> Option<&BTreeSet<DateTime<Utc>>> {
        self.per_subscription.get(&subscription_id)
    }

    /// Earliest instant across all subscriptions.
    pub fn next_instant(&self) -> Option<DateTime<Utc>> {
        self.per_subscription.values().filter_map(|s| s.first().copied()).min()
    }

    /// Remove and return every instant at or before `as_of`.
    pub fn take_due(&mut self, as_of: DateTime<Utc>) -> Vec<(SubscriptionId, DateTime<Utc>)> {
        let mut due = Vec::new();
        for (sub, instants) in self.per_subscription.iter_mut() {
            let ready: Vec<DateTime<Utc>> = instants.iter().copied().take_while(|at| *at <= as_of).collect();
            for at in ready {
                instants.remove(&at);
                due.push((*sub, at));
            }
        }
        self.per_subscription.retain(|_, instants| !instants.is_empty());
        due
    }

    /// `(subscription, instant)` pairs in subscription then time order.
    pub fn iter(&self) -> impl Iterator<Item = (SubscriptionId, DateTime<Utc>)> + '_ {
        self.per_subscription
            .iter()
            .flat_map(|(sub, instants)| instants.iter().map(move |at| (*sub, *at)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_instant_is_the_earliest_across_subscriptions() {
        let mut n = FutureAccountNotifications::new();
        assert!(n.is_empty());
        assert_eq!(n.next_instant(), None);

        let a = SubscriptionId::new();
        let b = SubscriptionId::new();
        let early = Utc.with_ymd_and_hms(2024, 4, 13, 4, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 5, 13, 4, 0, 0).unwrap();
        n.add(a, late);
        n.add(b, early);
        n.add(b, early);

        assert_eq!(n.next_instant(), Some(early));
        assert_eq!(n.iter().count(), 2);
        assert_eq!(n.for_subscription(b).map(|s| s.len()), Some(1));
    }

    #[test]
    fn take_due_removes_only_elapsed_instants() {
        let mut n = FutureAccountNotifications::new();
        let sub = SubscriptionId::new();
        let first = Utc.with_ymd_and_hms(2024, 4, 13, 4, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 4, 14, 4, 0, 0).unwrap();
        n.add(sub, first);
        n.add(sub, second);

        assert_eq!(n.take_due(first), vec![(sub, first)]);
        assert_eq!(n.next_instant(), Some(second));
        assert_eq!(n.take_due(second), vec![(sub, second)]);
        assert!(n.is_empty());
    }
}
