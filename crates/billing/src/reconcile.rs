//! Reconciliation: candidate items vs. what is already invoiced.
//!
//! Committed items are never touched. When the projection no longer agrees
//! with an invoiced item, a `RepairAdj` item linked to it offsets the
//! difference and the new candidate (if any) is added alongside.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use rust_decimal::Decimal;

use cadence_core::{DomainError, DomainResult, InvoiceItemId, SubscriptionId};
use cadence_invoicing::{
    InvoiceItem, InvoiceItemType, ProposedItem, TrackingId, TrackingRecord, fingerprint,
};

type ItemKey = (SubscriptionId, InvoiceItemType, NaiveDate);

/// The delta a recompute has to persist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub items_to_add: Vec<ProposedItem>,
    pub repair_items: Vec<ProposedItem>,
    /// Fingerprint of the candidate set this delta was computed from.
    pub fingerprint: String,
    /// Every tracking id was already recorded for this exact candidate set.
    pub duplicate_submission: bool,
}

impl ReconciliationResult {
    pub fn is_empty(&self) -> bool {
        self.items_to_add.is_empty() && self.repair_items.is_empty()
    }

    /// New charges first, then repairs.
    pub fn into_items(self) -> Vec<ProposedItem> {
        let mut items = self.items_to_add;
        items.extend(self.repair_items);
        items
    }

    /// Move items off ids that are already taken.
    ///
    /// `taken` are the item ids of voided invoices: they are not part of the
    /// reconciliation input but the ledger never stores them twice. The new id
    /// is derived, so the same delta always gets the same ids.
    pub fn reissue_taken_ids(&mut self, taken: &HashSet<InvoiceItemId>) {
        for item in self.items_to_add.iter_mut().chain(self.repair_items.iter_mut()) {
            let original = item.id;
            let mut attempt = 0u32;
            while taken.contains(&item.id) {
                attempt += 1;
                item.id = InvoiceItemId::derive(&[
                    &original.to_string(),
                    "reissue",
                    &attempt.to_string(),
                ]);
            }
        }
    }

    pub fn total(&self) -> Decimal {
        self.items_to_add
            .iter()
            .chain(&self.repair_items)
            .map(|i| i.amount)
            .sum()
    }
}

/// An invoiced subscription charge with its repairs folded in.
#[derive(Debug)]
struct Invoiced<'a> {
    item: &'a InvoiceItem,
    net: Decimal,
    /// Exclusive end of the still-billed range.
    active_end: Option<NaiveDate>,
    active: bool,
}

impl<'a> Invoiced<'a> {
    fn fold(item: &'a InvoiceItem, repairs: &[&InvoiceItem]) -> Self {
        let net = item.amount + repairs.iter().map(|r| r.amount).sum::<Decimal>();
        let repaired_from = repairs.iter().map(|r| r.start_date).min();
        let active = repaired_from.is_none_or(|from| from > item.start_date);
        let active_end = match (item.end_date, repaired_from) {
            (Some(end), Some(from)) => Some(end.min(from)),
            (end, _) => end,
        };
        Self {
            item,
            net,
            active_end,
            active,
        }
    }

    fn key(&self) -> Option<ItemKey> {
        self.item
            .subscription_id
            .map(|sub| (sub, self.item.item_type, self.item.start_date))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl Reconciler {
    pub fn new() -> Self {
        Self
    }

    /// Compute the minimal delta turning `existing` into `candidates`.
    ///
    /// `existing` are the items of every non-void invoice of the account.
    pub fn reconcile(
        &self,
        candidates: &[ProposedItem],
        existing: &[InvoiceItem],
        tracking_ids: &[TrackingId],
        recorded: &[TrackingRecord],
    ) -> DomainResult<ReconciliationResult> {
        let fingerprint = fingerprint(candidates)?;

        let already_recorded = !tracking_ids.is_empty()
            && tracking_ids.iter().all(|id| {
                recorded
                    .iter()
                    .any(|r| &r.tracking_id == id && r.fingerprint == fingerprint)
            });
        if already_recorded {
            return Ok(ReconciliationResult {
                fingerprint,
                duplicate_submission: true,
                ..ReconciliationResult::default()
            });
        }

        let mut by_key: BTreeMap<ItemKey, &ProposedItem> = BTreeMap::new();
        for candidate in candidates {
            let key = candidate_key(candidate)?;
            if by_key.insert(key, candidate).is_some() {
                return Err(DomainError::invariant(format!(
                    "two candidates for {:?} of subscription {} starting {}",
                    key.1, key.0, key.2
                )));
            }
        }

        let invoiced = fold_existing(existing);
        let mut prior_count: HashMap<ItemKey, usize> = HashMap::new();
        for entry in &invoiced {
            if let Some(key) = entry.key() {
                *prior_count.entry(key).or_default() += 1;
            }
        }

        let mut repair_items = Vec::new();
        for entry in invoiced.iter().filter(|e| e.active) {
            let Some(key) = entry.key() else { continue };
            let candidate = by_key.get(&key).copied();
            match candidate {
                Some(c) if c.end_date == entry.active_end && c.amount == entry.net => {
                    by_key.remove(&key);
                }
                Some(c) if is_shortened(c, entry) => {
                    let (Some(from), Some(to)) = (c.end_date, entry.active_end) else {
                        continue;
                    };
                    repair_items.push(repair(entry, from, Some(to), c.amount - entry.net));
                    by_key.remove(&key);
                }
                _ => {
                    repair_items.push(repair(entry, entry.item.start_date, entry.active_end, -entry.net));
                }
            }
        }

        let items_to_add: Vec<ProposedItem> = candidates
            .iter()
            .filter(|c| candidate_key(c).is_ok_and(|k| by_key.contains_key(&k)))
            .map(|c| {
                let prior = candidate_key(c)
                    .ok()
                    .and_then(|k| prior_count.get(&k).copied())
                    .unwrap_or(0);
                if prior == 0 {
                    c.clone()
                } else {
                    let id = InvoiceItemId::derive(&[&c.id.to_string(), &prior.to_string()]);
                    c.clone().with_id(id)
                }
            })
            .collect();

        repair_items.sort_by(|a, b| {
            (a.start_date, a.subscription_id, a.linked_item_id).cmp(&(
                b.start_date,
                b.subscription_id,
                b.linked_item_id,
            ))
        });

        let result = ReconciliationResult {
            items_to_add,
            repair_items,
            fingerprint,
            duplicate_submission: false,
        };
        verify_equivalence(&invoiced, &result, candidates)?;
        Ok(result)
    }
}

fn candidate_key(candidate: &ProposedItem) -> DomainResult<ItemKey> {
    let sub = candidate.subscription_id.ok_or_else(|| {
        DomainError::invariant(format!("candidate {} has no subscription", candidate.id))
    })?;
    if !candidate.item_type.is_subscription_charge() {
        return Err(DomainError::invariant(format!(
            "candidate {} is a {:?}, not a subscription charge",
            candidate.id, candidate.item_type
        )));
    }
    Ok((sub, candidate.item_type, candidate.start_date))
}

/// Subscription charges with their linked repairs, in a stable order.
fn fold_existing(existing: &[InvoiceItem]) -> Vec<Invoiced<'_>> {
    let mut repairs: HashMap<InvoiceItemId, Vec<&InvoiceItem>> = HashMap::new();
    for item in existing {
        if let (InvoiceItemType::RepairAdj, Some(linked)) = (item.item_type, item.linked_item_id) {
            repairs.entry(linked).or_default().push(item);
        }
    }

    let mut folded: Vec<Invoiced<'_>> = existing
        .iter()
        .filter(|i| i.item_type.is_subscription_charge() && i.subscription_id.is_some())
        .map(|i| Invoiced::fold(i, repairs.get(&i.id).map(Vec::as_slice).unwrap_or(&[])))
        .collect();
    folded.sort_by(|a, b| {
        (a.item.start_date, a.item.subscription_id, a.item.item_type, a.item.id).cmp(&(
            b.item.start_date,
            b.item.subscription_id,
            b.item.item_type,
            b.item.id,
        ))
    });
    folded
}

/// Same start, coverage cut short, and no more money than already billed.
fn is_shortened(candidate: &ProposedItem, entry: &Invoiced<'_>) -> bool {
    match (candidate.end_date, entry.active_end) {
        (Some(new_end), Some(old_end)) => new_end < old_end && candidate.amount <= entry.net,
        _ => false,
    }
}

fn repair(
    entry: &Invoiced<'_>,
    start: NaiveDate,
    end: Option<NaiveDate>,
    amount: Decimal,
) -> ProposedItem {
    let end_part = end.map(|d| d.to_string()).unwrap_or_default();
    let id = InvoiceItemId::derive(&[
        "repair",
        &entry.item.id.to_string(),
        &start.to_string(),
        &end_part,
    ]);
    ProposedItem::repair(id, entry.item, start, end, amount)
}

/// Net invoiced amount after applying the delta must equal the projection.
fn verify_equivalence(
    invoiced: &[Invoiced<'_>],
    result: &ReconciliationResult,
    candidates: &[ProposedItem],
) -> DomainResult<()> {
    let before: Decimal = invoiced.iter().map(|e| e.net).sum();
    let after = before + result.total();
    let expected: Decimal = candidates.iter().map(|c| c.amount).sum();
    if after != expected {
        return Err(DomainError::invariant(format!(
            "reconciled total {after} differs from projected total {expected}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{AccountId, Currency, InvoiceId};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn monthly(sub: SubscriptionId, start: NaiveDate, end: NaiveDate, amount: i64) -> ProposedItem {
        ProposedItem::recurring(
            sub,
            "monthly",
            "monthly-evergreen",
            start,
            end,
            Decimal::from(amount),
            Decimal::from(31),
            Currency::Usd,
        )
    }

    fn persist(items: Vec<ProposedItem>) -> Vec<InvoiceItem> {
        let invoice_id = InvoiceId::new();
        let account_id = AccountId::new();
        items
            .into_iter()
            .map(|i| i.into_invoice_item(invoice_id, account_id))
            .collect()
    }

    #[test]
    fn nothing_invoiced_yet_adds_every_candidate() {
        let sub = SubscriptionId::new();
        let candidates = vec![monthly(sub, date(2024, 1, 1), date(2024, 2, 1), 31)];
        let result = Reconciler::new().reconcile(&candidates, &[], &[], &[]).unwrap();
        assert_eq!(result.items_to_add, candidates);
        assert!(result.repair_items.is_empty());
    }

    #[test]
    fn already_invoiced_candidates_are_dropped() {
        let sub = SubscriptionId::new();
        let candidates = vec![monthly(sub, date(2024, 1, 1), date(2024, 2, 1), 31)];
        let existing = persist(candidates.clone());
        let result = Reconciler::new().reconcile(&candidates, &existing, &[], &[]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn retroactive_cancel_repairs_the_unused_portion() {
        let sub = SubscriptionId::new();
        let existing = persist(vec![monthly(sub, date(2024, 1, 1), date(2024, 2, 1), 31)]);
        let candidates = vec![monthly(sub, date(2024, 1, 1), date(2024, 1, 16), 15)];

        let result = Reconciler::new().reconcile(&candidates, &existing, &[], &[]).unwrap();
        assert!(result.items_to_add.is_empty());
        assert_eq!(result.repair_items.len(), 1);

        let repair = &result.repair_items[0];
        assert_eq!(repair.item_type, InvoiceItemType::RepairAdj);
        assert_eq!(repair.linked_item_id, Some(existing[0].id));
        assert_eq!(repair.start_date, date(2024, 1, 16));
        assert_eq!(repair.end_date, Some(date(2024, 2, 1)));
        assert_eq!(repair.amount, Decimal::from(-16));

        // Once the repair is invoiced the same projection is a no-op.
        let mut after = existing.clone();
        after.extend(persist(result.repair_items.clone()));
        let again = Reconciler::new().reconcile(&candidates, &after, &[], &[]).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn removed_subscription_is_fully_repaired() {
        let sub = SubscriptionId::new();
        let existing = persist(vec![monthly(sub, date(2024, 1, 1), date(2024, 2, 1), 31)]);
        let result = Reconciler::new().reconcile(&[], &existing, &[], &[]).unwrap();
        assert_eq!(result.repair_items.len(), 1);
        assert_eq!(result.repair_items[0].amount, Decimal::from(-31));
        assert_eq!(result.repair_items[0].start_date, date(2024, 1, 1));
    }

    #[test]
    fn price_increase_repairs_and_rebills() {
        let sub = SubscriptionId::new();
        let existing = persist(vec![monthly(sub, date(2024, 1, 1), date(2024, 2, 1), 31)]);
        let candidates = vec![monthly(sub, date(2024, 1, 1), date(2024, 2, 1), 40)];

        let result = Reconciler::new().reconcile(&candidates, &existing, &[], &[]).unwrap();
        assert_eq!(result.repair_items.len(), 1);
        assert_eq!(result.repair_items[0].amount, Decimal::from(-31));
        assert_eq!(result.items_to_add.len(), 1);
        // Same content as an earlier item, so the id must differ from the candidate's.
        assert_ne!(result.items_to_add[0].id, candidates[0].id);
        assert_eq!(result.items_to_add[0].amount, Decimal::from(40));
    }

    #[test]
    fn duplicate_submission_returns_an_empty_delta() {
        let sub = SubscriptionId::new();
        let candidates = vec![monthly(sub, date(2024, 1, 1), date(2024, 2, 1), 31)];
        let tracking = TrackingId::new("trigger-1").unwrap();
        let recorded = vec![TrackingRecord {
            tracking_id: tracking.clone(),
            account_id: AccountId::new(),
            invoice_id: None,
            target_date: date(2024, 1, 1),
            fingerprint: fingerprint(&candidates).unwrap(),
        }];

        let result = Reconciler::new()
            .reconcile(&candidates, &[], &[tracking], &recorded)
            .unwrap();
        assert!(result.is_empty());
        assert!(result.duplicate_submission);
    }

    #[test]
    fn voided_ids_are_reissued_deterministically() {
        let sub = SubscriptionId::new();
        let candidates = vec![monthly(sub, date(2024, 1, 1), date(2024, 2, 1), 31)];
        let voided = candidates[0].id;

        let mut first = Reconciler::new().reconcile(&candidates, &[], &[], &[]).unwrap();
        let mut taken = HashSet::from([voided]);
        first.reissue_taken_ids(&taken);
        let reissued = first.items_to_add[0].id;
        assert_ne!(reissued, voided);
        assert_eq!(first.items_to_add[0].amount, Decimal::from(31));

        let mut again = Reconciler::new().reconcile(&candidates, &[], &[], &[]).unwrap();
        again.reissue_taken_ids(&taken);
        assert_eq!(again.items_to_add[0].id, reissued);

        // Voided a second time.
        taken.insert(reissued);
        let mut third = Reconciler::new().reconcile(&candidates, &[], &[], &[]).unwrap();
        third.reissue_taken_ids(&taken);
        assert!(!taken.contains(&third.items_to_add[0].id));
    }

    #[test]
    fn credits_and_external_charges_are_ignored() {
        let sub = SubscriptionId::new();
        let candidates = vec![monthly(sub, date(2024, 1, 1), date(2024, 2, 1), 31)];
        let mut credit = persist(candidates.clone()).remove(0);
        credit.id = InvoiceItemId::new();
        credit.item_type = InvoiceItemType::CreditAdj;
        credit.amount = Decimal::from(-5);

        let result = Reconciler::new().reconcile(&candidates, &[credit], &[], &[]).unwrap();
        assert_eq!(result.items_to_add.len(), 1);
        assert!(result.repair_items.is_empty());
    }

    mod recompute {
        use super::*;
        use crate::billing_event::{BillingEvent, BillingEventKind, BillingEventSet};
        use crate::calendar::BillingPeriod;
        use crate::catalog::{
            BillingAlignment, BillingMode, InMemoryCatalog, PhaseDuration, PhaseType, Plan,
            PlanPhase, PlanPhaseRef,
        };
        use crate::projector::TimelineProjector;
        use chrono::{Days, TimeZone, Utc};
        use proptest::prelude::*;

        fn catalog() -> InMemoryCatalog {
            let phase = |name: &str, fixed, price: i64, period, mode| PlanPhase {
                name: name.to_string(),
                phase_type: PhaseType::Evergreen,
                duration: PhaseDuration::Unlimited,
                fixed_price: fixed,
                recurring_price: Some(Decimal::from(price)),
                billing_period: period,
                billing_mode: mode,
                alignment: BillingAlignment::Subscription,
                currency: Currency::Usd,
            };
            InMemoryCatalog::new()
                .with_plan(Plan {
                    name: "monthly".to_string(),
                    phases: vec![phase(
                        "monthly-evergreen",
                        None,
                        31,
                        BillingPeriod::Monthly,
                        BillingMode::InAdvance,
                    )],
                })
                .with_plan(Plan {
                    name: "daily".to_string(),
                    phases: vec![phase(
                        "daily-evergreen",
                        Some(Decimal::ZERO),
                        1,
                        BillingPeriod::Daily,
                        BillingMode::InArrears,
                    )],
                })
        }

        fn history(plan: &str, start_offset: u64, cancel_after: Option<u64>) -> BillingEventSet {
            let sub = SubscriptionId::derive(&["test", plan]);
            let phase = PlanPhaseRef::new(plan, format!("{plan}-evergreen"));
            let started = Utc.with_ymd_and_hms(2024, 1, 1, 9, 30, 0).unwrap()
                + chrono::TimeDelta::days(start_offset as i64);
            let mut events = vec![BillingEvent {
                subscription_id: sub,
                effective_at: started,
                sequence: 1,
                kind: BillingEventKind::Start,
                phase: phase.clone(),
            }];
            if let Some(after) = cancel_after {
                events.push(BillingEvent {
                    subscription_id: sub,
                    effective_at: started + chrono::TimeDelta::days(after as i64),
                    sequence: 2,
                    kind: BillingEventKind::Cancel,
                    phase,
                });
            }
            BillingEventSet::new(AccountId::derive(&["test"]), chrono_tz::UTC, Currency::Usd, None, events)
                .unwrap()
        }

        /// A started subscription followed by lifecycle changes that are
        /// legal in the state reached so far. Each step is (choice, days since
        /// the previous event).
        fn lifecycle(steps: &[(u8, u64)]) -> Vec<BillingEvent> {
            let sub = SubscriptionId::derive(&["test", "lifecycle"]);
            let event = |at, sequence, kind, plan: &str| BillingEvent {
                subscription_id: sub,
                effective_at: at,
                sequence,
                kind,
                phase: PlanPhaseRef::new(plan, format!("{plan}-evergreen")),
            };

            let mut at = Utc.with_ymd_and_hms(2024, 1, 1, 9, 30, 0).unwrap();
            let mut plan = "monthly";
            let mut paused = false;
            let mut events = vec![event(at, 1, BillingEventKind::Start, plan)];
            for (sequence, (choice, gap)) in (2u64..).zip(steps) {
                let choices: &[BillingEventKind] = if paused {
                    &[BillingEventKind::Resume, BillingEventKind::Cancel]
                } else {
                    &[
                        BillingEventKind::PlanChange,
                        BillingEventKind::PhaseChange,
                        BillingEventKind::Pause,
                        BillingEventKind::Cancel,
                    ]
                };
                let kind = choices[usize::from(*choice) % choices.len()];
                at += chrono::TimeDelta::days(*gap as i64);
                match kind {
                    BillingEventKind::PlanChange => {
                        plan = if plan == "monthly" { "daily" } else { "monthly" };
                    }
                    BillingEventKind::Pause => paused = true,
                    BillingEventKind::Resume => paused = false,
                    _ => {}
                }
                events.push(event(at, sequence, kind, plan));
                if kind == BillingEventKind::Cancel {
                    break;
                }
            }
            events
        }

        fn apply(ledger: &mut Vec<InvoiceItem>, candidates: &[ProposedItem]) -> ReconciliationResult {
            let result = Reconciler::new().reconcile(candidates, ledger, &[], &[]).unwrap();
            ledger.extend(persist(result.clone().into_items()));
            result
        }

        fn active_coverage(ledger: &[InvoiceItem]) -> Vec<(NaiveDate, Option<NaiveDate>, Decimal)> {
            let mut v: Vec<_> = fold_existing(ledger)
                .into_iter()
                .filter(|e| e.active)
                .map(|e| (e.item.start_date, e.active_end, e.net))
                .collect();
            v.sort();
            v
        }

        proptest! {
            #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

            #[test]
            fn incremental_recompute_matches_a_single_recompute(
                monthly_plan in any::<bool>(),
                start_offset in 0u64..40,
                cancel_after in proptest::option::of(0u64..120),
                first_target in 0u64..90,
                extra_days in 0u64..90,
            ) {
                let plan = if monthly_plan { "monthly" } else { "daily" };
                let catalog = catalog();
                let projector = TimelineProjector::default();
                let base = date(2024, 1, 1);
                let t1 = base + Days::new(first_target);
                let t2 = t1 + Days::new(extra_days);

                let before_cancel = history(plan, start_offset, None);
                let after_cancel = history(plan, start_offset, cancel_after);

                let mut ledger = Vec::new();
                let first = projector.project(&before_cancel, t1, &catalog).unwrap();
                apply(&mut ledger, &first);
                let second = projector.project(&after_cancel, t2, &catalog).unwrap();
                apply(&mut ledger, &second);

                let fresh = projector.project(&after_cancel, t2, &catalog).unwrap();
                let mut expected: Vec<_> = fresh
                    .iter()
                    .map(|c| (c.start_date, c.end_date, c.amount))
                    .collect();
                expected.sort();
                prop_assert_eq!(active_coverage(&ledger), expected);

                let invoiced: Decimal = ledger.iter().map(|i| i.amount).sum();
                let projected: Decimal = fresh.iter().map(|c| c.amount).sum();
                prop_assert_eq!(invoiced, projected);

                let again = apply(&mut ledger, &fresh);
                prop_assert!(again.is_empty());
            }

            #[test]
            fn recompute_after_every_lifecycle_change_matches_a_single_recompute(
                steps in proptest::collection::vec((any::<u8>(), 0u64..25), 0..7),
                extra_days in 0u64..60,
            ) {
                let catalog = catalog();
                let projector = TimelineProjector::default();
                let events = lifecycle(&steps);
                let known = |n: usize| {
                    BillingEventSet::new(
                        AccountId::derive(&["test"]),
                        chrono_tz::UTC,
                        Currency::Usd,
                        None,
                        events[..n].to_vec(),
                    )
                    .unwrap()
                };

                // Each recompute runs on the day the next change lands, before
                // that change is known.
                let mut ledger = Vec::new();
                for n in 1..events.len() {
                    let target = events[n].effective_at.date_naive();
                    let candidates = projector.project(&known(n), target, &catalog).unwrap();
                    apply(&mut ledger, &candidates);
                }

                let last = events[events.len() - 1].effective_at.date_naive();
                let target = last + Days::new(extra_days);
                let full = known(events.len());
                let fresh = projector.project(&full, target, &catalog).unwrap();
                apply(&mut ledger, &fresh);

                let mut expected: Vec<_> = fresh
                    .iter()
                    .map(|c| (c.start_date, c.end_date, c.amount))
                    .collect();
                expected.sort();
                prop_assert_eq!(active_coverage(&ledger), expected);

                let invoiced: Decimal = ledger.iter().map(|i| i.amount).sum();
                let projected: Decimal = fresh.iter().map(|c| c.amount).sum();
                prop_assert_eq!(invoiced, projected);

                prop_assert!(apply(&mut ledger, &fresh).is_empty());
            }
        }
    }
}
