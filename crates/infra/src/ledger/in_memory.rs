use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use cadence_core::{
    AccountId, DomainError, Entity, InvoiceId, InvoiceItemId, PaymentId, SubscriptionId,
};
use cadence_events::BillingTrigger;
use cadence_invoicing::{
    FutureAccountNotifications, Invoice, InvoiceItem, InvoiceItemType, InvoicePayment,
    InvoiceStatus, TrackingRecord,
};

use super::r#trait::{CommitBatch, InvoiceLedger, InvoicePage, InvoiceQuery, LedgerError};
use crate::scheduler::NotificationScheduler;

#[derive(Debug, Default)]
struct LedgerState {
    invoices: HashMap<InvoiceId, Invoice>,
    /// Invoice ids per account in number order.
    by_account: HashMap<AccountId, Vec<InvoiceId>>,
    last_number: HashMap<AccountId, u64>,
    item_index: HashMap<InvoiceItemId, InvoiceId>,
    payments: Vec<InvoicePayment>,
    tracking: HashMap<AccountId, Vec<TrackingRecord>>,
    notifications: HashMap<AccountId, FutureAccountNotifications>,
    /// Account-wide wake-ups not tied to a subscription.
    wakeups: HashMap<AccountId, BTreeSet<DateTime<Utc>>>,
}

impl LedgerState {
    fn account_invoices(&self, account_id: AccountId) -> impl Iterator<Item = &Invoice> {
        self.by_account
            .get(&account_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.invoices.get(id))
    }

    fn settled_on(&self, invoice_id: InvoiceId) -> Decimal {
        self.payments
            .iter()
            .filter(|p| p.invoice_id == invoice_id && p.is_settled())
            .map(|p| p.amount)
            .sum()
    }
}

/// In-memory invoice ledger and notification schedule.
///
/// Intended for tests/dev. A single lock guards all state, so a commit (and
/// the schedule replacement it carries) is atomic with respect to readers.
#[derive(Debug, Default)]
pub struct InMemoryInvoiceStore {
    state: RwLock<LedgerState>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, LedgerState>, LedgerError> {
        self.state.read().map_err(|_| LedgerError::Poisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, LedgerState>, LedgerError> {
        self.state.write().map_err(|_| LedgerError::Poisoned)
    }
}

/// Check a batch against the stored state and strip items already present.
fn prepare(
    state: &LedgerState,
    account_id: AccountId,
    invoices: Vec<Invoice>,
) -> Result<Vec<Invoice>, DomainError> {
    let mut seen: HashSet<InvoiceItemId> = HashSet::new();
    let mut prepared = Vec::with_capacity(invoices.len());

    for mut invoice in invoices {
        if invoice.account_id() != account_id {
            return Err(DomainError::validation(format!(
                "invoice {} belongs to account {}, not {account_id}",
                invoice.id(),
                invoice.account_id()
            )));
        }
        if invoice.invoice_number().is_some() {
            return Err(DomainError::validation(format!(
                "invoice {} is already numbered",
                invoice.id()
            )));
        }
        if invoice.status() == InvoiceStatus::Void {
            return Err(DomainError::validation(format!(
                "invoice {} cannot be created void",
                invoice.id()
            )));
        }

        // An id held by a voided invoice cannot be reused: skipping it would
        // silently lose the charge.
        for item in invoice.items() {
            let voided = state
                .item_index
                .get(&item.id)
                .and_then(|id| state.invoices.get(id))
                .is_some_and(Invoice::is_void);
            if voided {
                return Err(DomainError::conflict(format!(
                    "item {} is already stored on a void invoice",
                    item.id
                )));
            }
        }
        invoice.retain_items(|item| {
            !state.item_index.contains_key(&item.id) && seen.insert(item.id)
        })?;
        if invoice.items().is_empty() {
            continue;
        }
        if state.invoices.contains_key(&invoice.id()) {
            return Err(DomainError::conflict(format!(
                "invoice {} already exists",
                invoice.id()
            )));
        }
        prepared.push(invoice);
    }
    Ok(prepared)
}

/// Active coverage of a charge once its repairs are applied.
struct Coverage {
    subscription_id: SubscriptionId,
    item_type: InvoiceItemType,
    start: NaiveDate,
    end: Option<NaiveDate>,
}

/// No two active charges of the same subscription and type may cover the
/// same dates.
fn check_coverage(items: &[&InvoiceItem]) -> Result<(), DomainError> {
    let mut repaired_from: HashMap<InvoiceItemId, NaiveDate> = HashMap::new();
    let mut charges: HashSet<InvoiceItemId> = HashSet::new();
    for item in items {
        if item.item_type.is_subscription_charge() {
            charges.insert(item.id);
        }
    }
    for item in items {
        if item.item_type != InvoiceItemType::RepairAdj {
            continue;
        }
        let Some(linked) = item.linked_item_id else {
            return Err(DomainError::validation(format!("repair {} is not linked", item.id)));
        };
        if !charges.contains(&linked) {
            return Err(DomainError::validation(format!(
                "repair {} links to unknown charge {linked}",
                item.id
            )));
        }
        repaired_from
            .entry(linked)
            .and_modify(|d| *d = (*d).min(item.start_date))
            .or_insert(item.start_date);
    }

    let mut active: Vec<Coverage> = Vec::new();
    for item in items {
        if !item.item_type.is_subscription_charge() {
            continue;
        }
        let Some(subscription_id) = item.subscription_id else {
            continue;
        };
        let cut = repaired_from.get(&item.id).copied();
        if cut.is_some_and(|c| c <= item.start_date) {
            continue;
        }
        let end = match (item.end_date, cut) {
            (Some(e), Some(c)) => Some(e.min(c)),
            (e, _) => e,
        };
        active.push(Coverage {
            subscription_id,
            item_type: item.item_type,
            start: item.start_date,
            end,
        });
    }

    active.sort_by_key(|c| (c.subscription_id, c.item_type, c.start));
    for pair in active.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.subscription_id != next.subscription_id || prev.item_type != next.item_type {
            continue;
        }
        // Point charges overlap only when dated the same day.
        let overlapping = match prev.end {
            Some(end) => next.start < end,
            None => next.start == prev.start,
        };
        if overlapping {
            return Err(DomainError::invariant(format!(
                "{:?} charges of subscription {} overlap from {}",
                next.item_type, next.subscription_id, next.start
            )));
        }
    }
    Ok(())
}

impl InvoiceLedger for InMemoryInvoiceStore {
    fn commit(&self, account_id: AccountId, batch: CommitBatch) -> Result<Vec<InvoiceItem>, LedgerError> {
        let mut state = self.write()?;

        // 1) Validate everything before the first write.
        let invoices = prepare(&state, account_id, batch.invoices)?;
        for record in &batch.tracking {
            if record.account_id != account_id {
                return Err(DomainError::validation(format!(
                    "tracking record {} belongs to another account",
                    record.tracking_id
                ))
                .into());
            }
        }
        let covered: Vec<&InvoiceItem> = state
            .account_invoices(account_id)
            .filter(|i| !i.is_void())
            .chain(invoices.iter())
            .flat_map(|i| i.items().iter())
            .collect();
        check_coverage(&covered)?;

        // 2) Apply.
        let mut created = Vec::new();
        let mut number = state.last_number.get(&account_id).copied().unwrap_or(0);
        for mut invoice in invoices {
            number += 1;
            invoice.assign_number(number)?;
            let invoice_id = invoice.id();
            for item in invoice.items() {
                state.item_index.insert(item.id, invoice_id);
                created.push(item.clone());
            }
            state.by_account.entry(account_id).or_default().push(invoice_id);
            state.invoices.insert(invoice_id, invoice);
        }
        state.last_number.insert(account_id, number);

        let mut tracking = batch.tracking;
        for record in &mut tracking {
            if record.invoice_id.is_some_and(|id| !state.invoices.contains_key(&id)) {
                record.invoice_id = None;
            }
        }
        let records = state.tracking.entry(account_id).or_default();
        for record in tracking {
            if !records.contains(&record) {
                records.push(record);
            }
        }
        if let Some(notifications) = batch.notifications {
            state.notifications.insert(account_id, notifications);
        }

        Ok(created)
    }

    fn get_by_id(&self, invoice_id: InvoiceId) -> Result<Option<Invoice>, LedgerError> {
        Ok(self.read()?.invoices.get(&invoice_id).cloned())
    }

    fn get_by_number(&self, account_id: AccountId, invoice_number: u64) -> Result<Option<Invoice>, LedgerError> {
        let state = self.read()?;
        Ok(state
            .account_invoices(account_id)
            .find(|i| i.invoice_number() == Some(invoice_number))
            .cloned())
    }

    fn get_by_invoice_item(&self, item_id: InvoiceItemId) -> Result<Option<Invoice>, LedgerError> {
        let state = self.read()?;
        Ok(state
            .item_index
            .get(&item_id)
            .and_then(|id| state.invoices.get(id))
            .cloned())
    }

    fn get_invoices_by_account(
        &self,
        account_id: AccountId,
        query: &InvoiceQuery,
    ) -> Result<Vec<Invoice>, LedgerError> {
        let state = self.read()?;
        Ok(state
            .account_invoices(account_id)
            .filter(|i| query.matches(i))
            .cloned()
            .collect())
    }

    fn get_invoice_id_by_payment_id(&self, payment_id: PaymentId) -> Result<Option<InvoiceId>, LedgerError> {
        let state = self.read()?;
        Ok(state
            .payments
            .iter()
            .find(|p| p.payment_id == payment_id)
            .map(|p| p.invoice_id))
    }

    fn get_invoice_payments_by_payment_id(
        &self,
        payment_id: PaymentId,
    ) -> Result<Vec<InvoicePayment>, LedgerError> {
        let state = self.read()?;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.payment_id == payment_id)
            .cloned()
            .collect())
    }

    fn get_invoice_status(&self, invoice_id: InvoiceId) -> Result<InvoiceStatus, LedgerError> {
        let state = self.read()?;
        state
            .invoices
            .get(&invoice_id)
            .map(Invoice::status)
            .ok_or_else(|| DomainError::not_found(format!("invoice {invoice_id}")).into())
    }

    fn get_account_balance(&self, account_id: AccountId) -> Result<Decimal, LedgerError> {
        let state = self.read()?;
        Ok(state
            .account_invoices(account_id)
            .filter(|i| !i.is_void())
            .map(|i| i.amount_charged() - state.settled_on(i.id()))
            .sum())
    }

    fn get_unpaid_invoices_by_account_id(
        &self,
        account_id: AccountId,
        from: Option<NaiveDate>,
        up_to: Option<NaiveDate>,
    ) -> Result<Vec<Invoice>, LedgerError> {
        let state = self.read()?;
        let query = InvoiceQuery {
            from,
            up_to,
            include_voided: false,
            include_migrated: false,
        };
        Ok(state
            .account_invoices(account_id)
            .filter(|i| i.status() == InvoiceStatus::Committed && query.matches(i))
            .filter(|i| i.amount_charged() - state.settled_on(i.id()) > Decimal::ZERO)
            .cloned()
            .collect())
    }

    fn reconcilable_items(&self, account_id: AccountId) -> Result<Vec<InvoiceItem>, LedgerError> {
        let state = self.read()?;
        Ok(state
            .account_invoices(account_id)
            .filter(|i| !i.is_void())
            .flat_map(|i| i.items().iter().cloned())
            .collect())
    }

    fn tracking_records(&self, account_id: AccountId) -> Result<Vec<TrackingRecord>, LedgerError> {
        Ok(self.read()?.tracking.get(&account_id).cloned().unwrap_or_default())
    }

    fn get_all(&self) -> Result<Vec<Invoice>, LedgerError> {
        let state = self.read()?;
        let mut invoices: Vec<Invoice> = state.invoices.values().cloned().collect();
        invoices.sort_by_key(|i| (i.account_id(), i.invoice_number()));
        Ok(invoices)
    }

    fn search_invoices(&self, key: &str, offset: usize, limit: usize) -> Result<InvoicePage, LedgerError> {
        let state = self.read()?;
        let key = key.trim();
        let mut matching: Vec<&Invoice> = state
            .invoices
            .values()
            .filter(|i| {
                i.id().to_string() == key
                    || i.account_id().to_string() == key
                    || i.invoice_number().is_some_and(|n| n.to_string() == key)
                    || i.currency().code().eq_ignore_ascii_case(key)
            })
            .collect();
        matching.sort_by_key(|i| (i.account_id(), i.invoice_number()));

        Ok(InvoicePage {
            offset,
            total: matching.len(),
            invoices: matching.into_iter().skip(offset).take(limit).cloned().collect(),
        })
    }

    fn get_invoice_payments_by_invoice(&self, invoice_id: InvoiceId) -> Result<Vec<InvoicePayment>, LedgerError> {
        let state = self.read()?;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    fn change_invoice_status(&self, invoice_id: InvoiceId, to: InvoiceStatus) -> Result<(), LedgerError> {
        let mut state = self.write()?;
        let invoice = state
            .invoices
            .get(&invoice_id)
            .ok_or_else(|| DomainError::not_found(format!("invoice {invoice_id}")))?;

        // Voiding a charge that a live repair still offsets would orphan the
        // repair.
        if to == InvoiceStatus::Void && !invoice.is_void() {
            let charges: HashSet<InvoiceItemId> = invoice.items().iter().map(|i| i.id).collect();
            let repaired = state
                .account_invoices(invoice.account_id())
                .filter(|other| other.id() != invoice_id && !other.is_void())
                .flat_map(|other| other.items())
                .find(|item| {
                    item.item_type == InvoiceItemType::RepairAdj
                        && item.linked_item_id.is_some_and(|linked| charges.contains(&linked))
                });
            if let Some(repair) = repaired {
                return Err(DomainError::invariant(format!(
                    "invoice {invoice_id} has items repaired by {} on invoice {}",
                    repair.id, repair.invoice_id
                ))
                .into());
            }
        }

        let invoice = state
            .invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| DomainError::not_found(format!("invoice {invoice_id}")))?;
        invoice.transition(to)?;
        Ok(())
    }

    fn record_payment(&self, payment: InvoicePayment) -> Result<(), LedgerError> {
        let mut state = self.write()?;
        let invoice = state
            .invoices
            .get(&payment.invoice_id)
            .ok_or_else(|| DomainError::not_found(format!("invoice {}", payment.invoice_id)))?;
        if invoice.is_void() {
            return Err(DomainError::invariant(format!(
                "cannot record payment on void invoice {}",
                payment.invoice_id
            ))
            .into());
        }
        if invoice.currency() != payment.currency {
            return Err(DomainError::validation(format!(
                "payment in {} for invoice in {}",
                payment.currency,
                invoice.currency()
            ))
            .into());
        }
        if state.payments.iter().any(|p| p.id == payment.id) {
            return Ok(());
        }
        state.payments.push(payment);
        Ok(())
    }
}

impl NotificationScheduler for InMemoryInvoiceStore {
    fn schedule_next(
        &self,
        account_id: AccountId,
        notifications: FutureAccountNotifications,
    ) -> Result<(), LedgerError> {
        self.write()?.notifications.insert(account_id, notifications);
        Ok(())
    }

    fn reschedule(&self, account_id: AccountId, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.write()?.wakeups.entry(account_id).or_default().insert(at);
        Ok(())
    }

    fn pending(&self, account_id: AccountId) -> Result<FutureAccountNotifications, LedgerError> {
        Ok(self
            .read()?
            .notifications
            .get(&account_id)
            .cloned()
            .unwrap_or_default())
    }

    fn take_due(&self, as_of: DateTime<Utc>) -> Result<Vec<BillingTrigger>, LedgerError> {
        let mut state = self.write()?;
        let mut triggers = Vec::new();

        for (account_id, notifications) in state.notifications.iter_mut() {
            for (sub, at) in notifications.take_due(as_of) {
                triggers.push(BillingTrigger::scheduled(*account_id, sub, at));
            }
        }
        for (account_id, wakeups) in state.wakeups.iter_mut() {
            let ready: Vec<DateTime<Utc>> = wakeups.iter().copied().take_while(|at| *at <= as_of).collect();
            for at in ready {
                wakeups.remove(&at);
                triggers.push(BillingTrigger::rescheduled(*account_id, at));
            }
        }
        state.wakeups.retain(|_, w| !w.is_empty());

        triggers.sort_by(|a, b| (a.effective_at, a.account_id).cmp(&(b.effective_at, b.account_id)));
        Ok(triggers)
    }
}
