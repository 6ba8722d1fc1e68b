//! Invoice generation pipeline.
//!
//! ```text
//! BillingTrigger / create_invoices(account, as_of, tracking_id)
//!   ↓  (per-account lock held from here to the publish)
//! 1. Load account context + billing events
//!   ↓
//! 2. Project candidate items up to the local date of `as_of`
//!   ↓
//! 3. Reconcile against every non-void invoice item (+ tracking guard)
//!   ↓
//! 4. Commit new invoice, tracking record and notification schedule atomically
//!   ↓
//! 5. Publish InvoiceCreated / NullInvoice
//! ```
//!
//! Nothing here reads the wall clock and nothing is retried. A failure before
//! step 4 writes nothing; a failure in step 5 leaves the commit in place and
//! re-running the same trigger republishes without creating anything new.
//! Notification event ids are derived from the invoice (or the tracking id for
//! a null invoice), so a republished notification carries the same event id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use cadence_billing::{BillingEventSet, CalendarResolver, Catalog, Reconciler, TimelineProjector};
use cadence_core::{AccountId, Currency, DomainError, Entity, InvoiceId, InvoiceItemId};
use cadence_events::{BillingTrigger, EventBus, EventEnvelope, InvoiceNotification};
use cadence_invoicing::{
    Invoice, InvoiceItem, InvoiceStatus, ProposedItem, TrackingId, TrackingRecord,
};

use crate::accounts::AccountStore;
use crate::config::EngineConfig;
use crate::event_source::BillingEventSource;
use crate::ledger::{CommitBatch, InvoiceLedger, InvoiceQuery, LedgerError};
use crate::locks::{AccountLocks, LockPoisoned};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Deterministic failure: bad input, catalog gap, broken invariant.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Storage failure; the recompute wrote nothing.
    #[error(transparent)]
    Ledger(LedgerError),

    #[error(transparent)]
    Lock(#[from] LockPoisoned),

    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),

    /// Publication failed after a successful commit.
    #[error("publish failed: {0}")]
    Publish(String),
}

impl From<LedgerError> for DispatchError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::Domain(err) => DispatchError::Domain(err),
            other => DispatchError::Ledger(other),
        }
    }
}

/// What one recompute produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceOutcome {
    pub account_id: AccountId,
    /// Local date of `as_of` in the account's time zone.
    pub target_date: NaiveDate,
    /// The invoice created by this recompute, if any.
    pub invoice: Option<Invoice>,
    /// Items actually created (new charges and repairs).
    pub items: Vec<InvoiceItem>,
    /// The tracking id had already produced this exact candidate set.
    pub duplicate_submission: bool,
}

impl InvoiceOutcome {
    pub fn is_null(&self) -> bool {
        self.invoice.is_none()
    }

    pub fn amount(&self) -> Decimal {
        self.items.iter().map(|i| i.amount).sum()
    }
}

/// Recomputes the invoices of one account at a time.
///
/// ## Guarantees
///
/// - One recompute per account at a time (`AccountLocks`); accounts run in parallel
/// - Ledger writes are a single atomic `commit`
/// - Notifications are published only after the commit succeeded
/// - Re-running a recompute with the same input creates nothing new
pub struct InvoiceDispatcher<L, B> {
    ledger: L,
    bus: B,
    accounts: Arc<dyn AccountStore>,
    events: Arc<dyn BillingEventSource>,
    catalog: Arc<dyn Catalog>,
    locks: AccountLocks,
    projector: TimelineProjector,
    reconciler: Reconciler,
    config: EngineConfig,
    /// Last envelope sequence number published per account.
    sequences: Mutex<HashMap<AccountId, u64>>,
}

impl<L, B> InvoiceDispatcher<L, B> {
    pub fn new(
        ledger: L,
        bus: B,
        accounts: Arc<dyn AccountStore>,
        events: Arc<dyn BillingEventSource>,
        catalog: Arc<dyn Catalog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            bus,
            accounts,
            events,
            catalog,
            locks: AccountLocks::new(),
            projector: TimelineProjector::new(config.rounding),
            reconciler: Reconciler::new(),
            config,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }
}

impl<L, B> InvoiceDispatcher<L, B>
where
    L: InvoiceLedger,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Bring the account's invoices up to date as of `as_of`.
    #[instrument(
        skip_all,
        fields(account_id = %account_id, tracking_id = %tracking_id, as_of = %as_of),
        err
    )]
    pub fn create_invoices(
        &self,
        account_id: AccountId,
        as_of: DateTime<Utc>,
        tracking_id: TrackingId,
    ) -> Result<InvoiceOutcome, DispatchError> {
        self.locks
            .with_account(account_id, || self.recompute(account_id, as_of, tracking_id))?
    }

    /// Handle a bus trigger; the trigger id doubles as tracking id.
    pub fn handle_trigger(&self, trigger: &BillingTrigger) -> Result<InvoiceOutcome, DispatchError> {
        self.create_invoices(
            trigger.account_id,
            trigger.effective_at,
            TrackingId::from(trigger.trigger_id),
        )
    }

    pub fn get_invoice_status(&self, invoice_id: InvoiceId) -> Result<InvoiceStatus, DispatchError> {
        Ok(self.ledger.get_invoice_status(invoice_id)?)
    }

    pub fn get_account_balance(&self, account_id: AccountId) -> Result<Decimal, DispatchError> {
        Ok(self.ledger.get_account_balance(account_id)?)
    }

    pub fn get_unpaid_invoices_by_account_id(
        &self,
        account_id: AccountId,
        from: Option<NaiveDate>,
        up_to: Option<NaiveDate>,
    ) -> Result<Vec<Invoice>, DispatchError> {
        Ok(self.ledger.get_unpaid_invoices_by_account_id(account_id, from, up_to)?)
    }

    fn recompute(
        &self,
        account_id: AccountId,
        as_of: DateTime<Utc>,
        tracking_id: TrackingId,
    ) -> Result<InvoiceOutcome, DispatchError> {
        // 1) Load
        let account = self.accounts.billing_account(account_id)?;
        let time_zone = account.time_zone_or(self.config.default_time_zone);
        let events = BillingEventSet::new(
            account_id,
            time_zone,
            account.currency,
            account.bill_cycle_day,
            self.events.billing_events(account_id)?,
        )?;
        let target_date = CalendarResolver::new(time_zone).local_date(as_of);

        // 2) Project
        let catalog = &*self.catalog;
        let candidates = self.projector.project(&events, target_date, catalog)?;
        let notifications = self.projector.future_notifications(&events, target_date, catalog)?;
        debug!(candidates = candidates.len(), %target_date, "projected billing timeline");

        // 3) Reconcile
        let existing = self.ledger.reconcilable_items(account_id)?;
        let recorded = self.ledger.tracking_records(account_id)?;
        let mut delta = self.reconciler.reconcile(
            &candidates,
            &existing,
            std::slice::from_ref(&tracking_id),
            &recorded,
        )?;

        if delta.duplicate_submission {
            info!("duplicate submission, republishing the recorded outcome");
            let record = recorded
                .iter()
                .find(|r| r.tracking_id == tracking_id && r.fingerprint == delta.fingerprint);
            let recorded_invoice = match record.and_then(|r| r.invoice_id) {
                Some(id) => self.ledger.get_by_id(id)?,
                None => None,
            };
            let notification = match &recorded_invoice {
                Some(invoice) => created_notification(invoice, as_of),
                None => InvoiceNotification::NullInvoice {
                    account_id,
                    target_date: record.map_or(target_date, |r| r.target_date),
                    occurred_at: as_of,
                },
            };
            self.publish(account_id, &tracking_id, notification)?;
            return Ok(InvoiceOutcome {
                account_id,
                target_date,
                invoice: None,
                items: Vec::new(),
                duplicate_submission: true,
            });
        }

        // Ids of voided items stay reserved in the ledger.
        let voided: HashSet<InvoiceItemId> = self
            .ledger
            .get_invoices_by_account(account_id, &InvoiceQuery::all())?
            .iter()
            .filter(|i| i.is_void())
            .flat_map(|i| i.items().iter().map(|item| item.id))
            .collect();
        delta.reissue_taken_ids(&voided);

        // 4) Commit
        let fingerprint = delta.fingerprint.clone();
        let invoice = if delta.is_empty() {
            None
        } else {
            Some(self.build_invoice(account_id, account.currency, target_date, delta.into_items())?)
        };
        let invoice_id = invoice.as_ref().map(|i| i.id());

        let batch = CommitBatch {
            invoices: invoice.into_iter().collect(),
            tracking: vec![TrackingRecord {
                tracking_id: tracking_id.clone(),
                account_id,
                invoice_id,
                target_date,
                fingerprint,
            }],
            notifications: Some(notifications),
        };
        let items = self.ledger.commit(account_id, batch)?;

        let invoice = match invoice_id {
            Some(id) if !items.is_empty() => self.ledger.get_by_id(id)?,
            _ => None,
        };

        // 5) Publish
        let notification = match &invoice {
            Some(invoice) => {
                info!(
                    invoice_id = %invoice.id(),
                    invoice_number = ?invoice.invoice_number(),
                    items = items.len(),
                    amount = %invoice.amount_charged(),
                    "invoice created"
                );
                created_notification(invoice, as_of)
            }
            None => {
                info!(%target_date, "nothing to invoice");
                InvoiceNotification::NullInvoice {
                    account_id,
                    target_date,
                    occurred_at: as_of,
                }
            }
        };
        self.publish(account_id, &tracking_id, notification)?;

        Ok(InvoiceOutcome {
            account_id,
            target_date,
            invoice,
            items,
            duplicate_submission: false,
        })
    }

    fn build_invoice(
        &self,
        account_id: AccountId,
        currency: Currency,
        target_date: NaiveDate,
        items: Vec<ProposedItem>,
    ) -> Result<Invoice, DomainError> {
        let mut invoice = Invoice::draft(InvoiceId::new(), account_id, currency, target_date, target_date);
        for item in items {
            invoice.add_item(item.into_invoice_item(invoice.id(), account_id))?;
        }
        if !self.config.draft_invoices {
            invoice.commit()?;
        }
        Ok(invoice)
    }

    fn publish(
        &self,
        account_id: AccountId,
        tracking_id: &TrackingId,
        notification: InvoiceNotification,
    ) -> Result<(), DispatchError> {
        let sequence = {
            let mut sequences = self.sequences.lock().map_err(|_| LockPoisoned)?;
            let next = sequences.entry(account_id).or_insert(0);
            *next += 1;
            *next
        };
        let name = match &notification {
            InvoiceNotification::InvoiceCreated { invoice_id, .. } => invoice_id.to_string(),
            InvoiceNotification::NullInvoice { .. } => format!("null-invoice|{account_id}|{tracking_id}"),
        };
        let event_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());

        let envelope = EventEnvelope::wrap(event_id, account_id, sequence, notification).to_json()?;
        self.bus
            .publish(envelope)
            .map_err(|err| DispatchError::Publish(format!("{err:?}")))
    }
}

fn created_notification(invoice: &Invoice, occurred_at: DateTime<Utc>) -> InvoiceNotification {
    InvoiceNotification::InvoiceCreated {
        account_id: invoice.account_id(),
        invoice_id: invoice.id(),
        invoice_number: invoice.invoice_number().unwrap_or_default(),
        target_date: invoice.target_date(),
        amount: invoice.amount_charged(),
        currency: invoice.currency(),
        item_count: invoice.items().len(),
        occurred_at,
    }
}
