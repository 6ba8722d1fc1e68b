use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use cadence_core::{AccountId, DomainError, InvoiceId, InvoiceItemId, PaymentId};
use cadence_invoicing::{
    FutureAccountNotifications, Invoice, InvoiceItem, InvoicePayment, InvoiceStatus,
    TrackingRecord,
};

/// Ledger operation error.
///
/// Deterministic business failures surface as `Domain`; everything else is a
/// storage problem the caller may retry.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("ledger lock poisoned")]
    Poisoned,

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Everything one recompute writes, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    /// Unnumbered invoices (status `Draft` or `Committed`).
    pub invoices: Vec<Invoice>,
    pub tracking: Vec<TrackingRecord>,
    /// Replaces the account's notification schedule when present.
    pub notifications: Option<FutureAccountNotifications>,
}

/// Filter for [`InvoiceLedger::get_invoices_by_account`].
///
/// Date bounds are inclusive and apply to the invoice date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceQuery {
    pub from: Option<NaiveDate>,
    pub up_to: Option<NaiveDate>,
    pub include_voided: bool,
    pub include_migrated: bool,
}

impl InvoiceQuery {
    pub fn all() -> Self {
        Self {
            from: None,
            up_to: None,
            include_voided: true,
            include_migrated: true,
        }
    }

    pub fn matches(&self, invoice: &Invoice) -> bool {
        (self.include_voided || !invoice.is_void())
            && (self.include_migrated || !invoice.is_migrated())
            && self.from.is_none_or(|from| invoice.invoice_date() >= from)
            && self.up_to.is_none_or(|up_to| invoice.invoice_date() <= up_to)
    }
}

/// One page of [`InvoiceLedger::search_invoices`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoicePage {
    pub offset: usize,
    /// Matches across all pages.
    pub total: usize,
    pub invoices: Vec<Invoice>,
}

/// Append-only invoice storage.
///
/// ## Commit semantics
///
/// `commit()`:
/// - validates the whole batch before writing anything (all or nothing)
/// - assigns invoice numbers, strictly increasing per account
/// - skips items whose id is already stored, and invoices left with no new items
/// - rejects a batch that would leave two active charges covering the same
///   `(subscription, charge type, dates)`
/// - stores tracking records and replaces the notification schedule in the same
///   write
///
/// Items are never edited or deleted. Only invoice status moves, along
/// Draft → Committed → Void (or Draft → Void). An invoice cannot be voided
/// while a repair on another live invoice offsets one of its items, and the
/// ids of voided items are never reused.
///
/// Read-only lookups return `None` / empty collections for unknown ids;
/// mutating operations return `DomainError::NotFound`.
pub trait InvoiceLedger: Send + Sync {
    /// Persist a batch and return the items actually created.
    fn commit(&self, account_id: AccountId, batch: CommitBatch) -> Result<Vec<InvoiceItem>, LedgerError>;

    fn get_by_id(&self, invoice_id: InvoiceId) -> Result<Option<Invoice>, LedgerError>;

    fn get_by_number(&self, account_id: AccountId, invoice_number: u64) -> Result<Option<Invoice>, LedgerError>;

    /// The invoice carrying an item.
    fn get_by_invoice_item(&self, item_id: InvoiceItemId) -> Result<Option<Invoice>, LedgerError>;

    /// Invoices of an account in invoice-number order.
    fn get_invoices_by_account(
        &self,
        account_id: AccountId,
        query: &InvoiceQuery,
    ) -> Result<Vec<Invoice>, LedgerError>;

    /// Every stored invoice, voided and migrated ones included.
    fn get_all(&self) -> Result<Vec<Invoice>, LedgerError>;

    /// Invoices whose id, account id, number or currency code equals `key`.
    fn search_invoices(&self, key: &str, offset: usize, limit: usize) -> Result<InvoicePage, LedgerError>;

    fn get_invoice_id_by_payment_id(&self, payment_id: PaymentId) -> Result<Option<InvoiceId>, LedgerError>;

    fn get_invoice_payments_by_invoice(&self, invoice_id: InvoiceId) -> Result<Vec<InvoicePayment>, LedgerError>;

    fn get_invoice_payments_by_payment_id(
        &self,
        payment_id: PaymentId,
    ) -> Result<Vec<InvoicePayment>, LedgerError>;

    /// Fails with `NotFound` for an unknown invoice.
    fn get_invoice_status(&self, invoice_id: InvoiceId) -> Result<InvoiceStatus, LedgerError>;

    /// Items of non-void invoices minus successful payments on them.
    fn get_account_balance(&self, account_id: AccountId) -> Result<Decimal, LedgerError>;

    /// Committed, non-migrated invoices with an outstanding balance, invoice
    /// date within the (inclusive) bounds.
    fn get_unpaid_invoices_by_account_id(
        &self,
        account_id: AccountId,
        from: Option<NaiveDate>,
        up_to: Option<NaiveDate>,
    ) -> Result<Vec<Invoice>, LedgerError>;

    /// Items of every non-void invoice (drafts included), as reconciliation
    /// input.
    fn reconcilable_items(&self, account_id: AccountId) -> Result<Vec<InvoiceItem>, LedgerError>;

    fn tracking_records(&self, account_id: AccountId) -> Result<Vec<TrackingRecord>, LedgerError>;

    fn change_invoice_status(&self, invoice_id: InvoiceId, to: InvoiceStatus) -> Result<(), LedgerError>;

    /// Record a payment allocation against a stored invoice.
    fn record_payment(&self, payment: InvoicePayment) -> Result<(), LedgerError>;

    /// Reserved: chargebacks are handled outside this engine.
    fn post_chargeback(&self, payment_id: PaymentId, amount: Decimal) -> Result<InvoicePayment, LedgerError> {
        let _ = (payment_id, amount);
        Err(DomainError::unsupported("post_chargeback").into())
    }

    /// Reserved: refunds are handled outside this engine.
    fn create_refund(&self, payment_id: PaymentId, amount: Decimal) -> Result<InvoicePayment, LedgerError> {
        let _ = (payment_id, amount);
        Err(DomainError::unsupported("create_refund").into())
    }
}

impl<S> InvoiceLedger for Arc<S>
where
    S: InvoiceLedger + ?Sized,
{
    fn commit(&self, account_id: AccountId, batch: CommitBatch) -> Result<Vec<InvoiceItem>, LedgerError> {
        (**self).commit(account_id, batch)
    }

    fn get_by_id(&self, invoice_id: InvoiceId) -> Result<Option<Invoice>, LedgerError> {
        (**self).get_by_id(invoice_id)
    }

    fn get_by_number(&self, account_id: AccountId, invoice_number: u64) -> Result<Option<Invoice>, LedgerError> {
        (**self).get_by_number(account_id, invoice_number)
    }

    fn get_by_invoice_item(&self, item_id: InvoiceItemId) -> Result<Option<Invoice>, LedgerError> {
        (**self).get_by_invoice_item(item_id)
    }

    fn get_invoices_by_account(
        &self,
        account_id: AccountId,
        query: &InvoiceQuery,
    ) -> Result<Vec<Invoice>, LedgerError> {
        (**self).get_invoices_by_account(account_id, query)
    }

    fn get_all(&self) -> Result<Vec<Invoice>, LedgerError> {
        (**self).get_all()
    }

    fn search_invoices(&self, key: &str, offset: usize, limit: usize) -> Result<InvoicePage, LedgerError> {
        (**self).search_invoices(key, offset, limit)
    }

    fn get_invoice_id_by_payment_id(&self, payment_id: PaymentId) -> Result<Option<InvoiceId>, LedgerError> {
        (**self).get_invoice_id_by_payment_id(payment_id)
    }

    fn get_invoice_payments_by_invoice(&self, invoice_id: InvoiceId) -> Result<Vec<InvoicePayment>, LedgerError> {
        (**self).get_invoice_payments_by_invoice(invoice_id)
    }

    fn get_invoice_payments_by_payment_id(
        &self,
        payment_id: PaymentId,
    ) -> Result<Vec<InvoicePayment>, LedgerError> {
        (**self).get_invoice_payments_by_payment_id(payment_id)
    }

    fn get_invoice_status(&self, invoice_id: InvoiceId) -> Result<InvoiceStatus, LedgerError> {
        (**self).get_invoice_status(invoice_id)
    }

    fn get_account_balance(&self, account_id: AccountId) -> Result<Decimal, LedgerError> {
        (**self).get_account_balance(account_id)
    }

    fn get_unpaid_invoices_by_account_id(
        &self,
        account_id: AccountId,
        from: Option<NaiveDate>,
        up_to: Option<NaiveDate>,
    ) -> Result<Vec<Invoice>, LedgerError> {
        (**self).get_unpaid_invoices_by_account_id(account_id, from, up_to)
    }

    fn reconcilable_items(&self, account_id: AccountId) -> Result<Vec<InvoiceItem>, LedgerError> {
        (**self).reconcilable_items(account_id)
    }

    fn tracking_records(&self, account_id: AccountId) -> Result<Vec<TrackingRecord>, LedgerError> {
        (**self).tracking_records(account_id)
    }

    fn change_invoice_status(&self, invoice_id: InvoiceId, to: InvoiceStatus) -> Result<(), LedgerError> {
        (**self).change_invoice_status(invoice_id, to)
    }

    fn record_payment(&self, payment: InvoicePayment) -> Result<(), LedgerError> {
        (**self).record_payment(payment)
    }

    fn post_chargeback(&self, payment_id: PaymentId, amount: Decimal) -> Result<InvoicePayment, LedgerError> {
        (**self).post_chargeback(payment_id, amount)
    }

    fn create_refund(&self, payment_id: PaymentId, amount: Decimal) -> Result<InvoicePayment, LedgerError> {
        (**self).create_refund(payment_id, amount)
    }
}
