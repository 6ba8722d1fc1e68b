use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use cadence_core::{AccountId, Currency, DomainError, DomainResult, Entity, InvoiceId};

use crate::item::InvoiceItem;

/// Invoice status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Committed,
    Void,
}

impl InvoiceStatus {
    /// Draft → Committed, Draft → Void, Committed → Void.
    pub fn can_transition_to(self, to: InvoiceStatus) -> bool {
        matches!(
            (self, to),
            (InvoiceStatus::Draft, InvoiceStatus::Committed)
                | (InvoiceStatus::Draft, InvoiceStatus::Void)
                | (InvoiceStatus::Committed, InvoiceStatus::Void)
        )
    }
}

/// An invoice and the items it carries.
///
/// Items can only be attached before the ledger assigns an invoice number.
/// After that the invoice content is frozen and only its status moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    id: InvoiceId,
    invoice_number: Option<u64>,
    account_id: AccountId,
    currency: Currency,
    invoice_date: NaiveDate,
    target_date: NaiveDate,
    status: InvoiceStatus,
    items: Vec<InvoiceItem>,
    migrated: bool,
}

impl Invoice {
    pub fn draft(
        id: InvoiceId,
        account_id: AccountId,
        currency: Currency,
        invoice_date: NaiveDate,
        target_date: NaiveDate,
    ) -> Self {
        Self {
            id,
            invoice_number: None,
            account_id,
            currency,
            invoice_date,
            target_date,
            status: InvoiceStatus::Draft,
            items: Vec::new(),
            migrated: false,
        }
    }

    /// Mark the invoice as imported from another billing system.
    pub fn migrated(mut self) -> Self {
        self.migrated = true;
        self
    }

    pub fn invoice_number(&self) -> Option<u64> {
        self.invoice_number
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn invoice_date(&self) -> NaiveDate {
        self.invoice_date
    }

    pub fn target_date(&self) -> NaiveDate {
        self.target_date
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn items(&self) -> &[InvoiceItem] {
        &self.items
    }

    pub fn is_migrated(&self) -> bool {
        self.migrated
    }

    pub fn is_void(&self) -> bool {
        self.status == InvoiceStatus::Void
    }

    /// Sum of all item amounts (charges and adjustments).
    pub fn amount_charged(&self) -> Decimal {
        self.items.iter().map(|i| i.amount).sum()
    }

    pub fn add_item(&mut self, item: InvoiceItem) -> DomainResult<()> {
        if self.invoice_number.is_some() {
            return Err(DomainError::invariant(format!(
                "invoice {} is already numbered; items are immutable",
                self.id
            )));
        }
        if item.invoice_id != self.id {
            return Err(DomainError::invariant(format!(
                "item {} belongs to invoice {}, not {}",
                item.id, item.invoice_id, self.id
            )));
        }
        if item.account_id != self.account_id {
            return Err(DomainError::invariant(format!(
                "item {} belongs to another account",
                item.id
            )));
        }
        if item.currency != self.currency {
            return Err(DomainError::invariant(format!(
                "item {} is in {}, invoice is in {}",
                item.id, item.currency, self.currency
            )));
        }
        self.items.push(item);
        Ok(())
    }

    /// Drop items already present elsewhere. Only valid before numbering.
    pub fn retain_items(&mut self, keep: impl FnMut(&InvoiceItem) -> bool) -> DomainResult<()> {
        if self.invoice_number.is_some() {
            return Err(DomainError::invariant(format!(
                "invoice {} is already numbered; items are immutable",
                self.id
            )));
        }
        self.items.retain(keep);
        Ok(())
    }

    pub fn assign_number(&mut self, number: u64) -> DomainResult<()> {
        if let Some(existing) = self.invoice_number {
            return Err(DomainError::invariant(format!(
                "invoice {} already has number {existing}",
                self.id
            )));
        }
        self.invoice_number = Some(number);
        Ok(())
    }

    pub fn transition(&mut self, to: InvoiceStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::transition(self.status, to));
        }
        self.status = to;
        Ok(())
    }

    pub fn commit(&mut self) -> DomainResult<()> {
        self.transition(InvoiceStatus::Committed)
    }

    pub fn void(&mut self) -> DomainResult<()> {
        self.transition(InvoiceStatus::Void)
    }
}

impl Entity for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ProposedItem;
    use cadence_core::SubscriptionId;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn test_invoice() -> Invoice {
        Invoice::draft(
            InvoiceId::new(),
            AccountId::new(),
            Currency::Usd,
            date(2024, 4, 12),
            date(2024, 4, 12),
        )
    }

    fn fixed_item(invoice: &Invoice, amount: Decimal) -> InvoiceItem {
        ProposedItem::fixed(
            SubscriptionId::new(),
            "plan-b",
            "plan-b-evergreen",
            date(2024, 4, 12),
            amount,
            Currency::Usd,
        )
        .into_invoice_item(invoice.id(), invoice.account_id())
    }

    #[test]
    fn draft_can_be_committed_then_voided() {
        let mut invoice = test_invoice();
        assert_eq!(invoice.status(), InvoiceStatus::Draft);

        invoice.commit().unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Committed);

        invoice.void().unwrap();
        assert!(invoice.is_void());
    }

    #[test]
    fn void_invoice_cannot_be_committed() {
        let mut invoice = test_invoice();
        invoice.void().unwrap();

        let err = invoice.commit().unwrap_err();
        match err {
            DomainError::InvalidStateTransition { from, to } => {
                assert_eq!(from, "Void");
                assert_eq!(to, "Committed");
            }
            other => panic!("Expected InvalidStateTransition, got {other:?}"),
        }
    }

    #[test]
    fn committed_invoice_cannot_go_back_to_draft() {
        let mut invoice = test_invoice();
        invoice.commit().unwrap();
        assert!(matches!(
            invoice.transition(InvoiceStatus::Draft),
            Err(DomainError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            invoice.commit(),
            Err(DomainError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn items_are_frozen_once_numbered() {
        let mut invoice = test_invoice();
        let first = fixed_item(&invoice, Decimal::ZERO);
        invoice.add_item(first).unwrap();
        invoice.assign_number(1).unwrap();

        let second = fixed_item(&invoice, Decimal::ONE);
        let err = invoice.add_item(second).unwrap_err();
        match err {
            DomainError::InvariantViolation(msg) if msg.contains("immutable") => {}
            other => panic!("Expected InvariantViolation, got {other:?}"),
        }
        assert!(invoice.assign_number(2).is_err());
    }

    #[test]
    fn item_from_another_invoice_is_rejected() {
        let mut invoice = test_invoice();
        let other = test_invoice();
        let item = fixed_item(&other, Decimal::ONE);
        assert!(matches!(
            invoice.add_item(item),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn amount_charged_sums_items() {
        let mut invoice = test_invoice();
        invoice.add_item(fixed_item(&invoice, Decimal::new(1050, 2))).unwrap();
        invoice.add_item(fixed_item(&invoice, Decimal::new(-250, 2))).unwrap();
        assert_eq!(invoice.amount_charged(), Decimal::new(800, 2));
    }
}
