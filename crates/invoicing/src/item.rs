use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use cadence_core::{AccountId, Currency, Entity, InvoiceId, InvoiceItemId, SubscriptionId};

/// Kind of charge an invoice item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceItemType {
    Fixed,
    Recurring,
    RepairAdj,
    CreditAdj,
    Cba,
    ExternalCharge,
}

impl InvoiceItemType {
    /// Items the timeline projector produces (and reconciliation manages).
    pub fn is_subscription_charge(self) -> bool {
        matches!(self, InvoiceItemType::Fixed | InvoiceItemType::Recurring)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceItemType::Fixed => "fixed",
            InvoiceItemType::Recurring => "recurring",
            InvoiceItemType::RepairAdj => "repair_adj",
            InvoiceItemType::CreditAdj => "credit_adj",
            InvoiceItemType::Cba => "cba",
            InvoiceItemType::ExternalCharge => "external_charge",
        }
    }
}

/// A persisted invoice item.
///
/// Items are never edited once stored. A correction is a new `RepairAdj` item
/// whose `linked_item_id` points at the item it offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub id: InvoiceItemId,
    pub invoice_id: InvoiceId,
    pub account_id: AccountId,
    pub item_type: InvoiceItemType,
    pub subscription_id: Option<SubscriptionId>,
    pub plan_name: Option<String>,
    pub phase_name: Option<String>,
    /// Local calendar start (inclusive).
    pub start_date: NaiveDate,
    /// Local calendar end (exclusive); `None` for point-in-time charges.
    pub end_date: Option<NaiveDate>,
    pub amount: Decimal,
    /// Full-period price the amount was derived from (recurring items only).
    pub rate: Option<Decimal>,
    pub currency: Currency,
    pub linked_item_id: Option<InvoiceItemId>,
}

impl Entity for InvoiceItem {
    type Id = InvoiceItemId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

/// A candidate item not yet attached to an invoice.
///
/// Produced by the timeline projector (charges) and by reconciliation
/// (repairs). Charge ids are derived from the item content, so projecting the
/// same timeline twice yields identical candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedItem {
    pub id: InvoiceItemId,
    pub item_type: InvoiceItemType,
    pub subscription_id: Option<SubscriptionId>,
    pub plan_name: Option<String>,
    pub phase_name: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub amount: Decimal,
    pub rate: Option<Decimal>,
    pub currency: Currency,
    pub linked_item_id: Option<InvoiceItemId>,
}

impl ProposedItem {
    /// One-off charge dated at the start of a phase.
    pub fn fixed(
        subscription_id: SubscriptionId,
        plan_name: &str,
        phase_name: &str,
        start_date: NaiveDate,
        amount: Decimal,
        currency: Currency,
    ) -> Self {
        let id = charge_id(subscription_id, InvoiceItemType::Fixed, phase_name, start_date, None);
        Self {
            id,
            item_type: InvoiceItemType::Fixed,
            subscription_id: Some(subscription_id),
            plan_name: Some(plan_name.to_string()),
            phase_name: Some(phase_name.to_string()),
            start_date,
            end_date: None,
            amount,
            rate: None,
            currency,
            linked_item_id: None,
        }
    }

    /// Charge for the service period `[start_date, end_date)`.
    #[allow(clippy::too_many_arguments)]
    pub fn recurring(
        subscription_id: SubscriptionId,
        plan_name: &str,
        phase_name: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        amount: Decimal,
        rate: Decimal,
        currency: Currency,
    ) -> Self {
        let id = charge_id(
            subscription_id,
            InvoiceItemType::Recurring,
            phase_name,
            start_date,
            Some(end_date),
        );
        Self {
            id,
            item_type: InvoiceItemType::Recurring,
            subscription_id: Some(subscription_id),
            plan_name: Some(plan_name.to_string()),
            phase_name: Some(phase_name.to_string()),
            start_date,
            end_date: Some(end_date),
            amount,
            rate: Some(rate),
            currency,
            linked_item_id: None,
        }
    }

    /// Offset for (part of) an existing item over `[start_date, end_date)`.
    pub fn repair(
        id: InvoiceItemId,
        original: &InvoiceItem,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
        amount: Decimal,
    ) -> Self {
        Self {
            id,
            item_type: InvoiceItemType::RepairAdj,
            subscription_id: original.subscription_id,
            plan_name: original.plan_name.clone(),
            phase_name: original.phase_name.clone(),
            start_date,
            end_date,
            amount,
            rate: None,
            currency: original.currency,
            linked_item_id: Some(original.id),
        }
    }

    /// Same candidate under a different identifier.
    pub fn with_id(mut self, id: InvoiceItemId) -> Self {
        self.id = id;
        self
    }

    /// Attach the candidate to an invoice.
    pub fn into_invoice_item(self, invoice_id: InvoiceId, account_id: AccountId) -> InvoiceItem {
        InvoiceItem {
            id: self.id,
            invoice_id,
            account_id,
            item_type: self.item_type,
            subscription_id: self.subscription_id,
            plan_name: self.plan_name,
            phase_name: self.phase_name,
            start_date: self.start_date,
            end_date: self.end_date,
            amount: self.amount,
            rate: self.rate,
            currency: self.currency,
            linked_item_id: self.linked_item_id,
        }
    }
}

fn charge_id(
    subscription_id: SubscriptionId,
    item_type: InvoiceItemType,
    phase_name: &str,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
) -> InvoiceItemId {
    let sub = subscription_id.to_string();
    let start = start_date.to_string();
    let end = end_date.map(|d| d.to_string()).unwrap_or_default();
    InvoiceItemId::derive(&[&sub, item_type.as_str(), phase_name, &start, &end])
}
