//! Integration messages exchanged with the outside world.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cadence_core::{AccountId, Currency, InvoiceId, SubscriptionId};

use crate::event::Event;

/// Why an account is being re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// A subscription lifecycle event was recorded (creation, change, cancel...).
    LifecycleEvent,
    /// A previously scheduled notification became due.
    ScheduledNotification,
    /// Explicit operator request.
    Manual,
}

/// Request to recompute the invoices of one account as of an instant.
///
/// Delivered at least once. `trigger_id` is stable across redeliveries and is
/// used as the tracking id of whatever the recompute produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingTrigger {
    pub trigger_id: Uuid,
    pub account_id: AccountId,
    pub subscription_id: Option<SubscriptionId>,
    pub effective_at: DateTime<Utc>,
    pub reason: TriggerReason,
}

impl BillingTrigger {
    /// Trigger for a scheduled notification. The id is derived from the
    /// `(account, subscription, instant)` triple so a redelivered notification
    /// carries the same tracking id.
    pub fn scheduled(
        account_id: AccountId,
        subscription_id: SubscriptionId,
        effective_at: DateTime<Utc>,
    ) -> Self {
        let name = format!("{account_id}|{subscription_id}|{}", effective_at.to_rfc3339());
        Self {
            trigger_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()),
            account_id,
            subscription_id: Some(subscription_id),
            effective_at,
            reason: TriggerReason::ScheduledNotification,
        }
    }

    /// Account-wide re-evaluation not tied to one subscription.
    pub fn rescheduled(account_id: AccountId, effective_at: DateTime<Utc>) -> Self {
        let name = format!("{account_id}|*|{}", effective_at.to_rfc3339());
        Self {
            trigger_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()),
            account_id,
            subscription_id: None,
            effective_at,
            reason: TriggerReason::ScheduledNotification,
        }
    }

    pub fn manual(account_id: AccountId, effective_at: DateTime<Utc>) -> Self {
        Self {
            trigger_id: Uuid::now_v7(),
            account_id,
            subscription_id: None,
            effective_at,
            reason: TriggerReason::Manual,
        }
    }

    pub fn lifecycle(
        account_id: AccountId,
        subscription_id: SubscriptionId,
        effective_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trigger_id: Uuid::now_v7(),
            account_id,
            subscription_id: Some(subscription_id),
            effective_at,
            reason: TriggerReason::LifecycleEvent,
        }
    }
}

/// Notification published after an account recompute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvoiceNotification {
    /// A new invoice (with new charges and/or repairs) was committed.
    InvoiceCreated {
        account_id: AccountId,
        invoice_id: InvoiceId,
        invoice_number: u64,
        target_date: NaiveDate,
        amount: Decimal,
        currency: Currency,
        item_count: usize,
        occurred_at: DateTime<Utc>,
    },
    /// The recompute found nothing new to invoice.
    NullInvoice {
        account_id: AccountId,
        target_date: NaiveDate,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for InvoiceNotification {
    fn event_type(&self) -> &'static str {
        match self {
            InvoiceNotification::InvoiceCreated { .. } => "invoice.created",
            InvoiceNotification::NullInvoice { .. } => "invoice.null",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InvoiceNotification::InvoiceCreated { occurred_at, .. } => *occurred_at,
            InvoiceNotification::NullInvoice { occurred_at, .. } => *occurred_at,
        }
    }
}
