use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cadence_core::{Currency, InvoiceId, PaymentId};

/// Outcome of a payment attempt as reported by the payment subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Init,
    Success,
    Failed,
}

/// Allocation of (part of) a payment to an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoicePayment {
    pub id: Uuid,
    pub payment_id: PaymentId,
    pub invoice_id: InvoiceId,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: PaymentStatus,
}

impl InvoicePayment {
    pub fn new(
        payment_id: PaymentId,
        invoice_id: InvoiceId,
        amount: Decimal,
        currency: Currency,
        status: PaymentStatus,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            payment_id,
            invoice_id,
            amount,
            currency,
            status,
        }
    }

    /// Only successful payments reduce the account balance.
    pub fn is_settled(&self) -> bool {
        self.status == PaymentStatus::Success
    }
}
