//! Invoicing domain module.
//!
//! Invoices, their immutable items and the status lifecycle, implemented purely
//! as deterministic domain logic (no IO, no storage).

pub mod invoice;
pub mod item;
pub mod notification;
pub mod payment;
pub mod tracking;

pub use invoice::{Invoice, InvoiceStatus};
pub use item::{InvoiceItem, InvoiceItemType, ProposedItem};
pub use notification::FutureAccountNotifications;
pub use payment::{InvoicePayment, PaymentStatus};
pub use tracking::{TrackingId, TrackingRecord, fingerprint};
