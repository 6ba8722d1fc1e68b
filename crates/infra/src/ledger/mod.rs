//! Invoice ledger boundary.
//!
//! The ledger is the only durable state the engine owns: invoices, their items,
//! payment allocations, tracking records and the per-account notification
//! schedule. Items are append-only; the billing history is recomputed from the
//! subscription events and reconciled against what is stored here.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryInvoiceStore;
pub use r#trait::{CommitBatch, InvoiceLedger, InvoicePage, InvoiceQuery, LedgerError};
