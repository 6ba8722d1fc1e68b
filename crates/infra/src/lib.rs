//! Infrastructure layer: invoice ledger, scheduling, account data, dispatch.
//!
//! Everything here is in-memory and synchronous; the traits are the seams
//! where durable backends plug in.

pub mod accounts;
pub mod config;
pub mod dispatcher;
pub mod event_source;
pub mod ledger;
pub mod locks;
pub mod scheduler;
pub mod workers;

pub use accounts::{AccountStore, BillingAccount, InMemoryAccountStore};
pub use config::{ConfigError, EngineConfig};
pub use dispatcher::{DispatchError, InvoiceDispatcher, InvoiceOutcome};
pub use event_source::{BillingEventSource, InMemoryBillingEventSource};
pub use ledger::{
    CommitBatch, InMemoryInvoiceStore, InvoiceLedger, InvoicePage, InvoiceQuery, LedgerError,
};
pub use locks::{AccountLocks, LockPoisoned};
pub use scheduler::{NotificationPoller, NotificationScheduler, PollError};
pub use workers::{InvoiceTriggerWorker, WorkerHandle};
