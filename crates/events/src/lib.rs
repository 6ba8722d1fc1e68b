//! Bus mechanics and integration messages.
//!
//! The billing engine consumes `BillingTrigger` messages (at-least-once) and
//! publishes `InvoiceNotification`s after every successful commit.

pub mod account;
pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod integration;

pub use account::AccountScoped;
pub use bus::{BusSubscription, EventBus};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use integration::{BillingTrigger, InvoiceNotification, TriggerReason};
