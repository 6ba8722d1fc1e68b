//! `cadence-core`: domain foundation shared by the billing and invoicing crates.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model and currencies.

pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AccountId, InvoiceId, InvoiceItemId, PaymentId, SubscriptionId};
pub use money::Currency;
pub use value_object::ValueObject;
