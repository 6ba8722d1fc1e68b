//! Billing timeline projection and invoice reconciliation.
//!
//! Pure, deterministic domain logic: billing events and a catalog go in,
//! candidate invoice items and the delta against already-invoiced items come
//! out. No clock reads, no IO.

pub mod billing_event;
pub mod calendar;
pub mod catalog;
pub mod projector;
pub mod proration;
pub mod reconcile;
pub mod timeline;

pub use billing_event::{BillingEvent, BillingEventKind, BillingEventSet};
pub use calendar::{BillingPeriod, CalendarPeriod, CalendarResolver};
pub use catalog::{
    BillingAlignment, BillingMode, Catalog, InMemoryCatalog, PhaseDuration, PhaseType, Plan,
    PlanPhase, PlanPhaseRef,
};
pub use projector::TimelineProjector;
pub use proration::{RoundingMode, prorate, round_amount};
pub use reconcile::{ReconciliationResult, Reconciler};
pub use timeline::{PhaseSegment, TimedPhase, derive_segments};
