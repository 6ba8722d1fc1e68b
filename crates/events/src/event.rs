use chrono::{DateTime, Utc};

/// A message published on the bus.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - stamped with the business instant they describe, never the publish time
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "invoice.created").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// Business instant the event refers to.
    fn occurred_at(&self) -> DateTime<Utc>;
}
