//! Entity trait: identity that survives status changes.

/// Entity marker + minimal interface.
///
/// Invoices and invoice items are entities: an invoice moving from `Draft` to
/// `Committed` is still the same invoice.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> Self::Id;
}
