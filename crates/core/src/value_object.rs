//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have no identity and are compared structurally. In this
/// workspace calendar periods and timed phases are value objects: two timed
/// phases with the same phase definition and start instant are the same
/// phase, whichever projection produced them.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
