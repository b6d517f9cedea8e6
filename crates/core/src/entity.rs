//! Entity trait: identity that survives state changes.

/// Entity marker + minimal interface.
///
/// Ledger entries and withdraw requests are entities: two entries with equal
/// amounts are still different entries.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
