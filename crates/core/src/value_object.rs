//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attributes. A commission
/// policy or a plan price is a value object; an account is not.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct Fee {
///     amount: i64,
/// }
///
/// impl ValueObject for Fee {}
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
