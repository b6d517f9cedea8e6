use chrono::{DateTime, Utc};

/// A domain event: an immutable, versioned, append-only fact.
///
/// Every wallet, account, withdrawal and subscription event implements this so
/// the store can persist it with a stable type name and business timestamp.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "wallet.entry_appended").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
