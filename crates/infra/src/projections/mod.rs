//! Projection implementations (read model builders).
//!
//! Projections consume committed envelopes and build query-optimized read
//! models. They are rebuildable from the event log, tenant-isolated and
//! idempotent under at-least-once delivery.

pub mod ledger_stats;

pub use ledger_stats::{
    DailyFlow, DailyLedgerStats, KindTotals, LedgerStats, LedgerStatsProjection, ReferrerSummary,
    StatsProjectionError,
};
