use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use ledgerly_core::{AggregateId, ExpectedVersion, TenantId};
use std::sync::Arc;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Lifecycle: aggregate `handle()` output → `UncommittedEvent` (serialized, with
/// stream metadata) → `StoredEvent` (sequence + global position assigned) →
/// `EventEnvelope` (published on the bus).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A persisted event.
///
/// `sequence_number` is per stream (1, 2, 3, ... with no gaps). `global_position`
/// orders events across all streams in commit order and is what tenant-wide
/// replays sort by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub sequence_number: u64,
    pub global_position: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert a stored event into a tenant-scoped envelope for publication.
    pub fn to_envelope(&self) -> ledgerly_events::EventEnvelope<JsonValue> {
        ledgerly_events::EventEnvelope::new(
            self.event_id,
            self.tenant_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.event_type.clone(),
            self.occurred_at,
            self.payload.clone(),
        )
    }
}

/// Events for one stream inside an atomic multi-stream append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAppend {
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub expected_version: ExpectedVersion,
    pub events: Vec<UncommittedEvent>,
}

/// Event store operation error.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Append-only, tenant-scoped event store.
///
/// Streams are keyed by `(tenant_id, aggregate_id)`. Implementations must:
/// - enforce tenant isolation on reads and writes
/// - check every stream's `ExpectedVersion` before writing anything
/// - assign gap-free sequence numbers starting at `current_version + 1`
/// - persist a multi-stream batch atomically (all streams or none)
pub trait EventStore: Send + Sync {
    /// Atomically append to several streams of one tenant.
    ///
    /// If any stream's version check fails the whole batch is rejected with
    /// `EventStoreError::Concurrency` and nothing is written.
    fn append_streams(
        &self,
        appends: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for a tenant + aggregate (empty if it does not exist).
    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Every event of a tenant, in commit order. Used to rebuild read models.
    fn load_tenant_events(&self, tenant_id: TenantId) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Append events to a single stream.
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some(first) = events.first() else {
            return Ok(vec![]);
        };
        let append = StreamAppend {
            tenant_id: first.tenant_id,
            aggregate_id: first.aggregate_id,
            aggregate_type: first.aggregate_type.clone(),
            expected_version,
            events,
        };
        self.append_streams(vec![append])
    }
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append_streams(
        &self,
        appends: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append_streams(appends)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(tenant_id, aggregate_id)
    }

    fn load_tenant_events(&self, tenant_id: TenantId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_tenant_events(tenant_id)
    }
}

impl UncommittedEvent {
    /// Build an uncommitted event from a typed domain event.
    pub fn from_typed<E>(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: ledgerly_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}

/// Shared shape checks for a multi-stream batch.
///
/// Every append must belong to one tenant, streams may not repeat, and each
/// event must match the stream it is filed under.
pub(crate) fn validate_batch(appends: &[StreamAppend]) -> Result<(), EventStoreError> {
    let Some(first) = appends.first() else {
        return Ok(());
    };
    let tenant_id = first.tenant_id;

    for (idx, append) in appends.iter().enumerate() {
        if append.tenant_id != tenant_id {
            return Err(EventStoreError::TenantIsolation(format!(
                "batch spans multiple tenants (stream index {idx})"
            )));
        }
        if appends[..idx].iter().any(|a| a.aggregate_id == append.aggregate_id) {
            return Err(EventStoreError::InvalidAppend(format!(
                "stream {} appears twice in one batch",
                append.aggregate_id
            )));
        }
        for (event_idx, e) in append.events.iter().enumerate() {
            if e.tenant_id != tenant_id {
                return Err(EventStoreError::TenantIsolation(format!(
                    "event tenant_id mismatch (stream index {idx}, event index {event_idx})"
                )));
            }
            if e.aggregate_id != append.aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "event aggregate_id mismatch (stream index {idx}, event index {event_idx})"
                )));
            }
            if e.aggregate_type != append.aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "event aggregate_type '{}' filed under '{}'",
                    e.aggregate_type, append.aggregate_type
                )));
            }
        }
    }

    Ok(())
}
