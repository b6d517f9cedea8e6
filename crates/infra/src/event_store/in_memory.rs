use std::collections::HashMap;
use std::sync::RwLock;

use ledgerly_core::{AggregateId, TenantId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, validate_batch};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<StreamKey, Vec<StoredEvent>>,
    tenant_log: HashMap<TenantId, Vec<StoredEvent>>,
    next_position: u64,
}

/// In-memory append-only event store.
///
/// A single write lock covers the whole batch, so multi-stream appends are
/// atomic and version checks are race-free. Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: Option<&Vec<StoredEvent>>) -> u64 {
        stream.and_then(|s| s.last()).map(|e| e.sequence_number).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append_streams(
        &self,
        appends: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let appends: Vec<StreamAppend> =
            appends.into_iter().filter(|a| !a.events.is_empty()).collect();
        if appends.is_empty() {
            return Ok(vec![]);
        }
        validate_batch(&appends)?;

        let mut inner = self
            .inner
            .write()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        // Check every stream before touching any of them.
        for append in &appends {
            let key = StreamKey {
                tenant_id: append.tenant_id,
                aggregate_id: append.aggregate_id,
            };
            let stream = inner.streams.get(&key);
            let current = Self::current_version(stream);

            if !append.expected_version.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "stream {}: expected {:?}, found {current}",
                    append.aggregate_id, append.expected_version
                )));
            }

            if let Some(existing) = stream.and_then(|s| s.first()) {
                if existing.aggregate_type != append.aggregate_type {
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{}', attempted append with '{}'",
                        existing.aggregate_type, append.aggregate_type
                    )));
                }
            }
        }

        let mut committed = Vec::new();
        for append in appends {
            let key = StreamKey {
                tenant_id: append.tenant_id,
                aggregate_id: append.aggregate_id,
            };
            let mut next = Self::current_version(inner.streams.get(&key)) + 1;

            for e in append.events {
                inner.next_position += 1;
                let stored = StoredEvent {
                    event_id: e.event_id,
                    tenant_id: e.tenant_id,
                    aggregate_id: e.aggregate_id,
                    aggregate_type: e.aggregate_type,
                    sequence_number: next,
                    global_position: inner.next_position,
                    event_type: e.event_type,
                    event_version: e.event_version,
                    occurred_at: e.occurred_at,
                    payload: e.payload,
                };
                next += 1;
                inner.streams.entry(key).or_default().push(stored.clone());
                inner
                    .tenant_log
                    .entry(stored.tenant_id)
                    .or_default()
                    .push(stored.clone());
                committed.push(stored);
            }
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        Ok(inner.streams.get(&key).cloned().unwrap_or_default())
    }

    fn load_tenant_events(&self, tenant_id: TenantId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        Ok(inner.tenant_log.get(&tenant_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::UncommittedEvent;
    use chrono::Utc;
    use ledgerly_core::ExpectedVersion;
    use uuid::Uuid;

    fn event(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: "test.happened".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "n": 1 }),
        }
    }

    fn stream(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        expected: ExpectedVersion,
        count: usize,
    ) -> StreamAppend {
        StreamAppend {
            tenant_id,
            aggregate_id,
            aggregate_type: "test.stream".to_string(),
            expected_version: expected,
            events: (0..count).map(|_| event(tenant_id, aggregate_id, "test.stream")).collect(),
        }
    }

    #[test]
    fn sequences_are_gap_free_per_stream() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let id = AggregateId::new();

        store.append_streams(vec![stream(tenant_id, id, ExpectedVersion::Exact(0), 2)]).unwrap();
        let second = store
            .append_streams(vec![stream(tenant_id, id, ExpectedVersion::Exact(2), 1)])
            .unwrap();

        assert_eq!(second[0].sequence_number, 3);
        let loaded = store.load_stream(tenant_id, id).unwrap();
        let seqs: Vec<u64> = loaded.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn one_stale_stream_rejects_the_whole_batch() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        store.append_streams(vec![stream(tenant_id, b, ExpectedVersion::Exact(0), 1)]).unwrap();

        let err = store
            .append_streams(vec![
                stream(tenant_id, a, ExpectedVersion::Exact(0), 1),
                stream(tenant_id, b, ExpectedVersion::Exact(0), 1),
            ])
            .unwrap_err();

        assert!(matches!(err, EventStoreError::Concurrency(_)));
        assert!(store.load_stream(tenant_id, a).unwrap().is_empty());
        assert_eq!(store.load_stream(tenant_id, b).unwrap().len(), 1);
    }

    #[test]
    fn batches_cannot_span_tenants() {
        let store = InMemoryEventStore::new();
        let err = store
            .append_streams(vec![
                stream(TenantId::new(), AggregateId::new(), ExpectedVersion::Any, 1),
                stream(TenantId::new(), AggregateId::new(), ExpectedVersion::Any, 1),
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::TenantIsolation(_)));
    }

    #[test]
    fn tenant_log_is_isolated_and_in_commit_order() {
        let store = InMemoryEventStore::new();
        let t1 = TenantId::new();
        let t2 = TenantId::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        store.append_streams(vec![stream(t1, a, ExpectedVersion::Exact(0), 1)]).unwrap();
        store.append_streams(vec![stream(t2, b, ExpectedVersion::Exact(0), 1)]).unwrap();
        store.append_streams(vec![stream(t1, b, ExpectedVersion::Exact(0), 1)]).unwrap();

        let log = store.load_tenant_events(t1).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].global_position < log[1].global_position);
        assert!(log.iter().all(|e| e.tenant_id == t1));
        assert!(store.load_stream(t2, a).unwrap().is_empty());
    }

    #[test]
    fn aggregate_type_is_stable_per_stream() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let id = AggregateId::new();
        store.append_streams(vec![stream(tenant_id, id, ExpectedVersion::Exact(0), 1)]).unwrap();

        let err = store
            .append(vec![event(tenant_id, id, "other.stream")], ExpectedVersion::Any)
            .unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }
}
