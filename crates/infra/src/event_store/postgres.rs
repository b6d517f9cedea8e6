//! Postgres-backed event store.
//!
//! One `events` table holds every stream. A unique constraint on
//! `(tenant_id, aggregate_id, sequence_number)` is the final arbiter of
//! optimistic concurrency: two transactions that both read version `n` and
//! insert `n + 1` cannot both commit.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | EventStoreError |
//! |------------|-----------------|-----------------|
//! | Database (unique violation) | `23505` | `Concurrency` |
//! | Database (check violation) | `23514` | `InvalidAppend` |
//! | Database (other) | any | `Backend` |
//! | PoolClosed / Io / other | n/a | `Backend` |
//!
//! ## Sync bridge
//!
//! `EventStore` is synchronous. The trait impl bridges with
//! `tokio::task::block_in_place`, so it must be called from a multi-threaded
//! tokio runtime.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use ledgerly_core::{AggregateId, TenantId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, validate_batch};

const SCHEMA: &str = include_str!("../../migrations/0001_events.sql");

/// Postgres-backed append-only event store.
///
/// Every query filters on `tenant_id`, and a multi-stream append runs inside a
/// single transaction.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a pool and make sure the schema exists.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Apply the bundled DDL (idempotent).
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(
        skip(self),
        fields(
            tenant_id = %tenant_id.as_uuid(),
            aggregate_id = %aggregate_id.as_uuid(),
            event_count = tracing::field::Empty
        ),
        err
    )]
    pub async fn load_stream_async(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id, tenant_id, aggregate_id, aggregate_type, sequence_number,
                global_position, event_type, event_version, occurred_at, payload
            FROM events
            WHERE tenant_id = $1 AND aggregate_id = $2
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        let events = rows.iter().map(row_to_event).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("event_count", events.len());
        Ok(events)
    }

    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id.as_uuid(), event_count = tracing::field::Empty),
        err
    )]
    pub async fn load_tenant_events_async(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id, tenant_id, aggregate_id, aggregate_type, sequence_number,
                global_position, event_type, event_version, occurred_at, payload
            FROM events
            WHERE tenant_id = $1
            ORDER BY global_position ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_tenant_events", e))?;

        let events = rows.iter().map(row_to_event).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("event_count", events.len());
        Ok(events)
    }

    /// Append to several streams in one transaction.
    #[instrument(
        skip(self, appends),
        fields(stream_count = appends.len(), committed = tracing::field::Empty),
        err
    )]
    pub async fn append_streams_async(
        &self,
        appends: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let appends: Vec<StreamAppend> =
            appends.into_iter().filter(|a| !a.events.is_empty()).collect();
        if appends.is_empty() {
            return Ok(vec![]);
        }
        validate_batch(&appends)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut committed = Vec::new();
        for append in appends {
            // Dropping `tx` on any early return rolls the whole batch back.
            let stored = append_one(&mut tx, append).await?;
            committed.extend(stored);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed", committed.len());
        Ok(committed)
    }
}

async fn append_one(
    tx: &mut Transaction<'_, Postgres>,
    append: StreamAppend,
) -> Result<Vec<StoredEvent>, EventStoreError> {
    let (current_version, existing_type) =
        check_stream_version(tx, append.tenant_id, append.aggregate_id).await?;

    if let Some(existing) = existing_type {
        if existing != append.aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "stream aggregate_type is '{existing}', attempted append with '{}'",
                append.aggregate_type
            )));
        }
    }

    if !append.expected_version.matches(current_version) {
        return Err(EventStoreError::Concurrency(format!(
            "stream {}: expected {:?}, found {current_version}",
            append.aggregate_id, append.expected_version
        )));
    }

    let mut next_sequence = current_version + 1;
    let mut stored = Vec::with_capacity(append.events.len());

    for event in append.events {
        let row = sqlx::query(
            r#"
            INSERT INTO events (
                event_id, tenant_id, aggregate_id, aggregate_type, sequence_number,
                event_type, event_version, occurred_at, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING global_position
            "#,
        )
        .bind(event.event_id)
        .bind(event.tenant_id.as_uuid())
        .bind(event.aggregate_id.as_uuid())
        .bind(&event.aggregate_type)
        .bind(next_sequence as i64)
        .bind(&event.event_type)
        .bind(event.event_version as i32)
        .bind(event.occurred_at)
        .bind(&event.payload)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EventStoreError::Concurrency(format!(
                    "concurrent append detected: sequence_number {next_sequence} already exists"
                ))
            } else {
                map_sqlx_error("insert_event", e)
            }
        })?;

        let global_position: i64 = row
            .try_get("global_position")
            .map_err(|e| map_sqlx_error("read_global_position", e))?;

        stored.push(StoredEvent {
            event_id: event.event_id,
            tenant_id: event.tenant_id,
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type,
            sequence_number: next_sequence,
            global_position: global_position as u64,
            event_type: event.event_type,
            event_version: event.event_version,
            occurred_at: event.occurred_at,
            payload: event.payload,
        });
        next_sequence += 1;
    }

    Ok(stored)
}

/// Returns `(current_version, aggregate_type)`; `(0, None)` for a new stream.
async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence_number), 0) AS current_version,
            MAX(aggregate_type) AS aggregate_type
        FROM events
        WHERE tenant_id = $1 AND aggregate_id = $2
        "#,
    )
    .bind(tenant_id.as_uuid())
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: i64 = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("read_current_version", e))?;
    let aggregate_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| map_sqlx_error("read_aggregate_type", e))?;

    Ok((current_version as u64, aggregate_type))
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<StoredEvent, EventStoreError> {
    let read = |e: sqlx::Error| map_sqlx_error("decode_event_row", e);

    let tenant_id: uuid::Uuid = row.try_get("tenant_id").map_err(read)?;
    let aggregate_id: uuid::Uuid = row.try_get("aggregate_id").map_err(read)?;
    let sequence_number: i64 = row.try_get("sequence_number").map_err(read)?;
    let global_position: i64 = row.try_get("global_position").map_err(read)?;
    let event_version: i32 = row.try_get("event_version").map_err(read)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(read)?;

    Ok(StoredEvent {
        event_id: row.try_get("event_id").map_err(read)?,
        tenant_id: TenantId::from_uuid(tenant_id),
        aggregate_id: AggregateId::from_uuid(aggregate_id),
        aggregate_type: row.try_get("aggregate_type").map_err(read)?,
        sequence_number: sequence_number as u64,
        global_position: global_position as u64,
        event_type: row.try_get("event_type").map_err(read)?,
        event_version: event_version as u32,
        occurred_at,
        payload: row.try_get("payload").map_err(read)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Backend(format!("connection pool closed in {operation}"))
        }
        other => EventStoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn block_on<F: Future>(future: F) -> Result<F::Output, EventStoreError> {
    let handle = tokio::runtime::Handle::try_current().map_err(|_| {
        let msg = "PostgresEventStore must be used inside a tokio runtime";
        EventStoreError::Backend(msg.to_string())
    })?;
    Ok(tokio::task::block_in_place(|| handle.block_on(future)))
}

impl EventStore for PostgresEventStore {
    fn append_streams(
        &self,
        appends: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        block_on(self.append_streams_async(appends))?
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        block_on(self.load_stream_async(tenant_id, aggregate_id))?
    }

    fn load_tenant_events(&self, tenant_id: TenantId) -> Result<Vec<StoredEvent>, EventStoreError> {
        block_on(self.load_tenant_events_async(tenant_id))?
    }
}
