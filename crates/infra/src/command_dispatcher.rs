//! Command execution pipeline.
//!
//! Two entry points share one load → rehydrate → decide → append → publish
//! pipeline:
//!
//! - [`CommandDispatcher::dispatch`] runs one command against one aggregate.
//! - [`CommandDispatcher::execute`] runs a closure over a [`UnitOfWork`] that
//!   may touch several aggregates; everything it decides is committed in one
//!   atomic multi-stream append. On a version conflict the closure is re-run
//!   against freshly loaded state until it commits or the [`RetryPolicy`]
//!   runs out.
//!
//! The first attempt is optimistic. A retry holds a striped lock for every
//! stream that conflicted so far, so writers contending on one wallet queue
//! up behind each other instead of racing. Locks are taken in stripe order;
//! `work` must not call `execute` itself.
//!
//! ```text
//! execute(tenant, |uow| {
//!     let wallet = uow.load(wallet_id, Wallet::empty)?;      // 1. load + rehydrate
//!     uow.decide(&mut wallet, "wallet.ledger", post_cmd)?;   // 2. decide + stage
//!     Ok(())
//! })                                                         // 3. append_streams
//!                                                            // 4. publish
//! ```
//!
//! Closures passed to `execute` must be free of side effects outside the unit
//! of work, since they can run more than once.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use ledgerly_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, TenantId};
use ledgerly_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

/// How long `execute` keeps retrying conflicts by default.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

const LOCK_STRIPES: usize = 64;
const BASE_BACKOFF_MICROS: u64 = 50;
const MAX_BACKOFF_MICROS: u64 = 5_000;

/// When `execute` stops retrying version conflicts.
///
/// Without an attempt cap a unit of work retries until it commits or
/// `timeout` has elapsed since its first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    fn exhausted(&self, attempt: u32, elapsed: Duration) -> Option<String> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return Some(format!("gave up after {attempt} attempts"));
        }
        if elapsed >= self.timeout {
            return Some(format!("timed out after {attempt} attempts in {elapsed:?}"));
        }
        None
    }
}

/// Striped mutexes keyed by `(tenant, stream)`.
#[derive(Debug)]
struct StreamLocks {
    stripes: Vec<Mutex<()>>,
}

impl StreamLocks {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(tenant_id: TenantId, aggregate_id: AggregateId) -> usize {
        let mut hasher = DefaultHasher::new();
        tenant_id.hash(&mut hasher);
        aggregate_id.hash(&mut hasher);
        (hasher.finish() % LOCK_STRIPES as u64) as usize
    }

    /// Lock the stripes covering `streams`, lowest stripe first.
    fn acquire(&self, tenant_id: TenantId, streams: &[AggregateId]) -> Vec<MutexGuard<'_, ()>> {
        let mut stripes: Vec<usize> =
            streams.iter().map(|id| Self::stripe(tenant_id, *id)).collect();
        stripes.sort_unstable();
        stripes.dedup();
        stripes
            .into_iter()
            .map(|i| self.stripes[i].lock().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }
}

/// Full-jitter exponential backoff.
fn backoff(attempt: u32) {
    let cap = (BASE_BACKOFF_MICROS << attempt.min(10)).min(MAX_BACKOFF_MICROS);
    let micros = rand::thread_rng().gen_range(0..=cap);
    thread::sleep(Duration::from_micros(micros));
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure (stale stream version).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// Cross-tenant or cross-stream mixing detected.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("insufficient balance (available: {available}, requested: {requested})")]
    InsufficientBalance { available: i64, requested: i64 },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    /// Historical payloads did not deserialize into the aggregate's event type.
    #[error("failed to deserialize event history: {0}")]
    Deserialize(String),
    #[error(transparent)]
    Store(EventStoreError),
    /// Publication failed after a successful append.
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match &value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg.clone()),
            EventStoreError::TenantIsolation(msg) => DispatchError::TenantIsolation(msg.clone()),
            _ => DispatchError::Store(value),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvalidAmount(msg) => DispatchError::InvalidAmount(msg),
            DomainError::InsufficientBalance {
                available,
                requested,
            } => DispatchError::InsufficientBalance {
                available,
                requested,
            },
            DomainError::InvalidState(msg) => DispatchError::InvalidState(msg),
            DomainError::Duplicate(msg) => DispatchError::Duplicate(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::Unauthorized => DispatchError::Unauthorized,
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
        }
    }
}

/// Events staged for one stream.
#[derive(Debug)]
struct StagedStream {
    aggregate_id: AggregateId,
    aggregate_type: String,
    expected_version: ExpectedVersion,
    events: Vec<UncommittedEvent>,
}

/// A set of decisions across streams that commit together or not at all.
///
/// Loads see the persisted state plus anything already staged in this unit of
/// work, so two decisions on the same stream compose.
pub struct UnitOfWork<'a, S> {
    store: &'a S,
    tenant_id: TenantId,
    now: DateTime<Utc>,
    staged: Vec<StagedStream>,
}

impl<'a, S> UnitOfWork<'a, S>
where
    S: EventStore,
{
    fn new(store: &'a S, tenant_id: TenantId) -> Self {
        Self {
            store,
            tenant_id,
            now: Utc::now(),
            staged: Vec::new(),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Business timestamp shared by every event of this attempt.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Load and rehydrate an aggregate (persisted history + staged events).
    pub fn load<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(self.tenant_id, aggregate_id)?;
        validate_loaded_stream(self.tenant_id, aggregate_id, &history)?;

        let mut aggregate = make_aggregate(aggregate_id);
        apply_history(&mut aggregate, history.into_iter().map(|e| e.payload))?;

        if let Some(staged) = self.staged.iter().find(|s| s.aggregate_id == aggregate_id) {
            apply_history(&mut aggregate, staged.events.iter().map(|e| e.payload.clone()))?;
        }

        Ok(aggregate)
    }

    /// Handle `command` on an aggregate previously returned by [`Self::load`],
    /// apply the decided events to it and stage them for commit.
    ///
    /// The first decision on a stream pins its expected version.
    pub fn decide<A>(
        &mut self,
        aggregate: &mut A,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
    ) -> Result<Vec<A::Event>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: ledgerly_events::Event + Serialize,
    {
        let decided = aggregate.handle(&command)?;
        if decided.is_empty() {
            return Ok(decided);
        }

        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    self.tenant_id,
                    aggregate_id,
                    aggregate_type,
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        match self.staged.iter_mut().find(|s| s.aggregate_id == aggregate_id) {
            Some(staged) => staged.events.extend(uncommitted),
            None => self.staged.push(StagedStream {
                aggregate_id,
                aggregate_type: aggregate_type.to_string(),
                expected_version: ExpectedVersion::Exact(aggregate.version()),
                events: uncommitted,
            }),
        }

        for ev in &decided {
            aggregate.apply(ev);
        }

        Ok(decided)
    }

    /// Whether anything has been staged so far.
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    fn into_appends(self) -> Vec<StreamAppend> {
        let tenant_id = self.tenant_id;
        self.staged
            .into_iter()
            .map(|s| StreamAppend {
                tenant_id,
                aggregate_id: s.aggregate_id,
                aggregate_type: s.aggregate_type,
                expected_version: s.expected_version,
                events: s.events,
            })
            .collect()
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Generic over the store and bus so tests run against
/// `InMemoryEventStore`/`InMemoryEventBus` and production against Postgres.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
    retry: RetryPolicy,
    locks: StreamLocks,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self {
            store,
            bus,
            retry: RetryPolicy::default(),
            locks: StreamLocks::new(),
        }
    }

    /// Cap the attempts `execute` makes on version conflicts (at least one).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry.timeout = timeout;
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.retry.max_attempts
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch one command against one aggregate (no retry).
    ///
    /// A stale version surfaces as `DispatchError::Concurrency`; publication
    /// failures surface as `DispatchError::Publish` after the append succeeded.
    pub fn dispatch<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: ledgerly_events::Event + Serialize + DeserializeOwned,
    {
        let history = self.store.load_stream(tenant_id, aggregate_id)?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        apply_history(&mut aggregate, history.into_iter().map(|e| e.payload))?;

        let decided = aggregate.handle(&command)?;
        if decided.is_empty() {
            return Ok(vec![]);
        }

        let aggregate_type = aggregate_type.into();
        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    tenant_id,
                    aggregate_id,
                    aggregate_type.clone(),
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;

        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(committed)
    }

    /// Run `work` in a unit of work and commit everything it staged atomically.
    ///
    /// Version conflicts re-run `work` on fresh state, serialized behind the
    /// streams that conflicted, until it commits. Only an exhausted
    /// [`RetryPolicy`] surfaces as `DispatchError::Concurrency`. Errors
    /// returned by `work` abort immediately, and `work` may use its own error
    /// type as long as dispatch errors convert into it.
    ///
    /// Publication happens after commit and is best-effort: failures are
    /// logged, since read models can always be rebuilt from the store.
    pub fn execute<T, E>(
        &self,
        tenant_id: TenantId,
        mut work: impl FnMut(&mut UnitOfWork<'_, S>) -> Result<T, E>,
    ) -> Result<(T, Vec<StoredEvent>), E>
    where
        E: From<DispatchError>,
    {
        let started = Instant::now();
        let mut attempt = 1;
        let mut contended: Vec<AggregateId> = Vec::new();
        loop {
            let guards = self.locks.acquire(tenant_id, &contended);
            let mut uow = UnitOfWork::new(&self.store, tenant_id);
            let output = work(&mut uow)?;
            let appends = uow.into_appends();
            if appends.is_empty() {
                return Ok((output, vec![]));
            }
            let touched: Vec<AggregateId> = appends.iter().map(|a| a.aggregate_id).collect();

            match self.store.append_streams(appends) {
                Ok(committed) => {
                    self.publish_all(&committed);
                    return Ok((output, committed));
                }
                Err(EventStoreError::Concurrency(msg)) => {
                    if let Some(reason) = self.retry.exhausted(attempt, started.elapsed()) {
                        warn!(
                            %tenant_id,
                            attempt,
                            %reason,
                            conflict = %msg,
                            "giving up on unit of work"
                        );
                        return Err(DispatchError::Concurrency(format!("{reason}: {msg}")).into());
                    }
                    debug!(
                        %tenant_id,
                        attempt,
                        reason = %msg,
                        "version conflict, retrying unit of work"
                    );
                    for id in touched {
                        if !contended.contains(&id) {
                            contended.push(id);
                        }
                    }
                    drop(guards);
                    backoff(attempt);
                    attempt += 1;
                }
                Err(other) => return Err(DispatchError::from(other).into()),
            }
        }
    }

    /// Load and rehydrate an aggregate without writing anything.
    pub fn load<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        UnitOfWork::new(&self.store, tenant_id).load(aggregate_id, make_aggregate)
    }

    fn publish_all(&self, committed: &[StoredEvent]) {
        for stored in committed {
            if let Err(e) = self.bus.publish(stored.to_envelope()) {
                error!(
                    tenant_id = %stored.tenant_id,
                    aggregate_id = %stored.aggregate_id,
                    sequence = stored.sequence_number,
                    error = ?e,
                    "failed to publish committed event"
                );
            }
        }
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // Guards against a backend returning foreign or out-of-order rows.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.tenant_id != tenant_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number != last + 1 {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "gap or reordering in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(
    aggregate: &mut A,
    payloads: impl IntoIterator<Item = JsonValue>,
) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for payload in payloads {
        let ev: A::Event =
            serde_json::from_value(payload).map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}
