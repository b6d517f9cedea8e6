//! Event publishing/subscription abstraction.
//!
//! The bus distributes events **after** they are committed to the event store.
//! The store stays the source of truth: a consumer that misses a message can
//! always be rebuilt by replaying the tenant's streams.
//!
//! Delivery is at-least-once and per-publisher ordered. Consumers (the ledger
//! stats projection, tests) must tolerate duplicates; they do so by
//! tracking the last applied sequence number per stream.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError};

/// A subscription to the bus. Each subscription receives every message
/// published after it was created.
///
/// ```ignore
/// let sub = bus.subscribe();
/// while let Ok(envelope) = sub.try_recv() {
///     projection.apply_envelope(&envelope)?;
/// }
/// ```
///
/// Intended for a single consuming thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain everything currently queued without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic pub/sub with broadcast semantics.
///
/// ```text
/// WalletService → EventStore (append_streams) → EventBus (publish) → projections
/// ```
///
/// `publish` failures are surfaced to the caller. Since the events are already
/// durable at that point, republishing is always safe.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
