//! Event primitives: the `Event` trait, tenant-scoped envelopes and the
//! in-process pub/sub bus that carries committed ledger facts to read models.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
