//! Infrastructure layer: event store backends, command execution, read
//! models and settings.

pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod projections;
pub mod read_model;

pub use command_dispatcher::{CommandDispatcher, DispatchError, RetryPolicy, UnitOfWork};
