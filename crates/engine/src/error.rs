use thiserror::Error;

use ledgerly_core::DomainError;
use ledgerly_infra::DispatchError;
use ledgerly_infra::event_store::EventStoreError;
use ledgerly_wallet::AccountId;

/// Errors returned by every ledger-facing operation.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("insufficient balance (available: {available}, requested: {requested})")]
    InsufficientBalance { available: i64, requested: i64 },

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    /// A gateway notification for an order that was already credited.
    #[error("payment order '{0}' was already applied")]
    DuplicatePaymentNotification(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} is already registered")]
    AlreadyRegistered(String),

    #[error("{0} not found")]
    NotFound(String),

    /// A commit kept conflicting until the retry policy ran out.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<DispatchError> for LedgerError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Concurrency(msg) => LedgerError::Conflict(msg),
            DispatchError::Validation(msg) => LedgerError::Validation(msg),
            DispatchError::InvalidAmount(msg) => LedgerError::InvalidAmount(msg),
            DispatchError::InsufficientBalance {
                available,
                requested,
            } => LedgerError::InsufficientBalance {
                available,
                requested,
            },
            DispatchError::InvalidState(msg) => LedgerError::InvalidState(msg),
            DispatchError::Duplicate(msg) => LedgerError::Conflict(msg),
            DispatchError::InvariantViolation(msg) => LedgerError::Validation(msg),
            DispatchError::Unauthorized => LedgerError::Validation("unauthorized".to_string()),
            DispatchError::NotFound => LedgerError::NotFound("record".to_string()),
            DispatchError::TenantIsolation(msg) => {
                LedgerError::Storage(format!("tenant isolation: {msg}"))
            }
            DispatchError::Deserialize(msg) => LedgerError::Storage(msg),
            DispatchError::Store(e) => LedgerError::Storage(e.to_string()),
            DispatchError::Publish(msg) => LedgerError::Storage(msg),
        }
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        DispatchError::from(value).into()
    }
}

impl From<EventStoreError> for LedgerError {
    fn from(value: EventStoreError) -> Self {
        DispatchError::from(value).into()
    }
}
