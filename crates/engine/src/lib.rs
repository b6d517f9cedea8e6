//! Wallet ledger application layer.
//!
//! Composes the pure wallet domain with the infra dispatcher into the
//! operations clients call: account registration, ledger appends, referral
//! commissions, withdrawals and plan purchases. [`WalletService`] is the
//! facade over all of them.

pub mod accounts;
pub mod bootstrap;
pub mod commission;
pub mod error;
pub mod ledger;
pub mod plans;
pub mod service;
pub mod withdrawal;

mod streams;

pub use accounts::{AccountStore, NewAccount};
pub use commission::CommissionEngine;
pub use error::LedgerError;
pub use ledger::{AppendReceipt, AppendRequest, EntryFilter, Ledger, PaymentCapture, PaymentReceipt};
pub use plans::{InMemoryPlanCatalog, PlanCatalog, PlanPurchase, Subscriptions};
pub use service::{ServiceConfig, WalletService};
pub use withdrawal::WithdrawalWorkflow;
