//! Wallet domain (event-sourced).
//!
//! Pure domain logic only: no IO, no persistence concerns. Every piece of
//! state here (balances, request statuses, the signup-bonus latch) is derived
//! by replaying events produced by the aggregates' `handle` methods.

pub mod account;
pub mod claim;
pub mod commission;
pub mod ids;
pub mod ledger;
pub mod subscription;
pub mod withdrawal;

pub use account::{
    Account, AccountCommand, AccountEvent, AccountStatus, ActivatePlan, ClearSubscription,
    EarnCommission, LatchSignupBonus, RecordReferral, ReferralStats, RegisterAccount, Role,
    SetStatus,
};
pub use claim::{Claim, ClaimCommand, ClaimEvent, ClaimKey, ReserveClaim};
pub use commission::{CommissionPayout, CommissionPolicy, SignupBonus};
pub use ids::{AccountId, EntryId, PlanId, SubscriptionId, WalletId, WithdrawRequestId};
pub use ledger::{
    CommissionInfo, CommissionKind, Direction, EntryAppended, EntryKind, LedgerEntry, PostEntry,
    Wallet, WalletCommand, WalletEvent,
};
pub use subscription::{
    CancelSubscription, Plan, StartSubscription, Subscription, SubscriptionCommand,
    SubscriptionEvent, SubscriptionStatus,
};
pub use withdrawal::{
    ApproveWithdraw, CreateWithdrawRequest, MarkWithdrawPaid, PayoutMethod, RejectWithdraw,
    WithdrawCommand, WithdrawEvent, WithdrawRequest, WithdrawStatus,
};
