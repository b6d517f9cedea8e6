//! Wallet service facade.
//!
//! One entry point per external operation. User-initiated movements
//! (deposit, withdraw, gateway capture) feed the commission engine after
//! they commit; admin adjustments, plan purchases and payouts do not.
//!
//! Reporting reads come from [`LedgerStatsProjection`], fed from the event
//! bus. The service subscribes on its first stats query and drains the feed
//! after every write and before every query, so the feed only ever holds what
//! was published since the last call. Only tenants that have been queried
//! are tracked: a tenant is rebuilt from the store on its first query and
//! again after its envelopes arrive out of order.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use ledgerly_core::TenantId;
use ledgerly_events::{EventBus, EventEnvelope, Subscription as Feed};
use ledgerly_infra::command_dispatcher::CommandDispatcher;
use ledgerly_infra::config::{Settings, SettingsError};
use ledgerly_infra::event_store::EventStore;
use ledgerly_infra::projections::{
    DailyLedgerStats, LedgerStats, LedgerStatsProjection, ReferrerSummary,
};
use ledgerly_infra::read_model::InMemoryTenantStore;
use ledgerly_wallet::{
    Account, AccountId, AccountStatus, CommissionPolicy, EntryKind, LedgerEntry, PayoutMethod, Plan,
    PlanId, Subscription, SubscriptionId, WithdrawRequest, WithdrawRequestId, WithdrawStatus,
};

use crate::accounts::{AccountStore, DEFAULT_MAX_CODE_ATTEMPTS, NewAccount};
use crate::commission::CommissionEngine;
use crate::error::LedgerError;
use crate::ledger::{
    AccountCheck, AppendReceipt, AppendRequest, EntryFilter, Ledger, PaymentCapture, PaymentReceipt,
};
use crate::plans::{PlanCatalog, PlanPurchase, Subscriptions};
use crate::withdrawal::WithdrawalWorkflow;

type StatsStore = InMemoryTenantStore<NaiveDate, DailyLedgerStats>;
type Envelope = EventEnvelope<JsonValue>;

/// Policy knobs injected at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub policy: CommissionPolicy,
    pub max_code_attempts: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            policy: CommissionPolicy::default(),
            max_code_attempts: DEFAULT_MAX_CODE_ATTEMPTS,
        }
    }
}

impl ServiceConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        Ok(Self {
            policy: settings.commission_policy()?,
            max_code_attempts: settings.referral.max_code_attempts,
        })
    }
}

pub struct WalletService<S, B, C> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    accounts: AccountStore<S, B>,
    ledger: Ledger<S, B>,
    commissions: CommissionEngine<S, B>,
    withdrawals: WithdrawalWorkflow<S, B>,
    subscriptions: Subscriptions<S, B, C>,
    stats: LedgerStatsProjection<StatsStore>,
    feed: Mutex<Option<Feed<Envelope>>>,
    warmed: Mutex<HashSet<TenantId>>,
}

impl<S, B, C> WalletService<S, B, C>
where
    S: EventStore,
    B: EventBus<Envelope>,
    C: PlanCatalog,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        catalog: C,
        config: ServiceConfig,
    ) -> Self {
        Self {
            accounts: AccountStore::new(Arc::clone(&dispatcher))
                .with_max_code_attempts(config.max_code_attempts),
            ledger: Ledger::new(Arc::clone(&dispatcher)),
            commissions: CommissionEngine::new(Arc::clone(&dispatcher), config.policy),
            withdrawals: WithdrawalWorkflow::new(Arc::clone(&dispatcher)),
            subscriptions: Subscriptions::new(Arc::clone(&dispatcher), catalog),
            stats: LedgerStatsProjection::new(StatsStore::new()),
            feed: Mutex::new(None),
            warmed: Mutex::new(HashSet::new()),
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher<S, B>> {
        &self.dispatcher
    }

    pub fn accounts(&self) -> &AccountStore<S, B> {
        &self.accounts
    }

    pub fn ledger(&self) -> &Ledger<S, B> {
        &self.ledger
    }

    pub fn commissions(&self) -> &CommissionEngine<S, B> {
        &self.commissions
    }

    pub fn withdrawals(&self) -> &WithdrawalWorkflow<S, B> {
        &self.withdrawals
    }

    pub fn subscriptions(&self) -> &Subscriptions<S, B, C> {
        &self.subscriptions
    }

    // Accounts

    pub fn register_account(
        &self,
        tenant_id: TenantId,
        new: NewAccount,
    ) -> Result<Account, LedgerError> {
        self.after_write(self.accounts.register(tenant_id, new))
    }

    pub fn set_account_status(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        status: AccountStatus,
    ) -> Result<Account, LedgerError> {
        self.after_write(self.accounts.set_status(tenant_id, account_id, status))
    }

    pub fn get_account(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> Result<Account, LedgerError> {
        self.accounts.get(tenant_id, account_id)
    }

    // Money movements

    pub fn deposit(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        amount: i64,
    ) -> Result<AppendReceipt, LedgerError> {
        let request =
            AppendRequest::new(account_id, EntryKind::Credit, amount).with_note("Deposit");
        self.user_movement(tenant_id, request)
    }

    pub fn withdraw(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        amount: i64,
    ) -> Result<AppendReceipt, LedgerError> {
        let request =
            AppendRequest::new(account_id, EntryKind::Debit, amount).with_note("Withdraw");
        self.user_movement(tenant_id, request)
    }

    pub fn admin_credit(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        amount: i64,
        note: Option<String>,
    ) -> Result<AppendReceipt, LedgerError> {
        let note = note.unwrap_or_else(|| "Manual credit".to_string());
        let request = AppendRequest::new(account_id, EntryKind::Credit, amount).with_note(note);
        self.after_write(self.ledger.append(tenant_id, request))
    }

    pub fn admin_debit(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        amount: i64,
        note: Option<String>,
    ) -> Result<AppendReceipt, LedgerError> {
        let note = note.unwrap_or_else(|| "Manual debit".to_string());
        let request = AppendRequest::new(account_id, EntryKind::Debit, amount).with_note(note);
        self.after_write(self.ledger.append(tenant_id, request))
    }

    /// Gateway capture, idempotent per order id. Only the first delivery
    /// earns commissions.
    pub fn on_payment_captured(
        &self,
        tenant_id: TenantId,
        capture: PaymentCapture,
    ) -> Result<PaymentReceipt, LedgerError> {
        let receipt = self.after_write(self.ledger.on_payment_captured(tenant_id, capture))?;
        if let PaymentReceipt::Applied(applied) = &receipt {
            self.commissions.process(tenant_id, &applied.entry);
            self.absorb_feed();
        }
        Ok(receipt)
    }

    fn user_movement(
        &self,
        tenant_id: TenantId,
        request: AppendRequest,
    ) -> Result<AppendReceipt, LedgerError> {
        let receipt = self.after_write(self.ledger.append_checked(
            tenant_id,
            request,
            AccountCheck::Active,
        ))?;
        let paid = self.commissions.process(tenant_id, &receipt.entry);
        if !paid.is_empty() {
            debug!(%tenant_id, count = paid.len(), "commissions followed entry");
            self.absorb_feed();
        }
        Ok(receipt)
    }

    // Plans

    pub fn list_plans(&self, tenant_id: TenantId) -> Vec<Plan> {
        self.subscriptions.catalog().list(tenant_id, true)
    }

    pub fn purchase_plan(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        plan_id: PlanId,
    ) -> Result<PlanPurchase, LedgerError> {
        self.after_write(self.subscriptions.purchase_plan(tenant_id, account_id, plan_id))
    }

    pub fn cancel_subscription(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        subscription_id: SubscriptionId,
    ) -> Result<Subscription, LedgerError> {
        self.after_write(self.subscriptions.cancel_subscription(
            tenant_id,
            account_id,
            subscription_id,
        ))
    }

    // Withdrawals

    pub fn create_withdraw_request(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        amount: i64,
        method: PayoutMethod,
    ) -> Result<WithdrawRequest, LedgerError> {
        self.after_write(self.withdrawals.create_request(tenant_id, account_id, amount, method))
    }

    pub fn admin_approve_withdraw(
        &self,
        tenant_id: TenantId,
        request_id: WithdrawRequestId,
        admin_note: Option<String>,
    ) -> Result<WithdrawRequest, LedgerError> {
        self.after_write(self.withdrawals.approve(tenant_id, request_id, admin_note))
    }

    pub fn admin_reject_withdraw(
        &self,
        tenant_id: TenantId,
        request_id: WithdrawRequestId,
        admin_note: Option<String>,
    ) -> Result<WithdrawRequest, LedgerError> {
        self.after_write(self.withdrawals.reject(tenant_id, request_id, admin_note))
    }

    pub fn admin_mark_paid(
        &self,
        tenant_id: TenantId,
        request_id: WithdrawRequestId,
        payout_ref: &str,
    ) -> Result<(WithdrawRequest, LedgerEntry), LedgerError> {
        self.after_write(self.withdrawals.mark_paid(tenant_id, request_id, payout_ref))
    }

    pub fn get_withdraw_request(
        &self,
        tenant_id: TenantId,
        request_id: WithdrawRequestId,
    ) -> Result<WithdrawRequest, LedgerError> {
        self.withdrawals.get(tenant_id, request_id)
    }

    pub fn list_withdraw_requests(
        &self,
        tenant_id: TenantId,
        account_id: Option<AccountId>,
        status: Option<WithdrawStatus>,
    ) -> Result<Vec<WithdrawRequest>, LedgerError> {
        self.withdrawals.list(tenant_id, account_id, status)
    }

    // Reads

    pub fn get_balance(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> Result<i64, LedgerError> {
        self.ledger.get_balance(tenant_id, account_id)
    }

    pub fn list_entries(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        filter: &EntryFilter,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.ledger.list_entries(tenant_id, account_id, filter)
    }

    pub fn stats(&self, tenant_id: TenantId) -> Result<LedgerStats, LedgerError> {
        self.catch_up(tenant_id)?;
        Ok(self.stats.stats(tenant_id))
    }

    pub fn top_referrers(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<ReferrerSummary>, LedgerError> {
        self.catch_up(tenant_id)?;
        Ok(self.stats.top_referrers(tenant_id, limit))
    }

    /// Drain the feed into the projection after a write. Skipped while
    /// another thread holds the feed, since that thread is draining it.
    fn after_write<T>(&self, result: T) -> T {
        self.absorb_feed();
        result
    }

    fn absorb_feed(&self) {
        let Ok(feed) = self.feed.try_lock() else {
            return;
        };
        let Some(feed) = feed.as_ref() else {
            return;
        };
        let Ok(mut warmed) = self.warmed.lock() else {
            return;
        };
        self.apply_feed(feed, &mut warmed);
    }

    /// Apply queued envelopes of tracked tenants. A tenant whose envelopes
    /// do not line up is dropped from `warmed` and rebuilt on its next query.
    fn apply_feed(&self, feed: &Feed<Envelope>, warmed: &mut HashSet<TenantId>) {
        for envelope in feed.drain() {
            let tenant_id = envelope.tenant_id();
            if !warmed.contains(&tenant_id) {
                continue;
            }
            if let Err(e) = self.stats.apply_envelope(&envelope) {
                warn!(%tenant_id, error = %e, "stats projection out of step, rebuilding tenant");
                warmed.remove(&tenant_id);
            }
        }
    }

    /// Subscribe on first use, apply everything published since the last
    /// drain, then load `queried` from the store if it is not tracked yet.
    fn catch_up(&self, queried: TenantId) -> Result<(), LedgerError> {
        let mut feed = self
            .feed
            .lock()
            .map_err(|_| LedgerError::Storage("stats feed lock poisoned".to_string()))?;
        let feed = feed.get_or_insert_with(|| self.dispatcher.bus().subscribe());
        let mut warmed = self
            .warmed
            .lock()
            .map_err(|_| LedgerError::Storage("stats warm-up lock poisoned".to_string()))?;

        self.apply_feed(feed, &mut warmed);
        if warmed.contains(&queried) {
            return Ok(());
        }

        debug!(tenant_id = %queried, "rebuilding ledger stats from the store");
        self.stats
            .rebuild_tenant(self.dispatcher.store(), queried)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        warmed.insert(queried);
        Ok(())
    }
}
