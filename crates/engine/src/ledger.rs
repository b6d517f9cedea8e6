//! Ledger: the single writer of balance-affecting entries.
//!
//! Every append loads the account's wallet stream, derives the current
//! balance from its latest entry, validates the movement and commits the new
//! entry with an exact expected version. Concurrent appends on one account
//! serialize through optimistic retries; different accounts never contend.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use ledgerly_core::TenantId;
use ledgerly_events::{EventBus, EventEnvelope};
use ledgerly_infra::UnitOfWork;
use ledgerly_infra::command_dispatcher::CommandDispatcher;
use ledgerly_infra::event_store::EventStore;
use ledgerly_wallet::claim::AGGREGATE_TYPE as CLAIM;
use ledgerly_wallet::ledger::AGGREGATE_TYPE as LEDGER;
use ledgerly_wallet::{
    Account, AccountId, Claim, ClaimCommand, ClaimKey, CommissionKind, EntryId, EntryKind,
    LedgerEntry, PostEntry, ReserveClaim, Wallet, WalletCommand, WalletEvent, WalletId,
};

use crate::error::LedgerError;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// A balance movement to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub account_id: AccountId,
    pub kind: EntryKind,
    /// Minor units. Zero only for `WithdrawRequest` markers.
    pub amount: i64,
    pub note: Option<String>,
    pub payment_order_id: Option<String>,
    pub related_entry_id: Option<EntryId>,
}

impl AppendRequest {
    pub fn new(account_id: AccountId, kind: EntryKind, amount: i64) -> Self {
        Self {
            account_id,
            kind,
            amount,
            note: None,
            payment_order_id: None,
            related_entry_id: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_payment_order(mut self, order_id: impl Into<String>) -> Self {
        self.payment_order_id = Some(order_id.into());
        self
    }

    pub fn with_related_entry(mut self, entry_id: EntryId) -> Self {
        self.related_entry_id = Some(entry_id);
        self
    }

    fn into_post(self, tenant_id: TenantId, occurred_at: DateTime<Utc>) -> PostEntry {
        let mut cmd =
            PostEntry::new(tenant_id, self.account_id, self.kind, self.amount, occurred_at)
                .with_note(self.note);
        if let Some(order_id) = self.payment_order_id {
            cmd = cmd.with_payment_order(order_id);
        }
        if let Some(entry_id) = self.related_entry_id {
            cmd = cmd.with_related_entry(entry_id);
        }
        cmd
    }
}

/// The committed entry and the balance it left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    pub entry: LedgerEntry,
    pub balance: i64,
}

impl AppendReceipt {
    fn from_entry(entry: LedgerEntry) -> Self {
        Self {
            balance: entry.balance_after,
            entry,
        }
    }
}

/// A captured gateway payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCapture {
    pub order_id: String,
    pub account_id: AccountId,
    pub amount: i64,
}

/// Outcome of a gateway notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentReceipt {
    Applied(AppendReceipt),
    /// The order was credited before; nothing was written.
    Duplicate { order_id: String },
}

impl PaymentReceipt {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, PaymentReceipt::Duplicate { .. })
    }

    /// Treat a replayed notification as an error.
    pub fn applied(self) -> Result<AppendReceipt, LedgerError> {
        match self {
            PaymentReceipt::Applied(receipt) => Ok(receipt),
            PaymentReceipt::Duplicate { order_id } => {
                Err(LedgerError::DuplicatePaymentNotification(order_id))
            }
        }
    }
}

/// Entry listing filter. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    /// Empty means every kind.
    pub kinds: BTreeSet<EntryKind>,
    pub commission_kind: Option<CommissionKind>,
    pub occurred_after: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
    /// Defaults to 20, capped at 100.
    pub limit: Option<usize>,
}

impl EntryFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = EntryKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    fn matches(&self, entry: &LedgerEntry) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&entry.kind) {
            return false;
        }
        if let Some(kind) = self.commission_kind {
            if entry.commission.map(|c| c.kind) != Some(kind) {
                return false;
            }
        }
        if self.occurred_after.is_some_and(|after| entry.occurred_at <= after) {
            return false;
        }
        if self.occurred_before.is_some_and(|before| entry.occurred_at >= before) {
            return false;
        }
        true
    }
}

/// How strictly the owning account is checked before an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccountCheck {
    /// Admin and system movements: the account must exist.
    Registered,
    /// User-initiated movements: the account must exist and not be banned.
    Active,
}

/// Load a registered account inside a unit of work.
pub(crate) fn load_account<S: EventStore>(
    uow: &UnitOfWork<'_, S>,
    account_id: AccountId,
) -> Result<Account, LedgerError> {
    let account = uow.load(account_id.0, |_| Account::empty(account_id))?;
    if !account.is_registered() {
        return Err(LedgerError::AccountNotFound(account_id));
    }
    Ok(account)
}

/// Stage one entry on the account's wallet stream.
pub(crate) fn stage_entry<S: EventStore>(
    uow: &mut UnitOfWork<'_, S>,
    cmd: PostEntry,
    check: AccountCheck,
) -> Result<LedgerEntry, LedgerError> {
    let account = load_account(uow, cmd.account_id)?;
    if check == AccountCheck::Active {
        account.ensure_active()?;
    }

    let wallet_id = WalletId::for_account(cmd.account_id);
    let mut wallet = uow.load(wallet_id.0, |_| Wallet::empty(wallet_id))?;
    let decided = uow.decide(&mut wallet, wallet_id.0, LEDGER, WalletCommand::Post(cmd))?;

    decided
        .into_iter()
        .next()
        .map(|ev| match ev {
            WalletEvent::EntryAppended(e) => e.entry,
        })
        .ok_or_else(|| {
            LedgerError::Storage("wallet accepted the entry without recording it".to_string())
        })
}

/// Append-only ledger over per-account wallet streams.
#[derive(Debug)]
pub struct Ledger<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
}

impl<S, B> Clone for Ledger<S, B> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

impl<S, B> Ledger<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: Arc<CommandDispatcher<S, B>>) -> Self {
        Self { dispatcher }
    }

    /// Append one entry for an existing account.
    pub fn append(
        &self,
        tenant_id: TenantId,
        request: AppendRequest,
    ) -> Result<AppendReceipt, LedgerError> {
        self.append_checked(tenant_id, request, AccountCheck::Registered)
    }

    #[instrument(
        skip(self, request),
        fields(tenant_id = %tenant_id, account_id = %request.account_id, kind = %request.kind),
        err
    )]
    pub(crate) fn append_checked(
        &self,
        tenant_id: TenantId,
        request: AppendRequest,
        check: AccountCheck,
    ) -> Result<AppendReceipt, LedgerError> {
        let (entry, _) = self.dispatcher.execute(tenant_id, |uow| {
            let cmd = request.clone().into_post(tenant_id, uow.now());
            stage_entry(uow, cmd, check)
        })?;

        info!(
            entry_id = %entry.entry_id,
            amount = entry.amount,
            balance_after = entry.balance_after,
            sequence = entry.sequence,
            "ledger entry committed"
        );
        Ok(AppendReceipt::from_entry(entry))
    }

    /// Current balance: the latest entry's `balance_after`, 0 for a new wallet.
    pub fn get_balance(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> Result<i64, LedgerError> {
        Ok(self.load_wallet(tenant_id, account_id)?.balance())
    }

    /// Entries matching `filter`, newest first.
    pub fn list_entries(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        filter: &EntryFilter,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let wallet = self.load_wallet(tenant_id, account_id)?;
        Ok(wallet
            .entries()
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.page_size())
            .cloned()
            .collect())
    }

    /// Credit a captured gateway payment at most once per order id.
    ///
    /// The credit and the order-id reservation commit together, so sequential
    /// and concurrent replays both come back as [`PaymentReceipt::Duplicate`].
    #[instrument(
        skip(self, capture),
        fields(
            tenant_id = %tenant_id,
            account_id = %capture.account_id,
            order_id = %capture.order_id
        ),
        err
    )]
    pub fn on_payment_captured(
        &self,
        tenant_id: TenantId,
        capture: PaymentCapture,
    ) -> Result<PaymentReceipt, LedgerError> {
        let order_id = capture.order_id.trim().to_string();
        if order_id.is_empty() {
            return Err(LedgerError::Validation("payment order id is required".to_string()));
        }
        let key = ClaimKey::payment_order(&order_id);

        let (applied, _) = self.dispatcher.execute(tenant_id, |uow| {
            let claim_id = key.stream_id();
            let mut claim = uow.load(claim_id, |_| Claim::for_key(&key))?;
            if claim.is_taken() {
                return Ok(None);
            }

            let (account_id, amount) = (capture.account_id, capture.amount);
            let cmd = PostEntry::new(tenant_id, account_id, EntryKind::Credit, amount, uow.now())
                .with_note(Some("Add money (gateway)".to_string()))
                .with_payment_order(order_id.clone());
            let entry = stage_entry(uow, cmd, AccountCheck::Registered)?;

            uow.decide(
                &mut claim,
                claim_id,
                CLAIM,
                ClaimCommand::Reserve(ReserveClaim {
                    tenant_id,
                    key: key.clone(),
                    owner: WalletId::for_account(capture.account_id).0,
                    occurred_at: uow.now(),
                }),
            )?;
            Ok::<_, LedgerError>(Some(entry))
        })?;

        match applied {
            Some(entry) => {
                info!(
                    entry_id = %entry.entry_id,
                    balance_after = entry.balance_after,
                    "gateway payment credited"
                );
                Ok(PaymentReceipt::Applied(AppendReceipt::from_entry(entry)))
            }
            None => {
                info!("gateway payment already applied, skipping");
                Ok(PaymentReceipt::Duplicate { order_id })
            }
        }
    }

    fn load_wallet(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> Result<Wallet, LedgerError> {
        let account = self
            .dispatcher
            .load(tenant_id, account_id.0, |_| Account::empty(account_id))?;
        if !account.is_registered() {
            return Err(LedgerError::AccountNotFound(account_id));
        }
        let wallet_id = WalletId::for_account(account_id);
        Ok(self.dispatcher.load(tenant_id, wallet_id.0, |_| Wallet::empty(wallet_id))?)
    }
}
