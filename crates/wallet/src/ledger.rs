use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledgerly_core::{Aggregate, AggregateRoot, DomainError, Entity, TenantId};
use ledgerly_events::Event;

use crate::ids::{AccountId, EntryId, WalletId};

/// Stream type of per-account ledgers.
pub const AGGREGATE_TYPE: &str = "wallet.ledger";

/// Balance-affecting entry kinds.
///
/// The simple deposit/withdraw/commission vocabulary maps onto this set
/// (`deposit` = `Credit`, `withdraw` = `Debit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Credit,
    Debit,
    /// Zero-amount audit marker written when a withdrawal is requested.
    WithdrawRequest,
    WithdrawPayout,
    Fee,
    Refund,
    Reversal,
    Commission,
}

/// Which way an entry moves the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inflow,
    Outflow,
    Marker,
}

impl EntryKind {
    pub const ALL: [EntryKind; 8] = [
        EntryKind::Credit,
        EntryKind::Debit,
        EntryKind::WithdrawRequest,
        EntryKind::WithdrawPayout,
        EntryKind::Fee,
        EntryKind::Refund,
        EntryKind::Reversal,
        EntryKind::Commission,
    ];

    pub fn direction(self) -> Direction {
        match self {
            EntryKind::Credit | EntryKind::Refund | EntryKind::Commission => Direction::Inflow,
            EntryKind::Debit | EntryKind::WithdrawPayout | EntryKind::Fee | EntryKind::Reversal => {
                Direction::Outflow
            }
            EntryKind::WithdrawRequest => Direction::Marker,
        }
    }

    pub fn is_marker(self) -> bool {
        self.direction() == Direction::Marker
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Credit => "CREDIT",
            EntryKind::Debit => "DEBIT",
            EntryKind::WithdrawRequest => "WITHDRAW_REQUEST",
            EntryKind::WithdrawPayout => "WITHDRAW_PAYOUT",
            EntryKind::Fee => "FEE",
            EntryKind::Refund => "REFUND",
            EntryKind::Reversal => "REVERSAL",
            EntryKind::Commission => "COMMISSION",
        }
    }

    /// Signed balance delta of `amount` for this kind.
    pub fn signed(self, amount: i64) -> i64 {
        match self.direction() {
            Direction::Inflow => amount,
            Direction::Outflow => -amount,
            Direction::Marker => 0,
        }
    }
}

impl core::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "credit" | "deposit" => Ok(EntryKind::Credit),
            "debit" | "withdraw" => Ok(EntryKind::Debit),
            "withdraw_request" => Ok(EntryKind::WithdrawRequest),
            "withdraw_payout" | "payout" => Ok(EntryKind::WithdrawPayout),
            "fee" => Ok(EntryKind::Fee),
            "refund" => Ok(EntryKind::Refund),
            "reversal" => Ok(EntryKind::Reversal),
            "commission" => Ok(EntryKind::Commission),
            other => Err(DomainError::validation(format!("unknown entry kind '{other}'"))),
        }
    }
}

/// Commission sub-kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommissionKind {
    /// One-time bonus on the referred account's first deposit.
    Signup,
    /// Fixed amount per eligible transaction.
    Tx,
}

impl CommissionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommissionKind::Signup => "signup",
            CommissionKind::Tx => "tx",
        }
    }
}

impl FromStr for CommissionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "signup" => Ok(CommissionKind::Signup),
            "tx" => Ok(CommissionKind::Tx),
            other => Err(DomainError::validation(format!("unknown commission kind '{other}'"))),
        }
    }
}

/// Commission details carried by `Commission` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionInfo {
    pub kind: CommissionKind,
    /// The referred account whose transaction produced this commission.
    pub source_account_id: AccountId,
}

/// One immutable ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: EntryId,
    pub account_id: AccountId,
    pub kind: EntryKind,
    /// Non-negative amount in minor units.
    pub amount: i64,
    pub balance_after: i64,
    pub note: Option<String>,
    pub payment_order_id: Option<String>,
    pub related_entry_id: Option<EntryId>,
    pub commission: Option<CommissionInfo>,
    /// Position in the account's ledger (1-based, gap-free).
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn signed_amount(&self) -> i64 {
        self.kind.signed(self.amount)
    }
}

impl Entity for LedgerEntry {
    type Id = EntryId;

    fn id(&self) -> &Self::Id {
        &self.entry_id
    }
}

/// Aggregate root: the ledger of one account.
///
/// The balance is never stored on the account; it is the `balance_after` of
/// the latest entry in this stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wallet {
    id: WalletId,
    tenant_id: Option<TenantId>,
    account_id: Option<AccountId>,
    balance: i64,
    entries: Vec<LedgerEntry>,
    version: u64,
}

impl Wallet {
    /// Empty aggregate for rehydration.
    pub fn empty(id: WalletId) -> Self {
        Self {
            id,
            tenant_id: None,
            account_id: None,
            balance: 0,
            entries: Vec::new(),
            version: 0,
        }
    }

    pub fn for_account(account_id: AccountId) -> Self {
        Self::empty(WalletId::for_account(account_id))
    }

    pub fn id_typed(&self) -> WalletId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn account_id(&self) -> Option<AccountId> {
        self.account_id
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    /// Entries in ledger order (oldest first).
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn last_entry(&self) -> Option<&LedgerEntry> {
        self.entries.last()
    }
}

impl AggregateRoot for Wallet {
    type Id = WalletId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PostEntry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostEntry {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub entry_id: EntryId,
    pub kind: EntryKind,
    pub amount: i64,
    pub note: Option<String>,
    pub payment_order_id: Option<String>,
    pub related_entry_id: Option<EntryId>,
    pub commission: Option<CommissionInfo>,
    pub occurred_at: DateTime<Utc>,
}

impl PostEntry {
    pub fn new(
        tenant_id: TenantId,
        account_id: AccountId,
        kind: EntryKind,
        amount: i64,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            account_id,
            entry_id: EntryId::new(),
            kind,
            amount,
            note: None,
            payment_order_id: None,
            related_entry_id: None,
            commission: None,
            occurred_at,
        }
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note.filter(|n| !n.trim().is_empty());
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

    pub fn with_commission(mut self, info: CommissionInfo) -> Self {
        self.commission = Some(info);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletCommand {
    Post(PostEntry),
}

/// Event: EntryAppended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAppended {
    pub tenant_id: TenantId,
    pub entry: LedgerEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletEvent {
    EntryAppended(EntryAppended),
}

impl Event for WalletEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WalletEvent::EntryAppended(_) => "wallet.ledger.entry_appended",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WalletEvent::EntryAppended(e) => e.entry.occurred_at,
        }
    }
}

impl Aggregate for Wallet {
    type Command = WalletCommand;
    type Event = WalletEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            WalletEvent::EntryAppended(e) => {
                if self.tenant_id.is_none() {
                    self.tenant_id = Some(e.tenant_id);
                    self.account_id = Some(e.entry.account_id);
                }
                self.balance = e.entry.balance_after;
                self.entries.push(e.entry.clone());
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            WalletCommand::Post(cmd) => self.handle_post(cmd),
        }
    }
}

impl Wallet {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        match self.tenant_id {
            Some(existing) if existing != tenant_id => {
                Err(DomainError::invariant("tenant mismatch"))
            }
            _ => Ok(()),
        }
    }

    fn handle_post(&self, cmd: &PostEntry) -> Result<Vec<WalletEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;

        if self.id != WalletId::for_account(cmd.account_id) {
            return Err(DomainError::invariant("wallet stream does not belong to account"));
        }

        if cmd.kind.is_marker() {
            if cmd.amount != 0 {
                return Err(DomainError::invalid_amount(format!(
                    "{} entries carry a zero amount",
                    cmd.kind
                )));
            }
        } else if cmd.amount <= 0 {
            return Err(DomainError::invalid_amount("amount must be positive"));
        }

        match (cmd.kind, cmd.commission.is_some()) {
            (EntryKind::Commission, false) => {
                return Err(DomainError::validation("commission entries need commission details"));
            }
            (kind, true) if kind != EntryKind::Commission => {
                return Err(DomainError::validation(
                    "only commission entries carry commission details",
                ));
            }
            _ => {}
        }

        let next = match cmd.kind.direction() {
            Direction::Inflow => self.balance.checked_add(cmd.amount),
            Direction::Outflow => self.balance.checked_sub(cmd.amount),
            Direction::Marker => Some(self.balance),
        }
        .ok_or_else(|| DomainError::invariant("balance overflow"))?;

        if next < 0 {
            return Err(DomainError::InsufficientBalance {
                available: self.balance,
                requested: cmd.amount,
            });
        }

        Ok(vec![WalletEvent::EntryAppended(EntryAppended {
            tenant_id: cmd.tenant_id,
            entry: LedgerEntry {
                entry_id: cmd.entry_id,
                account_id: cmd.account_id,
                kind: cmd.kind,
                amount: cmd.amount,
                balance_after: next,
                note: cmd.note.clone(),
                payment_order_id: cmd.payment_order_id.clone(),
                related_entry_id: cmd.related_entry_id,
                commission: cmd.commission,
                sequence: self.version + 1,
                occurred_at: cmd.occurred_at,
            },
        })])
    }
}
