use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledgerly_core::{Aggregate, AggregateRoot, DomainError, TenantId};
use ledgerly_events::Event;

use crate::ids::{AccountId, WithdrawRequestId};

pub const AGGREGATE_TYPE: &str = "wallet.withdraw_request";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayoutMethod {
    #[default]
    Upi,
    Bank,
}

impl core::str::FromStr for PayoutMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upi" => Ok(PayoutMethod::Upi),
            "bank" => Ok(PayoutMethod::Bank),
            other => Err(DomainError::validation(format!("unknown payout method '{other}'"))),
        }
    }
}

/// Withdraw request lifecycle.
///
/// `Pending -> Approved -> Paid`, and `Pending | Approved -> Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawStatus {
    Pending,
    Approved,
    Rejected,
    Paid,
}

impl WithdrawStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WithdrawStatus::Rejected | WithdrawStatus::Paid)
    }
}

/// Aggregate root: WithdrawRequest.
///
/// Creating or approving a request never touches the balance. Only the
/// `Paid` transition is committed together with a payout debit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawRequest {
    id: WithdrawRequestId,
    tenant_id: Option<TenantId>,
    account_id: Option<AccountId>,
    amount: i64,
    method: PayoutMethod,
    status: WithdrawStatus,
    payout_ref: Option<String>,
    admin_note: Option<String>,
    requested_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl WithdrawRequest {
    pub fn empty(id: WithdrawRequestId) -> Self {
        Self {
            id,
            tenant_id: None,
            account_id: None,
            amount: 0,
            method: PayoutMethod::Upi,
            status: WithdrawStatus::Pending,
            payout_ref: None,
            admin_note: None,
            requested_at: None,
            updated_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> WithdrawRequestId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn account_id(&self) -> Option<AccountId> {
        self.account_id
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn method(&self) -> PayoutMethod {
        self.method
    }

    pub fn status(&self) -> WithdrawStatus {
        self.status
    }

    pub fn payout_ref(&self) -> Option<&str> {
        self.payout_ref.as_deref()
    }

    pub fn admin_note(&self) -> Option<&str> {
        self.admin_note.as_deref()
    }

    pub fn requested_at(&self) -> Option<DateTime<Utc>> {
        self.requested_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

impl AggregateRoot for WithdrawRequest {
    type Id = WithdrawRequestId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateWithdrawRequest {
    pub tenant_id: TenantId,
    pub request_id: WithdrawRequestId,
    pub account_id: AccountId,
    pub amount: i64,
    pub method: PayoutMethod,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveWithdraw {
    pub tenant_id: TenantId,
    pub admin_note: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectWithdraw {
    pub tenant_id: TenantId,
    pub admin_note: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkWithdrawPaid {
    pub tenant_id: TenantId,
    pub payout_ref: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawCommand {
    Create(CreateWithdrawRequest),
    Approve(ApproveWithdraw),
    Reject(RejectWithdraw),
    MarkPaid(MarkWithdrawPaid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRequested {
    pub tenant_id: TenantId,
    pub request_id: WithdrawRequestId,
    pub account_id: AccountId,
    pub amount: i64,
    pub method: PayoutMethod,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawApproved {
    pub tenant_id: TenantId,
    pub request_id: WithdrawRequestId,
    pub admin_note: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRejected {
    pub tenant_id: TenantId,
    pub request_id: WithdrawRequestId,
    pub admin_note: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawPaid {
    pub tenant_id: TenantId,
    pub request_id: WithdrawRequestId,
    pub account_id: AccountId,
    pub amount: i64,
    pub payout_ref: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawEvent {
    Requested(WithdrawRequested),
    Approved(WithdrawApproved),
    Rejected(WithdrawRejected),
    Paid(WithdrawPaid),
}

impl Event for WithdrawEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WithdrawEvent::Requested(_) => "wallet.withdraw.requested",
            WithdrawEvent::Approved(_) => "wallet.withdraw.approved",
            WithdrawEvent::Rejected(_) => "wallet.withdraw.rejected",
            WithdrawEvent::Paid(_) => "wallet.withdraw.paid",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WithdrawEvent::Requested(e) => e.occurred_at,
            WithdrawEvent::Approved(e) => e.occurred_at,
            WithdrawEvent::Rejected(e) => e.occurred_at,
            WithdrawEvent::Paid(e) => e.occurred_at,
        }
    }
}

impl Aggregate for WithdrawRequest {
    type Command = WithdrawCommand;
    type Event = WithdrawEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            WithdrawEvent::Requested(e) => {
                self.id = e.request_id;
                self.tenant_id = Some(e.tenant_id);
                self.account_id = Some(e.account_id);
                self.amount = e.amount;
                self.method = e.method;
                self.status = WithdrawStatus::Pending;
                self.requested_at = Some(e.occurred_at);
                self.updated_at = Some(e.occurred_at);
                self.created = true;
            }
            WithdrawEvent::Approved(e) => {
                self.status = WithdrawStatus::Approved;
                if e.admin_note.is_some() {
                    self.admin_note = e.admin_note.clone();
                }
                self.updated_at = Some(e.occurred_at);
            }
            WithdrawEvent::Rejected(e) => {
                self.status = WithdrawStatus::Rejected;
                if e.admin_note.is_some() {
                    self.admin_note = e.admin_note.clone();
                }
                self.updated_at = Some(e.occurred_at);
            }
            WithdrawEvent::Paid(e) => {
                self.status = WithdrawStatus::Paid;
                self.payout_ref = Some(e.payout_ref.clone());
                self.updated_at = Some(e.occurred_at);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            WithdrawCommand::Create(cmd) => self.handle_create(cmd),
            WithdrawCommand::Approve(cmd) => self.handle_approve(cmd),
            WithdrawCommand::Reject(cmd) => self.handle_reject(cmd),
            WithdrawCommand::MarkPaid(cmd) => self.handle_mark_paid(cmd),
        }
    }
}

impl WithdrawRequest {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_created(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        self.ensure_tenant(tenant_id)?;
        if !self.created {
            return Err(DomainError::NotFound);
        }
        Ok(())
    }

    fn handle_create(
        &self,
        cmd: &CreateWithdrawRequest,
    ) -> Result<Vec<WithdrawEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        if self.created {
            return Err(DomainError::duplicate("withdraw request already exists"));
        }
        if cmd.amount <= 0 {
            return Err(DomainError::invalid_amount("withdraw amount must be positive"));
        }

        Ok(vec![WithdrawEvent::Requested(WithdrawRequested {
            tenant_id: cmd.tenant_id,
            request_id: cmd.request_id,
            account_id: cmd.account_id,
            amount: cmd.amount,
            method: cmd.method,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &ApproveWithdraw) -> Result<Vec<WithdrawEvent>, DomainError> {
        self.ensure_created(cmd.tenant_id)?;
        if self.status != WithdrawStatus::Pending {
            return Err(DomainError::invalid_state(format!(
                "cannot approve a {:?} request",
                self.status
            )));
        }

        Ok(vec![WithdrawEvent::Approved(WithdrawApproved {
            tenant_id: cmd.tenant_id,
            request_id: self.id,
            admin_note: cmd.admin_note.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reject(&self, cmd: &RejectWithdraw) -> Result<Vec<WithdrawEvent>, DomainError> {
        self.ensure_created(cmd.tenant_id)?;
        if self.status.is_terminal() {
            return Err(DomainError::invalid_state(format!(
                "cannot reject a {:?} request",
                self.status
            )));
        }

        Ok(vec![WithdrawEvent::Rejected(WithdrawRejected {
            tenant_id: cmd.tenant_id,
            request_id: self.id,
            admin_note: cmd.admin_note.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_paid(&self, cmd: &MarkWithdrawPaid) -> Result<Vec<WithdrawEvent>, DomainError> {
        self.ensure_created(cmd.tenant_id)?;
        if self.status != WithdrawStatus::Approved {
            return Err(DomainError::invalid_state(format!(
                "only approved requests can be paid (status: {:?})",
                self.status
            )));
        }
        let payout_ref = cmd.payout_ref.trim();
        if payout_ref.is_empty() {
            return Err(DomainError::validation("payout reference is required"));
        }
        let account_id = self
            .account_id
            .ok_or_else(|| DomainError::invariant("withdraw request has no account"))?;

        Ok(vec![WithdrawEvent::Paid(WithdrawPaid {
            tenant_id: cmd.tenant_id,
            request_id: self.id,
            account_id,
            amount: self.amount,
            payout_ref: payout_ref.to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
