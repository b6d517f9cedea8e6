//! Withdrawal workflow.
//!
//! `Pending -> Approved -> Paid`, or `Pending | Approved -> Rejected`.
//! Requesting and approving never move money. The `Paid` transition and the
//! payout debit commit together, so a request is never marked paid without
//! the balance having been debited.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use ledgerly_core::TenantId;
use ledgerly_events::{EventBus, EventEnvelope};
use ledgerly_infra::UnitOfWork;
use ledgerly_infra::command_dispatcher::CommandDispatcher;
use ledgerly_infra::event_store::EventStore;
use ledgerly_wallet::withdrawal::AGGREGATE_TYPE as WITHDRAW;
use ledgerly_wallet::{
    AccountId, ApproveWithdraw, CreateWithdrawRequest, EntryKind, LedgerEntry, MarkWithdrawPaid,
    PayoutMethod, PostEntry, RejectWithdraw, WithdrawCommand, WithdrawRequest, WithdrawRequestId,
    WithdrawStatus,
};

use crate::error::LedgerError;
use crate::ledger::{AccountCheck, stage_entry};
use crate::streams::rehydrate_all;

#[derive(Debug)]
pub struct WithdrawalWorkflow<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
}

impl<S, B> WithdrawalWorkflow<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: Arc<CommandDispatcher<S, B>>) -> Self {
        Self { dispatcher }
    }

    /// Open a `Pending` request and write its zero-amount audit marker.
    ///
    /// The balance is not checked or held here; it is checked at payout.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, account_id = %account_id), err)]
    pub fn create_request(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        amount: i64,
        method: PayoutMethod,
    ) -> Result<WithdrawRequest, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount("withdraw amount must be positive".to_string()));
        }
        let request_id = WithdrawRequestId::generate();

        let (request, _) = self.dispatcher.execute(tenant_id, |uow| {
            let now = uow.now();
            let mut request = load_request(uow, request_id)?;
            uow.decide(
                &mut request,
                request_id.0,
                WITHDRAW,
                WithdrawCommand::Create(CreateWithdrawRequest {
                    tenant_id,
                    request_id,
                    account_id,
                    amount,
                    method,
                    occurred_at: now,
                }),
            )?;

            let marker = PostEntry::new(tenant_id, account_id, EntryKind::WithdrawRequest, 0, now)
                .with_note(Some(format!("Requested {amount}")));
            stage_entry(uow, marker, AccountCheck::Active)?;
            Ok::<_, LedgerError>(request)
        })?;

        info!(request_id = %request_id, amount, "withdraw request created");
        Ok(request)
    }

    #[instrument(
        skip(self, admin_note),
        fields(tenant_id = %tenant_id, request_id = %request_id),
        err
    )]
    pub fn approve(
        &self,
        tenant_id: TenantId,
        request_id: WithdrawRequestId,
        admin_note: Option<String>,
    ) -> Result<WithdrawRequest, LedgerError> {
        let request = self.transition(tenant_id, request_id, |now| {
            WithdrawCommand::Approve(ApproveWithdraw {
                tenant_id,
                admin_note: admin_note.clone(),
                occurred_at: now,
            })
        })?;
        info!("withdraw request approved");
        Ok(request)
    }

    #[instrument(
        skip(self, admin_note),
        fields(tenant_id = %tenant_id, request_id = %request_id),
        err
    )]
    pub fn reject(
        &self,
        tenant_id: TenantId,
        request_id: WithdrawRequestId,
        admin_note: Option<String>,
    ) -> Result<WithdrawRequest, LedgerError> {
        let request = self.transition(tenant_id, request_id, |now| {
            WithdrawCommand::Reject(RejectWithdraw {
                tenant_id,
                admin_note: admin_note.clone(),
                occurred_at: now,
            })
        })?;
        info!("withdraw request rejected");
        Ok(request)
    }

    /// Mark an approved request paid and debit the payout in one commit.
    ///
    /// If the balance no longer covers the amount, nothing is written and the
    /// request stays `Approved`.
    #[instrument(
        skip(self, payout_ref),
        fields(tenant_id = %tenant_id, request_id = %request_id),
        err
    )]
    pub fn mark_paid(
        &self,
        tenant_id: TenantId,
        request_id: WithdrawRequestId,
        payout_ref: &str,
    ) -> Result<(WithdrawRequest, LedgerEntry), LedgerError> {
        let payout_ref = payout_ref.trim();
        if payout_ref.is_empty() {
            return Err(LedgerError::Validation("payout reference is required".to_string()));
        }

        let (paid, _) = self.dispatcher.execute(tenant_id, |uow| {
            let now = uow.now();
            let mut request = load_existing(uow, request_id)?;
            let account_id = request
                .account_id()
                .ok_or_else(|| {
                    LedgerError::Storage(format!("withdraw request {request_id} has no owner"))
                })?;
            let amount = request.amount();

            uow.decide(
                &mut request,
                request_id.0,
                WITHDRAW,
                WithdrawCommand::MarkPaid(MarkWithdrawPaid {
                    tenant_id,
                    payout_ref: payout_ref.to_string(),
                    occurred_at: now,
                }),
            )?;

            let kind = EntryKind::WithdrawPayout;
            let debit = PostEntry::new(tenant_id, account_id, kind, amount, now)
                .with_note(Some(format!("Withdraw paid ({payout_ref})")));
            let entry = stage_entry(uow, debit, AccountCheck::Registered)?;
            Ok::<_, LedgerError>((request, entry))
        })?;

        info!(
            entry_id = %paid.1.entry_id,
            amount = paid.1.amount,
            balance_after = paid.1.balance_after,
            "withdraw request paid"
        );
        Ok(paid)
    }

    pub fn get(
        &self,
        tenant_id: TenantId,
        request_id: WithdrawRequestId,
    ) -> Result<WithdrawRequest, LedgerError> {
        let request = self
            .dispatcher
            .load(tenant_id, request_id.0, |_| WithdrawRequest::empty(request_id))?;
        if !request.is_created() {
            return Err(LedgerError::NotFound(format!("withdraw request {request_id}")));
        }
        Ok(request)
    }

    /// Requests of the tenant, oldest first, optionally narrowed by owner and status.
    pub fn list(
        &self,
        tenant_id: TenantId,
        account_id: Option<AccountId>,
        status: Option<WithdrawStatus>,
    ) -> Result<Vec<WithdrawRequest>, LedgerError> {
        let all = rehydrate_all(self.dispatcher.store(), tenant_id, WITHDRAW, |id| {
            WithdrawRequest::empty(WithdrawRequestId::new(id))
        })?;
        Ok(all
            .into_iter()
            .filter(|r| account_id.is_none_or(|a| r.account_id() == Some(a)))
            .filter(|r| status.is_none_or(|s| r.status() == s))
            .collect())
    }

    fn transition(
        &self,
        tenant_id: TenantId,
        request_id: WithdrawRequestId,
        command: impl Fn(chrono::DateTime<chrono::Utc>) -> WithdrawCommand,
    ) -> Result<WithdrawRequest, LedgerError> {
        let (request, _) = self.dispatcher.execute(tenant_id, |uow| {
            let mut request = load_existing(uow, request_id)?;
            uow.decide(&mut request, request_id.0, WITHDRAW, command(uow.now()))?;
            Ok::<_, LedgerError>(request)
        })?;
        Ok(request)
    }
}

fn load_request<S: EventStore>(
    uow: &UnitOfWork<'_, S>,
    request_id: WithdrawRequestId,
) -> Result<WithdrawRequest, LedgerError> {
    Ok(uow.load(request_id.0, |_| WithdrawRequest::empty(request_id))?)
}

fn load_existing<S: EventStore>(
    uow: &UnitOfWork<'_, S>,
    request_id: WithdrawRequestId,
) -> Result<WithdrawRequest, LedgerError> {
    let request = load_request(uow, request_id)?;
    if !request.is_created() {
        return Err(LedgerError::NotFound(format!("withdraw request {request_id}")));
    }
    Ok(request)
}
