//! Referral commissions.
//!
//! Runs after a user-initiated entry commits. Each planned payout is its own
//! unit of work: the commission entry on the referrer's wallet, the
//! referrer's earnings counter and (for the signup bonus) the referred
//! account's latch all commit together. Payouts go through the dispatcher's
//! retry loop, so contention on the referrer's wallet delays a payout but
//! does not drop it. A payout that still fails is logged and never undoes the
//! entry that triggered it.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use ledgerly_core::TenantId;
use ledgerly_events::{EventBus, EventEnvelope};
use ledgerly_infra::command_dispatcher::CommandDispatcher;
use ledgerly_infra::event_store::EventStore;
use ledgerly_wallet::account::AGGREGATE_TYPE as ACCOUNT;
use ledgerly_wallet::{
    Account, AccountCommand, CommissionInfo, CommissionKind, CommissionPayout, CommissionPolicy,
    EarnCommission, EntryKind, LatchSignupBonus, LedgerEntry, PostEntry,
};

use crate::error::LedgerError;
use crate::ledger::{AccountCheck, load_account, stage_entry};

#[derive(Debug)]
pub struct CommissionEngine<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    policy: CommissionPolicy,
}

impl<S, B> CommissionEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: Arc<CommandDispatcher<S, B>>, policy: CommissionPolicy) -> Self {
        Self { dispatcher, policy }
    }

    pub fn policy(&self) -> &CommissionPolicy {
        &self.policy
    }

    /// Pay whatever `trigger` earns the referrer of its account.
    ///
    /// Returns the commission entries that were committed. Never fails: a
    /// payout that cannot be made is logged and skipped.
    pub fn process(&self, tenant_id: TenantId, trigger: &LedgerEntry) -> Vec<LedgerEntry> {
        if trigger.kind == EntryKind::Commission {
            return vec![];
        }

        let referred = match self
            .dispatcher
            .load(tenant_id, trigger.account_id.0, |_| Account::empty(trigger.account_id))
        {
            Ok(account) => account,
            Err(e) => {
                warn!(
                    %tenant_id,
                    account_id = %trigger.account_id,
                    error = %e,
                    "could not load account for commission"
                );
                return vec![];
            }
        };

        let payouts = self.policy.plan(trigger, &referred);
        if payouts.is_empty() {
            return vec![];
        }

        let note_subject = referred.email().to_string();
        payouts
            .into_iter()
            .filter_map(|payout| match self.pay(tenant_id, &payout, trigger.kind, &note_subject) {
                Ok(Some(entry)) => {
                    info!(
                        %tenant_id,
                        referrer = %payout.referrer,
                        source = %payout.source_account_id,
                        kind = payout.kind.as_str(),
                        amount = payout.amount,
                        "commission paid"
                    );
                    Some(entry)
                }
                Ok(None) => None,
                Err(e @ LedgerError::Conflict(_)) => {
                    error!(
                        %tenant_id,
                        referrer = %payout.referrer,
                        kind = payout.kind.as_str(),
                        amount = payout.amount,
                        error = %e,
                        "commission payout kept conflicting"
                    );
                    None
                }
                Err(e) => {
                    warn!(
                        %tenant_id,
                        referrer = %payout.referrer,
                        kind = payout.kind.as_str(),
                        error = %e,
                        "commission payout failed"
                    );
                    None
                }
            })
            .collect()
    }

    fn pay(
        &self,
        tenant_id: TenantId,
        payout: &CommissionPayout,
        trigger_kind: EntryKind,
        referred_email: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let (entry, _) = self.dispatcher.execute(tenant_id, |uow| {
            let now = uow.now();

            if payout.kind == CommissionKind::Signup {
                let mut referred = load_account(uow, payout.source_account_id)?;
                if referred.referral().first_bonus_paid {
                    debug!(source = %payout.source_account_id, "signup bonus already latched");
                    return Ok(None);
                }
                uow.decide(
                    &mut referred,
                    payout.source_account_id.0,
                    ACCOUNT,
                    AccountCommand::LatchSignupBonus(LatchSignupBonus {
                        tenant_id,
                        occurred_at: now,
                    }),
                )?;
            }

            let amount = payout.amount;
            let cmd = PostEntry::new(tenant_id, payout.referrer, EntryKind::Commission, amount, now)
                .with_note(Some(commission_note(payout.kind, trigger_kind, referred_email)))
                .with_related_entry(payout.trigger_entry_id)
                .with_commission(CommissionInfo {
                    kind: payout.kind,
                    source_account_id: payout.source_account_id,
                });
            let entry = stage_entry(uow, cmd, AccountCheck::Registered)?;

            let mut referrer = load_account(uow, payout.referrer)?;
            uow.decide(
                &mut referrer,
                payout.referrer.0,
                ACCOUNT,
                AccountCommand::EarnCommission(EarnCommission {
                    tenant_id,
                    amount: payout.amount,
                    kind: payout.kind,
                    source_account_id: payout.source_account_id,
                    entry_id: entry.entry_id,
                    occurred_at: now,
                }),
            )?;

            Ok::<_, LedgerError>(Some(entry))
        })?;
        Ok(entry)
    }
}

fn commission_note(kind: CommissionKind, trigger_kind: EntryKind, referred_email: &str) -> String {
    match kind {
        CommissionKind::Signup => {
            format!("Signup bonus from first deposit of referred user {referred_email}")
        }
        CommissionKind::Tx => {
            let action = match trigger_kind {
                EntryKind::Credit => "deposit",
                EntryKind::Debit => "withdraw",
                other => other.as_str(),
            };
            format!("Fixed commission on {action} by referred user {referred_email}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_name_the_referred_user() {
        assert_eq!(
            commission_note(CommissionKind::Signup, EntryKind::Credit, "b@x.io"),
            "Signup bonus from first deposit of referred user b@x.io"
        );
        assert_eq!(
            commission_note(CommissionKind::Tx, EntryKind::Debit, "b@x.io"),
            "Fixed commission on withdraw by referred user b@x.io"
        );
    }
}
