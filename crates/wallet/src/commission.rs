//! Referral commission policy.
//!
//! Planning is pure: given a committed ledger entry and the account that
//! made it, decide which commissions the referrer earns. Executing the plan
//! (and latching the signup bonus) is the application layer's job.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use ledgerly_core::{DomainError, ValueObject};

use crate::account::Account;
use crate::ids::{AccountId, EntryId};
use crate::ledger::{CommissionKind, EntryKind, LedgerEntry};

/// One-time bonus paid to the referrer on the referred account's first deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SignupBonus {
    /// Percentage of the first deposit, floored to minor units.
    Percent(u32),
    /// Fixed amount in minor units.
    Flat(i64),
}

impl SignupBonus {
    pub fn amount_for(self, deposit: i64) -> i64 {
        match self {
            SignupBonus::Percent(pct) => {
                let raw = i128::from(deposit.max(0)) * i128::from(pct) / 100;
                i64::try_from(raw).unwrap_or(i64::MAX)
            }
            SignupBonus::Flat(amount) => amount.max(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionPolicy {
    pub signup_bonus: SignupBonus,
    /// Fixed commission per eligible transaction, in minor units.
    pub per_transaction: i64,
    /// Entry kinds that earn the per-transaction commission.
    pub trigger_kinds: BTreeSet<EntryKind>,
}

impl ValueObject for CommissionPolicy {}

impl Default for CommissionPolicy {
    fn default() -> Self {
        Self {
            signup_bonus: SignupBonus::Percent(10),
            per_transaction: 200,
            trigger_kinds: [EntryKind::Credit, EntryKind::Debit].into_iter().collect(),
        }
    }
}

/// A commission the referrer should be credited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommissionPayout {
    pub referrer: AccountId,
    pub source_account_id: AccountId,
    pub kind: CommissionKind,
    pub amount: i64,
    pub trigger_entry_id: EntryId,
}

impl CommissionPolicy {
    /// Policy that never pays anything.
    pub fn disabled() -> Self {
        Self {
            signup_bonus: SignupBonus::Flat(0),
            per_transaction: 0,
            trigger_kinds: BTreeSet::new(),
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if let SignupBonus::Flat(amount) = self.signup_bonus {
            if amount < 0 {
                return Err(DomainError::invalid_amount("flat signup bonus cannot be negative"));
            }
        }
        if self.per_transaction < 0 {
            return Err(DomainError::invalid_amount(
                "per-transaction commission cannot be negative",
            ));
        }
        if self.trigger_kinds.contains(&EntryKind::Commission) {
            return Err(DomainError::validation("commission entries cannot trigger commissions"));
        }
        if self.trigger_kinds.contains(&EntryKind::WithdrawRequest) {
            return Err(DomainError::validation(
                "withdraw request markers cannot trigger commissions",
            ));
        }
        Ok(())
    }

    /// Decide the payouts a committed entry earns for `referred`'s referrer.
    ///
    /// The signup bonus is only planned while the referred account's latch is
    /// unset; the caller must still set the latch atomically with the payout.
    pub fn plan(&self, trigger: &LedgerEntry, referred: &Account) -> Vec<CommissionPayout> {
        let Some(referrer) = referred.referred_by() else {
            return vec![];
        };
        if trigger.account_id != referred.id_typed() || trigger.kind == EntryKind::Commission {
            return vec![];
        }

        let mut payouts = Vec::with_capacity(2);

        if trigger.kind == EntryKind::Credit && !referred.referral().first_bonus_paid {
            let bonus = self.signup_bonus.amount_for(trigger.amount);
            if bonus > 0 {
                payouts.push(CommissionPayout {
                    referrer,
                    source_account_id: trigger.account_id,
                    kind: CommissionKind::Signup,
                    amount: bonus,
                    trigger_entry_id: trigger.entry_id,
                });
            }
        }

        if self.per_transaction > 0 && self.trigger_kinds.contains(&trigger.kind) {
            payouts.push(CommissionPayout {
                referrer,
                source_account_id: trigger.account_id,
                kind: CommissionKind::Tx,
                amount: self.per_transaction,
                trigger_entry_id: trigger.entry_id,
            });
        }

        payouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountCommand, LatchSignupBonus, RegisterAccount, Role};
    use chrono::Utc;
    use ledgerly_core::{Aggregate, TenantId};

    fn referred_account(tenant_id: TenantId, referrer: Option<AccountId>) -> Account {
        let id = AccountId::generate();
        let mut account = Account::empty(id);
        account
            .handle(&AccountCommand::Register(RegisterAccount {
                tenant_id,
                account_id: id,
                display_name: "Ravi".to_string(),
                email: "ravi@example.com".to_string(),
                phone: "9000000002".to_string(),
                password_hash: "hash".to_string(),
                role: Role::User,
                referral_code: "RAVI0001".to_string(),
                referred_by: referrer,
                occurred_at: Utc::now(),
            }))
            .unwrap()
            .iter()
            .for_each(|e| account.apply(e));
        account
    }

    fn entry(account_id: AccountId, kind: EntryKind, amount: i64) -> LedgerEntry {
        LedgerEntry {
            entry_id: EntryId::new(),
            account_id,
            kind,
            amount,
            balance_after: amount,
            note: None,
            payment_order_id: None,
            related_entry_id: None,
            commission: None,
            sequence: 1,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn percent_bonus_floors_to_minor_units() {
        assert_eq!(SignupBonus::Percent(10).amount_for(100_000), 10_000);
        assert_eq!(SignupBonus::Percent(10).amount_for(99), 9);
        assert_eq!(SignupBonus::Percent(3).amount_for(10), 0);
        assert_eq!(SignupBonus::Flat(5_000).amount_for(1), 5_000);
    }

    #[test]
    fn first_deposit_of_referred_account_pays_signup_and_tx() {
        let tenant_id = TenantId::new();
        let referrer = AccountId::generate();
        let referred = referred_account(tenant_id, Some(referrer));
        let deposit = entry(referred.id_typed(), EntryKind::Credit, 100_000);

        let payouts = CommissionPolicy::default().plan(&deposit, &referred);

        assert_eq!(payouts.len(), 2);
        assert_eq!(payouts[0].kind, CommissionKind::Signup);
        assert_eq!(payouts[0].amount, 10_000);
        assert_eq!(payouts[0].referrer, referrer);
        assert_eq!(payouts[1].kind, CommissionKind::Tx);
        assert_eq!(payouts[1].amount, 200);
    }

    #[test]
    fn latched_account_only_earns_tx_commission() {
        let tenant_id = TenantId::new();
        let mut referred = referred_account(tenant_id, Some(AccountId::generate()));
        referred
            .handle(&AccountCommand::LatchSignupBonus(LatchSignupBonus {
                tenant_id,
                occurred_at: Utc::now(),
            }))
            .unwrap()
            .iter()
            .for_each(|e| referred.apply(e));

        let payouts = CommissionPolicy::default()
            .plan(&entry(referred.id_typed(), EntryKind::Credit, 50_000), &referred);

        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].kind, CommissionKind::Tx);
    }

    #[test]
    fn debit_never_pays_signup_bonus() {
        let referred = referred_account(TenantId::new(), Some(AccountId::generate()));
        let payouts = CommissionPolicy::default()
            .plan(&entry(referred.id_typed(), EntryKind::Debit, 20_000), &referred);

        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].kind, CommissionKind::Tx);
    }

    #[test]
    fn accounts_without_referrer_earn_nothing() {
        let account = referred_account(TenantId::new(), None);
        let payouts = CommissionPolicy::default()
            .plan(&entry(account.id_typed(), EntryKind::Credit, 50_000), &account);
        assert!(payouts.is_empty());
    }

    #[test]
    fn non_trigger_kinds_earn_no_tx_commission() {
        let referred = referred_account(TenantId::new(), Some(AccountId::generate()));
        let policy = CommissionPolicy {
            trigger_kinds: [EntryKind::Credit].into_iter().collect(),
            ..CommissionPolicy::default()
        };

        let payouts = policy.plan(&entry(referred.id_typed(), EntryKind::Debit, 1_000), &referred);
        assert!(payouts.is_empty());
    }

    #[test]
    fn commission_triggers_are_rejected() {
        let policy = CommissionPolicy {
            trigger_kinds: [EntryKind::Commission].into_iter().collect(),
            ..CommissionPolicy::default()
        };
        assert!(policy.validate().is_err());
        assert!(CommissionPolicy::default().validate().is_ok());
        assert!(CommissionPolicy::disabled().validate().is_ok());
    }
}
