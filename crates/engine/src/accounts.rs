//! Account store.
//!
//! Registration commits the account, its email/phone/referral-code claims and
//! the referrer's referral counter in one unit of work. Uniqueness comes from
//! the claim streams, so two concurrent registrations with the same email
//! cannot both succeed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument};

use ledgerly_core::{AggregateId, TenantId};
use ledgerly_events::{EventBus, EventEnvelope};
use ledgerly_infra::UnitOfWork;
use ledgerly_infra::command_dispatcher::CommandDispatcher;
use ledgerly_infra::event_store::EventStore;
use ledgerly_wallet::account::{AGGREGATE_TYPE as ACCOUNT, normalize_referral_code};
use ledgerly_wallet::claim::AGGREGATE_TYPE as CLAIM;
use ledgerly_wallet::{
    Account, AccountCommand, AccountId, AccountStatus, Claim, ClaimCommand, ClaimKey,
    RecordReferral, RegisterAccount, ReserveClaim, Role, SetStatus,
};

use crate::error::LedgerError;
use crate::ledger::load_account;

pub const DEFAULT_MAX_CODE_ATTEMPTS: u32 = 10;
const CODE_LEN: usize = 8;
const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Registration input. The credential arrives already hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub display_name: String,
    pub email: String,
    pub phone: String,
    pub password_hash: String,
    pub role: Role,
    /// Code of the referring account, if any. Unknown codes are ignored.
    pub referral_code: Option<String>,
}

impl NewAccount {
    pub fn user(
        display_name: impl Into<String>,
        email: impl Into<String>,
        phone: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            email: email.into(),
            phone: phone.into(),
            password_hash: "opaque".to_string(),
            role: Role::User,
            referral_code: None,
        }
    }

    pub fn referred_by(mut self, code: impl Into<String>) -> Self {
        self.referral_code = Some(code.into());
        self
    }
}

#[derive(Debug)]
pub struct AccountStore<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    max_code_attempts: u32,
}

impl<S, B> AccountStore<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: Arc<CommandDispatcher<S, B>>) -> Self {
        Self {
            dispatcher,
            max_code_attempts: DEFAULT_MAX_CODE_ATTEMPTS,
        }
    }

    pub fn with_max_code_attempts(mut self, attempts: u32) -> Self {
        self.max_code_attempts = attempts.max(1);
        self
    }

    #[instrument(skip(self, new), fields(tenant_id = %tenant_id), err)]
    pub fn register(&self, tenant_id: TenantId, new: NewAccount) -> Result<Account, LedgerError> {
        let account_id = AccountId::generate();

        let (account, _) = self.dispatcher.execute(tenant_id, |uow| {
            let now = uow.now();
            let referrer = match new.referral_code.as_deref() {
                Some(code) => resolve_code(uow, code)?,
                None => None,
            };

            let owner = account_id.0;
            reserve(uow, ClaimKey::email(&new.email), owner, |key| {
                LedgerError::AlreadyRegistered(format!("email {}", claim_value(key)))
            })?;
            reserve(uow, ClaimKey::phone(&new.phone), owner, |key| {
                LedgerError::AlreadyRegistered(format!("phone {}", claim_value(key)))
            })?;
            let code = self.pick_referral_code(uow, now)?;
            reserve(uow, ClaimKey::referral_code(&code), owner, |key| {
                let code = claim_value(key);
                LedgerError::Conflict(format!("referral code {code} was taken concurrently"))
            })?;

            let mut account = Account::empty(account_id);
            uow.decide(
                &mut account,
                account_id.0,
                ACCOUNT,
                AccountCommand::Register(RegisterAccount {
                    tenant_id,
                    account_id,
                    display_name: new.display_name.clone(),
                    email: new.email.clone(),
                    phone: new.phone.clone(),
                    password_hash: new.password_hash.clone(),
                    role: new.role,
                    referral_code: code,
                    referred_by: referrer,
                    occurred_at: now,
                }),
            )?;

            if let Some(referrer_id) = referrer {
                let mut referrer = load_account(uow, referrer_id)?;
                uow.decide(
                    &mut referrer,
                    referrer_id.0,
                    ACCOUNT,
                    AccountCommand::RecordReferral(RecordReferral {
                        tenant_id,
                        referred_account_id: account_id,
                        occurred_at: now,
                    }),
                )?;
            }

            Ok::<_, LedgerError>(account)
        })?;

        info!(
            account_id = %account_id,
            referral_code = account.referral_code(),
            referred = account.referred_by().is_some(),
            "account registered"
        );
        Ok(account)
    }

    pub fn get(&self, tenant_id: TenantId, account_id: AccountId) -> Result<Account, LedgerError> {
        let account = self
            .dispatcher
            .load(tenant_id, account_id.0, |_| Account::empty(account_id))?;
        if !account.is_registered() {
            return Err(LedgerError::AccountNotFound(account_id));
        }
        Ok(account)
    }

    /// Owner of a referral code (trimmed, case-insensitive).
    pub fn resolve_referral_code(
        &self,
        tenant_id: TenantId,
        code: &str,
    ) -> Result<Option<AccountId>, LedgerError> {
        self.claim_owner(tenant_id, ClaimKey::referral_code(code))
    }

    pub fn find_by_email(
        &self,
        tenant_id: TenantId,
        email: &str,
    ) -> Result<Option<Account>, LedgerError> {
        match self.claim_owner(tenant_id, ClaimKey::email(email))? {
            Some(account_id) => self.get(tenant_id, account_id).map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, account_id = %account_id), err)]
    pub fn set_status(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        status: AccountStatus,
    ) -> Result<Account, LedgerError> {
        let (account, _) = self.dispatcher.execute(tenant_id, |uow| {
            let mut account = load_account(uow, account_id)?;
            uow.decide(
                &mut account,
                account_id.0,
                ACCOUNT,
                AccountCommand::SetStatus(SetStatus {
                    tenant_id,
                    status,
                    occurred_at: uow.now(),
                }),
            )?;
            Ok::<_, LedgerError>(account)
        })?;
        info!(?status, "account status set");
        Ok(account)
    }

    fn claim_owner(
        &self,
        tenant_id: TenantId,
        key: ClaimKey,
    ) -> Result<Option<AccountId>, LedgerError> {
        let claim = self
            .dispatcher
            .load(tenant_id, key.stream_id(), |_| Claim::for_key(&key))?;
        Ok(claim.owner().map(AccountId::new))
    }

    /// A random code no one holds yet, falling back to a timestamp code once
    /// the attempt budget is spent.
    fn pick_referral_code(
        &self,
        uow: &UnitOfWork<'_, S>,
        now: DateTime<Utc>,
    ) -> Result<String, LedgerError> {
        let mut rng = rand::thread_rng();
        for _ in 0..self.max_code_attempts {
            let code: String = (0..CODE_LEN)
                .map(|_| char::from(BASE36[rng.gen_range(0..BASE36.len())]))
                .collect();
            if !code_taken(uow, &code)? {
                return Ok(code);
            }
        }
        debug!(
            attempts = self.max_code_attempts,
            "random referral codes exhausted, using timestamp code"
        );
        fallback_code(uow, now)
    }
}

fn code_taken<S: EventStore>(uow: &UnitOfWork<'_, S>, code: &str) -> Result<bool, LedgerError> {
    let key = ClaimKey::referral_code(code);
    Ok(uow.load(key.stream_id(), |_| Claim::for_key(&key))?.is_taken())
}

/// The timestamp code, or the first free `<timestamp><n>` after it.
fn fallback_code<S: EventStore>(
    uow: &UnitOfWork<'_, S>,
    now: DateTime<Utc>,
) -> Result<String, LedgerError> {
    let base = timestamp_code(now);
    if !code_taken(uow, &base)? {
        return Ok(base);
    }
    let mut n: u64 = 1;
    loop {
        let code = format!("{base}{}", base36(n));
        if !code_taken(uow, &code)? {
            return Ok(code);
        }
        n += 1;
    }
}

/// Referrer behind `code`, or `None` when the code is unknown.
fn resolve_code<S: EventStore>(
    uow: &UnitOfWork<'_, S>,
    code: &str,
) -> Result<Option<AccountId>, LedgerError> {
    let normalized = normalize_referral_code(code);
    if normalized.is_empty() {
        return Ok(None);
    }
    let key = ClaimKey::referral_code(&normalized);
    let claim = uow.load(key.stream_id(), |_| Claim::for_key(&key))?;
    match claim.owner() {
        Some(owner) => Ok(Some(AccountId::new(owner))),
        None => {
            debug!(code = %normalized, "ignoring unknown referral code");
            Ok(None)
        }
    }
}

fn reserve<S: EventStore>(
    uow: &mut UnitOfWork<'_, S>,
    key: ClaimKey,
    owner: AggregateId,
    taken: impl FnOnce(&ClaimKey) -> LedgerError,
) -> Result<(), LedgerError> {
    let claim_id = key.stream_id();
    let mut claim = uow.load(claim_id, |_| Claim::for_key(&key))?;
    if claim.is_taken() {
        return Err(taken(&key));
    }
    let occurred_at = uow.now();
    let tenant_id = uow.tenant_id();
    uow.decide(
        &mut claim,
        claim_id,
        CLAIM,
        ClaimCommand::Reserve(ReserveClaim {
            tenant_id,
            key,
            owner,
            occurred_at,
        }),
    )?;
    Ok(())
}

fn claim_value(key: &ClaimKey) -> &str {
    match key {
        ClaimKey::Email(v)
        | ClaimKey::Phone(v)
        | ClaimKey::ReferralCode(v)
        | ClaimKey::PaymentOrder(v) => v,
    }
}

fn timestamp_code(now: DateTime<Utc>) -> String {
    let digits = base36(u64::try_from(now.timestamp_millis()).unwrap_or(0));
    format!("{digits:0>CODE_LEN$}")
}

fn base36(mut n: u64) -> String {
    let mut digits = Vec::new();
    loop {
        digits.push(BASE36[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    digits.iter().rev().map(|&b| char::from(b)).collect()
}
