use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledgerly_core::{Aggregate, AggregateRoot, DomainError, TenantId};
use ledgerly_events::Event;

use crate::ids::{AccountId, EntryId, PlanId, SubscriptionId};
use crate::ledger::CommissionKind;

pub const AGGREGATE_TYPE: &str = "wallet.account";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Banned,
}

/// Denormalised referral counters. The ledger stays authoritative for money;
/// `earnings` mirrors the sum of commission entries credited to this account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReferralStats {
    pub referred_count: u64,
    pub earnings: i64,
    /// Set once the referrer was paid the signup bonus for this account.
    pub first_bonus_paid: bool,
}

/// Aggregate root: Account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    id: AccountId,
    tenant_id: Option<TenantId>,
    display_name: String,
    email: String,
    phone: String,
    password_hash: String,
    role: Role,
    status: AccountStatus,
    referral_code: String,
    referred_by: Option<AccountId>,
    referral: ReferralStats,
    current_plan: Option<PlanId>,
    current_subscription: Option<SubscriptionId>,
    registered_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Account {
    /// Create an empty, not-yet-registered aggregate instance for rehydration.
    pub fn empty(id: AccountId) -> Self {
        Self {
            id,
            tenant_id: None,
            display_name: String::new(),
            email: String::new(),
            phone: String::new(),
            password_hash: String::new(),
            role: Role::User,
            status: AccountStatus::Active,
            referral_code: String::new(),
            referred_by: None,
            referral: ReferralStats::default(),
            current_plan: None,
            current_subscription: None,
            registered_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> AccountId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn is_registered(&self) -> bool {
        self.created
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn phone(&self) -> &str {
        &self.phone
    }

    /// Opaque credential hash; never interpreted here.
    pub fn password_hash(&self) -> &str {
        &self.password_hash
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> AccountStatus {
        self.status
    }

    pub fn referral_code(&self) -> &str {
        &self.referral_code
    }

    pub fn referred_by(&self) -> Option<AccountId> {
        self.referred_by
    }

    pub fn referral(&self) -> ReferralStats {
        self.referral
    }

    pub fn current_plan(&self) -> Option<PlanId> {
        self.current_plan
    }

    pub fn current_subscription(&self) -> Option<SubscriptionId> {
        self.current_subscription
    }

    pub fn registered_at(&self) -> Option<DateTime<Utc>> {
        self.registered_at
    }

    /// User-initiated operations require an active account.
    pub fn ensure_active(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::NotFound);
        }
        if self.status == AccountStatus::Banned {
            return Err(DomainError::invalid_state("account is banned"));
        }
        Ok(())
    }
}

impl AggregateRoot for Account {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterAccount.
///
/// `referral_code` is the code assigned to the new account; `referred_by` is
/// the already-resolved owner of the code the user signed up with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAccount {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub display_name: String,
    pub email: String,
    pub phone: String,
    pub password_hash: String,
    pub role: Role,
    pub referral_code: String,
    pub referred_by: Option<AccountId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStatus {
    pub tenant_id: TenantId,
    pub status: AccountStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordReferral (issued against the referrer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReferral {
    pub tenant_id: TenantId,
    pub referred_account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: EarnCommission (issued against the referrer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarnCommission {
    pub tenant_id: TenantId,
    pub amount: i64,
    pub kind: CommissionKind,
    pub source_account_id: AccountId,
    pub entry_id: EntryId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: LatchSignupBonus (issued against the referred account).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatchSignupBonus {
    pub tenant_id: TenantId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivatePlan {
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    pub subscription_id: SubscriptionId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ClearSubscription. No-op unless `subscription_id` is the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearSubscription {
    pub tenant_id: TenantId,
    pub subscription_id: SubscriptionId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountCommand {
    Register(RegisterAccount),
    SetStatus(SetStatus),
    RecordReferral(RecordReferral),
    EarnCommission(EarnCommission),
    LatchSignupBonus(LatchSignupBonus),
    ActivatePlan(ActivatePlan),
    ClearSubscription(ClearSubscription),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRegistered {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub display_name: String,
    pub email: String,
    pub phone: String,
    pub password_hash: String,
    pub role: Role,
    pub referral_code: String,
    pub referred_by: Option<AccountId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatusChanged {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub status: AccountStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralRecorded {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub referred_account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionEarned {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub amount: i64,
    pub kind: CommissionKind,
    pub source_account_id: AccountId,
    pub entry_id: EntryId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignupBonusLatched {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanActivated {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub plan_id: PlanId,
    pub subscription_id: SubscriptionId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCleared {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub subscription_id: SubscriptionId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountEvent {
    AccountRegistered(AccountRegistered),
    AccountStatusChanged(AccountStatusChanged),
    ReferralRecorded(ReferralRecorded),
    CommissionEarned(CommissionEarned),
    SignupBonusLatched(SignupBonusLatched),
    PlanActivated(PlanActivated),
    SubscriptionCleared(SubscriptionCleared),
}

impl Event for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::AccountRegistered(_) => "wallet.account.registered",
            AccountEvent::AccountStatusChanged(_) => "wallet.account.status_changed",
            AccountEvent::ReferralRecorded(_) => "wallet.account.referral_recorded",
            AccountEvent::CommissionEarned(_) => "wallet.account.commission_earned",
            AccountEvent::SignupBonusLatched(_) => "wallet.account.signup_bonus_latched",
            AccountEvent::PlanActivated(_) => "wallet.account.plan_activated",
            AccountEvent::SubscriptionCleared(_) => "wallet.account.subscription_cleared",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AccountEvent::AccountRegistered(e) => e.occurred_at,
            AccountEvent::AccountStatusChanged(e) => e.occurred_at,
            AccountEvent::ReferralRecorded(e) => e.occurred_at,
            AccountEvent::CommissionEarned(e) => e.occurred_at,
            AccountEvent::SignupBonusLatched(e) => e.occurred_at,
            AccountEvent::PlanActivated(e) => e.occurred_at,
            AccountEvent::SubscriptionCleared(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Account {
    type Command = AccountCommand;
    type Event = AccountEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AccountEvent::AccountRegistered(e) => {
                self.id = e.account_id;
                self.tenant_id = Some(e.tenant_id);
                self.display_name = e.display_name.clone();
                self.email = e.email.clone();
                self.phone = e.phone.clone();
                self.password_hash = e.password_hash.clone();
                self.role = e.role;
                self.status = AccountStatus::Active;
                self.referral_code = e.referral_code.clone();
                self.referred_by = e.referred_by;
                self.registered_at = Some(e.occurred_at);
                self.created = true;
            }
            AccountEvent::AccountStatusChanged(e) => {
                self.status = e.status;
            }
            AccountEvent::ReferralRecorded(_) => {
                self.referral.referred_count += 1;
            }
            AccountEvent::CommissionEarned(e) => {
                self.referral.earnings = self.referral.earnings.saturating_add(e.amount);
            }
            AccountEvent::SignupBonusLatched(_) => {
                self.referral.first_bonus_paid = true;
            }
            AccountEvent::PlanActivated(e) => {
                self.current_plan = Some(e.plan_id);
                self.current_subscription = Some(e.subscription_id);
            }
            AccountEvent::SubscriptionCleared(_) => {
                self.current_subscription = None;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AccountCommand::Register(cmd) => self.handle_register(cmd),
            AccountCommand::SetStatus(cmd) => self.handle_set_status(cmd),
            AccountCommand::RecordReferral(cmd) => self.handle_record_referral(cmd),
            AccountCommand::EarnCommission(cmd) => self.handle_earn_commission(cmd),
            AccountCommand::LatchSignupBonus(cmd) => self.handle_latch(cmd),
            AccountCommand::ActivatePlan(cmd) => self.handle_activate_plan(cmd),
            AccountCommand::ClearSubscription(cmd) => self.handle_clear_subscription(cmd),
        }
    }
}

/// Trimmed, lowercased email. Uniqueness is checked on this form.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Trimmed, uppercased referral code.
pub fn normalize_referral_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

fn is_valid_referral_code(code: &str) -> bool {
    (4..=16).contains(&code.len())
        && code
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
}

impl Account {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_registered(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        self.ensure_tenant(tenant_id)?;
        if !self.created {
            return Err(DomainError::NotFound);
        }
        Ok(())
    }

    fn handle_register(&self, cmd: &RegisterAccount) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        if self.created {
            return Err(DomainError::duplicate("account already registered"));
        }

        let display_name = cmd.display_name.trim();
        if display_name.chars().count() < 2 {
            return Err(DomainError::validation("name must be at least 2 characters"));
        }

        let email = normalize_email(&cmd.email);
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
            _ => return Err(DomainError::validation("email is malformed")),
        }

        let phone = cmd.phone.trim();
        if phone.is_empty() {
            return Err(DomainError::validation("phone is required"));
        }

        if cmd.password_hash.is_empty() {
            return Err(DomainError::validation("credential hash is required"));
        }

        let referral_code = normalize_referral_code(&cmd.referral_code);
        if !is_valid_referral_code(&referral_code) {
            return Err(DomainError::validation("referral code must be 4-16 base36 characters"));
        }

        if cmd.referred_by == Some(cmd.account_id) {
            return Err(DomainError::validation("an account cannot refer itself"));
        }

        Ok(vec![AccountEvent::AccountRegistered(AccountRegistered {
            tenant_id: cmd.tenant_id,
            account_id: cmd.account_id,
            display_name: display_name.to_string(),
            email,
            phone: phone.to_string(),
            password_hash: cmd.password_hash.clone(),
            role: cmd.role,
            referral_code,
            referred_by: cmd.referred_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_status(&self, cmd: &SetStatus) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_registered(cmd.tenant_id)?;
        if self.status == cmd.status {
            return Ok(vec![]);
        }

        Ok(vec![AccountEvent::AccountStatusChanged(AccountStatusChanged {
            tenant_id: cmd.tenant_id,
            account_id: self.id,
            status: cmd.status,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_referral(
        &self,
        cmd: &RecordReferral,
    ) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_registered(cmd.tenant_id)?;
        if cmd.referred_account_id == self.id {
            return Err(DomainError::validation("an account cannot refer itself"));
        }

        Ok(vec![AccountEvent::ReferralRecorded(ReferralRecorded {
            tenant_id: cmd.tenant_id,
            account_id: self.id,
            referred_account_id: cmd.referred_account_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_earn_commission(
        &self,
        cmd: &EarnCommission,
    ) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_registered(cmd.tenant_id)?;
        if cmd.amount <= 0 {
            return Err(DomainError::invalid_amount("commission must be positive"));
        }

        Ok(vec![AccountEvent::CommissionEarned(CommissionEarned {
            tenant_id: cmd.tenant_id,
            account_id: self.id,
            amount: cmd.amount,
            kind: cmd.kind,
            source_account_id: cmd.source_account_id,
            entry_id: cmd.entry_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_latch(&self, cmd: &LatchSignupBonus) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_registered(cmd.tenant_id)?;
        if self.referral.first_bonus_paid {
            return Err(DomainError::duplicate("signup bonus already paid"));
        }

        Ok(vec![AccountEvent::SignupBonusLatched(SignupBonusLatched {
            tenant_id: cmd.tenant_id,
            account_id: self.id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_activate_plan(&self, cmd: &ActivatePlan) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_registered(cmd.tenant_id)?;

        Ok(vec![AccountEvent::PlanActivated(PlanActivated {
            tenant_id: cmd.tenant_id,
            account_id: self.id,
            plan_id: cmd.plan_id,
            subscription_id: cmd.subscription_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_clear_subscription(
        &self,
        cmd: &ClearSubscription,
    ) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_registered(cmd.tenant_id)?;
        if self.current_subscription != Some(cmd.subscription_id) {
            return Ok(vec![]);
        }

        Ok(vec![AccountEvent::SubscriptionCleared(SubscriptionCleared {
            tenant_id: cmd.tenant_id,
            account_id: self.id,
            subscription_id: cmd.subscription_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_cmd(tenant_id: TenantId, account_id: AccountId) -> RegisterAccount {
        RegisterAccount {
            tenant_id,
            account_id,
            display_name: "Asha".to_string(),
            email: "  Asha@Example.COM ".to_string(),
            phone: "9000000001".to_string(),
            password_hash: "$argon2id$opaque".to_string(),
            role: Role::User,
            referral_code: "ab12cd34".to_string(),
            referred_by: None,
            occurred_at: Utc::now(),
        }
    }

    fn registered(tenant_id: TenantId) -> Account {
        let id = AccountId::generate();
        let mut account = Account::empty(id);
        let events = account
            .handle(&AccountCommand::Register(register_cmd(tenant_id, id)))
            .unwrap();
        events.iter().for_each(|e| account.apply(e));
        account
    }

    #[test]
    fn register_normalises_email_and_code() {
        let tenant_id = TenantId::new();
        let account = registered(tenant_id);

        assert_eq!(account.email(), "asha@example.com");
        assert_eq!(account.referral_code(), "AB12CD34");
        assert_eq!(account.status(), AccountStatus::Active);
        assert_eq!(account.version(), 1);
    }

    #[test]
    fn register_twice_is_a_duplicate() {
        let tenant_id = TenantId::new();
        let account = registered(tenant_id);

        let err = account
            .handle(&AccountCommand::Register(register_cmd(tenant_id, account.id_typed())))
            .unwrap_err();
        assert!(matches!(err, DomainError::Duplicate(_)));
    }

    #[test]
    fn malformed_registration_is_rejected() {
        let tenant_id = TenantId::new();
        let id = AccountId::generate();
        let account = Account::empty(id);

        let mut bad_email = register_cmd(tenant_id, id);
        bad_email.email = "no-at-sign".to_string();
        assert!(matches!(
            account.handle(&AccountCommand::Register(bad_email)),
            Err(DomainError::Validation(_))
        ));

        let mut self_ref = register_cmd(tenant_id, id);
        self_ref.referred_by = Some(id);
        assert!(matches!(
            account.handle(&AccountCommand::Register(self_ref)),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn banned_accounts_are_not_active() {
        let tenant_id = TenantId::new();
        let mut account = registered(tenant_id);

        let events = account
            .handle(&AccountCommand::SetStatus(SetStatus {
                tenant_id,
                status: AccountStatus::Banned,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        events.iter().for_each(|e| account.apply(e));

        assert!(matches!(account.ensure_active(), Err(DomainError::InvalidState(_))));
    }

    #[test]
    fn setting_the_same_status_is_a_no_op() {
        let tenant_id = TenantId::new();
        let account = registered(tenant_id);

        let events = account
            .handle(&AccountCommand::SetStatus(SetStatus {
                tenant_id,
                status: AccountStatus::Active,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn signup_bonus_latch_is_one_shot() {
        let tenant_id = TenantId::new();
        let mut account = registered(tenant_id);
        let latch = AccountCommand::LatchSignupBonus(LatchSignupBonus {
            tenant_id,
            occurred_at: Utc::now(),
        });

        let events = account.handle(&latch).unwrap();
        events.iter().for_each(|e| account.apply(e));
        assert!(account.referral().first_bonus_paid);

        assert!(matches!(account.handle(&latch), Err(DomainError::Duplicate(_))));
    }

    #[test]
    fn commissions_accumulate_earnings() {
        let tenant_id = TenantId::new();
        let mut account = registered(tenant_id);

        for amount in [500, 200] {
            let events = account
                .handle(&AccountCommand::EarnCommission(EarnCommission {
                    tenant_id,
                    amount,
                    kind: CommissionKind::Tx,
                    source_account_id: AccountId::generate(),
                    entry_id: EntryId::new(),
                    occurred_at: Utc::now(),
                }))
                .unwrap();
            events.iter().for_each(|e| account.apply(e));
        }

        assert_eq!(account.referral().earnings, 700);
    }

    #[test]
    fn commands_against_unregistered_accounts_are_not_found() {
        let account = Account::empty(AccountId::generate());
        let err = account
            .handle(&AccountCommand::RecordReferral(RecordReferral {
                tenant_id: TenantId::new(),
                referred_account_id: AccountId::generate(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn clearing_a_stale_subscription_is_a_no_op() {
        let tenant_id = TenantId::new();
        let mut account = registered(tenant_id);
        let current = SubscriptionId::generate();

        let events = account
            .handle(&AccountCommand::ActivatePlan(ActivatePlan {
                tenant_id,
                plan_id: PlanId::generate(),
                subscription_id: current,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        events.iter().for_each(|e| account.apply(e));

        let stale = account
            .handle(&AccountCommand::ClearSubscription(ClearSubscription {
                tenant_id,
                subscription_id: SubscriptionId::generate(),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        assert!(stale.is_empty());

        let events = account
            .handle(&AccountCommand::ClearSubscription(ClearSubscription {
                tenant_id,
                subscription_id: current,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        events.iter().for_each(|e| account.apply(e));
        assert_eq!(account.current_subscription(), None);
        assert!(account.current_plan().is_some());
    }
}
