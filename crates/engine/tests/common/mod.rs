#![allow(dead_code)]

use ledgerly_core::TenantId;
use ledgerly_engine::bootstrap::{self, InMemoryWalletService};
use ledgerly_engine::{InMemoryPlanCatalog, NewAccount};
use ledgerly_infra::config::Settings;
use ledgerly_wallet::{Account, AccountId};

pub type Service = InMemoryWalletService<InMemoryPlanCatalog>;

pub fn service() -> Service {
    service_with("")
}

/// Service configured from TOML settings text.
pub fn service_with(toml: &str) -> Service {
    let settings = Settings::from_toml_str(toml).unwrap();
    bootstrap::in_memory(&settings, InMemoryPlanCatalog::new()).unwrap()
}

/// Only the signup bonus pays, so referrer balances are easy to predict.
pub fn signup_only() -> Service {
    service_with("[commission]\nper_transaction_amount = 0")
}

pub fn new_account(name: &str) -> NewAccount {
    NewAccount::user(name, format!("{name}@example.com"), format!("phone-{name}"))
}

pub fn register(svc: &Service, tenant_id: TenantId, name: &str) -> Account {
    svc.register_account(tenant_id, new_account(name)).unwrap()
}

pub fn register_referred(
    svc: &Service,
    tenant_id: TenantId,
    name: &str,
    referrer: &Account,
) -> Account {
    svc.register_account(tenant_id, new_account(name).referred_by(referrer.referral_code()))
        .unwrap()
}

pub fn balance(svc: &Service, tenant_id: TenantId, account_id: AccountId) -> i64 {
    svc.get_balance(tenant_id, account_id).unwrap()
}
