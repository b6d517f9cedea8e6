//! Plan purchases and subscriptions.
//!
//! The catalog is read-only reference data behind [`PlanCatalog`]. Buying a
//! paid plan debits the price, starts the subscription and points the account
//! at it in a single commit.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use ledgerly_core::TenantId;
use ledgerly_events::{EventBus, EventEnvelope};
use ledgerly_infra::command_dispatcher::CommandDispatcher;
use ledgerly_infra::event_store::EventStore;
use ledgerly_infra::read_model::{InMemoryTenantStore, TenantStore};
use ledgerly_wallet::account::AGGREGATE_TYPE as ACCOUNT;
use ledgerly_wallet::subscription::AGGREGATE_TYPE as SUBSCRIPTION;
use ledgerly_wallet::{
    AccountCommand, AccountId, ActivatePlan, CancelSubscription, ClearSubscription, EntryKind,
    LedgerEntry, Plan, PlanId, PostEntry, StartSubscription, Subscription, SubscriptionCommand,
    SubscriptionId,
};

use crate::error::LedgerError;
use crate::ledger::{AccountCheck, load_account, stage_entry};
use crate::streams::rehydrate_all;

/// Read access to purchasable plans.
pub trait PlanCatalog: Send + Sync {
    fn get(&self, tenant_id: TenantId, plan_id: PlanId) -> Option<Plan>;

    /// Plans sorted by price, cheapest first.
    fn list(&self, tenant_id: TenantId, only_active: bool) -> Vec<Plan>;
}

impl<C> PlanCatalog for Arc<C>
where
    C: PlanCatalog + ?Sized,
{
    fn get(&self, tenant_id: TenantId, plan_id: PlanId) -> Option<Plan> {
        (**self).get(tenant_id, plan_id)
    }

    fn list(&self, tenant_id: TenantId, only_active: bool) -> Vec<Plan> {
        (**self).list(tenant_id, only_active)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPlanCatalog {
    plans: InMemoryTenantStore<PlanId, Plan>,
}

impl InMemoryPlanCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, tenant_id: TenantId, plan: Plan) {
        self.plans.upsert(tenant_id, plan.plan_id, plan);
    }
}

impl PlanCatalog for InMemoryPlanCatalog {
    fn get(&self, tenant_id: TenantId, plan_id: PlanId) -> Option<Plan> {
        self.plans.get(tenant_id, &plan_id)
    }

    fn list(&self, tenant_id: TenantId, only_active: bool) -> Vec<Plan> {
        let mut plans: Vec<_> = self
            .plans
            .list(tenant_id)
            .into_iter()
            .filter(|p| p.active || !only_active)
            .collect();
        plans.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.name.cmp(&b.name)));
        plans
    }
}

/// Result of a purchase. Free plans carry no entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPurchase {
    pub subscription: Subscription,
    pub entry: Option<LedgerEntry>,
}

#[derive(Debug)]
pub struct Subscriptions<S, B, C> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    catalog: C,
}

impl<S, B, C> Subscriptions<S, B, C>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    C: PlanCatalog,
{
    pub fn new(dispatcher: Arc<CommandDispatcher<S, B>>, catalog: C) -> Self {
        Self { dispatcher, catalog }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, account_id = %account_id), err)]
    pub fn purchase_plan(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        plan_id: PlanId,
    ) -> Result<PlanPurchase, LedgerError> {
        let plan = self
            .catalog
            .get(tenant_id, plan_id)
            .ok_or_else(|| LedgerError::NotFound(format!("plan {plan_id}")))?;
        if !plan.active {
            return Err(LedgerError::InvalidState(format!("plan {} is not active", plan.name)));
        }
        let subscription_id = SubscriptionId::generate();

        let (purchase, _) = self.dispatcher.execute(tenant_id, |uow| {
            let now = uow.now();
            let mut account = load_account(uow, account_id)?;
            account.ensure_active()?;

            let entry = if plan.price > 0 {
                let debit = PostEntry::new(tenant_id, account_id, EntryKind::Debit, plan.price, now)
                    .with_note(Some(format!("Plan purchase: {}", plan.name)));
                Some(stage_entry(uow, debit, AccountCheck::Active)?)
            } else {
                None
            };

            let mut subscription = Subscription::empty(subscription_id);
            uow.decide(
                &mut subscription,
                subscription_id.0,
                SUBSCRIPTION,
                SubscriptionCommand::Start(StartSubscription {
                    tenant_id,
                    subscription_id,
                    account_id,
                    plan: plan.clone(),
                    occurred_at: now,
                }),
            )?;

            uow.decide(
                &mut account,
                account_id.0,
                ACCOUNT,
                AccountCommand::ActivatePlan(ActivatePlan {
                    tenant_id,
                    plan_id,
                    subscription_id,
                    occurred_at: now,
                }),
            )?;

            Ok::<_, LedgerError>(PlanPurchase { subscription, entry })
        })?;

        info!(
            subscription_id = %subscription_id,
            plan = %plan.name,
            price = plan.price,
            "plan purchased"
        );
        Ok(purchase)
    }

    /// Cancel an active subscription owned by `account_id`. No refund is made.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, account_id = %account_id), err)]
    pub fn cancel_subscription(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        subscription_id: SubscriptionId,
    ) -> Result<Subscription, LedgerError> {
        let (subscription, _) = self.dispatcher.execute(tenant_id, |uow| {
            let now = uow.now();
            let mut subscription =
                uow.load(subscription_id.0, |_| Subscription::empty(subscription_id))?;
            if !subscription.is_created() || subscription.account_id() != Some(account_id) {
                return Err(LedgerError::NotFound(format!("subscription {subscription_id}")));
            }
            uow.decide(
                &mut subscription,
                subscription_id.0,
                SUBSCRIPTION,
                SubscriptionCommand::Cancel(CancelSubscription {
                    tenant_id,
                    occurred_at: now,
                }),
            )?;

            let mut account = load_account(uow, account_id)?;
            uow.decide(
                &mut account,
                account_id.0,
                ACCOUNT,
                AccountCommand::ClearSubscription(ClearSubscription {
                    tenant_id,
                    subscription_id,
                    occurred_at: now,
                }),
            )?;
            Ok::<_, LedgerError>(subscription)
        })?;

        info!(subscription_id = %subscription_id, "subscription cancelled");
        Ok(subscription)
    }

    pub fn get(
        &self,
        tenant_id: TenantId,
        subscription_id: SubscriptionId,
    ) -> Result<Subscription, LedgerError> {
        let subscription = self
            .dispatcher
            .load(tenant_id, subscription_id.0, |_| Subscription::empty(subscription_id))?;
        if !subscription.is_created() {
            return Err(LedgerError::NotFound(format!("subscription {subscription_id}")));
        }
        Ok(subscription)
    }

    /// Subscriptions of one account, oldest first.
    pub fn list_for_account(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> Result<Vec<Subscription>, LedgerError> {
        let all = rehydrate_all(self.dispatcher.store(), tenant_id, SUBSCRIPTION, |id| {
            Subscription::empty(SubscriptionId::new(id))
        })?;
        Ok(all.into_iter().filter(|s| s.account_id() == Some(account_id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(name: &str, price: i64, active: bool) -> Plan {
        Plan {
            plan_id: PlanId::generate(),
            name: name.to_string(),
            price,
            duration_days: 30,
            active,
        }
    }

    #[test]
    fn catalog_lists_cheapest_first() {
        let catalog = InMemoryPlanCatalog::new();
        let tenant_id = TenantId::new();
        catalog.upsert(tenant_id, plan("Gold", 99_900, true));
        catalog.upsert(tenant_id, plan("Free", 0, true));
        catalog.upsert(tenant_id, plan("Legacy", 10_000, false));

        let names: Vec<_> = catalog.list(tenant_id, true).into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Free", "Gold"]);
        assert_eq!(catalog.list(tenant_id, false).len(), 3);
        assert!(catalog.list(TenantId::new(), false).is_empty());
    }
}
