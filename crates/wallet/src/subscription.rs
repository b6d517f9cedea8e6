use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use ledgerly_core::{Aggregate, AggregateRoot, DomainError, TenantId, ValueObject};
use ledgerly_events::Event;

use crate::ids::{AccountId, PlanId, SubscriptionId};

pub const AGGREGATE_TYPE: &str = "wallet.subscription";

/// A purchasable plan. Price is in minor units; `0` means free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: PlanId,
    pub name: String,
    pub price: i64,
    pub duration_days: u32,
    pub active: bool,
}

impl ValueObject for Plan {}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.price == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
}

/// Aggregate root: Subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriptionId,
    tenant_id: Option<TenantId>,
    account_id: Option<AccountId>,
    plan_id: Option<PlanId>,
    amount_paid: i64,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    status: SubscriptionStatus,
    version: u64,
    created: bool,
}

impl Subscription {
    pub fn empty(id: SubscriptionId) -> Self {
        Self {
            id,
            tenant_id: None,
            account_id: None,
            plan_id: None,
            amount_paid: 0,
            starts_at: None,
            ends_at: None,
            status: SubscriptionStatus::Active,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn account_id(&self) -> Option<AccountId> {
        self.account_id
    }

    pub fn plan_id(&self) -> Option<PlanId> {
        self.plan_id
    }

    pub fn amount_paid(&self) -> i64 {
        self.amount_paid
    }

    pub fn starts_at(&self) -> Option<DateTime<Utc>> {
        self.starts_at
    }

    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        self.ends_at
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }
}

impl AggregateRoot for Subscription {
    type Id = SubscriptionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSubscription {
    pub tenant_id: TenantId,
    pub subscription_id: SubscriptionId,
    pub account_id: AccountId,
    pub plan: Plan,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSubscription {
    pub tenant_id: TenantId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionCommand {
    Start(StartSubscription),
    Cancel(CancelSubscription),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStarted {
    pub tenant_id: TenantId,
    pub subscription_id: SubscriptionId,
    pub account_id: AccountId,
    pub plan_id: PlanId,
    pub amount_paid: i64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCancelled {
    pub tenant_id: TenantId,
    pub subscription_id: SubscriptionId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionEvent {
    Started(SubscriptionStarted),
    Cancelled(SubscriptionCancelled),
}

impl Event for SubscriptionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SubscriptionEvent::Started(_) => "wallet.subscription.started",
            SubscriptionEvent::Cancelled(_) => "wallet.subscription.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SubscriptionEvent::Started(e) => e.starts_at,
            SubscriptionEvent::Cancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Subscription {
    type Command = SubscriptionCommand;
    type Event = SubscriptionEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SubscriptionEvent::Started(e) => {
                self.id = e.subscription_id;
                self.tenant_id = Some(e.tenant_id);
                self.account_id = Some(e.account_id);
                self.plan_id = Some(e.plan_id);
                self.amount_paid = e.amount_paid;
                self.starts_at = Some(e.starts_at);
                self.ends_at = Some(e.ends_at);
                self.status = SubscriptionStatus::Active;
                self.created = true;
            }
            SubscriptionEvent::Cancelled(_) => {
                self.status = SubscriptionStatus::Cancelled;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SubscriptionCommand::Start(cmd) => self.handle_start(cmd),
            SubscriptionCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Subscription {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if self.created && self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn handle_start(&self, cmd: &StartSubscription) -> Result<Vec<SubscriptionEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        if self.created {
            return Err(DomainError::duplicate("subscription already started"));
        }
        if !cmd.plan.active {
            return Err(DomainError::invalid_state("plan is not active"));
        }
        if cmd.plan.price < 0 {
            return Err(DomainError::invalid_amount("plan price cannot be negative"));
        }
        if cmd.plan.duration_days == 0 {
            return Err(DomainError::validation("plan duration must be at least one day"));
        }

        let ends_at = cmd.occurred_at + Duration::days(i64::from(cmd.plan.duration_days));

        Ok(vec![SubscriptionEvent::Started(SubscriptionStarted {
            tenant_id: cmd.tenant_id,
            subscription_id: cmd.subscription_id,
            account_id: cmd.account_id,
            plan_id: cmd.plan.plan_id,
            amount_paid: cmd.plan.price,
            starts_at: cmd.occurred_at,
            ends_at,
        })])
    }

    fn handle_cancel(
        &self,
        cmd: &CancelSubscription,
    ) -> Result<Vec<SubscriptionEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        if !self.created {
            return Err(DomainError::NotFound);
        }
        if self.status != SubscriptionStatus::Active {
            return Err(DomainError::invalid_state("subscription is not active"));
        }

        Ok(vec![SubscriptionEvent::Cancelled(SubscriptionCancelled {
            tenant_id: cmd.tenant_id,
            subscription_id: self.id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(price: i64, active: bool) -> Plan {
        Plan {
            plan_id: PlanId::generate(),
            name: "Gold".to_string(),
            price,
            duration_days: 30,
            active,
        }
    }

    fn start(
        sub: &Subscription,
        tenant_id: TenantId,
        plan: Plan,
    ) -> Result<Vec<SubscriptionEvent>, DomainError> {
        sub.handle(&SubscriptionCommand::Start(StartSubscription {
            tenant_id,
            subscription_id: sub.id_typed(),
            account_id: AccountId::generate(),
            plan,
            occurred_at: Utc::now(),
        }))
    }

    #[test]
    fn start_sets_end_from_plan_duration() {
        let tenant_id = TenantId::new();
        let mut sub = Subscription::empty(SubscriptionId::generate());

        let events = start(&sub, tenant_id, plan(49_900, true)).unwrap();
        events.iter().for_each(|e| sub.apply(e));

        let starts = sub.starts_at().unwrap();
        assert_eq!(sub.ends_at().unwrap() - starts, Duration::days(30));
        assert_eq!(sub.amount_paid(), 49_900);
        assert_eq!(sub.status(), SubscriptionStatus::Active);
    }

    #[test]
    fn inactive_plans_cannot_be_started() {
        let sub = Subscription::empty(SubscriptionId::generate());
        let err = start(&sub, TenantId::new(), plan(100, false)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn cancel_only_once() {
        let tenant_id = TenantId::new();
        let mut sub = Subscription::empty(SubscriptionId::generate());
        start(&sub, tenant_id, plan(0, true))
            .unwrap()
            .iter()
            .for_each(|e| sub.apply(e));

        let cancel = SubscriptionCommand::Cancel(CancelSubscription {
            tenant_id,
            occurred_at: Utc::now(),
        });
        sub.handle(&cancel).unwrap().iter().for_each(|e| sub.apply(e));

        assert_eq!(sub.status(), SubscriptionStatus::Cancelled);
        assert!(matches!(sub.handle(&cancel), Err(DomainError::InvalidState(_))));
    }
}
