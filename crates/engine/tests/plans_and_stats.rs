mod common;

use ledgerly_core::TenantId;
use ledgerly_engine::{EntryFilter, LedgerError};
use ledgerly_wallet::{EntryKind, PayoutMethod, Plan, PlanId, SubscriptionId, SubscriptionStatus};

use common::{Service, balance, register, register_referred, service};

fn plan(svc: &Service, tenant_id: TenantId, name: &str, price: i64, active: bool) -> Plan {
    let plan = Plan {
        plan_id: PlanId::generate(),
        name: name.to_string(),
        price,
        duration_days: 30,
        active,
    };
    svc.subscriptions().catalog().upsert(tenant_id, plan.clone());
    plan
}

#[test]
fn paid_plan_debits_and_activates() {
    let svc = service();
    let tenant_id = TenantId::new();
    let a = register(&svc, tenant_id, "alice");
    let b = register_referred(&svc, tenant_id, "bob", &a);
    svc.admin_credit(tenant_id, b.id_typed(), 1_000, None).unwrap();
    let gold = plan(&svc, tenant_id, "Gold", 400, true);

    let purchase = svc.purchase_plan(tenant_id, b.id_typed(), gold.plan_id).unwrap();

    let entry = purchase.entry.unwrap();
    assert_eq!(entry.kind, EntryKind::Debit);
    assert_eq!(entry.amount, 400);
    assert_eq!(entry.note.as_deref(), Some("Plan purchase: Gold"));
    assert_eq!(purchase.subscription.status(), SubscriptionStatus::Active);
    assert_eq!(purchase.subscription.amount_paid(), 400);
    let starts = purchase.subscription.starts_at().unwrap();
    let ends = purchase.subscription.ends_at().unwrap();
    assert_eq!((ends - starts).num_days(), 30);

    let b_now = svc.get_account(tenant_id, b.id_typed()).unwrap();
    assert_eq!(b_now.current_plan(), Some(gold.plan_id));
    assert_eq!(b_now.current_subscription(), Some(purchase.subscription.id_typed()));
    assert_eq!(balance(&svc, tenant_id, b.id_typed()), 600);
    // Plan purchases are not user movements and earn the referrer nothing.
    assert_eq!(balance(&svc, tenant_id, a.id_typed()), 0);
}

#[test]
fn unaffordable_plan_leaves_no_trace() {
    let svc = service();
    let tenant_id = TenantId::new();
    let a = register(&svc, tenant_id, "alice");
    svc.admin_credit(tenant_id, a.id_typed(), 100, None).unwrap();
    let gold = plan(&svc, tenant_id, "Gold", 400, true);

    let err = svc.purchase_plan(tenant_id, a.id_typed(), gold.plan_id).unwrap_err();

    assert!(matches!(
        err,
        LedgerError::InsufficientBalance {
            available: 100,
            requested: 400
        }
    ));
    assert!(svc.subscriptions().list_for_account(tenant_id, a.id_typed()).unwrap().is_empty());
    assert_eq!(svc.get_account(tenant_id, a.id_typed()).unwrap().current_plan(), None);
    assert_eq!(balance(&svc, tenant_id, a.id_typed()), 100);
}

#[test]
fn free_plans_need_no_funds() {
    let svc = service();
    let tenant_id = TenantId::new();
    let a = register(&svc, tenant_id, "alice");
    let trial = plan(&svc, tenant_id, "Trial", 0, true);

    let purchase = svc.purchase_plan(tenant_id, a.id_typed(), trial.plan_id).unwrap();

    assert!(purchase.entry.is_none());
    assert!(svc.list_entries(tenant_id, a.id_typed(), &EntryFilter::default()).unwrap().is_empty());
    let a_now = svc.get_account(tenant_id, a.id_typed()).unwrap();
    assert_eq!(a_now.current_plan(), Some(trial.plan_id));
}

#[test]
fn catalog_rules() {
    let svc = service();
    let tenant_id = TenantId::new();
    let a = register(&svc, tenant_id, "alice");
    let retired = plan(&svc, tenant_id, "Retired", 0, false);
    plan(&svc, tenant_id, "Silver", 200, true);
    plan(&svc, tenant_id, "Basic", 50, true);

    assert!(matches!(
        svc.purchase_plan(tenant_id, a.id_typed(), retired.plan_id),
        Err(LedgerError::InvalidState(_))
    ));
    assert!(matches!(
        svc.purchase_plan(tenant_id, a.id_typed(), PlanId::generate()),
        Err(LedgerError::NotFound(_))
    ));

    let names: Vec<_> = svc.list_plans(tenant_id).into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["Basic", "Silver"]);
    assert!(svc.list_plans(TenantId::new()).is_empty());
}

#[test]
fn cancelling_clears_the_current_subscription() {
    let svc = service();
    let tenant_id = TenantId::new();
    let a = register(&svc, tenant_id, "alice");
    let b = register(&svc, tenant_id, "bob");
    let trial = plan(&svc, tenant_id, "Trial", 0, true);
    let sub = svc
        .purchase_plan(tenant_id, a.id_typed(), trial.plan_id)
        .unwrap()
        .subscription
        .id_typed();

    assert!(matches!(
        svc.cancel_subscription(tenant_id, b.id_typed(), sub),
        Err(LedgerError::NotFound(_))
    ));
    assert!(matches!(
        svc.cancel_subscription(tenant_id, a.id_typed(), SubscriptionId::generate()),
        Err(LedgerError::NotFound(_))
    ));

    let cancelled = svc.cancel_subscription(tenant_id, a.id_typed(), sub).unwrap();
    assert_eq!(cancelled.status(), SubscriptionStatus::Cancelled);
    assert_eq!(svc.get_account(tenant_id, a.id_typed()).unwrap().current_subscription(), None);

    assert!(matches!(
        svc.cancel_subscription(tenant_id, a.id_typed(), sub),
        Err(LedgerError::InvalidState(_))
    ));
}

#[test]
fn stats_summarise_the_tenant() {
    let svc = service();
    let tenant_id = TenantId::new();
    let a = register(&svc, tenant_id, "alice");
    let b = register_referred(&svc, tenant_id, "bob", &a);
    let gold = plan(&svc, tenant_id, "Gold", 100, true);

    svc.deposit(tenant_id, b.id_typed(), 1_000).unwrap();
    let req = svc
        .create_withdraw_request(tenant_id, b.id_typed(), 300, PayoutMethod::Upi)
        .unwrap();
    svc.admin_approve_withdraw(tenant_id, req.id_typed(), None).unwrap();
    svc.admin_mark_paid(tenant_id, req.id_typed(), "UTR1").unwrap();
    let sub = svc.purchase_plan(tenant_id, b.id_typed(), gold.plan_id).unwrap().subscription;

    let stats = svc.stats(tenant_id).unwrap();
    assert_eq!(stats.deposits, 1_000);
    assert_eq!(stats.payouts, 300);
    assert_eq!(stats.commission_signup, 100);
    assert_eq!(stats.commission_tx, 200);
    assert_eq!(stats.by_kind[&EntryKind::WithdrawRequest].count, 1);
    assert_eq!(stats.by_kind[&EntryKind::WithdrawRequest].amount, 0);
    assert_eq!(stats.by_kind[&EntryKind::Debit].amount, 100);
    assert_eq!(stats.active_subscriptions, 1);
    assert_eq!(stats.daily.len(), 1);
    assert_eq!(stats.daily[0].commissions, 300);

    let top = svc.top_referrers(tenant_id, 5).unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].account_id, a.id_typed());
    assert_eq!(top[0].earnings, 300);
    assert_eq!(top[0].referred_count, 1);

    svc.cancel_subscription(tenant_id, b.id_typed(), sub.id_typed()).unwrap();
    assert_eq!(svc.stats(tenant_id).unwrap().active_subscriptions, 0);
    assert_eq!(balance(&svc, tenant_id, b.id_typed()), 600);

    let other = svc.stats(TenantId::new()).unwrap();
    assert_eq!(other.deposits, 0);
    assert!(svc.top_referrers(TenantId::new(), 5).unwrap().is_empty());
}
