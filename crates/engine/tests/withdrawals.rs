mod common;

use ledgerly_core::TenantId;
use ledgerly_engine::{EntryFilter, LedgerError};
use ledgerly_wallet::{
    AccountId, AccountStatus, EntryKind, PayoutMethod, WithdrawRequestId, WithdrawStatus,
};

use common::{Service, balance, register, register_referred, service};

fn funded(svc: &Service, tenant_id: TenantId, amount: i64) -> AccountId {
    let a = register(svc, tenant_id, "alice");
    svc.admin_credit(tenant_id, a.id_typed(), amount, None).unwrap();
    a.id_typed()
}

#[test]
fn request_approve_pay() {
    let svc = service();
    let tenant_id = TenantId::new();
    let account_id = funded(&svc, tenant_id, 800);

    let req = svc
        .create_withdraw_request(tenant_id, account_id, 500, PayoutMethod::Upi)
        .unwrap();
    assert_eq!(req.status(), WithdrawStatus::Pending);
    assert_eq!(balance(&svc, tenant_id, account_id), 800);

    let marker = &svc
        .list_entries(tenant_id, account_id, &EntryFilter::kinds([EntryKind::WithdrawRequest]))
        .unwrap()[0];
    assert_eq!(marker.amount, 0);
    assert_eq!(marker.balance_after, 800);
    assert_eq!(marker.note.as_deref(), Some("Requested 500"));

    let req = svc.admin_approve_withdraw(tenant_id, req.id_typed(), None).unwrap();
    assert_eq!(req.status(), WithdrawStatus::Approved);
    assert_eq!(balance(&svc, tenant_id, account_id), 800);

    let (req, entry) = svc.admin_mark_paid(tenant_id, req.id_typed(), "UTR123").unwrap();
    assert_eq!(req.status(), WithdrawStatus::Paid);
    assert_eq!(req.payout_ref(), Some("UTR123"));
    assert_eq!(entry.kind, EntryKind::WithdrawPayout);
    assert_eq!(entry.amount, 500);
    assert_eq!(entry.note.as_deref(), Some("Withdraw paid (UTR123)"));
    assert_eq!(balance(&svc, tenant_id, account_id), 300);

    let err = svc.admin_mark_paid(tenant_id, req.id_typed(), "UTR124").unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));
    assert_eq!(balance(&svc, tenant_id, account_id), 300);
    let payouts = svc
        .list_entries(tenant_id, account_id, &EntryFilter::kinds([EntryKind::WithdrawPayout]))
        .unwrap();
    assert_eq!(payouts.len(), 1);
}

#[test]
fn payout_without_funds_leaves_request_approved() {
    let svc = service();
    let tenant_id = TenantId::new();
    let account_id = funded(&svc, tenant_id, 800);

    let req = svc
        .create_withdraw_request(tenant_id, account_id, 500, PayoutMethod::Bank)
        .unwrap();
    svc.admin_approve_withdraw(tenant_id, req.id_typed(), None).unwrap();
    svc.withdraw(tenant_id, account_id, 600).unwrap();

    let err = svc.admin_mark_paid(tenant_id, req.id_typed(), "UTR9").unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InsufficientBalance {
            available: 200,
            requested: 500
        }
    ));
    let req = svc.get_withdraw_request(tenant_id, req.id_typed()).unwrap();
    assert_eq!(req.status(), WithdrawStatus::Approved);
    assert_eq!(req.method(), PayoutMethod::Bank);
    assert_eq!(balance(&svc, tenant_id, account_id), 200);
}

#[test]
fn rejection_rules() {
    let svc = service();
    let tenant_id = TenantId::new();
    let account_id = funded(&svc, tenant_id, 1_000);

    let pending = svc
        .create_withdraw_request(tenant_id, account_id, 100, PayoutMethod::Upi)
        .unwrap();
    let rejected = svc
        .admin_reject_withdraw(tenant_id, pending.id_typed(), Some("kyc missing".to_string()))
        .unwrap();
    assert_eq!(rejected.status(), WithdrawStatus::Rejected);
    assert_eq!(rejected.admin_note(), Some("kyc missing"));

    for err in [
        svc.admin_approve_withdraw(tenant_id, rejected.id_typed(), None).unwrap_err(),
        svc.admin_mark_paid(tenant_id, rejected.id_typed(), "UTR1").unwrap_err(),
        svc.admin_reject_withdraw(tenant_id, rejected.id_typed(), None).unwrap_err(),
    ] {
        assert!(matches!(err, LedgerError::InvalidState(_)), "{err}");
    }

    let approved = svc
        .create_withdraw_request(tenant_id, account_id, 100, PayoutMethod::Upi)
        .unwrap();
    svc.admin_approve_withdraw(tenant_id, approved.id_typed(), None).unwrap();
    assert!(matches!(
        svc.admin_approve_withdraw(tenant_id, approved.id_typed(), None),
        Err(LedgerError::InvalidState(_))
    ));
    let rejected = svc.admin_reject_withdraw(tenant_id, approved.id_typed(), None).unwrap();
    assert_eq!(rejected.status(), WithdrawStatus::Rejected);
    assert_eq!(balance(&svc, tenant_id, account_id), 1_000);
}

#[test]
fn pending_requests_cannot_be_paid() {
    let svc = service();
    let tenant_id = TenantId::new();
    let account_id = funded(&svc, tenant_id, 1_000);
    let req = svc
        .create_withdraw_request(tenant_id, account_id, 100, PayoutMethod::Upi)
        .unwrap();

    assert!(matches!(
        svc.admin_mark_paid(tenant_id, req.id_typed(), "UTR1"),
        Err(LedgerError::InvalidState(_))
    ));
    svc.admin_approve_withdraw(tenant_id, req.id_typed(), None).unwrap();
    assert!(matches!(
        svc.admin_mark_paid(tenant_id, req.id_typed(), "  "),
        Err(LedgerError::Validation(_))
    ));
}

#[test]
fn request_input_is_validated() {
    let svc = service();
    let tenant_id = TenantId::new();
    let account_id = funded(&svc, tenant_id, 1_000);

    assert!(matches!(
        svc.create_withdraw_request(tenant_id, account_id, 0, PayoutMethod::Upi),
        Err(LedgerError::InvalidAmount(_))
    ));
    assert!(matches!(
        svc.create_withdraw_request(tenant_id, AccountId::generate(), 10, PayoutMethod::Upi),
        Err(LedgerError::AccountNotFound(_))
    ));

    svc.set_account_status(tenant_id, account_id, AccountStatus::Banned).unwrap();
    assert!(matches!(
        svc.create_withdraw_request(tenant_id, account_id, 10, PayoutMethod::Upi),
        Err(LedgerError::InvalidState(_))
    ));
    assert!(svc.list_withdraw_requests(tenant_id, None, None).unwrap().is_empty());

    assert!(matches!(
        svc.get_withdraw_request(tenant_id, WithdrawRequestId::generate()),
        Err(LedgerError::NotFound(_))
    ));
}

#[test]
fn listing_filters_by_owner_and_status() {
    let svc = service();
    let tenant_id = TenantId::new();
    let a = funded(&svc, tenant_id, 1_000);
    let b = register(&svc, tenant_id, "bob").id_typed();

    let first = svc.create_withdraw_request(tenant_id, a, 100, PayoutMethod::Upi).unwrap();
    svc.create_withdraw_request(tenant_id, a, 200, PayoutMethod::Upi).unwrap();
    svc.create_withdraw_request(tenant_id, b, 300, PayoutMethod::Bank).unwrap();
    svc.admin_approve_withdraw(tenant_id, first.id_typed(), None).unwrap();

    assert_eq!(svc.list_withdraw_requests(tenant_id, None, None).unwrap().len(), 3);
    assert_eq!(svc.list_withdraw_requests(tenant_id, Some(a), None).unwrap().len(), 2);
    let pending = svc
        .list_withdraw_requests(tenant_id, None, Some(WithdrawStatus::Pending))
        .unwrap();
    assert_eq!(pending.len(), 2);
    assert!(svc.list_withdraw_requests(TenantId::new(), None, None).unwrap().is_empty());
}

#[test]
fn payouts_do_not_pay_commission() {
    let svc = service();
    let tenant_id = TenantId::new();
    let a = register(&svc, tenant_id, "alice");
    let b = register_referred(&svc, tenant_id, "bob", &a);
    svc.admin_credit(tenant_id, b.id_typed(), 1_000, None).unwrap();

    let req = svc
        .create_withdraw_request(tenant_id, b.id_typed(), 400, PayoutMethod::Upi)
        .unwrap();
    svc.admin_approve_withdraw(tenant_id, req.id_typed(), None).unwrap();
    svc.admin_mark_paid(tenant_id, req.id_typed(), "UTR7").unwrap();

    assert_eq!(balance(&svc, tenant_id, a.id_typed()), 0);
    assert_eq!(balance(&svc, tenant_id, b.id_typed()), 600);
}
