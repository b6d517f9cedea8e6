mod common;

use std::sync::Barrier;
use std::thread;

use ledgerly_core::TenantId;
use ledgerly_engine::{EntryFilter, LedgerError, PaymentCapture};
use ledgerly_wallet::{CommissionKind, EntryKind, PayoutMethod};

use common::{balance, register, register_referred, service, service_with, signup_only};

const THREADS: usize = 8;

#[test]
fn concurrent_appends_on_one_account_form_a_valid_chain() {
    let svc = service();
    let tenant_id = TenantId::new();
    let a = register(&svc, tenant_id, "alice");
    let account_id = a.id_typed();
    svc.admin_credit(tenant_id, account_id, 1_000, None).unwrap();

    let committed: i64 = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let svc = &svc;
                s.spawn(move || {
                    let mut delta = 0i64;
                    for n in 0..10 {
                        if (i + n) % 2 == 0 {
                            svc.deposit(tenant_id, account_id, 30).unwrap();
                            delta += 30;
                        } else {
                            match svc.withdraw(tenant_id, account_id, 70) {
                                Ok(_) => delta -= 70,
                                Err(LedgerError::InsufficientBalance { .. }) => {}
                                Err(other) => panic!("unexpected error: {other}"),
                            }
                        }
                    }
                    delta
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    let final_balance = balance(&svc, tenant_id, a.id_typed());
    assert_eq!(final_balance, 1_000 + committed);

    let mut entries = svc
        .list_entries(tenant_id, a.id_typed(), &EntryFilter::default().with_limit(100))
        .unwrap();
    entries.reverse();
    let mut running = 0;
    for (i, e) in entries.iter().enumerate() {
        running += e.signed_amount();
        assert_eq!(e.sequence, i as u64 + 1);
        assert_eq!(e.balance_after, running);
        assert!(e.balance_after >= 0);
    }
    assert_eq!(running, final_balance);
}

#[test]
fn concurrent_gateway_replays_credit_once() {
    let svc = service();
    let tenant_id = TenantId::new();
    let a = register(&svc, tenant_id, "alice");
    let capture = PaymentCapture {
        order_id: "order_race".to_string(),
        account_id: a.id_typed(),
        amount: 4_200,
    };

    let applied = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let svc = &svc;
                let capture = capture.clone();
                s.spawn(move || svc.on_payment_captured(tenant_id, capture).unwrap())
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| !r.is_duplicate())
            .count()
    });

    assert_eq!(applied, 1);
    assert_eq!(balance(&svc, tenant_id, a.id_typed()), 4_200);
    let credits = svc
        .list_entries(tenant_id, a.id_typed(), &EntryFilter::kinds([EntryKind::Credit]))
        .unwrap();
    assert_eq!(credits.len(), 1);
}

#[test]
fn signup_bonus_is_paid_once_under_concurrent_first_deposits() {
    let svc = signup_only();
    let tenant_id = TenantId::new();
    let a = register(&svc, tenant_id, "alice");
    let b = register_referred(&svc, tenant_id, "bob", &a);
    let b_id = b.id_typed();

    thread::scope(|s| {
        for _ in 0..THREADS {
            let svc = &svc;
            s.spawn(move || svc.deposit(tenant_id, b_id, 1_000).unwrap());
        }
    });

    assert_eq!(balance(&svc, tenant_id, b.id_typed()), 1_000 * THREADS as i64);

    let bonuses: Vec<_> = svc
        .list_entries(tenant_id, a.id_typed(), &EntryFilter::kinds([EntryKind::Commission]))
        .unwrap()
        .into_iter()
        .filter(|e| e.commission.map(|c| c.kind) == Some(CommissionKind::Signup))
        .collect();
    assert_eq!(bonuses.len(), 1);
    assert_eq!(bonuses[0].amount, 100);
    assert_eq!(balance(&svc, tenant_id, a.id_typed()), 100);
    assert!(svc.get_account(tenant_id, b.id_typed()).unwrap().referral().first_bonus_paid);
}

#[test]
fn concurrent_deposits_on_one_account_all_commit() {
    let svc = service();
    let tenant_id = TenantId::new();
    let account_id = register(&svc, tenant_id, "alice").id_typed();

    thread::scope(|s| {
        for _ in 0..16 {
            let svc = &svc;
            s.spawn(move || {
                for _ in 0..50 {
                    svc.deposit(tenant_id, account_id, 10).unwrap();
                }
            });
        }
    });

    assert_eq!(balance(&svc, tenant_id, account_id), 16 * 50 * 10);
    let latest = &svc
        .list_entries(tenant_id, account_id, &EntryFilter::default().with_limit(1))
        .unwrap()[0];
    assert_eq!(latest.sequence, 800);
    assert_eq!(latest.balance_after, 8_000);
}

#[test]
fn referrer_earns_every_commission_under_contention() {
    let svc = service();
    let tenant_id = TenantId::new();
    let a = register(&svc, tenant_id, "alice");
    let referred: Vec<_> = (0..THREADS)
        .map(|i| register_referred(&svc, tenant_id, &format!("user{i}"), &a).id_typed())
        .collect();

    thread::scope(|s| {
        for &account_id in &referred {
            let svc = &svc;
            s.spawn(move || {
                for _ in 0..10 {
                    svc.deposit(tenant_id, account_id, 1_000).unwrap();
                }
            });
        }
    });

    // Per referred account: a 10% signup bonus on 1000 plus 200 per deposit.
    let expected = THREADS as i64 * (100 + 10 * 200);
    let alice = svc.get_account(tenant_id, a.id_typed()).unwrap();
    assert_eq!(alice.referral().earnings, expected);
    assert_eq!(alice.referral().referred_count, THREADS as u64);
    assert_eq!(balance(&svc, tenant_id, a.id_typed()), expected);
    let commissions = svc
        .list_entries(
            tenant_id,
            a.id_typed(),
            &EntryFilter::kinds([EntryKind::Commission]).with_limit(100),
        )
        .unwrap();
    assert_eq!(commissions.len(), THREADS * 11);
}

#[test]
fn racing_payouts_pay_an_approved_request_once() {
    let svc = service();
    let tenant_id = TenantId::new();
    let account_id = register(&svc, tenant_id, "alice").id_typed();
    svc.admin_credit(tenant_id, account_id, 1_000, None).unwrap();
    let request_id = svc
        .create_withdraw_request(tenant_id, account_id, 400, PayoutMethod::Upi)
        .unwrap()
        .id_typed();
    svc.admin_approve_withdraw(tenant_id, request_id, None).unwrap();

    let barrier = Barrier::new(2);
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = ["UTR-A", "UTR-B"]
            .into_iter()
            .map(|payout_ref| {
                let (svc, barrier) = (&svc, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    svc.admin_mark_paid(tenant_id, request_id, payout_ref)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(LedgerError::InvalidState(_))))
    );
    let payouts = svc
        .list_entries(tenant_id, account_id, &EntryFilter::kinds([EntryKind::WithdrawPayout]))
        .unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(balance(&svc, tenant_id, account_id), 600);
}

#[test]
fn different_accounts_do_not_contend() {
    let svc = service_with("[ledger]\nmax_append_attempts = 1");
    let tenant_id = TenantId::new();
    let accounts: Vec<_> = (0..THREADS)
        .map(|i| register(&svc, tenant_id, &format!("user{i}")))
        .collect();

    thread::scope(|s| {
        for account in &accounts {
            let svc = &svc;
            let account_id = account.id_typed();
            s.spawn(move || {
                for _ in 0..20 {
                    svc.deposit(tenant_id, account_id, 5).unwrap();
                }
            });
        }
    });

    for account in &accounts {
        assert_eq!(balance(&svc, tenant_id, account.id_typed()), 100);
    }
}
