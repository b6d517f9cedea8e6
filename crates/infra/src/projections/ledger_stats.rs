//! Ledger stats projection.
//!
//! Day-bucketed totals built from committed wallet and account events:
//! amounts and counts per entry kind, commission split by sub-kind, and
//! per-referrer earnings and referral counts. Subscription end dates are
//! tracked alongside so `stats` can count the ones still active. Feeds the
//! admin `stats` and `top_referrers` queries.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use ledgerly_core::{AggregateId, TenantId};
use ledgerly_events::EventEnvelope;
use ledgerly_wallet::account::AGGREGATE_TYPE as ACCOUNT;
use ledgerly_wallet::ledger::AGGREGATE_TYPE as LEDGER;
use ledgerly_wallet::subscription::AGGREGATE_TYPE as SUBSCRIPTION;
use ledgerly_wallet::{
    AccountEvent, AccountId, CommissionKind, EntryKind, SubscriptionEvent, SubscriptionId,
    WalletEvent,
};

use crate::event_store::{EventStore, EventStoreError};
use crate::read_model::TenantStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KindTotals {
    pub count: u64,
    pub amount: i64,
}

impl KindTotals {
    fn add(&mut self, other: KindTotals) {
        self.count += other.count;
        self.amount = self.amount.saturating_add(other.amount);
    }
}

/// One day of ledger activity for a tenant (read model record).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyLedgerStats {
    pub day: NaiveDate,
    pub by_kind: BTreeMap<EntryKind, KindTotals>,
    pub commission_signup: i64,
    pub commission_tx: i64,
    pub commission_by_referrer: BTreeMap<AccountId, i64>,
    pub referrals_by_referrer: BTreeMap<AccountId, u64>,
}

impl DailyLedgerStats {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            by_kind: BTreeMap::new(),
            commission_signup: 0,
            commission_tx: 0,
            commission_by_referrer: BTreeMap::new(),
            referrals_by_referrer: BTreeMap::new(),
        }
    }

    fn amount_of(&self, kinds: &[EntryKind]) -> i64 {
        kinds
            .iter()
            .filter_map(|k| self.by_kind.get(k))
            .fold(0i64, |acc, t| acc.saturating_add(t.amount))
    }
}

/// Per-day money flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyFlow {
    pub day: NaiveDate,
    pub credits: i64,
    pub debits: i64,
    pub commissions: i64,
}

/// Tenant-wide totals across all recorded days.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerStats {
    pub by_kind: BTreeMap<EntryKind, KindTotals>,
    /// `Credit` + `Refund`.
    pub deposits: i64,
    /// `WithdrawPayout` + `Fee`.
    pub payouts: i64,
    pub commission_signup: i64,
    pub commission_tx: i64,
    /// Active subscriptions whose end date has not passed.
    pub active_subscriptions: u64,
    /// Oldest day first.
    pub daily: Vec<DailyFlow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferrerSummary {
    pub account_id: AccountId,
    pub referred_count: u64,
    pub earnings: i64,
}

const CREDIT_KINDS: [EntryKind; 2] = [EntryKind::Credit, EntryKind::Refund];
const DEBIT_KINDS: [EntryKind; 4] = [
    EntryKind::Debit,
    EntryKind::WithdrawPayout,
    EntryKind::Fee,
    EntryKind::Reversal,
];
const PAYOUT_KINDS: [EntryKind; 2] = [EntryKind::WithdrawPayout, EntryKind::Fee];

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum StatsProjectionError {
    #[error("failed to deserialize event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// Ledger stats projection.
///
/// Idempotent under at-least-once delivery (per-stream cursors) and
/// rebuildable from the tenant's event log.
#[derive(Debug)]
pub struct LedgerStatsProjection<S>
where
    S: TenantStore<NaiveDate, DailyLedgerStats>,
{
    store: S,
    cursors: RwLock<HashMap<CursorKey, u64>>,
    subscriptions: RwLock<HashMap<(TenantId, SubscriptionId), DateTime<Utc>>>,
}

impl<S> LedgerStatsProjection<S>
where
    S: TenantStore<NaiveDate, DailyLedgerStats>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn day(&self, tenant_id: TenantId, day: NaiveDate) -> Option<DailyLedgerStats> {
        self.store.get(tenant_id, &day)
    }

    /// Totals and per-day flow across every recorded day.
    pub fn stats(&self, tenant_id: TenantId) -> LedgerStats {
        self.stats_as_of(tenant_id, Utc::now())
    }

    /// Like [`Self::stats`], counting subscriptions still running at `as_of`.
    pub fn stats_as_of(&self, tenant_id: TenantId, as_of: DateTime<Utc>) -> LedgerStats {
        let mut days = self.store.list(tenant_id);
        days.sort_by_key(|d| d.day);

        let mut out = LedgerStats::default();
        for d in &days {
            for (kind, totals) in &d.by_kind {
                out.by_kind.entry(*kind).or_default().add(*totals);
            }
            out.commission_signup = out.commission_signup.saturating_add(d.commission_signup);
            out.commission_tx = out.commission_tx.saturating_add(d.commission_tx);
            out.daily.push(DailyFlow {
                day: d.day,
                credits: d.amount_of(&CREDIT_KINDS),
                debits: d.amount_of(&DEBIT_KINDS),
                commissions: d.amount_of(&[EntryKind::Commission]),
            });
        }

        let sum = |kinds: &[EntryKind]| {
            kinds
                .iter()
                .filter_map(|k| out.by_kind.get(k))
                .fold(0i64, |acc, t| acc.saturating_add(t.amount))
        };
        out.deposits = sum(&CREDIT_KINDS);
        out.payouts = sum(&PAYOUT_KINDS);
        out.active_subscriptions = match self.subscriptions.read() {
            Ok(subs) => subs
                .iter()
                .filter(|((t, _), ends_at)| *t == tenant_id && **ends_at >= as_of)
                .count() as u64,
            Err(_) => 0,
        };
        out
    }

    /// Referrers ranked by commission earnings, then referral count.
    pub fn top_referrers(&self, tenant_id: TenantId, limit: usize) -> Vec<ReferrerSummary> {
        let mut totals: BTreeMap<AccountId, ReferrerSummary> = BTreeMap::new();
        for d in self.store.list(tenant_id) {
            for (account_id, earned) in d.commission_by_referrer {
                let s = totals.entry(account_id).or_insert_with(|| empty_summary(account_id));
                s.earnings = s.earnings.saturating_add(earned);
            }
            for (account_id, count) in d.referrals_by_referrer {
                let s = totals.entry(account_id).or_insert_with(|| empty_summary(account_id));
                s.referred_count += count;
            }
        }

        let mut ranked: Vec<_> = totals.into_values().collect();
        ranked.sort_by(|a, b| {
            b.earnings
                .cmp(&a.earnings)
                .then(b.referred_count.cmp(&a.referred_count))
                .then(a.account_id.cmp(&b.account_id))
        });
        ranked.truncate(limit);
        ranked
    }

    fn get_cursor(&self, key: CursorKey) -> u64 {
        match self.cursors.read() {
            Ok(cursors) => *cursors.get(&key).unwrap_or(&0),
            Err(_) => 0,
        }
    }

    fn update_cursor(&self, key: CursorKey, sequence_number: u64) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.insert(key, sequence_number);
        }
    }

    fn clear_tenant_state(&self, tenant_id: TenantId) {
        self.store.clear_tenant(tenant_id);
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.retain(|k, _| k.tenant_id != tenant_id);
        }
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.retain(|(t, _), _| *t != tenant_id);
        }
    }

    /// Apply one published envelope. Envelopes from other streams are ignored.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), StatsProjectionError> {
        let aggregate_type = envelope.aggregate_type();
        if ![LEDGER, ACCOUNT, SUBSCRIPTION].contains(&aggregate_type) {
            return Ok(());
        }

        let tenant_id = envelope.tenant_id();
        let key = CursorKey {
            tenant_id,
            aggregate_id: envelope.aggregate_id(),
        };
        let seq = envelope.sequence_number();
        let last = self.get_cursor(key);

        if seq != 0 && seq <= last {
            return Ok(());
        }
        if seq != last + 1 {
            return Err(StatsProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let day = envelope.occurred_at().date_naive();
        match aggregate_type {
            LEDGER => self.apply_wallet_event(tenant_id, day, envelope.payload())?,
            ACCOUNT => self.apply_account_event(tenant_id, day, envelope.payload())?,
            _ => self.apply_subscription_event(tenant_id, envelope.payload())?,
        }

        self.update_cursor(key, seq);
        Ok(())
    }

    fn apply_wallet_event(
        &self,
        tenant_id: TenantId,
        day: NaiveDate,
        payload: &JsonValue,
    ) -> Result<(), StatsProjectionError> {
        let ev: WalletEvent = serde_json::from_value(payload.clone())
            .map_err(|e| StatsProjectionError::Deserialize(e.to_string()))?;
        let WalletEvent::EntryAppended(e) = ev;
        if e.tenant_id != tenant_id {
            return Err(StatsProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }

        let entry = e.entry;
        self.store.update_with(tenant_id, day, &mut |prev| {
            let mut d = prev.unwrap_or_else(|| DailyLedgerStats::new(day));
            d.by_kind.entry(entry.kind).or_default().add(KindTotals {
                count: 1,
                amount: entry.amount,
            });
            if let Some(info) = &entry.commission {
                match info.kind {
                    CommissionKind::Signup => {
                        d.commission_signup = d.commission_signup.saturating_add(entry.amount)
                    }
                    CommissionKind::Tx => {
                        d.commission_tx = d.commission_tx.saturating_add(entry.amount)
                    }
                }
                let earned = d.commission_by_referrer.entry(entry.account_id).or_insert(0);
                *earned = earned.saturating_add(entry.amount);
            }
            d
        });
        Ok(())
    }

    fn apply_account_event(
        &self,
        tenant_id: TenantId,
        day: NaiveDate,
        payload: &JsonValue,
    ) -> Result<(), StatsProjectionError> {
        let ev: AccountEvent = serde_json::from_value(payload.clone())
            .map_err(|e| StatsProjectionError::Deserialize(e.to_string()))?;

        if let AccountEvent::ReferralRecorded(e) = ev {
            if e.tenant_id != tenant_id {
                return Err(StatsProjectionError::TenantIsolation(
                    "event tenant_id does not match envelope tenant_id".to_string(),
                ));
            }
            self.store.update_with(tenant_id, day, &mut |prev| {
                let mut d = prev.unwrap_or_else(|| DailyLedgerStats::new(day));
                *d.referrals_by_referrer.entry(e.account_id).or_insert(0) += 1;
                d
            });
        }
        Ok(())
    }

    fn apply_subscription_event(
        &self,
        tenant_id: TenantId,
        payload: &JsonValue,
    ) -> Result<(), StatsProjectionError> {
        let ev: SubscriptionEvent = serde_json::from_value(payload.clone())
            .map_err(|e| StatsProjectionError::Deserialize(e.to_string()))?;
        let Ok(mut subs) = self.subscriptions.write() else {
            return Ok(());
        };
        match ev {
            SubscriptionEvent::Started(e) => {
                if e.tenant_id != tenant_id {
                    return Err(StatsProjectionError::TenantIsolation(
                        "event tenant_id does not match envelope tenant_id".to_string(),
                    ));
                }
                subs.insert((tenant_id, e.subscription_id), e.ends_at);
            }
            SubscriptionEvent::Cancelled(e) => {
                subs.remove(&(tenant_id, e.subscription_id));
            }
        }
        Ok(())
    }

    /// Rebuild the read model from scratch.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), StatsProjectionError> {
        let envs: Vec<_> = envelopes.into_iter().collect();

        let mut tenants = envs.iter().map(|e| e.tenant_id()).collect::<Vec<_>>();
        tenants.sort();
        tenants.dedup();
        for t in tenants {
            self.clear_tenant_state(t);
        }

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }

    /// Rebuild one tenant from its full event log in commit order.
    pub fn rebuild_tenant<E: EventStore>(
        &self,
        store: &E,
        tenant_id: TenantId,
    ) -> Result<(), StatsProjectionError> {
        let events = store.load_tenant_events(tenant_id)?;
        self.clear_tenant_state(tenant_id);
        for stored in &events {
            self.apply_envelope(&stored.to_envelope())?;
        }
        Ok(())
    }
}

fn empty_summary(account_id: AccountId) -> ReferrerSummary {
    ReferrerSummary {
        account_id,
        referred_count: 0,
        earnings: 0,
    }
}
