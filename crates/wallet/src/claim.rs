//! Uniqueness reservations.
//!
//! A claim is a one-event stream whose id is derived from a natural key. The
//! store's optimistic append (`Exact(0)`) guarantees at most one reservation
//! per key and tenant, which backs unique emails, phones, referral codes and
//! idempotent gateway order ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ledgerly_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId};
use ledgerly_events::Event;

use crate::account::{normalize_email, normalize_referral_code};

pub const AGGREGATE_TYPE: &str = "wallet.claim";

const CLAIM_NAMESPACE: Uuid = Uuid::from_u128(0x6c65_6467_6572_4c79_8000_636c_6169_6d73);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ClaimKey {
    Email(String),
    Phone(String),
    ReferralCode(String),
    /// Gateway order id of a captured payment.
    PaymentOrder(String),
}

impl ClaimKey {
    pub fn email(raw: &str) -> Self {
        ClaimKey::Email(normalize_email(raw))
    }

    pub fn phone(raw: &str) -> Self {
        ClaimKey::Phone(raw.trim().to_string())
    }

    pub fn referral_code(raw: &str) -> Self {
        ClaimKey::ReferralCode(normalize_referral_code(raw))
    }

    pub fn payment_order(order_id: &str) -> Self {
        ClaimKey::PaymentOrder(order_id.trim().to_string())
    }

    fn label(&self) -> (&'static str, &str) {
        match self {
            ClaimKey::Email(v) => ("email", v),
            ClaimKey::Phone(v) => ("phone", v),
            ClaimKey::ReferralCode(v) => ("referral_code", v),
            ClaimKey::PaymentOrder(v) => ("payment_order", v),
        }
    }

    /// Stream id of this key's reservation.
    pub fn stream_id(&self) -> AggregateId {
        let (kind, value) = self.label();
        AggregateId::derived(&CLAIM_NAMESPACE, &format!("{kind}:{value}"))
    }
}

impl core::fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (kind, value) = self.label();
        write!(f, "{kind} '{value}'")
    }
}

/// Aggregate root: Claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    id: AggregateId,
    tenant_id: Option<TenantId>,
    key: Option<ClaimKey>,
    owner: Option<AggregateId>,
    version: u64,
}

impl Claim {
    pub fn empty(id: AggregateId) -> Self {
        Self {
            id,
            tenant_id: None,
            key: None,
            owner: None,
            version: 0,
        }
    }

    pub fn for_key(key: &ClaimKey) -> Self {
        Self::empty(key.stream_id())
    }

    pub fn key(&self) -> Option<&ClaimKey> {
        self.key.as_ref()
    }

    /// Stream that holds the reserved key, if any.
    pub fn owner(&self) -> Option<AggregateId> {
        self.owner
    }

    pub fn is_taken(&self) -> bool {
        self.owner.is_some()
    }
}

impl AggregateRoot for Claim {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveClaim {
    pub tenant_id: TenantId,
    pub key: ClaimKey,
    pub owner: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimCommand {
    Reserve(ReserveClaim),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReserved {
    pub tenant_id: TenantId,
    pub key: ClaimKey,
    pub owner: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimEvent {
    Reserved(ClaimReserved),
}

impl Event for ClaimEvent {
    fn event_type(&self) -> &'static str {
        "wallet.claim.reserved"
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ClaimEvent::Reserved(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Claim {
    type Command = ClaimCommand;
    type Event = ClaimEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ClaimEvent::Reserved(e) => {
                self.tenant_id = Some(e.tenant_id);
                self.key = Some(e.key.clone());
                self.owner = Some(e.owner);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ClaimCommand::Reserve(cmd) => {
                if cmd.key.stream_id() != self.id {
                    return Err(DomainError::invariant("claim key does not match stream"));
                }
                if self.is_taken() {
                    return Err(DomainError::duplicate(format!("{} is already taken", cmd.key)));
                }

                Ok(vec![ClaimEvent::Reserved(ClaimReserved {
                    tenant_id: cmd.tenant_id,
                    key: cmd.key.clone(),
                    owner: cmd.owner,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}
