//! Typed identifiers for wallet aggregates.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ledgerly_core::AggregateId;

macro_rules! stream_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub AggregateId);

        impl $name {
            pub fn new(id: AggregateId) -> Self {
                Self(id)
            }

            /// Fresh time-ordered identifier.
            pub fn generate() -> Self {
                Self(AggregateId::new())
            }

            pub fn aggregate_id(&self) -> AggregateId {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

stream_id!(
    /// Account identifier (tenant-scoped via the stream key).
    AccountId
);
stream_id!(
    /// Identifier of an account's ledger stream.
    WalletId
);
stream_id!(WithdrawRequestId);
stream_id!(SubscriptionId);
stream_id!(
    /// Catalog plan identifier. Plans are read-only reference data.
    PlanId
);

const WALLET_NAMESPACE: Uuid = Uuid::from_u128(0x6c65_6467_6572_4c79_8000_7761_6c6c_6574);

impl WalletId {
    /// Every account owns exactly one wallet stream, derived from its id.
    pub fn for_account(account_id: AccountId) -> Self {
        Self(AggregateId::derived(&WALLET_NAMESPACE, &account_id.to_string()))
    }
}

/// Ledger entry identifier. Entries live inside wallet streams, so this is a
/// plain UUID rather than a stream id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for EntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}
