use std::collections::HashMap;

use serde::de::DeserializeOwned;

use ledgerly_core::{Aggregate, AggregateId, TenantId};
use ledgerly_infra::event_store::EventStore;

use crate::error::LedgerError;

/// Rehydrate every stream of `aggregate_type` in the tenant's log, in order of
/// first appearance.
pub(crate) fn rehydrate_all<A, S>(
    store: &S,
    tenant_id: TenantId,
    aggregate_type: &str,
    make_aggregate: impl Fn(AggregateId) -> A,
) -> Result<Vec<A>, LedgerError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
    S: EventStore,
{
    let mut order: Vec<AggregateId> = Vec::new();
    let mut streams: HashMap<AggregateId, A> = HashMap::new();

    for stored in store.load_tenant_events(tenant_id)? {
        if stored.aggregate_type != aggregate_type {
            continue;
        }
        let ev: A::Event = serde_json::from_value(stored.payload)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        let aggregate = streams.entry(stored.aggregate_id).or_insert_with(|| {
            order.push(stored.aggregate_id);
            make_aggregate(stored.aggregate_id)
        });
        aggregate.apply(&ev);
    }

    Ok(order.into_iter().filter_map(|id| streams.remove(&id)).collect())
}
