use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use ledgerly_core::TenantId;

/// Tenant-isolated key/value store for disposable read models.
pub trait TenantStore<K, V>: Send + Sync {
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V>;
    fn upsert(&self, tenant_id: TenantId, key: K, value: V);
    fn list(&self, tenant_id: TenantId) -> Vec<V>;

    /// Read-modify-write of one record under a single lock.
    fn update_with(&self, tenant_id: TenantId, key: K, f: &mut dyn FnMut(Option<V>) -> V);

    /// Clear all read-model records for a tenant (rebuild support).
    fn clear_tenant(&self, tenant_id: TenantId);
}

impl<K, V, S> TenantStore<K, V> for Arc<S>
where
    S: TenantStore<K, V> + ?Sized,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V> {
        (**self).get(tenant_id, key)
    }

    fn upsert(&self, tenant_id: TenantId, key: K, value: V) {
        (**self).upsert(tenant_id, key, value)
    }

    fn list(&self, tenant_id: TenantId) -> Vec<V> {
        (**self).list(tenant_id)
    }

    fn update_with(&self, tenant_id: TenantId, key: K, f: &mut dyn FnMut(Option<V>) -> V) {
        (**self).update_with(tenant_id, key, f)
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        (**self).clear_tenant(tenant_id)
    }
}

/// In-memory tenant-isolated store for tests/dev.
#[derive(Debug)]
pub struct InMemoryTenantStore<K, V> {
    inner: RwLock<HashMap<(TenantId, K), V>>,
}

impl<K, V> InMemoryTenantStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryTenantStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TenantStore<K, V> for InMemoryTenantStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V> {
        let map = self.inner.read().ok()?;
        map.get(&(tenant_id, key.clone())).cloned()
    }

    fn upsert(&self, tenant_id: TenantId, key: K, value: V) {
        if let Ok(mut map) = self.inner.write() {
            map.insert((tenant_id, key), value);
        }
    }

    fn list(&self, tenant_id: TenantId) -> Vec<V> {
        let map = match self.inner.read() {
            Ok(m) => m,
            Err(_) => return vec![],
        };

        map.iter()
            .filter_map(|((t, _k), v)| if *t == tenant_id { Some(v.clone()) } else { None })
            .collect()
    }

    fn update_with(&self, tenant_id: TenantId, key: K, f: &mut dyn FnMut(Option<V>) -> V) {
        if let Ok(mut map) = self.inner.write() {
            let slot = (tenant_id, key);
            let next = f(map.remove(&slot));
            map.insert(slot, next);
        }
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut map) = self.inner.write() {
            map.retain(|(t, _k), _v| *t != tenant_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenants_do_not_see_each_other() {
        let store = InMemoryTenantStore::<u32, &'static str>::new();
        let t1 = TenantId::new();
        let t2 = TenantId::new();

        store.upsert(t1, 1, "a");
        store.upsert(t2, 1, "b");

        assert_eq!(store.get(t1, &1), Some("a"));
        assert_eq!(store.list(t2), vec!["b"]);

        store.clear_tenant(t1);
        assert!(store.list(t1).is_empty());
        assert_eq!(store.get(t2, &1), Some("b"));
    }

    #[test]
    fn update_with_sees_previous_value() {
        let store = InMemoryTenantStore::<&'static str, u64>::new();
        let tenant_id = TenantId::new();

        store.update_with(tenant_id, "n", &mut |prev| prev.unwrap_or(0) + 1);
        store.update_with(tenant_id, "n", &mut |prev| prev.unwrap_or(0) + 1);

        assert_eq!(store.get(tenant_id, &"n"), Some(2));
    }
}
