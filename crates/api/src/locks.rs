//! Per-tenant mutual exclusion for lifecycle operations (single process).

use std::sync::{Arc, Mutex};

use longhall_core::TenantId;
use rustc_hash::FxHashMap;
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct TenantLocks {
    inner: Mutex<FxHashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TenantLocks {
    pub fn new() -> Self { Self::default() }

    /// Wait for exclusive access to `tenant`. Held until the guard drops.
    pub async fn lock(&self, tenant: &TenantId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            // Entries nobody else references are idle; drop them so the map
            // tracks only tenants with work in flight.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(tenant.clone()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Tenants currently holding or waiting on a lock.
    pub fn active(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.values().filter(|m| Arc::strong_count(m) > 1).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_tenant_is_serialized() {
        let locks = Arc::new(TenantLocks::new());
        let t = TenantId::parse("acme").unwrap();
        let g = locks.lock(&t).await;
        let l2 = locks.clone();
        let t2 = t.clone();
        let waiter = tokio::spawn(async move {
            let _g = l2.lock(&t2).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(g);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn different_tenants_do_not_block() {
        let locks = TenantLocks::new();
        let _a = locks.lock(&TenantId::parse("a").unwrap()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&TenantId::parse("b").unwrap())).await;
        assert!(b.is_ok());
        assert_eq!(locks.active(), 2);
    }
}
