use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use atelier_tenancy::TenantId;

/// Identity of a lockable row: table, tenant, row id.
pub type RowKey = (&'static str, TenantId, Uuid);

/// Pessimistic row-level locks, the in-process analogue of
/// `SELECT ... FOR UPDATE`. Hot financial rows (a task being completed,
/// a wallet being drained) are locked here before their state is read.
#[derive(Default)]
pub struct RowLocks {
    inner: StdMutex<HashMap<RowKey, Arc<AsyncMutex<()>>>>,
}

/// Held row lock; releases on drop.
pub struct RowGuard {
    _guard: OwnedMutexGuard<()>,
}

impl RowLocks {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entry(&self, key: RowKey) -> Arc<AsyncMutex<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.entry(key).or_default().clone()
    }

    pub async fn lock(&self, key: RowKey) -> RowGuard {
        let mutex = self.entry(key);
        RowGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    /// Locks a set of rows in deterministic (sorted) order so that two
    /// transactions touching overlapping sets can never deadlock.
    pub async fn lock_many(&self, mut keys: Vec<RowKey>) -> Vec<RowGuard> {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }
}

/// Coarse named locks serializing singleton background work across
/// replicas: the outbox pump, a tenant's payroll run. `try_acquire`
/// never waits; a second invocation observes the held lock and returns.
#[derive(Default)]
pub struct AdvisoryLocks {
    held: StdMutex<HashSet<String>>,
    released: Notify,
}

pub struct AdvisoryGuard {
    registry: Arc<AdvisoryLocks>,
    key: String,
}

impl AdvisoryLocks {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquires the named lock if nobody holds it, otherwise `None`.
    pub fn try_acquire(self: &Arc<Self>, key: impl Into<String>) -> Option<AdvisoryGuard> {
        let key = key.into();
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if held.insert(key.clone()) {
            Some(AdvisoryGuard {
                registry: Arc::clone(self),
                key,
            })
        } else {
            None
        }
    }

    /// Waits until the named lock can be acquired.
    pub async fn acquire(self: &Arc<Self>, key: impl Into<String>) -> AdvisoryGuard {
        let key = key.into();
        loop {
            let waiter = self.released.notified();
            if let Some(guard) = self.try_acquire(key.clone()) {
                return guard;
            }
            waiter.await;
        }
    }

    #[must_use]
    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

impl Drop for AdvisoryGuard {
    fn drop(&mut self) {
        let mut held = self
            .registry
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
        drop(held);
        self.registry.released.notify_waiters();
    }
}
