//! Named advisory locks keyed by entity id.
//!
//! The lifecycle engine takes the lock before applying a transition; admin
//! operations on the same entity take it before mutating.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct EntityLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, entity_id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for and hold the lock for `entity_id` until the guard drops.
    pub async fn acquire(&self, entity_id: &str) -> OwnedMutexGuard<()> {
        self.slot(entity_id).lock_owned().await
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(&self, entity_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(entity_id).try_lock_owned().ok()
    }

    /// Forget locks nobody is holding or waiting on.
    pub fn purge_idle(&self) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
