//! Tether store: the in-RAM object cache and the informer that keeps it current.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::{FxHashMap, FxHashSet};
use tether_core::{CacheError, ObjectCache, PrimaryKey, PrimaryObject};
use tokio::sync::watch;
use tracing::debug;

pub mod informer;

pub use informer::{apply_event, run_informer};

/// Mirror of the primary objects the watch has reported. No TTL, no size bound:
/// entries leave only through an explicit remove or a relist.
pub struct Cache {
    items: RwLock<FxHashMap<PrimaryKey, Arc<PrimaryObject>>>,
    synced: watch::Sender<bool>,
}

impl Default for Cache {
    fn default() -> Self { Self::new() }
}

impl Cache {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self { items: RwLock::new(FxHashMap::default()), synced }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, FxHashMap<PrimaryKey, Arc<PrimaryObject>>>, CacheError> {
        self.items.read().map_err(|_| CacheError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, FxHashMap<PrimaryKey, Arc<PrimaryObject>>>, CacheError> {
        self.items.write().map_err(|_| CacheError::Poisoned)
    }

    /// Swap in a full listing. Returns the keys whose entry was added, changed or dropped:
    /// listed keys first (in listing order), then removed keys sorted.
    pub fn replace(&self, objs: Vec<PrimaryObject>) -> Result<Vec<PrimaryKey>, CacheError> {
        let mut items = self.write()?;
        let mut next: FxHashMap<PrimaryKey, Arc<PrimaryObject>> = FxHashMap::default();
        let mut changed = Vec::new();
        for obj in objs {
            let key = obj.key();
            let same = items.get(&key).map(|prev| **prev == obj).unwrap_or(false);
            if !same && !next.contains_key(&key) { changed.push(key.clone()); }
            next.insert(key, Arc::new(obj));
        }
        let listed: FxHashSet<&PrimaryKey> = next.keys().collect();
        let mut gone: Vec<PrimaryKey> = items.keys().filter(|k| !listed.contains(k)).cloned().collect();
        gone.sort();
        debug!(listed = next.len(), changed = changed.len(), removed = gone.len(), "cache replaced");
        changed.extend(gone);
        *items = next;
        Ok(changed)
    }

    pub fn keys(&self) -> Result<Vec<PrimaryKey>, CacheError> {
        let mut keys: Vec<PrimaryKey> = self.read()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub fn len(&self) -> Result<usize, CacheError> { Ok(self.read()?.len()) }

    pub fn is_empty(&self) -> Result<bool, CacheError> { Ok(self.read()?.is_empty()) }

    pub fn mark_synced(&self) { self.synced.send_replace(true); }

    pub fn has_synced(&self) -> bool { *self.synced.borrow() }

    /// Resolve once the initial listing has been loaded.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

impl ObjectCache for Cache {
    fn upsert(&self, key: PrimaryKey, obj: PrimaryObject) -> Result<(), CacheError> {
        self.write()?.insert(key, Arc::new(obj));
        Ok(())
    }

    fn remove(&self, key: &PrimaryKey) -> Result<Option<Arc<PrimaryObject>>, CacheError> {
        Ok(self.write()?.remove(key))
    }

    fn get(&self, key: &PrimaryKey) -> Result<Option<Arc<PrimaryObject>>, CacheError> {
        Ok(self.read()?.get(key).cloned())
    }
}
