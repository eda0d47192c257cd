use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use super::{CacheEntry, CacheStore};
use crate::error::CacheError;
use crate::key::CacheKey;

/// A process-local [`CacheStore`] backed by a single lock-guarded table.
///
/// The store is cheap to clone and every clone shares the same table. Each
/// instance is independent of every other, so tests and separate caches in
/// one process never interfere. The lock is held only for in-memory map
/// updates, never across I/O or an `.await`.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    table: Arc<RwLock<Table>>,
    capacity: Option<usize>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<CacheKey, Arc<CacheEntry>>,
    /// Provisional key -> full keys of every stored variant.
    variants: HashMap<CacheKey, Vec<CacheKey>>,
    /// Every entry ordered by expiry, soonest first, for eviction.
    expiry: BTreeSet<(SystemTime, CacheKey)>,
}

impl InMemoryStore {
    /// Creates an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding at most `max_entries` entries. Inserting a new
    /// key into a full store evicts the entry closest to expiring.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            table: Arc::default(),
            capacity: Some(max_entries.max(1)),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Table>, CacheError> {
        self.table.read().map_err(|_| CacheError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Table>, CacheError> {
        self.table.write().map_err(|_| CacheError::Poisoned)
    }
}

impl Table {
    fn insert(&mut self, entry: Arc<CacheEntry>, capacity: Option<usize>) {
        let key = entry.key;
        let provisional = entry.provisional_key;

        if let Some(capacity) = capacity {
            if !self.entries.contains_key(&key) && self.entries.len() >= capacity {
                self.evict_soonest_expiring();
            }
        }

        let expires_at = entry.expires_at;
        if let Some(replaced) = self.entries.insert(key, entry) {
            self.expiry.remove(&(replaced.expires_at, key));
        }
        self.expiry.insert((expires_at, key));
        let keys = self.variants.entry(provisional).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        let Some(removed) = self.entries.remove(key) else {
            return;
        };
        self.expiry.remove(&(removed.expires_at, *key));
        if let Some(keys) = self.variants.get_mut(&removed.provisional_key) {
            keys.retain(|candidate| candidate != key);
            if keys.is_empty() {
                self.variants.remove(&removed.provisional_key);
            }
        }
    }

    fn evict_soonest_expiring(&mut self) {
        if let Some(&(_, victim)) = self.expiry.first() {
            self.remove(&victim);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.variants.clear();
        self.expiry.clear();
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        entry.validate(SystemTime::now())?;
        let entry = Arc::new(entry);
        self.write()?.insert(entry, self.capacity);
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<CacheEntry>>, CacheError> {
        Ok(self.read()?.entries.get(key).cloned())
    }

    async fn has(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.read()?.entries.contains_key(key))
    }

    async fn variants(&self, provisional: &CacheKey) -> Result<Vec<Arc<CacheEntry>>, CacheError> {
        let table = self.read()?;
        Ok(table
            .variants
            .get(provisional)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| table.entries.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn purge_item(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.write()?.remove(key);
        Ok(())
    }

    async fn purge(&self) -> Result<(), CacheError> {
        self.write()?.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.read()?.entries.len())
    }
}
