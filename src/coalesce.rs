//! Collapsing of concurrent misses for the same resource.
//!
//! The first request to miss on a provisional key becomes the leader and
//! forwards to the origin. Requests that miss while the leader is in flight
//! wait for the leader's guard to drop (after its store completes), then look
//! the store up again before forwarding themselves.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::key::CacheKey;

type LockTable = Arc<DashMap<CacheKey, Arc<Mutex<()>>>>;

#[derive(Clone, Default)]
pub(crate) struct MissCoalescer {
    locks: LockTable,
}

pub(crate) enum Turn {
    Leader(LeaderGuard),
    Follower(Arc<Mutex<()>>),
}

/// Held by the leader until its origin round trip and store finish.
pub(crate) struct LeaderGuard {
    key: CacheKey,
    locks: LockTable,
    lock: Arc<Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

impl MissCoalescer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn acquire(&self, key: CacheKey) -> Turn {
        let lock = Arc::new(Mutex::new(()));
        let guard = lock.clone().lock_owned().await;
        match self.locks.entry(key) {
            Entry::Occupied(entry) => Turn::Follower(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(lock.clone());
                Turn::Leader(LeaderGuard {
                    key,
                    locks: self.locks.clone(),
                    lock,
                    _guard: guard,
                })
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.locks.len()
    }
}

/// Waits until the current leader for this key has finished.
pub(crate) async fn wait_for_leader(lock: Arc<Mutex<()>>) {
    drop(lock.lock_owned().await);
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.locks
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, &self.lock));
    }
}
