//! Key-level lock manager.
//!
//! A single per-partition mutex would serialize every key in the partition;
//! a lock per key would grow without bound. The pool strikes the balance:
//! a fixed stripe array indexed by `hash(key) % pool_size`, so two records
//! for the same key always contend on the same stripe while memory stays
//! bounded. Fairness is not required; per-key critical sections are short.
//!
//! Guards are owned, so the holder may cross await points (storage reads,
//! the view fanout). Never acquire a key lock while holding a partition
//! mutex; the ingest loop takes them strictly key-lock-first.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::RecordKey;

/// Striped pool of key-level locks.
#[derive(Debug)]
pub struct KeyLevelLockManager {
    stripes: Vec<Arc<Mutex<()>>>,
}

/// Exclusive hold on a key's stripe; dropped to release.
#[derive(Debug)]
pub struct KeyLockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl KeyLevelLockManager {
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        KeyLevelLockManager {
            stripes: (0..pool_size).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    /// Pool size bounding concurrent key holders: one stripe per consumer
    /// slot that can be processing this store-version, across regions and
    /// parallel workers, plus one.
    pub fn max_pool_size(
        partition_count: u32,
        leader_consumer_pool_slots: usize,
        region_count: usize,
        parallelism: usize,
    ) -> usize {
        (partition_count as usize).min(leader_consumer_pool_slots) * region_count * parallelism + 1
    }

    pub fn pool_size(&self) -> usize {
        self.stripes.len()
    }

    /// Block until the key's stripe is exclusively held.
    pub async fn acquire(&self, key: &RecordKey) -> KeyLockGuard {
        let stripe = self.stripes[self.stripe_index(key)].clone();
        KeyLockGuard {
            _guard: stripe.lock_owned().await,
        }
    }

    fn stripe_index(&self, key: &RecordKey) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }
}
