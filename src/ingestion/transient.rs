//! Per-partition transient record cache.
//!
//! Version-topic produces are asynchronous: between the resolver's decision
//! and the broker's acknowledgement, the storage engine is stale. The cache
//! bridges that window so a second record for the same key inside the same
//! poll batch resolves against the just-applied state.
//!
//! Coherency contract: a hit MUST be used instead of the storage engine for
//! the current resolution; a miss means the storage engine is authoritative.
//! Entries are only touched under the owning key's lock, and are evicted
//! once their produce position is acknowledged by the local version topic.

use std::collections::HashMap;

use bytes::Bytes;

use crate::rmd::ReplicationMetadata;
use crate::storage::chunking::ChunkedValueManifest;
use crate::types::RecordKey;

/// The resolved state of one key awaiting version-topic acknowledgement.
#[derive(Debug, Clone)]
pub struct TransientRecord {
    /// `None` is a tombstone.
    pub value: Option<Bytes>,
    pub value_schema_id: i32,
    pub rmd: ReplicationMetadata,
    pub value_manifest: Option<ChunkedValueManifest>,
    pub rmd_manifest: Option<ChunkedValueManifest>,
    /// Per-partition produce sequence this state was enqueued under.
    pub produced_position: i64,
}

/// Map from key to its pending resolved state.
#[derive(Debug, Default)]
pub struct TransientRecordCache {
    records: HashMap<RecordKey, TransientRecord>,
}

impl TransientRecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RecordKey) -> Option<&TransientRecord> {
        self.records.get(key)
    }

    pub fn put(&mut self, key: RecordKey, record: TransientRecord) {
        self.records.insert(key, record);
    }

    /// Drop every entry whose produce position is at or below `position`.
    /// Called when the version topic acknowledges up to `position`.
    pub fn evict_up_to(&mut self, position: i64) {
        self.records
            .retain(|_, record| record.produced_position > position);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmd::ReplicationMetadata;

    fn record(value: &[u8], position: i64) -> TransientRecord {
        TransientRecord {
            value: Some(Bytes::copy_from_slice(value)),
            value_schema_id: 1,
            rmd: ReplicationMetadata::record_level(1, vec![0, 0]),
            value_manifest: None,
            rmd_manifest: None,
            produced_position: position,
        }
    }

    #[test]
    fn get_returns_latest_put() {
        let mut cache = TransientRecordCache::new();
        let key = RecordKey::wrap(b"k".to_vec());
        cache.put(key.clone(), record(b"v1", 0));
        cache.put(key.clone(), record(b"v2", 1));
        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.value.as_ref().unwrap().as_ref(), b"v2");
        assert_eq!(hit.produced_position, 1);
    }

    #[test]
    fn evict_up_to_is_inclusive() {
        let mut cache = TransientRecordCache::new();
        cache.put(RecordKey::wrap(b"a".to_vec()), record(b"1", 0));
        cache.put(RecordKey::wrap(b"b".to_vec()), record(b"2", 1));
        cache.put(RecordKey::wrap(b"c".to_vec()), record(b"3", 2));

        cache.evict_up_to(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&RecordKey::wrap(b"c".to_vec())).is_some());
    }

    #[test]
    fn newer_entry_survives_eviction_of_older_position() {
        let mut cache = TransientRecordCache::new();
        let key = RecordKey::wrap(b"k".to_vec());
        cache.put(key.clone(), record(b"old", 0));
        // Same key re-resolved and re-enqueued before the first ack landed.
        cache.put(key.clone(), record(b"new", 5));
        cache.evict_up_to(0);
        assert_eq!(cache.get(&key).unwrap().value.as_ref().unwrap().as_ref(), b"new");
    }

    #[test]
    fn tombstones_are_cacheable() {
        let mut cache = TransientRecordCache::new();
        let key = RecordKey::wrap(b"k".to_vec());
        cache.put(
            key.clone(),
            TransientRecord {
                value: None,
                value_schema_id: 1,
                rmd: ReplicationMetadata::record_level(9, vec![1]),
                value_manifest: None,
                rmd_manifest: None,
                produced_position: 3,
            },
        );
        // A hit with a None value means "deleted", distinct from a miss.
        assert!(cache.get(&key).unwrap().value.is_none());
    }
}
