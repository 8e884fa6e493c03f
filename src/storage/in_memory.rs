//! In-memory storage engine.
//!
//! Backs the integration tests and single-process demos. Combined
//! value+RMD operations take the partition mutex once, giving the same
//! atomicity the contract promises from a real engine's write batch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use dashmap::DashMap;

use crate::error::IngestionResult;

use super::{StorageEngine, StoreVersionState};

#[derive(Debug, Default)]
struct PartitionData {
    values: HashMap<Vec<u8>, Bytes>,
    rmds: HashMap<Vec<u8>, Bytes>,
}

/// Hash-map backed [`StorageEngine`].
#[derive(Debug, Default)]
pub struct InMemoryStorageEngine {
    partitions: DashMap<u32, Arc<Mutex<PartitionData>>>,
    version_state: RwLock<Option<StoreVersionState>>,
}

impl InMemoryStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, partition: u32) -> Arc<Mutex<PartitionData>> {
        self.partitions
            .entry(partition)
            .or_insert_with(|| Arc::new(Mutex::new(PartitionData::default())))
            .clone()
    }

    /// Number of live (non-tombstoned) values in a partition.
    pub fn value_count(&self, partition: u32) -> usize {
        self.partition(partition).lock().unwrap().values.len()
    }
}

impl StorageEngine for InMemoryStorageEngine {
    fn put(&self, partition: u32, key: &[u8], value: &[u8]) -> IngestionResult<()> {
        let data = self.partition(partition);
        let mut data = data.lock().unwrap();
        data.values
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn put_with_rmd(
        &self,
        partition: u32,
        key: &[u8],
        value: &[u8],
        rmd_prefixed: &[u8],
    ) -> IngestionResult<()> {
        let data = self.partition(partition);
        let mut data = data.lock().unwrap();
        data.values
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
        data.rmds
            .insert(key.to_vec(), Bytes::copy_from_slice(rmd_prefixed));
        Ok(())
    }

    fn put_rmd(&self, partition: u32, key: &[u8], rmd_prefixed: &[u8]) -> IngestionResult<()> {
        let data = self.partition(partition);
        let mut data = data.lock().unwrap();
        data.rmds
            .insert(key.to_vec(), Bytes::copy_from_slice(rmd_prefixed));
        Ok(())
    }

    fn delete(&self, partition: u32, key: &[u8]) -> IngestionResult<()> {
        let data = self.partition(partition);
        let mut data = data.lock().unwrap();
        data.values.remove(key);
        data.rmds.remove(key);
        Ok(())
    }

    fn delete_with_rmd(
        &self,
        partition: u32,
        key: &[u8],
        rmd_prefixed: &[u8],
    ) -> IngestionResult<()> {
        let data = self.partition(partition);
        let mut data = data.lock().unwrap();
        data.values.remove(key);
        data.rmds
            .insert(key.to_vec(), Bytes::copy_from_slice(rmd_prefixed));
        Ok(())
    }

    fn get(&self, partition: u32, key: &[u8]) -> IngestionResult<Option<Bytes>> {
        let data = self.partition(partition);
        let data = data.lock().unwrap();
        Ok(data.values.get(key).cloned())
    }

    fn get_rmd(&self, partition: u32, key: &[u8]) -> IngestionResult<Option<Bytes>> {
        let data = self.partition(partition);
        let data = data.lock().unwrap();
        Ok(data.rmds.get(key).cloned())
    }

    fn get_version_state(&self) -> IngestionResult<Option<StoreVersionState>> {
        Ok(self.version_state.read().unwrap().clone())
    }

    fn put_version_state(&self, state: StoreVersionState) -> IngestionResult<()> {
        *self.version_state.write().unwrap() = Some(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let engine = InMemoryStorageEngine::new();
        engine.put(0, b"k", b"v").unwrap();
        assert_eq!(engine.get(0, b"k").unwrap().unwrap().as_ref(), b"v");
        engine.delete(0, b"k").unwrap();
        assert!(engine.get(0, b"k").unwrap().is_none());
    }

    #[test]
    fn combined_write_stores_both_columns() {
        let engine = InMemoryStorageEngine::new();
        engine.put_with_rmd(1, b"k", b"v", b"rmd").unwrap();
        assert_eq!(engine.get(1, b"k").unwrap().unwrap().as_ref(), b"v");
        assert_eq!(engine.get_rmd(1, b"k").unwrap().unwrap().as_ref(), b"rmd");
    }

    #[test]
    fn delete_with_rmd_keeps_tombstone_metadata() {
        let engine = InMemoryStorageEngine::new();
        engine.put_with_rmd(0, b"k", b"v", b"rmd1").unwrap();
        engine.delete_with_rmd(0, b"k", b"rmd2").unwrap();
        assert!(engine.get(0, b"k").unwrap().is_none());
        assert_eq!(engine.get_rmd(0, b"k").unwrap().unwrap().as_ref(), b"rmd2");
    }

    #[test]
    fn partitions_are_isolated() {
        let engine = InMemoryStorageEngine::new();
        engine.put(0, b"k", b"p0").unwrap();
        engine.put(1, b"k", b"p1").unwrap();
        assert_eq!(engine.get(0, b"k").unwrap().unwrap().as_ref(), b"p0");
        assert_eq!(engine.get(1, b"k").unwrap().unwrap().as_ref(), b"p1");
    }

    #[test]
    fn version_state_round_trip() {
        let engine = InMemoryStorageEngine::new();
        assert!(engine.get_version_state().unwrap().is_none());
        let state = StoreVersionState {
            chunked: true,
            start_of_push_timestamp_ms: 100,
            end_of_push_timestamp_ms: 200,
        };
        engine.put_version_state(state.clone()).unwrap();
        assert_eq!(engine.get_version_state().unwrap(), Some(state));
    }
}
