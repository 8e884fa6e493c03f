//! Storage-engine interface and helpers.
//!
//! The persistent key-value store is an external collaborator; the engine
//! only relies on the narrow contract below. Two columns exist per
//! partition: values and replication metadata. Combined operations
//! (`put_with_rmd`, `delete_with_rmd`) are atomic at this interface: value
//! and RMD are persisted together or not at all.

pub mod chunking;
pub mod in_memory;

pub use in_memory::InMemoryStorageEngine;

use bytes::Bytes;

use crate::error::IngestionResult;

/// Durable per-store-version metadata, written when the first start-of-push
/// control message is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreVersionState {
    /// Whether values in this version may be chunked.
    pub chunked: bool,
    pub start_of_push_timestamp_ms: i64,
    pub end_of_push_timestamp_ms: i64,
}

/// Contract the ingestion engine requires from the local key-value store.
///
/// Implementations must be thread-safe per partition; per-key serialization
/// is provided above this interface by the key-level lock manager.
pub trait StorageEngine: Send + Sync {
    fn put(&self, partition: u32, key: &[u8], value: &[u8]) -> IngestionResult<()>;

    /// Persist value and schema-id-prefixed RMD together.
    fn put_with_rmd(
        &self,
        partition: u32,
        key: &[u8],
        value: &[u8],
        rmd_prefixed: &[u8],
    ) -> IngestionResult<()>;

    /// Persist only the RMD column (used for chunked-RMD sub-records).
    fn put_rmd(&self, partition: u32, key: &[u8], rmd_prefixed: &[u8]) -> IngestionResult<()>;

    fn delete(&self, partition: u32, key: &[u8]) -> IngestionResult<()>;

    /// Remove the value while persisting a tombstone RMD.
    fn delete_with_rmd(&self, partition: u32, key: &[u8], rmd_prefixed: &[u8])
        -> IngestionResult<()>;

    fn get(&self, partition: u32, key: &[u8]) -> IngestionResult<Option<Bytes>>;

    fn get_rmd(&self, partition: u32, key: &[u8]) -> IngestionResult<Option<Bytes>>;

    fn get_version_state(&self) -> IngestionResult<Option<StoreVersionState>>;

    fn put_version_state(&self, state: StoreVersionState) -> IngestionResult<()>;
}

/// Value compression hook. The ingest loop recompresses winning values
/// before producing them; codecs are a collaborator, so the engine only
/// carries the seam plus a no-op implementation.
pub trait Compressor: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn compress(&self, value: Bytes) -> IngestionResult<Bytes>;
    fn decompress(&self, value: Bytes) -> IngestionResult<Bytes>;
}

/// Pass-through compressor for stores without compression.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCompressor;

impl Compressor for NoOpCompressor {
    fn is_enabled(&self) -> bool {
        false
    }

    fn compress(&self, value: Bytes) -> IngestionResult<Bytes> {
        Ok(value)
    }

    fn decompress(&self, value: Bytes) -> IngestionResult<Bytes> {
        Ok(value)
    }
}
