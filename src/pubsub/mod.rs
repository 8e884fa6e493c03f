//! Partitioned-log collaborator interfaces.
//!
//! The broker itself is external; the engine consumes through
//! [`PubSubConsumer`] and re-emits winners through [`VersionTopicProducer`].
//! One consumer instance multiplexes all source regions: subscriptions are
//! keyed by `(region URL, topic, partition)` and polled records come back
//! tagged with the region they were read from.

pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::IngestionResult;
use crate::storage::chunking::ChunkedValueManifest;
use crate::types::{ConsumedRecord, LeaderMetadata, RecordKey, TopicPartition};

/// A polled record tagged with its source region.
#[derive(Debug, Clone)]
pub struct PolledRecord {
    pub region_url: String,
    pub record: ConsumedRecord,
}

/// Multi-region consumer over the partitioned log.
#[async_trait]
pub trait PubSubConsumer: Send + Sync {
    async fn subscribe(
        &self,
        region_url: &str,
        topic_partition: &TopicPartition,
        offset: i64,
    ) -> IngestionResult<()>;

    async fn unsubscribe(
        &self,
        region_url: &str,
        topic_partition: &TopicPartition,
    ) -> IngestionResult<()>;

    /// Drain available records across all subscriptions, waiting up to
    /// `timeout` when none are buffered.
    async fn poll(&self, timeout: Duration) -> IngestionResult<Vec<PolledRecord>>;

    /// Earliest offset whose record timestamp is at or after `timestamp_ms`.
    /// Bounded by a broker-side timeout; failures surface as
    /// [`crate::error::IngestionError::BrokerUnreachable`].
    async fn offset_for_time(
        &self,
        region_url: &str,
        topic_partition: &TopicPartition,
        timestamp_ms: i64,
    ) -> IngestionResult<i64>;

    async fn end_offset(
        &self,
        region_url: &str,
        topic_partition: &TopicPartition,
    ) -> IngestionResult<i64>;
}

/// Replication metadata attached to a produced put.
#[derive(Debug, Clone)]
pub struct PutMetadata {
    pub rmd_protocol_version: i32,
    /// Value-schema-id-prefixed RMD bytes.
    pub rmd_bytes: Bytes,
}

/// Replication metadata attached to a produced delete.
#[derive(Debug, Clone)]
pub struct DeleteMetadata {
    pub value_schema_id: i32,
    pub rmd_protocol_version: i32,
    pub rmd_bytes: Bytes,
}

/// A resolved put bound for the local version topic.
#[derive(Debug, Clone)]
pub struct VtPut {
    pub key: RecordKey,
    pub value: Bytes,
    pub value_schema_id: i32,
    pub logical_timestamp: i64,
    pub leader_metadata: LeaderMetadata,
    pub rmd: PutMetadata,
    /// Manifests of the value/RMD this record replaces, so the producer can
    /// schedule the dead chunks for cleanup.
    pub old_value_manifest: Option<ChunkedValueManifest>,
    pub old_rmd_manifest: Option<ChunkedValueManifest>,
}

/// A resolved tombstone bound for the local version topic.
#[derive(Debug, Clone)]
pub struct VtDelete {
    pub key: RecordKey,
    pub logical_timestamp: i64,
    pub leader_metadata: LeaderMetadata,
    pub rmd: DeleteMetadata,
    pub old_value_manifest: Option<ChunkedValueManifest>,
    pub old_rmd_manifest: Option<ChunkedValueManifest>,
}

/// Producer for the local version topic. Implementations are thread-safe;
/// per-partition FIFO is enforced above this interface by the per-partition
/// produce queue.
#[async_trait]
pub trait VersionTopicProducer: Send + Sync {
    /// Send a put; resolves with the assigned version-topic offset once the
    /// broker acknowledges it.
    async fn put(&self, partition: u32, put: VtPut) -> IngestionResult<i64>;

    /// Send a delete; resolves with the assigned offset on acknowledgement.
    async fn delete(&self, partition: u32, delete: VtDelete) -> IngestionResult<i64>;
}
