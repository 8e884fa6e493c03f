//! Ingestion error taxonomy.
//!
//! Every failure in the ingestion engine is classified along one axis:
//! how far its blast radius reaches.
//!
//! | Severity            | Handling                                              |
//! |---------------------|-------------------------------------------------------|
//! | `Transient`         | retried / routed to the repair queue, never raised    |
//! | `Recoverable`       | one refresh-and-retry, then escalates                 |
//! | `PoisonedRecord`    | metric + poison counter, partition proceeds by default|
//! | `FatalToPartition`  | partition marked ERRORed, reported to control plane   |
//! | `FatalToVersion`    | the whole store-version ingestion task aborts         |
//!
//! The write path is fail-fast; reads may be best-effort where stale data is
//! acceptable (stats, lag probes). One deliberate demotion exists: a storage
//! failure for a partition that was concurrently unsubscribed is logged and
//! swallowed, since the partition owner no longer exists to act on it.

use thiserror::Error;

/// Result alias used throughout the ingestion engine.
pub type IngestionResult<T> = Result<T, IngestionError>;

/// Blast radius of an [`IngestionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Self-healing; never raised past the ingestion task.
    Transient,
    /// One refresh-and-retry is warranted before escalating.
    Recoverable,
    /// The record is unprocessable; the partition may proceed.
    PoisonedRecord,
    /// The partition must stop ingesting and report ERROR.
    FatalToPartition,
    /// The store-version task must abort.
    FatalToVersion,
}

impl ErrorSeverity {
    /// Label used on the `decision_errors_total` metric.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            ErrorSeverity::Transient => "transient",
            ErrorSeverity::Recoverable => "recoverable",
            ErrorSeverity::PoisonedRecord => "poisoned_record",
            ErrorSeverity::FatalToPartition => "fatal_partition",
            ErrorSeverity::FatalToVersion => "fatal_version",
        }
    }
}

/// Errors surfaced by the active/active ingestion engine.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Replication metadata could not be decoded (truncation, bad layout tag,
    /// layout not matching the registered schema).
    #[error("malformed replication metadata: {0}")]
    MalformedRmd(String),

    /// The value schema id has no registered RMD layout, even after a
    /// registry refresh.
    #[error("unknown RMD schema for value schema id {value_schema_id}")]
    UnknownRmdSchema { value_schema_id: i32 },

    /// A partial-update payload cannot be applied to the stored value schema.
    #[error("update schema {update_schema_id} incompatible with value schema {value_schema_id}")]
    SchemaIncompatible {
        update_schema_id: i32,
        value_schema_id: i32,
    },

    /// The storage engine failed an operation.
    #[error("storage failure on partition {partition}: {message}")]
    StorageFailure { partition: u32, message: String },

    /// A chunked-value manifest references a chunk that is absent.
    #[error("missing chunk {chunk_index} of {chunk_count} for partition {partition}")]
    ChunkMissing {
        partition: u32,
        chunk_index: usize,
        chunk_count: usize,
    },

    /// Reassembled chunks failed the manifest size or checksum check.
    #[error("corrupt chunked value on partition {partition}: {message}")]
    ChunkCorrupt { partition: u32, message: String },

    /// The post-merge offset vector sum decreased.
    #[error("offset vector regression: {before} -> {after}")]
    OffsetRegression { before: u128, after: u128 },

    /// A post-merge RMD timestamp decreased.
    #[error("timestamp regression on field {field}: {before} -> {after}")]
    TimestampRegression { field: usize, before: u64, after: u64 },

    /// A broker in some region could not be reached (or timed out).
    #[error("broker unreachable in region {region}: {message}")]
    BrokerUnreachable { region: String, message: String },

    /// Too few regions could resolve rewind offsets during a topic switch.
    #[error("topic switch aborted: {unreachable} of {total} regions unreachable")]
    TopicSwitchQuorumFailure { unreachable: usize, total: usize },

    /// A broker URL is not present in the injected region map.
    #[error("region URL {url} is not in the region map")]
    UnknownRegion { url: String },

    /// A record or storage operation violates a structural invariant
    /// (e.g. both value and RMD payloads empty).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An operation required a leader but the partition is not one.
    #[error("partition {partition} is not leader (state: {state})")]
    NotLeader { partition: u32, state: &'static str },

    /// The partition is not subscribed on this task.
    #[error("partition {partition} is not subscribed")]
    PartitionNotSubscribed { partition: u32 },

    /// The version-topic producer failed a send.
    #[error("producer failure on partition {partition}: {message}")]
    ProducerFailure { partition: u32, message: String },

    /// Bad configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl IngestionError {
    /// Classify this error's blast radius.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            IngestionError::BrokerUnreachable { .. } => ErrorSeverity::Transient,
            IngestionError::UnknownRmdSchema { .. } => ErrorSeverity::FatalToVersion,
            IngestionError::MalformedRmd(_) => ErrorSeverity::FatalToVersion,
            IngestionError::SchemaIncompatible { .. } => ErrorSeverity::PoisonedRecord,
            IngestionError::StorageFailure { .. }
            | IngestionError::ChunkMissing { .. }
            | IngestionError::ChunkCorrupt { .. }
            | IngestionError::OffsetRegression { .. }
            | IngestionError::TimestampRegression { .. }
            | IngestionError::ProducerFailure { .. }
            | IngestionError::TopicSwitchQuorumFailure { .. } => ErrorSeverity::FatalToPartition,
            IngestionError::UnknownRegion { .. }
            | IngestionError::InvalidOperation(_)
            | IngestionError::NotLeader { .. }
            | IngestionError::PartitionNotSubscribed { .. }
            | IngestionError::Config(_) => ErrorSeverity::FatalToPartition,
        }
    }

    /// True if the error should never be raised past the ingestion task.
    #[inline]
    pub fn is_transient(&self) -> bool {
        self.severity() == ErrorSeverity::Transient
    }

    /// True if the record should be counted as poisoned and skipped.
    #[inline]
    pub fn is_poison(&self) -> bool {
        self.severity() == ErrorSeverity::PoisonedRecord
    }

    /// True if the whole store-version task must abort.
    #[inline]
    pub fn is_fatal_to_version(&self) -> bool {
        self.severity() == ErrorSeverity::FatalToVersion
    }
}
