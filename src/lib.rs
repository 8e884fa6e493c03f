//! # Estuary
//!
//! Active/active ingestion engine for a partitioned derived-data platform:
//! the subsystem that lets multiple regions accept writes concurrently and
//! still converge every replica to the same state.
//!
//! Each store-version runs one [`ingestion::ActiveActiveIngestionTask`]. The
//! task consumes raw writes from per-region real-time topics, resolves each
//! record against the existing value and its replication metadata with a
//! deterministic last-writer-wins [`merge::MergeConflictResolver`], persists
//! the winner, and re-emits it into the local version topic so downstream
//! followers converge.
//!
//! ## Architecture
//!
//! ```text
//!  region A RT ─┐                       ┌─> view streams
//!  region B RT ─┼─> poll → key lock →   │
//!  region C RT ─┘   resolve (RMD LWW) ──┼─> local storage
//!                   └> transient cache  └─> local version topic ─> followers
//! ```
//!
//! - [`rmd`]: replication metadata (timestamps + per-region offset vector)
//!   and its value-schema-id-prefixed binary codec
//! - [`merge`]: the pure conflict resolver
//! - [`storage`]: the storage-engine contract and the chunked-value adapter
//! - [`pubsub`]: broker consumer / version-topic producer contracts
//! - [`ingestion`]: locks, transient cache, partition state, view fanout,
//!   repair service, and the task itself
//!
//! The partitioned log, the persistent KV store, and the schema registry are
//! collaborators behind narrow traits; in-memory implementations ship in-tree
//! for tests and experiments.

pub mod config;
pub mod constants;
pub mod error;
pub mod ingestion;
pub mod merge;
pub mod metrics;
pub mod pubsub;
pub mod rmd;
pub mod schema;
pub mod storage;
pub mod types;

pub use config::{BufferReplayPolicy, IngestionConfig};
pub use error::{ErrorSeverity, IngestionError, IngestionResult};

/// Commonly used types for embedding the engine.
pub mod prelude {
    pub use crate::config::{BufferReplayPolicy, IngestionConfig};
    pub use crate::error::{ErrorSeverity, IngestionError, IngestionResult};
    pub use crate::ingestion::{
        ActiveActiveIngestionTask, IngestionDeps, RemoteIngestionRepairService, ViewRecord,
        ViewWriter, ViewWriterFanout,
    };
    pub use crate::merge::{AppliedMerge, MergeConflictResolver, MergeResult};
    pub use crate::pubsub::{PubSubConsumer, VersionTopicProducer};
    pub use crate::rmd::{ReplicationMetadata, RmdSerde, RmdTimestamp, RmdWithSchemaId};
    pub use crate::schema::{RmdLayout, SchemaCache, SchemaRepository, StaticSchemaRepository};
    pub use crate::storage::{
        chunking::ChunkingAdapter, Compressor, InMemoryStorageEngine, NoOpCompressor,
        StorageEngine, StoreVersionState,
    };
    pub use crate::types::{
        ConsumedRecord, Operation, RecordKey, RegionMap, ReplicaRole, Topic, TopicPartition,
        TopicSwitch,
    };
}
