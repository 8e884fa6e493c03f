//! Ingestion engine configuration.
//!
//! One validated struct per store-version task. Build it with struct update
//! syntax over [`IngestionConfig::default`] and call
//! [`IngestionConfig::validate`] before handing it to the task; invalid
//! combinations are rejected up front rather than surfacing as runtime
//! surprises deep in the ingest loop.

use std::time::Duration;

use crate::constants::{
    DEFAULT_CHUNK_SIZE_BYTES, DEFAULT_LEADER_PROMOTION_IDLE_WINDOW, DEFAULT_OFFSET_LAG_THRESHOLD,
    DEFAULT_POLL_TIMEOUT, DEFAULT_PRODUCE_QUEUE_DEPTH, DEFAULT_REPAIR_MAX_ATTEMPTS,
    DEFAULT_REWIND_TIME_SECONDS,
};
use crate::error::{IngestionError, IngestionResult};

/// Where the rewind window anchors when the server computes the rewind start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferReplayPolicy {
    /// Rewind from the start-of-push timestamp.
    RewindFromSop,
    /// Rewind from the end-of-push timestamp.
    #[default]
    RewindFromEop,
}

/// Configuration for one active/active store-version ingestion task.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Store name; used for logging and metric labels.
    pub store_name: String,
    /// Store version number; the version topic is derived from it.
    pub version: i32,
    /// Broker URL of the local region.
    pub local_region_url: String,
    /// All region broker URLs, in region-id order.
    pub region_urls: Vec<String>,
    /// Number of partitions in the store-version.
    pub partition_count: u32,

    /// Whether the cluster participant message store is enabled.
    pub participant_message_store_enabled: bool,
    /// Shared consumer pool slots per broker cluster.
    pub server_consumer_pool_size_per_cluster: usize,
    /// Enables processing records of one partition in parallel (key-level
    /// ordering is still enforced by the lock manager).
    pub parallel_processing_enabled: bool,
    /// Worker count for parallel batch processing.
    pub parallel_processing_pool_size: usize,
    /// Dedicated consumer pool slots for leader replicas.
    pub consumer_pool_size_for_leader: usize,

    /// Per-store rewind window used with the server-decided sentinel.
    pub rewind_time_seconds: i64,
    /// Anchor for server-decided rewinds.
    pub buffer_replay_policy: BufferReplayPolicy,
    /// Lag threshold (records) to report a partition ready-to-serve.
    pub offset_lag_threshold_to_go_online: i64,

    /// Split threshold for oversized values.
    pub chunk_size_bytes: usize,
    /// Bound of the per-partition produce queue.
    pub produce_queue_depth: usize,
    /// Consumer poll timeout.
    pub poll_timeout: Duration,
    /// Local version-topic idle window required before leader promotion.
    pub leader_promotion_idle_window: Duration,
    /// Halt the partition on a poisoned record instead of skipping it.
    pub halt_on_poisoned_record: bool,
    /// Repair attempts before escalating to the region health alarm.
    pub repair_max_attempts: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        IngestionConfig {
            store_name: String::new(),
            version: 1,
            local_region_url: String::new(),
            region_urls: Vec::new(),
            partition_count: 1,
            participant_message_store_enabled: false,
            server_consumer_pool_size_per_cluster: 4,
            parallel_processing_enabled: false,
            parallel_processing_pool_size: 1,
            consumer_pool_size_for_leader: 4,
            rewind_time_seconds: DEFAULT_REWIND_TIME_SECONDS,
            buffer_replay_policy: BufferReplayPolicy::default(),
            offset_lag_threshold_to_go_online: DEFAULT_OFFSET_LAG_THRESHOLD,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            produce_queue_depth: DEFAULT_PRODUCE_QUEUE_DEPTH,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            leader_promotion_idle_window: DEFAULT_LEADER_PROMOTION_IDLE_WINDOW,
            halt_on_poisoned_record: false,
            repair_max_attempts: DEFAULT_REPAIR_MAX_ATTEMPTS,
        }
    }
}

impl IngestionConfig {
    /// Name of the local version topic for this store-version.
    pub fn version_topic_name(&self) -> String {
        format!("{}_v{}", self.store_name, self.version)
    }

    /// Name of the per-store real-time topic.
    pub fn real_time_topic_name(&self) -> String {
        format!("{}_rt", self.store_name)
    }

    /// Consumer slots available to leader consumption, honoring the dedicated
    /// leader pool when configured.
    pub fn leader_consumer_pool_slots(&self) -> usize {
        if self.consumer_pool_size_for_leader > 0 {
            self.consumer_pool_size_for_leader
        } else {
            self.server_consumer_pool_size_per_cluster
        }
    }

    /// Effective parallelism multiplier for the key-lock pool sizing.
    pub fn parallel_processing_multiplier(&self) -> usize {
        if self.parallel_processing_enabled {
            self.parallel_processing_pool_size.max(1)
        } else {
            1
        }
    }

    pub fn validate(&self) -> IngestionResult<()> {
        if self.store_name.is_empty() {
            return Err(IngestionError::Config("store_name must not be empty".into()));
        }
        if self.version <= 0 {
            return Err(IngestionError::Config(format!(
                "version must be positive, got {}",
                self.version
            )));
        }
        if self.region_urls.is_empty() {
            return Err(IngestionError::Config("region_urls must not be empty".into()));
        }
        if !self.region_urls.contains(&self.local_region_url) {
            return Err(IngestionError::Config(format!(
                "local_region_url {} is not one of the configured regions",
                self.local_region_url
            )));
        }
        if self.partition_count == 0 {
            return Err(IngestionError::Config("partition_count must be positive".into()));
        }
        if self.chunk_size_bytes == 0 {
            return Err(IngestionError::Config("chunk_size_bytes must be positive".into()));
        }
        if self.produce_queue_depth == 0 {
            return Err(IngestionError::Config(
                "produce_queue_depth must be positive".into(),
            ));
        }
        if self.parallel_processing_enabled && self.parallel_processing_pool_size == 0 {
            return Err(IngestionError::Config(
                "parallel_processing_pool_size must be positive when parallel processing is enabled"
                    .into(),
            ));
        }
        if self.repair_max_attempts == 0 {
            return Err(IngestionError::Config(
                "repair_max_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}
