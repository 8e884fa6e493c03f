//! Per-partition consumption state.
//!
//! One instance per subscribed partition, mutated only by the task driving
//! that partition. Stats readers take cloned snapshots rather than poking at
//! live state. The produce tracker is shared with the partition's produce
//! drain so a leader can wait for in-flight version-topic sends before a
//! topic switch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

use crate::constants::LOWEST_OFFSET;
use crate::types::{RecordKey, ReplicaRole, Topic, TopicSwitch};

use super::transient::{TransientRecord, TransientRecordCache};

/// Counts in-flight version-topic produces for one partition.
#[derive(Debug, Default)]
pub struct ProduceTracker {
    in_flight: AtomicU64,
    drained: Notify,
}

impl ProduceTracker {
    pub fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn complete(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until every produce enqueued so far has completed.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Read-only offset snapshot for stats and lag probes.
#[derive(Debug, Clone)]
pub struct OffsetSnapshot {
    pub upstream_rt: HashMap<String, i64>,
    pub local_vt: i64,
}

/// Mutable state of one partition's consumption.
pub struct PartitionConsumptionState {
    partition: u32,
    role: ReplicaRole,
    /// The topic the leader currently feeds from (the version topic until a
    /// topic switch points it at regional real-time topics).
    source_topic: Topic,
    topic_switch: Option<TopicSwitch>,

    /// Highest real-time offset fully processed per region (checkpointed).
    latest_processed_upstream_rt: HashMap<String, i64>,
    /// Highest real-time offset consumed per region (may run ahead of
    /// processing; used for lag measurement).
    leader_consumed_upstream_rt: HashMap<String, i64>,
    latest_processed_local_vt: i64,

    start_of_push_timestamp_ms: i64,
    end_of_push_timestamp_ms: i64,
    eop_received: bool,
    deferred_write: bool,
    consume_remotely: bool,
    lag_caught_up: bool,
    subscribed: bool,
    errored: bool,

    last_vt_activity: Instant,
    next_produce_position: i64,
    produce_tracker: Arc<ProduceTracker>,
    transient: TransientRecordCache,
}

impl PartitionConsumptionState {
    pub fn new(partition: u32, version_topic: Topic) -> Self {
        PartitionConsumptionState {
            partition,
            role: ReplicaRole::Follower,
            source_topic: version_topic,
            topic_switch: None,
            latest_processed_upstream_rt: HashMap::new(),
            leader_consumed_upstream_rt: HashMap::new(),
            latest_processed_local_vt: LOWEST_OFFSET,
            start_of_push_timestamp_ms: 0,
            end_of_push_timestamp_ms: 0,
            eop_received: false,
            deferred_write: false,
            consume_remotely: false,
            lag_caught_up: false,
            subscribed: true,
            errored: false,
            last_vt_activity: Instant::now(),
            next_produce_position: 0,
            produce_tracker: Arc::new(ProduceTracker::default()),
            transient: TransientRecordCache::new(),
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn role(&self) -> ReplicaRole {
        self.role
    }

    pub fn set_role(&mut self, role: ReplicaRole) {
        debug!(
            partition = self.partition,
            from = self.role.as_str(),
            to = role.as_str(),
            "replica role transition"
        );
        self.role = role;
    }

    pub fn is_leader(&self) -> bool {
        self.role == ReplicaRole::Leader
    }

    pub fn source_topic(&self) -> &Topic {
        &self.source_topic
    }

    pub fn set_source_topic(&mut self, topic: Topic) {
        self.source_topic = topic;
    }

    pub fn topic_switch(&self) -> Option<&TopicSwitch> {
        self.topic_switch.as_ref()
    }

    pub fn set_topic_switch(&mut self, topic_switch: TopicSwitch) {
        self.topic_switch = Some(topic_switch);
    }

    // ------------------------------------------------------------------
    // Offsets
    // ------------------------------------------------------------------

    /// Checkpointed upstream offset for a region, [`LOWEST_OFFSET`] when
    /// nothing has been processed from it yet.
    pub fn latest_processed_upstream_rt_offset(&self, region_url: &str) -> i64 {
        self.latest_processed_upstream_rt
            .get(region_url)
            .copied()
            .unwrap_or(LOWEST_OFFSET)
    }

    /// Advance a region's processed offset. Offsets are monotonically
    /// non-decreasing between checkpoints; stale updates are dropped.
    pub fn update_latest_processed_upstream_rt_offset(&mut self, region_url: &str, offset: i64) {
        let current = self.latest_processed_upstream_rt_offset(region_url);
        if offset < current {
            debug!(
                partition = self.partition,
                region = region_url,
                current,
                offset,
                "dropping stale upstream offset update"
            );
            return;
        }
        self.latest_processed_upstream_rt
            .insert(region_url.to_string(), offset);
    }

    pub fn leader_consumed_upstream_rt_offset(&self, region_url: &str) -> i64 {
        self.leader_consumed_upstream_rt
            .get(region_url)
            .copied()
            .unwrap_or(LOWEST_OFFSET)
    }

    pub fn update_leader_consumed_upstream_rt_offset(&mut self, region_url: &str, offset: i64) {
        let entry = self
            .leader_consumed_upstream_rt
            .entry(region_url.to_string())
            .or_insert(LOWEST_OFFSET);
        if offset > *entry {
            *entry = offset;
        }
    }

    pub fn latest_processed_local_vt_offset(&self) -> i64 {
        self.latest_processed_local_vt
    }

    pub fn update_latest_processed_local_vt_offset(&mut self, offset: i64) {
        if offset > self.latest_processed_local_vt {
            self.latest_processed_local_vt = offset;
        }
    }

    pub fn offset_snapshot(&self) -> OffsetSnapshot {
        OffsetSnapshot {
            upstream_rt: self.latest_processed_upstream_rt.clone(),
            local_vt: self.latest_processed_local_vt,
        }
    }

    // ------------------------------------------------------------------
    // Push lifecycle
    // ------------------------------------------------------------------

    pub fn on_start_of_push(&mut self, timestamp_ms: i64) {
        self.start_of_push_timestamp_ms = timestamp_ms;
        self.deferred_write = true;
    }

    pub fn on_end_of_push(&mut self, timestamp_ms: i64) {
        self.end_of_push_timestamp_ms = timestamp_ms;
        self.eop_received = true;
        self.deferred_write = false;
    }

    pub fn is_end_of_push_received(&self) -> bool {
        self.eop_received
    }

    pub fn start_of_push_timestamp_ms(&self) -> i64 {
        self.start_of_push_timestamp_ms
    }

    pub fn end_of_push_timestamp_ms(&self) -> i64 {
        self.end_of_push_timestamp_ms
    }

    pub fn is_deferred_write(&self) -> bool {
        self.deferred_write
    }

    pub fn consume_remotely(&self) -> bool {
        self.consume_remotely
    }

    pub fn set_consume_remotely(&mut self, remote: bool) {
        self.consume_remotely = remote;
    }

    pub fn has_lag_caught_up(&self) -> bool {
        self.lag_caught_up
    }

    pub fn set_lag_caught_up(&mut self, caught_up: bool) {
        self.lag_caught_up = caught_up;
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn set_unsubscribed(&mut self) {
        self.subscribed = false;
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    pub fn set_errored(&mut self) {
        self.errored = true;
    }

    // ------------------------------------------------------------------
    // Version-topic activity (leader promotion gate)
    // ------------------------------------------------------------------

    pub fn touch_vt_activity(&mut self) {
        self.last_vt_activity = Instant::now();
    }

    pub fn vt_idle_for(&self) -> Duration {
        self.last_vt_activity.elapsed()
    }

    // ------------------------------------------------------------------
    // Produce pipeline
    // ------------------------------------------------------------------

    /// Allocate the next per-partition produce position.
    pub fn next_produce_position(&mut self) -> i64 {
        let position = self.next_produce_position;
        self.next_produce_position += 1;
        position
    }

    pub fn produce_tracker(&self) -> Arc<ProduceTracker> {
        self.produce_tracker.clone()
    }

    // ------------------------------------------------------------------
    // Transient record cache
    // ------------------------------------------------------------------

    pub fn transient_record(&self, key: &RecordKey) -> Option<&TransientRecord> {
        self.transient.get(key)
    }

    pub fn set_transient_record(&mut self, key: RecordKey, record: TransientRecord) {
        self.transient.put(key, record);
    }

    pub fn evict_transient_up_to(&mut self, position: i64) {
        self.transient.evict_up_to(position);
    }

    pub fn transient_len(&self) -> usize {
        self.transient.len()
    }
}

impl std::fmt::Debug for PartitionConsumptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionConsumptionState")
            .field("partition", &self.partition)
            .field("role", &self.role)
            .field("source_topic", &self.source_topic.name)
            .field("eop_received", &self.eop_received)
            .field("local_vt", &self.latest_processed_local_vt)
            .field("transient_len", &self.transient.len())
            .finish()
    }
}
