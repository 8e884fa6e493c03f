//! Core domain types: keys, regions, topics, operations and control messages.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::error::{IngestionError, IngestionResult};

/// Identifier of a source region (colo). Region ids index the per-region
/// offset vector in replication metadata.
pub type RegionId = u16;

/// Immutable mapping between region broker URLs and region ids.
///
/// Built once at startup from configuration and injected wherever a
/// translation is needed; never mutated afterwards. The region id doubles as
/// the broker-cluster id: the deployment model pins one broker cluster per
/// region, so the two mappings are exposed through one type.
#[derive(Debug, Clone)]
pub struct RegionMap {
    urls: Vec<String>,
    by_url: HashMap<String, RegionId>,
}

impl RegionMap {
    pub fn new(urls: Vec<String>) -> Self {
        let by_url = urls
            .iter()
            .enumerate()
            .map(|(id, url)| (url.clone(), id as RegionId))
            .collect();
        RegionMap { urls, by_url }
    }

    /// Number of known regions.
    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn id_of(&self, url: &str) -> Option<RegionId> {
        self.by_url.get(url).copied()
    }

    /// Like [`RegionMap::id_of`] but failing with [`IngestionError::UnknownRegion`].
    pub fn require_id(&self, url: &str) -> IngestionResult<RegionId> {
        self.id_of(url).ok_or_else(|| IngestionError::UnknownRegion {
            url: url.to_string(),
        })
    }

    pub fn url_of(&self, id: RegionId) -> Option<&str> {
        self.urls.get(id as usize).map(String::as_str)
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

/// A record key, treated as an identity over its raw bytes.
///
/// Cheap to clone ([`Bytes`] is reference counted); equality and hashing are
/// byte equality, which is what the key-level lock manager and the transient
/// record cache key on.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RecordKey(Bytes);

impl RecordKey {
    pub fn wrap(bytes: impl Into<Bytes>) -> Self {
        RecordKey(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys are opaque bytes; print a bounded hex prefix.
        let prefix: Vec<String> = self.0.iter().take(16).map(|b| format!("{b:02x}")).collect();
        let ellipsis = if self.0.len() > 16 { ".." } else { "" };
        write!(f, "RecordKey({}{})", prefix.join(""), ellipsis)
    }
}

impl From<&[u8]> for RecordKey {
    fn from(bytes: &[u8]) -> Self {
        RecordKey(Bytes::copy_from_slice(bytes))
    }
}

/// Whether a topic carries resolved state or raw regional writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Per-store-version ordered log of resolved records.
    VersionTopic,
    /// Per-store log of raw regional writes; the conflict-resolution source.
    RealTime,
}

/// A named topic, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub name: String,
    pub kind: TopicKind,
}

impl Topic {
    pub fn version_topic(name: impl Into<String>) -> Self {
        Topic {
            name: name.into(),
            kind: TopicKind::VersionTopic,
        }
    }

    pub fn real_time(name: impl Into<String>) -> Self {
        Topic {
            name: name.into(),
            kind: TopicKind::RealTime,
        }
    }

    #[inline]
    pub fn is_real_time(&self) -> bool {
        self.kind == TopicKind::RealTime
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A `(topic, partition)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: Topic,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: Topic, partition: u32) -> Self {
        TopicPartition { topic, partition }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic.name, self.partition)
    }
}

/// Replica role for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaRole {
    #[default]
    Follower,
    /// Waiting out the local version-topic idle window before flipping.
    TransitioningToLeader,
    Leader,
}

impl ReplicaRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaRole::Follower => "follower",
            ReplicaRole::TransitioningToLeader => "transitioning",
            ReplicaRole::Leader => "leader",
        }
    }
}

/// A full-value write.
#[derive(Debug, Clone)]
pub struct PutOp {
    pub value: Bytes,
    pub schema_id: i32,
    /// Resolved RMD payload (not schema-id-prefixed). Present on records the
    /// leader re-emitted into the version topic; absent on raw regional writes
    /// from batch pushes.
    pub rmd: Option<Bytes>,
}

/// A delete, optionally carrying the resolved tombstone RMD.
#[derive(Debug, Clone)]
pub struct DeleteOp {
    pub schema_id: i32,
    pub rmd: Option<Bytes>,
}

/// A partial update (write-compute) payload.
#[derive(Debug, Clone)]
pub struct UpdateOp {
    pub payload: Bytes,
    pub schema_id: i32,
    pub update_schema_id: i32,
}

/// A data operation carried by a consumed record.
#[derive(Debug, Clone)]
pub enum Operation {
    Put(PutOp),
    Delete(DeleteOp),
    Update(UpdateOp),
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Put(_) => "put",
            Operation::Delete(_) => "delete",
            Operation::Update(_) => "update",
        }
    }
}

/// Topic-switch instruction: re-point a partition's leader at one or more
/// regional real-time topics, rewinding each source by timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSwitch {
    pub source_topic: Topic,
    pub source_brokers: Vec<String>,
    /// Epoch millis, or [`crate::constants::REWIND_TIME_DECIDED_BY_SERVER`].
    pub rewind_start_timestamp: i64,
}

/// Control messages interleaved with data on the version topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    StartOfPush { timestamp_ms: i64, chunked: bool },
    EndOfPush { timestamp_ms: i64 },
    TopicSwitch(TopicSwitch),
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::StartOfPush { .. } => "start_of_push",
            ControlMessage::EndOfPush { .. } => "end_of_push",
            ControlMessage::TopicSwitch(_) => "topic_switch",
        }
    }
}

/// Payload of a consumed record.
#[derive(Debug, Clone)]
pub enum RecordPayload {
    Op(Operation),
    Control(ControlMessage),
}

/// Provenance a leader stamps onto records it re-emits, letting followers
/// attribute them to the correct upstream region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderMetadata {
    pub upstream_region: RegionId,
    pub upstream_offset: i64,
}

/// One record handed to the ingestion task by the broker consumer.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub topic_partition: TopicPartition,
    pub key: RecordKey,
    pub payload: RecordPayload,
    pub offset: i64,
    /// Application-provided timestamp; [`crate::constants::APP_DEFAULT_LOGICAL_TS`]
    /// when absent.
    pub logical_timestamp: i64,
    /// Broker-assigned timestamp, always present.
    pub broker_timestamp_ms: i64,
    pub leader_metadata: Option<LeaderMetadata>,
}

impl ConsumedRecord {
    /// The timestamp the conflict resolver compares on.
    ///
    /// Falls back to the broker-assigned timestamp when the writer supplied
    /// no logical timestamp; imperfect (broker clocks, not writer clocks) but
    /// the only orderable signal those records carry.
    pub fn write_timestamp(&self) -> u64 {
        if self.logical_timestamp >= 0 {
            self.logical_timestamp as u64
        } else {
            self.broker_timestamp_ms.max(0) as u64
        }
    }
}

/// A value with its writer schema id, as read back from storage or cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueAndSchema {
    pub value: Bytes,
    pub schema_id: i32,
}
