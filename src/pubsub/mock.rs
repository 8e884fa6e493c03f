//! In-memory broker and producer doubles.
//!
//! Used by the integration tests and by single-process experiments; shipped
//! in `src` so both can share them. The broker keeps one append-only log per
//! `(region, topic, partition)` and serves polls from per-subscription
//! cursors; regions can be marked unreachable to exercise the repair path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{IngestionError, IngestionResult};
use crate::types::{ConsumedRecord, TopicPartition};

use super::{PolledRecord, PubSubConsumer, VersionTopicProducer, VtDelete, VtPut};

type LogKey = (String, String, u32);

fn log_key(region_url: &str, topic_partition: &TopicPartition) -> LogKey {
    (
        region_url.to_string(),
        topic_partition.topic.name.clone(),
        topic_partition.partition,
    )
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<LogKey, Vec<ConsumedRecord>>,
    /// Subscription cursor: next offset to hand out.
    cursors: HashMap<LogKey, i64>,
    unreachable: HashSet<String>,
}

/// In-memory multi-region broker.
#[derive(Default)]
pub struct MockBroker {
    state: Mutex<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to a regional log, assigning the next offset.
    /// Returns the assigned offset.
    pub fn push(
        &self,
        region_url: &str,
        topic_partition: &TopicPartition,
        mut record: ConsumedRecord,
    ) -> i64 {
        let mut state = self.state.lock().unwrap();
        let log = state.logs.entry(log_key(region_url, topic_partition)).or_default();
        let offset = log.len() as i64;
        record.offset = offset;
        record.topic_partition = topic_partition.clone();
        log.push(record);
        offset
    }

    /// Mark a region unreachable: offset lookups fail until cleared.
    pub fn set_unreachable(&self, region_url: &str, unreachable: bool) {
        let mut state = self.state.lock().unwrap();
        if unreachable {
            state.unreachable.insert(region_url.to_string());
        } else {
            state.unreachable.remove(region_url);
        }
    }

    /// Cursor of an active subscription, if any.
    pub fn subscription_cursor(
        &self,
        region_url: &str,
        topic_partition: &TopicPartition,
    ) -> Option<i64> {
        let state = self.state.lock().unwrap();
        state.cursors.get(&log_key(region_url, topic_partition)).copied()
    }

    pub fn is_subscribed(&self, region_url: &str, topic_partition: &TopicPartition) -> bool {
        self.subscription_cursor(region_url, topic_partition).is_some()
    }

    fn check_reachable(&self, state: &BrokerState, region_url: &str) -> IngestionResult<()> {
        if state.unreachable.contains(region_url) {
            return Err(IngestionError::BrokerUnreachable {
                region: region_url.to_string(),
                message: "lookup timed out".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubConsumer for MockBroker {
    async fn subscribe(
        &self,
        region_url: &str,
        topic_partition: &TopicPartition,
        offset: i64,
    ) -> IngestionResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .cursors
            .insert(log_key(region_url, topic_partition), offset.max(0));
        Ok(())
    }

    async fn unsubscribe(
        &self,
        region_url: &str,
        topic_partition: &TopicPartition,
    ) -> IngestionResult<()> {
        let mut state = self.state.lock().unwrap();
        state.cursors.remove(&log_key(region_url, topic_partition));
        Ok(())
    }

    async fn poll(&self, _timeout: Duration) -> IngestionResult<Vec<PolledRecord>> {
        let mut state = self.state.lock().unwrap();
        let mut polled = Vec::new();
        let keys: Vec<LogKey> = state.cursors.keys().cloned().collect();
        for key in keys {
            let cursor = state.cursors[&key];
            let records: Vec<ConsumedRecord> = state
                .logs
                .get(&key)
                .map(|log| {
                    log.iter()
                        .filter(|r| r.offset >= cursor)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if let Some(last) = records.last() {
                state.cursors.insert(key.clone(), last.offset + 1);
            }
            polled.extend(records.into_iter().map(|record| PolledRecord {
                region_url: key.0.clone(),
                record,
            }));
        }
        Ok(polled)
    }

    async fn offset_for_time(
        &self,
        region_url: &str,
        topic_partition: &TopicPartition,
        timestamp_ms: i64,
    ) -> IngestionResult<i64> {
        let state = self.state.lock().unwrap();
        self.check_reachable(&state, region_url)?;
        let log = state.logs.get(&log_key(region_url, topic_partition));
        let offset = log
            .and_then(|log| {
                log.iter()
                    .find(|r| r.broker_timestamp_ms >= timestamp_ms)
                    .map(|r| r.offset)
            })
            .unwrap_or_else(|| log.map(|l| l.len() as i64).unwrap_or(0));
        Ok(offset)
    }

    async fn end_offset(
        &self,
        region_url: &str,
        topic_partition: &TopicPartition,
    ) -> IngestionResult<i64> {
        let state = self.state.lock().unwrap();
        self.check_reachable(&state, region_url)?;
        Ok(state
            .logs
            .get(&log_key(region_url, topic_partition))
            .map(|log| log.len() as i64)
            .unwrap_or(0))
    }
}

/// A send captured by [`MockVersionTopicProducer`].
#[derive(Debug, Clone)]
pub enum ProducedRecord {
    Put { partition: u32, put: VtPut, offset: i64 },
    Delete {
        partition: u32,
        delete: VtDelete,
        offset: i64,
    },
}

impl ProducedRecord {
    pub fn key_bytes(&self) -> &[u8] {
        match self {
            ProducedRecord::Put { put, .. } => put.key.as_bytes(),
            ProducedRecord::Delete { delete, .. } => delete.key.as_bytes(),
        }
    }

    pub fn offset(&self) -> i64 {
        match self {
            ProducedRecord::Put { offset, .. } => *offset,
            ProducedRecord::Delete { offset, .. } => *offset,
        }
    }
}

/// Version-topic producer double that records sends in arrival order.
#[derive(Default)]
pub struct MockVersionTopicProducer {
    sends: Mutex<Vec<ProducedRecord>>,
    next_offset: AtomicI64,
    fail_sends: AtomicBool,
}

impl MockVersionTopicProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail, to exercise the error path.
    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    pub fn sends(&self) -> Vec<ProducedRecord> {
        self.sends.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }

    fn check_failing(&self, partition: u32) -> IngestionResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(IngestionError::ProducerFailure {
                partition,
                message: "send rejected".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VersionTopicProducer for MockVersionTopicProducer {
    async fn put(&self, partition: u32, put: VtPut) -> IngestionResult<i64> {
        self.check_failing(partition)?;
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.sends
            .lock()
            .unwrap()
            .push(ProducedRecord::Put { partition, put, offset });
        Ok(offset)
    }

    async fn delete(&self, partition: u32, delete: VtDelete) -> IngestionResult<i64> {
        self.check_failing(partition)?;
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.sends.lock().unwrap().push(ProducedRecord::Delete {
            partition,
            delete,
            offset,
        });
        Ok(offset)
    }
}
