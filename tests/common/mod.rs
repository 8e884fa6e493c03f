//! Shared harness: a three-region deployment over the in-memory broker,
//! producer and storage engine.

// Each integration binary compiles this module separately and uses a
// different slice of it.
#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;

use estuary::constants::REWIND_TIME_DECIDED_BY_SERVER;
use estuary::ingestion::{ActiveActiveIngestionTask, IngestionDeps, RemoteIngestionRepairService};
use estuary::pubsub::mock::{MockBroker, MockVersionTopicProducer};
use estuary::rmd::RmdSerde;
use estuary::schema::{SchemaCache, StaticSchemaRepository};
use estuary::storage::{InMemoryStorageEngine, NoOpCompressor};
use estuary::types::{
    ConsumedRecord, ControlMessage, DeleteOp, Operation, PutOp, RecordKey, RecordPayload, Topic,
    TopicPartition, TopicSwitch,
};
use estuary::IngestionConfig;

pub const REGION_A: &str = "pubsub://region-a";
pub const REGION_B: &str = "pubsub://region-b";
pub const REGION_C: &str = "pubsub://region-c";
pub const REGIONS: [&str; 3] = [REGION_A, REGION_B, REGION_C];

pub const VALUE_SCHEMA: i32 = 1;

/// Start-of-push timestamp used by [`Harness::bootstrap_partition`].
pub const SOP_TS: i64 = 1_000_000;
/// End-of-push timestamp; large enough that the server-decided rewind
/// window stays positive.
pub const EOP_TS: i64 = 200_000_000;

pub struct Harness {
    pub task: Arc<ActiveActiveIngestionTask>,
    pub broker: Arc<MockBroker>,
    pub producer: Arc<MockVersionTopicProducer>,
    pub storage: Arc<InMemoryStorageEngine>,
    pub rmd_serde: RmdSerde,
    pub repair: Option<Arc<RemoteIngestionRepairService>>,
}

impl Harness {
    pub fn new(with_repair: bool) -> Self {
        let broker = Arc::new(MockBroker::new());
        let producer = Arc::new(MockVersionTopicProducer::new());
        let storage = Arc::new(InMemoryStorageEngine::new());
        let schemas = SchemaCache::new(Arc::new(
            StaticSchemaRepository::new().with_record_level(VALUE_SCHEMA),
        ));
        let repair = with_repair.then(|| RemoteIngestionRepairService::start(20));
        let config = IngestionConfig {
            store_name: "orders".to_string(),
            version: 1,
            local_region_url: REGION_A.to_string(),
            region_urls: REGIONS.iter().map(|r| r.to_string()).collect(),
            partition_count: 2,
            ..IngestionConfig::default()
        };
        let task = ActiveActiveIngestionTask::new(
            config,
            IngestionDeps {
                consumer: broker.clone(),
                producer: producer.clone(),
                storage: storage.clone(),
                schemas: schemas.clone(),
                views: Default::default(),
                compressor: Arc::new(NoOpCompressor),
                repair: repair.clone(),
            },
        )
        .expect("valid harness config");
        Harness {
            task,
            broker,
            producer,
            storage,
            rmd_serde: RmdSerde::new(schemas, 1),
            repair,
        }
    }

    pub fn vt(&self, partition: u32) -> TopicPartition {
        TopicPartition::new(self.task.version_topic().clone(), partition)
    }

    pub fn rt(&self, partition: u32) -> TopicPartition {
        TopicPartition::new(self.task.real_time_topic().clone(), partition)
    }

    fn control_record(&self, partition: u32, control: ControlMessage, ts: i64) -> ConsumedRecord {
        ConsumedRecord {
            topic_partition: self.vt(partition),
            key: RecordKey::wrap(Vec::new()),
            payload: RecordPayload::Control(control),
            offset: 0,
            logical_timestamp: -1,
            broker_timestamp_ms: ts,
            leader_metadata: None,
        }
    }

    /// Subscribe the partition and run it through start/end of push.
    pub async fn bootstrap_partition(&self, partition: u32) {
        self.task.subscribe_partition(partition, 0).await.unwrap();
        let vt = self.vt(partition);
        self.broker.push(
            REGION_A,
            &vt,
            self.control_record(
                partition,
                ControlMessage::StartOfPush {
                    timestamp_ms: SOP_TS,
                    chunked: false,
                },
                SOP_TS,
            ),
        );
        self.broker.push(
            REGION_A,
            &vt,
            self.control_record(
                partition,
                ControlMessage::EndOfPush { timestamp_ms: EOP_TS },
                EOP_TS,
            ),
        );
        self.task.poll_once().await.unwrap();
    }

    /// Deliver a topic-switch control message pointing the partition at all
    /// three regional real-time topics, with a server-decided rewind.
    pub async fn deliver_topic_switch(&self, partition: u32) {
        let switch = TopicSwitch {
            source_topic: Topic::real_time(self.rt(partition).topic.name.clone()),
            source_brokers: REGIONS.iter().map(|r| r.to_string()).collect(),
            rewind_start_timestamp: REWIND_TIME_DECIDED_BY_SERVER,
        };
        let vt = self.vt(partition);
        self.broker.push(
            REGION_A,
            &vt,
            self.control_record(partition, ControlMessage::TopicSwitch(switch), EOP_TS + 1),
        );
        self.task.poll_once().await.unwrap();
    }

    /// Pad a regional real-time log with records dated before the rewind
    /// window, so the next real record lands at a chosen offset without
    /// being polled.
    pub fn pad_rt(&self, region: &str, partition: u32, count: usize) {
        let rt = self.rt(partition);
        for i in 0..count {
            self.broker.push(
                region,
                &rt,
                ConsumedRecord {
                    topic_partition: rt.clone(),
                    key: RecordKey::wrap(format!("pad-{region}-{i}").into_bytes()),
                    payload: RecordPayload::Op(Operation::Put(PutOp {
                        value: Bytes::from_static(b"pad"),
                        schema_id: VALUE_SCHEMA,
                        rmd: None,
                    })),
                    offset: 0,
                    logical_timestamp: 1,
                    broker_timestamp_ms: 1_000,
                    leader_metadata: None,
                },
            );
        }
    }

    /// Push one real-time put; returns its assigned offset.
    pub fn push_rt_put(
        &self,
        region: &str,
        partition: u32,
        key: &[u8],
        value: &[u8],
        ts: i64,
    ) -> i64 {
        let rt = self.rt(partition);
        self.broker.push(
            region,
            &rt,
            ConsumedRecord {
                topic_partition: rt.clone(),
                key: RecordKey::wrap(key.to_vec()),
                payload: RecordPayload::Op(Operation::Put(PutOp {
                    value: Bytes::copy_from_slice(value),
                    schema_id: VALUE_SCHEMA,
                    rmd: None,
                })),
                offset: 0,
                logical_timestamp: ts,
                broker_timestamp_ms: EOP_TS + ts,
                leader_metadata: None,
            },
        )
    }

    /// Push one real-time delete; returns its assigned offset.
    pub fn push_rt_delete(&self, region: &str, partition: u32, key: &[u8], ts: i64) -> i64 {
        let rt = self.rt(partition);
        self.broker.push(
            region,
            &rt,
            ConsumedRecord {
                topic_partition: rt.clone(),
                key: RecordKey::wrap(key.to_vec()),
                payload: RecordPayload::Op(Operation::Delete(DeleteOp {
                    schema_id: VALUE_SCHEMA,
                    rmd: None,
                })),
                offset: 0,
                logical_timestamp: ts,
                broker_timestamp_ms: EOP_TS + ts,
                leader_metadata: None,
            },
        )
    }

    /// Wait for every enqueued version-topic produce of the partition.
    pub async fn drain(&self, partition: u32) {
        let pcs = self.task.partition_state(partition).unwrap();
        let tracker = { pcs.lock().await.produce_tracker() };
        tracker.wait_drained().await;
    }
}
