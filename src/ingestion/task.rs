//! The active/active ingestion task.
//!
//! One task per store-version. It owns the subscribed partitions and drives
//! the poll → resolve → persist → produce loop:
//!
//! 1. Version-topic records bypass conflict resolution; they already carry
//!    resolved state and are written through to storage.
//! 2. Real-time records take the key lock, load the existing value and RMD
//!    (transient cache first, storage second), run the merge resolver, and
//!    on a win update the transient cache and per-region offsets before the
//!    version-topic send is enqueued.
//! 3. A per-partition drain serializes the sends: it awaits the view fanout,
//!    persists the winner, produces to the local version topic, and evicts
//!    the transient entry once the send is acknowledged.
//!
//! The critical section per key is exactly step 2. Never take a key lock
//! while holding a partition mutex; the loop orders key lock → partition
//! state, and the drain touches partition state only.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BufferReplayPolicy, IngestionConfig};
use crate::constants::{LOWEST_OFFSET, REWIND_TIME_DECIDED_BY_SERVER};
use crate::error::{IngestionError, IngestionResult};
use crate::merge::{AppliedMerge, MergeConflictResolver, MergeResult};
use crate::metrics;
use crate::pubsub::{
    DeleteMetadata, PolledRecord, PubSubConsumer, PutMetadata, VersionTopicProducer, VtDelete,
    VtPut,
};
use crate::rmd::{RmdSerde, RmdWithSchemaId};
use crate::schema::SchemaCache;
use crate::storage::chunking::{ChunkedValueManifest, ChunkingAdapter};
use crate::storage::{Compressor, StorageEngine, StoreVersionState};
use crate::types::{
    ConsumedRecord, ControlMessage, DeleteOp, LeaderMetadata, Operation, PutOp, RecordKey,
    RecordPayload, RegionId, RegionMap, ReplicaRole, Topic, TopicKind, TopicPartition,
    TopicSwitch, ValueAndSchema,
};

use super::locks::KeyLevelLockManager;
use super::partition::PartitionConsumptionState;
use super::repair::{RemoteIngestionRepairService, RepairSubscriber, RepairTask};
use super::transient::TransientRecord;
use super::views::{FanoutHandle, ViewRecord, ViewWriterFanout};

/// Collaborators injected into a task.
pub struct IngestionDeps {
    pub consumer: Arc<dyn PubSubConsumer>,
    pub producer: Arc<dyn VersionTopicProducer>,
    pub storage: Arc<dyn StorageEngine>,
    pub schemas: SchemaCache,
    pub views: ViewWriterFanout,
    pub compressor: Arc<dyn Compressor>,
    pub repair: Option<Arc<RemoteIngestionRepairService>>,
}

/// Which storage operation a write-through record maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageOperationType {
    ValueAndRmd,
    Value,
    RmdChunk,
    Skip,
}

/// One unit of work for the per-partition produce drain.
struct ProduceJob {
    position: i64,
    fanout: FanoutHandle,
    command: ProduceCommand,
}

enum ProduceCommand {
    Put {
        key: RecordKey,
        value: Bytes,
        value_schema_id: i32,
        rmd_prefixed: Bytes,
        leader_metadata: LeaderMetadata,
        old_value_manifest: Option<ChunkedValueManifest>,
        old_rmd_manifest: Option<ChunkedValueManifest>,
    },
    Delete {
        key: RecordKey,
        value_schema_id: i32,
        rmd_prefixed: Bytes,
        leader_metadata: LeaderMetadata,
        old_value_manifest: Option<ChunkedValueManifest>,
        old_rmd_manifest: Option<ChunkedValueManifest>,
    },
}

/// Active/active ingestion task for one store-version.
pub struct ActiveActiveIngestionTask {
    config: IngestionConfig,
    version_topic: Topic,
    real_time_topic: Topic,
    regions: Arc<RegionMap>,
    consumer: Arc<dyn PubSubConsumer>,
    producer: Arc<dyn VersionTopicProducer>,
    chunking: ChunkingAdapter,
    rmd_serde: RmdSerde,
    resolver: MergeConflictResolver,
    locks: KeyLevelLockManager,
    views: ViewWriterFanout,
    compressor: Arc<dyn Compressor>,
    repair: Option<Arc<RemoteIngestionRepairService>>,

    /// Back-reference to the owning `Arc`, used to hand weak-upgradable
    /// handles to the repair service and to spawn parallel workers.
    self_ref: Weak<ActiveActiveIngestionTask>,

    partitions: DashMap<u32, Arc<Mutex<PartitionConsumptionState>>>,
    produce_queues: DashMap<u32, mpsc::Sender<ProduceJob>>,
    /// Serializes produce-position allocation with queue insertion so the
    /// version topic sees sends in decision order even under parallel
    /// processing.
    enqueue_locks: DashMap<u32, Arc<Mutex<()>>>,
    drains: DashMap<u32, JoinHandle<()>>,
}

impl ActiveActiveIngestionTask {
    pub fn new(config: IngestionConfig, deps: IngestionDeps) -> IngestionResult<Arc<Self>> {
        config.validate()?;
        let regions = Arc::new(RegionMap::new(config.region_urls.clone()));
        let lock_pool_size = KeyLevelLockManager::max_pool_size(
            config.partition_count,
            config.leader_consumer_pool_slots(),
            regions.len(),
            config.parallel_processing_multiplier(),
        );
        let rmd_serde = RmdSerde::new(deps.schemas.clone(), 1);
        let resolver = MergeConflictResolver::new(deps.schemas, regions.len());
        Ok(Arc::new_cyclic(|self_ref| ActiveActiveIngestionTask {
            version_topic: Topic::version_topic(config.version_topic_name()),
            real_time_topic: Topic::real_time(config.real_time_topic_name()),
            regions,
            consumer: deps.consumer,
            producer: deps.producer,
            chunking: ChunkingAdapter::new(deps.storage),
            rmd_serde,
            resolver,
            locks: KeyLevelLockManager::new(lock_pool_size),
            views: deps.views,
            compressor: deps.compressor,
            repair: deps.repair,
            self_ref: self_ref.clone(),
            partitions: DashMap::new(),
            produce_queues: DashMap::new(),
            enqueue_locks: DashMap::new(),
            drains: DashMap::new(),
            config,
        }))
    }

    pub fn version_topic(&self) -> &Topic {
        &self.version_topic
    }

    pub fn real_time_topic(&self) -> &Topic {
        &self.real_time_topic
    }

    pub fn regions(&self) -> &RegionMap {
        &self.regions
    }

    // ------------------------------------------------------------------
    // Subscription lifecycle
    // ------------------------------------------------------------------

    /// Subscribe a partition as a follower of the local version topic.
    pub async fn subscribe_partition(&self, partition: u32, vt_offset: i64) -> IngestionResult<()> {
        let pcs = Arc::new(Mutex::new(PartitionConsumptionState::new(
            partition,
            self.version_topic.clone(),
        )));
        self.partitions.insert(partition, pcs.clone());
        self.enqueue_locks
            .insert(partition, Arc::new(Mutex::new(())));
        self.start_produce_drain(partition, pcs);
        self.consumer
            .subscribe(
                &self.config.local_region_url,
                &TopicPartition::new(self.version_topic.clone(), partition),
                vt_offset,
            )
            .await?;
        info!(partition, topic = %self.version_topic, "subscribed partition");
        Ok(())
    }

    /// Unsubscribe a partition. In-flight storage operations for it are
    /// demoted from fatal to logged.
    pub async fn unsubscribe_partition(&self, partition: u32) -> IngestionResult<()> {
        let Some(pcs) = self.partition_state(partition) else {
            return Err(IngestionError::PartitionNotSubscribed { partition });
        };
        let source_topic = {
            let mut pcs = pcs.lock().await;
            pcs.set_unsubscribed();
            pcs.source_topic().clone()
        };
        self.unsubscribe_current_sources(partition, &source_topic).await;
        // Closing the queue lets the drain exit once it has run dry.
        self.produce_queues.remove(&partition);
        info!(partition, "unsubscribed partition");
        Ok(())
    }

    /// Shut down the task: drop every subscription and produce queue.
    pub async fn shutdown(&self) {
        let partitions: Vec<u32> = self.partitions.iter().map(|e| *e.key()).collect();
        for partition in partitions {
            let _ = self.unsubscribe_partition(partition).await;
        }
        for entry in self.drains.iter() {
            entry.value().abort();
        }
    }

    pub fn partition_state(&self, partition: u32) -> Option<Arc<Mutex<PartitionConsumptionState>>> {
        self.partitions.get(&partition).map(|e| e.value().clone())
    }

    async fn unsubscribe_current_sources(&self, partition: u32, source_topic: &Topic) {
        if source_topic.is_real_time() {
            for region in self.regions.urls() {
                let tp = TopicPartition::new(source_topic.clone(), partition);
                if let Err(err) = self.consumer.unsubscribe(region, &tp).await {
                    warn!(partition, region = %region, error = %err, "unsubscribe failed");
                }
            }
        } else {
            let tp = TopicPartition::new(source_topic.clone(), partition);
            if let Err(err) = self
                .consumer
                .unsubscribe(&self.config.local_region_url, &tp)
                .await
            {
                warn!(partition, error = %err, "unsubscribe failed");
            }
        }
    }

    /// Subscribe with the region-map guard: unknown broker URLs are refused
    /// before they can poison consumption.
    async fn consumer_subscribe_checked(
        &self,
        region_url: &str,
        topic_partition: &TopicPartition,
        offset: i64,
    ) -> IngestionResult<()> {
        self.regions.require_id(region_url)?;
        self.consumer
            .subscribe(region_url, topic_partition, offset)
            .await
    }

    // ------------------------------------------------------------------
    // Poll loop
    // ------------------------------------------------------------------

    /// Poll once and process everything returned. The number of records
    /// processed is handed back so callers can idle-detect.
    pub async fn poll_once(&self) -> IngestionResult<usize> {
        let polled = self.consumer.poll(self.config.poll_timeout).await?;
        let count = polled.len();
        self.process_batch(polled).await?;
        Ok(count)
    }

    /// Drive the loop until `shutdown` flips to `true`.
    pub async fn run(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> IngestionResult<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                polled = self.poll_once() => {
                    polled?;
                }
            }
        }
    }

    /// Process one poll batch. With parallel processing enabled, data
    /// records between control messages are grouped by key and the groups
    /// run concurrently; per-key arrival order is preserved inside a group
    /// and control messages stay at their original positions.
    pub async fn process_batch(&self, batch: Vec<PolledRecord>) -> IngestionResult<()> {
        if !self.config.parallel_processing_enabled {
            for polled in batch {
                self.process_polled_record(polled).await?;
            }
            return Ok(());
        }

        let mut chunk: Vec<PolledRecord> = Vec::new();
        for polled in batch {
            let is_control = matches!(polled.record.payload, RecordPayload::Control(_));
            if is_control {
                self.process_chunk_parallel(std::mem::take(&mut chunk)).await?;
                self.process_polled_record(polled).await?;
            } else {
                chunk.push(polled);
            }
        }
        self.process_chunk_parallel(chunk).await
    }

    async fn process_chunk_parallel(
        &self,
        chunk: Vec<PolledRecord>,
    ) -> IngestionResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let mut groups: HashMap<(u32, RecordKey), Vec<PolledRecord>> = HashMap::new();
        for polled in chunk {
            groups
                .entry((
                    polled.record.topic_partition.partition,
                    polled.record.key.clone(),
                ))
                .or_default()
                .push(polled);
        }
        // Spawning needs an owned handle; during shutdown (no strong refs
        // left) fall back to inline processing.
        let Some(strong_self) = self.self_ref.upgrade() else {
            for group in groups.into_values() {
                for polled in group {
                    self.process_polled_record(polled).await?;
                }
            }
            return Ok(());
        };
        let mut joins = tokio::task::JoinSet::new();
        for (_, group) in groups {
            let task = strong_self.clone();
            joins.spawn(async move {
                for polled in group {
                    task.process_polled_record(polled).await?;
                }
                Ok::<(), IngestionError>(())
            });
        }
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok(result) => result?,
                Err(join_err) => {
                    return Err(IngestionError::InvalidOperation(format!(
                        "parallel worker aborted: {join_err}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Dispatch one record, applying the error-severity policy: transient
    /// errors are swallowed, poisoned records are counted and skipped,
    /// partition-fatal errors mark the partition ERRORed, version-fatal
    /// errors abort the task.
    pub async fn process_polled_record(&self, polled: PolledRecord) -> IngestionResult<()> {
        let partition = polled.record.topic_partition.partition;
        match self.process_record_inner(polled).await {
            Ok(()) => Ok(()),
            Err(err) => {
                metrics::record_decision_error(err.severity().as_metric_label());
                if err.is_transient() {
                    warn!(partition, error = %err, "transient ingestion error");
                    Ok(())
                } else if err.is_poison() {
                    metrics::record_poisoned_record("schema_incompatible");
                    warn!(partition, error = %err, "poisoned record skipped");
                    if self.config.halt_on_poisoned_record {
                        self.mark_partition_errored(partition, &err).await;
                    }
                    Ok(())
                } else if err.is_fatal_to_version() {
                    error!(partition, error = %err, "fatal ingestion error, aborting store-version task");
                    Err(err)
                } else {
                    self.mark_partition_errored(partition, &err).await;
                    Ok(())
                }
            }
        }
    }

    async fn mark_partition_errored(&self, partition: u32, err: &IngestionError) {
        error!(partition, error = %err, "marking partition ERROR");
        if let Some(pcs) = self.partition_state(partition) {
            pcs.lock().await.set_errored();
        }
    }

    async fn process_record_inner(&self, polled: PolledRecord) -> IngestionResult<()> {
        let partition = polled.record.topic_partition.partition;
        let Some(pcs) = self.partition_state(partition) else {
            debug!(partition, "dropping record for unsubscribed partition");
            return Ok(());
        };
        {
            let state = pcs.lock().await;
            if state.is_errored() || !state.is_subscribed() {
                return Ok(());
            }
        }

        match &polled.record.payload {
            RecordPayload::Control(control) => {
                self.process_control_message(&pcs, &polled.record, control.clone()).await
            }
            RecordPayload::Op(_) => {
                let from_real_time =
                    polled.record.topic_partition.topic.kind == TopicKind::RealTime;
                let eop_received = pcs.lock().await.is_end_of_push_received();
                if from_real_time && eop_received {
                    // The conflict-resolution path runs under the key lock:
                    // read state, resolve, update cache, enqueue the send.
                    let guard = self.locks.acquire(&polled.record.key).await;
                    let result = self
                        .process_active_active_record(&pcs, &polled.record, &polled.region_url)
                        .await;
                    drop(guard);
                    result
                } else {
                    // Version-topic records (and pre-EOP batch data) carry
                    // already-resolved state: write through.
                    self.process_write_through(&pcs, &polled.record, &polled.region_url)
                        .await
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Write-through path
    // ------------------------------------------------------------------

    async fn process_write_through(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
        record: &ConsumedRecord,
        region_url: &str,
    ) -> IngestionResult<()> {
        let partition = record.topic_partition.partition;
        let result = match &record.payload {
            RecordPayload::Op(Operation::Put(put)) => {
                self.write_through_put(pcs, partition, &record.key, put).await
            }
            RecordPayload::Op(Operation::Delete(delete)) => {
                self.write_through_delete(pcs, partition, &record.key, delete).await
            }
            RecordPayload::Op(Operation::Update(_)) => Err(IngestionError::InvalidOperation(
                "partial updates are resolved before reaching the version topic".to_string(),
            )),
            RecordPayload::Control(_) => unreachable!("control handled by caller"),
        };
        if let Err(err) = result {
            return self.demote_if_unsubscribed(pcs, partition, err).await;
        }
        self.track_write_through_offsets(pcs, record, region_url).await;
        Ok(())
    }

    async fn write_through_put(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
        partition: u32,
        key: &RecordKey,
        put: &PutOp,
    ) -> IngestionResult<()> {
        let rmd_empty = put.rmd.as_ref().map(|r| r.is_empty()).unwrap_or(true);
        match self
            .storage_operation_for_put(pcs, put.value.is_empty(), rmd_empty)
            .await?
        {
            StorageOperationType::ValueAndRmd => {
                let rmd_prefixed = crate::storage::chunking::prepend_schema_id(
                    put.schema_id,
                    put.rmd.as_deref().unwrap_or(&[]),
                );
                self.chunking.put_value_and_rmd(
                    partition,
                    key,
                    put.schema_id,
                    &put.value,
                    &rmd_prefixed,
                )
            }
            StorageOperationType::Value => {
                self.chunking
                    .put_value_only(partition, key, put.schema_id, &put.value)
            }
            StorageOperationType::RmdChunk => {
                let rmd_prefixed = crate::storage::chunking::prepend_schema_id(
                    put.schema_id,
                    put.rmd.as_deref().unwrap_or(&[]),
                );
                self.chunking.put_rmd_only(partition, key, &rmd_prefixed)
            }
            StorageOperationType::Skip => Ok(()),
        }
    }

    async fn write_through_delete(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
        partition: u32,
        key: &RecordKey,
        delete: &DeleteOp,
    ) -> IngestionResult<()> {
        let rmd_empty = delete.rmd.as_ref().map(|r| r.is_empty()).unwrap_or(true);
        match self.storage_operation_for_delete(pcs, rmd_empty).await? {
            StorageOperationType::ValueAndRmd => {
                let rmd_prefixed = crate::storage::chunking::prepend_schema_id(
                    delete.schema_id,
                    delete.rmd.as_deref().unwrap_or(&[]),
                );
                self.chunking.delete(partition, key, Some(&rmd_prefixed))
            }
            _ => self.chunking.delete(partition, key, None),
        }
    }

    async fn storage_operation_for_put(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
        value_empty: bool,
        rmd_empty: bool,
    ) -> IngestionResult<StorageOperationType> {
        let state = pcs.lock().await;
        if !state.is_subscribed() {
            debug!(partition = state.partition(), "storage put while unsubscribed, skipping");
            return Ok(StorageOperationType::Skip);
        }
        if value_empty && rmd_empty {
            return Err(IngestionError::InvalidOperation(
                "either value or RMD payload must be non-empty".to_string(),
            ));
        }
        Ok(if rmd_empty {
            StorageOperationType::Value
        } else if !value_empty {
            StorageOperationType::ValueAndRmd
        } else {
            StorageOperationType::RmdChunk
        })
    }

    async fn storage_operation_for_delete(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
        rmd_empty: bool,
    ) -> IngestionResult<StorageOperationType> {
        let state = pcs.lock().await;
        if !state.is_subscribed() {
            debug!(partition = state.partition(), "storage delete while unsubscribed, skipping");
            return Ok(StorageOperationType::Skip);
        }
        // A delete without RMD before end-of-push comes from reprocessing
        // jobs and operates on the value column only.
        Ok(if rmd_empty && !state.is_end_of_push_received() {
            StorageOperationType::Value
        } else {
            StorageOperationType::ValueAndRmd
        })
    }

    async fn track_write_through_offsets(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
        record: &ConsumedRecord,
        region_url: &str,
    ) {
        let mut state = pcs.lock().await;
        if record.topic_partition.topic.kind == TopicKind::VersionTopic {
            state.update_latest_processed_local_vt_offset(record.offset);
            state.touch_vt_activity();
            // Followers attribute the record to the upstream region the
            // leader stamped on it; unstamped records originated locally.
            if let Some(leader_metadata) = record.leader_metadata {
                if let Some(upstream_url) = self.regions.url_of(leader_metadata.upstream_region) {
                    let upstream_url = upstream_url.to_string();
                    state.update_latest_processed_upstream_rt_offset(
                        &upstream_url,
                        leader_metadata.upstream_offset,
                    );
                }
            }
        } else {
            state.update_latest_processed_upstream_rt_offset(region_url, record.offset);
            state.update_leader_consumed_upstream_rt_offset(region_url, record.offset);
        }
    }

    async fn demote_if_unsubscribed(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
        partition: u32,
        err: IngestionError,
    ) -> IngestionResult<()> {
        let subscribed = pcs.lock().await.is_subscribed();
        if subscribed {
            Err(err)
        } else {
            warn!(partition, error = %err, "storage failure after unsubscribe, swallowing");
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Conflict-resolution path
    // ------------------------------------------------------------------

    async fn process_active_active_record(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
        record: &ConsumedRecord,
        region_url: &str,
    ) -> IngestionResult<()> {
        let partition = record.topic_partition.partition;
        let source_region = self.regions.require_id(region_url)?;
        let source_offset = record.offset.max(0) as u64;
        let write_ts = record.write_timestamp();

        // Existing state: transient cache first, storage second.
        let (old_value, old_rmd, old_value_manifest, old_rmd_manifest) =
            self.load_existing_state(pcs, partition, &record.key).await?;

        let offset_sum_before = old_rmd
            .as_ref()
            .map(|r| r.rmd.offset_vector_sum())
            .unwrap_or(0);
        let timestamps_before = old_rmd
            .as_ref()
            .map(|r| r.rmd.timestamps())
            .unwrap_or_else(|| vec![0]);

        let resolve_started = Instant::now();
        let result = match &record.payload {
            RecordPayload::Op(Operation::Put(put)) => self.resolver.put(
                old_value.as_ref(),
                old_rmd.as_ref(),
                put.value.clone(),
                put.schema_id,
                write_ts,
                source_region,
                source_offset,
            )?,
            RecordPayload::Op(Operation::Delete(delete)) => self.resolver.delete(
                old_value.as_ref(),
                old_rmd.as_ref(),
                delete.schema_id,
                write_ts,
                source_region,
                source_offset,
            )?,
            RecordPayload::Op(Operation::Update(update)) => self.resolver.update(
                old_value.as_ref(),
                old_rmd.as_ref(),
                update,
                write_ts,
                source_region,
                source_offset,
            )?,
            RecordPayload::Control(_) => unreachable!("control handled by caller"),
        };

        let applied = match result {
            MergeResult::Ignored => {
                metrics::record_resolution(true, false, false, resolve_started.elapsed().as_secs_f64());
                let mut state = pcs.lock().await;
                state.update_latest_processed_upstream_rt_offset(region_url, record.offset);
                state.update_leader_consumed_upstream_rt_offset(region_url, record.offset);
                return Ok(());
            }
            MergeResult::Applied(applied) => applied,
        };
        metrics::record_resolution(
            false,
            applied.new_value.is_none(),
            old_rmd.is_some(),
            resolve_started.elapsed().as_secs_f64(),
        );

        self.validate_post_resolution(&applied, offset_sum_before, &timestamps_before)?;

        // Recompress the winner when the store carries compression.
        let new_value = match &applied.new_value {
            Some(value) if self.compressor.is_enabled() => {
                Some(self.compressor.compress(value.clone())?)
            }
            other => other.clone(),
        };
        let rmd_prefixed = self
            .rmd_serde
            .encode(applied.value_schema_id, &applied.new_rmd)?;

        // Views observe old and new value; start the fanout before the send
        // is enqueued so the drain can await it.
        let fanout = if self.views.has_writers() {
            self.views.fanout(ViewRecord {
                key: record.key.clone(),
                new_value: new_value.clone(),
                old_value: old_value.as_ref().map(|v| v.value.clone()),
                new_value_schema_id: applied.value_schema_id,
                old_value_schema_id: old_value.as_ref().map(|v| v.schema_id).unwrap_or(-1),
                rmd: applied.new_rmd.clone(),
            })
        } else {
            FanoutHandle::ready()
        };

        let leader_metadata = LeaderMetadata {
            upstream_region: source_region,
            upstream_offset: record.offset,
        };
        let command = match &new_value {
            Some(value) => ProduceCommand::Put {
                key: record.key.clone(),
                value: value.clone(),
                value_schema_id: applied.value_schema_id,
                rmd_prefixed: rmd_prefixed.clone(),
                leader_metadata,
                old_value_manifest,
                old_rmd_manifest,
            },
            None => ProduceCommand::Delete {
                key: record.key.clone(),
                value_schema_id: applied.value_schema_id,
                rmd_prefixed: rmd_prefixed.clone(),
                leader_metadata,
                old_value_manifest,
                old_rmd_manifest,
            },
        };

        // Position allocation and queue insertion happen under the enqueue
        // lock so version-topic order equals decision order; the transient
        // cache is updated before the send is enqueued.
        let enqueue_lock = self
            .enqueue_locks
            .get(&partition)
            .map(|e| e.value().clone())
            .ok_or(IngestionError::PartitionNotSubscribed { partition })?;
        let enqueue_guard = enqueue_lock.lock().await;

        let (position, tracker) = {
            let mut state = pcs.lock().await;
            let position = state.next_produce_position();
            state.set_transient_record(
                record.key.clone(),
                TransientRecord {
                    value: new_value.clone(),
                    value_schema_id: applied.value_schema_id,
                    rmd: applied.new_rmd.clone(),
                    value_manifest: None,
                    rmd_manifest: None,
                    produced_position: position,
                },
            );
            state.update_latest_processed_upstream_rt_offset(region_url, record.offset);
            state.update_leader_consumed_upstream_rt_offset(region_url, record.offset);
            let tracker = state.produce_tracker();
            tracker.begin();
            (position, tracker)
        };

        let queue = self
            .produce_queues
            .get(&partition)
            .map(|e| e.value().clone());
        let Some(queue) = queue else {
            tracker.complete();
            return Err(IngestionError::PartitionNotSubscribed { partition });
        };
        if queue
            .send(ProduceJob {
                position,
                fanout,
                command,
            })
            .await
            .is_err()
        {
            tracker.complete();
            return Err(IngestionError::ProducerFailure {
                partition,
                message: "produce queue closed".to_string(),
            });
        }
        drop(enqueue_guard);
        Ok(())
    }

    /// Old `(value, RMD)` for a key: the transient record is authoritative
    /// when present; otherwise the storage engine is consulted through the
    /// chunking adapter.
    async fn load_existing_state(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
        partition: u32,
        key: &RecordKey,
    ) -> IngestionResult<(
        Option<ValueAndSchema>,
        Option<RmdWithSchemaId>,
        Option<ChunkedValueManifest>,
        Option<ChunkedValueManifest>,
    )> {
        {
            let state = pcs.lock().await;
            if let Some(cached) = state.transient_record(key) {
                metrics::record_lookup("rmd", true);
                metrics::record_lookup("value", true);
                let old_value = cached.value.as_ref().map(|value| {
                    let mut value = value.clone();
                    if self.compressor.is_enabled() {
                        if let Ok(decompressed) = self.compressor.decompress(value.clone()) {
                            value = decompressed;
                        }
                    }
                    ValueAndSchema {
                        value,
                        schema_id: cached.value_schema_id,
                    }
                });
                let old_rmd = Some(RmdWithSchemaId {
                    value_schema_id: cached.value_schema_id,
                    rmd: cached.rmd.clone(),
                });
                return Ok((
                    old_value,
                    old_rmd,
                    cached.value_manifest.clone(),
                    cached.rmd_manifest.clone(),
                ));
            }
        }

        metrics::record_lookup("rmd", false);
        let lookup_started = Instant::now();
        let rmd_record = self.chunking.get_rmd(partition, key)?;
        let (old_rmd, old_rmd_manifest) = match rmd_record {
            Some(record) => {
                let decoded = self.rmd_serde.decode(&record.prefixed_bytes)?;
                (Some(decoded), record.manifest)
            }
            None => (None, None),
        };

        metrics::record_lookup("value", false);
        let value_record = self.chunking.get_value(partition, key)?;
        metrics::STORAGE_LOOKUP_LATENCY_SECONDS.observe(lookup_started.elapsed().as_secs_f64());
        let (old_value, old_value_manifest) = match value_record {
            Some(record) => {
                let mut value = record.value;
                if self.compressor.is_enabled() {
                    value = self.compressor.decompress(value)?;
                }
                (
                    Some(ValueAndSchema {
                        value,
                        schema_id: record.schema_id,
                    }),
                    record.manifest,
                )
            }
            None => (None, None),
        };
        Ok((old_value, old_rmd, old_value_manifest, old_rmd_manifest))
    }

    /// Post-merge sanity: the offset-vector sum and the per-field
    /// timestamps must never move backwards.
    fn validate_post_resolution(
        &self,
        applied: &AppliedMerge,
        offset_sum_before: u128,
        timestamps_before: &[u64],
    ) -> IngestionResult<()> {
        let offset_sum_after = applied.new_rmd.offset_vector_sum();
        if offset_sum_after < offset_sum_before {
            metrics::OFFSET_REGRESSIONS.inc();
            return Err(IngestionError::OffsetRegression {
                before: offset_sum_before,
                after: offset_sum_after,
            });
        }
        let timestamps_after = applied.new_rmd.timestamps();
        for (field, (&before, &after)) in timestamps_before
            .iter()
            .zip(timestamps_after.iter())
            .enumerate()
        {
            if after < before {
                metrics::TIMESTAMP_REGRESSIONS.inc();
                return Err(IngestionError::TimestampRegression {
                    field,
                    before,
                    after,
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Produce drain
    // ------------------------------------------------------------------

    fn start_produce_drain(&self, partition: u32, pcs: Arc<Mutex<PartitionConsumptionState>>) {
        let (tx, mut rx) = mpsc::channel::<ProduceJob>(self.config.produce_queue_depth);
        self.produce_queues.insert(partition, tx);
        let producer = self.producer.clone();
        let chunking = self.chunking.clone();
        let rmd_protocol_version = self.rmd_serde.rmd_protocol_version();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let tracker = pcs.lock().await.produce_tracker();
                let outcome = Self::run_produce_job(
                    partition,
                    &producer,
                    &chunking,
                    rmd_protocol_version,
                    job.fanout,
                    &job.command,
                )
                .await;
                let mut state = pcs.lock().await;
                match outcome {
                    Ok(_vt_offset) => {
                        state.evict_transient_up_to(job.position);
                    }
                    Err(err) => {
                        if state.is_subscribed() {
                            error!(partition, error = %err, "produce pipeline failure, marking partition ERROR");
                            state.set_errored();
                        } else {
                            warn!(partition, error = %err, "produce failure after unsubscribe, swallowing");
                        }
                    }
                }
                drop(state);
                tracker.complete();
            }
            debug!(partition, "produce drain exited");
        });
        self.drains.insert(partition, handle);
    }

    /// Fanout first, then persist, then the version-topic send. The send
    /// resolves on broker acknowledgement, which keeps per-partition FIFO.
    async fn run_produce_job(
        partition: u32,
        producer: &Arc<dyn VersionTopicProducer>,
        chunking: &ChunkingAdapter,
        rmd_protocol_version: i32,
        fanout: FanoutHandle,
        command: &ProduceCommand,
    ) -> IngestionResult<i64> {
        fanout.wait().await?;
        match command {
            ProduceCommand::Put {
                key,
                value,
                value_schema_id,
                rmd_prefixed,
                leader_metadata,
                old_value_manifest,
                old_rmd_manifest,
            } => {
                chunking.put_value_and_rmd(partition, key, *value_schema_id, value, rmd_prefixed)?;
                let offset = producer
                    .put(
                        partition,
                        VtPut {
                            key: key.clone(),
                            value: value.clone(),
                            value_schema_id: *value_schema_id,
                            logical_timestamp: crate::constants::APP_DEFAULT_LOGICAL_TS,
                            leader_metadata: *leader_metadata,
                            rmd: PutMetadata {
                                rmd_protocol_version,
                                rmd_bytes: rmd_prefixed.clone(),
                            },
                            old_value_manifest: old_value_manifest.clone(),
                            old_rmd_manifest: old_rmd_manifest.clone(),
                        },
                    )
                    .await?;
                metrics::record_vt_produce("put");
                Ok(offset)
            }
            ProduceCommand::Delete {
                key,
                value_schema_id,
                rmd_prefixed,
                leader_metadata,
                old_value_manifest,
                old_rmd_manifest,
            } => {
                chunking.delete(partition, key, Some(rmd_prefixed))?;
                let offset = producer
                    .delete(
                        partition,
                        VtDelete {
                            key: key.clone(),
                            logical_timestamp: crate::constants::APP_DEFAULT_LOGICAL_TS,
                            leader_metadata: *leader_metadata,
                            rmd: DeleteMetadata {
                                value_schema_id: *value_schema_id,
                                rmd_protocol_version,
                                rmd_bytes: rmd_prefixed.clone(),
                            },
                            old_value_manifest: old_value_manifest.clone(),
                            old_rmd_manifest: old_rmd_manifest.clone(),
                        },
                    )
                    .await?;
                metrics::record_vt_produce("delete");
                Ok(offset)
            }
        }
    }

    // ------------------------------------------------------------------
    // Control messages and topic switch
    // ------------------------------------------------------------------

    async fn process_control_message(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
        record: &ConsumedRecord,
        control: ControlMessage,
    ) -> IngestionResult<()> {
        let partition = record.topic_partition.partition;
        debug!(partition, kind = control.kind(), "control message");
        match control {
            ControlMessage::StartOfPush {
                timestamp_ms,
                chunked,
            } => {
                let mut state = pcs.lock().await;
                state.on_start_of_push(timestamp_ms);
                state.update_latest_processed_local_vt_offset(record.offset);
                state.touch_vt_activity();
                drop(state);
                self.chunking.storage().put_version_state(StoreVersionState {
                    chunked,
                    start_of_push_timestamp_ms: timestamp_ms,
                    end_of_push_timestamp_ms: 0,
                })?;
                Ok(())
            }
            ControlMessage::EndOfPush { timestamp_ms } => {
                let mut state = pcs.lock().await;
                state.on_end_of_push(timestamp_ms);
                state.update_latest_processed_local_vt_offset(record.offset);
                state.touch_vt_activity();
                drop(state);
                if let Some(mut version_state) = self.chunking.storage().get_version_state()? {
                    version_state.end_of_push_timestamp_ms = timestamp_ms;
                    self.chunking.storage().put_version_state(version_state)?;
                }
                Ok(())
            }
            ControlMessage::TopicSwitch(topic_switch) => {
                if topic_switch.source_brokers.is_empty() {
                    return Err(IngestionError::InvalidOperation(
                        "active/active topic switch carries no source brokers".to_string(),
                    ));
                }
                let is_leader = {
                    let mut state = pcs.lock().await;
                    state.set_topic_switch(topic_switch.clone());
                    state.update_latest_processed_local_vt_offset(record.offset);
                    state.touch_vt_activity();
                    state.is_leader()
                };
                if is_leader {
                    self.leader_execute_topic_switch(pcs, topic_switch).await
                } else {
                    // Followers only note the leader's new source topic;
                    // their feed stays the local version topic.
                    pcs.lock().await.set_source_topic(topic_switch.source_topic);
                    Ok(())
                }
            }
        }
    }

    /// Re-point a leader partition at the topic switch's regional sources.
    ///
    /// Pending version-topic produces are drained before the switch so the
    /// old feed's records are fully emitted; the quorum check runs before
    /// any subscription, so an aborted switch leaves no partial state.
    async fn leader_execute_topic_switch(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
        topic_switch: TopicSwitch,
    ) -> IngestionResult<()> {
        let (partition, current_topic, tracker) = {
            let state = pcs.lock().await;
            if !state.is_leader() {
                return Err(IngestionError::NotLeader {
                    partition: state.partition(),
                    state: state.role().as_str(),
                });
            }
            (
                state.partition(),
                state.source_topic().clone(),
                state.produce_tracker(),
            )
        };

        self.unsubscribe_current_sources(partition, &current_topic).await;
        tracker.wait_drained().await;

        let plan = self
            .calculate_leader_upstream_offsets(pcs, partition, &topic_switch)
            .await;
        let total = topic_switch.source_brokers.len();
        let quorum = (total + 1) / 2;
        if plan.unreachable.len() >= quorum.max(1) && !plan.unreachable.is_empty() {
            metrics::record_topic_switch("aborted");
            return Err(IngestionError::TopicSwitchQuorumFailure {
                unreachable: plan.unreachable.len(),
                total,
            });
        }
        for failed in &plan.unreachable {
            metrics::INGESTION_FAILURES.inc();
            if let (Some(repair), Some(strong_self)) = (&self.repair, self.self_ref.upgrade()) {
                let subscriber: Arc<dyn RepairSubscriber> = strong_self;
                repair.register(
                    &subscriber,
                    RepairTask {
                        partition,
                        region_url: failed.clone(),
                        topic: topic_switch.source_topic.clone(),
                        rewind_start_timestamp: plan.rewind_start_timestamp,
                    },
                );
            } else {
                // No repair service: the error must propagate, or the region
                // would silently never resubscribe.
                metrics::record_topic_switch("aborted");
                return Err(IngestionError::BrokerUnreachable {
                    region: failed.clone(),
                    message: "no repair service available during topic switch".to_string(),
                });
            }
        }

        {
            let mut state = pcs.lock().await;
            let remote = topic_switch.source_brokers.len() != 1
                || topic_switch.source_brokers[0] != self.config.local_region_url;
            state.set_consume_remotely(remote);
            state.set_source_topic(topic_switch.source_topic.clone());
        }

        let tp = TopicPartition::new(topic_switch.source_topic.clone(), partition);
        for (region_url, offset) in &plan.offsets {
            self.consumer_subscribe_checked(region_url, &tp, *offset).await?;
            // The subscription starts at `offset`, so the last consumed
            // position is the one before it.
            let mut state = pcs.lock().await;
            state.update_leader_consumed_upstream_rt_offset(region_url, offset - 1);
        }
        metrics::record_topic_switch("succeeded");
        info!(
            partition,
            topic = %topic_switch.source_topic,
            sources = plan.offsets.len(),
            unreachable = plan.unreachable.len(),
            "topic switch complete"
        );
        Ok(())
    }

    async fn calculate_leader_upstream_offsets(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
        partition: u32,
        topic_switch: &TopicSwitch,
    ) -> UpstreamOffsetPlan {
        let rewind_start_timestamp =
            if topic_switch.rewind_start_timestamp == REWIND_TIME_DECIDED_BY_SERVER {
                let computed = self.calculate_rewind_start_time(pcs).await;
                info!(partition, rewind_start = computed, "server-decided rewind start");
                computed
            } else {
                topic_switch.rewind_start_timestamp
            };

        let tp = TopicPartition::new(topic_switch.source_topic.clone(), partition);
        let mut offsets = HashMap::new();
        let mut unreachable = Vec::new();
        for region_url in &topic_switch.source_brokers {
            let checkpointed = pcs
                .lock()
                .await
                .latest_processed_upstream_rt_offset(region_url);
            if checkpointed >= 0 {
                // Checkpoints record the last processed offset; resume with
                // the record after it.
                offsets.insert(region_url.clone(), checkpointed + 1);
                continue;
            }
            if rewind_start_timestamp <= 0 {
                warn!(
                    partition,
                    region = %region_url,
                    rewind_start_timestamp,
                    "unexpected rewind time, starting from the beginning"
                );
                offsets.insert(region_url.clone(), LOWEST_OFFSET);
                continue;
            }
            match self
                .consumer
                .offset_for_time(region_url, &tp, rewind_start_timestamp)
                .await
            {
                Ok(offset) => {
                    info!(
                        partition,
                        region = %region_url,
                        offset,
                        rewind_start_timestamp,
                        "resolved rewind offset"
                    );
                    offsets.insert(region_url.clone(), offset);
                }
                Err(err) => {
                    // An asymmetric outage must not rewind this region to a
                    // nondeterministic offset once it heals; the pair goes to
                    // the repair queue and nothing is checkpointed for it.
                    error!(
                        partition,
                        region = %region_url,
                        error = %err,
                        "failed to resolve rewind offset during topic switch"
                    );
                    unreachable.push(region_url.clone());
                }
            }
        }
        UpstreamOffsetPlan {
            offsets,
            unreachable,
            rewind_start_timestamp,
        }
    }

    async fn calculate_rewind_start_time(
        &self,
        pcs: &Arc<Mutex<PartitionConsumptionState>>,
    ) -> i64 {
        let rewind_ms = self.config.rewind_time_seconds.saturating_mul(1000);
        let state = pcs.lock().await;
        let anchor = match self.config.buffer_replay_policy {
            BufferReplayPolicy::RewindFromSop => state.start_of_push_timestamp_ms(),
            BufferReplayPolicy::RewindFromEop => state.end_of_push_timestamp_ms(),
        };
        anchor - rewind_ms
    }

    // ------------------------------------------------------------------
    // Leader promotion
    // ------------------------------------------------------------------

    /// Flip a follower to leader once the local version topic has been idle
    /// for the configured window. Returns whether the flip happened.
    pub async fn maybe_promote_to_leader(&self, partition: u32) -> IngestionResult<bool> {
        let Some(pcs) = self.partition_state(partition) else {
            return Err(IngestionError::PartitionNotSubscribed { partition });
        };
        {
            let state = pcs.lock().await;
            if state.role() != ReplicaRole::Follower {
                return Ok(false);
            }
            if state.vt_idle_for() < self.config.leader_promotion_idle_window {
                return Ok(false);
            }
        }
        self.start_consuming_as_leader(partition).await?;
        Ok(true)
    }

    /// Promote immediately: adopt the leader role and start consuming from
    /// the topic-switch sources (remotely when any source is not local).
    pub async fn start_consuming_as_leader(&self, partition: u32) -> IngestionResult<()> {
        let Some(pcs) = self.partition_state(partition) else {
            return Err(IngestionError::PartitionNotSubscribed { partition });
        };
        let topic_switch = {
            let mut state = pcs.lock().await;
            state.set_role(ReplicaRole::TransitioningToLeader);
            state.topic_switch().cloned()
        };
        match topic_switch {
            Some(topic_switch) => {
                {
                    let mut state = pcs.lock().await;
                    state.set_role(ReplicaRole::Leader);
                }
                // Leave the version-topic feed and take over the regional
                // sources at checkpointed offsets (or rewind).
                let vt = TopicPartition::new(self.version_topic.clone(), partition);
                if let Err(err) = self
                    .consumer
                    .unsubscribe(&self.config.local_region_url, &vt)
                    .await
                {
                    warn!(partition, error = %err, "failed to leave version topic on promotion");
                }
                self.leader_execute_topic_switch(&pcs, topic_switch).await
            }
            None => {
                // No switch yet: lead on the version topic until one arrives.
                let mut state = pcs.lock().await;
                state.set_role(ReplicaRole::Leader);
                info!(partition, "promoted to leader on version topic");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Lag and readiness
    // ------------------------------------------------------------------

    /// Aggregate hybrid offset lag against one region across leader
    /// partitions consuming real-time sources.
    pub async fn region_hybrid_offset_lag(&self, region: RegionId) -> i64 {
        let Some(region_url) = self.regions.url_of(region).map(String::from) else {
            return 0;
        };
        match self.chunking.storage().get_version_state() {
            Ok(Some(_)) => {}
            _ => return 0,
        }
        let mut total = 0i64;
        for entry in self.partitions.iter() {
            let pcs = entry.value().clone();
            let (is_rt_leader, consumed, partition) = {
                let state = pcs.lock().await;
                (
                    state.is_leader() && state.source_topic().is_real_time(),
                    state.leader_consumed_upstream_rt_offset(&region_url),
                    state.partition(),
                )
            };
            if !is_rt_leader {
                continue;
            }
            let tp = TopicPartition::new(self.real_time_topic.clone(), partition);
            match self.consumer.end_offset(&region_url, &tp).await {
                // `consumed` is the last processed offset; the next expected
                // record is `consumed + 1` and `end` is one past the log.
                Ok(end) => total += (end - (consumed + 1).max(0)).max(0),
                Err(err) => {
                    debug!(partition, region = %region_url, error = %err, "lag probe failed");
                }
            }
        }
        total.max(0)
    }

    /// Max real-time lag across this partition's source regions. One
    /// unreachable region falls back to the reachable ones; more than one
    /// reports `i64::MAX` (not ready).
    pub async fn measure_rt_offset_lag_multi_region(&self, partition: u32) -> IngestionResult<i64> {
        let Some(pcs) = self.partition_state(partition) else {
            return Err(IngestionError::PartitionNotSubscribed { partition });
        };
        let (sources, consumed_by_region) = {
            let state = pcs.lock().await;
            let sources: Vec<String> = state
                .topic_switch()
                .map(|ts| ts.source_brokers.clone())
                .unwrap_or_default();
            let consumed: HashMap<String, i64> = sources
                .iter()
                .map(|url| (url.clone(), state.leader_consumed_upstream_rt_offset(url)))
                .collect();
            (sources, consumed)
        };
        if sources.is_empty() {
            return Ok(0);
        }
        let tp = TopicPartition::new(self.real_time_topic.clone(), partition);
        let mut max_lag = 0i64;
        let mut unreachable = 0usize;
        for region_url in &sources {
            match self.consumer.end_offset(region_url, &tp).await {
                Ok(end) => {
                    let consumed = consumed_by_region
                        .get(region_url)
                        .copied()
                        .unwrap_or(LOWEST_OFFSET);
                    max_lag = max_lag.max((end - (consumed + 1).max(0)).max(0));
                }
                Err(err) => {
                    warn!(partition, region = %region_url, error = %err, "lag measurement failed");
                    unreachable += 1;
                    if unreachable > 1 {
                        return Ok(i64::MAX);
                    }
                }
            }
        }
        Ok(max_lag)
    }

    /// Whether the partition's lag is under the online threshold. Records
    /// the readiness lag metric and latches `lag_caught_up`.
    pub async fn is_ready_to_serve(&self, partition: u32) -> IngestionResult<bool> {
        let lag = self.measure_rt_offset_lag_multi_region(partition).await?;
        metrics::set_ready_to_serve_lag(partition, lag);
        let ready = lag <= self.config.offset_lag_threshold_to_go_online;
        if ready {
            if let Some(pcs) = self.partition_state(partition) {
                pcs.lock().await.set_lag_caught_up(true);
            }
        }
        Ok(ready)
    }

    /// True when some partition announced ready-to-serve but is lagging
    /// again (post-caughtup errors or lag growth).
    pub async fn is_ready_to_serve_announced_with_lag(&self) -> bool {
        if self.config.offset_lag_threshold_to_go_online < 0 {
            return false;
        }
        let partitions: Vec<u32> = self.partitions.iter().map(|e| *e.key()).collect();
        for partition in partitions {
            let caught_up = match self.partition_state(partition) {
                Some(pcs) => pcs.lock().await.has_lag_caught_up(),
                None => continue,
            };
            if !caught_up {
                continue;
            }
            match self.is_ready_to_serve(partition).await {
                Ok(true) => {}
                // Lagging again, or something was unreachable: report amiss.
                Ok(false) | Err(_) => return true,
            }
        }
        false
    }
}

/// Outcome of the per-region rewind-offset computation for a topic switch.
struct UpstreamOffsetPlan {
    offsets: HashMap<String, i64>,
    unreachable: Vec<String>,
    rewind_start_timestamp: i64,
}

#[async_trait]
impl RepairSubscriber for ActiveActiveIngestionTask {
    async fn resolve_rewind_offset(&self, task: &RepairTask) -> IngestionResult<i64> {
        let tp = TopicPartition::new(task.topic.clone(), task.partition);
        self.consumer
            .offset_for_time(&task.region_url, &tp, task.rewind_start_timestamp)
            .await
    }

    async fn resubscribe(&self, task: &RepairTask, offset: i64) -> IngestionResult<()> {
        let tp = TopicPartition::new(task.topic.clone(), task.partition);
        self.consumer_subscribe_checked(&task.region_url, &tp, offset).await?;
        if let Some(pcs) = self.partition_state(task.partition) {
            let mut state = pcs.lock().await;
            state.update_leader_consumed_upstream_rt_offset(&task.region_url, offset - 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::mock::{MockBroker, MockVersionTopicProducer};
    use crate::schema::{SchemaCache, StaticSchemaRepository};
    use crate::storage::{InMemoryStorageEngine, NoOpCompressor};

    fn task_with_regions(region_urls: Vec<String>) -> Arc<ActiveActiveIngestionTask> {
        let config = IngestionConfig {
            store_name: "orders".to_string(),
            version: 1,
            local_region_url: region_urls[0].clone(),
            region_urls,
            partition_count: 2,
            ..IngestionConfig::default()
        };
        let repo = StaticSchemaRepository::new().with_record_level(1);
        ActiveActiveIngestionTask::new(
            config,
            IngestionDeps {
                consumer: Arc::new(MockBroker::new()),
                producer: Arc::new(MockVersionTopicProducer::new()),
                storage: Arc::new(InMemoryStorageEngine::new()),
                schemas: SchemaCache::new(Arc::new(repo)),
                views: ViewWriterFanout::default(),
                compressor: Arc::new(NoOpCompressor),
                repair: None,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn rewind_start_time_follows_buffer_replay_policy() {
        let task = task_with_regions(vec!["pubsub://a".to_string()]);
        task.subscribe_partition(0, 0).await.unwrap();
        let pcs = task.partition_state(0).unwrap();
        {
            let mut state = pcs.lock().await;
            state.on_start_of_push(1_000_000);
            state.on_end_of_push(2_000_000);
        }
        // Default policy rewinds from end-of-push.
        let rewind = task.calculate_rewind_start_time(&pcs).await;
        assert_eq!(
            rewind,
            2_000_000 - task.config.rewind_time_seconds * 1000
        );
    }

    #[tokio::test]
    async fn storage_operation_typing_for_put() {
        let task = task_with_regions(vec!["pubsub://a".to_string()]);
        task.subscribe_partition(0, 0).await.unwrap();
        let pcs = task.partition_state(0).unwrap();

        assert_eq!(
            task.storage_operation_for_put(&pcs, false, true).await.unwrap(),
            StorageOperationType::Value
        );
        assert_eq!(
            task.storage_operation_for_put(&pcs, false, false).await.unwrap(),
            StorageOperationType::ValueAndRmd
        );
        assert_eq!(
            task.storage_operation_for_put(&pcs, true, false).await.unwrap(),
            StorageOperationType::RmdChunk
        );
        assert!(task.storage_operation_for_put(&pcs, true, true).await.is_err());

        pcs.lock().await.set_unsubscribed();
        assert_eq!(
            task.storage_operation_for_put(&pcs, false, false).await.unwrap(),
            StorageOperationType::Skip
        );
    }

    #[tokio::test]
    async fn storage_operation_typing_for_delete() {
        let task = task_with_regions(vec!["pubsub://a".to_string()]);
        task.subscribe_partition(0, 0).await.unwrap();
        let pcs = task.partition_state(0).unwrap();

        // Pre-EOP delete without RMD touches the value column only.
        assert_eq!(
            task.storage_operation_for_delete(&pcs, true).await.unwrap(),
            StorageOperationType::Value
        );
        pcs.lock().await.on_end_of_push(1);
        assert_eq!(
            task.storage_operation_for_delete(&pcs, true).await.unwrap(),
            StorageOperationType::ValueAndRmd
        );
    }

    #[tokio::test]
    async fn post_resolution_validation_catches_regressions() {
        let task = task_with_regions(vec!["pubsub://a".to_string()]);
        let applied = AppliedMerge {
            new_value: None,
            new_rmd: crate::rmd::ReplicationMetadata::record_level(5, vec![1, 0]),
            value_schema_id: 1,
            reuses_input: false,
        };
        // Offset sum went from 10 to 1.
        assert!(matches!(
            task.validate_post_resolution(&applied, 10, &[1]),
            Err(IngestionError::OffsetRegression { .. })
        ));
        // Timestamp went from 9 to 5.
        assert!(matches!(
            task.validate_post_resolution(&applied, 0, &[9]),
            Err(IngestionError::TimestampRegression { .. })
        ));
        // Clean case.
        assert!(task.validate_post_resolution(&applied, 1, &[4]).is_ok());
    }

    #[tokio::test]
    async fn unknown_region_is_refused_on_subscribe() {
        let task = task_with_regions(vec!["pubsub://a".to_string()]);
        let tp = TopicPartition::new(task.real_time_topic().clone(), 0);
        let err = task
            .consumer_subscribe_checked("pubsub://nowhere", &tp, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::UnknownRegion { .. }));
    }
}
