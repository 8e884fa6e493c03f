//! Remote ingestion repair service.
//!
//! When a topic switch cannot resolve a rewind offset for a region (its
//! broker is unreachable), the partition keeps consuming from the regions
//! that did resolve and the failed `(partition, region)` pair lands here. A
//! background worker retries the timestamp-to-offset lookup with jittered
//! exponential backoff and, once it succeeds, resubscribes the partition and
//! syncs the offset back into its consumption state.
//!
//! The service holds only weak handles to its subscribers: when a task shuts
//! down, its pending repairs become no-ops instead of keeping it alive.

use std::sync::{Arc, Weak};

use backon::{ExponentialBuilder, Retryable};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::IngestionResult;
use crate::metrics;
use crate::types::Topic;

/// One rewind-resubscribe unit of work.
#[derive(Debug, Clone)]
pub struct RepairTask {
    pub partition: u32,
    pub region_url: String,
    pub topic: Topic,
    pub rewind_start_timestamp: i64,
}

/// The side of the ingestion task the repair worker calls back into.
#[async_trait]
pub trait RepairSubscriber: Send + Sync {
    /// Re-run the timestamp-to-offset lookup for the failed region.
    async fn resolve_rewind_offset(&self, task: &RepairTask) -> IngestionResult<i64>;

    /// Subscribe the partition at the resolved offset and sync it into the
    /// partition's consumption state.
    async fn resubscribe(&self, task: &RepairTask, offset: i64) -> IngestionResult<()>;
}

/// Backoff applied between repair attempts. Jitter keeps a regional outage
/// from thundering every partition's retry at once.
fn repair_policy(max_attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(60))
        .with_max_times(max_attempts)
        .with_jitter()
}

struct QueuedRepair {
    task: RepairTask,
    subscriber: Weak<dyn RepairSubscriber>,
}

/// Queue plus background worker re-running failed rewind lookups.
pub struct RemoteIngestionRepairService {
    queue: mpsc::UnboundedSender<QueuedRepair>,
    worker: JoinHandle<()>,
}

impl RemoteIngestionRepairService {
    pub fn start(max_attempts: usize) -> Arc<Self> {
        let (queue, mut rx) = mpsc::unbounded_channel::<QueuedRepair>();
        let worker = tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                Self::run_repair(queued, max_attempts).await;
            }
        });
        Arc::new(RemoteIngestionRepairService { queue, worker })
    }

    /// Register a failed rewind for background repair.
    pub fn register(&self, subscriber: &Arc<dyn RepairSubscriber>, task: RepairTask) {
        info!(
            partition = task.partition,
            region = %task.region_url,
            topic = %task.topic,
            rewind_ts = task.rewind_start_timestamp,
            "registering remote ingestion repair task"
        );
        metrics::record_repair_task("registered");
        if self
            .queue
            .send(QueuedRepair {
                task,
                subscriber: Arc::downgrade(subscriber),
            })
            .is_err()
        {
            warn!("repair service already shut down; dropping repair task");
        }
    }

    pub fn shutdown(&self) {
        self.worker.abort();
    }

    async fn run_repair(queued: QueuedRepair, max_attempts: usize) {
        let task = queued.task;
        let subscriber = queued.subscriber;

        let attempt = || {
            let task = task.clone();
            let subscriber = subscriber.clone();
            async move {
                // A dead subscriber means the ingestion task shut down; the
                // repair becomes a no-op.
                let Some(subscriber) = subscriber.upgrade() else {
                    return Ok(None);
                };
                let offset = subscriber.resolve_rewind_offset(&task).await?;
                subscriber.resubscribe(&task, offset).await?;
                Ok(Some(offset))
            }
        };

        match attempt
            .retry(repair_policy(max_attempts))
            .when(|e: &crate::error::IngestionError| e.is_transient())
            .await
        {
            Ok(Some(offset)) => {
                info!(
                    partition = task.partition,
                    region = %task.region_url,
                    offset,
                    "repaired consumption and resubscribed"
                );
                metrics::record_repair_task("repaired");
            }
            Ok(None) => {
                metrics::record_repair_task("orphaned");
            }
            Err(err) => {
                // Out of attempts: escalate. The alarm itself is externalized;
                // we account for it and keep serving the reachable regions.
                error!(
                    partition = task.partition,
                    region = %task.region_url,
                    error = %err,
                    "repair attempts exhausted, raising region health alarm"
                );
                metrics::record_repair_task("exhausted");
                metrics::record_region_health_alarm(&task.region_url);
            }
        }
    }
}

impl Drop for RemoteIngestionRepairService {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
