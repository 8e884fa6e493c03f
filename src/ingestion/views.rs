//! View writer fanout.
//!
//! A winning record is echoed into zero or more derived view streams before
//! the version-topic send is enqueued: the version topic must not get ahead
//! of its views, since followers rebuild views from the version topic. The
//! fanout runs the writers concurrently and hands back a handle that
//! resolves once every view stream has acknowledged.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{IngestionError, IngestionResult};
use crate::metrics;
use crate::rmd::ReplicationMetadata;
use crate::types::RecordKey;

/// The change handed to each view writer.
#[derive(Debug, Clone)]
pub struct ViewRecord {
    pub key: RecordKey,
    /// `None` is a tombstone.
    pub new_value: Option<Bytes>,
    pub old_value: Option<Bytes>,
    pub new_value_schema_id: i32,
    /// `-1` when there was no prior value.
    pub old_value_schema_id: i32,
    pub rmd: ReplicationMetadata,
}

/// One derived view stream.
#[async_trait]
pub trait ViewWriter: Send + Sync {
    fn name(&self) -> &str;

    /// Write the change to the view stream; resolves on acknowledgement.
    async fn process_record(&self, record: ViewRecord) -> IngestionResult<()>;
}

/// Resolves when all view writers acknowledged one record.
pub struct FanoutHandle {
    started_at: Instant,
    writes: Vec<(String, JoinHandle<IngestionResult<()>>)>,
}

impl FanoutHandle {
    /// An already-complete handle, used when no views are registered.
    pub fn ready() -> Self {
        FanoutHandle {
            started_at: Instant::now(),
            writes: Vec::new(),
        }
    }

    /// Await every view acknowledgement; fails on the first view error.
    pub async fn wait(self) -> IngestionResult<()> {
        let had_writes = !self.writes.is_empty();
        for (view, handle) in self.writes {
            match handle.await {
                Ok(result) => result?,
                Err(join_err) => {
                    warn!(view, error = %join_err, "view writer task aborted");
                    return Err(IngestionError::ProducerFailure {
                        partition: 0,
                        message: format!("view writer {view} aborted: {join_err}"),
                    });
                }
            }
        }
        if had_writes {
            metrics::record_view_fanout(self.started_at.elapsed().as_secs_f64());
        }
        Ok(())
    }
}

/// Fan-out over the registered view writers of a store-version.
#[derive(Clone, Default)]
pub struct ViewWriterFanout {
    writers: Vec<Arc<dyn ViewWriter>>,
}

impl ViewWriterFanout {
    pub fn new(writers: Vec<Arc<dyn ViewWriter>>) -> Self {
        ViewWriterFanout { writers }
    }

    pub fn has_writers(&self) -> bool {
        !self.writers.is_empty()
    }

    /// Start all view writes for `record` concurrently.
    pub fn fanout(&self, record: ViewRecord) -> FanoutHandle {
        if self.writers.is_empty() {
            return FanoutHandle::ready();
        }
        let writes = self
            .writers
            .iter()
            .map(|writer| {
                let writer = writer.clone();
                let record = record.clone();
                (
                    writer.name().to_string(),
                    tokio::spawn(async move { writer.process_record(record).await }),
                )
            })
            .collect();
        FanoutHandle {
            started_at: Instant::now(),
            writes,
        }
    }
}

impl std::fmt::Debug for ViewWriterFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewWriterFanout")
            .field("writers", &self.writers.len())
            .finish()
    }
}
