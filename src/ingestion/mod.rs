//! The active/active ingestion engine.
//!
//! Component map:
//! - [`locks`]: striped key-level lock pool serializing per-key resolution
//! - [`transient`]: per-partition cache of resolved-but-unacked state
//! - [`partition`]: per-partition consumption state and produce tracking
//! - [`views`]: fan-out of winners to derived view streams
//! - [`repair`]: background rewind-resubscribe repair for unreachable regions
//! - [`task`]: the per-store-version task tying the loop together

pub mod locks;
pub mod partition;
pub mod repair;
pub mod task;
pub mod transient;
pub mod views;

pub use locks::{KeyLevelLockManager, KeyLockGuard};
pub use partition::{OffsetSnapshot, PartitionConsumptionState, ProduceTracker};
pub use repair::{RemoteIngestionRepairService, RepairSubscriber, RepairTask};
pub use task::{ActiveActiveIngestionTask, IngestionDeps};
pub use transient::{TransientRecord, TransientRecordCache};
pub use views::{FanoutHandle, ViewRecord, ViewWriter, ViewWriterFanout};
