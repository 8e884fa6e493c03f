//! Crate-wide constants: protocol sentinels and tuning defaults.

use std::time::Duration;

/// Sentinel carried in a topic-switch control message when the control plane
/// delegates the rewind-start computation to the server.
pub const REWIND_TIME_DECIDED_BY_SERVER: i64 = -1;

/// Sentinel for "offset not yet known" in checkpointed upstream offset maps.
pub const LOWEST_OFFSET: i64 = -1;

/// Sentinel logical timestamp meaning "no application-provided timestamp";
/// resolution falls back to the broker-assigned message timestamp.
pub const APP_DEFAULT_LOGICAL_TS: i64 = -1;

/// Reserved schema id marking a stored record as a chunked-value manifest.
pub const MANIFEST_SCHEMA_ID: i32 = -20;

/// Reserved schema id marking a stored record as a single chunk of a larger value.
pub const CHUNK_SCHEMA_ID: i32 = -10;

/// Width of the big-endian schema-id header prepended to stored values and RMD.
pub const SCHEMA_ID_HEADER_LEN: usize = 4;

/// Default split threshold for values that exceed the wire size limit.
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 1024 * 1024;

/// Default bound of the per-partition produce queue. Provides backpressure
/// between resolution and the version-topic producer.
pub const DEFAULT_PRODUCE_QUEUE_DEPTH: usize = 256;

/// Default consumer poll timeout.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a promoted replica must observe an idle local version topic
/// before flipping to leader.
pub const DEFAULT_LEADER_PROMOTION_IDLE_WINDOW: Duration = Duration::from_secs(300);

/// Default per-store rewind window applied when the control plane uses
/// [`REWIND_TIME_DECIDED_BY_SERVER`].
pub const DEFAULT_REWIND_TIME_SECONDS: i64 = 24 * 60 * 60;

/// Attempts a repair task makes before escalating to the region health alarm.
pub const DEFAULT_REPAIR_MAX_ATTEMPTS: usize = 10;

/// Lag threshold (records) under which a partition reports ready-to-serve.
pub const DEFAULT_OFFSET_LAG_THRESHOLD: i64 = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_schema_ids_are_negative_and_distinct() {
        assert!(MANIFEST_SCHEMA_ID < 0);
        assert!(CHUNK_SCHEMA_ID < 0);
        assert_ne!(MANIFEST_SCHEMA_ID, CHUNK_SCHEMA_ID);
    }

    #[test]
    fn sentinels() {
        assert_eq!(REWIND_TIME_DECIDED_BY_SERVER, -1);
        assert_eq!(LOWEST_OFFSET, -1);
        assert_eq!(APP_DEFAULT_LOGICAL_TS, -1);
    }
}
