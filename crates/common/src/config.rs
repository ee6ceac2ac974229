use serde::{Deserialize, Serialize};

/// Behavior when a record arrives with an event time older than the
/// current watermark.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LateRecordPolicy {
    /// Process the record anyway (aggregates may re-fire).
    Accept,
    /// Silently drop the record.
    Drop,
}

impl Default for LateRecordPolicy {
    fn default() -> Self {
        Self::Accept
    }
}

/// Global engine/session configuration shared across planner/runtime layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bounded channel capacity for shuffle and join fan-in boundaries.
    /// A full channel blocks the producing partition (backpressure).
    pub channel_capacity: usize,

    /// Partition count hint used when a source can shard its scan.
    pub partitions: usize,

    /// Late record handling for event-time operators.
    #[serde(default)]
    pub late_record_policy: LateRecordPolicy,

    /// One bounded retry for transient source failures.
    #[serde(default = "default_retry_transient")]
    pub retry_transient_source_errors: bool,
}

fn default_retry_transient() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            partitions: 1,
            late_record_policy: LateRecordPolicy::default(),
            retry_transient_source_errors: true,
        }
    }
}
