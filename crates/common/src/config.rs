use serde::{Deserialize, Serialize};

/// Byte limits applied to a task output buffer at construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputBufferLimits {
    /// Maximum buffered bytes for partitioned/arbitrary output.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: u64,
    /// Maximum buffered bytes for broadcast output, which holds one copy of
    /// every page per consumer and therefore gets a larger budget.
    #[serde(default = "default_max_broadcast_buffer_bytes")]
    pub max_broadcast_buffer_bytes: u64,
}

fn default_max_buffer_bytes() -> u64 {
    32 * 1024 * 1024 // 32MB
}

fn default_max_broadcast_buffer_bytes() -> u64 {
    200 * 1024 * 1024 // 200MB
}

impl Default for OutputBufferLimits {
    fn default() -> Self {
        Self {
            max_buffer_bytes: default_max_buffer_bytes(),
            max_broadcast_buffer_bytes: default_max_broadcast_buffer_bytes(),
        }
    }
}
