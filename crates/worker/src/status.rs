//! Point-in-time task snapshots served to long-poll clients.

use std::collections::BTreeSet;

use quarry_common::{PlanNodeId, TaskId};
use serde::{Deserialize, Serialize};

use crate::buffer::BufferInfo;
use crate::state::{FailureInfo, TaskState};

/// Byte/row counters for task input and output streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoStats {
    /// Bytes read from task inputs.
    pub input_bytes: u64,
    /// Rows read from task inputs.
    pub input_rows: u64,
    /// Bytes handed to the output buffer.
    pub output_bytes: u64,
    /// Rows handed to the output buffer.
    pub output_rows: u64,
}

/// Live driver counters for one pipeline of the execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// Pipeline index within the execution.
    pub pipeline_id: u32,
    /// Drivers waiting for a thread.
    pub queued_drivers: u32,
    /// Total split weight behind queued drivers.
    pub queued_splits_weight: u64,
    /// Drivers currently running.
    pub running_drivers: u32,
    /// Total split weight behind running drivers.
    pub running_splits_weight: u64,
    /// Bytes physically written by this pipeline.
    pub physical_written_bytes: u64,
}

/// Versioned control-plane snapshot polled by the coordinator node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Task this status describes.
    pub task_id: TaskId,
    /// Per-instance UUID regenerated on task creation; lets peers detect a
    /// worker restart mid-query.
    pub instance_id: String,
    /// Status version at the moment the snapshot was taken.
    pub version: u64,
    /// Lifecycle state.
    pub state: TaskState,
    /// URI of the worker hosting the task.
    pub location: String,
    /// Node id of the worker hosting the task.
    pub node_id: String,
    /// Failure causes; empty unless the state is failed.
    pub failures: Vec<FailureInfo>,
    /// Drivers waiting for a thread, summed over pipelines.
    pub queued_drivers: u32,
    /// Split weight behind queued drivers.
    pub queued_splits_weight: u64,
    /// Drivers currently running, summed over pipelines.
    pub running_drivers: u32,
    /// Split weight behind running drivers.
    pub running_splits_weight: u64,
    /// Whether the output buffer is over its utilization threshold.
    pub output_buffer_overutilized: bool,
    /// Bytes physically written by the task.
    pub physical_written_bytes: u64,
    /// Current user-memory reservation in bytes.
    pub user_memory_bytes: u64,
    /// Peak user-memory reservation in bytes.
    pub peak_user_memory_bytes: u64,
    /// Current revocable-memory reservation in bytes.
    pub revocable_memory_bytes: u64,
    /// Spill operations performed by the task.
    pub spill_count: u64,
    /// Total time spent spilling, in milliseconds.
    pub spill_time_ms: u64,
    /// High-water version of the task's produced dynamic filters.
    pub dynamic_filters_version: u64,
}

/// Cumulative execution statistics reported in [`TaskInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Unix-ms task creation timestamp.
    pub created_at_ms: u64,
    /// Unix-ms terminal timestamp, if the task has ended.
    pub end_at_ms: Option<u64>,
    /// Drivers waiting for a thread.
    pub queued_drivers: u32,
    /// Split weight behind queued drivers.
    pub queued_splits_weight: u64,
    /// Drivers currently running.
    pub running_drivers: u32,
    /// Split weight behind running drivers.
    pub running_splits_weight: u64,
    /// Bytes physically written by the task.
    pub physical_written_bytes: u64,
    /// Current user-memory reservation in bytes.
    pub user_memory_bytes: u64,
    /// Peak user-memory reservation in bytes.
    pub peak_user_memory_bytes: u64,
    /// Current revocable-memory reservation in bytes.
    pub revocable_memory_bytes: u64,
    /// Spill operations performed by the task.
    pub spill_count: u64,
    /// Total time spent spilling, in milliseconds.
    pub spill_time_ms: u64,
    /// Input/output byte and row counters.
    pub io: IoStats,
}

/// Full task snapshot: status plus buffer, split, and stats detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Control-plane status.
    pub status: TaskStatus,
    /// Unix-ms timestamp of the last supervisor heartbeat.
    pub last_heartbeat_ms: u64,
    /// Output buffer utilization/progress snapshot.
    pub output_buffer_info: BufferInfo,
    /// Plan nodes whose split intake is complete.
    pub no_more_splits: BTreeSet<PlanNodeId>,
    /// Cumulative execution statistics.
    pub stats: TaskStats,
    /// Whether the task is still waiting for its first plan fragment.
    pub needs_plan: bool,
}
