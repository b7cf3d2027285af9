//! Per-worker task lifecycle runtime building blocks.
//!
//! Architecture role:
//! - owns the mutable lifetime of one stage task on a worker node;
//! - routes control commands (create/update/cancel/abort/fail) and publishes
//!   versioned status snapshots consumed by long-poll clients;
//! - brokers output-buffer lifecycle for downstream consumers;
//! - tracks dynamic-filter domains produced during execution;
//! - hosts the process-wide catalog registry.
//!
//! Key modules:
//! - [`task`]: the task coordinator, the public entry point
//! - [`state`]: the lifecycle state machine
//! - [`beacon`]: monotonic status versioning for long-poll wake-ups
//! - [`holder`]: tri-state execution snapshot
//! - [`execution`] / [`buffer`]: collaborator contracts
//! - [`dynamic_filters`]: versioned predicate-domain deltas
//! - [`catalog`]: concurrent catalog registry

pub mod beacon;
pub mod buffer;
pub mod catalog;
pub mod dynamic_filters;
pub mod execution;
pub mod holder;
pub mod state;
pub mod status;
pub mod task;

pub use beacon::{VersionBeacon, STARTING_VERSION};
pub use buffer::{
    BufferInfo, LazyOutputBuffer, OutputBuffer, OutputBufferFactory, OutputBufferKind,
    OutputBufferSpec, ResultsPage,
};
pub use catalog::{Catalog, CatalogHandle, CatalogRegistry};
pub use dynamic_filters::{
    Domain, DynamicFiltersCollector, ScalarValue, VersionedDynamicFilterDomains,
    INITIAL_DYNAMIC_FILTERS_VERSION,
};
pub use execution::{
    PlanFragment, QueryContext, Session, Split, SplitAssignment, TaskExecution,
    TaskExecutionFactory, TaskRuntimeContext,
};
pub use holder::{FinalTaskHolder, HolderCell, TaskHolder};
pub use state::{FailureInfo, SourceTaskFailure, TaskState, TaskStateMachine};
pub use status::{IoStats, PipelineStatus, TaskInfo, TaskStats, TaskStatus};
pub use task::{OnDone, WorkerTask};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
