//! Execution-side contracts consumed by the task coordinator.
//!
//! The operator runtime that schedules drivers lives outside this crate; the
//! coordinator only needs the factory seam, the split-intake surface, and the
//! task-scoped runtime context that execution mutates while drivers run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quarry_common::{DynamicFilterId, PlanNodeId, QuarryError, QueryId, Result, TaskId};
use serde::{Deserialize, Serialize};

use crate::buffer::OutputBuffer;
use crate::dynamic_filters::{Domain, DynamicFiltersCollector, VersionedDynamicFilterDomains};
use crate::state::TaskStateMachine;
use crate::status::{IoStats, PipelineStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Session context under which a task executes.
pub struct Session {
    /// Query this session belongs to.
    pub query_id: QueryId,
    /// Opaque token routed to failure-injection hooks; the first non-empty
    /// token seen by a task wins.
    pub trace_token: Option<String>,
    /// Default catalog for name resolution.
    pub catalog: Option<String>,
    /// Default schema for name resolution.
    pub schema: Option<String>,
    /// Unix-ms session start timestamp.
    pub start_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Serialized plan fragment dispatched by the coordinator node.
pub struct PlanFragment {
    /// Encoded physical-plan subtree for this stage.
    pub plan_json: Vec<u8>,
    /// Plan nodes that receive split assignments.
    pub partitioned_sources: Vec<PlanNodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One unit of input data assigned to a task.
pub struct Split {
    /// Split identifier unique within the task.
    pub split_id: u64,
    /// Scheduling weight.
    pub weight: u64,
    /// Encoded connector-specific split payload.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Batch of splits targeted at one plan node.
pub struct SplitAssignment {
    /// Receiving plan node.
    pub plan_node_id: PlanNodeId,
    /// Splits to enqueue.
    pub splits: Vec<Split>,
    /// Whether this node's split intake is complete after the batch.
    pub no_more_splits: bool,
}

/// Query-level memory accounting shared by all tasks of one query on a
/// worker.
#[derive(Debug)]
pub struct QueryContext {
    query_id: QueryId,
    memory_limit_bytes: u64,
    reserved_bytes: AtomicU64,
}

impl QueryContext {
    /// Create a context with a byte budget shared across the query's tasks.
    pub fn new(query_id: QueryId, memory_limit_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            query_id,
            memory_limit_bytes,
            reserved_bytes: AtomicU64::new(0),
        })
    }

    /// Query this context accounts for.
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Byte budget for the query on this worker.
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    /// Bytes currently reserved across the query's tasks.
    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes.load(Ordering::Acquire)
    }

    /// Reserve `bytes` against the query budget.
    pub fn try_reserve(&self, bytes: u64) -> Result<()> {
        loop {
            let current = self.reserved_bytes.load(Ordering::Acquire);
            let next = current.saturating_add(bytes);
            if next > self.memory_limit_bytes {
                return Err(QuarryError::ExecutionFailure(format!(
                    "query {} exceeded memory limit: reserved {} + requested {} > limit {}",
                    self.query_id, current, bytes, self.memory_limit_bytes
                )));
            }
            if self
                .reserved_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Return `bytes` to the query budget.
    pub fn free(&self, bytes: u64) {
        let mut current = self.reserved_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.reserved_bytes.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Task-scoped runtime context mutated by the operator runtime and read by
/// status snapshots.
pub struct TaskRuntimeContext {
    task_id: TaskId,
    query: Arc<QueryContext>,
    user_memory_bytes: AtomicU64,
    peak_user_memory_bytes: AtomicU64,
    revocable_memory_bytes: AtomicU64,
    spill_count: AtomicU64,
    spill_time_ms: AtomicU64,
    input_bytes: AtomicU64,
    input_rows: AtomicU64,
    output_bytes: AtomicU64,
    output_rows: AtomicU64,
    pipelines: Mutex<BTreeMap<u32, PipelineStatus>>,
    produced_filters: DynamicFiltersCollector,
    received_filters: Mutex<BTreeMap<DynamicFilterId, Domain>>,
}

impl TaskRuntimeContext {
    /// Create a context bound to `query`'s memory accounting.
    pub fn new(task_id: TaskId, query: Arc<QueryContext>) -> Arc<Self> {
        Arc::new(Self {
            task_id,
            query,
            user_memory_bytes: AtomicU64::new(0),
            peak_user_memory_bytes: AtomicU64::new(0),
            revocable_memory_bytes: AtomicU64::new(0),
            spill_count: AtomicU64::new(0),
            spill_time_ms: AtomicU64::new(0),
            input_bytes: AtomicU64::new(0),
            input_rows: AtomicU64::new(0),
            output_bytes: AtomicU64::new(0),
            output_rows: AtomicU64::new(0),
            pipelines: Mutex::new(BTreeMap::new()),
            produced_filters: DynamicFiltersCollector::new(),
            received_filters: Mutex::new(BTreeMap::new()),
        })
    }

    /// Task this context belongs to.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Query-level accounting context.
    pub fn query_context(&self) -> &Arc<QueryContext> {
        &self.query
    }

    /// Reserve user memory against the query budget.
    pub fn reserve_user_memory(&self, bytes: u64) -> Result<()> {
        self.query.try_reserve(bytes)?;
        let previous = self.user_memory_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.peak_user_memory_bytes
            .fetch_max(previous.saturating_add(bytes), Ordering::AcqRel);
        Ok(())
    }

    /// Release user memory back to the query budget.
    pub fn free_user_memory(&self, bytes: u64) {
        self.user_memory_bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.query.free(bytes);
    }

    /// Set the revocable-memory reservation.
    pub fn set_revocable_memory(&self, bytes: u64) {
        self.revocable_memory_bytes.store(bytes, Ordering::Release);
    }

    /// Current user-memory reservation.
    pub fn user_memory_bytes(&self) -> u64 {
        self.user_memory_bytes.load(Ordering::Acquire)
    }

    /// Peak user-memory reservation.
    pub fn peak_user_memory_bytes(&self) -> u64 {
        self.peak_user_memory_bytes.load(Ordering::Acquire)
    }

    /// Current revocable-memory reservation.
    pub fn revocable_memory_bytes(&self) -> u64 {
        self.revocable_memory_bytes.load(Ordering::Acquire)
    }

    /// Record one spill taking `elapsed_ms`.
    pub fn record_spill(&self, elapsed_ms: u64) {
        self.spill_count.fetch_add(1, Ordering::AcqRel);
        self.spill_time_ms.fetch_add(elapsed_ms, Ordering::AcqRel);
    }

    /// Spill operations performed so far.
    pub fn spill_count(&self) -> u64 {
        self.spill_count.load(Ordering::Acquire)
    }

    /// Total milliseconds spent spilling.
    pub fn spill_time_ms(&self) -> u64 {
        self.spill_time_ms.load(Ordering::Acquire)
    }

    /// Record bytes/rows read from inputs.
    pub fn record_input(&self, bytes: u64, rows: u64) {
        self.input_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.input_rows.fetch_add(rows, Ordering::AcqRel);
    }

    /// Record bytes/rows handed to the output buffer.
    pub fn record_output(&self, bytes: u64, rows: u64) {
        self.output_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.output_rows.fetch_add(rows, Ordering::AcqRel);
    }

    /// Snapshot of the io counters.
    pub fn io_stats(&self) -> IoStats {
        IoStats {
            input_bytes: self.input_bytes.load(Ordering::Acquire),
            input_rows: self.input_rows.load(Ordering::Acquire),
            output_bytes: self.output_bytes.load(Ordering::Acquire),
            output_rows: self.output_rows.load(Ordering::Acquire),
        }
    }

    /// Publish the latest status for one pipeline.
    pub fn report_pipeline_status(&self, status: PipelineStatus) {
        self.pipelines
            .lock()
            .expect("pipelines lock")
            .insert(status.pipeline_id, status);
    }

    /// Latest status of every reported pipeline.
    pub fn pipeline_statuses(&self) -> Vec<PipelineStatus> {
        self.pipelines
            .lock()
            .expect("pipelines lock")
            .values()
            .cloned()
            .collect()
    }

    /// Publish produced dynamic-filter domains; returns the new version.
    ///
    /// The caller is responsible for firing the status notifier it received
    /// at execution creation so long-poll clients observe the change.
    pub fn publish_dynamic_filter_domains(
        &self,
        domains: BTreeMap<DynamicFilterId, Domain>,
    ) -> u64 {
        self.produced_filters.publish(domains)
    }

    /// High-water version of produced domains.
    pub fn dynamic_filters_version(&self) -> u64 {
        self.produced_filters.version()
    }

    /// Produced-domain deltas newer than `callers_version`.
    pub fn acknowledge_and_get_new_dynamic_filter_domains(
        &self,
        callers_version: u64,
    ) -> VersionedDynamicFilterDomains {
        self.produced_filters.acknowledge_and_get_new(callers_version)
    }

    /// Snapshot of every produced domain at the current version.
    pub fn current_dynamic_filter_domains(&self) -> VersionedDynamicFilterDomains {
        self.produced_filters.current()
    }

    /// Merge domains received from other stages; repeated ids narrow by
    /// intersection.
    pub fn add_received_dynamic_filters(&self, domains: BTreeMap<DynamicFilterId, Domain>) {
        let mut received = self.received_filters.lock().expect("received lock");
        for (id, domain) in domains {
            let narrowed = match received.get(&id) {
                Some(existing) => existing.intersect(&domain),
                None => domain,
            };
            received.insert(id, narrowed);
        }
    }

    /// Snapshot of domains received from other stages.
    pub fn received_dynamic_filters(&self) -> BTreeMap<DynamicFilterId, Domain> {
        self.received_filters.lock().expect("received lock").clone()
    }
}

/// Operator-runtime surface the coordinator drives after creation.
pub trait TaskExecution: Send + Sync {
    /// Enqueue split assignments delivered by the coordinator node.
    fn add_split_assignments(&self, assignments: Vec<SplitAssignment>) -> Result<()>;

    /// Task-scoped runtime context.
    fn task_context(&self) -> Arc<TaskRuntimeContext>;

    /// Plan nodes whose split intake is complete.
    fn no_more_splits(&self) -> BTreeSet<PlanNodeId>;
}

/// Materializes execution for a task once its plan fragment arrives.
pub trait TaskExecutionFactory: Send + Sync {
    /// Create execution wired to the task's state machine and output buffer.
    ///
    /// `status_notifier` must be fired whenever execution makes an externally
    /// observable change (dynamic-filter publishes, buffer progress) so
    /// long-poll clients wake up.
    fn create(
        &self,
        session: &Session,
        query: &Arc<QueryContext>,
        state_machine: &Arc<TaskStateMachine>,
        buffer: Arc<dyn OutputBuffer>,
        fragment: &PlanFragment,
        status_notifier: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<Arc<dyn TaskExecution>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_id() -> TaskId {
        use quarry_common::{QueryId, StageId};
        TaskId::new(QueryId(1), StageId(0), 0, 1)
    }

    #[test]
    fn query_context_enforces_memory_limit() {
        let query = QueryContext::new(QueryId(1), 100);
        query.try_reserve(60).expect("first reservation");
        query.try_reserve(40).expect("fills budget");
        let err = query.try_reserve(1).expect_err("over budget");
        assert!(matches!(err, QuarryError::ExecutionFailure(_)));

        query.free(50);
        query.try_reserve(30).expect("after free");
        assert_eq!(query.reserved_bytes(), 80);
    }

    #[test]
    fn task_context_tracks_peak_user_memory() {
        let query = QueryContext::new(QueryId(1), 1024);
        let ctx = TaskRuntimeContext::new(task_id(), query);
        ctx.reserve_user_memory(100).expect("reserve");
        ctx.reserve_user_memory(200).expect("reserve more");
        ctx.free_user_memory(250);
        assert_eq!(ctx.user_memory_bytes(), 50);
        assert_eq!(ctx.peak_user_memory_bytes(), 300);
        assert_eq!(ctx.query_context().reserved_bytes(), 50);
    }

    #[test]
    fn received_filters_narrow_by_intersection() {
        use crate::dynamic_filters::{Domain, ScalarValue};

        let query = QueryContext::new(QueryId(1), 1024);
        let ctx = TaskRuntimeContext::new(task_id(), query);
        let id = DynamicFilterId("df_1".to_string());
        ctx.add_received_dynamic_filters(BTreeMap::from([(
            id.clone(),
            Domain::values(vec![ScalarValue::Int64(1), ScalarValue::Int64(2)]),
        )]));
        ctx.add_received_dynamic_filters(BTreeMap::from([(
            id.clone(),
            Domain::values(vec![ScalarValue::Int64(2), ScalarValue::Int64(3)]),
        )]));

        let received = ctx.received_dynamic_filters();
        assert_eq!(
            received.get(&id),
            Some(&Domain::Values(vec![ScalarValue::Int64(2)]))
        );
    }

    #[test]
    fn pipeline_reports_replace_previous_status() {
        let query = QueryContext::new(QueryId(1), 1024);
        let ctx = TaskRuntimeContext::new(task_id(), query);
        ctx.report_pipeline_status(PipelineStatus {
            pipeline_id: 0,
            running_drivers: 4,
            ..PipelineStatus::default()
        });
        ctx.report_pipeline_status(PipelineStatus {
            pipeline_id: 0,
            running_drivers: 1,
            ..PipelineStatus::default()
        });

        let statuses = ctx.pipeline_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].running_drivers, 1);
    }
}
