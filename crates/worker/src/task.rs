//! Per-task lifecycle coordinator.
//!
//! Responsibilities:
//! - route control commands (update/cancel/abort/fail) into the state machine;
//! - lazily create execution when the first plan fragment arrives;
//! - publish versioned status snapshots for long-poll clients;
//! - broker output-buffer access for downstream consumers;
//! - freeze the terminal snapshot exactly once and release resources on
//!   every exit path.
//!
//! Construction is split in two: `create` builds the coordinator without
//! leaking `&self`, then an internal initialize step registers the terminal
//! listener holding only a weak back-reference.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use prometheus::IntCounter;
use quarry_common::{
    global_metrics, DynamicFilterId, OutputBufferId, OutputBufferLimits, QuarryError, Result,
    TaskId,
};
use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::beacon::VersionBeacon;
use crate::buffer::{
    LazyOutputBuffer, OutputBuffer, OutputBufferFactory, OutputBufferSpec, ResultsPage,
};
use crate::dynamic_filters::{
    Domain, VersionedDynamicFilterDomains, INITIAL_DYNAMIC_FILTERS_VERSION,
};
use crate::execution::{
    PlanFragment, QueryContext, Session, SplitAssignment, TaskExecutionFactory, TaskRuntimeContext,
};
use crate::holder::{FinalTaskHolder, HolderCell, TaskHolder};
use crate::state::{TaskState, TaskStateMachine};
use crate::status::{TaskInfo, TaskStats, TaskStatus};
use crate::unix_now_ms;

/// Callback invoked once when the task reaches a terminal state.
pub type OnDone = Arc<dyn Fn(&WorkerTask) + Send + Sync>;

/// Coordinator owning the mutable lifetime of one task on this worker.
///
/// All operations are safe to call concurrently from any thread. Only
/// [`WorkerTask::await_status`], [`WorkerTask::await_info`], and
/// [`WorkerTask::get_results`] may stay pending; everything else completes
/// synchronously under short internal locks.
pub struct WorkerTask {
    task_id: TaskId,
    instance_id: String,
    location: String,
    node_id: String,
    query_context: Arc<QueryContext>,
    execution_factory: Arc<dyn TaskExecutionFactory>,
    state_machine: Arc<TaskStateMachine>,
    output_buffer: Arc<LazyOutputBuffer>,
    beacon: Arc<VersionBeacon>,
    holder: HolderCell,
    needs_plan: AtomicBool,
    trace_token: OnceLock<String>,
    last_heartbeat_ms: AtomicU64,
    update_lock: Mutex<()>,
}

impl WorkerTask {
    /// Create a task coordinator in the planned state.
    ///
    /// `notifier` is the shared executor listeners are dispatched on;
    /// `buffer_factory` builds the concrete output buffer once the first
    /// descriptor arrives; `on_done` fires exactly once at terminal cleanup;
    /// `failed_tasks` is incremented iff the terminal state is failed.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        task_id: TaskId,
        location: impl Into<String>,
        node_id: impl Into<String>,
        query_context: Arc<QueryContext>,
        execution_factory: Arc<dyn TaskExecutionFactory>,
        notifier: Handle,
        buffer_limits: OutputBufferLimits,
        buffer_factory: Arc<dyn OutputBufferFactory>,
        on_done: OnDone,
        failed_tasks: IntCounter,
    ) -> Arc<Self> {
        let instance_id = Uuid::new_v4().to_string();
        let beacon = Arc::new(VersionBeacon::new());
        let buffer_change = {
            let beacon = Arc::clone(&beacon);
            Arc::new(move || beacon.bump()) as Arc<dyn Fn() + Send + Sync>
        };
        let output_buffer = Arc::new(LazyOutputBuffer::new(
            task_id,
            instance_id.clone(),
            buffer_limits,
            buffer_factory,
            buffer_change,
        ));
        let state_machine = Arc::new(TaskStateMachine::new(task_id, notifier));

        let task = Arc::new(Self {
            task_id,
            instance_id,
            location: location.into(),
            node_id: node_id.into(),
            query_context,
            execution_factory,
            state_machine,
            output_buffer,
            beacon,
            holder: HolderCell::new(),
            needs_plan: AtomicBool::new(true),
            trace_token: OnceLock::new(),
            last_heartbeat_ms: AtomicU64::new(unix_now_ms()),
            update_lock: Mutex::new(()),
        });
        global_metrics().inc_task_created();
        // listener wiring is deferred so the listener cannot fire against a
        // partially constructed task
        task.initialize(on_done, failed_tasks);
        task
    }

    fn initialize(self: &Arc<Self>, on_done: OnDone, failed_tasks: IntCounter) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.state_machine.add_state_change_listener(move |new_state| {
            let Some(task) = weak.upgrade() else {
                return;
            };
            task.handle_state_change(new_state, &on_done, &failed_tasks);
        });
    }

    fn handle_state_change(&self, new_state: TaskState, on_done: &OnDone, failed_tasks: &IntCounter) {
        if !new_state.is_terminal() {
            // planned is the state the task was created in, and the initial
            // running notification is folded into the version bump issued by
            // the update that created execution
            if new_state == TaskState::Flushing {
                self.beacon.bump();
            }
            return;
        }

        if new_state == TaskState::Failed {
            failed_tasks.inc();
        }

        let newly_finalized = self.holder.install_final(|current| FinalTaskHolder {
            info: self.info_from(current),
            io_stats: current.io_stats(),
            dynamic_filter_domains: current.current_dynamic_filter_domains(),
        });
        if !newly_finalized {
            // a concurrent terminal trigger already froze the task
            return;
        }
        global_metrics().inc_task_terminal(new_state.as_str());

        if matches!(new_state, TaskState::Failed | TaskState::Aborted) {
            // keep an error signal for consumers; a clean close would tell
            // upstream tasks everything finished normally
            self.output_buffer.abort();
        } else {
            self.output_buffer.destroy_all();
        }

        if catch_unwind(AssertUnwindSafe(|| on_done(self))).is_err() {
            warn!(task_id = %self.task_id, "task completion callback panicked");
        }

        self.beacon.bump();
    }

    /// Id of this task.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Per-instance UUID regenerated on task creation.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state_machine.state()
    }

    /// Unix-ms creation timestamp.
    pub fn created_at_ms(&self) -> u64 {
        self.state_machine.created_at_ms()
    }

    /// Whether the task is still waiting for its first plan fragment.
    pub fn needs_plan(&self) -> bool {
        self.needs_plan.load(Ordering::SeqCst)
    }

    /// Trace token recorded from the first session that carried one.
    pub fn trace_token(&self) -> Option<&str> {
        self.trace_token.get().map(String::as_str)
    }

    /// State machine shared with execution.
    pub fn state_machine(&self) -> &Arc<TaskStateMachine> {
        &self.state_machine
    }

    /// Query-level accounting context.
    pub fn query_context(&self) -> &Arc<QueryContext> {
        &self.query_context
    }

    /// Runtime context of the live execution, if one exists.
    pub fn task_context(&self) -> Option<Arc<TaskRuntimeContext>> {
        self.holder
            .load()
            .execution()
            .map(|execution| execution.task_context())
    }

    /// Whether the output buffer wants producers to back off.
    pub fn is_output_buffer_overutilized(&self) -> bool {
        self.output_buffer.is_overutilized()
    }

    /// Io counters for the current holder shape.
    pub fn io_stats(&self) -> crate::status::IoStats {
        self.holder.load().io_stats()
    }

    /// Record supervisor liveness. Heartbeats deliberately do not bump the
    /// status version; they would turn idle polling into a wake-up storm.
    pub fn record_heartbeat(&self) {
        self.last_heartbeat_ms.store(unix_now_ms(), Ordering::Relaxed);
    }

    /// Point-in-time status snapshot.
    pub fn status(&self) -> TaskStatus {
        self.status_from(&self.holder.load())
    }

    /// Point-in-time full snapshot.
    pub fn info(&self) -> TaskInfo {
        self.info_from(&self.holder.load())
    }

    /// Return a status snapshot once the version exceeds `callers_version`
    /// or the task has been finalized; immediate if that already holds.
    pub async fn await_status(&self, callers_version: u64) -> TaskStatus {
        let mut rx = self.beacon.subscribe();
        loop {
            // copy the version out so the watch read lock is released before
            // the snapshot samples it again
            let published = *rx.borrow_and_update();
            if callers_version < published || self.holder.load().is_final() {
                return self.status();
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// [`WorkerTask::await_status`] returning the full snapshot.
    pub async fn await_info(&self, callers_version: u64) -> TaskInfo {
        let mut rx = self.beacon.subscribe();
        loop {
            let published = *rx.borrow_and_update();
            if callers_version < published || self.holder.load().is_final() {
                return self.info();
            }
            if rx.changed().await.is_err() {
                return self.info();
            }
        }
    }

    /// Apply a control update: record the trace token, apply the output
    /// descriptor, create execution on the first fragment, and forward splits
    /// and received dynamic-filter domains.
    ///
    /// Contract violations (`InvalidArgument`/`InvalidState`) are returned
    /// without failing the task. Recoverable execution errors transition the
    /// task to failed and the call returns the post-failure info; fatal
    /// errors fail the task and propagate.
    pub fn update(
        &self,
        session: &Session,
        fragment: Option<&PlanFragment>,
        split_assignments: Vec<SplitAssignment>,
        output_buffers: OutputBufferSpec,
        dynamic_filter_domains: BTreeMap<DynamicFilterId, Domain>,
    ) -> Result<TaskInfo> {
        match self.try_update(
            session,
            fragment,
            split_assignments,
            output_buffers,
            dynamic_filter_domains,
        ) {
            Ok(()) => Ok(self.info()),
            Err(err @ (QuarryError::InvalidArgument(_) | QuarryError::InvalidState(_))) => Err(err),
            Err(err) if err.is_fatal() => {
                self.state_machine.failed(err.clone());
                Err(err)
            }
            Err(err) => {
                warn!(task_id = %self.task_id, error = %err, "task update failed");
                self.state_machine.failed(err);
                Ok(self.info())
            }
        }
    }

    fn try_update(
        &self,
        session: &Session,
        fragment: Option<&PlanFragment>,
        split_assignments: Vec<SplitAssignment>,
        output_buffers: OutputBufferSpec,
        dynamic_filter_domains: BTreeMap<DynamicFilterId, Domain>,
    ) -> Result<()> {
        if let Some(token) = session.trace_token.as_deref().filter(|t| !t.is_empty()) {
            // first non-empty token wins; later sessions cannot rebind it
            let _ = self.trace_token.set(token.to_string());
        }

        // the descriptor must land before execution exists: drivers may
        // publish results immediately after creation
        self.output_buffer.set_output_buffers(output_buffers)?;

        let execution = {
            let _guard = self.update_lock.lock().expect("update lock");
            let holder = self.holder.load();
            match &*holder {
                // late updates after completion are ignored
                TaskHolder::Final(_) => return Ok(()),
                TaskHolder::Live(execution) => Some(Arc::clone(execution)),
                TaskHolder::Empty => {
                    let Some(fragment) = fragment else {
                        return Err(QuarryError::InvalidState(format!(
                            "task {} has no execution and the update carries no plan fragment",
                            self.task_id
                        )));
                    };
                    let status_notifier = {
                        let beacon = Arc::clone(&self.beacon);
                        Arc::new(move || beacon.bump()) as Arc<dyn Fn() + Send + Sync>
                    };
                    let execution = self.execution_factory.create(
                        session,
                        &self.query_context,
                        &self.state_machine,
                        Arc::clone(&self.output_buffer) as Arc<dyn OutputBuffer>,
                        fragment,
                        status_notifier,
                    )?;
                    // Empty -> Live only happens under the update lock, so
                    // the swap can only lose to a concurrent finalize
                    self.holder.install_live(Arc::clone(&execution));
                    self.needs_plan.store(false, Ordering::SeqCst);
                    self.state_machine.transition_to_running();
                    self.beacon.bump();
                    debug!(task_id = %self.task_id, "created task execution");
                    Some(execution)
                }
            }
        };

        if let Some(execution) = execution {
            execution.add_split_assignments(split_assignments)?;
            if !dynamic_filter_domains.is_empty() {
                execution
                    .task_context()
                    .add_received_dynamic_filters(dynamic_filter_domains);
            }
        }
        Ok(())
    }

    /// Fetch result pages for one downstream consumer.
    pub async fn get_results(
        &self,
        buffer_id: OutputBufferId,
        starting_sequence: u64,
        max_bytes: u64,
    ) -> Result<ResultsPage> {
        if max_bytes == 0 {
            return Err(QuarryError::InvalidArgument(
                "max_bytes must be at least 1 byte".to_string(),
            ));
        }
        self.output_buffer
            .get(buffer_id, starting_sequence, max_bytes)
            .await
    }

    /// Acknowledge consumed pages so the buffer can drop them.
    pub fn acknowledge_results(&self, buffer_id: OutputBufferId, sequence: u64) {
        self.output_buffer.acknowledge(buffer_id, sequence);
    }

    /// Signal that one downstream consumer is gone and drop its buffer.
    pub fn destroy_results(&self, buffer_id: OutputBufferId) -> TaskInfo {
        debug!(task_id = %self.task_id, buffer_id = %buffer_id, "destroying results buffer");
        self.output_buffer.destroy(buffer_id);
        self.info()
    }

    /// Cancel the task if it has not already ended.
    pub fn cancel(&self) -> TaskInfo {
        self.state_machine.cancel();
        self.info()
    }

    /// Abort the task if it has not already ended.
    pub fn abort(&self) -> TaskInfo {
        self.state_machine.abort();
        self.info()
    }

    /// Record `cause` and fail the task if it has not already ended.
    pub fn failed(&self, cause: QuarryError) -> TaskInfo {
        self.state_machine.failed(cause);
        self.info()
    }

    /// Produced dynamic-filter domains newer than `callers_version`, plus the
    /// new high-water version. Returns the frozen snapshot once terminal.
    pub fn acknowledge_and_get_new_dynamic_filter_domains(
        &self,
        callers_version: u64,
    ) -> VersionedDynamicFilterDomains {
        self.holder
            .load()
            .acknowledge_and_get_new_dynamic_filter_domains(callers_version)
    }

    fn status_from(&self, holder: &TaskHolder) -> TaskStatus {
        // sample the version before reading values; a concurrent change that
        // bumps the version after this point is observed by the next poll
        let version = self.beacon.current();
        let state = self.state_machine.state();
        let failures = if state == TaskState::Failed {
            self.state_machine.failure_causes()
        } else {
            Vec::new()
        };

        let mut status = TaskStatus {
            task_id: self.task_id,
            instance_id: self.instance_id.clone(),
            version,
            state,
            location: self.location.clone(),
            node_id: self.node_id.clone(),
            failures,
            queued_drivers: 0,
            queued_splits_weight: 0,
            running_drivers: 0,
            running_splits_weight: 0,
            output_buffer_overutilized: self.output_buffer.is_overutilized(),
            physical_written_bytes: 0,
            user_memory_bytes: 0,
            peak_user_memory_bytes: 0,
            revocable_memory_bytes: 0,
            spill_count: 0,
            spill_time_ms: 0,
            dynamic_filters_version: INITIAL_DYNAMIC_FILTERS_VERSION,
        };

        match holder {
            TaskHolder::Final(final_holder) => {
                let stats = &final_holder.info.stats;
                status.queued_drivers = stats.queued_drivers;
                status.queued_splits_weight = stats.queued_splits_weight;
                status.running_drivers = stats.running_drivers;
                status.running_splits_weight = stats.running_splits_weight;
                status.physical_written_bytes = stats.physical_written_bytes;
                status.user_memory_bytes = stats.user_memory_bytes;
                status.peak_user_memory_bytes = stats.peak_user_memory_bytes;
                status.revocable_memory_bytes = stats.revocable_memory_bytes;
                status.spill_count = stats.spill_count;
                status.spill_time_ms = stats.spill_time_ms;
                status.dynamic_filters_version = final_holder.dynamic_filter_domains.version;
            }
            TaskHolder::Live(execution) => {
                let context = execution.task_context();
                for pipeline in context.pipeline_statuses() {
                    status.queued_drivers += pipeline.queued_drivers;
                    status.queued_splits_weight += pipeline.queued_splits_weight;
                    status.running_drivers += pipeline.running_drivers;
                    status.running_splits_weight += pipeline.running_splits_weight;
                    status.physical_written_bytes += pipeline.physical_written_bytes;
                }
                status.user_memory_bytes = context.user_memory_bytes();
                status.peak_user_memory_bytes = context.peak_user_memory_bytes();
                status.revocable_memory_bytes = context.revocable_memory_bytes();
                status.spill_count = context.spill_count();
                status.spill_time_ms = context.spill_time_ms();
                status.dynamic_filters_version = context.dynamic_filters_version();
            }
            TaskHolder::Empty => {}
        }
        status
    }

    fn stats_from(&self, holder: &TaskHolder, status: &TaskStatus) -> TaskStats {
        match holder {
            TaskHolder::Final(final_holder) => final_holder.info.stats.clone(),
            TaskHolder::Live(execution) => TaskStats {
                created_at_ms: self.state_machine.created_at_ms(),
                end_at_ms: status.state.is_terminal().then(unix_now_ms),
                queued_drivers: status.queued_drivers,
                queued_splits_weight: status.queued_splits_weight,
                running_drivers: status.running_drivers,
                running_splits_weight: status.running_splits_weight,
                physical_written_bytes: status.physical_written_bytes,
                user_memory_bytes: status.user_memory_bytes,
                peak_user_memory_bytes: status.peak_user_memory_bytes,
                revocable_memory_bytes: status.revocable_memory_bytes,
                spill_count: status.spill_count,
                spill_time_ms: status.spill_time_ms,
                io: execution.task_context().io_stats(),
            },
            // the task completed without execution ever being created
            TaskHolder::Empty => TaskStats {
                created_at_ms: self.state_machine.created_at_ms(),
                end_at_ms: status.state.is_terminal().then(unix_now_ms),
                ..TaskStats::default()
            },
        }
    }

    fn info_from(&self, holder: &TaskHolder) -> TaskInfo {
        // build status first so a terminal state never pairs with stats newer
        // than the state observation
        let status = self.status_from(holder);
        let stats = self.stats_from(holder, &status);
        TaskInfo {
            status,
            last_heartbeat_ms: self.last_heartbeat_ms.load(Ordering::Relaxed),
            output_buffer_info: self.output_buffer.info(),
            no_more_splits: holder.no_more_splits(),
            stats,
            needs_plan: self.needs_plan.load(Ordering::SeqCst),
        }
    }
}

impl fmt::Display for WorkerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.task_id)
    }
}

impl fmt::Debug for WorkerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerTask")
            .field("task_id", &self.task_id)
            .field("instance_id", &self.instance_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;
