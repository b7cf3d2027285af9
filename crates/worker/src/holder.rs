//! Tri-state execution holder swapped atomically across the task lifetime.
//!
//! Exactly two installs are permitted: Empty -> Live when the first plan
//! fragment arrives (inside the coordinator's update critical section), and
//! Empty-or-Live -> Final from the terminal-state listener's compare-and-swap
//! loop. Once Final is present no further swap is observable.

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use quarry_common::PlanNodeId;

use crate::dynamic_filters::VersionedDynamicFilterDomains;
use crate::execution::TaskExecution;
use crate::status::{IoStats, TaskInfo};

/// Values captured exactly once when the task reaches a terminal state.
#[derive(Clone)]
pub struct FinalTaskHolder {
    /// Task info frozen at the terminal transition.
    pub info: TaskInfo,
    /// Io counters frozen at the terminal transition.
    pub io_stats: IoStats,
    /// Produced dynamic-filter domains frozen at the terminal transition.
    pub dynamic_filter_domains: VersionedDynamicFilterDomains,
}

/// Snapshot of execution progress: not started, running, or frozen terminal.
pub enum TaskHolder {
    /// No plan fragment has arrived; execution does not exist yet.
    Empty,
    /// Execution created and potentially producing output.
    Live(Arc<dyn TaskExecution>),
    /// Terminal snapshot; immutable from here on.
    Final(FinalTaskHolder),
}

impl TaskHolder {
    /// Whether the terminal snapshot has been installed.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }

    /// The live execution, if one exists.
    pub fn execution(&self) -> Option<&Arc<dyn TaskExecution>> {
        match self {
            Self::Live(execution) => Some(execution),
            _ => None,
        }
    }

    /// The frozen task info, once terminal.
    pub fn final_info(&self) -> Option<&TaskInfo> {
        match self {
            Self::Final(holder) => Some(&holder.info),
            _ => None,
        }
    }

    /// Io counters for the current shape: frozen, live, or zero.
    pub fn io_stats(&self) -> IoStats {
        match self {
            Self::Final(holder) => holder.io_stats.clone(),
            Self::Live(execution) => execution.task_context().io_stats(),
            Self::Empty => IoStats::default(),
        }
    }

    /// Plan nodes whose split intake is complete.
    pub fn no_more_splits(&self) -> BTreeSet<PlanNodeId> {
        match self {
            Self::Final(holder) => holder.info.no_more_splits.clone(),
            Self::Live(execution) => execution.no_more_splits(),
            Self::Empty => BTreeSet::new(),
        }
    }

    /// Produced-domain deltas newer than `callers_version`.
    ///
    /// Returns the frozen snapshot once terminal and the initial empty
    /// snapshot before execution exists.
    pub fn acknowledge_and_get_new_dynamic_filter_domains(
        &self,
        callers_version: u64,
    ) -> VersionedDynamicFilterDomains {
        match self {
            Self::Final(holder) => holder.dynamic_filter_domains.clone(),
            Self::Live(execution) => execution
                .task_context()
                .acknowledge_and_get_new_dynamic_filter_domains(callers_version),
            Self::Empty => VersionedDynamicFilterDomains::initial(),
        }
    }

    /// High-water version of produced domains.
    pub fn dynamic_filters_version(&self) -> u64 {
        match self {
            Self::Final(holder) => holder.dynamic_filter_domains.version,
            Self::Live(execution) => execution.task_context().dynamic_filters_version(),
            Self::Empty => crate::dynamic_filters::INITIAL_DYNAMIC_FILTERS_VERSION,
        }
    }

    /// Full produced-domain snapshot, used when freezing the terminal state.
    pub fn current_dynamic_filter_domains(&self) -> VersionedDynamicFilterDomains {
        match self {
            Self::Final(holder) => holder.dynamic_filter_domains.clone(),
            Self::Live(execution) => execution.task_context().current_dynamic_filter_domains(),
            Self::Empty => VersionedDynamicFilterDomains::initial(),
        }
    }
}

/// Atomic holder cell with the two permitted installs.
pub struct HolderCell {
    cell: ArcSwap<TaskHolder>,
}

impl HolderCell {
    /// Create a cell holding [`TaskHolder::Empty`].
    pub fn new() -> Self {
        Self {
            cell: ArcSwap::from_pointee(TaskHolder::Empty),
        }
    }

    /// Current holder snapshot.
    pub fn load(&self) -> Arc<TaskHolder> {
        self.cell.load_full()
    }

    /// Install the live execution if the holder is still Empty.
    ///
    /// Callers serialize through the coordinator's update lock, so failure
    /// here means the task was finalized concurrently.
    pub fn install_live(&self, execution: Arc<dyn TaskExecution>) -> bool {
        let current = self.cell.load_full();
        if !matches!(*current, TaskHolder::Empty) {
            return false;
        }
        let next = Arc::new(TaskHolder::Live(execution));
        let previous = self.cell.compare_and_swap(&current, next);
        Arc::ptr_eq(&*previous, &current)
    }

    /// Install the terminal snapshot built from the pre-terminal holder.
    ///
    /// Loops until either another finalizer won (`false`) or the swap
    /// succeeds (`true`). `build` may run more than once under contention.
    pub fn install_final(&self, build: impl Fn(&TaskHolder) -> FinalTaskHolder) -> bool {
        loop {
            let current = self.cell.load_full();
            if current.is_final() {
                return false;
            }
            let next = Arc::new(TaskHolder::Final(build(&current)));
            let previous = self.cell.compare_and_swap(&current, next);
            if Arc::ptr_eq(&*previous, &current) {
                return true;
            }
        }
    }
}

impl Default for HolderCell {
    fn default() -> Self {
        Self::new()
    }
}
