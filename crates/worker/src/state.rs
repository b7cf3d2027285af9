//! Task lifecycle state machine with terminal-once semantics.
//!
//! Responsibilities:
//! - serialize state transitions and absorb repeats after a terminal state;
//! - retain every failure cause in arrival order (the first cause wins for
//!   reporting, all are kept);
//! - fan out state changes to listeners on the shared notification executor.
//!
//! Listener semantics:
//! - each listener drains its own queue, so one listener observes transitions
//!   in order while different listeners may interleave arbitrarily;
//! - registration delivers an immediate notification of the current state, so
//!   callers never race registration against a transition;
//! - listeners run on the notification executor and must not be registered
//!   from inside the owning coordinator's constructor.

use std::fmt;
use std::sync::Mutex;

use quarry_common::{QuarryError, TaskId};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

use crate::unix_now_ms;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Task is created but no plan fragment has arrived.
    Planned,
    /// Execution exists and drivers may be running.
    Running,
    /// All drivers finished; output is draining to consumers.
    Flushing,
    /// Output fully consumed; clean terminal.
    Finished,
    /// Canceled by the coordinator node; terminal.
    Canceled,
    /// Abandoned because the query no longer needs this task; terminal.
    Aborted,
    /// Execution failed; terminal, causes retained.
    Failed,
}

impl TaskState {
    /// Returns whether this state ends the task lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Canceled | Self::Aborted | Self::Failed
        )
    }

    /// Stable lowercase name used in logs and metrics labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Flushing => "flushing",
            Self::Finished => "finished",
            Self::Canceled => "canceled",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One retained failure cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Stable error-kind label.
    pub kind: String,
    /// Rendered error message.
    pub message: String,
}

impl From<&QuarryError> for FailureInfo {
    fn from(err: &QuarryError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Failure of a remote source task feeding this task's exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTaskFailure {
    /// Task id of the failed source task.
    pub task_id: TaskId,
    /// Reported cause.
    pub cause: FailureInfo,
}

struct Inner {
    state: TaskState,
    failure_causes: Vec<FailureInfo>,
    state_listeners: Vec<mpsc::UnboundedSender<TaskState>>,
    source_failure_listeners: Vec<mpsc::UnboundedSender<SourceTaskFailure>>,
}

/// Authoritative lifecycle state for one task.
pub struct TaskStateMachine {
    task_id: TaskId,
    created_at_ms: u64,
    notifier: Handle,
    inner: Mutex<Inner>,
}

impl TaskStateMachine {
    /// Create a state machine in [`TaskState::Planned`].
    pub fn new(task_id: TaskId, notifier: Handle) -> Self {
        Self {
            task_id,
            created_at_ms: unix_now_ms(),
            notifier,
            inner: Mutex::new(Inner {
                state: TaskState::Planned,
                failure_causes: Vec::new(),
                state_listeners: Vec::new(),
                source_failure_listeners: Vec::new(),
            }),
        }
    }

    /// Id of the task this state machine belongs to.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Unix-ms creation timestamp.
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.inner.lock().expect("state machine lock").state
    }

    /// Retained failure causes in arrival order.
    pub fn failure_causes(&self) -> Vec<FailureInfo> {
        self.inner
            .lock()
            .expect("state machine lock")
            .failure_causes
            .clone()
    }

    /// Planned -> Running. Returns whether the transition happened.
    pub fn transition_to_running(&self) -> bool {
        let mut inner = self.inner.lock().expect("state machine lock");
        if inner.state != TaskState::Planned {
            return false;
        }
        self.set_state(&mut inner, TaskState::Running);
        true
    }

    /// Running -> Flushing. Returns whether the transition happened.
    pub fn transition_to_flushing(&self) -> bool {
        let mut inner = self.inner.lock().expect("state machine lock");
        if inner.state != TaskState::Running {
            return false;
        }
        self.set_state(&mut inner, TaskState::Flushing);
        true
    }

    /// Flushing -> Finished, inserting the Flushing step when invoked from
    /// Running so observers always see the documented chain. Finishing a task
    /// that never ran is rejected as a no-op.
    pub fn transition_to_finished(&self) -> bool {
        let mut inner = self.inner.lock().expect("state machine lock");
        if inner.state == TaskState::Running {
            self.set_state(&mut inner, TaskState::Flushing);
        }
        if inner.state != TaskState::Flushing {
            return false;
        }
        self.set_state(&mut inner, TaskState::Finished);
        true
    }

    /// Transition to Canceled unless already terminal.
    pub fn cancel(&self) -> bool {
        self.terminate(TaskState::Canceled)
    }

    /// Transition to Aborted unless already terminal.
    pub fn abort(&self) -> bool {
        self.terminate(TaskState::Aborted)
    }

    /// Record `cause` and transition to Failed unless already terminal.
    ///
    /// Causes accumulate even on a task already in a terminal state; the
    /// state itself never changes once terminal.
    pub fn failed(&self, cause: QuarryError) -> bool {
        let mut inner = self.inner.lock().expect("state machine lock");
        inner.failure_causes.push(FailureInfo::from(&cause));
        if inner.state.is_terminal() {
            debug!(
                task_id = %self.task_id,
                state = %inner.state,
                error = %cause,
                "recorded failure cause on terminal task"
            );
            return false;
        }
        self.set_state(&mut inner, TaskState::Failed);
        true
    }

    /// Report the failure of a remote source task to registered listeners.
    pub fn source_task_failed(&self, task_id: TaskId, cause: QuarryError) {
        let mut inner = self.inner.lock().expect("state machine lock");
        let failure = SourceTaskFailure {
            task_id,
            cause: FailureInfo::from(&cause),
        };
        inner
            .source_failure_listeners
            .retain(|tx| tx.send(failure.clone()).is_ok());
    }

    /// Register a state-change listener.
    ///
    /// The listener is immediately notified of the current state and then of
    /// every subsequent transition, in order, on the notification executor.
    pub fn add_state_change_listener(&self, mut listener: impl FnMut(TaskState) + Send + 'static) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("state machine lock");
        let _ = tx.send(inner.state);
        if !inner.state.is_terminal() {
            inner.state_listeners.push(tx);
        }
        self.notifier.spawn(async move {
            while let Some(state) = rx.recv().await {
                listener(state);
            }
        });
    }

    /// Register a source-task failure listener.
    pub fn add_source_task_failure_listener(
        &self,
        mut listener: impl FnMut(SourceTaskFailure) + Send + 'static,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("state machine lock");
        inner.source_failure_listeners.push(tx);
        self.notifier.spawn(async move {
            while let Some(failure) = rx.recv().await {
                listener(failure);
            }
        });
    }

    fn terminate(&self, target: TaskState) -> bool {
        let mut inner = self.inner.lock().expect("state machine lock");
        if inner.state.is_terminal() {
            return false;
        }
        self.set_state(&mut inner, target);
        true
    }

    fn set_state(&self, inner: &mut Inner, next: TaskState) {
        debug!(task_id = %self.task_id, from = %inner.state, to = %next, "task state transition");
        inner.state = next;
        inner.state_listeners.retain(|tx| tx.send(next).is_ok());
        if next.is_terminal() {
            // the lifecycle is over; release listener queues so pumps drain and exit
            inner.state_listeners.clear();
            inner.source_failure_listeners.clear();
        }
    }
}

impl fmt::Debug for TaskStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStateMachine")
            .field("task_id", &self.task_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::{QueryId, StageId};
    use std::time::Duration;
    use tokio::time::timeout;

    fn task_id() -> TaskId {
        TaskId::new(QueryId(1), StageId(0), 0, 1)
    }

    fn machine() -> TaskStateMachine {
        TaskStateMachine::new(task_id(), Handle::current())
    }

    #[tokio::test]
    async fn clean_lifecycle_follows_documented_chain() {
        let sm = machine();
        assert_eq!(sm.state(), TaskState::Planned);
        assert!(sm.transition_to_running());
        assert!(sm.transition_to_flushing());
        assert!(sm.transition_to_finished());
        assert_eq!(sm.state(), TaskState::Finished);
    }

    #[tokio::test]
    async fn finished_from_running_passes_through_flushing() {
        let sm = machine();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sm.add_state_change_listener(move |state| {
            let _ = tx.send(state);
        });
        assert!(sm.transition_to_running());
        assert!(sm.transition_to_finished());

        let mut observed = Vec::new();
        for _ in 0..4 {
            let state = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("listener notified")
                .expect("channel open");
            observed.push(state);
        }
        assert_eq!(
            observed,
            vec![
                TaskState::Planned,
                TaskState::Running,
                TaskState::Flushing,
                TaskState::Finished
            ]
        );
    }

    #[tokio::test]
    async fn finishing_a_task_that_never_ran_is_rejected() {
        let sm = machine();
        assert!(!sm.transition_to_finished());
        assert_eq!(sm.state(), TaskState::Planned);
    }

    #[tokio::test]
    async fn terminal_state_absorbs_later_transitions() {
        let sm = machine();
        assert!(sm.transition_to_running());
        assert!(sm.cancel());
        assert!(!sm.abort());
        assert!(!sm.transition_to_finished());
        assert!(!sm.transition_to_running());
        assert_eq!(sm.state(), TaskState::Canceled);
    }

    #[tokio::test]
    async fn failed_accumulates_causes_even_after_terminal() {
        let sm = machine();
        assert!(sm.transition_to_running());
        assert!(sm.cancel());
        assert!(!sm.failed(QuarryError::ExecutionFailure("late failure".to_string())));
        assert_eq!(sm.state(), TaskState::Canceled);

        let causes = sm.failure_causes();
        assert_eq!(causes.len(), 1);
        assert_eq!(causes[0].kind, "execution_failure");
    }

    #[tokio::test]
    async fn first_failure_cause_stays_first() {
        let sm = machine();
        sm.transition_to_running();
        assert!(sm.failed(QuarryError::ExecutionFailure("root cause".to_string())));
        assert!(!sm.failed(QuarryError::ExecutionFailure("secondary".to_string())));

        let causes = sm.failure_causes();
        assert_eq!(causes.len(), 2);
        assert!(causes[0].message.contains("root cause"));
        assert!(causes[1].message.contains("secondary"));
    }

    #[tokio::test]
    async fn listener_registered_after_transition_gets_current_state() {
        let sm = machine();
        sm.transition_to_running();
        sm.cancel();

        let (tx, mut rx) = mpsc::unbounded_channel();
        sm.add_state_change_listener(move |state| {
            let _ = tx.send(state);
        });
        let state = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("listener notified")
            .expect("channel open");
        assert_eq!(state, TaskState::Canceled);
    }

    #[tokio::test]
    async fn source_task_failures_reach_listeners() {
        let sm = machine();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sm.add_source_task_failure_listener(move |failure| {
            let _ = tx.send(failure);
        });
        let upstream = TaskId::new(QueryId(1), StageId(1), 3, 1);
        sm.source_task_failed(
            upstream,
            QuarryError::ExecutionFailure("source gone".to_string()),
        );

        let failure = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("listener notified")
            .expect("channel open");
        assert_eq!(failure.task_id, upstream);
        assert!(failure.cause.message.contains("source gone"));
    }
}
