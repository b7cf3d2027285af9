use std::sync::{Arc, OnceLock};

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Task-lifecycle metrics registry shared across worker components.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    tasks_created: IntCounter,
    tasks_failed: IntCounter,
    task_terminal: IntCounterVec,
    status_notifications: IntCounter,
}

impl MetricsRegistry {
    /// Create a registry with all task-lifecycle metric families registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Count one task creation.
    pub fn inc_task_created(&self) {
        self.inner.tasks_created.inc();
    }

    /// Counter of tasks that reached the failed state.
    ///
    /// Handed to the task coordinator at construction so failure accounting
    /// stays injectable in tests.
    #[must_use]
    pub fn failed_tasks(&self) -> IntCounter {
        self.inner.tasks_failed.clone()
    }

    /// Count one task reaching the named terminal state.
    pub fn inc_task_terminal(&self, state: &str) {
        self.inner.task_terminal.with_label_values(&[state]).inc();
    }

    /// Count one published status-version change.
    pub fn inc_status_notification(&self) {
        self.inner.status_notifications.inc();
    }

    /// Render all registered metric families in Prometheus text format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let tasks_created = int_counter(
            &registry,
            "quarry_tasks_created_total",
            "Tasks created on this worker",
        );
        let tasks_failed = int_counter(
            &registry,
            "quarry_tasks_failed_total",
            "Tasks that reached the failed state",
        );
        let task_terminal = int_counter_vec(
            &registry,
            "quarry_task_terminal_total",
            "Tasks that reached a terminal state",
            &["state"],
        );
        let status_notifications = int_counter(
            &registry,
            "quarry_task_status_notifications_total",
            "Published task status-version changes",
        );

        Self {
            registry,
            tasks_created,
            tasks_failed,
            task_terminal,
            status_notifications,
        }
    }
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("int counter");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn int_counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("int counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter vec");
    c
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide metrics registry instance.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
