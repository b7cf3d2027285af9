//! Output-buffer contracts and the lazily initialized buffer owned by a task.
//!
//! The ring-buffered implementation that actually queues pages lives in the
//! exchange subsystem. This module defines the lifecycle surface the task
//! coordinator drives, plus [`LazyOutputBuffer`]: the concrete buffer cannot
//! exist before the first output descriptor arrives, so lifecycle calls
//! issued earlier (consumer destroys, abort, destroy) are remembered and
//! applied at creation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quarry_common::{OutputBufferId, OutputBufferLimits, QuarryError, Result, TaskId};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Distribution policy for task output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputBufferKind {
    /// Each consumer reads a fixed output partition.
    Partitioned,
    /// Every consumer reads a copy of every page.
    Broadcast,
    /// Any consumer may read any page.
    Arbitrary,
}

/// Descriptor assigning downstream consumers to output partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBufferSpec {
    /// Distribution policy.
    pub kind: OutputBufferKind,
    /// Consumer slot to output partition assignment.
    pub buffers: BTreeMap<OutputBufferId, u32>,
    /// Whether further consumers may still be added.
    pub no_more_buffers: bool,
}

impl OutputBufferSpec {
    /// Descriptor with a single consumer reading partition zero.
    #[must_use]
    pub fn single(kind: OutputBufferKind, buffer: OutputBufferId) -> Self {
        Self {
            kind,
            buffers: BTreeMap::from([(buffer, 0)]),
            no_more_buffers: true,
        }
    }
}

/// Page batch returned by a results fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsPage {
    /// Sequence number of the first page in the batch.
    pub starting_sequence: u64,
    /// Opaque serialized pages.
    pub pages: Vec<Vec<u8>>,
    /// Whether the buffer has no further pages for this consumer.
    pub buffer_complete: bool,
}

impl ResultsPage {
    /// Empty page batch at `sequence`.
    #[must_use]
    pub fn empty(sequence: u64, buffer_complete: bool) -> Self {
        Self {
            starting_sequence: sequence,
            pages: Vec::new(),
            buffer_complete,
        }
    }

    /// Sequence the consumer should request next.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.starting_sequence + self.pages.len() as u64
    }
}

/// Utilization/progress snapshot reported in task info.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferInfo {
    /// Distribution policy, once a descriptor has arrived.
    pub kind: Option<OutputBufferKind>,
    /// Bytes currently buffered.
    pub buffered_bytes: u64,
    /// Pages currently buffered.
    pub buffered_pages: u64,
    /// Pages handed to consumers since creation.
    pub total_pages_sent: u64,
    /// Bytes handed to consumers since creation.
    pub total_bytes_sent: u64,
    /// Whether the buffer reached its end state (drained, destroyed, or
    /// aborted).
    pub finished: bool,
}

/// Producer-side queue of result pages fetched by downstream consumers.
///
/// Implementations carry their own concurrency discipline; the task
/// coordinator only drives these lifecycle points.
#[async_trait]
pub trait OutputBuffer: Send + Sync {
    /// Apply a consumer-assignment descriptor.
    fn set_output_buffers(&self, spec: OutputBufferSpec) -> Result<()>;

    /// Fetch pages for `buffer` starting at `starting_sequence`, bounded by
    /// `max_bytes`. May stay pending until pages arrive.
    async fn get(
        &self,
        buffer: OutputBufferId,
        starting_sequence: u64,
        max_bytes: u64,
    ) -> Result<ResultsPage>;

    /// Acknowledge pages below `sequence` so they can be dropped.
    fn acknowledge(&self, buffer: OutputBufferId, sequence: u64);

    /// Drop one consumer's buffer; the downstream consumer is gone.
    fn destroy(&self, buffer: OutputBufferId);

    /// Drain and drop the whole buffer; signals clean completion upstream.
    fn destroy_all(&self);

    /// Tear down the buffer leaving an error signal for consumers.
    fn abort(&self);

    /// Utilization/progress snapshot.
    fn info(&self) -> BufferInfo;

    /// Whether producers should back off.
    fn is_overutilized(&self) -> bool;
}

/// Builds the concrete output buffer for one task instance.
pub trait OutputBufferFactory: Send + Sync {
    /// Create the buffer, wiring `on_change` to fire on observable buffer
    /// changes so task status versions advance.
    fn create(
        &self,
        task_id: &TaskId,
        instance_id: &str,
        limits: &OutputBufferLimits,
        on_change: Arc<dyn Fn() + Send + Sync>,
    ) -> Arc<dyn OutputBuffer>;
}

#[derive(Default)]
struct LazyState {
    delegate: Option<Arc<dyn OutputBuffer>>,
    aborted: bool,
    destroyed: bool,
    pending_destroyed: BTreeSet<OutputBufferId>,
}

/// Output buffer whose concrete implementation is created on the first
/// descriptor.
pub struct LazyOutputBuffer {
    task_id: TaskId,
    instance_id: String,
    limits: OutputBufferLimits,
    factory: Arc<dyn OutputBufferFactory>,
    on_change: Arc<dyn Fn() + Send + Sync>,
    state: Mutex<LazyState>,
}

impl LazyOutputBuffer {
    /// Create an uninitialized buffer for `task_id`.
    pub fn new(
        task_id: TaskId,
        instance_id: String,
        limits: OutputBufferLimits,
        factory: Arc<dyn OutputBufferFactory>,
        on_change: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            task_id,
            instance_id,
            limits,
            factory,
            on_change,
            state: Mutex::new(LazyState::default()),
        }
    }

    fn delegate(&self) -> Option<Arc<dyn OutputBuffer>> {
        self.state.lock().expect("lazy buffer lock").delegate.clone()
    }
}

#[async_trait]
impl OutputBuffer for LazyOutputBuffer {
    fn set_output_buffers(&self, spec: OutputBufferSpec) -> Result<()> {
        let delegate = {
            let mut state = self.state.lock().expect("lazy buffer lock");
            if state.aborted || state.destroyed {
                // the task already ended; a late descriptor must not revive it
                return Ok(());
            }
            if state.delegate.is_none() {
                let delegate = self.factory.create(
                    &self.task_id,
                    &self.instance_id,
                    &self.limits,
                    Arc::clone(&self.on_change),
                );
                for buffer in std::mem::take(&mut state.pending_destroyed) {
                    delegate.destroy(buffer);
                }
                state.delegate = Some(delegate);
            }
            state.delegate.clone()
        };
        match delegate {
            Some(delegate) => delegate.set_output_buffers(spec),
            None => Ok(()),
        }
    }

    async fn get(
        &self,
        buffer: OutputBufferId,
        starting_sequence: u64,
        max_bytes: u64,
    ) -> Result<ResultsPage> {
        match self.delegate() {
            Some(delegate) => delegate.get(buffer, starting_sequence, max_bytes).await,
            None => Err(QuarryError::InvalidState(format!(
                "task {} output buffer has not been initialized",
                self.task_id
            ))),
        }
    }

    fn acknowledge(&self, buffer: OutputBufferId, sequence: u64) {
        if let Some(delegate) = self.delegate() {
            delegate.acknowledge(buffer, sequence);
        }
    }

    fn destroy(&self, buffer: OutputBufferId) {
        let delegate = {
            let mut state = self.state.lock().expect("lazy buffer lock");
            if state.delegate.is_none() {
                state.pending_destroyed.insert(buffer);
            }
            state.delegate.clone()
        };
        if let Some(delegate) = delegate {
            delegate.destroy(buffer);
        }
    }

    fn destroy_all(&self) {
        let delegate = {
            let mut state = self.state.lock().expect("lazy buffer lock");
            state.destroyed = true;
            state.delegate.clone()
        };
        if let Some(delegate) = delegate {
            delegate.destroy_all();
        }
    }

    fn abort(&self) {
        debug!(task_id = %self.task_id, "aborting task output buffer");
        let delegate = {
            let mut state = self.state.lock().expect("lazy buffer lock");
            state.aborted = true;
            state.delegate.clone()
        };
        if let Some(delegate) = delegate {
            delegate.abort();
        }
    }

    fn info(&self) -> BufferInfo {
        let state = self.state.lock().expect("lazy buffer lock");
        match &state.delegate {
            Some(delegate) => delegate.info(),
            None => BufferInfo {
                finished: state.aborted || state.destroyed,
                ..BufferInfo::default()
            },
        }
    }

    fn is_overutilized(&self) -> bool {
        self.delegate().is_some_and(|d| d.is_overutilized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::{QueryId, StageId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingBuffer {
        specs: Mutex<Vec<OutputBufferSpec>>,
        destroyed_buffers: Mutex<Vec<OutputBufferId>>,
        aborts: AtomicUsize,
        destroys: AtomicUsize,
    }

    impl RecordingBuffer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                specs: Mutex::new(Vec::new()),
                destroyed_buffers: Mutex::new(Vec::new()),
                aborts: AtomicUsize::new(0),
                destroys: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl OutputBuffer for RecordingBuffer {
        fn set_output_buffers(&self, spec: OutputBufferSpec) -> Result<()> {
            self.specs.lock().expect("specs lock").push(spec);
            Ok(())
        }

        async fn get(
            &self,
            _buffer: OutputBufferId,
            starting_sequence: u64,
            _max_bytes: u64,
        ) -> Result<ResultsPage> {
            Ok(ResultsPage::empty(starting_sequence, false))
        }

        fn acknowledge(&self, _buffer: OutputBufferId, _sequence: u64) {}

        fn destroy(&self, buffer: OutputBufferId) {
            self.destroyed_buffers
                .lock()
                .expect("destroyed lock")
                .push(buffer);
        }

        fn destroy_all(&self) {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }

        fn abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }

        fn info(&self) -> BufferInfo {
            BufferInfo::default()
        }

        fn is_overutilized(&self) -> bool {
            false
        }
    }

    struct RecordingFactory {
        buffer: Arc<RecordingBuffer>,
        created: AtomicUsize,
    }

    impl OutputBufferFactory for RecordingFactory {
        fn create(
            &self,
            _task_id: &TaskId,
            _instance_id: &str,
            _limits: &OutputBufferLimits,
            _on_change: Arc<dyn Fn() + Send + Sync>,
        ) -> Arc<dyn OutputBuffer> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Arc::clone(&self.buffer) as Arc<dyn OutputBuffer>
        }
    }

    fn lazy_buffer() -> (LazyOutputBuffer, Arc<RecordingBuffer>, Arc<RecordingFactory>) {
        let buffer = RecordingBuffer::new();
        let factory = Arc::new(RecordingFactory {
            buffer: Arc::clone(&buffer),
            created: AtomicUsize::new(0),
        });
        let lazy = LazyOutputBuffer::new(
            TaskId::new(QueryId(1), StageId(0), 0, 1),
            "instance".to_string(),
            OutputBufferLimits::default(),
            Arc::clone(&factory) as Arc<dyn OutputBufferFactory>,
            Arc::new(|| {}),
        );
        (lazy, buffer, factory)
    }

    fn spec() -> OutputBufferSpec {
        OutputBufferSpec::single(OutputBufferKind::Partitioned, OutputBufferId(0))
    }

    #[tokio::test]
    async fn first_descriptor_creates_delegate_once() {
        let (lazy, buffer, factory) = lazy_buffer();
        lazy.set_output_buffers(spec()).expect("first descriptor");
        lazy.set_output_buffers(spec()).expect("second descriptor");
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.specs.lock().expect("specs lock").len(), 2);
    }

    #[tokio::test]
    async fn get_before_initialization_is_invalid_state() {
        let (lazy, _buffer, _factory) = lazy_buffer();
        let err = lazy
            .get(OutputBufferId(0), 0, 1024)
            .await
            .expect_err("uninitialized");
        assert!(matches!(err, QuarryError::InvalidState(_)));
    }

    #[tokio::test]
    async fn consumer_destroy_before_initialization_is_replayed() {
        let (lazy, buffer, _factory) = lazy_buffer();
        lazy.destroy(OutputBufferId(3));
        lazy.set_output_buffers(spec()).expect("descriptor");
        assert_eq!(
            *buffer.destroyed_buffers.lock().expect("destroyed lock"),
            vec![OutputBufferId(3)]
        );
    }

    #[tokio::test]
    async fn abort_before_initialization_suppresses_creation() {
        let (lazy, _buffer, factory) = lazy_buffer();
        lazy.abort();
        lazy.set_output_buffers(spec()).expect("late descriptor");
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        assert!(lazy.info().finished);
    }

    #[tokio::test]
    async fn lifecycle_calls_reach_delegate_after_initialization() {
        let (lazy, buffer, _factory) = lazy_buffer();
        lazy.set_output_buffers(spec()).expect("descriptor");
        lazy.destroy_all();
        lazy.abort();
        assert_eq!(buffer.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.aborts.load(Ordering::SeqCst), 1);
    }
}
