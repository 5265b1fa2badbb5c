//! The generator sink.
//!
//! A [`SinkNode`] buffers incoming batches in a queue that the caller
//! drains through a [`SinkGenerator`]. The node owns the queue and the
//! generator only holds a weak reference, so a generator outliving its plan
//! reports an error instead of waiting forever.

use super::validate_input_count;
use crate::batch::{ExecBatch, SchemaRef};
use crate::error::{ExecError, Result};
use crate::plan::backpressure::{
    BackpressureAccumulator, BackpressureControl, BackpressureMonitor, BackpressureOptions,
    BackpressureSignal,
};
use crate::plan::context::MAX_BATCH_SIZE;
use crate::plan::exec_plan::{ExecPlan, NodeSpec};
use crate::plan::id::NodeId;
use crate::plan::node::{BatchCounter, ExecNode, NodeCore};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll, Waker};

// ==================== Backpressure ====================

/// Pauses and resumes the inputs of a sink.
///
/// Every request carries a counter so that sources can discard requests
/// that arrive out of order. Direct calls through [`BackpressureControl`]
/// draw a fresh counter; accumulator decisions arrive already sequenced.
pub struct NodeBackpressureControl {
    core: NodeCore,
    counter: AtomicU64,
}

impl NodeBackpressureControl {
    pub fn new(core: NodeCore) -> Self {
        Self {
            core,
            counter: AtomicU64::new(0),
        }
    }

    fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn send(&self, paused: bool, counter: u64) {
        let id = self.core.id();
        for input in self.core.inputs() {
            if paused {
                input.pause_producing(id, counter);
            } else {
                input.resume_producing(id, counter);
            }
        }
    }
}

impl BackpressureControl for NodeBackpressureControl {
    fn pause(&self) {
        self.send(true, self.next_counter());
    }

    fn resume(&self) {
        self.send(false, self.next_counter());
    }
}

impl BackpressureSignal for NodeBackpressureControl {
    fn signal(&self, paused: bool, sequence: u64) {
        self.send(paused, sequence);
    }
}

// ==================== Queue ====================

#[derive(Default)]
struct QueueState {
    batches: VecDeque<ExecBatch>,
    end: Option<Result<()>>,
    waker: Option<Waker>,
}

/// Batches waiting for the generator, plus how the stream ends.
pub(crate) struct SinkQueue {
    state: Mutex<QueueState>,
    backpressure: Option<BackpressureAccumulator>,
}

impl SinkQueue {
    pub(crate) fn new(backpressure: Option<BackpressureAccumulator>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            backpressure,
        }
    }

    /// Append a batch. Returns `false` once the queue has been closed.
    pub(crate) fn push(&self, batch: ExecBatch) -> bool {
        let bytes = batch.total_buffer_size();
        let waker = {
            let mut state = self.state.lock();
            if state.end.is_some() {
                return false;
            }
            state.batches.push_back(batch);
            state.waker.take()
        };
        if let Some(backpressure) = &self.backpressure {
            backpressure.record_produced(bytes);
        }
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// End the stream after the batches already queued. The first close
    /// wins.
    pub(crate) fn close(&self, result: Result<()>) {
        let waker = {
            let mut state = self.state.lock();
            if state.end.is_none() {
                state.end = Some(result);
            }
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn poll_next(&self, cx: &mut Context<'_>) -> Poll<Option<Result<ExecBatch>>> {
        let batch = {
            let mut state = self.state.lock();
            match state.batches.pop_front() {
                Some(batch) => batch,
                None => {
                    return match &state.end {
                        None => {
                            state.waker = Some(cx.waker().clone());
                            Poll::Pending
                        }
                        Some(Ok(())) => Poll::Ready(None),
                        Some(Err(err)) => {
                            let err = err.clone();
                            // The error is reported once; the stream ends after it.
                            state.end = Some(Ok(()));
                            Poll::Ready(Some(Err(err)))
                        }
                    };
                }
            }
        };
        if let Some(backpressure) = &self.backpressure {
            backpressure.record_consumed(batch.total_buffer_size());
        }
        Poll::Ready(Some(Ok(batch)))
    }
}

impl Drop for SinkQueue {
    fn drop(&mut self) {
        if let Some(waker) = self.state.get_mut().waker.take() {
            waker.wake();
        }
    }
}

// ==================== Generator ====================

#[derive(Default)]
struct GeneratorShared {
    queue: OnceLock<Weak<SinkQueue>>,
    schema: OnceLock<SchemaRef>,
    monitor: OnceLock<BackpressureMonitor>,
}

/// Stream of the batches reaching a generator-backed sink.
///
/// Yields every batch, then ends. A failed plan yields its error once and
/// then ends.
#[derive(Clone, Default)]
pub struct SinkGenerator {
    shared: Arc<GeneratorShared>,
    done: bool,
}

impl SinkGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(
        &self,
        queue: &Arc<SinkQueue>,
        schema: SchemaRef,
        monitor: Option<BackpressureMonitor>,
    ) -> Result<()> {
        self.shared
            .queue
            .set(Arc::downgrade(queue))
            .map_err(|_| ExecError::invalid("SinkGenerator is already attached to a sink node"))?;
        let _ = self.shared.schema.set(schema);
        if let Some(monitor) = monitor {
            let _ = self.shared.monitor.set(monitor);
        }
        Ok(())
    }

    /// Schema of the batches this generator yields, once attached.
    pub fn schema(&self) -> Option<SchemaRef> {
        self.shared.schema.get().cloned()
    }

    /// Present when the sink was configured with backpressure.
    pub fn backpressure_monitor(&self) -> Option<BackpressureMonitor> {
        self.shared.monitor.get().cloned()
    }

    /// The next batch, `None` at the end of the stream.
    pub async fn next_batch(&mut self) -> Result<Option<ExecBatch>> {
        futures::StreamExt::next(self).await.transpose()
    }
}

impl Stream for SinkGenerator {
    type Item = Result<ExecBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let queue = match self.shared.queue.get() {
            None => Err(ExecError::invalid(
                "SinkGenerator is not attached to a sink node",
            )),
            Some(weak) => weak.upgrade().ok_or_else(|| {
                ExecError::invalid("ExecPlan was destroyed before finishing pushing to the sink")
            }),
        };
        let poll = match queue {
            Ok(queue) => queue.poll_next(cx),
            Err(err) => Poll::Ready(Some(Err(err))),
        };
        match &poll {
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => self.done = true,
            _ => {}
        }
        poll
    }
}

// ==================== Node ====================

/// Options for the `sink` node.
#[derive(Clone, Default)]
pub struct SinkNodeOptions {
    generator: SinkGenerator,
    pub backpressure: Option<BackpressureOptions>,
}

impl SinkNodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureOptions) -> Self {
        self.backpressure = Some(backpressure);
        self
    }

    /// Handle to the batches this sink will receive.
    pub fn generator(&self) -> SinkGenerator {
        self.generator.clone()
    }
}

/// Buffers its single input for a [`SinkGenerator`].
pub struct SinkNode {
    core: NodeCore,
    queue: Arc<SinkQueue>,
    counter: BatchCounter,
}

impl SinkNode {
    pub fn make(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: SinkNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<SinkNode>> {
        validate_input_count("SinkNode", &inputs, 1)?;
        let schema = inputs[0].output_schema().clone();
        let backpressure = options.backpressure.or(plan.ctx().sink_backpressure());
        let generator = options.generator;
        let spec = NodeSpec::new(inputs, schema.clone())
            .with_label(label)
            .with_num_outputs(0);
        plan.emplace_node(spec, move |core| {
            let accumulator = match backpressure {
                Some(options) => {
                    let signal: Arc<dyn BackpressureSignal> =
                        Arc::new(NodeBackpressureControl::new(core.clone()));
                    Some(BackpressureAccumulator::new(options, signal)?)
                }
                None => None,
            };
            let monitor = accumulator.as_ref().map(|a| a.monitor());
            let queue = Arc::new(SinkQueue::new(accumulator));
            generator.attach(&queue, schema, monitor)?;
            Ok(SinkNode {
                core,
                queue,
                counter: BatchCounter::new(),
            })
        })
    }

    fn finish(&self, result: Result<()>) {
        self.queue.close(result.clone());
        self.core.mark_finished(result);
    }
}

impl_node_debug!(SinkNode);

impl ExecNode for SinkNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind_name(&self) -> &'static str {
        "SinkNode"
    }

    fn start_producing(&self) -> Result<()> {
        Ok(())
    }

    fn input_received(&self, _input: NodeId, batch: ExecBatch) {
        if self.counter.is_complete() {
            return;
        }
        for chunk in batch.chunks(MAX_BATCH_SIZE) {
            if !self.queue.push(chunk) {
                tracing::warn!(node = %self.label(), "Discarding batch received after the sink closed");
            }
        }
        if self.counter.increment() {
            self.finish(Ok(()));
        }
    }

    fn error_received(&self, _input: NodeId, error: ExecError) {
        if self.counter.cancel() {
            self.finish(Err(error));
        }
    }

    fn input_finished(&self, _input: NodeId, total_batches: usize) {
        if self.counter.set_total(total_batches) {
            self.finish(Ok(()));
        }
    }

    fn stop_producing(&self) {
        if self.counter.cancel() {
            self.finish(Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{DataType, ExecBatch};
    use futures::executor::block_on;
    use futures::StreamExt;

    fn batch(values: &str) -> ExecBatch {
        ExecBatch::from_json(&[DataType::Int32], values).unwrap()
    }

    fn attached() -> (Arc<SinkQueue>, SinkGenerator) {
        let queue = Arc::new(SinkQueue::new(None));
        let generator = SinkGenerator::new();
        generator
            .attach(&queue, Arc::new(crate::batch::Schema::default()), None)
            .unwrap();
        (queue, generator)
    }

    #[test]
    fn test_batches_then_end() {
        let (queue, mut generator) = attached();
        queue.push(batch("[[1]]"));
        queue.push(batch("[[2]]"));
        queue.close(Ok(()));
        assert!(!queue.push(batch("[[3]]")));
        let collected: Vec<_> = block_on(generator.by_ref().collect::<Vec<_>>());
        assert_eq!(collected.len(), 2);
        assert!(block_on(generator.next()).is_none());
    }

    #[test]
    fn test_error_is_reported_once() {
        let (queue, mut generator) = attached();
        queue.close(Err(ExecError::Execution("boom".to_string())));
        let err = block_on(generator.next_batch()).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(block_on(generator.next_batch()).unwrap(), None);
    }

    #[test]
    fn test_dropped_queue_is_an_error() {
        let (queue, mut generator) = attached();
        drop(queue);
        let err = block_on(generator.next_batch()).unwrap_err();
        assert!(err.is_invalid());
    }

    #[test]
    fn test_unattached_generator() {
        let mut generator = SinkGenerator::new();
        assert!(block_on(generator.next_batch()).unwrap_err().is_invalid());
        assert!(generator.schema().is_none());
    }
}
