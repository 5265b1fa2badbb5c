//! The node contract.
//!
//! Every operator implements [`ExecNode`]. The runtime only talks to nodes
//! through this trait; it never inspects concrete kinds.
//!
//! # Design
//!
//! - **Push-based data flow**: an upstream node calls `input_received` on
//!   each of its outputs, then `input_finished` once with the number of
//!   batches it sent. Batches may overtake the finish signal in threaded
//!   mode, so receivers count arrivals with a [`BatchCounter`].
//! - **Pull-based control**: pause/resume travel from sinks back to
//!   sources through `pause_producing` / `resume_producing`.
//! - **Shared plumbing** lives in [`NodeCore`], which the plan builds for
//!   each node. Nodes hold it by value and clone it into async tasks.

use super::completion::Completion;
use super::context::{ExecContext, MAX_BATCH_SIZE};
use super::exec_plan::{ExecPlan, PlanInner};
use super::id::NodeId;
use crate::batch::{ExecBatch, SchemaRef};
use crate::error::{ExecError, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// An operator in an [`ExecPlan`].
///
/// Implementations must tolerate `input_received` being called
/// concurrently, both from different inputs and for the same input.
pub trait ExecNode: Send + Sync {
    fn core(&self) -> &NodeCore;

    /// Kind tag shown in diagnostics, e.g. `"FilterNode"`.
    fn kind_name(&self) -> &'static str;

    /// Called once, consumers before producers. Must not block.
    fn start_producing(&self) -> Result<()>;

    fn input_received(&self, input: NodeId, batch: ExecBatch);

    fn error_received(&self, input: NodeId, error: ExecError);

    /// `input` will send no more batches; it sent `total_batches` overall.
    fn input_finished(&self, input: NodeId, total_batches: usize);

    /// Cooperative cancellation. Idempotent; the node must still reach a
    /// finished state.
    fn stop_producing(&self);

    /// Ask this node to stop feeding `output`. `counter` orders
    /// pause/resume requests; stale ones are ignored by sources.
    fn pause_producing(&self, _output: NodeId, counter: u64) {
        let id = self.core().id();
        for input in self.core().inputs() {
            input.pause_producing(id, counter);
        }
    }

    fn resume_producing(&self, _output: NodeId, counter: u64) {
        let id = self.core().id();
        for input in self.core().inputs() {
            input.resume_producing(id, counter);
        }
    }

    /// Kind-specific parameters rendered inside the braces of
    /// [`ExecNode::to_string_indented`].
    fn describe(&self, _indent: usize) -> String {
        String::new()
    }

    fn id(&self) -> NodeId {
        self.core().id()
    }

    fn label(&self) -> &str {
        self.core().label()
    }

    fn inputs(&self) -> Vec<Arc<dyn ExecNode>> {
        self.core().inputs()
    }

    fn num_outputs(&self) -> usize {
        self.core().num_outputs()
    }

    fn output_schema(&self) -> &SchemaRef {
        self.core().output_schema()
    }

    fn finished(&self) -> &Completion {
        self.core().finished()
    }

    fn plan(&self) -> Option<ExecPlan> {
        self.core().plan()
    }

    fn to_string_indented(&self, indent: usize) -> String {
        format!(
            "{}:{}{{{}}}",
            self.core().display_label(),
            self.kind_name(),
            self.describe(indent)
        )
    }
}

impl fmt::Display for dyn ExecNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_indented(0))
    }
}

impl fmt::Debug for dyn ExecNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.kind_name())
            .field("id", &self.id())
            .field("label", &self.label())
            .finish()
    }
}

// ==================== Counting ====================

/// Counts batches received from one input against the total announced by
/// `input_finished`. Exactly one of `increment`, `set_total` or `cancel`
/// returns `true`: the call that completes the counter.
#[derive(Debug)]
pub struct BatchCounter {
    count: AtomicUsize,
    total: AtomicUsize,
    complete: AtomicBool,
}

const TOTAL_UNSET: usize = usize::MAX;

impl Default for BatchCounter {
    fn default() -> Self {
        Self {
            count: AtomicUsize::new(0),
            total: AtomicUsize::new(TOTAL_UNSET),
            complete: AtomicBool::new(false),
        }
    }
}

impl BatchCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn increment(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if count != self.total.load(Ordering::SeqCst) {
            return false;
        }
        self.do_complete()
    }

    pub fn set_total(&self, total: usize) -> bool {
        self.total.store(total, Ordering::SeqCst);
        if self.count.load(Ordering::SeqCst) != total {
            return false;
        }
        self.do_complete()
    }

    pub fn cancel(&self) -> bool {
        self.do_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    fn do_complete(&self) -> bool {
        !self.complete.swap(true, Ordering::SeqCst)
    }
}

// ==================== Cancellation ====================

/// Cooperative stop flag checked by node tasks between units of work.
#[derive(Debug, Default)]
pub struct StopToken {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the first request only.
    pub fn request_stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        loop {
            // Register before checking so a concurrent request cannot slip
            // between the check and the await.
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

// ==================== Core ====================

struct CoreInner {
    id: NodeId,
    label: String,
    auto_labeled: bool,
    input_ids: Vec<NodeId>,
    inputs: Vec<Weak<dyn ExecNode>>,
    num_outputs: usize,
    outputs: RwLock<Vec<Weak<dyn ExecNode>>>,
    output_schema: SchemaRef,
    ctx: ExecContext,
    plan: Weak<PlanInner>,
    finished: Completion,
    stop: StopToken,
    batches_emitted: AtomicUsize,
}

/// Graph metadata and delivery helpers shared by every node.
///
/// Cloning is cheap; clones refer to the same node.
#[derive(Clone)]
pub struct NodeCore {
    inner: Arc<CoreInner>,
}

pub(crate) struct CoreArgs {
    pub id: NodeId,
    pub label: String,
    pub auto_labeled: bool,
    pub inputs: Vec<Arc<dyn ExecNode>>,
    pub num_outputs: usize,
    pub output_schema: SchemaRef,
    pub ctx: ExecContext,
    pub plan: Weak<PlanInner>,
}

impl NodeCore {
    pub(crate) fn new(args: CoreArgs) -> Self {
        Self {
            inner: Arc::new(CoreInner {
                id: args.id,
                label: args.label,
                auto_labeled: args.auto_labeled,
                input_ids: args.inputs.iter().map(|n| n.id()).collect(),
                inputs: args.inputs.iter().map(Arc::downgrade).collect(),
                num_outputs: args.num_outputs,
                outputs: RwLock::new(Vec::new()),
                output_schema: args.output_schema,
                ctx: args.ctx,
                plan: args.plan,
                finished: Completion::new(),
                stop: StopToken::new(),
                batches_emitted: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The label as printed in diagnostics: empty for auto-generated labels.
    pub fn display_label(&self) -> &str {
        if self.inner.auto_labeled {
            ""
        } else {
            &self.inner.label
        }
    }

    pub fn is_auto_labeled(&self) -> bool {
        self.inner.auto_labeled
    }

    pub fn input_ids(&self) -> &[NodeId] {
        &self.inner.input_ids
    }

    pub fn num_inputs(&self) -> usize {
        self.inner.input_ids.len()
    }

    /// Position of `input` among this node's inputs.
    pub fn input_index(&self, input: NodeId) -> Option<usize> {
        self.inner.input_ids.iter().position(|&id| id == input)
    }

    pub fn inputs(&self) -> Vec<Arc<dyn ExecNode>> {
        self.inner.inputs.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn input(&self, index: usize) -> Option<Arc<dyn ExecNode>> {
        self.inner.inputs.get(index).and_then(Weak::upgrade)
    }

    pub fn num_outputs(&self) -> usize {
        self.inner.num_outputs
    }

    pub fn outputs(&self) -> Vec<Arc<dyn ExecNode>> {
        self.inner
            .outputs
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn num_bound_outputs(&self) -> usize {
        self.inner.outputs.read().len()
    }

    pub(crate) fn add_output(&self, output: Weak<dyn ExecNode>) {
        self.inner.outputs.write().push(output);
    }

    pub fn output_schema(&self) -> &SchemaRef {
        &self.inner.output_schema
    }

    pub fn ctx(&self) -> &ExecContext {
        &self.inner.ctx
    }

    pub fn plan(&self) -> Option<ExecPlan> {
        self.inner.plan.upgrade().map(ExecPlan::from_inner)
    }

    pub(crate) fn belongs_to(&self, plan: &Arc<PlanInner>) -> bool {
        std::ptr::eq(self.inner.plan.as_ptr(), Arc::as_ptr(plan))
    }

    pub fn finished(&self) -> &Completion {
        &self.inner.finished
    }

    pub fn stop_token(&self) -> &StopToken {
        &self.inner.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_stopped()
    }

    /// Returns `true` for the first request only.
    pub fn request_stop(&self) -> bool {
        self.inner.stop.request_stop()
    }

    pub fn batches_emitted(&self) -> usize {
        self.inner.batches_emitted.load(Ordering::SeqCst)
    }

    /// Forward `batch` to every output, sliced to at most
    /// [`MAX_BATCH_SIZE`] rows. Returns the number of slices sent.
    pub fn emit(&self, batch: ExecBatch) -> usize {
        let chunks = batch.chunks(MAX_BATCH_SIZE);
        let sent = chunks.len();
        for chunk in chunks {
            self.inner.batches_emitted.fetch_add(1, Ordering::SeqCst);
            self.deliver(chunk);
        }
        sent
    }

    /// Count `chunks` batches as emitted without delivering them yet. Used
    /// by sources that hand delivery to separate tasks.
    pub fn reserve_emitted(&self, chunks: usize) {
        self.inner.batches_emitted.fetch_add(chunks, Ordering::SeqCst);
    }

    /// Hand `batch` to every output as is.
    pub fn deliver(&self, batch: ExecBatch) {
        let id = self.inner.id;
        let outputs = self.outputs();
        if let Some((last, rest)) = outputs.split_last() {
            for output in rest {
                output.input_received(id, batch.clone());
            }
            last.input_received(id, batch);
        }
    }

    pub fn emit_error(&self, error: ExecError) {
        let id = self.inner.id;
        for output in self.outputs() {
            output.error_received(id, error.clone());
        }
    }

    /// Tell every output that no more batches are coming.
    pub fn emit_finished(&self) {
        let id = self.inner.id;
        let total = self.batches_emitted();
        for output in self.outputs() {
            output.input_finished(id, total);
        }
    }

    /// Resolve this node's completion. Returns `false` if it had already
    /// resolved.
    pub fn mark_finished(&self, result: Result<()>) -> bool {
        match &result {
            Ok(()) => tracing::debug!(node = %self.label(), "Node finished"),
            Err(err) => tracing::debug!(node = %self.label(), error = %err, "Node failed"),
        }
        self.inner.finished.mark_finished(result)
    }
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCore")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("inputs", &self.inner.input_ids)
            .field("num_outputs", &self.inner.num_outputs)
            .finish()
    }
}
