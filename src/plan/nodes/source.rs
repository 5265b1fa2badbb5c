//! Source nodes.
//!
//! Every source variant reduces to a boxed stream of batches. Starting the
//! node spawns a pump that pulls from the stream and pushes each batch
//! downstream until the stream ends, fails, or the node is stopped. In
//! threaded mode deliveries are fanned out onto the executor; the pump
//! waits for them to drain before announcing its batch total.

use super::{required, validate_input_count};
use crate::batch::{ArrayVector, ExecBatch, RecordBatch, RecordBatchReader, SchemaRef, Table};
use crate::error::{ExecError, Result};
use crate::plan::context::MAX_BATCH_SIZE;
use crate::plan::exec_plan::{ExecPlan, NodeSpec};
use crate::plan::id::NodeId;
use crate::plan::node::{ExecNode, NodeCore, StopToken};
use crate::plan::scheduler::{spawn_future_or_else, TaskGroup};
use futures::future::{select, Either};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// Lazily produced batches. The stream ending marks the end of the data.
pub type BatchStream = BoxStream<'static, Result<ExecBatch>>;

/// Options for the generic `source` node.
pub struct SourceNodeOptions {
    pub output_schema: Option<SchemaRef>,
    pub generator: Option<BatchStream>,
}

impl SourceNodeOptions {
    pub fn new(output_schema: SchemaRef, generator: BatchStream) -> Self {
        Self {
            output_schema: Some(output_schema),
            generator: Some(generator),
        }
    }

    /// A source replaying `batches` in order.
    pub fn from_batches(output_schema: SchemaRef, batches: Vec<ExecBatch>) -> Self {
        Self::new(output_schema, stream::iter(batches.into_iter().map(Ok)).boxed())
    }
}

/// Options for `table_source`.
pub struct TableSourceNodeOptions {
    pub table: Option<Arc<Table>>,
    /// Rows per emitted batch. `None` uses the context's default.
    pub max_batch_size: Option<usize>,
}

impl TableSourceNodeOptions {
    pub fn new(table: Arc<Table>) -> Self {
        Self {
            table: Some(table),
            max_batch_size: None,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = Some(max_batch_size);
        self
    }
}

/// Options for `record_batch_reader_source`.
pub struct RecordBatchReaderSourceNodeOptions {
    pub reader: Option<Box<dyn RecordBatchReader>>,
}

impl RecordBatchReaderSourceNodeOptions {
    pub fn new(reader: Box<dyn RecordBatchReader>) -> Self {
        Self {
            reader: Some(reader),
        }
    }
}

/// Options for the iterator-backed sources.
pub struct IteratorSourceNodeOptions<T> {
    pub schema: Option<SchemaRef>,
    pub iterator: Option<Box<dyn Iterator<Item = T> + Send>>,
}

impl<T> IteratorSourceNodeOptions<T> {
    pub fn new<I>(schema: SchemaRef, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self {
            schema: Some(schema),
            iterator: Some(Box::new(items.into_iter())),
        }
    }
}

pub type ArrayVectorSourceNodeOptions = IteratorSourceNodeOptions<ArrayVector>;
pub type ExecBatchSourceNodeOptions = IteratorSourceNodeOptions<ExecBatch>;
pub type RecordBatchSourceNodeOptions = IteratorSourceNodeOptions<RecordBatch>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Generator,
    Table,
    RecordBatchReader,
    ArrayVector,
    ExecBatch,
    RecordBatch,
}

impl SourceKind {
    fn kind_name(self) -> &'static str {
        match self {
            SourceKind::Generator => "SourceNode",
            SourceKind::Table => "TableSourceNode",
            SourceKind::RecordBatchReader => "RecordBatchReaderSourceNode",
            SourceKind::ArrayVector => "ArrayVectorSourceNode",
            SourceKind::ExecBatch => "ExecBatchSourceNode",
            SourceKind::RecordBatch => "RecordBatchSourceNode",
        }
    }
}

/// Pause flag driven by backpressure. Requests carry a counter and only a
/// request newer than the last one applied takes effect.
#[derive(Debug, Default)]
struct PauseState {
    state: Mutex<PauseCounter>,
    resumed: Notify,
}

#[derive(Debug, Default)]
struct PauseCounter {
    last_counter: u64,
    paused: bool,
}

impl PauseState {
    /// Returns `false` if the request was stale.
    fn apply(&self, counter: u64, paused: bool) -> bool {
        {
            let mut state = self.state.lock();
            if counter <= state.last_counter {
                return false;
            }
            state.last_counter = counter;
            state.paused = paused;
        }
        if !paused {
            self.resumed.notify_waiters();
        }
        true
    }

    fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Resolves once unpaused or once `stop` fires.
    async fn wait_resumed(&self, stop: &StopToken) {
        loop {
            let notified = self.resumed.notified();
            if !self.is_paused() || stop.is_stopped() {
                return;
            }
            let stopped = stop.stopped();
            futures::pin_mut!(notified);
            futures::pin_mut!(stopped);
            if let Either::Right(_) = select(notified, stopped).await {
                return;
            }
        }
    }
}

/// A node with no inputs that pushes the contents of a [`BatchStream`].
pub struct SourceNode {
    core: NodeCore,
    kind: SourceKind,
    generator: Mutex<Option<BatchStream>>,
    pause: Arc<PauseState>,
}

impl SourceNode {
    pub fn make(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: SourceNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<SourceNode>> {
        let kind = SourceKind::Generator;
        validate_input_count(kind.kind_name(), &inputs, 0)?;
        let schema = required(options.output_schema, kind.kind_name(), "output_schema")?;
        let generator = required(options.generator, kind.kind_name(), "generator")?;
        Self::emplace(plan, schema, generator, kind, label)
    }

    pub fn make_table_source(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: TableSourceNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<SourceNode>> {
        let kind = SourceKind::Table;
        validate_input_count(kind.kind_name(), &inputs, 0)?;
        let table = required(options.table, kind.kind_name(), "table")?;
        let max_batch_size = options
            .max_batch_size
            .unwrap_or_else(|| plan.ctx().table_source_batch_size());
        if max_batch_size == 0 {
            return Err(ExecError::invalid(
                "TableSourceNode requires batch_size > 0",
            ));
        }
        let batches = table.to_batches(max_batch_size);
        let generator = stream::iter(batches.into_iter().map(Ok)).boxed();
        Self::emplace(plan, table.schema().clone(), generator, kind, label)
    }

    pub fn make_reader_source(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: RecordBatchReaderSourceNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<SourceNode>> {
        let kind = SourceKind::RecordBatchReader;
        validate_input_count(kind.kind_name(), &inputs, 0)?;
        let mut reader = required(options.reader, kind.kind_name(), "reader")?;
        let schema = reader.schema();
        let batches = std::iter::from_fn(move || match reader.read_next() {
            Ok(Some(batch)) => Some(Ok(batch.into_batch())),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        });
        Self::emplace(plan, schema, stream::iter(batches).boxed(), kind, label)
    }

    pub fn make_array_vector_source(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: ArrayVectorSourceNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<SourceNode>> {
        Self::make_iterator_source(plan, inputs, options, SourceKind::ArrayVector, label, |_, v| {
            ExecBatch::try_new(v)
        })
    }

    pub fn make_exec_batch_source(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: ExecBatchSourceNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<SourceNode>> {
        Self::make_iterator_source(plan, inputs, options, SourceKind::ExecBatch, label, |_, b| Ok(b))
    }

    pub fn make_record_batch_source(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: RecordBatchSourceNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<SourceNode>> {
        Self::make_iterator_source(
            plan,
            inputs,
            options,
            SourceKind::RecordBatch,
            label,
            |schema, batch: RecordBatch| {
                if batch.schema().as_ref() != schema.as_ref() {
                    return Err(ExecError::invalid(
                        "RecordBatchSourceNode received a batch whose schema differs from the declared one",
                    ));
                }
                Ok(batch.into_batch())
            },
        )
    }

    fn make_iterator_source<T, F>(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: IteratorSourceNodeOptions<T>,
        kind: SourceKind,
        label: Option<String>,
        convert: F,
    ) -> Result<Arc<SourceNode>>
    where
        T: 'static,
        F: Fn(&SchemaRef, T) -> Result<ExecBatch> + Send + 'static,
    {
        validate_input_count(kind.kind_name(), &inputs, 0)?;
        let schema = required(options.schema, kind.kind_name(), "schema")?;
        let iterator = required(options.iterator, kind.kind_name(), "iterator")?;
        let item_schema = schema.clone();
        let batches = iterator.map(move |item| convert(&item_schema, item));
        Self::emplace(plan, schema, stream::iter(batches).boxed(), kind, label)
    }

    fn emplace(
        plan: &ExecPlan,
        schema: SchemaRef,
        generator: BatchStream,
        kind: SourceKind,
        label: Option<String>,
    ) -> Result<Arc<SourceNode>> {
        plan.emplace_node(NodeSpec::new(Vec::new(), schema).with_label(label), |core| {
            Ok(SourceNode {
                core,
                kind,
                generator: Mutex::new(Some(generator)),
                pause: Arc::new(PauseState::default()),
            })
        })
    }

    /// Whether backpressure currently holds this source.
    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }
}

/// Pull batches until the stream ends, fails, or the node is stopped.
async fn pump(core: NodeCore, mut generator: BatchStream, pause: Arc<PauseState>) {
    let parallel = core.ctx().use_threads();
    let deliveries = TaskGroup::new(core.ctx().executor().clone());
    let mut result = Ok(());

    loop {
        pause.wait_resumed(core.stop_token()).await;
        if core.is_stopped() {
            tracing::debug!(node = %core.label(), "Source stopped");
            break;
        }
        let next = match select(generator.next(), Box::pin(core.stop_token().stopped())).await {
            Either::Left((next, _)) => next,
            Either::Right(_) => continue,
        };
        match next {
            None => break,
            Some(Err(err)) => {
                result = Err(err);
                break;
            }
            Some(Ok(batch)) if parallel => {
                let chunks = batch.chunks(MAX_BATCH_SIZE);
                core.reserve_emitted(chunks.len());
                for chunk in chunks {
                    let core = core.clone();
                    deliveries.spawn(move || core.deliver(chunk));
                }
            }
            Some(Ok(batch)) => {
                core.emit(batch);
            }
        }
    }

    deliveries.end();
    // Deliveries fail only by panicking. The wait also orders them before
    // the total.
    if let Err(err) = deliveries.finished().wait().await {
        if result.is_ok() {
            result = Err(err);
        }
    }

    match result {
        Ok(()) => {
            tracing::debug!(
                node = %core.label(),
                batches = core.batches_emitted(),
                "Source exhausted"
            );
            core.emit_finished();
            core.mark_finished(Ok(()));
        }
        Err(err) => {
            tracing::warn!(node = %core.label(), error = %err, "Source generator failed");
            core.emit_error(err.clone());
            core.emit_finished();
            core.mark_finished(Err(err));
        }
    }
}

impl_node_debug!(SourceNode);

impl ExecNode for SourceNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind_name(&self) -> &'static str {
        self.kind.kind_name()
    }

    fn start_producing(&self) -> Result<()> {
        let generator = self.generator.lock().take().ok_or_else(|| {
            ExecError::invalid(format!("{} was already started", self.kind_name()))
        })?;
        let core = self.core.clone();
        spawn_future_or_else(
            self.core.ctx().executor().clone(),
            pump(self.core.clone(), generator, self.pause.clone()),
            move |err| {
                core.emit_error(err.clone());
                core.mark_finished(Err(err));
            },
        );
        Ok(())
    }

    fn input_received(&self, _input: NodeId, _batch: ExecBatch) {}

    fn error_received(&self, _input: NodeId, _error: ExecError) {}

    fn input_finished(&self, _input: NodeId, _total_batches: usize) {}

    fn pause_producing(&self, _output: NodeId, counter: u64) {
        if self.pause.apply(counter, true) {
            tracing::debug!(node = %self.label(), counter, "Source paused");
        }
    }

    fn resume_producing(&self, _output: NodeId, counter: u64) {
        if self.pause.apply(counter, false) {
            tracing::debug!(node = %self.label(), counter, "Source resumed");
        }
    }

    fn stop_producing(&self) {
        self.core.request_stop();
        // A pump that never ran cannot finish the node.
        if self.generator.lock().take().is_some() {
            self.core.mark_finished(Ok(()));
        }
    }
}
