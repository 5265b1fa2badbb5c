//! Sorting sinks: full order-by and top-k selection.
//!
//! Both accumulate every input batch, sort once all input has arrived and
//! hand the result to a [`SinkGenerator`].

use super::sink::{SinkGenerator, SinkQueue};
use super::validate_input_count;
use crate::batch::{ExecBatch, Schema};
use crate::compute::{select_k_indices, sort_indices, SelectKOptions, SortOptions};
use crate::error::{ExecError, Result};
use crate::plan::context::MAX_BATCH_SIZE;
use crate::plan::exec_plan::{ExecPlan, NodeSpec};
use crate::plan::id::NodeId;
use crate::plan::node::{BatchCounter, ExecNode, NodeCore};
use parking_lot::Mutex;
use std::sync::Arc;

/// Options for `order_by_sink`.
#[derive(Clone)]
pub struct OrderBySinkNodeOptions {
    pub sort_options: SortOptions,
    generator: SinkGenerator,
}

impl OrderBySinkNodeOptions {
    pub fn new(sort_options: SortOptions) -> Self {
        Self {
            sort_options,
            generator: SinkGenerator::new(),
        }
    }

    pub fn generator(&self) -> SinkGenerator {
        self.generator.clone()
    }
}

/// Options for `select_k_sink`.
#[derive(Clone)]
pub struct SelectKSinkNodeOptions {
    pub select_k_options: SelectKOptions,
    generator: SinkGenerator,
}

impl SelectKSinkNodeOptions {
    pub fn new(select_k_options: SelectKOptions) -> Self {
        Self {
            select_k_options,
            generator: SinkGenerator::new(),
        }
    }

    pub fn generator(&self) -> SinkGenerator {
        self.generator.clone()
    }
}

#[derive(Debug, Clone)]
enum SortMode {
    OrderBy(SortOptions),
    SelectK(SelectKOptions),
}

impl SortMode {
    fn indices(&self, batch: &ExecBatch, schema: &Schema) -> Result<Vec<usize>> {
        match self {
            SortMode::OrderBy(options) => {
                sort_indices(batch, schema, &options.sort_keys, options.null_placement)
            }
            SortMode::SelectK(options) => select_k_indices(batch, schema, options),
        }
    }

    fn sort_keys(&self) -> impl Iterator<Item = &str> {
        let keys = match self {
            SortMode::OrderBy(options) => &options.sort_keys,
            SortMode::SelectK(options) => &options.sort_keys,
        };
        keys.iter().map(|k| k.target.as_str())
    }
}

/// Buffers its input and emits it sorted once complete.
pub struct SortSinkNode {
    core: NodeCore,
    mode: SortMode,
    buffered: Mutex<Vec<ExecBatch>>,
    queue: Arc<SinkQueue>,
    counter: BatchCounter,
}

impl SortSinkNode {
    pub fn make_order_by(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: OrderBySinkNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<SortSinkNode>> {
        Self::make(
            plan,
            inputs,
            SortMode::OrderBy(options.sort_options),
            options.generator,
            label,
        )
    }

    pub fn make_select_k(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: SelectKSinkNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<SortSinkNode>> {
        Self::make(
            plan,
            inputs,
            SortMode::SelectK(options.select_k_options),
            options.generator,
            label,
        )
    }

    fn make(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        mode: SortMode,
        generator: SinkGenerator,
        label: Option<String>,
    ) -> Result<Arc<SortSinkNode>> {
        let kind = match mode {
            SortMode::OrderBy(_) => "OrderBySinkNode",
            SortMode::SelectK(_) => "SelectKSinkNode",
        };
        validate_input_count(kind, &inputs, 1)?;
        let schema = inputs[0].output_schema().clone();
        for key in mode.sort_keys() {
            schema.resolve(key)?;
        }
        let spec = NodeSpec::new(inputs, schema.clone())
            .with_label(label)
            .with_num_outputs(0);
        plan.emplace_node(spec, move |core| {
            let queue = Arc::new(SinkQueue::new(None));
            generator.attach(&queue, schema, None)?;
            Ok(SortSinkNode {
                core,
                mode,
                buffered: Mutex::new(Vec::new()),
                queue,
                counter: BatchCounter::new(),
            })
        })
    }

    fn sorted(&self) -> Result<ExecBatch> {
        let batches = std::mem::take(&mut *self.buffered.lock());
        let schema = self.core.output_schema();
        let combined = ExecBatch::concat(schema.num_fields(), &batches)?;
        let indices = self.mode.indices(&combined, schema)?;
        Ok(combined.take(&indices))
    }

    fn finish(&self) {
        let result = self.sorted().map(|sorted| {
            for chunk in sorted.chunks(MAX_BATCH_SIZE) {
                self.queue.push(chunk);
            }
        });
        if let Err(err) = &result {
            tracing::warn!(node = %self.label(), error = %err, "Sorting failed");
        }
        self.queue.close(result.clone());
        self.core.mark_finished(result);
    }

    fn abort(&self, result: Result<()>) {
        self.buffered.lock().clear();
        self.queue.close(result.clone());
        self.core.mark_finished(result);
    }
}

impl_node_debug!(SortSinkNode);

impl ExecNode for SortSinkNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind_name(&self) -> &'static str {
        match self.mode {
            SortMode::OrderBy(_) => "OrderBySinkNode",
            SortMode::SelectK(_) => "SelectKSinkNode",
        }
    }

    fn start_producing(&self) -> Result<()> {
        Ok(())
    }

    fn input_received(&self, _input: NodeId, batch: ExecBatch) {
        if self.counter.is_complete() {
            return;
        }
        self.buffered.lock().push(batch);
        if self.counter.increment() {
            self.finish();
        }
    }

    fn error_received(&self, _input: NodeId, error: ExecError) {
        if self.counter.cancel() {
            self.abort(Err(error));
        }
    }

    fn input_finished(&self, _input: NodeId, total_batches: usize) {
        if self.counter.set_total(total_batches) {
            self.finish();
        }
    }

    fn stop_producing(&self) {
        if self.counter.cancel() {
            self.abort(Ok(()));
        }
    }

    fn describe(&self, _indent: usize) -> String {
        match &self.mode {
            SortMode::OrderBy(options) => format!("by={{{}}}", options),
            SortMode::SelectK(options) => format!("by={{{}}}", options),
        }
    }
}
