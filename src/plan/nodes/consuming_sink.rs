//! Sinks that hand batches to a caller-supplied consumer.
//!
//! The node is finished only after the consumer's own `finish` future
//! resolves, so a slow consumer keeps the plan running after its input has
//! drained. `table_sink` is a consuming sink whose consumer collects a
//! [`Table`].

use super::sink::NodeBackpressureControl;
use super::{required, validate_input_count};
use crate::batch::{ExecBatch, SchemaRef, Table};
use crate::error::{ExecError, Result};
use crate::plan::backpressure::BackpressureControl;
use crate::plan::exec_plan::{ExecPlan, NodeSpec};
use crate::plan::id::NodeId;
use crate::plan::node::{BatchCounter, ExecNode, NodeCore};
use crate::plan::scheduler::spawn_future_or_else;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

/// Receives the output of a consuming sink.
///
/// `consume` may be called concurrently from several threads.
pub trait SinkNodeConsumer: Send + Sync {
    /// Called once from `start_producing`, before any batch.
    fn init(
        &self,
        schema: &SchemaRef,
        backpressure: Arc<dyn BackpressureControl>,
        plan: &ExecPlan,
    ) -> Result<()>;

    fn consume(&self, batch: ExecBatch) -> Result<()>;

    /// Called once no more batches will arrive. The sink finishes when the
    /// returned future resolves.
    fn finish(&self) -> BoxFuture<'static, Result<()>>;
}

/// Consumer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSinkConsumer;

impl SinkNodeConsumer for NullSinkConsumer {
    fn init(&self, _: &SchemaRef, _: Arc<dyn BackpressureControl>, _: &ExecPlan) -> Result<()> {
        Ok(())
    }

    fn consume(&self, _batch: ExecBatch) -> Result<()> {
        Ok(())
    }

    fn finish(&self) -> BoxFuture<'static, Result<()>> {
        future::ready(Ok(())).boxed()
    }
}

/// Options for `consuming_sink`.
#[derive(Clone)]
pub struct ConsumingSinkNodeOptions {
    pub consumer: Option<Arc<dyn SinkNodeConsumer>>,
    /// Column names passed to the consumer. Empty keeps the input's names.
    pub names: Vec<String>,
}

impl ConsumingSinkNodeOptions {
    pub fn new(consumer: Arc<dyn SinkNodeConsumer>) -> Self {
        Self {
            consumer: Some(consumer),
            names: Vec::new(),
        }
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = names;
        self
    }
}

/// Feeds its single input to a [`SinkNodeConsumer`].
pub struct ConsumingSinkNode {
    core: NodeCore,
    kind: &'static str,
    consumer: Arc<dyn SinkNodeConsumer>,
    names: Vec<String>,
    counter: BatchCounter,
}

impl ConsumingSinkNode {
    pub fn make(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: ConsumingSinkNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<ConsumingSinkNode>> {
        let consumer = required(options.consumer, "ConsumingSinkNode", "consumer")?;
        Self::emplace(plan, inputs, consumer, options.names, "ConsumingSinkNode", label)
    }

    pub fn make_table_sink(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: TableSinkNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<ConsumingSinkNode>> {
        let consumer = Arc::new(TableSinkConsumer::new(options.output_table));
        Self::emplace(plan, inputs, consumer, options.names, "TableSinkNode", label)
    }

    fn emplace(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        consumer: Arc<dyn SinkNodeConsumer>,
        names: Vec<String>,
        kind: &'static str,
        label: Option<String>,
    ) -> Result<Arc<ConsumingSinkNode>> {
        validate_input_count(kind, &inputs, 1)?;
        let schema = inputs[0].output_schema().clone();
        let spec = NodeSpec::new(inputs, schema)
            .with_label(label)
            .with_num_outputs(0);
        plan.emplace_node(spec, |core| {
            Ok(ConsumingSinkNode {
                core,
                kind,
                consumer,
                names,
                counter: BatchCounter::new(),
            })
        })
    }

    /// Finish the consumer, then the node with the combined result.
    fn finish(&self, result: Result<()>) {
        let consumer_finished = self.consumer.finish();
        let core = self.core.clone();
        let on_panic = self.core.clone();
        spawn_future_or_else(
            self.core.ctx().executor().clone(),
            async move {
                let consumer_result = consumer_finished.await;
                core.mark_finished(result.and(consumer_result));
            },
            move |err| {
                on_panic.mark_finished(Err(err));
            },
        );
    }
}

impl ExecNode for ConsumingSinkNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind_name(&self) -> &'static str {
        self.kind
    }

    fn start_producing(&self) -> Result<()> {
        let input_schema = self.core.output_schema();
        let schema = if self.names.is_empty() {
            input_schema.clone()
        } else {
            Arc::new(input_schema.with_names(&self.names)?)
        };
        let plan = self
            .core
            .plan()
            .ok_or_else(|| ExecError::invalid("ExecPlan was dropped before the sink started"))?;
        let control: Arc<dyn BackpressureControl> =
            Arc::new(NodeBackpressureControl::new(self.core.clone()));
        self.consumer.init(&schema, control, &plan)
    }

    fn input_received(&self, _input: NodeId, batch: ExecBatch) {
        if self.counter.is_complete() {
            return;
        }
        if let Err(err) = self.consumer.consume(batch) {
            tracing::warn!(node = %self.label(), error = %err, "Consumer rejected a batch");
            if self.counter.cancel() {
                self.finish(Err(err));
            }
            return;
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

impl_node_debug!(ConsumingSinkNode);

// ==================== Table sink ====================

/// Slot the table sink writes its result into.
#[derive(Debug, Clone, Default)]
pub struct TableHandle {
    table: Arc<Mutex<Option<Arc<Table>>>>,
}

impl TableHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The collected table, once the sink has finished.
    pub fn get(&self) -> Option<Arc<Table>> {
        self.table.lock().clone()
    }

    fn set(&self, table: Table) {
        *self.table.lock() = Some(Arc::new(table));
    }
}

/// Options for `table_sink`.
#[derive(Debug, Clone, Default)]
pub struct TableSinkNodeOptions {
    pub output_table: TableHandle,
    pub names: Vec<String>,
}

impl TableSinkNodeOptions {
    pub fn new(output_table: TableHandle) -> Self {
        Self {
            output_table,
            names: Vec::new(),
        }
    }
}

struct TableSinkConsumer {
    output: TableHandle,
    schema: OnceLock<SchemaRef>,
    batches: Arc<Mutex<Vec<ExecBatch>>>,
}

impl TableSinkConsumer {
    fn new(output: TableHandle) -> Self {
        Self {
            output,
            schema: OnceLock::new(),
            batches: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl SinkNodeConsumer for TableSinkConsumer {
    fn init(&self, schema: &SchemaRef, _: Arc<dyn BackpressureControl>, _: &ExecPlan) -> Result<()> {
        self.schema
            .set(schema.clone())
            .map_err(|_| ExecError::invalid("TableSinkNode initialised twice"))
    }

    fn consume(&self, batch: ExecBatch) -> Result<()> {
        self.batches.lock().push(batch);
        Ok(())
    }

    fn finish(&self) -> BoxFuture<'static, Result<()>> {
        let result = match self.schema.get() {
            Some(schema) => {
                let batches = std::mem::take(&mut *self.batches.lock());
                Table::from_batches(schema.clone(), batches).map(|table| self.output.set(table))
            }
            // Stopped before starting: nothing to collect.
            None => Ok(()),
        };
        future::ready(result).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{DataType, Field, Schema};
    use crate::plan::context::ExecContext;
    use crate::plan::nodes::source::{SourceNode, SourceNodeOptions};

    fn plan_with_sink(names: Vec<String>) -> (ExecPlan, Arc<ConsumingSinkNode>) {
        let plan = ExecPlan::make(ExecContext::serial());
        let schema = Arc::new(Schema::new(vec![
            Field::new("i32", DataType::Int32),
            Field::new("bool", DataType::Boolean),
        ]));
        let source = SourceNode::make(
            &plan,
            Vec::new(),
            SourceNodeOptions::from_batches(schema, Vec::new()),
            None,
        )
        .unwrap();
        let options = ConsumingSinkNodeOptions::new(Arc::new(NullSinkConsumer)).with_names(names);
        let sink = ConsumingSinkNode::make(&plan, vec![source], options, None).unwrap();
        (plan, sink)
    }

    #[test]
    fn test_name_count_is_checked_at_start() {
        let (_plan, sink) = plan_with_sink(vec!["a".to_string()]);
        let err = sink.start_producing().unwrap_err();
        assert!(err.is_invalid());
    }

    #[test]
    fn test_matching_names_start() {
        let (_plan, sink) = plan_with_sink(vec!["a".to_string(), "b".to_string()]);
        sink.start_producing().unwrap();
    }

    #[test]
    fn test_missing_consumer() {
        let plan = ExecPlan::make(ExecContext::serial());
        let options = ConsumingSinkNodeOptions {
            consumer: None,
            names: Vec::new(),
        };
        let err = ConsumingSinkNode::make(&plan, Vec::new(), options, None).unwrap_err();
        assert!(err.to_string().contains("not null"));
    }
}
