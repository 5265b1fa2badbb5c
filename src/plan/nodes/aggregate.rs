//! Aggregation nodes.
//!
//! Without keys the `aggregate` factory builds a [`ScalarAggregateNode`],
//! which reduces the whole input to one row. With keys it builds a
//! [`GroupByNode`], which emits one row per distinct key in first-seen
//! order. Output columns are the aggregates followed by the keys.

use super::validate_input_count;
use crate::batch::{ExecBatch, Field, Schema, SchemaRef, Value};
use crate::compute::{Accumulator, Aggregate, AggregateKind};
use crate::error::{ExecError, Result};
use crate::plan::exec_plan::{ExecPlan, NodeSpec};
use crate::plan::id::NodeId;
use crate::plan::node::{BatchCounter, ExecNode, NodeCore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Options for the `aggregate` node.
#[derive(Debug, Clone, Default)]
pub struct AggregateNodeOptions {
    pub aggregates: Vec<Aggregate>,
    pub keys: Vec<String>,
}

impl AggregateNodeOptions {
    pub fn new(aggregates: Vec<Aggregate>) -> Self {
        Self {
            aggregates,
            keys: Vec::new(),
        }
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }
}

/// An aggregate bound to its input column.
#[derive(Debug, Clone)]
struct BoundAggregate {
    aggregate: Aggregate,
    kind: AggregateKind,
    column: usize,
    output_field: Field,
}

impl BoundAggregate {
    fn accumulator(&self) -> Accumulator {
        Accumulator::new(
            self.kind,
            self.aggregate.options.as_ref(),
            self.output_field.data_type(),
        )
    }
}

fn bind_aggregates(
    aggregates: &[Aggregate],
    schema: &Schema,
    grouped: bool,
) -> Result<Vec<BoundAggregate>> {
    aggregates
        .iter()
        .map(|aggregate| {
            let kind = AggregateKind::parse(&aggregate.function, grouped)?;
            let column = schema.resolve(&aggregate.target)?;
            let output_type = kind.output_type(schema.field(column).data_type())?;
            Ok(BoundAggregate {
                aggregate: aggregate.clone(),
                kind,
                column,
                output_field: Field::new(aggregate.name.clone(), output_type),
            })
        })
        .collect()
}

/// Counting and error plumbing shared by both aggregate nodes.
trait AggregateState: Send + Sync {
    fn node_core(&self) -> &NodeCore;
    fn counter(&self) -> &BatchCounter;
    fn consume(&self, batch: &ExecBatch);
    fn output(&self) -> Result<Vec<ExecBatch>>;

    fn finish(&self) {
        let core = self.node_core();
        match self.output() {
            Ok(batches) => {
                for batch in batches {
                    core.emit(batch);
                }
                core.emit_finished();
                core.mark_finished(Ok(()));
            }
            Err(err) => {
                tracing::warn!(node = %core.label(), error = %err, "Aggregation failed");
                core.emit_error(err.clone());
                core.mark_finished(Err(err));
            }
        }
    }

    fn on_batch(&self, batch: ExecBatch) {
        if self.counter().is_complete() {
            return;
        }
        self.consume(&batch);
        if self.counter().increment() {
            self.finish();
        }
    }

    fn on_error(&self, error: ExecError) {
        if self.counter().cancel() {
            self.node_core().emit_error(error.clone());
            self.node_core().mark_finished(Err(error));
        }
    }

    fn on_input_finished(&self, total_batches: usize) {
        if self.counter().set_total(total_batches) {
            self.finish();
        }
    }

    fn on_stop(&self) {
        if self.counter().cancel() {
            self.node_core().mark_finished(Ok(()));
        }
    }
}

fn describe_aggregates(aggregates: &[BoundAggregate], pad: &str) -> String {
    let mut out = String::from("aggregates=[\n");
    for bound in aggregates {
        out.push_str(&format!("{}\t{},\n", pad, bound.aggregate));
    }
    out.push_str(pad);
    out.push(']');
    out
}

// ==================== Scalar ====================

/// Reduces its whole input to a single row.
pub struct ScalarAggregateNode {
    core: NodeCore,
    aggregates: Vec<BoundAggregate>,
    accumulators: Mutex<Vec<Accumulator>>,
    counter: BatchCounter,
}

impl AggregateState for ScalarAggregateNode {
    fn node_core(&self) -> &NodeCore {
        &self.core
    }

    fn counter(&self) -> &BatchCounter {
        &self.counter
    }

    fn consume(&self, batch: &ExecBatch) {
        let mut accumulators = self.accumulators.lock();
        for (bound, acc) in self.aggregates.iter().zip(accumulators.iter_mut()) {
            for value in batch.column(bound.column).iter() {
                acc.update(value);
            }
        }
    }

    fn output(&self) -> Result<Vec<ExecBatch>> {
        let row: Vec<Value> = self.accumulators.lock().iter().map(|a| a.finish()).collect();
        Ok(vec![ExecBatch::from_rows(row.len(), vec![row])?])
    }
}

impl ExecNode for ScalarAggregateNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind_name(&self) -> &'static str {
        "ScalarAggregateNode"
    }

    fn start_producing(&self) -> Result<()> {
        Ok(())
    }

    fn input_received(&self, _input: NodeId, batch: ExecBatch) {
        self.on_batch(batch);
    }

    fn error_received(&self, _input: NodeId, error: ExecError) {
        self.on_error(error);
    }

    fn input_finished(&self, _input: NodeId, total_batches: usize) {
        self.on_input_finished(total_batches);
    }

    fn stop_producing(&self) {
        self.on_stop();
    }

    fn describe(&self, _indent: usize) -> String {
        describe_aggregates(&self.aggregates, "")
    }
}

// ==================== Grouped ====================

#[derive(Default)]
struct Groups {
    index: HashMap<Vec<Value>, usize>,
    keys: Vec<Vec<Value>>,
    accumulators: Vec<Vec<Accumulator>>,
}

/// Aggregates per distinct key.
pub struct GroupByNode {
    core: NodeCore,
    key_names: Vec<String>,
    key_columns: Vec<usize>,
    aggregates: Vec<BoundAggregate>,
    groups: Mutex<Groups>,
    counter: BatchCounter,
}

impl AggregateState for GroupByNode {
    fn node_core(&self) -> &NodeCore {
        &self.core
    }

    fn counter(&self) -> &BatchCounter {
        &self.counter
    }

    fn consume(&self, batch: &ExecBatch) {
        let mut groups = self.groups.lock();
        let Groups {
            index,
            keys,
            accumulators,
        } = &mut *groups;
        for row in 0..batch.num_rows() {
            let key: Vec<Value> = self
                .key_columns
                .iter()
                .map(|&c| batch.value(row, c).clone())
                .collect();
            let group = *index.entry(key).or_insert_with_key(|key| {
                keys.push(key.clone());
                accumulators.push(self.aggregates.iter().map(|a| a.accumulator()).collect());
                keys.len() - 1
            });
            for (bound, acc) in self.aggregates.iter().zip(accumulators[group].iter_mut()) {
                acc.update(batch.value(row, bound.column));
            }
        }
    }

    fn output(&self) -> Result<Vec<ExecBatch>> {
        let groups = std::mem::take(&mut *self.groups.lock());
        if groups.keys.is_empty() {
            return Ok(Vec::new());
        }
        let num_columns = self.aggregates.len() + self.key_columns.len();
        let rows = groups
            .keys
            .into_iter()
            .zip(groups.accumulators)
            .map(|(key, accs)| {
                let mut row: Vec<Value> = accs.iter().map(|a| a.finish()).collect();
                row.extend(key);
                row
            })
            .collect();
        Ok(vec![ExecBatch::from_rows(num_columns, rows)?])
    }
}

impl ExecNode for GroupByNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind_name(&self) -> &'static str {
        "GroupByNode"
    }

    fn start_producing(&self) -> Result<()> {
        Ok(())
    }

    fn input_received(&self, _input: NodeId, batch: ExecBatch) {
        self.on_batch(batch);
    }

    fn error_received(&self, _input: NodeId, error: ExecError) {
        self.on_error(error);
    }

    fn input_finished(&self, _input: NodeId, total_batches: usize) {
        self.on_input_finished(total_batches);
    }

    fn stop_producing(&self) {
        self.on_stop();
    }

    fn describe(&self, indent: usize) -> String {
        let keys: Vec<String> = self.key_names.iter().map(|k| format!("\"{}\"", k)).collect();
        format!(
            "keys=[{}], {}",
            keys.join(", "),
            describe_aggregates(&self.aggregates, &" ".repeat(indent))
        )
    }
}

impl_node_debug!(ScalarAggregateNode, GroupByNode);

// ==================== Factory ====================

/// Build a scalar or grouped aggregation depending on `options.keys`.
pub fn make(
    plan: &ExecPlan,
    inputs: Vec<Arc<dyn ExecNode>>,
    options: AggregateNodeOptions,
    label: Option<String>,
) -> Result<Arc<dyn ExecNode>> {
    let grouped = !options.keys.is_empty();
    let kind = if grouped {
        "GroupByNode"
    } else {
        "ScalarAggregateNode"
    };
    validate_input_count(kind, &inputs, 1)?;
    let input_schema = inputs[0].output_schema().clone();
    let aggregates = bind_aggregates(&options.aggregates, &input_schema, grouped)?;
    let mut fields: Vec<Field> = aggregates.iter().map(|a| a.output_field.clone()).collect();

    if !grouped {
        let output_schema: SchemaRef = Arc::new(Schema::new(fields));
        let spec = NodeSpec::new(inputs, output_schema).with_label(label);
        let node = plan.emplace_node(spec, |core| {
            let accumulators = aggregates.iter().map(|a| a.accumulator()).collect();
            Ok(ScalarAggregateNode {
                core,
                aggregates,
                accumulators: Mutex::new(accumulators),
                counter: BatchCounter::new(),
            })
        })?;
        return Ok(node);
    }

    let key_columns = options
        .keys
        .iter()
        .map(|k| input_schema.resolve(k))
        .collect::<Result<Vec<_>>>()?;
    fields.extend(key_columns.iter().map(|&c| input_schema.field(c).clone()));
    let output_schema: SchemaRef = Arc::new(Schema::new(fields));
    let spec = NodeSpec::new(inputs, output_schema).with_label(label);
    let node = plan.emplace_node(spec, |core| {
        Ok(GroupByNode {
            core,
            key_names: options.keys,
            key_columns,
            aggregates,
            groups: Mutex::new(Groups::default()),
            counter: BatchCounter::new(),
        })
    })?;
    Ok(node)
}
