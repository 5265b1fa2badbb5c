//! Stateless one-in one-out nodes: filter and project.
//!
//! Both share [`MapNode`], which owns the counting and error plumbing and
//! defers the per-batch work to a [`BatchKernel`].

use super::validate_input_count;
use crate::batch::{DataType, ExecBatch, Field, Schema, SchemaRef, Value};
use crate::compute::Expression;
use crate::error::{ExecError, Result};
use crate::plan::exec_plan::{ExecPlan, NodeSpec};
use crate::plan::id::NodeId;
use crate::plan::node::{BatchCounter, ExecNode, NodeCore};
use std::fmt;
use std::sync::Arc;

/// Per-batch transformation applied by a [`MapNode`].
pub trait BatchKernel: Send + Sync + 'static {
    const KIND: &'static str;

    fn apply(&self, batch: &ExecBatch) -> Result<ExecBatch>;

    fn describe(&self) -> String;
}

/// A node that transforms each batch independently.
pub struct MapNode<K: BatchKernel> {
    core: NodeCore,
    kernel: K,
    counter: BatchCounter,
}

impl<K: BatchKernel> MapNode<K> {
    fn emplace(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        output_schema: SchemaRef,
        kernel: K,
        label: Option<String>,
    ) -> Result<Arc<Self>> {
        plan.emplace_node(
            NodeSpec::new(inputs, output_schema).with_label(label),
            |core| {
                Ok(MapNode {
                    core,
                    kernel,
                    counter: BatchCounter::new(),
                })
            },
        )
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    fn finish(&self) {
        self.core.emit_finished();
        self.core.mark_finished(Ok(()));
    }
}

impl<K: BatchKernel> fmt::Debug for MapNode<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self as &(dyn ExecNode + 'static), f)
    }
}

impl<K: BatchKernel> ExecNode for MapNode<K> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind_name(&self) -> &'static str {
        K::KIND
    }

    fn start_producing(&self) -> Result<()> {
        Ok(())
    }

    fn input_received(&self, _input: NodeId, batch: ExecBatch) {
        if self.counter.is_complete() {
            return;
        }
        match self.kernel.apply(&batch) {
            Ok(output) => {
                self.core.emit(output);
                if self.counter.increment() {
                    self.finish();
                }
            }
            Err(err) => {
                tracing::warn!(node = %self.label(), kind = K::KIND, error = %err, "Kernel failed");
                if self.counter.cancel() {
                    self.core.emit_error(err.clone());
                    self.core.mark_finished(Err(err));
                }
            }
        }
    }

    fn error_received(&self, _input: NodeId, error: ExecError) {
        if self.counter.cancel() {
            self.core.emit_error(error.clone());
            self.core.mark_finished(Err(error));
        }
    }

    fn input_finished(&self, _input: NodeId, total_batches: usize) {
        if self.counter.set_total(total_batches) {
            self.finish();
        }
    }

    fn stop_producing(&self) {
        if self.counter.cancel() {
            self.core.mark_finished(Ok(()));
        }
    }

    fn describe(&self, _indent: usize) -> String {
        self.kernel.describe()
    }
}

// ==================== Filter ====================

/// Options for the `filter` node.
#[derive(Debug, Clone)]
pub struct FilterNodeOptions {
    pub filter_expression: Expression,
}

impl FilterNodeOptions {
    pub fn new(filter_expression: Expression) -> Self {
        Self { filter_expression }
    }
}

/// Keeps the rows for which the predicate evaluates to `true`. Null counts
/// as false.
pub struct FilterKernel {
    input_schema: SchemaRef,
    predicate: Expression,
}

impl BatchKernel for FilterKernel {
    const KIND: &'static str = "FilterNode";

    fn apply(&self, batch: &ExecBatch) -> Result<ExecBatch> {
        let mask: Vec<bool> = self
            .predicate
            .evaluate(&self.input_schema, batch)?
            .iter()
            .map(|v| matches!(v, Value::Boolean(true)))
            .collect();
        Ok(batch.filter(&mask))
    }

    fn describe(&self) -> String {
        format!("filter={}", self.predicate)
    }
}

pub type FilterNode = MapNode<FilterKernel>;

impl MapNode<FilterKernel> {
    pub fn make(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: FilterNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<FilterNode>> {
        validate_input_count(FilterKernel::KIND, &inputs, 1)?;
        let schema = inputs[0].output_schema().clone();
        let predicate = options.filter_expression;
        match predicate.output_type(&schema)? {
            DataType::Boolean | DataType::Null => {}
            other => {
                return Err(ExecError::type_error(format!(
                    "Filter expression must evaluate to bool, but {} evaluates to {}",
                    predicate, other
                )))
            }
        }
        let kernel = FilterKernel {
            input_schema: schema.clone(),
            predicate,
        };
        Self::emplace(plan, inputs, schema, kernel, label)
    }
}

// ==================== Project ====================

/// Options for the `project` node. Without names, each expression's
/// rendering becomes its column name.
#[derive(Debug, Clone)]
pub struct ProjectNodeOptions {
    pub expressions: Vec<Expression>,
    pub names: Vec<String>,
}

impl ProjectNodeOptions {
    pub fn new(expressions: Vec<Expression>) -> Self {
        Self {
            expressions,
            names: Vec::new(),
        }
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = names;
        self
    }
}

/// Evaluates one expression per output column.
pub struct ProjectKernel {
    input_schema: SchemaRef,
    expressions: Vec<Expression>,
}

impl BatchKernel for ProjectKernel {
    const KIND: &'static str = "ProjectNode";

    fn apply(&self, batch: &ExecBatch) -> Result<ExecBatch> {
        let columns = self
            .expressions
            .iter()
            .map(|expr| expr.evaluate(&self.input_schema, batch))
            .collect::<Result<Vec<_>>>()?;
        ExecBatch::try_new_with_rows(columns, batch.num_rows())
    }

    fn describe(&self) -> String {
        let rendered: Vec<String> = self.expressions.iter().map(|e| e.to_string()).collect();
        format!("projection=[{}]", rendered.join(", "))
    }
}

pub type ProjectNode = MapNode<ProjectKernel>;

impl MapNode<ProjectKernel> {
    pub fn make(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: ProjectNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<ProjectNode>> {
        validate_input_count(ProjectKernel::KIND, &inputs, 1)?;
        let ProjectNodeOptions { expressions, names } = options;
        if !names.is_empty() && names.len() != expressions.len() {
            return Err(ExecError::invalid(format!(
                "ProjectNode got {} names for {} expressions",
                names.len(),
                expressions.len()
            )));
        }
        let input_schema = inputs[0].output_schema().clone();
        let mut fields = Vec::with_capacity(expressions.len());
        for (i, expr) in expressions.iter().enumerate() {
            let name = names.get(i).cloned().unwrap_or_else(|| expr.to_string());
            fields.push(Field::new(name, expr.output_type(&input_schema)?));
        }
        let kernel = ProjectKernel {
            input_schema,
            expressions,
        };
        Self::emplace(plan, inputs, Arc::new(Schema::new(fields)), kernel, label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{call, field_ref, greater_equal, literal};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("i32", DataType::Int32),
            Field::new("bool", DataType::Boolean),
        ]))
    }

    fn batch() -> ExecBatch {
        ExecBatch::from_json(&schema().data_types(), "[[null, true], [4, false], [-1, true]]")
            .unwrap()
    }

    #[test]
    fn test_filter_kernel_drops_nulls() {
        let kernel = FilterKernel {
            input_schema: schema(),
            predicate: greater_equal(field_ref("i32"), literal(0)),
        };
        let out = kernel.apply(&batch()).unwrap();
        assert_eq!(out.rows(), vec![vec![Value::Int32(4), Value::Boolean(false)]]);
        assert_eq!(kernel.describe(), "filter=(i32 >= 0)");
    }

    #[test]
    fn test_project_kernel() {
        let kernel = ProjectKernel {
            input_schema: schema(),
            expressions: vec![
                field_ref("bool"),
                call("multiply", vec![field_ref("i32"), literal(2)]),
            ],
        };
        let out = kernel.apply(&batch()).unwrap();
        assert_eq!(out.num_columns(), 2);
        assert_eq!(out.value(1, 1), &Value::Int32(8));
        assert!(out.value(0, 1).is_null());
        assert_eq!(kernel.describe(), "projection=[bool, multiply(i32, 2)]");
    }
}
