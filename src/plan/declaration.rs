//! Declarative plan building.
//!
//! A [`Declaration`] is an unbuilt node: a factory name, its options and
//! the declarations feeding it. `add_to_plan` turns the tree into nodes,
//! inputs first. The `declaration_to_*` helpers build a plan around a
//! declaration, run it to completion and return what reached the sink.

use super::context::ExecContext;
use super::exec_plan::ExecPlan;
use super::node::ExecNode;
use super::nodes::{
    ConsumingSinkNodeOptions, NullSinkConsumer, SinkNodeOptions, TableHandle, TableSinkNodeOptions,
};
use super::registry::{default_registry, ExecFactoryRegistry, NodeKind, NodeOptions};
use crate::batch::{ExecBatch, SchemaRef, Table};
use crate::error::{ExecError, Result};
use futures::executor::block_on;
use std::fmt;
use std::sync::Arc;

/// A node to be built, with the declarations of its inputs.
pub struct Declaration {
    pub factory_name: String,
    pub options: NodeOptions,
    pub label: Option<String>,
    pub inputs: Vec<Declaration>,
}

impl Declaration {
    pub fn new(factory_name: impl Into<String>, options: impl Into<NodeOptions>) -> Self {
        Self {
            factory_name: factory_name.into(),
            options: options.into(),
            label: None,
            inputs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<Declaration>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Chain `declarations` so each one feeds the next. The first must
    /// have no inputs of its own.
    pub fn sequence(declarations: Vec<Declaration>) -> Result<Declaration> {
        let mut iter = declarations.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| ExecError::invalid("Cannot build a sequence of zero declarations"))?;
        iter.try_fold(first, |input, mut next| {
            if !next.inputs.is_empty() {
                return Err(ExecError::invalid(format!(
                    "Declaration '{}' in a sequence already has inputs",
                    next.factory_name
                )));
            }
            next.inputs.push(input);
            Ok(next)
        })
    }

    /// Whether the factory builds a sink.
    pub fn is_sink(&self) -> bool {
        NodeKind::from_factory_name(&self.factory_name).is_some_and(|k| k.is_sink())
    }

    pub fn add_to_plan(self, plan: &ExecPlan) -> Result<Arc<dyn ExecNode>> {
        self.add_to_plan_with(plan, default_registry())
    }

    pub fn add_to_plan_with(
        self,
        plan: &ExecPlan,
        registry: &ExecFactoryRegistry,
    ) -> Result<Arc<dyn ExecNode>> {
        let inputs = self
            .inputs
            .into_iter()
            .map(|input| input.add_to_plan_with(plan, registry))
            .collect::<Result<Vec<_>>>()?;
        registry.make_node(&self.factory_name, plan, inputs, self.options, self.label)
    }

    fn into_sink_input(self) -> Result<Declaration> {
        if self.is_sink() {
            return Err(ExecError::invalid(format!(
                "Declaration '{}' is already a sink",
                self.factory_name
            )));
        }
        Ok(self)
    }
}

impl fmt::Debug for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declaration")
            .field("factory_name", &self.factory_name)
            .field("options", &self.options)
            .field("label", &self.label)
            .field("inputs", &self.inputs)
            .finish()
    }
}

/// Batches collected from a plan, with the schema they share.
#[derive(Debug, Clone)]
pub struct BatchesWithSchema {
    pub schema: SchemaRef,
    pub batches: Vec<ExecBatch>,
}

// ==================== Runners ====================

/// Run `declaration` into a generator sink and collect every batch.
pub async fn declaration_to_batches_async(
    declaration: Declaration,
    ctx: ExecContext,
) -> Result<BatchesWithSchema> {
    let sink_options = SinkNodeOptions::new();
    let mut generator = sink_options.generator();
    let declaration = Declaration::new("sink", sink_options)
        .with_inputs(vec![declaration.into_sink_input()?]);

    let plan = ExecPlan::make(ctx);
    let sink = declaration.add_to_plan(&plan)?;
    let schema = sink.output_schema().clone();
    plan.start_producing()?;

    let mut batches = Vec::new();
    while let Some(batch) = generator.next_batch().await? {
        batches.push(batch);
    }
    plan.finished().wait().await?;
    Ok(BatchesWithSchema { schema, batches })
}

/// Run `declaration` into a table sink.
pub async fn declaration_to_table_async(
    declaration: Declaration,
    ctx: ExecContext,
) -> Result<Arc<Table>> {
    let output = TableHandle::new();
    let declaration = Declaration::new("table_sink", TableSinkNodeOptions::new(output.clone()))
        .with_inputs(vec![declaration.into_sink_input()?]);

    let plan = ExecPlan::make(ctx);
    declaration.add_to_plan(&plan)?;
    plan.start_producing()?;
    plan.finished().wait().await?;
    output
        .get()
        .ok_or_else(|| ExecError::invalid("Plan finished without producing a table"))
}

/// Run `declaration`, discarding its output.
pub async fn declaration_to_status_async(declaration: Declaration, ctx: ExecContext) -> Result<()> {
    let options = ConsumingSinkNodeOptions::new(Arc::new(NullSinkConsumer));
    let declaration = Declaration::new("consuming_sink", options)
        .with_inputs(vec![declaration.into_sink_input()?]);

    let plan = ExecPlan::make(ctx);
    declaration.add_to_plan(&plan)?;
    plan.start_producing()?;
    plan.finished().wait().await
}

/// Blocking form of [`declaration_to_batches_async`].
pub fn declaration_to_batches(
    declaration: Declaration,
    use_threads: bool,
) -> Result<BatchesWithSchema> {
    let ctx = ExecContext::for_threads(use_threads)?;
    block_on(declaration_to_batches_async(declaration, ctx))
}

/// Blocking form of [`declaration_to_table_async`].
pub fn declaration_to_table(declaration: Declaration, use_threads: bool) -> Result<Arc<Table>> {
    let ctx = ExecContext::for_threads(use_threads)?;
    block_on(declaration_to_table_async(declaration, ctx))
}

/// Blocking form of [`declaration_to_status_async`].
pub fn declaration_to_status(declaration: Declaration, use_threads: bool) -> Result<()> {
    let ctx = ExecContext::for_threads(use_threads)?;
    block_on(declaration_to_status_async(declaration, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{DataType, Field, Schema, Value};
    use crate::compute::{field_ref, greater, literal};
    use crate::plan::nodes::{FilterNodeOptions, SourceNodeOptions};

    fn source() -> Declaration {
        let schema = Arc::new(Schema::new(vec![Field::new("i32", DataType::Int32)]));
        let batches = vec![
            ExecBatch::from_json(&[DataType::Int32], "[[1], [5]]").unwrap(),
            ExecBatch::from_json(&[DataType::Int32], "[[7], [null]]").unwrap(),
        ];
        Declaration::new("source", SourceNodeOptions::from_batches(schema, batches))
    }

    #[test]
    fn test_sequence_chains_inputs() {
        let filter = Declaration::new(
            "filter",
            FilterNodeOptions::new(greater(field_ref("i32"), literal(2))),
        );
        let seq = Declaration::sequence(vec![source(), filter]).unwrap();
        assert_eq!(seq.factory_name, "filter");
        assert_eq!(seq.inputs.len(), 1);
        assert_eq!(seq.inputs[0].factory_name, "source");
    }

    #[test]
    fn test_empty_sequence_is_invalid() {
        assert!(Declaration::sequence(Vec::new()).unwrap_err().is_invalid());
    }

    #[test]
    fn test_is_sink() {
        assert!(!source().is_sink());
        assert!(Declaration::new("sink", SinkNodeOptions::new()).is_sink());
    }

    #[test]
    fn test_declaration_to_table() {
        let filter = Declaration::new(
            "filter",
            FilterNodeOptions::new(greater(field_ref("i32"), literal(2))),
        );
        let seq = Declaration::sequence(vec![source(), filter]).unwrap();
        let table = declaration_to_table(seq, false).unwrap();
        assert_eq!(
            table.sorted_rows(),
            vec![vec![Value::Int32(5)], vec![Value::Int32(7)]]
        );
    }

    #[test]
    fn test_declaration_to_batches() {
        let collected = declaration_to_batches(source(), false).unwrap();
        assert_eq!(collected.schema.field_names(), vec!["i32"]);
        assert_eq!(collected.batches.len(), 2);
    }

    #[test]
    fn test_declaration_to_status() {
        declaration_to_status(source(), false).unwrap();
    }

    #[test]
    fn test_sink_declaration_is_rejected() {
        let sink = Declaration::new("sink", SinkNodeOptions::new()).with_inputs(vec![source()]);
        assert!(declaration_to_status(sink, false).unwrap_err().is_invalid());
    }
}
