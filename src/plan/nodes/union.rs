//! Union of any number of inputs sharing one schema.

use super::validate_distinct_inputs;
use crate::batch::ExecBatch;
use crate::error::{ExecError, Result};
use crate::plan::exec_plan::{ExecPlan, NodeSpec};
use crate::plan::id::NodeId;
use crate::plan::node::{BatchCounter, ExecNode, NodeCore};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Forwards every batch of every input. Finishes once all inputs have.
pub struct UnionNode {
    core: NodeCore,
    counters: Vec<BatchCounter>,
    inputs_done: AtomicUsize,
    finished: AtomicBool,
}

impl UnionNode {
    pub fn make(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        label: Option<String>,
    ) -> Result<Arc<UnionNode>> {
        let first = inputs
            .first()
            .ok_or_else(|| ExecError::invalid("UnionNode requires at least one input"))?;
        validate_distinct_inputs("UnionNode", &inputs)?;
        let schema = first.output_schema().clone();
        if let Some(other) = inputs.iter().find(|i| i.output_schema() != &schema) {
            return Err(ExecError::invalid(format!(
                "UnionNode input '{}' has schema [{}], expected [{}]",
                other.label(),
                other.output_schema().field_names().join(", "),
                schema.field_names().join(", ")
            )));
        }
        let num_inputs = inputs.len();
        plan.emplace_node(NodeSpec::new(inputs, schema).with_label(label), |core| {
            Ok(UnionNode {
                core,
                counters: (0..num_inputs).map(|_| BatchCounter::new()).collect(),
                inputs_done: AtomicUsize::new(0),
                finished: AtomicBool::new(false),
            })
        })
    }

    fn counter(&self, input: NodeId) -> Option<&BatchCounter> {
        let counter = self
            .core
            .input_index(input)
            .and_then(|i| self.counters.get(i));
        if counter.is_none() {
            tracing::warn!(node = %self.label(), ?input, "Batch from unknown input");
        }
        counter
    }

    fn input_done(&self) {
        let done = self.inputs_done.fetch_add(1, Ordering::SeqCst) + 1;
        if done == self.counters.len() && !self.finished.swap(true, Ordering::SeqCst) {
            self.core.emit_finished();
            self.core.mark_finished(Ok(()));
        }
    }
}

impl_node_debug!(UnionNode);

impl ExecNode for UnionNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind_name(&self) -> &'static str {
        "UnionNode"
    }

    fn start_producing(&self) -> Result<()> {
        Ok(())
    }

    fn input_received(&self, input: NodeId, batch: ExecBatch) {
        let Some(counter) = self.counter(input) else {
            return;
        };
        if counter.is_complete() {
            return;
        }
        self.core.emit(batch);
        if counter.increment() {
            self.input_done();
        }
    }

    fn error_received(&self, _input: NodeId, error: ExecError) {
        for counter in &self.counters {
            counter.cancel();
        }
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.core.emit_error(error.clone());
            self.core.mark_finished(Err(error));
        }
    }

    fn input_finished(&self, input: NodeId, total_batches: usize) {
        if let Some(counter) = self.counter(input) {
            if counter.set_total(total_batches) {
                self.input_done();
            }
        }
    }

    fn stop_producing(&self) {
        for counter in &self.counters {
            counter.cancel();
        }
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.core.mark_finished(Ok(()));
        }
    }
}
