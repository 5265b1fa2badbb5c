//! Built-in node implementations.
//!
//! Each operator family lives in its own file and exposes a typed `make`
//! constructor plus an options struct. The string-keyed registry in
//! [`crate::plan::registry`] wraps these constructors.

/// `Debug` for a node type, rendered like `dyn ExecNode`.
macro_rules! impl_node_debug {
    ($($ty:ty),* $(,)?) => {
        $(
            impl std::fmt::Debug for $ty {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    std::fmt::Debug::fmt(self as &(dyn crate::plan::node::ExecNode + 'static), f)
                }
            }
        )*
    };
}

pub mod aggregate;
pub mod consuming_sink;
pub mod hash_join;
pub mod map;
pub mod order_by;
pub mod sink;
pub mod source;
pub mod union;

pub use aggregate::{AggregateNodeOptions, GroupByNode, ScalarAggregateNode};
pub use consuming_sink::{
    ConsumingSinkNode, ConsumingSinkNodeOptions, NullSinkConsumer, SinkNodeConsumer,
    TableHandle, TableSinkNodeOptions,
};
pub use hash_join::{HashJoinNode, HashJoinNodeOptions, JoinType};
pub use map::{FilterNode, FilterNodeOptions, MapNode, ProjectNode, ProjectNodeOptions};
pub use order_by::{OrderBySinkNodeOptions, SelectKSinkNodeOptions, SortSinkNode};
pub use sink::{NodeBackpressureControl, SinkGenerator, SinkNode, SinkNodeOptions};
pub use source::{
    ArrayVectorSourceNodeOptions, BatchStream, ExecBatchSourceNodeOptions,
    IteratorSourceNodeOptions, RecordBatchReaderSourceNodeOptions, RecordBatchSourceNodeOptions,
    SourceNode, SourceNodeOptions, TableSourceNodeOptions,
};
pub use union::UnionNode;

use super::node::ExecNode;
use crate::error::{ExecError, Result};
use std::sync::Arc;

/// Fail unless exactly `expected` inputs were supplied.
pub(crate) fn validate_input_count(
    kind: &str,
    inputs: &[Arc<dyn ExecNode>],
    expected: usize,
) -> Result<()> {
    if inputs.len() != expected {
        return Err(ExecError::invalid(format!(
            "{} requires {} input(s) but got {}",
            kind,
            expected,
            inputs.len()
        )));
    }
    Ok(())
}

/// Fail if any input appears twice. For nodes that route batches by the
/// sending node's id.
pub(crate) fn validate_distinct_inputs(kind: &str, inputs: &[Arc<dyn ExecNode>]) -> Result<()> {
    for (i, input) in inputs.iter().enumerate() {
        if inputs[..i].iter().any(|seen| seen.id() == input.id()) {
            return Err(ExecError::invalid(format!(
                "{} input node '{}' is wired in more than once",
                kind,
                input.label()
            )));
        }
    }
    Ok(())
}

/// Unwrap an option that must be set, reporting `what` as missing.
pub(crate) fn required<T>(value: Option<T>, kind: &str, what: &str) -> Result<T> {
    value.ok_or_else(|| ExecError::invalid(format!("{} {} must be not null", kind, what)))
}
