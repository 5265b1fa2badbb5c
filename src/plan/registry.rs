//! String-keyed node factories.
//!
//! Every built-in operator is reachable by name through
//! [`default_registry`]. Options travel as a [`NodeOptions`] value; a
//! factory rejects options of the wrong variant with an `Invalid` error.

use super::exec_plan::ExecPlan;
use super::node::ExecNode;
use super::nodes::{
    self, AggregateNodeOptions, ArrayVectorSourceNodeOptions, ConsumingSinkNode,
    ConsumingSinkNodeOptions, ExecBatchSourceNodeOptions, FilterNode, FilterNodeOptions,
    HashJoinNode, HashJoinNodeOptions, OrderBySinkNodeOptions, ProjectNode, ProjectNodeOptions,
    RecordBatchReaderSourceNodeOptions, RecordBatchSourceNodeOptions, SelectKSinkNodeOptions,
    SinkNode, SinkNodeOptions, SortSinkNode, SourceNode, SourceNodeOptions, TableSinkNodeOptions,
    TableSourceNodeOptions, UnionNode,
};
use crate::error::{ExecError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

// ==================== Options ====================

/// Options for any registered node.
pub enum NodeOptions {
    Source(SourceNodeOptions),
    TableSource(TableSourceNodeOptions),
    RecordBatchReaderSource(RecordBatchReaderSourceNodeOptions),
    ArrayVectorSource(ArrayVectorSourceNodeOptions),
    ExecBatchSource(ExecBatchSourceNodeOptions),
    RecordBatchSource(RecordBatchSourceNodeOptions),
    Filter(FilterNodeOptions),
    Project(ProjectNodeOptions),
    Aggregate(AggregateNodeOptions),
    Sink(SinkNodeOptions),
    TableSink(TableSinkNodeOptions),
    ConsumingSink(ConsumingSinkNodeOptions),
    OrderBySink(OrderBySinkNodeOptions),
    SelectKSink(SelectKSinkNodeOptions),
    HashJoin(HashJoinNodeOptions),
    /// `union` takes no options.
    Union,
    /// Options of a user-registered factory.
    Custom(Box<dyn Any + Send>),
}

impl NodeOptions {
    fn variant_name(&self) -> &'static str {
        match self {
            NodeOptions::Source(_) => "SourceNodeOptions",
            NodeOptions::TableSource(_) => "TableSourceNodeOptions",
            NodeOptions::RecordBatchReaderSource(_) => "RecordBatchReaderSourceNodeOptions",
            NodeOptions::ArrayVectorSource(_) => "ArrayVectorSourceNodeOptions",
            NodeOptions::ExecBatchSource(_) => "ExecBatchSourceNodeOptions",
            NodeOptions::RecordBatchSource(_) => "RecordBatchSourceNodeOptions",
            NodeOptions::Filter(_) => "FilterNodeOptions",
            NodeOptions::Project(_) => "ProjectNodeOptions",
            NodeOptions::Aggregate(_) => "AggregateNodeOptions",
            NodeOptions::Sink(_) => "SinkNodeOptions",
            NodeOptions::TableSink(_) => "TableSinkNodeOptions",
            NodeOptions::ConsumingSink(_) => "ConsumingSinkNodeOptions",
            NodeOptions::OrderBySink(_) => "OrderBySinkNodeOptions",
            NodeOptions::SelectKSink(_) => "SelectKSinkNodeOptions",
            NodeOptions::HashJoin(_) => "HashJoinNodeOptions",
            NodeOptions::Union => "no options",
            NodeOptions::Custom(_) => "custom options",
        }
    }

    /// Wrap options for a user-registered factory.
    pub fn custom<T: Any + Send>(options: T) -> Self {
        NodeOptions::Custom(Box::new(options))
    }
}

impl fmt::Debug for NodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.variant_name())
    }
}

macro_rules! impl_from_options {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for NodeOptions {
                fn from(options: $ty) -> Self {
                    NodeOptions::$variant(options)
                }
            }
        )*
    };
}

impl_from_options! {
    SourceNodeOptions => Source,
    TableSourceNodeOptions => TableSource,
    RecordBatchReaderSourceNodeOptions => RecordBatchReaderSource,
    ArrayVectorSourceNodeOptions => ArrayVectorSource,
    ExecBatchSourceNodeOptions => ExecBatchSource,
    RecordBatchSourceNodeOptions => RecordBatchSource,
    FilterNodeOptions => Filter,
    ProjectNodeOptions => Project,
    AggregateNodeOptions => Aggregate,
    SinkNodeOptions => Sink,
    TableSinkNodeOptions => TableSink,
    ConsumingSinkNodeOptions => ConsumingSink,
    OrderBySinkNodeOptions => OrderBySink,
    SelectKSinkNodeOptions => SelectKSink,
    HashJoinNodeOptions => HashJoin,
}

// ==================== Node kinds ====================

/// The built-in operators, keyed by factory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Source,
    TableSource,
    RecordBatchReaderSource,
    ArrayVectorSource,
    ExecBatchSource,
    RecordBatchSource,
    Filter,
    Project,
    Aggregate,
    Sink,
    TableSink,
    ConsumingSink,
    OrderBySink,
    SelectKSink,
    #[serde(rename = "hashjoin")]
    HashJoin,
    Union,
}

impl NodeKind {
    /// Name the kind is registered under.
    pub fn factory_name(&self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::TableSource => "table_source",
            NodeKind::RecordBatchReaderSource => "record_batch_reader_source",
            NodeKind::ArrayVectorSource => "array_vector_source",
            NodeKind::ExecBatchSource => "exec_batch_source",
            NodeKind::RecordBatchSource => "record_batch_source",
            NodeKind::Filter => "filter",
            NodeKind::Project => "project",
            NodeKind::Aggregate => "aggregate",
            NodeKind::Sink => "sink",
            NodeKind::TableSink => "table_sink",
            NodeKind::ConsumingSink => "consuming_sink",
            NodeKind::OrderBySink => "order_by_sink",
            NodeKind::SelectKSink => "select_k_sink",
            NodeKind::HashJoin => "hashjoin",
            NodeKind::Union => "union",
        }
    }

    /// `kind_name()` of the node the factory builds. `aggregate` builds
    /// either a scalar or a grouped node; the scalar name is reported.
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::Source => "SourceNode",
            NodeKind::TableSource => "TableSourceNode",
            NodeKind::RecordBatchReaderSource => "RecordBatchReaderSourceNode",
            NodeKind::ArrayVectorSource => "ArrayVectorSourceNode",
            NodeKind::ExecBatchSource => "ExecBatchSourceNode",
            NodeKind::RecordBatchSource => "RecordBatchSourceNode",
            NodeKind::Filter => "FilterNode",
            NodeKind::Project => "ProjectNode",
            NodeKind::Aggregate => "ScalarAggregateNode",
            NodeKind::Sink => "SinkNode",
            NodeKind::TableSink => "TableSinkNode",
            NodeKind::ConsumingSink => "ConsumingSinkNode",
            NodeKind::OrderBySink => "OrderBySinkNode",
            NodeKind::SelectKSink => "SelectKSinkNode",
            NodeKind::HashJoin => "HashJoinNode",
            NodeKind::Union => "UnionNode",
        }
    }

    pub fn all() -> &'static [NodeKind] {
        &[
            NodeKind::Source,
            NodeKind::TableSource,
            NodeKind::RecordBatchReaderSource,
            NodeKind::ArrayVectorSource,
            NodeKind::ExecBatchSource,
            NodeKind::RecordBatchSource,
            NodeKind::Filter,
            NodeKind::Project,
            NodeKind::Aggregate,
            NodeKind::Sink,
            NodeKind::TableSink,
            NodeKind::ConsumingSink,
            NodeKind::OrderBySink,
            NodeKind::SelectKSink,
            NodeKind::HashJoin,
            NodeKind::Union,
        ]
    }

    pub fn from_factory_name(name: &str) -> Option<NodeKind> {
        Self::all().iter().copied().find(|k| k.factory_name() == name)
    }

    pub fn is_source(&self) -> bool {
        matches!(
            self,
            NodeKind::Source
                | NodeKind::TableSource
                | NodeKind::RecordBatchReaderSource
                | NodeKind::ArrayVectorSource
                | NodeKind::ExecBatchSource
                | NodeKind::RecordBatchSource
        )
    }

    pub fn is_sink(&self) -> bool {
        matches!(
            self,
            NodeKind::Sink
                | NodeKind::TableSink
                | NodeKind::ConsumingSink
                | NodeKind::OrderBySink
                | NodeKind::SelectKSink
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            NodeKind::Source => "Pushes batches from an async batch stream.",
            NodeKind::TableSource => "Slices an in-memory table into batches.",
            NodeKind::RecordBatchReaderSource => "Reads batches from a record batch reader.",
            NodeKind::ArrayVectorSource => "Pushes batches built from column vectors.",
            NodeKind::ExecBatchSource => "Pushes batches from an iterator.",
            NodeKind::RecordBatchSource => "Pushes record batches from an iterator.",
            NodeKind::Filter => "Keeps rows whose predicate is true.",
            NodeKind::Project => "Evaluates one expression per output column.",
            NodeKind::Aggregate => "Scalar or grouped aggregation.",
            NodeKind::Sink => "Hands batches to a pull-based generator.",
            NodeKind::TableSink => "Collects its input into a table.",
            NodeKind::ConsumingSink => "Hands batches to a caller-supplied consumer.",
            NodeKind::OrderBySink => "Sorts its whole input.",
            NodeKind::SelectKSink => "Keeps the first k rows of the sort order.",
            NodeKind::HashJoin => "Equi-joins two inputs; the right input builds.",
            NodeKind::Union => "Forwards every batch of every input.",
        }
    }

    fn make(
        &self,
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: NodeOptions,
        label: Option<String>,
    ) -> Result<Arc<dyn ExecNode>> {
        fn erase<N: ExecNode + 'static>(node: Result<Arc<N>>) -> Result<Arc<dyn ExecNode>> {
            node.map(|n| n as Arc<dyn ExecNode>)
        }

        match (self, options) {
            (NodeKind::Source, NodeOptions::Source(o)) => {
                erase(SourceNode::make(plan, inputs, o, label))
            }
            (NodeKind::TableSource, NodeOptions::TableSource(o)) => {
                erase(SourceNode::make_table_source(plan, inputs, o, label))
            }
            (NodeKind::RecordBatchReaderSource, NodeOptions::RecordBatchReaderSource(o)) => {
                erase(SourceNode::make_reader_source(plan, inputs, o, label))
            }
            (NodeKind::ArrayVectorSource, NodeOptions::ArrayVectorSource(o)) => {
                erase(SourceNode::make_array_vector_source(plan, inputs, o, label))
            }
            (NodeKind::ExecBatchSource, NodeOptions::ExecBatchSource(o)) => {
                erase(SourceNode::make_exec_batch_source(plan, inputs, o, label))
            }
            (NodeKind::RecordBatchSource, NodeOptions::RecordBatchSource(o)) => {
                erase(SourceNode::make_record_batch_source(plan, inputs, o, label))
            }
            (NodeKind::Filter, NodeOptions::Filter(o)) => {
                erase(FilterNode::make(plan, inputs, o, label))
            }
            (NodeKind::Project, NodeOptions::Project(o)) => {
                erase(ProjectNode::make(plan, inputs, o, label))
            }
            (NodeKind::Aggregate, NodeOptions::Aggregate(o)) => {
                nodes::aggregate::make(plan, inputs, o, label)
            }
            (NodeKind::Sink, NodeOptions::Sink(o)) => erase(SinkNode::make(plan, inputs, o, label)),
            (NodeKind::TableSink, NodeOptions::TableSink(o)) => {
                erase(ConsumingSinkNode::make_table_sink(plan, inputs, o, label))
            }
            (NodeKind::ConsumingSink, NodeOptions::ConsumingSink(o)) => {
                erase(ConsumingSinkNode::make(plan, inputs, o, label))
            }
            (NodeKind::OrderBySink, NodeOptions::OrderBySink(o)) => {
                erase(SortSinkNode::make_order_by(plan, inputs, o, label))
            }
            (NodeKind::SelectKSink, NodeOptions::SelectKSink(o)) => {
                erase(SortSinkNode::make_select_k(plan, inputs, o, label))
            }
            (NodeKind::HashJoin, NodeOptions::HashJoin(o)) => {
                erase(HashJoinNode::make(plan, inputs, o, label))
            }
            (NodeKind::Union, NodeOptions::Union) => erase(UnionNode::make(plan, inputs, label)),
            (kind, options) => Err(ExecError::invalid(format!(
                "Factory '{}' cannot take {}",
                kind.factory_name(),
                options.variant_name()
            ))),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.factory_name())
    }
}

// ==================== Registry ====================

/// Builds a node from its inputs, options and optional label.
pub type ExecFactory = Arc<
    dyn Fn(&ExecPlan, Vec<Arc<dyn ExecNode>>, NodeOptions, Option<String>) -> Result<Arc<dyn ExecNode>>
        + Send
        + Sync,
>;

/// Name → factory map. Registration is additive; a name can be claimed
/// once.
#[derive(Default)]
pub struct ExecFactoryRegistry {
    factories: RwLock<BTreeMap<String, ExecFactory>>,
}

impl ExecFactoryRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every [`NodeKind`].
    pub fn with_builtin_nodes() -> Self {
        let registry = Self::new();
        {
            let mut factories = registry.factories.write();
            for kind in NodeKind::all().iter().copied() {
                let factory: ExecFactory = Arc::new(
                    move |plan: &ExecPlan,
                          inputs: Vec<Arc<dyn ExecNode>>,
                          options: NodeOptions,
                          label: Option<String>| {
                        kind.make(plan, inputs, options, label)
                    },
                );
                factories.insert(kind.factory_name().to_string(), factory);
            }
        }
        registry
    }

    pub fn add_factory(&self, name: impl Into<String>, factory: ExecFactory) -> Result<()> {
        let name = name.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&name) {
            return Err(ExecError::key_error(format!(
                "ExecFactory named {} already registered",
                name
            )));
        }
        tracing::debug!(factory = %name, "Registered exec factory");
        factories.insert(name, factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<ExecFactory> {
        self.factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ExecError::invalid(format!("ExecFactory named {} not present", name)))
    }

    pub fn make_node(
        &self,
        name: &str,
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: NodeOptions,
        label: Option<String>,
    ) -> Result<Arc<dyn ExecNode>> {
        let factory = self.get(name)?;
        factory(plan, inputs, options, label)
    }

    pub fn factory_names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}

impl fmt::Debug for ExecFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecFactoryRegistry")
            .field("factories", &self.factory_names())
            .finish()
    }
}

/// The process-wide registry, preloaded with the built-in nodes.
pub fn default_registry() -> &'static ExecFactoryRegistry {
    static REGISTRY: OnceLock<ExecFactoryRegistry> = OnceLock::new();
    REGISTRY.get_or_init(ExecFactoryRegistry::with_builtin_nodes)
}

/// Build a node by factory name using [`default_registry`].
pub fn make_exec_node(
    factory_name: &str,
    plan: &ExecPlan,
    inputs: Vec<Arc<dyn ExecNode>>,
    options: impl Into<NodeOptions>,
) -> Result<Arc<dyn ExecNode>> {
    default_registry().make_node(factory_name, plan, inputs, options.into(), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{DataType, Field, Schema};
    use crate::plan::context::ExecContext;

    fn schema() -> crate::batch::SchemaRef {
        Arc::new(Schema::new(vec![Field::new("i32", DataType::Int32)]))
    }

    #[test]
    fn test_every_kind_round_trips_by_name() {
        for kind in NodeKind::all() {
            assert_eq!(NodeKind::from_factory_name(kind.factory_name()), Some(*kind));
        }
        assert_eq!(NodeKind::from_factory_name("nope"), None);
    }

    #[test]
    fn test_default_registry_has_builtins() {
        let names = default_registry().factory_names();
        assert_eq!(names.len(), NodeKind::all().len());
        assert!(names.iter().any(|n| n == "hashjoin"));
    }

    #[test]
    fn test_unknown_factory_is_invalid() {
        let plan = ExecPlan::make(ExecContext::serial());
        let err = make_exec_node("no_such_node", &plan, Vec::new(), NodeOptions::Union).unwrap_err();
        assert!(err.is_invalid());
        assert!(err.to_string().contains("no_such_node"));
    }

    #[test]
    fn test_mismatched_options_are_invalid() {
        let plan = ExecPlan::make(ExecContext::serial());
        let err = make_exec_node("filter", &plan, Vec::new(), SinkNodeOptions::new()).unwrap_err();
        assert!(err.is_invalid());
    }

    #[test]
    fn test_make_source_by_name() {
        let plan = ExecPlan::make(ExecContext::serial());
        let node = make_exec_node(
            "source",
            &plan,
            Vec::new(),
            SourceNodeOptions::from_batches(schema(), Vec::new()),
        )
        .unwrap();
        assert_eq!(node.kind_name(), "SourceNode");
        assert_eq!(plan.num_nodes(), 1);
    }

    #[test]
    fn test_custom_factory() {
        let registry = ExecFactoryRegistry::new();
        let factory: ExecFactory = Arc::new(
            |plan: &ExecPlan,
             inputs: Vec<Arc<dyn ExecNode>>,
             options: NodeOptions,
             label: Option<String>| {
                let NodeOptions::Custom(boxed) = options else {
                    return Err(ExecError::invalid("expected custom options"));
                };
                let batches = boxed
                    .downcast::<Vec<crate::batch::ExecBatch>>()
                    .map_err(|_| ExecError::invalid("expected batches"))?;
                let options = SourceNodeOptions::from_batches(schema(), *batches);
                SourceNode::make(plan, inputs, options, label).map(|n| n as Arc<dyn ExecNode>)
            },
        );
        registry.add_factory("replay", factory.clone()).unwrap();
        assert!(registry.add_factory("replay", factory).is_err());

        let plan = ExecPlan::make(ExecContext::serial());
        let node = registry
            .make_node(
                "replay",
                &plan,
                Vec::new(),
                NodeOptions::custom(Vec::<crate::batch::ExecBatch>::new()),
                Some("r".to_string()),
            )
            .unwrap();
        assert_eq!(node.label(), "r");
    }
}
