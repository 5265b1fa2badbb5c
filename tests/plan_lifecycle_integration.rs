//! Integration tests for plan construction and lifecycle
//!
//! These tests validate the plan workflow with real nodes:
//! - Building and validating graphs
//! - Start/stop ordering and idempotency
//! - Error propagation and fail-fast shutdown
//! - Diagnostic rendering

mod common;

use acero_rs::compute::{call, field_ref, greater_equal, literal, Aggregate, FunctionOptions};
use acero_rs::compute::{CountMode, SortKey, SortOptions};
use acero_rs::plan::nodes::{
    AggregateNodeOptions, FilterNodeOptions, OrderBySinkNodeOptions, ProjectNodeOptions,
    SinkNodeOptions, SourceNodeOptions, UnionNode,
};
use acero_rs::plan::{make_exec_node, LifecycleRecorder, PlanPhase};
use acero_rs::{ErrorKind, ExecContext, ExecError, ExecPlan};
use common::builders::{basic_batches, groupable_batches};
use futures::stream::{self, StreamExt};
use std::sync::Arc;

fn serial_plan() -> ExecPlan {
    common::init_logging();
    ExecPlan::make(ExecContext::serial())
}

#[test]
fn test_empty_plan_fails_validation() {
    let plan = serial_plan();
    let err = plan.validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
    assert!(err.to_string().contains("no node"));

    let err = plan.start_producing().unwrap_err();
    assert!(err.is_invalid());
}

#[test]
fn test_unbound_output_fails_validation() {
    let plan = serial_plan();
    let data = basic_batches();
    make_exec_node("source", &plan, Vec::new(), data.source_options()).unwrap();
    let err = plan.validate().unwrap_err();
    assert!(err.to_string().contains("output not bound"));
    assert_eq!(plan.phase(), PlanPhase::Unvalidated);
}

#[test]
fn test_source_sink_lifecycle() {
    let plan = serial_plan();
    let data = basic_batches();
    let source = make_exec_node("source", &plan, Vec::new(), data.source_options()).unwrap();
    let sink_options = SinkNodeOptions::new();
    let generator = sink_options.generator();
    make_exec_node("sink", &plan, vec![source], sink_options).unwrap();

    plan.validate().unwrap();
    assert_eq!(plan.phase(), PlanPhase::Validated);
    assert_eq!(plan.sources().len(), 1);
    assert_eq!(plan.sinks().len(), 1);

    let batches = common::start_and_collect(&plan, generator).unwrap();
    assert_eq!(common::sorted_rows(&batches), data.all_rows());
    assert_eq!(plan.phase(), PlanPhase::Finished);

    let err = plan.start_producing().unwrap_err();
    assert!(err.to_string().contains("restarted"));
}

#[test]
fn test_observer_sees_consumers_start_first() {
    let recorder = Arc::new(LifecycleRecorder::new());
    let plan = serial_plan().with_observer(recorder.clone());
    let data = basic_batches();

    let source = SourceNodeOptions::new(data.schema.clone(), data.stream());
    let source = acero_rs::plan::nodes::SourceNode::make(
        &plan,
        Vec::new(),
        source,
        Some("source".to_string()),
    )
    .unwrap();
    let filter = acero_rs::plan::nodes::FilterNode::make(
        &plan,
        vec![source],
        FilterNodeOptions::new(greater_equal(field_ref("i32"), literal(0))),
        Some("filter".to_string()),
    )
    .unwrap();
    let sink_options = SinkNodeOptions::new();
    let generator = sink_options.generator();
    acero_rs::plan::nodes::SinkNode::make(&plan, vec![filter], sink_options, Some("sink".to_string()))
        .unwrap();

    common::start_and_collect(&plan, generator).unwrap();
    assert_eq!(recorder.started(), vec!["sink", "filter", "source"]);
    let mut finished = recorder.finished();
    finished.sort();
    assert_eq!(finished, vec!["filter", "sink", "source"]);
}

#[test]
fn test_failing_source_fails_the_plan() {
    let plan = serial_plan();
    let data = basic_batches();
    let failing = stream::iter(vec![
        Ok(data.batches[0].clone()),
        Err(ExecError::Execution("generator failed".to_string())),
    ])
    .boxed();
    let source = make_exec_node(
        "source",
        &plan,
        Vec::new(),
        SourceNodeOptions::new(data.schema.clone(), failing),
    )
    .unwrap();
    let sink_options = SinkNodeOptions::new();
    let generator = sink_options.generator();
    make_exec_node("sink", &plan, vec![source], sink_options).unwrap();

    let err = common::start_and_collect(&plan, generator).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(err.to_string().contains("generator failed"));

    let finished = plan.finished().result().unwrap();
    assert!(finished.unwrap_err().to_string().contains("generator failed"));
}

#[test]
fn test_stop_before_start_finishes_everything() {
    let plan = serial_plan();
    let data = basic_batches();
    let source = make_exec_node("source", &plan, Vec::new(), data.source_options()).unwrap();
    let sink = make_exec_node("sink", &plan, vec![source], SinkNodeOptions::new()).unwrap();

    plan.stop_producing();
    plan.stop_producing();
    assert!(plan.finished().is_finished());
    assert!(plan.finished().result().unwrap().is_ok());
    assert!(sink.finished().is_finished());
    assert!(plan.start_producing().is_err());
}

#[test]
fn test_stop_while_source_is_blocked() {
    let plan = serial_plan();
    let data = basic_batches();
    let source = make_exec_node(
        "source",
        &plan,
        Vec::new(),
        SourceNodeOptions::new(
            data.schema.clone(),
            stream::pending::<acero_rs::Result<acero_rs::ExecBatch>>().boxed(),
        ),
    )
    .unwrap();
    let sink_options = SinkNodeOptions::new();
    let mut generator = sink_options.generator();
    make_exec_node("sink", &plan, vec![source], sink_options).unwrap();

    plan.start_producing().unwrap();
    assert!(!plan.finished().is_finished());
    plan.stop_producing();

    let result = plan.finished().wait_timeout(common::test_timeout());
    assert!(matches!(result, Some(Ok(()))));
    let next = futures::executor::block_on(generator.next_batch()).unwrap();
    assert!(next.is_none());
}

#[test]
fn test_union_needs_matching_schemas() {
    let plan = serial_plan();
    let basic = basic_batches();
    let groupable = groupable_batches();
    let lhs = make_exec_node("source", &plan, Vec::new(), basic.source_options()).unwrap();
    let rhs = make_exec_node("source", &plan, Vec::new(), groupable.source_options()).unwrap();
    let err = UnionNode::make(&plan, vec![lhs, rhs], None).unwrap_err();
    assert!(err.is_invalid());

    let err = UnionNode::make(&plan, Vec::new(), None).unwrap_err();
    assert!(err.to_string().contains("at least one input"));
}

#[test]
fn test_input_wired_twice_is_rejected() {
    let plan = serial_plan();
    let data = basic_batches();
    let source = make_exec_node("source", &plan, Vec::new(), data.source_options()).unwrap();
    let err = UnionNode::make(&plan, vec![source.clone(), source.clone()], None).unwrap_err();
    assert!(err.is_invalid());
    assert!(err.to_string().contains("more than once"));
    assert_eq!(plan.num_nodes(), 1);
    assert!(format!("{:?}", err).contains("Invalid"));

    let union = UnionNode::make(&plan, vec![source], Some("u".to_string())).unwrap();
    let rendered = format!("{:?}", union);
    assert!(rendered.contains("UnionNode"));
    assert!(rendered.contains("\"u\""));
}

#[test]
fn test_plan_to_string() {
    let plan = serial_plan();
    let data = basic_batches();
    let source = acero_rs::plan::nodes::SourceNode::make(
        &plan,
        Vec::new(),
        data.source_options(),
        Some("source".to_string()),
    )
    .unwrap();
    let filter = acero_rs::plan::nodes::FilterNode::make(
        &plan,
        vec![source],
        FilterNodeOptions::new(greater_equal(field_ref("i32"), literal(0))),
        None,
    )
    .unwrap();
    let project = acero_rs::plan::nodes::ProjectNode::make(
        &plan,
        vec![filter],
        ProjectNodeOptions::new(vec![
            field_ref("bool"),
            call("multiply", vec![field_ref("i32"), literal(2)]),
        ]),
        None,
    )
    .unwrap();
    let aggregate = acero_rs::plan::nodes::aggregate::make(
        &plan,
        vec![project],
        AggregateNodeOptions::new(vec![
            Aggregate::new("hash_sum", "multiply(i32, 2)", "sum(multiply(i32, 2))"),
            Aggregate::new("hash_count", "multiply(i32, 2)", "count(multiply(i32, 2))")
                .with_options(FunctionOptions::Count(CountMode::OnlyValid)),
        ])
        .with_keys(vec!["bool".to_string()]),
        Some("custom_aggregate_name".to_string()),
    )
    .unwrap();
    acero_rs::plan::nodes::SortSinkNode::make_order_by(
        &plan,
        vec![aggregate],
        OrderBySinkNodeOptions::new(SortOptions::new(vec![SortKey::descending(
            "sum(multiply(i32, 2))",
        )])),
        None,
    )
    .unwrap();

    let expected = "ExecPlan with 5 nodes:\n\
:OrderBySinkNode{by={sort_keys=[FieldRef.Name(sum(multiply(i32, 2))) DESC], null_placement=AtEnd}}\n  \
custom_aggregate_name:GroupByNode{keys=[\"bool\"], aggregates=[\n  \
\thash_sum(multiply(i32, 2)),\n  \
\thash_count(multiply(i32, 2), {mode=NON_NULL}),\n  \
]}\n    \
:ProjectNode{projection=[bool, multiply(i32, 2)]}\n      \
:FilterNode{filter=(i32 >= 0)}\n        \
source:SourceNode{}\n";
    assert_eq!(plan.to_string(), expected);
}
