//! The execution graph runtime.
//!
//! An [`ExecPlan`] is a DAG of [`ExecNode`]s. Sources push batches to their
//! outputs; every node forwards data, errors and end-of-stream downstream
//! and tells its inputs to pause or resume upstream. The plan itself only
//! orders the start and stop calls and aggregates node completion.
//!
//! ## Layout
//!
//! - [`exec_plan`]: the arena, validation and lifecycle
//! - [`node`]: the node contract and the shared [`NodeCore`]
//! - [`nodes`]: built-in operators
//! - [`registry`] / [`declaration`]: building nodes by name
//! - [`scheduler`]: serial and thread-pool executors
//! - [`backpressure`]: byte-based flow control for sinks

pub mod backpressure;
pub mod completion;
pub mod context;
pub mod declaration;
pub mod exec_plan;
pub mod id;
pub mod node;
pub mod nodes;
pub mod observer;
pub mod order;
pub mod registry;
pub mod scheduler;

pub use backpressure::{
    BackpressureAccumulator, BackpressureControl, BackpressureMonitor, BackpressureOptions,
    BackpressureSignal,
};
pub use completion::Completion;
pub use context::{ExecContext, DEFAULT_TABLE_SOURCE_BATCH_SIZE, MAX_BATCH_SIZE};
pub use declaration::{
    declaration_to_batches, declaration_to_batches_async, declaration_to_status,
    declaration_to_status_async, declaration_to_table, declaration_to_table_async,
    BatchesWithSchema, Declaration,
};
pub use exec_plan::{ExecPlan, NodeSpec, PlanPhase};
pub use id::NodeId;
pub use node::{BatchCounter, ExecNode, NodeCore, StopToken};
pub use observer::{LifecycleRecorder, PlanObserver};
pub use order::ExecutionOrder;
pub use registry::{
    default_registry, make_exec_node, ExecFactory, ExecFactoryRegistry, NodeKind, NodeOptions,
};
pub use scheduler::{
    spawn_future, spawn_future_or_else, Executor, SerialExecutor, TaskGroup, ThreadPool,
};
