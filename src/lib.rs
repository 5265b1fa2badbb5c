//! # acero-rs: push-based streaming execution for columnar query plans
//!
//! An [`ExecPlan`] is a directed acyclic graph of operator nodes. Sources
//! push batches of rows downstream, sinks hand them to the caller, and every
//! node in between forwards data, errors and end-of-stream to its outputs.
//! Flow control runs the other way: a sink that buffers too much asks its
//! producers to pause.
//!
//! ## Architecture
//!
//! - **Plan**: node arena, validation, ordered start/stop, completion
//! - **Nodes**: sources, filter/project, aggregate, sort, hash join, union
//!   and several sink flavours, all behind the [`ExecNode`] contract
//! - **Scheduling**: serial execution on the calling thread, or a
//!   crossbeam-fed worker pool
//! - **Batches and kernels**: a small dynamically typed columnar model and
//!   the expression, aggregate and sort kernels the nodes call
//!
//! ## Configuration
//!
//! [`ExecConfig`] is read from TOML and turned into an [`ExecContext`] with
//! [`ExecContext::from_config`].
//!
//! ## Example
//!
//! ```ignore
//! use acero_rs::compute::{field_ref, greater, literal};
//! use acero_rs::plan::nodes::{FilterNodeOptions, TableSourceNodeOptions};
//! use acero_rs::plan::{declaration_to_table, Declaration};
//!
//! let plan = Declaration::sequence(vec![
//!     Declaration::new("table_source", TableSourceNodeOptions::new(table)),
//!     Declaration::new("filter", FilterNodeOptions::new(greater(field_ref("x"), literal(0)))),
//! ])?;
//! let result = declaration_to_table(plan, /* use_threads */ true)?;
//! ```

pub mod batch;
pub mod compute;
pub mod config;
pub mod error;
pub mod plan;

// Re-export commonly used types
pub use batch::{DataType, ExecBatch, Field, Schema, SchemaRef, Table, Value};
pub use config::ExecConfig;
pub use error::{ErrorKind, ExecError, Result, ResultExt};
pub use plan::{
    Completion, Declaration, ExecContext, ExecNode, ExecPlan, NodeId, NodeOptions, PlanObserver,
};
