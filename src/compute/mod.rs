//! Operator kernels used by the built-in nodes.
//!
//! The graph runtime never calls into this module directly; only the
//! concrete filter, project, aggregate and sort nodes do.

pub mod aggregate;
pub mod expr;
pub mod sort;

pub use aggregate::{Accumulator, Aggregate, AggregateKind, CountMode, FunctionOptions};
pub use expr::{
    and_, call, equal, field_ref, greater, greater_equal, is_null, is_valid, less, less_equal,
    literal, not_, not_equal, or_, Expression,
};
pub use sort::{
    select_k_indices, sort_indices, NullPlacement, SelectKOptions, SortKey, SortOptions,
    SortOrder,
};
