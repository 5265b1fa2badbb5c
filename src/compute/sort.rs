//! Sort keys and row ordering for the order-by and top-k sinks.

use crate::batch::{ExecBatch, Schema};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        })
    }
}

/// Where nulls go, independent of the sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NullPlacement {
    AtStart,
    #[default]
    AtEnd,
}

impl fmt::Display for NullPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NullPlacement::AtStart => "AtStart",
            NullPlacement::AtEnd => "AtEnd",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub target: String,
    #[serde(default)]
    pub order: SortOrder,
}

impl SortKey {
    pub fn new(target: impl Into<String>, order: SortOrder) -> Self {
        Self {
            target: target.into(),
            order,
        }
    }

    pub fn ascending(target: impl Into<String>) -> Self {
        Self::new(target, SortOrder::Ascending)
    }

    pub fn descending(target: impl Into<String>) -> Self {
        Self::new(target, SortOrder::Descending)
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldRef.Name({}) {}", self.target, self.order)
    }
}

fn write_keys(f: &mut fmt::Formatter<'_>, keys: &[SortKey]) -> fmt::Result {
    f.write_str("sort_keys=[")?;
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", key)?;
    }
    f.write_str("]")
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortOptions {
    pub sort_keys: Vec<SortKey>,
    #[serde(default)]
    pub null_placement: NullPlacement,
}

impl SortOptions {
    pub fn new(sort_keys: Vec<SortKey>) -> Self {
        Self {
            sort_keys,
            null_placement: NullPlacement::default(),
        }
    }

    pub fn with_null_placement(mut self, null_placement: NullPlacement) -> Self {
        self.null_placement = null_placement;
        self
    }
}

impl fmt::Display for SortOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_keys(f, &self.sort_keys)?;
        write!(f, ", null_placement={}", self.null_placement)
    }
}

/// Keep only the first `k` rows of the ordering described by `sort_keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectKOptions {
    pub k: usize,
    pub sort_keys: Vec<SortKey>,
}

impl SelectKOptions {
    pub fn new(k: usize, sort_keys: Vec<SortKey>) -> Self {
        Self { k, sort_keys }
    }

    /// The `k` largest rows by `targets`.
    pub fn top_k_default(k: usize, targets: &[&str]) -> Self {
        Self::new(k, targets.iter().map(|t| SortKey::descending(*t)).collect())
    }

    /// The `k` smallest rows by `targets`.
    pub fn bottom_k_default(k: usize, targets: &[&str]) -> Self {
        Self::new(k, targets.iter().map(|t| SortKey::ascending(*t)).collect())
    }
}

impl fmt::Display for SelectKOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k={}, ", self.k)?;
        write_keys(f, &self.sort_keys)
    }
}

/// Stable ordering of the rows of `batch`.
pub fn sort_indices(
    batch: &ExecBatch,
    schema: &Schema,
    sort_keys: &[SortKey],
    null_placement: NullPlacement,
) -> Result<Vec<usize>> {
    let resolved = sort_keys
        .iter()
        .map(|k| Ok((schema.resolve(&k.target)?, k.order)))
        .collect::<Result<Vec<_>>>()?;
    let mut indices: Vec<usize> = (0..batch.num_rows()).collect();
    indices.sort_by(|&a, &b| {
        for &(column, order) in &resolved {
            let lhs = batch.value(a, column);
            let rhs = batch.value(b, column);
            let ord = match (lhs.is_null(), rhs.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => match null_placement {
                    NullPlacement::AtStart => Ordering::Less,
                    NullPlacement::AtEnd => Ordering::Greater,
                },
                (false, true) => match null_placement {
                    NullPlacement::AtStart => Ordering::Greater,
                    NullPlacement::AtEnd => Ordering::Less,
                },
                (false, false) => match order {
                    SortOrder::Ascending => lhs.total_cmp(rhs),
                    SortOrder::Descending => rhs.total_cmp(lhs),
                },
            };
            if ord.is_ne() {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(indices)
}

/// Indices of the first `k` rows under `options`; nulls always rank last.
pub fn select_k_indices(
    batch: &ExecBatch,
    schema: &Schema,
    options: &SelectKOptions,
) -> Result<Vec<usize>> {
    let mut indices = sort_indices(batch, schema, &options.sort_keys, NullPlacement::AtEnd)?;
    indices.truncate(options.k);
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{DataType, Field, Value};

    fn input() -> (Schema, ExecBatch) {
        let schema = Schema::new(vec![
            Field::new("i32", DataType::Int32),
            Field::new("bool", DataType::Boolean),
        ]);
        let batch = ExecBatch::from_json(
            &[DataType::Int32, DataType::Boolean],
            "[[7, false], [null, true], [4, false], [6, null], [5, true]]",
        )
        .unwrap();
        (schema, batch)
    }

    fn first_column(batch: &ExecBatch, indices: &[usize]) -> Vec<Value> {
        indices.iter().map(|&i| batch.value(i, 0).clone()).collect()
    }

    #[test]
    fn test_sort_ascending_nulls_at_end() {
        let (schema, batch) = input();
        let idx = sort_indices(
            &batch,
            &schema,
            &[SortKey::ascending("i32")],
            NullPlacement::AtEnd,
        )
        .unwrap();
        assert_eq!(
            first_column(&batch, &idx),
            vec![
                Value::Int32(4),
                Value::Int32(5),
                Value::Int32(6),
                Value::Int32(7),
                Value::Null
            ]
        );
    }

    #[test]
    fn test_sort_descending_nulls_at_start() {
        let (schema, batch) = input();
        let idx = sort_indices(
            &batch,
            &schema,
            &[SortKey::descending("i32")],
            NullPlacement::AtStart,
        )
        .unwrap();
        assert_eq!(first_column(&batch, &idx)[0], Value::Null);
        assert_eq!(first_column(&batch, &idx)[1], Value::Int32(7));
    }

    #[test]
    fn test_multi_key_sort_is_stable() {
        let (schema, batch) = input();
        let idx = sort_indices(
            &batch,
            &schema,
            &[SortKey::ascending("bool")],
            NullPlacement::AtEnd,
        )
        .unwrap();
        // false rows keep their input order: 7 then 4
        assert_eq!(idx[..2], [0, 2]);
        assert_eq!(idx[4], 3);
    }

    #[test]
    fn test_select_k() {
        let (schema, batch) = input();
        let idx = select_k_indices(&batch, &schema, &SelectKOptions::top_k_default(2, &["i32"]))
            .unwrap();
        assert_eq!(first_column(&batch, &idx), vec![Value::Int32(7), Value::Int32(6)]);
    }

    #[test]
    fn test_display() {
        let options = SortOptions::new(vec![SortKey::ascending("x")]);
        assert_eq!(
            options.to_string(),
            "sort_keys=[FieldRef.Name(x) ASC], null_placement=AtEnd"
        );
        assert_eq!(
            SelectKOptions::top_k_default(1, &["str"]).to_string(),
            "k=1, sort_keys=[FieldRef.Name(str) DESC]"
        );
    }
}
