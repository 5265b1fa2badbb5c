//! Equi-join on key columns with the right input as the build side.
//!
//! Right batches are buffered until the right input has finished, then
//! hashed by key. Left batches that arrive earlier are parked and probed
//! once the table exists. A left batch only counts towards its input total
//! after it has been probed, so the node cannot finish while parked batches
//! remain.

use super::{validate_distinct_inputs, validate_input_count};
use crate::batch::{ExecBatch, Field, Schema, SchemaRef, Value};
use crate::compute::Expression;
use crate::error::{ExecError, Result};
use crate::plan::context::MAX_BATCH_SIZE;
use crate::plan::exec_plan::{ExecPlan, NodeSpec};
use crate::plan::id::NodeId;
use crate::plan::node::{BatchCounter, ExecNode, NodeCore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which rows a join keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    #[default]
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    LeftAnti,
    RightSemi,
    RightAnti,
}

impl JoinType {
    pub fn all() -> &'static [JoinType] {
        &[
            JoinType::Inner,
            JoinType::LeftOuter,
            JoinType::RightOuter,
            JoinType::FullOuter,
            JoinType::LeftSemi,
            JoinType::LeftAnti,
            JoinType::RightSemi,
            JoinType::RightAnti,
        ]
    }

    fn keeps_unmatched_left(self) -> bool {
        matches!(self, JoinType::LeftOuter | JoinType::FullOuter)
    }

    fn keeps_unmatched_right(self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter)
    }

    /// Output is the build side only, emitted once probing is over.
    fn outputs_right_only(self) -> bool {
        matches!(self, JoinType::RightSemi | JoinType::RightAnti)
    }

    fn outputs_left_only(self) -> bool {
        matches!(self, JoinType::LeftSemi | JoinType::LeftAnti)
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JoinType::Inner => "INNER",
            JoinType::LeftOuter => "LEFT_OUTER",
            JoinType::RightOuter => "RIGHT_OUTER",
            JoinType::FullOuter => "FULL_OUTER",
            JoinType::LeftSemi => "LEFT_SEMI",
            JoinType::LeftAnti => "LEFT_ANTI",
            JoinType::RightSemi => "RIGHT_SEMI",
            JoinType::RightAnti => "RIGHT_ANTI",
        };
        f.write_str(name)
    }
}

/// Options for the `hashjoin` node.
#[derive(Debug, Clone)]
pub struct HashJoinNodeOptions {
    pub join_type: JoinType,
    pub left_keys: Vec<String>,
    pub right_keys: Vec<String>,
    pub output_suffix_for_left: String,
    pub output_suffix_for_right: String,
    /// Residual predicate over the joined row, applied to key matches.
    pub filter: Option<Expression>,
}

impl HashJoinNodeOptions {
    pub fn new(join_type: JoinType, left_keys: Vec<String>, right_keys: Vec<String>) -> Self {
        Self {
            join_type,
            left_keys,
            right_keys,
            output_suffix_for_left: String::new(),
            output_suffix_for_right: String::new(),
            filter: None,
        }
    }

    pub fn with_suffixes(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.output_suffix_for_left = left.into();
        self.output_suffix_for_right = right.into();
        self
    }

    pub fn with_filter(mut self, filter: Expression) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Left fields then right fields, suffixing names present on both sides.
fn joined_schema(left: &Schema, right: &Schema, options: &HashJoinNodeOptions) -> Schema {
    let left_names: HashSet<&str> = left.fields().iter().map(|f| f.name()).collect();
    let right_names: HashSet<&str> = right.fields().iter().map(|f| f.name()).collect();
    let pad_left = options.join_type.keeps_unmatched_right();
    let pad_right = options.join_type.keeps_unmatched_left();

    let rename = |field: &Field, clashes: bool, suffix: &str, padded: bool| {
        let field = if clashes {
            field.with_name(format!("{}{}", field.name(), suffix))
        } else {
            field.clone()
        };
        if padded {
            field.with_nullable(true)
        } else {
            field
        }
    };

    let mut fields = Vec::with_capacity(left.num_fields() + right.num_fields());
    for field in left.fields() {
        let clashes = right_names.contains(field.name());
        fields.push(rename(field, clashes, &options.output_suffix_for_left, pad_left));
    }
    for field in right.fields() {
        let clashes = left_names.contains(field.name());
        fields.push(rename(field, clashes, &options.output_suffix_for_right, pad_right));
    }
    Schema::new(fields)
}

/// Key of `row` in `batch`, `None` when any key column is null.
fn row_key(batch: &ExecBatch, row: usize, key_columns: &[usize]) -> Option<Vec<Value>> {
    key_columns
        .iter()
        .map(|&c| {
            let value = batch.value(row, c);
            (!value.is_null()).then(|| value.clone())
        })
        .collect()
}

struct BuildTable {
    batch: ExecBatch,
    rows_by_key: HashMap<Vec<Value>, Vec<usize>>,
    matched: Vec<bool>,
}

#[derive(Default)]
struct JoinState {
    build_batches: Vec<ExecBatch>,
    table: Option<BuildTable>,
    parked: Vec<ExecBatch>,
}

/// Hash equi-join of two inputs: `inputs[0]` probes, `inputs[1]` builds.
pub struct HashJoinNode {
    core: NodeCore,
    join_type: JoinType,
    left_keys: Vec<usize>,
    right_keys: Vec<usize>,
    left_width: usize,
    right_width: usize,
    /// Schema of a joined row, used to evaluate the residual filter.
    pair_schema: Schema,
    filter: Option<Expression>,
    state: Mutex<JoinState>,
    left_counter: BatchCounter,
    right_counter: BatchCounter,
    left_done: AtomicBool,
    build_done: AtomicBool,
    finished: AtomicBool,
}

impl HashJoinNode {
    pub fn make(
        plan: &ExecPlan,
        inputs: Vec<Arc<dyn ExecNode>>,
        options: HashJoinNodeOptions,
        label: Option<String>,
    ) -> Result<Arc<HashJoinNode>> {
        validate_input_count("HashJoinNode", &inputs, 2)?;
        validate_distinct_inputs("HashJoinNode", &inputs)?;
        if options.left_keys.len() != options.right_keys.len() {
            return Err(ExecError::invalid(format!(
                "left_keys and right_keys must have the same length, got {} and {}",
                options.left_keys.len(),
                options.right_keys.len()
            )));
        }
        if options.left_keys.is_empty() {
            return Err(ExecError::invalid("HashJoinNode requires at least one key"));
        }
        let left_schema = inputs[0].output_schema().clone();
        let right_schema = inputs[1].output_schema().clone();
        let left_keys = options
            .left_keys
            .iter()
            .map(|k| left_schema.resolve(k))
            .collect::<Result<Vec<_>>>()?;
        let right_keys = options
            .right_keys
            .iter()
            .map(|k| right_schema.resolve(k))
            .collect::<Result<Vec<_>>>()?;
        for (&l, &r) in left_keys.iter().zip(&right_keys) {
            let (lf, rf) = (left_schema.field(l), right_schema.field(r));
            if lf.data_type() != rf.data_type() {
                return Err(ExecError::type_error(format!(
                    "Data types of corresponding keys on left and right side must match: \
                     {} is {} but {} is {}",
                    lf.name(),
                    lf.data_type(),
                    rf.name(),
                    rf.data_type()
                )));
            }
        }

        let pair_schema = joined_schema(&left_schema, &right_schema, &options);
        if let Some(filter) = &options.filter {
            filter.output_type(&pair_schema)?;
        }
        let output_schema: SchemaRef = if options.join_type.outputs_left_only() {
            left_schema.clone()
        } else if options.join_type.outputs_right_only() {
            right_schema.clone()
        } else {
            Arc::new(pair_schema.clone())
        };

        let spec = NodeSpec::new(inputs, output_schema).with_label(label);
        plan.emplace_node(spec, move |core| {
            Ok(HashJoinNode {
                core,
                join_type: options.join_type,
                left_keys,
                right_keys,
                left_width: left_schema.num_fields(),
                right_width: right_schema.num_fields(),
                pair_schema,
                filter: options.filter,
                state: Mutex::new(JoinState::default()),
                left_counter: BatchCounter::new(),
                right_counter: BatchCounter::new(),
                left_done: AtomicBool::new(false),
                build_done: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            })
        })
    }

    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    fn is_left(&self, input: NodeId) -> bool {
        self.core.input_index(input) == Some(0)
    }

    // ==================== Build ====================

    fn build(&self) {
        let parked = {
            let mut state = self.state.lock();
            let batches = std::mem::take(&mut state.build_batches);
            let batch = match ExecBatch::concat(self.right_width, &batches) {
                Ok(batch) => batch,
                Err(err) => {
                    drop(state);
                    self.fail(err);
                    return;
                }
            };
            let mut rows_by_key: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
            for row in 0..batch.num_rows() {
                if let Some(key) = row_key(&batch, row, &self.right_keys) {
                    rows_by_key.entry(key).or_default().push(row);
                }
            }
            tracing::debug!(
                node = %self.label(),
                rows = batch.num_rows(),
                keys = rows_by_key.len(),
                "Join build side complete"
            );
            state.table = Some(BuildTable {
                matched: vec![false; batch.num_rows()],
                batch,
                rows_by_key,
            });
            std::mem::take(&mut state.parked)
        };
        self.build_done.store(true, Ordering::SeqCst);

        for batch in parked {
            if !self.probe_and_count(&batch) {
                return;
            }
        }
        self.try_finish();
    }

    // ==================== Probe ====================

    /// Probe one left batch and count it. Returns `false` once the node
    /// has failed.
    fn probe_and_count(&self, batch: &ExecBatch) -> bool {
        let output = {
            let mut state = self.state.lock();
            match state.table.as_mut() {
                Some(table) => self.probe(table, batch),
                None => Err(ExecError::invalid("Probed before the build side finished")),
            }
        };
        match output {
            Ok(Some(output)) => {
                for chunk in output.chunks(MAX_BATCH_SIZE) {
                    self.core.emit(chunk);
                }
            }
            Ok(None) => {}
            Err(err) => {
                self.fail(err);
                return false;
            }
        }
        if self.left_counter.increment() {
            self.left_done.store(true, Ordering::SeqCst);
            self.try_finish();
        }
        true
    }

    /// Key matches of `row`, narrowed by the residual filter.
    fn matches_for(&self, table: &BuildTable, batch: &ExecBatch, row: usize) -> Result<Vec<usize>> {
        let Some(candidates) = row_key(batch, row, &self.left_keys)
            .and_then(|key| table.rows_by_key.get(&key))
        else {
            return Ok(Vec::new());
        };
        let Some(filter) = &self.filter else {
            return Ok(candidates.clone());
        };
        let left_row = batch.row(row);
        let pairs = candidates
            .iter()
            .map(|&r| {
                let mut joined = left_row.clone();
                joined.extend(table.batch.row(r));
                joined
            })
            .collect();
        let pairs = ExecBatch::from_rows(self.left_width + self.right_width, pairs)?;
        let mask = filter.evaluate(&self.pair_schema, &pairs)?;
        Ok(candidates
            .iter()
            .zip(mask.iter())
            .filter(|(_, keep)| matches!(keep, Value::Boolean(true)))
            .map(|(&r, _)| r)
            .collect())
    }

    fn probe(&self, table: &mut BuildTable, batch: &ExecBatch) -> Result<Option<ExecBatch>> {
        let width = self.core.output_schema().num_fields();
        let mut out = Vec::new();
        for row in 0..batch.num_rows() {
            let matches = self.matches_for(table, batch, row)?;
            for &r in &matches {
                table.matched[r] = true;
            }
            match self.join_type {
                JoinType::LeftSemi if !matches.is_empty() => out.push(batch.row(row)),
                JoinType::LeftAnti if matches.is_empty() => out.push(batch.row(row)),
                JoinType::Inner | JoinType::LeftOuter | JoinType::RightOuter
                | JoinType::FullOuter => {
                    let left_row = batch.row(row);
                    for &r in &matches {
                        let mut joined = left_row.clone();
                        joined.extend(table.batch.row(r));
                        out.push(joined);
                    }
                    if matches.is_empty() && self.join_type.keeps_unmatched_left() {
                        let mut joined = left_row;
                        joined.resize(width, Value::Null);
                        out.push(joined);
                    }
                }
                _ => {}
            }
        }
        if out.is_empty() {
            return Ok(None);
        }
        ExecBatch::from_rows(width, out).map(Some)
    }

    // ==================== Finish ====================

    /// Build rows emitted after probing, per the join type.
    fn trailing_build_rows(&self) -> Result<Option<ExecBatch>> {
        let state = self.state.lock();
        let Some(table) = state.table.as_ref() else {
            return Ok(None);
        };
        let keep: Box<dyn Fn(bool) -> bool> = match self.join_type {
            JoinType::RightSemi => Box::new(|matched| matched),
            JoinType::RightAnti => Box::new(|matched| !matched),
            JoinType::RightOuter | JoinType::FullOuter => Box::new(|matched| !matched),
            _ => return Ok(None),
        };
        let pad = !self.join_type.outputs_right_only();
        let rows: Vec<Vec<Value>> = (0..table.batch.num_rows())
            .filter(|&r| keep(table.matched[r]))
            .map(|r| {
                if pad {
                    let mut joined = vec![Value::Null; self.left_width];
                    joined.extend(table.batch.row(r));
                    joined
                } else {
                    table.batch.row(r)
                }
            })
            .collect();
        if rows.is_empty() {
            return Ok(None);
        }
        let width = self.core.output_schema().num_fields();
        ExecBatch::from_rows(width, rows).map(Some)
    }

    fn try_finish(&self) {
        if !(self.left_done.load(Ordering::SeqCst) && self.build_done.load(Ordering::SeqCst)) {
            return;
        }
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.trailing_build_rows() {
            Ok(trailing) => {
                if let Some(batch) = trailing {
                    for chunk in batch.chunks(MAX_BATCH_SIZE) {
                        self.core.emit(chunk);
                    }
                }
                self.core.emit_finished();
                self.core.mark_finished(Ok(()));
            }
            Err(err) => {
                self.core.emit_error(err.clone());
                self.core.mark_finished(Err(err));
            }
        }
    }

    fn fail(&self, error: ExecError) {
        tracing::warn!(node = %self.label(), error = %error, "Hash join failed");
        self.left_counter.cancel();
        self.right_counter.cancel();
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.core.emit_error(error.clone());
            self.core.mark_finished(Err(error));
        }
    }
}

impl_node_debug!(HashJoinNode);

impl ExecNode for HashJoinNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind_name(&self) -> &'static str {
        "HashJoinNode"
    }

    fn start_producing(&self) -> Result<()> {
        Ok(())
    }

    fn input_received(&self, input: NodeId, batch: ExecBatch) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        if !self.is_left(input) {
            self.state.lock().build_batches.push(batch);
            if self.right_counter.increment() {
                self.build();
            }
            return;
        }
        {
            let mut state = self.state.lock();
            if state.table.is_none() {
                state.parked.push(batch);
                return;
            }
        }
        self.probe_and_count(&batch);
    }

    fn error_received(&self, _input: NodeId, error: ExecError) {
        self.fail(error);
    }

    fn input_finished(&self, input: NodeId, total_batches: usize) {
        if self.is_left(input) {
            if self.left_counter.set_total(total_batches) {
                self.left_done.store(true, Ordering::SeqCst);
                self.try_finish();
            }
        } else if self.right_counter.set_total(total_batches) {
            self.build();
        }
    }

    fn stop_producing(&self) {
        self.left_counter.cancel();
        self.right_counter.cancel();
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.core.mark_finished(Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::DataType;

    fn schema(names: &[&str]) -> Schema {
        Schema::new(
            names
                .iter()
                .map(|n| Field::new(*n, DataType::Int32))
                .collect(),
        )
    }

    #[test]
    fn test_joined_schema_suffixes_collisions() {
        let left = schema(&["id", "a"]);
        let right = schema(&["id", "b"]);
        let options = HashJoinNodeOptions::new(JoinType::Inner, vec!["id".into()], vec!["id".into()])
            .with_suffixes("_l", "_r");
        let joined = joined_schema(&left, &right, &options);
        assert_eq!(joined.field_names(), vec!["id_l", "a", "id_r", "b"]);
    }

    #[test]
    fn test_outer_join_pads_are_nullable() {
        let left = schema(&["k"]);
        let right = schema(&["v"]);
        let options =
            HashJoinNodeOptions::new(JoinType::LeftOuter, vec!["k".into()], vec!["v".into()]);
        let joined = joined_schema(&left, &right, &options);
        assert!(joined.field(1).is_nullable());
    }

    #[test]
    fn test_null_keys_never_hash() {
        let batch = ExecBatch::from_json(&[DataType::Int32, DataType::Int32], "[[null, 1], [2, 3]]")
            .unwrap();
        assert_eq!(row_key(&batch, 0, &[0]), None);
        assert_eq!(row_key(&batch, 1, &[0, 1]), Some(vec![Value::Int32(2), Value::Int32(3)]));
    }

    #[test]
    fn test_join_type_display() {
        assert_eq!(JoinType::FullOuter.to_string(), "FULL_OUTER");
        assert_eq!(JoinType::all().len(), 8);
    }
}
