//! Aggregate functions and their accumulators.
//!
//! Scalar aggregates (`sum`, `count`, ...) reduce a whole stream to one row.
//! Their grouped counterparts carry a `hash_` prefix and reduce per key.

use crate::batch::{DataType, Value};
use crate::error::{ExecError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which values `count` counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CountMode {
    #[default]
    OnlyValid,
    OnlyNull,
    All,
}

impl fmt::Display for CountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CountMode::OnlyValid => "NON_NULL",
            CountMode::OnlyNull => "NULLS",
            CountMode::All => "ALL",
        })
    }
}

/// Per-function options attached to an [`Aggregate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionOptions {
    Count(CountMode),
}

impl fmt::Display for FunctionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionOptions::Count(mode) => write!(f, "{{mode={}}}", mode),
        }
    }
}

/// One aggregate column: apply `function` to field `target`, name the
/// result `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub function: String,
    #[serde(default)]
    pub options: Option<FunctionOptions>,
    pub target: String,
    pub name: String,
}

impl Aggregate {
    pub fn new(
        function: impl Into<String>,
        target: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            function: function.into(),
            options: None,
            target: target.into(),
            name: name.into(),
        }
    }

    pub fn with_options(mut self, options: FunctionOptions) -> Self {
        self.options = Some(options);
        self
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}", self.function, self.target)?;
        if let Some(options) = &self.options {
            write!(f, ", {}", options)?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Sum,
    Count,
    Min,
    Max,
    Mean,
    Product,
    Any,
    All,
}

impl AggregateKind {
    /// Resolve a function name. Grouped aggregation requires the `hash_`
    /// variants and scalar aggregation rejects them.
    pub fn parse(function: &str, grouped: bool) -> Result<Self> {
        let (base, is_hash) = match function.strip_prefix("hash_") {
            Some(base) => (base, true),
            None => (function, false),
        };
        let kind = match base {
            "sum" => AggregateKind::Sum,
            "count" => AggregateKind::Count,
            "min" => AggregateKind::Min,
            "max" => AggregateKind::Max,
            "mean" => AggregateKind::Mean,
            "product" => AggregateKind::Product,
            "any" => AggregateKind::Any,
            "all" => AggregateKind::All,
            _ => {
                return Err(ExecError::key_error(format!(
                    "No function registered with name: {}",
                    function
                )))
            }
        };
        match (grouped, is_hash) {
            (true, false) => Err(ExecError::invalid(format!(
                "The provided function ({}) is a scalar aggregate function. Since there are \
                 keys to group by, a hash aggregate function was expected (normally these \
                 start with hash_)",
                function
            ))),
            (false, true) => Err(ExecError::invalid(format!(
                "The provided function ({}) is a hash aggregate function. Since there are no \
                 keys to group by, a scalar aggregate function was expected (normally these \
                 do not start with hash_)",
                function
            ))),
            _ => Ok(kind),
        }
    }

    pub fn output_type(self, input: DataType) -> Result<DataType> {
        let unsupported = || {
            ExecError::not_implemented(format!(
                "Aggregate {:?} has no kernel for input type {}",
                self, input
            ))
        };
        match self {
            AggregateKind::Count => Ok(DataType::Int64),
            AggregateKind::Sum | AggregateKind::Product => match input {
                DataType::Float64 => Ok(DataType::Float64),
                DataType::Int32 | DataType::Int64 | DataType::Boolean | DataType::Null => {
                    Ok(DataType::Int64)
                }
                _ => Err(unsupported()),
            },
            AggregateKind::Mean => match input {
                t if t.is_numeric() || t == DataType::Null => Ok(DataType::Float64),
                _ => Err(unsupported()),
            },
            AggregateKind::Min | AggregateKind::Max => Ok(input),
            AggregateKind::Any | AggregateKind::All => match input {
                DataType::Boolean | DataType::Null => Ok(DataType::Boolean),
                _ => Err(unsupported()),
            },
        }
    }
}

/// Running state of one aggregate over one group.
#[derive(Debug, Clone)]
pub struct Accumulator {
    kind: AggregateKind,
    count_mode: CountMode,
    output_type: DataType,
    valid: i64,
    nulls: i64,
    int_acc: i64,
    float_acc: f64,
    extreme: Option<Value>,
    flag: bool,
}

impl Accumulator {
    pub fn new(kind: AggregateKind, options: Option<&FunctionOptions>, output_type: DataType) -> Self {
        let count_mode = match options {
            Some(FunctionOptions::Count(mode)) => *mode,
            None => CountMode::default(),
        };
        let (int_acc, float_acc) = match kind {
            AggregateKind::Product => (1, 1.0),
            _ => (0, 0.0),
        };
        Self {
            kind,
            count_mode,
            output_type,
            valid: 0,
            nulls: 0,
            int_acc,
            float_acc,
            extreme: None,
            flag: matches!(kind, AggregateKind::All),
        }
    }

    pub fn update(&mut self, value: &Value) {
        if value.is_null() {
            self.nulls += 1;
            return;
        }
        self.valid += 1;
        match self.kind {
            AggregateKind::Count => {}
            AggregateKind::Sum => match value {
                Value::Float64(v) => self.float_acc += v,
                Value::Boolean(b) => self.int_acc = self.int_acc.wrapping_add(i64::from(*b)),
                other => {
                    self.int_acc = self.int_acc.wrapping_add(other.as_i64().unwrap_or(0));
                    self.float_acc += other.as_f64().unwrap_or(0.0);
                }
            },
            AggregateKind::Product => match value {
                Value::Float64(v) => self.float_acc *= v,
                Value::Boolean(b) => self.int_acc = self.int_acc.wrapping_mul(i64::from(*b)),
                other => self.int_acc = self.int_acc.wrapping_mul(other.as_i64().unwrap_or(1)),
            },
            AggregateKind::Mean => self.float_acc += value.as_f64().unwrap_or(0.0),
            AggregateKind::Min | AggregateKind::Max => {
                let replace = match &self.extreme {
                    None => true,
                    Some(current) => {
                        let ord = value.total_cmp(current);
                        if self.kind == AggregateKind::Min {
                            ord.is_lt()
                        } else {
                            ord.is_gt()
                        }
                    }
                };
                if replace {
                    self.extreme = Some(value.clone());
                }
            }
            AggregateKind::Any => self.flag |= value.as_bool().unwrap_or(false),
            AggregateKind::All => self.flag &= value.as_bool().unwrap_or(true),
        }
    }

    pub fn finish(&self) -> Value {
        if self.kind == AggregateKind::Count {
            return Value::Int64(match self.count_mode {
                CountMode::OnlyValid => self.valid,
                CountMode::OnlyNull => self.nulls,
                CountMode::All => self.valid + self.nulls,
            });
        }
        if self.valid == 0 {
            return Value::Null;
        }
        match self.kind {
            AggregateKind::Sum | AggregateKind::Product => match self.output_type {
                DataType::Float64 => Value::Float64(self.float_acc),
                _ => Value::Int64(self.int_acc),
            },
            AggregateKind::Mean => Value::Float64(self.float_acc / self.valid as f64),
            AggregateKind::Min | AggregateKind::Max => self.extreme.clone().unwrap_or(Value::Null),
            AggregateKind::Any | AggregateKind::All => Value::Boolean(self.flag),
            AggregateKind::Count => Value::Null,
        }
    }
}
