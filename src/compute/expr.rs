//! Scalar expressions evaluated row by row against a batch.
//!
//! Expressions are bound against a schema once at node construction
//! ([`Expression::output_type`]) and then evaluated per batch.

use crate::batch::{Column, DataType, ExecBatch, Schema, Value};
use crate::error::{ExecError, Result};
use std::cmp::Ordering;
use std::fmt;

/// A field reference, a literal, or a named function call.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    FieldRef(String),
    Literal(Value),
    Call {
        function: String,
        args: Vec<Expression>,
    },
}

pub fn field_ref(name: impl Into<String>) -> Expression {
    Expression::FieldRef(name.into())
}

pub fn literal(value: impl Into<Value>) -> Expression {
    Expression::Literal(value.into())
}

pub fn call(function: impl Into<String>, args: Vec<Expression>) -> Expression {
    Expression::Call {
        function: function.into(),
        args,
    }
}

pub fn equal(lhs: Expression, rhs: Expression) -> Expression {
    call("equal", vec![lhs, rhs])
}

pub fn not_equal(lhs: Expression, rhs: Expression) -> Expression {
    call("not_equal", vec![lhs, rhs])
}

pub fn less(lhs: Expression, rhs: Expression) -> Expression {
    call("less", vec![lhs, rhs])
}

pub fn less_equal(lhs: Expression, rhs: Expression) -> Expression {
    call("less_equal", vec![lhs, rhs])
}

pub fn greater(lhs: Expression, rhs: Expression) -> Expression {
    call("greater", vec![lhs, rhs])
}

pub fn greater_equal(lhs: Expression, rhs: Expression) -> Expression {
    call("greater_equal", vec![lhs, rhs])
}

pub fn and_(lhs: Expression, rhs: Expression) -> Expression {
    call("and", vec![lhs, rhs])
}

pub fn or_(lhs: Expression, rhs: Expression) -> Expression {
    call("or", vec![lhs, rhs])
}

pub fn not_(operand: Expression) -> Expression {
    call("invert", vec![operand])
}

pub fn is_null(operand: Expression) -> Expression {
    call("is_null", vec![operand])
}

pub fn is_valid(operand: Expression) -> Expression {
    call("is_valid", vec![operand])
}

fn comparison_symbol(function: &str) -> Option<&'static str> {
    match function {
        "equal" => Some("=="),
        "not_equal" => Some("!="),
        "less" => Some("<"),
        "less_equal" => Some("<="),
        "greater" => Some(">"),
        "greater_equal" => Some(">="),
        _ => None,
    }
}

fn arithmetic_type(function: &str, lhs: DataType, rhs: DataType) -> Result<DataType> {
    match (lhs, rhs) {
        (DataType::Null, other) | (other, DataType::Null) if other.is_numeric() => Ok(other),
        (DataType::Float64, r) if r.is_numeric() => Ok(DataType::Float64),
        (l, DataType::Float64) if l.is_numeric() => Ok(DataType::Float64),
        (DataType::Int64, r) if r.is_integer() => Ok(DataType::Int64),
        (l, DataType::Int64) if l.is_integer() => Ok(DataType::Int64),
        (DataType::Int32, DataType::Int32) => Ok(DataType::Int32),
        _ => Err(ExecError::not_implemented(format!(
            "Function '{}' has no kernel matching input types ({}, {})",
            function, lhs, rhs
        ))),
    }
}

fn comparable(lhs: DataType, rhs: DataType) -> bool {
    lhs == rhs
        || lhs == DataType::Null
        || rhs == DataType::Null
        || (lhs.is_numeric() && rhs.is_numeric())
}

impl Expression {
    /// Names of every field this expression reads.
    pub fn field_refs(&self) -> Vec<&str> {
        match self {
            Expression::FieldRef(name) => vec![name.as_str()],
            Expression::Literal(_) => Vec::new(),
            Expression::Call { args, .. } => args.iter().flat_map(|a| a.field_refs()).collect(),
        }
    }

    /// Type this expression produces against `schema`, failing if it does
    /// not bind.
    pub fn output_type(&self, schema: &Schema) -> Result<DataType> {
        match self {
            Expression::FieldRef(name) => Ok(schema.field(schema.resolve(name)?).data_type()),
            Expression::Literal(value) => Ok(value.data_type().unwrap_or(DataType::Null)),
            Expression::Call { function, args } => {
                let types = args
                    .iter()
                    .map(|a| a.output_type(schema))
                    .collect::<Result<Vec<_>>>()?;
                call_output_type(function, &types)
            }
        }
    }

    /// Evaluate against every row of `batch`.
    pub fn evaluate(&self, schema: &Schema, batch: &ExecBatch) -> Result<Column> {
        match self {
            Expression::FieldRef(name) => Ok(batch.column(schema.resolve(name)?).clone()),
            Expression::Literal(value) => Ok(vec![value.clone(); batch.num_rows()].into()),
            Expression::Call { function, args } => {
                let types = args
                    .iter()
                    .map(|a| a.output_type(schema))
                    .collect::<Result<Vec<_>>>()?;
                let out_type = call_output_type(function, &types)?;
                let columns = args
                    .iter()
                    .map(|a| a.evaluate(schema, batch))
                    .collect::<Result<Vec<_>>>()?;
                let mut out = Vec::with_capacity(batch.num_rows());
                let mut row_args = Vec::with_capacity(columns.len());
                for row in 0..batch.num_rows() {
                    row_args.clear();
                    row_args.extend(columns.iter().map(|c| &c[row]));
                    out.push(apply(function, &row_args, out_type)?);
                }
                Ok(out.into())
            }
        }
    }
}

fn call_output_type(function: &str, types: &[DataType]) -> Result<DataType> {
    let arity = |n: usize| -> Result<()> {
        if types.len() == n {
            Ok(())
        } else {
            Err(ExecError::invalid(format!(
                "Function '{}' accepts {} arguments but {} passed",
                function,
                n,
                types.len()
            )))
        }
    };
    match function {
        f if comparison_symbol(f).is_some() => {
            arity(2)?;
            if !comparable(types[0], types[1]) {
                return Err(ExecError::not_implemented(format!(
                    "Function '{}' has no kernel matching input types ({}, {})",
                    function, types[0], types[1]
                )));
            }
            Ok(DataType::Boolean)
        }
        "and" | "or" => {
            arity(2)?;
            for ty in types {
                if !matches!(ty, DataType::Boolean | DataType::Null) {
                    return Err(ExecError::type_error(format!(
                        "Function '{}' expects boolean arguments, got {}",
                        function, ty
                    )));
                }
            }
            Ok(DataType::Boolean)
        }
        "invert" => {
            arity(1)?;
            if !matches!(types[0], DataType::Boolean | DataType::Null) {
                return Err(ExecError::type_error(format!(
                    "Function 'invert' expects a boolean argument, got {}",
                    types[0]
                )));
            }
            Ok(DataType::Boolean)
        }
        "is_null" | "is_valid" => {
            arity(1)?;
            Ok(DataType::Boolean)
        }
        "add" | "subtract" | "multiply" => {
            arity(2)?;
            arithmetic_type(function, types[0], types[1])
        }
        _ => Err(ExecError::key_error(format!(
            "No function registered with name: {}",
            function
        ))),
    }
}

fn apply(function: &str, args: &[&Value], out_type: DataType) -> Result<Value> {
    match function {
        "is_null" => return Ok(Value::Boolean(args[0].is_null())),
        "is_valid" => return Ok(Value::Boolean(!args[0].is_null())),
        _ => {}
    }
    if args.iter().any(|a| a.is_null()) {
        return Ok(Value::Null);
    }
    match function {
        f if comparison_symbol(f).is_some() => {
            let ord = args[0].total_cmp(args[1]);
            let result = match f {
                "equal" => ord == Ordering::Equal,
                "not_equal" => ord != Ordering::Equal,
                "less" => ord == Ordering::Less,
                "less_equal" => ord != Ordering::Greater,
                "greater" => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            Ok(Value::Boolean(result))
        }
        "and" | "or" | "invert" => {
            let bools = args
                .iter()
                .map(|a| {
                    a.as_bool()
                        .ok_or_else(|| ExecError::type_error(format!("Expected boolean, got {}", a)))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Boolean(match function {
                "and" => bools[0] && bools[1],
                "or" => bools[0] || bools[1],
                _ => !bools[0],
            }))
        }
        "add" | "subtract" | "multiply" => {
            let lhs = args[0].cast(out_type)?;
            let rhs = args[1].cast(out_type)?;
            arithmetic(function, &lhs, &rhs)
        }
        _ => Err(ExecError::key_error(format!(
            "No function registered with name: {}",
            function
        ))),
    }
}

fn arithmetic(function: &str, lhs: &Value, rhs: &Value) -> Result<Value> {
    Ok(match (lhs, rhs) {
        (Value::Int32(a), Value::Int32(b)) => Value::Int32(match function {
            "add" => a.wrapping_add(*b),
            "subtract" => a.wrapping_sub(*b),
            _ => a.wrapping_mul(*b),
        }),
        (Value::Int64(a), Value::Int64(b)) => Value::Int64(match function {
            "add" => a.wrapping_add(*b),
            "subtract" => a.wrapping_sub(*b),
            _ => a.wrapping_mul(*b),
        }),
        (Value::Float64(a), Value::Float64(b)) => Value::Float64(match function {
            "add" => a + b,
            "subtract" => a - b,
            _ => a * b,
        }),
        (a, b) => {
            return Err(ExecError::type_error(format!(
                "Function '{}' cannot combine {} and {}",
                function, a, b
            )))
        }
    })
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::FieldRef(name) => f.write_str(name),
            Expression::Literal(value) => write!(f, "{}", value),
            Expression::Call { function, args } => {
                if let (Some(op), [lhs, rhs]) = (comparison_symbol(function), args.as_slice()) {
                    return write!(f, "({} {} {})", lhs, op, rhs);
                }
                if let ("and" | "or", [lhs, rhs]) = (function.as_str(), args.as_slice()) {
                    return write!(f, "({} {} {})", lhs, function, rhs);
                }
                write!(f, "{}(", function)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
        }
    }
}
