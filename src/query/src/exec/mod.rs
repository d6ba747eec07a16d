use arrow::array::Array;
use arrow::array::BooleanArray;
use arrow::array::Float64Array;
use arrow::array::Int64Array;
use arrow::array::StringArray;
use arrow::array::TimestampMillisecondArray;
use arrow::datatypes::DataType;
use arrow::datatypes::TimeUnit;
use arrow::record_batch::RecordBatch;

use crate::error::QueryError;
use crate::error::Result;
use crate::plan::expr::Expr;
use crate::plan::expr::Function;
use crate::plan::expr::Operator;
use crate::plan::expr::Value;

#[allow(clippy::module_inception)]
pub mod funnel;

pub use funnel::Funnel;
pub use funnel::Options;

/// The per-actor tuple the single-pass strategy produces:
/// `(stepsReached, breakdownValue, perStepTimings)` plus the timestamps
/// that anchor drill-downs. Never persisted; computed per evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorResult {
    pub actor_id: i64,
    /// Number of steps completed, `1..=max_steps`.
    pub steps: usize,
    /// Timestamp of the chain's first step, milliseconds.
    pub entry_ts: Option<i64>,
    /// Selected timestamp per chain position, milliseconds.
    pub latests: Vec<Option<i64>>,
    /// Seconds spent on the transition into each chain position;
    /// index 0 is always `None`.
    pub conversion_times: Vec<Option<i64>>,
    /// Attributed breakdown value tuple.
    pub breakdown: Option<Vec<String>>,
    pub excluded: bool,
    /// Distinct event names the actor emitted in range, sorted.
    pub events_seen: Vec<String>,
}

fn execution_err(msg: impl Into<String>) -> QueryError {
    QueryError::Execution(msg.into())
}

/// Decodes one cell of a batch into a scalar.
pub(crate) fn column_value(batch: &RecordBatch, name: &str, row: usize) -> Result<Value> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| execution_err(format!("unknown column {name}: {e}")))?;
    let arr = batch.column(idx);
    if arr.is_null(row) {
        return Ok(Value::Null);
    }

    Ok(match arr.data_type() {
        DataType::Int64 => Value::Int64(
            arr.as_any()
                .downcast_ref::<Int64Array>()
                .unwrap()
                .value(row),
        ),
        DataType::Float64 => Value::Float64(
            arr.as_any()
                .downcast_ref::<Float64Array>()
                .unwrap()
                .value(row),
        ),
        DataType::Boolean => Value::Bool(
            arr.as_any()
                .downcast_ref::<BooleanArray>()
                .unwrap()
                .value(row),
        ),
        DataType::Utf8 => Value::String(
            arr.as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .value(row)
                .to_string(),
        ),
        DataType::Timestamp(TimeUnit::Millisecond, _) => Value::TimestampMillis(
            arr.as_any()
                .downcast_ref::<TimestampMillisecondArray>()
                .unwrap()
                .value(row),
        ),
        other => return Err(execution_err(format!("unsupported column type {other:?}"))),
    })
}

fn truthy(v: &Value) -> bool {
    matches!(v, Value::Bool(true))
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Int64(n) => Some(*n),
        Value::TimestampMillis(n) => Some(*n),
        _ => None,
    }
}

fn compare(left: &Value, right: &Value, op: Operator) -> Result<Value> {
    use std::cmp::Ordering;

    if matches!(left, Value::Null) || matches!(right, Value::Null) {
        return Ok(Value::Bool(false));
    }
    let ord = match (left, right) {
        (Value::String(l), Value::String(r)) => l.cmp(r),
        (Value::Bool(l), Value::Bool(r)) => l.cmp(r),
        (Value::Float64(l), Value::Float64(r)) => l
            .partial_cmp(r)
            .unwrap_or(Ordering::Equal),
        _ => match (as_i64(left), as_i64(right)) {
            (Some(l), Some(r)) => l.cmp(&r),
            _ => {
                return Err(execution_err(format!(
                    "incomparable values {left:?} and {right:?}"
                )));
            }
        },
    };

    Ok(Value::Bool(match op {
        Operator::Eq => ord == Ordering::Equal,
        Operator::NotEq => ord != Ordering::Equal,
        Operator::Lt => ord == Ordering::Less,
        Operator::LtEq => ord != Ordering::Greater,
        Operator::Gt => ord == Ordering::Greater,
        Operator::GtEq => ord != Ordering::Less,
        other => return Err(execution_err(format!("unsupported comparison {other:?}"))),
    }))
}

/// Row-scalar interpreter over the predicate subset the engine emits:
/// columns, literals, comparisons, boolean logic, null checks, IN lists,
/// and URL normalization. Anything else belongs to the plan path.
pub(crate) fn evaluate(expr: &Expr, batch: &RecordBatch, row: usize) -> Result<Value> {
    Ok(match expr {
        Expr::Column(name) => column_value(batch, name, row)?,
        Expr::Literal(v) => v.clone(),
        Expr::Alias(inner, _) => evaluate(inner, batch, row)?,
        Expr::Not(inner) => Value::Bool(!truthy(&evaluate(inner, batch, row)?)),
        Expr::IsNull(inner) => Value::Bool(matches!(evaluate(inner, batch, row)?, Value::Null)),
        Expr::IsNotNull(inner) => {
            Value::Bool(!matches!(evaluate(inner, batch, row)?, Value::Null))
        }
        Expr::Binary { left, op, right } => match op {
            Operator::And => Value::Bool(
                truthy(&evaluate(left, batch, row)?) && truthy(&evaluate(right, batch, row)?),
            ),
            Operator::Or => Value::Bool(
                truthy(&evaluate(left, batch, row)?) || truthy(&evaluate(right, batch, row)?),
            ),
            _ => compare(
                &evaluate(left, batch, row)?,
                &evaluate(right, batch, row)?,
                *op,
            )?,
        },
        Expr::In {
            expr: probe,
            list,
            negated,
        } => {
            let value = evaluate(probe, batch, row)?;
            let mut found = false;
            for candidate in list {
                if truthy(&compare(
                    &value,
                    &evaluate(candidate, batch, row)?,
                    Operator::Eq,
                )?) {
                    found = true;
                    break;
                }
            }
            Value::Bool(found != *negated)
        }
        Expr::Call {
            fun: Function::NormalizeUrl,
            args,
        } => match evaluate(&args[0], batch, row)? {
            Value::String(s) => Value::String(normalize_url(&s)),
            other => other,
        },
        other => {
            return Err(execution_err(format!(
                "unsupported expression in row predicate: {other:?}"
            )));
        }
    })
}

pub(crate) fn evaluate_predicate(expr: &Expr, batch: &RecordBatch, row: usize) -> Result<bool> {
    Ok(truthy(&evaluate(expr, batch, row)?))
}

/// Vectorized form: one boolean per row, the way the funnel evaluator
/// consumes step and exclusion predicates.
pub(crate) fn evaluate_batch_predicate(expr: &Expr, batch: &RecordBatch) -> Result<Vec<bool>> {
    (0..batch.num_rows())
        .map(|row| evaluate_predicate(expr, batch, row))
        .collect()
}

/// Strips trailing slashes and query/fragment suffixes.
pub(crate) fn normalize_url(url: &str) -> String {
    let mut s = url;
    if let Some(idx) = s.find(['?', '#']) {
        s = &s[..idx];
    }
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() { s } else { trimmed }.to_string()
}

/// Renders a scalar the way breakdown bucketing keys it.
pub(crate) fn value_key(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Int64(n) => n.to_string(),
        Value::Float64(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::TimestampMillis(n) => n.to_string(),
        Value::IntervalSeconds(n) => n.to_string(),
        Value::Null => String::new(),
    }
}
