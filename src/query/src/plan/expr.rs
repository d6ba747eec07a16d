use chrono::DateTime;
use chrono::Utc;

use crate::plan::select::SelectPlan;

/// Scalar literal carried by an expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    TimestampMillis(i64),
    IntervalSeconds(i64),
    Null,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int64(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    And,
    Or,
    Like,
    NotLike,
    RegexMatch,
    RegexNotMatch,
}

/// Scalar functions the compiler emits. Typed constructors only: no
/// query fragment is ever assembled from strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    If,
    Coalesce,
    Least,
    Greatest,
    Ceil,
    Cbrt,
    IntDiv,
    /// Difference of two timestamps, in seconds.
    DateDiff,
    ToStartOfInterval,
    ArraySum,
    /// Strips trailing slashes and query fragments from URL-ish values.
    NormalizeUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Min,
    Max,
    Sum,
    Avg,
    ArgMin,
    ArgMax,
    GroupArray,
    GroupUniqArray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunction {
    Min,
    Max,
    Sum,
    RowNumber,
    Lag,
    Lead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBound {
    CurrentRow,
    Preceding(u32),
    Following(u32),
    UnboundedPreceding,
    UnboundedFollowing,
}

/// A `ROWS BETWEEN start AND end` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFrame {
    pub start: FrameBound,
    pub end: FrameBound,
}

impl WindowFrame {
    pub fn rows(start: FrameBound, end: FrameBound) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Value),
    Alias(Box<Expr>, String),
    Binary {
        left: Box<Expr>,
        op: Operator,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    Call {
        fun: Function,
        args: Vec<Expr>,
    },
    Aggregate {
        fun: AggregateFunction,
        args: Vec<Expr>,
        /// Conditional aggregation (`countIf`-family) when present.
        predicate: Option<Box<Expr>>,
        distinct: bool,
    },
    Window {
        fun: WindowFunction,
        args: Vec<Expr>,
        partition_by: Vec<Expr>,
        order_by: Vec<(Expr, SortOrder)>,
        frame: Option<WindowFrame>,
    },
    Array(Vec<Expr>),
    /// Reference to a column of the enclosing select, inside a correlated
    /// subquery.
    OuterColumn(String),
    /// A single-value subquery usable wherever a scalar is.
    ScalarSubquery(Box<SelectPlan>),
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expr>,
        plan: Box<SelectPlan>,
        negated: bool,
    },
    Exists {
        plan: Box<SelectPlan>,
        negated: bool,
    },
}

impl Expr {
    pub fn alias(self, name: impl Into<String>) -> Expr {
        Expr::Alias(Box::new(self), name.into())
    }

    /// Unwraps aliases down to the underlying expression.
    pub fn unaliased(&self) -> &Expr {
        match self {
            Expr::Alias(inner, _) => inner.unaliased(),
            other => other,
        }
    }
}

pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

pub fn lit(v: impl Into<Value>) -> Expr {
    Expr::Literal(v.into())
}

pub fn lit_null() -> Expr {
    Expr::Literal(Value::Null)
}

pub fn lit_timestamp(dt: DateTime<Utc>) -> Expr {
    Expr::Literal(Value::TimestampMillis(dt.timestamp_millis()))
}

pub fn lit_interval_seconds(secs: i64) -> Expr {
    Expr::Literal(Value::IntervalSeconds(secs))
}

pub fn binary_expr(left: Expr, op: Operator, right: Expr) -> Expr {
    Expr::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

pub fn and(left: Expr, right: Expr) -> Expr {
    binary_expr(left, Operator::And, right)
}

pub fn or(left: Expr, right: Expr) -> Expr {
    binary_expr(left, Operator::Or, right)
}

pub fn not(expr: Expr) -> Expr {
    Expr::Not(Box::new(expr))
}

pub fn is_null(expr: Expr) -> Expr {
    Expr::IsNull(Box::new(expr))
}

pub fn is_not_null(expr: Expr) -> Expr {
    Expr::IsNotNull(Box::new(expr))
}

pub fn multi_or(exprs: Vec<Expr>) -> Expr {
    debug_assert!(!exprs.is_empty());
    let mut iter = exprs.into_iter();
    let mut expr = iter.next().unwrap();
    for e in iter {
        expr = or(expr, e);
    }

    expr
}

pub fn multi_and(exprs: Vec<Expr>) -> Expr {
    debug_assert!(!exprs.is_empty());
    let mut iter = exprs.into_iter();
    let mut expr = iter.next().unwrap();
    for e in iter {
        expr = and(expr, e);
    }

    expr
}

pub fn if_expr(cond: Expr, then: Expr, otherwise: Expr) -> Expr {
    Expr::Call {
        fun: Function::If,
        args: vec![cond, then, otherwise],
    }
}

pub fn call(fun: Function, args: Vec<Expr>) -> Expr {
    Expr::Call { fun, args }
}

pub fn aggregate(fun: AggregateFunction, args: Vec<Expr>) -> Expr {
    Expr::Aggregate {
        fun,
        args,
        predicate: None,
        distinct: false,
    }
}

/// `countIf`/`minIf`-style conditional aggregate.
pub fn aggregate_if(fun: AggregateFunction, args: Vec<Expr>, predicate: Expr) -> Expr {
    Expr::Aggregate {
        fun,
        args,
        predicate: Some(Box::new(predicate)),
        distinct: false,
    }
}

/// Windowed minimum over a partition, the workhorse of the cascading
/// windowing pass.
pub fn window_min(
    arg: Expr,
    partition_by: Vec<Expr>,
    order_by: Vec<(Expr, SortOrder)>,
    frame: WindowFrame,
) -> Expr {
    Expr::Window {
        fun: WindowFunction::Min,
        args: vec![arg],
        partition_by,
        order_by,
        frame: Some(frame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_and_folds_left() {
        let e = multi_and(vec![col("a"), col("b"), col("c")]);
        assert_eq!(e, and(and(col("a"), col("b")), col("c")));
    }

    #[test]
    fn multi_or_single_passthrough() {
        assert_eq!(multi_or(vec![col("a")]), col("a"));
    }

    #[test]
    fn alias_unwrap() {
        let e = col("x").alias("y");
        assert_eq!(e.unaliased(), &col("x"));
    }
}
