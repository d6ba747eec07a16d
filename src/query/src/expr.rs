use chrono::DateTime;
use chrono::Utc;
use common::query::PropValue;
use common::query::PropValueFilter;
use common::query::PropValueOperation;
use common::query::PropertyRef;
use common::types::COLUMN_EVENT;

use crate::error::Result;
use crate::plan::expr::and;
use crate::plan::expr::binary_expr;
use crate::plan::expr::call;
use crate::plan::expr::col;
use crate::plan::expr::is_not_null;
use crate::plan::expr::is_null;
use crate::plan::expr::lit;
use crate::plan::expr::lit_timestamp;
use crate::plan::expr::multi_and;
use crate::plan::expr::Expr;
use crate::plan::expr::Function;
use crate::plan::expr::Operator;
use crate::plan::expr::Value;
use crate::provider::PropertyRepository;

/// builds expression on timestamp
pub fn time_expression(ts_col: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Expr {
    let from_expr = binary_expr(col(ts_col), Operator::GtEq, lit_timestamp(from));
    let to_expr = binary_expr(col(ts_col), Operator::LtEq, lit_timestamp(to));

    and(from_expr, to_expr)
}

/// builds expression matching any of the given event names
pub fn events_expression(events: &[String]) -> Expr {
    if events.len() == 1 {
        binary_expr(col(COLUMN_EVENT), Operator::Eq, lit(events[0].as_str()))
    } else {
        Expr::In {
            expr: Box::new(col(COLUMN_EVENT)),
            list: events.iter().map(|e| lit(e.as_str())).collect(),
            negated: false,
        }
    }
}

pub fn property_col(props: &dyn PropertyRepository, prop: &PropertyRef) -> Result<Expr> {
    Ok(col(props.column_name(prop)?))
}

fn lit_prop_value(v: &PropValue) -> Expr {
    match v {
        PropValue::String(s) => lit(s.as_str()),
        PropValue::Int64(i) => lit(*i),
        PropValue::Bool(b) => lit(*b),
        PropValue::Null => Expr::Literal(Value::Null),
    }
}

fn named_property_expression(
    prop_col: Expr,
    operation: &PropValueOperation,
    values: &Option<Vec<PropValue>>,
) -> Expr {
    match operation {
        PropValueOperation::True => binary_expr(prop_col, Operator::Eq, lit(true)),
        PropValueOperation::False => binary_expr(prop_col, Operator::Eq, lit(false)),
        PropValueOperation::Exists => is_not_null(prop_col),
        PropValueOperation::Empty => is_null(prop_col),
        _ => {
            let values = values.as_deref().unwrap_or(&[]);
            let op = match operation {
                PropValueOperation::Eq => Operator::Eq,
                PropValueOperation::Neq => Operator::NotEq,
                PropValueOperation::Gt => Operator::Gt,
                PropValueOperation::Gte => Operator::GtEq,
                PropValueOperation::Lt => Operator::Lt,
                PropValueOperation::Lte => Operator::LtEq,
                PropValueOperation::Like => Operator::Like,
                PropValueOperation::NotLike => Operator::NotLike,
                PropValueOperation::Regex => Operator::RegexMatch,
                PropValueOperation::NotRegex => Operator::RegexNotMatch,
                _ => unreachable!(),
            };

            // multi-value equality collapses to an IN list
            if values.len() > 1 && matches!(op, Operator::Eq | Operator::NotEq) {
                return Expr::In {
                    expr: Box::new(prop_col),
                    list: values.iter().map(lit_prop_value).collect(),
                    negated: op == Operator::NotEq,
                };
            }

            match values.first() {
                Some(v) => binary_expr(prop_col, op, lit_prop_value(v)),
                None => is_not_null(prop_col),
            }
        }
    }
}

/// builds the AND of a filter list's property predicates
pub fn property_filters_expression(
    props: &dyn PropertyRepository,
    filters: &[PropValueFilter],
) -> Result<Expr> {
    let exprs = filters
        .iter()
        .map(|filter| {
            let prop_col = property_col(props, &filter.property)?;
            Ok(named_property_expression(
                prop_col,
                &filter.operation,
                &filter.value,
            ))
        })
        .collect::<Result<Vec<Expr>>>()?;

    Ok(multi_and(exprs))
}

/// breakdown property column, URL-normalized when requested
pub fn breakdown_col(
    props: &dyn PropertyRepository,
    prop: &PropertyRef,
    normalize_url: bool,
) -> Result<Expr> {
    let expr = property_col(props, prop)?;
    Ok(if normalize_url {
        call(Function::NormalizeUrl, vec![expr])
    } else {
        expr
    })
}

#[cfg(test)]
mod tests {
    use common::query::PropValue;
    use common::query::PropValueFilter;
    use common::query::PropValueOperation;
    use common::query::PropertyRef;

    use super::*;
    use crate::test_util::PassthroughProperties;

    #[test]
    fn multi_value_eq_becomes_in_list() {
        let props = PassthroughProperties;
        let filters = vec![PropValueFilter {
            property: PropertyRef::Event("plan".to_string()),
            operation: PropValueOperation::Eq,
            value: Some(vec![
                PropValue::String("free".to_string()),
                PropValue::String("paid".to_string()),
            ]),
        }];
        let expr = property_filters_expression(&props, &filters).unwrap();
        match expr {
            Expr::In { negated, list, .. } => {
                assert!(!negated);
                assert_eq!(list.len(), 2);
            }
            other => panic!("expected IN list, got {other:?}"),
        }
    }

    #[test]
    fn exists_is_null_check() {
        let props = PassthroughProperties;
        let filters = vec![PropValueFilter {
            property: PropertyRef::Event("plan".to_string()),
            operation: PropValueOperation::Exists,
            value: None,
        }];
        let expr = property_filters_expression(&props, &filters).unwrap();
        assert_eq!(expr, is_not_null(col("plan")));
    }
}
