use common::funnel::Attribution;
use common::types::COLUMN_ACTOR_ID;
use common::types::COLUMN_CREATED_AT;
use common::types::COLUMN_PERSON_ID;
use common::types::OTHER_BUCKET;
use tracing::debug;

use crate::breakdown_col_name;
use crate::context::QueryContext;
use crate::plan::expr::aggregate_if;
use crate::plan::expr::and;
use crate::plan::expr::binary_expr;
use crate::plan::expr::col;
use crate::plan::expr::if_expr;
use crate::plan::expr::is_not_null;
use crate::plan::expr::lit;
use crate::plan::expr::AggregateFunction;
use crate::plan::expr::Expr;
use crate::plan::expr::Operator;
use crate::plan::expr::SortOrder;
use crate::plan::select::join;
use crate::plan::select::JoinKind;
use crate::plan::select::SelectPlan;
use crate::plan::select::Source;
use crate::step_col;
use crate::steps::windowed_columns;
use crate::COLUMN_STEPS;

/// Attaches cohort membership to a windowed plan. Property breakdowns
/// need no transformation here: their value columns ride along from the
/// event source and attribution happens at aggregation time.
pub fn apply(ctx: &QueryContext, inner: SelectPlan) -> SelectPlan {
    let breakdown = match &ctx.breakdown {
        Some(b) if !b.cohort_plans.is_empty() => b,
        _ => return inner,
    };
    debug!(cohorts = breakdown.cohort_plans.len(), "cohort breakdown joined");

    let mut membership = SelectPlan::new(Source::Union(
        breakdown.cohort_plans.iter().map(|(_, p)| p.clone()).collect(),
    ));
    membership.columns = vec![col(COLUMN_PERSON_ID), col("cohort_id")];

    let source = join(
        Source::Subquery(Box::new(inner)),
        membership,
        JoinKind::Left,
        Some(binary_expr(
            col(COLUMN_ACTOR_ID),
            Operator::Eq,
            col(COLUMN_PERSON_ID),
        )),
    );
    let mut plan = SelectPlan::new(source);
    let mut columns = windowed_columns(ctx);
    columns.push(col("cohort_id").alias(breakdown_col_name(0)));
    plan.columns = columns;

    plan
}

/// Whether downstream aggregation groups actors by the raw value instead
/// of attributing a single value per actor.
pub fn groups_by_value(ctx: &QueryContext) -> bool {
    match &ctx.breakdown {
        Some(b) => {
            !b.cohort_plans.is_empty() || b.raw_per_event || b.attribution == Attribution::AllEvents
        }
        None => false,
    }
}

/// Per-actor attribution aggregates, one per breakdown property. `None`
/// when the mode groups by the raw value instead.
pub fn attribution_exprs(ctx: &QueryContext) -> Option<Vec<Expr>> {
    let breakdown = ctx.breakdown.as_ref()?;
    if groups_by_value(ctx) {
        return None;
    }

    let exprs = (0..breakdown.exprs.len())
        .map(|idx| {
            let value = col(breakdown_col_name(idx));
            let non_empty = and(
                is_not_null(value.clone()),
                binary_expr(value.clone(), Operator::NotEq, lit("")),
            );
            match &breakdown.attribution {
                Attribution::FirstTouch => aggregate_if(
                    AggregateFunction::ArgMin,
                    vec![value, col(COLUMN_CREATED_AT)],
                    non_empty,
                ),
                Attribution::LastTouch => aggregate_if(
                    AggregateFunction::ArgMax,
                    vec![value, col(COLUMN_CREATED_AT)],
                    non_empty,
                ),
                Attribution::Step(n) => aggregate_if(
                    AggregateFunction::ArgMin,
                    vec![value, col(COLUMN_CREATED_AT)],
                    binary_expr(col(step_col(*n)), Operator::Eq, lit(1i64)),
                ),
                // handled by groups_by_value above
                Attribution::AllEvents => unreachable!(),
            }
            .alias(breakdown_col_name(idx))
        })
        .collect();

    Some(exprs)
}

/// Sub-plan computing the top buckets by from-step reach, used to fence
/// the "Other" collapse.
pub fn top_values_plan(ctx: &QueryContext, windowed: &SelectPlan, limit: usize) -> SelectPlan {
    let breakdown = ctx.breakdown.as_ref().expect("breakdown required");
    let mut plan = windowed.clone().wrap();
    let value_cols: Vec<Expr> = (0..breakdown.exprs.len())
        .map(|idx| col(breakdown_col_name(idx)))
        .collect();
    plan.columns = value_cols.clone();
    plan.group_by = value_cols.clone();
    // rank by distinct actors reaching the from-step
    let reach = Expr::Aggregate {
        fun: AggregateFunction::Count,
        args: vec![col(COLUMN_ACTOR_ID)],
        predicate: Some(Box::new(binary_expr(
            col(COLUMN_STEPS),
            Operator::GtEq,
            lit((ctx.from_step + 1) as i64),
        ))),
        distinct: true,
    };
    let mut order: Vec<(Expr, SortOrder)> = vec![(reach, SortOrder::Desc)];
    order.extend(value_cols.into_iter().map(|c| (c, SortOrder::Asc)));
    plan.order_by = order;
    plan.limit = Some(limit);

    plan
}

/// Breakdown value projections with overflow buckets collapsed into
/// "Other" via membership in the top-values sub-plan.
pub fn collapsed_value_exprs(ctx: &QueryContext, windowed: &SelectPlan) -> Vec<Expr> {
    let breakdown = match &ctx.breakdown {
        Some(b) => b,
        None => return vec![],
    };
    let value_cols: Vec<Expr> = (0..breakdown.exprs.len())
        .map(|idx| col(breakdown_col_name(idx)))
        .collect();
    let limit = match breakdown.spec.limit {
        Some(l) => l,
        None => {
            return value_cols
                .into_iter()
                .enumerate()
                .map(|(idx, c)| c.alias(breakdown_col_name(idx)))
                .collect();
        }
    };

    let top = top_values_plan(ctx, windowed, limit);
    let probe = if value_cols.len() == 1 {
        value_cols[0].clone()
    } else {
        Expr::Array(value_cols.clone())
    };
    let in_top = Expr::InSubquery {
        expr: Box::new(probe),
        plan: Box::new(top),
        negated: false,
    };
    value_cols
        .into_iter()
        .enumerate()
        .map(|(idx, c)| if_expr(in_top.clone(), c, lit(OTHER_BUCKET)).alias(breakdown_col_name(idx)))
        .collect()
}

/// Collapses ranked buckets beyond `limit` into a single "Other" bucket.
/// Ranking is by count descending, ties broken by value ascending, so the
/// result is deterministic.
pub fn collapse_other(
    mut buckets: Vec<(Vec<String>, i64)>,
    limit: Option<usize>,
) -> Vec<(Vec<String>, i64)> {
    buckets.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let limit = match limit {
        Some(l) if l < buckets.len() => l,
        _ => return buckets,
    };

    let arity = buckets.first().map(|(k, _)| k.len()).unwrap_or(1);
    let overflow: i64 = buckets[limit..].iter().map(|(_, c)| c).sum();
    buckets.truncate(limit);
    buckets.push((vec![OTHER_BUCKET.to_string(); arity], overflow));

    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: &str) -> Vec<String> {
        vec![v.to_string()]
    }

    #[test]
    fn collapses_overflow_into_other() {
        let buckets = vec![
            (key("a"), 50),
            (key("b"), 40),
            (key("c"), 30),
            (key("d"), 20),
            (key("e"), 10),
        ];
        let collapsed = collapse_other(buckets, Some(2));
        assert_eq!(collapsed, vec![
            (key("a"), 50),
            (key("b"), 40),
            (key(OTHER_BUCKET), 60),
        ]);
    }

    #[test]
    fn no_limit_only_ranks() {
        let buckets = vec![(key("b"), 10), (key("a"), 10), (key("c"), 20)];
        let collapsed = collapse_other(buckets, None);
        assert_eq!(collapsed, vec![(key("c"), 20), (key("a"), 10), (key("b"), 10)]);
    }

    #[test]
    fn limit_larger_than_buckets_is_noop() {
        let buckets = vec![(key("a"), 5), (key("b"), 3)];
        let collapsed = collapse_other(buckets.clone(), Some(10));
        assert_eq!(collapsed, buckets);
    }
}
