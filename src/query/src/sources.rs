use common::funnel::OrderType;
use common::types::COLUMN_ACTOR_ID;
use common::types::COLUMN_CREATED_AT;
use common::types::COLUMN_EVENT;
use tracing::debug;

use crate::breakdown_col_name;
use crate::constant_col;
use crate::context::QueryContext;
use crate::expr::time_expression;
use crate::plan::expr::and;
use crate::plan::expr::col;
use crate::plan::expr::lit;
use crate::plan::expr::multi_or;
use crate::plan::expr::Expr;
use crate::plan::expr::SortOrder;
use crate::plan::select::SelectPlan;
use crate::plan::select::Source;

/// Builds the base row set: one row per candidate event, date-range and
/// entity pre-filtered. Pre-filtering only narrows the scan; every step
/// predicate re-tests membership later, so it is skipped whenever it
/// cannot be applied safely (any-event steps, strict ordering where every
/// event must stay visible).
pub fn build(ctx: &QueryContext) -> SelectPlan {
    let mut plan = SelectPlan::new(Source::Events);
    plan.columns = base_columns(ctx);

    let mut predicate = time_expression(COLUMN_CREATED_AT, ctx.from, ctx.to);
    if let Some(prefilter) = entity_prefilter(ctx) {
        predicate = and(predicate, prefilter);
    }
    if let Some(filter) = &ctx.query_filter {
        predicate = and(predicate, filter.clone());
    }
    plan.filter = Some(predicate);
    plan.order_by = vec![
        (col(COLUMN_ACTOR_ID), SortOrder::Asc),
        (col(COLUMN_CREATED_AT), SortOrder::Asc),
    ];

    let externals = external_selects(ctx);
    if externals.is_empty() {
        debug!("event source built over the event store");
        return plan;
    }

    debug!(tables = externals.len(), "event source unions external tables");
    let mut union = SelectPlan::new(Source::Union(
        std::iter::once(plan).chain(externals).collect(),
    ));
    union.order_by = vec![
        (col(COLUMN_ACTOR_ID), SortOrder::Asc),
        (col(COLUMN_CREATED_AT), SortOrder::Asc),
    ];
    union
}

fn base_columns(ctx: &QueryContext) -> Vec<Expr> {
    let mut columns = vec![
        col(COLUMN_ACTOR_ID),
        col(COLUMN_CREATED_AT),
        col(COLUMN_EVENT),
    ];
    if let Some(breakdown) = &ctx.breakdown {
        if breakdown.cohort_plans.is_empty() {
            for (idx, expr) in breakdown.exprs.iter().enumerate() {
                columns.push(expr.clone().alias(breakdown_col_name(idx)));
            }
        }
    }
    for (idx, expr) in ctx.constants.iter().enumerate() {
        columns.push(expr.clone().alias(constant_col(idx)));
    }

    columns
}

fn entity_prefilter(ctx: &QueryContext) -> Option<Expr> {
    // strict funnels must see off-path events too
    if ctx.spec.order == OrderType::Strict || ctx.has_any_event_step() {
        return None;
    }

    let mut predicates: Vec<Expr> = ctx
        .steps
        .iter()
        .filter(|s| s.external.is_none())
        .filter_map(|s| s.entity_expr.clone())
        .collect();
    predicates.extend(ctx.exclusions.iter().map(|e| e.expr.clone()));
    if predicates.is_empty() {
        return None;
    }

    Some(multi_or(predicates))
}

/// One sub-select per external-table step, shaped like the event rows so
/// the union is well-formed. The table name doubles as the event name.
fn external_selects(ctx: &QueryContext) -> Vec<SelectPlan> {
    ctx.steps
        .iter()
        .filter_map(|s| s.external.as_ref())
        .map(|table| {
            let mut plan = SelectPlan::new(Source::External(table.clone()));
            let mut columns = vec![
                col(COLUMN_ACTOR_ID),
                col(COLUMN_CREATED_AT),
                lit(table.as_str()).alias(COLUMN_EVENT),
            ];
            if let Some(breakdown) = &ctx.breakdown {
                if breakdown.cohort_plans.is_empty() {
                    for (idx, expr) in breakdown.exprs.iter().enumerate() {
                        columns.push(expr.clone().alias(breakdown_col_name(idx)));
                    }
                }
            }
            for (idx, expr) in ctx.constants.iter().enumerate() {
                columns.push(expr.clone().alias(constant_col(idx)));
            }
            plan.columns = columns;
            plan.filter = Some(time_expression(COLUMN_CREATED_AT, ctx.from, ctx.to));
            plan
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use common::funnel::OrderType;

    use super::*;
    use crate::test_util::build_ctx;
    use crate::test_util::sequential_spec;

    #[test]
    fn prefilter_covers_steps_and_exclusions() {
        let ctx = build_ctx(sequential_spec(&["signup", "activate"]));
        let plan = build(&ctx);
        assert!(plan.filter.is_some());
        match plan.source {
            Source::Events => {}
            other => panic!("expected events source, got {other:?}"),
        }
    }

    #[test]
    fn strict_order_skips_prefilter() {
        let mut spec = sequential_spec(&["signup", "activate"]);
        spec.order = OrderType::Strict;
        let ctx = build_ctx(spec);
        assert!(entity_prefilter(&ctx).is_none());
    }

    #[test]
    fn any_event_step_skips_prefilter() {
        let mut spec = sequential_spec(&["signup", "activate"]);
        spec.steps[1].entity = None;
        let ctx = build_ctx(spec);
        assert!(entity_prefilter(&ctx).is_none());
    }
}
