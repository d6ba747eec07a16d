use common::types::COLUMN_ACTOR_ID;
use common::types::COLUMN_CREATED_AT;
use tracing::debug;

use crate::context::QueryContext;
use crate::exclusion_col;
use crate::latest_col;
use crate::plan::expr::binary_expr;
use crate::plan::expr::call;
use crate::plan::expr::col;
use crate::plan::expr::if_expr;
use crate::plan::expr::lit;
use crate::plan::expr::lit_interval_seconds;
use crate::plan::expr::multi_and;
use crate::plan::expr::Expr;
use crate::plan::expr::Function;
use crate::plan::expr::Operator;
use crate::plan::expr::WindowFunction;
use crate::plan::select::SelectPlan;
use crate::steps::windowed_columns;
use crate::COLUMN_STEPS;

/// Applies the declared exclusions to a windowed plan: a qualifying
/// exclusion event strictly between the latest of its boundary steps
/// (window-capped) discards the actor's progress past the range start.
/// Contributions compose additively, so stacking exclusions never
/// branches combinatorially.
pub fn apply(ctx: &QueryContext, inner: SelectPlan) -> SelectPlan {
    if ctx.exclusions.is_empty() {
        return inner;
    }
    debug!(exclusions = ctx.exclusions.len(), "exclusion pass applied");

    // stage 1: per-actor hit flags
    let mut hits = inner.wrap();
    let mut columns: Vec<Expr> = windowed_columns(ctx)
        .into_iter()
        .filter(|c| !is_exclusion_col(ctx, c))
        .collect();
    for (idx, exclusion) in ctx.exclusions.iter().enumerate() {
        let window_bound = binary_expr(
            col(latest_col(exclusion.from_step)),
            Operator::Plus,
            lit_interval_seconds(ctx.window.num_seconds()),
        );
        let upper = call(
            Function::Least,
            vec![
                call(
                    Function::Coalesce,
                    vec![col(latest_col(exclusion.to_step)), window_bound.clone()],
                ),
                window_bound,
            ],
        );
        let cond = multi_and(vec![
            binary_expr(col(exclusion_col(idx)), Operator::Eq, lit(1i64)),
            binary_expr(
                col(COLUMN_CREATED_AT),
                Operator::Gt,
                col(latest_col(exclusion.from_step)),
            ),
            binary_expr(col(COLUMN_CREATED_AT), Operator::Lt, upper),
        ]);
        let hit = Expr::Window {
            fun: WindowFunction::Max,
            args: vec![if_expr(cond, lit(1i64), lit(0i64))],
            partition_by: vec![col(COLUMN_ACTOR_ID)],
            order_by: vec![],
            frame: None,
        };
        columns.push(hit.alias(exclusion_col(idx)));
    }
    hits.columns = columns;

    // stage 2: clamp reached steps where a covering exclusion hit
    let contributions = Expr::Array(
        (0..ctx.exclusions.len())
            .map(|idx| col(exclusion_col(idx)))
            .collect(),
    );
    let any_hit = binary_expr(
        call(Function::ArraySum, vec![contributions]),
        Operator::Gt,
        lit(0i64),
    );
    let mut clamped = col(COLUMN_STEPS);
    for (idx, exclusion) in ctx.exclusions.iter().enumerate() {
        clamped = if_expr(
            binary_expr(col(exclusion_col(idx)), Operator::Gt, lit(0i64)),
            call(
                Function::Least,
                vec![clamped.clone(), lit((exclusion.from_step + 1) as i64)],
            ),
            clamped,
        );
    }

    let mut plan = hits.wrap();
    plan.columns = windowed_columns(ctx)
        .into_iter()
        .map(|c| match &c {
            Expr::Column(name) if name == COLUMN_STEPS => {
                if_expr(any_hit.clone(), clamped.clone(), col(COLUMN_STEPS)).alias(COLUMN_STEPS)
            }
            _ => c,
        })
        .collect();

    plan
}

fn is_exclusion_col(ctx: &QueryContext, expr: &Expr) -> bool {
    match expr {
        Expr::Column(name) => {
            (0..ctx.exclusions.len()).any(|idx| name == &exclusion_col(idx))
        }
        _ => false,
    }
}
