use common::funnel::OrderType;
use common::funnel::StepMath;
use common::types::COLUMN_ACTOR_ID;
use common::types::COLUMN_CREATED_AT;
use common::types::COLUMN_EVENT;
use tracing::debug;

use crate::breakdown_col_name;
use crate::constant_col;
use crate::context::QueryContext;
use crate::context::ResolvedStep;
use crate::conversion_time_col;
use crate::error::Result;
use crate::exclusion_col;
use crate::latest_col;
use crate::plan::expr::and;
use crate::plan::expr::binary_expr;
use crate::plan::expr::call;
use crate::plan::expr::col;
use crate::plan::expr::if_expr;
use crate::plan::expr::is_not_null;
use crate::plan::expr::lit;
use crate::plan::expr::lit_interval_seconds;
use crate::plan::expr::lit_null;
use crate::plan::expr::multi_and;
use crate::plan::expr::window_min;
use crate::plan::expr::Expr;
use crate::plan::expr::FrameBound;
use crate::plan::expr::Function;
use crate::plan::expr::Operator;
use crate::plan::expr::SortOrder;
use crate::plan::expr::WindowFrame;
use crate::plan::select::SelectPlan;
use crate::plan::select::Source;
use crate::step_col;
use crate::COLUMN_STEPS;

mod sequential;
mod strict;
mod unordered;

pub use sequential::Sequential;
pub use strict::Strict;
pub use unordered::Unordered;

/// The three step-ordering semantics, split the way the spec's strategy
/// seam wants them. Shared construction lives in this module; strategies
/// pick frames and compose rotations.
pub trait OrderStrategy {
    fn build_step_columns(&self, ctx: &QueryContext, source: SelectPlan) -> Result<SelectPlan>;
    fn build_windowing_pass(&self, ctx: &QueryContext, inner: SelectPlan) -> Result<SelectPlan>;
    fn build_exclusion_pass(&self, ctx: &QueryContext, inner: SelectPlan) -> Result<SelectPlan>;
}

pub fn for_order(order: OrderType) -> &'static dyn OrderStrategy {
    match order {
        OrderType::Sequential => &Sequential,
        OrderType::Strict => &Strict,
        OrderType::Unordered => &Unordered,
    }
}

/// Runs the full step-matching pipeline for the spec's order type.
pub fn windowed_plan(ctx: &QueryContext, source: SelectPlan) -> Result<SelectPlan> {
    let strategy = for_order(ctx.spec.order);
    let plan = strategy.build_step_columns(ctx, source)?;
    let plan = strategy.build_windowing_pass(ctx, plan)?;
    let plan = strategy.build_exclusion_pass(ctx, plan)?;
    debug!(order = ?ctx.spec.order, "windowing pipeline built");

    Ok(plan)
}

/// How the windowed minimum frames its scan at each level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowingMode {
    /// Frame end shifts by the duplicate-step rule (`PRECEDING 0` for
    /// definitionally identical adjacent steps, `PRECEDING 1` otherwise).
    Cascading,
    /// Each step must come from the immediately adjacent row; any
    /// off-path event breaks the chain.
    Adjacent,
}

pub(crate) fn frame_for(mode: WindowingMode, steps: &[ResolvedStep], i: usize) -> WindowFrame {
    match mode {
        WindowingMode::Cascading => {
            let offset = if steps[i].same_definition(&steps[i - 1]) {
                0
            } else {
                1
            };
            WindowFrame::rows(FrameBound::UnboundedPreceding, FrameBound::Preceding(offset))
        }
        WindowingMode::Adjacent => {
            WindowFrame::rows(FrameBound::Preceding(1), FrameBound::Preceding(1))
        }
    }
}

/// Columns every wrapping level carries through unchanged.
pub(crate) fn passthrough_columns(ctx: &QueryContext) -> Vec<Expr> {
    let mut columns = vec![
        col(COLUMN_ACTOR_ID),
        col(COLUMN_CREATED_AT),
        col(COLUMN_EVENT),
    ];
    if let Some(breakdown) = &ctx.breakdown {
        if breakdown.cohort_plans.is_empty() {
            for idx in 0..breakdown.exprs.len() {
                columns.push(col(breakdown_col_name(idx)));
            }
        }
    }
    for idx in 0..ctx.constants.len() {
        columns.push(col(constant_col(idx)));
    }
    for idx in 0..ctx.exclusions.len() {
        columns.push(col(exclusion_col(idx)));
    }

    columns
}

/// The windowing partition: the actor, the holding constants, and the
/// breakdown value when attribution keys chains on it.
pub(crate) fn partition_exprs(ctx: &QueryContext) -> Vec<Expr> {
    let mut exprs = vec![col(COLUMN_ACTOR_ID)];
    for idx in 0..ctx.constants.len() {
        exprs.push(col(constant_col(idx)));
    }
    if let Some(breakdown) = &ctx.breakdown {
        if breakdown.partitions_chains() {
            for idx in 0..breakdown.exprs.len() {
                exprs.push(col(breakdown_col_name(idx)));
            }
        }
    }

    exprs
}

/// Row predicate for one step, including the first-occurrence check the
/// first-time math modes need.
pub(crate) fn step_flag(step: &ResolvedStep) -> Expr {
    let base = step.predicate();
    match step.math {
        StepMath::Total => base,
        StepMath::FirstTimeForActor => and(base, first_occurrence_check(step, false)),
        StepMath::FirstTimeForActorWithFilters => and(base, first_occurrence_check(step, true)),
    }
}

/// Correlated check that no earlier event of the same actor already
/// qualified.
fn first_occurrence_check(step: &ResolvedStep, with_filters: bool) -> Expr {
    let mut predicate = step.entity_expr.clone().unwrap_or_else(|| lit(true));
    if with_filters {
        if let Some(filter) = &step.filter_expr {
            predicate = and(predicate, filter.clone());
        }
    }
    let mut earlier = SelectPlan::new(Source::Events);
    earlier.columns = vec![lit(1i64)];
    earlier.filter = Some(multi_and(vec![
        predicate,
        binary_expr(
            col(COLUMN_ACTOR_ID),
            Operator::Eq,
            Expr::OuterColumn(COLUMN_ACTOR_ID.to_string()),
        ),
        binary_expr(
            col(COLUMN_CREATED_AT),
            Operator::Lt,
            Expr::OuterColumn(COLUMN_CREATED_AT.to_string()),
        ),
    ]));

    Expr::Exists {
        plan: Box::new(earlier),
        negated: true,
    }
}

/// Level 1: step flags and per-row `latest_i` seeds, plus exclusion flags.
pub(crate) fn build_step_columns_impl(
    ctx: &QueryContext,
    steps: &[ResolvedStep],
    source: SelectPlan,
) -> SelectPlan {
    let mut plan = source.wrap();
    let mut columns = vec![
        col(COLUMN_ACTOR_ID),
        col(COLUMN_CREATED_AT),
        col(COLUMN_EVENT),
    ];
    if let Some(breakdown) = &ctx.breakdown {
        if breakdown.cohort_plans.is_empty() {
            for idx in 0..breakdown.exprs.len() {
                columns.push(col(breakdown_col_name(idx)));
            }
        }
    }
    for idx in 0..ctx.constants.len() {
        columns.push(col(constant_col(idx)));
    }
    for (idx, exclusion) in ctx.exclusions.iter().enumerate() {
        columns.push(if_expr(exclusion.expr.clone(), lit(1i64), lit(0i64)).alias(exclusion_col(idx)));
    }
    for (i, step) in steps.iter().enumerate() {
        let flag = step_flag(step);
        columns.push(if_expr(flag.clone(), lit(1i64), lit(0i64)).alias(step_col(i)));
        columns.push(if_expr(flag, col(COLUMN_CREATED_AT), lit_null()).alias(latest_col(i)));
    }
    plan.columns = columns;

    plan
}

/// One windowing level: steps below the level pass through, steps at or
/// above it are folded into the windowed minimum of their `latest`.
pub(crate) fn build_level(
    ctx: &QueryContext,
    steps: &[ResolvedStep],
    mode: WindowingMode,
    level: usize,
    inner: SelectPlan,
) -> SelectPlan {
    let mut plan = inner.wrap();
    let mut columns = passthrough_columns(ctx);
    let partition = partition_exprs(ctx);
    let order = vec![(col(COLUMN_CREATED_AT), SortOrder::Desc)];
    for i in 0..steps.len() {
        columns.push(col(step_col(i)));
        if i + 1 < level {
            columns.push(col(latest_col(i)));
        } else {
            let frame = frame_for(mode, steps, i);
            columns.push(
                window_min(col(latest_col(i)), partition.clone(), order.clone(), frame)
                    .alias(latest_col(i)),
            );
        }
    }
    plan.columns = columns;

    plan
}

/// Effective `latest` chain: unmatched optional steps are bridged by the
/// previous effective value.
pub(crate) fn effective_latests(steps: &[ResolvedStep]) -> Vec<Expr> {
    let mut eff: Vec<Expr> = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if i == 0 {
            eff.push(col(latest_col(0)));
        } else if step.optional {
            eff.push(call(
                Function::Coalesce,
                vec![col(latest_col(i)), eff[i - 1].clone()],
            ));
        } else {
            eff.push(col(latest_col(i)));
        }
    }

    eff
}

fn chain_comparator(steps: &[ResolvedStep], j: usize) -> Operator {
    if steps[j].optional {
        Operator::LtEq
    } else if steps[j].same_definition(&steps[j - 1]) {
        // duplicate consecutive events must advance strictly
        Operator::Lt
    } else {
        Operator::LtEq
    }
}

/// Chain closure: fold `latest_*` into the reached-step count and the
/// per-transition conversion times.
pub(crate) fn build_closure(
    ctx: &QueryContext,
    steps: &[ResolvedStep],
    inner: SelectPlan,
) -> SelectPlan {
    let window_secs = ctx.window.num_seconds();
    let eff = effective_latests(steps);
    let window_bound = binary_expr(
        col(latest_col(0)),
        Operator::Plus,
        lit_interval_seconds(window_secs),
    );

    let link = |j: usize| -> Expr {
        multi_and(vec![
            is_not_null(eff[j].clone()),
            binary_expr(eff[j - 1].clone(), chain_comparator(steps, j), eff[j].clone()),
            binary_expr(eff[j].clone(), Operator::LtEq, window_bound.clone()),
        ])
    };

    // walk from the longest prefix down; the outermost branch wins, so
    // ties resolve toward the largest satisfying prefix
    let mut steps_expr = if_expr(is_not_null(col(latest_col(0))), lit(1i64), lit(0i64));
    for curr in 2..=steps.len() {
        let cond = multi_and(
            std::iter::once(is_not_null(col(latest_col(0))))
                .chain((1..curr).map(link))
                .collect(),
        );
        steps_expr = if_expr(cond, lit(curr as i64), steps_expr);
    }

    let mut plan = inner.wrap();
    let mut columns = passthrough_columns(ctx);
    for i in 0..steps.len() {
        columns.push(col(step_col(i)));
        columns.push(col(latest_col(i)));
    }
    columns.push(steps_expr.alias(COLUMN_STEPS));
    for i in 1..steps.len() {
        let gap = call(
            Function::DateDiff,
            vec![lit("second"), eff[i - 1].clone(), col(latest_col(i))],
        );
        let ct = if_expr(
            multi_and(vec![
                is_not_null(eff[i - 1].clone()),
                is_not_null(col(latest_col(i))),
                binary_expr(eff[i - 1].clone(), chain_comparator(steps, i), col(latest_col(i))),
                binary_expr(gap.clone(), Operator::LtEq, lit(window_secs)),
            ]),
            gap,
            lit_null(),
        );
        columns.push(ct.alias(conversion_time_col(i)));
    }
    plan.columns = columns;

    plan
}

/// Canonical column set a windowed (post-closure) plan exposes; later
/// passes wrap it by name.
pub fn windowed_columns(ctx: &QueryContext) -> Vec<Expr> {
    let mut columns = passthrough_columns(ctx);
    for i in 0..ctx.max_steps {
        columns.push(col(step_col(i)));
        columns.push(col(latest_col(i)));
    }
    columns.push(col(COLUMN_STEPS));
    for i in 1..ctx.max_steps {
        columns.push(col(conversion_time_col(i)));
    }

    columns
}

/// Levels 2..=maxSteps folded over the seed plan, then the closure.
pub(crate) fn build_windowing_impl(
    ctx: &QueryContext,
    steps: &[ResolvedStep],
    mode: WindowingMode,
    inner: SelectPlan,
) -> SelectPlan {
    let mut plan = inner;
    for level in 2..=steps.len() {
        plan = build_level(ctx, steps, mode, level, plan);
    }

    build_closure(ctx, steps, plan)
}
