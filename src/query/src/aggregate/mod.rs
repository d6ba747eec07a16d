use common::funnel::VizMode;
use common::types::COLUMN_ACTOR_ID;

use crate::breakdown;
use crate::breakdown_col_name;
use crate::context::QueryContext;
use crate::conversion_time_col;
use crate::error::Result;
use crate::latest_col;
use crate::plan::expr::aggregate;
use crate::plan::expr::aggregate_if;
use crate::plan::expr::binary_expr;
use crate::plan::expr::col;
use crate::plan::expr::is_not_null;
use crate::plan::expr::lit;
use crate::plan::expr::AggregateFunction;
use crate::plan::expr::Operator;
use crate::plan::select::SelectPlan;
use crate::COLUMN_STEPS;

pub mod correlation;
pub mod steps;
pub mod time_to_convert;
pub mod trends;

/// Dispatches the windowed plan to the aggregation strategy the viz mode
/// asks for.
pub fn build(ctx: &QueryContext, windowed: SelectPlan) -> Result<SelectPlan> {
    match ctx.spec.viz {
        VizMode::Steps => Ok(steps::build(ctx, windowed)),
        VizMode::Trends => Ok(trends::build(ctx, windowed)),
        VizMode::TimeToConvert => Ok(time_to_convert::build(ctx, windowed)),
    }
}

/// Per-actor roll-up over the windowed rows: the reached-step maximum,
/// the tightest conversion times, the entry timestamp, and the attributed
/// breakdown value. Array-join attribution modes group by the raw value,
/// so one actor may yield one row per distinct value.
pub(crate) fn per_actor_plan(ctx: &QueryContext, windowed: SelectPlan) -> SelectPlan {
    let mut plan = windowed.wrap();
    plan.filter = Some(binary_expr(col(COLUMN_STEPS), Operator::GtEq, lit(1i64)));

    let mut columns = vec![col(COLUMN_ACTOR_ID)];
    let mut group_by = vec![col(COLUMN_ACTOR_ID)];
    if ctx.breakdown.is_some() {
        if breakdown::groups_by_value(ctx) {
            for idx in 0..breakdown_arity(ctx) {
                columns.push(col(breakdown_col_name(idx)));
                group_by.push(col(breakdown_col_name(idx)));
            }
        } else if let Some(exprs) = breakdown::attribution_exprs(ctx) {
            columns.extend(exprs);
        }
    }
    columns.push(aggregate(AggregateFunction::Max, vec![col(COLUMN_STEPS)]).alias(COLUMN_STEPS));
    columns.push(aggregate(AggregateFunction::Min, vec![col(latest_col(0))]).alias(latest_col(0)));
    for i in 1..ctx.max_steps {
        let ct = col(conversion_time_col(i));
        columns.push(
            aggregate_if(AggregateFunction::Min, vec![ct.clone()], is_not_null(ct))
                .alias(conversion_time_col(i)),
        );
    }
    plan.columns = columns;
    plan.group_by = group_by;

    plan
}

pub(crate) fn breakdown_arity(ctx: &QueryContext) -> usize {
    ctx.breakdown.as_ref().map(|b| b.exprs.len().max(1)).unwrap_or(0)
}

/// Shared result shapes. Both execution strategies produce these: the
/// cascading plan after execution by the caller's engine, the single-pass
/// strategy directly.
#[derive(Debug, Clone, PartialEq)]
pub struct StepsBucket {
    pub breakdown: Option<Vec<String>>,
    /// `total[i]`: actors who reached at least step `i`.
    pub total: Vec<i64>,
    /// `exact[i]`: actors whose furthest step was exactly `i`.
    pub exact: Vec<i64>,
    /// Mean seconds spent on the transition into step `i`.
    pub avg_time_to_convert: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepsResult {
    /// Actor-deduplicated totals across every bucket.
    pub totals: StepsBucket,
    pub buckets: Vec<StepsBucket>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendsRow {
    pub period: chrono::DateTime<chrono::Utc>,
    pub breakdown: Option<Vec<String>>,
    pub reached_from: i64,
    pub reached_to: i64,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendsResult {
    pub rows: Vec<TrendsRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TtcBin {
    /// Inclusive lower bound of the bin, in seconds.
    pub lower: i64,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TtcResult {
    pub bin_width: i64,
    /// Dense over `[0, bin_count]`: always `bin_count + 1` entries.
    pub bins: Vec<TtcBin>,
    pub sample_count: usize,
    pub average_seconds: Option<f64>,
}
