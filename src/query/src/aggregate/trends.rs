use std::collections::HashMap;

use ahash::RandomState;
use chrono::DateTime;
use chrono::Utc;
use chrono::Weekday;
use common::query::TimeIntervalUnit;
use common::types::COLUMN_ACTOR_ID;
use indexmap::IndexSet;

use crate::aggregate::TrendsResult;
use crate::aggregate::TrendsRow;
use crate::breakdown;
use crate::breakdown_col_name;
use crate::context::QueryContext;
use crate::error::Result;
use crate::exec::ActorResult;
use crate::latest_col;
use crate::plan::expr::aggregate_if;
use crate::plan::expr::binary_expr;
use crate::plan::expr::call;
use crate::plan::expr::col;
use crate::plan::expr::if_expr;
use crate::plan::expr::lit;
use crate::plan::expr::lit_interval_seconds;
use crate::plan::expr::lit_timestamp;
use crate::plan::expr::AggregateFunction;
use crate::plan::expr::Expr;
use crate::plan::expr::Function;
use crate::plan::expr::Operator;
use crate::plan::select::join;
use crate::plan::select::JoinKind;
use crate::plan::select::SelectPlan;
use crate::plan::select::Source;
use crate::COLUMN_ENTRY_PERIOD;
use crate::COLUMN_STEPS;

/// Conversion-over-time aggregation: actors bucketed by the calendar
/// period of their entry, with a fill sub-plan guaranteeing every period
/// in range appears even with zero actors.
pub fn build(ctx: &QueryContext, windowed: SelectPlan) -> SelectPlan {
    let unit = ctx.interval();
    let week_start = ctx.ctx.week_start;
    let period = call(
        Function::ToStartOfInterval,
        vec![
            col(latest_col(0)),
            lit(unit.as_str()),
            lit(week_start.num_days_from_monday() as i64),
        ],
    );

    // stage 1: one row per actor per entry period
    let mut per_actor = windowed.wrap();
    per_actor.filter = Some(binary_expr(col(COLUMN_STEPS), Operator::GtEq, lit(1i64)));
    let mut columns = vec![
        col(COLUMN_ACTOR_ID),
        period.clone().alias(COLUMN_ENTRY_PERIOD),
    ];
    let mut group_by = vec![col(COLUMN_ACTOR_ID), period];
    let grouped_breakdown = breakdown::groups_by_value(ctx);
    if ctx.breakdown.is_some() {
        if grouped_breakdown {
            for idx in 0..crate::aggregate::breakdown_arity(ctx) {
                columns.push(col(breakdown_col_name(idx)));
                group_by.push(col(breakdown_col_name(idx)));
            }
        } else if let Some(exprs) = breakdown::attribution_exprs(ctx) {
            columns.extend(exprs);
        }
    }
    columns
        .push(Expr::Aggregate {
            fun: AggregateFunction::Max,
            args: vec![col(COLUMN_STEPS)],
            predicate: None,
            distinct: false,
        }
        .alias(COLUMN_STEPS));
    per_actor.columns = columns;
    per_actor.group_by = group_by;

    // stage 2: per-period counts and the conversion rate
    let mut per_period = per_actor.wrap();
    let reached_from = aggregate_if(
        AggregateFunction::Count,
        vec![],
        binary_expr(
            col(COLUMN_STEPS),
            Operator::GtEq,
            lit((ctx.from_step + 1) as i64),
        ),
    );
    let reached_to = aggregate_if(
        AggregateFunction::Count,
        vec![],
        binary_expr(
            col(COLUMN_STEPS),
            Operator::GtEq,
            lit((ctx.to_step + 1) as i64),
        ),
    );
    let rate = if_expr(
        binary_expr(reached_from.clone(), Operator::Eq, lit(0i64)),
        lit(0.0),
        binary_expr(
            binary_expr(reached_to.clone(), Operator::Multiply, lit(100.0)),
            Operator::Divide,
            reached_from.clone(),
        ),
    );
    let mut columns = vec![col(COLUMN_ENTRY_PERIOD)];
    let mut group_by = vec![col(COLUMN_ENTRY_PERIOD)];
    let arity = crate::aggregate::breakdown_arity(ctx);
    if ctx.breakdown.is_some() {
        for idx in 0..arity {
            columns.push(col(breakdown_col_name(idx)));
            group_by.push(col(breakdown_col_name(idx)));
        }
    }
    columns.push(reached_from.alias("reached_from_step_count"));
    columns.push(reached_to.alias("reached_to_step_count"));
    columns.push(rate.alias("conversion_rate"));
    per_period.columns = columns;
    per_period.group_by = group_by;

    // stage 3: dense period fill
    fill_join(ctx, per_period, unit, week_start)
}

/// Left-joins the computed periods onto a synthetic enumeration of every
/// period in range; with a breakdown the fill is crossed with the
/// distinct value set first.
fn fill_join(
    ctx: &QueryContext,
    data: SelectPlan,
    unit: TimeIntervalUnit,
    week_start: Weekday,
) -> SelectPlan {
    let period_count = binary_expr(
        call(
            Function::DateDiff,
            vec![
                lit(unit.as_str()),
                lit_timestamp(unit.truncate(ctx.from, week_start)),
                lit_timestamp(ctx.to),
            ],
        ),
        Operator::Plus,
        lit(1i64),
    );
    let mut fill = SelectPlan::new(Source::Numbers(Box::new(period_count)));
    let fill_period = call(
        Function::ToStartOfInterval,
        vec![
            binary_expr(
                lit_timestamp(unit.truncate(ctx.from, week_start)),
                Operator::Plus,
                binary_expr(
                    col("number"),
                    Operator::Multiply,
                    lit_interval_seconds(unit.duration(1).num_seconds()),
                ),
            ),
            lit(unit.as_str()),
            lit(week_start.num_days_from_monday() as i64),
        ],
    );
    fill.columns = vec![fill_period.alias(COLUMN_ENTRY_PERIOD)];

    let arity = crate::aggregate::breakdown_arity(ctx);
    let fill_source = if ctx.breakdown.is_some() {
        // enumerate observed breakdown values, cross them with the periods
        let mut values = data.clone().wrap();
        values.columns = (0..arity).map(|idx| col(breakdown_col_name(idx))).collect();
        values.group_by = values.columns.clone();
        join(Source::Subquery(Box::new(fill)), values, JoinKind::Cross, None)
    } else {
        Source::Subquery(Box::new(fill))
    };

    let mut on = binary_expr(
        col(COLUMN_ENTRY_PERIOD),
        Operator::Eq,
        col(COLUMN_ENTRY_PERIOD),
    );
    if ctx.breakdown.is_some() {
        for idx in 0..arity {
            on = crate::plan::expr::and(
                on,
                binary_expr(
                    col(breakdown_col_name(idx)),
                    Operator::Eq,
                    col(breakdown_col_name(idx)),
                ),
            );
        }
    }

    let mut plan = SelectPlan::new(join(fill_source, data, JoinKind::Left, Some(on)));
    let mut columns = vec![col(COLUMN_ENTRY_PERIOD)];
    for idx in 0..arity {
        columns.push(col(breakdown_col_name(idx)));
    }
    columns.push(
        call(
            Function::Coalesce,
            vec![col("reached_from_step_count"), lit(0i64)],
        )
        .alias("reached_from_step_count"),
    );
    columns.push(
        call(
            Function::Coalesce,
            vec![col("reached_to_step_count"), lit(0i64)],
        )
        .alias("reached_to_step_count"),
    );
    columns.push(call(Function::Coalesce, vec![col("conversion_rate"), lit(0.0)]).alias("conversion_rate"));
    plan.columns = columns;
    plan.order_by = vec![(col(COLUMN_ENTRY_PERIOD), crate::plan::expr::SortOrder::Asc)];

    plan
}

/// Every calendar period covering `[from, to]`, dense.
pub fn periods_between(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    unit: TimeIntervalUnit,
    week_start: Weekday,
) -> Vec<DateTime<Utc>> {
    let mut periods = vec![];
    let mut cur = unit.truncate(from, week_start);
    let end = unit.truncate(to, week_start);
    while cur <= end {
        periods.push(cur);
        cur = cur + unit.relative_duration(1);
    }

    periods
}

/// Single-pass counterpart of [`build`].
pub fn from_actors(ctx: &QueryContext, actors: &[ActorResult]) -> Result<TrendsResult> {
    let unit = ctx.interval();
    let week_start = ctx.ctx.week_start;
    let periods = periods_between(ctx.from, ctx.to, unit, week_start);

    // deepest result per (actor, breakdown value)
    let mut best: HashMap<(i64, Option<Vec<String>>), &ActorResult, RandomState> =
        HashMap::default();
    for actor in actors {
        let key = (actor.actor_id, actor.breakdown.clone());
        best.entry(key)
            .and_modify(|cur| {
                if actor.steps > cur.steps
                    || (actor.steps == cur.steps && actor.entry_ts < cur.entry_ts)
                {
                    *cur = actor;
                }
            })
            .or_insert(actor);
    }

    let mut values: IndexSet<Option<Vec<String>>> = IndexSet::new();
    if ctx.breakdown.is_none() {
        values.insert(None);
    }
    let mut counts: HashMap<(i64, Option<Vec<String>>), (i64, i64), RandomState> =
        HashMap::default();
    let mut entries: Vec<_> = best.values().collect();
    entries.sort_by_key(|a| (a.actor_id, a.breakdown.clone()));
    for actor in entries {
        let entry = match actor.entry_ts {
            Some(ts) => ts,
            None => continue,
        };
        let period = unit
            .truncate(
                DateTime::<Utc>::from_timestamp_millis(entry).unwrap_or(ctx.from),
                week_start,
            )
            .timestamp_millis();
        if ctx.breakdown.is_some() {
            values.insert(actor.breakdown.clone());
        }
        let slot = counts
            .entry((period, actor.breakdown.clone()))
            .or_insert((0, 0));
        if actor.steps >= ctx.from_step + 1 {
            slot.0 += 1;
        }
        if actor.steps >= ctx.to_step + 1 {
            slot.1 += 1;
        }
    }

    let mut value_list: Vec<Option<Vec<String>>> = values.into_iter().collect();
    value_list.sort();
    let mut rows = vec![];
    for period in &periods {
        for value in &value_list {
            let (reached_from, reached_to) = counts
                .get(&(period.timestamp_millis(), value.clone()))
                .copied()
                .unwrap_or((0, 0));
            let conversion_rate = if reached_from == 0 {
                0.0
            } else {
                reached_to as f64 * 100.0 / reached_from as f64
            };
            rows.push(TrendsRow {
                period: *period,
                breakdown: value.clone(),
                reached_from,
                reached_to,
                conversion_rate,
            });
        }
    }

    Ok(TrendsResult { rows })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::test_util::actor_result_at;
    use crate::test_util::build_ctx;
    use crate::test_util::sequential_spec;

    #[test]
    fn periods_are_dense_over_range() {
        let from = Utc.with_ymd_and_hms(2023, 6, 1, 10, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2023, 6, 5, 10, 0, 0).unwrap();
        let periods = periods_between(from, to, TimeIntervalUnit::Day, Weekday::Mon);
        assert_eq!(periods.len(), 5);
        assert_eq!(periods[0], Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn empty_periods_fill_with_zero_rate() {
        let ctx = build_ctx(sequential_spec(&["a", "b"]));
        let day0 = ctx.from;
        let actors = vec![
            actor_result_at(1, 2, day0.timestamp_millis()),
            actor_result_at(2, 1, day0.timestamp_millis()),
        ];
        let res = from_actors(&ctx, &actors).unwrap();
        // every day of the range appears
        let periods = periods_between(ctx.from, ctx.to, TimeIntervalUnit::Day, Weekday::Mon);
        assert_eq!(res.rows.len(), periods.len());
        assert_eq!(res.rows[0].reached_from, 2);
        assert_eq!(res.rows[0].reached_to, 1);
        assert_eq!(res.rows[0].conversion_rate, 50.0);
        assert_eq!(res.rows[1].reached_from, 0);
        assert_eq!(res.rows[1].conversion_rate, 0.0);
    }
}
