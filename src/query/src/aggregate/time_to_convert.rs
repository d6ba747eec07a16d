use common::types::COLUMN_ACTOR_ID;

use crate::aggregate::per_actor_plan;
use crate::aggregate::TtcBin;
use crate::aggregate::TtcResult;
use crate::context::QueryContext;
use crate::conversion_time_col;
use crate::error::Result;
use crate::exec::ActorResult;
use crate::plan::expr::aggregate;
use crate::plan::expr::binary_expr;
use crate::plan::expr::call;
use crate::plan::expr::col;
use crate::plan::expr::if_expr;
use crate::plan::expr::lit;
use crate::plan::expr::AggregateFunction;
use crate::plan::expr::Expr;
use crate::plan::expr::Function;
use crate::plan::expr::Operator;
use crate::plan::select::join;
use crate::plan::select::JoinKind;
use crate::plan::select::SelectPlan;
use crate::plan::select::Source;
use crate::COLUMN_STEPS;
use crate::COLUMN_TOTAL_CONVERSION_TIME;

/// Custom bin counts clamp to this range.
const MAX_CUSTOM_BINS: usize = 90;
/// Auto-computed bin counts clamp to this range.
const MAX_AUTO_BINS: usize = 60;
/// Bin width when the computed width degenerates (single sample).
const FALLBACK_BIN_WIDTH: i64 = 60;

/// Number of histogram bins: a user-supplied count clamped to `[1, 90]`,
/// or the cube-root heuristic clamped to `[1, 60]`.
pub fn bin_count(custom: Option<usize>, sample_count: usize) -> usize {
    match custom {
        Some(n) => n.clamp(1, MAX_CUSTOM_BINS),
        None => ((sample_count as f64).cbrt().ceil() as usize).clamp(1, MAX_AUTO_BINS),
    }
}

/// Bin width in seconds; falls back to 60s when the spread is degenerate.
pub fn bin_width(min: i64, max: i64, bins: usize) -> i64 {
    let width = ((max - min) as f64 / bins as f64).ceil() as i64;
    if width <= 0 {
        FALLBACK_BIN_WIDTH
    } else {
        width
    }
}

/// Dense histogram over `[0, bins]`: every bin appears even with zero
/// samples.
pub fn histogram(samples: &[i64], bins: usize) -> (i64, Vec<TtcBin>) {
    let min = samples.iter().min().copied().unwrap_or(0);
    let max = samples.iter().max().copied().unwrap_or(0);
    let width = bin_width(min, max, bins);

    let mut counts = vec![0i64; bins + 1];
    for sample in samples {
        let idx = ((sample - min) / width) as usize;
        counts[idx.min(bins)] += 1;
    }
    let out = counts
        .into_iter()
        .enumerate()
        .map(|(idx, count)| TtcBin {
            lower: min + idx as i64 * width,
            count,
        })
        .collect();

    (width, out)
}

/// Time-to-convert aggregation: per-actor conversion totals over the
/// selected step range, histogram-binned with a dense fill.
pub fn build(ctx: &QueryContext, windowed: SelectPlan) -> SelectPlan {
    // stage 1: per-actor totals across [from_step, to_step)
    let per_actor = per_actor_plan(ctx, windowed);
    let mut totals = per_actor.wrap();
    totals.filter = Some(binary_expr(
        col(COLUMN_STEPS),
        Operator::GtEq,
        lit((ctx.to_step + 1) as i64),
    ));
    let mut total_expr = col(conversion_time_col(ctx.from_step + 1));
    for i in ctx.from_step + 2..=ctx.to_step {
        total_expr = binary_expr(total_expr, Operator::Plus, col(conversion_time_col(i)));
    }
    totals.columns = vec![
        col(COLUMN_ACTOR_ID),
        total_expr.alias(COLUMN_TOTAL_CONVERSION_TIME),
    ];

    // scalar stats feeding the width and count expressions
    let stat = |fun: AggregateFunction| -> Expr {
        let mut plan = totals.clone().wrap();
        plan.columns = vec![aggregate(fun, vec![col(COLUMN_TOTAL_CONVERSION_TIME)])];
        Expr::ScalarSubquery(Box::new(plan))
    };
    let sample_count = {
        let mut plan = totals.clone().wrap();
        plan.columns = vec![aggregate(AggregateFunction::Count, vec![])];
        Expr::ScalarSubquery(Box::new(plan))
    };
    let min_total = stat(AggregateFunction::Min);
    let max_total = stat(AggregateFunction::Max);

    let bins_expr = match ctx.spec.bin_count {
        Some(n) => lit(bin_count(Some(n), 0)),
        None => call(
            Function::Least,
            vec![
                call(
                    Function::Greatest,
                    vec![
                        call(Function::Ceil, vec![call(Function::Cbrt, vec![sample_count])]),
                        lit(1i64),
                    ],
                ),
                lit(MAX_AUTO_BINS),
            ],
        ),
    };
    let raw_width = call(
        Function::Ceil,
        vec![binary_expr(
            binary_expr(max_total.clone(), Operator::Minus, min_total.clone()),
            Operator::Divide,
            bins_expr.clone(),
        )],
    );
    let width_expr = if_expr(
        binary_expr(raw_width.clone(), Operator::LtEq, lit(0i64)),
        lit(FALLBACK_BIN_WIDTH),
        raw_width,
    );

    // stage 2: bucket totals by bin index
    let mut binned = totals.wrap();
    let bin_idx = call(
        Function::IntDiv,
        vec![
            binary_expr(
                col(COLUMN_TOTAL_CONVERSION_TIME),
                Operator::Minus,
                min_total.clone(),
            ),
            width_expr.clone(),
        ],
    );
    binned.columns = vec![
        bin_idx.clone().alias("bin_idx"),
        aggregate(AggregateFunction::Count, vec![]).alias("bin_count"),
    ];
    binned.group_by = vec![bin_idx];

    // stage 3: dense fill over [0, bins]
    let mut fill = SelectPlan::new(Source::Numbers(Box::new(binary_expr(
        bins_expr,
        Operator::Plus,
        lit(1i64),
    ))));
    fill.columns = vec![col("number").alias("bin_idx")];

    let on = binary_expr(col("bin_idx"), Operator::Eq, col("bin_idx"));
    let mut plan = SelectPlan::new(join(
        Source::Subquery(Box::new(fill)),
        binned,
        JoinKind::Left,
        Some(on),
    ));
    plan.columns = vec![
        binary_expr(
            min_total,
            Operator::Plus,
            binary_expr(col("bin_idx"), Operator::Multiply, width_expr),
        )
        .alias("bin_lower"),
        call(Function::Coalesce, vec![col("bin_count"), lit(0i64)]).alias("bin_count"),
    ];
    plan.order_by = vec![(col("bin_idx"), crate::plan::expr::SortOrder::Asc)];

    plan
}

/// Single-pass counterpart of [`build`].
pub fn from_actors(ctx: &QueryContext, actors: &[ActorResult]) -> Result<TtcResult> {
    let mut samples = vec![];
    for actor in actors {
        if actor.steps < ctx.to_step + 1 {
            continue;
        }
        let mut total = 0i64;
        let mut complete = true;
        for i in ctx.from_step + 1..=ctx.to_step {
            match actor.conversion_times.get(i).copied().flatten() {
                Some(ct) => total += ct,
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            samples.push(total);
        }
    }
    samples.sort_unstable();

    let bins = bin_count(ctx.spec.bin_count, samples.len());
    let (width, hist) = histogram(&samples, bins);
    let average_seconds = if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<i64>() as f64 / samples.len() as f64)
    };

    Ok(TtcResult {
        bin_width: width,
        bins: hist,
        sample_count: samples.len(),
        average_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_bin_count_clamps() {
        assert_eq!(bin_count(Some(150), 0), 90);
        assert_eq!(bin_count(Some(0), 0), 1);
        assert_eq!(bin_count(Some(45), 0), 45);
    }

    #[test]
    fn auto_bin_count_uses_cube_root() {
        assert_eq!(bin_count(None, 1000), 10);
        assert_eq!(bin_count(None, 0), 1);
        assert_eq!(bin_count(None, 1_000_000), 60);
    }

    #[test]
    fn degenerate_width_falls_back_to_sixty_seconds() {
        assert_eq!(bin_width(100, 100, 10), 60);
        assert_eq!(bin_width(0, 100, 10), 10);
    }

    #[test]
    fn histogram_is_dense() {
        let (width, bins) = histogram(&[10, 10, 70], 2);
        assert_eq!(width, 30);
        assert_eq!(bins.len(), 3);
        assert_eq!(bins[0].count, 2);
        assert_eq!(bins[2].count, 1);
        assert_eq!(bins[1].count, 0);
    }
}
