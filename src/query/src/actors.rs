use common::types::COLUMN_ACTOR_ID;

use crate::aggregate::per_actor_plan;
use crate::breakdown;
use crate::breakdown_col_name;
use crate::context::QueryContext;
use crate::conversion_time_col;
use crate::error::Result;
use crate::latest_col;
use crate::plan::expr::and;
use crate::plan::expr::binary_expr;
use crate::plan::expr::col;
use crate::plan::expr::lit;
use crate::plan::expr::multi_and;
use crate::plan::expr::Expr;
use crate::plan::expr::Operator;
use crate::plan::select::SelectPlan;
use crate::sources;
use crate::steps;
use crate::COLUMN_STEPS;

/// Drill-down request into a computed funnel. `step` is 1-indexed and
/// signed: positive selects actors who completed at least that step,
/// negative selects actors who dropped off right before step `|step|`.
#[derive(Clone, Debug, PartialEq)]
pub struct ActorsRequest {
    pub step: i64,
    /// Restrict to one breakdown cell.
    pub breakdown: Option<Vec<String>>,
    /// Project the matched event reference for the target step.
    pub with_events: bool,
    /// Bound the actors' total conversion time, in seconds (histogram
    /// cell drill-down).
    pub time_to_convert: Option<(i64, i64)>,
}

/// Builds the actor query for a funnel cell: same step-matching output,
/// filtered to the target step and projected down to actor identifiers.
pub fn build(ctx: &QueryContext, req: &ActorsRequest) -> Result<SelectPlan> {
    // a missing target is a caller bug, not a user error
    assert!(req.step != 0, "actor query requires a non-zero target step");
    if req.step < 0 {
        assert!(
            req.step <= -2,
            "drop-off targets start at step 2; nobody drops off before entering"
        );
    }

    let source = sources::build(ctx);
    let windowed = steps::windowed_plan(ctx, source)?;
    let attributed = breakdown::apply(ctx, windowed);
    let mut plan = per_actor_plan(ctx, attributed).wrap();

    let mut conditions = vec![step_condition(req.step)];
    if let Some(values) = &req.breakdown {
        for (idx, value) in values.iter().enumerate() {
            conditions.push(binary_expr(
                col(breakdown_col_name(idx)),
                Operator::Eq,
                lit(value.as_str()),
            ));
        }
    }
    if let Some((min_seconds, max_seconds)) = req.time_to_convert {
        let total = total_conversion_time(ctx);
        conditions.push(and(
            binary_expr(total.clone(), Operator::GtEq, lit(min_seconds)),
            binary_expr(total, Operator::LtEq, lit(max_seconds)),
        ));
    }
    plan.filter = Some(multi_and(conditions));

    let mut columns = vec![col(COLUMN_ACTOR_ID), col(COLUMN_STEPS)];
    if req.with_events {
        let matched_step = if req.step > 0 {
            req.step as usize - 1
        } else {
            (-req.step) as usize - 2
        };
        columns.push(col(latest_col(matched_step)).alias("matched_event_ts"));
    }
    plan.columns = columns;

    Ok(plan)
}

fn step_condition(step: i64) -> Expr {
    if step > 0 {
        binary_expr(col(COLUMN_STEPS), Operator::GtEq, lit(step))
    } else {
        // dropped off right before step |n|: reached exactly |n| - 1
        binary_expr(col(COLUMN_STEPS), Operator::Eq, lit(-step - 1))
    }
}

fn total_conversion_time(ctx: &QueryContext) -> Expr {
    let mut total = col(conversion_time_col(ctx.from_step + 1));
    for i in ctx.from_step + 2..=ctx.to_step {
        total = binary_expr(total, Operator::Plus, col(conversion_time_col(i)));
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::build_ctx;
    use crate::test_util::sequential_spec;

    #[test]
    fn completed_target_filters_reached_steps() {
        let ctx = build_ctx(sequential_spec(&["a", "b", "c"]));
        let req = ActorsRequest {
            step: 2,
            breakdown: None,
            with_events: false,
            time_to_convert: None,
        };
        let plan = build(&ctx, &req).unwrap();
        assert_eq!(
            plan.filter,
            Some(binary_expr(col(COLUMN_STEPS), Operator::GtEq, lit(2i64)))
        );
        assert_eq!(plan.columns.len(), 2);
    }

    #[test]
    fn dropoff_target_selects_exact_reach() {
        let ctx = build_ctx(sequential_spec(&["a", "b", "c"]));
        let req = ActorsRequest {
            step: -3,
            breakdown: None,
            with_events: true,
            time_to_convert: None,
        };
        let plan = build(&ctx, &req).unwrap();
        assert_eq!(
            plan.filter,
            Some(binary_expr(col(COLUMN_STEPS), Operator::Eq, lit(2i64)))
        );
        // matched event ref points at the last completed step
        assert!(plan
            .columns
            .iter()
            .any(|c| matches!(c, Expr::Alias(_, name) if name == "matched_event_ts")));
    }

    #[test]
    #[should_panic(expected = "non-zero target step")]
    fn zero_target_is_a_caller_bug() {
        let ctx = build_ctx(sequential_spec(&["a", "b"]));
        let req = ActorsRequest {
            step: 0,
            breakdown: None,
            with_events: false,
            time_to_convert: None,
        };
        let _ = build(&ctx, &req);
    }
}
