use crate::context::QueryContext;
use crate::context::ResolvedStep;
use crate::error::Result;
use crate::exclusion;
use crate::plan::expr::binary_expr;
use crate::plan::expr::col;
use crate::plan::expr::lit;
use crate::plan::expr::Operator;
use crate::plan::select::SelectPlan;
use crate::plan::select::Source;
use crate::step_col;
use crate::steps::build_step_columns_impl;
use crate::steps::build_windowing_impl;
use crate::steps::OrderStrategy;
use crate::steps::WindowingMode;

/// Unordered funnel: one ordered sub-plan per rotation of the step list,
/// keeping only rows whose assumed-first step actually fired, unioned;
/// the actor's reached count is the maximum across rotations, which the
/// downstream aggregation takes anyway.
pub struct Unordered;

pub(crate) fn rotated_steps(steps: &[ResolvedStep], rotation: usize) -> Vec<ResolvedStep> {
    let mut rotated: Vec<ResolvedStep> = steps[rotation..]
        .iter()
        .chain(steps[..rotation].iter())
        .cloned()
        .collect();
    for (index, step) in rotated.iter_mut().enumerate() {
        step.index = index;
    }

    rotated
}

impl OrderStrategy for Unordered {
    fn build_step_columns(&self, _ctx: &QueryContext, source: SelectPlan) -> Result<SelectPlan> {
        // step columns are rotation-dependent; the windowing pass seeds
        // each rotation itself
        Ok(source)
    }

    fn build_windowing_pass(&self, ctx: &QueryContext, inner: SelectPlan) -> Result<SelectPlan> {
        let mut rotations = Vec::with_capacity(ctx.max_steps);
        for rotation in 0..ctx.max_steps {
            let steps = rotated_steps(&ctx.steps, rotation);
            let seeded = build_step_columns_impl(ctx, &steps, inner.clone());
            let mut windowed = build_windowing_impl(ctx, &steps, WindowingMode::Cascading, seeded);
            // the assumed-first event must actually have occurred
            windowed.filter = Some(binary_expr(col(step_col(0)), Operator::Eq, lit(1i64)));
            rotations.push(windowed);
        }

        Ok(SelectPlan::new(Source::Union(rotations)))
    }

    fn build_exclusion_pass(&self, ctx: &QueryContext, inner: SelectPlan) -> Result<SelectPlan> {
        Ok(exclusion::apply(ctx, inner))
    }
}
