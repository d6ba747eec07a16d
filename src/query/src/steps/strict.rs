use crate::context::QueryContext;
use crate::error::Result;
use crate::exclusion;
use crate::plan::select::SelectPlan;
use crate::steps::build_step_columns_impl;
use crate::steps::build_windowing_impl;
use crate::steps::OrderStrategy;
use crate::steps::WindowingMode;

/// Strict funnel: every step must be the very next event of the actor.
/// The event source keeps off-path events visible (no entity prefilter),
/// and the adjacent window frame makes any intervening event break the
/// chain.
pub struct Strict;

impl OrderStrategy for Strict {
    fn build_step_columns(&self, ctx: &QueryContext, source: SelectPlan) -> Result<SelectPlan> {
        Ok(build_step_columns_impl(ctx, &ctx.steps, source))
    }

    fn build_windowing_pass(&self, ctx: &QueryContext, inner: SelectPlan) -> Result<SelectPlan> {
        Ok(build_windowing_impl(
            ctx,
            &ctx.steps,
            WindowingMode::Adjacent,
            inner,
        ))
    }

    fn build_exclusion_pass(&self, ctx: &QueryContext, inner: SelectPlan) -> Result<SelectPlan> {
        Ok(exclusion::apply(ctx, inner))
    }
}
