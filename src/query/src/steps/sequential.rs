use crate::context::QueryContext;
use crate::error::Result;
use crate::exclusion;
use crate::plan::select::SelectPlan;
use crate::steps::build_step_columns_impl;
use crate::steps::build_windowing_impl;
use crate::steps::OrderStrategy;
use crate::steps::WindowingMode;

/// Ordered funnel: each step may be separated by arbitrary other events,
/// the chain just has to advance in time inside the conversion window.
pub struct Sequential;

impl OrderStrategy for Sequential {
    fn build_step_columns(&self, ctx: &QueryContext, source: SelectPlan) -> Result<SelectPlan> {
        Ok(build_step_columns_impl(ctx, &ctx.steps, source))
    }

    fn build_windowing_pass(&self, ctx: &QueryContext, inner: SelectPlan) -> Result<SelectPlan> {
        Ok(build_windowing_impl(
            ctx,
            &ctx.steps,
            WindowingMode::Cascading,
            inner,
        ))
    }

    fn build_exclusion_pass(&self, ctx: &QueryContext, inner: SelectPlan) -> Result<SelectPlan> {
        Ok(exclusion::apply(ctx, inner))
    }
}
