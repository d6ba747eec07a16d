use tracing::debug;

use crate::aggregate;
use crate::breakdown;
use crate::context::QueryContext;
use crate::error::Result;
use crate::error::ValidationError;
use crate::plan::select::SelectPlan;
use crate::sources;
use crate::steps;

/// Compiles a resolved funnel context into its query plan:
/// event source, strategy-dispatched windowing, exclusions, breakdown
/// attribution, then the viz-mode aggregation.
pub fn build(ctx: &QueryContext) -> Result<SelectPlan> {
    let source = sources::build(ctx);
    let windowed = steps::windowed_plan(ctx, source)?;
    let attributed = breakdown::apply(ctx, windowed);
    let plan = aggregate::build(ctx, attributed)?;
    debug!(viz = ?ctx.spec.viz, steps = ctx.max_steps, "funnel plan built");

    Ok(plan)
}

/// Compiles the correlation variant: per-event contingency tables against
/// funnel success over the same windowed row set.
pub fn build_correlation(ctx: &QueryContext) -> Result<SelectPlan> {
    if let Some(step) = ctx.steps.iter().find(|s| s.external.is_some()) {
        return Err(ValidationError::ExternalStepUnsupported(format!(
            "correlation cannot run over external table {}",
            step.external.clone().unwrap_or_default()
        ))
        .into());
    }

    let source = sources::build(ctx);
    let windowed = steps::windowed_plan(ctx, source)?;
    let plan = aggregate::correlation::build(ctx, windowed);
    debug!(steps = ctx.max_steps, "correlation plan built");

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::build_ctx;
    use crate::test_util::sequential_spec;

    #[test]
    fn compiling_twice_is_structurally_identical() {
        let ctx = build_ctx(sequential_spec(&["signup", "activate", "upgrade"]));
        let a = build(&ctx).unwrap();
        let b = build(&ctx).unwrap();
        assert_eq!(a, b);
    }
}
