use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use chrono::Weekday;
use common::funnel::Attribution;
use common::funnel::BreakdownSpec;
use common::funnel::BreakdownType;
use common::funnel::Funnel;
use common::funnel::OrderType;
use common::funnel::StepEntity;
use common::funnel::StepMath;
use common::funnel::VizMode;
use common::query::PropValueFilter;
use common::query::TimeIntervalUnit;
use common::types::ALL_USERS_COHORT;
use common::types::COLUMN_ACTOR_ID;
use common::types::COLUMN_EVENT;
use common::types::COLUMN_PERSON_ID;
use tracing::debug;

use crate::error::Result;
use crate::error::ValidationError;
use crate::expr::breakdown_col;
use crate::expr::events_expression;
use crate::expr::property_col;
use crate::expr::property_filters_expression;
use crate::plan::expr::and;
use crate::plan::expr::binary_expr;
use crate::plan::expr::col;
use crate::plan::expr::lit;
use crate::plan::expr::Expr;
use crate::plan::expr::Operator;
use crate::plan::select::SelectPlan;
use crate::plan::select::Source;
use crate::provider::ActionRepository;
use crate::provider::CohortRepository;
use crate::provider::PropertyRepository;

/// Invocation environment: everything ambient a compilation needs besides
/// the spec itself.
#[derive(Clone, Debug)]
pub struct Context {
    pub project_id: u64,
    pub cur_time: DateTime<Utc>,
    pub week_start: Weekday,
    /// Team-level filters screening out internal/test accounts, AND-ed
    /// into every compiled query.
    pub test_account_filters: Option<Vec<PropValueFilter>>,
}

impl Context {
    pub fn new(project_id: u64, cur_time: DateTime<Utc>) -> Self {
        Self {
            project_id,
            cur_time,
            week_start: Weekday::Mon,
            test_account_filters: None,
        }
    }
}

/// A step with its entity resolved to concrete event names and its
/// predicates prebuilt. Resolution happens once, here; query construction
/// never calls back into a repository.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedStep {
    pub index: usize,
    /// `None` matches any event.
    pub events: Option<Vec<String>>,
    /// Set when the step reads from a table outside the event store.
    pub external: Option<String>,
    pub entity_expr: Option<Expr>,
    pub filter_expr: Option<Expr>,
    pub math: StepMath,
    pub optional: bool,
}

impl ResolvedStep {
    /// Full row predicate for this step; `true` for an any-event step.
    pub fn predicate(&self) -> Expr {
        match (&self.entity_expr, &self.filter_expr) {
            (Some(e), Some(f)) => and(e.clone(), f.clone()),
            (Some(e), None) => e.clone(),
            (None, Some(f)) => f.clone(),
            (None, None) => lit(true),
        }
    }

    /// Two steps are definitionally identical when they match the same
    /// entity under the same property filters. Drives the duplicate-step
    /// window frame rule.
    pub fn same_definition(&self, other: &ResolvedStep) -> bool {
        self.events == other.events
            && self.external == other.external
            && self.filter_expr == other.filter_expr
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedExclusion {
    pub events: Vec<String>,
    pub expr: Expr,
    pub from_step: usize,
    pub to_step: usize,
}

impl ResolvedExclusion {
    /// Whether a hit on this exclusion invalidates progress past `step`.
    pub fn covers(&self, step: usize) -> bool {
        self.from_step <= step && step <= self.to_step
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedBreakdown {
    pub spec: BreakdownSpec,
    /// One expression per breakdown property (single entry for cohorts).
    pub exprs: Vec<Expr>,
    pub attribution: Attribution,
    /// Unordered funnels cannot attribute to a fixed step; the value is
    /// taken from each qualifying event directly instead.
    pub raw_per_event: bool,
    pub cohort_plans: Vec<(u64, SelectPlan)>,
}

impl ResolvedBreakdown {
    /// Whether chains are computed per breakdown value (array-join
    /// attribution keys the windowing partition on the value).
    pub fn partitions_chains(&self) -> bool {
        self.raw_per_event || self.attribution == Attribution::AllEvents
    }
}

/// Immutable, fully resolved compilation state derived from one spec.
/// Safe to drop after the plan is built; rebuilding from the same spec
/// yields a structurally identical context.
#[derive(Clone, Debug)]
pub struct QueryContext {
    pub ctx: Context,
    pub spec: Funnel,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub max_steps: usize,
    pub window: Duration,
    pub from_step: usize,
    pub to_step: usize,
    pub steps: Vec<ResolvedStep>,
    pub exclusions: Vec<ResolvedExclusion>,
    pub breakdown: Option<ResolvedBreakdown>,
    /// Holding-constant columns: one value per conversion chain.
    pub constants: Vec<Expr>,
    /// Query-wide property predicate, prebuilt.
    pub query_filter: Option<Expr>,
}

impl QueryContext {
    pub fn build(
        ctx: Context,
        spec: Funnel,
        actions: &dyn ActionRepository,
        cohorts: &dyn CohortRepository,
        properties: &dyn PropertyRepository,
    ) -> Result<QueryContext> {
        let max_steps = spec.steps.len();
        if max_steps < 2 {
            return Err(ValidationError::TooFewSteps(max_steps).into());
        }

        let from_step = spec.from_step.unwrap_or(0);
        let to_step = spec.to_step.unwrap_or(max_steps - 1);
        if from_step >= to_step || to_step > max_steps - 1 {
            return Err(ValidationError::StepRangeInvalid {
                from: from_step,
                to: to_step,
                steps: max_steps,
            }
            .into());
        }

        let steps = resolve_steps(&spec, actions, properties)?;
        validate_optional_steps(&spec, &steps)?;
        let exclusions = resolve_exclusions(&spec, &steps, actions, properties)?;
        let breakdown = resolve_breakdown(&spec, &steps, cohorts, properties)?;
        let constants = resolve_constants(&spec, properties)?;
        let mut query_filter = spec
            .filters
            .as_ref()
            .map(|f| property_filters_expression(properties, f))
            .transpose()?;
        if let Some(team) = &ctx.test_account_filters {
            let team_expr = property_filters_expression(properties, team)?;
            query_filter = Some(match query_filter {
                Some(f) => and(f, team_expr),
                None => team_expr,
            });
        }

        let (from, to) = spec.time.range(ctx.cur_time);
        let window = spec.conversion_window.duration();

        debug!(
            max_steps,
            from_step, to_step, "query context built for project {}", ctx.project_id
        );

        Ok(QueryContext {
            ctx,
            spec,
            from,
            to,
            max_steps,
            window,
            from_step,
            to_step,
            steps,
            exclusions,
            breakdown,
            constants,
            query_filter,
        })
    }

    pub fn interval(&self) -> TimeIntervalUnit {
        self.spec.interval.unwrap_or(TimeIntervalUnit::Day)
    }

    /// True when any step matches all events, which disables source
    /// pre-filtering.
    pub fn has_any_event_step(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.events.is_none() && s.external.is_none())
    }
}

fn resolve_steps(
    spec: &Funnel,
    actions: &dyn ActionRepository,
    properties: &dyn PropertyRepository,
) -> Result<Vec<ResolvedStep>> {
    let mut out = Vec::with_capacity(spec.steps.len());
    for (index, step) in spec.steps.iter().enumerate() {
        let (events, external) = match &step.entity {
            None => (None, None),
            Some(StepEntity::Event(name)) => (Some(vec![name.clone()]), None),
            Some(StepEntity::Action(id)) => (Some(actions.resolve_step_events(*id)?), None),
            Some(StepEntity::External(table)) => (None, Some(table.clone())),
        };

        if let Some(table) = &external {
            if step.math != StepMath::Total {
                return Err(ValidationError::ExternalStepUnsupported(format!(
                    "first-time math cannot be computed for external table {table}"
                ))
                .into());
            }
            if spec.viz == VizMode::Trends {
                return Err(ValidationError::ExternalStepUnsupported(format!(
                    "external table {table} cannot feed a trends funnel"
                ))
                .into());
            }
        }

        let entity_expr = match (&events, &external) {
            (Some(ev), _) => Some(events_expression(ev)),
            (None, Some(table)) => Some(binary_expr(
                col(COLUMN_EVENT),
                Operator::Eq,
                lit(table.as_str()),
            )),
            (None, None) => None,
        };
        let filter_expr = step
            .filters
            .as_ref()
            .map(|f| property_filters_expression(properties, f))
            .transpose()?;

        out.push(ResolvedStep {
            index,
            events,
            external,
            entity_expr,
            filter_expr,
            math: step.math.clone(),
            optional: step.optional,
        });
    }

    Ok(out)
}

fn validate_optional_steps(spec: &Funnel, steps: &[ResolvedStep]) -> Result<()> {
    if !steps.iter().any(|s| s.optional) {
        return Ok(());
    }

    if spec.order == OrderType::Unordered {
        return Err(ValidationError::OptionalStepOrder.into());
    }
    if spec.viz != VizMode::Steps {
        return Err(ValidationError::OptionalStepViz.into());
    }
    if steps[0].optional {
        return Err(ValidationError::OptionalFirstStep.into());
    }
    for step in steps.iter().filter(|s| s.optional) {
        // an optional step shadowed by an identical required successor can
        // never convert
        if let Some(next) = steps.get(step.index + 1) {
            if !next.optional && step.same_definition(next) {
                return Err(ValidationError::OptionalStepDuplicate { step: step.index }.into());
            }
        }
        for exclusion in &spec.exclusions {
            if exclusion.from_step <= step.index && step.index <= exclusion.to_step {
                return Err(ValidationError::OptionalStepExcluded { step: step.index }.into());
            }
        }
    }

    Ok(())
}

fn resolve_exclusions(
    spec: &Funnel,
    steps: &[ResolvedStep],
    actions: &dyn ActionRepository,
    properties: &dyn PropertyRepository,
) -> Result<Vec<ResolvedExclusion>> {
    let max_steps = steps.len();
    let mut out = Vec::with_capacity(spec.exclusions.len());
    for exclusion in &spec.exclusions {
        if exclusion.from_step >= exclusion.to_step || exclusion.to_step > max_steps - 1 {
            return Err(ValidationError::ExclusionRangeInvalid {
                from: exclusion.from_step,
                to: exclusion.to_step,
                steps: max_steps,
            }
            .into());
        }
        if spec.order == OrderType::Unordered
            && (exclusion.from_step != 0 || exclusion.to_step != max_steps - 1)
        {
            return Err(ValidationError::PartialExclusionUnordered.into());
        }

        let events = match &exclusion.entity {
            StepEntity::Event(name) => vec![name.clone()],
            StepEntity::Action(id) => actions.resolve_step_events(*id)?,
            StepEntity::External(table) => {
                return Err(ValidationError::ExternalStepUnsupported(format!(
                    "external table {table} cannot be an exclusion"
                ))
                .into());
            }
        };

        // an exclusion that matches a step inside its own range would
        // invalidate every conversion through it
        for step in &steps[exclusion.from_step..=exclusion.to_step] {
            if let Some(step_events) = &step.events {
                if step_events.iter().any(|e| events.contains(e)) {
                    return Err(ValidationError::ExclusionMatchesStep { step: step.index }.into());
                }
            }
        }

        let mut expr = events_expression(&events);
        if let Some(filters) = &exclusion.filters {
            expr = and(expr, property_filters_expression(properties, filters)?);
        }

        out.push(ResolvedExclusion {
            events,
            expr,
            from_step: exclusion.from_step,
            to_step: exclusion.to_step,
        });
    }

    Ok(out)
}

fn resolve_breakdown(
    spec: &Funnel,
    steps: &[ResolvedStep],
    cohorts: &dyn CohortRepository,
    properties: &dyn PropertyRepository,
) -> Result<Option<ResolvedBreakdown>> {
    let breakdown = match &spec.breakdown {
        Some(b) => b,
        None => return Ok(None),
    };

    if breakdown.typ == BreakdownType::ExternalActorProperty && spec.viz == VizMode::Trends {
        return Err(ValidationError::UnsupportedBreakdown(
            "external actor properties cannot break down trends".to_string(),
        )
        .into());
    }

    let mut raw_per_event = false;
    let attribution = breakdown.attribution.clone();
    if let Attribution::Step(n) = &attribution {
        let n = *n;
        if n >= steps.len() {
            return Err(ValidationError::UnsupportedBreakdown(format!(
                "attribution step {n} is out of range"
            ))
            .into());
        }
        if steps[n].optional {
            return Err(ValidationError::OptionalStepAttribution { step: n }.into());
        }
        if spec.order == OrderType::Unordered {
            // the "n-th step" is rotation-dependent; fall back to the raw
            // per-event value
            raw_per_event = true;
        }
    }

    let (exprs, cohort_plans) = if breakdown.typ == BreakdownType::Cohort {
        if breakdown.cohort_ids.is_empty() {
            return Err(ValidationError::UnsupportedBreakdown(
                "cohort breakdown needs at least one cohort".to_string(),
            )
            .into());
        }
        let mut plans = Vec::with_capacity(breakdown.cohort_ids.len());
        for id in &breakdown.cohort_ids {
            let plan = if *id == ALL_USERS_COHORT {
                all_users_membership_plan()
            } else {
                cohorts.membership_plan(*id)?
            };
            plans.push((*id, plan));
        }
        (vec![col("cohort_id")], plans)
    } else {
        if breakdown.properties.is_empty() {
            return Err(ValidationError::UnsupportedBreakdown(
                "breakdown needs at least one property".to_string(),
            )
            .into());
        }
        let exprs = breakdown
            .properties
            .iter()
            .map(|p| breakdown_col(properties, p, breakdown.normalize_url))
            .collect::<Result<Vec<_>>>()?;
        (exprs, vec![])
    };

    Ok(Some(ResolvedBreakdown {
        spec: breakdown.clone(),
        exprs,
        attribution,
        raw_per_event,
        cohort_plans,
    }))
}

fn resolve_constants(spec: &Funnel, properties: &dyn PropertyRepository) -> Result<Vec<Expr>> {
    let constants = match &spec.holding_constants {
        Some(c) if !c.is_empty() => c,
        _ => return Ok(vec![]),
    };
    if spec.order == OrderType::Unordered {
        return Err(ValidationError::HoldingConstantUnsupported.into());
    }

    constants
        .iter()
        .map(|p| property_col(properties, p))
        .collect()
}

/// Membership sub-plan for the synthetic all-users cohort: every actor,
/// no repository involved.
fn all_users_membership_plan() -> SelectPlan {
    let mut plan = SelectPlan::new(Source::Events);
    plan.columns = vec![
        col(COLUMN_ACTOR_ID).alias(COLUMN_PERSON_ID),
        lit(ALL_USERS_COHORT as i64).alias("cohort_id"),
    ];
    plan.group_by = vec![col(COLUMN_ACTOR_ID)];
    plan
}

#[cfg(test)]
mod tests {
    use common::funnel::Exclusion;
    use common::funnel::Step;

    use super::*;
    use crate::error::QueryError;
    use crate::test_util::ctx_fixture;
    use crate::test_util::sequential_spec;
    use crate::test_util::InMemoryActions;
    use crate::test_util::InMemoryCohorts;
    use crate::test_util::PassthroughProperties;

    fn build(spec: Funnel) -> Result<QueryContext> {
        QueryContext::build(
            ctx_fixture(),
            spec,
            &InMemoryActions::default(),
            &InMemoryCohorts::default(),
            &PassthroughProperties,
        )
    }

    fn validation_err(res: Result<QueryContext>) -> ValidationError {
        match res {
            Err(QueryError::Validation(e)) => e,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_single_step() {
        let mut spec = sequential_spec(&["signup", "activate"]);
        spec.steps.truncate(1);
        assert_eq!(validation_err(build(spec)), ValidationError::TooFewSteps(1));
    }

    #[test]
    fn rejects_step_range_out_of_bounds() {
        let mut spec = sequential_spec(&["a", "b", "c"]);
        spec.from_step = Some(2);
        spec.to_step = Some(2);
        assert_eq!(
            validation_err(build(spec)),
            ValidationError::StepRangeInvalid {
                from: 2,
                to: 2,
                steps: 3
            }
        );
    }

    #[test]
    fn rejects_exclusion_matching_step() {
        let mut spec = sequential_spec(&["a", "b", "c"]);
        spec.exclusions = vec![Exclusion {
            entity: StepEntity::Event("b".to_string()),
            filters: None,
            from_step: 0,
            to_step: 2,
        }];
        assert_eq!(
            validation_err(build(spec)),
            ValidationError::ExclusionMatchesStep { step: 1 }
        );
    }

    #[test]
    fn rejects_partial_exclusion_on_unordered() {
        let mut spec = sequential_spec(&["a", "b", "c"]);
        spec.order = OrderType::Unordered;
        spec.exclusions = vec![Exclusion {
            entity: StepEntity::Event("x".to_string()),
            filters: None,
            from_step: 0,
            to_step: 1,
        }];
        assert_eq!(
            validation_err(build(spec)),
            ValidationError::PartialExclusionUnordered
        );
    }

    #[test]
    fn rejects_optional_first_step() {
        let mut spec = sequential_spec(&["a", "b"]);
        spec.steps[0].optional = true;
        assert_eq!(
            validation_err(build(spec)),
            ValidationError::OptionalFirstStep
        );
    }

    #[test]
    fn rejects_optional_step_before_identical_required() {
        let mut spec = sequential_spec(&["a", "b", "b"]);
        spec.steps[1].optional = true;
        assert_eq!(
            validation_err(build(spec)),
            ValidationError::OptionalStepDuplicate { step: 1 }
        );
    }

    #[test]
    fn unknown_action_fails_resolution() {
        let mut spec = sequential_spec(&["a", "b"]);
        spec.steps[1] = Step::action(42);
        match build(spec) {
            Err(QueryError::Resolution(e)) => {
                assert_eq!(e, crate::error::ResolutionError::ActionNotFound(42))
            }
            other => panic!("expected resolution error, got {other:?}"),
        }
    }

    #[test]
    fn test_account_filters_fold_into_the_query_predicate() {
        use common::query::PropValueOperation;
        use common::query::PropertyRef;

        let mut env = ctx_fixture();
        env.test_account_filters = Some(vec![PropValueFilter {
            property: PropertyRef::Actor("is_staff".to_string()),
            operation: PropValueOperation::False,
            value: None,
        }]);
        let ctx = QueryContext::build(
            env,
            sequential_spec(&["a", "b"]),
            &InMemoryActions::default(),
            &InMemoryCohorts::default(),
            &PassthroughProperties,
        )
        .unwrap();
        assert!(ctx.query_filter.is_some());
    }

    #[test]
    fn resolves_action_steps_at_build_time() {
        let mut actions = InMemoryActions::default();
        actions.insert(7, &["added_to_cart", "checkout_started"]);
        let mut spec = sequential_spec(&["a", "b"]);
        spec.steps[1] = Step::action(7);
        let ctx = QueryContext::build(
            ctx_fixture(),
            spec,
            &actions,
            &InMemoryCohorts::default(),
            &PassthroughProperties,
        )
        .unwrap();
        assert_eq!(
            ctx.steps[1].events.as_deref(),
            Some(
                &[
                    "added_to_cart".to_string(),
                    "checkout_started".to_string()
                ][..]
            )
        );
    }
}
