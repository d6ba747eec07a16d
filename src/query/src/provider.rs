use common::query::PropertyRef;

use crate::error::Result;
use crate::plan::SelectPlan;

/// Resolves an action id to the set of concrete event names it matches.
/// Any backing store works; the compiler only calls this while building a
/// query context.
pub trait ActionRepository: Send + Sync {
    fn resolve_step_events(&self, action_id: u64) -> Result<Vec<String>>;
}

/// Resolves a cohort id to a `(person_id, cohort_id)` membership sub-plan.
pub trait CohortRepository: Send + Sync {
    fn membership_plan(&self, cohort_id: u64) -> Result<SelectPlan>;
}

/// Maps property references to the columns that carry them.
pub trait PropertyRepository: Send + Sync {
    fn column_name(&self, prop: &PropertyRef) -> Result<String>;
}
