use std::result;

use common::error::CommonError;
use thiserror::Error;

pub type Result<T> = result::Result<T, QueryError>;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("validation {0:?}")]
    Validation(#[from] ValidationError),
    #[error("resolution {0:?}")]
    Resolution(#[from] ResolutionError),
    #[error("plan {0:?}")]
    Plan(String),
    #[error("execution {0:?}")]
    Execution(String),
    #[error("common {0:?}")]
    Common(#[from] CommonError),
}

/// User-correctable spec defects. All raised while the query context is
/// built, never after plan construction has started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("funnel needs at least two steps, got {0}")]
    TooFewSteps(usize),
    #[error("step range {from}..{to} is invalid for {steps} steps")]
    StepRangeInvalid { from: usize, to: usize, steps: usize },
    #[error("exclusion range {from}..{to} is invalid for {steps} steps")]
    ExclusionRangeInvalid { from: usize, to: usize, steps: usize },
    #[error("exclusion matches step {step} inside its own range")]
    ExclusionMatchesStep { step: usize },
    #[error("unordered funnels only support exclusions spanning every step")]
    PartialExclusionUnordered,
    #[error("optional steps are not supported for unordered funnels")]
    OptionalStepOrder,
    #[error("optional steps are only supported for the steps visualization")]
    OptionalStepViz,
    #[error("the first step cannot be optional")]
    OptionalFirstStep,
    #[error("optional step {step} is followed by an identical required step")]
    OptionalStepDuplicate { step: usize },
    #[error("optional step {step} lies inside an exclusion range")]
    OptionalStepExcluded { step: usize },
    #[error("optional step {step} cannot be an attribution target")]
    OptionalStepAttribution { step: usize },
    #[error("unsupported breakdown: {0}")]
    UnsupportedBreakdown(String),
    #[error("external-source step is not supported: {0}")]
    ExternalStepUnsupported(String),
    #[error("holding constants are not supported for unordered funnels")]
    HoldingConstantUnsupported,
}

/// External-dependency failures surfaced while resolving the spec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("action {0} not found")]
    ActionNotFound(u64),
    #[error("cohort {0} not found")]
    CohortNotFound(u64),
    #[error("property {0} not found")]
    PropertyNotFound(String),
}
