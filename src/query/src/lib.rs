pub mod actors;
pub mod aggregate;
pub mod breakdown;
pub mod context;
pub mod error;
pub mod exclusion;
pub mod exec;
pub mod expr;
pub mod funnel;
pub mod plan;
pub mod provider;
pub mod sources;
pub mod steps;
pub mod test_util;

pub use context::Context;
pub use context::QueryContext;
pub use error::Result;

pub const COLUMN_STEPS: &str = "steps";
pub const COLUMN_ENTRY_PERIOD: &str = "entry_period";
pub const COLUMN_TOTAL_CONVERSION_TIME: &str = "total_conversion_time";

pub fn step_col(step: usize) -> String {
    format!("step_{step}")
}

pub fn latest_col(step: usize) -> String {
    format!("latest_{step}")
}

pub fn conversion_time_col(step: usize) -> String {
    format!("step_{step}_conversion_time")
}

pub fn exclusion_col(idx: usize) -> String {
    format!("exclusion_{idx}")
}

pub fn constant_col(idx: usize) -> String {
    format!("constant_{idx}")
}

pub fn breakdown_col_name(idx: usize) -> String {
    format!("breakdown_{idx}")
}
