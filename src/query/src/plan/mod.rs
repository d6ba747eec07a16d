pub mod expr;
pub mod select;

pub use expr::Expr;
pub use select::SelectPlan;
pub use select::Source;
