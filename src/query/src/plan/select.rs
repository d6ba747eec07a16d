use crate::plan::expr::Expr;
use crate::plan::expr::SortOrder;

/// A typed select tree. The compiler's output is one of these; rendering
/// to a concrete dialect happens elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectPlan {
    pub columns: Vec<Expr>,
    pub source: Source,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<(Expr, SortOrder)>,
    pub limit: Option<usize>,
    pub array_join: Option<ArrayJoin>,
}

impl SelectPlan {
    pub fn new(source: Source) -> Self {
        Self {
            columns: vec![],
            source,
            filter: None,
            group_by: vec![],
            having: None,
            order_by: vec![],
            limit: None,
            array_join: None,
        }
    }

    /// Wraps this plan as the source of a fresh outer select.
    pub fn wrap(self) -> SelectPlan {
        SelectPlan::new(Source::Subquery(Box::new(self)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayJoin {
    pub expr: Expr,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// The base event store: one row per candidate event.
    Events,
    /// A table outside the event store, addressed by name.
    External(String),
    Subquery(Box<SelectPlan>),
    /// UNION ALL of sub-selects with identical column shapes.
    Union(Vec<SelectPlan>),
    Join(Box<Join>),
    /// A synthetic row set of `0..n`, used by period-fill sub-plans.
    Numbers(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub left: Source,
    pub right: SelectPlan,
    pub kind: JoinKind,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Cross,
}

pub fn join(left: Source, right: SelectPlan, kind: JoinKind, on: Option<Expr>) -> Source {
    Source::Join(Box::new(Join {
        left,
        right,
        kind,
        on,
    }))
}
