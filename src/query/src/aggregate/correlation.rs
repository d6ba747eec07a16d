use std::collections::HashMap;

use ahash::RandomState;
use common::types::COLUMN_ACTOR_ID;
use common::types::COLUMN_EVENT;

use crate::context::QueryContext;
use crate::error::Result;
use crate::exec::ActorResult;
use crate::plan::expr::binary_expr;
use crate::plan::expr::col;
use crate::plan::expr::lit;
use crate::plan::expr::AggregateFunction;
use crate::plan::expr::Expr;
use crate::plan::expr::Operator;
use crate::plan::expr::SortOrder;
use crate::plan::select::join;
use crate::plan::select::JoinKind;
use crate::plan::select::SelectPlan;
use crate::plan::select::Source;
use crate::COLUMN_STEPS;

/// Laplace smoothing prior for the contingency counts.
const PRIOR: f64 = 1.0;
/// Absolute floor of the significance threshold.
const MIN_SAMPLE_ABS: f64 = 25.0;
/// Relative floor: two percent of the population.
const MIN_SAMPLE_RATIO: f64 = 0.02;
/// Results returned per side of 1.0.
const TOP_PER_SIDE: usize = 10;
/// Success:failure imbalance beyond which correlation is unreliable.
const SKEW_RATIO: i64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct EventStats {
    pub event: String,
    pub success_count: i64,
    pub failure_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationType {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationRecord {
    pub event: String,
    pub success_count: i64,
    pub failure_count: i64,
    pub odds_ratio: f64,
    pub correlation_type: CorrelationType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationResult {
    pub success: Vec<CorrelationRecord>,
    pub failure: Vec<CorrelationRecord>,
    /// Set when the success:failure ratio exceeds 10:1 either way;
    /// downstream should warn that correlation is unreliable.
    pub skewed: bool,
}

/// Laplace-smoothed odds ratio of one event's contingency table against
/// the global totals.
pub fn odds_ratio(stats: &EventStats, success_total: i64, failure_total: i64) -> f64 {
    let s = stats.success_count as f64;
    let f = stats.failure_count as f64;
    let st = success_total as f64;
    let ft = failure_total as f64;

    ((s + PRIOR) * (ft - f + PRIOR)) / ((st - s + PRIOR) * (f + PRIOR))
}

/// Events observed fewer times than this are statistically insignificant.
pub fn significance_floor(total: i64) -> f64 {
    MIN_SAMPLE_ABS.min(MIN_SAMPLE_RATIO * total as f64)
}

pub fn is_skewed(success_total: i64, failure_total: i64) -> bool {
    success_total > SKEW_RATIO * failure_total || failure_total > SKEW_RATIO * success_total
}

/// Ranks per-event contingency tables into the top correlators on each
/// side of 1.0, dropping insignificant events.
pub fn correlate(
    stats: Vec<EventStats>,
    success_total: i64,
    failure_total: i64,
) -> CorrelationResult {
    let floor = significance_floor(success_total + failure_total);
    let mut scored: Vec<CorrelationRecord> = stats
        .into_iter()
        .filter(|s| (s.success_count + s.failure_count) as f64 >= floor)
        .map(|s| {
            let ratio = odds_ratio(&s, success_total, failure_total);
            CorrelationRecord {
                event: s.event,
                success_count: s.success_count,
                failure_count: s.failure_count,
                odds_ratio: ratio,
                correlation_type: if ratio > 1.0 {
                    CorrelationType::Success
                } else {
                    CorrelationType::Failure
                },
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.odds_ratio
            .partial_cmp(&a.odds_ratio)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.event.cmp(&b.event))
    });
    let success: Vec<_> = scored
        .iter()
        .filter(|r| r.correlation_type == CorrelationType::Success)
        .take(TOP_PER_SIDE)
        .cloned()
        .collect();
    let mut failure: Vec<_> = scored
        .iter()
        .filter(|r| r.correlation_type == CorrelationType::Failure)
        .cloned()
        .collect();
    failure.reverse();
    failure.truncate(TOP_PER_SIDE);

    CorrelationResult {
        success,
        failure,
        skewed: is_skewed(success_total, failure_total),
    }
}

/// Correlation plan: per-event contingency counts over the entered-actor
/// population, odds ratio computed in the projection.
pub fn build(ctx: &QueryContext, windowed: SelectPlan) -> SelectPlan {
    // per-actor success flag
    let mut actors = windowed.clone().wrap();
    actors.filter = Some(binary_expr(
        col(COLUMN_STEPS),
        Operator::GtEq,
        lit((ctx.from_step + 1) as i64),
    ));
    actors.columns = vec![
        col(COLUMN_ACTOR_ID),
        Expr::Aggregate {
            fun: AggregateFunction::Max,
            args: vec![col(COLUMN_STEPS)],
            predicate: None,
            distinct: false,
        }
        .alias(COLUMN_STEPS),
    ];
    actors.group_by = vec![col(COLUMN_ACTOR_ID)];

    let success = binary_expr(
        col(COLUMN_STEPS),
        Operator::GtEq,
        lit((ctx.to_step + 1) as i64),
    );
    let distinct_if = |predicate: Expr| Expr::Aggregate {
        fun: AggregateFunction::Count,
        args: vec![col(COLUMN_ACTOR_ID)],
        predicate: Some(Box::new(predicate)),
        distinct: true,
    };

    let totals = |predicate: Expr| {
        let mut plan = actors.clone().wrap();
        plan.columns = vec![distinct_if(predicate)];
        Expr::ScalarSubquery(Box::new(plan))
    };
    let success_total = totals(success.clone());
    let failure_total = totals(Expr::Not(Box::new(success.clone())));

    // event rows joined back onto the actor population
    let mut plan = SelectPlan::new(join(
        Source::Events,
        actors,
        JoinKind::Inner,
        Some(binary_expr(
            col(COLUMN_ACTOR_ID),
            Operator::Eq,
            col(COLUMN_ACTOR_ID),
        )),
    ));
    let success_count = distinct_if(success.clone());
    let failure_count = distinct_if(Expr::Not(Box::new(success)));
    let prior = lit(PRIOR);
    let odds = binary_expr(
        binary_expr(
            binary_expr(success_count.clone(), Operator::Plus, prior.clone()),
            Operator::Multiply,
            binary_expr(
                binary_expr(
                    failure_total.clone(),
                    Operator::Minus,
                    failure_count.clone(),
                ),
                Operator::Plus,
                prior.clone(),
            ),
        ),
        Operator::Divide,
        binary_expr(
            binary_expr(
                binary_expr(success_total.clone(), Operator::Minus, success_count.clone()),
                Operator::Plus,
                prior.clone(),
            ),
            Operator::Multiply,
            binary_expr(failure_count.clone(), Operator::Plus, prior),
        ),
    );
    plan.columns = vec![
        col(COLUMN_EVENT),
        success_count.alias("success_count"),
        failure_count.alias("failure_count"),
        odds.clone().alias("odds_ratio"),
    ];
    plan.group_by = vec![col(COLUMN_EVENT)];
    plan.order_by = vec![(odds, SortOrder::Desc)];

    plan
}

/// Single-pass counterpart of [`build`], fed by the per-actor event sets
/// the engine collects.
pub fn from_actors(ctx: &QueryContext, actors: &[ActorResult]) -> Result<CorrelationResult> {
    // deepest reach per actor
    let mut best: HashMap<i64, &ActorResult, RandomState> = HashMap::default();
    for actor in actors {
        best.entry(actor.actor_id)
            .and_modify(|cur| {
                if actor.steps > cur.steps {
                    *cur = actor;
                }
            })
            .or_insert(actor);
    }

    let mut success_total = 0i64;
    let mut failure_total = 0i64;
    let mut stats: HashMap<String, (i64, i64), RandomState> = HashMap::default();
    for actor in best.values() {
        if actor.steps < ctx.from_step + 1 {
            continue;
        }
        let success = actor.steps >= ctx.to_step + 1;
        if success {
            success_total += 1;
        } else {
            failure_total += 1;
        }
        for event in &actor.events_seen {
            let slot = stats.entry(event.clone()).or_insert((0, 0));
            if success {
                slot.0 += 1;
            } else {
                slot.1 += 1;
            }
        }
    }

    let mut stats: Vec<EventStats> = stats
        .into_iter()
        .map(|(event, (s, f))| EventStats {
            event,
            success_count: s,
            failure_count: f,
        })
        .collect();
    stats.sort_by(|a, b| a.event.cmp(&b.event));

    Ok(correlate(stats, success_total, failure_total))
}
