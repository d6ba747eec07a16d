use std::collections::HashMap;
use std::collections::HashSet;

use ahash::RandomState;
use indexmap::IndexMap;

use crate::aggregate::per_actor_plan;
use crate::aggregate::StepsBucket;
use crate::aggregate::StepsResult;
use crate::breakdown;
use crate::context::QueryContext;
use crate::conversion_time_col;
use crate::error::Result;
use crate::exec::ActorResult;
use crate::plan::expr::aggregate_if;
use crate::plan::expr::binary_expr;
use crate::plan::expr::col;
use crate::plan::expr::is_not_null;
use crate::plan::expr::lit;
use crate::plan::expr::AggregateFunction;
use crate::plan::expr::Expr;
use crate::plan::expr::Operator;
use crate::plan::select::SelectPlan;
use crate::COLUMN_STEPS;

/// Step-count aggregation: `countIf(steps = i)` per step over the
/// per-actor roll-up. The windowing pass already resolved `steps` to the
/// maximal satisfying prefix, so no extra dedup happens here.
pub fn build(ctx: &QueryContext, windowed: SelectPlan) -> SelectPlan {
    let collapsed = breakdown::collapsed_value_exprs(ctx, &windowed);
    let per_actor = per_actor_plan(ctx, windowed);

    let mut plan = per_actor.wrap();
    let mut columns: Vec<Expr> = vec![];
    let mut group_by: Vec<Expr> = vec![];
    for e in &collapsed {
        columns.push(e.clone());
        group_by.push(e.unaliased().clone());
    }
    for i in 0..ctx.max_steps {
        columns.push(
            aggregate_if(
                AggregateFunction::Count,
                vec![],
                binary_expr(col(COLUMN_STEPS), Operator::GtEq, lit((i + 1) as i64)),
            )
            .alias(format!("step_{i}_total")),
        );
        columns.push(
            aggregate_if(
                AggregateFunction::Count,
                vec![],
                binary_expr(col(COLUMN_STEPS), Operator::Eq, lit((i + 1) as i64)),
            )
            .alias(format!("step_{i}_exact")),
        );
    }
    for i in 1..ctx.max_steps {
        let ct = col(conversion_time_col(i));
        columns.push(
            aggregate_if(AggregateFunction::Avg, vec![ct.clone()], is_not_null(ct))
                .alias(format!("step_{i}_time_to_convert")),
        );
    }
    plan.columns = columns;
    plan.group_by = group_by;

    plan
}

#[derive(Clone)]
struct Acc {
    total: Vec<i64>,
    exact: Vec<i64>,
    ct_sum: Vec<f64>,
    ct_cnt: Vec<i64>,
}

impl Acc {
    fn new(max_steps: usize) -> Self {
        Self {
            total: vec![0; max_steps],
            exact: vec![0; max_steps],
            ct_sum: vec![0.0; max_steps],
            ct_cnt: vec![0; max_steps],
        }
    }

    fn add(&mut self, actor: &ActorResult) {
        for i in 0..self.total.len() {
            if actor.steps >= i + 1 {
                self.total[i] += 1;
            }
            if actor.steps == i + 1 {
                self.exact[i] += 1;
            }
        }
        for i in 1..self.total.len() {
            if let Some(ct) = actor.conversion_times.get(i).copied().flatten() {
                self.ct_sum[i] += ct as f64;
                self.ct_cnt[i] += 1;
            }
        }
    }

    fn merge(&mut self, other: &Acc) {
        for i in 0..self.total.len() {
            self.total[i] += other.total[i];
            self.exact[i] += other.exact[i];
            self.ct_sum[i] += other.ct_sum[i];
            self.ct_cnt[i] += other.ct_cnt[i];
        }
    }

    fn finish(self, breakdown: Option<Vec<String>>) -> StepsBucket {
        let avg = self
            .ct_cnt
            .iter()
            .zip(self.ct_sum.iter())
            .map(|(cnt, sum)| if *cnt > 0 { Some(sum / *cnt as f64) } else { None })
            .collect();
        StepsBucket {
            breakdown,
            total: self.total,
            exact: self.exact,
            avg_time_to_convert: avg,
        }
    }
}

/// Single-pass counterpart of [`build`]: folds per-actor tuples into the
/// same output shape. Array-join attribution may repeat an actor across
/// buckets; the deduplicated totals count each actor once at their
/// deepest reach.
pub fn from_actors(ctx: &QueryContext, actors: &[ActorResult]) -> Result<StepsResult> {
    let max_steps = ctx.max_steps;

    let mut best: HashMap<i64, &ActorResult, RandomState> = HashMap::default();
    for actor in actors {
        best.entry(actor.actor_id)
            .and_modify(|cur| {
                if actor.steps > cur.steps
                    || (actor.steps == cur.steps && actor.entry_ts < cur.entry_ts)
                {
                    *cur = actor;
                }
            })
            .or_insert(actor);
    }
    let mut totals = Acc::new(max_steps);
    let mut actor_ids: Vec<i64> = best.keys().copied().collect();
    actor_ids.sort_unstable();
    for id in actor_ids {
        totals.add(best[&id]);
    }
    let totals = totals.finish(None);

    if ctx.breakdown.is_none() {
        return Ok(StepsResult {
            buckets: vec![totals.clone()],
            totals,
        });
    }

    let mut accs: IndexMap<Vec<String>, Acc> = IndexMap::new();
    let mut seen: HashSet<(i64, Vec<String>), RandomState> = HashSet::default();
    for actor in actors {
        let key = actor.breakdown.clone().unwrap_or_default();
        if !seen.insert((actor.actor_id, key.clone())) {
            continue;
        }
        accs.entry(key)
            .or_insert_with(|| Acc::new(max_steps))
            .add(actor);
    }

    // rank buckets by from-step reach, collapse overflow into "Other"
    let limit = ctx.breakdown.as_ref().and_then(|b| b.spec.limit);
    let ranked: Vec<(Vec<String>, i64)> = accs
        .iter()
        .map(|(k, acc)| (k.clone(), acc.total[ctx.from_step]))
        .collect();
    let collapsed = breakdown::collapse_other(ranked, limit);

    let mut kept: IndexMap<Vec<String>, Acc> = IndexMap::new();
    let mut other: Option<(Vec<String>, Acc)> = None;
    let keep_keys: HashSet<&Vec<String>> = collapsed.iter().map(|(k, _)| k).collect();
    for (key, _) in &collapsed {
        if let Some(acc) = accs.get(key) {
            kept.insert(key.clone(), acc.clone());
        } else {
            // the synthetic "Other" bucket
            other = Some((key.clone(), Acc::new(max_steps)));
        }
    }
    if let Some((other_key, other_acc)) = &mut other {
        for (key, acc) in &accs {
            if !keep_keys.contains(key) {
                other_acc.merge(acc);
            }
        }
        kept.insert(other_key.clone(), other_acc.clone());
    }

    let buckets = kept
        .into_iter()
        .map(|(key, acc)| acc.finish(Some(key)))
        .collect();

    Ok(StepsResult { totals, buckets })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::actor_result;
    use crate::test_util::build_ctx;
    use crate::test_util::sequential_spec;

    #[test]
    fn totals_count_each_reach_level() {
        let ctx = build_ctx(sequential_spec(&["a", "b", "c"]));
        let actors = vec![
            actor_result(1, 3, &[None, Some(10), Some(20)]),
            actor_result(2, 2, &[None, Some(30), None]),
            actor_result(3, 1, &[None, None, None]),
        ];
        let res = from_actors(&ctx, &actors).unwrap();
        assert_eq!(res.totals.total, vec![3, 2, 1]);
        assert_eq!(res.totals.exact, vec![1, 1, 1]);
        assert_eq!(res.totals.avg_time_to_convert[1], Some(20.0));
        assert_eq!(res.totals.avg_time_to_convert[2], Some(20.0));
    }

    #[test]
    fn duplicate_actor_entries_keep_deepest_reach() {
        let ctx = build_ctx(sequential_spec(&["a", "b"]));
        let mut first = actor_result(1, 1, &[None, None]);
        first.breakdown = Some(vec!["x".to_string()]);
        let mut second = actor_result(1, 2, &[None, Some(5)]);
        second.breakdown = Some(vec!["y".to_string()]);
        let res = from_actors(&ctx, &[first, second]).unwrap();
        assert_eq!(res.totals.total, vec![1, 1]);
    }
}
