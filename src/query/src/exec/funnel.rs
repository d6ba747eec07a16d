use arrow::array::Int64Array;
use arrow::array::TimestampMillisecondArray;
use arrow::record_batch::RecordBatch;
use chrono::Duration;
use common::funnel::Attribution;
use common::funnel::OrderType;
use common::funnel::StepMath;
use common::types::ALL_USERS_COHORT;
use common::types::COLUMN_ACTOR_ID;
use common::types::COLUMN_CREATED_AT;
use common::types::COLUMN_EVENT;
use indexmap::IndexMap;

use crate::context::QueryContext;
use crate::error::QueryError;
use crate::error::Result;
use crate::exec::evaluate;
use crate::exec::evaluate_batch_predicate;
use crate::exec::evaluate_predicate;
use crate::exec::value_key;
use crate::exec::ActorResult;
use crate::plan::expr::lit;
use crate::plan::expr::Expr;
use crate::plan::expr::Value;

#[derive(Debug, Clone)]
pub struct StepPredicate {
    /// Full row predicate: entity and property filters.
    pub expr: Expr,
    /// Entity-only predicate, the first-occurrence basis.
    pub entity: Option<Expr>,
    pub math: StepMath,
    pub optional: bool,
}

impl StepPredicate {
    fn same_definition(&self, other: &StepPredicate) -> bool {
        self.expr == other.expr
    }
}

#[derive(Debug, Clone)]
pub struct ExclusionPredicate {
    pub expr: Expr,
    pub from_step: usize,
    pub to_step: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakdownMode {
    FirstTouch,
    LastTouch,
    Step(usize),
    /// Array-join semantics: one result per distinct value.
    PerValue,
}

#[derive(Debug, Clone)]
pub struct BreakdownExtract {
    pub exprs: Vec<Expr>,
    pub mode: BreakdownMode,
}

/// Configuration of one single-pass evaluation. Input batches must be
/// sorted by `(actor, timestamp)` with each actor's rows contiguous.
#[derive(Debug, Clone)]
pub struct Options {
    pub actor_col: String,
    pub ts_col: String,
    pub event_col: String,
    pub from_ms: i64,
    pub to_ms: i64,
    pub window: Duration,
    pub order: OrderType,
    pub steps: Vec<StepPredicate>,
    pub exclusions: Vec<ExclusionPredicate>,
    pub constants: Vec<Expr>,
    pub breakdown: Option<BreakdownExtract>,
    /// Cohort memberships for cohort breakdowns; the synthetic all-users
    /// cohort id matches every actor.
    pub cohorts: Option<Vec<(u64, Vec<i64>)>>,
    pub filter: Option<Expr>,
}

impl Options {
    /// Engine configuration equivalent to the cascading plan a context
    /// compiles to. Cohort memberships cannot be derived from membership
    /// sub-plans; supply them with [`Options::with_cohorts`].
    pub fn from_context(ctx: &QueryContext) -> Options {
        let breakdown = ctx.breakdown.as_ref().and_then(|b| {
            if !b.cohort_plans.is_empty() {
                return None;
            }
            let mode = if b.raw_per_event || b.attribution == Attribution::AllEvents {
                BreakdownMode::PerValue
            } else {
                match &b.attribution {
                    Attribution::FirstTouch => BreakdownMode::FirstTouch,
                    Attribution::LastTouch => BreakdownMode::LastTouch,
                    Attribution::Step(n) => BreakdownMode::Step(*n),
                    Attribution::AllEvents => BreakdownMode::PerValue,
                }
            };
            Some(BreakdownExtract {
                exprs: b.exprs.clone(),
                mode,
            })
        });

        Options {
            actor_col: COLUMN_ACTOR_ID.to_string(),
            ts_col: COLUMN_CREATED_AT.to_string(),
            event_col: COLUMN_EVENT.to_string(),
            from_ms: ctx.from.timestamp_millis(),
            to_ms: ctx.to.timestamp_millis(),
            window: ctx.window,
            order: ctx.spec.order,
            steps: ctx
                .steps
                .iter()
                .map(|s| StepPredicate {
                    expr: s.predicate(),
                    entity: s.entity_expr.clone(),
                    math: s.math.clone(),
                    optional: s.optional,
                })
                .collect(),
            exclusions: ctx
                .exclusions
                .iter()
                .map(|e| ExclusionPredicate {
                    expr: e.expr.clone(),
                    from_step: e.from_step,
                    to_step: e.to_step,
                })
                .collect(),
            constants: ctx.constants.clone(),
            breakdown,
            cohorts: None,
            filter: ctx.query_filter.clone(),
        }
    }

    pub fn with_cohorts(mut self, cohorts: Vec<(u64, Vec<i64>)>) -> Options {
        self.cohorts = Some(cohorts);
        self
    }
}

/// One buffered event row of the current actor.
#[derive(Debug, Clone)]
struct Row {
    ts: i64,
    event: String,
    flags: Vec<bool>,
    /// First-occurrence basis per step; equals `flags` for plain steps.
    entity_flags: Vec<bool>,
    excl: Vec<bool>,
    constants: Vec<String>,
    breakdown: Option<Vec<String>>,
}

/// Partial chain outcome for one candidate entry row.
#[derive(Debug, Clone)]
struct Outcome {
    steps: usize,
    entry: i64,
    latests: Vec<Option<i64>>,
    cts: Vec<Option<i64>>,
    excluded: bool,
}

fn better(candidate: &Outcome, incumbent: &Outcome) -> bool {
    candidate.steps > incumbent.steps
        || (candidate.steps == incumbent.steps && candidate.entry < incumbent.entry)
}

/// The single-pass vectorized funnel evaluator: predicates evaluated
/// batch-at-a-time, then one forward walk per actor over its pre-sorted
/// event array, yielding the same per-actor tuple the cascading plan
/// computes.
#[derive(Debug)]
pub struct Funnel {
    opts: Options,
    cur_actor: Option<i64>,
    buffer: Vec<Row>,
    results: Vec<ActorResult>,
}

impl Funnel {
    pub fn try_new(opts: Options) -> Result<Funnel> {
        if opts.steps.len() < 2 {
            return Err(QueryError::Execution(
                "funnel evaluation needs at least two steps".to_string(),
            ));
        }

        Ok(Funnel {
            opts,
            cur_actor: None,
            buffer: vec![],
            results: vec![],
        })
    }

    pub fn evaluate(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }

        let step_flags = self
            .opts
            .steps
            .iter()
            .map(|s| evaluate_batch_predicate(&s.expr, batch))
            .collect::<Result<Vec<_>>>()?;
        let entity_flags = self
            .opts
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| match s.math {
                StepMath::Total | StepMath::FirstTimeForActorWithFilters => {
                    Ok(step_flags[i].clone())
                }
                StepMath::FirstTimeForActor => {
                    let basis = s.entity.clone().unwrap_or_else(|| lit(true));
                    evaluate_batch_predicate(&basis, batch)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let excl_flags = self
            .opts
            .exclusions
            .iter()
            .map(|e| evaluate_batch_predicate(&e.expr, batch))
            .collect::<Result<Vec<_>>>()?;

        let actors = downcast_i64(batch, &self.opts.actor_col)?;
        let ts = downcast_ts(batch, &self.opts.ts_col)?;

        for row in 0..batch.num_rows() {
            let t = ts.value(row);
            if t < self.opts.from_ms || t > self.opts.to_ms {
                continue;
            }
            if let Some(filter) = &self.opts.filter {
                if !evaluate_predicate(filter, batch, row)? {
                    continue;
                }
            }
            let actor = actors.value(row);
            if self.cur_actor != Some(actor) {
                self.flush();
                self.cur_actor = Some(actor);
            }

            let constants = self
                .opts
                .constants
                .iter()
                .map(|e| Ok(value_key(&evaluate(e, batch, row)?)))
                .collect::<Result<Vec<_>>>()?;
            let breakdown = match &self.opts.breakdown {
                Some(b) => Some(
                    b.exprs
                        .iter()
                        .map(|e| Ok(value_key(&evaluate(e, batch, row)?)))
                        .collect::<Result<Vec<_>>>()?,
                ),
                None => None,
            };
            self.buffer.push(Row {
                ts: t,
                event: match evaluate(&Expr::Column(self.opts.event_col.clone()), batch, row)? {
                    Value::String(s) => s,
                    other => value_key(&other),
                },
                flags: step_flags.iter().map(|f| f[row]).collect(),
                entity_flags: entity_flags.iter().map(|f| f[row]).collect(),
                excl: excl_flags.iter().map(|f| f[row]).collect(),
                constants,
                breakdown,
            });
        }

        Ok(())
    }

    pub fn finalize(mut self) -> Result<Vec<ActorResult>> {
        self.flush();
        Ok(self.results)
    }

    fn flush(&mut self) {
        let actor = match self.cur_actor {
            Some(a) => a,
            None => return,
        };
        if self.buffer.is_empty() {
            return;
        }
        let rows = std::mem::take(&mut self.buffer);
        self.results
            .extend(process_actor(&self.opts, actor, &rows));
    }
}

fn downcast_i64<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| QueryError::Execution(format!("unknown column {name}: {e}")))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| QueryError::Execution(format!("column {name} is not int64")))
}

fn downcast_ts<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a TimestampMillisecondArray> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| QueryError::Execution(format!("unknown column {name}: {e}")))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<TimestampMillisecondArray>()
        .ok_or_else(|| {
            QueryError::Execution(format!("column {name} is not a millisecond timestamp"))
        })
}

fn process_actor(opts: &Options, actor: i64, rows: &[Row]) -> Vec<ActorResult> {
    // first-time math: only the first qualifying occurrence may match
    let mut flags: Vec<Vec<bool>> = rows.iter().map(|r| r.flags.clone()).collect();
    for (i, step) in opts.steps.iter().enumerate() {
        if step.math == StepMath::Total {
            continue;
        }
        let mut seen = false;
        for (p, row) in rows.iter().enumerate() {
            if seen {
                flags[p][i] = false;
            }
            if row.entity_flags[i] {
                seen = true;
            }
        }
    }

    let mut names: Vec<String> = rows.iter().map(|r| r.event.clone()).collect();
    names.sort_unstable();
    names.dedup();

    let per_value = matches!(
        &opts.breakdown,
        Some(BreakdownExtract {
            mode: BreakdownMode::PerValue,
            ..
        })
    );
    let mut groups: IndexMap<(Vec<String>, Option<Vec<String>>), Vec<usize>> = IndexMap::new();
    for (p, row) in rows.iter().enumerate() {
        let key = (
            row.constants.clone(),
            if per_value { row.breakdown.clone() } else { None },
        );
        groups.entry(key).or_default().push(p);
    }

    let mut out = vec![];
    if per_value {
        let mut best_per_value: IndexMap<Vec<String>, Outcome> = IndexMap::new();
        for ((_, value), idxs) in &groups {
            let outcome = match best_chain(opts, rows, idxs, &flags) {
                Some(o) => o,
                None => continue,
            };
            let key = value.clone().unwrap_or_default();
            match best_per_value.get_mut(&key) {
                Some(cur) if !better(&outcome, cur) => {}
                Some(cur) => *cur = outcome,
                None => {
                    best_per_value.insert(key, outcome);
                }
            }
        }
        for (value, outcome) in best_per_value {
            let outcome = apply_exclusions(opts, rows, outcome);
            out.push(to_result(actor, outcome, Some(value), &names));
        }
        return out;
    }

    let mut best: Option<Outcome> = None;
    for idxs in groups.values() {
        if let Some(outcome) = best_chain(opts, rows, idxs, &flags) {
            match &best {
                Some(cur) if !better(&outcome, cur) => {}
                _ => best = Some(outcome),
            }
        }
    }
    let outcome = match best {
        Some(o) => apply_exclusions(opts, rows, o),
        None => return out,
    };

    match &opts.cohorts {
        Some(cohorts) => {
            for (id, members) in cohorts {
                if *id == ALL_USERS_COHORT || members.contains(&actor) {
                    out.push(to_result(
                        actor,
                        outcome.clone(),
                        Some(vec![id.to_string()]),
                        &names,
                    ));
                }
            }
        }
        None => {
            let breakdown = attribute(opts, rows, &flags);
            out.push(to_result(actor, outcome, breakdown, &names));
        }
    }

    out
}

fn best_chain(
    opts: &Options,
    rows: &[Row],
    idxs: &[usize],
    flags: &[Vec<bool>],
) -> Option<Outcome> {
    let k = opts.steps.len();
    match opts.order {
        OrderType::Sequential => {
            let perm: Vec<usize> = (0..k).collect();
            chain_closed_form(opts, rows, idxs, flags, &perm)
        }
        OrderType::Strict => {
            let perm: Vec<usize> = (0..k).collect();
            chain_walk_strict(opts, rows, idxs, flags, &perm)
        }
        OrderType::Unordered => {
            let mut best: Option<Outcome> = None;
            for rotation in 0..k {
                let perm: Vec<usize> = (0..k).map(|j| (j + rotation) % k).collect();
                if let Some(outcome) = chain_closed_form(opts, rows, idxs, flags, &perm) {
                    match &best {
                        Some(cur) if !better(&outcome, cur) => {}
                        _ => best = Some(outcome),
                    }
                }
            }
            best
        }
    }
}

fn chain_comparator_ok(opts: &Options, perm: &[usize], j: usize, prev: i64, cur: i64) -> bool {
    let step = &opts.steps[perm[j]];
    if step.optional {
        prev <= cur
    } else if step.same_definition(&opts.steps[perm[j - 1]]) {
        prev < cur
    } else {
        prev <= cur
    }
}

/// Closed form of the cascading windowed fold: after the levels are
/// folded, `latest_j` for a row is the earliest step-`j` event at least
/// `j` rows later (each level excludes the current row), and the chain
/// closure then walks the effective latests. The duplicate-step rule
/// lives entirely in the comparator.
fn chain_closed_form(
    opts: &Options,
    rows: &[Row],
    idxs: &[usize],
    flags: &[Vec<bool>],
    perm: &[usize],
) -> Option<Outcome> {
    let k = perm.len();
    let m = idxs.len();
    let ts: Vec<i64> = idxs.iter().map(|&p| rows[p].ts).collect();
    let f: Vec<Vec<bool>> = perm
        .iter()
        .map(|&step| idxs.iter().map(|&p| flags[p][step]).collect())
        .collect();

    // next[j][q]: earliest position >= q where step j fired
    let mut next = vec![vec![usize::MAX; m + 1]; k];
    for j in 0..k {
        let mut nxt = usize::MAX;
        for q in (0..m).rev() {
            if f[j][q] {
                nxt = q;
            }
            next[j][q] = nxt;
        }
    }

    let window_ms = opts.window.num_milliseconds();
    let mut best: Option<Outcome> = None;
    for q in 0..m {
        if !f[0][q] {
            continue;
        }
        let entry = ts[q];
        let mut latests: Vec<Option<i64>> = vec![None; k];
        let mut eff: Vec<Option<i64>> = vec![None; k];
        latests[0] = Some(entry);
        eff[0] = Some(entry);
        let mut reached = 1;
        let mut broken = false;
        let mut cts: Vec<Option<i64>> = vec![None; k];
        for j in 1..k {
            let latest = if q + j < m {
                match next[j][q + j] {
                    usize::MAX => None,
                    pos => Some(ts[pos]),
                }
            } else {
                None
            };
            latests[j] = latest;
            eff[j] = if opts.steps[perm[j]].optional {
                latest.or(eff[j - 1])
            } else {
                latest
            };

            if let (Some(prev), Some(cur)) = (eff[j - 1], latests[j]) {
                let gap = cur - prev;
                if chain_comparator_ok(opts, perm, j, prev, cur) && gap <= window_ms {
                    cts[j] = Some(gap / 1000);
                }
            }

            if !broken {
                let ok = match (eff[j - 1], eff[j]) {
                    (Some(prev), Some(cur)) => {
                        chain_comparator_ok(opts, perm, j, prev, cur)
                            && cur <= entry + window_ms
                    }
                    _ => false,
                };
                if ok {
                    reached = j + 1;
                } else {
                    broken = true;
                }
            }
        }

        let outcome = Outcome {
            steps: reached,
            entry,
            latests,
            cts,
            excluded: false,
        };
        match &best {
            Some(cur) if !better(&outcome, cur) => {}
            _ => best = Some(outcome),
        }
    }

    best
}

/// Strict walk: each step must be the actor's very next visible event;
/// an unmatched optional step is skipped without consuming a row.
fn chain_walk_strict(
    opts: &Options,
    rows: &[Row],
    idxs: &[usize],
    flags: &[Vec<bool>],
    perm: &[usize],
) -> Option<Outcome> {
    let k = perm.len();
    let m = idxs.len();
    let ts: Vec<i64> = idxs.iter().map(|&p| rows[p].ts).collect();
    let f: Vec<Vec<bool>> = perm
        .iter()
        .map(|&step| idxs.iter().map(|&p| flags[p][step]).collect())
        .collect();

    let window_ms = opts.window.num_milliseconds();
    let mut best: Option<Outcome> = None;
    for q in 0..m {
        if !f[0][q] {
            continue;
        }
        let entry = ts[q];
        let mut latests: Vec<Option<i64>> = vec![None; k];
        let mut cts: Vec<Option<i64>> = vec![None; k];
        latests[0] = Some(entry);
        let mut reached = 1;
        let mut pos = q;
        let mut prev_ts = entry;
        for j in 1..k {
            let candidate = pos + 1;
            if candidate < m && f[j][candidate] && ts[candidate] <= entry + window_ms {
                latests[j] = Some(ts[candidate]);
                cts[j] = Some((ts[candidate] - prev_ts) / 1000);
                prev_ts = ts[candidate];
                pos = candidate;
                reached = j + 1;
            } else if opts.steps[perm[j]].optional {
                // bridged: progress continues without consuming a row
                reached = j + 1;
            } else {
                break;
            }
        }

        let outcome = Outcome {
            steps: reached,
            entry,
            latests,
            cts,
            excluded: false,
        };
        match &best {
            Some(cur) if !better(&outcome, cur) => {}
            _ => best = Some(outcome),
        }
    }

    best
}

fn apply_exclusions(opts: &Options, rows: &[Row], mut outcome: Outcome) -> Outcome {
    let window_ms = opts.window.num_milliseconds();
    for (k, exclusion) in opts.exclusions.iter().enumerate() {
        let from = match outcome.latests.get(exclusion.from_step).copied().flatten() {
            Some(v) => v,
            None => continue,
        };
        let bound = from + window_ms;
        let upper = match outcome.latests.get(exclusion.to_step).copied().flatten() {
            Some(to) => to.min(bound),
            None => bound,
        };
        let hit = rows.iter().any(|r| r.excl[k] && r.ts > from && r.ts < upper);
        if hit {
            let clamp = exclusion.from_step + 1;
            if outcome.steps > clamp {
                outcome.steps = clamp;
            }
            for ct in outcome.cts.iter_mut().skip(exclusion.from_step + 1) {
                *ct = None;
            }
            outcome.excluded = true;
        }
    }

    outcome
}

fn attribute(opts: &Options, rows: &[Row], flags: &[Vec<bool>]) -> Option<Vec<String>> {
    let breakdown = opts.breakdown.as_ref()?;
    let arity = breakdown.exprs.len();
    let values = |p: usize| -> Vec<String> {
        rows[p].breakdown.clone().unwrap_or_else(|| vec![String::new(); arity])
    };

    Some(match &breakdown.mode {
        BreakdownMode::FirstTouch => (0..arity)
            .map(|i| {
                rows.iter()
                    .find(|r| non_empty(r, i))
                    .map(|r| r.breakdown.as_ref().unwrap()[i].clone())
                    .unwrap_or_default()
            })
            .collect(),
        BreakdownMode::LastTouch => (0..arity)
            .map(|i| {
                rows.iter()
                    .rev()
                    .find(|r| non_empty(r, i))
                    .map(|r| r.breakdown.as_ref().unwrap()[i].clone())
                    .unwrap_or_default()
            })
            .collect(),
        BreakdownMode::Step(n) => match (0..rows.len()).find(|&p| flags[p][*n]) {
            Some(p) => values(p),
            None => vec![String::new(); arity],
        },
        BreakdownMode::PerValue => unreachable!("per-value attribution never aggregates here"),
    })
}

fn non_empty(row: &Row, idx: usize) -> bool {
    row.breakdown
        .as_ref()
        .map(|b| !b[idx].is_empty())
        .unwrap_or(false)
}

fn to_result(
    actor: i64,
    outcome: Outcome,
    breakdown: Option<Vec<String>>,
    names: &[String],
) -> ActorResult {
    ActorResult {
        actor_id: actor,
        steps: outcome.steps,
        entry_ts: Some(outcome.entry),
        latests: outcome.latests,
        conversion_times: outcome.cts,
        breakdown,
        excluded: outcome.excluded,
        events_seen: names.to_vec(),
    }
}
