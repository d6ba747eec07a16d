//! In-memory repositories and fixtures shared by unit and integration
//! tests.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::Int64Array;
use arrow::array::StringArray;
use arrow::array::TimestampMillisecondArray;
use arrow::datatypes::DataType;
use arrow::datatypes::Field;
use arrow::datatypes::Schema;
use arrow::datatypes::TimeUnit;
use arrow::record_batch::RecordBatch;
use chrono::TimeZone;
use chrono::Utc;
use common::funnel::ConversionWindow;
use common::funnel::Funnel;
use common::funnel::OrderType;
use common::funnel::Step;
use common::funnel::VizMode;
use common::query::PropertyRef;
use common::query::QueryTime;
use common::query::TimeIntervalUnit;
use common::types::COLUMN_ACTOR_ID;
use common::types::COLUMN_CREATED_AT;
use common::types::COLUMN_EVENT;
use common::types::COLUMN_PERSON_ID;

use crate::context::Context;
use crate::context::QueryContext;
use crate::error::ResolutionError;
use crate::error::Result;
use crate::exec::ActorResult;
use crate::plan::expr::col;
use crate::plan::expr::lit;
use crate::plan::expr::Expr;
use crate::plan::select::SelectPlan;
use crate::plan::select::Source;
use crate::provider::ActionRepository;
use crate::provider::CohortRepository;
use crate::provider::PropertyRepository;

#[derive(Debug, Default)]
pub struct InMemoryActions {
    actions: HashMap<u64, Vec<String>>,
}

impl InMemoryActions {
    pub fn insert(&mut self, action_id: u64, events: &[&str]) {
        self.actions
            .insert(action_id, events.iter().map(|e| e.to_string()).collect());
    }
}

impl ActionRepository for InMemoryActions {
    fn resolve_step_events(&self, action_id: u64) -> Result<Vec<String>> {
        self.actions
            .get(&action_id)
            .cloned()
            .ok_or_else(|| ResolutionError::ActionNotFound(action_id).into())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCohorts {
    cohorts: HashMap<u64, Vec<i64>>,
}

impl InMemoryCohorts {
    pub fn insert(&mut self, cohort_id: u64, members: &[i64]) {
        self.cohorts.insert(cohort_id, members.to_vec());
    }
}

impl CohortRepository for InMemoryCohorts {
    fn membership_plan(&self, cohort_id: u64) -> Result<SelectPlan> {
        let members = self
            .cohorts
            .get(&cohort_id)
            .ok_or(ResolutionError::CohortNotFound(cohort_id))?;
        let mut plan = SelectPlan::new(Source::Events);
        plan.columns = vec![
            col(COLUMN_ACTOR_ID).alias(COLUMN_PERSON_ID),
            lit(cohort_id as i64).alias("cohort_id"),
        ];
        plan.filter = Some(Expr::In {
            expr: Box::new(col(COLUMN_ACTOR_ID)),
            list: members.iter().map(|m| lit(*m)).collect(),
            negated: false,
        });
        plan.group_by = vec![col(COLUMN_ACTOR_ID)];

        Ok(plan)
    }
}

/// Maps every property reference straight to a column of the same name.
#[derive(Debug, Clone, Copy)]
pub struct PassthroughProperties;

impl PropertyRepository for PassthroughProperties {
    fn column_name(&self, prop: &PropertyRef) -> Result<String> {
        Ok(prop.name())
    }
}

pub fn ctx_fixture() -> Context {
    Context::new(1, Utc.with_ymd_and_hms(2023, 1, 31, 0, 0, 0).unwrap())
}

/// Sequential steps funnel over January 2023 with a 7-day window.
pub fn sequential_spec(events: &[&str]) -> Funnel {
    Funnel {
        time: QueryTime::Between {
            from: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2023, 1, 31, 0, 0, 0).unwrap(),
        },
        steps: events.iter().map(|e| Step::event(e)).collect(),
        order: OrderType::Sequential,
        conversion_window: ConversionWindow {
            n: 7,
            unit: TimeIntervalUnit::Day,
        },
        from_step: None,
        to_step: None,
        exclusions: vec![],
        breakdown: None,
        viz: VizMode::Steps,
        filters: None,
        holding_constants: None,
        interval: None,
        bin_count: None,
    }
}

pub fn build_ctx(spec: Funnel) -> QueryContext {
    QueryContext::build(
        ctx_fixture(),
        spec,
        &InMemoryActions::default(),
        &InMemoryCohorts::default(),
        &PassthroughProperties,
    )
    .unwrap()
}

/// Actor tuple with the given reach and conversion times, entering at
/// the epoch.
pub fn actor_result(actor_id: i64, steps: usize, conversion_times: &[Option<i64>]) -> ActorResult {
    ActorResult {
        actor_id,
        steps,
        entry_ts: Some(0),
        latests: vec![None; conversion_times.len()],
        conversion_times: conversion_times.to_vec(),
        breakdown: None,
        excluded: false,
        events_seen: vec![],
    }
}

/// Actor tuple with the given reach, entering at `entry_ms`.
pub fn actor_result_at(actor_id: i64, steps: usize, entry_ms: i64) -> ActorResult {
    ActorResult {
        actor_id,
        steps,
        entry_ts: Some(entry_ms),
        latests: vec![],
        conversion_times: vec![],
        breakdown: None,
        excluded: false,
        events_seen: vec![],
    }
}

fn event_schema(extra: &[&str]) -> Arc<Schema> {
    let mut fields = vec![
        Field::new(COLUMN_ACTOR_ID, DataType::Int64, false),
        Field::new(
            COLUMN_CREATED_AT,
            DataType::Timestamp(TimeUnit::Millisecond, None),
            false,
        ),
        Field::new(COLUMN_EVENT, DataType::Utf8, false),
    ];
    for name in extra {
        fields.push(Field::new(*name, DataType::Utf8, true));
    }

    Arc::new(Schema::new(fields))
}

/// `(actor_id, ts_millis, event)` rows as a record batch. Rows must
/// already be sorted by `(actor_id, ts)`, the order the engine expects.
pub fn events_batch(rows: &[(i64, i64, &str)]) -> RecordBatch {
    let actors = Int64Array::from(rows.iter().map(|r| r.0).collect::<Vec<_>>());
    let ts = TimestampMillisecondArray::from(rows.iter().map(|r| r.1).collect::<Vec<_>>());
    let events = StringArray::from(rows.iter().map(|r| r.2).collect::<Vec<_>>());

    RecordBatch::try_new(
        event_schema(&[]),
        vec![Arc::new(actors), Arc::new(ts), Arc::new(events)],
    )
    .unwrap()
}

/// Like [`events_batch`] with one extra nullable string property column.
pub fn events_batch_with_prop(
    prop: &str,
    rows: &[(i64, i64, &str, Option<&str>)],
) -> RecordBatch {
    let actors = Int64Array::from(rows.iter().map(|r| r.0).collect::<Vec<_>>());
    let ts = TimestampMillisecondArray::from(rows.iter().map(|r| r.1).collect::<Vec<_>>());
    let events = StringArray::from(rows.iter().map(|r| r.2).collect::<Vec<_>>());
    let values = StringArray::from(rows.iter().map(|r| r.3).collect::<Vec<_>>());

    RecordBatch::try_new(
        event_schema(&[prop]),
        vec![
            Arc::new(actors),
            Arc::new(ts),
            Arc::new(events),
            Arc::new(values),
        ],
    )
    .unwrap()
}
