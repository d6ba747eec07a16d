use chrono::Duration;
use serde::Deserialize;
use serde::Serialize;

use crate::query::PropValueFilter;
use crate::query::PropertyRef;
use crate::query::QueryTime;
use crate::query::TimeIntervalUnit;

/// Declarative funnel definition. Plain data: structural validation and
/// entity resolution happen when a query context is built from it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Funnel {
    pub time: QueryTime,
    pub steps: Vec<Step>,
    pub order: OrderType,
    pub conversion_window: ConversionWindow,
    /// 0-indexed bounds into `steps`; default 0 and last.
    pub from_step: Option<usize>,
    pub to_step: Option<usize>,
    pub exclusions: Vec<Exclusion>,
    pub breakdown: Option<BreakdownSpec>,
    pub viz: VizMode,
    /// Query-wide property filters, AND-ed with every step predicate.
    pub filters: Option<Vec<PropValueFilter>>,
    /// Properties that must hold one value across a whole conversion.
    pub holding_constants: Option<Vec<PropertyRef>>,
    /// Trends bucketing interval; defaults to `Day`.
    pub interval: Option<TimeIntervalUnit>,
    /// Custom time-to-convert histogram bin count.
    pub bin_count: Option<usize>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Step {
    /// `None` matches any event.
    pub entity: Option<StepEntity>,
    pub filters: Option<Vec<PropValueFilter>>,
    pub math: StepMath,
    pub optional: bool,
}

impl Step {
    pub fn event(name: &str) -> Self {
        Self {
            entity: Some(StepEntity::Event(name.to_string())),
            filters: None,
            math: StepMath::Total,
            optional: false,
        }
    }

    pub fn action(id: u64) -> Self {
        Self {
            entity: Some(StepEntity::Action(id)),
            filters: None,
            math: StepMath::Total,
            optional: false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StepEntity {
    Event(String),
    Action(u64),
    /// A table outside the event store, addressed by name.
    External(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum StepMath {
    Total,
    FirstTimeForActor,
    FirstTimeForActorWithFilters,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderType {
    Sequential,
    Strict,
    Unordered,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ConversionWindow {
    pub n: i64,
    pub unit: TimeIntervalUnit,
}

impl ConversionWindow {
    pub fn duration(&self) -> Duration {
        self.unit.duration(self.n)
    }

    pub fn seconds(&self) -> i64 {
        self.duration().num_seconds()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Exclusion {
    pub entity: StepEntity,
    pub filters: Option<Vec<PropValueFilter>>,
    pub from_step: usize,
    pub to_step: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BreakdownSpec {
    pub typ: BreakdownType,
    /// Property keys; more than one means a multi-property breakdown.
    pub properties: Vec<PropertyRef>,
    pub attribution: Attribution,
    pub normalize_url: bool,
    /// Distinct buckets to keep before collapsing the rest into "Other".
    pub limit: Option<usize>,
    /// Cohort ids, for `BreakdownType::Cohort`.
    pub cohort_ids: Vec<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum BreakdownType {
    EventProperty,
    ActorProperty,
    GroupProperty(usize),
    Cohort,
    /// Breakdown over an arbitrary expression evaluated per event.
    Expression,
    ExternalActorProperty,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum Attribution {
    FirstTouch,
    LastTouch,
    Step(usize),
    AllEvents,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VizMode {
    Steps,
    Trends,
    TimeToConvert,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono::Utc;

    use super::*;
    use crate::query::QueryTime;
    use crate::query::TimeIntervalUnit;

    fn spec() -> Funnel {
        Funnel {
            time: QueryTime::Between {
                from: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
                to: Utc.with_ymd_and_hms(2023, 2, 1, 0, 0, 0).unwrap(),
            },
            steps: vec![Step::event("signup"), Step::event("activate")],
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

    #[test]
    fn serde_round_trip() {
        let req = spec();
        let json = serde_json::to_string(&req).unwrap();
        let back: Funnel = serde_json::from_str(&json).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn window_seconds() {
        let w = ConversionWindow {
            n: 7,
            unit: TimeIntervalUnit::Day,
        };
        assert_eq!(w.seconds(), 7 * 86400);
    }
}
