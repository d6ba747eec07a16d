use chrono::DateTime;
use chrono::Datelike;
use chrono::Duration;
use chrono::DurationRound;
use chrono::TimeZone;
use chrono::Utc;
use chrono::Weekday;
use chronoutil::RelativeDuration;
use serde::Deserialize;
use serde::Serialize;

#[derive(Serialize, Deserialize, Clone, Debug, Hash, Eq, PartialEq)]
pub enum PropertyRef {
    Event(String),
    Actor(String),
    Group(String, usize),
    External(String),
}

impl PropertyRef {
    pub fn name(&self) -> String {
        match self {
            PropertyRef::Event(name) => name.clone(),
            PropertyRef::Actor(name) => name.clone(),
            PropertyRef::Group(name, _) => name.clone(),
            PropertyRef::External(name) => name.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PropValue {
    String(String),
    Int64(i64),
    Bool(bool),
    Null,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum PropValueOperation {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    True,
    False,
    Exists,
    Empty,
    Like,
    NotLike,
    Regex,
    NotRegex,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PropValueFilter {
    pub property: PropertyRef,
    pub operation: PropValueOperation,
    pub value: Option<Vec<PropValue>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum QueryTime {
    Between {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    From(DateTime<Utc>),
    Last {
        last: i64,
        unit: TimeIntervalUnit,
    },
}

impl QueryTime {
    pub fn range(&self, cur_time: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            QueryTime::Between { from, to } => (*from, *to),
            QueryTime::From(from) => (*from, cur_time),
            QueryTime::Last { last, unit } => (cur_time - unit.relative_duration(*last), cur_time),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeIntervalUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeIntervalUnit {
    pub fn duration(&self, n: i64) -> Duration {
        match self {
            TimeIntervalUnit::Second => Duration::seconds(n),
            TimeIntervalUnit::Minute => Duration::minutes(n),
            TimeIntervalUnit::Hour => Duration::hours(n),
            TimeIntervalUnit::Day => Duration::days(n),
            TimeIntervalUnit::Week => Duration::weeks(n),
            TimeIntervalUnit::Month => Duration::days(n * 31),
            TimeIntervalUnit::Year => Duration::days(n * 31 * 12),
        }
    }

    pub fn relative_duration(&self, n: i64) -> RelativeDuration {
        match self {
            TimeIntervalUnit::Second => RelativeDuration::seconds(n),
            TimeIntervalUnit::Minute => RelativeDuration::minutes(n),
            TimeIntervalUnit::Hour => RelativeDuration::hours(n),
            TimeIntervalUnit::Day => RelativeDuration::days(n),
            TimeIntervalUnit::Week => RelativeDuration::weeks(n),
            TimeIntervalUnit::Month => RelativeDuration::months(n as i32),
            TimeIntervalUnit::Year => RelativeDuration::years(n as i32),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TimeIntervalUnit::Second => "second",
            TimeIntervalUnit::Minute => "minute",
            TimeIntervalUnit::Hour => "hour",
            TimeIntervalUnit::Day => "day",
            TimeIntervalUnit::Week => "week",
            TimeIntervalUnit::Month => "month",
            TimeIntervalUnit::Year => "year",
        }
    }

    /// Start of the calendar period containing `ts`. Weeks honour the
    /// configured week start day.
    pub fn truncate(&self, ts: DateTime<Utc>, week_start: Weekday) -> DateTime<Utc> {
        match self {
            TimeIntervalUnit::Second => ts.duration_trunc(Duration::seconds(1)).unwrap_or(ts),
            TimeIntervalUnit::Minute => ts.duration_trunc(Duration::minutes(1)).unwrap_or(ts),
            TimeIntervalUnit::Hour => ts.duration_trunc(Duration::hours(1)).unwrap_or(ts),
            TimeIntervalUnit::Day => ts.duration_trunc(Duration::days(1)).unwrap_or(ts),
            TimeIntervalUnit::Week => {
                let day = ts.duration_trunc(Duration::days(1)).unwrap_or(ts);
                let back = (7 + ts.weekday().num_days_from_monday()
                    - week_start.num_days_from_monday())
                    % 7;
                day - Duration::days(back as i64)
            }
            TimeIntervalUnit::Month => {
                let first = ts.date_naive().with_day(1).unwrap();
                Utc.from_utc_datetime(&first.and_hms_opt(0, 0, 0).unwrap())
            }
            TimeIntervalUnit::Year => {
                let first = ts.date_naive().with_day(1).unwrap().with_month(1).unwrap();
                Utc.from_utc_datetime(&first.and_hms_opt(0, 0, 0).unwrap())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono::Utc;
    use chrono::Weekday;

    use super::TimeIntervalUnit;

    #[test]
    fn week_truncation_honours_week_start() {
        // 2023-06-14 is a Wednesday
        let ts = Utc.with_ymd_and_hms(2023, 6, 14, 15, 30, 0).unwrap();

        let monday = TimeIntervalUnit::Week.truncate(ts, Weekday::Mon);
        assert_eq!(monday, Utc.with_ymd_and_hms(2023, 6, 12, 0, 0, 0).unwrap());

        let sunday = TimeIntervalUnit::Week.truncate(ts, Weekday::Sun);
        assert_eq!(sunday, Utc.with_ymd_and_hms(2023, 6, 11, 0, 0, 0).unwrap());
    }

    #[test]
    fn month_truncation() {
        let ts = Utc.with_ymd_and_hms(2023, 6, 14, 15, 30, 0).unwrap();
        let start = TimeIntervalUnit::Month.truncate(ts, Weekday::Mon);
        assert_eq!(start, Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap());
    }
}
