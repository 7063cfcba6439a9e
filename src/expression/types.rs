//! Types and values of the query algebra

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The type of an algebra expression.
///
/// Expressions arrive type-checked; the planner only inspects types, it never
/// re-derives them from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprType {
    Null,
    Boolean,
    Number,
    Time,
    String,
    NumberRange,
    TimeRange,
    Dataset,
    /// A set of values of the inner type (e.g. SET/STRING)
    Set(Box<ExprType>),
}

impl ExprType {
    pub fn set_of(inner: ExprType) -> ExprType {
        ExprType::Set(Box::new(inner))
    }

    /// True for SET/STRING, the multi-value dimension type.
    pub fn is_string_set(&self) -> bool {
        matches!(self, ExprType::Set(inner) if **inner == ExprType::String)
    }
}

impl fmt::Display for ExprType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprType::Null => write!(f, "NULL"),
            ExprType::Boolean => write!(f, "BOOLEAN"),
            ExprType::Number => write!(f, "NUMBER"),
            ExprType::Time => write!(f, "TIME"),
            ExprType::String => write!(f, "STRING"),
            ExprType::NumberRange => write!(f, "NUMBER_RANGE"),
            ExprType::TimeRange => write!(f, "TIME_RANGE"),
            ExprType::Dataset => write!(f, "DATASET"),
            ExprType::Set(inner) => write!(f, "SET/{}", inner),
        }
    }
}

/// A value in the algebra's value space.
///
/// Inflaters coerce raw backend values into these; literals carry them into
/// expressions. Ranges are half-open: `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Time(DateTime<Utc>),
    TimeRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    NumberRange {
        start: f64,
        end: f64,
    },
    StringSet(Vec<String>),
}

impl Value {
    pub fn value_type(&self) -> ExprType {
        match self {
            Value::Null => ExprType::Null,
            Value::Bool(_) => ExprType::Boolean,
            Value::Number(_) => ExprType::Number,
            Value::String(_) => ExprType::String,
            Value::Time(_) => ExprType::Time,
            Value::TimeRange { .. } => ExprType::TimeRange,
            Value::NumberRange { .. } => ExprType::NumberRange,
            Value::StringSet(_) => ExprType::set_of(ExprType::String),
        }
    }

    pub fn time(t: DateTime<Utc>) -> Value {
        Value::Time(t)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Time(t) => write!(f, "{}", format_iso(t)),
            Value::TimeRange { start, end } => {
                write!(f, "[{},{})", format_iso(start), format_iso(end))
            }
            Value::NumberRange { start, end } => write!(f, "[{},{})", start, end),
            Value::StringSet(items) => write!(f, "{{{}}}", items.join(",")),
        }
    }
}

/// Render a UTC instant as `2020-01-02T00:00:00Z`, the interval wire form.
pub fn format_iso(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an instant from either an ISO-8601 string or a millisecond number.
/// Returns `None` for anything else; callers treat that as a null value.
pub fn parse_instant(raw: &serde_json::Value) -> Option<DateTime<Utc>> {
    match raw {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc))
            .or_else(|| {
                // stringified epoch millis
                s.parse::<i64>()
                    .ok()
                    .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            }),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// The unit a time-part expression extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePartUnit {
    SecondOfMinute,
    MinuteOfHour,
    HourOfDay,
    DayOfWeek,
    DayOfMonth,
    DayOfYear,
    WeekOfYear,
    MonthOfYear,
    Year,
}

impl TimePartUnit {
    /// The time-format pattern the backend's extraction layer understands.
    pub fn format_pattern(&self) -> &'static str {
        match self {
            TimePartUnit::SecondOfMinute => "s",
            TimePartUnit::MinuteOfHour => "m",
            TimePartUnit::HourOfDay => "H",
            TimePartUnit::DayOfWeek => "e",
            TimePartUnit::DayOfMonth => "d",
            TimePartUnit::DayOfYear => "D",
            TimePartUnit::WeekOfYear => "w",
            TimePartUnit::MonthOfYear => "M",
            TimePartUnit::Year => "yyyy",
        }
    }

    /// The extraction keyword of the backend's expression dialect.
    pub fn extract_keyword(&self) -> &'static str {
        match self {
            TimePartUnit::SecondOfMinute => "SECOND",
            TimePartUnit::MinuteOfHour => "MINUTE",
            TimePartUnit::HourOfDay => "HOUR",
            TimePartUnit::DayOfWeek => "DOW",
            TimePartUnit::DayOfMonth => "DAY",
            TimePartUnit::DayOfYear => "DOY",
            TimePartUnit::WeekOfYear => "WEEK",
            TimePartUnit::MonthOfYear => "MONTH",
            TimePartUnit::Year => "YEAR",
        }
    }

    /// Upper bound on distinct buckets this part can produce, when bounded.
    pub fn max_buckets(&self) -> Option<u64> {
        match self {
            TimePartUnit::SecondOfMinute => Some(61),
            TimePartUnit::MinuteOfHour => Some(60),
            TimePartUnit::HourOfDay => Some(24),
            TimePartUnit::DayOfWeek => Some(7),
            TimePartUnit::DayOfMonth => Some(31),
            TimePartUnit::DayOfYear => Some(366),
            TimePartUnit::WeekOfYear => Some(53),
            TimePartUnit::MonthOfYear => Some(12),
            TimePartUnit::Year => None,
        }
    }
}

/// The target of a cast expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Number,
    String,
    Time,
}

/// Case transform applied to a string expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCase {
    Upper,
    Lower,
}
