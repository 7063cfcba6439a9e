//! Result-row reshaping
//!
//! A [`RowTransform`] converts native result rows into algebra-typed
//! records, one row at a time. It never buffers; applied to a stream it
//! preserves ordering and backpressure.

mod inflate;

pub use inflate::{coerce, Inflater};

use crate::expression::Value;
use crate::requester::{RequestError, Row};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::BTreeMap;

/// One output record of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Datum(BTreeMap<String, Value>),
    Value(Value),
}

/// Renames one native column into one output column, coercing its values.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnTransform {
    /// Name in the native row.
    pub input: String,
    /// Name in the output datum.
    pub output: String,
    pub inflater: Option<Inflater>,
}

impl ColumnTransform {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            inflater: None,
        }
    }

    pub fn with_inflater(mut self, inflater: Inflater) -> Self {
        self.inflater = Some(inflater);
        self
    }
}

/// Which end of a time-boundary response an output column reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBound {
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
enum TransformKind {
    Datum,
    Value {
        input: String,
        inflater: Option<Inflater>,
    },
    TimeBoundary {
        applies: Vec<(String, TimeBound)>,
    },
    TimeBoundaryValue {
        bound: TimeBound,
    },
}

/// A stream transform from native rows to algebra records.
#[derive(Debug, Clone, PartialEq)]
pub struct RowTransform {
    kind: TransformKind,
    /// Output column fed from the row's bucket timestamp, when the shape
    /// carries one.
    timestamp_label: Option<String>,
    columns: Vec<ColumnTransform>,
}

impl RowTransform {
    pub fn datum(columns: Vec<ColumnTransform>) -> Self {
        Self {
            kind: TransformKind::Datum,
            timestamp_label: None,
            columns,
        }
    }

    pub fn value(input: impl Into<String>, inflater: Option<Inflater>) -> Self {
        Self {
            kind: TransformKind::Value {
                input: input.into(),
                inflater,
            },
            timestamp_label: None,
            columns: Vec::new(),
        }
    }

    pub fn time_boundary(applies: Vec<(String, TimeBound)>) -> Self {
        Self {
            kind: TransformKind::TimeBoundary { applies },
            timestamp_label: None,
            columns: Vec::new(),
        }
    }

    pub fn time_boundary_value(bound: TimeBound) -> Self {
        Self {
            kind: TransformKind::TimeBoundaryValue { bound },
            timestamp_label: None,
            columns: Vec::new(),
        }
    }

    pub fn with_timestamp_label(mut self, label: impl Into<String>) -> Self {
        self.timestamp_label = Some(label.into());
        self
    }

    pub fn output_names(&self) -> Vec<String> {
        match &self.kind {
            TransformKind::Datum => {
                let mut names: Vec<String> = self
                    .timestamp_label
                    .iter()
                    .cloned()
                    .collect();
                names.extend(self.columns.iter().map(|c| c.output.clone()));
                names
            }
            TransformKind::Value { .. } | TransformKind::TimeBoundaryValue { .. } => vec![],
            TransformKind::TimeBoundary { applies } => {
                applies.iter().map(|(name, _)| name.clone()).collect()
            }
        }
    }

    /// Convert one native row.
    pub fn transform(&self, row: &Row) -> Record {
        match &self.kind {
            TransformKind::Datum => {
                let mut datum = BTreeMap::new();
                if let Some(label) = &self.timestamp_label {
                    let raw = row.get("timestamp").unwrap_or(&serde_json::Value::Null);
                    datum.insert(label.clone(), Inflater::Time.inflate(raw));
                }
                for column in &self.columns {
                    let raw = row.get(&column.input).unwrap_or(&serde_json::Value::Null);
                    let value = match &column.inflater {
                        Some(inflater) => inflater.inflate(raw),
                        None => coerce(raw),
                    };
                    datum.insert(column.output.clone(), value);
                }
                Record::Datum(datum)
            }
            TransformKind::Value { input, inflater } => {
                let raw = row.get(input).unwrap_or(&serde_json::Value::Null);
                let value = match inflater {
                    Some(inflater) => inflater.inflate(raw),
                    None => coerce(raw),
                };
                Record::Value(value)
            }
            TransformKind::TimeBoundary { applies } => {
                let mut datum = BTreeMap::new();
                for (name, bound) in applies {
                    datum.insert(name.clone(), bound_value(row, *bound));
                }
                Record::Datum(datum)
            }
            TransformKind::TimeBoundaryValue { bound } => Record::Value(bound_value(row, *bound)),
        }
    }

    /// Lift the transform over a row stream, one row at a time.
    pub fn record_stream(
        self,
        rows: BoxStream<'static, Result<Row, RequestError>>,
    ) -> BoxStream<'static, Result<Record, RequestError>> {
        rows.map(move |row| row.map(|row| self.transform(&row)))
            .boxed()
    }
}

/// Read one end of a time-boundary response row; ingestion time supersedes
/// the segment bound on the max side.
fn bound_value(row: &Row, bound: TimeBound) -> Value {
    let raw = match bound {
        TimeBound::Min => row.get("minTime"),
        TimeBound::Max => row
            .get("maxIngestedEventTime")
            .filter(|v| !v.is_null())
            .or_else(|| row.get("maxTime")),
    };
    Inflater::Time.inflate(raw.unwrap_or(&serde_json::Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_datum_transform_renames_and_inflates() {
        let transform = RowTransform::datum(vec![
            ColumnTransform::new("***__secret", "__secret"),
            ColumnTransform::new("added", "added").with_inflater(Inflater::Number),
        ]);
        let record = transform.transform(&row(&[
            ("***__secret", json!("x")),
            ("added", json!("17")),
        ]));
        match record {
            Record::Datum(datum) => {
                assert_eq!(datum.get("__secret"), Some(&Value::String("x".to_string())));
                assert_eq!(datum.get("added"), Some(&Value::Number(17.0)));
            }
            _ => panic!("expected datum"),
        }
    }

    #[test]
    fn test_timestamp_label() {
        let t = Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap();
        let transform = RowTransform::datum(vec![]).with_timestamp_label("__time");
        let record = transform.transform(&row(&[("timestamp", json!("2020-01-02T00:00:00Z"))]));
        assert_eq!(
            record,
            Record::Datum(BTreeMap::from([("__time".to_string(), Value::Time(t))]))
        );
    }

    #[test]
    fn test_value_transform() {
        let transform = RowTransform::value("__VALUE__", Some(Inflater::Number));
        let record = transform.transform(&row(&[("__VALUE__", json!(42))]));
        assert_eq!(record, Record::Value(Value::Number(42.0)));
    }

    #[test]
    fn test_time_boundary_prefers_ingested() {
        let t = Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap();
        let transform = RowTransform::time_boundary(vec![("max".to_string(), TimeBound::Max)]);
        let record = transform.transform(&row(&[
            ("maxTime", json!("2019-01-01T00:00:00Z")),
            ("maxIngestedEventTime", json!("2020-01-02T00:00:00Z")),
        ]));
        assert_eq!(
            record,
            Record::Datum(BTreeMap::from([("max".to_string(), Value::Time(t))]))
        );
    }

    #[test]
    fn test_missing_column_becomes_null() {
        let transform = RowTransform::datum(vec![ColumnTransform::new("gone", "gone")]);
        assert_eq!(
            transform.transform(&row(&[])),
            Record::Datum(BTreeMap::from([("gone".to_string(), Value::Null)]))
        );
    }
}
