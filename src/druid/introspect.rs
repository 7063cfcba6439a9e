//! Source introspection
//!
//! Issues a segmentMetadata query and interprets the response into an
//! attribute list. Deep introspection follows up with a timeBoundary query
//! to learn the time range; that follow-up is the one failure the planner
//! swallows.

use super::query::{
    DataSource, DruidQuery, QueryContext, SegmentMetadataQuery, TimeBoundaryQuery,
};
use crate::attribute::{AttributeInfo, AttributeMaker, Attributes};
use crate::expression::{parse_instant, ExprType, Value};
use crate::requester::{QueryPayload, RequestError, Requester, Row};
use futures::StreamExt;
use serde::Deserialize;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrospectionDepth {
    Shallow,
    Medium,
    Deep,
}

#[derive(Debug)]
pub enum IntrospectError {
    Request(RequestError),
    /// The response is malformed or missing the time column.
    InvalidResult(String),
}

impl fmt::Display for IntrospectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntrospectError::Request(e) => write!(f, "introspection request failed: {}", e),
            IntrospectError::InvalidResult(msg) => {
                write!(f, "invalid introspection result: {}", msg)
            }
        }
    }
}

impl std::error::Error for IntrospectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IntrospectError::Request(e) => Some(e),
            IntrospectError::InvalidResult(_) => None,
        }
    }
}

impl From<RequestError> for IntrospectError {
    fn from(e: RequestError) -> Self {
        IntrospectError::Request(e)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColumnAnalysis {
    #[serde(rename = "type")]
    column_type: String,
    #[serde(default)]
    has_multiple_values: bool,
    #[serde(default)]
    cardinality: Option<u64>,
    #[serde(default)]
    min_value: Option<serde_json::Value>,
    #[serde(default)]
    max_value: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatorAnalysis {
    #[serde(rename = "type")]
    aggregator_type: String,
    #[serde(default)]
    field_name: Option<String>,
    #[serde(default)]
    fn_combine: Option<String>,
}

const TIME_COLUMN: &str = "__time";

/// Introspect a source into its attribute list. `time_attribute` is the
/// algebra-level name given to the time column.
pub async fn introspect_attributes(
    requester: &dyn Requester,
    source: &str,
    time_attribute: &str,
    depth: IntrospectionDepth,
) -> Result<Attributes, IntrospectError> {
    let mut analysis_types = vec!["aggregators".to_string()];
    if depth == IntrospectionDepth::Deep {
        analysis_types.push("cardinality".to_string());
        analysis_types.push("minmax".to_string());
    }
    let query = DruidQuery::SegmentMetadata(SegmentMetadataQuery {
        data_source: DataSource::table(source),
        merge: true,
        analysis_types,
        lenient_aggregator_merge: true,
        context: QueryContext::new(),
    });

    debug!(source, ?depth, "introspecting source");
    let rows = collect_rows(requester, &query).await?;
    let row = rows
        .first()
        .ok_or_else(|| IntrospectError::InvalidResult("empty response".to_string()))?;

    let columns = row
        .get("columns")
        .and_then(|c| c.as_object())
        .ok_or_else(|| IntrospectError::InvalidResult("no columns in response".to_string()))?;
    let aggregators = row.get("aggregators").and_then(|a| a.as_object());

    let time_analysis = columns.get(TIME_COLUMN).ok_or_else(|| {
        IntrospectError::InvalidResult("no time column in response".to_string())
    })?;
    let mut time_attr =
        AttributeInfo::new(time_attribute, ExprType::Time).with_native_type(TIME_COLUMN);
    if let Ok(analysis) = serde_json::from_value::<ColumnAnalysis>(time_analysis.clone()) {
        time_attr.range = time_range_from_minmax(&analysis);
    }

    let mut attributes = vec![];
    for (name, raw) in columns {
        if name.as_str() == TIME_COLUMN {
            continue;
        }
        let analysis: ColumnAnalysis = match serde_json::from_value(raw.clone()) {
            Ok(analysis) => analysis,
            Err(_) => {
                warn!(column = %name, "skipping malformed column analysis");
                continue;
            }
        };
        let aggregator = aggregators
            .and_then(|aggs| aggs.get(name))
            .and_then(|raw| serde_json::from_value::<AggregatorAnalysis>(raw.clone()).ok());
        if let Some(attr) = interpret_column(name, &analysis, aggregator.as_ref()) {
            attributes.push(attr);
        }
    }
    attributes.sort_by(|a, b| a.name.cmp(&b.name));

    if depth == IntrospectionDepth::Deep && time_attr.range.is_none() {
        // best effort; a failed follow-up leaves the range unknown
        match fetch_time_range(requester, source).await {
            Ok(range) => time_attr.range = range,
            Err(e) => warn!(error = %e, "time boundary follow-up failed"),
        }
    }

    let mut all = vec![time_attr];
    all.extend(attributes);
    Ok(Attributes::new(all))
}

fn interpret_column(
    name: &str,
    analysis: &ColumnAnalysis,
    aggregator: Option<&AggregatorAnalysis>,
) -> Option<AttributeInfo> {
    match analysis.column_type.as_str() {
        "STRING" => {
            let attr_type = if analysis.has_multiple_values {
                ExprType::set_of(ExprType::String)
            } else {
                ExprType::String
            };
            let mut attr = AttributeInfo::new(name, attr_type).with_native_type("STRING");
            attr.cardinality = analysis.cardinality;
            Some(attr)
        }
        "LONG" | "FLOAT" | "DOUBLE" => {
            let mut attr = AttributeInfo::new(name, ExprType::Number)
                .with_native_type(analysis.column_type.clone());
            if let Some(maker) = aggregator.and_then(|a| infer_maker(name, a)) {
                attr.maker = Some(maker);
            }
            attr.range = number_range_from_minmax(analysis);
            Some(attr)
        }
        "hyperUnique" | "approximateHistogram" | "thetaSketch" | "HLLSketch"
        | "quantilesDoublesSketch" => Some(
            AttributeInfo::new(name, ExprType::Null)
                .with_native_type(analysis.column_type.clone())
                .unsplitable(),
        ),
        other => {
            warn!(column = %name, column_type = %other, "skipping column of unknown type");
            None
        }
    }
}

/// Infer how a rolled-up column was produced from its re-aggregation spec.
fn infer_maker(column: &str, aggregator: &AggregatorAnalysis) -> Option<AttributeMaker> {
    let field = aggregator
        .field_name
        .clone()
        .unwrap_or_else(|| column.to_string());
    match aggregator.aggregator_type.as_str() {
        "longSum" if field == "count" && column == "count" => Some(AttributeMaker::Count),
        "longSum" | "doubleSum" => Some(AttributeMaker::Sum { field }),
        "longMin" | "doubleMin" => Some(AttributeMaker::Min { field }),
        "longMax" | "doubleMax" => Some(AttributeMaker::Max { field }),
        // an identity-combining javascript aggregator is a sum in disguise
        "javascript" => aggregator.fn_combine.as_deref().and_then(|combine| {
            let squashed: String = combine.chars().filter(|c| !c.is_whitespace()).collect();
            squashed
                .contains("returna+b")
                .then_some(AttributeMaker::Sum { field })
        }),
        _ => None,
    }
}

fn time_range_from_minmax(analysis: &ColumnAnalysis) -> Option<(Value, Value)> {
    let min = parse_instant(analysis.min_value.as_ref()?)?;
    let max = parse_instant(analysis.max_value.as_ref()?)?;
    Some((Value::Time(min), Value::Time(max)))
}

fn number_range_from_minmax(analysis: &ColumnAnalysis) -> Option<(Value, Value)> {
    let min = analysis.min_value.as_ref()?.as_f64()?;
    let max = analysis.max_value.as_ref()?.as_f64()?;
    Some((Value::Number(min), Value::Number(max)))
}

async fn fetch_time_range(
    requester: &dyn Requester,
    source: &str,
) -> Result<Option<(Value, Value)>, IntrospectError> {
    let query = DruidQuery::TimeBoundary(TimeBoundaryQuery {
        data_source: DataSource::table(source),
        bound: None,
        context: QueryContext::new(),
    });
    let rows = collect_rows(requester, &query).await?;
    let row = rows
        .first()
        .ok_or_else(|| IntrospectError::InvalidResult("empty time boundary".to_string()))?;
    let min = row.get("minTime").and_then(parse_instant);
    let max = row.get("maxTime").and_then(parse_instant);
    Ok(match (min, max) {
        (Some(min), Some(max)) => Some((Value::Time(min), Value::Time(max))),
        _ => None,
    })
}

async fn collect_rows(
    requester: &dyn Requester,
    query: &DruidQuery,
) -> Result<Vec<Row>, RequestError> {
    let mut stream = requester.request(QueryPayload::new(query.to_json())).await?;
    let mut rows = Vec::new();
    while let Some(row) = stream.next().await {
        rows.push(row?);
    }
    Ok(rows)
}
