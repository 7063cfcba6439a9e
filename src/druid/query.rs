//! Native query document types
//!
//! Typed, serialize-only models of the backend's query shapes. Optional
//! fields are skipped when absent so a document never carries fields the
//! shape does not define.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// A native query of any shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "queryType", rename_all = "camelCase")]
pub enum DruidQuery {
    Timeseries(TimeseriesQuery),
    TopN(TopNQuery),
    GroupBy(GroupByQuery),
    Scan(ScanQuery),
    TimeBoundary(TimeBoundaryQuery),
    SegmentMetadata(SegmentMetadataQuery),
}

impl DruidQuery {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("query documents always serialize")
    }
}

/// A table name or a nested query.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    Table(String),
    Nested(Box<DruidQuery>),
}

impl DataSource {
    pub fn table(name: impl Into<String>) -> Self {
        DataSource::Table(name.into())
    }
}

impl Serialize for DataSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DataSource::Table(name) => serializer.serialize_str(name),
            DataSource::Nested(query) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "query")?;
                map.serialize_entry("query", query)?;
                map.end()
            }
        }
    }
}

/// Time bucketing attached to timeseries and group-by queries.
#[derive(Debug, Clone, PartialEq)]
pub enum Granularity {
    All,
    None,
    Period { period: String, time_zone: String },
}

impl Serialize for Granularity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Granularity::All => serializer.serialize_str("all"),
            Granularity::None => serializer.serialize_str("none"),
            Granularity::Period { period, time_zone } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("type", "period")?;
                map.serialize_entry("period", period)?;
                map.serialize_entry("timeZone", time_zone)?;
                map.end()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputType {
    String,
    Long,
    Float,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StringComparator {
    Lexicographic,
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// A backend-computed column defined by a formula.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum VirtualColumn {
    Expression {
        name: String,
        expression: String,
        output_type: OutputType,
    },
}

/// A dimension-time transform applied before grouping.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ExtractionFn {
    Substring {
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        length: Option<usize>,
    },
    Regex {
        expr: String,
        replace_missing_value: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        replace_missing_value_with: Option<String>,
    },
    RegisteredLookup {
        lookup: String,
        retain_missing_value: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        replace_missing_value_with: Option<String>,
    },
    TimeFormat {
        format: String,
        time_zone: String,
        locale: String,
    },
    Bucket {
        size: f64,
        offset: f64,
    },
    Upper,
    Lower,
    StringFormat {
        format: String,
    },
    Cascade {
        extraction_fns: Vec<ExtractionFn>,
    },
    /// A transform registered out of band, passed through verbatim.
    #[serde(untagged)]
    Registered(serde_json::Value),
}

/// A group-by dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DimensionSpec {
    Default {
        dimension: String,
        output_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_type: Option<OutputType>,
    },
    Extraction {
        dimension: String,
        output_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_type: Option<OutputType>,
        extraction_fn: ExtractionFn,
    },
    ListFiltered {
        delegate: Box<DimensionSpec>,
        values: Vec<String>,
    },
    RegexFiltered {
        delegate: Box<DimensionSpec>,
        pattern: String,
    },
}

impl DimensionSpec {
    /// The output name, looking through filtering decorators.
    pub fn output_name(&self) -> &str {
        match self {
            DimensionSpec::Default { output_name, .. }
            | DimensionSpec::Extraction { output_name, .. } => output_name,
            DimensionSpec::ListFiltered { delegate, .. }
            | DimensionSpec::RegexFiltered { delegate, .. } => delegate.output_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SearchQuerySpec {
    Contains {
        value: String,
        case_sensitive: bool,
    },
}

/// A row filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DruidFilter {
    Selector {
        dimension: String,
        value: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        extraction_fn: Option<ExtractionFn>,
    },
    In {
        dimension: String,
        values: Vec<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        extraction_fn: Option<ExtractionFn>,
    },
    Bound {
        dimension: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        lower: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        upper: Option<String>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        lower_strict: bool,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        upper_strict: bool,
        ordering: StringComparator,
        #[serde(skip_serializing_if = "Option::is_none")]
        extraction_fn: Option<ExtractionFn>,
    },
    Regex {
        dimension: String,
        pattern: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        extraction_fn: Option<ExtractionFn>,
    },
    Search {
        dimension: String,
        query: SearchQuerySpec,
        #[serde(skip_serializing_if = "Option::is_none")]
        extraction_fn: Option<ExtractionFn>,
    },
    Expression {
        expression: String,
    },
    And {
        fields: Vec<DruidFilter>,
    },
    Or {
        fields: Vec<DruidFilter>,
    },
    Not {
        field: Box<DruidFilter>,
    },
}

impl DruidFilter {
    /// Conjoin, flattening nested ANDs.
    pub fn and(filters: Vec<DruidFilter>) -> Option<DruidFilter> {
        let mut fields = Vec::new();
        for filter in filters {
            match filter {
                DruidFilter::And { fields: inner } => fields.extend(inner),
                other => fields.push(other),
            }
        }
        match fields.len() {
            0 => None,
            1 => fields.pop(),
            _ => Some(DruidFilter::And { fields }),
        }
    }
}

/// An aggregation computed per bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Aggregation {
    Count {
        name: String,
    },
    LongSum {
        name: String,
        field_name: String,
    },
    DoubleSum {
        name: String,
        field_name: String,
    },
    LongMin {
        name: String,
        field_name: String,
    },
    LongMax {
        name: String,
        field_name: String,
    },
    DoubleMin {
        name: String,
        field_name: String,
    },
    DoubleMax {
        name: String,
        field_name: String,
    },
    Cardinality {
        name: String,
        fields: Vec<String>,
        by_row: bool,
    },
    HyperUnique {
        name: String,
        field_name: String,
    },
    ApproxHistogramFold {
        name: String,
        field_name: String,
    },
    QuantilesDoublesSketch {
        name: String,
        field_name: String,
    },
    Javascript {
        name: String,
        field_names: Vec<String>,
        fn_aggregate: String,
        fn_combine: String,
        fn_reset: String,
    },
    Filtered {
        filter: DruidFilter,
        aggregator: Box<Aggregation>,
    },
    /// A custom aggregation passed through verbatim.
    #[serde(untagged)]
    Registered(serde_json::Value),
}

impl Aggregation {
    pub fn name(&self) -> Option<&str> {
        match self {
            Aggregation::Count { name }
            | Aggregation::LongSum { name, .. }
            | Aggregation::DoubleSum { name, .. }
            | Aggregation::LongMin { name, .. }
            | Aggregation::LongMax { name, .. }
            | Aggregation::DoubleMin { name, .. }
            | Aggregation::DoubleMax { name, .. }
            | Aggregation::Cardinality { name, .. }
            | Aggregation::HyperUnique { name, .. }
            | Aggregation::ApproxHistogramFold { name, .. }
            | Aggregation::QuantilesDoublesSketch { name, .. }
            | Aggregation::Javascript { name, .. } => Some(name),
            Aggregation::Filtered { aggregator, .. } => aggregator.name(),
            Aggregation::Registered(value) => value.get("name").and_then(|n| n.as_str()),
        }
    }
}

/// A post-aggregation over aggregation outputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PostAggregation {
    Arithmetic {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(rename = "fn")]
        func: String,
        fields: Vec<PostAggregation>,
    },
    FieldAccess {
        field_name: String,
    },
    FinalizingFieldAccess {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        field_name: String,
    },
    Constant {
        value: serde_json::Value,
    },
    Javascript {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        field_names: Vec<String>,
        function: String,
    },
    Quantile {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        field_name: String,
        probability: f64,
    },
    QuantilesDoublesSketchToQuantile {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        field: Box<PostAggregation>,
        fraction: f64,
    },
    /// A custom post-aggregation passed through verbatim.
    #[serde(untagged)]
    Registered(serde_json::Value),
}

impl PostAggregation {
    /// Copy with the output name set (post-aggregations are named only at
    /// the top of their tree).
    pub fn named(self, output: impl Into<String>) -> PostAggregation {
        let output = output.into();
        match self {
            PostAggregation::Arithmetic { func, fields, .. } => PostAggregation::Arithmetic {
                name: Some(output),
                func,
                fields,
            },
            PostAggregation::FinalizingFieldAccess { field_name, .. } => {
                PostAggregation::FinalizingFieldAccess {
                    name: Some(output),
                    field_name,
                }
            }
            PostAggregation::Javascript {
                field_names,
                function,
                ..
            } => PostAggregation::Javascript {
                name: Some(output),
                field_names,
                function,
            },
            PostAggregation::Quantile {
                field_name,
                probability,
                ..
            } => PostAggregation::Quantile {
                name: Some(output),
                field_name,
                probability,
            },
            PostAggregation::QuantilesDoublesSketchToQuantile {
                field, fraction, ..
            } => PostAggregation::QuantilesDoublesSketchToQuantile {
                name: Some(output),
                field,
                fraction,
            },
            // field accessors and constants cannot carry a top-level name;
            // wrap in an identity arithmetic instead
            other => PostAggregation::Arithmetic {
                name: Some(output),
                func: "+".to_string(),
                fields: vec![
                    other,
                    PostAggregation::Constant {
                        value: serde_json::json!(0),
                    },
                ],
            },
        }
    }
}

/// Ordering metric of a topN query: an aggregate name or a spec.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TopNMetric {
    Aggregate(String),
    Spec(TopNMetricSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TopNMetricSpec {
    Dimension { ordering: StringComparator },
    Inverted { metric: Box<TopNMetric> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderByColumn {
    pub dimension: String,
    pub direction: SortOrder,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension_order: Option<StringComparator>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LimitSpec {
    Default {
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
        columns: Vec<OrderByColumn>,
    },
}

/// A post-aggregation filter over group-by rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HavingSpec {
    GreaterThan {
        aggregation: String,
        value: f64,
    },
    LessThan {
        aggregation: String,
        value: f64,
    },
    EqualTo {
        aggregation: String,
        value: f64,
    },
    DimSelector {
        dimension: String,
        value: serde_json::Value,
    },
    And {
        having_specs: Vec<HavingSpec>,
    },
    Or {
        having_specs: Vec<HavingSpec>,
    },
    Not {
        having_spec: Box<HavingSpec>,
    },
}

pub type QueryContext = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesQuery {
    pub data_source: DataSource,
    pub intervals: Vec<String>,
    pub granularity: Granularity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<DruidFilter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub virtual_columns: Vec<VirtualColumn>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<Aggregation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_aggregations: Vec<PostAggregation>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub descending: bool,
    #[serde(skip_serializing_if = "QueryContext::is_empty")]
    pub context: QueryContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopNQuery {
    pub data_source: DataSource,
    pub intervals: Vec<String>,
    pub granularity: Granularity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<DruidFilter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub virtual_columns: Vec<VirtualColumn>,
    pub dimension: DimensionSpec,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<Aggregation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_aggregations: Vec<PostAggregation>,
    pub metric: TopNMetric,
    pub threshold: u64,
    #[serde(skip_serializing_if = "QueryContext::is_empty")]
    pub context: QueryContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupByQuery {
    pub data_source: DataSource,
    pub intervals: Vec<String>,
    pub granularity: Granularity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<DruidFilter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub virtual_columns: Vec<VirtualColumn>,
    pub dimensions: Vec<DimensionSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<Aggregation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_aggregations: Vec<PostAggregation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_spec: Option<LimitSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub having: Option<HavingSpec>,
    #[serde(skip_serializing_if = "QueryContext::is_empty")]
    pub context: QueryContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanResultFormat {
    CompactedList,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanQuery {
    pub data_source: DataSource,
    pub intervals: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<DruidFilter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub virtual_columns: Vec<VirtualColumn>,
    pub result_format: ScanResultFormat,
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Row ordering on the time column; a backend extension to the typed
    /// schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<SortOrder>,
    #[serde(skip_serializing_if = "QueryContext::is_empty")]
    pub context: QueryContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeBoundaryBound {
    MinTime,
    MaxTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBoundaryQuery {
    pub data_source: DataSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound: Option<TimeBoundaryBound>,
    #[serde(skip_serializing_if = "QueryContext::is_empty")]
    pub context: QueryContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMetadataQuery {
    pub data_source: DataSource,
    pub merge: bool,
    pub analysis_types: Vec<String>,
    pub lenient_aggregator_merge: bool,
    #[serde(skip_serializing_if = "QueryContext::is_empty")]
    pub context: QueryContext,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_granularity_serialization() {
        assert_eq!(serde_json::to_value(Granularity::All).unwrap(), json!("all"));
        assert_eq!(
            serde_json::to_value(Granularity::Period {
                period: "P1D".to_string(),
                time_zone: "Etc/UTC".to_string(),
            })
            .unwrap(),
            json!({"type": "period", "period": "P1D", "timeZone": "Etc/UTC"})
        );
    }

    #[test]
    fn test_data_source_serialization() {
        assert_eq!(
            serde_json::to_value(DataSource::table("wiki")).unwrap(),
            json!("wiki")
        );
        let nested = DataSource::Nested(Box::new(DruidQuery::TimeBoundary(TimeBoundaryQuery {
            data_source: DataSource::table("wiki"),
            bound: Some(TimeBoundaryBound::MaxTime),
            context: QueryContext::new(),
        })));
        assert_eq!(
            serde_json::to_value(nested).unwrap(),
            json!({
                "type": "query",
                "query": {"queryType": "timeBoundary", "dataSource": "wiki", "bound": "maxTime"}
            })
        );
    }

    #[test]
    fn test_dimension_spec_serialization() {
        let dim = DimensionSpec::ListFiltered {
            delegate: Box::new(DimensionSpec::Default {
                dimension: "tags".to_string(),
                output_name: "tags".to_string(),
                output_type: None,
            }),
            values: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&dim).unwrap(),
            json!({
                "type": "listFiltered",
                "delegate": {"type": "default", "dimension": "tags", "outputName": "tags"},
                "values": ["a", "b"]
            })
        );
        assert_eq!(dim.output_name(), "tags");
    }

    #[test]
    fn test_filtered_aggregation_serialization() {
        let agg = Aggregation::Filtered {
            filter: DruidFilter::Selector {
                dimension: "country".to_string(),
                value: json!("UK"),
                extraction_fn: None,
            },
            aggregator: Box::new(Aggregation::LongSum {
                name: "added".to_string(),
                field_name: "added".to_string(),
            }),
        };
        assert_eq!(
            serde_json::to_value(&agg).unwrap(),
            json!({
                "type": "filtered",
                "filter": {"type": "selector", "dimension": "country", "value": "UK"},
                "aggregator": {"type": "longSum", "name": "added", "fieldName": "added"}
            })
        );
        assert_eq!(agg.name(), Some("added"));
    }

    #[test]
    fn test_registered_aggregation_passthrough() {
        let raw = json!({"type": "thetaSketch", "name": "unique", "fieldName": "user_theta"});
        let agg = Aggregation::Registered(raw.clone());
        assert_eq!(serde_json::to_value(&agg).unwrap(), raw);
        assert_eq!(agg.name(), Some("unique"));
    }

    #[test]
    fn test_arithmetic_post_aggregation() {
        let post = PostAggregation::Arithmetic {
            name: None,
            func: "/".to_string(),
            fields: vec![
                PostAggregation::FieldAccess {
                    field_name: "!t_0".to_string(),
                },
                PostAggregation::FieldAccess {
                    field_name: "!t_1".to_string(),
                },
            ],
        }
        .named("ratio");
        assert_eq!(
            serde_json::to_value(&post).unwrap(),
            json!({
                "type": "arithmetic",
                "name": "ratio",
                "fn": "/",
                "fields": [
                    {"type": "fieldAccess", "fieldName": "!t_0"},
                    {"type": "fieldAccess", "fieldName": "!t_1"}
                ]
            })
        );
    }

    #[test]
    fn test_inverted_metric_serialization() {
        let metric = TopNMetric::Spec(TopNMetricSpec::Inverted {
            metric: Box::new(TopNMetric::Aggregate("revenue".to_string())),
        });
        assert_eq!(
            serde_json::to_value(&metric).unwrap(),
            json!({"type": "inverted", "metric": "revenue"})
        );
    }

    #[test]
    fn test_bound_filter_skips_defaults() {
        let filter = DruidFilter::Bound {
            dimension: "added".to_string(),
            lower: Some("10".to_string()),
            upper: None,
            lower_strict: true,
            upper_strict: false,
            ordering: StringComparator::Numeric,
            extraction_fn: None,
        };
        assert_eq!(
            serde_json::to_value(&filter).unwrap(),
            json!({
                "type": "bound",
                "dimension": "added",
                "lower": "10",
                "lowerStrict": true,
                "ordering": "numeric"
            })
        );
    }
}
