//! Query planning
//!
//! Chooses the native query shape from the External snapshot, assembles the
//! document through the sub-builders, and pairs it with the post-transform
//! that reshapes result rows. Re-split aggregates are rewritten into a
//! nested group-by here.

use super::aggregation::{
    aggregate_native_type, AggregationBuilder, LoweredAggregations, IGNORE_PREFIX,
};
use super::error::{PlanError, PlanResult};
use super::expression::{lower_expression, TIME_COLUMN};
use super::filter::{build_filter, FilterContext};
use super::having::build_having;
use super::query::{
    DataSource, DimensionSpec, DruidQuery, Granularity, GroupByQuery, LimitSpec, OrderByColumn,
    OutputType, ScanQuery, ScanResultFormat, SortOrder, StringComparator, TimeBoundaryBound,
    TimeBoundaryQuery, TimeseriesQuery, TopNMetric, TopNMetricSpec, TopNQuery, VirtualColumn,
};
use super::split::{
    adjust_output_name, expression_to_dimension_inflater,
    expression_to_dimension_inflater_having, max_bucket_count, split_to_granularity,
    DUMMY_PREFIX,
};
use crate::attribute::{AttributeInfo, Attributes};
use crate::expression::{Expr, ExprType, SplitKey};
use crate::external::{ApplySpec, Direction, External, Mode, QuerySelection, SplitSpec};
use crate::rows::{ColumnTransform, Inflater, RowTransform, TimeBound};
use tracing::debug;

/// Reserved output column of a value-mode query.
pub const VALUE_COLUMN: &str = "__VALUE__";

/// Interval sentinel covering all of time.
pub const ETERNITY_INTERVAL: &str = "1000/3000";

/// Default topN threshold when no limit is given.
const DEFAULT_TOPN_THRESHOLD: u64 = 1000;

/// Bucket-count bound under which a limitless split is still topN-eligible.
const TOPN_BUCKET_BOUND: u64 = 1000;

/// Guidance for the requester and inflater layer attached to a plan.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlanContext {
    /// Column carrying the bucket timestamp in responses.
    pub timestamp: Option<String>,
    /// Prefix of aggregation columns to drop from output.
    pub ignore_prefix: Option<String>,
    /// Prefix of output names rewritten to avoid reserved prefixes.
    pub dummy_prefix: Option<String>,
}

/// The product of one planning pass.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryAndPostTransform {
    pub query: DruidQuery,
    pub context: PlanContext,
    pub post_transform: RowTransform,
}

/// Plan the External into a native query and its row transform.
pub fn get_query_and_post_transform(external: &External) -> PlanResult<QueryAndPostTransform> {
    debug!(source = %external.source, mode = ?external.mode, "planning native query");
    let data_source = DataSource::table(&external.source);
    match external.mode {
        Mode::Raw => plan_scan(external, data_source),
        Mode::Value | Mode::Total => {
            if has_resplit(external) {
                return plan_resplit(external);
            }
            if let Some(plan) = try_time_boundary(external, data_source.clone())? {
                return Ok(plan);
            }
            plan_totals(external, data_source)
        }
        Mode::Split => {
            if has_resplit(external) {
                plan_resplit(external)
            } else {
                plan_split(external, data_source)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

fn filter_context(external: &External) -> FilterContext<'_> {
    FilterContext {
        time_attribute: &external.time_attribute,
        custom_transforms: &external.custom_transforms,
    }
}

/// Lower the External's filter and settle the interval list.
fn plan_intervals(
    external: &External,
) -> PlanResult<(Vec<String>, Option<super::query::DruidFilter>)> {
    let filter = external.inline_derived(&external.filter);
    let lowered = build_filter(&filter, &filter_context(external))?;
    let intervals = if lowered.intervals.is_empty() {
        if external.allow_eternity {
            vec![ETERNITY_INTERVAL.to_string()]
        } else {
            return Err(PlanError::invalid(
                "must filter on time unless allowEternity is set",
            ));
        }
    } else {
        lowered.intervals
    };
    Ok((intervals, lowered.filter))
}

fn apply_column(apply: &ApplySpec) -> ColumnTransform {
    let mut column = ColumnTransform::new(&apply.name, &apply.name);
    if apply.expression.result_type() == ExprType::Time {
        column = column.with_inflater(Inflater::Time);
    }
    column
}

fn plan_context(lowered: &LoweredAggregations, dummy_used: bool) -> PlanContext {
    PlanContext {
        timestamp: None,
        ignore_prefix: lowered
            .used_intermediates
            .then(|| IGNORE_PREFIX.to_string()),
        dummy_prefix: dummy_used.then(|| DUMMY_PREFIX.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Time boundary
// ---------------------------------------------------------------------------

/// The min/max-of-time specialization: an unfiltered total or value over
/// nothing but the ends of the time column.
fn try_time_boundary(
    external: &External,
    data_source: DataSource,
) -> PlanResult<Option<QueryAndPostTransform>> {
    if !external.filter.is_true_literal() {
        return Ok(None);
    }

    let time_bound_of = |expr: &Expr| -> Option<TimeBound> {
        match expr {
            Expr::Min { expression, .. } if external.is_time_ref(expression) => {
                Some(TimeBound::Min)
            }
            Expr::Max { expression, .. } if external.is_time_ref(expression) => {
                Some(TimeBound::Max)
            }
            _ => None,
        }
    };

    let bounds: Vec<(String, TimeBound)> = match external.mode {
        Mode::Total => {
            if external.applies.is_empty() {
                return Ok(None);
            }
            let mut out = Vec::new();
            for apply in &external.applies {
                match time_bound_of(&apply.expression) {
                    Some(bound) => out.push((apply.name.clone(), bound)),
                    None => return Ok(None),
                }
            }
            out
        }
        Mode::Value => match &external.value_expression {
            Some(expr) => match time_bound_of(expr) {
                Some(bound) => vec![(VALUE_COLUMN.to_string(), bound)],
                None => return Ok(None),
            },
            None => return Ok(None),
        },
        _ => return Ok(None),
    };

    let all_min = bounds.iter().all(|(_, b)| *b == TimeBound::Min);
    let all_max = bounds.iter().all(|(_, b)| *b == TimeBound::Max);
    let bound = match (all_min, all_max) {
        (true, false) => Some(TimeBoundaryBound::MinTime),
        (false, true) => Some(TimeBoundaryBound::MaxTime),
        _ => None,
    };

    debug!(?bound, "selected timeBoundary shape");
    let post_transform = match external.mode {
        Mode::Value => RowTransform::time_boundary_value(bounds[0].1),
        _ => RowTransform::time_boundary(bounds),
    };
    Ok(Some(QueryAndPostTransform {
        query: DruidQuery::TimeBoundary(TimeBoundaryQuery {
            data_source,
            bound,
            context: external.context.clone(),
        }),
        context: PlanContext::default(),
        post_transform,
    }))
}

// ---------------------------------------------------------------------------
// Totals and values
// ---------------------------------------------------------------------------

/// Value/total mode: a timeseries over everything, or a zero-dimension
/// group-by when only group-bys are allowed.
fn plan_totals(external: &External, data_source: DataSource) -> PlanResult<QueryAndPostTransform> {
    let applies: Vec<ApplySpec> = match external.mode {
        Mode::Value => {
            let expr = external.value_expression.clone().ok_or_else(|| {
                PlanError::invalid("value mode requires a value expression")
            })?;
            vec![ApplySpec::new(VALUE_COLUMN, expr)]
        }
        _ => external.applies.clone(),
    };

    let (intervals, filter) = plan_intervals(external)?;
    let lowered = AggregationBuilder::new(external).build(&applies)?;

    let query = match external.query_selection {
        QuerySelection::GroupByOnly => DruidQuery::GroupBy(GroupByQuery {
            data_source,
            intervals,
            granularity: Granularity::All,
            filter,
            virtual_columns: Vec::new(),
            dimensions: Vec::new(),
            aggregations: lowered.aggregations.clone(),
            post_aggregations: lowered.post_aggregations.clone(),
            limit_spec: None,
            having: None,
            context: external.context.clone(),
        }),
        QuerySelection::Any => DruidQuery::Timeseries(TimeseriesQuery {
            data_source,
            intervals,
            granularity: Granularity::All,
            filter,
            virtual_columns: Vec::new(),
            aggregations: lowered.aggregations.clone(),
            post_aggregations: lowered.post_aggregations.clone(),
            descending: false,
            context: external.context.clone(),
        }),
    };

    let post_transform = match external.mode {
        Mode::Value => {
            let inflater = external
                .value_expression
                .as_ref()
                .and_then(|e| Inflater::simple(&e.result_type()));
            RowTransform::value(VALUE_COLUMN, inflater)
        }
        _ => RowTransform::datum(applies.iter().map(apply_column).collect()),
    };

    Ok(QueryAndPostTransform {
        query,
        context: plan_context(&lowered, false),
        post_transform,
    })
}

// ---------------------------------------------------------------------------
// Scan (raw mode)
// ---------------------------------------------------------------------------

fn plan_scan(external: &External, data_source: DataSource) -> PlanResult<QueryAndPostTransform> {
    if !external.allow_select_queries {
        return Err(PlanError::invalid(
            "to issue raw queries allowSelectQueries must be set",
        ));
    }

    let (intervals, filter) = plan_intervals(external)?;
    let selected = match &external.select {
        Some(names) => names.clone(),
        None => external.raw_attributes.names(),
    };

    let mut columns = Vec::new();
    let mut virtual_columns = Vec::new();
    let mut transforms = Vec::new();

    for name in &selected {
        if let Some(derivation) = external.derived_attributes.get(name) {
            let formula = lower_expression(
                &external.inline_derived(derivation),
                &external.time_attribute,
            )?;
            virtual_columns.push(VirtualColumn::Expression {
                name: name.clone(),
                expression: formula,
                output_type: match derivation.result_type() {
                    ExprType::Number => OutputType::Double,
                    ExprType::Time => OutputType::Long,
                    _ => OutputType::String,
                },
            });
            columns.push(name.clone());
            let mut transform = ColumnTransform::new(name, name);
            if let Some(inflater) = Inflater::simple(&derivation.result_type()) {
                transform = transform.with_inflater(inflater);
            }
            transforms.push(transform);
            continue;
        }

        let attr = external.raw_attributes.get(name).ok_or_else(|| {
            PlanError::invalid(format!("selected attribute '{}' does not exist", name))
        })?;

        if attr.native_type.as_deref() == Some("__time") && name != TIME_COLUMN {
            // renamed time column rides on a virtual column
            virtual_columns.push(VirtualColumn::Expression {
                name: name.clone(),
                expression: TIME_COLUMN.to_string(),
                output_type: OutputType::String,
            });
        }
        columns.push(name.clone());
        let mut transform = ColumnTransform::new(name, name);
        if let Some(inflater) = Inflater::simple(&attr.attr_type) {
            transform = transform.with_inflater(inflater);
        }
        transforms.push(transform);
    }

    let mut order = None;
    if let Some(sort) = &external.sort {
        if sort.ref_name == external.time_attribute {
            if selected.contains(&external.time_attribute) {
                order = Some(match sort.direction {
                    Direction::Ascending => SortOrder::Ascending,
                    Direction::Descending => SortOrder::Descending,
                });
                if !columns.iter().any(|c| c == TIME_COLUMN) {
                    columns.push(TIME_COLUMN.to_string());
                }
            }
        } else {
            return Err(PlanError::unsupported(format!(
                "can not sort a scan on '{}'",
                sort.ref_name
            )));
        }
    }

    Ok(QueryAndPostTransform {
        query: DruidQuery::Scan(ScanQuery {
            data_source,
            intervals,
            filter,
            virtual_columns,
            result_format: ScanResultFormat::CompactedList,
            columns,
            limit: external.limit,
            order,
            context: external.context.clone(),
        }),
        context: PlanContext::default(),
        post_transform: RowTransform::datum(transforms),
    })
}

// ---------------------------------------------------------------------------
// Split planning
// ---------------------------------------------------------------------------

fn plan_split(external: &External, data_source: DataSource) -> PlanResult<QueryAndPostTransform> {
    let split = external
        .split
        .as_ref()
        .ok_or_else(|| PlanError::invalid("split mode requires a split"))?;

    let (intervals, filter) = plan_intervals(external)?;
    let lowered_aggs = AggregationBuilder::new(external).build(&external.applies)?;

    if split.keys.len() == 1 && external.query_selection == QuerySelection::Any {
        let key = &split.keys[0];

        // timeseries: a derivable granularity, a timestamp-compatible sort,
        // no limit, trivial having
        if let Some(granularity) = split_to_granularity(&key.expression, external) {
            let timestamp_compatible = match &external.sort {
                None => true,
                Some(sort) => sort.ref_name == key.name,
            };
            if timestamp_compatible && external.having_filter.is_true_literal() {
                if external.limit.is_some() {
                    return Err(PlanError::unsupported(
                        "can not limit within a timeseries query",
                    ));
                }
                return plan_timeseries_split(
                    external,
                    data_source,
                    key,
                    granularity,
                    intervals,
                    filter,
                    lowered_aggs,
                );
            }
        }

        // topN: approximate ranking over a single dimension
        if !external.exact_results_only && external.having_filter.is_true_literal() {
            if let Some(sort) = &external.sort {
                if let Some(metric) = topn_metric(sort, key, external) {
                    let bounded = external.limit.is_some()
                        || max_bucket_count(&key.expression, external)
                            .map(|n| n <= TOPN_BUCKET_BOUND)
                            .unwrap_or(false);
                    if bounded {
                        return plan_topn_split(
                            external,
                            data_source,
                            key,
                            metric,
                            intervals,
                            filter,
                            lowered_aggs,
                        );
                    }
                }
            }
        }
    }

    plan_groupby_split(external, data_source, split, intervals, filter, lowered_aggs)
}

fn plan_timeseries_split(
    external: &External,
    data_source: DataSource,
    key: &SplitKey,
    granularity: Granularity,
    intervals: Vec<String>,
    filter: Option<super::query::DruidFilter>,
    lowered_aggs: LoweredAggregations,
) -> PlanResult<QueryAndPostTransform> {
    debug!(key = %key.name, "selected timeseries shape");
    let descending = matches!(
        &external.sort,
        Some(sort) if sort.direction == Direction::Descending
    );

    let mut context = external.context.clone();
    context
        .entry("skipEmptyBuckets".to_string())
        .or_insert_with(|| serde_json::json!("true"));

    let post_transform =
        RowTransform::datum(external.applies.iter().map(apply_column).collect())
            .with_timestamp_label(&key.name);

    let mut plan_ctx = plan_context(&lowered_aggs, false);
    plan_ctx.timestamp = Some(key.name.clone());

    Ok(QueryAndPostTransform {
        query: DruidQuery::Timeseries(TimeseriesQuery {
            data_source,
            intervals,
            granularity,
            filter,
            virtual_columns: Vec::new(),
            aggregations: lowered_aggs.aggregations,
            post_aggregations: lowered_aggs.post_aggregations,
            descending,
            context,
        }),
        context: plan_ctx,
        post_transform,
    })
}

/// The topN ordering metric for a sort, when the sort is topN-compatible:
/// the dimension itself, or an apply whose expression contains no filter
/// over the time reference.
fn topn_metric(
    sort: &crate::external::SortSpec,
    key: &SplitKey,
    external: &External,
) -> Option<TopNMetric> {
    if sort.ref_name == key.name {
        let ordering = match key.expression.result_type() {
            ExprType::Number | ExprType::Time => StringComparator::Numeric,
            _ => StringComparator::Lexicographic,
        };
        let metric = TopNMetric::Spec(TopNMetricSpec::Dimension { ordering });
        // dimension ordering is naturally ascending
        return Some(match sort.direction {
            Direction::Ascending => metric,
            Direction::Descending => TopNMetric::Spec(TopNMetricSpec::Inverted {
                metric: Box::new(metric),
            }),
        });
    }

    let apply = external.apply_by_name(&sort.ref_name)?;
    let filters_time = apply.expression.any(&|e| match e {
        Expr::Filter { predicate, .. } => {
            predicate.any(&|p| external.is_time_ref(p))
        }
        _ => false,
    });
    if filters_time {
        return None;
    }
    let metric = TopNMetric::Aggregate(apply.name.clone());
    // aggregate metrics are naturally descending
    Some(match sort.direction {
        Direction::Descending => metric,
        Direction::Ascending => TopNMetric::Spec(TopNMetricSpec::Inverted {
            metric: Box::new(metric),
        }),
    })
}

fn plan_topn_split(
    external: &External,
    data_source: DataSource,
    key: &SplitKey,
    metric: TopNMetric,
    intervals: Vec<String>,
    filter: Option<super::query::DruidFilter>,
    lowered_aggs: LoweredAggregations,
) -> PlanResult<QueryAndPostTransform> {
    debug!(key = %key.name, "selected topN shape");
    let dimension = expression_to_dimension_inflater(&key.expression, &key.name, external)?;

    let mut transforms = vec![{
        let mut t = ColumnTransform::new(&dimension.emitted_name, &dimension.output_name);
        if let Some(inflater) = dimension.inflater {
            t = t.with_inflater(inflater);
        }
        t
    }];
    transforms.extend(external.applies.iter().map(apply_column));

    let dummy_used = dimension.emitted_name != dimension.output_name;
    Ok(QueryAndPostTransform {
        query: DruidQuery::TopN(TopNQuery {
            data_source,
            intervals,
            granularity: Granularity::All,
            filter,
            virtual_columns: dimension.virtual_columns,
            dimension: dimension.dimension,
            aggregations: lowered_aggs.aggregations.clone(),
            post_aggregations: lowered_aggs.post_aggregations.clone(),
            metric,
            threshold: external.limit.unwrap_or(DEFAULT_TOPN_THRESHOLD),
            context: external.context.clone(),
        }),
        context: plan_context(&lowered_aggs, dummy_used),
        post_transform: RowTransform::datum(transforms),
    })
}

fn plan_groupby_split(
    external: &External,
    data_source: DataSource,
    split: &SplitSpec,
    intervals: Vec<String>,
    filter: Option<super::query::DruidFilter>,
    lowered_aggs: LoweredAggregations,
) -> PlanResult<QueryAndPostTransform> {
    debug!(keys = split.keys.len(), "selected groupBy shape");
    let mut virtual_columns: Vec<VirtualColumn> = Vec::new();
    let mut dimensions: Vec<DimensionSpec> = Vec::new();
    let mut transforms: Vec<ColumnTransform> = Vec::new();
    let mut dummy_used = false;
    let mut having_residue = external.having_filter.clone();

    for key in &split.keys {
        let (lowered, residue) = expression_to_dimension_inflater_having(
            &key.expression,
            &key.name,
            &having_residue,
            external,
        )?;
        having_residue = residue;
        virtual_columns.extend(lowered.virtual_columns.clone());
        dimensions.push(lowered.dimension.clone());
        dummy_used = dummy_used || lowered.emitted_name != lowered.output_name;
        let mut transform = ColumnTransform::new(&lowered.emitted_name, &lowered.output_name);
        if let Some(inflater) = lowered.inflater {
            transform = transform.with_inflater(inflater);
        }
        transforms.push(transform);
    }
    transforms.extend(external.applies.iter().map(apply_column));

    let limit_spec = if external.sort.is_some() || external.limit.is_some() {
        let columns = match &external.sort {
            Some(sort) => {
                let direction = match sort.direction {
                    Direction::Ascending => SortOrder::Ascending,
                    Direction::Descending => SortOrder::Descending,
                };
                let sorted_key = split.keys.iter().find(|k| k.name == sort.ref_name);
                if sorted_key.is_none() && external.apply_by_name(&sort.ref_name).is_none() {
                    return Err(PlanError::unsupported(format!(
                        "can not sort on unknown column '{}'",
                        sort.ref_name
                    )));
                }
                let dimension_order = sorted_key.and_then(|key| {
                    matches!(
                        key.expression.result_type(),
                        ExprType::Number | ExprType::Time
                    )
                    .then_some(StringComparator::Numeric)
                });
                vec![OrderByColumn {
                    dimension: adjust_output_name(&sort.ref_name),
                    direction,
                    dimension_order,
                }]
            }
            None => Vec::new(),
        };
        Some(LimitSpec::Default {
            limit: external.limit,
            columns,
        })
    } else {
        None
    };

    let having = if having_residue.is_true_literal() {
        None
    } else {
        Some(build_having(&having_residue)?)
    };

    Ok(QueryAndPostTransform {
        query: DruidQuery::GroupBy(GroupByQuery {
            data_source,
            intervals,
            granularity: Granularity::All,
            filter,
            virtual_columns,
            dimensions,
            aggregations: lowered_aggs.aggregations.clone(),
            post_aggregations: lowered_aggs.post_aggregations.clone(),
            limit_spec,
            having,
            context: external.context.clone(),
        }),
        context: plan_context(&lowered_aggs, dummy_used),
        post_transform: RowTransform::datum(transforms),
    })
}

// ---------------------------------------------------------------------------
// Re-split (nested group-by)
// ---------------------------------------------------------------------------

/// True when any apply, or the value expression, contains a split in its
/// aggregate chain. The rewrite is mode-agnostic.
fn has_resplit(external: &External) -> bool {
    let contains_split = |e: &Expr| e.any(&|node| matches!(node, Expr::Split { .. }));
    external
        .applies
        .iter()
        .any(|apply| contains_split(&apply.expression))
        || external
            .value_expression
            .as_ref()
            .map(|e| contains_split(e))
            .unwrap_or(false)
}

struct ResplitRewriter {
    common_split: Option<(Vec<SplitKey>, String)>,
    inner_applies: Vec<ApplySpec>,
    counter: usize,
}

/// The parsed shape `aggregate( apply( split( ref | filter(ref) ) ) )`.
struct ResplitParts<'a> {
    keys: &'a [SplitKey],
    data_name: &'a str,
    inner_name: &'a str,
    inner_agg: &'a Expr,
    split_filter: Option<&'a Expr>,
}

fn parse_resplit_agg(expr: &Expr) -> Option<ResplitParts<'_>> {
    let (operand, expression) = match expr {
        Expr::Count { operand } => (operand, None),
        Expr::Sum {
            operand,
            expression,
        }
        | Expr::Min {
            operand,
            expression,
        }
        | Expr::Max {
            operand,
            expression,
        }
        | Expr::CountDistinct {
            operand,
            expression,
            ..
        }
        | Expr::Quantile {
            operand,
            expression,
            ..
        } => (operand, Some(expression)),
        _ => return None,
    };

    let Expr::Apply {
        operand: split_expr,
        name: inner_name,
        expression: inner_agg,
    } = operand.as_ref()
    else {
        return None;
    };
    let Expr::Split {
        operand: base,
        keys,
        data_name,
    } = split_expr.as_ref()
    else {
        return None;
    };
    let split_filter = match base.as_ref() {
        Expr::Ref { .. } => None,
        Expr::Filter { predicate, .. } => Some(predicate.as_ref()),
        _ => return None,
    };

    // a chain-unary outer aggregate must consume the inner apply's column
    if let Some(expression) = expression {
        match expression.as_ref() {
            Expr::Ref { name, .. } if name == inner_name => {}
            _ => return None,
        }
    }

    Some(ResplitParts {
        keys,
        data_name,
        inner_name,
        inner_agg: inner_agg.as_ref(),
        split_filter,
    })
}

/// The scalar input of a chain-unary aggregate, `None` for count.
fn aggregate_expression(agg: &Expr) -> Option<&Expr> {
    match agg {
        Expr::Sum { expression, .. }
        | Expr::Min { expression, .. }
        | Expr::Max { expression, .. }
        | Expr::CountDistinct { expression, .. }
        | Expr::Quantile { expression, .. } => Some(expression),
        _ => None,
    }
}

/// Rebuild an aggregate of the same kind over a new operand and input.
fn rebuild_aggregate(template: &Expr, operand: Expr, expression: Expr) -> PlanResult<Expr> {
    let operand = Box::new(operand);
    let expression = Box::new(expression);
    Ok(match template {
        Expr::Count { .. } => Expr::Count { operand },
        Expr::Sum { .. } => Expr::Sum {
            operand,
            expression,
        },
        Expr::Min { .. } => Expr::Min {
            operand,
            expression,
        },
        Expr::Max { .. } => Expr::Max {
            operand,
            expression,
        },
        Expr::CountDistinct { options, .. } => Expr::CountDistinct {
            operand,
            expression,
            options: *options,
        },
        Expr::Quantile { value, options, .. } => Expr::Quantile {
            operand,
            expression,
            value: *value,
            options: *options,
        },
        other => {
            return Err(PlanError::unsupported(format!(
                "can not rewrite {} over a re-split intermediate",
                other.op_name()
            )))
        }
    })
}

/// Divide a split key between the inner and outer query: buckets are kept
/// on the inner side and reapplied on the intermediate; anything else
/// passes through as a bare reference.
fn divvy_split_key(name: &str, expression: &Expr) -> (Expr, Expr) {
    match expression {
        Expr::TimeBucket {
            period, time_zone, ..
        }
        | Expr::TimeFloor {
            period, time_zone, ..
        } => (
            expression.clone(),
            Expr::TimeBucket {
                operand: Box::new(Expr::reference(name, ExprType::Time)),
                period: period.clone(),
                time_zone: time_zone.clone(),
            },
        ),
        Expr::NumberBucket { size, offset, .. } => (
            expression.clone(),
            Expr::NumberBucket {
                operand: Box::new(Expr::reference(name, ExprType::Number)),
                size: *size,
                offset: *offset,
            },
        ),
        other => (
            other.clone(),
            Expr::reference(name, other.result_type()),
        ),
    }
}

impl ResplitRewriter {
    fn main_ref(&self) -> Expr {
        Expr::reference("main", ExprType::Dataset)
    }

    fn record_split(&mut self, keys: &[SplitKey], data_name: &str) -> PlanResult<()> {
        match &self.common_split {
            None => {
                self.common_split = Some((keys.to_vec(), data_name.to_string()));
                Ok(())
            }
            Some((existing, _)) if existing.as_slice() == keys => Ok(()),
            Some(_) => Err(PlanError::invalid(
                "all resplit aggregators must have the same split",
            )),
        }
    }

    /// Rewrite one apply expression: re-split aggregates become outer
    /// aggregates over fresh intermediates, plain aggregates pull through.
    fn rewrite(&mut self, apply_name: &str, expr: &Expr) -> PlanResult<Expr> {
        if let Some(parts) = parse_resplit_agg(expr) {
            self.record_split(parts.keys, parts.data_name)?;

            let intermediate = format!("{}_{}", parts.inner_name, self.counter);
            self.counter += 1;

            let mut inner_agg = parts.inner_agg.with_force_finalize();
            let mut outer_operand = self.main_ref();
            if let Some(predicate) = parts.split_filter {
                // the inner aggregate sees only filtered rows; the outer
                // aggregate skips buckets where the filter matched nothing
                let filtered = Expr::Filter {
                    operand: Box::new(self.main_ref()),
                    predicate: Box::new(predicate.clone()),
                };
                let inner_expression = aggregate_expression(&inner_agg)
                    .cloned()
                    .unwrap_or_else(|| self.main_ref());
                inner_agg = rebuild_aggregate(&inner_agg, filtered.clone(), inner_expression)?;
                let def_name = format!("{}_def", intermediate);
                self.inner_applies.push(ApplySpec::new(
                    def_name.clone(),
                    Expr::Count {
                        operand: Box::new(filtered),
                    },
                ));
                outer_operand = Expr::Filter {
                    operand: Box::new(self.main_ref()),
                    predicate: Box::new(Expr::Not(Box::new(Expr::Is {
                        operand: Box::new(Expr::reference(&def_name, ExprType::Number)),
                        value: Box::new(Expr::Literal(crate::expression::Value::Number(0.0))),
                    }))),
                };
            }
            self.inner_applies
                .push(ApplySpec::new(intermediate.clone(), inner_agg));

            return rebuild_aggregate(
                expr,
                outer_operand,
                Expr::reference(&intermediate, ExprType::Number),
            );
        }

        if expr.is_aggregate() {
            if matches!(expr, Expr::CustomAggregate { .. }) {
                return Err(PlanError::unsupported(
                    "custom aggregates can not be combined with a re-split",
                ));
            }
            // pull-through: evaluate per inner bucket, then recombine
            let intermediate = format!("{}_{}", apply_name, self.counter);
            self.counter += 1;
            self.inner_applies
                .push(ApplySpec::new(intermediate.clone(), expr.clone()));
            let int_ref = Expr::reference(&intermediate, ExprType::Number);
            return match expr {
                // a count of rows recombines as a sum of bucket counts
                Expr::Count { .. } => Ok(Expr::Sum {
                    operand: Box::new(self.main_ref()),
                    expression: Box::new(int_ref),
                }),
                other => rebuild_aggregate(other, self.main_ref(), int_ref),
            };
        }

        match expr {
            Expr::Literal(_) | Expr::Ref { .. } => Ok(expr.clone()),
            Expr::Add(items) => Ok(Expr::Add(self.rewrite_all(apply_name, items)?)),
            Expr::Multiply(items) => Ok(Expr::Multiply(self.rewrite_all(apply_name, items)?)),
            Expr::Subtract(a, b) => Ok(Expr::Subtract(
                Box::new(self.rewrite(apply_name, a)?),
                Box::new(self.rewrite(apply_name, b)?),
            )),
            Expr::Divide(a, b) => Ok(Expr::Divide(
                Box::new(self.rewrite(apply_name, a)?),
                Box::new(self.rewrite(apply_name, b)?),
            )),
            Expr::Power(a, b) => Ok(Expr::Power(
                Box::new(self.rewrite(apply_name, a)?),
                Box::new(self.rewrite(apply_name, b)?),
            )),
            Expr::Log(a) => Ok(Expr::Log(Box::new(self.rewrite(apply_name, a)?))),
            Expr::Absolute(a) => Ok(Expr::Absolute(Box::new(self.rewrite(apply_name, a)?))),
            Expr::Fallback { operand, fallback } => Ok(Expr::Fallback {
                operand: Box::new(self.rewrite(apply_name, operand)?),
                fallback: Box::new(self.rewrite(apply_name, fallback)?),
            }),
            other => Err(PlanError::unsupported(format!(
                "can not rewrite {} around a re-split aggregate",
                other.op_name()
            ))),
        }
    }

    fn rewrite_all(&mut self, apply_name: &str, items: &[Expr]) -> PlanResult<Vec<Expr>> {
        items
            .iter()
            .map(|item| self.rewrite(apply_name, item))
            .collect()
    }
}

/// Plan an External whose aggregates contain re-splits as a nested
/// group-by: the inner query materializes per-(outer x inner)-bucket
/// intermediates, the outer query re-aggregates them. Applies regardless of
/// mode; a total or value outer query simply has no split keys of its own.
fn plan_resplit(external: &External) -> PlanResult<QueryAndPostTransform> {
    debug!(mode = ?external.mode, "re-split aggregates detected, planning nested groupBy");
    let own_keys: &[SplitKey] = external
        .split
        .as_ref()
        .map(|split| split.keys.as_slice())
        .unwrap_or(&[]);

    let mut rewriter = ResplitRewriter {
        common_split: None,
        inner_applies: Vec::new(),
        counter: 0,
    };
    let mut outer_applies = Vec::new();
    let mut outer_value = None;
    match external.mode {
        Mode::Value => {
            let expr = external.value_expression.as_ref().ok_or_else(|| {
                PlanError::invalid("value mode requires a value expression")
            })?;
            outer_value = Some(rewriter.rewrite("value", &external.inline_derived(expr))?);
        }
        _ => {
            for apply in &external.applies {
                let expr = external.inline_derived(&apply.expression);
                let rewritten = rewriter.rewrite(&apply.name, &expr)?;
                outer_applies.push(ApplySpec::new(apply.name.clone(), rewritten));
            }
        }
    }
    let (resplit_keys, data_name) = rewriter
        .common_split
        .take()
        .ok_or_else(|| PlanError::unsupported("no re-split aggregate found"))?;
    let inner_applies = rewriter.inner_applies;

    // merge the re-split keys with the outer query's own split keys;
    // shared expressions surface once, under the outer name
    let mut inner_keys: Vec<SplitKey> = Vec::new();
    let mut outer_keys: Vec<SplitKey> = Vec::new();
    for key in &resplit_keys {
        match own_keys
            .iter()
            .find(|outer| outer.expression == key.expression)
        {
            Some(outer) => {
                let (inner_expr, outer_expr) = divvy_split_key(&outer.name, &key.expression);
                inner_keys.push(SplitKey::new(&outer.name, inner_expr));
                outer_keys.push(SplitKey::new(&outer.name, outer_expr));
            }
            None => {
                let (inner_expr, _) = divvy_split_key(&key.name, &key.expression);
                inner_keys.push(SplitKey::new(&key.name, inner_expr));
            }
        }
    }
    for key in own_keys {
        if resplit_keys
            .iter()
            .any(|inner| inner.expression == key.expression)
        {
            continue;
        }
        let (inner_expr, outer_expr) = divvy_split_key(&key.name, &key.expression);
        inner_keys.push(SplitKey::new(&key.name, inner_expr));
        outer_keys.push(SplitKey::new(&key.name, outer_expr));
    }

    // inner query: group by everything, no sort, no limit
    let inner_external = External::new(&external.source, external.raw_attributes.clone())
        .with_mode(Mode::Split)
        .with_filter(external.filter.clone())
        .with_split(SplitSpec {
            keys: inner_keys.clone(),
            data_name: data_name.clone(),
        })
        .with_applies(inner_applies.clone())
        .with_time_attribute(&external.time_attribute)
        .with_allow_eternity(external.allow_eternity)
        .with_query_selection(QuerySelection::GroupByOnly);
    let inner_external = External {
        derived_attributes: external.derived_attributes.clone(),
        custom_aggregations: external.custom_aggregations.clone(),
        custom_transforms: external.custom_transforms.clone(),
        ..inner_external
    };
    let inner = plan_split(&inner_external, DataSource::table(&external.source))?;

    // outer query: over the intermediate schema, all of time
    let intermediate_attributes: Attributes = inner_keys
        .iter()
        .map(|key| {
            let attr_type = key.expression.result_type();
            let native = match attr_type {
                ExprType::Time => "LONG",
                ExprType::Number => "DOUBLE",
                _ => "STRING",
            };
            AttributeInfo::new(&key.name, attr_type).with_native_type(native)
        })
        .chain(inner_applies.iter().map(|apply| {
            AttributeInfo::new(&apply.name, ExprType::Number)
                .with_native_type(aggregate_native_type(&apply.expression, &inner_external))
        }))
        .collect();

    let outer_base = External::new(&external.source, intermediate_attributes)
        .with_time_attribute(&external.time_attribute)
        .with_allow_eternity(true)
        .with_query_selection(QuerySelection::GroupByOnly);
    let nested = DataSource::Nested(Box::new(inner.query));

    match external.mode {
        Mode::Split => {
            let mut outer_external = outer_base
                .with_split(SplitSpec {
                    keys: outer_keys,
                    data_name,
                })
                .with_applies(outer_applies)
                .with_having_filter(external.having_filter.clone());
            outer_external.sort = external.sort.clone();
            outer_external.limit = external.limit;
            plan_split(&outer_external, nested)
        }
        // a total or value outer query re-aggregates over every inner
        // bucket: a zero-dimension group-by over the nested query
        Mode::Total => {
            let outer_external = outer_base
                .with_mode(Mode::Total)
                .with_applies(outer_applies);
            plan_totals(&outer_external, nested)
        }
        Mode::Value => {
            let expr = outer_value.expect("value mode rewrites its value expression");
            let outer_external = outer_base.with_value_expression(expr);
            plan_totals(&outer_external, nested)
        }
        Mode::Raw => Err(PlanError::invalid(
            "raw mode can not carry re-split aggregates",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time_bucket() -> Expr {
        Expr::TimeBucket {
            operand: Box::new(Expr::reference("time", ExprType::Time)),
            period: "P1D".to_string(),
            time_zone: "Etc/UTC".to_string(),
        }
    }

    #[test]
    fn test_divvy_keeps_buckets_on_both_sides() {
        let (inner, outer) = divvy_split_key("day", &time_bucket());
        assert_eq!(inner, time_bucket());
        match outer {
            Expr::TimeBucket { operand, .. } => {
                assert_eq!(*operand, Expr::reference("day", ExprType::Time));
            }
            other => panic!("expected time bucket, got {:?}", other),
        }
    }

    #[test]
    fn test_divvy_passes_plain_expressions_through() {
        let expr = Expr::reference("country", ExprType::String);
        let (inner, outer) = divvy_split_key("country", &expr);
        assert_eq!(inner, expr);
        assert_eq!(outer, Expr::reference("country", ExprType::String));
    }

    #[test]
    fn test_parse_resplit_requires_matching_inner_reference() {
        let split = Expr::Split {
            operand: Box::new(Expr::reference("main", ExprType::Dataset)),
            keys: vec![SplitKey::new(
                "page",
                Expr::reference("page", ExprType::String),
            )],
            data_name: "inner".to_string(),
        };
        let apply = Expr::Apply {
            operand: Box::new(split),
            name: "x".to_string(),
            expression: Box::new(Expr::Count {
                operand: Box::new(Expr::reference("inner", ExprType::Dataset)),
            }),
        };
        let good = Expr::Max {
            operand: Box::new(apply.clone()),
            expression: Box::new(Expr::reference("x", ExprType::Number)),
        };
        assert!(parse_resplit_agg(&good).is_some());

        // consuming a different column is not a re-split of this apply
        let bad = Expr::Max {
            operand: Box::new(apply),
            expression: Box::new(Expr::reference("y", ExprType::Number)),
        };
        assert!(parse_resplit_agg(&bad).is_none());
    }
}
