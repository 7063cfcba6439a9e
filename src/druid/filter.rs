//! Filter lowering
//!
//! Partitions a filter into (i) a time-interval set on the time column and
//! (ii) a residual dimension filter. AND distributes across the two sides;
//! an OR must not mix them.

use super::error::{PlanError, PlanResult};
use super::expression::{lower_expression, TIME_COLUMN};
use super::extraction::{build_extraction_fn, ExtractionContext};
use super::query::{DruidFilter, SearchQuerySpec, StringComparator};
use crate::expression::{format_iso, CompareOp, Expr, ExprType, Value};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;

pub struct FilterContext<'a> {
    pub time_attribute: &'a str,
    pub custom_transforms: &'a BTreeMap<String, serde_json::Value>,
}

impl<'a> FilterContext<'a> {
    fn extraction(&self) -> ExtractionContext<'a> {
        ExtractionContext {
            time_attribute: self.time_attribute,
            custom_transforms: self.custom_transforms,
        }
    }
}

/// The two halves of a lowered filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterAndIntervals {
    /// `start/end` interval strings; empty means no time constraint.
    pub intervals: Vec<String>,
    pub filter: Option<DruidFilter>,
}

/// Feasibility gate: set-cardinality cannot appear inside a filter.
pub fn can_handle_filter(expr: &Expr) -> bool {
    !expr.any(&|e| matches!(e, Expr::Cardinality(_)))
}

pub fn eternity_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1000, 1, 1, 0, 0, 0).unwrap()
}

pub fn eternity_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(3000, 1, 1, 0, 0, 0).unwrap()
}

/// Lower a filter expression into intervals plus a residual filter.
pub fn build_filter(expr: &Expr, ctx: &FilterContext<'_>) -> PlanResult<FilterAndIntervals> {
    if !can_handle_filter(expr) {
        return Err(PlanError::unsupported(
            "set cardinality can not appear inside a filter",
        ));
    }
    if expr.is_true_literal() {
        return Ok(FilterAndIntervals {
            intervals: Vec::new(),
            filter: None,
        });
    }

    let mut interval_sets: Vec<Vec<(DateTime<Utc>, DateTime<Utc>)>> = Vec::new();
    let mut dimension_parts: Vec<DruidFilter> = Vec::new();

    for conjunct in flatten_and(expr) {
        match interval_candidate(conjunct, ctx)? {
            Some(intervals) => interval_sets.push(intervals),
            None => dimension_parts.push(timeless_to_druid(conjunct, ctx)?),
        }
    }

    let mut intervals = Vec::new();
    if !interval_sets.is_empty() {
        let mut merged = interval_sets.remove(0);
        for set in interval_sets {
            merged = intersect_interval_sets(&merged, &set);
        }
        intervals = merged
            .into_iter()
            .map(|(start, end)| format!("{}/{}", format_iso(&start), format_iso(&end)))
            .collect();
        if intervals.is_empty() {
            return Err(PlanError::unsupported(
                "time filter reduces to an empty interval set",
            ));
        }
    }

    Ok(FilterAndIntervals {
        intervals,
        filter: DruidFilter::and(dimension_parts),
    })
}

fn flatten_and(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::And(items) => items.iter().flat_map(flatten_and).collect(),
        other => vec![other],
    }
}

fn is_bare_time_ref(expr: &Expr, ctx: &FilterContext<'_>) -> bool {
    matches!(expr, Expr::Ref { name, nest: 0, .. } if name == ctx.time_attribute)
}

fn references_time(expr: &Expr, ctx: &FilterContext<'_>) -> bool {
    expr.any(&|e| is_bare_time_ref(e, ctx))
}

/// Intervals for a conjunct that constrains the bare time reference, `None`
/// when the conjunct belongs to the dimension side.
fn interval_candidate(
    expr: &Expr,
    ctx: &FilterContext<'_>,
) -> PlanResult<Option<Vec<(DateTime<Utc>, DateTime<Utc>)>>> {
    match expr {
        Expr::Overlap { operand, range } if is_bare_time_ref(operand, ctx) => {
            match range.as_ref() {
                Expr::Literal(Value::TimeRange { start, end }) => Ok(Some(vec![(*start, *end)])),
                other => Err(PlanError::unsupported(format!(
                    "can not derive intervals from overlap with {}",
                    other.op_name()
                ))),
            }
        }
        Expr::Is { operand, value } if is_bare_time_ref(operand, ctx) => match value.as_ref() {
            Expr::Literal(Value::Time(t)) => {
                Ok(Some(vec![(*t, *t + Duration::milliseconds(1))]))
            }
            other => Err(PlanError::unsupported(format!(
                "can not derive intervals from equality with {}",
                other.op_name()
            ))),
        },
        Expr::Compare { op, left, right } => {
            let (time_on_left, literal) = match (left.as_ref(), right.as_ref()) {
                (l, Expr::Literal(Value::Time(t))) if is_bare_time_ref(l, ctx) => (true, *t),
                (Expr::Literal(Value::Time(t)), r) if is_bare_time_ref(r, ctx) => (false, *t),
                _ => return Ok(None),
            };
            // normalize to `time OP literal`
            let op = if time_on_left {
                *op
            } else {
                match op {
                    CompareOp::Greater => CompareOp::Less,
                    CompareOp::GreaterOrEqual => CompareOp::LessOrEqual,
                    CompareOp::Less => CompareOp::Greater,
                    CompareOp::LessOrEqual => CompareOp::GreaterOrEqual,
                }
            };
            let interval = match op {
                CompareOp::Less => (eternity_start(), literal),
                CompareOp::LessOrEqual => {
                    (eternity_start(), literal + Duration::milliseconds(1))
                }
                CompareOp::GreaterOrEqual => (literal, eternity_end()),
                CompareOp::Greater => (literal + Duration::milliseconds(1), eternity_end()),
            };
            Ok(Some(vec![interval]))
        }
        Expr::Or(items) => {
            let mut any_time = false;
            let mut all_time = true;
            let mut union = Vec::new();
            for item in items {
                match interval_candidate(item, ctx)? {
                    Some(mut intervals) => {
                        any_time = true;
                        union.append(&mut intervals);
                    }
                    None => {
                        all_time = false;
                        if references_time(item, ctx) {
                            return Err(PlanError::unsupported(
                                "can not mix time and dimension terms in an OR",
                            ));
                        }
                    }
                }
            }
            if any_time && !all_time {
                return Err(PlanError::unsupported(
                    "can not mix time and dimension terms in an OR",
                ));
            }
            Ok(if any_time { Some(union) } else { None })
        }
        _ => Ok(None),
    }
}

fn intersect_interval_sets(
    a: &[(DateTime<Utc>, DateTime<Utc>)],
    b: &[(DateTime<Utc>, DateTime<Utc>)],
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut out = Vec::new();
    for (s1, e1) in a {
        for (s2, e2) in b {
            let start = (*s1).max(*s2);
            let end = (*e1).min(*e2);
            if start < end {
                out.push((start, end));
            }
        }
    }
    out
}

/// Lower a filter term to a dimension filter. Time references are legal
/// here (bound filters on the native time column); this is also the entry
/// point for aggregate filters, which have no interval side.
pub fn timeless_to_druid(expr: &Expr, ctx: &FilterContext<'_>) -> PlanResult<DruidFilter> {
    match expr {
        Expr::And(items) => Ok(DruidFilter::And {
            fields: items
                .iter()
                .map(|item| timeless_to_druid(item, ctx))
                .collect::<PlanResult<Vec<_>>>()?,
        }),
        Expr::Or(items) => Ok(DruidFilter::Or {
            fields: items
                .iter()
                .map(|item| timeless_to_druid(item, ctx))
                .collect::<PlanResult<Vec<_>>>()?,
        }),
        Expr::Not(inner) => Ok(DruidFilter::Not {
            field: Box::new(timeless_to_druid(inner, ctx)?),
        }),

        Expr::Is { operand, value } => {
            let (dimension, extraction_fn) = dimension_and_extraction(operand, ctx)?;
            let value = literal_filter_value(value)?;
            Ok(DruidFilter::Selector {
                dimension,
                value,
                extraction_fn,
            })
        }

        Expr::In { operand, values } => {
            let (dimension, extraction_fn) = dimension_and_extraction(operand, ctx)?;
            match values.as_ref() {
                Expr::Literal(Value::StringSet(items)) => Ok(DruidFilter::In {
                    dimension,
                    values: items.iter().map(|s| serde_json::json!(s)).collect(),
                    extraction_fn,
                }),
                other => Err(PlanError::unsupported(format!(
                    "can not filter by membership in {}",
                    other.op_name()
                ))),
            }
        }

        Expr::Match { operand, regex } => {
            let (dimension, extraction_fn) = dimension_and_extraction(operand, ctx)?;
            Ok(DruidFilter::Regex {
                dimension,
                pattern: regex.clone(),
                extraction_fn,
            })
        }

        Expr::Contains {
            operand,
            needle,
            ignore_case,
        } => {
            let (dimension, extraction_fn) = dimension_and_extraction(operand, ctx)?;
            match needle.as_ref() {
                Expr::Literal(Value::String(s)) => Ok(DruidFilter::Search {
                    dimension,
                    query: SearchQuerySpec::Contains {
                        value: s.clone(),
                        case_sensitive: !ignore_case,
                    },
                    extraction_fn,
                }),
                other => Err(PlanError::unsupported(format!(
                    "can not search for {}",
                    other.op_name()
                ))),
            }
        }

        Expr::Compare { op, left, right } => lower_comparison(*op, left, right, ctx),

        Expr::Overlap { operand, range } => {
            let (dimension, extraction_fn) = dimension_and_extraction(operand, ctx)?;
            let (lower, upper, ordering) = match range.as_ref() {
                Expr::Literal(Value::NumberRange { start, end }) => (
                    format!("{}", start),
                    format!("{}", end),
                    StringComparator::Numeric,
                ),
                Expr::Literal(Value::TimeRange { start, end }) => (
                    format!("{}", start.timestamp_millis()),
                    format!("{}", end.timestamp_millis()),
                    StringComparator::Numeric,
                ),
                other => {
                    return Err(PlanError::unsupported(format!(
                        "can not filter by overlap with {}",
                        other.op_name()
                    )))
                }
            };
            Ok(DruidFilter::Bound {
                dimension,
                lower: Some(lower),
                upper: Some(upper),
                lower_strict: false,
                upper_strict: true,
                ordering,
                extraction_fn,
            })
        }

        // a bare boolean reference filters on its stringified truth
        Expr::Ref {
            declared_type: ExprType::Boolean,
            ..
        } => {
            let (dimension, extraction_fn) = dimension_and_extraction(expr, ctx)?;
            Ok(DruidFilter::Selector {
                dimension,
                value: serde_json::json!("true"),
                extraction_fn,
            })
        }

        other => {
            // last resort: the backend's expression filter
            let expression = lower_expression(other, ctx.time_attribute).map_err(|_| {
                PlanError::unsupported(format!("can not filter by {}", other.op_name()))
            })?;
            Ok(DruidFilter::Expression { expression })
        }
    }
}

fn lower_comparison(
    op: CompareOp,
    left: &Expr,
    right: &Expr,
    ctx: &FilterContext<'_>,
) -> PlanResult<DruidFilter> {
    // normalize to `column OP literal`
    let (subject, literal, op) = match (left, right) {
        (subject, Expr::Literal(v)) => (subject, v, op),
        (Expr::Literal(v), subject) => (
            subject,
            v,
            match op {
                CompareOp::Greater => CompareOp::Less,
                CompareOp::GreaterOrEqual => CompareOp::LessOrEqual,
                CompareOp::Less => CompareOp::Greater,
                CompareOp::LessOrEqual => CompareOp::GreaterOrEqual,
            },
        ),
        _ => {
            return Err(PlanError::unsupported(
                "comparison requires a literal on one side",
            ))
        }
    };
    let (dimension, extraction_fn) = dimension_and_extraction(subject, ctx)?;
    let (rendered, ordering) = match literal {
        Value::Number(n) => (format!("{}", n), StringComparator::Numeric),
        Value::String(s) => (s.clone(), StringComparator::Lexicographic),
        Value::Time(t) => (
            format!("{}", t.timestamp_millis()),
            StringComparator::Numeric,
        ),
        other => {
            return Err(PlanError::unsupported(format!(
                "can not compare against {}",
                other.value_type()
            )))
        }
    };
    let (lower, upper, lower_strict, upper_strict) = match op {
        CompareOp::Greater => (Some(rendered), None, true, false),
        CompareOp::GreaterOrEqual => (Some(rendered), None, false, false),
        CompareOp::Less => (None, Some(rendered), false, true),
        CompareOp::LessOrEqual => (None, Some(rendered), false, false),
    };
    Ok(DruidFilter::Bound {
        dimension,
        lower,
        upper,
        lower_strict,
        upper_strict,
        ordering,
        extraction_fn,
    })
}

/// Resolve a scalar expression to the native column it reads plus the
/// extraction applied on top of it.
fn dimension_and_extraction(
    expr: &Expr,
    ctx: &FilterContext<'_>,
) -> PlanResult<(String, Option<super::query::ExtractionFn>)> {
    match expr {
        Expr::Ref { name, nest: 0, .. } => Ok((native_column(name, ctx), None)),
        other => {
            let refs = other.free_references();
            if refs.len() != 1 {
                return Err(PlanError::unsupported(format!(
                    "filter term must read exactly one column, {} reads {}",
                    other.op_name(),
                    refs.len()
                )));
            }
            let extraction_fn = build_extraction_fn(other, &ctx.extraction())?;
            Ok((native_column(&refs[0], ctx), Some(extraction_fn)))
        }
    }
}

fn native_column(name: &str, ctx: &FilterContext<'_>) -> String {
    if name == ctx.time_attribute {
        TIME_COLUMN.to_string()
    } else {
        name.to_string()
    }
}

fn literal_filter_value(expr: &Expr) -> PlanResult<serde_json::Value> {
    match expr {
        Expr::Literal(Value::String(s)) => Ok(serde_json::json!(s)),
        Expr::Literal(Value::Number(n)) => Ok(serde_json::json!(n)),
        Expr::Literal(Value::Bool(b)) => Ok(serde_json::json!(b.to_string())),
        Expr::Literal(Value::Null) => Ok(serde_json::Value::Null),
        Expr::Literal(Value::Time(t)) => Ok(serde_json::json!(t.timestamp_millis())),
        other => Err(PlanError::unsupported(format!(
            "can not filter for equality with {}",
            other.op_name()
        ))),
    }
}
