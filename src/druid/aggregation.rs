//! Aggregation lowering
//!
//! Lowers a list of applies (named aggregate expressions) into native
//! aggregations and post-aggregations. Aggregator output names are the
//! apply names; intermediates allocated for post-aggregation inputs are
//! prefixed with `!` so the post-transform drops them.

use super::error::{PlanError, PlanResult};
use super::expression::TIME_COLUMN;
use super::filter::{timeless_to_druid, FilterContext};
use super::query::{Aggregation, PostAggregation};
use crate::expression::{CastKind, Expr, Value};
use crate::external::{ApplySpec, External};

/// Name prefix marking aggregation columns dropped from output.
pub const IGNORE_PREFIX: &str = "!";

#[derive(Debug, Clone, PartialEq)]
pub struct LoweredAggregations {
    pub aggregations: Vec<Aggregation>,
    pub post_aggregations: Vec<PostAggregation>,
    /// True when `!`-prefixed intermediates were allocated.
    pub used_intermediates: bool,
}

/// The backend numeric type an aggregate produces; drives the long/double
/// choice and the typing of re-split intermediates.
pub fn aggregate_native_type(expr: &Expr, external: &External) -> &'static str {
    match expr {
        Expr::Count { .. } => "LONG",
        Expr::Sum { expression, .. }
        | Expr::Min { expression, .. }
        | Expr::Max { expression, .. } => {
            if is_long_expression(expression, external) {
                "LONG"
            } else {
                "DOUBLE"
            }
        }
        _ => "DOUBLE",
    }
}

fn is_long_expression(expr: &Expr, external: &External) -> bool {
    match expr {
        Expr::Ref { name, nest: 0, .. } => {
            if *name == external.time_attribute {
                return true;
            }
            external
                .raw_attributes
                .get(name)
                .map(|attr| attr.is_long())
                .unwrap_or(false)
        }
        _ => false,
    }
}

pub struct AggregationBuilder<'a> {
    external: &'a External,
    aggregations: Vec<Aggregation>,
    post_aggregations: Vec<PostAggregation>,
    counter: usize,
    used_intermediates: bool,
}

impl<'a> AggregationBuilder<'a> {
    pub fn new(external: &'a External) -> Self {
        Self {
            external,
            aggregations: Vec::new(),
            post_aggregations: Vec::new(),
            counter: 0,
            used_intermediates: false,
        }
    }

    pub fn build(mut self, applies: &[ApplySpec]) -> PlanResult<LoweredAggregations> {
        for apply in applies {
            let expr = self.external.inline_derived(&apply.expression);
            if expr.is_aggregate() {
                self.lower_named_aggregate(&apply.name, &expr)?;
            } else {
                let post = self.expression_to_post_aggregation(&expr)?;
                self.post_aggregations.push(post.named(&apply.name));
            }
        }
        Ok(LoweredAggregations {
            aggregations: self.aggregations,
            post_aggregations: self.post_aggregations,
            used_intermediates: self.used_intermediates,
        })
    }

    fn filter_context(&self) -> FilterContext<'a> {
        FilterContext {
            time_attribute: &self.external.time_attribute,
            custom_transforms: &self.external.custom_transforms,
        }
    }

    fn allocate_intermediate(&mut self) -> String {
        let name = format!("{}t_{}", IGNORE_PREFIX, self.counter);
        self.counter += 1;
        self.used_intermediates = true;
        name
    }

    /// Lower one aggregate under the given output name, wrapping in a
    /// filtered aggregator when its dataset operand is filtered.
    fn lower_named_aggregate(&mut self, name: &str, agg: &Expr) -> PlanResult<()> {
        check_aggregate_operand(agg)?;
        let (filter, force_finalize) = aggregate_filter_and_options(agg);

        // quantiles produce their value through a post-aggregation over a
        // hidden sketch fold, so they assemble their own parts
        if let Expr::Quantile {
            expression, value, ..
        } = agg
        {
            return self.lower_quantile(name, expression, *value, filter);
        }

        // a sketch-backed aggregate that must be finalized inside this
        // query emits under a hidden name plus a finalizing accessor
        let needs_final_access = force_finalize && aggregate_is_sketch_backed(agg);
        let agg_name = if needs_final_access {
            self.used_intermediates = true;
            format!("{}final_{}", IGNORE_PREFIX, name)
        } else {
            name.to_string()
        };

        let core = self.lower_core_aggregate(&agg_name, agg)?;
        let aggregation = match filter {
            Some(predicate) => Aggregation::Filtered {
                filter: timeless_to_druid(predicate, &self.filter_context())?,
                aggregator: Box::new(core),
            },
            None => core,
        };
        self.aggregations.push(aggregation);

        if needs_final_access {
            self.post_aggregations.push(PostAggregation::FinalizingFieldAccess {
                name: Some(name.to_string()),
                field_name: agg_name,
            });
        }
        Ok(())
    }

    fn lower_core_aggregate(&mut self, name: &str, agg: &Expr) -> PlanResult<Aggregation> {
        match agg {
            Expr::Count { .. } => Ok(Aggregation::Count {
                name: name.to_string(),
            }),

            Expr::Sum { expression, .. } => self.lower_simple_aggregate(
                name,
                expression,
                AggregateKind::Sum,
            ),
            Expr::Min { expression, .. } => self.lower_simple_aggregate(
                name,
                expression,
                AggregateKind::Min,
            ),
            Expr::Max { expression, .. } => self.lower_simple_aggregate(
                name,
                expression,
                AggregateKind::Max,
            ),

            Expr::CountDistinct { expression, .. } => {
                let column = self.single_column(expression)?;
                let native = self
                    .external
                    .raw_attributes
                    .get(&column)
                    .and_then(|attr| attr.native_type.clone());
                if native.as_deref() == Some("hyperUnique") {
                    Ok(Aggregation::HyperUnique {
                        name: name.to_string(),
                        field_name: column,
                    })
                } else {
                    Ok(Aggregation::Cardinality {
                        name: name.to_string(),
                        fields: vec![column],
                        by_row: true,
                    })
                }
            }

            Expr::CustomAggregate { name: key, .. } => {
                let spec = self
                    .external
                    .custom_aggregations
                    .get(key)
                    .ok_or_else(|| {
                        PlanError::invalid(format!("unknown custom aggregation '{}'", key))
                    })?;
                let mut spec = spec.clone();
                if let Some(object) = spec.as_object_mut() {
                    object.insert("name".to_string(), serde_json::json!(name));
                }
                Ok(Aggregation::Registered(spec))
            }

            other => Err(PlanError::unsupported(format!(
                "can not aggregate with {}",
                other.op_name()
            ))),
        }
    }

    fn lower_quantile(
        &mut self,
        name: &str,
        expression: &Expr,
        fraction: f64,
        filter: Option<&Expr>,
    ) -> PlanResult<()> {
        let column = self.single_column(expression)?;
        let native = self
            .external
            .raw_attributes
            .get(&column)
            .and_then(|attr| attr.native_type.clone())
            .unwrap_or_default();
        let hidden = self.allocate_intermediate();
        let sketch_based = native.contains("quantilesDoublesSketch");
        let fold = if sketch_based {
            Aggregation::QuantilesDoublesSketch {
                name: hidden.clone(),
                field_name: column,
            }
        } else {
            Aggregation::ApproxHistogramFold {
                name: hidden.clone(),
                field_name: column,
            }
        };
        let fold = match filter {
            Some(predicate) => Aggregation::Filtered {
                filter: timeless_to_druid(predicate, &self.filter_context())?,
                aggregator: Box::new(fold),
            },
            None => fold,
        };
        self.aggregations.push(fold);
        self.post_aggregations.push(if sketch_based {
            PostAggregation::QuantilesDoublesSketchToQuantile {
                name: Some(name.to_string()),
                field: Box::new(PostAggregation::FieldAccess { field_name: hidden }),
                fraction,
            }
        } else {
            PostAggregation::Quantile {
                name: Some(name.to_string()),
                field_name: hidden,
                probability: fraction,
            }
        });
        Ok(())
    }

    fn lower_simple_aggregate(
        &mut self,
        name: &str,
        expression: &Expr,
        kind: AggregateKind,
    ) -> PlanResult<Aggregation> {
        match expression {
            Expr::Ref { name: column, nest: 0, .. } => {
                let field_name = if *column == self.external.time_attribute {
                    TIME_COLUMN.to_string()
                } else {
                    column.clone()
                };
                let long = is_long_expression(expression, self.external);
                Ok(match (kind, long) {
                    (AggregateKind::Sum, true) => Aggregation::LongSum {
                        name: name.to_string(),
                        field_name,
                    },
                    (AggregateKind::Sum, false) => Aggregation::DoubleSum {
                        name: name.to_string(),
                        field_name,
                    },
                    (AggregateKind::Min, true) => Aggregation::LongMin {
                        name: name.to_string(),
                        field_name,
                    },
                    (AggregateKind::Min, false) => Aggregation::DoubleMin {
                        name: name.to_string(),
                        field_name,
                    },
                    (AggregateKind::Max, true) => Aggregation::LongMax {
                        name: name.to_string(),
                        field_name,
                    },
                    (AggregateKind::Max, false) => Aggregation::DoubleMax {
                        name: name.to_string(),
                        field_name,
                    },
                })
            }
            // arithmetic over columns falls back to a javascript aggregator
            other => javascript_aggregate(name, other, kind, &self.external.time_attribute),
        }
    }

    fn single_column(&self, expression: &Expr) -> PlanResult<String> {
        match expression {
            Expr::Ref { name, nest: 0, .. } => {
                if *name == self.external.time_attribute {
                    Ok(TIME_COLUMN.to_string())
                } else {
                    Ok(name.clone())
                }
            }
            other => Err(PlanError::unsupported(format!(
                "aggregate input must be a column, got {}",
                other.op_name()
            ))),
        }
    }

    /// Lower a scalar combination of aggregates into a post-aggregation.
    fn expression_to_post_aggregation(&mut self, expr: &Expr) -> PlanResult<PostAggregation> {
        match expr {
            Expr::Literal(Value::Number(n)) => Ok(PostAggregation::Constant {
                value: serde_json::json!(n),
            }),

            // a reference to a previously defined apply's output
            Expr::Ref { name, nest: 0, .. } => Ok(PostAggregation::FieldAccess {
                field_name: name.clone(),
            }),

            agg if agg.is_aggregate() => {
                let hidden = self.allocate_intermediate();
                self.lower_named_aggregate(&hidden, agg)?;
                if aggregate_is_sketch_backed(agg) {
                    Ok(PostAggregation::FinalizingFieldAccess {
                        name: None,
                        field_name: hidden,
                    })
                } else {
                    Ok(PostAggregation::FieldAccess { field_name: hidden })
                }
            }

            Expr::Add(items) => self.arithmetic_post("+", items),
            Expr::Multiply(items) => self.arithmetic_post("*", items),
            Expr::Subtract(a, b) => {
                self.arithmetic_post("-", &[(**a).clone(), (**b).clone()])
            }
            // the backend's arithmetic divide is already zero-safe
            Expr::Divide(a, b) => {
                self.arithmetic_post("/", &[(**a).clone(), (**b).clone()])
            }

            Expr::Power(..)
            | Expr::Log(_)
            | Expr::Absolute(_)
            | Expr::Cast { .. }
            | Expr::Fallback { .. } => self.javascript_post_aggregation(expr),

            other => Err(PlanError::unsupported(format!(
                "can not express {} as a post aggregation",
                other.op_name()
            ))),
        }
    }

    fn arithmetic_post(&mut self, func: &str, items: &[Expr]) -> PlanResult<PostAggregation> {
        let fields = items
            .iter()
            .map(|item| self.expression_to_post_aggregation(item))
            .collect::<PlanResult<Vec<_>>>()?;
        Ok(PostAggregation::Arithmetic {
            name: None,
            func: func.to_string(),
            fields,
        })
    }

    /// Power, log, absolute, cast and fallback-to-constant have no native
    /// combinator; render them as a javascript post-aggregation over
    /// aggregator outputs.
    fn javascript_post_aggregation(&mut self, expr: &Expr) -> PlanResult<PostAggregation> {
        let mut field_names = Vec::new();
        let body = self.render_js(expr, &mut field_names)?;
        let params: Vec<String> = (0..field_names.len()).map(|i| format!("p{}", i)).collect();
        Ok(PostAggregation::Javascript {
            name: None,
            field_names,
            function: format!("function({}) {{ return {}; }}", params.join(", "), body),
        })
    }

    fn render_js(&mut self, expr: &Expr, field_names: &mut Vec<String>) -> PlanResult<String> {
        let bind = |builder: &mut Self, agg: &Expr, field_names: &mut Vec<String>| -> PlanResult<String> {
            let hidden = builder.allocate_intermediate();
            builder.lower_named_aggregate(&hidden, agg)?;
            field_names.push(hidden);
            Ok(format!("p{}", field_names.len() - 1))
        };
        match expr {
            Expr::Literal(Value::Number(n)) => Ok(format!("{}", n)),
            Expr::Ref { name, nest: 0, .. } => {
                field_names.push(name.clone());
                Ok(format!("p{}", field_names.len() - 1))
            }
            agg if agg.is_aggregate() => bind(self, agg, field_names),
            Expr::Add(items) => self.render_js_joined(items, " + ", field_names),
            Expr::Multiply(items) => self.render_js_joined(items, " * ", field_names),
            Expr::Subtract(a, b) => Ok(format!(
                "({} - {})",
                self.render_js(a, field_names)?,
                self.render_js(b, field_names)?
            )),
            Expr::Divide(a, b) => Ok(format!(
                "({} / {})",
                self.render_js(a, field_names)?,
                self.render_js(b, field_names)?
            )),
            Expr::Power(a, b) => Ok(format!(
                "Math.pow({}, {})",
                self.render_js(a, field_names)?,
                self.render_js(b, field_names)?
            )),
            Expr::Log(a) => Ok(format!("Math.log({})", self.render_js(a, field_names)?)),
            Expr::Absolute(a) => Ok(format!("Math.abs({})", self.render_js(a, field_names)?)),
            Expr::Cast { operand, target } => {
                let inner = self.render_js(operand, field_names)?;
                Ok(match target {
                    CastKind::Number => format!("(+{})", inner),
                    CastKind::String => format!("('' + {})", inner),
                    CastKind::Time => format!("(+{})", inner),
                })
            }
            Expr::Fallback { operand, fallback } => {
                let a = self.render_js(operand, field_names)?;
                let b = self.render_js(fallback, field_names)?;
                Ok(format!("({a} != null ? {a} : {b})"))
            }
            other => Err(PlanError::unsupported(format!(
                "can not render {} in a post aggregation",
                other.op_name()
            ))),
        }
    }

    fn render_js_joined(
        &mut self,
        items: &[Expr],
        separator: &str,
        field_names: &mut Vec<String>,
    ) -> PlanResult<String> {
        let parts = items
            .iter()
            .map(|item| self.render_js(item, field_names))
            .collect::<PlanResult<Vec<_>>>()?;
        Ok(format!("({})", parts.join(separator)))
    }
}

#[derive(Debug, Clone, Copy)]
enum AggregateKind {
    Sum,
    Min,
    Max,
}

/// An aggregate lowers over the base dataset or a filtered view of it.
/// Anything else in the operand chain (a split, an apply) is a re-split
/// that must be rewritten into a nested group-by before it gets here;
/// lowering it as-is would reference columns that do not exist.
fn check_aggregate_operand(agg: &Expr) -> PlanResult<()> {
    let operand = match agg {
        Expr::Count { operand }
        | Expr::Sum { operand, .. }
        | Expr::Min { operand, .. }
        | Expr::Max { operand, .. }
        | Expr::CountDistinct { operand, .. }
        | Expr::Quantile { operand, .. }
        | Expr::CustomAggregate { operand, .. } => operand,
        _ => return Ok(()),
    };
    match operand.as_ref() {
        Expr::Ref { .. } => Ok(()),
        Expr::Filter { operand: base, .. } if matches!(base.as_ref(), Expr::Ref { .. }) => Ok(()),
        other => Err(PlanError::unsupported(format!(
            "can not aggregate over {}, a re-split must become a nested group-by",
            other.op_name()
        ))),
    }
}

/// Peel the filter off an aggregate's dataset operand and read its options.
fn aggregate_filter_and_options(agg: &Expr) -> (Option<&Expr>, bool) {
    let (operand, force_finalize) = match agg {
        Expr::Count { operand } => (operand, false),
        Expr::Sum { operand, .. } | Expr::Min { operand, .. } | Expr::Max { operand, .. } => {
            (operand, false)
        }
        Expr::CountDistinct {
            operand, options, ..
        }
        | Expr::Quantile {
            operand, options, ..
        } => (operand, options.force_finalize),
        Expr::CustomAggregate { operand, .. } => (operand, false),
        _ => return (None, false),
    };
    match operand.as_ref() {
        Expr::Filter { predicate, .. } => (Some(predicate.as_ref()), force_finalize),
        _ => (None, force_finalize),
    }
}

/// True for aggregates whose raw output is a sketch needing finalization.
/// Quantiles finalize through their own post-aggregation, so they are not
/// listed here.
fn aggregate_is_sketch_backed(agg: &Expr) -> bool {
    matches!(agg, Expr::CountDistinct { .. })
}

/// Render a sum/min/max over an arithmetic combination of columns as a
/// javascript aggregator.
fn javascript_aggregate(
    name: &str,
    expression: &Expr,
    kind: AggregateKind,
    time_attribute: &str,
) -> PlanResult<Aggregation> {
    let mut columns = expression.free_references();
    if columns.is_empty() {
        return Err(PlanError::unsupported(
            "aggregate expression reads no columns",
        ));
    }
    for column in &mut columns {
        if column == time_attribute {
            *column = TIME_COLUMN.to_string();
        }
    }
    let body = render_row_js(expression, time_attribute)?;
    let (fold, combine, reset) = match kind {
        AggregateKind::Sum => ("current + ", "a + b", "0"),
        AggregateKind::Min => ("Math.min(current, ", "Math.min(a, b)", "Infinity"),
        AggregateKind::Max => ("Math.max(current, ", "Math.max(a, b)", "-Infinity"),
    };
    let aggregate_body = match kind {
        AggregateKind::Sum => format!("{}({})", fold, body),
        _ => format!("{}({}))", fold, body),
    };
    Ok(Aggregation::Javascript {
        name: name.to_string(),
        field_names: columns.clone(),
        fn_aggregate: format!(
            "function(current, {}) {{ return {}; }}",
            columns
                .iter()
                .map(|c| js_identifier(c))
                .collect::<Vec<_>>()
                .join(", "),
            aggregate_body
        ),
        fn_combine: format!("function(a, b) {{ return {}; }}", combine),
        fn_reset: format!("function() {{ return {}; }}", reset),
    })
}

/// Render a per-row arithmetic expression in javascript; references become
/// sanitized parameter names.
fn render_row_js(expr: &Expr, time_attribute: &str) -> PlanResult<String> {
    match expr {
        Expr::Literal(Value::Number(n)) => Ok(format!("{}", n)),
        Expr::Ref { name, nest: 0, .. } => {
            let column = if name == time_attribute {
                TIME_COLUMN
            } else {
                name
            };
            Ok(js_identifier(column))
        }
        Expr::Add(items) => render_row_js_joined(items, " + ", time_attribute),
        Expr::Multiply(items) => render_row_js_joined(items, " * ", time_attribute),
        Expr::Subtract(a, b) => Ok(format!(
            "({} - {})",
            render_row_js(a, time_attribute)?,
            render_row_js(b, time_attribute)?
        )),
        Expr::Divide(a, b) => Ok(format!(
            "({} / {})",
            render_row_js(a, time_attribute)?,
            render_row_js(b, time_attribute)?
        )),
        Expr::Absolute(a) => Ok(format!("Math.abs({})", render_row_js(a, time_attribute)?)),
        Expr::Power(a, b) => Ok(format!(
            "Math.pow({}, {})",
            render_row_js(a, time_attribute)?,
            render_row_js(b, time_attribute)?
        )),
        other => Err(PlanError::unsupported(format!(
            "can not render {} in a javascript aggregator",
            other.op_name()
        ))),
    }
}

fn render_row_js_joined(
    items: &[Expr],
    separator: &str,
    time_attribute: &str,
) -> PlanResult<String> {
    let parts = items
        .iter()
        .map(|item| render_row_js(item, time_attribute))
        .collect::<PlanResult<Vec<_>>>()?;
    Ok(format!("({})", parts.join(separator)))
}

fn js_identifier(column: &str) -> String {
    column
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
