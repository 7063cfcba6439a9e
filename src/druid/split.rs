//! Split lowering
//!
//! Turns split-key expressions into dimensions (direct, extraction-backed,
//! or virtual-column-backed), derives granularities for time splits, and
//! pushes dimension-label constraints of the having filter into the
//! dimension spec itself.

use super::error::{PlanError, PlanResult};
use super::expression::{lower_expression, TIME_COLUMN};
use super::extraction::{build_extraction_fn, ExtractionContext};
use super::query::{DimensionSpec, Granularity, OutputType, VirtualColumn};
use crate::expression::{Expr, ExprType, Value};
use crate::external::External;
use crate::rows::Inflater;

/// Output names colliding with backend-reserved `__` prefixes are emitted
/// under this prefix; the post-transform strips it.
pub const DUMMY_PREFIX: &str = "***";

/// Prefix of every virtual column the planner allocates.
pub const VIRTUAL_PREFIX: &str = "v:";

/// Rewrite an output name that would collide with a reserved prefix.
pub fn adjust_output_name(name: &str) -> String {
    if name.starts_with("__") {
        format!("{}{}", DUMMY_PREFIX, name)
    } else {
        name.to_string()
    }
}

/// A split key lowered to backend terms.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredDimension {
    pub virtual_columns: Vec<VirtualColumn>,
    pub dimension: DimensionSpec,
    pub inflater: Option<Inflater>,
    /// The name as emitted in the query (possibly prefix-rewritten).
    pub emitted_name: String,
    /// The algebra-level output name.
    pub output_name: String,
}

/// Lower one split-key expression into a dimension.
pub fn expression_to_dimension_inflater(
    expr: &Expr,
    output_name: &str,
    external: &External,
) -> PlanResult<LoweredDimension> {
    let expr = external.inline_derived(expr);
    let emitted = adjust_output_name(output_name);

    for reference in expr.free_references() {
        if let Some(attr) = external.raw_attributes.get(&reference) {
            if attr.unsplitable {
                return Err(PlanError::invalid(format!(
                    "split expression references an un-splitable metric '{}'",
                    reference
                )));
            }
        }
    }

    let inflater = dimension_inflater(&expr)?;
    let output_type = dimension_output_type(&expr);
    let extraction_ctx = ExtractionContext {
        time_attribute: &external.time_attribute,
        custom_transforms: &external.custom_transforms,
    };

    let references = expr.free_references();

    // a reference-free expression can only be an extraction over time
    if references.is_empty() {
        let extraction_fn = build_extraction_fn(&expr, &extraction_ctx)?;
        return Ok(LoweredDimension {
            virtual_columns: Vec::new(),
            dimension: DimensionSpec::Extraction {
                dimension: TIME_COLUMN.to_string(),
                output_name: emitted.clone(),
                output_type,
                extraction_fn,
            },
            inflater,
            emitted_name: emitted,
            output_name: output_name.to_string(),
        });
    }

    if references.len() == 1 {
        let column = native_column(&references[0], external);

        // a bare reference, or a set column split by its cardinality, maps
        // straight onto the column
        let direct = match &expr {
            Expr::Ref { .. } => true,
            Expr::Cardinality(inner) => matches!(inner.as_ref(), Expr::Ref { .. }),
            _ => false,
        };
        if direct {
            return Ok(LoweredDimension {
                virtual_columns: Vec::new(),
                dimension: DimensionSpec::Default {
                    dimension: column,
                    output_name: emitted.clone(),
                    output_type,
                },
                inflater,
                emitted_name: emitted,
                output_name: output_name.to_string(),
            });
        }

        let extractable = !is_complex_fallback(&expr) && !contains_then(&expr);
        if extractable {
            if let Ok(extraction_fn) = build_extraction_fn(&expr, &extraction_ctx) {
                return Ok(LoweredDimension {
                    virtual_columns: Vec::new(),
                    dimension: DimensionSpec::Extraction {
                        dimension: column,
                        output_name: emitted.clone(),
                        output_type,
                        extraction_fn,
                    },
                    inflater,
                    emitted_name: emitted,
                    output_name: output_name.to_string(),
                });
            }
        }
    }

    // everything else becomes a virtual column
    let formula = lower_expression(&expr, &external.time_attribute)?;
    let virtual_name = format!("{}{}", VIRTUAL_PREFIX, output_name);
    let virtual_column = VirtualColumn::Expression {
        name: virtual_name.clone(),
        expression: formula,
        output_type: output_type.unwrap_or(OutputType::String),
    };
    Ok(LoweredDimension {
        virtual_columns: vec![virtual_column],
        dimension: DimensionSpec::Default {
            dimension: virtual_name,
            output_name: emitted.clone(),
            output_type,
        },
        inflater,
        emitted_name: emitted,
        output_name: output_name.to_string(),
    })
}

/// Lower a split key and push the directly-constraining part of the having
/// filter into the dimension. Returns the lowered dimension and the
/// leftover having filter.
pub fn expression_to_dimension_inflater_having(
    expr: &Expr,
    output_name: &str,
    having: &Expr,
    external: &External,
) -> PlanResult<(LoweredDimension, Expr)> {
    let mut lowered = expression_to_dimension_inflater(expr, output_name, external)?;

    if !external.inline_derived(expr).result_type().is_string_set() || having.is_true_literal() {
        return Ok((lowered, having.clone()));
    }

    let mut residue = Vec::new();
    for conjunct in flatten_and(having) {
        match direct_label_constraint(conjunct, output_name) {
            Some(LabelConstraint::Values(values)) => {
                lowered.dimension = DimensionSpec::ListFiltered {
                    delegate: Box::new(lowered.dimension),
                    values,
                };
            }
            Some(LabelConstraint::Pattern(pattern)) => {
                lowered.dimension = DimensionSpec::RegexFiltered {
                    delegate: Box::new(lowered.dimension),
                    pattern,
                };
            }
            None => residue.push(conjunct.clone()),
        }
    }

    let leftover = match residue.len() {
        0 => Expr::truth(),
        1 => residue.pop().expect("length checked"),
        _ => Expr::And(residue),
    };
    Ok((lowered, leftover))
}

enum LabelConstraint {
    Values(Vec<String>),
    Pattern(String),
}

/// A having conjunct that constrains the dimension label directly.
fn direct_label_constraint(conjunct: &Expr, output_name: &str) -> Option<LabelConstraint> {
    let is_label_ref = |e: &Expr| matches!(e, Expr::Ref { name, nest: 0, .. } if name == output_name);
    match conjunct {
        Expr::Match { operand, regex } if is_label_ref(operand) => {
            Some(LabelConstraint::Pattern(regex.clone()))
        }
        Expr::Is { operand, value } if is_label_ref(operand) => match value.as_ref() {
            Expr::Literal(Value::String(s)) => Some(LabelConstraint::Values(vec![s.clone()])),
            _ => None,
        },
        Expr::In { operand, values } if is_label_ref(operand) => match values.as_ref() {
            Expr::Literal(Value::StringSet(items)) => {
                Some(LabelConstraint::Values(items.clone()))
            }
            _ => None,
        },
        _ => None,
    }
}

fn flatten_and(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::And(items) => items.iter().flat_map(flatten_and).collect(),
        other => vec![other],
    }
}

/// Derive a query granularity from a single-key time split: the bare time
/// reference, or a time bucket over it. Anything else fails this path.
pub fn split_to_granularity(
    expr: &Expr,
    external: &External,
) -> Option<Granularity> {
    let expr = external.inline_derived(expr);
    match &expr {
        e if external.is_time_ref(e) => Some(Granularity::None),
        Expr::TimeBucket {
            operand,
            period,
            time_zone,
        }
        | Expr::TimeFloor {
            operand,
            period,
            time_zone,
        } if external.is_time_ref(operand) => Some(Granularity::Period {
            period: period.clone(),
            time_zone: time_zone.clone(),
        }),
        _ => None,
    }
}

/// Upper bound on the bucket count a split expression can produce, when one
/// exists; makes a sort-bearing split topN-eligible without a limit.
pub fn max_bucket_count(expr: &Expr, external: &External) -> Option<u64> {
    match &external.inline_derived(expr) {
        Expr::TimePart { part, .. } => part.max_buckets(),
        e if e.result_type() == ExprType::Boolean => Some(3),
        _ => None,
    }
}

fn dimension_inflater(expr: &Expr) -> PlanResult<Option<Inflater>> {
    if matches!(expr, Expr::Cardinality(_)) {
        return Ok(Some(Inflater::SetCardinality));
    }
    let result_type = expr.result_type();
    if let Some(inflater) = Inflater::simple(&result_type) {
        return Ok(Some(inflater));
    }
    match result_type {
        ExprType::String | ExprType::Null => Ok(None),
        other => Err(PlanError::unsupported(format!(
            "can not split on an expression of type {}",
            other
        ))),
    }
}

fn dimension_output_type(expr: &Expr) -> Option<OutputType> {
    match expr.result_type() {
        ExprType::Time => Some(OutputType::Long),
        ExprType::Number => Some(OutputType::Double),
        _ => None,
    }
}

fn native_column(name: &str, external: &External) -> String {
    if name == external.time_attribute {
        TIME_COLUMN.to_string()
    } else {
        name.to_string()
    }
}

/// A fallback whose operand is a chain over a chain over a reference; these
/// do not survive extraction-fn lowering faithfully.
fn is_complex_fallback(expr: &Expr) -> bool {
    expr.any(&|e| match e {
        Expr::Fallback { operand, .. } => chains_over_chain(operand),
        _ => false,
    })
}

fn chains_over_chain(expr: &Expr) -> bool {
    match expr {
        Expr::Ref { .. } | Expr::Literal(_) => false,
        other => other
            .children()
            .first()
            .map(|child| !matches!(child, Expr::Ref { .. } | Expr::Literal(_)))
            .unwrap_or(false),
    }
}

fn contains_then(expr: &Expr) -> bool {
    expr.any(&|e| matches!(e, Expr::Then { .. }))
}
