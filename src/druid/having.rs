//! Having lowering
//!
//! Lowers the residual having filter (whatever split lowering could not
//! push into the dimension) into native having clauses over apply outputs.

use super::error::{PlanError, PlanResult};
use super::query::HavingSpec;
use crate::expression::{CompareOp, Expr, Value};

/// Build a having spec from a boolean expression over output columns.
pub fn build_having(expr: &Expr) -> PlanResult<HavingSpec> {
    match expr {
        Expr::And(items) => Ok(HavingSpec::And {
            having_specs: items
                .iter()
                .map(build_having)
                .collect::<PlanResult<Vec<_>>>()?,
        }),
        Expr::Or(items) => Ok(HavingSpec::Or {
            having_specs: items
                .iter()
                .map(build_having)
                .collect::<PlanResult<Vec<_>>>()?,
        }),
        Expr::Not(inner) => Ok(HavingSpec::Not {
            having_spec: Box::new(build_having(inner)?),
        }),

        Expr::Compare { op, left, right } => {
            let (aggregation, value, op) = match (left.as_ref(), right.as_ref()) {
                (Expr::Ref { name, nest: 0, .. }, Expr::Literal(Value::Number(n))) => {
                    (name.clone(), *n, *op)
                }
                (Expr::Literal(Value::Number(n)), Expr::Ref { name, nest: 0, .. }) => (
                    name.clone(),
                    *n,
                    match op {
                        CompareOp::Greater => CompareOp::Less,
                        CompareOp::GreaterOrEqual => CompareOp::LessOrEqual,
                        CompareOp::Less => CompareOp::Greater,
                        CompareOp::LessOrEqual => CompareOp::GreaterOrEqual,
                    },
                ),
                _ => {
                    return Err(PlanError::unsupported(
                        "having comparison must be between an output column and a number",
                    ))
                }
            };
            match op {
                CompareOp::Greater => Ok(HavingSpec::GreaterThan { aggregation, value }),
                CompareOp::Less => Ok(HavingSpec::LessThan { aggregation, value }),
                // the backend only has strict bounds; widen by negating the
                // opposite strict bound
                CompareOp::GreaterOrEqual => Ok(HavingSpec::Not {
                    having_spec: Box::new(HavingSpec::LessThan { aggregation, value }),
                }),
                CompareOp::LessOrEqual => Ok(HavingSpec::Not {
                    having_spec: Box::new(HavingSpec::GreaterThan { aggregation, value }),
                }),
            }
        }

        Expr::Is { operand, value } => match (operand.as_ref(), value.as_ref()) {
            (Expr::Ref { name, nest: 0, .. }, Expr::Literal(Value::Number(n))) => {
                Ok(HavingSpec::EqualTo {
                    aggregation: name.clone(),
                    value: *n,
                })
            }
            (Expr::Ref { name, nest: 0, .. }, Expr::Literal(Value::String(s))) => {
                Ok(HavingSpec::DimSelector {
                    dimension: name.clone(),
                    value: serde_json::json!(s),
                })
            }
            _ => Err(PlanError::unsupported(
                "having equality must be between an output column and a literal",
            )),
        },

        Expr::In { operand, values } => match (operand.as_ref(), values.as_ref()) {
            (Expr::Ref { name, nest: 0, .. }, Expr::Literal(Value::StringSet(items))) => {
                Ok(HavingSpec::Or {
                    having_specs: items
                        .iter()
                        .map(|item| HavingSpec::DimSelector {
                            dimension: name.clone(),
                            value: serde_json::json!(item),
                        })
                        .collect(),
                })
            }
            _ => Err(PlanError::unsupported(
                "having membership must be over a literal set",
            )),
        },

        other => Err(PlanError::unsupported(format!(
            "can not express {} as a having clause",
            other.op_name()
        ))),
    }
}
