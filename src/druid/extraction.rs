//! Extraction-fn building
//!
//! Maps a scalar expression over one column to a dimension-extraction
//! function chain. Anything outside the extraction vocabulary (lookup,
//! substring, regex, bucket, time-format, case transforms, cascades) is
//! refused; callers fall back to a virtual column.

use super::error::{PlanError, PlanResult};
use super::query::ExtractionFn;
use crate::expression::{Expr, TextCase, Value};
use std::collections::BTreeMap;

pub struct ExtractionContext<'a> {
    pub time_attribute: &'a str,
    pub custom_transforms: &'a BTreeMap<String, serde_json::Value>,
}

/// Build the extraction fn for an expression over a single column.
pub fn build_extraction_fn(expr: &Expr, ctx: &ExtractionContext<'_>) -> PlanResult<ExtractionFn> {
    let mut chain = Vec::new();
    push_chain(expr, ctx, &mut chain)?;
    match chain.len() {
        0 => Err(PlanError::unsupported(
            "expression is a bare reference, nothing to extract",
        )),
        1 => Ok(chain.pop().expect("length checked")),
        _ => Ok(ExtractionFn::Cascade {
            extraction_fns: chain,
        }),
    }
}

/// Append the extraction steps of `expr`, innermost first.
fn push_chain(
    expr: &Expr,
    ctx: &ExtractionContext<'_>,
    out: &mut Vec<ExtractionFn>,
) -> PlanResult<()> {
    match expr {
        Expr::Ref { nest: 0, .. } => Ok(()),
        Expr::Ref { name, nest, .. } => Err(PlanError::unsupported(format!(
            "can not extract from reference '{}' with nest {}",
            name, nest
        ))),

        Expr::Substr {
            operand,
            position,
            len,
        } => {
            push_chain(operand, ctx, out)?;
            out.push(ExtractionFn::Substring {
                index: *position,
                length: Some(*len),
            });
            Ok(())
        }

        Expr::ExtractMatch { operand, regex } => {
            push_chain(operand, ctx, out)?;
            out.push(ExtractionFn::Regex {
                expr: regex.clone(),
                replace_missing_value: true,
                replace_missing_value_with: None,
            });
            Ok(())
        }

        Expr::Lookup { operand, lookup } => {
            push_chain(operand, ctx, out)?;
            out.push(ExtractionFn::RegisteredLookup {
                lookup: lookup.clone(),
                retain_missing_value: false,
                replace_missing_value_with: None,
            });
            Ok(())
        }

        Expr::Fallback { operand, fallback } => push_fallback(operand, fallback, ctx, out),

        Expr::Transform { operand, case } => {
            push_chain(operand, ctx, out)?;
            out.push(match case {
                TextCase::Upper => ExtractionFn::Upper,
                TextCase::Lower => ExtractionFn::Lower,
            });
            Ok(())
        }

        Expr::TimePart {
            operand,
            part,
            time_zone,
        } => {
            push_chain(operand, ctx, out)?;
            out.push(ExtractionFn::TimeFormat {
                format: part.format_pattern().to_string(),
                time_zone: time_zone.clone(),
                locale: "en-US".to_string(),
            });
            Ok(())
        }

        Expr::NumberBucket {
            operand,
            size,
            offset,
        } => {
            push_chain(operand, ctx, out)?;
            out.push(ExtractionFn::Bucket {
                size: *size,
                offset: *offset,
            });
            Ok(())
        }

        Expr::Concat(items) => push_concat(items, ctx, out),

        Expr::CustomTransform { operand, name } => {
            push_chain(operand, ctx, out)?;
            let spec = ctx.custom_transforms.get(name).ok_or_else(|| {
                PlanError::invalid(format!("unknown custom transform '{}'", name))
            })?;
            out.push(ExtractionFn::Registered(spec.clone()));
            Ok(())
        }

        other => Err(PlanError::unsupported(format!(
            "can not express {} as an extraction fn",
            other.op_name()
        ))),
    }
}

/// Fallback folds into the preceding lookup/regex step: retain the input
/// when falling back to it, otherwise substitute the literal.
fn push_fallback(
    operand: &Expr,
    fallback: &Expr,
    ctx: &ExtractionContext<'_>,
    out: &mut Vec<ExtractionFn>,
) -> PlanResult<()> {
    push_chain(operand, ctx, out)?;
    let last = out
        .last_mut()
        .ok_or_else(|| PlanError::unsupported("fallback over a bare reference"))?;
    match (last, fallback) {
        (
            ExtractionFn::RegisteredLookup {
                retain_missing_value,
                ..
            },
            Expr::Ref { nest: 0, .. },
        ) => {
            *retain_missing_value = true;
            Ok(())
        }
        (
            ExtractionFn::RegisteredLookup {
                replace_missing_value_with,
                ..
            },
            Expr::Literal(Value::String(s)),
        ) => {
            *replace_missing_value_with = Some(s.clone());
            Ok(())
        }
        (
            ExtractionFn::Regex {
                replace_missing_value,
                replace_missing_value_with,
                ..
            },
            Expr::Literal(Value::String(s)),
        ) => {
            *replace_missing_value = false;
            *replace_missing_value_with = Some(s.clone());
            Ok(())
        }
        _ => Err(PlanError::unsupported(
            "fallback is only supported over lookup or regex extractions",
        )),
    }
}

/// Concat with exactly one non-literal part becomes a string format.
fn push_concat(
    items: &[Expr],
    ctx: &ExtractionContext<'_>,
    out: &mut Vec<ExtractionFn>,
) -> PlanResult<()> {
    let mut format = String::new();
    let mut subject = None;
    for item in items {
        match item {
            Expr::Literal(Value::String(s)) => format.push_str(&s.replace('%', "%%")),
            other => {
                if subject.replace(other).is_some() {
                    return Err(PlanError::unsupported(
                        "concat with more than one column part",
                    ));
                }
                format.push_str("%s");
            }
        }
    }
    let subject =
        subject.ok_or_else(|| PlanError::unsupported("concat of literals only"))?;
    push_chain(subject, ctx, out)?;
    out.push(ExtractionFn::StringFormat { format });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{ExprType, TimePartUnit};
    use serde_json::json;

    fn ctx(custom: &BTreeMap<String, serde_json::Value>) -> ExtractionContext<'_> {
        ExtractionContext {
            time_attribute: "time",
            custom_transforms: custom,
        }
    }

    fn page() -> Expr {
        Expr::reference("page", ExprType::String)
    }

    #[test]
    fn test_substring() {
        let none = BTreeMap::new();
        let e = Expr::Substr {
            operand: Box::new(page()),
            position: 0,
            len: 3,
        };
        assert_eq!(
            build_extraction_fn(&e, &ctx(&none)).unwrap(),
            ExtractionFn::Substring {
                index: 0,
                length: Some(3)
            }
        );
    }

    #[test]
    fn test_cascade_order_is_innermost_first() {
        let none = BTreeMap::new();
        let e = Expr::Substr {
            operand: Box::new(Expr::Lookup {
                operand: Box::new(page()),
                lookup: "page_groups".to_string(),
            }),
            position: 0,
            len: 2,
        };
        match build_extraction_fn(&e, &ctx(&none)).unwrap() {
            ExtractionFn::Cascade { extraction_fns } => {
                assert!(matches!(
                    extraction_fns[0],
                    ExtractionFn::RegisteredLookup { .. }
                ));
                assert!(matches!(extraction_fns[1], ExtractionFn::Substring { .. }));
            }
            other => panic!("expected cascade, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_fallback_to_self_retains() {
        let none = BTreeMap::new();
        let e = Expr::Fallback {
            operand: Box::new(Expr::Lookup {
                operand: Box::new(page()),
                lookup: "page_groups".to_string(),
            }),
            fallback: Box::new(page()),
        };
        assert_eq!(
            build_extraction_fn(&e, &ctx(&none)).unwrap(),
            ExtractionFn::RegisteredLookup {
                lookup: "page_groups".to_string(),
                retain_missing_value: true,
                replace_missing_value_with: None,
            }
        );
    }

    #[test]
    fn test_time_part_format() {
        let none = BTreeMap::new();
        let e = Expr::TimePart {
            operand: Box::new(Expr::reference("time", ExprType::Time)),
            part: TimePartUnit::HourOfDay,
            time_zone: "Etc/UTC".to_string(),
        };
        assert_eq!(
            build_extraction_fn(&e, &ctx(&none)).unwrap(),
            ExtractionFn::TimeFormat {
                format: "H".to_string(),
                time_zone: "Etc/UTC".to_string(),
                locale: "en-US".to_string(),
            }
        );
    }

    #[test]
    fn test_concat_string_format() {
        let none = BTreeMap::new();
        let e = Expr::Concat(vec![
            Expr::Literal(Value::String("[".to_string())),
            page(),
            Expr::Literal(Value::String("]".to_string())),
        ]);
        assert_eq!(
            build_extraction_fn(&e, &ctx(&none)).unwrap(),
            ExtractionFn::StringFormat {
                format: "[%s]".to_string()
            }
        );
    }

    #[test]
    fn test_custom_transform() {
        let mut custom = BTreeMap::new();
        custom.insert(
            "tidy".to_string(),
            json!({"type": "javascript", "function": "function(x) { return x.trim(); }"}),
        );
        let e = Expr::CustomTransform {
            operand: Box::new(page()),
            name: "tidy".to_string(),
        };
        assert!(matches!(
            build_extraction_fn(&e, &ctx(&custom)).unwrap(),
            ExtractionFn::Registered(_)
        ));
    }

    #[test]
    fn test_arithmetic_is_refused() {
        let none = BTreeMap::new();
        let e = Expr::Add(vec![
            Expr::reference("a", ExprType::Number),
            Expr::reference("b", ExprType::Number),
        ]);
        assert!(build_extraction_fn(&e, &ctx(&none)).is_err());
    }
}
