//! Expression lowering
//!
//! Maps a single scalar expression to the backend's native expression
//! dialect (the formula language of virtual columns and expression
//! filters). Pure string emission; anything without a dialect counterpart
//! fails.

use super::error::{PlanError, PlanResult};
use crate::expression::{CastKind, CompareOp, Expr, TextCase, Value};

pub const TIME_COLUMN: &str = "__time";

/// Lower a scalar expression to a formula string. `time_attribute` is the
/// algebra-level name of the time column.
pub fn lower_expression(expr: &Expr, time_attribute: &str) -> PlanResult<String> {
    match expr {
        Expr::Ref {
            name,
            nest: 0,
            ..
        } => {
            if name == time_attribute {
                Ok(TIME_COLUMN.to_string())
            } else {
                Ok(format!("\"{}\"", name.replace('"', "\\\"")))
            }
        }
        Expr::Ref { name, nest, .. } => Err(PlanError::unsupported(format!(
            "can not lower reference '{}' with nest {}",
            name, nest
        ))),

        Expr::Literal(value) => lower_literal(value),

        Expr::And(items) => lower_joined(items, " && ", time_attribute),
        Expr::Or(items) => lower_joined(items, " || ", time_attribute),
        Expr::Not(inner) => Ok(format!("!({})", lower_expression(inner, time_attribute)?)),

        Expr::Is { operand, value } => Ok(format!(
            "({} == {})",
            lower_expression(operand, time_attribute)?,
            lower_expression(value, time_attribute)?
        )),
        Expr::In { operand, values } => {
            let needle = lower_expression(operand, time_attribute)?;
            match values.as_ref() {
                Expr::Literal(Value::StringSet(items)) => {
                    let parts: Vec<String> = items
                        .iter()
                        .map(|item| format!("{} == {}", needle, quote_string(item)))
                        .collect();
                    Ok(format!("({})", parts.join(" || ")))
                }
                other => Err(PlanError::unsupported(format!(
                    "can not lower in over {}",
                    other.op_name()
                ))),
            }
        }
        Expr::Overlap { operand, range } => {
            let subject = lower_expression(operand, time_attribute)?;
            match range.as_ref() {
                Expr::Literal(Value::NumberRange { start, end }) => Ok(format!(
                    "({subject} >= {start} && {subject} < {end})"
                )),
                Expr::Literal(Value::TimeRange { start, end }) => Ok(format!(
                    "({subject} >= {} && {subject} < {})",
                    start.timestamp_millis(),
                    end.timestamp_millis()
                )),
                other => Err(PlanError::unsupported(format!(
                    "can not lower overlap over {}",
                    other.op_name()
                ))),
            }
        }
        Expr::Match { operand, regex } => Ok(format!(
            "regexp_like({}, {})",
            lower_expression(operand, time_attribute)?,
            quote_string(regex)
        )),
        Expr::Contains {
            operand,
            needle,
            ignore_case,
        } => {
            let mut subject = lower_expression(operand, time_attribute)?;
            let mut target = lower_expression(needle, time_attribute)?;
            if *ignore_case {
                subject = format!("lower({})", subject);
                target = format!("lower({})", target);
            }
            Ok(format!("(strpos({}, {}) >= 0)", subject, target))
        }
        Expr::Compare { op, left, right } => {
            let symbol = match op {
                CompareOp::Greater => ">",
                CompareOp::GreaterOrEqual => ">=",
                CompareOp::Less => "<",
                CompareOp::LessOrEqual => "<=",
            };
            Ok(format!(
                "({} {} {})",
                lower_expression(left, time_attribute)?,
                symbol,
                lower_expression(right, time_attribute)?
            ))
        }
        Expr::Then { condition, value } => Ok(format!(
            "if({}, {}, null)",
            lower_expression(condition, time_attribute)?,
            lower_expression(value, time_attribute)?
        )),

        Expr::Add(items) => lower_joined(items, " + ", time_attribute),
        Expr::Subtract(a, b) => Ok(format!(
            "({} - {})",
            lower_expression(a, time_attribute)?,
            lower_expression(b, time_attribute)?
        )),
        Expr::Multiply(items) => lower_joined(items, " * ", time_attribute),
        Expr::Divide(a, b) => Ok(format!(
            "({} / {})",
            lower_expression(a, time_attribute)?,
            lower_expression(b, time_attribute)?
        )),
        Expr::Power(a, b) => Ok(format!(
            "pow({}, {})",
            lower_expression(a, time_attribute)?,
            lower_expression(b, time_attribute)?
        )),
        Expr::Log(a) => Ok(format!("log({})", lower_expression(a, time_attribute)?)),
        Expr::Absolute(a) => Ok(format!("abs({})", lower_expression(a, time_attribute)?)),
        Expr::Cast { operand, target } => {
            let inner = lower_expression(operand, time_attribute)?;
            let native = match target {
                CastKind::Number => "DOUBLE",
                CastKind::String => "STRING",
                CastKind::Time => "LONG",
            };
            Ok(format!("cast({}, '{}')", inner, native))
        }
        Expr::Fallback { operand, fallback } => Ok(format!(
            "nvl({}, {})",
            lower_expression(operand, time_attribute)?,
            lower_expression(fallback, time_attribute)?
        )),

        Expr::Substr {
            operand,
            position,
            len,
        } => Ok(format!(
            "substring({}, {}, {})",
            lower_expression(operand, time_attribute)?,
            position,
            len
        )),
        Expr::ExtractMatch { operand, regex } => Ok(format!(
            "regexp_extract({}, {}, 1)",
            lower_expression(operand, time_attribute)?,
            quote_string(regex)
        )),
        Expr::Lookup { operand, lookup } => Ok(format!(
            "lookup({}, {})",
            lower_expression(operand, time_attribute)?,
            quote_string(lookup)
        )),
        Expr::Concat(items) => {
            let parts: PlanResult<Vec<String>> = items
                .iter()
                .map(|item| lower_expression(item, time_attribute))
                .collect();
            Ok(format!("concat({})", parts?.join(", ")))
        }
        Expr::Transform { operand, case } => {
            let func = match case {
                TextCase::Upper => "upper",
                TextCase::Lower => "lower",
            };
            Ok(format!(
                "{}({})",
                func,
                lower_expression(operand, time_attribute)?
            ))
        }
        Expr::Length(a) => Ok(format!("strlen({})", lower_expression(a, time_attribute)?)),

        Expr::NumberBucket {
            operand,
            size,
            offset,
        } => {
            let inner = lower_expression(operand, time_attribute)?;
            Ok(format!(
                "(floor(({inner} - {offset}) / {size}) * {size} + {offset})"
            ))
        }

        Expr::TimeBucket {
            operand,
            period,
            time_zone,
        }
        | Expr::TimeFloor {
            operand,
            period,
            time_zone,
        } => Ok(format!(
            "timestamp_floor({}, {}, null, {})",
            lower_expression(operand, time_attribute)?,
            quote_string(period),
            quote_string(time_zone)
        )),
        Expr::TimePart {
            operand,
            part,
            time_zone,
        } => Ok(format!(
            "timestamp_extract({}, '{}', {})",
            lower_expression(operand, time_attribute)?,
            part.extract_keyword(),
            quote_string(time_zone)
        )),

        Expr::Cardinality(inner) => Ok(format!(
            "array_length({})",
            lower_expression(inner, time_attribute)?
        )),

        other => Err(PlanError::unsupported(format!(
            "can not lower {} to a formula",
            other.op_name()
        ))),
    }
}

fn lower_joined(items: &[Expr], separator: &str, time_attribute: &str) -> PlanResult<String> {
    let parts: PlanResult<Vec<String>> = items
        .iter()
        .map(|item| lower_expression(item, time_attribute))
        .collect();
    Ok(format!("({})", parts?.join(separator)))
}

fn lower_literal(value: &Value) -> PlanResult<String> {
    match value {
        Value::Null => Ok("null".to_string()),
        Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Ok(format!("{}", n)),
        Value::String(s) => Ok(quote_string(s)),
        Value::Time(t) => Ok(format!("{}", t.timestamp_millis())),
        other => Err(PlanError::unsupported(format!(
            "can not lower {} literal to a formula",
            other.value_type()
        ))),
    }
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}
