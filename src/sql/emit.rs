//! SQL emitter
//!
//! Transforms an External into a SQL string: the relational sibling of the
//! native planner. Clause assembly only; quoting follows the ANSI double
//! quote / single quote convention.

use super::error::SqlError;
use crate::expression::{format_iso, CastKind, CompareOp, Expr, TextCase, Value};
use crate::external::{Direction, External, Mode};

/// Capabilities of the target dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlDialect {
    /// Positional `GROUP BY 1, 2` instead of repeating expressions.
    pub shortcut_group_by: bool,
}

/// Output column of a value-mode statement.
const VALUE_ALIAS: &str = "__VALUE__";

/// Emit a SQL statement for the External.
pub fn emit_external_sql(external: &External, dialect: &SqlDialect) -> Result<String, SqlError> {
    let mut lines: Vec<String> = Vec::new();

    // a source that is itself a statement rides in as a WITH prefix
    let from = if external.source.trim_start().to_uppercase().starts_with("SELECT") {
        lines.push(format!("WITH __with__ AS ({})", external.source.trim()));
        "\"__with__\"".to_string()
    } else {
        quote_name(&external.source)
    };

    let select_items: Vec<String>;
    let mut group_by: Option<String> = None;
    let mut having: Option<String> = None;
    let mut order_by: Option<String> = None;

    match external.mode {
        Mode::Raw => {
            let selected = match &external.select {
                Some(names) => names.clone(),
                None => external.raw_attributes.names(),
            };
            select_items = selected.iter().map(|name| quote_name(name)).collect();
            if let Some(sort) = &external.sort {
                order_by = Some(format!(
                    "{} {}",
                    quote_name(&sort.ref_name),
                    direction_sql(sort.direction)
                ));
            }
        }
        Mode::Value => {
            let expr = external
                .value_expression
                .as_ref()
                .ok_or_else(|| SqlError::InvalidQuery("value mode without expression".into()))?;
            select_items = vec![format!(
                "{} AS \"{}\"",
                emit_expr(&external.inline_derived(expr), external)?,
                VALUE_ALIAS
            )];
            if dialect.shortcut_group_by {
                group_by = Some("()".to_string());
            }
        }
        Mode::Total => {
            select_items = external
                .applies
                .iter()
                .map(|apply| {
                    Ok(format!(
                        "{} AS {}",
                        emit_expr(&external.inline_derived(&apply.expression), external)?,
                        quote_name(&apply.name)
                    ))
                })
                .collect::<Result<Vec<_>, SqlError>>()?;
            if dialect.shortcut_group_by {
                group_by = Some("()".to_string());
            }
        }
        Mode::Split => {
            let split = external
                .split
                .as_ref()
                .ok_or_else(|| SqlError::InvalidQuery("split mode without split".into()))?;
            let mut items = Vec::new();
            let mut key_exprs = Vec::new();
            for key in &split.keys {
                let sql = emit_expr(&external.inline_derived(&key.expression), external)?;
                items.push(format!("{} AS {}", sql, quote_name(&key.name)));
                key_exprs.push(sql);
            }
            for apply in &external.applies {
                items.push(format!(
                    "{} AS {}",
                    emit_expr(&external.inline_derived(&apply.expression), external)?,
                    quote_name(&apply.name)
                ));
            }
            select_items = items;

            group_by = Some(if dialect.shortcut_group_by {
                (1..=split.keys.len())
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            } else {
                key_exprs.join(", ")
            });

            if !external.having_filter.is_true_literal() {
                having = Some(emit_expr(&external.having_filter, external)?);
            }
            if let Some(sort) = &external.sort {
                order_by = Some(format!(
                    "{} {}",
                    quote_name(&sort.ref_name),
                    direction_sql(sort.direction)
                ));
            }
        }
    }

    lines.push(format!("SELECT {}", select_items.join(", ")));
    lines.push(format!("FROM {}", from));
    if !external.filter.is_true_literal() {
        lines.push(format!(
            "WHERE {}",
            emit_expr(&external.inline_derived(&external.filter), external)?
        ));
    }
    if let Some(group_by) = group_by {
        lines.push(format!("GROUP BY {}", group_by));
    }
    if let Some(having) = having {
        lines.push(format!("HAVING {}", having));
    }
    if let Some(order_by) = order_by {
        lines.push(format!("ORDER BY {}", order_by));
    }
    if let Some(limit) = external.limit {
        lines.push(format!("LIMIT {}", limit));
    }

    Ok(lines.join("\n"))
}

fn direction_sql(direction: Direction) -> &'static str {
    match direction {
        Direction::Ascending => "ASC",
        Direction::Descending => "DESC",
    }
}

fn quote_name(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

fn emit_expr(expr: &Expr, external: &External) -> Result<String, SqlError> {
    match expr {
        Expr::Ref { name, nest: 0, .. } => {
            if *name == external.time_attribute {
                Ok("\"__time\"".to_string())
            } else {
                Ok(quote_name(name))
            }
        }
        Expr::Ref { name, nest, .. } => Err(SqlError::Unsupported(format!(
            "reference '{}' with nest {}",
            name, nest
        ))),
        Expr::Literal(value) => emit_literal(value),

        Expr::And(items) => emit_joined(items, " AND ", external),
        Expr::Or(items) => emit_joined(items, " OR ", external),
        Expr::Not(inner) => Ok(format!("NOT ({})", emit_expr(inner, external)?)),
        Expr::Is { operand, value } => Ok(format!(
            "{} = {}",
            emit_expr(operand, external)?,
            emit_expr(value, external)?
        )),
        Expr::In { operand, values } => match values.as_ref() {
            Expr::Literal(Value::StringSet(items)) => Ok(format!(
                "{} IN ({})",
                emit_expr(operand, external)?,
                items
                    .iter()
                    .map(|item| quote_string(item))
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            other => Err(SqlError::Unsupported(format!(
                "membership in {}",
                other.op_name()
            ))),
        },
        Expr::Overlap { operand, range } => {
            let subject = emit_expr(operand, external)?;
            match range.as_ref() {
                Expr::Literal(Value::TimeRange { start, end }) => Ok(format!(
                    "({subject} >= TIMESTAMP '{}' AND {subject} < TIMESTAMP '{}')",
                    format_iso(start),
                    format_iso(end)
                )),
                Expr::Literal(Value::NumberRange { start, end }) => Ok(format!(
                    "({subject} >= {start} AND {subject} < {end})"
                )),
                other => Err(SqlError::Unsupported(format!(
                    "overlap with {}",
                    other.op_name()
                ))),
            }
        }
        Expr::Match { operand, regex } => Ok(format!(
            "REGEXP_LIKE({}, {})",
            emit_expr(operand, external)?,
            quote_string(regex)
        )),
        Expr::Contains {
            operand,
            needle,
            ignore_case,
        } => {
            let mut subject = emit_expr(operand, external)?;
            let mut target = emit_expr(needle, external)?;
            if *ignore_case {
                subject = format!("LOWER({})", subject);
                target = format!("LOWER({})", target);
            }
            Ok(format!("STRPOS({}, {}) > 0", subject, target))
        }
        Expr::Compare { op, left, right } => {
            let symbol = match op {
                CompareOp::Greater => ">",
                CompareOp::GreaterOrEqual => ">=",
                CompareOp::Less => "<",
                CompareOp::LessOrEqual => "<=",
            };
            Ok(format!(
                "{} {} {}",
                emit_expr(left, external)?,
                symbol,
                emit_expr(right, external)?
            ))
        }
        Expr::Then { condition, value } => Ok(format!(
            "CASE WHEN {} THEN {} END",
            emit_expr(condition, external)?,
            emit_expr(value, external)?
        )),

        Expr::Add(items) => emit_joined(items, " + ", external),
        Expr::Subtract(a, b) => Ok(format!(
            "({} - {})",
            emit_expr(a, external)?,
            emit_expr(b, external)?
        )),
        Expr::Multiply(items) => emit_joined(items, " * ", external),
        Expr::Divide(a, b) => Ok(format!(
            "(CAST({} AS DOUBLE) / CAST({} AS DOUBLE))",
            emit_expr(a, external)?,
            emit_expr(b, external)?
        )),
        Expr::Power(a, b) => Ok(format!(
            "POWER({}, {})",
            emit_expr(a, external)?,
            emit_expr(b, external)?
        )),
        Expr::Log(a) => Ok(format!("LN({})", emit_expr(a, external)?)),
        Expr::Absolute(a) => Ok(format!("ABS({})", emit_expr(a, external)?)),
        Expr::Cast { operand, target } => {
            let sql_type = match target {
                CastKind::Number => "DOUBLE",
                CastKind::String => "VARCHAR",
                CastKind::Time => "TIMESTAMP",
            };
            Ok(format!(
                "CAST({} AS {})",
                emit_expr(operand, external)?,
                sql_type
            ))
        }
        Expr::Fallback { operand, fallback } => Ok(format!(
            "COALESCE({}, {})",
            emit_expr(operand, external)?,
            emit_expr(fallback, external)?
        )),

        Expr::Substr {
            operand,
            position,
            len,
        } => Ok(format!(
            "SUBSTRING({}, {}, {})",
            emit_expr(operand, external)?,
            position + 1,
            len
        )),
        Expr::ExtractMatch { operand, regex } => Ok(format!(
            "REGEXP_EXTRACT({}, {}, 1)",
            emit_expr(operand, external)?,
            quote_string(regex)
        )),
        Expr::Lookup { operand, lookup } => Ok(format!(
            "LOOKUP({}, {})",
            emit_expr(operand, external)?,
            quote_string(lookup)
        )),
        Expr::Concat(items) => {
            let parts = items
                .iter()
                .map(|item| emit_expr(item, external))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("CONCAT({})", parts.join(", ")))
        }
        Expr::Transform { operand, case } => {
            let func = match case {
                TextCase::Upper => "UPPER",
                TextCase::Lower => "LOWER",
            };
            Ok(format!("{}({})", func, emit_expr(operand, external)?))
        }
        Expr::Length(a) => Ok(format!("LENGTH({})", emit_expr(a, external)?)),

        Expr::NumberBucket {
            operand,
            size,
            offset,
        } => {
            let inner = emit_expr(operand, external)?;
            Ok(format!(
                "(FLOOR(({inner} - {offset}) / {size}) * {size} + {offset})"
            ))
        }
        Expr::TimeBucket {
            operand, period, ..
        }
        | Expr::TimeFloor {
            operand, period, ..
        } => Ok(format!(
            "TIME_FLOOR({}, {})",
            emit_expr(operand, external)?,
            quote_string(period)
        )),
        Expr::TimePart { operand, part, .. } => Ok(format!(
            "TIME_EXTRACT({}, {})",
            emit_expr(operand, external)?,
            quote_string(part.extract_keyword())
        )),

        // aggregates
        Expr::Count { operand } => emit_aggregate("COUNT(*)", operand, None, external),
        Expr::Sum {
            operand,
            expression,
        } => {
            let inner = emit_expr(expression, external)?;
            emit_aggregate(&format!("SUM({})", inner), operand, None, external)
        }
        Expr::Min {
            operand,
            expression,
        } => {
            let inner = emit_expr(expression, external)?;
            emit_aggregate(&format!("MIN({})", inner), operand, None, external)
        }
        Expr::Max {
            operand,
            expression,
        } => {
            let inner = emit_expr(expression, external)?;
            emit_aggregate(&format!("MAX({})", inner), operand, None, external)
        }
        Expr::CountDistinct {
            operand,
            expression,
            ..
        } => {
            let inner = emit_expr(expression, external)?;
            emit_aggregate(
                &format!("COUNT(DISTINCT {})", inner),
                operand,
                None,
                external,
            )
        }
        Expr::Quantile {
            operand,
            expression,
            value,
            ..
        } => {
            let inner = emit_expr(expression, external)?;
            emit_aggregate(
                &format!("APPROX_QUANTILE({}, {})", inner, value),
                operand,
                None,
                external,
            )
        }

        other => Err(SqlError::Unsupported(other.op_name().to_string())),
    }
}

/// Render an aggregate, appending a FILTER clause when its dataset operand
/// is filtered.
fn emit_aggregate(
    rendered: &str,
    operand: &Expr,
    _alias: Option<&str>,
    external: &External,
) -> Result<String, SqlError> {
    match operand {
        Expr::Filter { predicate, .. } => Ok(format!(
            "{} FILTER (WHERE {})",
            rendered,
            emit_expr(predicate, external)?
        )),
        _ => Ok(rendered.to_string()),
    }
}

fn emit_joined(items: &[Expr], separator: &str, external: &External) -> Result<String, SqlError> {
    let parts = items
        .iter()
        .map(|item| emit_expr(item, external))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("({})", parts.join(separator)))
}

fn emit_literal(value: &Value) -> Result<String, SqlError> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
        Value::Number(n) => Ok(format!("{}", n)),
        Value::String(s) => Ok(quote_string(s)),
        Value::Time(t) => Ok(format!("TIMESTAMP '{}'", format_iso(t))),
        other => Err(SqlError::Unsupported(format!(
            "{} literal",
            other.value_type()
        ))),
    }
}
