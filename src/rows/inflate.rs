//! Per-column value coercions
//!
//! An inflater turns a raw backend value into an algebra value. Inflaters
//! are total: anything unrecognized coerces to `Value::Null`, never an
//! error. A malformed cell must not fail the stream.

use crate::expression::{parse_instant, ExprType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inflater {
    Time,
    Boolean,
    Number,
    SetString,
    /// The size of a multi-value cell rather than its contents.
    SetCardinality,
}

impl Inflater {
    /// The inflater for a plainly-typed column, if one is needed.
    pub fn simple(attr_type: &ExprType) -> Option<Inflater> {
        match attr_type {
            ExprType::Time => Some(Inflater::Time),
            ExprType::Boolean => Some(Inflater::Boolean),
            ExprType::Number => Some(Inflater::Number),
            t if t.is_string_set() => Some(Inflater::SetString),
            _ => None,
        }
    }

    pub fn inflate(&self, raw: &serde_json::Value) -> Value {
        match self {
            Inflater::Time => parse_instant(raw).map(Value::Time).unwrap_or(Value::Null),
            Inflater::Boolean => inflate_bool(raw),
            Inflater::Number => inflate_number(raw),
            Inflater::SetString => inflate_set(raw),
            Inflater::SetCardinality => match raw {
                serde_json::Value::Number(n) => {
                    n.as_f64().map(Value::Number).unwrap_or(Value::Null)
                }
                serde_json::Value::Array(items) => Value::Number(items.len() as f64),
                serde_json::Value::String(_) => Value::Number(1.0),
                _ => Value::Null,
            },
        }
    }
}

fn inflate_bool(raw: &serde_json::Value) -> Value {
    match raw {
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::String(s) => match s.as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" | "" => Value::Bool(false),
            _ => Value::Null,
        },
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) if f == 0.0 => Value::Bool(false),
            Some(_) => Value::Bool(true),
            None => Value::Null,
        },
        _ => Value::Null,
    }
}

fn inflate_number(raw: &serde_json::Value) -> Value {
    match raw {
        serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
        serde_json::Value::String(s) => s.parse::<f64>().map(Value::Number).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn inflate_set(raw: &serde_json::Value) -> Value {
    match raw {
        serde_json::Value::String(s) => Value::StringSet(vec![s.clone()]),
        serde_json::Value::Array(items) => Value::StringSet(
            items
                .iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        ),
        _ => Value::Null,
    }
}

/// Coercion for columns with no inflater attached.
pub fn coerce(raw: &serde_json::Value) -> Value {
    match raw {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(_) => inflate_set(raw),
        serde_json::Value::Object(_) => Value::Null,
    }
}
