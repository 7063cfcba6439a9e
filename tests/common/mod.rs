//! Shared test utilities for integration tests
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use quarry::{
    AttributeInfo, AttributeMaker, Attributes, Expr, ExprType, External, Value,
};

/// The column schema of the wiki edit fixture.
pub fn wiki_attributes() -> Attributes {
    Attributes::new(vec![
        AttributeInfo::new("time", ExprType::Time).with_native_type("__time"),
        AttributeInfo::new("country", ExprType::String).with_native_type("STRING"),
        AttributeInfo::new("page", ExprType::String).with_native_type("STRING"),
        AttributeInfo::new("tags", ExprType::set_of(ExprType::String)).with_native_type("STRING"),
        AttributeInfo::new("count", ExprType::Number)
            .with_native_type("LONG")
            .with_maker(AttributeMaker::Count),
        AttributeInfo::new("added", ExprType::Number).with_native_type("DOUBLE"),
        AttributeInfo::new("unique_users", ExprType::Null)
            .with_native_type("hyperUnique")
            .unsplitable(),
    ])
}

pub fn wiki_external() -> External {
    External::new("wiki", wiki_attributes())
}

// -- expression shorthands ----------------------------------------------------

pub fn time_ref() -> Expr {
    Expr::reference("time", ExprType::Time)
}

pub fn main_ref() -> Expr {
    Expr::reference("main", ExprType::Dataset)
}

pub fn string_ref(name: &str) -> Expr {
    Expr::reference(name, ExprType::String)
}

pub fn number_ref(name: &str) -> Expr {
    Expr::reference(name, ExprType::Number)
}

pub fn count() -> Expr {
    Expr::Count {
        operand: Box::new(main_ref()),
    }
}

pub fn sum_of(column: &str) -> Expr {
    Expr::Sum {
        operand: Box::new(main_ref()),
        expression: Box::new(number_ref(column)),
    }
}

pub fn instant(spec: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(spec)
        .unwrap_or_else(|e| panic!("bad instant '{}': {}", spec, e))
        .with_timezone(&Utc)
}

pub fn january_2020() -> Expr {
    Expr::Overlap {
        operand: Box::new(time_ref()),
        range: Box::new(Expr::Literal(Value::TimeRange {
            start: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap(),
        })),
    }
}

pub fn day_bucket() -> Expr {
    Expr::TimeBucket {
        operand: Box::new(time_ref()),
        period: "P1D".to_string(),
        time_zone: "Etc/UTC".to_string(),
    }
}

// =============================================================================
// Document Inspection Utilities
// =============================================================================

/// Serialize a query document for field-level assertions.
pub fn to_json(query: &quarry::DruidQuery) -> serde_json::Value {
    query.to_json()
}

/// Fetch a field from a JSON document by dotted path.
pub fn field<'a>(doc: &'a serde_json::Value, path: &str) -> &'a serde_json::Value {
    let mut current = doc;
    for part in path.split('.') {
        current = match part.parse::<usize>() {
            Ok(index) => &current[index],
            Err(_) => &current[part],
        };
    }
    current
}
