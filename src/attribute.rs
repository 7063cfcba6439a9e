//! Column descriptions of a queryable source.

use crate::expression::{ExprType, Value};
use serde::{Deserialize, Serialize};

/// How a rolled-up column was produced at ingestion time. Drives the
/// long/double typing of sums and minimums over the column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum AttributeMaker {
    Count,
    Sum { field: String },
    Min { field: String },
    Max { field: String },
}

/// Description of one column of the source.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeInfo {
    pub name: String,
    pub attr_type: ExprType,
    /// The backend's own type tag for the column (`__time`, `STRING`,
    /// `LONG`, `hyperUnique`, ...).
    pub native_type: Option<String>,
    /// A rolled-up metric that must never be used as a dimension.
    pub unsplitable: bool,
    pub maker: Option<AttributeMaker>,
    pub cardinality: Option<u64>,
    /// Known value range, populated by deep introspection.
    pub range: Option<(Value, Value)>,
}

impl AttributeInfo {
    pub fn new(name: impl Into<String>, attr_type: ExprType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            native_type: None,
            unsplitable: false,
            maker: None,
            cardinality: None,
            range: None,
        }
    }

    pub fn with_native_type(mut self, native_type: impl Into<String>) -> Self {
        self.native_type = Some(native_type.into());
        self
    }

    pub fn with_maker(mut self, maker: AttributeMaker) -> Self {
        self.maker = Some(maker);
        self
    }

    pub fn unsplitable(mut self) -> Self {
        self.unsplitable = true;
        self
    }

    /// True when sums/mins over this column stay in integer space.
    pub fn is_long(&self) -> bool {
        matches!(self.native_type.as_deref(), Some("LONG") | Some("__time"))
    }
}

/// An ordered attribute list with name lookup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Attributes(Vec<AttributeInfo>);

impl Attributes {
    pub fn new(attributes: Vec<AttributeInfo>) -> Self {
        Self(attributes)
    }

    pub fn get(&self, name: &str) -> Option<&AttributeInfo> {
        self.0.iter().find(|a| a.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeInfo> {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|a| a.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<AttributeInfo> for Attributes {
    fn from_iter<T: IntoIterator<Item = AttributeInfo>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_long_typing() {
        let attrs = Attributes::new(vec![
            AttributeInfo::new("time", ExprType::Time).with_native_type("__time"),
            AttributeInfo::new("count", ExprType::Number)
                .with_native_type("LONG")
                .with_maker(AttributeMaker::Count),
            AttributeInfo::new("revenue", ExprType::Number).with_native_type("DOUBLE"),
        ]);
        assert!(attrs.get("count").unwrap().is_long());
        assert!(!attrs.get("revenue").unwrap().is_long());
        assert!(attrs.get("missing").is_none());
    }
}
