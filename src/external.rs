//! The immutable planning snapshot
//!
//! An [`External`] captures everything one planning pass needs: the mode,
//! the accumulated filter/split/apply/sort/limit state, the source schema,
//! and the capability flags of the target. Rebuild-with-one-field-changed is
//! expressed through consuming `with_*` methods; there is no interior
//! mutability.

use crate::attribute::Attributes;
use crate::expression::{Expr, SplitKey};
use std::collections::BTreeMap;

/// What the surrounding computation wants back from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Unaggregated rows.
    Raw,
    /// A single scalar value.
    Value,
    /// One totals row.
    Total,
    /// One row per split bucket.
    Split,
}

/// Restricts which native shapes the planner may choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuerySelection {
    #[default]
    Any,
    /// Refuse topN and dimension-bearing timeseries; always group-by.
    GroupByOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Sort over an output column (a split key name or an apply name).
#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub ref_name: String,
    pub direction: Direction,
}

/// A named aggregate contributing one output column.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplySpec {
    pub name: String,
    pub expression: Expr,
}

impl ApplySpec {
    pub fn new(name: impl Into<String>, expression: Expr) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }
}

/// The group-by key set of a split-mode query.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitSpec {
    pub keys: Vec<SplitKey>,
    /// Name the bucketed dataset is known by inside apply expressions.
    pub data_name: String,
}

impl SplitSpec {
    pub fn single(name: impl Into<String>, expression: Expr) -> Self {
        Self {
            keys: vec![SplitKey::new(name, expression)],
            data_name: "main".to_string(),
        }
    }

    pub fn is_multi(&self) -> bool {
        self.keys.len() > 1
    }
}

/// One planning pass's configuration snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct External {
    pub mode: Mode,
    pub source: String,
    pub filter: Expr,
    pub split: Option<SplitSpec>,
    pub applies: Vec<ApplySpec>,
    pub value_expression: Option<Expr>,
    pub sort: Option<SortSpec>,
    pub limit: Option<u64>,
    pub having_filter: Expr,
    pub derived_attributes: BTreeMap<String, Expr>,
    pub raw_attributes: Attributes,
    /// Attribute names a raw-mode query selects; defaults to every raw
    /// attribute.
    pub select: Option<Vec<String>>,
    /// User-supplied options passed through to the native query document.
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Algebra-level name of the time column.
    pub time_attribute: String,
    pub custom_aggregations: BTreeMap<String, serde_json::Value>,
    pub custom_transforms: BTreeMap<String, serde_json::Value>,
    pub allow_eternity: bool,
    pub allow_select_queries: bool,
    pub exact_results_only: bool,
    pub query_selection: QuerySelection,
}

impl External {
    pub fn new(source: impl Into<String>, raw_attributes: Attributes) -> Self {
        Self {
            mode: Mode::Total,
            source: source.into(),
            filter: Expr::truth(),
            split: None,
            applies: Vec::new(),
            value_expression: None,
            sort: None,
            limit: None,
            having_filter: Expr::truth(),
            derived_attributes: BTreeMap::new(),
            raw_attributes,
            select: None,
            context: serde_json::Map::new(),
            time_attribute: "time".to_string(),
            custom_aggregations: BTreeMap::new(),
            custom_transforms: BTreeMap::new(),
            allow_eternity: false,
            allow_select_queries: false,
            exact_results_only: false,
            query_selection: QuerySelection::default(),
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_split(mut self, split: SplitSpec) -> Self {
        self.mode = Mode::Split;
        self.split = Some(split);
        self
    }

    pub fn with_apply(mut self, apply: ApplySpec) -> Self {
        self.applies.push(apply);
        self
    }

    pub fn with_applies(mut self, applies: Vec<ApplySpec>) -> Self {
        self.applies = applies;
        self
    }

    pub fn with_value_expression(mut self, expression: Expr) -> Self {
        self.mode = Mode::Value;
        self.value_expression = Some(expression);
        self
    }

    pub fn with_sort(mut self, ref_name: impl Into<String>, direction: Direction) -> Self {
        self.sort = Some(SortSpec {
            ref_name: ref_name.into(),
            direction,
        });
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_having_filter(mut self, having: Expr) -> Self {
        self.having_filter = having;
        self
    }

    pub fn with_derived_attribute(mut self, name: impl Into<String>, expression: Expr) -> Self {
        self.derived_attributes.insert(name.into(), expression);
        self
    }

    pub fn with_select(mut self, select: Vec<String>) -> Self {
        self.select = Some(select);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_time_attribute(mut self, name: impl Into<String>) -> Self {
        self.time_attribute = name.into();
        self
    }

    pub fn with_custom_aggregation(
        mut self,
        name: impl Into<String>,
        spec: serde_json::Value,
    ) -> Self {
        self.custom_aggregations.insert(name.into(), spec);
        self
    }

    pub fn with_custom_transform(
        mut self,
        name: impl Into<String>,
        spec: serde_json::Value,
    ) -> Self {
        self.custom_transforms.insert(name.into(), spec);
        self
    }

    pub fn with_allow_eternity(mut self, allow: bool) -> Self {
        self.allow_eternity = allow;
        self
    }

    pub fn with_allow_select_queries(mut self, allow: bool) -> Self {
        self.allow_select_queries = allow;
        self
    }

    pub fn with_exact_results_only(mut self, exact: bool) -> Self {
        self.exact_results_only = exact;
        self
    }

    pub fn with_query_selection(mut self, selection: QuerySelection) -> Self {
        self.query_selection = selection;
        self
    }

    /// True when the given ref name is the algebra's time column.
    pub fn is_time_ref(&self, expr: &Expr) -> bool {
        matches!(expr, Expr::Ref { name, nest: 0, .. } if *name == self.time_attribute)
    }

    /// The apply contributing the named output column, if any.
    pub fn apply_by_name(&self, name: &str) -> Option<&ApplySpec> {
        self.applies.iter().find(|a| a.name == name)
    }

    /// Inline derived attributes into an expression.
    pub fn inline_derived(&self, expr: &Expr) -> Expr {
        if self.derived_attributes.is_empty() {
            return expr.clone();
        }
        expr.substitute(&|name| self.derived_attributes.get(name).cloned())
    }
}
