//! The algebra expression tree
//!
//! A tagged-variant tree over datasets and scalars. Trees arrive
//! type-checked and simplified; the planner pattern-matches on variants and
//! never mutates a tree in place. Every rewrite builds a new tree.

use super::types::{CastKind, ExprType, TextCase, TimePartUnit, Value};

/// Out-of-band hints attached to aggregate variants.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AggregateOptions {
    /// Finalize sketch-backed intermediates inside a nested query.
    pub force_finalize: bool,
}

/// One key of a split: the output name and the grouping expression.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitKey {
    pub name: String,
    pub expression: Expr,
}

impl SplitKey {
    pub fn new(name: impl Into<String>, expression: Expr) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }
}

/// Comparison operators on scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

/// A node of the algebra expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    // -- leaves ------------------------------------------------------------
    Literal(Value),
    Ref {
        name: String,
        /// How many dataset scopes outward the name resolves; `nest > 0`
        /// references cannot be planned standalone.
        nest: usize,
        declared_type: ExprType,
        ignore_case: bool,
    },

    // -- boolean -----------------------------------------------------------
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// Equality against a value expression.
    Is {
        operand: Box<Expr>,
        value: Box<Expr>,
    },
    /// Membership in a literal set.
    In {
        operand: Box<Expr>,
        values: Box<Expr>,
    },
    /// Containment in a literal range (time or number).
    Overlap {
        operand: Box<Expr>,
        range: Box<Expr>,
    },
    Match {
        operand: Box<Expr>,
        regex: String,
    },
    Contains {
        operand: Box<Expr>,
        needle: Box<Expr>,
        ignore_case: bool,
    },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `if condition then value` with no else branch.
    Then {
        condition: Box<Expr>,
        value: Box<Expr>,
    },

    // -- arithmetic --------------------------------------------------------
    Add(Vec<Expr>),
    Subtract(Box<Expr>, Box<Expr>),
    Multiply(Vec<Expr>),
    Divide(Box<Expr>, Box<Expr>),
    Power(Box<Expr>, Box<Expr>),
    Log(Box<Expr>),
    Absolute(Box<Expr>),
    Cast {
        operand: Box<Expr>,
        target: CastKind,
    },
    /// Null-coalescing: operand unless null, else fallback.
    Fallback {
        operand: Box<Expr>,
        fallback: Box<Expr>,
    },

    // -- string ------------------------------------------------------------
    Substr {
        operand: Box<Expr>,
        position: usize,
        len: usize,
    },
    /// First capture group of a regular expression.
    ExtractMatch {
        operand: Box<Expr>,
        regex: String,
    },
    /// Value mapping through a named registered lookup.
    Lookup {
        operand: Box<Expr>,
        lookup: String,
    },
    Concat(Vec<Expr>),
    Transform {
        operand: Box<Expr>,
        case: TextCase,
    },
    Length(Box<Expr>),
    /// A transform registered out of band under `custom_transforms[name]`.
    CustomTransform {
        operand: Box<Expr>,
        name: String,
    },

    // -- number ------------------------------------------------------------
    NumberBucket {
        operand: Box<Expr>,
        size: f64,
        offset: f64,
    },

    // -- time --------------------------------------------------------------
    TimeBucket {
        operand: Box<Expr>,
        period: String,
        time_zone: String,
    },
    TimeFloor {
        operand: Box<Expr>,
        period: String,
        time_zone: String,
    },
    TimePart {
        operand: Box<Expr>,
        part: TimePartUnit,
        time_zone: String,
    },

    // -- set ---------------------------------------------------------------
    Cardinality(Box<Expr>),

    // -- dataset -----------------------------------------------------------
    Filter {
        operand: Box<Expr>,
        predicate: Box<Expr>,
    },
    Split {
        operand: Box<Expr>,
        keys: Vec<SplitKey>,
        data_name: String,
    },
    Apply {
        operand: Box<Expr>,
        name: String,
        expression: Box<Expr>,
    },

    // -- aggregates --------------------------------------------------------
    Count {
        operand: Box<Expr>,
    },
    Sum {
        operand: Box<Expr>,
        expression: Box<Expr>,
    },
    Min {
        operand: Box<Expr>,
        expression: Box<Expr>,
    },
    Max {
        operand: Box<Expr>,
        expression: Box<Expr>,
    },
    CountDistinct {
        operand: Box<Expr>,
        expression: Box<Expr>,
        options: AggregateOptions,
    },
    Quantile {
        operand: Box<Expr>,
        expression: Box<Expr>,
        value: f64,
        options: AggregateOptions,
    },
    /// An aggregate registered out of band under `custom_aggregations[name]`.
    CustomAggregate {
        operand: Box<Expr>,
        name: String,
    },
}

impl Expr {
    // -- constructors ------------------------------------------------------

    pub fn reference(name: impl Into<String>, declared_type: ExprType) -> Expr {
        Expr::Ref {
            name: name.into(),
            nest: 0,
            declared_type,
            ignore_case: false,
        }
    }

    pub fn nested_reference(
        name: impl Into<String>,
        nest: usize,
        declared_type: ExprType,
    ) -> Expr {
        Expr::Ref {
            name: name.into(),
            nest,
            declared_type,
            ignore_case: false,
        }
    }

    pub fn literal(value: Value) -> Expr {
        Expr::Literal(value)
    }

    pub fn bool_literal(value: bool) -> Expr {
        Expr::Literal(Value::Bool(value))
    }

    /// The canonical always-true filter.
    pub fn truth() -> Expr {
        Expr::bool_literal(true)
    }

    pub fn is_true_literal(&self) -> bool {
        matches!(self, Expr::Literal(Value::Bool(true)))
    }

    // -- classification ----------------------------------------------------

    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            Expr::Count { .. }
                | Expr::Sum { .. }
                | Expr::Min { .. }
                | Expr::Max { .. }
                | Expr::CountDistinct { .. }
                | Expr::Quantile { .. }
                | Expr::CustomAggregate { .. }
        )
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            Expr::Literal(_) => "literal",
            Expr::Ref { .. } => "ref",
            Expr::And(_) => "and",
            Expr::Or(_) => "or",
            Expr::Not(_) => "not",
            Expr::Is { .. } => "is",
            Expr::In { .. } => "in",
            Expr::Overlap { .. } => "overlap",
            Expr::Match { .. } => "match",
            Expr::Contains { .. } => "contains",
            Expr::Compare { .. } => "compare",
            Expr::Then { .. } => "then",
            Expr::Add(_) => "add",
            Expr::Subtract(..) => "subtract",
            Expr::Multiply(_) => "multiply",
            Expr::Divide(..) => "divide",
            Expr::Power(..) => "power",
            Expr::Log(_) => "log",
            Expr::Absolute(_) => "absolute",
            Expr::Cast { .. } => "cast",
            Expr::Fallback { .. } => "fallback",
            Expr::Substr { .. } => "substr",
            Expr::ExtractMatch { .. } => "extract",
            Expr::Lookup { .. } => "lookup",
            Expr::Concat(_) => "concat",
            Expr::Transform { .. } => "transform",
            Expr::Length(_) => "length",
            Expr::CustomTransform { .. } => "customTransform",
            Expr::NumberBucket { .. } => "numberBucket",
            Expr::TimeBucket { .. } => "timeBucket",
            Expr::TimeFloor { .. } => "timeFloor",
            Expr::TimePart { .. } => "timePart",
            Expr::Cardinality(_) => "cardinality",
            Expr::Filter { .. } => "filter",
            Expr::Split { .. } => "split",
            Expr::Apply { .. } => "apply",
            Expr::Count { .. } => "count",
            Expr::Sum { .. } => "sum",
            Expr::Min { .. } => "min",
            Expr::Max { .. } => "max",
            Expr::CountDistinct { .. } => "countDistinct",
            Expr::Quantile { .. } => "quantile",
            Expr::CustomAggregate { .. } => "customAggregate",
        }
    }

    /// The type this expression evaluates to.
    pub fn result_type(&self) -> ExprType {
        match self {
            Expr::Literal(v) => v.value_type(),
            Expr::Ref { declared_type, .. } => declared_type.clone(),

            Expr::And(_)
            | Expr::Or(_)
            | Expr::Not(_)
            | Expr::Is { .. }
            | Expr::In { .. }
            | Expr::Overlap { .. }
            | Expr::Match { .. }
            | Expr::Contains { .. }
            | Expr::Compare { .. } => ExprType::Boolean,

            Expr::Then { value, .. } => value.result_type(),

            Expr::Add(_)
            | Expr::Subtract(..)
            | Expr::Multiply(_)
            | Expr::Divide(..)
            | Expr::Power(..)
            | Expr::Log(_)
            | Expr::Absolute(_)
            | Expr::Length(_)
            | Expr::NumberBucket { .. }
            | Expr::TimePart { .. }
            | Expr::Cardinality(_) => ExprType::Number,

            Expr::Cast { target, .. } => match target {
                CastKind::Number => ExprType::Number,
                CastKind::String => ExprType::String,
                CastKind::Time => ExprType::Time,
            },
            Expr::Fallback { operand, .. } => operand.result_type(),

            Expr::Substr { .. }
            | Expr::ExtractMatch { .. }
            | Expr::Lookup { .. }
            | Expr::Concat(_)
            | Expr::Transform { .. }
            | Expr::CustomTransform { .. } => ExprType::String,

            Expr::TimeBucket { .. } | Expr::TimeFloor { .. } => ExprType::Time,

            Expr::Filter { .. } | Expr::Split { .. } | Expr::Apply { .. } => ExprType::Dataset,

            Expr::Count { .. }
            | Expr::CountDistinct { .. }
            | Expr::Quantile { .. }
            | Expr::CustomAggregate { .. } => ExprType::Number,
            Expr::Sum { expression, .. }
            | Expr::Min { expression, .. }
            | Expr::Max { expression, .. } => expression.result_type(),
        }
    }

    // -- traversal ---------------------------------------------------------

    /// Visit this node, then every descendant, depth first.
    pub fn walk(&self, visit: &mut dyn FnMut(&Expr)) {
        visit(self);
        self.for_each_child(&mut |child| child.walk(visit));
    }

    /// Direct children in declaration order.
    pub fn children(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        self.for_each_child(&mut |child| out.push(child));
        out
    }

    /// True if any node in the tree satisfies the predicate.
    pub fn any(&self, pred: &dyn Fn(&Expr) -> bool) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if pred(e) {
                found = true;
            }
        });
        found
    }

    /// Names of all `nest == 0` references, sorted and deduplicated.
    pub fn free_references(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Ref { name, nest: 0, .. } = e {
                names.push(name.clone());
            }
        });
        names.sort();
        names.dedup();
        names
    }

    /// Replace `nest == 0` references the lookup resolves, rebuilding the
    /// tree. Used to inline derived attributes before lowering.
    pub fn substitute(&self, lookup: &dyn Fn(&str) -> Option<Expr>) -> Expr {
        if let Expr::Ref { name, nest: 0, .. } = self {
            if let Some(replacement) = lookup(name) {
                return replacement;
            }
        }
        self.map_children(&|child| child.substitute(lookup))
    }

    fn for_each_child<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        match self {
            Expr::Literal(_) | Expr::Ref { .. } => {}
            Expr::And(items) | Expr::Or(items) | Expr::Add(items) | Expr::Multiply(items)
            | Expr::Concat(items) => {
                for item in items {
                    f(item);
                }
            }
            Expr::Not(e)
            | Expr::Log(e)
            | Expr::Absolute(e)
            | Expr::Length(e)
            | Expr::Cardinality(e) => f(e),
            Expr::Is { operand, value } => {
                f(operand);
                f(value);
            }
            Expr::In { operand, values } => {
                f(operand);
                f(values);
            }
            Expr::Overlap { operand, range } => {
                f(operand);
                f(range);
            }
            Expr::Match { operand, .. }
            | Expr::ExtractMatch { operand, .. }
            | Expr::Lookup { operand, .. }
            | Expr::Transform { operand, .. }
            | Expr::CustomTransform { operand, .. }
            | Expr::Substr { operand, .. }
            | Expr::NumberBucket { operand, .. }
            | Expr::TimeBucket { operand, .. }
            | Expr::TimeFloor { operand, .. }
            | Expr::TimePart { operand, .. }
            | Expr::Cast { operand, .. } => f(operand),
            Expr::Contains { operand, needle, .. } => {
                f(operand);
                f(needle);
            }
            Expr::Compare { left, right, .. } => {
                f(left);
                f(right);
            }
            Expr::Then { condition, value } => {
                f(condition);
                f(value);
            }
            Expr::Subtract(a, b) | Expr::Divide(a, b) | Expr::Power(a, b) => {
                f(a);
                f(b);
            }
            Expr::Fallback { operand, fallback } => {
                f(operand);
                f(fallback);
            }
            Expr::Filter { operand, predicate } => {
                f(operand);
                f(predicate);
            }
            Expr::Split { operand, keys, .. } => {
                f(operand);
                for key in keys {
                    f(&key.expression);
                }
            }
            Expr::Apply {
                operand,
                expression,
                ..
            } => {
                f(operand);
                f(expression);
            }
            Expr::Count { operand } | Expr::CustomAggregate { operand, .. } => f(operand),
            Expr::Sum {
                operand,
                expression,
            }
            | Expr::Min {
                operand,
                expression,
            }
            | Expr::Max {
                operand,
                expression,
            }
            | Expr::CountDistinct {
                operand,
                expression,
                ..
            }
            | Expr::Quantile {
                operand,
                expression,
                ..
            } => {
                f(operand);
                f(expression);
            }
        }
    }

    /// Rebuild this node with every direct child mapped through `f`.
    pub fn map_children(&self, f: &dyn Fn(&Expr) -> Expr) -> Expr {
        let fb = |e: &Expr| Box::new(f(e));
        match self {
            Expr::Literal(_) | Expr::Ref { .. } => self.clone(),
            Expr::And(items) => Expr::And(items.iter().map(f).collect()),
            Expr::Or(items) => Expr::Or(items.iter().map(f).collect()),
            Expr::Add(items) => Expr::Add(items.iter().map(f).collect()),
            Expr::Multiply(items) => Expr::Multiply(items.iter().map(f).collect()),
            Expr::Concat(items) => Expr::Concat(items.iter().map(f).collect()),
            Expr::Not(e) => Expr::Not(fb(e)),
            Expr::Log(e) => Expr::Log(fb(e)),
            Expr::Absolute(e) => Expr::Absolute(fb(e)),
            Expr::Length(e) => Expr::Length(fb(e)),
            Expr::Cardinality(e) => Expr::Cardinality(fb(e)),
            Expr::Is { operand, value } => Expr::Is {
                operand: fb(operand),
                value: fb(value),
            },
            Expr::In { operand, values } => Expr::In {
                operand: fb(operand),
                values: fb(values),
            },
            Expr::Overlap { operand, range } => Expr::Overlap {
                operand: fb(operand),
                range: fb(range),
            },
            Expr::Match { operand, regex } => Expr::Match {
                operand: fb(operand),
                regex: regex.clone(),
            },
            Expr::Contains {
                operand,
                needle,
                ignore_case,
            } => Expr::Contains {
                operand: fb(operand),
                needle: fb(needle),
                ignore_case: *ignore_case,
            },
            Expr::Compare { op, left, right } => Expr::Compare {
                op: *op,
                left: fb(left),
                right: fb(right),
            },
            Expr::Then { condition, value } => Expr::Then {
                condition: fb(condition),
                value: fb(value),
            },
            Expr::Subtract(a, b) => Expr::Subtract(fb(a), fb(b)),
            Expr::Divide(a, b) => Expr::Divide(fb(a), fb(b)),
            Expr::Power(a, b) => Expr::Power(fb(a), fb(b)),
            Expr::Cast { operand, target } => Expr::Cast {
                operand: fb(operand),
                target: *target,
            },
            Expr::Fallback { operand, fallback } => Expr::Fallback {
                operand: fb(operand),
                fallback: fb(fallback),
            },
            Expr::Substr {
                operand,
                position,
                len,
            } => Expr::Substr {
                operand: fb(operand),
                position: *position,
                len: *len,
            },
            Expr::ExtractMatch { operand, regex } => Expr::ExtractMatch {
                operand: fb(operand),
                regex: regex.clone(),
            },
            Expr::Lookup { operand, lookup } => Expr::Lookup {
                operand: fb(operand),
                lookup: lookup.clone(),
            },
            Expr::Transform { operand, case } => Expr::Transform {
                operand: fb(operand),
                case: *case,
            },
            Expr::CustomTransform { operand, name } => Expr::CustomTransform {
                operand: fb(operand),
                name: name.clone(),
            },
            Expr::NumberBucket {
                operand,
                size,
                offset,
            } => Expr::NumberBucket {
                operand: fb(operand),
                size: *size,
                offset: *offset,
            },
            Expr::TimeBucket {
                operand,
                period,
                time_zone,
            } => Expr::TimeBucket {
                operand: fb(operand),
                period: period.clone(),
                time_zone: time_zone.clone(),
            },
            Expr::TimeFloor {
                operand,
                period,
                time_zone,
            } => Expr::TimeFloor {
                operand: fb(operand),
                period: period.clone(),
                time_zone: time_zone.clone(),
            },
            Expr::TimePart {
                operand,
                part,
                time_zone,
            } => Expr::TimePart {
                operand: fb(operand),
                part: *part,
                time_zone: time_zone.clone(),
            },
            Expr::Filter { operand, predicate } => Expr::Filter {
                operand: fb(operand),
                predicate: fb(predicate),
            },
            Expr::Split {
                operand,
                keys,
                data_name,
            } => Expr::Split {
                operand: fb(operand),
                keys: keys
                    .iter()
                    .map(|k| SplitKey::new(k.name.clone(), f(&k.expression)))
                    .collect(),
                data_name: data_name.clone(),
            },
            Expr::Apply {
                operand,
                name,
                expression,
            } => Expr::Apply {
                operand: fb(operand),
                name: name.clone(),
                expression: fb(expression),
            },
            Expr::Count { operand } => Expr::Count {
                operand: fb(operand),
            },
            Expr::Sum {
                operand,
                expression,
            } => Expr::Sum {
                operand: fb(operand),
                expression: fb(expression),
            },
            Expr::Min {
                operand,
                expression,
            } => Expr::Min {
                operand: fb(operand),
                expression: fb(expression),
            },
            Expr::Max {
                operand,
                expression,
            } => Expr::Max {
                operand: fb(operand),
                expression: fb(expression),
            },
            Expr::CountDistinct {
                operand,
                expression,
                options,
            } => Expr::CountDistinct {
                operand: fb(operand),
                expression: fb(expression),
                options: *options,
            },
            Expr::Quantile {
                operand,
                expression,
                value,
                options,
            } => Expr::Quantile {
                operand: fb(operand),
                expression: fb(expression),
                value: *value,
                options: *options,
            },
            Expr::CustomAggregate { operand, name } => Expr::CustomAggregate {
                operand: fb(operand),
                name: name.clone(),
            },
        }
    }

    /// Copy of this aggregate with `force_finalize` set where it matters;
    /// identity for aggregates whose intermediates need no finalization.
    pub fn with_force_finalize(&self) -> Expr {
        match self {
            Expr::CountDistinct {
                operand,
                expression,
                ..
            } => Expr::CountDistinct {
                operand: operand.clone(),
                expression: expression.clone(),
                options: AggregateOptions {
                    force_finalize: true,
                },
            },
            Expr::Quantile {
                operand,
                expression,
                value,
                ..
            } => Expr::Quantile {
                operand: operand.clone(),
                expression: expression.clone(),
                value: *value,
                options: AggregateOptions {
                    force_finalize: true,
                },
            },
            other => other.clone(),
        }
    }
}
