//! The query algebra: expression tree, types, and values.

mod node;
mod types;

pub use node::{AggregateOptions, CompareOp, Expr, SplitKey};
pub use types::{
    format_iso, parse_instant, CastKind, ExprType, TextCase, TimePartUnit, Value,
};
