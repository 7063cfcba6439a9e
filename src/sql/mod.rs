//! The SQL sibling backend (verb module)
//!
//! Emits a SQL statement for the same External the native planner consumes.

mod emit;
mod error;

pub use emit::{emit_external_sql, SqlDialect};
pub use error::SqlError;
