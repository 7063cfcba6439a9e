//! SQL emitter errors

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlError {
    /// The expression has no SQL counterpart.
    Unsupported(String),
    /// The External's configuration forbids the requested statement.
    InvalidQuery(String),
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlError::Unsupported(msg) => write!(f, "unsupported expression: {}", msg),
            SqlError::InvalidQuery(msg) => write!(f, "invalid query: {}", msg),
        }
    }
}

impl std::error::Error for SqlError {}
