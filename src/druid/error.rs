//! Planner errors

use std::fmt;

/// Why a planning pass failed.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanError {
    /// The expression cannot be lowered to the backend.
    Unsupported(String),
    /// The External's configuration forbids the requested plan.
    InvalidConfiguration(String),
}

impl PlanError {
    pub fn unsupported(msg: impl Into<String>) -> PlanError {
        PlanError::Unsupported(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> PlanError {
        PlanError::InvalidConfiguration(msg.into())
    }
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::Unsupported(msg) => write!(f, "unsupported expression: {}", msg),
            PlanError::InvalidConfiguration(msg) => {
                write!(f, "invalid configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for PlanError {}

/// Result type for planning operations
pub type PlanResult<T> = Result<T, PlanError>;
