//! The requester seam
//!
//! The planner is transport-agnostic: anything that can turn a query payload
//! into a stream of JSON rows can execute its plans.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// One native result row, as flattened JSON.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A query document plus optional transport context.
#[derive(Debug, Clone)]
pub struct QueryPayload {
    pub query: serde_json::Value,
    pub context: Option<serde_json::Value>,
}

impl QueryPayload {
    pub fn new(query: serde_json::Value) -> Self {
        Self {
            query,
            context: None,
        }
    }
}

#[derive(Debug)]
pub enum RequestError {
    /// The transport failed outright.
    Transport(String),
    /// The backend answered with something that is not a row set.
    InvalidResult(String),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Transport(msg) => write!(f, "request failed: {}", msg),
            RequestError::InvalidResult(msg) => write!(f, "invalid result: {}", msg),
        }
    }
}

impl std::error::Error for RequestError {}

/// Issues native queries and yields result rows as a stream.
///
/// Cancellation is dropping the stream; no token is propagated.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn request(
        &self,
        payload: QueryPayload,
    ) -> Result<BoxStream<'static, Result<Row, RequestError>>, RequestError>;
}
