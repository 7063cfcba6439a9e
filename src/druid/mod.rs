//! The time-series backend planner
//!
//! Takes a typed, pre-simplified External and produces a native query
//! document plus the post-transform that reshapes result rows.
//!
//! ## Pipeline
//!
//! ```text
//! External
//!   → planner::get_query_and_post_transform() → QueryAndPostTransform
//!   → requester issues the query → row stream
//!   → post_transform.record_stream() → algebra-typed records
//! ```

pub mod aggregation;
pub mod error;
pub mod expression;
pub mod extraction;
pub mod filter;
pub mod having;
pub mod introspect;
pub mod planner;
pub mod query;
pub mod split;

pub use error::{PlanError, PlanResult};
pub use introspect::{introspect_attributes, IntrospectError, IntrospectionDepth};
pub use planner::{
    get_query_and_post_transform, PlanContext, QueryAndPostTransform, ETERNITY_INTERVAL,
    VALUE_COLUMN,
};
pub use query::DruidQuery;
