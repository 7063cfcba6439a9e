//! # quarry
//!
//! A query-planning and query-lowering engine for a split/apply data-query
//! algebra. quarry takes a typed, pre-simplified expression snapshot (an
//! [`External`]) and decides which native query shape of a time-series
//! analytics store to emit (timeseries, topN, groupBy, scan, timeBoundary,
//! segmentMetadata), or renders a SQL statement for a relational dialect.
//! Every plan is paired with a post-transform that reshapes result rows
//! back into the algebra's value space.
//!
//! ## Usage
//!
//! ```no_run
//! use quarry::{External, get_query_and_post_transform};
//! # fn demo(external: External) -> Result<(), Box<dyn std::error::Error>> {
//! let plan = get_query_and_post_transform(&external)?;
//! // send plan.query through a Requester, then pipe the rows through
//! // plan.post_transform.record_stream(...)
//! # Ok(())
//! # }
//! ```

pub mod attribute;
pub mod druid;
pub mod expression;
pub mod external;
pub mod requester;
pub mod rows;
pub mod sql;

pub use attribute::{AttributeInfo, AttributeMaker, Attributes};
pub use druid::{
    get_query_and_post_transform, introspect_attributes, DruidQuery, IntrospectError,
    IntrospectionDepth, PlanContext, PlanError, QueryAndPostTransform,
};
pub use expression::{CompareOp, Expr, ExprType, SplitKey, TimePartUnit, Value};
pub use external::{
    ApplySpec, Direction, External, Mode, QuerySelection, SortSpec, SplitSpec,
};
pub use requester::{QueryPayload, RequestError, Requester, Row};
pub use rows::{Inflater, Record, RowTransform};
pub use sql::{emit_external_sql, SqlDialect, SqlError};
