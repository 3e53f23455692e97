//! Query compiler for relmap.
//!
//! A [`QueryModel`] goes through navigation rewriting, tracking analysis and relational
//! translation into a [`CompiledPlan`]: SQL commands plus the shapers and client-side
//! operators that turn their rows into [`ShapedResult`]s. [`CompiledQuery`] runs the
//! plan against a connection; [`CompiledQueryCache`] keeps compiled queries around.

mod cache;
mod context;
mod executor;
mod expression;
mod flatten;
mod model;
mod navigation;
mod plan;
mod projection;
mod select;
mod shaper;
mod sql;
mod tracking;
mod translate;

pub use cache::{CacheStats, CachedQuery, CompiledQueryCache, QueryFingerprint};
pub use context::{ExecutionMode, QueryCompilationContext};
pub use executor::{CompiledQuery, QueryContext, QueryResults};
pub use expression::{BinaryOp, Expression, ItemType, SourceRef};
pub use flatten::{FlattenOperator, QueryFlattener};
pub use model::{
    BodyClause, FromClause, GroupJoinClause, JoinClause, JoinKind, OrderDirection, Ordering,
    QueryAnnotation, QueryModel, QuerySource, QuerySourceId, ResultOperator, SourceOrigin,
};
pub use navigation::{NavigationJoin, NavigationRewriter, RewriteOutcome};
pub use plan::{CommandPlan, CompiledPlan, ParameterBinding, RenderedCommand, ScopePlan};
pub use projection::Projection;
pub use select::{
    JoinExpression, ProjectionColumn, SelectExpression, SqlExpression, SqlJoinKind,
    SqlOrdering, TableExpression,
};
pub use shaper::{
    ChangeTracker, Entity, EntityKey, EntityShaper, IdentityMap, IncludeShaper, ShapedResult,
    Shaper, ValueBuffer, ValueShaper,
};
pub use sql::{GeneratedSql, QuerySqlGenerator};
pub use tracking::{EntityTrackingAnalyzer, EntityTrackingInfo};
pub use translate::RelationalQueryModelVisitor;
