//! relmap Core - query translation and command batching.
//!
//! This crate compiles object-graph queries into SQL plus shaping plans, and pending
//! entity changes into batched modification commands, for a pluggable SQL dialect.

pub mod config;
pub mod dialect;
pub mod error;
pub mod metadata;
pub mod query;
pub mod storage;
pub mod update;

pub use config::{BatchOptions, QueryOptions, RelationalOptions};
pub use dialect::{SqlDialect, SqlServerDialect, SqliteDialect};
pub use error::{Error, Result};
pub use metadata::{
    EntityType, ForeignKey, Model, Navigation, NavigationKind, Property, PropertyType,
    ScalarType, ValueGenerated,
};
pub use query::{
    ChangeTracker, CompiledQuery, Entity, EntityKey, ExecutionMode, Expression, ItemType,
    OrderDirection, QueryContext, QueryModel, QueryResults, QuerySource, ResultOperator,
    ShapedResult,
};
pub use storage::{
    AsyncConnection, Cancellation, Connection, RelationalDatabase, RowReader, RowStream,
    ScriptedConnection,
};
pub use update::{
    BatchExecutor, BatchPreparer, EntityEntry, EntityState, ModificationCommand,
    ModificationCommandBatch, ResultSetMapping,
};

/// Re-export protocol types.
pub use relmap_proto as proto;
