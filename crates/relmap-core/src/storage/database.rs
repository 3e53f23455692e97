//! Relational database facade combining the model, a dialect and the caches.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::config::RelationalOptions;
use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::metadata::Model;
use crate::query::{
    ChangeTracker, CompiledQuery, CompiledQueryCache, ExecutionMode, QueryContext, QueryModel,
};
use crate::update::{BatchExecutor, BatchPreparer, EntityEntry};

use super::connection::{AsyncConnection, Cancellation, Connection};

/// Entry point for compiling queries and saving changes against one model and dialect.
pub struct RelationalDatabase {
    model: Arc<Model>,
    dialect: Arc<dyn SqlDialect>,
    options: RelationalOptions,
    query_cache: CompiledQueryCache,
    tracker: Arc<ChangeTracker>,
}

impl RelationalDatabase {
    /// Create a database with default options.
    pub fn new(model: Arc<Model>, dialect: Arc<dyn SqlDialect>) -> Self {
        Self::with_options(model, dialect, RelationalOptions::default())
    }

    /// Create a database with explicit options.
    pub fn with_options(
        model: Arc<Model>,
        dialect: Arc<dyn SqlDialect>,
        options: RelationalOptions,
    ) -> Self {
        let query_cache = CompiledQueryCache::new(options.query.cache_size);
        Self {
            model,
            dialect,
            options,
            query_cache,
            tracker: Arc::new(ChangeTracker::new()),
        }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    pub fn options(&self) -> &RelationalOptions {
        &self.options
    }

    /// Get a reference to the compiled query cache.
    pub fn query_cache(&self) -> &CompiledQueryCache {
        &self.query_cache
    }

    /// The change tracker receiving tracked query results.
    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    /// A fresh execution context bound to this database's tracker.
    pub fn query_context(&self) -> QueryContext {
        QueryContext::new(Arc::clone(&self.tracker))
    }

    /// Replace the model. Queries compiled against the previous version are recompiled.
    pub fn set_model(&mut self, model: Arc<Model>) {
        debug!(from = self.model.version, to = model.version, "model replaced");
        if model.version <= self.model.version {
            self.query_cache.clear();
        }
        self.model = model;
    }

    /// Compile a query for blocking execution.
    #[instrument(skip_all)]
    pub fn compile_query(&self, query: &QueryModel) -> Result<CompiledQuery> {
        self.compile(query, ExecutionMode::Sync)
    }

    /// Compile a query for asynchronous execution.
    #[instrument(skip_all)]
    pub fn compile_async_query(&self, query: &QueryModel) -> Result<CompiledQuery> {
        self.compile(query, ExecutionMode::Async)
    }

    fn compile(&self, query: &QueryModel, mode: ExecutionMode) -> Result<CompiledQuery> {
        self.query_cache.get_or_compile(query, &self.model, mode, || {
            CompiledQuery::compile(
                query,
                Arc::clone(&self.model),
                Arc::clone(&self.dialect),
                self.options.query.clone(),
                mode,
            )
        })
    }

    /// Save pending entries over a blocking connection, returning the number of
    /// commands executed.
    #[instrument(skip_all, fields(entries = entries.len()))]
    pub fn save_changes(&self, connection: &dyn Connection, entries: &mut [EntityEntry]) -> Result<usize> {
        let batches = BatchPreparer::new(&self.model, self.dialect.as_ref(), &self.options.batch)
            .prepare(entries)?;
        let cancellation = Cancellation::new();
        BatchExecutor::new(&cancellation).execute(connection, &batches, entries)
    }

    /// Save pending entries over an asynchronous connection.
    #[instrument(skip_all, fields(entries = entries.len()))]
    pub async fn save_changes_async(
        &self,
        connection: &dyn AsyncConnection,
        entries: &mut [EntityEntry],
        cancellation: &Cancellation,
    ) -> Result<usize> {
        let batches = BatchPreparer::new(&self.model, self.dialect.as_ref(), &self.options.batch)
            .prepare(entries)?;
        BatchExecutor::new(cancellation)
            .execute_async(connection, &batches, entries)
            .await
    }
}

#[cfg(test)]
mod tests {
    use relmap_proto::{BatchResult, ResultSet, Value};

    use super::*;
    use crate::dialect::SqlServerDialect;
    use crate::error::Error;
    use crate::metadata::{EntityType, Property, ScalarType};
    use crate::query::QuerySource;
    use crate::storage::ScriptedConnection;

    fn create_test_database() -> RelationalDatabase {
        let model = Model::new().with_entity_type(
            EntityType::new("Blog")
                .with_table("Blogs")
                .with_key(Property::new("BlogId", ScalarType::Int32).identity())
                .with_property(Property::new("Url", ScalarType::String)),
        );
        RelationalDatabase::new(Arc::new(model), Arc::new(SqlServerDialect::new()))
    }

    fn blogs() -> QueryModel {
        let b = QuerySource::entity("b", "Blog");
        QueryModel::from_entity(&b)
    }

    #[test]
    fn test_compiled_queries_are_cached_per_mode() {
        let db = create_test_database();
        db.compile_query(&blogs()).unwrap();
        db.compile_query(&blogs()).unwrap();
        let compiled = db.compile_async_query(&blogs()).unwrap();

        assert_eq!(compiled.mode(), ExecutionMode::Async);
        assert_eq!(db.query_cache().len(), 2);
        assert_eq!(db.query_cache().stats().hits(), 1);
    }

    #[tokio::test]
    async fn test_sync_query_rejects_async_execution() {
        let db = create_test_database();
        let compiled = db.compile_query(&blogs()).unwrap();
        let connection = ScriptedConnection::new();

        let err = compiled
            .execute_async(&connection, &db.query_context())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ExecutionMode { .. }));
    }

    #[test]
    fn test_query_results_are_tracked() {
        let db = create_test_database();
        let compiled = db.compile_query(&blogs()).unwrap();
        let rows = ResultSet::new(["BlogId", "Url"])
            .with_row(vec![Value::Int32(1), Value::from("a.example")])
            .unwrap();
        let connection = ScriptedConnection::new().with_fallback_result(rows);

        let results: Vec<_> = compiled
            .execute(&connection, &db.query_context())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(db.tracker().len(), 1);
    }

    #[test]
    fn test_save_changes_propagates_identity() {
        let db = create_test_database();
        let mut entries = vec![EntityEntry::added("Blog").with_value("Url", "b.example")];
        let generated = ResultSet::new(["BlogId"]).with_row(vec![Value::Int32(5)]).unwrap();
        let connection =
            ScriptedConnection::new().with_batch_result(BatchResult::affected(1).with_result_set(generated));

        let saved = db.save_changes(&connection, &mut entries).unwrap();

        assert_eq!(saved, 1);
        assert_eq!(entries[0].current("BlogId"), Some(&Value::Int32(5)));
        assert!(connection.sql()[0].starts_with("SET NOCOUNT ON;\nINSERT INTO [Blogs] ([Url])"));
    }

    #[test]
    fn test_model_version_bump_recompiles() {
        let mut db = create_test_database();
        db.compile_query(&blogs()).unwrap();

        let next = Model::clone(db.model()).with_version(1);
        db.set_model(Arc::new(next));
        db.compile_query(&blogs()).unwrap();

        assert_eq!(db.query_cache().len(), 1);
        assert_eq!(db.query_cache().stats().hits(), 0);
    }
}
