//! Compiled query execution.
//!
//! [`CompiledQuery::compile`] runs the compilation pipeline once: navigation rewriting,
//! materialization and tracking analysis, relational translation and SQL rendering.
//! The result is immutable and can be executed any number of times, each execution
//! with its own identity map.
//!
//! A plan that is a single command with at most `Take`/`Skip` left for the client
//! streams: rows are shaped as the caller pulls them. Every other plan fetches the
//! rows of all its commands, one command at a time, and is evaluated in memory.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use relmap_proto::{SqlCommand, Value};
use tracing::{debug, instrument};

use crate::config::QueryOptions;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::metadata::Model;
use crate::storage::{AsyncConnection, Cancellation, Connection, RowReader};

use super::context::{ExecutionMode, QueryCompilationContext};
use super::model::{QueryModel, ResultOperator};
use super::plan::{CommandPlan, CompiledPlan, Evaluator, FetchedRows};
use super::shaper::{ChangeTracker, ShapedResult};

/// Per-execution inputs: parameter values, the change tracker and a cancellation flag.
#[derive(Debug, Clone)]
pub struct QueryContext {
    parameters: HashMap<String, Value>,
    tracker: Arc<ChangeTracker>,
    cancellation: Cancellation,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new(Arc::new(ChangeTracker::new()))
    }
}

impl QueryContext {
    /// Create a context attaching tracked entities to `tracker`.
    pub fn new(tracker: Arc<ChangeTracker>) -> Self {
        Self {
            parameters: HashMap::new(),
            tracker,
            cancellation: Cancellation::new(),
        }
    }

    /// Supply a parameter value.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Share a cancellation flag with the caller.
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn parameters(&self) -> &HashMap<String, Value> {
        &self.parameters
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }
}

/// A query compiled for one execution mode.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    plan: Arc<CompiledPlan>,
    mode: ExecutionMode,
}

impl CompiledQuery {
    /// Compile a query model.
    #[instrument(skip_all, fields(mode = mode.as_str()))]
    pub fn compile(
        query: &QueryModel,
        model: Arc<Model>,
        dialect: Arc<dyn SqlDialect>,
        options: QueryOptions,
        mode: ExecutionMode,
    ) -> Result<Self> {
        let mut context = QueryCompilationContext::new(model, Arc::clone(&dialect), options);
        context.initialize(mode)?;

        let mut query = query.clone();
        context.rewrite_navigations(&mut query)?;
        context.find_query_sources_requiring_materialization(&query);
        let mut plan = context.create_query_model_visitor().translate(&query)?;
        plan.finalize(dialect.as_ref())?;

        debug!(
            commands = plan.commands().len(),
            streaming = plan.is_streaming(),
            "query compiled"
        );
        Ok(Self {
            plan: Arc::new(plan),
            mode,
        })
    }

    pub fn plan(&self) -> &CompiledPlan {
        &self.plan
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// SQL text of every command, in execution order.
    pub fn sql(&self) -> Vec<&str> {
        self.plan
            .commands()
            .into_iter()
            .filter_map(CommandPlan::sql)
            .collect()
    }

    /// Whether the query yields a single value.
    pub fn is_scalar(&self) -> bool {
        self.plan.scalar
    }

    fn require_mode(&self, requested: ExecutionMode) -> Result<()> {
        if self.mode != requested {
            return Err(Error::ExecutionMode {
                compiled: self.mode.as_str(),
                requested: requested.as_str(),
            });
        }
        Ok(())
    }

    /// Run the query on a blocking connection.
    #[instrument(skip_all, fields(commands = self.plan.commands().len()))]
    pub fn execute<'c>(&self, connection: &'c dyn Connection, context: &QueryContext) -> Result<QueryResults<'c>> {
        self.require_mode(ExecutionMode::Sync)?;
        let parameters = Arc::new(context.parameters.clone());
        let cancellation = context.cancellation.clone();

        if self.plan.is_streaming() {
            let command = single_command(&self.plan)?;
            cancellation.check()?;
            let sql = bind(command, &parameters)?;
            debug!(sql = %sql.text, "streaming query");
            let reader = connection.query(&sql)?;
            let columns = reader.columns().to_vec();
            let rows = StreamingRows {
                column_map: command.column_map(&columns)?,
                reader,
                plan: Arc::clone(&self.plan),
                evaluator: Evaluator::new(
                    Arc::new(FetchedRows::default()),
                    Arc::clone(&context.tracker),
                    parameters,
                ),
                window: Window::of(&self.plan.operators),
            };
            return Ok(QueryResults {
                inner: ResultsInner::Streaming(Box::new(rows)),
                cancellation,
                done: false,
            });
        }

        let mut fetched = FetchedRows::default();
        for command in self.plan.commands() {
            cancellation.check()?;
            let sql = bind(command, &parameters)?;
            debug!(command = command.id, sql = %sql.text, "executing query command");
            let mut reader = connection.query(&sql)?;
            let columns = reader.columns().to_vec();
            let mut rows = Vec::new();
            while let Some(row) = reader.next_row()? {
                cancellation.check()?;
                rows.push(row);
            }
            fetched.insert(command, &columns, rows)?;
        }

        let mut evaluator = Evaluator::new(Arc::new(fetched), Arc::clone(&context.tracker), parameters);
        let results = evaluator.evaluate_plan(&self.plan)?;
        debug!(results = results.len(), "query evaluated");
        Ok(QueryResults {
            inner: ResultsInner::Buffered(results.into_iter()),
            cancellation,
            done: false,
        })
    }

    /// Run the query and return its single value; an empty result is `Absent`.
    pub fn execute_scalar(&self, connection: &dyn Connection, context: &QueryContext) -> Result<ShapedResult> {
        self.execute(connection, context)?
            .next()
            .unwrap_or(Ok(ShapedResult::Absent))
    }

    /// Run the query on an asynchronous connection.
    #[instrument(skip_all, fields(commands = self.plan.commands().len()))]
    pub async fn execute_async<'c>(
        &self,
        connection: &'c dyn AsyncConnection,
        context: &QueryContext,
    ) -> Result<BoxStream<'c, Result<ShapedResult>>> {
        self.require_mode(ExecutionMode::Async)?;
        let parameters = Arc::new(context.parameters.clone());
        let cancellation = context.cancellation.clone();

        if self.plan.is_streaming() {
            let command = single_command(&self.plan)?;
            cancellation.check()?;
            let sql = bind(command, &parameters)?;
            debug!(sql = %sql.text, "streaming query");
            let rows = connection.query(&sql).await?;
            let state = AsyncStreamingRows {
                column_map: command.column_map(&rows.columns)?,
                rows: rows.rows,
                plan: Arc::clone(&self.plan),
                evaluator: Evaluator::new(
                    Arc::new(FetchedRows::default()),
                    Arc::clone(&context.tracker),
                    parameters,
                ),
                window: Window::of(&self.plan.operators),
                cancellation,
                done: false,
            };
            return Ok(stream::unfold(state, |mut state| async move {
                let item = state.next().await?;
                Some((item, state))
            })
            .boxed());
        }

        let mut fetched = FetchedRows::default();
        for command in self.plan.commands() {
            cancellation.check()?;
            let sql = bind(command, &parameters)?;
            debug!(command = command.id, sql = %sql.text, "executing query command");
            let mut reader = connection.query(&sql).await?;
            let mut rows = Vec::new();
            while let Some(row) = reader.rows.next().await {
                cancellation.check()?;
                rows.push(row?);
            }
            fetched.insert(command, &reader.columns, rows)?;
        }

        let mut evaluator = Evaluator::new(Arc::new(fetched), Arc::clone(&context.tracker), parameters);
        let results = evaluator.evaluate_plan(&self.plan)?;
        debug!(results = results.len(), "query evaluated");
        Ok(stream::iter(results.into_iter().map(Ok)).boxed())
    }
}

fn single_command(plan: &CompiledPlan) -> Result<&CommandPlan> {
    plan.scopes
        .as_command()
        .ok_or(Error::Usage("streaming plan must be a single command"))
}

fn bind(command: &CommandPlan, parameters: &HashMap<String, Value>) -> Result<SqlCommand> {
    command
        .rendered
        .as_ref()
        .ok_or(Error::Usage("query command was not rendered"))?
        .bind(parameters)
}

fn reorder(row: Vec<Value>, map: &Option<Vec<usize>>) -> Vec<Value> {
    match map {
        Some(map) => map
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
            .collect(),
        None => row,
    }
}

/// `Take`/`Skip` left for the client, applied while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    skip: u64,
    take: Option<u64>,
}

impl Window {
    fn of(operators: &[ResultOperator]) -> Self {
        let mut window = Window { skip: 0, take: None };
        for operator in operators {
            match operator {
                ResultOperator::Take(n) => {
                    window.take = Some(window.take.map_or(*n, |t| t.min(*n)));
                }
                ResultOperator::Skip(n) => {
                    window.skip += n;
                    window.take = window.take.map(|t| t.saturating_sub(*n));
                }
                _ => {}
            }
        }
        window
    }

    /// Whether the next row is yielded (`Some(true)`), skipped (`Some(false)`), or the
    /// window is exhausted.
    fn advance(&mut self) -> Option<bool> {
        if self.take == Some(0) {
            return None;
        }
        if self.skip > 0 {
            self.skip -= 1;
            return Some(false);
        }
        if let Some(take) = &mut self.take {
            *take -= 1;
        }
        Some(true)
    }
}

struct StreamingRows<'c> {
    reader: Box<dyn RowReader + 'c>,
    column_map: Option<Vec<usize>>,
    plan: Arc<CompiledPlan>,
    evaluator: Evaluator,
    window: Window,
}

impl StreamingRows<'_> {
    fn next(&mut self, cancellation: &Cancellation) -> Option<Result<ShapedResult>> {
        loop {
            if let Err(err) = cancellation.check() {
                return Some(Err(err));
            }
            let yielded = self.window.advance()?;
            let row = match self.reader.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => return None,
                Err(err) => return Some(Err(err)),
            };
            if yielded {
                return Some(shape(&self.plan, &mut self.evaluator, reorder(row, &self.column_map)));
            }
        }
    }
}

struct AsyncStreamingRows<'c> {
    rows: BoxStream<'c, Result<Vec<Value>>>,
    column_map: Option<Vec<usize>>,
    plan: Arc<CompiledPlan>,
    evaluator: Evaluator,
    window: Window,
    cancellation: Cancellation,
    done: bool,
}

impl AsyncStreamingRows<'_> {
    async fn next(&mut self) -> Option<Result<ShapedResult>> {
        while !self.done {
            if let Err(err) = self.cancellation.check() {
                self.done = true;
                return Some(Err(err));
            }
            let Some(yielded) = self.window.advance() else {
                self.done = true;
                return None;
            };
            let row = match self.rows.next().await {
                Some(Ok(row)) => row,
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    return None;
                }
            };
            if yielded {
                return Some(shape(&self.plan, &mut self.evaluator, reorder(row, &self.column_map)));
            }
        }
        None
    }
}

fn shape(plan: &CompiledPlan, evaluator: &mut Evaluator, row: Vec<Value>) -> Result<ShapedResult> {
    let command = single_command(plan)?;
    let scope = evaluator.shape_row(command, row)?;
    plan.selector.evaluate(&scope, evaluator)
}

enum ResultsInner<'c> {
    Streaming(Box<StreamingRows<'c>>),
    Buffered(std::vec::IntoIter<ShapedResult>),
}

/// Results of one blocking execution. Iteration stops after the first error.
pub struct QueryResults<'c> {
    inner: ResultsInner<'c>,
    cancellation: Cancellation,
    done: bool,
}

impl Iterator for QueryResults<'_> {
    type Item = Result<ShapedResult>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match &mut self.inner {
            ResultsInner::Streaming(rows) => rows.next(&self.cancellation),
            ResultsInner::Buffered(results) => match self.cancellation.check() {
                Ok(()) => results.next().map(Ok),
                Err(err) => Some(Err(err)),
            },
        };
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqlServerDialect;
    use crate::metadata::{EntityType, Property, ScalarType};
    use crate::query::model::QuerySource;
    use crate::storage::ScriptedConnection;
    use relmap_proto::ResultSet;

    fn create_test_model() -> Arc<Model> {
        Arc::new(
            Model::new().with_entity_type(
                EntityType::new("Customer")
                    .with_table("Customers")
                    .with_key(Property::new("CustomerID", ScalarType::String))
                    .with_property(Property::optional("City", ScalarType::String)),
            ),
        )
    }

    fn compile(query: QueryModel, mode: ExecutionMode) -> CompiledQuery {
        CompiledQuery::compile(
            &query,
            create_test_model(),
            Arc::new(SqlServerDialect::new()),
            QueryOptions::default(),
            mode,
        )
        .unwrap()
    }

    fn customers() -> ResultSet {
        ResultSet::new(["CustomerID", "City"])
            .with_row(vec![Value::from("ALFKI"), Value::from("Berlin")])
            .unwrap()
            .with_row(vec![Value::from("ANATR"), Value::Null])
            .unwrap()
            .with_row(vec![Value::from("AROUT"), Value::from("London")])
            .unwrap()
    }

    #[test]
    fn test_window_composes_take_and_skip() {
        let window = Window::of(&[ResultOperator::Take(5), ResultOperator::Skip(2)]);
        assert_eq!(window, Window { skip: 2, take: Some(3) });

        let mut window = Window::of(&[ResultOperator::Skip(1), ResultOperator::Take(1)]);
        assert_eq!(window.advance(), Some(false));
        assert_eq!(window.advance(), Some(true));
        assert_eq!(window.advance(), None);
    }

    #[test]
    fn test_streaming_execution_tracks_entities() {
        let c = QuerySource::entity("c", "Customer");
        let query = compile(QueryModel::from_entity(&c), ExecutionMode::Sync);
        assert!(query.plan().is_streaming());

        let connection = ScriptedConnection::new().with_fallback_result(customers());
        let context = QueryContext::default();
        let results: Vec<_> = query
            .execute(&connection, &context)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(context.tracker().len(), 3);
        let entity = results[2].as_entity().unwrap();
        assert_eq!(entity.get("City"), Some(&Value::from("London")));
        assert_eq!(connection.sql().len(), 1);
    }

    #[test]
    fn test_mode_mismatch() {
        let c = QuerySource::entity("c", "Customer");
        let query = compile(QueryModel::from_entity(&c), ExecutionMode::Async);
        let connection = ScriptedConnection::new();
        let err = query.execute(&connection, &QueryContext::default()).err().unwrap();
        assert!(matches!(err, Error::ExecutionMode { compiled: "async", requested: "sync" }));
        assert!(connection.sql().is_empty());
    }

    #[test]
    fn test_cancelled_before_first_command() {
        let c = QuerySource::entity("c", "Customer");
        let query = compile(QueryModel::from_entity(&c), ExecutionMode::Sync);
        let connection = ScriptedConnection::new().with_fallback_result(customers());
        let cancellation = Cancellation::new();
        cancellation.cancel();
        let context = QueryContext::default().with_cancellation(cancellation);

        assert!(matches!(query.execute(&connection, &context).err(), Some(Error::Cancelled)));
        assert!(connection.sql().is_empty());
    }

    #[tokio::test]
    async fn test_async_execution_streams_rows() {
        let c = QuerySource::entity("c", "Customer");
        let query = compile(
            QueryModel::from_entity(&c).select(c.member("City")),
            ExecutionMode::Async,
        );
        let connection = ScriptedConnection::new().with_fallback_result(
            ResultSet::new(["City"])
                .with_row(vec![Value::from("Berlin")])
                .unwrap(),
        );

        let context = QueryContext::default();
        let results: Vec<_> = query
            .execute_async(&connection, &context)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().as_scalar(), Some(&Value::from("Berlin")));
        assert!(context.tracker().is_empty());
    }
}
