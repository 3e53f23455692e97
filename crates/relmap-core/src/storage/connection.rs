//! Connection contract.
//!
//! Compiled queries and command batches talk to the database only through
//! [`Connection`] (blocking) or [`AsyncConnection`]. A query returns its rows through a
//! reader that is consumed fully before the next command is sent; a batch returns every
//! result set at once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use relmap_proto::{BatchResult, ResultSet, SqlCommand, Value};
use tracing::trace;

use crate::error::{Error, Result};

/// Forward-only reader over one query's rows.
pub trait RowReader: Send {
    /// Column names, in row order.
    fn columns(&self) -> &[String];

    /// Next row, or `None` once the rows are exhausted.
    fn next_row(&mut self) -> Result<Option<Vec<Value>>>;
}

/// Blocking database connection.
pub trait Connection: Send + Sync {
    /// Run a query command.
    fn query<'a>(&'a self, command: &SqlCommand) -> Result<Box<dyn RowReader + 'a>>;

    /// Run a modification batch.
    fn execute(&self, command: &SqlCommand) -> Result<BatchResult>;
}

/// Rows of one query, delivered asynchronously.
pub struct RowStream<'a> {
    pub columns: Vec<String>,
    pub rows: BoxStream<'a, Result<Vec<Value>>>,
}

impl<'a> RowStream<'a> {
    /// A stream over rows already in memory.
    pub fn from_result_set(result_set: ResultSet) -> Self {
        Self {
            columns: result_set.columns,
            rows: stream::iter(result_set.rows.into_iter().map(Ok)).boxed(),
        }
    }
}

/// Asynchronous database connection.
#[async_trait]
pub trait AsyncConnection: Send + Sync {
    /// Run a query command.
    async fn query<'a>(&'a self, command: &SqlCommand) -> Result<RowStream<'a>>;

    /// Run a modification batch.
    async fn execute(&self, command: &SqlCommand) -> Result<BatchResult>;
}

/// Cooperative cancellation flag shared between a caller and running executions.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Reader over an in-memory result set.
#[derive(Debug)]
pub struct BufferedRows {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl BufferedRows {
    pub fn new(result_set: ResultSet) -> Self {
        Self {
            columns: result_set.columns,
            rows: result_set.rows.into_iter(),
        }
    }
}

impl RowReader for BufferedRows {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        Ok(self.rows.next())
    }
}

#[derive(Debug, Default)]
struct Script {
    queries: HashMap<String, ResultSet>,
    fallback: Option<ResultSet>,
    batches: VecDeque<BatchResult>,
    log: Vec<SqlCommand>,
}

/// Connection answering from scripted results and recording every command it receives.
///
/// Query results are matched by exact SQL text, then by the fallback result set; they
/// can be read any number of times. Batch results are handed out in order.
#[derive(Debug, Default)]
pub struct ScriptedConnection {
    script: Mutex<Script>,
}

impl ScriptedConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries with this exact text.
    pub fn with_query_result(self, sql: impl Into<String>, result_set: ResultSet) -> Self {
        self.script.lock().queries.insert(sql.into(), result_set);
        self
    }

    /// Answer any query without a scripted text.
    pub fn with_fallback_result(self, result_set: ResultSet) -> Self {
        self.script.lock().fallback = Some(result_set);
        self
    }

    /// Queue the result of the next batch.
    pub fn with_batch_result(self, result: BatchResult) -> Self {
        self.push_batch_result(result);
        self
    }

    /// Queue the result of a later batch.
    pub fn push_batch_result(&self, result: BatchResult) {
        self.script.lock().batches.push_back(result);
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<SqlCommand> {
        self.script.lock().log.clone()
    }

    /// SQL text of every command received so far.
    pub fn sql(&self) -> Vec<String> {
        self.script.lock().log.iter().map(|c| c.text.clone()).collect()
    }

    fn answer_query(&self, command: &SqlCommand) -> Result<ResultSet> {
        let mut script = self.script.lock();
        script.log.push(command.clone());
        trace!(sql = %command.text, "scripted query");
        script
            .queries
            .get(&command.text)
            .or(script.fallback.as_ref())
            .cloned()
            .ok_or_else(|| Error::Connection(format!("no result scripted for query: {}", command.text)))
    }

    fn answer_batch(&self, command: &SqlCommand) -> Result<BatchResult> {
        let mut script = self.script.lock();
        script.log.push(command.clone());
        trace!(sql = %command.text, "scripted batch");
        script
            .batches
            .pop_front()
            .ok_or_else(|| Error::Connection("no batch result scripted".into()))
    }
}

impl Connection for ScriptedConnection {
    fn query<'a>(&'a self, command: &SqlCommand) -> Result<Box<dyn RowReader + 'a>> {
        Ok(Box::new(BufferedRows::new(self.answer_query(command)?)))
    }

    fn execute(&self, command: &SqlCommand) -> Result<BatchResult> {
        self.answer_batch(command)
    }
}

#[async_trait]
impl AsyncConnection for ScriptedConnection {
    async fn query<'a>(&'a self, command: &SqlCommand) -> Result<RowStream<'a>> {
        Ok(RowStream::from_result_set(self.answer_query(command)?))
    }

    async fn execute(&self, command: &SqlCommand) -> Result<BatchResult> {
        self.answer_batch(command)
    }
}
