//! Execution of modification batches.
//!
//! Each batch is one round trip. Its result sets are consumed in order, following the
//! mapping of each command: a command that reads values takes the next row of the
//! current result set and copies the values into its entry; a command without reads
//! takes the affected-row count the dialect selected. `LastInResultSet` closes the
//! current result set. Entries are accepted once their batch has been verified.

use relmap_proto::{BatchResult, ResultSet, Value};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::storage::{AsyncConnection, Cancellation, Connection};

use super::batch::ModificationCommandBatch;
use super::command::{EntityEntry, ModificationCommand, ResultSetMapping};

/// Sends prepared batches and propagates their results into the entries.
pub struct BatchExecutor<'a> {
    cancellation: &'a Cancellation,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(cancellation: &'a Cancellation) -> Self {
        Self { cancellation }
    }

    /// Execute every batch in order and return the number of rows saved.
    #[instrument(skip_all, fields(batches = batches.len()))]
    pub fn execute(
        &self,
        connection: &dyn Connection,
        batches: &[ModificationCommandBatch],
        entries: &mut [EntityEntry],
    ) -> Result<usize> {
        let mut saved = 0;
        for batch in batches {
            self.cancellation.check()?;
            let result = connection.execute(batch.sql_command())?;
            saved += consume(batch, result, entries)?;
        }
        Ok(saved)
    }

    /// Execute every batch in order over an asynchronous connection.
    #[instrument(skip_all, fields(batches = batches.len()))]
    pub async fn execute_async(
        &self,
        connection: &dyn AsyncConnection,
        batches: &[ModificationCommandBatch],
        entries: &mut [EntityEntry],
    ) -> Result<usize> {
        let mut saved = 0;
        for batch in batches {
            self.cancellation.check()?;
            let result = connection.execute(batch.sql_command()).await?;
            self.cancellation.check()?;
            saved += consume(batch, result, entries)?;
        }
        Ok(saved)
    }
}

/// Cursor over the result sets of one batch.
struct ResultCursor {
    sets: std::vec::IntoIter<ResultSet>,
    current: Option<ResultSet>,
    row: usize,
}

impl ResultCursor {
    fn new(result: BatchResult) -> Self {
        Self {
            sets: result.result_sets.into_iter(),
            current: None,
            row: 0,
        }
    }

    /// Next row of the current result set, opening the next set when none is open.
    fn next_row(&mut self, table: &str) -> Result<Option<(&[String], &[Value])>> {
        if self.current.is_none() {
            let Some(set) = self.sets.next() else {
                return Err(Error::ResultShape(format!(
                    "batch returned fewer result sets than expected for {table}"
                )));
            };
            self.current = Some(set);
            self.row = 0;
        }
        let Some(set) = self.current.as_ref() else {
            return Ok(None);
        };
        let row = set.rows.get(self.row);
        self.row += 1;
        Ok(row.map(|row| (set.columns.as_slice(), row.as_slice())))
    }

    fn close(&mut self) {
        if let Some(set) = self.current.take() {
            if self.row < set.rows.len() {
                warn!(unread = set.rows.len() - self.row, "result set closed with unread rows");
            }
        }
    }

    fn remaining(&self) -> usize {
        self.sets.len()
    }
}

fn consume(batch: &ModificationCommandBatch, result: BatchResult, entries: &mut [EntityEntry]) -> Result<usize> {
    let mut cursor = ResultCursor::new(result);
    let mut saved = 0;

    for (command, mapping) in batch.commands().iter().zip(batch.mappings()) {
        match mapping {
            ResultSetMapping::NoResultSet => {}
            ResultSetMapping::NotLastInResultSet | ResultSetMapping::LastInResultSet => {
                let row = cursor.next_row(&command.table)?;
                match row {
                    Some((columns, values)) if command.requires_result_propagation() => {
                        propagate(command, columns, values, entries)?;
                    }
                    Some((_, values)) => verify_count(command, values)?,
                    None => {
                        return Err(Error::Concurrency {
                            table: command.table.clone(),
                            expected: 1,
                            actual: 0,
                        })
                    }
                }
                if *mapping == ResultSetMapping::LastInResultSet {
                    cursor.close();
                }
            }
        }
        saved += 1;
    }

    if cursor.remaining() > 0 {
        warn!(unread = cursor.remaining(), "batch returned more result sets than expected");
    }
    for command in batch.commands() {
        if let Some(entry) = entries.get_mut(command.entry_index) {
            entry.accept_changes();
        }
    }
    debug!(commands = saved, "batch saved");
    Ok(saved)
}

/// Copy the generated values of one row into the command's entry.
fn propagate(
    command: &ModificationCommand,
    columns: &[String],
    values: &[Value],
    entries: &mut [EntityEntry],
) -> Result<()> {
    let entry = entries.get_mut(command.entry_index).ok_or_else(|| {
        Error::ResultShape(format!("no entry at index {}", command.entry_index))
    })?;
    for (position, column) in command.read_columns().enumerate() {
        let index = columns
            .iter()
            .position(|name| name == &column.column)
            .unwrap_or(position);
        let value = values.get(index).cloned().ok_or_else(|| {
            Error::ResultShape(format!(
                "generated value for {}.{} missing from result set",
                command.table, column.column
            ))
        })?;
        entry.set_store_generated(&column.property, value);
    }
    Ok(())
}

/// Check the affected-row count selected after an update or delete.
fn verify_count(command: &ModificationCommand, values: &[Value]) -> Result<()> {
    let actual = values
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::ResultShape(format!("affected-row count for {} is not an integer", command.table)))?;
    if actual != 1 {
        return Err(Error::Concurrency {
            table: command.table.clone(),
            expected: 1,
            actual: actual.max(0) as u64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchOptions;
    use crate::dialect::SqlServerDialect;
    use crate::metadata::{EntityType, Model, Property, ScalarType, ValueGenerated};
    use crate::storage::ScriptedConnection;
    use crate::update::{BatchPreparer, EntityState};

    fn create_test_model() -> Model {
        Model::new().with_entity_type(
            EntityType::new("Duck")
                .with_table("Ducks")
                .with_key(Property::new("Id", ScalarType::Int32).identity())
                .with_property(Property::new("Name", ScalarType::String))
                .with_property(Property::new("Version", ScalarType::Int32).concurrency_token()),
        )
        .with_entity_type(
            EntityType::new("Stamp")
                .with_table("Stamps")
                .with_key(Property::new("Id", ScalarType::Int32))
                .with_property(Property::new("Note", ScalarType::String))
                .with_property(
                    Property::new("Touched", ScalarType::Timestamp)
                        .with_value_generated(ValueGenerated::OnAddOrUpdate),
                ),
        )
    }

    fn prepare(entries: &[EntityEntry]) -> Vec<ModificationCommandBatch> {
        let model = create_test_model();
        BatchPreparer::new(&model, &SqlServerDialect::new(), &BatchOptions::default())
            .prepare(entries)
            .unwrap()
    }

    fn ids(values: &[i32]) -> ResultSet {
        let mut set = ResultSet::new(["Id"]);
        for id in values {
            set.push_row(vec![Value::Int32(*id)]).unwrap();
        }
        set
    }

    #[test]
    fn test_generated_keys_propagate_in_row_order() {
        let mut entries = vec![
            EntityEntry::added("Duck").with_value("Name", "A").with_value("Version", 1),
            EntityEntry::added("Duck").with_value("Name", "B").with_value("Version", 1),
        ];
        let batches = prepare(&entries);
        let connection = ScriptedConnection::new()
            .with_batch_result(BatchResult::affected(2).with_result_set(ids(&[10, 11])));

        let saved = BatchExecutor::new(&Cancellation::new())
            .execute(&connection, &batches, &mut entries)
            .unwrap();

        assert_eq!(saved, 2);
        assert_eq!(entries[0].current("Id"), Some(&Value::Int32(10)));
        assert_eq!(entries[1].current("Id"), Some(&Value::Int32(11)));
        assert!(entries.iter().all(|e| e.state == EntityState::Unchanged));
    }

    #[test]
    fn test_missing_row_is_a_concurrency_failure() {
        let mut entries = vec![EntityEntry::modified("Duck")
            .with_value("Id", 4)
            .with_change("Name", "A", "B")
            .with_value("Version", 3)];
        let batches = prepare(&entries);
        let zero = ResultSet::new([""]).with_row(vec![Value::Int32(0)]).unwrap();
        let connection =
            ScriptedConnection::new().with_batch_result(BatchResult::affected(0).with_result_set(zero));

        let err = BatchExecutor::new(&Cancellation::new())
            .execute(&connection, &batches, &mut entries)
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Concurrency {
                expected: 1,
                actual: 0,
                ..
            }
        ));
        assert_eq!(entries[0].state, EntityState::Modified);
    }

    #[test]
    fn test_update_reads_computed_value_by_column_name() {
        let mut entries = vec![EntityEntry::modified("Stamp")
            .with_value("Id", 1)
            .with_change("Note", "a", "b")];
        let batches = prepare(&entries);
        let touched = ResultSet::new(["Touched"])
            .with_row(vec![Value::Timestamp(42)])
            .unwrap();
        let connection =
            ScriptedConnection::new().with_batch_result(BatchResult::affected(1).with_result_set(touched));

        BatchExecutor::new(&Cancellation::new())
            .execute(&connection, &batches, &mut entries)
            .unwrap();

        assert_eq!(entries[0].current("Touched"), Some(&Value::Timestamp(42)));
        assert!(connection.sql()[0].contains("OUTPUT INSERTED.[Touched]"));
    }

    #[test]
    fn test_cancelled_before_send() {
        let mut entries = vec![EntityEntry::deleted("Duck").with_value("Id", 1).with_value("Version", 1)];
        let batches = prepare(&entries);
        let connection = ScriptedConnection::new();
        let cancellation = Cancellation::new();
        cancellation.cancel();

        let err = BatchExecutor::new(&cancellation)
            .execute(&connection, &batches, &mut entries)
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(connection.commands().is_empty());
    }

    #[tokio::test]
    async fn test_async_delete_verifies_count() {
        let mut entries = vec![EntityEntry::deleted("Duck").with_value("Id", 1).with_value("Version", 1)];
        let batches = prepare(&entries);
        let one = ResultSet::new([""]).with_row(vec![Value::Int32(1)]).unwrap();
        let connection =
            ScriptedConnection::new().with_batch_result(BatchResult::affected(1).with_result_set(one));

        let saved = BatchExecutor::new(&Cancellation::new())
            .execute_async(&connection, &batches, &mut entries)
            .await
            .unwrap();

        assert_eq!(saved, 1);
        assert_eq!(entries[0].state, EntityState::Detached);
    }
}
