//! Grouping of modification commands into round trips.
//!
//! The preparer turns pending entries into commands in caller order, cuts them into
//! batches of at most `max_batch_size` commands, and compiles each batch into one SQL
//! command. Consecutive inserts with the same [`CommandShape`] go through the dialect's
//! bulk path together; anything else is emitted one statement group per command.

use relmap_proto::{SqlCommand, SqlParameter};
use tracing::{debug, instrument};

use crate::config::BatchOptions;
use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::metadata::Model;

use super::command::{
    EntityEntry, ModificationCommand, ModificationOperation, ParameterNameGenerator,
    ResultSetMapping,
};

/// Commands sent in one round trip, with the SQL compiled for them.
#[derive(Debug, Clone)]
pub struct ModificationCommandBatch {
    commands: Vec<ModificationCommand>,
    command: SqlCommand,
    mappings: Vec<ResultSetMapping>,
}

impl ModificationCommandBatch {
    /// Commands in emission order.
    pub fn commands(&self) -> &[ModificationCommand] {
        &self.commands
    }

    /// SQL text and parameters of the whole batch.
    pub fn sql_command(&self) -> &SqlCommand {
        &self.command
    }

    /// Result-set mapping of each command, parallel to [`Self::commands`].
    pub fn mappings(&self) -> &[ResultSetMapping] {
        &self.mappings
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Builds batches from pending entries.
pub struct BatchPreparer<'a> {
    model: &'a Model,
    dialect: &'a dyn SqlDialect,
    options: &'a BatchOptions,
}

impl<'a> BatchPreparer<'a> {
    pub fn new(model: &'a Model, dialect: &'a dyn SqlDialect, options: &'a BatchOptions) -> Self {
        Self {
            model,
            dialect,
            options,
        }
    }

    /// Build the batches for `entries`. Unchanged entries produce no command.
    #[instrument(skip_all, fields(entries = entries.len(), dialect = self.dialect.name()))]
    pub fn prepare(&self, entries: &[EntityEntry]) -> Result<Vec<ModificationCommandBatch>> {
        let max = self.options.max_batch_size.max(1);
        let mut batches = Vec::new();
        let mut names = ParameterNameGenerator::new();
        let mut pending = Vec::new();

        for (index, entry) in entries.iter().enumerate() {
            let Some(command) = ModificationCommand::from_entry(self.model, entry, index, &mut names)?
            else {
                continue;
            };
            pending.push(command);
            if pending.len() == max {
                batches.push(self.compile(std::mem::take(&mut pending)));
                names.reset();
            }
        }
        if !pending.is_empty() {
            batches.push(self.compile(pending));
        }

        debug!(batches = batches.len(), "modification batches prepared");
        Ok(batches)
    }

    /// Compile already-built commands into one batch.
    pub fn compile(&self, commands: Vec<ModificationCommand>) -> ModificationCommandBatch {
        let mut sql = String::new();
        self.dialect.append_batch_header(&mut sql);
        let mut mappings = Vec::with_capacity(commands.len());

        let mut start = 0;
        while start < commands.len() {
            let end = self.group_end(&commands, start);
            let group = &commands[start..end];
            let first = &group[0];
            match first.operation {
                ModificationOperation::Insert => {
                    let mapping = self.dialect.append_bulk_insert_operation(&mut sql, group, start);
                    mappings.extend(self.group_mappings(group, mapping));
                }
                ModificationOperation::Update => {
                    mappings.push(self.dialect.append_update_operation(&mut sql, first, start));
                }
                ModificationOperation::Delete => {
                    mappings.push(self.dialect.append_delete_operation(&mut sql, first, start));
                }
            }
            start = end;
        }

        let mut command = SqlCommand::new(sql);
        for modification in &commands {
            command.parameters.extend(parameters_of(self.dialect, modification));
        }
        debug!(
            commands = commands.len(),
            parameters = command.parameters.len(),
            "batch compiled"
        );
        ModificationCommandBatch {
            commands,
            command,
            mappings,
        }
    }

    /// End of the insert group starting at `start`.
    fn group_end(&self, commands: &[ModificationCommand], start: usize) -> usize {
        let first = &commands[start];
        if first.operation != ModificationOperation::Insert || !self.options.bulk_insert {
            return start + 1;
        }
        let shape = first.shape();
        let mut end = start + 1;
        while end < commands.len()
            && commands[end].operation == ModificationOperation::Insert
            && commands[end].shape() == shape
        {
            end += 1;
        }
        end
    }

    /// Per-command mappings of a bulk insert group.
    fn group_mappings(&self, group: &[ModificationCommand], mapping: ResultSetMapping) -> Vec<ResultSetMapping> {
        let shared_result_set = group.len() > 1
            && mapping != ResultSetMapping::NoResultSet
            && self.dialect.supports_multi_row_insert()
            && !group[0].is_defaults_only();
        if !shared_result_set {
            return vec![mapping; group.len()];
        }
        let mut mappings = vec![ResultSetMapping::NotLastInResultSet; group.len() - 1];
        mappings.push(ResultSetMapping::LastInResultSet);
        mappings
    }
}

/// Bound parameters of a command, named as they appear in the SQL text.
fn parameters_of(dialect: &dyn SqlDialect, command: &ModificationCommand) -> Vec<SqlParameter> {
    let writes = command.columns.iter().filter_map(|c| {
        c.parameter_name
            .as_ref()
            .map(|name| SqlParameter::new(dialect.parameter(name), c.value.clone()))
    });
    let conditions = command
        .columns
        .iter()
        .filter(|c| !c.original_value.is_null())
        .filter_map(|c| {
            c.original_parameter_name
                .as_ref()
                .map(|name| SqlParameter::new(dialect.parameter(name), c.original_value.clone()))
        });
    writes.chain(conditions).collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use relmap_proto::Value;

    use super::*;
    use crate::dialect::{SqlServerDialect, SqliteDialect};
    use crate::metadata::{EntityType, Property, ScalarType, ValueGenerated};

    fn create_test_model() -> Model {
        Model::new().with_entity_type(
            EntityType::new("Duck")
                .with_table("Ducks")
                .with_schema("dbo")
                .with_key(Property::new("Id", ScalarType::Int32).identity())
                .with_property(Property::new("Name", ScalarType::String))
                .with_property(Property::new("Quacks", ScalarType::Int32))
                .with_property(
                    Property::new("Computed", ScalarType::Uuid)
                        .with_value_generated(ValueGenerated::OnAddOrUpdate),
                ),
        )
        .with_entity_type(
            EntityType::new("Ticket")
                .with_table("Tickets")
                .with_key(Property::new("Id", ScalarType::Int32).identity())
                .with_property(
                    Property::new("IssuedAt", ScalarType::Timestamp)
                        .with_value_generated(ValueGenerated::OnAdd),
                ),
        )
        .with_entity_type(
            EntityType::new("Note")
                .with_table("Notes")
                .with_key(Property::new("Id", ScalarType::Int32).identity())
                .with_property(Property::new("Body", ScalarType::String))
                .with_property(Property::optional("Stamp", ScalarType::Int32).concurrency_token()),
        )
    }

    fn duck(name: &str) -> EntityEntry {
        EntityEntry::added("Duck")
            .with_value("Name", name)
            .with_value("Quacks", 3)
    }

    #[test]
    fn test_same_shape_inserts_share_one_statement() {
        let model = create_test_model();
        let options = BatchOptions::default();
        let dialect = SqlServerDialect::new();
        let batches = BatchPreparer::new(&model, &dialect, &options)
            .prepare(&[duck("Mallard"), duck("Teal")])
            .unwrap();

        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(
            batch.sql_command().text,
            "SET NOCOUNT ON;\n\
             DECLARE @generated0 TABLE ([Id] int, [Computed] uniqueidentifier);\n\
             INSERT INTO [dbo].[Ducks] ([Name], [Quacks])\n\
             OUTPUT INSERTED.[Id], INSERTED.[Computed]\n\
             INTO @generated0\n\
             VALUES (@p0, @p1),\n\
             (@p2, @p3);\n\
             SELECT [Id], [Computed] FROM @generated0;\n"
        );
        assert_eq!(
            batch.mappings(),
            [
                ResultSetMapping::NotLastInResultSet,
                ResultSetMapping::LastInResultSet
            ]
        );
        assert_eq!(batch.sql_command().parameter("@p2"), Some(&Value::from("Teal")));
    }

    #[test]
    fn test_batches_respect_max_size_and_restart_names() {
        let model = create_test_model();
        let options = BatchOptions::default().with_max_batch_size(2);
        let dialect = SqlServerDialect::new();
        let entries: Vec<_> = ["A", "B", "C"].into_iter().map(duck).collect();
        let batches = BatchPreparer::new(&model, &dialect, &options)
            .prepare(&entries)
            .unwrap();

        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(batches[1].sql_command().parameter("@p0"), Some(&Value::from("C")));
        assert_eq!(batches[1].commands()[0].entry_index, 2);
    }

    #[test]
    fn test_update_and_delete_follow_inserts_in_order() {
        let model = create_test_model();
        let options = BatchOptions::default();
        let dialect = SqliteDialect::new();
        let entries = [
            duck("Mallard"),
            EntityEntry::modified("Duck")
                .with_value("Id", 7)
                .with_change("Quacks", 1, 2),
            EntityEntry::deleted("Duck").with_value("Id", 8),
            EntityEntry::new("Duck", crate::update::EntityState::Unchanged).with_value("Id", 9),
        ];
        let batches = BatchPreparer::new(&model, &dialect, &options)
            .prepare(&entries)
            .unwrap();

        let batch = &batches[0];
        let operations: Vec<_> = batch.commands().iter().map(|c| c.operation).collect();
        assert_eq!(
            operations,
            vec![
                ModificationOperation::Insert,
                ModificationOperation::Update,
                ModificationOperation::Delete
            ]
        );
        assert_eq!(batch.mappings().len(), 3);
        assert!(batch
            .mappings()
            .iter()
            .all(|m| *m == ResultSetMapping::LastInResultSet));
    }

    #[test]
    fn test_defaults_only_inserts_get_one_statement_each() {
        let model = create_test_model();
        let options = BatchOptions::default();
        let dialect = SqlServerDialect::new();
        let entries = [
            EntityEntry::added("Ticket"),
            EntityEntry::added("Ticket"),
            duck("Mallard"),
        ];
        let batch = BatchPreparer::new(&model, &dialect, &options)
            .prepare(&entries)
            .unwrap()
            .remove(0);

        let sql = &batch.sql_command().text;
        assert_eq!(sql.matches("DEFAULT VALUES").count(), 2);
        assert!(sql.contains("INTO @generated0\n"));
        assert!(sql.contains("INTO @generated1\n"));
        assert!(sql.contains("[Id] = scope_identity()"));
        assert_eq!(
            batch.mappings(),
            [
                ResultSetMapping::LastInResultSet,
                ResultSetMapping::LastInResultSet,
                ResultSetMapping::LastInResultSet
            ]
        );
    }

    #[test]
    fn test_null_original_token_is_matched_without_binding() {
        let model = create_test_model();
        let options = BatchOptions::default();
        let dialect = SqlServerDialect::new();
        let entries = [
            EntityEntry::modified("Note")
                .with_value("Id", 5)
                .with_value("Stamp", Value::Null)
                .with_change("Body", "draft", "final"),
            EntityEntry::deleted("Note")
                .with_value("Id", 6)
                .with_value("Stamp", 2),
        ];
        let batch = BatchPreparer::new(&model, &dialect, &options)
            .prepare(&entries)
            .unwrap()
            .remove(0);

        let command = batch.sql_command();
        assert!(command.text.contains("[Stamp] IS NULL"), "{}", command.text);
        assert!(command.text.contains("[Stamp] = @p3"), "{}", command.text);
        let names: Vec<_> = command.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["@p0", "@p1", "@p2", "@p3"]);
        assert_eq!(command.parameter("@p1"), Some(&Value::Int32(5)));
        assert_eq!(command.parameter("@p3"), Some(&Value::Int32(2)));
        assert!(command.parameters.iter().all(|p| !p.value.is_null()));
    }

    #[test]
    fn test_bulk_insert_can_be_disabled() {
        let model = create_test_model();
        let options = BatchOptions::default().without_bulk_insert();
        let dialect = SqlServerDialect::new();
        let batch = BatchPreparer::new(&model, &dialect, &options)
            .prepare(&[duck("A"), duck("B")])
            .unwrap()
            .remove(0);

        assert_eq!(batch.sql_command().text.matches("INSERT INTO").count(), 2);
        assert_eq!(
            batch.mappings(),
            [ResultSetMapping::LastInResultSet, ResultSetMapping::LastInResultSet]
        );
    }
}
