//! SQL Server dialect.

use std::fmt::Write as _;

use relmap_proto::Value;
use tracing::debug;

use crate::metadata::ScalarType;
use crate::query::SelectExpression;
use crate::update::{ColumnModification, ModificationCommand, ResultSetMapping};

use super::{
    append_insert_header, append_update_header, append_values, append_values_header,
    append_where_clause, format_uuid, generic_literal, scalar_of, SqlDialect,
};

/// SQL Server: bracket quoting, `TOP`, `OFFSET ... FETCH`, `OUTPUT INSERTED` and
/// multi-row inserts through a table variable.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDialect;

impl SqlServerDialect {
    /// Create the dialect.
    pub fn new() -> Self {
        Self
    }

    fn append_declare_generated_table(
        &self,
        sql: &mut String,
        reads: &[&ColumnModification],
        position: usize,
    ) {
        let columns: Vec<_> = reads
            .iter()
            .map(|c| format!("{} {}", self.delimit_identifier(&c.column), self.store_type(c)))
            .collect();
        let _ = writeln!(
            sql,
            "DECLARE @generated{position} TABLE ({}){}",
            columns.join(", "),
            self.statement_terminator()
        );
    }

    fn append_output_clause(&self, sql: &mut String, reads: &[&ColumnModification], position: usize) {
        let columns: Vec<_> = reads
            .iter()
            .map(|c| format!("INSERTED.{}", self.delimit_identifier(&c.column)))
            .collect();
        let _ = write!(
            sql,
            "\nOUTPUT {}\nINTO @generated{position}",
            columns.join(", ")
        );
    }

    fn append_select_generated_table(
        &self,
        sql: &mut String,
        reads: &[&ColumnModification],
        position: usize,
    ) -> ResultSetMapping {
        let columns: Vec<_> = reads
            .iter()
            .map(|c| self.delimit_identifier(&c.column))
            .collect();
        let _ = writeln!(
            sql,
            "SELECT {} FROM @generated{position}{}",
            columns.join(", "),
            self.statement_terminator()
        );
        ResultSetMapping::LastInResultSet
    }
}

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "sqlserver"
    }

    fn delimit_identifier(&self, identifier: &str) -> String {
        format!("[{}]", identifier.replace(']', "]]"))
    }

    fn literal(&self, value: &Value) -> String {
        match value {
            Value::String(s) => format!("N'{}'", s.replace('\'', "''")),
            Value::Bytes(b) => format!("0x{}", hex::encode_upper(b)),
            Value::Uuid(u) => format!("'{}'", format_uuid(u).to_uppercase()),
            other => generic_literal(other),
        }
    }

    fn concat_operator(&self) -> &'static str {
        "+"
    }

    fn generate_top(&self, select: &SelectExpression) -> Option<String> {
        match (select.limit, select.offset) {
            (Some(limit), None) => Some(format!("TOP({limit}) ")),
            _ => None,
        }
    }

    fn generate_limit_offset(&self, sql: &mut String, select: &SelectExpression) {
        let Some(offset) = select.offset else {
            return;
        };
        if select.order_by.is_empty() {
            sql.push_str("\nORDER BY (SELECT 1)");
        }
        let _ = write!(sql, "\nOFFSET {offset} ROWS");
        if let Some(limit) = select.limit {
            let _ = write!(sql, " FETCH NEXT {limit} ROWS ONLY");
        }
    }

    fn store_type(&self, column: &ColumnModification) -> String {
        if let Some(store_type) = &column.store_type {
            let row_version = store_type.eq_ignore_ascii_case("rowversion")
                || store_type.eq_ignore_ascii_case("timestamp");
            if column.is_concurrency_token && row_version {
                return if column.property_type.nullable {
                    "varbinary(8)".to_string()
                } else {
                    "binary(8)".to_string()
                };
            }
            return store_type.clone();
        }
        match scalar_of(column) {
            ScalarType::Bool => "bit",
            ScalarType::Int32 => "int",
            ScalarType::Int64 => "bigint",
            ScalarType::Float32 => "real",
            ScalarType::Float64 => "float",
            ScalarType::String if column.is_key => "nvarchar(450)",
            ScalarType::String => "nvarchar(max)",
            ScalarType::Bytes if column.is_key => "varbinary(900)",
            ScalarType::Bytes => "varbinary(max)",
            ScalarType::Timestamp => "datetime2",
            ScalarType::Uuid => "uniqueidentifier",
        }
        .to_string()
    }

    fn append_batch_header(&self, sql: &mut String) {
        let _ = writeln!(sql, "SET NOCOUNT ON{}", self.statement_terminator());
    }

    fn append_identity_where_condition(&self, sql: &mut String, column: &ColumnModification) {
        let _ = write!(sql, "{} = scope_identity()", self.delimit_identifier(&column.column));
    }

    fn append_rows_affected_where_condition(&self, sql: &mut String, expected: usize) {
        let _ = write!(sql, "@@ROWCOUNT = {expected}");
    }

    fn append_select_affected_count(
        &self,
        sql: &mut String,
        _table: &str,
        _schema: Option<&str>,
        _position: usize,
    ) -> ResultSetMapping {
        let _ = writeln!(sql, "SELECT @@ROWCOUNT{}", self.statement_terminator());
        ResultSetMapping::LastInResultSet
    }

    fn supports_multi_row_insert(&self) -> bool {
        true
    }

    fn append_update_operation(
        &self,
        sql: &mut String,
        command: &ModificationCommand,
        position: usize,
    ) -> ResultSetMapping {
        let writes: Vec<_> = command.write_columns().collect();
        let conditions: Vec<_> = command.condition_columns().collect();
        let reads: Vec<_> = command.read_columns().collect();
        let table = self.delimit_table(&command.table, command.schema.as_deref());

        if !reads.is_empty() {
            self.append_declare_generated_table(sql, &reads, position);
        }
        append_update_header(self, sql, &table, &writes);
        if !reads.is_empty() {
            self.append_output_clause(sql, &reads, position);
        }
        append_where_clause(self, sql, &conditions);
        sql.push_str(self.statement_terminator());
        sql.push('\n');

        if reads.is_empty() {
            return self.append_select_affected_count(
                sql,
                &command.table,
                command.schema.as_deref(),
                position,
            );
        }
        self.append_select_generated_table(sql, &reads, position)
    }

    fn append_bulk_insert_operation(
        &self,
        sql: &mut String,
        commands: &[ModificationCommand],
        position: usize,
    ) -> ResultSetMapping {
        let Some(first) = commands.first() else {
            return ResultSetMapping::NoResultSet;
        };

        // A lone command whose generated key (if any) comes from an identity column
        // reads it back through scope_identity().
        if commands.len() == 1
            && first
                .columns
                .iter()
                .all(|c| !c.is_key || !c.is_read || c.is_identity)
        {
            return self.append_insert_operation(sql, first, position);
        }

        let table = self.delimit_table(&first.table, first.schema.as_deref());
        let defaults_only = first.is_defaults_only();
        let (statement_count, value_set_count) = if defaults_only {
            debug!(
                table = %first.table,
                rows = commands.len(),
                "defaults-only rows emitted as separate statements"
            );
            (commands.len(), 1)
        } else {
            (1, commands.len())
        };

        let mut result_set_created = false;
        for (i, command) in commands.iter().take(statement_count).enumerate() {
            let position = position + i;
            let writes: Vec<_> = command.write_columns().collect();
            let reads: Vec<_> = command.read_columns().collect();

            if !reads.is_empty() {
                self.append_declare_generated_table(sql, &reads, position);
            }
            append_insert_header(self, sql, &table, &writes);
            if !reads.is_empty() {
                self.append_output_clause(sql, &reads, position);
            }
            append_values_header(sql, &writes);
            append_values(self, sql, &writes);
            for other in commands.iter().take(value_set_count).skip(1) {
                sql.push_str(",\n");
                let other_writes: Vec<_> = other.write_columns().collect();
                append_values(self, sql, &other_writes);
            }
            sql.push_str(self.statement_terminator());
            sql.push('\n');

            if !reads.is_empty() {
                self.append_select_generated_table(sql, &reads, position);
                result_set_created = true;
            }
        }

        if result_set_created {
            ResultSetMapping::LastInResultSet
        } else {
            ResultSetMapping::NoResultSet
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dialect::test_support::{insert_command, update_command};

    fn generate(f: impl FnOnce(&SqlServerDialect, &mut String) -> ResultSetMapping) -> (String, ResultSetMapping) {
        let mut sql = String::new();
        let mapping = f(&SqlServerDialect::new(), &mut sql);
        (sql, mapping)
    }

    #[test]
    fn test_batch_header() {
        let mut sql = String::new();
        SqlServerDialect::new().append_batch_header(&mut sql);
        assert_eq!(sql, "SET NOCOUNT ON;\n");
    }

    #[test]
    fn test_insert_with_identity_reads_scope_identity() {
        let command = insert_command(true, true, false);
        let (sql, mapping) = generate(|d, sql| d.append_insert_operation(sql, &command, 0));

        assert_eq!(
            sql,
            "INSERT INTO [dbo].[Ducks] ([Name], [Quacks], [ConcurrencyToken])\n\
             VALUES (@p0, @p1, @p2);\n\
             SELECT [Id], [Computed]\n\
             FROM [dbo].[Ducks]\n\
             WHERE @@ROWCOUNT = 1 AND [Id] = scope_identity();\n"
        );
        assert_eq!(mapping, ResultSetMapping::LastInResultSet);
    }

    #[test]
    fn test_insert_without_identity_uses_key_parameter() {
        let command = insert_command(false, true, false);
        let (sql, _) = generate(|d, sql| d.append_insert_operation(sql, &command, 0));

        assert_eq!(
            sql,
            "INSERT INTO [dbo].[Ducks] ([Id], [Name], [Quacks], [ConcurrencyToken])\n\
             VALUES (@p0, @p1, @p2, @p3);\n\
             SELECT [Computed]\n\
             FROM [dbo].[Ducks]\n\
             WHERE @@ROWCOUNT = 1 AND [Id] = @p0;\n"
        );
    }

    #[test]
    fn test_update_with_output_into_table_variable() {
        let command = update_command(true, true);
        let (sql, mapping) = generate(|d, sql| d.append_update_operation(sql, &command, 0));

        assert_eq!(
            sql,
            "DECLARE @generated0 TABLE ([Computed] uniqueidentifier);\n\
             UPDATE [dbo].[Ducks] SET [Name] = @p0, [Quacks] = @p1, [ConcurrencyToken] = @p2\n\
             OUTPUT INSERTED.[Computed]\n\
             INTO @generated0\n\
             WHERE [Id] = @p3 AND [ConcurrencyToken] = @p4;\n\
             SELECT [Computed] FROM @generated0;\n"
        );
        assert_eq!(mapping, ResultSetMapping::LastInResultSet);
    }

    #[test]
    fn test_update_without_reads_selects_row_count() {
        let command = update_command(false, false);
        let (sql, mapping) = generate(|d, sql| d.append_update_operation(sql, &command, 0));

        assert_eq!(
            sql,
            "UPDATE [dbo].[Ducks] SET [Name] = @p0, [Quacks] = @p1, [ConcurrencyToken] = @p2\n\
             WHERE [Id] = @p3;\n\
             SELECT @@ROWCOUNT;\n"
        );
        assert_eq!(mapping, ResultSetMapping::LastInResultSet);
    }

    #[test]
    fn test_bulk_insert_with_generated_columns() {
        let command = insert_command(true, true, false);
        let commands = [command.clone(), command];
        let (sql, mapping) = generate(|d, sql| d.append_bulk_insert_operation(sql, &commands, 0));

        assert_eq!(
            sql,
            "DECLARE @generated0 TABLE ([Id] int, [Computed] uniqueidentifier);\n\
             INSERT INTO [dbo].[Ducks] ([Name], [Quacks], [ConcurrencyToken])\n\
             OUTPUT INSERTED.[Id], INSERTED.[Computed]\n\
             INTO @generated0\n\
             VALUES (@p0, @p1, @p2),\n\
             (@p0, @p1, @p2);\n\
             SELECT [Id], [Computed] FROM @generated0;\n"
        );
        assert_eq!(mapping, ResultSetMapping::LastInResultSet);
    }

    #[test]
    fn test_bulk_insert_without_generated_columns() {
        let command = insert_command(false, false, false);
        let commands = [command.clone(), command];
        let (sql, mapping) = generate(|d, sql| d.append_bulk_insert_operation(sql, &commands, 0));

        assert_eq!(
            sql,
            "INSERT INTO [dbo].[Ducks] ([Id], [Name], [Quacks], [ConcurrencyToken])\n\
             VALUES (@p0, @p1, @p2, @p3),\n\
             (@p0, @p1, @p2, @p3);\n"
        );
        assert_eq!(mapping, ResultSetMapping::NoResultSet);
    }

    #[test]
    fn test_bulk_insert_defaults_only_repeats_statement() {
        let command = insert_command(true, true, true);
        let commands = [command.clone(), command];
        let (sql, mapping) = generate(|d, sql| d.append_bulk_insert_operation(sql, &commands, 0));

        let statement = |n: usize| {
            format!(
                "DECLARE @generated{n} TABLE ([Id] int, [Computed] uniqueidentifier);\n\
                 INSERT INTO [dbo].[Ducks]\n\
                 OUTPUT INSERTED.[Id], INSERTED.[Computed]\n\
                 INTO @generated{n}\n\
                 DEFAULT VALUES;\n\
                 SELECT [Id], [Computed] FROM @generated{n};\n"
            )
        };
        assert_eq!(sql, format!("{}{}", statement(0), statement(1)));
        assert_eq!(mapping, ResultSetMapping::LastInResultSet);
    }

    #[test]
    fn test_row_version_store_type() {
        let mut command = update_command(false, true);
        let token = command
            .columns
            .iter_mut()
            .find(|c| c.column == "ConcurrencyToken")
            .unwrap();
        token.is_concurrency_token = true;
        token.store_type = Some("rowversion".into());
        assert_eq!(SqlServerDialect::new().store_type(token), "binary(8)");
        token.property_type.nullable = true;
        assert_eq!(SqlServerDialect::new().store_type(token), "varbinary(8)");
    }

    #[test]
    fn test_literals_and_paging() {
        let dialect = SqlServerDialect::new();
        assert_eq!(dialect.literal(&Value::from("London")), "N'London'");
        assert_eq!(dialect.literal(&Value::Bytes(vec![1, 255])), "0x01FF");

        let mut select = SelectExpression::verbatim("");
        select.limit = Some(5);
        assert_eq!(dialect.generate_top(&select).as_deref(), Some("TOP(5) "));

        select.offset = Some(10);
        assert_eq!(dialect.generate_top(&select), None);
        let mut sql = String::new();
        dialect.generate_limit_offset(&mut sql, &select);
        assert_eq!(sql, "\nORDER BY (SELECT 1)\nOFFSET 10 ROWS FETCH NEXT 5 ROWS ONLY");
    }
}
