//! SQLite dialect.

use std::fmt::Write as _;

use crate::metadata::ScalarType;
use crate::query::SelectExpression;
use crate::update::{ColumnModification, ResultSetMapping};

use super::{scalar_of, SqlDialect};

/// SQLite: double-quote quoting, `LIMIT`/`OFFSET`, and `last_insert_rowid()` for
/// identity retrieval. Inserts are never combined; each row reads back its own values.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Create the dialect.
    pub fn new() -> Self {
        Self
    }
}

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn delimit_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    fn generate_limit_offset(&self, sql: &mut String, select: &SelectExpression) {
        if select.limit.is_none() && select.offset.is_none() {
            return;
        }
        match select.limit {
            Some(limit) => {
                let _ = write!(sql, "\nLIMIT {limit}");
            }
            None => sql.push_str("\nLIMIT -1"),
        }
        if let Some(offset) = select.offset {
            let _ = write!(sql, " OFFSET {offset}");
        }
    }

    fn store_type(&self, column: &ColumnModification) -> String {
        if let Some(store_type) = &column.store_type {
            return store_type.clone();
        }
        match scalar_of(column) {
            ScalarType::Bool | ScalarType::Int32 | ScalarType::Int64 | ScalarType::Timestamp => {
                "INTEGER"
            }
            ScalarType::Float32 | ScalarType::Float64 => "REAL",
            ScalarType::String => "TEXT",
            ScalarType::Bytes | ScalarType::Uuid => "BLOB",
        }
        .to_string()
    }

    fn append_identity_where_condition(&self, sql: &mut String, column: &ColumnModification) {
        let _ = write!(sql, "{} = last_insert_rowid()", self.delimit_identifier(&column.column));
    }

    fn append_rows_affected_where_condition(&self, sql: &mut String, expected: usize) {
        let _ = write!(sql, "changes() = {expected}");
    }

    fn append_select_affected_count(
        &self,
        sql: &mut String,
        _table: &str,
        _schema: Option<&str>,
        _position: usize,
    ) -> ResultSetMapping {
        let _ = writeln!(sql, "SELECT changes(){}", self.statement_terminator());
        ResultSetMapping::LastInResultSet
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dialect::test_support::{insert_command, update_command};

    #[test]
    fn test_insert_reads_last_insert_rowid() {
        let mut sql = String::new();
        let mapping =
            SqliteDialect::new().append_insert_operation(&mut sql, &insert_command(true, false, false), 0);

        assert_eq!(
            sql,
            "INSERT INTO \"dbo\".\"Ducks\" (\"Name\", \"Quacks\", \"ConcurrencyToken\")\n\
             VALUES (@p0, @p1, @p2);\n\
             SELECT \"Id\"\n\
             FROM \"dbo\".\"Ducks\"\n\
             WHERE changes() = 1 AND \"Id\" = last_insert_rowid();\n"
        );
        assert_eq!(mapping, ResultSetMapping::LastInResultSet);
    }

    #[test]
    fn test_update_with_reads_selects_by_key() {
        let mut sql = String::new();
        let mapping =
            SqliteDialect::new().append_update_operation(&mut sql, &update_command(true, false), 0);

        assert_eq!(
            sql,
            "UPDATE \"dbo\".\"Ducks\" SET \"Name\" = @p0, \"Quacks\" = @p1, \"ConcurrencyToken\" = @p2\n\
             WHERE \"Id\" = @p3;\n\
             SELECT \"Computed\"\n\
             FROM \"dbo\".\"Ducks\"\n\
             WHERE changes() = 1 AND \"Id\" = @p3;\n"
        );
        assert_eq!(mapping, ResultSetMapping::LastInResultSet);
    }

    #[test]
    fn test_bulk_insert_falls_back_to_single_rows() {
        let command = insert_command(true, false, false);
        let mut sql = String::new();
        let mapping = SqliteDialect::new().append_bulk_insert_operation(
            &mut sql,
            &[command.clone(), command],
            0,
        );

        assert_eq!(sql.matches("INSERT INTO").count(), 2);
        assert_eq!(sql.matches("last_insert_rowid()").count(), 2);
        assert_eq!(mapping, ResultSetMapping::LastInResultSet);
    }

    #[test]
    fn test_limit_offset() {
        let dialect = SqliteDialect::new();
        let mut select = SelectExpression::verbatim("");
        select.offset = Some(5);

        let mut sql = String::new();
        dialect.generate_limit_offset(&mut sql, &select);
        assert_eq!(sql, "\nLIMIT -1 OFFSET 5");

        select.limit = Some(10);
        select.offset = None;
        sql.clear();
        dialect.generate_limit_offset(&mut sql, &select);
        assert_eq!(sql, "\nLIMIT 10");
        assert_eq!(dialect.generate_top(&select), None);
    }
}
