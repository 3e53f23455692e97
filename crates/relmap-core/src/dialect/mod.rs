//! SQL dialects.
//!
//! The compiler core only talks to [`SqlDialect`]. A dialect supplies identifier
//! quoting, literals, paging syntax, and the statements used to write rows and read
//! back store-generated values. The provided methods implement the generic strategy
//! (a separate `SELECT` keyed by the identity function); dialects override what their
//! server does better.

mod sql_server;
mod sqlite;

pub use sql_server::SqlServerDialect;
pub use sqlite::SqliteDialect;

use std::fmt::Debug;
use std::fmt::Write as _;

use relmap_proto::Value;

use crate::metadata::ScalarType;
use crate::query::SelectExpression;
use crate::update::{ColumnModification, ModificationCommand, ResultSetMapping};

/// Backend-specific SQL generation hooks.
pub trait SqlDialect: Send + Sync + Debug {
    /// Short dialect name used in logs.
    fn name(&self) -> &'static str;

    /// Quote an identifier.
    fn delimit_identifier(&self, identifier: &str) -> String;

    /// Quote a table name with its optional schema.
    fn delimit_table(&self, table: &str, schema: Option<&str>) -> String {
        match schema {
            Some(schema) => format!(
                "{}.{}",
                self.delimit_identifier(schema),
                self.delimit_identifier(table)
            ),
            None => self.delimit_identifier(table),
        }
    }

    /// Render a value as an inline literal.
    fn literal(&self, value: &Value) -> String {
        generic_literal(value)
    }

    /// Prefix of parameter placeholders.
    fn parameter_prefix(&self) -> &'static str {
        "@"
    }

    /// String concatenation operator.
    fn concat_operator(&self) -> &'static str {
        "||"
    }

    /// Statement terminator.
    fn statement_terminator(&self) -> &'static str {
        ";"
    }

    /// Text inserted right after `SELECT [DISTINCT ]`, for dialects with a top clause.
    fn generate_top(&self, _select: &SelectExpression) -> Option<String> {
        None
    }

    /// Append trailing paging clauses.
    fn generate_limit_offset(&self, sql: &mut String, select: &SelectExpression);

    /// Render a parameter placeholder.
    fn parameter(&self, name: &str) -> String {
        format!("{}{}", self.parameter_prefix(), name)
    }

    /// Store type of a column, used when declaring destinations for generated values.
    fn store_type(&self, column: &ColumnModification) -> String;

    /// Text emitted once at the start of every batch.
    fn append_batch_header(&self, _sql: &mut String) {}

    /// `column = <identity of the row just inserted>`.
    fn append_identity_where_condition(&self, sql: &mut String, column: &ColumnModification);

    /// Condition checking the number of rows the previous statement affected.
    fn append_rows_affected_where_condition(&self, sql: &mut String, expected: usize);

    /// Select returning the number of rows the previous statement affected.
    fn append_select_affected_count(
        &self,
        sql: &mut String,
        table: &str,
        schema: Option<&str>,
        position: usize,
    ) -> ResultSetMapping;

    /// Whether [`SqlDialect::append_bulk_insert_operation`] emits one multi-row
    /// statement (one result set for the whole group) rather than one per command.
    fn supports_multi_row_insert(&self) -> bool {
        false
    }

    /// Append an insert plus, when values are generated, the select reading them back.
    fn append_insert_operation(
        &self,
        sql: &mut String,
        command: &ModificationCommand,
        _position: usize,
    ) -> ResultSetMapping {
        let writes: Vec<_> = command.write_columns().collect();
        let reads: Vec<_> = command.read_columns().collect();
        let table = self.delimit_table(&command.table, command.schema.as_deref());

        append_insert_header(self, sql, &table, &writes);
        append_values_header(sql, &writes);
        append_values(self, sql, &writes);
        sql.push_str(self.statement_terminator());
        sql.push('\n');

        if reads.is_empty() {
            return ResultSetMapping::NoResultSet;
        }
        append_select_generated(self, sql, &table, &reads);
        let keys: Vec<_> = command.key_columns().collect();
        append_where_affected(self, sql, &keys);
        ResultSetMapping::LastInResultSet
    }

    /// Append an update plus either the select of generated values or the affected count.
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

        append_update_header(self, sql, &table, &writes);
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
        append_select_generated(self, sql, &table, &reads);
        let keys: Vec<_> = command.key_columns().collect();
        append_where_affected(self, sql, &keys);
        ResultSetMapping::LastInResultSet
    }

    /// Append a delete plus the affected count.
    fn append_delete_operation(
        &self,
        sql: &mut String,
        command: &ModificationCommand,
        position: usize,
    ) -> ResultSetMapping {
        let conditions: Vec<_> = command.condition_columns().collect();
        let table = self.delimit_table(&command.table, command.schema.as_deref());

        let _ = write!(sql, "DELETE FROM {table}");
        append_where_clause(self, sql, &conditions);
        sql.push_str(self.statement_terminator());
        sql.push('\n');
        self.append_select_affected_count(sql, &command.table, command.schema.as_deref(), position)
    }

    /// Append inserts for commands of identical shape.
    ///
    /// The generic form is one single-row insert per command. The returned mapping is
    /// `LastInResultSet` when generated values are read back and `NoResultSet`
    /// otherwise.
    fn append_bulk_insert_operation(
        &self,
        sql: &mut String,
        commands: &[ModificationCommand],
        position: usize,
    ) -> ResultSetMapping {
        let mut mapping = ResultSetMapping::NoResultSet;
        for (i, command) in commands.iter().enumerate() {
            if self.append_insert_operation(sql, command, position + i)
                != ResultSetMapping::NoResultSet
            {
                mapping = ResultSetMapping::LastInResultSet;
            }
        }
        mapping
    }
}

/// Literal rendering shared by the dialects.
pub(crate) fn generic_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Int32(i) => i.to_string(),
        Value::Int64(i) => i.to_string(),
        Value::Float32(f) => format!("{f:?}"),
        Value::Float64(f) => format!("{f:?}"),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Bytes(b) => format!("X'{}'", hex::encode_upper(b)),
        Value::Timestamp(t) => t.to_string(),
        Value::Uuid(u) => format!("'{}'", format_uuid(u)),
    }
}

/// Hyphenated lowercase UUID text.
pub(crate) fn format_uuid(bytes: &[u8; 16]) -> String {
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Scalar type of a column modification, ignoring nullability.
pub(crate) fn scalar_of(column: &ColumnModification) -> ScalarType {
    column.property_type.scalar
}

pub(crate) fn append_insert_header<D: SqlDialect + ?Sized>(
    dialect: &D,
    sql: &mut String,
    table: &str,
    writes: &[&ColumnModification],
) {
    let _ = write!(sql, "INSERT INTO {table}");
    if !writes.is_empty() {
        let columns: Vec<_> = writes
            .iter()
            .map(|c| dialect.delimit_identifier(&c.column))
            .collect();
        let _ = write!(sql, " ({})", columns.join(", "));
    }
}

pub(crate) fn append_values_header(sql: &mut String, writes: &[&ColumnModification]) {
    sql.push('\n');
    if writes.is_empty() {
        sql.push_str("DEFAULT VALUES");
    } else {
        sql.push_str("VALUES ");
    }
}

pub(crate) fn append_values<D: SqlDialect + ?Sized>(
    dialect: &D,
    sql: &mut String,
    writes: &[&ColumnModification],
) {
    if writes.is_empty() {
        return;
    }
    let values: Vec<_> = writes
        .iter()
        .map(|c| write_placeholder(dialect, c))
        .collect();
    let _ = write!(sql, "({})", values.join(", "));
}

pub(crate) fn append_update_header<D: SqlDialect + ?Sized>(
    dialect: &D,
    sql: &mut String,
    table: &str,
    writes: &[&ColumnModification],
) {
    let assignments: Vec<_> = writes
        .iter()
        .map(|c| {
            format!(
                "{} = {}",
                dialect.delimit_identifier(&c.column),
                write_placeholder(dialect, c)
            )
        })
        .collect();
    let _ = write!(sql, "UPDATE {table} SET {}", assignments.join(", "));
}

pub(crate) fn append_where_clause<D: SqlDialect + ?Sized>(
    dialect: &D,
    sql: &mut String,
    conditions: &[&ColumnModification],
) {
    if conditions.is_empty() {
        return;
    }
    let predicates: Vec<_> = conditions
        .iter()
        .map(|c| condition(dialect, c))
        .collect();
    let _ = write!(sql, "\nWHERE {}", predicates.join(" AND "));
}

fn append_select_generated<D: SqlDialect + ?Sized>(
    dialect: &D,
    sql: &mut String,
    table: &str,
    reads: &[&ColumnModification],
) {
    let columns: Vec<_> = reads
        .iter()
        .map(|c| dialect.delimit_identifier(&c.column))
        .collect();
    let _ = write!(sql, "SELECT {}\nFROM {table}", columns.join(", "));
}

fn append_where_affected<D: SqlDialect + ?Sized>(
    dialect: &D,
    sql: &mut String,
    keys: &[&ColumnModification],
) {
    sql.push_str("\nWHERE ");
    dialect.append_rows_affected_where_condition(sql, 1);
    for key in keys {
        sql.push_str(" AND ");
        if key.is_read {
            dialect.append_identity_where_condition(sql, key);
        } else {
            sql.push_str(&key_condition(dialect, key));
        }
    }
    sql.push_str(dialect.statement_terminator());
    sql.push('\n');
}

fn write_placeholder<D: SqlDialect + ?Sized>(dialect: &D, column: &ColumnModification) -> String {
    match &column.parameter_name {
        Some(name) => dialect.parameter(name),
        None => dialect.literal(&column.value),
    }
}

/// Key predicate of an insert: the written value, or the original value for updates.
fn key_condition<D: SqlDialect + ?Sized>(dialect: &D, column: &ColumnModification) -> String {
    if column.is_condition {
        return condition(dialect, column);
    }
    format!(
        "{} = {}",
        dialect.delimit_identifier(&column.column),
        write_placeholder(dialect, column)
    )
}

fn condition<D: SqlDialect + ?Sized>(dialect: &D, column: &ColumnModification) -> String {
    let name = dialect.delimit_identifier(&column.column);
    if column.original_value.is_null() {
        return format!("{name} IS NULL");
    }
    match &column.original_parameter_name {
        Some(parameter) => format!("{name} = {}", dialect.parameter(parameter)),
        None => format!("{name} = {}", dialect.literal(&column.original_value)),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use relmap_proto::Value;

    use crate::metadata::{PropertyType, ScalarType};
    use crate::update::{ColumnModification, ModificationCommand, ModificationOperation};

    pub(crate) fn column(
        name: &str,
        scalar: ScalarType,
        flags: (bool, bool, bool, bool),
    ) -> ColumnModification {
        let (is_read, is_write, is_condition, is_key) = flags;
        ColumnModification {
            property: name.to_string(),
            column: name.to_string(),
            property_type: PropertyType::required(scalar),
            store_type: None,
            original_value: Value::Int32(1),
            value: Value::Int32(1),
            is_read,
            is_write,
            is_condition,
            is_key,
            is_identity: false,
            is_concurrency_token: false,
            parameter_name: None,
            original_parameter_name: None,
        }
    }

    /// The `Ducks` insert: optionally an identity key and a computed column.
    pub(crate) fn insert_command(
        identity_key: bool,
        is_computed: bool,
        defaults_only: bool,
    ) -> ModificationCommand {
        let mut next = 0;
        let mut name = || {
            let n = format!("p{next}");
            next += 1;
            Some(n)
        };

        let mut id = column("Id", ScalarType::Int32, (identity_key, !identity_key, false, true));
        id.is_identity = identity_key;
        let mut columns = vec![id];
        for (c, scalar) in [
            ("Name", ScalarType::String),
            ("Quacks", ScalarType::Int32),
            ("ConcurrencyToken", ScalarType::Bytes),
        ] {
            columns.push(column(c, scalar, (false, true, false, false)));
        }
        if is_computed {
            columns.push(column("Computed", ScalarType::Uuid, (true, false, false, false)));
        }
        if defaults_only {
            for c in &mut columns {
                c.is_write = false;
            }
        }
        for c in columns.iter_mut().filter(|c| c.is_write) {
            c.parameter_name = name();
        }
        ModificationCommand::new("Ducks", Some("dbo".into()), ModificationOperation::Insert, columns, 0)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// The `Ducks` update: key condition, optional concurrency check, computed read.
    pub(crate) fn update_command(is_computed: bool, concurrency_token: bool) -> ModificationCommand {
        let mut next = 0;
        let mut name = || {
            let n = format!("p{next}");
            next += 1;
            Some(n)
        };

        let mut columns = vec![column("Id", ScalarType::Int32, (false, false, true, true))];
        for (c, scalar) in [
            ("Name", ScalarType::String),
            ("Quacks", ScalarType::Int32),
            ("ConcurrencyToken", ScalarType::Bytes),
        ] {
            let condition = concurrency_token && c == "ConcurrencyToken";
            columns.push(column(c, scalar, (false, true, condition, false)));
        }
        if is_computed {
            columns.push(column("Computed", ScalarType::Uuid, (true, false, false, false)));
        }
        for c in columns.iter_mut().filter(|c| c.is_write) {
            c.parameter_name = name();
        }
        for c in columns.iter_mut().filter(|c| c.is_condition) {
            c.original_parameter_name = name();
        }
        ModificationCommand::new("Ducks", Some("dbo".into()), ModificationOperation::Update, columns, 0)
            .unwrap_or_else(|e| panic!("{e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_literals() {
        assert_eq!(generic_literal(&Value::Null), "NULL");
        assert_eq!(generic_literal(&Value::Bool(true)), "1");
        assert_eq!(generic_literal(&Value::from("O'Brien")), "'O''Brien'");
        assert_eq!(generic_literal(&Value::Bytes(vec![0xAB, 0x01])), "X'AB01'");
        assert_eq!(generic_literal(&Value::Float64(1.5)), "1.5");
    }

    #[test]
    fn test_format_uuid() {
        let bytes = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc,
            0xde, 0xf0,
        ];
        assert_eq!(format_uuid(&bytes), "12345678-9abc-def0-1234-56789abcdef0");
    }
}
