//! Modification commands built from pending entity changes.

use relmap_proto::Value;
use tracing::trace;

use crate::error::{Error, Result};
use crate::metadata::{Model, PropertyType};

/// State of a pending entity entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// No pending change.
    Unchanged,
    /// To be inserted.
    Added,
    /// To be updated.
    Modified,
    /// To be deleted.
    Deleted,
    /// Deleted and no longer tracked.
    Detached,
}

/// Original and current value of one property of an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEntry {
    pub name: String,
    pub original: Value,
    pub current: Value,
    pub modified: bool,
}

/// A pending change to one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEntry {
    /// Entity type name.
    pub entity_type: String,
    /// Pending operation.
    pub state: EntityState,
    /// Property values.
    pub properties: Vec<PropertyEntry>,
}

impl EntityEntry {
    /// Create an entry with no properties.
    pub fn new(entity_type: impl Into<String>, state: EntityState) -> Self {
        Self {
            entity_type: entity_type.into(),
            state,
            properties: Vec::new(),
        }
    }

    /// An entry to insert.
    pub fn added(entity_type: impl Into<String>) -> Self {
        Self::new(entity_type, EntityState::Added)
    }

    /// An entry to update.
    pub fn modified(entity_type: impl Into<String>) -> Self {
        Self::new(entity_type, EntityState::Modified)
    }

    /// An entry to delete.
    pub fn deleted(entity_type: impl Into<String>) -> Self {
        Self::new(entity_type, EntityState::Deleted)
    }

    /// Add an unmodified property (original == current).
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.properties.push(PropertyEntry {
            name: name.into(),
            original: value.clone(),
            current: value,
            modified: false,
        });
        self
    }

    /// Add a modified property.
    pub fn with_change(
        mut self,
        name: impl Into<String>,
        original: impl Into<Value>,
        current: impl Into<Value>,
    ) -> Self {
        self.properties.push(PropertyEntry {
            name: name.into(),
            original: original.into(),
            current: current.into(),
            modified: true,
        });
        self
    }

    /// Look up a property.
    pub fn property(&self, name: &str) -> Option<&PropertyEntry> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Current value of a property.
    pub fn current(&self, name: &str) -> Option<&Value> {
        self.property(name).map(|p| &p.current)
    }

    /// Store a value produced by the database.
    pub fn set_store_generated(&mut self, name: &str, value: Value) {
        match self.properties.iter_mut().find(|p| p.name == name) {
            Some(property) => {
                property.current = value;
            }
            None => self.properties.push(PropertyEntry {
                name: name.to_string(),
                original: Value::Null,
                current: value,
                modified: false,
            }),
        }
    }

    /// Mark the entry as saved.
    pub fn accept_changes(&mut self) {
        self.state = match self.state {
            EntityState::Deleted | EntityState::Detached => EntityState::Detached,
            _ => EntityState::Unchanged,
        };
        for property in &mut self.properties {
            property.original = property.current.clone();
            property.modified = false;
        }
    }
}

/// DML operation of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModificationOperation {
    Insert,
    Update,
    Delete,
}

/// How a command's SQL relates to the result sets the batch returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultSetMapping {
    /// Nothing is read back.
    NoResultSet,
    /// The command's rows end a result set.
    LastInResultSet,
    /// More rows for later commands follow in the same result set.
    NotLastInResultSet,
}

/// The role of one column within a modification command.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnModification {
    /// Property name.
    pub property: String,
    /// Column name.
    pub column: String,
    /// Property type.
    pub property_type: PropertyType,
    /// Explicit store type of the property, if any.
    pub store_type: Option<String>,
    /// Original value (used by conditions).
    pub original_value: Value,
    /// Current value (used by writes).
    pub value: Value,
    /// The store computes this column and returns it.
    pub is_read: bool,
    /// The column is written.
    pub is_write: bool,
    /// The column's original value is part of the WHERE clause.
    pub is_condition: bool,
    /// The column is part of the primary key.
    pub is_key: bool,
    /// The column is an identity column.
    pub is_identity: bool,
    /// The column is a concurrency token.
    pub is_concurrency_token: bool,
    /// Parameter carrying the current value.
    pub parameter_name: Option<String>,
    /// Parameter carrying the original value.
    pub original_parameter_name: Option<String>,
}

/// Generates `p0`, `p1`, ... parameter names, unique within one batch.
#[derive(Debug, Default)]
pub struct ParameterNameGenerator {
    next: usize,
}

impl ParameterNameGenerator {
    /// Start at `p0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unused name.
    pub fn generate(&mut self) -> String {
        let name = format!("p{}", self.next);
        self.next += 1;
        name
    }

    /// Restart at `p0`.
    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// Grouping key of inserts that can share one multi-row statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandShape {
    pub table: String,
    pub schema: Option<String>,
    pub write_columns: Vec<String>,
    pub read_columns: Vec<String>,
    pub defaults_only: bool,
}

/// One pending row-level change, decomposed into column modifications.
#[derive(Debug, Clone, PartialEq)]
pub struct ModificationCommand {
    /// Table name.
    pub table: String,
    /// Table schema.
    pub schema: Option<String>,
    /// DML operation.
    pub operation: ModificationOperation,
    /// Column modifications in property order.
    pub columns: Vec<ColumnModification>,
    /// Index of the originating entry.
    pub entry_index: usize,
}

impl ModificationCommand {
    /// Create a command, rejecting one with nothing to write, read or check.
    pub fn new(
        table: impl Into<String>,
        schema: Option<String>,
        operation: ModificationOperation,
        columns: Vec<ColumnModification>,
        entry_index: usize,
    ) -> Result<Self> {
        let table = table.into();
        if !columns
            .iter()
            .any(|c| c.is_write || c.is_read || c.is_condition)
        {
            return Err(Error::InvalidCommand(format!(
                "{operation:?} command for {table} has no write, read or condition column"
            )));
        }
        Ok(Self {
            table,
            schema,
            operation,
            columns,
            entry_index,
        })
    }

    /// Build the command for an entry. Unchanged and detached entries produce none.
    pub fn from_entry(
        model: &Model,
        entry: &EntityEntry,
        entry_index: usize,
        parameters: &mut ParameterNameGenerator,
    ) -> Result<Option<Self>> {
        let operation = match entry.state {
            EntityState::Added => ModificationOperation::Insert,
            EntityState::Modified => ModificationOperation::Update,
            EntityState::Deleted => ModificationOperation::Delete,
            EntityState::Unchanged | EntityState::Detached => return Ok(None),
        };
        let entity_type = model.require_entity_type(&entry.entity_type)?;

        let mut columns = Vec::with_capacity(entity_type.properties.len());
        for property in &entity_type.properties {
            let value = entry.property(&property.name);
            let is_key = entity_type.is_key(&property.name);
            let modified = value.is_some_and(|v| v.modified);

            let (is_write, is_read, is_condition) = match operation {
                ModificationOperation::Insert => {
                    let generated = property.generated_on_add();
                    (!generated, generated, false)
                }
                ModificationOperation::Update => {
                    let read = property.generated_on_update();
                    let write = modified && !is_key && !read;
                    (write, read, is_key || property.concurrency_token)
                }
                ModificationOperation::Delete => {
                    (false, false, is_key || property.concurrency_token)
                }
            };
            if !(is_write || is_read || is_condition) {
                continue;
            }

            columns.push(ColumnModification {
                property: property.name.clone(),
                column: property.column.clone(),
                property_type: property.property_type,
                store_type: property.store_type.clone(),
                original_value: value.map(|v| v.original.clone()).unwrap_or(Value::Null),
                value: value.map(|v| v.current.clone()).unwrap_or(Value::Null),
                is_read,
                is_write,
                is_condition,
                is_key,
                is_identity: property.identity,
                is_concurrency_token: property.concurrency_token,
                parameter_name: None,
                original_parameter_name: None,
            });
        }

        if operation == ModificationOperation::Update && !columns.iter().any(|c| c.is_write) {
            return Ok(None);
        }

        for column in columns.iter_mut().filter(|c| c.is_write) {
            column.parameter_name = Some(parameters.generate());
        }
        // A NULL original value is matched with `IS NULL` and binds nothing.
        for column in columns
            .iter_mut()
            .filter(|c| c.is_condition && !c.original_value.is_null())
        {
            column.original_parameter_name = Some(parameters.generate());
        }

        let command = Self::new(
            entity_type.table.clone(),
            entity_type.schema.clone(),
            operation,
            columns,
            entry_index,
        )?;
        trace!(
            table = %command.table,
            operation = ?command.operation,
            columns = command.columns.len(),
            "modification command built"
        );
        Ok(Some(command))
    }

    /// Written columns.
    pub fn write_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_write)
    }

    /// Columns read back from the store.
    pub fn read_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_read)
    }

    /// Columns in the WHERE clause.
    pub fn condition_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_condition)
    }

    /// Key columns.
    pub fn key_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_key)
    }

    /// Whether the store returns values for this command.
    pub fn requires_result_propagation(&self) -> bool {
        self.columns.iter().any(|c| c.is_read)
    }

    /// Whether no column is written.
    pub fn is_defaults_only(&self) -> bool {
        !self.columns.iter().any(|c| c.is_write)
    }

    /// Grouping key for multi-row inserts.
    pub fn shape(&self) -> CommandShape {
        CommandShape {
            table: self.table.clone(),
            schema: self.schema.clone(),
            write_columns: self.write_columns().map(|c| c.column.clone()).collect(),
            read_columns: self.read_columns().map(|c| c.column.clone()).collect(),
            defaults_only: self.is_defaults_only(),
        }
    }
}
