//! Result types returned by the connection.

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::error::Error;
use crate::value::Value;

/// One result set: a column header plus fixed-width rows.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Default,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct ResultSet {
    /// Column names in row order.
    pub columns: Vec<String>,
    /// Row values.
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Create an empty result set with the given header.
    pub fn new(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row, checking its width against the header.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), Error> {
        if row.len() != self.columns.len() {
            return Err(Error::RowWidth {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Builder form of [`ResultSet::push_row`].
    pub fn with_row(mut self, row: Vec<Value>) -> Result<Self, Error> {
        self.push_row(row)?;
        Ok(self)
    }

    /// Index of a column by name, compared case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Outcome of executing a command batch.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Default,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct BatchResult {
    /// Result sets in the order the statements produced them.
    pub result_sets: Vec<ResultSet>,
    /// Rows affected as reported by the server.
    pub records_affected: u64,
}

impl BatchResult {
    /// Create a result with only an affected-row count.
    pub fn affected(records_affected: u64) -> Self {
        Self {
            result_sets: Vec::new(),
            records_affected,
        }
    }

    /// Add a result set.
    pub fn with_result_set(mut self, result_set: ResultSet) -> Self {
        self.result_sets.push(result_set);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_row_checks_width() {
        let mut set = ResultSet::new(["Id", "Computed"]);
        set.push_row(vec![Value::Int32(1), Value::from("x")]).unwrap();
        let err = set.push_row(vec![Value::Int32(2)]).unwrap_err();
        assert!(matches!(err, Error::RowWidth { expected: 2, actual: 1 }));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_column_index_ignores_case() {
        let set = ResultSet::new(["CustomerID", "City"]);
        assert_eq!(set.column_index("city"), Some(1));
        assert_eq!(set.column_index("Region"), None);
    }
}
